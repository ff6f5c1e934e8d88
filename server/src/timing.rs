use chrono::{Duration, NaiveTime};

const FIRST_ARRIVAL: (u32, u32, u32) = (8, 0, 0);
const MINUTES_PER_STOP: i64 = 5;
const STOPS_PER_DAY: i64 = 24 * 60 / MINUTES_PER_STOP;

/// Placeholder arrival and departure for the stop at `sequence`, spacing stops five minutes
/// apart from 08:00:00. Wraps around midnight, so it never yields times past 24:00:00.
pub fn synthesize(sequence: i64) -> (String, String) {
    let (h, m, s) = FIRST_ARRIVAL;
    let anchor = NaiveTime::from_hms_opt(h, m, s).unwrap_or_default();
    let offset = sequence.rem_euclid(STOPS_PER_DAY) * MINUTES_PER_STOP;
    let arrival = anchor + Duration::minutes(offset);
    let departure = arrival + Duration::minutes(MINUTES_PER_STOP);
    (format_time(arrival), format_time(departure))
}

/// Fills whichever of the two times is blank. Explicit values pass through untouched, including
/// ones past midnight like "25:10:00".
pub fn fill_missing(sequence: i64, arrival: &mut String, departure: &mut String) {
    if !arrival.is_empty() && !departure.is_empty() {
        return;
    }
    let (synth_arrival, synth_departure) = synthesize(sequence);
    if arrival.is_empty() {
        *arrival = synth_arrival;
    }
    if departure.is_empty() {
        *departure = synth_departure;
    }
}

fn format_time(time: NaiveTime) -> String {
    time.format("%H:%M:%S").to_string()
}
