/// Failure kinds surfaced by the integrity engine, the migration and the exporter.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The entity addressed by a delete does not exist.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// The operation would be meaningless in the current state of the store.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// One table of the bundle could not be produced.
    #[error("failed to create {table}: {reason}")]
    Export { table: &'static str, reason: String },

    /// A request payload that could not be read or parsed.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Any store error. The enclosing transaction has been rolled back.
    #[error("store error: {0}")]
    Failed(#[from] sqlx::Error),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }

    /// Errors the caller should see as a rejected request rather than a server fault.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::ValidationFailed(_) | Self::InvalidInput(_)
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
