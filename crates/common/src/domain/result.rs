use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Error, Debug)]
pub enum DomainError {
    /// Storage could not be reached or rejected the statement for a reason that
    /// may clear up on its own (connection loss, pool timeout, serialization
    /// conflict, deadlock).
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(anyhow::Error),

    #[error("Repository error: {0}")]
    RepositoryError(#[from] anyhow::Error),

    #[error("{operation} failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<DomainError>,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid topic filter: {0}")]
    InvalidTopicFilter(String),
}

impl DomainError {
    /// Whether retrying the same operation has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(self, DomainError::StorageUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_storage_unavailable_is_transient() {
        assert!(DomainError::StorageUnavailable(anyhow::anyhow!("connection reset")).is_transient());
        assert!(!DomainError::RepositoryError(anyhow::anyhow!("unique violation")).is_transient());
        assert!(!DomainError::InvalidConfiguration("qos".to_string()).is_transient());
    }

    #[test]
    fn test_retries_exhausted_is_not_transient() {
        let err = DomainError::RetriesExhausted {
            operation: "write_reading".to_string(),
            attempts: 5,
            source: Box::new(DomainError::StorageUnavailable(anyhow::anyhow!("timeout"))),
        };

        assert!(!err.is_transient());
        assert_eq!(
            err.to_string(),
            "write_reading failed after 5 attempt(s): Storage unavailable: timeout"
        );
    }
}
