use crate::domain::DomainError;
use deadpool_postgres::PoolError;
use std::error::Error as _;
use tokio_postgres::error::SqlState;

/// Where in a write the driver failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WritePhase {
    Statement,
    Commit,
}

/// What the driver reported, independent of the error type
#[derive(Debug, Clone, PartialEq, Eq)]
enum FailureSignal {
    /// Socket closed or I/O failure; the server never answered
    ConnectionLost,
    Database(SqlState),
    Other,
}

impl FailureSignal {
    fn of(err: &tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            return FailureSignal::Database(db_err.code().clone());
        }
        // Socket-level failures surface as an io::Error source without a SQLSTATE
        let io_source = err
            .source()
            .map(|source| source.is::<std::io::Error>())
            .unwrap_or(false);
        if err.is_closed() || io_source {
            FailureSignal::ConnectionLost
        } else {
            FailureSignal::Other
        }
    }
}

fn is_retryable(signal: &FailureSignal, phase: WritePhase) -> bool {
    match signal {
        // A commit whose answer was lost may have landed; replaying it would duplicate the row
        FailureSignal::ConnectionLost => phase == WritePhase::Statement,
        // Class 08: connection exception
        FailureSignal::Database(code) => {
            code.code().starts_with("08")
                || *code == SqlState::T_R_SERIALIZATION_FAILURE
                || *code == SqlState::T_R_DEADLOCK_DETECTED
                || *code == SqlState::ADMIN_SHUTDOWN
                || *code == SqlState::CRASH_SHUTDOWN
                || *code == SqlState::CANNOT_CONNECT_NOW
                || *code == SqlState::QUERY_CANCELED
        }
        FailureSignal::Other => false,
    }
}

fn classify(err: tokio_postgres::Error, phase: WritePhase) -> DomainError {
    if is_retryable(&FailureSignal::of(&err), phase) {
        DomainError::StorageUnavailable(err.into())
    } else {
        DomainError::RepositoryError(err.into())
    }
}

/// Map a driver error onto the domain taxonomy, separating failures worth
/// retrying from ones that will fail the same way again.
pub(crate) fn classify_pg_error(err: tokio_postgres::Error) -> DomainError {
    classify(err, WritePhase::Statement)
}

/// Like [`classify_pg_error`] for the `COMMIT` of a non-idempotent insert.
///
/// When the connection drops before the server answers, the commit may or may
/// not have been applied, so the failure is reported as permanent.
pub(crate) fn classify_commit_error(err: tokio_postgres::Error) -> DomainError {
    classify(err, WritePhase::Commit)
}

pub(crate) fn classify_pool_error(err: PoolError) -> DomainError {
    match err {
        PoolError::Backend(e) => classify_pg_error(e),
        PoolError::Timeout(_) => DomainError::StorageUnavailable(err.into()),
        other => DomainError::RepositoryError(other.into()),
    }
}
