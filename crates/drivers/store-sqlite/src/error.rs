//! Mapping from [`sqlx::Error`] into [`PortsError`].

use std::time::Duration;

use spire_ports::PortsError;

/// How long a caller waits for the single pooled connection.
pub(crate) const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// Classify a driver error so the engine can tell transient from permanent.
pub(crate) fn map_sqlx(err: sqlx::Error) -> PortsError {
    match err {
        sqlx::Error::PoolTimedOut => PortsError::timeout("acquire sqlite connection", ACQUIRE_TIMEOUT),
        sqlx::Error::Io(_) | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
            PortsError::Connection(err.to_string())
        }
        sqlx::Error::Database(ref db) if is_busy(db.code().as_deref()) => {
            PortsError::Connection(err.to_string())
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            PortsError::Serialization(err.to_string())
        }
        other => PortsError::Internal(other.to_string()),
    }
}

pub(crate) fn map_migrate(err: sqlx::migrate::MigrateError) -> PortsError {
    PortsError::Internal(format!("migration failed: {err}"))
}

/// SQLite reports extended result codes; the primary code is the low byte.
fn is_busy(code: Option<&str>) -> bool {
    code.and_then(|c| c.parse::<i32>().ok())
        .is_some_and(|c| matches!(c & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
}
