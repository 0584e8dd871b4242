//! Error taxonomy for the sync engine.
//!
//! Record-level failures (validation, unresolved references, constraint
//! violations, scope conflicts) are reported per record and never abort a
//! batch of independent records. `Store` is the only call-aborting variant:
//! the caller must treat the outcome as unknown and rely on retry-safety plus
//! the reconciliation verifier.

use thiserror::Error;

/// Result type used across the engine.
pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Required field missing or malformed. Raised before any resolution.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A fatal foreign reference could not be resolved to a surrogate key.
    #[error("unresolved {target} reference in {field}: {global_id}")]
    UnresolvedReference {
        field: &'static str,
        target: &'static str,
        global_id: String,
    },

    /// Resubmission tried to move an existing record to another branch.
    #[error("record {global_id} belongs to another branch")]
    ScopeConflict { global_id: String },

    /// The store rejected the write for a reason other than idempotency.
    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("{kind} {global_id} not found")]
    NotFound {
        kind: &'static str,
        global_id: String,
    },

    /// Entity kind not present in the catalogue. The raw string is never kept.
    #[error("unknown entity kind")]
    UnknownKind,

    /// Infrastructure failure (store unreachable, lock poisoned, I/O).
    #[error("store error: {0}")]
    Store(String),
}

impl SyncError {
    /// Record-level failures are reported in the record's result; everything
    /// else aborts the whole call.
    pub fn is_record_level(&self) -> bool {
        matches!(
            self,
            SyncError::Validation(_)
                | SyncError::UnresolvedReference { .. }
                | SyncError::ScopeConflict { .. }
                | SyncError::Constraint(_)
                | SyncError::NotFound { .. }
        )
    }

    /// Short machine-readable code returned alongside failures.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Validation(_) => "validation",
            SyncError::UnresolvedReference { .. } => "unresolved_reference",
            SyncError::ScopeConflict { .. } => "scope_conflict",
            SyncError::Constraint(_) => "constraint",
            SyncError::NotFound { .. } => "not_found",
            SyncError::UnknownKind => "unknown_kind",
            SyncError::Store(_) => "store_unavailable",
        }
    }

    /// Message safe to return to the terminal. Constraint and store detail
    /// stays in the logs.
    pub fn client_message(&self) -> String {
        match self {
            SyncError::Constraint(_) => "record rejected by the store".to_string(),
            SyncError::Store(_) => "sync store unavailable, retry later".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(ref code, ref msg)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                SyncError::Constraint(msg.clone().unwrap_or_else(|| err.to_string()))
            }
            other => SyncError::Store(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_level_classification() {
        assert!(SyncError::Validation("x".into()).is_record_level());
        assert!(SyncError::Constraint("x".into()).is_record_level());
        assert!(SyncError::UnresolvedReference {
            field: "employee_global_id",
            target: "employee",
            global_id: "emp-1".into(),
        }
        .is_record_level());
        assert!(!SyncError::Store("down".into()).is_record_level());
        assert!(!SyncError::UnknownKind.is_record_level());
    }

    #[test]
    fn constraint_detail_is_not_returned_to_clients() {
        let err = SyncError::Constraint("CHECK constraint failed: quantity >= 0".into());
        assert!(!err.client_message().contains("quantity"));
        assert!(err.to_string().contains("quantity"));
    }

    #[test]
    fn sqlite_constraint_maps_to_constraint_variant() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (v INTEGER NOT NULL CHECK (v >= 0));")
            .unwrap();
        let err: SyncError = conn
            .execute("INSERT INTO t (v) VALUES (-1)", [])
            .unwrap_err()
            .into();
        assert!(matches!(err, SyncError::Constraint(_)));
    }
}
