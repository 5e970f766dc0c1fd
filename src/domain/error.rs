//! Error types for the orchestration runtime.
//!
//! Every user-visible failure carries one of the kinds below. Repositories
//! speak `DatabaseError`; services translate into `CoreError` at the
//! boundary so callers can match on the kind without knowing which layer
//! produced it.

use thiserror::Error;
use uuid::Uuid;

/// Errors produced by repository operations.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// A query failed at the sqlx layer
    #[error("query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// A stored row could not be parsed into its schema. Fatal: the store
    /// is the single source of truth and an unreadable row means the
    /// invariants can no longer be checked.
    #[error("row parse failed: {0}")]
    ParseError(String),

    /// A unique constraint was violated
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Migration failed at startup
    #[error("migration failed: {0}")]
    MigrationFailed(String),
}

impl DatabaseError {
    /// True when the error indicates an unreadable row, which the runtime
    /// treats as fatal store corruption.
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::ParseError(_))
    }
}

/// Top-level error taxonomy for the runtime.
#[derive(Error, Debug)]
pub enum CoreError {
    /// An id or name resolved to nothing. Recoverable at the caller.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Unique constraint violated (project per path, room per name).
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Status transition rejected.
    #[error("illegal transition for {entity} {id}: {from} -> {to}")]
    IllegalTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    /// Dependency graph has a cycle; the operation aborts.
    #[error("dependency cycle detected involving {0:?}")]
    Cycle(Vec<Uuid>),

    /// A wait exhausted its budget. The timed-out dependency ids are
    /// listed in the wait result so the caller can decide whether this is
    /// fatal.
    #[error("timed out after {waited_ms}ms waiting for {what}")]
    Timeout { what: String, waited_ms: u64 },

    /// Process spawn failed at the OS boundary.
    #[error("child spawn failed: {0}")]
    ChildSpawn(String),

    /// Schema parse failure on read. Fatal: the process logs and exits
    /// non-zero.
    #[error("store corruption: {0}")]
    StoreCorruption(String),

    /// The dashboard connector could not reach the dashboard. Logged;
    /// never affects the core.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Message sent to a closed room.
    #[error("room is closed: {0}")]
    Closed(String),

    /// Request validation failed before reaching a service.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Non-corruption store failure (connection, query, migration).
    #[error("store error: {0}")]
    Store(String),
}

impl CoreError {
    /// Stable kind tag used in tool responses and `system_error` events.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::AlreadyExists(_) => "already_exists",
            Self::IllegalTransition { .. } => "illegal_transition",
            Self::Cycle(_) => "cycle",
            Self::Timeout { .. } => "timeout",
            Self::ChildSpawn(_) => "child_spawn",
            Self::StoreCorruption(_) => "store_corruption",
            Self::TransportUnavailable(_) => "transport_unavailable",
            Self::Closed(_) => "closed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Store(_) => "store",
        }
    }

    /// Fatal errors abort the process with a non-zero exit code.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::StoreCorruption(_))
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<DatabaseError> for CoreError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::ParseError(msg) => Self::StoreCorruption(msg),
            DatabaseError::ConstraintViolation(msg) => Self::AlreadyExists(msg),
            DatabaseError::QueryFailed(e) => Self::Store(e.to_string()),
            DatabaseError::MigrationFailed(msg) => Self::Store(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_are_stable() {
        assert_eq!(
            CoreError::not_found("agent", Uuid::nil()).kind(),
            "not_found"
        );
        assert_eq!(CoreError::Cycle(vec![]).kind(), "cycle");
        assert_eq!(
            CoreError::Timeout {
                what: "deps".into(),
                waited_ms: 10
            }
            .kind(),
            "timeout"
        );
    }

    #[test]
    fn test_parse_error_maps_to_store_corruption() {
        let err: CoreError = DatabaseError::ParseError("bad uuid".into()).into();
        assert!(err.is_fatal());
        assert_eq!(err.kind(), "store_corruption");
    }

    #[test]
    fn test_constraint_violation_maps_to_already_exists() {
        let err: CoreError = DatabaseError::ConstraintViolation("rooms.name".into()).into();
        assert_eq!(err.kind(), "already_exists");
        assert!(!err.is_fatal());
    }
}
