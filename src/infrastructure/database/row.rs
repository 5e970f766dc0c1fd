//! Row parsing helpers shared by the repositories.
//!
//! A stored row that no longer parses into its schema is a fatal
//! invariant violation; these helpers produce `ParseError` so the caller
//! surfaces `StoreCorruption`.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::domain::error::DatabaseError;

pub fn parse_uuid(field: &str, raw: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(raw)
        .map_err(|e| DatabaseError::ParseError(format!("{field}: invalid uuid {raw:?}: {e}")))
}

pub fn parse_uuid_opt(field: &str, raw: Option<&str>) -> Result<Option<Uuid>, DatabaseError> {
    raw.map(|s| parse_uuid(field, s)).transpose()
}

pub fn parse_ts(field: &str, raw: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::ParseError(format!("{field}: invalid timestamp {raw:?}: {e}")))
}

pub fn parse_ts_opt(
    field: &str,
    raw: Option<&str>,
) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    raw.map(|s| parse_ts(field, s)).transpose()
}

pub fn parse_json<T: DeserializeOwned>(field: &str, raw: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(raw)
        .map_err(|e| DatabaseError::ParseError(format!("{field}: invalid json: {e}")))
}

pub fn parse_status<T>(
    field: &str,
    raw: &str,
    from_str: impl Fn(&str) -> Option<T>,
) -> Result<T, DatabaseError> {
    from_str(raw)
        .ok_or_else(|| DatabaseError::ParseError(format!("{field}: unknown value {raw:?}")))
}

/// Millisecond-precision RFC-3339, the canonical persisted form.
pub fn to_rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Detect a SQLite unique-constraint failure so repositories can report
/// `ConstraintViolation` instead of a generic query error.
pub fn map_unique_violation(err: sqlx::Error, what: &str) -> DatabaseError {
    if err.to_string().contains("UNIQUE constraint failed") {
        DatabaseError::ConstraintViolation(what.to_string())
    } else {
        DatabaseError::QueryFailed(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uuid_failure_names_field() {
        let err = parse_uuid("agents.id", "not-a-uuid").unwrap_err();
        assert!(err.to_string().contains("agents.id"));
        assert!(err.is_corruption());
    }

    #[test]
    fn test_ts_round_trip_keeps_millis() {
        let now = Utc::now();
        let raw = to_rfc3339(now);
        let parsed = parse_ts("t", &raw).unwrap();
        assert_eq!(parsed.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn test_parse_status() {
        use crate::domain::models::AgentStatus;
        let status = parse_status("agents.status", "active", AgentStatus::from_str).unwrap();
        assert_eq!(status, AgentStatus::Active);
        assert!(parse_status("agents.status", "nope", AgentStatus::from_str).is_err());
    }
}
