//! Plain-data contracts and pure logic for the response archive.
//!
//! Everything in this crate is lock-free and side-effect free: the types are
//! value objects that are cloned across every API boundary, and
//! [`apply_rollback_to_timeline`] computes a rollback view without touching
//! any store. The stateful archive lives in `response-archive-store`.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime, UtcOffset};
use ulid::Ulid;

mod model;
mod rollback;

pub use model::{
    output_tool_call_id, payload_references_tool_call, DelegationInput, DelegationRecord,
    DelegationStatus, DelegationUpdate, Disposition, EventInput, EventRecord, ModeratorNote,
    ModeratorNoteInput, ResponseRequest, ResponseResult, Run, SafetySnapshot, SafetyUpdate,
    StartRunInput, StatusUpdate, TimelineSnapshot,
};
pub use rollback::{
    apply_rollback_to_timeline, RollbackOptions, ROLLBACK_AT_KEY, ROLLBACK_OPERATOR_KEY,
    ROLLBACK_REASON_KEY, ROLLBACK_SEQUENCE_KEY, ROLLBACK_TOOL_CALL_KEY,
};

pub const ARCHIVE_CONTRACT_VERSION: &str = "response_archive.v1";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ArchiveError {
    #[error("run already exists: {run_id}")]
    DuplicateRun { run_id: RunId },
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: RunId },
    #[error("duplicate sequence {sequence} for run {run_id}")]
    DuplicateSequence { run_id: RunId, sequence: u64 },
    #[error("delegation {call_id} not found for run {run_id}")]
    DelegationNotFound { run_id: RunId, call_id: String },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Caller-supplied run identifier, unique for the lifetime of an archive.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    /// Mints a fresh ULID-backed identifier for callers that do not bring
    /// their own.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RunId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ArchiveConfig {
    /// Status assigned to every run by `start_run`.
    pub initial_status: String,
    /// Runs idle for longer than this are eligible for retention pruning.
    pub retention_max_age_seconds: Option<u64>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            initial_status: "queued".to_string(),
            retention_max_age_seconds: None,
        }
    }
}

impl ArchiveConfig {
    /// Validates configuration bounds.
    ///
    /// # Errors
    /// Returns [`ArchiveError::Configuration`] when `initial_status` is blank
    /// or the retention age is zero.
    pub fn validate(&self) -> Result<(), ArchiveError> {
        if self.initial_status.trim().is_empty() {
            return Err(ArchiveError::Configuration(
                "initial_status MUST be non-empty".to_string(),
            ));
        }

        if self.retention_max_age_seconds == Some(0) {
            return Err(ArchiveError::Configuration(
                "retention_max_age_seconds MUST be >= 1 when set".to_string(),
            ));
        }

        Ok(())
    }

    /// Decodes and validates a configuration from JSON.
    ///
    /// # Errors
    /// Returns [`ArchiveError::Configuration`] when decoding fails or the
    /// decoded values are out of bounds.
    pub fn from_json(value: &Value) -> Result<Self, ArchiveError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            ArchiveError::Configuration(format!("invalid archive config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn retention_cutoff(&self, now: OffsetDateTime) -> Option<OffsetDateTime> {
        let seconds = i64::try_from(self.retention_max_age_seconds?).unwrap_or(i64::MAX);
        now.checked_sub(Duration::seconds(seconds))
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`ArchiveError::Validation`] when parsing fails or the timestamp
/// is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, ArchiveError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| ArchiveError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(ArchiveError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`ArchiveError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, ArchiveError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            ArchiveError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Returns `now` when it is strictly later than `previous`, otherwise the
/// smallest representable step past `previous`.
#[must_use]
pub fn advance_timestamp(previous: OffsetDateTime, now: OffsetDateTime) -> OffsetDateTime {
    if now > previous {
        now
    } else {
        previous + Duration::NANOSECOND
    }
}
