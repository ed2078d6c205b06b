use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::model::{output_tool_call_id, payload_references_tool_call};
use crate::{format_rfc3339, ArchiveError, EventRecord, Run, TimelineSnapshot};

pub const ROLLBACK_AT_KEY: &str = "last_rollback_at";
pub const ROLLBACK_SEQUENCE_KEY: &str = "last_rollback_sequence";
pub const ROLLBACK_TOOL_CALL_KEY: &str = "last_rollback_tool_call";
pub const ROLLBACK_OPERATOR_KEY: &str = "last_rollback_operator";
pub const ROLLBACK_REASON_KEY: &str = "last_rollback_reason";

/// Selects which part of a run's history survives a rollback.
///
/// `sequence` takes precedence over `tool_call_id` for event filtering. When
/// neither is set the projection keeps every event and only stamps
/// provenance.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RollbackOptions {
    #[serde(default)]
    pub sequence: Option<u64>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub operator: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl RollbackOptions {
    #[must_use]
    pub fn to_sequence(sequence: u64) -> Self {
        Self {
            sequence: Some(sequence),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn excise_tool_call(call_id: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_operator(mut self, operator: impl Into<String>) -> Self {
        self.operator = Some(operator.into());
        self
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    #[must_use]
    pub fn has_filter(&self) -> bool {
        self.sequence.is_some() || self.tool_call_id.is_some()
    }
}

/// Computes the rolled-back view of a run without touching any store.
///
/// Surviving events keep their relative order and are renumbered `1..=k`.
/// When `tool_call_id` is set, matching `tool_call` entries are also removed
/// from `run.result.output`. Provenance is stamped into `run.metadata` as
/// strings; unrelated metadata entries are kept.
///
/// # Errors
/// Returns [`ArchiveError::Validation`] when `now` cannot be formatted as
/// RFC3339.
pub fn apply_rollback_to_timeline(
    run: &Run,
    events: &[EventRecord],
    options: &RollbackOptions,
    now: OffsetDateTime,
) -> Result<TimelineSnapshot, ArchiveError> {
    let mut survivors: Vec<&EventRecord> = match (options.sequence, options.tool_call_id.as_deref())
    {
        (Some(limit), _) => events
            .iter()
            .filter(|event| event.sequence <= limit)
            .collect(),
        (None, Some(call_id)) => events
            .iter()
            .filter(|event| !payload_references_tool_call(&event.payload, call_id))
            .collect(),
        (None, None) => events.iter().collect(),
    };
    survivors.sort_by_key(|event| event.sequence);

    let events = survivors
        .into_iter()
        .zip(1_u64..)
        .map(|(event, sequence)| EventRecord {
            sequence,
            ..event.clone()
        })
        .collect();

    let mut run = run.clone();

    if let Some(call_id) = options.tool_call_id.as_deref() {
        if let Some(output) = run.result.as_mut().and_then(|result| result.output.as_mut()) {
            output.retain(|item| output_tool_call_id(item).as_deref() != Some(call_id));
        }
    }

    run.metadata
        .insert(ROLLBACK_AT_KEY.to_string(), format_rfc3339(now)?);
    if let Some(sequence) = options.sequence {
        run.metadata
            .insert(ROLLBACK_SEQUENCE_KEY.to_string(), sequence.to_string());
    }
    if let Some(call_id) = &options.tool_call_id {
        run.metadata
            .insert(ROLLBACK_TOOL_CALL_KEY.to_string(), call_id.clone());
    }
    if let Some(operator) = &options.operator {
        run.metadata
            .insert(ROLLBACK_OPERATOR_KEY.to_string(), operator.clone());
    }
    if let Some(reason) = &options.reason {
        run.metadata
            .insert(ROLLBACK_REASON_KEY.to_string(), reason.clone());
    }

    Ok(TimelineSnapshot { run, events })
}
