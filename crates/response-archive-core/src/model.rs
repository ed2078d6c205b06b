use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::{ArchiveError, RunId};

const TOOL_CALL_OUTPUT_KIND: &str = "tool_call";
const PAYLOAD_CALL_ID_KEYS: [&str; 2] = ["call_id", "callId"];
const OUTPUT_CALL_ID_KEYS: [&str; 3] = ["call_id", "callId", "id"];

/// Model request captured at `start_run`.
///
/// `model` and `input` are the only fields the archive inspects; every other
/// key is carried through untouched in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseRequest {
    pub model: String,
    pub input: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResponseRequest {
    /// Validates and decodes a raw request payload.
    ///
    /// # Errors
    /// Returns [`ArchiveError::Validation`] when the payload is not an object,
    /// `model` is missing or blank, or `input` is neither a string nor an
    /// array.
    pub fn from_json(value: &Value) -> Result<Self, ArchiveError> {
        let Value::Object(fields) = value else {
            return Err(ArchiveError::Validation(
                "request MUST be a JSON object".to_string(),
            ));
        };

        let model = match fields.get("model") {
            Some(Value::String(model)) if !model.trim().is_empty() => model.clone(),
            _ => {
                return Err(ArchiveError::Validation(
                    "request.model MUST be a non-empty string".to_string(),
                ))
            }
        };

        let input = match fields.get("input") {
            Some(input @ (Value::String(_) | Value::Array(_))) => input.clone(),
            _ => {
                return Err(ArchiveError::Validation(
                    "request.input MUST be a string or an array".to_string(),
                ))
            }
        };

        let extra = fields
            .iter()
            .filter(|(key, _)| key.as_str() != "model" && key.as_str() != "input")
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(Self {
            model,
            input,
            extra,
        })
    }
}

/// Model result attached by `update_status`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResponseResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Vec<Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResponseResult {
    /// Validates and decodes a raw result payload.
    ///
    /// # Errors
    /// Returns [`ArchiveError::Validation`] when the payload is not an object
    /// or `output` is present but is not an array of typed objects.
    pub fn from_json(value: &Value) -> Result<Self, ArchiveError> {
        let Value::Object(fields) = value else {
            return Err(ArchiveError::Validation(
                "result MUST be a JSON object".to_string(),
            ));
        };

        let output = match fields.get("output") {
            None | Some(Value::Null) => None,
            Some(Value::Array(items)) => {
                for (index, item) in items.iter().enumerate() {
                    let has_kind = item
                        .get("type")
                        .and_then(Value::as_str)
                        .is_some_and(|kind| !kind.trim().is_empty());
                    if !item.is_object() || !has_kind {
                        return Err(ArchiveError::Validation(format!(
                            "result.output[{index}] MUST be an object with a non-empty string type"
                        )));
                    }
                }
                Some(items.clone())
            }
            Some(_) => {
                return Err(ArchiveError::Validation(
                    "result.output MUST be an array when present".to_string(),
                ))
            }
        };

        let extra = fields
            .iter()
            .filter(|(key, _)| key.as_str() != "output")
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(Self { output, extra })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Approved,
    Escalated,
    Blocked,
    Info,
}

impl Disposition {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Escalated => "escalated",
            Self::Blocked => "blocked",
            Self::Info => "info",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DelegationStatus {
    Requested,
    Completed,
    Failed,
}

impl DelegationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModeratorNote {
    pub reviewer: String,
    pub note: String,
    pub disposition: Disposition,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModeratorNoteInput {
    pub reviewer: String,
    pub note: String,
    pub disposition: Disposition,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub recorded_at: Option<OffsetDateTime>,
}

impl ModeratorNoteInput {
    /// Builds the stored note, defaulting `recorded_at` to `now`.
    ///
    /// # Errors
    /// Returns [`ArchiveError::Validation`] when `reviewer` or `note` is blank.
    pub fn into_note(self, now: OffsetDateTime) -> Result<ModeratorNote, ArchiveError> {
        if self.reviewer.trim().is_empty() {
            return Err(ArchiveError::Validation(
                "moderator note reviewer MUST be provided".to_string(),
            ));
        }
        if self.note.trim().is_empty() {
            return Err(ArchiveError::Validation(
                "moderator note text MUST be provided".to_string(),
            ));
        }

        Ok(ModeratorNote {
            reviewer: self.reviewer,
            note: self.note,
            disposition: self.disposition,
            recorded_at: self.recorded_at.unwrap_or(now),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SafetySnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashed_identifier: Option<String>,
    #[serde(default)]
    pub refusal_count: u32,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_refusal_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub moderator_notes: Vec<ModeratorNote>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SafetyUpdate {
    #[serde(default)]
    pub hashed_identifier: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub refusal_logged_at: Option<OffsetDateTime>,
}

impl SafetySnapshot {
    /// Merges a partial update. A logged refusal always counts exactly once.
    #[must_use]
    pub fn merged(&self, update: &SafetyUpdate) -> Self {
        let mut next = self.clone();
        if let Some(hashed) = &update.hashed_identifier {
            next.hashed_identifier = Some(hashed.clone());
        }
        if let Some(logged_at) = update.refusal_logged_at {
            next.refusal_count = next.refusal_count.saturating_add(1);
            next.last_refusal_at = Some(logged_at);
        }
        next
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DelegationRecord {
    pub call_id: String,
    pub tool_name: String,
    pub status: DelegationStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub requested_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_run_id: Option<RunId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DelegationInput {
    pub call_id: String,
    pub tool_name: String,
    #[serde(default = "default_delegation_status")]
    pub status: DelegationStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub requested_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub arguments: Option<Value>,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub linked_run_id: Option<RunId>,
}

fn default_delegation_status() -> DelegationStatus {
    DelegationStatus::Requested
}

impl DelegationInput {
    #[must_use]
    pub fn new(call_id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            status: DelegationStatus::Requested,
            requested_at: None,
            completed_at: None,
            arguments: None,
            output: None,
            linked_run_id: None,
        }
    }

    /// Builds the stored record, defaulting `requested_at` to `now`. A
    /// record created as `completed` without `completed_at` is stamped with
    /// `now` as well.
    ///
    /// # Errors
    /// Returns [`ArchiveError::Validation`] when `call_id` or `tool_name` is
    /// blank.
    pub fn to_record(&self, now: OffsetDateTime) -> Result<DelegationRecord, ArchiveError> {
        if self.call_id.trim().is_empty() {
            return Err(ArchiveError::Validation(
                "delegation call_id MUST be provided".to_string(),
            ));
        }
        if self.tool_name.trim().is_empty() {
            return Err(ArchiveError::Validation(
                "delegation tool_name MUST be provided".to_string(),
            ));
        }

        let completed_at = match (self.completed_at, self.status) {
            (Some(completed_at), _) => Some(completed_at),
            (None, DelegationStatus::Completed) => Some(now),
            (None, _) => None,
        };

        Ok(DelegationRecord {
            call_id: self.call_id.clone(),
            tool_name: self.tool_name.clone(),
            status: self.status,
            requested_at: self.requested_at.unwrap_or(now),
            completed_at,
            arguments: self.arguments.clone(),
            output: self.output.clone(),
            linked_run_id: self.linked_run_id.clone(),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DelegationUpdate {
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub status: Option<DelegationStatus>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub arguments: Option<Value>,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub linked_run_id: Option<RunId>,
}

impl DelegationRecord {
    /// Merges a partial update onto this record.
    ///
    /// An explicit `completed_at` is always honored. Otherwise, moving the
    /// record to `completed` stamps `completed_at` with `now`; a record that
    /// is already completed keeps its original completion time.
    #[must_use]
    pub fn merged(&self, update: &DelegationUpdate, now: OffsetDateTime) -> Self {
        let mut next = self.clone();
        if let Some(tool_name) = &update.tool_name {
            next.tool_name.clone_from(tool_name);
        }
        if let Some(status) = update.status {
            next.status = status;
        }
        if let Some(arguments) = &update.arguments {
            next.arguments = Some(arguments.clone());
        }
        if let Some(output) = &update.output {
            next.output = Some(output.clone());
        }
        if let Some(linked) = &update.linked_run_id {
            next.linked_run_id = Some(linked.clone());
        }

        match update.completed_at {
            Some(completed_at) => next.completed_at = Some(completed_at),
            None if update.status == Some(DelegationStatus::Completed) => {
                let already_completed =
                    self.status == DelegationStatus::Completed && self.completed_at.is_some();
                if !already_completed {
                    next.completed_at = Some(now);
                }
            }
            None => {}
        }

        next
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub run_id: RunId,
    pub request: ResponseRequest,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResponseResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default)]
    pub safety: SafetySnapshot,
    #[serde(default)]
    pub delegations: Vec<DelegationRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StartRunInput {
    pub run_id: RunId,
    pub request: Value,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub safety: Option<SafetySnapshot>,
    #[serde(default)]
    pub delegations: Vec<DelegationRecord>,
}

impl StartRunInput {
    #[must_use]
    pub fn new(run_id: impl Into<RunId>, request: Value) -> Self {
        Self {
            run_id: run_id.into(),
            request,
            conversation_id: None,
            trace_id: None,
            metadata: BTreeMap::new(),
            safety: None,
            delegations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub run_id: RunId,
    pub status: String,
    #[serde(default)]
    pub result: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub run_id: RunId,
    pub sequence: u64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventInput {
    #[serde(default)]
    pub sequence: Option<u64>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub occurred_at: Option<OffsetDateTime>,
}

impl EventInput {
    #[must_use]
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            sequence: None,
            event_type: event_type.into(),
            payload,
            occurred_at: None,
        }
    }

    #[must_use]
    pub fn at_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Validates an event before it is journaled.
    ///
    /// # Errors
    /// Returns [`ArchiveError::Validation`] for a zero sequence or a blank
    /// event type.
    pub fn validate(&self) -> Result<(), ArchiveError> {
        if self.sequence == Some(0) {
            return Err(ArchiveError::Validation(
                "sequence MUST be >= 1".to_string(),
            ));
        }
        if self.event_type.trim().is_empty() {
            return Err(ArchiveError::Validation(
                "event type MUST be provided".to_string(),
            ));
        }
        Ok(())
    }
}

/// A run together with its journal, events ascending by sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimelineSnapshot {
    pub run: Run,
    pub events: Vec<EventRecord>,
}

/// Returns true when the payload names `call_id` under `call_id` or `callId`.
#[must_use]
pub fn payload_references_tool_call(payload: &Value, call_id: &str) -> bool {
    PAYLOAD_CALL_ID_KEYS
        .iter()
        .filter_map(|key| payload.get(key))
        .filter_map(id_string)
        .any(|candidate| candidate == call_id)
}

/// Returns the call id of a `tool_call` output entry, if the entry is one.
#[must_use]
pub fn output_tool_call_id(item: &Value) -> Option<String> {
    if item.get("type").and_then(Value::as_str) != Some(TOOL_CALL_OUTPUT_KIND) {
        return None;
    }
    OUTPUT_CALL_ID_KEYS
        .iter()
        .filter_map(|key| item.get(key))
        .find_map(id_string)
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(raw) => Some(raw.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_rfc3339_utc;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_utc(value: &str) -> OffsetDateTime {
        must_ok(parse_rfc3339_utc(value))
    }

    fn fixture_delegation() -> DelegationRecord {
        must_ok(
            DelegationInput::new("call-1", "web_search")
                .to_record(must_utc("2026-02-07T12:00:00Z")),
        )
    }

    #[test]
    fn request_validation_accepts_minimal_shape_and_keeps_extras() {
        let request = must_ok(ResponseRequest::from_json(&json!({
            "model": "gpt-4",
            "input": [],
            "temperature": 0.2
        })));
        assert_eq!(request.model, "gpt-4");
        assert_eq!(request.input, json!([]));
        assert_eq!(request.extra.get("temperature"), Some(&json!(0.2)));

        let round_trip = must_ok(serde_json::to_value(&request));
        assert_eq!(
            round_trip,
            json!({"model": "gpt-4", "input": [], "temperature": 0.2})
        );
    }

    #[test]
    fn request_validation_rejects_malformed_payloads() {
        for payload in [
            json!("gpt-4"),
            json!({"input": []}),
            json!({"model": "", "input": []}),
            json!({"model": "gpt-4"}),
            json!({"model": "gpt-4", "input": 42}),
        ] {
            let result = ResponseRequest::from_json(&payload);
            assert!(
                matches!(result, Err(ArchiveError::Validation(_))),
                "expected validation error for {payload}"
            );
        }
    }

    #[test]
    fn result_validation_requires_typed_output_entries() {
        let result = must_ok(ResponseResult::from_json(&json!({
            "output": [{"type": "message", "content": "hi"}],
            "usage": {"total_tokens": 3}
        })));
        assert_eq!(result.output.as_ref().map(Vec::len), Some(1));
        assert!(result.extra.contains_key("usage"));

        let without_output = must_ok(ResponseResult::from_json(&json!({"text": "done"})));
        assert_eq!(without_output.output, None);

        assert!(ResponseResult::from_json(&json!([])).is_err());
        assert!(ResponseResult::from_json(&json!({"output": "text"})).is_err());
        assert!(ResponseResult::from_json(&json!({"output": [{"content": "x"}]})).is_err());
        assert!(ResponseResult::from_json(&json!({"output": [42]})).is_err());
    }

    #[test]
    fn safety_merge_accumulates_refusals() {
        let first = must_utc("2026-02-07T12:00:00Z");
        let second = must_utc("2026-02-07T12:05:00Z");
        let snapshot = SafetySnapshot::default()
            .merged(&SafetyUpdate {
                hashed_identifier: Some("hash-a".to_string()),
                refusal_logged_at: Some(first),
            })
            .merged(&SafetyUpdate {
                hashed_identifier: None,
                refusal_logged_at: Some(second),
            });

        assert_eq!(snapshot.refusal_count, 2);
        assert_eq!(snapshot.last_refusal_at, Some(second));
        assert_eq!(snapshot.hashed_identifier.as_deref(), Some("hash-a"));

        let untouched = snapshot.merged(&SafetyUpdate::default());
        assert_eq!(untouched, snapshot);
    }

    #[test]
    fn delegation_completion_stamps_completed_at() {
        let now = must_utc("2026-02-07T12:10:00Z");
        let merged = fixture_delegation().merged(
            &DelegationUpdate {
                status: Some(DelegationStatus::Completed),
                output: Some(json!({"hits": 3})),
                ..DelegationUpdate::default()
            },
            now,
        );
        assert_eq!(merged.status, DelegationStatus::Completed);
        assert_eq!(merged.completed_at, Some(now));
        assert_eq!(merged.output, Some(json!({"hits": 3})));
        assert_eq!(merged.tool_name, "web_search");
    }

    #[test]
    fn explicit_completed_at_is_honored_for_any_status() {
        let explicit = must_utc("2026-02-07T11:00:00Z");
        let merged = fixture_delegation().merged(
            &DelegationUpdate {
                status: Some(DelegationStatus::Failed),
                completed_at: Some(explicit),
                ..DelegationUpdate::default()
            },
            must_utc("2026-02-07T12:10:00Z"),
        );
        assert_eq!(merged.status, DelegationStatus::Failed);
        assert_eq!(merged.completed_at, Some(explicit));

        let completed = fixture_delegation().merged(
            &DelegationUpdate {
                status: Some(DelegationStatus::Completed),
                completed_at: Some(explicit),
                ..DelegationUpdate::default()
            },
            must_utc("2026-02-07T12:10:00Z"),
        );
        assert_eq!(completed.completed_at, Some(explicit));
    }

    #[test]
    fn delegation_input_requires_identifiers() {
        let now = must_utc("2026-02-07T12:00:00Z");
        assert!(DelegationInput::new(" ", "search").to_record(now).is_err());
        assert!(DelegationInput::new("call-1", "").to_record(now).is_err());
        assert_eq!(fixture_delegation().requested_at, now);
    }

    #[test]
    fn tool_call_references_accept_both_spellings() {
        assert!(payload_references_tool_call(&json!({"call_id": "c1"}), "c1"));
        assert!(payload_references_tool_call(&json!({"callId": "c1"}), "c1"));
        assert!(payload_references_tool_call(&json!({"call_id": 7}), "7"));
        assert!(!payload_references_tool_call(&json!({"call_id": "C1"}), "c1"));
        assert!(!payload_references_tool_call(&json!({"id": "c1"}), "c1"));
        assert!(!payload_references_tool_call(&json!(null), "c1"));
    }

    #[test]
    fn output_tool_call_id_only_matches_tool_call_entries() {
        assert_eq!(
            output_tool_call_id(&json!({"type": "tool_call", "id": "c1"})),
            Some("c1".to_string())
        );
        assert_eq!(
            output_tool_call_id(&json!({"type": "tool_call", "call_id": "c2"})),
            Some("c2".to_string())
        );
        assert_eq!(
            output_tool_call_id(&json!({"type": "message", "id": "c1"})),
            None
        );
    }

    #[test]
    fn disposition_and_status_tags_match_wire_names() {
        for disposition in [
            Disposition::Approved,
            Disposition::Escalated,
            Disposition::Blocked,
            Disposition::Info,
        ] {
            assert_eq!(
                must_ok(serde_json::to_value(disposition)),
                json!(disposition.as_str())
            );
        }
        assert_eq!(
            must_ok(serde_json::from_value::<DelegationStatus>(json!("completed"))),
            DelegationStatus::Completed
        );
        assert!(serde_json::from_value::<DelegationStatus>(json!("done")).is_err());
    }

    #[test]
    fn delegation_created_as_completed_is_stamped() {
        let now = must_utc("2026-02-07T12:00:00Z");
        let mut input = DelegationInput::new("call-1", "search");
        input.status = DelegationStatus::Completed;
        assert_eq!(must_ok(input.to_record(now)).completed_at, Some(now));

        let explicit = must_utc("2026-02-07T11:30:00Z");
        input.completed_at = Some(explicit);
        assert_eq!(must_ok(input.to_record(now)).completed_at, Some(explicit));

        let requested = must_ok(DelegationInput::new("call-2", "search").to_record(now));
        assert_eq!(requested.completed_at, None);
    }

    #[test]
    fn repeated_completion_keeps_original_completed_at() {
        let first = must_utc("2026-02-07T12:00:00Z");
        let second = must_utc("2026-02-07T12:01:00Z");
        let complete = DelegationUpdate {
            status: Some(DelegationStatus::Completed),
            ..DelegationUpdate::default()
        };

        let completed = fixture_delegation().merged(&complete, first);
        let again = completed.merged(&complete, second);
        assert_eq!(again.completed_at, Some(first));

        let mut failed = fixture_delegation();
        failed.status = DelegationStatus::Failed;
        failed.completed_at = Some(first);
        let retried = failed.merged(&complete, second);
        assert_eq!(retried.completed_at, Some(second));
    }

    #[test]
    fn event_input_rejects_zero_sequence_and_blank_type() {
        assert!(EventInput::new("e1", json!({})).at_sequence(0).validate().is_err());
        assert!(EventInput::new(" ", json!({})).validate().is_err());
        must_ok(EventInput::new("e1", json!({})).at_sequence(3).validate());
    }

    #[test]
    fn event_record_serializes_type_and_camel_case_fields() {
        let event = EventRecord {
            run_id: RunId::from("r1"),
            sequence: 1,
            event_type: "response.created".to_string(),
            payload: json!({}),
            occurred_at: must_utc("2026-02-07T12:00:00Z"),
        };
        let value = must_ok(serde_json::to_value(&event));
        assert_eq!(
            value,
            json!({
                "runId": "r1",
                "sequence": 1,
                "type": "response.created",
                "payload": {},
                "occurredAt": "2026-02-07T12:00:00Z"
            })
        );
    }
}
