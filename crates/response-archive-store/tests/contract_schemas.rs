use std::fs;
use std::path::{Path, PathBuf};

use jsonschema::JSONSchema;
use response_archive_core::{
    DelegationInput, DelegationStatus, DelegationUpdate, Disposition, EventInput,
    ModeratorNoteInput, RollbackOptions, RunId, SafetyUpdate, StartRunInput, StatusUpdate,
};
use response_archive_store::RunArchive;
use serde_json::{json, Value};

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn read_json(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", path.display()));
    serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse {}: {err}", path.display()))
}

fn schema_path(name: &str) -> PathBuf {
    repo_root().join("contracts/v1/schemas").join(name)
}

fn assert_schema(schema_path: &Path, value: &Value) {
    let schema = read_json(schema_path);
    let compiled = JSONSchema::compile(&schema)
        .unwrap_or_else(|err| panic!("failed to compile {}: {err}", schema_path.display()));
    if let Some(errors) = compiled
        .validate(value)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>())
    {
        panic!(
            "schema validation failed for {}:\n{}",
            schema_path.display(),
            errors.join("\n")
        );
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|err| panic!("failed to serialize: {err}"))
}

fn must<T>(result: Result<T, response_archive_core::ArchiveError>) -> T {
    result.unwrap_or_else(|err| panic!("archive operation failed: {err}"))
}

fn populated_archive() -> (RunArchive, RunId) {
    let archive = RunArchive::default();
    let run_id = RunId::from("contract-run");
    let mut start = StartRunInput::new(
        run_id.clone(),
        json!({"model": "gpt-4", "input": "hello", "temperature": 0.1}),
    );
    start.conversation_id = Some("conv-1".to_string());
    start.trace_id = Some("trace-1".to_string());
    must(archive.start_run(start));

    must(archive.record_event(&run_id, EventInput::new("response.created", json!({}))));
    must(archive.record_event(
        &run_id,
        EventInput::new("tool.requested", json!({"call_id": "call-1"})),
    ));
    must(archive.record_event(&run_id, EventInput::new("response.completed", json!({}))));

    must(archive.update_safety(
        &run_id,
        &SafetyUpdate {
            hashed_identifier: Some("sha256:abc".to_string()),
            refusal_logged_at: Some(response_archive_core::now_utc()),
        },
    ));
    must(archive.add_moderator_note(
        &run_id,
        ModeratorNoteInput {
            reviewer: "moderator-1".to_string(),
            note: "reviewed refusal".to_string(),
            disposition: Disposition::Approved,
            recorded_at: None,
        },
    ));

    let mut delegation = DelegationInput::new("call-1", "web_search");
    delegation.arguments = Some(json!({"q": "archive"}));
    must(archive.record_delegation(&run_id, &delegation));
    must(archive.update_delegation(
        &run_id,
        "call-1",
        &DelegationUpdate {
            status: Some(DelegationStatus::Completed),
            output: Some(json!({"hits": 1})),
            ..DelegationUpdate::default()
        },
    ));
    must(archive.record_delegation(&run_id, &DelegationInput::new("call-2", "fetch")));

    must(archive.update_status(StatusUpdate {
        run_id: run_id.clone(),
        status: "completed".to_string(),
        result: Some(json!({
            "output": [
                {"type": "tool_call", "id": "call-1", "name": "web_search"},
                {"type": "message", "content": "answer"}
            ]
        })),
    }));

    (archive, run_id)
}

#[test]
fn run_and_timeline_payloads_match_published_schemas() {
    let (archive, run_id) = populated_archive();

    let run = must(archive.get_run(&run_id))
        .unwrap_or_else(|| panic!("run {run_id} should exist"));
    assert_schema(&schema_path("run.schema.json"), &to_json(&run));

    let timeline = must(archive.get_timeline(&run_id))
        .unwrap_or_else(|| panic!("timeline {run_id} should exist"));
    assert_schema(&schema_path("timeline.schema.json"), &to_json(&timeline));
    assert_schema(&schema_path("run.schema.json"), &to_json(&timeline.run));
}

#[test]
fn rolled_back_timeline_still_matches_schemas() {
    let (archive, run_id) = populated_archive();
    let view = must(archive.rollback(
        &run_id,
        &RollbackOptions::excise_tool_call("call-1").with_operator("ops"),
    ));

    let payload = to_json(&view);
    assert_schema(&schema_path("timeline.schema.json"), &payload);
    assert_schema(&schema_path("run.schema.json"), &payload["run"]);
    assert_eq!(payload["run"]["metadata"]["last_rollback_tool_call"], json!("call-1"));
    assert_eq!(payload["events"].as_array().map(Vec::len), Some(2));
}

#[test]
fn status_payload_matches_schema() {
    let (archive, _) = populated_archive();
    let status = to_json(&must(archive.status()));
    assert_schema(&schema_path("status.schema.json"), &status);
    assert_eq!(status["runs"], json!(1));
    assert_eq!(status["events"], json!(3));
    assert_eq!(status["delegations"], json!(2));
    assert_eq!(status["moderatorNotes"], json!(1));
}
