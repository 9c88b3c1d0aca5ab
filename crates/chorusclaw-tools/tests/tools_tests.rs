//! Tests for chorusclaw-tools: ToolResult, ToolRegistry, and the built-in tools

use chorusclaw_core::{OutboundMessage, TransportError};
use chorusclaw_tools::*;
use serde_json::json;
use std::sync::{Arc, Mutex};

/// Records every posted message; optionally rejects them.
#[derive(Default)]
struct RecordingPoster {
    posted: Mutex<Vec<OutboundMessage>>,
    reject: bool,
}

#[async_trait::async_trait]
impl ChannelPoster for RecordingPoster {
    async fn post(&self, msg: OutboundMessage) -> Result<(), TransportError> {
        if self.reject {
            return Err(TransportError::Rejected("channel is read-only".into()));
        }
        self.posted.lock().unwrap().push(msg);
        Ok(())
    }
}

/// Hands out sequential task ids and remembers the requests.
#[derive(Default)]
struct RecordingSpawner {
    requests: Mutex<Vec<SubtaskRequest>>,
}

#[async_trait::async_trait]
impl SubtaskSpawner for RecordingSpawner {
    async fn spawn_subtask(&self, request: SubtaskRequest) -> Result<String, String> {
        let mut reqs = self.requests.lock().unwrap();
        reqs.push(request);
        Ok(format!("task-{}", reqs.len()))
    }
}

fn ctx() -> ToolContext {
    ToolContext::new("analyst", "general", "ev-42")
}

fn registry_with(poster: Arc<RecordingPoster>, spawner: SpawnerHandle) -> ToolRegistry {
    create_default_registry(poster, spawner)
}

// ===========================================================================
// ToolResult
// ===========================================================================

#[test]
fn tool_result_text() {
    let r = ToolResult::text("hello");
    assert_eq!(r.to_content_string(), "hello");
}

#[test]
fn tool_result_json() {
    let r = ToolResult::Json(json!({"key": "value"}));
    let s = r.to_content_string();
    assert!(s.contains("key"));
    assert!(s.contains("value"));
}

#[test]
fn invocation_error_messages() {
    assert_eq!(
        ToolInvocationError::UnknownTool("bash".into()).to_string(),
        "unknown tool: bash"
    );
    assert_eq!(
        ToolInvocationError::failed("spawn", "boom").to_string(),
        "'spawn' failed: boom"
    );
}

// ===========================================================================
// ToolRegistry
// ===========================================================================

#[tokio::test]
async fn registry_default_is_empty() {
    let reg = ToolRegistry::new();
    assert!(reg.list().is_empty());
    assert!(reg.get_definitions().is_empty());
}

#[tokio::test]
async fn default_registry_has_builtin_tools_in_stable_order() {
    let reg = registry_with(Arc::new(RecordingPoster::default()), create_spawner_handle());
    assert_eq!(reg.list(), vec!["channel_info", "message", "spawn"]);
    let names: Vec<_> = reg.get_definitions().into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["channel_info", "message", "spawn"]);
    let without_spawn: Vec<_> = reg
        .get_definitions_excluding(&["spawn"])
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert_eq!(without_spawn, vec!["channel_info", "message"]);
}

#[tokio::test]
async fn registry_read_only_classification() {
    let reg = registry_with(Arc::new(RecordingPoster::default()), create_spawner_handle());
    assert!(reg.all_read_only(["channel_info"]));
    assert!(!reg.all_read_only(["channel_info", "message"]));
}

#[tokio::test]
async fn registry_unknown_tool_is_typed_error() {
    let reg = ToolRegistry::new();
    let err = reg.invoke("bash", json!({}), &ctx()).await.unwrap_err();
    assert_eq!(err, ToolInvocationError::UnknownTool("bash".into()));
}

#[tokio::test]
async fn registry_tool_has_schema() {
    let reg = registry_with(Arc::new(RecordingPoster::default()), create_spawner_handle());
    let spawn = reg.get("spawn").unwrap();
    let schema = spawn.input_schema();
    assert_eq!(schema["required"][0], "objective");
    assert!(!reg.combined_prompts().is_empty());
}

// ===========================================================================
// channel_info
// ===========================================================================

#[tokio::test]
async fn channel_info_reports_context() {
    let reg = registry_with(Arc::new(RecordingPoster::default()), create_spawner_handle());
    let out = reg.invoke("channel_info", json!({}), &ctx().at_depth(1)).await.unwrap();
    match out {
        ToolResult::Json(v) => {
            assert_eq!(v["bot"], "analyst");
            assert_eq!(v["channel_id"], "general");
            assert_eq!(v["event_id"], "ev-42");
            assert_eq!(v["subtask_depth"], 1);
        }
        other => panic!("Expected Json, got {:?}", other),
    }
}

// ===========================================================================
// message
// ===========================================================================

#[tokio::test]
async fn message_posts_attributed_to_caller() {
    let poster = Arc::new(RecordingPoster::default());
    let reg = registry_with(poster.clone(), create_spawner_handle());
    reg.invoke("message", json!({"text": "working on it"}), &ctx())
        .await
        .unwrap();

    let posted = poster.posted.lock().unwrap();
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0].bot_name, "analyst");
    assert_eq!(posted[0].target_channel_id, "general");
    assert_eq!(posted[0].in_reply_to_event_id.as_deref(), Some("ev-42"));
}

#[tokio::test]
async fn message_honours_channel_override() {
    let poster = Arc::new(RecordingPoster::default());
    let reg = registry_with(poster.clone(), create_spawner_handle());
    reg.invoke("message", json!({"text": "fyi", "channel_id": "ops"}), &ctx())
        .await
        .unwrap();
    assert_eq!(poster.posted.lock().unwrap()[0].target_channel_id, "ops");
}

#[tokio::test]
async fn message_requires_text() {
    let reg = registry_with(Arc::new(RecordingPoster::default()), create_spawner_handle());
    let err = reg.invoke("message", json!({}), &ctx()).await.unwrap_err();
    assert!(matches!(err, ToolInvocationError::InvalidArguments { .. }));
}

#[tokio::test]
async fn message_rejection_becomes_tool_failure() {
    let poster = Arc::new(RecordingPoster {
        reject: true,
        ..Default::default()
    });
    let reg = registry_with(poster, create_spawner_handle());
    let err = reg.invoke("message", json!({"text": "hi"}), &ctx()).await.unwrap_err();
    assert!(matches!(err, ToolInvocationError::Failed { .. }));
}

// ===========================================================================
// spawn
// ===========================================================================

#[tokio::test]
async fn spawn_without_spawner_fails() {
    let reg = registry_with(Arc::new(RecordingPoster::default()), create_spawner_handle());
    let err = reg
        .invoke("spawn", json!({"objective": "summarise"}), &ctx())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not available"));
}

#[tokio::test]
async fn spawn_forwards_request_one_level_deeper() {
    let spawner = Arc::new(RecordingSpawner::default());
    let handle = create_spawner_handle();
    *handle.write().await = Some(spawner.clone());
    let reg = registry_with(Arc::new(RecordingPoster::default()), handle);

    let out = reg
        .invoke(
            "spawn",
            json!({"objective": "compare three options", "context": "budget is small"}),
            &ctx(),
        )
        .await
        .unwrap();
    assert!(out.to_content_string().contains("task-1"));

    let reqs = spawner.requests.lock().unwrap();
    assert_eq!(reqs[0].bot_name, "analyst");
    assert_eq!(reqs[0].origin_event_id, "ev-42");
    assert_eq!(reqs[0].objective, "compare three options");
    assert_eq!(reqs[0].context.as_deref(), Some("budget is small"));
    assert_eq!(reqs[0].depth, 1);
}

#[tokio::test]
async fn spawn_requires_objective() {
    let reg = registry_with(Arc::new(RecordingPoster::default()), create_spawner_handle());
    let err = reg.invoke("spawn", json!({"objective": "  "}), &ctx()).await.unwrap_err();
    assert!(matches!(err, ToolInvocationError::InvalidArguments { .. }));
}
