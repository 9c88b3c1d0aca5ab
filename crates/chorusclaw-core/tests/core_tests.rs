//! Tests for chorusclaw-core: events, identities, validation, config, errors

use chorusclaw_core::*;
use std::io::Write;

// ===========================================================================
// InboundEvent
// ===========================================================================

#[test]
fn human_event_is_not_self_origin() {
    let ev = InboundEvent::human("general", "u-1", "Alice", "hello");
    assert!(!ev.is_self_origin);
    assert!(ev.is_human());
    assert!(!ev.is_own_echo("Alice"));
    assert_eq!(ev.kind, EventKind::Chat);
    assert!(!ev.event_id.is_empty());
}

#[test]
fn bot_event_is_own_echo_only_for_that_bot() {
    let ev = InboundEvent::from_bot("general", "analyst", "my take");
    assert!(ev.is_self_origin);
    assert!(!ev.is_human());
    assert!(ev.is_own_echo("analyst"));
    assert!(!ev.is_own_echo("creative"));
}

#[test]
fn subtask_completion_is_neither_human_nor_echo() {
    let ev = InboundEvent::subtask_completion("general", "task-1", "done", false);
    assert!(ev.is_subtask_completion());
    assert!(!ev.is_human());
    assert!(!ev.is_own_echo("analyst"));
    assert_eq!(ev.sender_id, SUBTASK_SENDER);
}

#[test]
fn event_ids_are_unique_and_overridable() {
    let a = InboundEvent::human("c", "u", "U", "x");
    let b = InboundEvent::human("c", "u", "U", "x");
    assert_ne!(a.event_id, b.event_id);
    let c = a.with_event_id("fixed");
    assert_eq!(c.event_id, "fixed");
}

#[test]
fn event_kind_serializes_tagged() {
    let ev = InboundEvent::subtask_completion("c", "t-9", "ok", true);
    let json = serde_json::to_string(&ev.kind).unwrap();
    assert!(json.contains(r#""type":"subtask_completion""#));
    assert!(json.contains("t-9"));
}

// ===========================================================================
// BotIdentity
// ===========================================================================

#[test]
fn identity_debug_redacts_credential() {
    let id = BotIdentity::new("analyst", "claude-x", "sk-secret-123");
    let dbg = format!("{:?}", id);
    assert!(!dbg.contains("sk-secret-123"));
    assert!(dbg.contains("<redacted>"));
    assert_eq!(id.masked_credential(), "sk-s***");
}

#[test]
fn persona_preview_truncates_long_personas() {
    let id = BotIdentity::new("a", "m", "k").with_persona("x".repeat(80));
    assert_eq!(id.persona_preview().chars().count(), 53);
    let short = BotIdentity::new("a", "m", "k").with_persona("analyst");
    assert_eq!(short.persona_preview(), "analyst");
    assert_eq!(BotIdentity::new("a", "m", "k").persona_preview(), "");
}

#[test]
fn validate_accepts_distinct_bots() {
    let ids = vec![
        BotIdentity::new("a", "m", "k1"),
        BotIdentity::new("b", "m", "k2"),
    ];
    assert!(validate_identities(&ids).is_ok());
}

#[test]
fn validate_rejects_duplicate_names() {
    let ids = vec![
        BotIdentity::new("a", "m", "k1"),
        BotIdentity::new("a", "m", "k2"),
    ];
    match validate_identities(&ids) {
        Err(Error::DuplicateBotName(name)) => assert_eq!(name, "a"),
        other => panic!("Expected DuplicateBotName, got {:?}", other),
    }
}

#[test]
fn validate_rejects_missing_credential() {
    let ids = vec![BotIdentity::new("a", "m", "  ")];
    let err = validate_identities(&ids).unwrap_err();
    assert!(matches!(err, Error::MissingField { field: "credential", .. }));
}

#[test]
fn validate_rejects_empty_set() {
    assert!(validate_identities(&[]).is_err());
}

// ===========================================================================
// OutboundMessage
// ===========================================================================

#[test]
fn outbound_reply_reference_is_optional() {
    let msg = OutboundMessage::new("a", "general", "hi");
    assert!(msg.in_reply_to_event_id.is_none());
    let json = serde_json::to_string(&msg).unwrap();
    assert!(!json.contains("in_reply_to_event_id"));
    let msg = msg.in_reply_to("ev-1");
    assert_eq!(msg.in_reply_to_event_id.as_deref(), Some("ev-1"));
}

// ===========================================================================
// Errors
// ===========================================================================

#[test]
fn bot_failure_display_names_bot_and_kind() {
    let f = BotFailure::new("analyst", FailureKind::LoopCrash, "panicked");
    assert_eq!(f.to_string(), "bot 'analyst' [loop-crash]: panicked");
}

#[test]
fn user_messages_are_plain_sentences() {
    for kind in [
        FailureKind::Transport,
        FailureKind::ModelTransient,
        FailureKind::ModelPermanent,
        FailureKind::Tool,
    ] {
        let msg = kind.user_message().expect("shown in chat");
        assert!(msg.ends_with('.'));
        assert!(!msg.contains("Error"));
    }
    assert_eq!(FailureKind::Configuration.user_message(), None);
    assert_eq!(FailureKind::LoopCrash.user_message(), None);
}

#[test]
fn transport_error_converts_into_error() {
    let e: Error = TransportError::Closed.into();
    assert!(matches!(e, Error::Transport(TransportError::Closed)));
}

// ===========================================================================
// Config
// ===========================================================================

const SAMPLE: &str = r#"
[[bots]]
name = "analyst"
model = "claude-haiku-4-5"
api_key = "k-analyst"
persona = "A careful analyst."

[[bots]]
name = "creative"
model = "claude-haiku-4-5"
api_key = "k-creative"
api_base = "http://localhost:9000/v1/messages"

[bus]
mailbox_capacity = 8

[agent]
model_max_attempts = 5
retention = { kind = "token_budget", tokens = 2000 }

[multi_bot]
max_bot_rounds = 2

[supervisor]
max_restarts = 1
"#;

#[test]
fn config_parses_sections_and_keeps_defaults() {
    let cfg = GatewayConfig::from_toml_str(SAMPLE).unwrap();
    assert_eq!(cfg.bots.len(), 2);
    assert_eq!(cfg.bus.mailbox_capacity, 8);
    assert_eq!(cfg.agent.model_max_attempts, 5);
    assert_eq!(cfg.agent.retention, RetentionConfig::TokenBudget { tokens: 2000 });
    assert_eq!(cfg.agent.max_tool_iterations, AgentSettings::default().max_tool_iterations);
    assert_eq!(cfg.multi_bot.max_bot_rounds, 2);
    assert_eq!(cfg.supervisor.max_restarts, 1);
    assert_eq!(cfg.channel.id, "console");
}

#[test]
fn config_identities_carry_persona_and_endpoint() {
    let cfg = GatewayConfig::from_toml_str(SAMPLE).unwrap();
    let ids = cfg.identities().unwrap();
    assert_eq!(ids[0].name, "analyst");
    assert_eq!(ids[0].persona.as_deref(), Some("A careful analyst."));
    assert_eq!(ids[1].base_url.as_deref(), Some("http://localhost:9000/v1/messages"));
    assert!(ids[1].persona.is_none());
}

#[test]
fn config_duplicate_bot_names_are_fatal() {
    let toml = r#"
[[bots]]
name = "a"
model = "m"
api_key = "k"

[[bots]]
name = "a"
model = "m"
api_key = "k2"
"#;
    let cfg = GatewayConfig::from_toml_str(toml).unwrap();
    assert!(matches!(cfg.identities(), Err(Error::DuplicateBotName(_))));
}

#[test]
fn config_reads_credential_from_env() {
    std::env::set_var("CHORUSCLAW_TEST_KEY_XYZ", "from-env");
    let bot = BotConfig {
        name: "a".into(),
        model: "m".into(),
        api_key_env: Some("CHORUSCLAW_TEST_KEY_XYZ".into()),
        ..Default::default()
    };
    assert_eq!(bot.to_identity().unwrap().credential, "from-env");

    let missing = BotConfig {
        name: "b".into(),
        model: "m".into(),
        api_key_env: Some("CHORUSCLAW_TEST_KEY_UNSET_XYZ".into()),
        ..Default::default()
    };
    assert!(matches!(missing.to_identity(), Err(Error::MissingField { .. })));
}

#[test]
fn config_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(SAMPLE.as_bytes()).unwrap();
    let cfg = GatewayConfig::load(file.path()).unwrap();
    assert_eq!(cfg.bots.len(), 2);
}

#[test]
fn config_load_missing_file_is_config_error() {
    let err = GatewayConfig::load(std::path::Path::new("/nonexistent/chorusclaw.toml")).unwrap_err();
    assert!(matches!(err, Error::ConfigError(_)));
}

#[test]
fn mute_commands_match_case_insensitively() {
    let mb = MultiBotConfig::default();
    assert!(mb.is_mute_command("  Mute "));
    assert!(mb.is_mute_command("闭麦"));
    assert!(mb.is_unmute_command("UNMUTE"));
    assert!(!mb.is_mute_command("please mute the tv"));
}

#[test]
fn reply_delay_range_is_ordered() {
    let mb = MultiBotConfig {
        reply_delay_min_ms: 500,
        reply_delay_max_ms: 100,
        ..Default::default()
    };
    let (min, max) = mb.reply_delay_range();
    assert!(min <= max);
}
