//! JSON line schemas emitted by provider CLIs.
//!
//! Three init shapes are recognized for session-ID capture:
//! - Claude: `{"type":"system","subtype":"init","session_id":"..."}`
//! - Codex:  `{"type":"thread.started","thread_id":"..."}`
//! - Gemini: `{"type":"init","session_id":"..."}`

use serde::Deserialize;
use serde_json::Value;

/// Events from a provider's stream-json output.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "system")]
    System {
        subtype: String,
        #[serde(default)]
        session_id: Option<String>,
    },

    #[serde(rename = "thread.started")]
    ThreadStarted { thread_id: String },

    #[serde(rename = "init")]
    Init {
        #[serde(default)]
        session_id: Option<String>,
    },

    #[serde(rename = "assistant")]
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: String,
    },

    #[serde(rename = "result")]
    Result {
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
    },

    #[serde(rename = "user")]
    User {},
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        input: Value,
        #[serde(default)]
        id: String,
    },
}

/// Extract the session/thread ID if this line is an init message.
///
/// Works on the raw line rather than `StreamEvent` so malformed or
/// unrecognized lines never disturb the stream pump.
pub fn extract_session_id(json_line: &str) -> Option<String> {
    let msg: Value = serde_json::from_str(json_line).ok()?;
    let msg_type = msg.get("type")?.as_str()?;

    match msg_type {
        "system" if msg.get("subtype").and_then(Value::as_str) == Some("init") => msg
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_string),
        "thread.started" => msg
            .get("thread_id")
            .and_then(Value::as_str)
            .map(str::to_string),
        "init" => msg
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

/// Pull assistant text out of a stream line, if any.
pub fn extract_text(json_line: &str) -> Option<String> {
    let event: StreamEvent = serde_json::from_str(json_line).ok()?;
    match event {
        StreamEvent::Assistant { message, .. } => {
            let mut out = String::new();
            for block in message.content {
                if let ContentBlock::Text { text } = block {
                    out.push_str(&text);
                    out.push('\n');
                }
            }
            if out.is_empty() { None } else { Some(out) }
        }
        StreamEvent::Result {
            result: Some(result),
            ..
        } => Some(result),
        _ => None,
    }
}
