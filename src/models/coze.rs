//! Native wire schema of the Coze v2 chat backend.
//!
//! The backend answers either with a single [`ChatResponse`] envelope or, in
//! streaming mode, with newline-delimited `data: {...}` SSE frames carrying a
//! [`StreamEvent`]. The event discriminator is a closed set; decoding an
//! unrecognized kind is an error, never a silent pass-through.

use serde::{Deserialize, Serialize};

/// Envelope status code meaning success.
pub const CODE_OK: i64 = 0;

/// Message `type` tag marking internal/verbose content that is suppressed
/// during stream translation.
pub const MSG_TYPE_VERBOSE: &str = "verbose";

/// Message `type` tag carrying the assistant's answer.
pub const MSG_TYPE_ANSWER: &str = "answer";

/// Outbound chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub bot_id: String,
    pub user: String,
    pub query: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chat_history: Vec<Message>,
    pub stream: bool,
}

/// One message on the wire, in requests and responses alike.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    pub content: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

fn default_content_type() -> String {
    "text".to_string()
}

/// Non-streaming response envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub conversation_id: String,
    pub code: i64,
    #[serde(default)]
    pub msg: String,
}

/// One streaming event, discriminated by the `event` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum StreamEvent {
    Message {
        message: Message,
        #[serde(default)]
        is_finish: bool,
        #[serde(default)]
        conversation_id: String,
    },
    Done {},
    Error {
        error_information: ErrorInformation,
    },
}

/// Payload of an `error` event.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorInformation {
    pub code: i64,
    #[serde(default)]
    pub msg: String,
}
