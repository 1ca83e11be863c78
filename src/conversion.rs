//! Mapping logic between the canonical Chat Completions shapes and the
//! backend's native schema.
//!
//! These functions are pure: dispatch and streaming live in [`crate::coze`].
//! The `model` field of everything returned to the caller carries the
//! *originally requested* model name, never the resolved backend name.

use crate::models::chat;
use crate::models::coze;

/// Convert a canonical request into the backend's chat request.
///
/// The resolved backend model becomes the `bot_id`. The last user message is
/// the `query`; everything before it becomes `chat_history`.
pub fn chat_to_coze_request(req: &chat::ChatCompletionRequest, bot_id: &str) -> coze::ChatRequest {
    let query_idx = req
        .messages
        .iter()
        .rposition(|m| m.role == "user")
        .unwrap_or(req.messages.len().saturating_sub(1));

    let query = req
        .messages
        .get(query_idx)
        .map(|m| m.content.clone())
        .unwrap_or_default();

    let chat_history = req
        .messages
        .iter()
        .take(query_idx)
        .map(|m| coze::Message {
            role: m.role.clone(),
            kind: if m.role == "assistant" {
                coze::MSG_TYPE_ANSWER.to_string()
            } else {
                String::new()
            },
            content: m.content.clone(),
            content_type: "text".to_string(),
        })
        .collect();

    coze::ChatRequest {
        bot_id: bot_id.to_string(),
        user: uuid::Uuid::new_v4().to_string(),
        query,
        chat_history,
        stream: req.wants_stream(),
    }
}

/// Convert a successful backend envelope into a canonical completion.
///
/// Only `answer`-typed messages carry the assistant's reply; verbose and
/// other internal messages are dropped.
pub fn coze_to_chat_response(
    resp: &coze::ChatResponse,
    requested_model: &str,
) -> chat::ChatCompletionResponse {
    let content = resp
        .messages
        .iter()
        .filter(|m| m.kind == coze::MSG_TYPE_ANSWER)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("");

    let id = if resp.conversation_id.is_empty() {
        format!("chatcmpl-{}", uuid::Uuid::new_v4())
    } else {
        resp.conversation_id.clone()
    };

    chat::ChatCompletionResponse {
        id,
        object: "chat.completion".to_string(),
        created: chat::unix_timestamp(),
        model: requested_model.to_string(),
        choices: vec![chat::ChatChoice {
            index: 0,
            message: chat::ChatMessage {
                role: "assistant".to_string(),
                content,
            },
            finish_reason: Some("stop".to_string()),
        }],
    }
}

/// Convert one streaming `message` event into a canonical chunk.
///
/// The `role` is only set on the first delta of a stream, matching how
/// downstream consumers accumulate chunks.
pub fn coze_message_to_chat_chunk(
    message: &coze::Message,
    conversation_id: &str,
    requested_model: &str,
    is_first: bool,
) -> chat::ChatCompletionChunk {
    let id = if conversation_id.is_empty() {
        format!("chatcmpl-{}", uuid::Uuid::new_v4())
    } else {
        conversation_id.to_string()
    };

    chat::ChatCompletionChunk {
        id,
        object: "chat.completion.chunk".to_string(),
        created: chat::unix_timestamp(),
        model: requested_model.to_string(),
        choices: vec![chat::ChatChunkChoice {
            index: 0,
            delta: chat::ChatDelta {
                role: is_first.then(|| "assistant".to_string()),
                content: Some(message.content.clone()),
            },
            finish_reason: None,
        }],
    }
}
