//! Protocol adapter for the Coze chat backend.
//!
//! Given a selected registry entry and a canonical request, the adapter
//! resolves credentials and the dispatch URL, POSTs the translated request,
//! and translates the reply back: either a single completion or, for
//! streaming calls, a sequence of flushed `data: {...}` frames produced by
//! the [`StreamTranslator`].

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use http::header;

use crate::config::{CRED_API_KEY, CRED_TOKEN};
use crate::conversion;
use crate::error::GatewayError;
use crate::models::chat;
use crate::models::coze;
use crate::registry::{ModelDetails, ServiceEntry};

/// Service identities with a fixed default endpoint.
pub const SERVICE_COZECN: &str = "cozecn";
pub const SERVICE_COZECOM: &str = "cozecom";

pub const DEFAULT_COZECN_URL: &str = "https://api.coze.cn/open_api/v2/chat";
pub const DEFAULT_COZECOM_URL: &str = "https://api.coze.com/open_api/v2/chat";

/// Marker prefixing every data-bearing SSE line.
const SSE_DATA_PREFIX: &str = "data:";

/// Where translated streaming frames go.
///
/// Implementations must flush on every write: the consumer has to observe
/// each chunk without added buffering delay. A write error means the consumer
/// is gone and the stream must stop promptly.
#[async_trait]
pub trait FrameSink: Send {
    async fn write_frame(&mut self, frame: Bytes) -> Result<(), GatewayError>;
}

/// Adapter instance, generic over nothing but holding the shared HTTP client.
#[derive(Clone)]
pub struct CozeAdapter {
    http: reqwest::Client,
}

impl CozeAdapter {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Non-streaming call: translate, dispatch, decode the envelope, map back.
    pub async fn complete(
        &self,
        details: &ModelDetails,
        req: &chat::ChatCompletionRequest,
    ) -> Result<chat::ChatCompletionResponse, GatewayError> {
        let resp = self.dispatch(details, req, false).await?;
        let body = resp.bytes().await?;

        let envelope: coze::ChatResponse = serde_json::from_slice(&body)
            .map_err(|e| GatewayError::Protocol(format!("malformed response envelope: {e}")))?;

        if envelope.code != coze::CODE_OK {
            return Err(GatewayError::Backend {
                code: envelope.code,
                message: envelope.msg.clone(),
            });
        }

        Ok(conversion::coze_to_chat_response(&envelope, &req.model))
    }

    /// Streaming call: translate, dispatch, then drive the line-oriented
    /// event stream through the translator, writing one flushed frame per
    /// emitted chunk.
    ///
    /// End-of-input without a `done`/`error` frame is treated as an implicit
    /// clean close; a failed read surfaces as [`GatewayError::Transport`].
    pub async fn stream(
        &self,
        details: &ModelDetails,
        req: &chat::ChatCompletionRequest,
        sink: &mut dyn FrameSink,
    ) -> Result<(), GatewayError> {
        let resp = self.dispatch(details, req, true).await?;

        let mut translator = StreamTranslator::new(&req.model);
        let mut scanner = LineScanner::default();
        let mut body = resp.bytes_stream();

        while let Some(read) = body.next().await {
            let bytes = read
                .map_err(|e| GatewayError::Transport(format!("stream read failed: {e}")))?;
            for line in scanner.push(&bytes) {
                match translator.translate_line(&line)? {
                    StreamStep::Emit(chunk) => {
                        let payload = serde_json::to_string(&chunk).map_err(|e| {
                            GatewayError::Protocol(format!("chunk serialization failed: {e}"))
                        })?;
                        sink.write_frame(Bytes::from(format!("data: {payload}\n\n")))
                            .await?;
                    }
                    StreamStep::Skip => {}
                    StreamStep::Done => return Ok(()),
                }
            }
        }

        Ok(())
    }

    async fn dispatch(
        &self,
        details: &ModelDetails,
        req: &chat::ChatCompletionRequest,
        stream: bool,
    ) -> Result<reqwest::Response, GatewayError> {
        let backend_model = details.entry.resolve_alias(&req.model);
        let mut coze_req = conversion::chat_to_coze_request(req, backend_model);
        coze_req.stream = stream;

        let url = resolve_url(details);
        tracing::debug!(
            service = details.service.as_str(),
            url,
            bot_id = coze_req.bot_id.as_str(),
            stream,
            "dispatching backend request"
        );

        let mut rb = self
            .http
            .post(url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&coze_req);
        if stream {
            rb = rb.header(header::ACCEPT, "text/event-stream");
        }
        if let Some(token) = resolve_credential(&details.entry) {
            rb = rb.bearer_auth(token);
        }

        Ok(rb.send().await?)
    }
}

/// Primary credential slot first, token slot as fallback. Empty values count
/// as absent; with neither present the request goes out unauthenticated and
/// the backend's envelope reports the failure.
fn resolve_credential(entry: &ServiceEntry) -> Option<&str> {
    entry
        .credentials
        .get(CRED_API_KEY)
        .filter(|v| !v.is_empty())
        .or_else(|| entry.credentials.get(CRED_TOKEN).filter(|v| !v.is_empty()))
        .map(String::as_str)
}

/// Entry override wins; otherwise the default endpoint for the service
/// identity. Unknown identities fall back to the cn endpoint.
fn resolve_url(details: &ModelDetails) -> &str {
    if let Some(url) = details.entry.server_url.as_deref() {
        return url;
    }
    match details.service.as_str() {
        SERVICE_COZECOM => DEFAULT_COZECOM_URL,
        _ => DEFAULT_COZECN_URL,
    }
}

/// Outcome of translating one stream line.
#[derive(Debug)]
pub enum StreamStep {
    /// A canonical chunk to serialize and flush.
    Emit(chat::ChatCompletionChunk),
    /// Nothing to emit (separator line, verbose content).
    Skip,
    /// Clean end of stream; nothing further may be emitted.
    Done,
}

/// Parses data-bearing SSE lines into canonical incremental chunks.
///
/// The translator starts in a streaming state and moves to a terminal state
/// on a `done` or `error` frame; unknown or malformed data lines are a
/// protocol error. Lines without the data marker are separators and carry
/// nothing.
pub struct StreamTranslator {
    requested_model: String,
    emitted: usize,
}

impl StreamTranslator {
    pub fn new(requested_model: &str) -> Self {
        Self {
            requested_model: requested_model.to_string(),
            emitted: 0,
        }
    }

    pub fn translate_line(&mut self, line: &str) -> Result<StreamStep, GatewayError> {
        let Some(payload) = line.strip_prefix(SSE_DATA_PREFIX) else {
            return Ok(StreamStep::Skip);
        };
        let payload = payload.trim();
        if payload.is_empty() {
            return Ok(StreamStep::Skip);
        }

        let event: coze::StreamEvent = serde_json::from_str(payload)
            .map_err(|e| GatewayError::Protocol(format!("unrecognized stream event: {e}")))?;

        match event {
            coze::StreamEvent::Message {
                message,
                conversation_id,
                ..
            } => {
                if message.kind == coze::MSG_TYPE_VERBOSE {
                    return Ok(StreamStep::Skip);
                }
                let chunk = conversion::coze_message_to_chat_chunk(
                    &message,
                    &conversation_id,
                    &self.requested_model,
                    self.emitted == 0,
                );
                self.emitted += 1;
                Ok(StreamStep::Emit(chunk))
            }
            coze::StreamEvent::Done {} => Ok(StreamStep::Done),
            coze::StreamEvent::Error { error_information } => Err(GatewayError::Backend {
                code: error_information.code,
                message: error_information.msg,
            }),
        }
    }
}

/// Splits a byte stream into complete lines across chunk boundaries.
#[derive(Default)]
struct LineScanner {
    buf: Vec<u8>,
}

impl LineScanner {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }
}
