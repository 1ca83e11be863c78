//! Actix-web surface of the gateway.
//!
//! One request flow: registry lookup by model, strategy selection, governor
//! acquire, then adapter dispatch. Streaming responses hold their permit for
//! the entire stream and release it when the flow ends, including on client
//! disconnect.

use actix_web::{web, HttpRequest, HttpResponse, Responder};
use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use tokio::sync::mpsc;

use crate::coze::FrameSink;
use crate::error::GatewayError;
use crate::models::chat::ChatCompletionRequest;
use crate::registry::ModelDetails;
use crate::util::{error_response, gateway_error_response, AppState};

/// Requesting this model name picks a uniformly random enabled entry and one
/// of its aliases.
const MODEL_RANDOM: &str = "random";

pub fn config_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("")
            .route("/status", web::get().to(status))
            .route("/v1/models", web::get().to(list_models))
            .route("/v1/chat/completions", web::post().to(chat_completions)),
    );
}

async fn status(state: web::Data<AppState>) -> impl Responder {
    web::Json(serde_json::json!({
        "status": "ok",
        "models": state.registry.model_names().count(),
        "strategy": state.registry.strategy(),
    }))
}

async fn list_models(state: web::Data<AppState>) -> impl Responder {
    let mut names: Vec<&str> = state.registry.model_names().collect();
    names.sort_unstable();
    let data: Vec<serde_json::Value> = names
        .into_iter()
        .map(|id| {
            serde_json::json!({
                "id": id,
                "object": "model",
                "owned_by": "unigate",
            })
        })
        .collect();
    web::Json(serde_json::json!({ "object": "list", "data": data }))
}

async fn chat_completions(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<ChatCompletionRequest>,
) -> HttpResponse {
    if let Some(resp) = check_inbound_auth(state.get_ref(), &req) {
        return resp;
    }

    let mut chat_req = body.into_inner();
    if chat_req.messages.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "messages must not be empty");
    }

    let details = match select_entry(state.get_ref(), &mut chat_req) {
        Ok(details) => details,
        Err(e) => {
            tracing::debug!(model = chat_req.model.as_str(), error = %e, "lookup failed");
            return gateway_error_response(&e);
        }
    };

    let permit = match details.entry.governor.acquire(details.entry.timeout).await {
        Ok(permit) => permit,
        Err(e) => {
            tracing::warn!(
                model = chat_req.model.as_str(),
                service = details.service.as_str(),
                error = %e,
                "acquire failed"
            );
            return gateway_error_response(&e);
        }
    };

    if chat_req.wants_stream() {
        stream_completion(state, details, chat_req, permit)
    } else {
        let result = state.adapter.complete(&details, &chat_req).await;
        permit.release();
        match result {
            Ok(resp) => HttpResponse::Ok().json(resp),
            Err(e) => {
                tracing::warn!(model = chat_req.model.as_str(), error = %e, "completion failed");
                gateway_error_response(&e)
            }
        }
    }
}

/// Resolve the entry serving this request. The `"random"` model name picks
/// any enabled entry and rewrites the request to one of its aliases.
fn select_entry(
    state: &AppState,
    chat_req: &mut ChatCompletionRequest,
) -> Result<ModelDetails, GatewayError> {
    if chat_req.model == MODEL_RANDOM {
        let (details, model) = state.registry.random_enabled_alias()?;
        tracing::debug!(model = model.as_str(), "random model resolved");
        chat_req.model = model;
        return Ok(details);
    }
    state
        .registry
        .lookup_enabled(&chat_req.model, state.registry.strategy())
}

fn check_inbound_auth(state: &AppState, req: &HttpRequest) -> Option<HttpResponse> {
    let expected = state.api_key.as_deref()?;
    let presented = req
        .headers()
        .get(actix_web::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented == Some(expected) {
        None
    } else {
        Some(error_response(
            StatusCode::UNAUTHORIZED,
            "invalid or missing api key",
        ))
    }
}

/// Drive a streaming completion.
///
/// The adapter runs in a spawned task writing flushed frames into a bounded
/// channel; the response body drains it. Dropping the body (client
/// disconnect) makes the next write fail, which stops the adapter promptly;
/// the permit is held by the task and released whenever it ends.
fn stream_completion(
    state: web::Data<AppState>,
    details: ModelDetails,
    chat_req: ChatCompletionRequest,
    permit: crate::governor::Permit,
) -> HttpResponse {
    let (tx, mut rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(16);

    tokio::spawn(async move {
        let mut sink = ChannelSink { tx };
        if let Err(e) = state.adapter.stream(&details, &chat_req, &mut sink).await {
            tracing::warn!(
                model = chat_req.model.as_str(),
                service = details.service.as_str(),
                error = %e,
                "streaming flow aborted"
            );
            // Abort the transfer; frames already flushed are not retracted.
            let _ = sink.tx.send(Err(std::io::Error::other(e.to_string()))).await;
        }
        permit.release();
    });

    let body = futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx));
    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("cache-control", "no-cache"))
        .streaming(body)
}

/// Frame sink backed by the response body channel. Every send is observable
/// by the consumer immediately; a closed channel means the consumer is gone.
struct ChannelSink {
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn write_frame(&mut self, frame: Bytes) -> Result<(), GatewayError> {
        self.tx
            .send(Ok(frame))
            .await
            .map_err(|_| GatewayError::Transport("consumer disconnected".to_string()))
    }
}
