use actix_web::{test, web, App};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::{json, Value};
use std::io::Write;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use unigate::config::{Configuration, LoadBalanceStrategy};
use unigate::error::GatewayError;
use unigate::models::chat::{ChatCompletionRequest, ChatMessage};
use unigate::registry::Registry;
use unigate::server::config_routes;
use unigate::util::AppState;
use unigate::{CozeAdapter, FrameSink};

#[derive(Clone)]
struct UpstreamState {
    requests: Arc<AsyncMutex<Vec<(Option<String>, Value)>>>,
    response: Arc<AsyncMutex<Value>>,
    sse_frames: Arc<AsyncMutex<Vec<String>>>,
}

async fn handle_chat(
    State(state): State<UpstreamState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> axum::response::Response {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let wants_stream = payload
        .get("stream")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    state.requests.lock().await.push((auth, payload));

    if wants_stream {
        let frames = state.sse_frames.lock().await.clone();
        let body = frames
            .iter()
            .map(|f| format!("data:{f}\n"))
            .collect::<String>();
        ([("content-type", "text/event-stream")], body).into_response()
    } else {
        let response = state.response.lock().await.clone();
        Json(response).into_response()
    }
}

struct MockUpstream {
    chat_url: String,
    requests: Arc<AsyncMutex<Vec<(Option<String>, Value)>>>,
    join: JoinHandle<()>,
}

impl MockUpstream {
    async fn start(response: Value, sse_frames: Vec<String>) -> Self {
        let requests = Arc::new(AsyncMutex::new(Vec::new()));
        let state = UpstreamState {
            requests: requests.clone(),
            response: Arc::new(AsyncMutex::new(response)),
            sse_frames: Arc::new(AsyncMutex::new(sse_frames)),
        };

        let app = Router::new()
            .route("/open_api/v2/chat", post(handle_chat))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind upstream");
        let addr = listener.local_addr().expect("local addr");
        let chat_url = format!("http://{}/open_api/v2/chat", addr);

        let join = tokio::spawn(async move {
            axum::serve(listener, app)
                .await
                .expect("upstream server error");
        });

        Self {
            chat_url,
            requests,
            join,
        }
    }

    async fn last_request(&self) -> (Option<String>, Value) {
        let guard = self.requests.lock().await;
        guard.last().cloned().unwrap_or((None, json!({})))
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.join.abort();
    }
}

fn gateway_config(chat_url: &str, limit: Value, api_key: Option<&str>) -> Configuration {
    let mut doc = json!({
        "load_balancing": "first",
        "services": {
            "cozecn": [{
                "models": ["gpt-4"],
                "enabled": true,
                "credentials": { "token": "secret-token" },
                "server_url": chat_url,
                "model_map": { "gpt-4": "bot-1234" },
                "limit": limit
            }]
        }
    });
    if let Some(key) = api_key {
        doc["api_key"] = json!(key);
    }
    serde_json::from_value(doc).expect("valid config")
}

fn answer_envelope(content: &str) -> Value {
    json!({
        "messages": [
            { "role": "assistant", "type": "verbose", "content": "{\"internal\":true}", "content_type": "text" },
            { "role": "assistant", "type": "answer", "content": content, "content_type": "text" }
        ],
        "conversation_id": "conv-42",
        "code": 0,
        "msg": ""
    })
}

fn chat_body(model: &str, stream: bool) -> Value {
    json!({
        "model": model,
        "messages": [
            { "role": "user", "content": "hello there" }
        ],
        "stream": stream
    })
}

#[actix_web::test]
async fn non_streaming_translates_and_overwrites_model() {
    let upstream = MockUpstream::start(answer_envelope("well hello"), vec![]).await;
    let config = gateway_config(&upstream.chat_url, json!({}), None);
    let state = web::Data::new(AppState::from_config(&config));

    let app = test::init_service(
        App::new()
            .app_data(state.clone())
            .configure(config_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(chat_body("gpt-4", false))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["model"], "gpt-4");
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "well hello");
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(body["id"], "conv-42");

    // The upstream saw the resolved backend model and the token credential.
    let (auth, payload) = upstream.last_request().await;
    assert_eq!(auth.as_deref(), Some("Bearer secret-token"));
    assert_eq!(payload["bot_id"], "bot-1234");
    assert_eq!(payload["query"], "hello there");
    assert_eq!(payload["stream"], false);
}

#[actix_web::test]
async fn backend_envelope_failure_maps_to_bad_gateway() {
    let upstream = MockUpstream::start(
        json!({ "messages": [], "conversation_id": "", "code": 700, "msg": "bot not published" }),
        vec![],
    )
    .await;
    let config = gateway_config(&upstream.chat_url, json!({}), None);
    let state = web::Data::new(AppState::from_config(&config));

    let app = test::init_service(
        App::new()
            .app_data(state.clone())
            .configure(config_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(chat_body("gpt-4", false))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 502);

    let body: Value = test::read_body_json(resp).await;
    let message = body["error"]["message"].as_str().unwrap_or_default();
    assert!(message.contains("700"), "unexpected message: {message}");
    assert!(message.contains("bot not published"));
}

#[actix_web::test]
async fn unknown_and_disabled_models_are_distinct_failures() {
    let upstream = MockUpstream::start(answer_envelope("x"), vec![]).await;
    let mut config = gateway_config(&upstream.chat_url, json!({}), None);
    config.services.get_mut("cozecn").unwrap()[0].enabled = false;
    let state = web::Data::new(AppState::from_config(&config));

    let app = test::init_service(
        App::new()
            .app_data(state.clone())
            .configure(config_routes),
    )
    .await;

    // Declared but disabled.
    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(chat_body("gpt-4", false))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 503);

    // Not declared at all.
    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(chat_body("gpt-5", false))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}

#[actix_web::test]
async fn inbound_api_key_is_enforced() {
    let upstream = MockUpstream::start(answer_envelope("ok"), vec![]).await;
    let config = gateway_config(&upstream.chat_url, json!({}), Some("sk-gateway"));
    let state = web::Data::new(AppState::from_config(&config));

    let app = test::init_service(
        App::new()
            .app_data(state.clone())
            .configure(config_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(chat_body("gpt-4", false))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .insert_header(("authorization", "Bearer sk-gateway"))
        .set_json(chat_body("gpt-4", false))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
}

#[actix_web::test]
async fn qps_limit_rejects_third_request_in_window() {
    let upstream = MockUpstream::start(answer_envelope("ok"), vec![]).await;
    // qps = 2 with a zero deadline: the first two requests in a window pass,
    // the third fails fast instead of queuing.
    let config = gateway_config(&upstream.chat_url, json!({ "qps": 2, "timeout": 0 }), None);
    let state = web::Data::new(AppState::from_config(&config));

    let app = test::init_service(
        App::new()
            .app_data(state.clone())
            .configure(config_routes),
    )
    .await;

    for _ in 0..2 {
        let req = test::TestRequest::post()
            .uri("/v1/chat/completions")
            .set_json(chat_body("gpt-4", false))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
    }

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(chat_body("gpt-4", false))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 429);
}

#[actix_web::test]
async fn streaming_emits_flushed_chunks_and_suppresses_verbose() {
    let frames = vec![
        r#"{"event":"message","message":{"role":"assistant","type":"answer","content":"Hel","content_type":"text"},"is_finish":false,"conversation_id":"conv-9"}"#.to_string(),
        r#"{"event":"message","message":{"role":"assistant","type":"verbose","content":"{\"plugin\":\"x\"}","content_type":"text"},"is_finish":false,"conversation_id":"conv-9"}"#.to_string(),
        r#"{"event":"message","message":{"role":"assistant","type":"answer","content":"lo","content_type":"text"},"is_finish":false,"conversation_id":"conv-9"}"#.to_string(),
        r#"{"event":"done"}"#.to_string(),
    ];
    let upstream = MockUpstream::start(json!({}), frames).await;
    let config = gateway_config(&upstream.chat_url, json!({}), None);
    let state = web::Data::new(AppState::from_config(&config));

    let app = test::init_service(
        App::new()
            .app_data(state.clone())
            .configure(config_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(chat_body("gpt-4", true))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    assert_eq!(
        resp.headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );

    let body = test::read_body(resp).await;
    let text = String::from_utf8(body.to_vec()).expect("utf8 body");
    let chunks: Vec<Value> = text
        .split("\n\n")
        .filter(|frame| !frame.trim().is_empty())
        .map(|frame| {
            let payload = frame.strip_prefix("data: ").expect("data frame");
            serde_json::from_str(payload).expect("chunk json")
        })
        .collect();

    // Exactly two chunks: the verbose frame is suppressed, nothing follows done.
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0]["model"], "gpt-4");
    assert_eq!(chunks[0]["object"], "chat.completion.chunk");
    assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
    assert_eq!(chunks[0]["choices"][0]["delta"]["content"], "Hel");
    assert_eq!(chunks[1]["choices"][0]["delta"]["content"], "lo");
    assert!(chunks[1]["choices"][0]["delta"]["role"].is_null());
}

struct CollectSink {
    frames: Vec<Bytes>,
}

#[async_trait::async_trait]
impl FrameSink for CollectSink {
    async fn write_frame(&mut self, frame: Bytes) -> Result<(), GatewayError> {
        self.frames.push(frame);
        Ok(())
    }
}

#[tokio::test]
async fn streaming_error_frame_aborts_after_flushed_output() {
    let frames = vec![
        r#"{"event":"message","message":{"role":"assistant","type":"answer","content":"A","content_type":"text"},"is_finish":false,"conversation_id":"conv-1"}"#.to_string(),
        r#"{"event":"error","error_information":{"code":7,"msg":"x"}}"#.to_string(),
    ];
    let upstream = MockUpstream::start(json!({}), frames).await;
    let config = gateway_config(&upstream.chat_url, json!({}), None);
    let registry = Registry::build(&config);
    let details = registry
        .lookup_enabled("gpt-4", LoadBalanceStrategy::First)
        .expect("entry");

    let adapter = CozeAdapter::new(reqwest::Client::new());
    let req = ChatCompletionRequest {
        model: "gpt-4".to_string(),
        messages: vec![ChatMessage {
            role: "user".to_string(),
            content: "hi".to_string(),
        }],
        stream: Some(true),
    };

    let mut sink = CollectSink { frames: vec![] };
    let res = adapter.stream(&details, &req, &mut sink).await;

    match res {
        Err(GatewayError::Backend { code, message }) => {
            assert_eq!(code, 7);
            assert_eq!(message, "x");
        }
        other => panic!("expected backend error, got {other:?}"),
    }
    // The chunk flushed before the error frame stays flushed.
    assert_eq!(sink.frames.len(), 1);
    let text = String::from_utf8(sink.frames[0].to_vec()).expect("utf8");
    assert!(text.starts_with("data: "));
    assert!(text.ends_with("\n\n"));
}

#[tokio::test]
async fn stream_eof_without_done_is_a_clean_close() {
    let frames = vec![
        r#"{"event":"message","message":{"role":"assistant","type":"answer","content":"partial","content_type":"text"},"is_finish":false,"conversation_id":"conv-1"}"#.to_string(),
    ];
    let upstream = MockUpstream::start(json!({}), frames).await;
    let config = gateway_config(&upstream.chat_url, json!({}), None);
    let registry = Registry::build(&config);
    let details = registry
        .lookup_enabled("gpt-4", LoadBalanceStrategy::First)
        .expect("entry");

    let adapter = CozeAdapter::new(reqwest::Client::new());
    let req = ChatCompletionRequest {
        model: "gpt-4".to_string(),
        messages: vec![ChatMessage {
            role: "user".to_string(),
            content: "hi".to_string(),
        }],
        stream: Some(true),
    };

    let mut sink = CollectSink { frames: vec![] };
    adapter
        .stream(&details, &req, &mut sink)
        .await
        .expect("implicit clean close");
    assert_eq!(sink.frames.len(), 1);
}

#[actix_web::test]
async fn models_endpoint_lists_declared_names() {
    let upstream = MockUpstream::start(answer_envelope("x"), vec![]).await;
    let config = gateway_config(&upstream.chat_url, json!({}), None);
    let state = web::Data::new(AppState::from_config(&config));

    let app = test::init_service(
        App::new()
            .app_data(state.clone())
            .configure(config_routes),
    )
    .await;

    let req = test::TestRequest::get().uri("/v1/models").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["object"], "list");
    assert_eq!(body["data"][0]["id"], "gpt-4");
}

#[::core::prelude::v1::test]
fn configuration_loads_from_json_file() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    write!(
        file,
        r#"{{
            "server_port": 9191,
            "load_balancing": "first",
            "services": {{
                "cozecn": [{{ "models": ["gpt-4"], "credentials": {{ "api_key": "k" }} }}]
            }}
        }}"#
    )
    .expect("write config");

    let config = Configuration::load_from_file(file.path()).expect("load");
    assert_eq!(config.bind_addr(), "0.0.0.0:9191");
    assert_eq!(config.strategy(), LoadBalanceStrategy::First);
    assert_eq!(config.services["cozecn"][0].models, vec!["gpt-4"]);

    let missing = Configuration::load_from_file("/definitely/not/there.json");
    assert!(matches!(missing, Err(GatewayError::Config(_))));
}
