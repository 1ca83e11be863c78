use actix_web::HttpResponse;
use http::StatusCode;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::GatewayError;

/// Initialize dotenv and structured tracing based on RUST_LOG.
///
/// The configured `debug` flag raises the default filter to debug; an
/// explicit RUST_LOG always wins.
pub fn init_tracing(debug: bool) {
    let _ = dotenvy::dotenv();

    let default_filter = if debug { "debug" } else { "info" };
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into());
    let subscriber = fmt().with_env_filter(EnvFilter::new(filter)).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Shared application state used by the HTTP server and handlers.
pub struct AppState {
    pub registry: std::sync::Arc<crate::registry::Registry>,
    pub adapter: crate::coze::CozeAdapter,
    /// Gateway-level inbound API key; when set, callers must present it.
    pub api_key: Option<String>,
}

impl AppState {
    pub fn from_config(config: &crate::config::Configuration) -> Self {
        Self {
            registry: std::sync::Arc::new(crate::registry::Registry::build(config)),
            adapter: crate::coze::CozeAdapter::new(build_http_client_from_env()),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
        }
    }
}

/// Build an HTTP client honoring proxy and timeout environment variables.
///
/// Environment:
/// - UNIGATE_NO_PROXY = 1|true|yes|on  -> disable all proxies
/// - UNIGATE_HTTP_TIMEOUT_SECONDS      -> overall request timeout (u64)
pub fn build_http_client_from_env() -> reqwest::Client {
    let mut builder = reqwest::Client::builder();

    if let Ok(secs) = std::env::var("UNIGATE_HTTP_TIMEOUT_SECONDS") {
        if let Ok(n) = secs.trim().parse::<u64>() {
            builder = builder.timeout(std::time::Duration::from_secs(n));
        }
    }

    let no_proxy = std::env::var("UNIGATE_NO_PROXY")
        .map(|v| v.trim().to_ascii_lowercase())
        .map(|v| v == "1" || v == "true" || v == "yes" || v == "on")
        .unwrap_or(false);
    if no_proxy {
        builder = builder.no_proxy();
    }

    // User-Agent for observability
    builder = builder.user_agent(format!("unigate/{}", env!("CARGO_PKG_VERSION")));

    builder.build().unwrap_or_else(|_| reqwest::Client::new())
}

/// Build a JSON error response with the given HTTP status and message.
pub fn error_response(status: StatusCode, msg: &str) -> HttpResponse {
    let body = serde_json::json!({ "error": { "message": msg } });
    HttpResponse::build(actix_web::http::StatusCode::from_u16(status.as_u16()).unwrap()).json(body)
}

/// Map a gateway failure onto the serving surface.
pub fn gateway_error_response(err: &GatewayError) -> HttpResponse {
    error_response(err.status_code(), &err.to_string())
}

/// Build a CORS configuration from environment variables.
///
/// Environment variables:
/// - CORS_ALLOWED_ORIGINS: "*" or comma-separated origins
/// - CORS_MAX_AGE: max age in seconds (usize)
///
/// Defaults are permissive when not configured.
pub fn cors_config_from_env() -> actix_cors::Cors {
    let mut cors = actix_cors::Cors::default()
        .allow_any_method()
        .allow_any_header();

    if let Ok(origins) = std::env::var("CORS_ALLOWED_ORIGINS") {
        let s = origins.trim();
        if s == "*" {
            cors = cors.allow_any_origin();
        } else {
            for part in s.split(',') {
                let p = part.trim();
                if !p.is_empty() {
                    cors = cors.allowed_origin(p);
                }
            }
        }
    } else {
        cors = cors.allow_any_origin();
    }

    if let Ok(secs) = std::env::var("CORS_MAX_AGE") {
        if let Ok(n) = secs.trim().parse::<usize>() {
            cors = cors.max_age(n);
        }
    }

    cors
}
