#![forbid(unsafe_code)]
#![doc = r#"
Unigate

Route canonical Chat Completions requests across a configurable set of LLM
backend services, each with its own wire protocol, credentials, and limits.

Crate highlights
- Registry: immutable model-name → backend-entry index built once from the
  configuration document, with per-entry rate/concurrency governance.
- Adapter: request/response translation for the Coze chat backend, including
  incrementally streamed responses.
- HTTP server (in `server`): `/v1/chat/completions`, `/v1/models`, `/status`.

Modules
- `config`: Configuration document and strategy parsing.
- `registry`: Model index, lookup and selection.
- `governor`: Token bucket / permit pool / unlimited acquire.
- `models`: Data structures for the canonical and backend shapes.
- `conversion`: Mapping logic between the two.
- `coze`: Backend dispatch and the streaming translator.
- `server`: Actix router/handlers (the binary uses this).
- `util`: Shared helpers (tracing, HTTP client, error responses, CORS).
"#]

pub mod config;
pub mod conversion;
pub mod coze;
pub mod error;
pub mod governor;
pub mod models;
pub mod registry;
pub mod server;
pub mod util;

// Re-export the primary types for ergonomic library use.
pub use crate::config::{Configuration, Limit, LoadBalanceStrategy, ServiceConfig};
pub use crate::coze::{CozeAdapter, FrameSink, StreamStep, StreamTranslator};
pub use crate::error::GatewayError;
pub use crate::governor::{Governor, Permit};
pub use crate::registry::{ModelDetails, Registry, ServiceEntry};

// Re-export model namespaces for convenience (downstream users can do `use unigate::chat`).
pub use crate::models::{chat, coze as coze_models};
