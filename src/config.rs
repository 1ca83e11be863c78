//! Configuration document for the gateway.
//!
//! The document declares services as `service identity → list of entries`,
//! where each entry carries its model aliases, credentials, an optional
//! server URL override, a model alias map, and a limit block. Parsing happens
//! once at startup; the resulting [`Configuration`] is handed to
//! [`crate::registry::Registry::build`] and never mutated afterwards.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Credential slot holding an API key.
pub const CRED_API_KEY: &str = "api_key";
/// Credential slot holding a bearer token; consulted when `api_key` is absent.
pub const CRED_TOKEN: &str = "token";

/// Applied when an entry declares no `limit.timeout` of its own.
pub const DEFAULT_LIMIT_TIMEOUT_SECS: u64 = 10;

/// Listen port used when `server_port` is not declared.
pub const DEFAULT_SERVER_PORT: u16 = 9090;

/// Rate/concurrency limit block for one entry.
///
/// At most one of `qps`/`qpm`/`concurrency` is meaningful; the governor picks
/// the active mode by priority qps > qpm > concurrency > none. `timeout` is
/// the acquire deadline in seconds: absent means the 10 s default, while an
/// explicit `0` means fail-fast.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Limit {
    #[serde(default)]
    pub qps: u32,
    #[serde(default)]
    pub qpm: u32,
    #[serde(default)]
    pub concurrency: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl Limit {
    /// Acquire deadline, applying the default for unset timeouts.
    pub fn effective_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.unwrap_or(DEFAULT_LIMIT_TIMEOUT_SECS))
    }
}

/// One declared backend entry under a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Alias names this entry serves.
    pub models: Vec<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Credential slots (`api_key`, `token`, ...). Values are secrets and must
    /// never be logged or echoed in errors.
    #[serde(default)]
    pub credentials: HashMap<String, String>,

    /// Overrides the backend's default endpoint when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,

    /// Requested model name → backend model name.
    #[serde(default)]
    pub model_map: HashMap<String, String>,

    #[serde(default)]
    pub limit: Limit,
}

fn default_true() -> bool {
    true
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_port: Option<u16>,

    #[serde(default)]
    pub debug: bool,

    /// Gateway-level inbound API key. When set, callers must present it as a
    /// bearer token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Load-balancing strategy name; resolved once via
    /// [`LoadBalanceStrategy::from_name`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancing: Option<String>,

    /// Service identity → declared entries.
    #[serde(default)]
    pub services: HashMap<String, Vec<ServiceConfig>>,
}

impl Configuration {
    /// Load the configuration document from a JSON file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, GatewayError> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            GatewayError::Config(format!(
                "cannot read {}: {e}",
                path.as_ref().display()
            ))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| GatewayError::Config(format!("malformed configuration: {e}")))
    }

    /// Strategy declared in the document, resolved with the default policy.
    pub fn strategy(&self) -> LoadBalanceStrategy {
        LoadBalanceStrategy::from_name(self.load_balancing.as_deref())
    }

    /// Address the HTTP server binds to.
    pub fn bind_addr(&self) -> String {
        format!("0.0.0.0:{}", self.server_port.unwrap_or(DEFAULT_SERVER_PORT))
    }
}

/// Load-balancing strategy over the enabled entries for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadBalanceStrategy {
    /// First enabled entry in declaration order; stable across calls.
    First,
    /// Uniform random among the enabled entries.
    #[default]
    Random,
}

impl LoadBalanceStrategy {
    /// Resolve a configured strategy name. Unset resolves to `Random`;
    /// unrecognized names also resolve to `Random`, with a warning, so a typo
    /// in the document degrades loudly instead of silently picking `First`.
    pub fn from_name(name: Option<&str>) -> Self {
        match name.map(str::trim) {
            None | Some("") => LoadBalanceStrategy::Random,
            Some("first") => LoadBalanceStrategy::First,
            Some("random") => LoadBalanceStrategy::Random,
            Some(other) => {
                tracing::warn!(
                    strategy = other,
                    "unrecognized load_balancing strategy; defaulting to random"
                );
                LoadBalanceStrategy::Random
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_name_resolution() {
        assert_eq!(
            LoadBalanceStrategy::from_name(Some("first")),
            LoadBalanceStrategy::First
        );
        assert_eq!(
            LoadBalanceStrategy::from_name(Some("random")),
            LoadBalanceStrategy::Random
        );
        assert_eq!(
            LoadBalanceStrategy::from_name(None),
            LoadBalanceStrategy::Random
        );
        // Unrecognized names degrade to random, not first.
        assert_eq!(
            LoadBalanceStrategy::from_name(Some("round_robin")),
            LoadBalanceStrategy::Random
        );
    }

    #[test]
    fn effective_timeout_defaults_and_zero() {
        let unset = Limit::default();
        assert_eq!(
            unset.effective_timeout(),
            Duration::from_secs(DEFAULT_LIMIT_TIMEOUT_SECS)
        );

        let zero = Limit {
            timeout: Some(0),
            ..Limit::default()
        };
        assert_eq!(zero.effective_timeout(), Duration::ZERO);

        let explicit = Limit {
            timeout: Some(3),
            ..Limit::default()
        };
        assert_eq!(explicit.effective_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn parse_configuration_document() {
        let doc = serde_json::json!({
            "server_port": 8191,
            "debug": true,
            "api_key": "sk-gateway",
            "load_balancing": "first",
            "services": {
                "cozecn": [{
                    "models": ["gpt-4", "gpt-4-alias"],
                    "enabled": true,
                    "credentials": { "token": "secret" },
                    "model_map": { "gpt-4": "bot-1234" },
                    "limit": { "qps": 5, "timeout": 2 }
                }]
            }
        });

        let conf: Configuration = serde_json::from_value(doc).expect("parse");
        assert_eq!(conf.server_port, Some(8191));
        assert_eq!(conf.strategy(), LoadBalanceStrategy::First);
        assert_eq!(conf.bind_addr(), "0.0.0.0:8191");

        let entry = &conf.services["cozecn"][0];
        assert!(entry.enabled);
        assert_eq!(entry.limit.qps, 5);
        assert_eq!(entry.limit.timeout, Some(2));
        assert_eq!(entry.model_map["gpt-4"], "bot-1234");
    }

    #[test]
    fn entry_defaults() {
        let entry: ServiceConfig =
            serde_json::from_value(serde_json::json!({ "models": ["m"] })).expect("parse");
        assert!(entry.enabled);
        assert!(entry.credentials.is_empty());
        assert!(entry.server_url.is_none());
        assert_eq!(entry.limit.qps, 0);
        assert!(entry.limit.timeout.is_none());
    }
}
