//! Engine configuration.
//!
//! [`EngineConfig`] carries the knobs shared by the pipeline, the
//! orchestrator, and the daemon. Defaults are sensible for local use;
//! every field can be overridden from `SHIPWAY_*` environment variables
//! via [`EngineConfig::from_env`].

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Configuration for the Shipway engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Database URL: `mem://` for ephemeral, `surrealkv://<path>` for durable.
    pub db_url: String,

    /// Maximum total pipeline attempts per commit (first run included).
    pub max_retries: u32,

    /// Base backoff between retry attempts; attempt N sleeps
    /// `backoff_base_ms * 2^(N-1)`.
    pub backoff_base_ms: u64,

    /// Per-stage execution deadline in milliseconds.
    pub stage_timeout_ms: u64,

    /// Concurrent runs allowed per tracked branch.
    pub branch_concurrency: usize,

    /// Optional webhook URL for engine event forwarding.
    pub webhook: Option<String>,

    /// Shell command executed by the build stage.
    pub build_command: String,

    /// Shell command executed by the test stage.
    pub test_command: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_url: "mem://".to_string(),
            max_retries: 3,
            backoff_base_ms: 500,
            stage_timeout_ms: 300_000,
            branch_concurrency: 1,
            webhook: None,
            build_command: "cargo build".to_string(),
            test_command: "cargo test".to_string(),
        }
    }
}

impl EngineConfig {
    /// Build a config from defaults plus `SHIPWAY_*` environment overrides.
    ///
    /// Unparseable numeric values are logged and ignored rather than
    /// failing startup.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("SHIPWAY_DB") {
            config.db_url = url;
        }
        if let Some(v) = parse_env("SHIPWAY_MAX_RETRIES") {
            config.max_retries = v;
        }
        if let Some(v) = parse_env("SHIPWAY_BACKOFF_BASE_MS") {
            config.backoff_base_ms = v;
        }
        if let Some(v) = parse_env("SHIPWAY_STAGE_TIMEOUT_MS") {
            config.stage_timeout_ms = v;
        }
        if let Some(v) = parse_env("SHIPWAY_BRANCH_CONCURRENCY") {
            config.branch_concurrency = v;
        }
        if let Ok(url) = std::env::var("SHIPWAY_WEBHOOK") {
            config.webhook = Some(url);
        }
        if let Ok(cmd) = std::env::var("SHIPWAY_BUILD_COMMAND") {
            config.build_command = cmd;
        }
        if let Ok(cmd) = std::env::var("SHIPWAY_TEST_COMMAND") {
            config.test_command = cmd;
        }

        config
    }

    /// Backoff delay before the given retry attempt (1-based).
    pub fn backoff_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        std::time::Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(key, value = %raw, "ignoring unparseable environment override");
                None
            }
        },
        Err(_) => None,
    }
}
