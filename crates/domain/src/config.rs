//! Configuration types.
//!
//! Two surfaces live here:
//! - [`ToolServerConfig`] and friends: the persisted `tool-servers.json`
//!   document shape (owned by the registry, shared by everything that
//!   connects to tool servers).
//! - [`BrokerConfig`]: process-level tunables loaded from environment
//!   variables at startup.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool server configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Configuration for one tool server, as stored in `tool-servers.json`.
///
/// The transport-specific fields are flattened next to the shared ones,
/// discriminated by the `transport` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolServerConfig {
    #[serde(flatten)]
    pub transport: TransportConfig,

    /// Disabled servers stay in the document but are never connected.
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub description: String,

    /// Override for the namespacing prefix. Defaults to the server name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_prefix: Option<String>,
}

/// Transport-specific configuration, discriminated by `transport`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "transport", rename_all = "kebab-case")]
pub enum TransportConfig {
    /// Tool server carried by a short-lived sandboxed process.
    #[serde(rename_all = "camelCase")]
    SandboxStdio {
        container_image: String,
        #[serde(default)]
        container_env: HashMap<String, String>,
        #[serde(rename = "containerMemoryMiB", default = "default_memory_mib")]
        container_memory_mib: u64,
        #[serde(default = "default_cpu")]
        container_cpu: f64,
    },

    /// Tool server spawned as a local child process.
    #[serde(rename_all = "camelCase")]
    LocalStdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },

    /// Remote tool server spoken to via JSON-RPC over HTTP POST.
    #[serde(rename_all = "camelCase")]
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        health_check_endpoint: Option<String>,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },

    /// Remote tool server that replies over a server-sent event stream.
    #[serde(rename_all = "camelCase")]
    Sse {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
}

impl TransportConfig {
    /// Short discriminator string, matching the wire value.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportConfig::SandboxStdio { .. } => "sandbox-stdio",
            TransportConfig::LocalStdio { .. } => "local-stdio",
            TransportConfig::Http { .. } => "http",
            TransportConfig::Sse { .. } => "sse",
        }
    }
}

/// Server names must match `[A-Za-z0-9_-]+`.
pub fn is_valid_server_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry document
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The deterministic policy mapping `(server, originalName)` pairs to
/// exposed tool names.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NamespacingStrategy {
    #[default]
    Auto,
    Prefix,
    None,
}

/// Registry-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySettings {
    /// Connect to every enabled server at startup.
    #[serde(default = "default_true")]
    pub auto_connect: bool,

    #[serde(default = "default_health_interval_ms")]
    pub health_check_interval_ms: u64,

    #[serde(default)]
    pub tool_namespacing: NamespacingStrategy,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            auto_connect: true,
            health_check_interval_ms: default_health_interval_ms(),
            tool_namespacing: NamespacingStrategy::Auto,
        }
    }
}

/// The full persisted `tool-servers.json` document.
///
/// Servers are kept in a `BTreeMap` so iteration order (and therefore
/// collision resolution under the `none` strategy) is deterministic.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RegistryDocument {
    #[serde(default)]
    pub servers: BTreeMap<String, ToolServerConfig>,

    #[serde(default)]
    pub settings: RegistrySettings,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Broker configuration (environment-driven)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pre-warmed sandbox pool tunables.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub enabled: bool,
    pub min_idle: usize,
    pub max_total: usize,
    pub idle_ttl: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            min_idle: 2,
            max_total: 10,
            idle_ttl: Duration::from_secs(300),
        }
    }
}

/// Dispatch-plane (worker mode) tunables.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub enabled: bool,
    pub worker_concurrency: usize,
    pub job_ttl: Duration,
    pub pop_timeout: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            worker_concurrency: 10,
            job_ttl: Duration::from_secs(300),
            pop_timeout: Duration::from_secs(5),
        }
    }
}

/// Conversation-store tunables.
#[derive(Debug, Clone)]
pub struct ConversationSettings {
    pub max_messages: usize,
    pub max_history_tokens: usize,
    pub compress: bool,
    /// TTL applied to the per-session message log, if any.
    pub history_ttl: Option<Duration>,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            max_messages: 50,
            max_history_tokens: 30_000,
            compress: false,
            history_ttl: None,
        }
    }
}

/// Turn-engine tunables.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Per-connection cap on concurrent turns / approval resolutions.
    pub max_in_flight: usize,
    /// Bound on model→tools→model recursion within one turn.
    pub max_tool_loops: usize,
    pub max_output_tokens: Option<u32>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_in_flight: 5,
            max_tool_loops: 8,
            max_output_tokens: None,
        }
    }
}

/// Session lifecycle tunables.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub lock_ttl: Duration,
    /// How long the loser of a lock race waits before re-reading.
    pub contention_wait: Duration,
    /// Sessions idle longer than this are reaped by the janitor.
    pub idle_ttl: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30),
            contention_wait: Duration::from_secs(2),
            idle_ttl: Duration::from_secs(15 * 60),
        }
    }
}

/// Process-level configuration assembled from environment variables.
#[derive(Debug, Clone, Default)]
pub struct BrokerConfig {
    /// Connection URL for the external state store, when one is used.
    pub state_store_url: Option<String>,
    pub pool: PoolSettings,
    pub dispatch: DispatchSettings,
    pub conversation: ConversationSettings,
    pub engine: EngineSettings,
    pub session: SessionSettings,
}

impl BrokerConfig {
    /// Build a config from the process environment.
    ///
    /// Unset variables keep their defaults; unparseable values are logged
    /// and ignored rather than failing startup.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Testable variant of [`BrokerConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        config.state_store_url = lookup("STATE_STORE_URL");

        config.pool.enabled = env_bool(&lookup, "ENABLE_SANDBOX_POOL", config.pool.enabled);
        if let Some(v) = env_u64(&lookup, "POOL_MIN_IDLE") {
            config.pool.min_idle = v as usize;
        }
        if let Some(v) = env_u64(&lookup, "POOL_MAX_TOTAL") {
            config.pool.max_total = v as usize;
        }
        if let Some(v) = env_u64(&lookup, "POOL_IDLE_TTL_MS") {
            config.pool.idle_ttl = Duration::from_millis(v);
        }

        config.dispatch.enabled = env_bool(&lookup, "ENABLE_WORKER_MODE", config.dispatch.enabled);
        if let Some(v) = env_u64(&lookup, "WORKER_CONCURRENCY") {
            config.dispatch.worker_concurrency = v as usize;
        }
        if let Some(v) = env_u64(&lookup, "JOB_TIMEOUT_MS") {
            config.dispatch.job_ttl = Duration::from_millis(v);
        }

        config.conversation.compress = env_bool(
            &lookup,
            "ENABLE_CONVERSATION_COMPRESSION",
            config.conversation.compress,
        );
        if let Some(v) = env_u64(&lookup, "MAX_HISTORY_TOKENS") {
            config.conversation.max_history_tokens = v as usize;
        }
        if let Some(v) = env_u64(&lookup, "HISTORY_TTL_SECONDS") {
            config.conversation.history_ttl = Some(Duration::from_secs(v));
        }

        if let Some(v) = env_u64(&lookup, "MAX_OUTPUT_TOKENS") {
            config.engine.max_output_tokens = Some(v as u32);
        }

        if let Some(v) = env_u64(&lookup, "IDLE_SESSION_TTL_MS") {
            config.session.idle_ttl = Duration::from_millis(v);
        }

        config
    }
}

fn env_bool(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: bool) -> bool {
    match lookup(name) {
        Some(raw) => matches!(raw.trim(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

fn env_u64(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<u64> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparseable environment variable");
            None
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_memory_mib() -> u64 {
    512
}

fn default_cpu() -> f64 {
    0.5
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_health_interval_ms() -> u64 {
    60_000
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_sandbox_stdio_config() {
        let raw = r#"{
            "transport": "sandbox-stdio",
            "enabled": true,
            "description": "filesystem tools",
            "containerImage": "tool-srv:1",
            "containerEnv": { "LOG": "debug" },
            "containerMemoryMiB": 256,
            "containerCpu": 1.0
        }"#;
        let config: ToolServerConfig = serde_json::from_str(raw).unwrap();
        assert!(config.enabled);
        match &config.transport {
            TransportConfig::SandboxStdio {
                container_image,
                container_memory_mib,
                container_cpu,
                ..
            } => {
                assert_eq!(container_image, "tool-srv:1");
                assert_eq!(*container_memory_mib, 256);
                assert_eq!(*container_cpu, 1.0);
            }
            other => panic!("wrong transport: {other:?}"),
        }
    }

    #[test]
    fn sandbox_stdio_defaults() {
        let raw = r#"{ "transport": "sandbox-stdio", "containerImage": "t:1" }"#;
        let config: ToolServerConfig = serde_json::from_str(raw).unwrap();
        assert!(config.enabled);
        match &config.transport {
            TransportConfig::SandboxStdio {
                container_memory_mib,
                container_cpu,
                ..
            } => {
                assert_eq!(*container_memory_mib, 512);
                assert_eq!(*container_cpu, 0.5);
            }
            other => panic!("wrong transport: {other:?}"),
        }
    }

    #[test]
    fn deserialize_http_config_defaults() {
        let raw = r#"{ "transport": "http", "url": "https://tools.example/rpc" }"#;
        let config: ToolServerConfig = serde_json::from_str(raw).unwrap();
        match &config.transport {
            TransportConfig::Http {
                timeout_ms,
                health_check_endpoint,
                ..
            } => {
                assert_eq!(*timeout_ms, 30_000);
                assert!(health_check_endpoint.is_none());
            }
            other => panic!("wrong transport: {other:?}"),
        }
    }

    #[test]
    fn transport_kind_roundtrips_through_json() {
        let raw = r#"{ "transport": "local-stdio", "command": "tool-srv" }"#;
        let config: ToolServerConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.transport.kind(), "local-stdio");
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["transport"], "local-stdio");
    }

    #[test]
    fn server_name_pattern() {
        assert!(is_valid_server_name("fs"));
        assert!(is_valid_server_name("net_tools-2"));
        assert!(!is_valid_server_name(""));
        assert!(!is_valid_server_name("bad name"));
        assert!(!is_valid_server_name("a/b"));
    }

    #[test]
    fn registry_settings_defaults() {
        let doc: RegistryDocument = serde_json::from_str(r#"{ "servers": {} }"#).unwrap();
        assert!(doc.settings.auto_connect);
        assert_eq!(doc.settings.health_check_interval_ms, 60_000);
        assert_eq!(doc.settings.tool_namespacing, NamespacingStrategy::Auto);
    }

    #[test]
    fn broker_config_from_lookup() {
        let vars: std::collections::HashMap<&str, &str> = [
            ("ENABLE_SANDBOX_POOL", "true"),
            ("POOL_MIN_IDLE", "4"),
            ("POOL_MAX_TOTAL", "16"),
            ("ENABLE_WORKER_MODE", "1"),
            ("WORKER_CONCURRENCY", "3"),
            ("JOB_TIMEOUT_MS", "60000"),
            ("MAX_HISTORY_TOKENS", "1000"),
            ("IDLE_SESSION_TTL_MS", "120000"),
            ("HISTORY_TTL_SECONDS", "3600"),
        ]
        .into_iter()
        .collect();
        let config = BrokerConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string()));

        assert!(config.pool.enabled);
        assert_eq!(config.pool.min_idle, 4);
        assert_eq!(config.pool.max_total, 16);
        assert!(config.dispatch.enabled);
        assert_eq!(config.dispatch.worker_concurrency, 3);
        assert_eq!(config.dispatch.job_ttl, Duration::from_secs(60));
        assert_eq!(config.conversation.max_history_tokens, 1000);
        assert_eq!(config.conversation.history_ttl, Some(Duration::from_secs(3600)));
        assert_eq!(config.session.idle_ttl, Duration::from_secs(120));
    }

    #[test]
    fn broker_config_ignores_garbage_values() {
        let config = BrokerConfig::from_lookup(|name| {
            (name == "POOL_MAX_TOTAL").then(|| "not-a-number".to_string())
        });
        assert_eq!(config.pool.max_total, PoolSettings::default().max_total);
    }
}
