// Configuration structs
//
// Every section deserializes from TOML with per-field defaults, so a partial
// (or missing) file still yields a complete, immutable `Config`.

use super::constants::*;
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

fn default_true() -> bool {
    true
}

/// Top-level daemon configuration, built once at startup and shared as `Arc<Config>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub sessions: SessionConfig,
    pub escalation: EscalationConfig,
    pub inference: InferenceConfig,
    #[serde(rename = "team")]
    pub team: Vec<SpecialistEntry>,
    pub supervisor: Option<SupervisorEntry>,
    pub memory: MemoryConfig,
    pub cache: CacheConfig,
    pub shell: ShellConfig,
    pub logging: LoggingConfig,
}

/// Transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Unix-domain socket path
    pub unix_socket: PathBuf,
    /// TCP bind address; empty disables the TCP listener
    pub tcp_bind: String,
    /// Maximum bytes in a single framed line
    pub max_line_bytes: usize,
    /// Concurrent connection ceiling
    pub max_connections: usize,
    /// Malformed lines tolerated per connection
    pub malformed_threshold: u32,
    /// Per-connection outbound event queue depth
    pub event_buffer: usize,
    /// PID file written by `fazai daemon`
    pub pid_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            unix_socket: PathBuf::from(DEFAULT_UNIX_SOCKET),
            tcp_bind: DEFAULT_TCP_ADDR.to_string(),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            malformed_threshold: DEFAULT_MALFORMED_THRESHOLD,
            event_buffer: 64,
            pid_file: None,
        }
    }
}

impl ServerConfig {
    /// Parsed TCP address, `None` when TCP is disabled.
    pub fn tcp_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        if self.tcp_bind.trim().is_empty() {
            return Ok(None);
        }
        self.tcp_bind
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::Invalid(format!("server.tcp_bind '{}': {}", self.tcp_bind, e)))
    }
}

/// Session registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub idle_timeout_secs: u64,
    pub reap_interval_secs: u64,
    /// Number of (request, response) pairs kept per session
    pub transcript_len: usize,
    pub max_sessions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 1800,
            reap_interval_secs: 30,
            transcript_len: 32,
            max_sessions: 1024,
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

/// How the N3 team tier picks among specialist answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamPolicy {
    /// Wait for every specialist, keep the highest-scoring usable answer
    Ranked,
    /// Return the first usable answer to arrive
    FirstUsable,
}

/// Escalation timeouts and confidence policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    pub cache_timeout_ms: u64,
    pub local_timeout_secs: u64,
    pub team_timeout_secs: u64,
    pub supervisor_timeout_secs: u64,
    /// Global budget across all tiers for one request
    pub request_budget_secs: u64,
    pub team_policy: TeamPolicy,
    /// Answers shorter than this (after trimming) are low confidence
    pub min_answer_chars: usize,
    /// Case-insensitive phrases that mark an answer as low confidence
    pub low_confidence_markers: Vec<String>,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            cache_timeout_ms: 250,
            local_timeout_secs: 120,
            team_timeout_secs: 90,
            supervisor_timeout_secs: 60,
            request_budget_secs: 300,
            team_policy: TeamPolicy::Ranked,
            min_answer_chars: 2,
            low_confidence_markers: vec![
                "i don't know".to_string(),
                "i do not know".to_string(),
                "i'm not sure".to_string(),
                "i am not able to".to_string(),
                "não sei".to_string(),
                "não foi possível".to_string(),
                "sistema indisponível".to_string(),
            ],
        }
    }
}

impl EscalationConfig {
    pub fn cache_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_timeout_ms)
    }

    pub fn local_timeout(&self) -> Duration {
        Duration::from_secs(self.local_timeout_secs)
    }

    pub fn team_timeout(&self) -> Duration {
        Duration::from_secs(self.team_timeout_secs)
    }

    pub fn supervisor_timeout(&self) -> Duration {
        Duration::from_secs(self.supervisor_timeout_secs)
    }

    pub fn request_budget(&self) -> Duration {
        Duration::from_secs(self.request_budget_secs)
    }
}

/// Local inference settings, passed through verbatim to the worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub weights: PathBuf,
    pub tokenizer: PathBuf,
    pub max_tokens: u32,
    pub temperature: f32,
    pub deterministic: bool,
    pub multiturn: bool,
    pub prefill_tbatch: u32,
    /// When false, generation goes to `http_endpoint` instead of a local worker
    #[serde(default = "default_true")]
    pub native_enabled: bool,
    /// argv of the isolated worker process
    pub worker_command: Vec<String>,
    /// Jobs queued per worker (1 = strictly serialized single slot)
    pub queue_depth: usize,
    pub max_restarts: u32,
    pub restart_window_secs: u64,
    /// OpenAI-compatible endpoint used when the native path is disabled
    pub http_endpoint: Option<String>,
    pub http_model: Option<String>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            weights: PathBuf::from("/opt/fazai/models/gemma/2.0-2b-it-sfp.sbs"),
            tokenizer: PathBuf::from("/opt/fazai/models/gemma/tokenizer.spm"),
            max_tokens: 512,
            temperature: 0.2,
            deterministic: false,
            multiturn: false,
            prefill_tbatch: 256,
            native_enabled: true,
            worker_command: vec!["/opt/fazai/bin/fazai-gemma-worker".to_string()],
            queue_depth: 1,
            max_restarts: 5,
            restart_window_secs: 60,
            http_endpoint: None,
            http_model: None,
        }
    }
}

/// One local specialist of the N3 team (OpenAI-compatible endpoint)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpecialistEntry {
    /// Role name, e.g. "manager", "analyst", "coder"
    pub name: String,
    pub base_url: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Optional system prompt override for this role
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

/// Which online API backs the N4 supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorProvider {
    Gemini,
    Openai,
}

/// Online supervisor (N4) settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SupervisorEntry {
    pub provider: SupervisorProvider,
    #[serde(default)]
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

/// Memory/knowledge store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub enabled: bool,
    pub qdrant_url: String,
    pub personality_collection: String,
    pub knowledge_collection: String,
    pub vector_dim: usize,
    pub knowledge_score_threshold: f32,
    /// Snippets pulled into a prompt per collection
    pub context_limit: usize,
    pub timeout_secs: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            qdrant_url: "http://127.0.0.1:6333".to_string(),
            personality_collection: DEFAULT_PERSONALITY_COLLECTION.to_string(),
            knowledge_collection: DEFAULT_KNOWLEDGE_COLLECTION.to_string(),
            vector_dim: DEFAULT_VECTOR_DIM,
            knowledge_score_threshold: 0.6,
            context_limit: 3,
            timeout_secs: 10,
        }
    }
}

/// N1 response cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub capacity: usize,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 512,
            ttl_secs: 3600,
        }
    }
}

/// Shell execution policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    pub timeout_secs: u64,
    pub max_output_bytes: usize,
    /// Command fragments that are refused outright
    pub blocked_patterns: Vec<String>,
    pub working_dir: PathBuf,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            max_output_bytes: DEFAULT_SHELL_OUTPUT_LIMIT,
            blocked_patterns: vec![
                "rm -rf /".to_string(),
                "mkfs".to_string(),
                "dd if=".to_string(),
                ":(){ :|:& };:".to_string(),
                "> /dev/sd".to_string(),
                "chmod -r 777 /".to_string(),
            ],
            working_dir: PathBuf::from("/"),
        }
    }
}

impl ShellConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Validate configuration and return the first problem found
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.server.max_connections == 0 {
            return invalid("server.max_connections must be at least 1");
        }
        if self.server.max_line_bytes < 64 {
            return invalid("server.max_line_bytes must be at least 64");
        }
        if self.server.event_buffer == 0 {
            return invalid("server.event_buffer must be at least 1");
        }
        self.server.tcp_addr()?;

        if self.sessions.transcript_len == 0 {
            return invalid("sessions.transcript_len must be at least 1");
        }
        if self.sessions.idle_timeout_secs == 0 || self.sessions.reap_interval_secs == 0 {
            return invalid("sessions timeouts must be non-zero");
        }

        let esc = &self.escalation;
        if esc.cache_timeout_ms == 0
            || esc.local_timeout_secs == 0
            || esc.team_timeout_secs == 0
            || esc.supervisor_timeout_secs == 0
            || esc.request_budget_secs == 0
        {
            return invalid("escalation timeouts must be non-zero");
        }

        if self.inference.native_enabled && self.inference.worker_command.is_empty() {
            return invalid("inference.worker_command is required when native_enabled = true");
        }
        if !self.inference.native_enabled && self.inference.http_endpoint.is_none() {
            return invalid("inference.http_endpoint is required when native_enabled = false");
        }
        if self.inference.queue_depth == 0 {
            return invalid("inference.queue_depth must be at least 1");
        }

        for (i, member) in self.team.iter().enumerate() {
            if member.name.trim().is_empty() || member.base_url.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "team[{}] needs a name and a base_url",
                    i
                )));
            }
        }

        if self.shell.timeout_secs == 0 {
            return invalid("shell.timeout_secs must be non-zero");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            tcp_bind = ""

            [escalation]
            team_policy = "first_usable"

            [[team]]
            name = "analyst"
            base_url = "http://localhost:8001/v1"
            model = "gemma-2-9b-it"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.tcp_addr().unwrap(), None);
        assert_eq!(config.server.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.escalation.team_policy, TeamPolicy::FirstUsable);
        assert_eq!(config.escalation.local_timeout_secs, 120);
        assert_eq!(config.team.len(), 1);
        assert!(config.supervisor.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_supervisor_section() {
        let config: Config = toml::from_str(
            r#"
            [supervisor]
            provider = "gemini"
            api_key = "key"
            model = "gemini-1.5-pro-latest"
            "#,
        )
        .unwrap();
        let sup = config.supervisor.unwrap();
        assert_eq!(sup.provider, SupervisorProvider::Gemini);
        assert_eq!(sup.model.as_deref(), Some("gemini-1.5-pro-latest"));
    }

    #[test]
    fn test_rejects_zero_connection_ceiling() {
        let mut config = Config::default();
        config.server.max_connections = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_tcp_bind() {
        let mut config = Config::default();
        config.server.tcp_bind = "not-an-address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_http_path_requires_endpoint() {
        let mut config = Config::default();
        config.inference.native_enabled = false;
        assert!(config.validate().is_err());
        config.inference.http_endpoint = Some("http://127.0.0.1:8080".to_string());
        assert!(config.validate().is_ok());
    }
}
