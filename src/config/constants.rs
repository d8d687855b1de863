// Project-wide constants
//
// Centralised here so socket paths, ports and other magic values have one
// source of truth. Import via `use crate::config::constants::*;`.

/// Default Unix-domain socket of the daemon.
pub const DEFAULT_UNIX_SOCKET: &str = "/run/fazai/fazai.sock";

/// Default TCP address (same protocol as the Unix socket).
///
/// 5555 matches the port earlier worker releases listened on, so existing
/// clients keep working.
pub const DEFAULT_TCP_ADDR: &str = "127.0.0.1:5555";

/// System-wide config file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/fazai/fazai.toml";

/// Per-user state directory name (under `$HOME`).
pub const USER_DIR_NAME: &str = ".fazai";

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV_VAR: &str = "FAZAI_CONFIG";

/// Longest accepted frame (one JSON object per line).
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

/// Concurrent connection ceiling before new clients get a Backpressure error.
pub const DEFAULT_MAX_CONNECTIONS: usize = 256;

/// Malformed lines tolerated per connection before it is closed.
pub const DEFAULT_MALFORMED_THRESHOLD: u32 = 3;

/// Default Qdrant collections.
pub const DEFAULT_PERSONALITY_COLLECTION: &str = "fazai_memory";
pub const DEFAULT_KNOWLEDGE_COLLECTION: &str = "fazai_kb";

/// Default embedding dimension of the memory collections.
pub const DEFAULT_VECTOR_DIM: usize = 384;

/// Shell output is truncated past this many bytes.
pub const DEFAULT_SHELL_OUTPUT_LIMIT: usize = 20_000;
