// Configuration module
// Public interface for configuration loading

pub mod constants;
mod loader;
mod settings;

pub use loader::{load_config, load_from_path, user_dir};
pub use settings::{
    CacheConfig, Config, EscalationConfig, InferenceConfig, LoggingConfig, MemoryConfig,
    ServerConfig, SessionConfig, ShellConfig, SpecialistEntry, SupervisorEntry,
    SupervisorProvider, TeamPolicy,
};
