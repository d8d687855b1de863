// Configuration loader
// Resolves the config file (flag, env, system, user) and parses it once

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::constants::{CONFIG_ENV_VAR, SYSTEM_CONFIG_PATH, USER_DIR_NAME};
use super::settings::Config;
use crate::errors::ConfigError;

/// Load configuration.
///
/// An explicit path must exist. Otherwise `$FAZAI_CONFIG`, the system file and
/// the per-user file are tried in order; if none exists the built-in defaults
/// are used.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let path = match explicit {
        Some(p) => Some(p.to_path_buf()),
        None => discover_config_path(),
    };

    let mut config = match path {
        Some(path) => {
            let config = load_from_path(&path)?;
            info!(path = %path.display(), "loaded configuration");
            config
        }
        None => {
            debug!("no configuration file found, using defaults");
            Config::default()
        }
    };

    config.server.unix_socket = resolve_socket_path(&config.server.unix_socket);
    config.validate().context("configuration rejected")?;
    Ok(config)
}

/// Parse one TOML file into a `Config` (no validation).
pub fn load_from_path(path: &Path) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

fn discover_config_path() -> Option<PathBuf> {
    if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
        if !env_path.is_empty() {
            return Some(PathBuf::from(env_path));
        }
    }

    let system = PathBuf::from(SYSTEM_CONFIG_PATH);
    if system.exists() {
        return Some(system);
    }

    let user = user_dir()?.join("config.toml");
    user.exists().then_some(user)
}

/// `~/.fazai`, when a home directory can be determined
pub fn user_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(USER_DIR_NAME))
}

/// Keep the configured socket path if its directory is usable, otherwise fall
/// back to `~/.fazai/<file name>` (unprivileged runs without `/run/fazai`).
fn resolve_socket_path(configured: &Path) -> PathBuf {
    let parent_ok = configured
        .parent()
        .map(|dir| dir.as_os_str().is_empty() || dir_is_writable(dir))
        .unwrap_or(true);
    if parent_ok {
        return configured.to_path_buf();
    }

    match (user_dir(), configured.file_name()) {
        (Some(dir), Some(name)) => {
            let fallback = dir.join(name);
            debug!(
                configured = %configured.display(),
                fallback = %fallback.display(),
                "socket directory not writable, using per-user path"
            );
            fallback
        }
        _ => configured.to_path_buf(),
    }
}

fn dir_is_writable(dir: &Path) -> bool {
    if fs::create_dir_all(dir).is_err() {
        return false;
    }
    fs::metadata(dir)
        .map(|m| m.is_dir() && !m.permissions().readonly())
        .unwrap_or(false)
        && probe_write(dir)
}

fn probe_write(dir: &Path) -> bool {
    let probe = dir.join(format!(".fazai-probe-{}", std::process::id()));
    match fs::File::create(&probe) {
        Ok(_) => {
            let _ = fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}
