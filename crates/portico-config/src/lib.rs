pub mod config;
pub mod manager;

pub use config::{
    AuthOptions, Config, ConfigError, ConfigResult, EndpointConfig, HandlerKind, LogLevel,
    LoggingConfig, ServerConfig, UserEntry,
};
pub use manager::ConfigManager;

use std::path::PathBuf;

/// Portico 配置目录 (~/.portico)
pub fn portico_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".portico"))
}

/// Default config file path (~/.portico/config.json)
pub fn default_config_path() -> Option<PathBuf> {
    portico_dir().map(|dir| dir.join("config.json"))
}

/// Expand a leading `~/` to the user's home directory
pub fn expand_tilde(path: &str) -> Option<PathBuf> {
    if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir().map(|home| home.join(rest))
    } else {
        Some(PathBuf::from(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_portico_dir() {
        let dir = portico_dir();
        assert!(dir.is_some());
        assert!(dir.unwrap().to_string_lossy().contains(".portico"));
    }

    #[test]
    fn test_expand_tilde() {
        let expanded = expand_tilde("~/.portico/config.json");
        assert!(expanded.is_some());
        assert!(!expanded.unwrap().to_string_lossy().starts_with('~'));
    }

    #[test]
    fn test_expand_tilde_leaves_absolute_paths() {
        let expanded = expand_tilde("/etc/portico.json").unwrap();
        assert_eq!(expanded, PathBuf::from("/etc/portico.json"));
    }
}
