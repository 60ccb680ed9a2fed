use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// 主配置结构体
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_endpoints() -> Vec<EndpointConfig> {
    vec![EndpointConfig::new("/ws")]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            server: ServerConfig::default(),
            endpoints: default_endpoints(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Look up a value by dotted key, e.g. `server.bind` or `endpoints.0.endpoint`
    pub fn get_value(&self, key: &str) -> Option<String> {
        let parts: Vec<&str> = key.split('.').collect();
        match parts.as_slice() {
            ["version"] => Some(self.version.clone()),
            ["server", "bind"] => Some(self.server.bind.clone()),
            ["server", "shutdown_grace_ms"] => Some(self.server.shutdown_grace_ms.to_string()),
            ["server", "heartbeat_interval_secs"] => {
                Some(self.server.heartbeat_interval_secs.to_string())
            }
            ["server", "outbound_buffer"] => Some(self.server.outbound_buffer.to_string()),
            ["logging", "level"] => Some(self.logging.level.as_str().to_string()),
            ["logging", "json_format"] => Some(self.logging.json_format.to_string()),
            ["endpoints", index, field] => {
                let endpoint = self.endpoints.get(index.parse::<usize>().ok()?)?;
                match *field {
                    "endpoint" => Some(endpoint.endpoint.clone()),
                    "handler" => Some(endpoint.handler.as_str().to_string()),
                    "welcome" => Some(endpoint.welcome.to_string()),
                    "noSecurityEnv" => endpoint.auth_options.no_security_env.clone(),
                    "maxConnections" => endpoint.max_connections.map(|n| n.to_string()),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Validate the configuration before any traffic is accepted.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.server.bind.trim().is_empty() {
            return Err(ConfigError::Validation(
                "server.bind cannot be empty".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for endpoint in &self.endpoints {
            if !endpoint.endpoint.starts_with('/') {
                return Err(ConfigError::Validation(format!(
                    "Endpoint '{}' must start with '/'",
                    endpoint.endpoint
                )));
            }
            if !seen.insert(endpoint.endpoint.as_str()) {
                return Err(ConfigError::DuplicateEndpoint(endpoint.endpoint.clone()));
            }
            if endpoint.max_connections == Some(0) {
                return Err(ConfigError::Validation(format!(
                    "Endpoint '{}' maxConnections must be greater than 0",
                    endpoint.endpoint
                )));
            }
            if let Some(index) = endpoint
                .auth_options
                .users
                .iter()
                .position(|user| user.name.trim().is_empty())
            {
                return Err(ConfigError::Validation(format!(
                    "Endpoint '{}' user #{} has an empty name",
                    endpoint.endpoint, index
                )));
            }
        }

        Ok(())
    }
}

/// Server 配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Bind address (e.g., "127.0.0.1:18790")
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Grace period for closing live connections on shutdown
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Ping interval in seconds; 0 disables the heartbeat
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Per-connection outbound queue depth
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

fn default_bind() -> String {
    "127.0.0.1:18790".to_string()
}

fn default_shutdown_grace_ms() -> u64 {
    2000
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_outbound_buffer() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

/// One managed endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    /// URL path, e.g. "/ws"
    pub endpoint: String,
    #[serde(default)]
    pub auth_options: AuthOptions,
    #[serde(default)]
    pub handler: HandlerKind,
    /// Send a welcome notice after a connection becomes active
    #[serde(default = "default_true")]
    pub welcome: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
}

fn default_true() -> bool {
    true
}

impl EndpointConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            auth_options: AuthOptions::default(),
            handler: HandlerKind::default(),
            welcome: true,
            max_connections: None,
        }
    }
}

/// Authentication options for an endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthOptions {
    /// Name of the environment toggle that disables authentication.
    /// Test and CI harnesses only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_security_env: Option<String>,
    #[serde(default)]
    pub users: Vec<UserEntry>,
}

/// A permitted identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl UserEntry {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            token: None,
        }
    }

    pub fn with_token(name: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            token: Some(token.into()),
        }
    }
}

/// Built-in message handler selected for an endpoint
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    Echo,
    #[default]
    Relay,
    Discard,
}

impl HandlerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Echo => "echo",
            Self::Relay => "relay",
            Self::Discard => "discard",
        }
    }
}

impl std::str::FromStr for HandlerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s.to_lowercase().as_str() {
            "echo" => Ok(Self::Echo),
            "relay" => Ok(Self::Relay),
            "discard" => Ok(Self::Discard),
            _ => Err(ConfigError::Validation(format!("Invalid handler: {}", s))),
        }
    }
}

/// 日志级别
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(ConfigError::Validation(format!("Invalid log level: {}", s))),
        }
    }
}

/// Logging 配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub json_format: bool,
    #[serde(default = "default_true")]
    pub include_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    /// Per-module overrides, e.g. {"portico_gateway": "debug"}
    #[serde(default)]
    pub module_levels: HashMap<String, LogLevel>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: false,
            include_target: true,
            ansi_colors: true,
            module_levels: HashMap::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Duplicate endpoint: {0}")]
    DuplicateEndpoint(String),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.bind, "127.0.0.1:18790");
        assert_eq!(config.endpoints.len(), 1);
        assert_eq!(config.endpoints[0].endpoint, "/ws");
        assert!(config.endpoints[0].auth_options.users.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_endpoint_auth_options() {
        let json = r#"{
            "version": "0.1.0",
            "endpoints": [
                {
                    "endpoint": "/ws",
                    "authOptions": {
                        "noSecurityEnv": "TEST_NO_AUTH",
                        "users": [{"name": "alice"}, {"name": "bob", "token": "s3cret"}]
                    },
                    "handler": "echo",
                    "maxConnections": 10
                }
            ]
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        let endpoint = &config.endpoints[0];
        assert_eq!(
            endpoint.auth_options.no_security_env.as_deref(),
            Some("TEST_NO_AUTH")
        );
        assert_eq!(endpoint.auth_options.users[0], UserEntry::named("alice"));
        assert_eq!(
            endpoint.auth_options.users[1],
            UserEntry::with_token("bob", "s3cret")
        );
        assert_eq!(endpoint.handler, HandlerKind::Echo);
        assert!(endpoint.welcome);
        assert_eq!(endpoint.max_connections, Some(10));
        assert_eq!(config.server.shutdown_grace_ms, 2000);
    }

    #[test]
    fn test_duplicate_endpoint_rejected() {
        let mut config = Config::default();
        config.endpoints.push(EndpointConfig::new("/ws"));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateEndpoint(path)) if path == "/ws"
        ));
    }

    #[test]
    fn test_endpoint_must_be_a_path() {
        let mut config = Config::default();
        config.endpoints = vec![EndpointConfig::new("ws")];
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_empty_user_name_rejected() {
        let mut config = Config::default();
        config.endpoints[0]
            .auth_options
            .users
            .push(UserEntry::named(" "));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_max_connections_rejected() {
        let mut config = Config::default();
        config.endpoints[0].max_connections = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_get_value() {
        let mut config = Config::default();
        config.endpoints.push(EndpointConfig {
            handler: HandlerKind::Discard,
            ..EndpointConfig::new("/ws-admin")
        });
        assert_eq!(config.get_value("server.bind").as_deref(), Some("127.0.0.1:18790"));
        assert_eq!(config.get_value("logging.level").as_deref(), Some("info"));
        assert_eq!(
            config.get_value("endpoints.1.endpoint").as_deref(),
            Some("/ws-admin")
        );
        assert_eq!(config.get_value("endpoints.1.handler").as_deref(), Some("discard"));
        assert_eq!(config.get_value("endpoints.7.endpoint"), None);
        assert_eq!(config.get_value("nope"), None);
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("trace".parse::<LogLevel>().unwrap(), LogLevel::Trace);
        assert!("loud".parse::<LogLevel>().is_err());
    }
}
