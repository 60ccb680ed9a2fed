use crate::config::{Config, ConfigError, ConfigResult};
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::info;

/// 配置管理器
///
/// The endpoint table is fixed once the gateway starts, so a loaded
/// configuration is never replaced.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    path: PathBuf,
    config: Config,
}

impl ConfigManager {
    /// 加载配置文件
    ///
    /// A missing file yields the default configuration; nothing is written.
    pub async fn load(path: &Path) -> ConfigResult<Self> {
        let config = if path.exists() {
            info!("Loading config from {:?}", path);
            let content = tokio::fs::read_to_string(path).await?;
            Self::parse(&content)?
        } else {
            info!("Config file {:?} not found, using defaults", path);
            let config = Config::default();
            config.validate()?;
            config
        };

        Ok(Self::new(config, path.to_path_buf()))
    }

    /// Parse and validate a JSON document
    pub fn from_json(content: &str) -> ConfigResult<Self> {
        Ok(Self::new(Self::parse(content)?, PathBuf::new()))
    }

    /// 创建一个新的配置管理器（用于测试）
    pub fn new(config: Config, path: PathBuf) -> Self {
        Self { path, config }
    }

    fn parse(content: &str) -> ConfigResult<Config> {
        let content = Self::expand_env_vars(content, |name| std::env::var(name).ok())?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Owned copy, for callers that apply overrides
    pub fn snapshot(&self) -> Config {
        self.config.clone()
    }

    /// 展开环境变量 ${VAR} 或 ${VAR:-default}
    pub fn expand_env_vars<F>(content: &str, lookup: F) -> ConfigResult<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let re = Regex::new(r"\$\{([^}]+)\}")
            .map_err(|e| ConfigError::Validation(format!("Invalid pattern: {}", e)))?;
        let mut result = content.to_string();

        for cap in re.captures_iter(content) {
            let (Some(full_match), Some(var_expr)) = (cap.get(0), cap.get(1)) else {
                continue;
            };

            let (var_name, default_value) = match var_expr.as_str().split_once(":-") {
                Some((name, default)) => (name, Some(default)),
                None => (var_expr.as_str(), None),
            };

            let replacement = match (lookup(var_name), default_value) {
                (Some(val), _) => val,
                (None, Some(default)) => default.to_string(),
                (None, None) => return Err(ConfigError::EnvVarNotFound(var_name.to_string())),
            };

            result = result.replace(full_match.as_str(), &replacement);
        }

        Ok(result)
    }

    /// 获取配置文件路径
    pub fn path(&self) -> &Path {
        &self.path
    }
}
