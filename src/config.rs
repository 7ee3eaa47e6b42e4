//! Configuration file support for reqgraph
//!
//! Reads from .reqgraph/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration structure
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub uploads: UploadConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// SQLite settings
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    /// Database file. REQGRAPH_DB_PATH wins over this.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// How long a connection waits on a locked database
    /// Default: 5000
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u32,
}

/// HTTP listener
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Threads pulling requests off the listener
    /// Default: 4
    #[serde(default = "default_workers")]
    pub workers: usize,
}

/// Where import uploads are staged
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct UploadConfig {
    #[serde(default = "default_upload_dir")]
    pub dir: PathBuf,

    /// Largest accepted request body
    /// Default: 16 MiB
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SessionConfig {
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: i64,

    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// tracing-subscriber filter used when RUST_LOG is unset
    #[serde(default = "default_filter")]
    pub filter: String,
}

fn default_busy_timeout_ms() -> u32 {
    5_000
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_workers() -> usize {
    4
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from(".reqgraph/uploads")
}

fn default_max_bytes() -> u64 {
    16 * 1024 * 1024
}

fn default_ttl_hours() -> i64 {
    24
}

fn default_cookie_name() -> String {
    "session".to_string()
}

fn default_filter() -> String {
    "info".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: default_workers(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            dir: default_upload_dir(),
            max_bytes: default_max_bytes(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_hours: default_ttl_hours(),
            cookie_name: default_cookie_name(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
        }
    }
}

impl Config {
    /// Load config from .reqgraph/config.toml
    /// Returns default config if file doesn't exist
    pub fn load() -> Self {
        if let Some(path) = Self::find_config_path() {
            if let Ok(contents) = std::fs::read_to_string(&path) {
                match toml::from_str(&contents) {
                    Ok(config) => return config,
                    Err(e) => eprintln!("warning: ignoring {}: {}", path.display(), e),
                }
            }
        }
        Self::default()
    }

    /// Find config.toml by walking up directory tree
    fn find_config_path() -> Option<PathBuf> {
        let current_dir = std::env::current_dir().ok()?;
        let mut dir = current_dir.as_path();

        loop {
            let config_path = dir.join(".reqgraph").join("config.toml");
            if config_path.exists() {
                return Some(config_path);
            }

            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
        None
    }

    /// Database file: REQGRAPH_DB_PATH, then `[database] path`, then the
    /// nearest .reqgraph folder
    pub fn database_path(&self) -> PathBuf {
        if std::env::var_os("REQGRAPH_DB_PATH").is_some() {
            return crate::Database::db_path();
        }
        match &self.database.path {
            Some(path) => path.clone(),
            None => crate::Database::db_path(),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.workers, 4);
        assert_eq!(config.session.cookie_name, "session");
        assert_eq!(config.session.ttl_hours, 24);
        assert_eq!(config.uploads.max_bytes, 16 * 1024 * 1024);
        assert_eq!(config.bind_address(), "127.0.0.1:3000");
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 8080
workers = 2

[uploads]
dir = "/tmp/reqgraph-uploads"

[logging]
filter = "reqgraph=debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.workers, 2);
        assert_eq!(config.uploads.dir, PathBuf::from("/tmp/reqgraph-uploads"));
        assert_eq!(config.uploads.max_bytes, 16 * 1024 * 1024);
        assert_eq!(config.logging.filter, "reqgraph=debug");
        assert_eq!(config.database.busy_timeout_ms, 5_000);
    }

    #[test]
    fn test_unknown_section_is_ignored() {
        let config: Config = toml::from_str("[branch]\nauto_detect = true\n").unwrap();
        assert_eq!(config.server.port, 3000);
    }
}
