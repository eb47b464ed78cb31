use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env::var;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub query: QueryConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config")
    }

    /// Overrides from `SNAILSHELL_*` environment variables.
    pub fn merge_env(mut self) -> Self {
        if let Ok(val) = var("SNAILSHELL_DB_PATH") {
            self.database.path = PathBuf::from(val);
        }
        if let Ok(val) = var("SNAILSHELL_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = var("SNAILSHELL_LOG_DIR") {
            self.logging.directory = Some(PathBuf::from(val));
        }
        if let Ok(val) = var("SNAILSHELL_SNAPLEN") {
            if let Ok(n) = val.parse() {
                self.capture.snaplen = n;
            }
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("snailshell.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    // Daily rolling files are written here when set
    pub directory: Option<PathBuf>,
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
            file_prefix: "snailshell".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    pub snaplen: i32,
    pub read_timeout_ms: i32,
    pub promiscuous: bool,
    // Frames buffered between the pcap reader thread and the decoder
    pub channel_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            snaplen: 65535,
            read_timeout_ms: 100,
            promiscuous: true,
            channel_capacity: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueryConfig {
    pub page_size: u32,
    pub export_limit: u32,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            export_limit: 10000,
        }
    }
}
