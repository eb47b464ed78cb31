use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// Outcomes of active probes and enrichment. Each one references a port of its host by number.

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct WebResponse {
    pub id: i64,
    pub port: u16,
    pub method: String,
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Screenshot {
    pub id: i64,
    pub port: u16,
    #[serde(skip_serializing, default)]
    pub image_data: Vec<u8>,
    pub capture_time: DateTime<Utc>,
}

impl Screenshot {
    pub fn new(port: u16, image_data: Vec<u8>) -> Self {
        Screenshot {
            id: 0,
            port,
            image_data,
            capture_time: Utc::now(),
        }
    }

    /// Image payload for embedding in HTML.
    pub fn image_data_base64(&self) -> String {
        STANDARD.encode(&self.image_data)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct FtpResult {
    pub id: i64,
    pub port: u16,
    pub address: String,
    pub status: String,
    pub error: String,
    pub anonymous_login_possible: bool,
    pub current_dir: String,
    pub directory_listing: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct SshResult {
    pub id: i64,
    pub port: u16,
    pub address: String,
    pub user: String,
    pub status: String,
    pub error: String,
    pub successful: bool,
    pub output: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct SmbResult {
    pub id: i64,
    pub port: u16,
    pub address: String,
    pub status: String,
    pub error: String,
    pub successful: bool,
    pub shares: Vec<String>,
}
