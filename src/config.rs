// Copyright 2020 Joyent, Inc.

use std::fs;
use std::io::{Error, ErrorKind};
use std::path::Path;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::protocol::{RP_DEFAULT_MAX_BODY_LEN, RP_MAX_BODY_LEN_LIMIT};

const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 1000;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub host: String,
    pub port: u16,
}

/// Client settings. Every field may be omitted from the JSON form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How often a disconnected upstream is probed
    pub reconnect_interval_ms: u64,
    /// Responses announcing a larger body are treated as protocol errors
    pub max_body_len: u64,
    /// Upstreams added when the client is created
    pub upstreams: Vec<UpstreamConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL_MS,
            max_body_len: RP_DEFAULT_MAX_BODY_LEN,
            upstreams: vec![],
        }
    }
}

impl ClientConfig {
    pub fn from_json(json: &str) -> Result<ClientConfig, Error> {
        let config: ClientConfig = serde_json::from_str(json).map_err(|e| {
            let msg = format!("Failed to parse client configuration: {}", e);
            Error::new(ErrorKind::InvalidData, msg)
        })?;

        if config.max_body_len > RP_MAX_BODY_LEN_LIMIT {
            let msg = format!(
                "max_body_len {} exceeds the limit of {}",
                config.max_body_len, RP_MAX_BODY_LEN_LIMIT
            );
            return Err(Error::new(ErrorKind::InvalidData, msg));
        }

        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<ClientConfig, Error> {
        let contents = fs::read_to_string(path)?;
        ClientConfig::from_json(&contents)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}
