use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;

use crate::site::SiteId;

/// WAN group configuration, loaded once at startup from a JSON document shared
///  by all sites of the deployment.
///
/// The required fields are `version`, `transport`, `local_site_id`,
///  `max_payload_size` and `sites`; a document missing any of them is rejected
///  at load time with an error naming the field.
#[derive(Debug, Clone, Deserialize)]
pub struct WanConfig {
    /// config document format version
    pub version: u32,
    pub transport: String,
    pub local_site_id: SiteId,
    /// upper bound for the payload of a single message; also the bound a
    ///  receiver enforces before trusting a declared frame length
    pub max_payload_size: usize,
    /// maximum number of sequence numbers in flight above the all-ack
    ///  frontier before `send()` blocks. `None` disables the send window.
    #[serde(default)]
    pub window_size: Option<u64>,
    pub sites: Vec<SiteEntry>,

    #[serde(default = "default_connect_max_attempts")]
    pub connect_max_attempts: u32,
    #[serde(default = "default_connect_backoff_ms")]
    pub connect_backoff_ms: u64,
    #[serde(default = "default_connect_backoff_max_ms")]
    pub connect_backoff_max_ms: u64,

    /// If set, a peer that produces no ack traffic for this long is marked
    ///  dead, bounding the all-ack frontier's exposure to a silently hung
    ///  peer. `None` waits indefinitely.
    #[serde(default)]
    pub ack_liveness_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteEntry {
    pub id: SiteId,
    pub ip: String,
    pub port: u16,
}

fn default_connect_max_attempts() -> u32 {
    10
}

fn default_connect_backoff_ms() -> u64 {
    100
}

fn default_connect_backoff_max_ms() -> u64 {
    3_000
}

impl WanConfig {
    pub fn from_json_str(json: &str) -> anyhow::Result<WanConfig> {
        let config: WanConfig = serde_json::from_str(json)
            .context("invalid WAN agent configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sites.is_empty() {
            bail!("site configuration is empty");
        }
        if !self.sites.iter().any(|s| s.id == self.local_site_id) {
            bail!("local site id {} has no entry in the site configuration", self.local_site_id);
        }
        if self.max_payload_size == 0 {
            bail!("max_payload_size must be greater than zero");
        }
        if self.window_size == Some(0) {
            bail!("window_size must be greater than zero (omit it to disable the send window)");
        }
        if self.connect_max_attempts == 0 {
            bail!("connect_max_attempts must be greater than zero");
        }
        Ok(())
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    pub fn connect_backoff_max(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_max_ms)
    }

    pub fn ack_liveness_timeout(&self) -> Option<Duration> {
        self.ack_liveness_timeout_ms.map(Duration::from_millis)
    }
}
