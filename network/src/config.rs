//! Session configuration.

use std::io;
use std::path::Path;

use serde::Deserialize;

use midilink_core::error::{Error, Result};

/// Longest session name AppleMIDI invitations carry, excluding the NUL.
pub const MAX_SESSION_NAME: usize = 15;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// AppleMIDI control port; the data socket binds `port + 1`.
    pub port: u16,
    /// Media clock rate in ticks per second.
    pub sampling_rate: u32,
    pub peer_limit: usize,
    /// Clock-sync cadence; each scheduled sync is jittered by ±20 %.
    pub sync_interval_ms: u64,
    /// Initial invitation retry delay, doubled per attempt.
    pub invitation_retry_ms: u64,
    pub invitation_retry_max_ms: u64,
    /// Total invitation datagrams sent before giving up.
    pub invitation_retry_limit: u32,
    /// Largest sequence gap the journal is asked to bridge.
    pub recovery_window: u16,
    pub outbound_queue_limit: usize,
    pub session_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5004,
            sampling_rate: 44100,
            peer_limit: 32,
            sync_interval_ms: 10_000,
            invitation_retry_ms: 2_000,
            invitation_retry_max_ms: 32_000,
            invitation_retry_limit: 12,
            recovery_window: 64,
            outbound_queue_limit: 1024,
            session_name: "midilink".to_string(),
        }
    }
}

impl Config {
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.session_name.len() > MAX_SESSION_NAME {
            return Err(Error::BadProperty("session name exceeds 15 bytes"));
        }
        if self.sampling_rate == 0 {
            return Err(Error::BadProperty("sampling rate must be non-zero"));
        }
        Ok(())
    }

    pub(crate) fn ms_to_ticks(&self, ms: u64) -> u64 {
        ms * u64::from(self.sampling_rate) / 1000
    }
}
