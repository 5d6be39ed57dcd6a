use crate::debugger::ack::AckMode;
use crate::debugger::error::Error;
use crate::{muted_error, weak_error};
use serde::Deserialize;
use std::fs::read_to_string;
use std::path::Path;
use std::time::Duration;

/// Session tunables, every field has a default.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Access VM memory through temporary mappings instead of pread/pwrite.
    pub use_mmap_access: bool,
    /// Create per-tile sub-sessions on multi-tile devices.
    pub enable_tile_attach: bool,
    /// Enabled log channels, see [`crate::log`].
    pub log_channels: u32,
    /// Event reader poll timeout.
    pub poll_timeout_ms: u64,
    /// Dispatcher wait for the next internal event.
    pub internal_event_wait_ms: u64,
    /// Interrupts not confirmed in time are reported as unavailable threads.
    pub interrupt_timeout_ms: u64,
    /// Upper bound of session initialization.
    pub bootstrap_timeout_ms: u64,
    /// Maximum kernel event record size.
    pub max_event_size: usize,
    pub max_events_per_wakeup: usize,
    pub attention_rescan_limit: u32,
    pub sr_ident_retries: u32,
    pub sr_ident_retry_delay_us: u64,
    /// Binds carrying more uuids are ignored.
    pub max_uuids_per_bind: usize,
    /// Zero-length pread/pwrite retries.
    pub access_retries: u32,
    /// Override acknowledgment mode reported by kernel protocol version.
    pub force_ack_mode: Option<AckMode>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            use_mmap_access: false,
            enable_tile_attach: false,
            log_channels: crate::log::ERROR,
            poll_timeout_ms: 1000,
            internal_event_wait_ms: 100,
            interrupt_timeout_ms: 3000,
            bootstrap_timeout_ms: 5000,
            max_event_size: 4096,
            max_events_per_wakeup: 3,
            attention_rescan_limit: 5,
            sr_ident_retries: 100,
            sr_ident_retry_delay_us: 100,
            max_uuids_per_bind: 64,
            access_retries: 3,
            force_ack_mode: None,
        }
    }
}

impl SessionConfig {
    const DEFAULT_PATH: &'static str = ".config/eudebug/session.toml";

    pub fn from_toml(data: &str) -> Result<Self, Error> {
        Ok(toml::de::from_str(data)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, Error> {
        Self::from_toml(&read_to_string(path)?)
    }

    /// Load config from `path` or from the default location in home directory.
    /// Missing default file or any load error gives default config.
    pub fn load(path: Option<&Path>) -> Self {
        let config = match path {
            Some(path) => weak_error!(Self::from_file(path), "load session config:"),
            None => home::home_dir().and_then(|home| {
                let data = muted_error!(read_to_string(home.join(Self::DEFAULT_PATH)))?;
                weak_error!(Self::from_toml(&data), "parse session config:")
            }),
        };
        config.unwrap_or_default()
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn internal_event_wait(&self) -> Duration {
        Duration::from_millis(self.internal_event_wait_ms)
    }

    pub fn interrupt_timeout(&self) -> Duration {
        Duration::from_millis(self.interrupt_timeout_ms)
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_millis(self.bootstrap_timeout_ms)
    }

    pub fn sr_ident_retry_delay(&self) -> Duration {
        Duration::from_micros(self.sr_ident_retry_delay_us)
    }
}
