//! Timing and daemon configuration.
//!
//! Arbitration and backoff windows are bus-specific physical-layer values;
//! the defaults here match the common heating-bus transceivers but every
//! one of them is a plain field meant to be validated against the real
//! target hardware.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_QUIET_MS: u64 = 50;
pub const DEFAULT_RECOVERY_MS: u64 = 100;
pub const DEFAULT_ECHO_TIMEOUT_MS: u64 = 50;
pub const DEFAULT_REPLY_TIMEOUT_MS: u64 = 500;
/// Extra attempts after the first send; arbitration-based, so the budget
/// stays small and there is no exponential backoff on top of recovery.
pub const DEFAULT_SEND_RETRIES: u8 = 2;

/// Physical-layer timing constants for one bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusTimings {
    /// Minimum traffic-free interval before transmitting.
    pub quiet_ms: u64,
    /// Back-off after a detected collision.
    pub recovery_ms: u64,
    /// Window for each echoed byte during arbitration.
    pub echo_timeout_ms: u64,
    /// Deadline for the complete slave reply.
    pub reply_timeout_ms: u64,
    /// Extra full-transaction attempts after the first.
    pub send_retries: u8,
}

impl Default for BusTimings {
    fn default() -> Self {
        Self {
            quiet_ms: DEFAULT_QUIET_MS,
            recovery_ms: DEFAULT_RECOVERY_MS,
            echo_timeout_ms: DEFAULT_ECHO_TIMEOUT_MS,
            reply_timeout_ms: DEFAULT_REPLY_TIMEOUT_MS,
            send_retries: DEFAULT_SEND_RETRIES,
        }
    }
}

impl BusTimings {
    pub fn quiet(&self) -> Duration {
        Duration::from_millis(self.quiet_ms)
    }

    pub fn recovery(&self) -> Duration {
        Duration::from_millis(self.recovery_ms)
    }

    pub fn echo_timeout(&self) -> Duration {
        Duration::from_millis(self.echo_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

/// Per-class capacity of the request queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// Everything the daemon binary wires together at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Our own bus address.
    pub address: u8,
    /// Serial device path, or `host:port` when tunneled over TCP.
    pub device: String,
    /// Directory holding the CSV command definitions.
    pub config_dir: String,
    /// TCP listen port for client sessions.
    pub port: u16,
    /// Bind to localhost only.
    pub localhost_only: bool,
    pub timings: BusTimings,
    pub queue_capacity: usize,
    /// Raw byte capture file; `None` disables dumping.
    pub dump_file: Option<String>,
    /// Capture file rotation threshold in kilobytes.
    pub dump_size_kb: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            address: 0xFF,
            device: "/dev/ttyUSB0".to_string(),
            config_dir: "conf".to_string(),
            port: 8888,
            localhost_only: false,
            timings: BusTimings::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            dump_file: None,
            dump_size_kb: 100,
        }
    }
}
