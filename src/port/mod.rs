pub mod config;
pub mod manager;
mod task;

pub use config::{IdParser, OptionPolicy, PortConfig, ResponseCheck};
pub use manager::PortManager;

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay between opening a port and sending the identification probe, and
/// between failed identification attempts.
pub const INIT_DELAY: Duration = Duration::from_secs(2);
/// Delay between reconnection attempts while a port is absent or faulted.
pub const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Connection lifecycle of one managed port.
///
/// Only `Ready` admits requests; everything else is a stage of the
/// open/identify/reconnect loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortStatus {
    Error,
    Open,
    Identifying,
    Ready,
    Disconnected,
    Closed,
    NotFound,
    Closing,
    InitFailed,
}

impl PortStatus {
    /// Stable numeric code for logs and host-app consumption.
    pub fn code(self) -> i8 {
        match self {
            PortStatus::Error => -1,
            PortStatus::Open => 0,
            PortStatus::Identifying => 1,
            PortStatus::Ready => 2,
            PortStatus::Disconnected => 3,
            PortStatus::Closed => 4,
            PortStatus::NotFound => 5,
            PortStatus::Closing => 6,
            PortStatus::InitFailed => 7,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PortStatus::Error => "error",
            PortStatus::Open => "open",
            PortStatus::Identifying => "identifying",
            PortStatus::Ready => "ready",
            PortStatus::Disconnected => "disconnected",
            PortStatus::Closed => "closed",
            PortStatus::NotFound => "not found",
            PortStatus::Closing => "closing",
            PortStatus::InitFailed => "init failed",
        }
    }

    pub fn is_ready(self) -> bool {
        self == PortStatus::Ready
    }
}

impl std::fmt::Display for PortStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Lifecycle notifications from one port manager.
///
/// `StatusChanged` is edge-triggered and precedes the semantic event a
/// transition causes (`Ready` status before `Ready { id }`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PortEvent {
    /// Transport opened; identity not yet known.
    Opened,
    /// First identification on this port succeeded.
    Ready { id: String },
    /// Re-identification returned the same identity.
    Reinitialized { id: String },
    /// Re-identification returned a different identity.
    IdChanged { id: String },
    /// Transport reported an unplug. Carries the last known identity.
    Disconnected { id: Option<String> },
    /// Transport closed.
    Closed,
    /// Transport-level fault.
    Error { message: String },
    StatusChanged { status: PortStatus, message: String },
}

/// Per-request knobs for [`PortManager::submit`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOptions {
    /// Quiescence window for this request; defaults to the port's
    /// `serial_response_timeout`.
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

/// Failures surfaced through a request future.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("Port not ready")]
    NotReady,

    #[error("Request queue full")]
    QueueFull,

    #[error("Device identity changed while request was queued")]
    StaleIdentity,

    #[error("Serial write failed: {0}")]
    WriteFailed(String),

    #[error("Response failed validation")]
    ValidationFailed,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Port manager terminated")]
    Terminated,
}

pub type Result<T> = std::result::Result<T, RequestError>;
