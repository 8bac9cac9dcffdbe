pub mod transport;

pub use transport::{
    PortEnumerator, SystemEnumerator, SystemTransportFactory, Transport, TransportEvent,
    TransportFactory,
};

use serde::{Deserialize, Serialize};

/// Descriptive metadata for one enumerated serial port.
///
/// USB fields are absent for ports the OS cannot describe (built-in UARTs,
/// PCI serial cards).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortInfo {
    pub path: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

impl PortInfo {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            manufacturer: None,
            product: None,
            serial_number: None,
            vid: None,
            pid: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;
