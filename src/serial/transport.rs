//! Transport seam between the port manager and the serial library.
//!
//! The port manager only ever talks to these traits; production code plugs
//! in the `serialport`-backed implementations below, tests plug in mocks.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{PortInfo, Result, SerialError};

/// How long the reader thread blocks per poll before re-checking shutdown.
const READ_POLL_TIMEOUT: Duration = Duration::from_millis(20);
const READ_BUF_SIZE: usize = 1024;
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Notifications delivered by an open transport.
///
/// `Closed` is always the last event on a channel: it follows a requested
/// close. `Disconnected` and `Error` report the link dying underneath us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Data(Vec<u8>),
    Error(String),
    Disconnected,
    Closed,
}

/// Write half of an open serial connection.
#[async_trait]
pub trait Transport: Send {
    /// Write the full buffer, reporting an error once the OS rejects it.
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Request a close. The event channel delivers `Closed` once the read
    /// side has wound down.
    async fn close(&mut self);
}

/// Opens named ports, yielding a write handle plus its event stream.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(
        &self,
        path: &str,
        baud_rate: u32,
    ) -> Result<(Box<dyn Transport>, mpsc::Receiver<TransportEvent>)>;
}

/// Lists currently attached serial ports.
#[async_trait]
pub trait PortEnumerator: Send + Sync {
    async fn list_ports(&self) -> Result<Vec<PortInfo>>;
}

impl PortInfo {
    fn from_serialport(info: serialport::SerialPortInfo) -> Self {
        let mut out = PortInfo::new(info.port_name);
        if let serialport::SerialPortType::UsbPort(usb) = info.port_type {
            out.manufacturer = usb.manufacturer;
            out.product = usb.product;
            out.serial_number = usb.serial_number;
            out.vid = Some(usb.vid);
            out.pid = Some(usb.pid);
        }
        out
    }
}

/// Enumerator backed by `serialport::available_ports`.
pub struct SystemEnumerator;

#[async_trait]
impl PortEnumerator for SystemEnumerator {
    async fn list_ports(&self) -> Result<Vec<PortInfo>> {
        let ports = tokio::task::spawn_blocking(serialport::available_ports)
            .await
            .map_err(|e| SerialError::ConnectionFailed(format!("enumeration task failed: {e}")))??;
        Ok(ports.into_iter().map(PortInfo::from_serialport).collect())
    }
}

/// Factory backed by the `serialport` crate.
///
/// Opened ports get a dedicated blocking reader that pumps raw bytes into
/// the event channel; no framing is applied at this layer.
pub struct SystemTransportFactory;

#[async_trait]
impl TransportFactory for SystemTransportFactory {
    async fn open(
        &self,
        path: &str,
        baud_rate: u32,
    ) -> Result<(Box<dyn Transport>, mpsc::Receiver<TransportEvent>)> {
        let owned_path = path.to_string();
        let port = tokio::task::spawn_blocking(move || {
            serialport::new(&owned_path, baud_rate)
                .timeout(READ_POLL_TIMEOUT)
                .open()
        })
        .await
        .map_err(|e| SerialError::ConnectionFailed(format!("open task failed: {e}")))?
        .map_err(|e| SerialError::ConnectionFailed(e.to_string()))?;

        let reader = port
            .try_clone()
            .map_err(|e| SerialError::ConnectionFailed(e.to_string()))?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        tokio::task::spawn_blocking(move || read_loop(reader, event_tx, flag));

        Ok((Box::new(SystemTransport { port, shutdown }), event_rx))
    }
}

struct SystemTransport {
    port: Box<dyn serialport::SerialPort>,
    shutdown: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for SystemTransport {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }

    async fn close(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

fn read_loop(
    mut port: Box<dyn serialport::SerialPort>,
    events: mpsc::Sender<TransportEvent>,
    shutdown: Arc<AtomicBool>,
) {
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        if shutdown.load(Ordering::Relaxed) {
            let _ = events.blocking_send(TransportEvent::Closed);
            return;
        }
        match port.read(&mut buf) {
            // Zero-length read is EOF: the device is gone.
            Ok(0) => {
                let _ = events.blocking_send(TransportEvent::Disconnected);
                return;
            }
            Ok(n) => {
                if events
                    .blocking_send(TransportEvent::Data(buf[..n].to_vec()))
                    .is_err()
                {
                    return;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::BrokenPipe
                        | std::io::ErrorKind::NotFound
                        | std::io::ErrorKind::PermissionDenied
                ) =>
            {
                log::debug!("serial read loop lost device: {}", e);
                let _ = events.blocking_send(TransportEvent::Disconnected);
                return;
            }
            Err(e) => {
                let _ = events.blocking_send(TransportEvent::Error(e.to_string()));
                return;
            }
        }
    }
}
