//! Scriptable in-memory fleet standing in for real serial hardware.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use serialfleet::port::{PortConfig, PortManager};
use serialfleet::serial::{
    PortEnumerator, PortInfo, SerialError, Transport, TransportEvent, TransportFactory,
};

/// Chunks a device emits in reply to one command, each after a further delay.
pub type Reply = Vec<(Duration, Vec<u8>)>;
pub type Responder = Box<dyn FnMut(&[u8]) -> Reply + Send>;

pub const PROBE: &[u8] = b"!SHOW HOST_NAME\n";

struct MockDevice {
    responder: Mutex<Responder>,
    fail_writes: AtomicBool,
}

/// Mock enumerator + transport factory. Tests attach and detach scripted
/// devices, flip write failures and inject raw transport events.
pub struct MockFleet {
    ports: Mutex<Vec<PortInfo>>,
    devices: Mutex<HashMap<String, Arc<MockDevice>>>,
    /// Latest open transport's event channel, per path.
    links: Mutex<HashMap<String, mpsc::Sender<TransportEvent>>>,
    enumerations: AtomicUsize,
    enumeration_delay: Mutex<Duration>,
}

impl MockFleet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ports: Mutex::new(Vec::new()),
            devices: Mutex::new(HashMap::new()),
            links: Mutex::new(HashMap::new()),
            enumerations: AtomicUsize::new(0),
            enumeration_delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn attach(&self, info: PortInfo, responder: impl FnMut(&[u8]) -> Reply + Send + 'static) {
        self.devices.lock().unwrap().insert(
            info.path.clone(),
            Arc::new(MockDevice {
                responder: Mutex::new(Box::new(responder)),
                fail_writes: AtomicBool::new(false),
            }),
        );
        let mut ports = self.ports.lock().unwrap();
        if !ports.iter().any(|p| p.path == info.path) {
            ports.push(info);
        }
    }

    /// Unplug: the path vanishes from enumeration and any open transport
    /// sees a disconnect.
    pub fn detach(&self, path: &str) {
        self.ports.lock().unwrap().retain(|p| p.path != path);
        self.devices.lock().unwrap().remove(path);
        if let Some(tx) = self.links.lock().unwrap().remove(path) {
            let _ = tx.try_send(TransportEvent::Disconnected);
        }
    }

    pub fn set_responder(
        &self,
        path: &str,
        responder: impl FnMut(&[u8]) -> Reply + Send + 'static,
    ) {
        let devices = self.devices.lock().unwrap();
        let device = devices.get(path).expect("no device attached");
        *device.responder.lock().unwrap() = Box::new(responder);
    }

    pub fn set_fail_writes(&self, path: &str, fail: bool) {
        let devices = self.devices.lock().unwrap();
        let device = devices.get(path).expect("no device attached");
        device.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Push a raw event into the currently-open transport on `path`.
    pub fn inject(&self, path: &str, event: TransportEvent) {
        if let Some(tx) = self.links.lock().unwrap().get(path) {
            let _ = tx.try_send(event);
        }
    }

    pub fn enumeration_count(&self) -> usize {
        self.enumerations.load(Ordering::Relaxed)
    }

    pub fn set_enumeration_delay(&self, delay: Duration) {
        *self.enumeration_delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl PortEnumerator for MockFleet {
    async fn list_ports(&self) -> Result<Vec<PortInfo>, SerialError> {
        let delay = *self.enumeration_delay.lock().unwrap();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        self.enumerations.fetch_add(1, Ordering::Relaxed);
        Ok(self.ports.lock().unwrap().clone())
    }
}

#[async_trait]
impl TransportFactory for MockFleet {
    async fn open(
        &self,
        path: &str,
        _baud_rate: u32,
    ) -> Result<(Box<dyn Transport>, mpsc::Receiver<TransportEvent>), SerialError> {
        let device = self
            .devices
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| SerialError::ConnectionFailed(format!("no device on {path}")))?;
        let (event_tx, event_rx) = mpsc::channel(64);
        self.links
            .lock()
            .unwrap()
            .insert(path.to_string(), event_tx.clone());
        Ok((Box::new(MockTransport { device, event_tx }), event_rx))
    }
}

struct MockTransport {
    device: Arc<MockDevice>,
    event_tx: mpsc::Sender<TransportEvent>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn write(&mut self, data: &[u8]) -> Result<(), SerialError> {
        if self.device.fail_writes.load(Ordering::Relaxed) {
            return Err(SerialError::IoError(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "simulated write failure",
            )));
        }
        let reply = (self.device.responder.lock().unwrap())(data);
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            for (delay, chunk) in reply {
                tokio::time::sleep(delay).await;
                if tx.send(TransportEvent::Data(chunk)).await.is_err() {
                    return;
                }
            }
        });
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.event_tx.send(TransportEvent::Closed).await;
    }
}

pub fn host_name_parser(buf: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(buf).ok()?;
    let name = text
        .strip_prefix("Host Name = ")?
        .trim_end_matches(['\r', '\n']);
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

pub fn host_name_reply(name: &str) -> Vec<u8> {
    format!("Host Name = {name}\r\n").into_bytes()
}

/// Device that reports `name` to the probe and acknowledges anything else.
pub fn scripted_device(name: &'static str) -> impl FnMut(&[u8]) -> Reply + Send {
    move |cmd: &[u8]| {
        if cmd == PROBE {
            vec![(Duration::from_millis(10), host_name_reply(name))]
        } else {
            vec![(Duration::from_millis(10), b"OK\r\n".to_vec())]
        }
    }
}

pub fn default_config() -> PortConfig {
    PortConfig::new(115200, PROBE, host_name_parser)
}

pub fn spawn_manager(fleet: &Arc<MockFleet>, path: &str, config: PortConfig) -> PortManager {
    let policy_config = config.clone();
    PortManager::spawn(
        PortInfo::new(path),
        config,
        Arc::new(move |_: &PortInfo| Some(policy_config.clone())),
        fleet.clone() as Arc<dyn PortEnumerator>,
        fleet.clone() as Arc<dyn TransportFactory>,
    )
}

/// Wait for the first event matching `pred`, failing the test if the
/// stream ends or a minute of (virtual) time passes first.
pub async fn expect_event<T: Clone + std::fmt::Debug>(
    rx: &mut broadcast::Receiver<T>,
    mut pred: impl FnMut(&T) -> bool,
) -> T {
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => {}
                Err(e) => panic!("event stream ended: {e:?}"),
            }
        }
    };
    match tokio::time::timeout(Duration::from_secs(60), wait).await {
        Ok(event) => event,
        Err(_) => panic!("timed out waiting for event"),
    }
}
