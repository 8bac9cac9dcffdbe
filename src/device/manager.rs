//! Central registry resolving device identities to port managers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch, Mutex};

use crate::port::{
    OptionPolicy, PortConfig, PortEvent, PortManager, RequestError, RequestOptions, Result,
};
use crate::serial::{PortEnumerator, PortInfo, SystemEnumerator, SystemTransportFactory, TransportFactory};

use super::{DeviceEntry, DeviceEvent, SeenRegistry, DEFAULT_DISCOVERY_TIMEOUT};

const EVENT_CAPACITY: usize = 64;

struct DeviceRecord {
    manager: PortManager,
    last_seen: DateTime<Utc>,
}

#[derive(Default)]
struct Registry {
    /// One manager per adopted path, created on first sight and kept for
    /// the life of the process; the manager handles the path reappearing.
    port_managers: HashMap<String, PortManager>,
    /// Identity to the manager currently holding it.
    devices: HashMap<String, DeviceRecord>,
}

struct Inner {
    policy: OptionPolicy,
    discovery_timeout: Duration,
    enumerator: Arc<dyn PortEnumerator>,
    factory: Arc<dyn TransportFactory>,
    state: Mutex<Registry>,
    ever_seen: SeenRegistry,
    /// At most one enumeration pass runs at a time; concurrent refreshes
    /// await the receiver of the in-flight pass.
    refresh_gate: Mutex<Option<watch::Receiver<bool>>>,
    events: broadcast::Sender<DeviceEvent>,
}

/// Identity-keyed access to a fleet of serial devices.
///
/// Discovers ports, adopts the ones the policy accepts, and routes
/// requests by the identity each device reports, not by where it is
/// plugged in. Cheap to clone; all clones share the registry.
#[derive(Clone)]
pub struct DeviceManager {
    inner: Arc<Inner>,
}

pub struct DeviceManagerBuilder {
    policy: OptionPolicy,
    discovery_timeout: Duration,
    enumerator: Option<Arc<dyn PortEnumerator>>,
    factory: Option<Arc<dyn TransportFactory>>,
    ever_seen: Option<SeenRegistry>,
}

impl DeviceManagerBuilder {
    pub fn new(policy: impl Fn(&PortInfo) -> Option<PortConfig> + Send + Sync + 'static) -> Self {
        Self {
            policy: Arc::new(policy),
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            enumerator: None,
            factory: None,
            ever_seen: None,
        }
    }

    /// Wall-clock deadline for discovering an unknown identity in
    /// [`DeviceManager::request`].
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    pub fn with_enumerator(mut self, enumerator: Arc<dyn PortEnumerator>) -> Self {
        self.enumerator = Some(enumerator);
        self
    }

    pub fn with_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Share the ever-seen identity registry with another manager, so both
    /// agree on which identities count as first-ever sightings.
    pub fn with_seen_registry(mut self, registry: SeenRegistry) -> Self {
        self.ever_seen = Some(registry);
        self
    }

    pub fn build(self) -> DeviceManager {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        DeviceManager {
            inner: Arc::new(Inner {
                policy: self.policy,
                discovery_timeout: self.discovery_timeout,
                enumerator: self
                    .enumerator
                    .unwrap_or_else(|| Arc::new(SystemEnumerator)),
                factory: self
                    .factory
                    .unwrap_or_else(|| Arc::new(SystemTransportFactory)),
                state: Mutex::new(Registry::default()),
                ever_seen: self
                    .ever_seen
                    .unwrap_or_else(|| Arc::new(Mutex::new(HashSet::new()))),
                refresh_gate: Mutex::new(None),
                events,
            }),
        }
    }
}

impl DeviceManager {
    /// Manager over the system serial ports with default timeouts.
    pub fn new(policy: impl Fn(&PortInfo) -> Option<PortConfig> + Send + Sync + 'static) -> Self {
        DeviceManagerBuilder::new(policy).build()
    }

    pub fn builder(
        policy: impl Fn(&PortInfo) -> Option<PortConfig> + Send + Sync + 'static,
    ) -> DeviceManagerBuilder {
        DeviceManagerBuilder::new(policy)
    }

    /// Send `command` to the device with identity `device_id`.
    ///
    /// An unknown identity triggers an enumeration pass; the call then
    /// waits for the device to announce itself, up to the discovery
    /// deadline, before failing with [`RequestError::DeviceNotFound`].
    pub async fn request(
        &self,
        device_id: &str,
        command: impl Into<Vec<u8>>,
        options: RequestOptions,
    ) -> Result<String> {
        let command = command.into();
        if let Some(manager) = self.lookup(device_id).await {
            return manager.submit(command, options).await;
        }

        // Subscribe before refreshing so an identification that completes
        // mid-pass is not missed.
        let mut events = self.inner.events.subscribe();
        self.refresh().await;
        if let Some(manager) = self.lookup(device_id).await {
            return manager.submit(command, options).await;
        }

        log::debug!("waiting for device {} to appear", device_id);
        let deadline = tokio::time::Instant::now() + self.inner.discovery_timeout;
        loop {
            let event = match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Ok(event)) => event,
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => {
                    if let Some(manager) = self.lookup(device_id).await {
                        return manager.submit(command, options).await;
                    }
                    continue;
                }
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => {
                    return Err(RequestError::DeviceNotFound(device_id.to_string()));
                }
            };
            match event {
                DeviceEvent::New { id } | DeviceEvent::Connect { id } if id == device_id => {
                    let Some(manager) = self.lookup(device_id).await else {
                        return Err(RequestError::DeviceNotFound(device_id.to_string()));
                    };
                    return manager.submit(command, options).await;
                }
                _ => {}
            }
        }
    }

    /// Identities currently connected.
    pub async fn list_device_ids(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        state.devices.keys().cloned().collect()
    }

    /// Snapshots of currently-connected devices.
    pub async fn list_devices(&self) -> Vec<DeviceEntry> {
        let state = self.inner.state.lock().await;
        state
            .devices
            .iter()
            .map(|(id, record)| DeviceEntry {
                id: id.clone(),
                port_path: record.manager.path().to_string(),
                last_seen: record.last_seen,
            })
            .collect()
    }

    /// Paths with a port manager attached.
    pub async fn port_paths(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        state.port_managers.keys().cloned().collect()
    }

    /// The port manager currently holding `device_id`, if any.
    pub async fn lookup(&self, device_id: &str) -> Option<PortManager> {
        let state = self.inner.state.lock().await;
        state.devices.get(device_id).map(|r| r.manager.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.inner.events.subscribe()
    }

    /// Run an enumeration pass, adopting newly-appeared accepted ports.
    ///
    /// Calls made while a pass is in flight share its completion instead of
    /// starting another.
    pub async fn refresh(&self) {
        let mut completion = {
            let mut gate = self.inner.refresh_gate.lock().await;
            if let Some(rx) = gate.as_ref() {
                rx.clone()
            } else {
                let (tx, rx) = watch::channel(false);
                *gate = Some(rx.clone());
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    inner.run_refresh().await;
                    *inner.refresh_gate.lock().await = None;
                    let _ = tx.send(true);
                });
                rx
            }
        };
        while !*completion.borrow() {
            if completion.changed().await.is_err() {
                break;
            }
        }
    }
}

impl Inner {
    async fn run_refresh(self: &Arc<Self>) {
        let ports = match self.enumerator.list_ports().await {
            Ok(ports) => ports,
            Err(e) => {
                log::warn!("port enumeration failed: {}", e);
                return;
            }
        };
        log::debug!("enumeration found {} ports", ports.len());

        for info in ports {
            let Some(config) = (self.policy)(&info) else { continue };
            let mut state = self.state.lock().await;
            if state.port_managers.contains_key(&info.path) {
                continue;
            }
            log::info!("adopting port {}", info.path);
            let manager = PortManager::spawn(
                info.clone(),
                config,
                Arc::clone(&self.policy),
                Arc::clone(&self.enumerator),
                Arc::clone(&self.factory),
            );
            self.wire_port_events(&manager);
            state.port_managers.insert(info.path, manager);
        }
    }

    /// Translate one port manager's lifecycle events into identity events.
    fn wire_port_events(self: &Arc<Self>, manager: &PortManager) {
        let mut events = manager.subscribe();
        let path = manager.path().to_string();
        let inner = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("{}: dropped {} port events", path, n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(inner) = inner.upgrade() else { break };
                match event {
                    PortEvent::Ready { id }
                    | PortEvent::Reinitialized { id }
                    | PortEvent::IdChanged { id } => inner.device_connected(&id, &path).await,
                    PortEvent::Disconnected { id: Some(id) } => {
                        inner.device_disconnected(&id).await
                    }
                    _ => {}
                }
            }
        });
    }

    /// Point the identity at the port it now lives on and classify the
    /// sighting as first-ever or a reconnect.
    async fn device_connected(&self, id: &str, path: &str) {
        let mut state = self.state.lock().await;
        let Some(manager) = state.port_managers.get(path).cloned() else { return };
        state.devices.insert(
            id.to_string(),
            DeviceRecord {
                manager,
                last_seen: Utc::now(),
            },
        );
        drop(state);

        let first_sighting = self.ever_seen.lock().await.insert(id.to_string());
        let event = if first_sighting {
            log::info!("device {} discovered on {}", id, path);
            DeviceEvent::New { id: id.to_string() }
        } else {
            log::info!("device {} reconnected on {}", id, path);
            DeviceEvent::Connect { id: id.to_string() }
        };
        let _ = self.events.send(event);
    }

    async fn device_disconnected(&self, id: &str) {
        let mut state = self.state.lock().await;
        if state.devices.remove(id).is_some() {
            drop(state);
            log::info!("device {} disconnected", id);
            let _ = self.events.send(DeviceEvent::Disconnect { id: id.to_string() });
        }
    }
}
