//! Handle side of a port manager.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::serial::{PortEnumerator, PortInfo, TransportFactory};

use super::config::{OptionPolicy, PortConfig};
use super::task::PortTask;
use super::{PortEvent, PortStatus, RequestError, RequestOptions, Result};

const MAILBOX_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 64;

pub(crate) struct Submission {
    pub command: Vec<u8>,
    pub timeout: Option<Duration>,
    pub responder: oneshot::Sender<Result<String>>,
}

/// Cloneable handle to the task owning one port path.
///
/// The task lives for the rest of the process once spawned: it keeps the
/// port open, identified and serving requests across unplug/replug cycles.
/// Dropping every handle shuts the task down (only the process end or tests
/// do that).
#[derive(Clone)]
pub struct PortManager {
    path: Arc<str>,
    submit_tx: mpsc::Sender<Submission>,
    events: broadcast::Sender<PortEvent>,
    status_rx: watch::Receiver<PortStatus>,
    id_rx: watch::Receiver<Option<String>>,
    info_rx: watch::Receiver<PortInfo>,
}

impl PortManager {
    /// Spawn the managing task for `port_info.path`.
    ///
    /// `config` is the policy's verdict from the enumeration pass that found
    /// the port; the task re-derives it from `policy` on each reconnect.
    pub fn spawn(
        port_info: PortInfo,
        config: PortConfig,
        policy: OptionPolicy,
        enumerator: Arc<dyn PortEnumerator>,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let path: Arc<str> = port_info.path.as_str().into();
        let (submit_tx, submit_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (status_tx, status_rx) = watch::channel(PortStatus::NotFound);
        let (id_tx, id_rx) = watch::channel(None);
        let (info_tx, info_rx) = watch::channel(port_info.clone());

        let task = PortTask::new(
            port_info, config, policy, enumerator, factory, submit_rx, events.clone(), status_tx,
            id_tx, info_tx,
        );
        tokio::spawn(task.run());

        Self {
            path,
            submit_tx,
            events,
            status_rx,
            id_rx,
            info_rx,
        }
    }

    /// Queue a command and await its response.
    ///
    /// Admission fails fast (`NotReady`, `QueueFull`); an admitted request
    /// resolves or rejects exactly once, in FIFO order with its peers.
    pub async fn submit(
        &self,
        command: impl Into<Vec<u8>>,
        options: RequestOptions,
    ) -> Result<String> {
        let (responder, response) = oneshot::channel();
        self.submit_tx
            .send(Submission {
                command: command.into(),
                timeout: options.timeout,
                responder,
            })
            .await
            .map_err(|_| RequestError::Terminated)?;
        response.await.map_err(|_| RequestError::Terminated)?
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PortEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> PortStatus {
        *self.status_rx.borrow()
    }

    /// Watch channel mirroring the status machine, for callers that want to
    /// await readiness instead of polling.
    pub fn status_watch(&self) -> watch::Receiver<PortStatus> {
        self.status_rx.clone()
    }

    /// Identity most recently reported by the device on this port.
    pub fn device_id(&self) -> Option<String> {
        self.id_rx.borrow().clone()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Metadata from the latest enumeration pass that saw this port.
    pub fn port_info(&self) -> PortInfo {
        self.info_rx.borrow().clone()
    }
}
