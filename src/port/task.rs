//! The task behind a [`PortManager`]: one event loop owning the transport
//! handle, the request queue, the receive buffer and every timer for a
//! single port path.
//!
//! All state transitions happen between awaits of the `select!` loop in
//! [`PortTask::run`], so the machine needs no locks: the mailbox, the
//! transport event stream and the three deadline slots are the only inputs.
//!
//! Responses are framed by quiescence. The wire protocol has no delimiters
//! or length prefixes to lean on, so a response is considered complete once
//! the line has been silent for the request's window; every arriving chunk
//! pushes the window out again.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};

use crate::serial::{PortEnumerator, PortInfo, Transport, TransportEvent, TransportFactory};

use super::config::{OptionPolicy, PortConfig};
use super::manager::Submission;
use super::{PortEvent, PortStatus, RequestError, INIT_DELAY, RETRY_DELAY};

struct Request {
    command: Vec<u8>,
    timeout: Duration,
    responder: Option<oneshot::Sender<Result<String, RequestError>>>,
    /// Identity observed at enqueue time; `None` exempts the request from
    /// the stale-identity check (the probe, and probes submitted before the
    /// first identification).
    captured_id: Option<String>,
    probe: bool,
}

impl Request {
    fn probe(command: Vec<u8>, timeout: Duration) -> Self {
        Self {
            command,
            timeout,
            responder: None,
            captured_id: None,
            probe: true,
        }
    }

    fn resolve(mut self, response: String) {
        if let Some(tx) = self.responder.take() {
            let _ = tx.send(Ok(response));
        }
    }

    fn reject(mut self, error: RequestError) {
        if let Some(tx) = self.responder.take() {
            let _ = tx.send(Err(error));
        }
    }
}

pub(crate) struct PortTask {
    path: String,
    policy: OptionPolicy,
    enumerator: Arc<dyn PortEnumerator>,
    factory: Arc<dyn TransportFactory>,
    config: PortConfig,
    status: PortStatus,
    device_id: Option<String>,
    queue: VecDeque<Request>,
    rx_buffer: Vec<u8>,
    transport: Option<Box<dyn Transport>>,
    transport_events: Option<mpsc::Receiver<TransportEvent>>,
    /// Armed while the head request is on the wire collecting its response.
    quiescence_deadline: Option<Instant>,
    /// Armed for the initial identification delay and InitFailed retries.
    init_deadline: Option<Instant>,
    /// Armed while waiting to probe enumeration for a lost port.
    retry_deadline: Option<Instant>,
    submit_rx: mpsc::Receiver<Submission>,
    events: broadcast::Sender<PortEvent>,
    status_tx: watch::Sender<PortStatus>,
    id_tx: watch::Sender<Option<String>>,
    info_tx: watch::Sender<PortInfo>,
}

impl PortTask {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        port_info: PortInfo,
        config: PortConfig,
        policy: OptionPolicy,
        enumerator: Arc<dyn PortEnumerator>,
        factory: Arc<dyn TransportFactory>,
        submit_rx: mpsc::Receiver<Submission>,
        events: broadcast::Sender<PortEvent>,
        status_tx: watch::Sender<PortStatus>,
        id_tx: watch::Sender<Option<String>>,
        info_tx: watch::Sender<PortInfo>,
    ) -> Self {
        Self {
            path: port_info.path.clone(),
            policy,
            enumerator,
            factory,
            config,
            status: PortStatus::NotFound,
            device_id: None,
            queue: VecDeque::new(),
            rx_buffer: Vec::new(),
            transport: None,
            transport_events: None,
            quiescence_deadline: None,
            init_deadline: None,
            retry_deadline: None,
            submit_rx,
            events,
            status_tx,
            id_tx,
            info_tx,
        }
    }

    pub(crate) async fn run(mut self) {
        // The creating enumeration pass just saw this port; go straight to
        // opening it instead of waiting out a retry tick.
        self.connect().await;

        loop {
            self.pump().await;

            let quiescence = self.quiescence_deadline;
            let init = self.init_deadline;
            let retry = self.retry_deadline;
            let transport_events = self.transport_events.as_mut();

            tokio::select! {
                submission = self.submit_rx.recv() => match submission {
                    Some(submission) => self.admit(submission),
                    None => break,
                },
                event = recv_opt(transport_events) => {
                    self.on_transport_event(event).await;
                }
                _ = sleep_opt(quiescence), if quiescence.is_some() => {
                    self.finish_head().await;
                }
                _ = sleep_opt(init), if init.is_some() => {
                    self.init_deadline = None;
                    self.begin_identification();
                }
                _ = sleep_opt(retry), if retry.is_some() => {
                    self.retry_deadline = None;
                    self.reconnect_tick().await;
                }
            }
        }

        log::debug!("{}: port task shutting down", self.path);
        for request in self.queue.drain(..) {
            request.reject(RequestError::Terminated);
        }
    }

    /// Admission gate. The identification probe (matched by command bytes)
    /// bypasses the readiness check; everything is subject to the queue
    /// bound. The bound is checked before the push, so the effective
    /// capacity is `max_queue_length + 1` pending entries.
    fn admit(&mut self, submission: Submission) {
        let Submission {
            command,
            timeout,
            responder,
        } = submission;

        if command != self.config.get_id_command && self.status != PortStatus::Ready {
            let _ = responder.send(Err(RequestError::NotReady));
            return;
        }
        if self.queue.len() > self.config.max_queue_length {
            log::debug!("{}: rejecting request, queue full", self.path);
            let _ = responder.send(Err(RequestError::QueueFull));
            return;
        }
        self.queue.push_back(Request {
            command,
            timeout: timeout.unwrap_or(self.config.serial_response_timeout),
            responder: Some(responder),
            captured_id: self.device_id.clone(),
            probe: false,
        });
    }

    /// Start the head request if nothing is on the wire and the port can
    /// take it. Stale requests are failed here, on their way to the head.
    async fn pump(&mut self) {
        while self.quiescence_deadline.is_none() {
            let (stale, probe, command, timeout) = {
                let Some(head) = self.queue.front() else { break };
                let writable =
                    self.transport.is_some() && (head.probe || self.status == PortStatus::Ready);
                if !writable {
                    break;
                }
                (
                    head.captured_id.is_some() && head.captured_id != self.device_id,
                    head.probe,
                    head.command.clone(),
                    head.timeout,
                )
            };

            if stale {
                if let Some(request) = self.queue.pop_front() {
                    log::debug!(
                        "{}: failing request captured under {:?}, identity is now {:?}",
                        self.path,
                        request.captured_id,
                        self.device_id
                    );
                    request.reject(RequestError::StaleIdentity);
                }
                continue;
            }

            let Some(transport) = self.transport.as_mut() else { break };
            match transport.write(&command).await {
                Ok(()) => {
                    self.rx_buffer.clear();
                    self.quiescence_deadline = Some(Instant::now() + timeout);
                }
                Err(e) => {
                    let Some(request) = self.queue.pop_front() else { break };
                    if probe {
                        self.identification_failed(&format!("probe write failed: {e}"));
                    } else {
                        log::warn!("{}: write failed: {}", self.path, e);
                        request.reject(RequestError::WriteFailed(e.to_string()));
                        self.handle_write_error().await;
                    }
                    break;
                }
            }
        }
    }

    /// Quiescence reached: the response is whatever accumulated since the
    /// write. The buffer is emptied before anything else runs.
    async fn finish_head(&mut self) {
        self.quiescence_deadline = None;
        let Some(request) = self.queue.pop_front() else { return };
        let buffer = std::mem::take(&mut self.rx_buffer);

        if request.probe {
            // A probe outliving its transport has nothing to report; the
            // reconnect loop owns recovery from here.
            if self.transport.is_some() {
                self.complete_identification(&buffer);
            }
            return;
        }

        if let Some(check) = self.config.check_response.clone() {
            if !check(&buffer) {
                log::debug!(
                    "{}: response failed validation ({} bytes)",
                    self.path,
                    buffer.len()
                );
                request.reject(RequestError::ValidationFailed);
                return;
            }
        }
        request.resolve(String::from_utf8_lossy(&buffer).into_owned());
    }

    fn begin_identification(&mut self) {
        if self.transport.is_none() {
            return;
        }
        self.set_status(PortStatus::Identifying, "identifying device");
        // A probe may already be queued from before a reconnect; reuse it.
        if self.queue.front().is_none_or(|head| !head.probe) {
            self.queue.push_front(Request::probe(
                self.config.get_id_command.clone(),
                self.config.serial_response_timeout,
            ));
        }
    }

    fn complete_identification(&mut self, buffer: &[u8]) {
        if buffer.is_empty() {
            return self.identification_failed("empty identification response");
        }
        if let Some(check) = &self.config.check_response {
            if !check(buffer) {
                return self.identification_failed("identification response failed validation");
            }
        }
        let id = match (self.config.get_id_parser)(buffer) {
            Some(id) if !id.is_empty() => id,
            _ => return self.identification_failed("identification response did not parse"),
        };

        match self.device_id.clone() {
            None => {
                self.device_id = Some(id.clone());
                let _ = self.id_tx.send(Some(id.clone()));
                log::info!("{}: device {} ready", self.path, id);
                self.set_status(PortStatus::Ready, "device identified");
                self.emit(PortEvent::Ready { id });
            }
            Some(previous) if previous == id => {
                self.set_status(PortStatus::Ready, "device re-identified");
                self.emit(PortEvent::Reinitialized { id });
            }
            Some(previous) => {
                self.device_id = Some(id.clone());
                let _ = self.id_tx.send(Some(id.clone()));
                log::info!(
                    "{}: identity changed from {} to {}",
                    self.path,
                    previous,
                    id
                );
                self.set_status(PortStatus::Ready, "device identity changed");
                self.emit(PortEvent::IdChanged { id });
            }
        }
    }

    fn identification_failed(&mut self, why: &str) {
        log::warn!("{}: identification failed: {}", self.path, why);
        self.set_status(PortStatus::InitFailed, why);
        // Overwrites any pending attempt; at most one timer is armed.
        self.init_deadline = Some(Instant::now() + RETRY_DELAY);
    }

    /// A rejected write means the port is in an unknown state; close it and
    /// let the reconnect loop start over. Queued requests are preserved.
    async fn handle_write_error(&mut self) {
        self.set_status(PortStatus::Closing, "closing port after write error");
        self.init_deadline = None;
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        // The Closed event on the transport channel completes the handoff.
    }

    async fn on_transport_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Data(bytes)) => {
                if self.quiescence_deadline.is_some() {
                    self.rx_buffer.extend_from_slice(&bytes);
                    // Bytes are still arriving; push the window out.
                    let timeout = self
                        .queue
                        .front()
                        .map(|head| head.timeout)
                        .unwrap_or(self.config.serial_response_timeout);
                    self.quiescence_deadline = Some(Instant::now() + timeout);
                } else {
                    log::debug!(
                        "{}: dropping {} unsolicited bytes",
                        self.path,
                        bytes.len()
                    );
                }
            }
            Some(TransportEvent::Error(message)) => {
                log::error!("{}: transport error: {}", self.path, message);
                self.emit(PortEvent::Error {
                    message: message.clone(),
                });
                self.drop_transport();
                self.set_status(PortStatus::Error, &message);
                self.retry_deadline = Some(Instant::now() + RETRY_DELAY);
            }
            Some(TransportEvent::Disconnected) => {
                log::info!("{}: port disconnected", self.path);
                self.drop_transport();
                self.set_status(PortStatus::Disconnected, "port disconnected");
                self.emit(PortEvent::Disconnected {
                    id: self.device_id.clone(),
                });
                // Probe enumeration right away; only a miss waits.
                self.reconnect_tick().await;
            }
            Some(TransportEvent::Closed) | None => {
                self.drop_transport();
                self.set_status(PortStatus::Closed, "port closed");
                self.emit(PortEvent::Closed);
                self.reconnect_tick().await;
            }
        }
    }

    fn drop_transport(&mut self) {
        self.transport = None;
        self.transport_events = None;
        self.init_deadline = None;
    }

    /// One pass of the reconnect loop: look for the path in enumeration,
    /// re-derive the config (metadata may have changed on replug), reopen.
    async fn reconnect_tick(&mut self) {
        let ports = match self.enumerator.list_ports().await {
            Ok(ports) => ports,
            Err(e) => {
                log::warn!("{}: enumeration failed: {}", self.path, e);
                self.retry_deadline = Some(Instant::now() + RETRY_DELAY);
                return;
            }
        };
        let Some(info) = ports.into_iter().find(|p| p.path == self.path) else {
            self.set_status(PortStatus::NotFound, "port absent from enumeration");
            self.retry_deadline = Some(Instant::now() + RETRY_DELAY);
            return;
        };

        let _ = self.info_tx.send(info.clone());
        match (self.policy)(&info) {
            Some(config) => {
                self.config = config;
                self.connect().await;
            }
            None => {
                // Metadata changed and the policy no longer wants this
                // port; keep probing, it may change back.
                self.set_status(PortStatus::NotFound, "port no longer accepted by policy");
                self.retry_deadline = Some(Instant::now() + RETRY_DELAY);
            }
        }
    }

    async fn connect(&mut self) {
        match self.factory.open(&self.path, self.config.baud_rate).await {
            Ok((transport, events)) => {
                log::info!("{}: open at {} baud", self.path, self.config.baud_rate);
                self.transport = Some(transport);
                self.transport_events = Some(events);
                self.set_status(PortStatus::Open, "port open");
                self.emit(PortEvent::Opened);
                self.init_deadline = Some(Instant::now() + INIT_DELAY);
            }
            Err(e) => {
                log::warn!("{}: open failed: {}", self.path, e);
                self.emit(PortEvent::Error {
                    message: e.to_string(),
                });
                self.set_status(PortStatus::Error, &e.to_string());
                self.retry_deadline = Some(Instant::now() + RETRY_DELAY);
            }
        }
    }

    fn set_status(&mut self, status: PortStatus, message: &str) {
        if self.status == status {
            return;
        }
        log::debug!(
            "{}: status {} -> {} ({})",
            self.path,
            self.status.label(),
            status.label(),
            message
        );
        self.status = status;
        let _ = self.status_tx.send(status);
        self.emit(PortEvent::StatusChanged {
            status,
            message: message.to_string(),
        });
    }

    fn emit(&self, event: PortEvent) {
        let _ = self.events.send(event);
    }
}

async fn recv_opt(rx: Option<&mut mpsc::Receiver<TransportEvent>>) -> Option<TransportEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
