//! Cyclic RTDE data exchange
//!
//! One owner task per session holds the RTDE socket. Each cycle it receives a
//! single message, publishes the decoded snapshot on a watch channel and then
//! drains queued pushes in FIFO order. Callers never touch the socket: they
//! read snapshots from the watch channel and hand pushes to the task over an
//! mpsc channel with a oneshot reply.

use crate::connection::{ConnectionState, Connector};
use crate::recipe::{Recipe, Value};
use crate::rtde::{self, MessageType, Negotiated};
use crate::snapshot::{SetpointBuffer, Snapshot};
use crate::supervisor::TelemetrySource;
use crate::{Result, URError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Session lifecycle. Mirrors the connection plus `Synchronized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Synchronized,
    Error,
}

impl From<ConnectionState> for SessionState {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Disconnected => SessionState::Disconnected,
            ConnectionState::Connecting => SessionState::Connecting,
            ConnectionState::Connected => SessionState::Connected,
            ConnectionState::Error => SessionState::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionSettings {
    /// Output feed frequency requested from the controller (Hz)
    pub frequency: f64,
    pub protocol_version: u16,
    /// How long `sample()` waits for a fresh snapshot
    pub sample_timeout: Duration,
    /// How long `push()` waits for the owner task to write the package
    pub push_timeout: Duration,
    /// Limit for a single receive in the owner task
    pub read_timeout: Duration,
    /// Limit for each handshake exchange
    pub handshake_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            frequency: 125.0,
            protocol_version: rtde::PROTOCOL_VERSION,
            sample_timeout: Duration::from_secs(1),
            push_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(2),
        }
    }
}

enum Command {
    Push {
        values: Vec<Value>,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Force a reconnect unless the socket was already replaced since `generation`
    Resync { generation: u64 },
}

/// Live RTDE session
pub struct RtdeSession {
    connector: Arc<Connector>,
    output: Arc<Recipe>,
    input: Arc<Recipe>,
    settings: SessionSettings,
    setpoints: Mutex<SetpointBuffer>,
    snapshots: watch::Receiver<Snapshot>,
    state: watch::Receiver<SessionState>,
    negotiated: Arc<Mutex<Negotiated>>,
    commands: mpsc::UnboundedSender<Command>,
    shutdown: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RtdeSession {
    /// Connect if needed, negotiate both recipes, start synchronization and spawn the cycle task
    pub async fn start(
        connector: Arc<Connector>,
        output: Recipe,
        input: Recipe,
        settings: SessionSettings,
    ) -> Result<Self> {
        let output = Arc::new(output);
        let input = Arc::new(input);
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);

        info!(addr = connector.addr(), outputs = output.len(), inputs = input.len(), "Starting RTDE session");
        let negotiated = match handshake(&connector, &output, &input, &settings).await {
            Ok(negotiated) => negotiated,
            Err(e) => {
                error!(addr = connector.addr(), "RTDE session failed to start: {}", e);
                state_tx.send_replace(SessionState::Error);
                return Err(e);
            }
        };
        state_tx.send_replace(SessionState::Synchronized);

        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::empty(Arc::clone(&output)));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let negotiated = Arc::new(Mutex::new(negotiated));

        let task = CycleTask {
            connector: Arc::clone(&connector),
            output: Arc::clone(&output),
            input: Arc::clone(&input),
            settings,
            generation: connector.generation(),
            sequence: 0,
            negotiated: Arc::clone(&negotiated),
            snapshots: snapshot_tx,
            state: state_tx,
            commands: command_rx,
            shutdown: Arc::clone(&shutdown),
        };
        let handle = tokio::spawn(task.run());

        Ok(Self {
            connector,
            setpoints: Mutex::new(SetpointBuffer::new(Arc::clone(&input))),
            output,
            input,
            settings,
            snapshots: snapshot_rx,
            state: state_rx,
            negotiated,
            commands: command_tx,
            shutdown,
            task: Mutex::new(Some(handle)),
        })
    }

    pub fn output_recipe(&self) -> &Arc<Recipe> {
        &self.output
    }

    pub fn input_recipe(&self) -> &Arc<Recipe> {
        &self.input
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn connector(&self) -> &Arc<Connector> {
        &self.connector
    }

    /// Recipe ids and controller version of the current negotiation
    pub fn negotiated(&self) -> Option<Negotiated> {
        self.negotiated.lock().ok().map(|n| n.clone())
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Watch receiver of every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.clone()
    }

    /// Cached snapshot, never blocks
    pub fn latest(&self) -> Snapshot {
        self.snapshots.borrow().clone()
    }

    /// Wait for the next snapshot.
    ///
    /// On timeout a reconnect is requested and the previous snapshot is
    /// returned marked stale.
    pub async fn sample(&self) -> Result<Snapshot> {
        let mut rx = self.snapshots.clone();
        let _ = rx.borrow_and_update();

        match tokio::time::timeout(self.settings.sample_timeout, rx.changed()).await {
            Ok(Ok(())) => Ok(rx.borrow_and_update().clone()),
            Ok(Err(_)) => Err(URError::InvalidState("RTDE session is closed".to_string())),
            Err(_) => {
                let previous = rx.borrow().clone();
                warn!(
                    sequence = previous.sequence,
                    timeout_ms = self.settings.sample_timeout.as_millis() as u64,
                    "No RTDE sample in time, requesting reconnect"
                );
                let _ = self.commands.send(Command::Resync {
                    generation: self.connector.generation(),
                });
                Ok(previous.into_stale())
            }
        }
    }

    /// Mutate the setpoint buffer under its lock
    pub fn update_setpoints<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut SetpointBuffer) -> Result<R>,
    {
        let mut buffer = self
            .setpoints
            .lock()
            .map_err(|_| URError::InvalidState("Setpoint buffer lock poisoned".to_string()))?;
        f(&mut buffer)
    }

    pub fn set_input(&self, name: &str, value: Value) -> Result<()> {
        self.update_setpoints(|buffer| buffer.set(name, value))
    }

    /// Send the current setpoint buffer and wait until it is written
    pub async fn push(&self) -> Result<()> {
        if self.input.is_empty() {
            return Err(URError::InvalidState("No input recipe negotiated".to_string()));
        }
        let values = self.update_setpoints(|buffer| Ok(buffer.values().to_vec()))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Push { values, reply: reply_tx })
            .map_err(|_| URError::InvalidState("RTDE session is closed".to_string()))?;

        match tokio::time::timeout(self.settings.push_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(URError::InvalidState("RTDE session stopped before the push was written".to_string())),
            Err(_) => Err(URError::Timeout(format!(
                "push not written within {:?}",
                self.settings.push_timeout
            ))),
        }
    }

    /// Stop the cycle task, pause synchronization and close the socket
    pub async fn close(&self) {
        self.shutdown.store(true, Ordering::Release);
        let handle = self.task.lock().ok().and_then(|mut task| task.take());

        if let Some(handle) = handle {
            let grace = self.settings.read_timeout + self.settings.handshake_timeout;
            let abort = handle.abort_handle();
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!("RTDE cycle task did not stop in time, aborting it");
                abort.abort();
            }

            if self.connector.is_connected() {
                match tokio::time::timeout(
                    self.settings.handshake_timeout,
                    rtde::pause(&self.connector, self.settings.handshake_timeout),
                )
                .await
                {
                    Ok(Ok(())) => debug!("RTDE synchronization paused"),
                    Ok(Err(e)) => debug!("Pause on close failed: {}", e),
                    Err(_) => debug!("Pause on close timed out"),
                }
            }
        }

        self.connector.disconnect().await;
        info!(addr = self.connector.addr(), "RTDE session closed");
    }
}

#[async_trait]
impl TelemetrySource for RtdeSession {
    async fn sample(&self) -> Result<Snapshot> {
        RtdeSession::sample(self).await
    }
}

impl Drop for RtdeSession {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Ok(mut task) = self.task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}

async fn handshake(
    connector: &Connector,
    output: &Recipe,
    input: &Recipe,
    settings: &SessionSettings,
) -> Result<Negotiated> {
    connector.connect().await?;
    rtde::negotiate(
        connector,
        output,
        Some(input),
        settings.protocol_version,
        settings.frequency,
        settings.handshake_timeout,
    )
    .await
}

/// State owned by the cycle task
struct CycleTask {
    connector: Arc<Connector>,
    output: Arc<Recipe>,
    input: Arc<Recipe>,
    settings: SessionSettings,
    /// Connector generation the current negotiation belongs to
    generation: u64,
    sequence: u64,
    negotiated: Arc<Mutex<Negotiated>>,
    snapshots: watch::Sender<Snapshot>,
    state: watch::Sender<SessionState>,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown: Arc<AtomicBool>,
}

impl CycleTask {
    async fn run(mut self) {
        debug!(addr = self.connector.addr(), "RTDE cycle task started");

        while !self.shutdown.load(Ordering::Acquire) {
            if self.connector.generation() != self.generation {
                match self.renegotiate().await {
                    Ok(()) => {}
                    Err(URError::RecipeRejected(reason)) => {
                        error!(addr = self.connector.addr(), "Recipe rejected during renegotiation: {}", reason);
                        self.set_state(SessionState::Error);
                        break;
                    }
                    Err(e) => {
                        warn!(addr = self.connector.addr(), "Renegotiation failed: {}", e);
                        self.set_state(SessionState::Error);
                        self.back_off().await;
                        continue;
                    }
                }
            }

            match rtde::read_frame(&self.connector, self.settings.read_timeout).await {
                Ok(frame) => self.handle_frame(frame.kind, &frame.payload),
                Err(e) => {
                    warn!(addr = self.connector.addr(), "RTDE receive failed: {}", e);
                    self.set_state(SessionState::from(self.connector.state()));
                    if !self.connector.is_connected() {
                        self.back_off().await;
                    }
                }
            }

            self.drain_commands().await;
        }

        self.fail_pending();
        debug!(addr = self.connector.addr(), "RTDE cycle task stopped");
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_if_modified(|current| {
            let from = *current;
            if from != state {
                info!(from = ?from, to = ?state, "RTDE session state changed");
                *current = state;
                true
            } else {
                false
            }
        });
    }

    /// Short pause before retrying while the connector has no socket
    async fn back_off(&self) {
        let delay = self.connector.policy().delay_for(0).min(self.settings.read_timeout);
        self.connector.clock().sleep(delay).await;
    }

    async fn renegotiate(&mut self) -> Result<()> {
        let generation = self.connector.generation();
        info!(addr = self.connector.addr(), generation, "Socket replaced, renegotiating recipes");
        self.set_state(SessionState::Connected);

        let negotiated = rtde::negotiate(
            &self.connector,
            &self.output,
            Some(&self.input),
            self.settings.protocol_version,
            self.settings.frequency,
            self.settings.handshake_timeout,
        )
        .await?;

        if let Ok(mut current) = self.negotiated.lock() {
            *current = negotiated;
        }
        self.generation = generation;
        self.set_state(SessionState::Synchronized);
        Ok(())
    }

    fn handle_frame(&mut self, kind: MessageType, payload: &[u8]) {
        match kind {
            MessageType::DataPackage => {
                let Some((&recipe_id, body)) = payload.split_first() else {
                    warn!("Empty data package");
                    return;
                };
                let expected = self.negotiated.lock().map(|n| n.output_id).unwrap_or(recipe_id);
                if recipe_id != expected {
                    debug!(recipe_id, expected, "Ignoring data package for another recipe");
                    return;
                }
                match rtde::decode_values(&self.output, body) {
                    Ok(values) => {
                        self.sequence += 1;
                        match Snapshot::from_values(Arc::clone(&self.output), values, self.sequence) {
                            Ok(snapshot) => {
                                self.snapshots.send_replace(snapshot);
                            }
                            Err(e) => warn!("Dropping data package: {}", e),
                        }
                    }
                    Err(e) => warn!("Failed to decode data package: {}", e),
                }
            }
            MessageType::TextMessage => rtde::log_text_message(&rtde::decode_text_message(payload)),
            other => debug!(kind = ?other, "Ignoring unexpected RTDE message"),
        }
    }

    async fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Push { values, reply } => {
                    if reply.is_closed() {
                        debug!("Skipping push whose caller gave up");
                        continue;
                    }
                    let result = self.write_setpoints(&values).await;
                    let _ = reply.send(result);
                }
                Command::Resync { generation } => {
                    if generation == self.connector.generation() {
                        info!(addr = self.connector.addr(), "Resynchronizing RTDE session");
                        self.connector.disconnect().await;
                        self.set_state(SessionState::Connecting);
                        if let Err(e) = self.connector.connect().await {
                            warn!(addr = self.connector.addr(), "Reconnect failed: {}", e);
                            self.set_state(SessionState::Error);
                        }
                    }
                }
            }
        }
    }

    async fn write_setpoints(&self, values: &[Value]) -> Result<()> {
        if self.connector.generation() != self.generation {
            return Err(URError::TransientIo(
                "connection replaced, setpoints wait for renegotiation".to_string(),
            ));
        }
        let input_id = self
            .negotiated
            .lock()
            .ok()
            .and_then(|n| n.input_id)
            .ok_or_else(|| URError::InvalidState("No input recipe negotiated".to_string()))?;
        let payload = rtde::encode_data_package(input_id, &self.input, values)?;
        rtde::send_frame(&self.connector, MessageType::DataPackage, &payload, self.settings.push_timeout).await
    }

    fn fail_pending(&mut self) {
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Push { reply, .. } = command {
                let _ = reply.send(Err(URError::InvalidState("RTDE session stopped".to_string())));
            }
        }
    }
}
