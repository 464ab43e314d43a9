//! Connection lifecycle management.
//!
//! One [`ConnectionManager`] owns one multiplexed session to the
//! event-stream endpoint. The session runs as a single task, which is what
//! guarantees there is never more than one outstanding reconnect attempt:
//! the loop either drives a live transport or sleeps between retries, but
//! never both.

pub mod transport;

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::error::{ConnectionError, TransportError};
use crate::events::MetricEvent;
use crate::protocol::{ClientFrame, ServerFrame};
use crate::subscription::{SubscriptionHandle, SubscriptionRegistry};

use transport::{Connector, Transport};

/// Lifecycle state of the session. Owned exclusively by the manager;
/// transitions are broadcast to listeners in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Errored,
}

impl ConnectionState {
    /// Returns a short label for display and logging.
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Errored => "ERRORED",
        }
    }
}

enum Command {
    Subscribe(String),
    Unsubscribe(String),
    Disconnect,
}

/// Owns the session to the event-stream endpoint.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    config: SyncConfig,
    registry: Arc<SubscriptionRegistry>,
    states: broadcast::Sender<ConnectionState>,
    state: Arc<RwLock<ConnectionState>>,
    commands: mpsc::Sender<Command>,
    /// Command receiver slot. `Some` while no session task is running;
    /// the session takes it on connect and restores it on exit.
    commands_rx: Arc<Mutex<Option<mpsc::Receiver<Command>>>>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        registry: Arc<SubscriptionRegistry>,
        config: SyncConfig,
    ) -> Self {
        let (states, _) = broadcast::channel(64);
        let (commands, commands_rx) = mpsc::channel(64);
        Self {
            connector,
            config,
            registry,
            states,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            commands,
            commands_rx: Arc::new(Mutex::new(Some(commands_rx))),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Subscribe to connection-state transitions. Each listener receives
    /// transitions in order; a slow listener may lag and observe a gap.
    pub fn states(&self) -> broadcast::Receiver<ConnectionState> {
        self.states.subscribe()
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Register interest in a channel, routing its decoded events into
    /// `sender`.
    ///
    /// Safe to call before `connect()`: the binding is recorded now and
    /// the wire subscription is issued when the session comes up (and
    /// re-issued after every reconnect).
    pub async fn subscribe(
        &self,
        channel: &str,
        sender: mpsc::Sender<MetricEvent>,
    ) -> SubscriptionHandle {
        let handle = self.registry.subscribe(channel, sender);
        if self.commands_rx.lock().is_none() {
            // A session is running; tell it to subscribe on the wire now.
            let _ = self.commands.send(Command::Subscribe(channel.to_string())).await;
        }
        handle
    }

    /// Drop a subscription. Unknown handles are a safe no-op.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) {
        if let Some(channel) = self.registry.unsubscribe(handle) {
            if self.commands_rx.lock().is_none() {
                let _ = self.commands.send(Command::Unsubscribe(channel)).await;
            }
        }
    }

    /// Establish the session.
    ///
    /// Performs the transport handshake inline: on success the session
    /// task is spawned, all tracked channels are subscribed, and the state
    /// is `Connected`. A rejected handshake fails here without retrying;
    /// reconnection only applies to sessions that drop after having been
    /// established.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let mut commands = self
            .commands_rx
            .lock()
            .take()
            .ok_or(ConnectionError::AlreadyConnected)?;
        // Discard anything queued for a previous session.
        while commands.try_recv().is_ok() {}

        self.set_state(ConnectionState::Connecting);
        let transport = match handshake(self.connector.as_ref(), &self.config).await {
            Ok(transport) => transport,
            Err(e) => {
                self.set_state(ConnectionState::Errored);
                self.set_state(ConnectionState::Disconnected);
                *self.commands_rx.lock() = Some(commands);
                return Err(e.into());
            }
        };
        self.set_state(ConnectionState::Connected);

        let session = Session {
            connector: Arc::clone(&self.connector),
            config: self.config.clone(),
            registry: Arc::clone(&self.registry),
            states: self.states.clone(),
            state: Arc::clone(&self.state),
            commands,
            subscribed: HashSet::new(),
        };
        tokio::spawn(session.run(transport, Arc::clone(&self.commands_rx)));
        Ok(())
    }

    /// Tear the session down cleanly: every channel is unsubscribed and
    /// all handler queues are released before the transport closes.
    ///
    /// Resolves once the state has settled at `Disconnected`.
    pub async fn disconnect(&self) {
        if self.commands_rx.lock().is_some() {
            // No session running; just release the bindings.
            self.registry.clear();
            self.set_state(ConnectionState::Disconnected);
            return;
        }
        let mut states = self.states.subscribe();
        if self.commands.send(Command::Disconnect).await.is_ok() {
            while self.state() != ConnectionState::Disconnected {
                if states.recv().await.is_err() {
                    break;
                }
            }
        }
    }

    fn set_state(&self, next: ConnectionState) {
        set_state(&self.state, &self.states, next);
    }
}

fn set_state(
    state: &RwLock<ConnectionState>,
    states: &broadcast::Sender<ConnectionState>,
    next: ConnectionState,
) {
    let changed = {
        let mut current = state.write();
        let changed = *current != next;
        *current = next;
        changed
    };
    if changed {
        info!(state = next.label(), "connection state");
        // No listeners is fine.
        let _ = states.send(next);
    }
}

/// Dial and complete the CONNECT/CONNECTED handshake.
async fn handshake(
    connector: &dyn Connector,
    config: &SyncConfig,
) -> Result<Box<dyn Transport>, TransportError> {
    let mut transport = connector.connect().await?;
    transport.send(&ClientFrame::Connect).await?;
    let reply = tokio::time::timeout(config.handshake_timeout, transport.recv())
        .await
        .map_err(|_| TransportError::Timeout("handshake reply"))??;
    match reply {
        Some(ServerFrame::Connected) => Ok(transport),
        Some(other) => Err(TransportError::Handshake(format!(
            "expected CONNECTED, got {other:?}"
        ))),
        None => Err(TransportError::Closed),
    }
}

/// Why the per-transport drive loop ended.
enum SessionExit {
    /// Clean teardown was requested (or the manager went away).
    Disconnect,
    /// The transport dropped; reconnect.
    Dropped,
}

struct Session {
    connector: Arc<dyn Connector>,
    config: SyncConfig,
    registry: Arc<SubscriptionRegistry>,
    states: broadcast::Sender<ConnectionState>,
    state: Arc<RwLock<ConnectionState>>,
    commands: mpsc::Receiver<Command>,
    /// Channels subscribed on the *current* transport. Cleared on
    /// reconnect so the replay is idempotent per session.
    subscribed: HashSet<String>,
}

impl Session {
    async fn run(
        mut self,
        mut transport: Box<dyn Transport>,
        slot: Arc<Mutex<Option<mpsc::Receiver<Command>>>>,
    ) {
        // Initial replay covers subscriptions issued before connect().
        if self.replay(transport.as_mut()).await.is_err() {
            self.set_state(ConnectionState::Errored);
            if !self.reconnect(&mut transport).await {
                self.finish(slot);
                return;
            }
        }

        loop {
            match self.drive(transport.as_mut()).await {
                SessionExit::Disconnect => {
                    self.set_state(ConnectionState::Disconnected);
                    self.finish(slot);
                    return;
                }
                SessionExit::Dropped => {
                    self.set_state(ConnectionState::Errored);
                    if !self.reconnect(&mut transport).await {
                        self.finish(slot);
                        return;
                    }
                }
            }
        }
    }

    /// Fixed-delay retry loop. Returns false when the attempt budget is
    /// exhausted or a disconnect arrives mid-outage, leaving the state at
    /// `Disconnected`.
    async fn reconnect(&mut self, transport: &mut Box<dyn Transport>) -> bool {
        let mut attempts = 0u32;
        loop {
            if attempts >= self.config.max_reconnect_attempts {
                error!(
                    attempts,
                    "reconnect attempts exhausted, giving up on the session"
                );
                self.set_state(ConnectionState::Disconnected);
                return false;
            }
            attempts += 1;
            if !self.wait_out_delay().await {
                return false;
            }
            self.set_state(ConnectionState::Connecting);
            match handshake(self.connector.as_ref(), &self.config).await {
                Ok(fresh) => {
                    *transport = fresh;
                    self.subscribed.clear();
                    self.set_state(ConnectionState::Connected);
                    if self.replay(transport.as_mut()).await.is_err() {
                        warn!("replay failed on fresh transport, retrying");
                        self.set_state(ConnectionState::Errored);
                        continue;
                    }
                    info!(attempt = attempts, "reconnected");
                    return true;
                }
                Err(e) => {
                    warn!(attempt = attempts, error = %e, "reconnect attempt failed");
                    self.set_state(ConnectionState::Errored);
                }
            }
        }
    }

    /// Sleep out the retry delay while staying responsive to commands.
    /// Returns false when a disconnect arrived, so the retry loop aborts
    /// instead of spending the rest of its attempt budget.
    async fn wait_out_delay(&mut self) -> bool {
        let delay = tokio::time::sleep(self.config.reconnect_delay);
        tokio::pin!(delay);
        loop {
            tokio::select! {
                _ = &mut delay => return true,
                command = self.commands.recv() => match command {
                    Some(Command::Disconnect) | None => {
                        info!("disconnect requested during outage, abandoning retries");
                        self.registry.clear();
                        self.set_state(ConnectionState::Disconnected);
                        return false;
                    }
                    // Subscription changes already landed in the registry;
                    // the replay after the next handshake picks them up.
                    Some(_) => continue,
                },
            }
        }
    }

    /// Re-issue a SUBSCRIBE for every tracked channel, deduped against
    /// what the current transport already has.
    async fn replay(&mut self, transport: &mut dyn Transport) -> Result<(), TransportError> {
        for channel in self.registry.channels() {
            self.open_channel(transport, &channel).await?;
        }
        Ok(())
    }

    async fn open_channel(
        &mut self,
        transport: &mut dyn Transport,
        channel: &str,
    ) -> Result<(), TransportError> {
        if !self.subscribed.insert(channel.to_string()) {
            debug!(channel, "already subscribed on this transport");
            return Ok(());
        }
        transport
            .send(&ClientFrame::Subscribe {
                channel: channel.to_string(),
            })
            .await
    }

    /// Drive one live transport until it drops or a disconnect arrives.
    async fn drive(&mut self, transport: &mut dyn Transport) -> SessionExit {
        let period = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut unacked_pings = 0u32;

        loop {
            tokio::select! {
                frame = transport.recv() => match frame {
                    Ok(Some(ServerFrame::Message { channel, body })) => {
                        self.registry.dispatch(&channel, body).await;
                    }
                    Ok(Some(ServerFrame::Pong)) => {
                        unacked_pings = 0;
                    }
                    Ok(Some(ServerFrame::Connected)) => {
                        debug!("late CONNECTED frame ignored");
                    }
                    Ok(Some(ServerFrame::Error { message })) => {
                        warn!(message, "server reported an error");
                    }
                    Ok(None) => {
                        warn!("connection closed by peer");
                        return SessionExit::Dropped;
                    }
                    Err(e) => {
                        warn!(error = %e, "transport failed");
                        return SessionExit::Dropped;
                    }
                },
                _ = heartbeat.tick() => {
                    if unacked_pings >= self.config.heartbeat_missed_limit {
                        warn!(unacked_pings, "heartbeats unacknowledged, dropping connection");
                        return SessionExit::Dropped;
                    }
                    if let Err(e) = transport.send(&ClientFrame::Ping).await {
                        warn!(error = %e, "heartbeat send failed");
                        return SessionExit::Dropped;
                    }
                    unacked_pings += 1;
                },
                command = self.commands.recv() => match command {
                    Some(Command::Subscribe(channel)) => {
                        if !self.registry.contains(&channel) {
                            // Unsubscribed again before we got here.
                            continue;
                        }
                        if let Err(e) = self.open_channel(transport, &channel).await {
                            warn!(error = %e, "subscribe send failed");
                            return SessionExit::Dropped;
                        }
                    }
                    Some(Command::Unsubscribe(channel)) => {
                        if self.subscribed.remove(&channel) {
                            if let Err(e) = transport
                                .send(&ClientFrame::Unsubscribe { channel })
                                .await
                            {
                                warn!(error = %e, "unsubscribe send failed");
                                return SessionExit::Dropped;
                            }
                        }
                    }
                    Some(Command::Disconnect) => {
                        self.shutdown(transport).await;
                        return SessionExit::Disconnect;
                    }
                    None => {
                        // Manager dropped; tear down quietly.
                        self.shutdown(transport).await;
                        return SessionExit::Disconnect;
                    }
                },
            }
        }
    }

    /// Unsubscribe every channel, release all handler queues, then close.
    async fn shutdown(&mut self, transport: &mut dyn Transport) {
        for channel in self.subscribed.drain() {
            let _ = transport.send(&ClientFrame::Unsubscribe { channel }).await;
        }
        self.registry.clear();
        let _ = transport.send(&ClientFrame::Disconnect).await;
        debug!("session shut down");
    }

    fn set_state(&self, next: ConnectionState) {
        set_state(&self.state, &self.states, next);
    }

    /// Restore the command receiver so a later `connect()` can start a
    /// fresh session.
    fn finish(self, slot: Arc<Mutex<Option<mpsc::Receiver<Command>>>>) {
        *slot.lock() = Some(self.commands);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_labels() {
        assert_eq!(ConnectionState::Disconnected.label(), "DISCONNECTED");
        assert_eq!(ConnectionState::Connecting.label(), "CONNECTING");
        assert_eq!(ConnectionState::Connected.label(), "CONNECTED");
        assert_eq!(ConnectionState::Errored.label(), "ERRORED");
    }
}
