//! Request/response RPC facade over the native-messaging channel.
//!
//! One long-lived connection carries many concurrent logical requests. Every
//! outgoing message gets a fresh monotonically increasing id; the matching
//! inbound response carries the same id. Push messages (`settings`,
//! `bankingSession`) and host identity changes are surfaced as
//! [`BridgeEvent`]s on a broadcast channel instead of being matched against
//! pending requests.
//!
//! The bridge never returns errors to callers: if the host is unreachable or
//! the connection drops mid-flight, the caller receives a synthetic response
//! carrying only its request id. There is deliberately no request timeout —
//! a request whose response never arrives stays pending until a disconnect
//! resolves it; callers that depend on host restarts to unblock keep that
//! behavior.

mod channel;
mod gate;
mod pending;
mod reconnect;

pub use channel::{ChannelError, Connection, Connector, HostProcessConnector};
pub use reconnect::ReconnectPolicy;

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::protocol::{
    classify, server_identity, BankingSession, Inbound, OutboundMessage, Response,
};
use channel::MessageChannel;
use gate::InitGate;
use pending::PendingRequestRegistry;

/// Out-of-band notifications emitted by the bridge.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// First message of a connection arrived; the host is alive.
    Connected,
    /// The connection dropped; all pending requests were resolved empty.
    Disconnected,
    /// The host pushed new settings (raw settings object).
    SettingsChanged(Value),
    /// The host pushed a banking-session state change.
    BankingModeChanged(BankingSession),
    /// The host's identity marker changed: it restarted, and any state
    /// derived from the previous instance is stale.
    ServerRestarted,
}

struct BridgeState {
    channel: MessageChannel,
    pending: PendingRequestRegistry,
    gate: InitGate,
    reconnect: ReconnectPolicy,
    server_id: String,
    confirmed: bool,
}

struct BridgeInner {
    connector: Box<dyn Connector>,
    state: Mutex<BridgeState>,
    events: broadcast::Sender<BridgeEvent>,
}

/// The RPC bridge to the native host. Cheap to clone; all clones share one
/// connection, id space and event stream.
#[derive(Clone)]
pub struct NativeMessagingBridge {
    inner: Arc<BridgeInner>,
}

impl NativeMessagingBridge {
    pub fn new(connector: Box<dyn Connector>, config: BridgeConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(BridgeInner {
                connector,
                state: Mutex::new(BridgeState {
                    channel: MessageChannel::new(),
                    pending: PendingRequestRegistry::new(),
                    gate: InitGate::new(),
                    reconnect: ReconnectPolicy::new(
                        config.reconnect_cooldown,
                        config.max_connect_failures,
                    ),
                    server_id: String::new(),
                    confirmed: false,
                }),
                events,
            }),
        }
    }

    /// Subscribe to connection and push events.
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.inner.events.subscribe()
    }

    /// Send a message and wait for the correlated response. Resolves with a
    /// synthetic empty response if the host cannot be reached, the request
    /// cannot be transmitted, or the connection drops before the host
    /// answers. Responses may arrive in any order relative to other
    /// requests; correlation is purely by id.
    pub async fn send(&self, msg: OutboundMessage) -> Response {
        let rx = {
            let mut st = self.inner.state.lock().await;
            if !st.channel.is_connected() {
                self.inner.try_connect(&mut st).await;
            }
            let (id, rx) = st.pending.register();
            if !st.channel.is_connected() {
                warn!(id, "no connection to native host, resolving empty");
                st.pending.resolve_empty(id);
                rx
            } else {
                let ty = msg.message_type();
                let wire = msg.into_wire(id);
                match st.gate.admit(ty, wire) {
                    Some(wire) => {
                        debug!(id, ty = ty.wire_name(), "sending message");
                        if st.channel.send(wire).is_err() {
                            self.inner.disconnect_locked(&mut st);
                        }
                    }
                    None => {
                        debug!(id, ty = ty.wire_name(), "held until initialization");
                    }
                }
                rx
            }
        };
        match rx.await {
            Ok(response) => response,
            // The sender can only vanish if the bridge itself is dropped.
            Err(_) => Response::empty(0),
        }
    }

    /// Fire-and-forget send: an id is stamped on the wire but no completion
    /// is registered (tab-info and referrer notifications).
    pub async fn notify(&self, msg: OutboundMessage) {
        let mut st = self.inner.state.lock().await;
        if !st.channel.is_connected() {
            self.inner.try_connect(&mut st).await;
        }
        if !st.channel.is_connected() {
            debug!("dropping notification, no connection");
            return;
        }
        let id = st.pending.next_id();
        let ty = msg.message_type();
        if let Some(wire) = st.gate.admit(ty, msg.into_wire(id)) {
            if st.channel.send(wire).is_err() {
                self.inner.disconnect_locked(&mut st);
            }
        }
    }

    /// Mark the initialization handshake complete and flush messages that
    /// were held for it, in the order they were accepted.
    pub async fn notify_initialized(&self) {
        let mut st = self.inner.state.lock().await;
        let queued = st.gate.open();
        if queued.is_empty() {
            return;
        }
        info!(count = queued.len(), "flushing messages held for initialization");
        for wire in queued {
            if st.channel.send(wire).is_err() {
                self.inner.disconnect_locked(&mut st);
                break;
            }
        }
    }

    /// Whether a host identity marker has been observed yet.
    pub async fn is_server_id_valid(&self) -> bool {
        !self.inner.state.lock().await.server_id.is_empty()
    }

    pub async fn server_id(&self) -> String {
        self.inner.state.lock().await.server_id.clone()
    }

    /// Number of requests awaiting a response (diagnostics).
    pub async fn pending_requests(&self) -> usize {
        self.inner.state.lock().await.pending.len()
    }
}

impl BridgeInner {
    /// Attempt to open a connection, subject to the reconnect policy. Leaves
    /// the channel untouched when the policy denies the attempt.
    async fn try_connect(self: &Arc<Self>, st: &mut BridgeState) {
        let now = Instant::now();
        if !st.reconnect.attempt_allowed(now) {
            debug!(
                failures = st.reconnect.failures(),
                "connection attempt throttled"
            );
            return;
        }
        st.reconnect.record_attempt(now);
        match self.connector.connect().await {
            Ok(Connection { outbound, inbound }) => {
                let epoch = st.channel.attach(outbound);
                st.confirmed = false;
                info!(epoch, "connected to native host");
                tokio::spawn(Self::read_loop(Arc::clone(self), inbound, epoch));
            }
            Err(err) => {
                warn!(error = %err, "connecting to native host failed");
                st.reconnect.record_failure();
            }
        }
    }

    async fn read_loop(
        inner: Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<Value>,
        epoch: u64,
    ) {
        while let Some(msg) = inbound.recv().await {
            inner.handle_inbound(msg, epoch).await;
        }
        inner.handle_disconnect(epoch).await;
    }

    async fn handle_inbound(&self, msg: Value, epoch: u64) {
        let mut st = self.state.lock().await;
        if !st.channel.is_current(epoch) {
            return;
        }
        st.reconnect.reset();
        if !st.confirmed {
            st.confirmed = true;
            let _ = self.events.send(BridgeEvent::Connected);
        }
        self.check_server_identity(&mut st, &msg);
        match classify(msg) {
            Inbound::SettingsPush(settings) => {
                info!("settings push received");
                let _ = self.events.send(BridgeEvent::SettingsChanged(settings));
            }
            Inbound::BankingPush(session) => {
                info!(active = session.active, "banking mode changed");
                let _ = self.events.send(BridgeEvent::BankingModeChanged(session));
            }
            Inbound::Response(response) => {
                // A response may carry a settings object piggybacked next to
                // its payload; surface it before completing the request.
                if let Some(settings) = response.field("settings") {
                    let _ = self
                        .events
                        .send(BridgeEvent::SettingsChanged(settings.clone()));
                }
                debug!(id = response.id, "response received");
                st.pending.complete(response);
            }
            Inbound::Other(other) => {
                debug!(?other, "unroutable message from host");
            }
        }
    }

    fn check_server_identity(&self, st: &mut BridgeState, msg: &Value) {
        if let Some(server) = server_identity(msg) {
            if server != st.server_id {
                info!(server, "host identity changed");
                st.server_id = server.to_string();
                let _ = self.events.send(BridgeEvent::ServerRestarted);
            }
        }
    }

    async fn handle_disconnect(&self, epoch: u64) {
        let mut st = self.state.lock().await;
        if !st.channel.detach(epoch) {
            return;
        }
        self.after_detach(&mut st);
    }

    /// Disconnect the current connection while the state lock is held.
    fn disconnect_locked(&self, st: &mut BridgeState) {
        st.channel.detach_current();
        self.after_detach(st);
    }

    fn after_detach(&self, st: &mut BridgeState) {
        warn!(
            pending = st.pending.len(),
            queued = st.gate.queued_len(),
            "disconnected from native host"
        );
        st.reconnect.record_failure();
        st.gate.close();
        st.pending.drain();
        st.confirmed = false;
        let _ = self.events.send(BridgeEvent::Disconnected);
    }
}
