//! Connection lifecycle state machine atop the link table (§4.D).
//!
//! Grounded on the teacher crate's `net::connections::manager::ConnectionManager` for the
//! addr-keyed table and `process_connect`/`update`/`disconnect_connection` shape, and on
//! `net::connections::connection::Connection` for per-peer state plus a periodic `update`. The
//! teacher's manager hands out a synthetic numeric client id and runs a salt/challenge handshake;
//! this one instead drives the four-message password handshake this format defines and tracks the
//! nine-state machine (`ConnectionState`) directly against each `Link`, since there is no
//! multi-round challenge here -- a single `ConnectRequest`/`ConnectAccept` exchange.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};
use parking_lot::Mutex;
use rand::Rng;

use crate::config::{NodeConfig, KEEP_ALIVE_GRACE};
use crate::endpoint::Endpoint;
use crate::error::{ConnectResult, DisconnectReason};
use crate::header::{ControlDataId, HeaderType};
use crate::hub::ReceiveHub;
use crate::link::Link;

/// Per-link connection state machine (§3 "Connection state (per link)").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    InitiateTimedOut,
    InvalidPassword,
    MaxConnectionsReached,
    InvalidConnectPacket,
    Connected,
    ConnectionTimedOut,
    Disconnected,
}

/// States the connection never leaves once entered -- the slot they occupy is only actually freed
/// once the hub sweeps the underlying link (§4.D, §8 scenario 5), not the instant they're set.
fn is_terminal(state: ConnectionState) -> bool {
    matches!(
        state,
        ConnectionState::InitiateTimedOut
            | ConnectionState::InvalidPassword
            | ConnectionState::MaxConnectionsReached
            | ConnectionState::InvalidConnectPacket
            | ConnectionState::ConnectionTimedOut
            | ConnectionState::Disconnected
    )
}

/// An event the receive/send threads observed and that `Node::update()` must replay on the
/// application thread as a user callback (§4.D, §5's "callbacks fire only from `update()`").
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    ConnectResult {
        endpoint: Endpoint,
        result: ConnectResult,
    },
    NewConnection {
        endpoint: Endpoint,
    },
    /// `direct` is true when this endpoint's own link disconnected; false when it is a relayed
    /// `RemoteDisconnected` about some other peer in the same server's star topology.
    Disconnect {
        direct: bool,
        endpoint: Endpoint,
        reason: DisconnectReason,
    },
}

struct Connection {
    endpoint: Endpoint,
    link: Arc<Link>,
    state: ConnectionState,
    connect_started_at: Option<Instant>,
    last_keep_alive: Instant,
    awaiting_keep_alive_reply: bool,
    connect_timeout: Duration,
    keep_alive_interval: Duration,
}

/// Server-mode listen configuration; `None` means this node only makes outbound connections.
struct ListenState {
    password: String,
    max_connections: usize,
}

/// Tracks per-endpoint [`Connection`]s atop the link table and drives the password handshake,
/// keep-alive, and disconnect/relay policy (§4.D).
pub struct ConnectionManager {
    hub: Arc<ReceiveHub>,
    config: NodeConfig,
    connections: Mutex<HashMap<Endpoint, Connection>>,
    events: Mutex<VecDeque<ConnectionEvent>>,
    listen: Mutex<Option<ListenState>>,
}

impl ConnectionManager {
    pub fn new(hub: Arc<ReceiveHub>, config: NodeConfig) -> Self {
        Self {
            hub,
            config,
            connections: Mutex::new(HashMap::new()),
            events: Mutex::new(VecDeque::new()),
            listen: Mutex::new(None),
        }
    }

    /// Enables inbound `ConnectRequest` acceptance and sets the password/capacity gate (§4.D).
    pub fn listen(&self, password: &str, max_connections: usize) {
        *self.listen.lock() = Some(ListenState {
            password: password.to_string(),
            max_connections,
        });
    }

    fn is_server(&self) -> bool {
        self.listen.lock().is_some()
    }

    /// `isConnectionKnown` stays true through a terminal state (`Disconnected` and friends) for as
    /// long as the underlying link lingers in the hub, then turns false once the link is actually
    /// swept (§8 scenario 5) -- never permanently, which is what a bare `contains_key` would give.
    pub fn is_connection_known(&self, endpoint: Endpoint) -> bool {
        self.prune_swept();
        self.connections.lock().contains_key(&endpoint)
    }

    /// Drops every tracked entry whose state is terminal and whose link the hub has already swept
    /// out of its table, so a disconnected/rejected/timed-out endpoint's slot frees up for a fresh
    /// `connect`/`ConnectRequest` instead of being held forever (§4.D, §8 scenario 5).
    fn prune_swept(&self) {
        let mut connections = self.connections.lock();
        connections.retain(|endpoint, conn| !(is_terminal(conn.state) && !self.hub.is_known(*endpoint)));
    }

    /// Drains events accumulated since the last call, for `Node::update()` to replay as callbacks.
    pub fn drain_events(&self) -> Vec<ConnectionEvent> {
        self.events.lock().drain(..).collect()
    }

    // ---- outbound connect (§4.D) ------------------------------------------------------------

    /// Creates a `Connecting` entry and sends `ConnectRequest`. Rejects a duplicate entry for the
    /// same endpoint outright, matching the teacher's `has_free_slots`-style up-front reject
    /// rather than silently overwriting state.
    pub fn connect(&self, endpoint: Endpoint, password: &str, timeout_sec: u32) -> anyhow::Result<()> {
        self.prune_swept();
        if self.connections.lock().contains_key(&endpoint) {
            anyhow::bail!("a connection entry for {endpoint} already exists");
        }

        let link_id: u32 = rand::thread_rng().gen();
        let link = self.hub.get_or_create_pinned(endpoint, link_id);
        let now = Instant::now();
        self.connections.lock().insert(
            endpoint,
            Connection {
                endpoint,
                link: link.clone(),
                state: ConnectionState::Connecting,
                connect_started_at: Some(now),
                last_keep_alive: now,
                awaiting_keep_alive_reply: false,
                connect_timeout: Duration::from_secs(timeout_sec as u64),
                keep_alive_interval: self.config.keep_alive_interval(),
            },
        );

        self.send_control(&link, ControlDataId::ConnectRequest, password.as_bytes());
        info!("connecting to {endpoint} (link {link_id:#x})");
        Ok(())
    }

    /// Local teardown: sends `Disconnect`, fires the callback, and prepares the link for removal
    /// (§4.D "Disconnect").
    pub fn disconnect(&self, endpoint: Endpoint) {
        let mut connections = self.connections.lock();
        let Some(conn) = connections.get_mut(&endpoint) else {
            return;
        };
        if conn.state != ConnectionState::Connected {
            return;
        }
        self.send_control(&conn.link, ControlDataId::Disconnect, &[]);
        conn.state = ConnectionState::Disconnected;
        conn.link.unpin();
        self.hub.mark_pending_delete(endpoint);
        self.events.lock().push_back(ConnectionEvent::Disconnect {
            direct: true,
            endpoint,
            reason: DisconnectReason::Closed,
        });
        drop(connections);
        self.relay_if_server(endpoint, ControlDataId::RemoteDisconnected);
    }

    pub fn disconnect_all(&self) {
        let endpoints: Vec<Endpoint> = self.connections.lock().keys().copied().collect();
        for endpoint in endpoints {
            self.disconnect(endpoint);
        }
    }

    // ---- inbound control handling (§4.D) ----------------------------------------------------

    /// Called by `Node::update()` for every reliable-ordered channel-0 packet whose `DataId` is
    /// below `USER_OFFSET` (the handshake's reserved control ids).
    pub fn handle_control(&self, endpoint: Endpoint, link_id: u32, data_id: ControlDataId, payload: &[u8]) {
        match data_id {
            ControlDataId::ConnectRequest => self.handle_connect_request(endpoint, link_id, payload),
            ControlDataId::ConnectAccept => self.handle_connect_accept(endpoint),
            ControlDataId::IncorrectPassword => {
                self.handle_reject(endpoint, ConnectionState::InvalidPassword, ConnectResult::InvalidPassword)
            }
            ControlDataId::MaxConnectionsReached => self.handle_reject(
                endpoint,
                ConnectionState::MaxConnectionsReached,
                ConnectResult::MaxConnectionsReached,
            ),
            ControlDataId::AlreadyConnected => {
                self.handle_reject(endpoint, ConnectionState::Connected, ConnectResult::AlreadyConnected)
            }
            ControlDataId::Disconnect => self.handle_inbound_disconnect(endpoint),
            ControlDataId::KeepAliveRequest => self.handle_keep_alive_request(endpoint),
            ControlDataId::KeepAliveAnswer => self.handle_keep_alive_answer(endpoint),
            ControlDataId::RemoteConnected => self.handle_remote_relay(payload, true),
            ControlDataId::RemoteDisconnected => self.handle_remote_relay(payload, false),
            // Rpc / VariableGroup* / IdPack belong to the out-of-scope variable-group layer; the
            // core only reserves their DataIds (§3).
            _ => {}
        }
    }

    fn handle_connect_request(&self, endpoint: Endpoint, link_id: u32, payload: &[u8]) {
        self.prune_swept();
        let mut connections = self.connections.lock();
        if connections.contains_key(&endpoint) {
            drop(connections);
            let link = self.hub.get_or_create_pinned(endpoint, link_id);
            self.send_control(&link, ControlDataId::AlreadyConnected, &[]);
            link.unpin();
            return;
        }

        let Some(listen) = self.listen.lock().as_ref().map(|l| (l.password.clone(), l.max_connections)) else {
            // Not listening: silently ignore, matching the receive hub's own "unknown endpoint
            // needs a ConnectRequest to be admitted at all" gate -- a node that never called
            // `listen` has nothing to accept into.
            return;
        };
        let (password, max_connections) = listen;

        let link = self.hub.get_or_create_pinned(endpoint, link_id);

        if payload != password.as_bytes() {
            self.send_control(&link, ControlDataId::IncorrectPassword, &[]);
            warn!("incorrect password from {endpoint}");
            link.unpin();
            self.hub.mark_pending_delete(endpoint);
            return;
        }
        // Count only connections still live or mid-handshake: a lingering terminal entry that
        // hasn't been swept yet is not an occupied slot (§4.D "current count of connections").
        let active_count = connections.values().filter(|conn| !is_terminal(conn.state)).count();
        if active_count >= max_connections {
            self.send_control(&link, ControlDataId::MaxConnectionsReached, &[]);
            link.unpin();
            self.hub.mark_pending_delete(endpoint);
            return;
        }

        let now = Instant::now();
        connections.insert(
            endpoint,
            Connection {
                endpoint,
                link: link.clone(),
                state: ConnectionState::Connected,
                connect_started_at: None,
                last_keep_alive: now,
                awaiting_keep_alive_reply: false,
                connect_timeout: Duration::ZERO,
                keep_alive_interval: self.config.keep_alive_interval(),
            },
        );
        drop(connections);

        self.send_control(&link, ControlDataId::ConnectAccept, &[]);
        info!("accepted connection from {endpoint}");
        self.events.lock().push_back(ConnectionEvent::NewConnection { endpoint });
        self.relay_if_server(endpoint, ControlDataId::RemoteConnected);
    }

    fn handle_connect_accept(&self, endpoint: Endpoint) {
        let mut connections = self.connections.lock();
        let Some(conn) = connections.get_mut(&endpoint) else {
            return;
        };
        if conn.state != ConnectionState::Connecting {
            return;
        }
        conn.state = ConnectionState::Connected;
        conn.last_keep_alive = Instant::now();
        conn.awaiting_keep_alive_reply = false;
        drop(connections);
        self.events.lock().push_back(ConnectionEvent::ConnectResult {
            endpoint,
            result: ConnectResult::Succes,
        });
    }

    fn handle_reject(&self, endpoint: Endpoint, new_state: ConnectionState, result: ConnectResult) {
        let mut connections = self.connections.lock();
        let Some(conn) = connections.get_mut(&endpoint) else {
            return;
        };
        if conn.state != ConnectionState::Connecting {
            return;
        }
        conn.state = new_state;
        conn.link.unpin();
        self.hub.mark_pending_delete(endpoint);
        drop(connections);
        self.events
            .lock()
            .push_back(ConnectionEvent::ConnectResult { endpoint, result });
    }

    fn handle_inbound_disconnect(&self, endpoint: Endpoint) {
        let mut connections = self.connections.lock();
        let Some(conn) = connections.get_mut(&endpoint) else {
            return;
        };
        if conn.state != ConnectionState::Connected {
            return;
        }
        conn.state = ConnectionState::Disconnected;
        conn.link.unpin();
        self.hub.mark_pending_delete(endpoint);
        drop(connections);
        self.events.lock().push_back(ConnectionEvent::Disconnect {
            direct: true,
            endpoint,
            reason: DisconnectReason::Closed,
        });
        info!("peer {endpoint} disconnected");
        self.relay_if_server(endpoint, ControlDataId::RemoteDisconnected);
    }

    fn handle_keep_alive_request(&self, endpoint: Endpoint) {
        let connections = self.connections.lock();
        let Some(conn) = connections.get(&endpoint) else {
            return;
        };
        if conn.state != ConnectionState::Connected {
            return;
        }
        let link = conn.link.clone();
        drop(connections);
        self.send_control(&link, ControlDataId::KeepAliveAnswer, &[]);
    }

    fn handle_keep_alive_answer(&self, endpoint: Endpoint) {
        let mut connections = self.connections.lock();
        if let Some(conn) = connections.get_mut(&endpoint) {
            conn.awaiting_keep_alive_reply = false;
            conn.last_keep_alive = Instant::now();
        }
    }

    /// A server relayed `RemoteConnected`/`RemoteDisconnected` carrying a third peer's endpoint
    /// (§4.D relay policy). The payload is the 6-byte IPv4 encoding from [`Endpoint::to_ipv4_bytes`];
    /// non-IPv4 relay targets are silently skipped since this format has no IPv6 wire encoding.
    fn handle_remote_relay(&self, payload: &[u8], connected: bool) {
        let Ok(buf) = <[u8; 6]>::try_from(payload) else {
            warn!("malformed remote-{} relay payload", if connected { "connected" } else { "disconnected" });
            return;
        };
        let remote = Endpoint::from_ipv4_bytes(&buf);
        let event = if connected {
            ConnectionEvent::NewConnection { endpoint: remote }
        } else {
            ConnectionEvent::Disconnect {
                direct: false,
                endpoint: remote,
                reason: DisconnectReason::Closed,
            }
        };
        self.events.lock().push_back(event);
    }

    // ---- periodic update (§4.D) -------------------------------------------------------------

    /// Advances connect-timeout and keep-alive state for every tracked connection. Called once
    /// per `Node::update()` on the application thread.
    pub fn update(&self, now: Instant) {
        self.prune_swept();

        let mut timed_out = Vec::new();
        let mut keep_alive_lost = Vec::new();
        let mut due_keep_alive = Vec::new();

        {
            let mut connections = self.connections.lock();
            for conn in connections.values_mut() {
                match conn.state {
                    ConnectionState::Connecting => {
                        if let Some(started) = conn.connect_started_at {
                            if now.saturating_duration_since(started) >= conn.connect_timeout {
                                conn.state = ConnectionState::InitiateTimedOut;
                                timed_out.push(conn.endpoint);
                            }
                        }
                    }
                    ConnectionState::Connected => {
                        if conn.awaiting_keep_alive_reply {
                            if now.saturating_duration_since(conn.last_keep_alive) >= KEEP_ALIVE_GRACE {
                                conn.state = ConnectionState::ConnectionTimedOut;
                                keep_alive_lost.push(conn.endpoint);
                            }
                        } else if now.saturating_duration_since(conn.last_keep_alive) >= conn.keep_alive_interval {
                            conn.awaiting_keep_alive_reply = true;
                            conn.last_keep_alive = now;
                            due_keep_alive.push((conn.endpoint, conn.link.clone()));
                        }
                    }
                    _ => {}
                }
            }
        }

        for (_, link) in &due_keep_alive {
            self.send_control(link, ControlDataId::KeepAliveRequest, &[]);
        }

        for endpoint in timed_out {
            let connections = self.connections.lock();
            if let Some(conn) = connections.get(&endpoint) {
                conn.link.unpin();
            }
            drop(connections);
            self.hub.mark_pending_delete(endpoint);
            self.events.lock().push_back(ConnectionEvent::ConnectResult {
                endpoint,
                result: ConnectResult::Timedout,
            });
        }

        for endpoint in keep_alive_lost {
            let connections = self.connections.lock();
            if let Some(conn) = connections.get(&endpoint) {
                conn.link.unpin();
            }
            drop(connections);
            self.hub.mark_pending_delete(endpoint);
            warn!("keep-alive grace exceeded for {endpoint}, declaring lost");
            self.events.lock().push_back(ConnectionEvent::Disconnect {
                direct: true,
                endpoint,
                reason: DisconnectReason::Lost,
            });
            self.relay_if_server(endpoint, ControlDataId::RemoteDisconnected);
        }
    }

    // ---- helpers -----------------------------------------------------------------------------

    fn send_control(&self, link: &Arc<Link>, data_id: ControlDataId, payload: &[u8]) {
        let (_, datagrams, _) = link.add_to_send_queue(data_id.as_u8(), payload, HeaderType::ReliableOrdered, 0, false);
        for datagram in datagrams {
            self.hub.send_raw(link.endpoint(), &datagram);
        }
    }

    /// Relays a lifecycle event about `source` to every other connected peer, only when this node
    /// is acting as a server (§4.D relay policy / "star topology").
    fn relay_if_server(&self, source: Endpoint, data_id: ControlDataId) {
        if !self.is_server() {
            return;
        }
        let Some(payload) = source.to_ipv4_bytes() else {
            return;
        };
        let targets: Vec<Arc<Link>> = self
            .connections
            .lock()
            .values()
            .filter(|conn| conn.endpoint != source && conn.state == ConnectionState::Connected)
            .map(|conn| conn.link.clone())
            .collect();
        for link in targets {
            self.send_control(&link, data_id, &payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (Arc<ReceiveHub>, ConnectionManager) {
        let hub = ReceiveHub::bind(0, NodeConfig::default()).unwrap();
        let manager = ConnectionManager::new(hub.clone(), NodeConfig::default());
        (hub, manager)
    }

    fn ep(port: u16) -> Endpoint {
        Endpoint::new(([127, 0, 0, 1], port).into())
    }

    #[test]
    fn connect_rejects_a_duplicate_endpoint() {
        let (hub, manager) = manager();
        let endpoint = ep(40001);
        manager.connect(endpoint, "pw", 8).unwrap();
        assert!(manager.connect(endpoint, "pw", 8).is_err());
        hub.close();
    }

    #[test]
    fn inbound_connect_request_with_wrong_password_is_rejected() {
        let (hub, manager) = manager();
        manager.listen("secret", 32);
        let endpoint = ep(40002);

        manager.handle_connect_request(endpoint, 7, b"wrong");
        assert!(!manager.is_connection_known(endpoint));

        let events = manager.drain_events();
        assert!(events.is_empty(), "a rejected request fires no NewConnection/ConnectResult locally");
        hub.close();
    }

    #[test]
    fn inbound_connect_request_with_correct_password_is_accepted() {
        let (hub, manager) = manager();
        manager.listen("secret", 32);
        let endpoint = ep(40003);

        manager.handle_connect_request(endpoint, 7, b"secret");
        assert!(manager.is_connection_known(endpoint));

        let events = manager.drain_events();
        assert!(matches!(events[0], ConnectionEvent::NewConnection { .. }));
        hub.close();
    }

    #[test]
    fn inbound_connect_request_beyond_capacity_is_rejected() {
        let (hub, manager) = manager();
        manager.listen("secret", 1);
        manager.handle_connect_request(ep(40004), 1, b"secret");
        manager.drain_events();

        manager.handle_connect_request(ep(40005), 2, b"secret");
        assert!(!manager.is_connection_known(ep(40005)));
        hub.close();
    }

    #[test]
    fn connect_accept_transitions_connecting_to_connected() {
        let (hub, manager) = manager();
        let endpoint = ep(40006);
        manager.connect(endpoint, "pw", 8).unwrap();
        manager.drain_events();

        manager.handle_connect_accept(endpoint);
        let events = manager.drain_events();
        assert!(matches!(
            events[0],
            ConnectionEvent::ConnectResult { result: ConnectResult::Succes, .. }
        ));
        hub.close();
    }

    #[test]
    fn connecting_state_times_out_after_the_configured_duration() {
        let (hub, manager) = manager();
        let endpoint = ep(40007);
        manager.connect(endpoint, "pw", 1).unwrap();
        manager.drain_events();

        manager.update(Instant::now() + Duration::from_secs(2));
        let events = manager.drain_events();
        assert!(matches!(
            events[0],
            ConnectionEvent::ConnectResult { result: ConnectResult::Timedout, .. }
        ));
        hub.close();
    }

    #[test]
    fn keep_alive_grace_timeout_fires_lost_disconnect() {
        let (hub, manager) = manager();
        manager.listen("", 32);
        let endpoint = ep(40008);
        manager.handle_connect_request(endpoint, 9, b"");
        manager.drain_events();

        let now = Instant::now();
        manager.update(now + Duration::from_secs(9));
        manager.drain_events();

        manager.update(now + Duration::from_secs(9) + KEEP_ALIVE_GRACE + Duration::from_secs(1));
        let events = manager.drain_events();
        assert!(matches!(
            events[0],
            ConnectionEvent::Disconnect { direct: true, reason: DisconnectReason::Lost, .. }
        ));
        hub.close();
    }

    #[test]
    fn local_disconnect_fires_callback_and_marks_pending_delete() {
        let (hub, manager) = manager();
        manager.listen("", 32);
        let endpoint = ep(40009);
        manager.handle_connect_request(endpoint, 10, b"");
        manager.drain_events();

        manager.disconnect(endpoint);
        let events = manager.drain_events();
        assert!(matches!(
            events[0],
            ConnectionEvent::Disconnect { direct: true, reason: DisconnectReason::Closed, .. }
        ));
        hub.close();
    }
}
