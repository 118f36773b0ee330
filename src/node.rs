//! Public facade for integrators (§6 "Library surface").
//!
//! The teacher crate's `net::client::Client`/`net::server::Server` each spawn a background
//! process thread and hand the caller typed events through a `crossbeam_channel`. This format's
//! surface instead matches the original `GameNode`: callers register callbacks once and pump them
//! by calling `update()` on their own thread, so there is no second channel hand-off here -- the
//! [`ReceiveHub`] already runs its own recv/send threads (`hub.rs`), and `update()` just drains
//! what they produced directly off `Link::poll` and [`ConnectionManager::drain_events`].

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Instant;

use log::warn;
use parking_lot::Mutex;

use crate::config::NodeConfig;
use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::endpoint::Endpoint;
use crate::error::{ConnectResult, DisconnectReason, SendResult};
use crate::header::{ControlDataId, HeaderType, USER_OFFSET};
use crate::hub::ReceiveHub;
use crate::link::Delivery;

type ConnectResultCallback = Box<dyn FnMut(Endpoint, ConnectResult) + Send>;
type NewConnectionCallback = Box<dyn FnMut(bool, Endpoint, &[u8]) + Send>;
type DisconnectCallback = Box<dyn FnMut(bool, Endpoint, DisconnectReason) + Send>;
type CustomDataCallback = Box<dyn FnMut(Endpoint, u8, &[u8], u8) + Send>;

#[derive(Default)]
struct Callbacks {
    on_connect_result: Mutex<Option<ConnectResultCallback>>,
    on_new_connection: Mutex<Option<NewConnectionCallback>>,
    on_disconnect: Mutex<Option<DisconnectCallback>>,
    on_custom_data: Mutex<Option<CustomDataCallback>>,
}

struct Bound {
    hub: Arc<ReceiveHub>,
    connections: Arc<ConnectionManager>,
}

/// Entry point for an application. A socket is bound lazily, on the first `connect`/`listen`
/// call, to the port that call asked for (§4.A "port 0 lets the OS pick"); every later call
/// reuses the same [`ReceiveHub`]/[`ConnectionManager`] pair.
pub struct Node {
    config: NodeConfig,
    bound: Mutex<Option<Bound>>,
    callbacks: Callbacks,
}

impl Node {
    pub fn new(resend_interval_ms: u32, keep_alive_interval_sec: u32) -> Self {
        Self {
            config: NodeConfig::new(resend_interval_ms, keep_alive_interval_sec),
            bound: Mutex::new(None),
            callbacks: Callbacks::default(),
        }
    }

    fn ensure_bound(&self, port: u16) -> std::io::Result<(Arc<ReceiveHub>, Arc<ConnectionManager>)> {
        let mut bound = self.bound.lock();
        if let Some(b) = bound.as_ref() {
            return Ok((b.hub.clone(), b.connections.clone()));
        }
        let hub = ReceiveHub::bind(port, self.config.clone())?;
        let connections = Arc::new(ConnectionManager::new(hub.clone(), self.config.clone()));
        *bound = Some(Bound {
            hub: hub.clone(),
            connections: connections.clone(),
        });
        Ok((hub, connections))
    }

    // ---- connection lifecycle (§4.D, §6) ---------------------------------------------------

    /// Resolves `host:port` and connects with an ephemeral local port. `additional_data` mirrors
    /// the original API but is never placed on the wire -- `ConnectRequest`'s payload is only the
    /// password (§4.D, §9 open question).
    pub fn connect(
        &self,
        host: &str,
        port: u16,
        password: &str,
        timeout_sec: u32,
        additional_data: &[u8],
    ) -> anyhow::Result<()> {
        let _ = additional_data;
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| anyhow::anyhow!("{host}:{port} did not resolve to an address"))?;
        self.connect_endpoint(Endpoint::new(addr), password, timeout_sec)
    }

    pub fn connect_endpoint(&self, endpoint: Endpoint, password: &str, timeout_sec: u32) -> anyhow::Result<()> {
        let (_, connections) = self.ensure_bound(0)?;
        connections.connect(endpoint, password, timeout_sec)
    }

    pub fn listen(&self, port: u16, password: &str, max_connections: usize) -> anyhow::Result<()> {
        let (_, connections) = self.ensure_bound(port)?;
        connections.listen(password, max_connections);
        Ok(())
    }

    pub fn disconnect(&self, endpoint: Endpoint) {
        if let Some(b) = self.bound.lock().as_ref() {
            b.connections.disconnect(endpoint);
        }
    }

    /// `linger_ms` mirrors the original signature; this core has a single configured linger
    /// window (§4.B/§4.C) rather than a per-call override, so the value is accepted but unused.
    pub fn disconnect_all(&self, linger_ms: u32) {
        let _ = linger_ms;
        if let Some(b) = self.bound.lock().as_ref() {
            b.connections.disconnect_all();
        }
    }

    pub fn is_connection_known(&self, endpoint: Endpoint) -> bool {
        self.bound
            .lock()
            .as_ref()
            .map(|b| b.connections.is_connection_known(endpoint))
            .unwrap_or(false)
    }

    /// Applies a uniform drop percentage to every currently known link, matching the original
    /// `RecvPoint::simulatePacketLoss` broadcasting to its whole link table rather than targeting
    /// one endpoint.
    pub fn simulate_packet_loss(&self, percent: u8) {
        if let Some(b) = self.bound.lock().as_ref() {
            for link in b.hub.links_snapshot() {
                link.simulate_packet_loss(percent);
            }
        }
    }

    // ---- callback registration (§6) --------------------------------------------------------

    pub fn on_connect_result(&self, f: impl FnMut(Endpoint, ConnectResult) + Send + 'static) {
        *self.callbacks.on_connect_result.lock() = Some(Box::new(f));
    }

    pub fn on_new_connection(&self, f: impl FnMut(bool, Endpoint, &[u8]) + Send + 'static) {
        *self.callbacks.on_new_connection.lock() = Some(Box::new(f));
    }

    pub fn on_disconnect(&self, f: impl FnMut(bool, Endpoint, DisconnectReason) + Send + 'static) {
        *self.callbacks.on_disconnect.lock() = Some(Box::new(f));
    }

    pub fn on_custom_data(&self, f: impl FnMut(Endpoint, u8, &[u8], u8) + Send + 'static) {
        *self.callbacks.on_custom_data.lock() = Some(Box::new(f));
    }

    // ---- update pump (§4.D, §6, §7) ---------------------------------------------------------

    /// Drains the connection manager's lifecycle events and every link's decoded packets,
    /// invoking the registered callbacks on the calling thread. Becomes a no-op once the hub's
    /// critical-error bitmask is set (§7).
    pub fn update(&self) {
        let Some((hub, connections)) = self
            .bound
            .lock()
            .as_ref()
            .map(|b| (b.hub.clone(), b.connections.clone()))
        else {
            return;
        };
        if hub.critical_errors().any() {
            return;
        }

        connections.update(Instant::now());

        for link in hub.links_snapshot() {
            while let Some(delivery) = link.poll() {
                match delivery {
                    Delivery::Reliable { channel, data_id, payload }
                    | Delivery::Unreliable { channel, data_id, payload } => {
                        if channel == 0 {
                            if let Some(control) = ControlDataId::from_repr(data_id) {
                                if is_handshake_control(control) {
                                    connections.handle_control(link.endpoint(), link.link_id(), control, &payload);
                                    continue;
                                }
                            } else if data_id < USER_OFFSET {
                                warn!("reserved control DataId {data_id} has no known meaning, dropping");
                                continue;
                            }
                        }
                        self.dispatch_custom_data(link.endpoint(), data_id, &payload, channel);
                    }
                    Delivery::ReliableNewest { payload } => {
                        // No per-item DataId survives onto the wire (§3/§9): a reliable-newest
                        // datagram's body is the opaque `{groupId, itemBits, skipBytes, items}`
                        // sequence the variable-group layer owns. It is handed to `onCustomData`
                        // whole, tagged with `VariableGroupUpdate` since that is the reserved id
                        // this channel exists to carry (§6).
                        self.dispatch_custom_data(
                            link.endpoint(),
                            ControlDataId::VariableGroupUpdate.as_u8(),
                            &payload,
                            0,
                        );
                    }
                }
            }
        }

        for event in connections.drain_events() {
            self.dispatch_connection_event(event);
        }
    }

    fn dispatch_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::ConnectResult { endpoint, result } => {
                if let Some(cb) = self.callbacks.on_connect_result.lock().as_mut() {
                    cb(endpoint, result);
                }
            }
            ConnectionEvent::NewConnection { endpoint } => {
                if let Some(cb) = self.callbacks.on_new_connection.lock().as_mut() {
                    cb(true, endpoint, &[]);
                }
            }
            ConnectionEvent::Disconnect { direct, endpoint, reason } => {
                if let Some(cb) = self.callbacks.on_disconnect.lock().as_mut() {
                    cb(direct, endpoint, reason);
                }
            }
        }
    }

    fn dispatch_custom_data(&self, endpoint: Endpoint, data_id: u8, payload: &[u8], channel: u8) {
        if let Some(cb) = self.callbacks.on_custom_data.lock().as_mut() {
            cb(endpoint, data_id, payload, channel);
        }
    }

    // ---- send-class API (§6) ---------------------------------------------------------------

    pub fn send_reliable_ordered(
        &self,
        pack_id: u8,
        bytes: &[u8],
        specific: Option<Endpoint>,
        exclude: bool,
        channel: u8,
        relay: bool,
    ) -> SendResult {
        if pack_id < USER_OFFSET {
            return SendResult::InternalError;
        }
        let Some(hub) = self.bound.lock().as_ref().map(|b| b.hub.clone()) else {
            return SendResult::NotSent;
        };
        hub.send(pack_id, bytes, specific, exclude, HeaderType::ReliableOrdered, channel, relay).0
    }

    /// `requires_connection` drops the send instead of transmitting to a link that exists in the
    /// hub's table but has no established [`ConnectionManager`] entry yet (e.g. a fresh inbound
    /// link mid-handshake).
    pub fn send_unreliable_sequenced(
        &self,
        pack_id: u8,
        bytes: &[u8],
        specific: Option<Endpoint>,
        exclude: bool,
        channel: u8,
        relay: bool,
        requires_connection: bool,
    ) -> SendResult {
        if pack_id < USER_OFFSET {
            return SendResult::InternalError;
        }
        let Some((hub, connections)) = self
            .bound
            .lock()
            .as_ref()
            .map(|b| (b.hub.clone(), b.connections.clone()))
        else {
            return SendResult::NotSent;
        };
        if requires_connection {
            if let Some(endpoint) = specific {
                if !exclude && !connections.is_connection_known(endpoint) {
                    return SendResult::NotSent;
                }
            }
        }
        hub.send(pack_id, bytes, specific, exclude, HeaderType::UnreliableSequenced, channel, relay).0
    }

    pub fn send_reliable_newest(
        &self,
        pack_id: u8,
        group_id: u32,
        item_bit: u8,
        bytes: &[u8],
        specific: Option<Endpoint>,
        exclude: bool,
    ) -> SendResult {
        if pack_id < USER_OFFSET {
            return SendResult::InternalError;
        }
        let Some(hub) = self.bound.lock().as_ref().map(|b| b.hub.clone()) else {
            return SendResult::NotSent;
        };
        hub.send_reliable_newest(pack_id, bytes, group_id, item_bit, specific, exclude)
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Some(b) = self.bound.lock().take() {
            b.connections.disconnect_all();
            b.hub.close();
        }
    }
}

fn is_handshake_control(id: ControlDataId) -> bool {
    matches!(
        id,
        ControlDataId::ConnectRequest
            | ControlDataId::ConnectAccept
            | ControlDataId::Disconnect
            | ControlDataId::KeepAliveRequest
            | ControlDataId::KeepAliveAnswer
            | ControlDataId::IncorrectPassword
            | ControlDataId::MaxConnectionsReached
            | ControlDataId::AlreadyConnected
            | ControlDataId::RemoteConnected
            | ControlDataId::RemoteDisconnected
    )
}
