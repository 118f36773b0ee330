//! `ReceiveHub` (§4.C): owns the socket and the link table, runs the receive and send threads,
//! demultiplexes incoming datagrams to links, and pins links for safe external access.
//!
//! Grounded on the teacher crate's `net::server_process::ServerProcess`/`net::client_process` for
//! the "one thread blocks in recv, one thread wakes on a timer to flush sends" shape, but without
//! the teacher's `mio` reactor or its channel hand-off to a façade thread (§5, `SPEC_FULL.md`):
//! this hub's threads touch `Link`s directly through `Arc`, guarded by the link's own mutexes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{info, warn};
use parking_lot::{Condvar, Mutex};

use crate::config::{NodeConfig, DELETE_SWEEP_INTERVAL, LINGER_MULTIPLIER_FOR_SWEEP, RECV_BUFFER_SIZE};
use crate::endpoint::Endpoint;
use crate::error::{CriticalErrors, SendResult, SocketRecvResult};
use crate::header::{ControlDataId, HeaderType, Packet};
use crate::link::Link;
use crate::socket::Socket;

/// A receipt for a single addressed send, resolvable later via [`ReceiveHub::is_packet_delivered`]
/// (§4.C's optional delivery-ticket tracking).
#[derive(Debug, Clone, Copy)]
pub struct DeliveryHandle {
    endpoint: Endpoint,
    channel: u8,
    start_seq: u32,
    fragment_count: u32,
    reliable: bool,
}

struct LinkTable {
    by_endpoint: HashMap<Endpoint, Arc<Link>>,
    all: Vec<Arc<Link>>,
}

impl LinkTable {
    fn new() -> Self {
        Self {
            by_endpoint: HashMap::new(),
            all: Vec::new(),
        }
    }

    fn insert(&mut self, endpoint: Endpoint, link: Arc<Link>) {
        self.by_endpoint.insert(endpoint, link.clone());
        self.all.push(link);
    }

    fn remove_deletable(&mut self, now: Instant, linger: Duration) {
        let sweep_age = linger * LINGER_MULTIPLIER_FOR_SWEEP;
        self.all.retain(|link| {
            let deletable = link.is_pending_delete()
                && !link.is_pinned()
                && link.pending_delete_age(now).map(|age| age > sweep_age).unwrap_or(false);
            if deletable {
                info!("deleting link {:#x} ({}) past linger window", link.link_id(), link.endpoint());
            }
            !deletable
        });
        self.by_endpoint
            .retain(|_, link| self.all.iter().any(|kept| Arc::ptr_eq(kept, link)));
    }
}

pub struct ReceiveHub {
    socket: Arc<Socket>,
    table: Mutex<LinkTable>,
    config: NodeConfig,
    closing: Arc<AtomicBool>,
    send_wake: Mutex<()>,
    send_cv: Condvar,
    last_sweep: Mutex<Instant>,
    critical_errors: Mutex<CriticalErrors>,
    threads: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl ReceiveHub {
    pub fn bind(port: u16, config: NodeConfig) -> std::io::Result<Arc<Self>> {
        let socket = Arc::new(Socket::bind(port)?);
        let closing = socket.closing_flag();
        let hub = Arc::new(Self {
            socket,
            table: Mutex::new(LinkTable::new()),
            config,
            closing,
            send_wake: Mutex::new(()),
            send_cv: Condvar::new(),
            last_sweep: Mutex::new(Instant::now()),
            critical_errors: Mutex::new(CriticalErrors::default()),
            threads: Mutex::new(None),
        });
        hub.clone().spawn_threads();
        Ok(hub)
    }

    pub fn local_port(&self) -> std::io::Result<u16> {
        self.socket.local_port()
    }

    pub fn critical_errors(&self) -> CriticalErrors {
        *self.critical_errors.lock()
    }

    fn spawn_threads(self: Arc<Self>) {
        let recv_hub = self.clone();
        let recv_handle = std::thread::spawn(move || recv_hub.run_recv_thread());
        let send_hub = self.clone();
        let send_handle = std::thread::spawn(move || send_hub.run_send_thread());
        *self.threads.lock() = Some((recv_handle, send_handle));
    }

    /// Sets the closing flag, interrupts the blocked receive thread, wakes the send thread, and
    /// joins both (§5 cancellation/shutdown).
    pub fn close(&self) {
        self.closing.store(true, Ordering::Release);
        self.socket.close();
        self.send_cv.notify_all();
        if let Some((recv_handle, send_handle)) = self.threads.lock().take() {
            let _ = recv_handle.join();
            let _ = send_handle.join();
        }
    }

    // ---- link table access -----------------------------------------------------------------

    /// Creates (if absent) and pins a link for the given endpoint, for outbound `connect()`.
    pub fn get_or_create_pinned(&self, endpoint: Endpoint, link_id: u32) -> Arc<Link> {
        let mut table = self.table.lock();
        if let Some(link) = table.by_endpoint.get(&endpoint) {
            link.pin();
            return link.clone();
        }
        let link = Arc::new(Link::new(link_id, endpoint, self.config.fragment_size));
        link.pin();
        table.insert(endpoint, link.clone());
        link
    }

    pub fn lookup_pinned(&self, endpoint: Endpoint) -> Option<Arc<Link>> {
        let link = self.table.lock().by_endpoint.get(&endpoint)?.clone();
        link.pin();
        Some(link)
    }

    pub fn is_known(&self, endpoint: Endpoint) -> bool {
        self.table.lock().by_endpoint.contains_key(&endpoint)
    }

    /// A stable snapshot of every current link, for `Node::update()` to drive `poll()` and for
    /// the send thread's periodic dispatch.
    pub fn links_snapshot(&self) -> Vec<Arc<Link>> {
        self.table.lock().all.clone()
    }

    pub fn mark_pending_delete(&self, endpoint: Endpoint) {
        if let Some(link) = self.table.lock().by_endpoint.get(&endpoint) {
            link.mark_pending_delete(Instant::now());
        }
    }

    /// Transmits an already-encoded datagram to one endpoint, bypassing `send`'s broadcast
    /// targeting. Used by the connection manager, which builds its control datagrams directly
    /// through a specific `Link::add_to_send_queue` call (§4.D).
    pub fn send_raw(&self, endpoint: Endpoint, datagram: &[u8]) {
        self.socket.send(endpoint, datagram);
    }

    // ---- send (§4.C) ------------------------------------------------------------------------

    /// Broadcasts or narrowcasts a reliable-ordered/unreliable-sequenced send across the link
    /// table and transmits the resulting datagrams immediately.
    pub fn send(
        &self,
        data_id: u8,
        bytes: &[u8],
        specific: Option<Endpoint>,
        exclude: bool,
        class: HeaderType,
        channel: u8,
        relay: bool,
    ) -> (SendResult, Option<DeliveryHandle>) {
        let targets = self.resolve_targets(specific, exclude);
        if targets.is_empty() {
            return (SendResult::NotSent, None);
        }

        let mut any_succeeded = false;
        let mut single_ticket = None;
        let single_target = targets.len() == 1;
        for link in &targets {
            let (result, datagrams, ticket) = link.add_to_send_queue(data_id, bytes, class, channel, relay);
            match result {
                SendResult::Succes => {
                    any_succeeded = true;
                    for datagram in &datagrams {
                        self.socket.send(link.endpoint(), datagram);
                    }
                    if single_target {
                        single_ticket = ticket.map(|ticket| DeliveryHandle {
                            endpoint: link.endpoint(),
                            channel: ticket.channel,
                            start_seq: ticket.start_seq,
                            fragment_count: ticket.fragment_count,
                            reliable: class == HeaderType::ReliableOrdered,
                        });
                    }
                }
                SendResult::InternalError => return (SendResult::InternalError, None),
                SendResult::NotSent => {}
            }
        }

        if any_succeeded {
            (SendResult::Succes, single_ticket)
        } else {
            (SendResult::NotSent, None)
        }
    }

    /// Writes a reliable-newest slot across the link table; actual wire transmission happens on
    /// the send thread's periodic dispatch, not here (§4.B).
    pub fn send_reliable_newest(
        &self,
        data_id: u8,
        bytes: &[u8],
        group_id: u32,
        item_bit: u8,
        specific: Option<Endpoint>,
        exclude: bool,
    ) -> SendResult {
        let targets = self.resolve_targets(specific, exclude);
        if targets.is_empty() {
            return SendResult::NotSent;
        }
        let mut any_succeeded = false;
        for link in &targets {
            if link.add_reliable_newest(data_id, bytes, group_id, item_bit) == SendResult::Succes {
                any_succeeded = true;
            }
        }
        if any_succeeded {
            SendResult::Succes
        } else {
            SendResult::NotSent
        }
    }

    pub fn is_packet_delivered(&self, handle: DeliveryHandle) -> bool {
        if !handle.reliable {
            return true;
        }
        let Some(link) = self.table.lock().by_endpoint.get(&handle.endpoint).cloned() else {
            return false;
        };
        link.is_span_acked(handle.channel, handle.start_seq, handle.fragment_count)
    }

    fn resolve_targets(&self, specific: Option<Endpoint>, exclude: bool) -> Vec<Arc<Link>> {
        let table = self.table.lock();
        match specific {
            None => table.all.clone(),
            Some(endpoint) if !exclude => {
                table.by_endpoint.get(&endpoint).cloned().into_iter().collect()
            }
            Some(endpoint) => table
                .all
                .iter()
                .filter(|link| link.endpoint() != endpoint)
                .cloned()
                .collect(),
        }
    }

    // ---- receive thread (§4.C) ---------------------------------------------------------------

    fn run_recv_thread(self: Arc<Self>) {
        let mut buffer = vec![0_u8; RECV_BUFFER_SIZE];
        loop {
            let (len, from, result) = self.socket.recv(&mut buffer);
            match result {
                SocketRecvResult::SocketClosed => return,
                SocketRecvResult::NoData | SocketRecvResult::Error => continue,
                SocketRecvResult::Succes => {}
            }
            let Some(endpoint) = from else { continue };
            self.handle_datagram(endpoint, &buffer[..len]);
        }
    }

    fn handle_datagram(&self, endpoint: Endpoint, data: &[u8]) {
        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                if let Some(link) = self.table.lock().by_endpoint.get(&endpoint).cloned() {
                    warn!("link {} failed to decode a datagram on an established session: {e}", endpoint);
                    link.refuse_further_input();
                    self.critical_errors
                        .lock()
                        .set(CriticalErrors::ACCEPTED_PACKET_DESERIALIZE_FAILURE);
                } else {
                    warn!("dropping undecodable datagram from unknown endpoint {endpoint}: {e}");
                }
                return;
            }
        };

        let link_id = packet.link_id();
        let existing = self.table.lock().by_endpoint.get(&endpoint).cloned();

        match existing {
            Some(link) => {
                if link.link_id() != link_id {
                    warn!("stale LinkId from {endpoint}, dropping");
                    return;
                }
                if let Some(age) = link.pending_delete_age(Instant::now()) {
                    if age > self.config.linger() {
                        warn!("late datagram from pending-delete link {endpoint}, dropping");
                        return;
                    }
                }
                link.recv_data(packet);
                if link.has_fragment_overflow() {
                    self.critical_errors
                        .lock()
                        .set(CriticalErrors::FRAGMENT_BUFFER_OVERFLOW);
                }
            }
            None => {
                if !is_connect_request(&packet) {
                    return;
                }
                let link = Arc::new(Link::new(link_id, endpoint, self.config.fragment_size));
                link.recv_data(packet);
                self.table.lock().insert(endpoint, link);
                info!("new link {link_id:#x} from {endpoint}");
            }
        }
    }

    // ---- send thread (§4.C) ------------------------------------------------------------------

    fn run_send_thread(self: Arc<Self>) {
        let wake_interval = self
            .config
            .send_rel_newest_interval()
            .min(self.config.ack_aggregate_time())
            .min(self.config.resend_interval());

        let mut guard = self.send_wake.lock();
        loop {
            if self.closing.load(Ordering::Acquire) {
                return;
            }

            let now = Instant::now();
            for link in self.links_snapshot() {
                for datagram in link.dispatch_retransmit(now, self.config.resend_interval()) {
                    self.socket.send(link.endpoint(), &datagram);
                }
                if let Some(datagram) = link.dispatch_reliable_newest(now, self.config.send_rel_newest_interval()) {
                    self.socket.send(link.endpoint(), &datagram);
                }
                for datagram in link.dispatch_acks(now, self.config.ack_aggregate_time()) {
                    self.socket.send(link.endpoint(), &datagram);
                }
                if let Some(datagram) = link.dispatch_ack_reliable_newest(now, self.config.ack_aggregate_time()) {
                    self.socket.send(link.endpoint(), &datagram);
                }
            }
            self.delete_sweep_if_due(now);

            self.send_cv.wait_for(&mut guard, wake_interval);
        }
    }

    fn delete_sweep_if_due(&self, now: Instant) {
        let mut last_sweep = self.last_sweep.lock();
        if now.saturating_duration_since(*last_sweep) < DELETE_SWEEP_INTERVAL {
            return;
        }
        *last_sweep = now;
        drop(last_sweep);
        self.table.lock().remove_deletable(now, self.config.linger());
    }
}

fn is_connect_request(packet: &Packet) -> bool {
    matches!(
        packet,
        Packet::Normal {
            header_type: HeaderType::ReliableOrdered,
            data_id,
            ..
        } if *data_id == ControlDataId::ConnectRequest.as_u8()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn hub() -> Arc<ReceiveHub> {
        ReceiveHub::bind(0, NodeConfig::default()).unwrap()
    }

    #[test]
    fn unknown_endpoint_is_only_admitted_by_a_connect_request() {
        let a = hub();
        let b = hub();
        let b_endpoint = Endpoint::new(([127, 0, 0, 1], b.local_port().unwrap()).into());
        let a_endpoint = Endpoint::new(([127, 0, 0, 1], a.local_port().unwrap()).into());

        let garbage = Packet::Normal {
            link_id: 1,
            header_type: HeaderType::ReliableOrdered,
            flags: crate::header::NormalFlags {
                channel: 0,
                relay: false,
                first_fragment: true,
                last_fragment: true,
            },
            sequence: 0,
            data_id: 99,
            payload: vec![],
        }
        .encode();
        a.socket.send(b_endpoint, &garbage);
        thread::sleep(Duration::from_millis(150));
        assert!(!b.is_known(a_endpoint));

        let connect = Packet::Normal {
            link_id: 1,
            header_type: HeaderType::ReliableOrdered,
            flags: crate::header::NormalFlags {
                channel: 0,
                relay: false,
                first_fragment: true,
                last_fragment: true,
            },
            sequence: 0,
            data_id: ControlDataId::ConnectRequest.as_u8(),
            payload: vec![],
        }
        .encode();
        a.socket.send(b_endpoint, &connect);
        thread::sleep(Duration::from_millis(150));
        assert!(b.is_known(a_endpoint));

        a.close();
        b.close();
    }

    #[test]
    fn send_with_no_links_is_not_sent() {
        let hub = hub();
        let (result, ticket) = hub.send(40, b"hi", None, false, HeaderType::ReliableOrdered, 0, false);
        assert_eq!(result, SendResult::NotSent);
        assert!(ticket.is_none());
        hub.close();
    }

    #[test]
    fn delete_sweep_removes_unpinned_stale_links() {
        let hub = hub();
        let endpoint = Endpoint::new(([127, 0, 0, 1], 1).into());
        let link = hub.get_or_create_pinned(endpoint, 1);
        link.unpin();
        link.mark_pending_delete(Instant::now() - hub.config.linger() * LINGER_MULTIPLIER_FOR_SWEEP - Duration::from_secs(1));

        hub.delete_sweep_if_due(Instant::now() + DELETE_SWEEP_INTERVAL);
        assert!(!hub.is_known(endpoint));
        hub.close();
    }

    #[test]
    fn pinned_links_survive_the_delete_sweep() {
        let hub = hub();
        let endpoint = Endpoint::new(([127, 0, 0, 1], 2).into());
        let link = hub.get_or_create_pinned(endpoint, 1);
        link.mark_pending_delete(Instant::now() - hub.config.linger() * LINGER_MULTIPLIER_FOR_SWEEP - Duration::from_secs(1));

        hub.delete_sweep_if_due(Instant::now() + DELETE_SWEEP_INTERVAL);
        assert!(hub.is_known(endpoint));
        hub.close();
    }
}
