//! Per-peer link state machine (§3, §4.B) — the largest single component of the system.
//!
//! Grounded on the teacher crate's `net::channel::Channel` (per-channel send/receive state),
//! `net::send_buffer::SendBuffer` (retransmit queue keyed by printed sequence) and
//! `net::fragmentation_manager` (reassembly bookkeeping), generalized to this format's wire
//! layout and delivery classes. The teacher keeps one `Channel` per `(connection, channel id)`
//! pair with its own locks; this link instead holds one lock per *concern* shared across all
//! eight channels (§5's "retransmit-reliable, reliable-newest groups, receive queues, ack queues,
//! pending-delete" mutex list), since the per-link invariants here (gameExpected monotonicity,
//! reliable-newest group table) cut across channels rather than living inside one.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use bit_field::BitField;
use log::warn;
use parking_lot::Mutex;
use rand::Rng;

use crate::endpoint::Endpoint;
use crate::error::SendResult;
use crate::fragment::{self, Piece};
use crate::header::{HeaderType, NormalFlags, Packet, NUM_CHANNELS};
use crate::sequence;

/// Number of reliable-newest item slots per group (§3: `itemBit ∈ 0..15`).
const ITEMS_PER_GROUP: usize = 16;

/// Upper bound on outstanding, not-yet-reassembled fragments buffered per channel (§7 "fragment
/// buffer overflow"). A peer that never completes a fragmented send (malicious, or simply stuck)
/// would otherwise grow `reliable_fragments`/`unreliable_fragments` without bound.
const MAX_BUFFERED_FRAGMENTS_PER_CHANNEL: usize = 64;

/// A packet handed to the application by [`Link::poll`] (§4.B Poll contract).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Reliable {
        channel: u8,
        data_id: u8,
        payload: Vec<u8>,
    },
    Unreliable {
        channel: u8,
        data_id: u8,
        payload: Vec<u8>,
    },
    ReliableNewest {
        payload: Vec<u8>,
    },
}

/// Starting sequence/fragment-count pair handed back to callers that want to track delivery via
/// `isPacketDelivered` (§4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryTicket {
    pub channel: u8,
    pub start_seq: u32,
    pub fragment_count: u32,
}

struct RetransmitEntry {
    seq: u32,
    datagram: Vec<u8>,
}

/// Retransmit-reliable mutex contents: per-channel next-send-seq for both reliable and
/// unreliable traffic, plus the per-channel in-flight retransmit queues.
struct SendState {
    next_seq_reliable: [u32; NUM_CHANNELS],
    next_seq_unreliable: [u32; NUM_CHANNELS],
    retransmit: [VecDeque<RetransmitEntry>; NUM_CHANNELS],
    last_retransmit_pass: Instant,
}

impl SendState {
    fn new(now: Instant) -> Self {
        Self {
            next_seq_reliable: [0; NUM_CHANNELS],
            next_seq_unreliable: [0; NUM_CHANNELS],
            retransmit: Default::default(),
            last_retransmit_pass: now,
        }
    }
}

struct ReliableNewestItem {
    /// Not used by the core's own wire encoding (the group's `items` bytes are opaque
    /// concatenated payload per §3); kept so the variable-group layer can be told which `DataId`
    /// last wrote a slot, since it — not the core — owns the per-item schema.
    data_id: u8,
    local_revision: u32,
    remote_revision: u32,
    data: Vec<u8>,
}

struct ReliableNewestGroup {
    items: [Option<ReliableNewestItem>; ITEMS_PER_GROUP],
}

impl ReliableNewestGroup {
    fn new() -> Self {
        Self {
            items: Default::default(),
        }
    }

    fn has_dirty_item(&self) -> bool {
        self.items.iter().flatten().any(|item| {
            sequence::is_newer(item.local_revision, item.remote_revision)
        })
    }

    fn fully_acked(&self) -> bool {
        self.items.iter().flatten().all(|item| {
            sequence::is_newer_or_equal(item.remote_revision, item.local_revision)
        })
    }
}

/// Reliable-newest groups mutex contents: send-side group table plus the send sequence counter
/// it is stamped from (§4.B).
struct ReliableNewestSendState {
    send_seq: u32,
    groups: HashMap<u32, ReliableNewestGroup>,
    last_dispatch: Instant,
    /// Highest `AckReliableNewest.highest_seq` already applied, so a stale duplicate ack can't
    /// re-clamp `remoteRevision` backwards.
    last_applied_ack: Option<u32>,
}

impl ReliableNewestSendState {
    fn new(now: Instant) -> Self {
        Self {
            send_seq: 0,
            groups: HashMap::new(),
            last_dispatch: now,
            last_applied_ack: None,
        }
    }
}

/// One reassembled or single-fragment logical packet sitting in a channel's reorder map,
/// addressed by its first sequence number.
struct Reordered {
    data_id: u8,
    payload: Vec<u8>,
    fragment_span: u32,
}

/// Receive-queues mutex contents — the only lock `poll()` touches (§5).
struct RecvState {
    game_expected: [u32; NUM_CHANNELS],
    reorder: [BTreeMap<u32, Reordered>; NUM_CHANNELS],
    reliable_fragments: [HashMap<u32, Piece>; NUM_CHANNELS],

    unreliable_expected: [Option<u32>; NUM_CHANNELS],
    unreliable_fragments: [HashMap<u32, Piece>; NUM_CHANNELS],
    unreliable_queue: [VecDeque<(u8, Vec<u8>)>; NUM_CHANNELS],

    rel_newest_expected: Option<u32>,
    rel_newest_queue: VecDeque<Vec<u8>>,
}

impl RecvState {
    fn new() -> Self {
        Self {
            game_expected: [0; NUM_CHANNELS],
            reorder: Default::default(),
            reliable_fragments: Default::default(),
            unreliable_expected: [None; NUM_CHANNELS],
            unreliable_fragments: Default::default(),
            unreliable_queue: Default::default(),
            rel_newest_expected: None,
            rel_newest_queue: VecDeque::new(),
        }
    }
}

/// Ack-queues mutex contents: per-channel sequences awaiting an aggregated `Ack` datagram, plus
/// the cadence accumulators for both ack families (§4.B).
struct AckState {
    queues: [Vec<u32>; NUM_CHANNELS],
    last_ack_dispatch: Instant,
    last_rel_newest_ack_dispatch: Instant,
}

impl AckState {
    fn new(now: Instant) -> Self {
        Self {
            queues: Default::default(),
            last_ack_dispatch: now,
            last_rel_newest_ack_dispatch: now,
        }
    }
}

struct PendingDeleteState {
    pending: bool,
    marked_at: Option<Instant>,
}

/// Per-peer state machine: send/retransmit queues, receive reorder buffers, fragmentation, and
/// acknowledgement bookkeeping for one endpoint (§4.B).
///
/// Holds five independent mutexes rather than one big lock, matching §5's mutex discipline: a
/// `poll()` call from the application thread only ever touches `recv`.
pub struct Link {
    link_id: u32,
    endpoint: Endpoint,
    fragment_size: usize,

    send: Mutex<SendState>,
    rel_newest: Mutex<ReliableNewestSendState>,
    recv: Mutex<RecvState>,
    ack: Mutex<AckState>,
    pending_delete: Mutex<PendingDeleteState>,

    pin_count: AtomicU32,
    blocked_sends: AtomicBool,
    /// 0 disables simulation; 1..=100 is the uniform percent chance to drop an inbound datagram.
    packet_loss_percent: AtomicU8,
    /// Set when the hub observes a decode failure on an established session (§7): further
    /// `recv_data` calls on this link are dropped instead of processed.
    refused: AtomicBool,
    /// Set when a per-channel fragment reassembly buffer exceeds `MAX_BUFFERED_FRAGMENTS_PER_CHANNEL`
    /// (§7 "fragment buffer overflow"); the hub observes this and raises the node-wide critical
    /// error bit.
    fragment_overflow: AtomicBool,
}

impl Link {
    pub fn new(link_id: u32, endpoint: Endpoint, fragment_size: usize) -> Self {
        let now = Instant::now();
        Self {
            link_id,
            endpoint,
            fragment_size,
            send: Mutex::new(SendState::new(now)),
            rel_newest: Mutex::new(ReliableNewestSendState::new(now)),
            recv: Mutex::new(RecvState::new()),
            ack: Mutex::new(AckState::new(now)),
            pending_delete: Mutex::new(PendingDeleteState {
                pending: false,
                marked_at: None,
            }),
            pin_count: AtomicU32::new(0),
            blocked_sends: AtomicBool::new(false),
            packet_loss_percent: AtomicU8::new(0),
            refused: AtomicBool::new(false),
            fragment_overflow: AtomicBool::new(false),
        }
    }

    pub fn link_id(&self) -> u32 {
        self.link_id
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn is_refused(&self) -> bool {
        self.refused.load(Ordering::Acquire)
    }

    /// Marks this link as no longer trustworthy (§7): an already-acked reliable-ordered stream
    /// that fails deserialization further up the stack can never be delivered correctly again.
    pub fn refuse_further_input(&self) {
        self.refused.store(true, Ordering::Release);
    }

    pub fn has_fragment_overflow(&self) -> bool {
        self.fragment_overflow.load(Ordering::Acquire)
    }

    /// Marks the fragment buffer as overflowed and stops further processing on this link, the same
    /// way a deserialize failure on an established session does (§7).
    fn overflow_fragment_buffer(&self, channel: u8) {
        warn!(
            "link {:#x}: channel {channel} exceeded {MAX_BUFFERED_FRAGMENTS_PER_CHANNEL} buffered fragments, refusing further input",
            self.link_id
        );
        self.fragment_overflow.store(true, Ordering::Release);
        self.refuse_further_input();
    }

    // ---- lifecycle (§4.B) ----------------------------------------------------------------

    pub fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unpin(&self) {
        self.pin_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn is_pinned(&self) -> bool {
        self.pin_count.load(Ordering::Acquire) > 0
    }

    pub fn mark_pending_delete(&self, now: Instant) {
        let mut state = self.pending_delete.lock();
        if !state.pending {
            state.pending = true;
            state.marked_at = Some(now);
        }
    }

    pub fn is_pending_delete(&self) -> bool {
        self.pending_delete.lock().pending
    }

    pub fn pending_delete_age(&self, now: Instant) -> Option<Duration> {
        self.pending_delete
            .lock()
            .marked_at
            .map(|marked| now.saturating_duration_since(marked))
    }

    pub fn block_all_upcoming_sends(&self) {
        self.blocked_sends.store(true, Ordering::Release);
    }

    pub fn simulate_packet_loss(&self, percent: u8) {
        self.packet_loss_percent.store(percent.min(100), Ordering::Release);
    }

    fn should_simulate_drop(&self) -> bool {
        let percent = self.packet_loss_percent.load(Ordering::Acquire);
        percent > 0 && rand::thread_rng().gen_range(0..100) < percent
    }

    // ---- send contract (§4.B) -------------------------------------------------------------

    /// Fragments `bytes` and, for `ReliableOrdered`, enqueues each fragment for retransmission.
    /// Returns the encoded datagrams the caller (the hub's send path, which owns the socket)
    /// must transmit immediately, plus a delivery ticket describing the span for reliable sends.
    pub fn add_to_send_queue(
        &self,
        data_id: u8,
        bytes: &[u8],
        class: HeaderType,
        channel: u8,
        relay: bool,
    ) -> (SendResult, Vec<Vec<u8>>, Option<DeliveryTicket>) {
        if self.blocked_sends.load(Ordering::Acquire) {
            return (SendResult::NotSent, Vec::new(), None);
        }
        if !matches!(class, HeaderType::ReliableOrdered | HeaderType::UnreliableSequenced) {
            return (SendResult::InternalError, Vec::new(), None);
        }

        let channel = (channel as usize % NUM_CHANNELS) as u8;
        let chunks = fragment::split(bytes, self.fragment_size);
        let fragment_count = chunks.len() as u32;

        let mut send = self.send.lock();
        let seq_counter = match class {
            HeaderType::ReliableOrdered => &mut send.next_seq_reliable[channel as usize],
            HeaderType::UnreliableSequenced => &mut send.next_seq_unreliable[channel as usize],
            _ => unreachable!(),
        };
        let start_seq = *seq_counter;

        let mut datagrams = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.iter().enumerate() {
            let seq = *seq_counter;
            *seq_counter = sequence::next(*seq_counter);

            let flags = NormalFlags {
                channel,
                relay,
                first_fragment: i == 0,
                last_fragment: i == chunks.len() - 1,
            };
            let datagram = Packet::Normal {
                link_id: self.link_id,
                header_type: class,
                flags,
                sequence: seq,
                data_id,
                payload: chunk.to_vec(),
            }
            .encode();

            if class == HeaderType::ReliableOrdered {
                send.retransmit[channel as usize].push_back(RetransmitEntry {
                    seq,
                    datagram: datagram.clone(),
                });
            }
            datagrams.push(datagram);
        }
        drop(send);

        let ticket = Some(DeliveryTicket {
            channel,
            start_seq,
            fragment_count,
        });
        (SendResult::Succes, datagrams, ticket)
    }

    /// Writes `bytes` into `(groupId, itemBit)`'s slot, allocating the group if new (§4.B).
    pub fn add_reliable_newest(&self, data_id: u8, bytes: &[u8], group_id: u32, item_bit: u8) -> SendResult {
        if item_bit as usize >= ITEMS_PER_GROUP {
            return SendResult::InternalError;
        }
        if self.blocked_sends.load(Ordering::Acquire) {
            return SendResult::NotSent;
        }

        let mut state = self.rel_newest.lock();
        let revision = state.send_seq;
        let group = state
            .groups
            .entry(group_id)
            .or_insert_with(ReliableNewestGroup::new);
        let slot = &mut group.items[item_bit as usize];
        match slot {
            Some(item) => {
                item.data_id = data_id;
                item.local_revision = revision;
                item.data.clear();
                item.data.extend_from_slice(bytes);
            }
            None => {
                *slot = Some(ReliableNewestItem {
                    data_id,
                    local_revision: revision,
                    remote_revision: 0,
                    data: bytes.to_vec(),
                });
            }
        }
        SendResult::Succes
    }

    /// Supplements §4.C's `isPacketDelivered`: true once every sequence in a reliable span has
    /// left the retransmit queue (i.e. been acked).
    pub fn is_span_acked(&self, channel: u8, start_seq: u32, fragment_count: u32) -> bool {
        let send = self.send.lock();
        let queue = &send.retransmit[channel as usize % NUM_CHANNELS];
        let mut seq = start_seq;
        for _ in 0..fragment_count {
            if queue.iter().any(|entry| entry.seq == seq) {
                return false;
            }
            seq = sequence::next(seq);
        }
        true
    }

    // ---- periodic transmission (§4.B) ------------------------------------------------------

    /// Resends every in-flight reliable fragment on every channel if the retransmit interval has
    /// elapsed.
    pub fn dispatch_retransmit(&self, now: Instant, interval: Duration) -> Vec<Vec<u8>> {
        let mut send = self.send.lock();
        if now.saturating_duration_since(send.last_retransmit_pass) < interval {
            return Vec::new();
        }
        send.last_retransmit_pass = now;

        let mut datagrams = Vec::new();
        for queue in &send.retransmit {
            for entry in queue.iter() {
                datagrams.push(entry.datagram.clone());
            }
        }
        datagrams
    }

    /// Builds one `ReliableNewest` datagram covering every dirty group, or `None` if nothing is
    /// dirty or the interval hasn't elapsed.
    pub fn dispatch_reliable_newest(&self, now: Instant, interval: Duration) -> Option<Vec<u8>> {
        let mut state = self.rel_newest.lock();
        if now.saturating_duration_since(state.last_dispatch) < interval {
            return None;
        }
        state.last_dispatch = now;

        let dirty_ids: Vec<u32> = state
            .groups
            .iter()
            .filter(|(_, g)| g.has_dirty_item())
            .map(|(id, _)| *id)
            .collect();
        if dirty_ids.is_empty() {
            return None;
        }

        let sequence = state.send_seq;
        let mut body = Vec::new();
        body.extend_from_slice(&(dirty_ids.len() as u32).to_be_bytes());
        for group_id in dirty_ids {
            let group = state.groups.get(&group_id).expect("group just looked up");
            let mut item_bits: u16 = 0;
            let mut items_bytes = Vec::new();
            for (bit, item) in group.items.iter().enumerate() {
                if let Some(item) = item {
                    if sequence::is_newer(item.local_revision, item.remote_revision) {
                        item_bits.set_bit(bit, true);
                        items_bytes.extend_from_slice(&item.data);
                    }
                }
            }
            body.extend_from_slice(&group_id.to_be_bytes());
            body.extend_from_slice(&item_bits.to_be_bytes());
            body.extend_from_slice(&(items_bytes.len() as u16).to_be_bytes());
            body.extend_from_slice(&items_bytes);
        }

        state.send_seq = sequence::next(state.send_seq);

        Some(
            Packet::ReliableNewest {
                link_id: self.link_id,
                sequence,
                body,
            }
            .encode(),
        )
    }

    /// Emits an `Ack` datagram for each channel with a non-empty queue (§4.B).
    pub fn dispatch_acks(&self, now: Instant, interval: Duration) -> Vec<Vec<u8>> {
        let mut ack = self.ack.lock();
        if now.saturating_duration_since(ack.last_ack_dispatch) < interval {
            return Vec::new();
        }
        ack.last_ack_dispatch = now;

        let mut datagrams = Vec::new();
        for (channel, queue) in ack.queues.iter_mut().enumerate() {
            if queue.is_empty() {
                continue;
            }
            let sequences = std::mem::take(queue);
            datagrams.push(
                Packet::Ack {
                    link_id: self.link_id,
                    channel: channel as u8,
                    sequences,
                }
                .encode(),
            );
        }
        datagrams
    }

    /// Emits `AckReliableNewest(highestReceived - 1)` if there's anything to acknowledge (§4.B).
    pub fn dispatch_ack_reliable_newest(&self, now: Instant, interval: Duration) -> Option<Vec<u8>> {
        let highest = self.recv.lock().rel_newest_expected?;

        let mut ack = self.ack.lock();
        if now.saturating_duration_since(ack.last_rel_newest_ack_dispatch) < interval {
            return None;
        }
        ack.last_rel_newest_ack_dispatch = now;
        drop(ack);

        Some(
            Packet::AckReliableNewest {
                link_id: self.link_id,
                highest_seq: sequence::previous(highest),
            }
            .encode(),
        )
    }

    // ---- receive contract (§4.B) -----------------------------------------------------------

    /// Applies packet-loss simulation and dispatches a decoded datagram by `HeaderType`.
    pub fn recv_data(&self, packet: Packet) {
        if self.is_refused() || self.should_simulate_drop() {
            return;
        }

        match packet {
            Packet::Ack { channel, sequences, .. } => self.recv_ack(channel, &sequences),
            Packet::AckReliableNewest { highest_seq, .. } => self.recv_ack_reliable_newest(highest_seq),
            Packet::Normal {
                header_type: HeaderType::ReliableOrdered,
                flags,
                sequence,
                data_id,
                payload,
                ..
            } => self.recv_reliable_ordered(flags, sequence, data_id, payload),
            Packet::Normal {
                header_type: HeaderType::UnreliableSequenced,
                flags,
                sequence,
                data_id,
                payload,
                ..
            } => self.recv_unreliable_sequenced(flags, sequence, data_id, payload),
            Packet::Normal { .. } => {
                warn!("link {:#x}: unexpected header type on a Normal-shaped packet", self.link_id);
            }
            Packet::ReliableNewest { sequence, body, .. } => self.recv_reliable_newest(sequence, body),
        }
    }

    fn recv_ack(&self, channel: u8, sequences: &[u32]) {
        let mut send = self.send.lock();
        let Some(queue) = send.retransmit.get_mut(channel as usize) else {
            return;
        };
        queue.retain(|entry| !sequences.contains(&entry.seq));
    }

    fn recv_ack_reliable_newest(&self, ack_seq: u32) {
        let mut state = self.rel_newest.lock();
        if let Some(last) = state.last_applied_ack {
            if !sequence::is_newer(ack_seq, last) {
                return;
            }
        }
        state.last_applied_ack = Some(ack_seq);

        for item in state.groups.values_mut().flat_map(|g| g.items.iter_mut().flatten()) {
            item.remote_revision = sequence::max(item.remote_revision, ack_seq);
        }
        state.groups.retain(|_, group| !group.fully_acked());
    }

    fn recv_reliable_ordered(&self, flags: NormalFlags, seq: u32, data_id: u8, payload: Vec<u8>) {
        let channel = flags.channel as usize % NUM_CHANNELS;
        self.ack.lock().queues[channel].push(seq);

        let mut recv = self.recv.lock();
        if !sequence::is_newer(seq, recv.game_expected[channel]) {
            return;
        }

        if flags.first_fragment && flags.last_fragment {
            recv.reorder[channel].entry(seq).or_insert(Reordered {
                data_id,
                payload,
                fragment_span: 1,
            });
            return;
        }

        recv.reliable_fragments[channel].insert(
            seq,
            Piece {
                data: payload,
                first: flags.first_fragment,
                last: flags.last_fragment,
                data_id,
            },
        );
        if recv.reliable_fragments[channel].len() > MAX_BUFFERED_FRAGMENTS_PER_CHANNEL {
            drop(recv);
            self.overflow_fragment_buffer(flags.channel);
            return;
        }
        if let Some((data, seq_begin, seq_end)) =
            fragment::try_reassemble(&recv.reliable_fragments[channel], seq)
        {
            let data_id = recv.reliable_fragments[channel][&seq_begin].data_id;
            let span = seq_end.wrapping_sub(seq_begin).wrapping_add(1);
            remove_span(&mut recv.reliable_fragments[channel], seq_begin, seq_end);
            recv.reorder[channel].entry(seq_begin).or_insert(Reordered {
                data_id,
                payload: data,
                fragment_span: span,
            });
        }
    }

    fn recv_unreliable_sequenced(&self, flags: NormalFlags, seq: u32, data_id: u8, payload: Vec<u8>) {
        let channel = flags.channel as usize % NUM_CHANNELS;
        let mut recv = self.recv.lock();

        if let Some(expected) = recv.unreliable_expected[channel] {
            if !sequence::is_newer(seq, expected) {
                return;
            }
        }

        if flags.first_fragment && flags.last_fragment {
            recv.unreliable_expected[channel] = Some(sequence::next(seq));
            recv.unreliable_queue[channel].push_back((data_id, payload));
            return;
        }

        recv.unreliable_fragments[channel].insert(
            seq,
            Piece {
                data: payload,
                first: flags.first_fragment,
                last: flags.last_fragment,
                data_id,
            },
        );
        if recv.unreliable_fragments[channel].len() > MAX_BUFFERED_FRAGMENTS_PER_CHANNEL {
            drop(recv);
            self.overflow_fragment_buffer(flags.channel);
            return;
        }
        if let Some((data, seq_begin, seq_end)) =
            fragment::try_reassemble(&recv.unreliable_fragments[channel], seq)
        {
            let data_id = recv.unreliable_fragments[channel][&seq_begin].data_id;
            let new_expected = sequence::next(seq_end);
            recv.unreliable_fragments[channel]
                .retain(|&k, _| sequence::is_newer(k, seq_end));
            recv.unreliable_expected[channel] = Some(new_expected);
            recv.unreliable_queue[channel].push_back((data_id, data));
        }
    }

    fn recv_reliable_newest(&self, seq: u32, body: Vec<u8>) {
        let mut recv = self.recv.lock();
        if let Some(expected) = recv.rel_newest_expected {
            if !sequence::is_newer(seq, expected) {
                return;
            }
        }
        recv.rel_newest_expected = Some(sequence::next(seq));
        recv.rel_newest_queue.push_back(body);
    }

    // ---- poll contract (§4.B) --------------------------------------------------------------

    /// Drains one delivered packet in the strict order §4.B mandates: reliable-ordered first
    /// (per channel, in channel order), then unreliable-sequenced, then reliable-newest.
    pub fn poll(&self) -> Option<Delivery> {
        let mut recv = self.recv.lock();

        for channel in 0..NUM_CHANNELS {
            let expected = recv.game_expected[channel];
            if let Some(entry) = recv.reorder[channel].remove(&expected) {
                recv.game_expected[channel] = expected.wrapping_add(entry.fragment_span);
                return Some(Delivery::Reliable {
                    channel: channel as u8,
                    data_id: entry.data_id,
                    payload: entry.payload,
                });
            }
        }

        for channel in 0..NUM_CHANNELS {
            if let Some((data_id, payload)) = recv.unreliable_queue[channel].pop_front() {
                return Some(Delivery::Unreliable {
                    channel: channel as u8,
                    data_id,
                    payload,
                });
            }
        }

        recv.rel_newest_queue
            .pop_front()
            .map(|payload| Delivery::ReliableNewest { payload })
    }
}

fn remove_span(fragments: &mut HashMap<u32, Piece>, seq_begin: u32, seq_end: u32) {
    let mut cursor = seq_begin;
    loop {
        fragments.remove(&cursor);
        if cursor == seq_end {
            break;
        }
        cursor = sequence::next(cursor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link() -> Link {
        Link::new(1, Endpoint::new(([127, 0, 0, 1], 9000).into()), 1900)
    }

    #[test]
    fn reliable_ordered_send_enqueues_retransmit_and_returns_one_datagram() {
        let link = link();
        let (result, datagrams, ticket) =
            link.add_to_send_queue(40, b"hello", HeaderType::ReliableOrdered, 0, false);
        assert_eq!(result, SendResult::Succes);
        assert_eq!(datagrams.len(), 1);
        assert_eq!(ticket.unwrap().fragment_count, 1);
        assert_eq!(link.send.lock().retransmit[0].len(), 1);
    }

    #[test]
    fn unreliable_send_keeps_no_retransmit_state() {
        let link = link();
        link.add_to_send_queue(40, b"hello", HeaderType::UnreliableSequenced, 0, false);
        assert!(link.send.lock().retransmit[0].is_empty());
    }

    #[test]
    fn blocked_sends_fail_with_not_sent() {
        let link = link();
        link.block_all_upcoming_sends();
        let (result, datagrams, _) =
            link.add_to_send_queue(40, b"hi", HeaderType::ReliableOrdered, 0, false);
        assert_eq!(result, SendResult::NotSent);
        assert!(datagrams.is_empty());
    }

    #[test]
    fn send_queue_rejects_ack_and_reliable_newest_classes() {
        let link = link();
        let (result, _, _) = link.add_to_send_queue(40, b"hi", HeaderType::Ack, 0, false);
        assert_eq!(result, SendResult::InternalError);
        let (result, _, _) =
            link.add_to_send_queue(40, b"hi", HeaderType::ReliableNewest, 0, false);
        assert_eq!(result, SendResult::InternalError);
    }

    #[test]
    fn ack_removes_matching_retransmit_entry() {
        let link = link();
        link.add_to_send_queue(40, b"a", HeaderType::ReliableOrdered, 0, false);
        link.add_to_send_queue(40, b"b", HeaderType::ReliableOrdered, 0, false);
        assert_eq!(link.send.lock().retransmit[0].len(), 2);

        link.recv_data(Packet::Ack {
            link_id: 1,
            channel: 0,
            sequences: vec![0],
        });
        assert_eq!(link.send.lock().retransmit[0].len(), 1);
        assert_eq!(link.send.lock().retransmit[0][0].seq, 1);
    }

    #[test]
    fn reliable_ordered_delivers_in_order_despite_reordered_arrival() {
        let link = link();
        let make = |seq: u32, byte: u8| Packet::Normal {
            link_id: 1,
            header_type: HeaderType::ReliableOrdered,
            flags: NormalFlags {
                channel: 0,
                relay: false,
                first_fragment: true,
                last_fragment: true,
            },
            sequence: seq,
            data_id: 40,
            payload: vec![byte],
        };

        link.recv_data(make(1, 2));
        assert!(link.poll().is_none(), "seq 1 must wait for seq 0");

        link.recv_data(make(0, 1));
        match link.poll() {
            Some(Delivery::Reliable { payload, .. }) => assert_eq!(payload, vec![1]),
            other => panic!("expected seq 0 first, got {other:?}"),
        }
        match link.poll() {
            Some(Delivery::Reliable { payload, .. }) => assert_eq!(payload, vec![2]),
            other => panic!("expected seq 1 next, got {other:?}"),
        }
        assert!(link.poll().is_none());
    }

    #[test]
    fn reliable_ordered_reassembles_fragments_before_delivery() {
        let link = link();
        let fragment = |seq: u32, byte: u8, first: bool, last: bool| Packet::Normal {
            link_id: 1,
            header_type: HeaderType::ReliableOrdered,
            flags: NormalFlags {
                channel: 0,
                relay: false,
                first_fragment: first,
                last_fragment: last,
            },
            sequence: seq,
            data_id: 40,
            payload: vec![byte],
        };

        let frag0 = fragment(0, 1, true, false);
        let frag1 = fragment(1, 2, false, false);
        let frag2 = fragment(2, 3, false, true);

        link.recv_data(frag2);
        link.recv_data(frag0);
        assert!(link.poll().is_none(), "middle fragment still missing");
        link.recv_data(frag1);

        match link.poll() {
            Some(Delivery::Reliable { payload, .. }) => assert_eq!(payload, vec![1, 2, 3]),
            other => panic!("expected reassembled packet, got {other:?}"),
        }
    }

    #[test]
    fn reliable_fragment_overflow_refuses_further_input() {
        let link = link();
        let fragment = |seq: u32| Packet::Normal {
            link_id: 1,
            header_type: HeaderType::ReliableOrdered,
            flags: NormalFlags {
                channel: 0,
                relay: false,
                first_fragment: seq == 0,
                last_fragment: false,
            },
            sequence: seq,
            data_id: 40,
            payload: vec![0],
        };

        // Never send a last-fragment piece, so the reassembly buffer only ever grows.
        for seq in 0..=MAX_BUFFERED_FRAGMENTS_PER_CHANNEL as u32 + 1 {
            link.recv_data(fragment(seq));
        }

        assert!(link.has_fragment_overflow());
        assert!(link.is_refused());

        let before = link.has_fragment_overflow();
        link.recv_data(fragment(MAX_BUFFERED_FRAGMENTS_PER_CHANNEL as u32 + 2));
        assert_eq!(link.has_fragment_overflow(), before, "refused link ignores further input");
    }

    #[test]
    fn unreliable_sequenced_drops_stale_and_delivers_newer() {
        let link = link();
        let make = |seq: u32, byte: u8| Packet::Normal {
            link_id: 1,
            header_type: HeaderType::UnreliableSequenced,
            flags: NormalFlags {
                channel: 0,
                relay: false,
                first_fragment: true,
                last_fragment: true,
            },
            sequence: seq,
            data_id: 41,
            payload: vec![byte],
        };

        link.recv_data(make(5, 5));
        assert_eq!(
            link.poll(),
            Some(Delivery::Unreliable {
                channel: 0,
                data_id: 41,
                payload: vec![5]
            })
        );

        link.recv_data(make(3, 3));
        assert!(link.poll().is_none(), "stale packet must be dropped");

        link.recv_data(make(6, 6));
        assert_eq!(
            link.poll(),
            Some(Delivery::Unreliable {
                channel: 0,
                data_id: 41,
                payload: vec![6]
            })
        );
    }

    #[test]
    fn reliable_newest_drops_stale_and_supersedes_with_newer() {
        let link = link();
        let make = |seq: u32, body: Vec<u8>| Packet::ReliableNewest {
            link_id: 1,
            sequence: seq,
            body,
        };

        link.recv_data(make(2, vec![0xAA]));
        link.recv_data(make(1, vec![0xBB]));
        assert_eq!(link.poll(), Some(Delivery::ReliableNewest { payload: vec![0xAA] }));
        assert!(link.poll().is_none());
    }

    #[test]
    fn poll_order_is_reliable_then_unreliable_then_reliable_newest() {
        let link = link();
        link.recv_data(Packet::ReliableNewest {
            link_id: 1,
            sequence: 0,
            body: vec![1],
        });
        link.recv_data(Packet::Normal {
            link_id: 1,
            header_type: HeaderType::UnreliableSequenced,
            flags: NormalFlags {
                channel: 0,
                relay: false,
                first_fragment: true,
                last_fragment: true,
            },
            sequence: 0,
            data_id: 41,
            payload: vec![2],
        });
        link.recv_data(Packet::Normal {
            link_id: 1,
            header_type: HeaderType::ReliableOrdered,
            flags: NormalFlags {
                channel: 0,
                relay: false,
                first_fragment: true,
                last_fragment: true,
            },
            sequence: 0,
            data_id: 40,
            payload: vec![3],
        });

        assert!(matches!(link.poll(), Some(Delivery::Reliable { .. })));
        assert!(matches!(link.poll(), Some(Delivery::Unreliable { .. })));
        assert!(matches!(link.poll(), Some(Delivery::ReliableNewest { .. })));
    }

    #[test]
    fn add_reliable_newest_rejects_out_of_range_item_bit() {
        let link = link();
        assert_eq!(
            link.add_reliable_newest(60, b"x", 1, 16),
            SendResult::InternalError
        );
    }

    #[test]
    fn reliable_newest_dispatch_coalesces_successive_writes_and_clears_once_acked() {
        let link = link();
        link.add_reliable_newest(60, b"v1", 1, 0);
        link.add_reliable_newest(60, b"v2", 1, 0);
        link.add_reliable_newest(60, b"v3", 1, 0);

        let now = Instant::now();
        let datagram = link
            .dispatch_reliable_newest(now, Duration::from_millis(0))
            .expect("dirty group must dispatch");
        let packet = Packet::decode(&datagram).unwrap();
        let Packet::ReliableNewest { sequence, .. } = packet else {
            panic!("expected a ReliableNewest datagram");
        };

        assert!(link.rel_newest.lock().groups[&1].items[0]
            .as_ref()
            .unwrap()
            .data
            .ends_with(b"v3"));

        link.recv_data(Packet::AckReliableNewest {
            link_id: 1,
            highest_seq: sequence,
        });
        assert!(link.rel_newest.lock().groups.is_empty());
    }

    #[test]
    fn dispatch_reliable_newest_emits_nothing_when_clean() {
        let link = link();
        assert!(link
            .dispatch_reliable_newest(Instant::now(), Duration::from_millis(0))
            .is_none());
    }

    #[test]
    fn ack_dispatch_only_emits_for_non_empty_channels() {
        let link = link();
        link.add_to_send_queue(40, b"a", HeaderType::ReliableOrdered, 3, false);
        link.recv_data(Packet::Normal {
            link_id: 1,
            header_type: HeaderType::ReliableOrdered,
            flags: NormalFlags {
                channel: 3,
                relay: false,
                first_fragment: true,
                last_fragment: true,
            },
            sequence: 0,
            data_id: 40,
            payload: vec![1],
        });

        let datagrams = link.dispatch_acks(Instant::now(), Duration::from_millis(0));
        assert_eq!(datagrams.len(), 1);
        assert_eq!(Packet::decode(&datagrams[0]).unwrap().link_id(), 1);
    }

    #[test]
    fn pin_unpin_tracks_zero_correctly() {
        let link = link();
        assert!(!link.is_pinned());
        link.pin();
        assert!(link.is_pinned());
        link.pin();
        link.unpin();
        assert!(link.is_pinned());
        link.unpin();
        assert!(!link.is_pinned());
    }

    #[test]
    fn mark_pending_delete_is_idempotent_about_the_timestamp() {
        let link = link();
        let t0 = Instant::now();
        link.mark_pending_delete(t0);
        let age_before = link.pending_delete_age(t0).unwrap();
        link.mark_pending_delete(t0 + Duration::from_secs(1));
        let age_after = link.pending_delete_age(t0).unwrap();
        assert_eq!(age_before, age_after);
    }
}
