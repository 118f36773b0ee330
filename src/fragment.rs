//! Fragmentation and reassembly (§4.B).
//!
//! Generalized from the teacher crate's `net::fragmentation_manager`: that module ties fragments
//! together with an explicit `(groupId, fragmentId, fragmentCount)` triple carried in every
//! header. This format instead stamps every fragment with its own sequence number in the
//! channel's ordinary sequence space and marks the first/last chunk with flag bits (§3), so
//! reassembly is a backward/forward scan over contiguous sequences rather than a fixed-size
//! slot table.

/// Splits `payload` into chunks of at most `fragment_size` bytes. A payload that fits in a single
/// chunk still goes through this path so the caller can mark `first == last == true` uniformly.
pub fn split(payload: &[u8], fragment_size: usize) -> Vec<&[u8]> {
    if payload.is_empty() {
        return vec![&payload[0..0]];
    }
    payload.chunks(fragment_size.max(1)).collect()
}

/// One piece of a reliable-ordered or unreliable-sequenced fragmented packet, keyed by its own
/// sequence number in the reassembly map.
#[derive(Debug, Clone)]
pub struct Piece {
    pub data: Vec<u8>,
    pub first: bool,
    pub last: bool,
    /// The logical packet's `DataId`, stamped identically on every fragment of one send since a
    /// channel hands out sequences to a single fragmented send at a time (no interleaving).
    pub data_id: u8,
}

/// Attempts to reassemble a logical packet around `seq`, which must already be present in
/// `pieces`. Walks backward from `seq` until a first-fragment piece is found, then forward from
/// `seq` until a last-fragment piece is found. Returns `None` if either end of the span is
/// missing yet (reassembly will be retried once the gap is filled in by a later piece).
///
/// On success, returns the concatenated payload and the inclusive `[seq_begin, seq_end]` span so
/// the caller can advance its expected-sequence counter by the span's length.
pub fn try_reassemble(
    pieces: &std::collections::HashMap<u32, Piece>,
    seq: u32,
) -> Option<(Vec<u8>, u32, u32)> {
    use crate::sequence;

    let anchor = pieces.get(&seq)?;
    if anchor.first && anchor.last {
        return Some((anchor.data.clone(), seq, seq));
    }

    let mut seq_begin = seq;
    while !pieces.get(&seq_begin)?.first {
        let prev = sequence::previous(seq_begin);
        if prev == seq_begin {
            return None;
        }
        seq_begin = prev;
    }

    let mut seq_end = seq;
    while !pieces.get(&seq_end)?.last {
        let next = sequence::next(seq_end);
        if next == seq_end {
            return None;
        }
        seq_end = next;
    }

    let mut data = Vec::new();
    let mut cursor = seq_begin;
    loop {
        data.extend_from_slice(&pieces.get(&cursor)?.data);
        if cursor == seq_end {
            break;
        }
        cursor = sequence::next(cursor);
    }

    Some((data, seq_begin, seq_end))
}
