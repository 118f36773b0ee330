//! On-wire packet header encoding/decoding (§3 of the spec).
//!
//! Generalized from the teacher crate's `net::header::Header`/`PacketType`: the cursor-based
//! read/write shape is kept, the field layout is replaced with the one this format defines, and
//! `HeaderType` is parsed with `strum_macros::FromRepr` the way the teacher's `PacketType` is
//! looked up via `PacketType::from_repr` in `header.rs`/`connections/manager.rs`.

use anyhow::{bail, Result};
use bit_field::BitField;
use strum_macros::FromRepr;

use crate::int_buffer::IntBuffer;

pub const LINK_ID_SIZE: usize = 4;
pub const HEADER_TYPE_SIZE: usize = 1;
pub const GENERIC_HEADER_SIZE: usize = LINK_ID_SIZE + HEADER_TYPE_SIZE;

/// Values `>= USER_OFFSET` are application `DataId`s; values below are reserved control ids.
pub const USER_OFFSET: u8 = 32;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum HeaderType {
    Ack = 0,
    AckReliableNewest = 1,
    ReliableOrdered = 2,
    UnreliableSequenced = 3,
    ReliableNewest = 4,
}

/// Reserved `DataId` values (§3/§6). Application ids start at [`USER_OFFSET`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum ControlDataId {
    ConnectRequest = 0,
    ConnectAccept = 1,
    Disconnect = 2,
    KeepAliveRequest = 3,
    KeepAliveAnswer = 4,
    IncorrectPassword = 5,
    MaxConnectionsReached = 6,
    AlreadyConnected = 7,
    RemoteConnected = 8,
    RemoteDisconnected = 9,
    Rpc = 10,
    VariableGroupCreate = 11,
    VariableGroupDestroy = 12,
    VariableGroupUpdate = 13,
    IdPack = 14,
}

impl ControlDataId {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Channel lane for reliable-ordered / unreliable-sequenced traffic (§3).
pub const NUM_CHANNELS: usize = 8;

/// Decoded byte 5 of a Normal (ReliableOrdered/UnreliableSequenced) header:
/// `channel(0..7) | relay-bit(3) | firstFragment(4) | lastFragment(5)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalFlags {
    pub channel: u8,
    pub relay: bool,
    pub first_fragment: bool,
    pub last_fragment: bool,
}

impl NormalFlags {
    pub fn to_byte(self) -> u8 {
        let mut byte = 0_u8;
        byte.set_bits(0..3, self.channel & 0b0000_0111);
        byte.set_bit(3, self.relay);
        byte.set_bit(4, self.first_fragment);
        byte.set_bit(5, self.last_fragment);
        byte
    }

    pub fn from_byte(byte: u8) -> Self {
        Self {
            channel: byte.get_bits(0..3),
            relay: byte.get_bit(3),
            first_fragment: byte.get_bit(4),
            last_fragment: byte.get_bit(5),
        }
    }
}

/// A fully decoded datagram, independent of the `HeaderType` discriminant's numeric value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Ack {
        link_id: u32,
        channel: u8,
        sequences: Vec<u32>,
    },
    AckReliableNewest {
        link_id: u32,
        highest_seq: u32,
    },
    Normal {
        link_id: u32,
        header_type: HeaderType,
        flags: NormalFlags,
        sequence: u32,
        data_id: u8,
        payload: Vec<u8>,
    },
    /// `body` is the raw concatenation of `(groupCount, {groupId, itemBits, skipBytes, items})`
    /// entries (§3). The core never parses group boundaries on receive; it only ever constructs
    /// them on send, where it owns the reliable-newest group table (see `link::reliable_newest`).
    ReliableNewest {
        link_id: u32,
        sequence: u32,
        body: Vec<u8>,
    },
}

impl Packet {
    pub fn link_id(&self) -> u32 {
        match self {
            Packet::Ack { link_id, .. }
            | Packet::AckReliableNewest { link_id, .. }
            | Packet::Normal { link_id, .. }
            | Packet::ReliableNewest { link_id, .. } => *link_id,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Packet::Ack {
                link_id,
                channel,
                sequences,
            } => {
                let mut buf = vec![0_u8; GENERIC_HEADER_SIZE + 1 + 4 + sequences.len() * 4];
                let mut w = IntBuffer::default();
                w.write_u32(*link_id, &mut buf);
                w.write_u8(HeaderType::Ack as u8, &mut buf);
                w.write_u8(*channel, &mut buf);
                w.write_u32(sequences.len() as u32, &mut buf);
                for seq in sequences {
                    w.write_u32(*seq, &mut buf);
                }
                buf
            }
            Packet::AckReliableNewest {
                link_id,
                highest_seq,
            } => {
                let mut buf = vec![0_u8; GENERIC_HEADER_SIZE + 4];
                let mut w = IntBuffer::default();
                w.write_u32(*link_id, &mut buf);
                w.write_u8(HeaderType::AckReliableNewest as u8, &mut buf);
                w.write_u32(*highest_seq, &mut buf);
                buf
            }
            Packet::Normal {
                link_id,
                header_type,
                flags,
                sequence,
                data_id,
                payload,
            } => {
                let mut buf = vec![0_u8; GENERIC_HEADER_SIZE + 1 + 4 + 1 + payload.len()];
                let mut w = IntBuffer::default();
                w.write_u32(*link_id, &mut buf);
                w.write_u8(*header_type as u8, &mut buf);
                w.write_u8(flags.to_byte(), &mut buf);
                w.write_u32(*sequence, &mut buf);
                w.write_u8(*data_id, &mut buf);
                w.write_slice(payload, &mut buf);
                buf
            }
            Packet::ReliableNewest {
                link_id,
                sequence,
                body,
            } => {
                let mut buf = vec![0_u8; GENERIC_HEADER_SIZE + 4 + body.len()];
                let mut w = IntBuffer::default();
                w.write_u32(*link_id, &mut buf);
                w.write_u8(HeaderType::ReliableNewest as u8, &mut buf);
                w.write_u32(*sequence, &mut buf);
                w.write_slice(body, &mut buf);
                buf
            }
        }
    }

    pub fn decode(data: &[u8]) -> Result<Packet> {
        if data.len() < GENERIC_HEADER_SIZE {
            bail!("datagram shorter than the generic header ({} bytes)", data.len());
        }

        let mut r = IntBuffer::default();
        let link_id = r.read_u32(data);
        let header_type = HeaderType::from_repr(r.read_u8(data))
            .ok_or_else(|| anyhow::anyhow!("unknown header type byte"))?;

        match header_type {
            HeaderType::Ack => {
                if data.len() < GENERIC_HEADER_SIZE + 5 {
                    bail!("truncated ack header");
                }
                let channel = r.read_u8(data);
                let count = r.read_u32(data) as usize;
                if data.len() < GENERIC_HEADER_SIZE + 5 + count * 4 {
                    bail!("ack sequence count/length mismatch");
                }
                let sequences = (0..count).map(|_| r.read_u32(data)).collect();
                Ok(Packet::Ack {
                    link_id,
                    channel,
                    sequences,
                })
            }
            HeaderType::AckReliableNewest => {
                if data.len() < GENERIC_HEADER_SIZE + 4 {
                    bail!("truncated ack-reliable-newest header");
                }
                let highest_seq = r.read_u32(data);
                Ok(Packet::AckReliableNewest {
                    link_id,
                    highest_seq,
                })
            }
            HeaderType::ReliableOrdered | HeaderType::UnreliableSequenced => {
                if data.len() < GENERIC_HEADER_SIZE + 6 {
                    bail!("truncated normal header");
                }
                let flags = NormalFlags::from_byte(r.read_u8(data));
                let sequence = r.read_u32(data);
                let data_id = r.read_u8(data);
                let payload = data[r.index..].to_vec();
                Ok(Packet::Normal {
                    link_id,
                    header_type,
                    flags,
                    sequence,
                    data_id,
                    payload,
                })
            }
            HeaderType::ReliableNewest => {
                if data.len() < GENERIC_HEADER_SIZE + 4 {
                    bail!("truncated reliable-newest header");
                }
                let sequence = r.read_u32(data);
                let body = data[r.index..].to_vec();
                Ok(Packet::ReliableNewest {
                    link_id,
                    sequence,
                    body,
                })
            }
        }
    }
}
