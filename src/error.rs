//! Tagged result types for every fallible public operation (§6/§7).
//!
//! The teacher crate mixes this same way: `anyhow::Result` for anything that indicates a
//! malformed datagram or broken invariant (propagated with `?`, logged, and dropped at the
//! boundary — see `net::channel::Channel::read`), and small hand-rolled enums for outcomes the
//! caller is expected to branch on (`ConnectionStatus` in `net::connections::manager`). This
//! module collects the latter for the whole crate; `anyhow::Error`/`anyhow::Result` are used
//! directly elsewhere for the former.

/// Outcome of a single `send`-class call (§4.B, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// Not the conventional "Success" spelling — kept to match the source's own variant name.
    Succes,
    NotSent,
    InternalError,
}

/// Outcome of the blocking socket facade's `recv` (§4.A).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketRecvResult {
    Succes,
    NoData,
    Error,
    SocketClosed,
}

/// Outcome delivered to `onConnectResult` (§4.D, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectResult {
    Succes,
    Timedout,
    InvalidPassword,
    MaxConnectionsReached,
    AlreadyConnected,
    InvalidConnectPacket,
}

/// Reason delivered to `onDisconnect` (§4.D).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Peer (or we) sent an explicit `Disconnect` control packet.
    Closed,
    /// Keep-alive grace period elapsed with no reply.
    Lost,
}

/// Per-`Node` critical-error bitmask (§7): once any bit is set, `update()` becomes a no-op and
/// the condition stays visible to the caller via [`CriticalErrors::any`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CriticalErrors(u8);

impl CriticalErrors {
    pub const FRAGMENT_BUFFER_OVERFLOW: Self = Self(1 << 0);
    pub const ACCEPTED_PACKET_DESERIALIZE_FAILURE: Self = Self(1 << 1);

    pub fn set(&mut self, flag: CriticalErrors) {
        self.0 |= flag.0;
    }

    pub fn any(&self) -> bool {
        self.0 != 0
    }

    pub fn has(&self, flag: CriticalErrors) -> bool {
        self.0 & flag.0 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_errors_start_clear() {
        let errs = CriticalErrors::default();
        assert!(!errs.any());
    }

    #[test]
    fn setting_a_flag_makes_any_true() {
        let mut errs = CriticalErrors::default();
        errs.set(CriticalErrors::FRAGMENT_BUFFER_OVERFLOW);
        assert!(errs.any());
        assert!(errs.has(CriticalErrors::FRAGMENT_BUFFER_OVERFLOW));
        assert!(!errs.has(CriticalErrors::ACCEPTED_PACKET_DESERIALIZE_FAILURE));
    }
}
