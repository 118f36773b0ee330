//! Tunable timing/sizing constants (§6), gathered into one config struct the way the teacher
//! crate centralizes its wire-format constants in `net::mod` (`BUFFER_SIZE`, `BUFFER_WINDOW_SIZE`,
//! ...). Construction parameters are the configuration surface for this library — there's no
//! config-file dependency in the teacher crate to draw from, and a transport library has no
//! business reading its own env/files.

use std::time::Duration;

/// Initial fragment size (§6): payload chunks this size or smaller are sent as a single fragment.
pub const FRAGMENT_SIZE: usize = 1900;
/// Upper bound on a single UDP datagram's payload (§6), including header.
pub const RECV_BUFFER_SIZE: usize = 3000;
/// Fixed grace period for a keep-alive reply before a connection is declared lost (§4.D).
pub const KEEP_ALIVE_GRACE: Duration = Duration::from_secs(5);
/// How long a pending-delete link keeps absorbing late datagrams/acks (§4.B).
pub const LINGER_MULTIPLIER_FOR_SWEEP: u32 = 2;
/// Delete-sweep cadence (§4.C).
pub const DELETE_SWEEP_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Fixed retransmit cadence, standing in for `1.3 * rtt` until an RTT estimator exists
    /// (§9 open question).
    pub resend_interval_ms: u32,
    pub keep_alive_interval_sec: u32,
    pub connect_timeout_sec: u32,
    pub ack_aggregate_time_ms: u32,
    pub send_rel_newest_interval_ms: u32,
    pub linger_ms: u32,
    pub fragment_size: usize,
    pub max_incoming_connections: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            resend_interval_ms: 50,
            keep_alive_interval_sec: 8,
            connect_timeout_sec: 8,
            ack_aggregate_time_ms: 8,
            send_rel_newest_interval_ms: 33,
            linger_ms: 500,
            fragment_size: FRAGMENT_SIZE,
            max_incoming_connections: 32,
        }
    }
}

impl NodeConfig {
    pub fn new(resend_interval_ms: u32, keep_alive_interval_sec: u32) -> Self {
        Self {
            resend_interval_ms,
            keep_alive_interval_sec,
            ..Default::default()
        }
    }

    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms as u64)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_sec as u64)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_sec as u64)
    }

    pub fn ack_aggregate_time(&self) -> Duration {
        Duration::from_millis(self.ack_aggregate_time_ms as u64)
    }

    pub fn send_rel_newest_interval(&self) -> Duration {
        Duration::from_millis(self.send_rel_newest_interval_ms as u64)
    }

    pub fn resend_interval(&self) -> Duration {
        Duration::from_millis(self.resend_interval_ms as u64)
    }
}
