//! Synthetic TCP endpoints
//!
//! [`TcpSocket`] is a user-space TCP state machine that consumes and
//! produces [`TcpFrame`](crate::frame::TcpFrame)s instead of talking to
//! the OS. [`TcpIpStack`] binds a socket to a fixed four-tuple and wraps
//! its segments in IPv4 (and Ethernet when link addresses are known).
//!
//! Observers are always invoked after the socket lock is released, so a
//! callback may call back into the socket.

pub mod seq;
mod socket;
mod stack;

pub use socket::{SocketObserver, SocketStats, TcpSocket};
pub use stack::{FrameListener, StateListener, TcpIpStack};

use crate::error::{Error, Result};
use std::fmt;
use std::time::Duration;

/// Classic TCP connection states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpState {
    /// No connection
    Closed,
    /// Waiting for a SYN
    Listen,
    /// SYN sent, waiting for SYN-ACK
    SynSent,
    /// SYN received and answered
    SynReceived,
    /// Data transfer
    Established,
    /// FIN sent, waiting for its ACK
    FinWait1,
    /// Our FIN acknowledged, waiting for the peer's FIN
    FinWait2,
    /// Peer closed, local side may still send
    CloseWait,
    /// FINs crossed
    Closing,
    /// Waiting for the ACK of our FIN after the peer closed
    LastAck,
    /// Lingering after a full close
    TimeWait,
}

impl TcpState {
    /// Closed or TimeWait; nothing more will be exchanged with the application
    pub fn is_closed(self) -> bool {
        matches!(self, TcpState::Closed | TcpState::TimeWait)
    }

    /// Both sequence spaces are known
    pub fn is_synchronized(self) -> bool {
        !matches!(
            self,
            TcpState::Closed | TcpState::Listen | TcpState::SynSent | TcpState::SynReceived
        )
    }

    /// Handshake still in progress
    pub fn is_connecting(self) -> bool {
        matches!(self, TcpState::SynSent | TcpState::SynReceived)
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TcpState::Closed => "Closed",
            TcpState::Listen => "Listen",
            TcpState::SynSent => "SynSent",
            TcpState::SynReceived => "SynReceived",
            TcpState::Established => "Established",
            TcpState::FinWait1 => "FinWait1",
            TcpState::FinWait2 => "FinWait2",
            TcpState::CloseWait => "CloseWait",
            TcpState::Closing => "Closing",
            TcpState::LastAck => "LastAck",
            TcpState::TimeWait => "TimeWait",
        };
        f.write_str(name)
    }
}

/// Why a socket reached Closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// Orderly FIN exchange, or a close before any connection existed
    Normal,
    /// The peer sent RST
    Reset,
    /// Closed locally with `abort`
    Aborted,
    /// The handshake did not complete in time
    ConnectTimeout,
    /// A segment exhausted its retransmission budget
    Timeout,
}

impl CloseReason {
    /// Anything but an orderly close
    pub fn is_abnormal(self) -> bool {
        self != CloseReason::Normal
    }
}

/// Notification of one state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    /// State before the transition
    pub old: TcpState,
    /// State after the transition
    pub new: TcpState,
    /// Set when `new` is Closed
    pub reason: Option<CloseReason>,
}

/// Tunables of a synthetic socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketConfig {
    /// Largest payload per segment
    pub mss: u16,
    /// Receive buffer size; the advertised window shrinks as it fills.
    /// Also bounds the bytes `send` queues ahead of the peer's window.
    pub window: u16,
    /// Base retransmission timeout, doubled on every retry
    pub retransmit_timeout: Duration,
    /// Retries before the connection is given up
    pub max_retransmissions: u32,
    /// Bound on the active-open handshake
    pub connect_timeout: Duration,
    /// Bound on a blocking `close`
    pub close_timeout: Duration,
    /// How long TimeWait lingers before Closed
    pub time_wait: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            mss: 1460,
            window: 65535,
            retransmit_timeout: Duration::from_millis(500),
            max_retransmissions: 5,
            connect_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(10),
            time_wait: Duration::from_secs(2),
        }
    }
}

impl SocketConfig {
    /// Reject values a socket cannot make progress with
    pub fn validate(&self) -> Result<()> {
        if self.mss == 0 {
            return Err(Error::config_value("socket.mss", "Must be positive"));
        }
        if self.window == 0 {
            return Err(Error::config_value("socket.window", "Must be positive"));
        }
        if self.retransmit_timeout.is_zero() {
            return Err(Error::config_value("socket.retransmit_timeout", "Must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_states() {
        assert!(TcpState::Closed.is_closed());
        assert!(TcpState::TimeWait.is_closed());
        assert!(!TcpState::LastAck.is_closed());
        assert!(TcpState::CloseWait.is_synchronized());
        assert!(!TcpState::SynReceived.is_synchronized());
    }

    #[test]
    fn test_socket_config_validation() {
        assert!(SocketConfig::default().validate().is_ok());
        let zero_mss = SocketConfig {
            mss: 0,
            ..SocketConfig::default()
        };
        assert!(matches!(zero_mss.validate(), Err(Error::ConfigValue { .. })));
        let zero_window = SocketConfig {
            window: 0,
            ..SocketConfig::default()
        };
        assert!(zero_window.validate().is_err());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(TcpState::FinWait2.to_string(), "FinWait2");
    }
}
