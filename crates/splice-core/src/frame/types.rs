//! Frame type definitions

use crate::error::{Error, Result};
use bitflags::bitflags;
use std::fmt;
use std::str::FromStr;

/// Kind of a frame in an encapsulation chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Capture metadata wrapper
    TrafficDescription,
    /// Ethernet II
    Ethernet,
    /// IPv4
    Ipv4,
    /// TCP
    Tcp,
    /// UDP
    Udp,
    /// Uninterpreted bytes
    Raw,
}

/// Well-known EtherType values
pub mod ether_type {
    /// IPv4
    pub const IPV4: u16 = 0x0800;
    /// ARP
    pub const ARP: u16 = 0x0806;
    /// IPv6
    pub const IPV6: u16 = 0x86DD;
}

/// IP protocol numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpProtocol {
    /// ICMP (protocol number 1)
    Icmp,
    /// TCP (protocol number 6)
    Tcp,
    /// UDP (protocol number 17)
    Udp,
    /// Anything else
    Other(u8),
}

impl IpProtocol {
    /// Create from protocol number
    pub fn from_u8(proto: u8) -> Self {
        match proto {
            1 => IpProtocol::Icmp,
            6 => IpProtocol::Tcp,
            17 => IpProtocol::Udp,
            other => IpProtocol::Other(other),
        }
    }

    /// Get protocol number
    pub fn to_u8(self) -> u8 {
        match self {
            IpProtocol::Icmp => 1,
            IpProtocol::Tcp => 6,
            IpProtocol::Udp => 17,
            IpProtocol::Other(n) => n,
        }
    }
}

bitflags! {
    /// TCP control flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TcpFlags: u8 {
        /// No more data from sender
        const FIN = 0x01;
        /// Synchronize sequence numbers
        const SYN = 0x02;
        /// Reset the connection
        const RST = 0x04;
        /// Push function
        const PSH = 0x08;
        /// Acknowledgment field significant
        const ACK = 0x10;
        /// Urgent pointer field significant
        const URG = 0x20;
        /// ECN echo
        const ECE = 0x40;
        /// Congestion window reduced
        const CWR = 0x80;
    }
}

impl TcpFlags {
    /// SYN without ACK, the first segment of an active open
    pub fn is_pure_syn(self) -> bool {
        self.contains(TcpFlags::SYN) && !self.contains(TcpFlags::ACK)
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(TcpFlags, char); 6] = [
            (TcpFlags::SYN, 'S'),
            (TcpFlags::ACK, '.'),
            (TcpFlags::FIN, 'F'),
            (TcpFlags::RST, 'R'),
            (TcpFlags::PSH, 'P'),
            (TcpFlags::URG, 'U'),
        ];
        for (flag, c) in NAMES {
            if self.contains(flag) {
                write!(f, "{c}")?;
            }
        }
        Ok(())
    }
}

/// 48-bit hardware address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// ff:ff:ff:ff:ff:ff
    pub const BROADCAST: MacAddress = MacAddress([0xFF; 6]);

    /// Raw octets
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut octets = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| Error::frame_parse(format!("MAC address too short: {s}")))?;
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| Error::frame_parse(format!("Invalid MAC octet '{part}'")))?;
        }
        if parts.next().is_some() {
            return Err(Error::frame_parse(format!("MAC address too long: {s}")));
        }
        Ok(MacAddress(octets))
    }
}
