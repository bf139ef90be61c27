//! Layered frame model
//!
//! A [`Frame`] is a node in an encapsulation chain: each variant owns its
//! encapsulated child exclusively. Frames are mutable values; lengths and
//! bytes are recomputed from the chain at every access, so a handler can
//! edit a TCP payload in place and the IPv4 length and checksums follow.

pub mod checksum;
mod ethernet;
mod ipv4;
mod tcp;
mod types;
mod udp;

pub use ethernet::{EthernetFrame, ETHERNET_HEADER_LEN};
pub use ipv4::{Ipv4Frame, IPV4_HEADER_LEN};
pub use tcp::{TcpFrame, TCP_HEADER_LEN};
pub use types::{ether_type, FrameType, IpProtocol, MacAddress, TcpFlags};
pub use udp::{UdpFrame, UDP_HEADER_LEN};

use bytes::{Bytes, BytesMut};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::SystemTime;

/// Anything that knows its wire length and can serialize itself
pub trait Encodable {
    /// Number of bytes `encode_into` will append
    fn encoded_len(&self) -> usize;

    /// Append the wire representation to `buf`
    fn encode_into(&self, buf: &mut BytesMut);

    /// Serialize into a fresh vector
    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.to_vec()
    }
}

/// Uninterpreted bytes, typically application data
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawFrame {
    /// Frame contents
    pub data: Bytes,
}

impl RawFrame {
    /// Copy `data` into a new raw frame
    pub fn new(data: &[u8]) -> Self {
        Self {
            data: Bytes::copy_from_slice(data),
        }
    }
}

impl From<Bytes> for RawFrame {
    fn from(data: Bytes) -> Self {
        Self { data }
    }
}

impl Encodable for RawFrame {
    fn encoded_len(&self) -> usize {
        self.data.len()
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(&self.data);
    }
}

/// Non-owning reference to the interface a frame was captured on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InterfaceRef {
    /// Interface name
    pub name: Arc<str>,
    /// Interface index
    pub index: u32,
}

/// Capture metadata wrapper; invisible on the wire
#[derive(Debug, Clone, PartialEq)]
pub struct TrafficDescriptionFrame {
    /// Interface the frame arrived on, `None` for synthetic frames
    pub source: Option<InterfaceRef>,
    /// Capture timestamp
    pub captured_at: SystemTime,
    /// The wrapped frame
    pub frame: Box<Frame>,
}

impl TrafficDescriptionFrame {
    /// Wrap `frame`, stamping the current time
    pub fn new(source: Option<InterfaceRef>, frame: Frame) -> Self {
        Self {
            source,
            captured_at: SystemTime::now(),
            frame: Box::new(frame),
        }
    }
}

/// A protocol frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Capture metadata wrapper
    Traffic(TrafficDescriptionFrame),
    /// Ethernet II
    Ethernet(EthernetFrame),
    /// IPv4
    Ipv4(Ipv4Frame),
    /// TCP
    Tcp(TcpFrame),
    /// UDP
    Udp(UdpFrame),
    /// Raw bytes
    Raw(RawFrame),
}

impl Frame {
    /// Wire length of the whole chain
    pub fn len(&self) -> usize {
        match self {
            Frame::Traffic(t) => t.frame.len(),
            Frame::Ethernet(f) => f.encoded_len(),
            Frame::Ipv4(f) => f.encoded_len(),
            Frame::Tcp(f) => f.encoded_len(),
            Frame::Udp(f) => f.encoded_len(),
            Frame::Raw(f) => f.encoded_len(),
        }
    }

    /// Whether the chain serializes to nothing
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialize the whole chain
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.len());
        self.encode_into(&mut buf);
        buf.to_vec()
    }

    /// Append the serialized chain to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Frame::Traffic(t) => t.frame.encode_into(buf),
            Frame::Ethernet(f) => f.encode_into(buf),
            Frame::Ipv4(f) => f.encode_into(buf),
            Frame::Tcp(f) => f.encode_into(buf),
            Frame::Udp(f) => f.encode_into(buf),
            Frame::Raw(f) => f.encode_into(buf),
        }
    }

    /// Kind of this node
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Traffic(_) => FrameType::TrafficDescription,
            Frame::Ethernet(_) => FrameType::Ethernet,
            Frame::Ipv4(_) => FrameType::Ipv4,
            Frame::Tcp(_) => FrameType::Tcp,
            Frame::Udp(_) => FrameType::Udp,
            Frame::Raw(_) => FrameType::Raw,
        }
    }

    /// The encapsulated child, if any
    pub fn encapsulated(&self) -> Option<&Frame> {
        match self {
            Frame::Traffic(t) => Some(&t.frame),
            Frame::Ethernet(f) => f.payload.as_deref(),
            Frame::Ipv4(f) => f.payload.as_deref(),
            Frame::Tcp(f) => f.payload.as_deref(),
            Frame::Udp(f) => f.payload.as_deref(),
            Frame::Raw(_) => None,
        }
    }

    /// Mutable access to the encapsulated child
    pub fn encapsulated_mut(&mut self) -> Option<&mut Frame> {
        match self {
            Frame::Traffic(t) => Some(&mut t.frame),
            Frame::Ethernet(f) => f.payload.as_deref_mut(),
            Frame::Ipv4(f) => f.payload.as_deref_mut(),
            Frame::Tcp(f) => f.payload.as_deref_mut(),
            Frame::Udp(f) => f.payload.as_deref_mut(),
            Frame::Raw(_) => None,
        }
    }

    /// Replace the encapsulated child
    ///
    /// Raw frames cannot carry a child; the call is ignored for them. A
    /// traffic wrapper always needs a child, so `None` leaves it untouched.
    pub fn set_encapsulated(&mut self, child: Option<Frame>) {
        let child = child.map(Box::new);
        match self {
            Frame::Traffic(t) => {
                if let Some(child) = child {
                    t.frame = child;
                }
            }
            Frame::Ethernet(f) => f.payload = child,
            Frame::Ipv4(f) => f.payload = child,
            Frame::Tcp(f) => f.payload = child,
            Frame::Udp(f) => f.payload = child,
            Frame::Raw(_) => {}
        }
    }

    /// Iterate over this frame and every frame it encapsulates
    pub fn iter(&self) -> FrameIter<'_> {
        FrameIter { next: Some(self) }
    }

    /// First Ethernet frame in the chain
    pub fn find_ethernet(&self) -> Option<&EthernetFrame> {
        self.iter().find_map(|f| match f {
            Frame::Ethernet(e) => Some(e),
            _ => None,
        })
    }

    /// First IPv4 frame in the chain
    pub fn find_ipv4(&self) -> Option<&Ipv4Frame> {
        self.iter().find_map(|f| match f {
            Frame::Ipv4(ip) => Some(ip),
            _ => None,
        })
    }

    /// First TCP frame in the chain
    pub fn find_tcp(&self) -> Option<&TcpFrame> {
        self.iter().find_map(|f| match f {
            Frame::Tcp(tcp) => Some(tcp),
            _ => None,
        })
    }

    /// Mutable access to the first TCP frame in the chain
    pub fn find_tcp_mut(&mut self) -> Option<&mut TcpFrame> {
        match self {
            Frame::Tcp(tcp) => Some(tcp),
            other => other.encapsulated_mut()?.find_tcp_mut(),
        }
    }

    /// Source and destination endpoints of an IPv4/TCP chain
    pub fn tcp_endpoints(&self) -> Option<(Ipv4Addr, u16, Ipv4Addr, u16)> {
        let ip = self.find_ipv4()?;
        let tcp = self.find_tcp()?;
        Some((ip.source, tcp.src_port, ip.destination, tcp.dst_port))
    }

    /// Strip the capture wrapper, if present
    pub fn into_inner(self) -> Frame {
        match self {
            Frame::Traffic(t) => t.frame.into_inner(),
            other => other,
        }
    }

    /// Parse a link-layer frame
    pub fn parse_ethernet(data: &[u8]) -> crate::Result<Frame> {
        EthernetFrame::parse(data).map(Frame::Ethernet)
    }

    /// Parse a network-layer frame
    pub fn parse_ipv4(data: &[u8]) -> crate::Result<Frame> {
        Ipv4Frame::parse(data).map(Frame::Ipv4)
    }
}

/// Iterator over an encapsulation chain, outermost first
pub struct FrameIter<'a> {
    next: Option<&'a Frame>,
}

impl<'a> Iterator for FrameIter<'a> {
    type Item = &'a Frame;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.encapsulated();
        Some(current)
    }
}

macro_rules! impl_from_frame {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        $(
            impl From<$ty> for Frame {
                fn from(frame: $ty) -> Self {
                    Frame::$variant(frame)
                }
            }
        )*
    };
}

impl_from_frame!(
    Traffic(TrafficDescriptionFrame),
    Ethernet(EthernetFrame),
    Ipv4(Ipv4Frame),
    Tcp(TcpFrame),
    Udp(UdpFrame),
    Raw(RawFrame),
);

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chain() -> Frame {
        let mut tcp = TcpFrame::new(40000, 80);
        tcp.flags = TcpFlags::ACK | TcpFlags::PSH;
        tcp.set_payload(Bytes::from_static(b"GET /"));
        let ip = Ipv4Frame::new(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            tcp.into(),
        );
        let eth = EthernetFrame::new(
            MacAddress([2, 0, 0, 0, 0, 1]),
            MacAddress([2, 0, 0, 0, 0, 2]),
            ip.into(),
        );
        Frame::Traffic(TrafficDescriptionFrame::new(None, eth.into()))
    }

    #[test]
    fn test_chain_navigation() {
        let frame = sample_chain();
        let kinds: Vec<_> = frame.iter().map(Frame::frame_type).collect();
        assert_eq!(
            kinds,
            [
                FrameType::TrafficDescription,
                FrameType::Ethernet,
                FrameType::Ipv4,
                FrameType::Tcp,
                FrameType::Raw,
            ]
        );
        assert!(frame.find_ethernet().is_some());
        assert_eq!(
            frame.tcp_endpoints(),
            Some((Ipv4Addr::new(10, 0, 0, 1), 40000, Ipv4Addr::new(10, 0, 0, 2), 80))
        );
    }

    #[test]
    fn test_traffic_wrapper_is_invisible() {
        let frame = sample_chain();
        let inner = frame.clone().into_inner();
        assert_eq!(frame.len(), 14 + 20 + 20 + 5);
        assert_eq!(frame.to_bytes(), inner.to_bytes());
    }

    #[test]
    fn test_mutation_reflected_in_length() {
        let mut frame = sample_chain();
        let before = frame.len();
        frame
            .find_tcp_mut()
            .unwrap()
            .set_payload(Bytes::from_static(b"GET /index.html"));
        assert_eq!(frame.len(), before + 10);

        let bytes = frame.to_bytes();
        let reparsed = Frame::parse_ethernet(&bytes).unwrap();
        assert_eq!(reparsed.find_tcp().unwrap().payload_bytes().as_ref(), b"GET /index.html");
    }

    #[test]
    fn test_clone_is_deep() {
        let original = sample_chain();
        let mut copy = original.clone();
        copy.find_tcp_mut().unwrap().set_payload(Bytes::new());
        assert_eq!(original.find_tcp().unwrap().payload_len(), 5);
        assert_eq!(copy.find_tcp().unwrap().payload_len(), 0);
    }

    #[test]
    fn test_set_encapsulated() {
        let mut frame: Frame = TcpFrame::new(1, 2).into();
        frame.set_encapsulated(Some(RawFrame::new(b"xy").into()));
        assert_eq!(frame.len(), 22);
        frame.set_encapsulated(None);
        assert_eq!(frame.len(), 20);
    }
}
