//! IPv4 frames

use super::checksum::{internet_checksum, transport_checksum_ipv4};
use super::types::IpProtocol;
use super::{Encodable, Frame, RawFrame, TcpFrame, UdpFrame};
use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;

/// Minimum IPv4 header length
pub const IPV4_HEADER_LEN: usize = 20;

/// Don't Fragment flag in the flags/fragment-offset word
const FLAG_DONT_FRAGMENT: u16 = 0x4000;

/// IPv4 packet
#[derive(Debug, Clone, PartialEq)]
pub struct Ipv4Frame {
    /// Type of service / DSCP+ECN
    pub tos: u8,
    /// Identification
    pub identification: u16,
    /// Flags and fragment offset word
    pub flags_fragment: u16,
    /// Time to live
    pub ttl: u8,
    /// Protocol, used when the payload is not a known transport frame
    pub protocol: IpProtocol,
    /// Source address
    pub source: Ipv4Addr,
    /// Destination address
    pub destination: Ipv4Addr,
    /// Header options (multiple of four bytes)
    pub options: Bytes,
    /// Encapsulated frame
    pub payload: Option<Box<Frame>>,
}

impl Ipv4Frame {
    /// Create a packet with default header fields
    pub fn new(source: Ipv4Addr, destination: Ipv4Addr, payload: Frame) -> Self {
        let protocol = match payload {
            Frame::Tcp(_) => IpProtocol::Tcp,
            Frame::Udp(_) => IpProtocol::Udp,
            _ => IpProtocol::Other(0),
        };
        Self {
            tos: 0,
            identification: 0,
            flags_fragment: FLAG_DONT_FRAGMENT,
            ttl: 64,
            protocol,
            source,
            destination,
            options: Bytes::new(),
            payload: Some(Box::new(payload)),
        }
    }

    /// Parse an IPv4 packet and its transport payload
    pub fn parse(data: &[u8]) -> Result<Self> {
        Error::ensure_len(data, IPV4_HEADER_LEN)?;

        let version = data[0] >> 4;
        if version != 4 {
            return Err(Error::frame_parse_at(
                format!("Not an IPv4 header (version {version})"),
                0,
            ));
        }

        let header_len = usize::from(data[0] & 0x0F) * 4;
        if header_len < IPV4_HEADER_LEN {
            return Err(Error::frame_parse_at(
                format!("Invalid IHL: {header_len} bytes"),
                0,
            ));
        }
        Error::ensure_len(data, header_len)?;

        // Trailing link-layer padding is not part of the packet
        let total_len = usize::from(u16::from_be_bytes([data[2], data[3]]));
        if total_len < header_len {
            return Err(Error::frame_parse_at(
                format!("Total length {total_len} shorter than header"),
                2,
            ));
        }
        let end = total_len.min(data.len());

        let protocol = IpProtocol::from_u8(data[9]);
        let body = &data[header_len..end];
        let fragment_offset = u16::from_be_bytes([data[6], data[7]]) & 0x1FFF;

        let payload = if body.is_empty() {
            None
        } else if fragment_offset != 0 {
            // Only the first fragment carries a transport header
            Some(Box::new(Frame::Raw(RawFrame::new(body))))
        } else {
            let inner = match protocol {
                IpProtocol::Tcp => Frame::Tcp(TcpFrame::parse(body)?),
                IpProtocol::Udp => Frame::Udp(UdpFrame::parse(body)?),
                _ => Frame::Raw(RawFrame::new(body)),
            };
            Some(Box::new(inner))
        };

        Ok(Self {
            tos: data[1],
            identification: u16::from_be_bytes([data[4], data[5]]),
            flags_fragment: u16::from_be_bytes([data[6], data[7]]),
            ttl: data[8],
            protocol,
            source: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            destination: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
            options: Bytes::copy_from_slice(&data[IPV4_HEADER_LEN..header_len]),
            payload,
        })
    }

    /// Header length including options
    pub fn header_len(&self) -> usize {
        IPV4_HEADER_LEN + (self.options.len() + 3) / 4 * 4
    }

    /// Protocol number written on the wire
    pub fn effective_protocol(&self) -> u8 {
        match self.payload.as_deref() {
            Some(Frame::Tcp(_)) => IpProtocol::Tcp.to_u8(),
            Some(Frame::Udp(_)) => IpProtocol::Udp.to_u8(),
            _ => self.protocol.to_u8(),
        }
    }

    /// Transport header checksum offset for the current payload
    fn checksum_offset(&self) -> Option<usize> {
        match self.payload.as_deref() {
            Some(Frame::Tcp(_)) => Some(16),
            Some(Frame::Udp(_)) => Some(6),
            _ => None,
        }
    }
}

impl Encodable for Ipv4Frame {
    fn encoded_len(&self) -> usize {
        self.header_len() + self.payload.as_ref().map_or(0, |p| p.len())
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        let header_len = self.header_len();

        let mut body = BytesMut::new();
        if let Some(payload) = &self.payload {
            payload.encode_into(&mut body);
        }
        if let Some(offset) = self.checksum_offset() {
            if body.len() >= offset + 2 {
                body[offset..offset + 2].copy_from_slice(&[0, 0]);
                let sum = transport_checksum_ipv4(
                    self.source,
                    self.destination,
                    self.effective_protocol(),
                    &body,
                );
                body[offset..offset + 2].copy_from_slice(&sum.to_be_bytes());
            }
        }

        let total_len = (header_len + body.len()) as u16;
        let mut header = BytesMut::with_capacity(header_len);
        header.put_u8(0x40 | (header_len / 4) as u8);
        header.put_u8(self.tos);
        header.put_u16(total_len);
        header.put_u16(self.identification);
        header.put_u16(self.flags_fragment);
        header.put_u8(self.ttl);
        header.put_u8(self.effective_protocol());
        header.put_u16(0);
        header.put_slice(&self.source.octets());
        header.put_slice(&self.destination.octets());
        header.put_slice(&self.options);
        header.resize(header_len, 0);

        let sum = internet_checksum(&header);
        header[10..12].copy_from_slice(&sum.to_be_bytes());

        buf.put_slice(&header);
        buf.put_slice(&body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::TcpFlags;

    fn create_test_tcp_packet() -> Vec<u8> {
        vec![
            // IPv4 header (20 bytes)
            0x45, 0x00, 0x00, 0x2a, // Version, IHL, TOS, Total Length (42)
            0x00, 0x01, 0x40, 0x00, // ID, Flags (DF), Fragment
            0x40, 0x06, 0x00, 0x00, // TTL, Protocol (TCP), Checksum
            0xC0, 0xA8, 0x01, 0x01, // Source IP (192.168.1.1)
            0xC0, 0xA8, 0x01, 0x02, // Dest IP (192.168.1.2)
            // TCP header (20 bytes)
            0x00, 0x50, 0x01, 0xBB, // Src Port (80), Dst Port (443)
            0x00, 0x00, 0x00, 0x01, // Sequence Number
            0x00, 0x00, 0x00, 0x01, // Ack Number
            0x50, 0x18, 0x00, 0x00, // Data Offset, Flags (ACK+PSH), Window
            0x00, 0x00, 0x00, 0x00, // Checksum, Urgent Pointer
            b'h', b'i',
            // Ethernet padding that must be ignored
            0x00, 0x00, 0x00,
        ]
    }

    #[test]
    fn test_parse_tcp_packet() {
        let packet = Ipv4Frame::parse(&create_test_tcp_packet()).unwrap();
        assert_eq!(packet.source, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(packet.destination, Ipv4Addr::new(192, 168, 1, 2));
        assert_eq!(packet.ttl, 64);

        let Some(Frame::Tcp(tcp)) = packet.payload.as_deref() else {
            panic!("expected a TCP payload");
        };
        assert_eq!(tcp.src_port, 80);
        assert_eq!(tcp.dst_port, 443);
        assert_eq!(tcp.flags, TcpFlags::ACK | TcpFlags::PSH);
        assert_eq!(tcp.payload_bytes().as_ref(), b"hi");
        assert_eq!(packet.encoded_len(), 42);
    }

    #[test]
    fn test_encode_fills_checksums() {
        let packet = Ipv4Frame::parse(&create_test_tcp_packet()).unwrap();
        let bytes = packet.to_bytes();

        assert_eq!(internet_checksum(&bytes[..20]), 0);
        let sum = transport_checksum_ipv4(packet.source, packet.destination, 6, &bytes[20..]);
        assert_eq!(sum, 0);
    }

    #[test]
    fn test_length_follows_payload_mutation() {
        let mut packet = Ipv4Frame::parse(&create_test_tcp_packet()).unwrap();
        if let Some(Frame::Tcp(tcp)) = packet.payload.as_deref_mut() {
            tcp.set_payload(Bytes::from_static(b"hello world"));
        }
        let bytes = packet.to_bytes();
        assert_eq!(bytes.len(), 20 + 20 + 11);
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), 51);
    }

    #[test]
    fn test_reject_ipv6() {
        let mut data = create_test_tcp_packet();
        data[0] = 0x60;
        assert!(matches!(Ipv4Frame::parse(&data), Err(Error::FrameParse { .. })));
    }
}
