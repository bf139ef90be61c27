//! Ethernet II frames

use super::types::{ether_type, MacAddress};
use super::{Encodable, Frame, Ipv4Frame, RawFrame};
use crate::error::{Error, Result};
use bytes::{BufMut, BytesMut};

/// Ethernet header length
pub const ETHERNET_HEADER_LEN: usize = 14;

/// Ethernet II frame
#[derive(Debug, Clone, PartialEq)]
pub struct EthernetFrame {
    /// Destination hardware address
    pub destination: MacAddress,
    /// Source hardware address
    pub source: MacAddress,
    /// EtherType of the payload
    pub ether_type: u16,
    /// Encapsulated frame
    pub payload: Option<Box<Frame>>,
}

impl EthernetFrame {
    /// Create a frame carrying `payload`
    pub fn new(source: MacAddress, destination: MacAddress, payload: Frame) -> Self {
        let ether_type = match payload {
            Frame::Ipv4(_) => ether_type::IPV4,
            _ => 0,
        };
        Self {
            destination,
            source,
            ether_type,
            payload: Some(Box::new(payload)),
        }
    }

    /// Parse an Ethernet frame and everything it carries
    pub fn parse(data: &[u8]) -> Result<Self> {
        Error::ensure_len(data, ETHERNET_HEADER_LEN)?;

        let mut destination = [0u8; 6];
        let mut source = [0u8; 6];
        destination.copy_from_slice(&data[0..6]);
        source.copy_from_slice(&data[6..12]);
        let ether_type = u16::from_be_bytes([data[12], data[13]]);

        let body = &data[ETHERNET_HEADER_LEN..];
        let payload = if body.is_empty() {
            None
        } else if ether_type == ether_type::IPV4 {
            Some(Box::new(Frame::Ipv4(Ipv4Frame::parse(body)?)))
        } else {
            Some(Box::new(Frame::Raw(RawFrame::new(body))))
        };

        Ok(Self {
            destination: MacAddress(destination),
            source: MacAddress(source),
            ether_type,
            payload,
        })
    }
}

impl Encodable for EthernetFrame {
    fn encoded_len(&self) -> usize {
        ETHERNET_HEADER_LEN + self.payload.as_ref().map_or(0, |p| p.len())
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.destination.0);
        buf.put_slice(&self.source.0);
        buf.put_u16(self.ether_type);
        if let Some(payload) = &self.payload {
            payload.encode_into(buf);
        }
    }
}
