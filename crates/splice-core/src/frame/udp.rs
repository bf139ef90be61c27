//! UDP datagrams

use super::{Encodable, Frame, RawFrame};
use crate::error::{Error, Result};
use bytes::{BufMut, BytesMut};

/// UDP header length
pub const UDP_HEADER_LEN: usize = 8;

/// UDP datagram
#[derive(Debug, Clone, PartialEq)]
pub struct UdpFrame {
    /// Source port
    pub src_port: u16,
    /// Destination port
    pub dst_port: u16,
    /// Encapsulated application data
    pub payload: Option<Box<Frame>>,
}

impl UdpFrame {
    /// Parse a UDP datagram
    pub fn parse(data: &[u8]) -> Result<Self> {
        Error::ensure_len(data, UDP_HEADER_LEN)?;

        let length = usize::from(u16::from_be_bytes([data[4], data[5]]));
        if length < UDP_HEADER_LEN {
            return Err(Error::frame_parse_at(format!("Invalid UDP length {length}"), 4));
        }
        let end = length.min(data.len());
        let body = &data[UDP_HEADER_LEN..end];

        Ok(Self {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            payload: (!body.is_empty()).then(|| Box::new(Frame::Raw(RawFrame::new(body)))),
        })
    }
}

impl Encodable for UdpFrame {
    fn encoded_len(&self) -> usize {
        UDP_HEADER_LEN + self.payload.as_ref().map_or(0, |p| p.len())
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u16(self.src_port);
        buf.put_u16(self.dst_port);
        buf.put_u16(self.encoded_len() as u16);
        buf.put_u16(0);
        if let Some(payload) = &self.payload {
            payload.encode_into(buf);
        }
    }
}
