//! TCP segments

use super::types::TcpFlags;
use super::{Encodable, Frame, RawFrame};
use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Minimum TCP header length
pub const TCP_HEADER_LEN: usize = 20;

/// TCP segment
#[derive(Debug, Clone, PartialEq)]
pub struct TcpFrame {
    /// Source port
    pub src_port: u16,
    /// Destination port
    pub dst_port: u16,
    /// Sequence number
    pub seq: u32,
    /// Acknowledgment number
    pub ack: u32,
    /// Control flags
    pub flags: TcpFlags,
    /// Receive window
    pub window: u16,
    /// Checksum as parsed; recomputed by the IPv4 layer on encode
    pub checksum: u16,
    /// Urgent pointer
    pub urgent: u16,
    /// Raw option bytes
    pub options: Bytes,
    /// Encapsulated application data
    pub payload: Option<Box<Frame>>,
}

impl TcpFrame {
    /// Create an empty segment between two ports
    pub fn new(src_port: u16, dst_port: u16) -> Self {
        Self {
            src_port,
            dst_port,
            seq: 0,
            ack: 0,
            flags: TcpFlags::empty(),
            window: 0xFFFF,
            checksum: 0,
            urgent: 0,
            options: Bytes::new(),
            payload: None,
        }
    }

    /// Parse a TCP segment; the data portion becomes a raw frame
    pub fn parse(data: &[u8]) -> Result<Self> {
        Error::ensure_len(data, TCP_HEADER_LEN)?;

        let header_len = usize::from(data[12] >> 4) * 4;
        if header_len < TCP_HEADER_LEN {
            return Err(Error::frame_parse_at(
                format!("Invalid TCP data offset: {header_len} bytes"),
                12,
            ));
        }
        Error::ensure_len(data, header_len)?;

        let body = &data[header_len..];
        let payload = if body.is_empty() {
            None
        } else {
            Some(Box::new(Frame::Raw(RawFrame::new(body))))
        };

        Ok(Self {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            flags: TcpFlags::from_bits_truncate(data[13]),
            window: u16::from_be_bytes([data[14], data[15]]),
            checksum: u16::from_be_bytes([data[16], data[17]]),
            urgent: u16::from_be_bytes([data[18], data[19]]),
            options: Bytes::copy_from_slice(&data[TCP_HEADER_LEN..header_len]),
            payload,
        })
    }

    /// Header length including padded options
    pub fn header_len(&self) -> usize {
        TCP_HEADER_LEN + (self.options.len() + 3) / 4 * 4
    }

    /// Serialized application data carried by this segment
    pub fn payload_bytes(&self) -> Bytes {
        match self.payload.as_deref() {
            None => Bytes::new(),
            Some(Frame::Raw(raw)) => raw.data.clone(),
            Some(other) => Bytes::from(other.to_bytes()),
        }
    }

    /// Length of the application data
    pub fn payload_len(&self) -> usize {
        self.payload.as_ref().map_or(0, |p| p.len())
    }

    /// Replace the application data
    pub fn set_payload(&mut self, data: Bytes) {
        self.payload = if data.is_empty() {
            None
        } else {
            Some(Box::new(Frame::Raw(RawFrame { data })))
        };
    }

    /// Sequence space occupied: data plus one for each of SYN and FIN
    pub fn segment_len(&self) -> u32 {
        let mut len = self.payload_len() as u32;
        if self.flags.contains(TcpFlags::SYN) {
            len += 1;
        }
        if self.flags.contains(TcpFlags::FIN) {
            len += 1;
        }
        len
    }

    /// Maximum segment size option, if present
    pub fn mss_option(&self) -> Option<u16> {
        let opts = &self.options;
        let mut i = 0;
        while i < opts.len() {
            match opts[i] {
                0 => break,
                1 => i += 1,
                kind => {
                    let len = usize::from(*opts.get(i + 1)?);
                    if len < 2 || i + len > opts.len() {
                        break;
                    }
                    if kind == 2 && len == 4 {
                        return Some(u16::from_be_bytes([opts[i + 2], opts[i + 3]]));
                    }
                    i += len;
                }
            }
        }
        None
    }

    /// Set the options to a single MSS option
    pub fn with_mss_option(mut self, mss: u16) -> Self {
        let [hi, lo] = mss.to_be_bytes();
        self.options = Bytes::copy_from_slice(&[2, 4, hi, lo]);
        self
    }
}

impl Encodable for TcpFrame {
    fn encoded_len(&self) -> usize {
        self.header_len() + self.payload_len()
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        let header_len = self.header_len();
        buf.put_u16(self.src_port);
        buf.put_u16(self.dst_port);
        buf.put_u32(self.seq);
        buf.put_u32(self.ack);
        buf.put_u8(((header_len / 4) as u8) << 4);
        buf.put_u8(self.flags.bits());
        buf.put_u16(self.window);
        buf.put_u16(self.checksum);
        buf.put_u16(self.urgent);
        buf.put_slice(&self.options);
        buf.put_bytes(0, header_len - TCP_HEADER_LEN - self.options.len());
        if let Some(payload) = &self.payload {
            payload.encode_into(buf);
        }
    }
}
