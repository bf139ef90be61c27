//! Buffered reading for message parsers

use super::NetworkStream;
use crate::error::Result;
use crate::modifier::ParseError;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;

const READ_CHUNK: usize = 8192;

/// Buffered reader over a [`NetworkStream`]
///
/// Parsers pull exactly one message's worth of bytes; anything read past
/// the message stays buffered for the next call.
pub struct MessageReader {
    stream: Arc<dyn NetworkStream>,
    buf: BytesMut,
    eof: bool,
    total_read: u64,
}

impl MessageReader {
    /// Wrap a stream
    pub fn new(stream: Arc<dyn NetworkStream>) -> Self {
        Self {
            stream,
            buf: BytesMut::new(),
            eof: false,
            total_read: 0,
        }
    }

    /// Bytes read from the stream so far
    pub fn total_read(&self) -> u64 {
        self.total_read
    }

    /// Whether the stream reported end of stream
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Currently buffered bytes
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Read once from the stream into the buffer
    ///
    /// Returns the number of bytes added; zero means end of stream.
    pub fn fill(&mut self) -> Result<usize> {
        if self.eof {
            return Ok(0);
        }
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.stream.read(&mut chunk)?;
        if n == 0 {
            self.eof = true;
        } else {
            self.buf.extend_from_slice(&chunk[..n]);
            self.total_read += n as u64;
        }
        Ok(n)
    }

    /// Read one line including its `\n`
    ///
    /// Fails with [`ParseError::StreamEnded`] if the stream ends first and
    /// with [`ParseError::Malformed`] if the line exceeds `max_len`.
    pub fn read_line(&mut self, max_len: usize) -> Result<Bytes> {
        let mut searched = 0;
        loop {
            if let Some(pos) = self.buf[searched..].iter().position(|&b| b == b'\n') {
                return Ok(self.buf.split_to(searched + pos + 1).freeze());
            }
            searched = self.buf.len();
            if searched > max_len {
                let message = format!("line longer than {max_len} bytes");
                return Err(ParseError::malformed("line", message).into());
            }
            if self.fill()? == 0 {
                return Err(ParseError::StreamEnded.into());
            }
        }
    }

    /// Read exactly `n` bytes
    pub fn read_exact(&mut self, n: usize) -> Result<Bytes> {
        while self.buf.len() < n {
            if self.fill()? == 0 {
                return Err(ParseError::StreamEnded.into());
            }
        }
        Ok(self.buf.split_to(n).freeze())
    }

    /// Whatever is buffered, or the next read; `None` at end of stream
    pub fn take_available(&mut self) -> Result<Option<Bytes>> {
        if self.buf.is_empty() && self.fill()? == 0 {
            return Ok(None);
        }
        Ok(Some(self.buf.split().freeze()))
    }

    /// Everything until end of stream
    pub fn read_to_end(&mut self) -> Result<Bytes> {
        while self.fill()? > 0 {}
        Ok(self.buf.split().freeze())
    }
}
