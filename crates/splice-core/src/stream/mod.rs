//! Blocking byte streams for stream modifiers
//!
//! A [`NetworkStream`] gives a modifier loop a conventional read/write
//! surface. [`SocketStream`] sits on a synthetic TCP stack; [`PipeStream`]
//! pairs chain several modifiers between two sockets. All methods take
//! `&self` so one thread can block in `read` while another writes or
//! closes the same stream.

mod pipe;
mod reader;
mod socket_stream;

pub use pipe::{pipe, PipeStream};
pub use reader::MessageReader;
pub use socket_stream::SocketStream;

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Duplex blocking byte stream
pub trait NetworkStream: Send + Sync {
    /// Read some bytes, blocking until at least one is available
    ///
    /// Returns `Ok(0)` at end of stream. A stream closed with
    /// [`close`](Self::close) fails pending and future reads.
    fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write all of `data`
    fn write_all(&self, data: &[u8]) -> Result<()>;

    /// Push buffered output towards the peer
    fn flush(&self) -> Result<()>;

    /// Signal end of stream to the peer; reading stays possible
    fn shutdown_write(&self) -> Result<()>;

    /// Tear the stream down in both directions, unblocking readers
    fn close(&self);

    /// Whether [`close`](Self::close) has been called
    fn is_closed(&self) -> bool;
}

/// Cooperative cancellation flag shared by a modifier and its loops
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Create an uncancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fail with [`Error::StreamClosed`] once cancelled
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::StreamClosed)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_token_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(Error::StreamClosed)));
    }
}
