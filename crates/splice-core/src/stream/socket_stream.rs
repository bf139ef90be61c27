//! Stream over a synthetic TCP stack

use super::NetworkStream;
use crate::error::{Error, Result};
use crate::tcp::TcpIpStack;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// [`NetworkStream`] reading and writing a [`TcpIpStack`]'s payload
///
/// `shutdown_write` sends FIN; `close` resets the connection, which also
/// wakes a reader blocked in `read`.
pub struct SocketStream {
    stack: Arc<TcpIpStack>,
    closed: AtomicBool,
}

impl SocketStream {
    /// Wrap a stack
    pub fn new(stack: Arc<TcpIpStack>) -> Self {
        Self {
            stack,
            closed: AtomicBool::new(false),
        }
    }

    /// The underlying stack
    pub fn stack(&self) -> &Arc<TcpIpStack> {
        &self.stack
    }
}

impl NetworkStream for SocketStream {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::StreamClosed);
        }
        self.stack.receive(buf)
    }

    fn write_all(&self, data: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::StreamClosed);
        }
        self.stack.send(data).map(|_| ())
    }

    fn flush(&self) -> Result<()> {
        // Segments leave as soon as they are written
        Ok(())
    }

    fn shutdown_write(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::StreamClosed);
        }
        self.stack.close_async();
        Ok(())
    }

    fn close(&self) {
        // A socket lingering in TIME-WAIT has nothing left to reset
        if !self.closed.swap(true, Ordering::SeqCst) && !self.stack.state().is_closed() {
            self.stack.abort();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for SocketStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketStream")
            .field("stack", &self.stack)
            .field("closed", &self.is_closed())
            .finish()
    }
}
