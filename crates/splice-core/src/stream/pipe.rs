//! In-memory duplex pipes

use super::NetworkStream;
use crate::error::{Error, Result};
use bytes::{Buf, BytesMut};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

#[derive(Default)]
struct Channel {
    buf: BytesMut,
    eof: bool,
    broken: bool,
}

#[derive(Default)]
struct Half {
    state: Mutex<Channel>,
    ready: Condvar,
}

impl Half {
    fn update(&self, f: impl FnOnce(&mut Channel)) {
        f(&mut *self.state.lock());
        self.ready.notify_all();
    }
}

/// One end of a pipe created by [`pipe`]
pub struct PipeStream {
    incoming: Arc<Half>,
    outgoing: Arc<Half>,
}

/// Create two connected streams: bytes written to one are read from the other
pub fn pipe() -> (PipeStream, PipeStream) {
    let a_to_b = Arc::new(Half::default());
    let b_to_a = Arc::new(Half::default());
    (
        PipeStream {
            incoming: b_to_a.clone(),
            outgoing: a_to_b.clone(),
        },
        PipeStream {
            incoming: a_to_b,
            outgoing: b_to_a,
        },
    )
}

impl NetworkStream for PipeStream {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut channel = self.incoming.state.lock();
        loop {
            if channel.broken {
                return Err(Error::StreamClosed);
            }
            if !channel.buf.is_empty() {
                let n = buf.len().min(channel.buf.len());
                buf[..n].copy_from_slice(&channel.buf[..n]);
                channel.buf.advance(n);
                return Ok(n);
            }
            if channel.eof || buf.is_empty() {
                return Ok(0);
            }
            self.incoming.ready.wait(&mut channel);
        }
    }

    fn write_all(&self, data: &[u8]) -> Result<()> {
        let mut channel = self.outgoing.state.lock();
        if channel.broken || channel.eof {
            return Err(Error::StreamClosed);
        }
        channel.buf.extend_from_slice(data);
        drop(channel);
        self.outgoing.ready.notify_all();
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn shutdown_write(&self) -> Result<()> {
        self.outgoing.update(|c| c.eof = true);
        Ok(())
    }

    fn close(&self) {
        for half in [&self.incoming, &self.outgoing] {
            half.update(|c| {
                c.broken = true;
                c.buf.clear();
            });
        }
    }

    fn is_closed(&self) -> bool {
        self.incoming.state.lock().broken
    }
}
