//! Two-direction relay-with-transformation
//!
//! A [`NetworkStreamModifier`] owns two loops. The Alice loop reads the
//! Alice stream and writes the Bob stream; the Bob loop does the reverse.
//! Each loop pulls one message at a time through a [`StreamTransform`],
//! which supplies protocol framing and the transformation itself.
//!
//! A loop that meets the end of its input half-closes its output and
//! reports [`ModifierEvent::LoopClosed`]. A loop that fails closes both
//! streams, reports [`ModifierEvent::LoopError`] and then `LoopClosed`.

mod http;
mod replace;

pub use http::{
    HttpMessage, HttpOptions, HttpRewriter, HttpStreamOperator, HttpTransform, ParsedMessage,
    StartLine,
};
pub use replace::{Direction, ReplaceTransform, ReplacementRule, StreamReplacementOperator};

use crate::error::{Error, Result};
use crate::stream::{CancellationToken, MessageReader, NetworkStream};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, warn};

/// Message framing failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The stream ended before a complete message; a clean end for the loop
    #[error("Stream ended before a complete message")]
    StreamEnded,

    /// The bytes are not a valid message
    #[error("Malformed {protocol} message: {message}")]
    Malformed {
        /// Protocol being parsed
        protocol: &'static str,
        /// What was wrong
        message: String,
    },
}

impl ParseError {
    /// Create a malformed-message error
    pub fn malformed(protocol: &'static str, message: impl Into<String>) -> Self {
        Self::Malformed {
            protocol,
            message: message.into(),
        }
    }
}

/// Which loop of a modifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Reads the Alice stream (client to server)
    Alice,
    /// Reads the Bob stream (server to client)
    Bob,
}

impl Side {
    fn index(self) -> usize {
        match self {
            Side::Alice => 0,
            Side::Bob => 1,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Alice => f.write_str("alice"),
            Side::Bob => f.write_str("bob"),
        }
    }
}

/// Terminal signal of a loop
#[derive(Debug, Clone)]
pub enum ModifierEvent {
    /// The loop ended; fires exactly once per loop
    LoopClosed(Side),
    /// The loop failed; followed by `LoopClosed` for the same side
    LoopError {
        /// Failing loop
        side: Side,
        /// What went wrong
        error: Arc<Error>,
        /// When it happened
        at: SystemTime,
    },
}

/// Listener for modifier events, invoked on the loop thread
pub type ModifierListener = Arc<dyn Fn(&ModifierEvent) + Send + Sync>;

/// Protocol framing plus transformation for one direction
pub trait StreamTransform: Send + 'static {
    /// One parsed unit of the protocol
    type Message: Send;

    /// Read exactly one message
    ///
    /// A clean end of input is [`ParseError::StreamEnded`].
    fn read_message(&mut self, reader: &mut MessageReader) -> Result<Self::Message>;

    /// Produce the bytes to forward; `None` drops the message
    fn transform(&mut self, message: Self::Message) -> Result<Option<Bytes>>;

    /// Bytes still held back when the input ends
    fn finish(&mut self) -> Result<Option<Bytes>> {
        Ok(None)
    }
}

/// Byte and message counters for one loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// Bytes read from the input stream
    pub bytes_in: u64,
    /// Bytes written to the output stream
    pub bytes_out: u64,
    /// Messages read
    pub messages: u64,
    /// Messages the transform dropped
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    messages: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> LoopStats {
        LoopStats {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

struct Shared {
    name: String,
    alice: Arc<dyn NetworkStream>,
    bob: Arc<dyn NetworkStream>,
    token: CancellationToken,
    listeners: RwLock<Vec<ModifierListener>>,
    counters: [Counters; 2],
}

impl Shared {
    /// (input, output) of a loop
    fn streams(&self, side: Side) -> (Arc<dyn NetworkStream>, Arc<dyn NetworkStream>) {
        match side {
            Side::Alice => (self.alice.clone(), self.bob.clone()),
            Side::Bob => (self.bob.clone(), self.alice.clone()),
        }
    }

    fn emit(&self, event: &ModifierEvent) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener(event);
        }
    }
}

type LoopBody = Box<dyn FnOnce(Arc<Shared>) + Send>;

/// Two directional loops relaying between two streams
pub struct NetworkStreamModifier {
    shared: Arc<Shared>,
    bodies: Mutex<Option<(LoopBody, LoopBody)>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl NetworkStreamModifier {
    /// Bind a modifier to its streams; nothing runs until [`start`](Self::start)
    pub fn new<A, B>(
        name: impl Into<String>,
        alice: Arc<dyn NetworkStream>,
        bob: Arc<dyn NetworkStream>,
        alice_transform: A,
        bob_transform: B,
    ) -> Self
    where
        A: StreamTransform,
        B: StreamTransform,
    {
        let alice_body: LoopBody =
            Box::new(move |shared| run_loop(&shared, Side::Alice, alice_transform));
        let bob_body: LoopBody =
            Box::new(move |shared| run_loop(&shared, Side::Bob, bob_transform));
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                alice,
                bob,
                token: CancellationToken::new(),
                listeners: RwLock::new(Vec::new()),
                counters: Default::default(),
            }),
            bodies: Mutex::new(Some((alice_body, bob_body))),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Modifier name used in logs and thread names
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Stream read by the Alice loop
    pub fn alice_stream(&self) -> &Arc<dyn NetworkStream> {
        &self.shared.alice
    }

    /// Stream read by the Bob loop
    pub fn bob_stream(&self) -> &Arc<dyn NetworkStream> {
        &self.shared.bob
    }

    /// Register an event listener
    pub fn subscribe(&self, listener: impl Fn(&ModifierEvent) + Send + Sync + 'static) {
        self.shared.listeners.write().push(Arc::new(listener));
    }

    /// Remove all event listeners
    pub fn clear_listeners(&self) {
        self.shared.listeners.write().clear();
    }

    /// Spawn both loops; later calls do nothing
    pub fn start(&self) -> Result<()> {
        let Some((alice_body, bob_body)) = self.bodies.lock().take() else {
            return Ok(());
        };
        let mut handles = self.handles.lock();
        for (side, body) in [(Side::Alice, alice_body), (Side::Bob, bob_body)] {
            let shared = self.shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", self.shared.name, side))
                .spawn(move || body(shared))?;
            handles.push(handle);
        }
        debug!(modifier = %self.shared.name, "Modifier started");
        Ok(())
    }

    /// Cancel and close both streams without waiting for the loops
    pub fn stop_async(&self) {
        self.shared.token.cancel();
        self.shared.alice.close();
        self.shared.bob.close();
    }

    /// Cancel, close both streams and join both loops
    ///
    /// Must not be called from one of this modifier's own loops.
    pub fn stop(&self) {
        self.stop_async();
        self.join();
    }

    /// Wait for both loops to finish
    pub fn join(&self) {
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!(modifier = %self.shared.name, "Modifier loop panicked");
            }
        }
    }

    /// Whether any loop thread is still running
    pub fn is_running(&self) -> bool {
        self.handles.lock().iter().any(|h| !h.is_finished())
    }

    /// Counters of one loop
    pub fn stats(&self, side: Side) -> LoopStats {
        self.shared.counters[side.index()].snapshot()
    }
}

impl fmt::Debug for NetworkStreamModifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkStreamModifier")
            .field("name", &self.shared.name)
            .field("alice", &self.stats(Side::Alice))
            .field("bob", &self.stats(Side::Bob))
            .finish()
    }
}

fn relay<T: StreamTransform>(
    shared: &Shared,
    side: Side,
    transform: &mut T,
    reader: &mut MessageReader,
    output: &dyn NetworkStream,
) -> Result<()> {
    let counters = &shared.counters[side.index()];
    loop {
        shared.token.check()?;
        let message = match transform.read_message(reader) {
            Ok(message) => message,
            Err(Error::Parse(ParseError::StreamEnded)) => break,
            Err(e) => return Err(e),
        };
        counters.messages.fetch_add(1, Ordering::Relaxed);
        counters.bytes_in.store(reader.total_read(), Ordering::Relaxed);

        shared.token.check()?;
        match transform.transform(message)? {
            Some(bytes) => {
                output.write_all(&bytes)?;
                output.flush()?;
                counters.bytes_out.fetch_add(bytes.len() as u64, Ordering::Relaxed);
            }
            None => {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    counters.bytes_in.store(reader.total_read(), Ordering::Relaxed);
    if let Some(rest) = transform.finish()? {
        output.write_all(&rest)?;
        output.flush()?;
        counters.bytes_out.fetch_add(rest.len() as u64, Ordering::Relaxed);
    }
    output.shutdown_write()
}

fn run_loop<T: StreamTransform>(shared: &Shared, side: Side, mut transform: T) {
    let (input, output) = shared.streams(side);
    let mut reader = MessageReader::new(input.clone());

    match relay(shared, side, &mut transform, &mut reader, output.as_ref()) {
        Ok(()) => {
            debug!(modifier = %shared.name, %side, "Loop reached end of stream");
        }
        Err(_) if shared.token.is_cancelled() => {
            debug!(modifier = %shared.name, %side, "Loop stopped");
        }
        Err(error) => {
            warn!(modifier = %shared.name, %side, %error, "Loop failed");
            input.close();
            output.close();
            shared.emit(&ModifierEvent::LoopError {
                side,
                error: Arc::new(error),
                at: SystemTime::now(),
            });
        }
    }
    shared.emit(&ModifierEvent::LoopClosed(side));
}

/// Forwards every chunk unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

impl StreamTransform for PassThrough {
    type Message = Bytes;

    fn read_message(&mut self, reader: &mut MessageReader) -> Result<Bytes> {
        reader
            .take_available()?
            .ok_or_else(|| ParseError::StreamEnded.into())
    }

    fn transform(&mut self, message: Bytes) -> Result<Option<Bytes>> {
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::pipe;
    use crossbeam_channel::unbounded;
    use std::time::Duration;

    struct Upper;

    impl StreamTransform for Upper {
        type Message = Bytes;

        fn read_message(&mut self, reader: &mut MessageReader) -> Result<Bytes> {
            reader.read_line(1024)
        }

        fn transform(&mut self, line: Bytes) -> Result<Option<Bytes>> {
            if line.as_ref() == b"drop\n" {
                return Ok(None);
            }
            if line.as_ref() == b"fail\n" {
                return Err(ParseError::malformed("test", "fail requested").into());
            }
            Ok(Some(Bytes::from(line.to_ascii_uppercase())))
        }
    }

    /// Modifier between the inner ends of two pipes; returns the outer ends
    fn harness() -> (NetworkStreamModifier, Arc<dyn NetworkStream>, Arc<dyn NetworkStream>) {
        let (client, alice) = pipe();
        let (bob, server) = pipe();
        let modifier =
            NetworkStreamModifier::new("upper", Arc::new(alice), Arc::new(bob), Upper, PassThrough);
        (modifier, Arc::new(client), Arc::new(server))
    }

    fn read_all(stream: &dyn NetworkStream) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => return out,
                Ok(n) => out.extend_from_slice(&buf[..n]),
            }
        }
    }

    #[test]
    fn test_transform_drop_and_half_close() {
        let (modifier, client, server) = harness();
        let (tx, rx) = unbounded();
        modifier.subscribe(move |e| {
            let _ = tx.send(e.clone());
        });
        modifier.start().unwrap();

        client.write_all(b"hello\ndrop\nworld\n").unwrap();
        client.shutdown_write().unwrap();
        assert_eq!(read_all(server.as_ref()), b"HELLO\nWORLD\n");

        server.write_all(b"reply").unwrap();
        server.shutdown_write().unwrap();
        assert_eq!(read_all(client.as_ref()), b"reply");

        modifier.join();
        let closed: Vec<_> = rx
            .try_iter()
            .filter_map(|e| match e {
                ModifierEvent::LoopClosed(side) => Some(side),
                ModifierEvent::LoopError { .. } => None,
            })
            .collect();
        assert_eq!(closed.len(), 2);
        assert!(closed.contains(&Side::Alice) && closed.contains(&Side::Bob));

        let stats = modifier.stats(Side::Alice);
        assert_eq!(stats.messages, 3);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.bytes_out, 12);
    }

    #[test]
    fn test_loop_error_reported_and_streams_closed() {
        let (modifier, client, _server) = harness();
        let (tx, rx) = unbounded();
        modifier.subscribe(move |e| {
            let _ = tx.send(e.clone());
        });
        modifier.start().unwrap();

        client.write_all(b"fail\n").unwrap();
        // Both loops fail: Alice on the transform, Bob on its closed input
        let events: Vec<_> = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        let alice: Vec<_> = events
            .iter()
            .filter(|e| match e {
                ModifierEvent::LoopClosed(side) | ModifierEvent::LoopError { side, .. } => {
                    *side == Side::Alice
                }
            })
            .collect();
        assert!(matches!(alice[0], ModifierEvent::LoopError { .. }));
        assert!(matches!(alice[1], ModifierEvent::LoopClosed(_)));
        assert!(client.write_all(b"more").is_err());

        modifier.stop();
        assert!(!modifier.is_running());
    }

    #[test]
    fn test_stop_unblocks_idle_loops() {
        let (modifier, _client, _server) = harness();
        modifier.start().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        modifier.stop();
        assert!(!modifier.is_running());
    }
}
