//! A TCP socket bound to a four-tuple and framed in IPv4/Ethernet

use super::{SocketConfig, SocketObserver, SocketStats, StateChange, TcpSocket, TcpState};
use crate::error::Result;
use crate::frame::{EthernetFrame, Frame, Ipv4Frame, MacAddress, TcpFrame};
use parking_lot::RwLock;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Callback for synthetic outbound frames
pub type FrameListener = Arc<dyn Fn(Frame) + Send + Sync>;

/// Callback for socket state changes
pub type StateListener = Arc<dyn Fn(StateChange) + Send + Sync>;

/// Wraps socket output in network framing and fans it out to listeners
struct StackOutput {
    local: SocketAddrV4,
    remote: SocketAddrV4,
    link: Option<(MacAddress, MacAddress)>,
    ip_id: AtomicU16,
    frame_listeners: RwLock<Vec<FrameListener>>,
    state_listeners: RwLock<Vec<StateListener>>,
}

impl SocketObserver for StackOutput {
    fn on_segment(&self, segment: TcpFrame) {
        let mut ip = Ipv4Frame::new(*self.local.ip(), *self.remote.ip(), segment.into());
        ip.identification = self.ip_id.fetch_add(1, Ordering::Relaxed);
        let frame = match self.link {
            Some((local_mac, remote_mac)) => {
                EthernetFrame::new(local_mac, remote_mac, ip.into()).into()
            }
            None => Frame::Ipv4(ip),
        };

        // Snapshot so listeners run without the registry lock
        let listeners = self.frame_listeners.read().clone();
        if let Some((last, rest)) = listeners.split_last() {
            for listener in rest {
                listener(frame.clone());
            }
            last(frame);
        }
    }

    fn on_state_change(&self, change: StateChange) {
        let listeners = self.state_listeners.read().clone();
        for listener in listeners {
            listener(change);
        }
    }
}

/// One side of an intercepted connection
///
/// The stack owns a [`TcpSocket`] whose local and remote endpoints are
/// fixed at construction. Frames are offered with [`push_up`](Self::push_up);
/// segments the socket produces are wrapped in IPv4 (and Ethernet when link
/// addresses are known) and delivered to every `FrameEncapsulated` listener.
pub struct TcpIpStack {
    local: SocketAddrV4,
    remote: SocketAddrV4,
    socket: TcpSocket,
    output: Arc<StackOutput>,
}

impl TcpIpStack {
    /// Create a stack with IPv4 framing only
    pub fn new(local: SocketAddrV4, remote: SocketAddrV4, config: SocketConfig) -> Self {
        Self::with_link(local, remote, None, config)
    }

    /// Create a stack that also writes Ethernet headers (`(local_mac, remote_mac)`)
    pub fn with_link(
        local: SocketAddrV4,
        remote: SocketAddrV4,
        link: Option<(MacAddress, MacAddress)>,
        config: SocketConfig,
    ) -> Self {
        let output = Arc::new(StackOutput {
            local,
            remote,
            link,
            ip_id: AtomicU16::new(rand::random()),
            frame_listeners: RwLock::new(Vec::new()),
            state_listeners: RwLock::new(Vec::new()),
        });
        let socket = TcpSocket::new(local, remote, config, output.clone());
        Self {
            local,
            remote,
            socket,
            output,
        }
    }

    /// Address this stack answers for
    pub fn local(&self) -> SocketAddrV4 {
        self.local
    }

    /// Address this stack talks to
    pub fn remote(&self) -> SocketAddrV4 {
        self.remote
    }

    /// The underlying socket
    pub fn socket(&self) -> &TcpSocket {
        &self.socket
    }

    /// Current socket state
    pub fn state(&self) -> TcpState {
        self.socket.state()
    }

    /// Socket counters
    pub fn stats(&self) -> SocketStats {
        self.socket.stats()
    }

    /// Register a `FrameEncapsulated` listener
    pub fn on_frame_encapsulated(&self, listener: impl Fn(Frame) + Send + Sync + 'static) {
        self.output.frame_listeners.write().push(Arc::new(listener));
    }

    /// Register a `StateChange` listener
    pub fn on_state_change(&self, listener: impl Fn(StateChange) + Send + Sync + 'static) {
        self.output.state_listeners.write().push(Arc::new(listener));
    }

    /// Drop all listeners
    pub fn clear_listeners(&self) {
        self.output.frame_listeners.write().clear();
        self.output.state_listeners.write().clear();
    }

    /// Whether `frame` is a segment from our remote to our local endpoint
    pub fn matches(&self, frame: &Frame) -> bool {
        let Some((src, src_port, dst, dst_port)) = frame.tcp_endpoints() else {
            return false;
        };
        src == *self.remote.ip()
            && src_port == self.remote.port()
            && dst == *self.local.ip()
            && dst_port == self.local.port()
    }

    /// Offer an inbound frame
    ///
    /// Returns whether the frame belongs to this stack. With `deliver`
    /// false nothing else happens; otherwise a matching segment is fed to
    /// the socket.
    pub fn push_up(&self, frame: &Frame, deliver: bool) -> bool {
        if !self.matches(frame) {
            return false;
        }
        if deliver {
            if let Some(tcp) = frame.find_tcp() {
                self.socket.segment_arrives(tcp);
            }
        }
        true
    }

    /// Passive open
    pub fn listen(&self) -> Result<()> {
        self.socket.listen()
    }

    /// Active open without waiting (ConnectAsync)
    pub fn connect_async(&self) -> Result<()> {
        self.socket.connect()
    }

    /// Active open, blocking until established or failed
    pub fn connect(&self, timeout: Duration) -> Result<()> {
        self.socket.connect()?;
        self.socket.wait_established(timeout)
    }

    /// Send application bytes
    pub fn send(&self, data: &[u8]) -> Result<usize> {
        self.socket.send(data)
    }

    /// Blocking read of reassembled application bytes
    pub fn receive(&self, buf: &mut [u8]) -> Result<usize> {
        self.socket.receive(buf)
    }

    /// Orderly close without waiting
    pub fn close_async(&self) {
        self.socket.close_async();
    }

    /// Orderly close, blocking until Closed or TimeWait
    pub fn close(&self) -> Result<()> {
        self.socket.close()
    }

    /// Reset the connection
    pub fn abort(&self) {
        self.socket.abort();
    }

    /// Drive socket timers
    pub fn tick(&self, now: Instant) {
        self.socket.tick(now);
    }
}

impl std::fmt::Debug for TcpIpStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpIpStack")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("state", &self.state())
            .finish()
    }
}
