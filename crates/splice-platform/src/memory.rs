//! In-memory virtual network
//!
//! [`MemoryNetwork`] is a single broadcast-free segment: every attached
//! [`MemoryInterface`] owns one IPv4 address, and frames are switched by
//! destination address on a worker thread. Frames leaving a host can be
//! diverted through a tap (usually a [`Pipeline`](splice_core::Pipeline));
//! whatever the tap lets through comes back through the network's
//! [`FrameSink`] implementation and is delivered without being tapped again.
//!
//! Every hop serializes and re-parses the frame, so handlers see exactly
//! what a capture driver would hand them.

use crate::error::{PlatformError, Result};
use crate::traits::{CapturedFrame, Interface};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use splice_core::frame::{InterfaceRef, MacAddress};
use splice_core::pipeline::FrameSink;
use splice_core::Frame;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, trace, warn};

/// Receives frames addressed to a host
pub type ReceiveHandler = Arc<dyn Fn(Frame) + Send + Sync>;

/// Sees every frame a host transmits
pub type Tap = Arc<dyn Fn(Frame) -> splice_core::Result<()> + Send + Sync>;

enum Transit {
    Outbound(CapturedFrame),
    Inbound(CapturedFrame),
    Shutdown,
}

/// Network counters
#[derive(Debug, Default)]
struct Counters {
    transmitted: AtomicU64,
    tapped: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time copy of the network counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    /// Frames sent by attached hosts
    pub transmitted: u64,
    /// Frames handed to the tap
    pub tapped: u64,
    /// Frames handed to a host
    pub delivered: u64,
    /// Frames with no reachable destination or unparsable bytes
    pub dropped: u64,
}

struct Inner {
    hosts: RwLock<HashMap<Ipv4Addr, Arc<MemoryInterface>>>,
    tap: RwLock<Option<Tap>>,
    counters: Counters,
}

impl Inner {
    fn handle(&self, transit: CapturedFrame, outbound: bool) {
        let frame = match transit.into_frame() {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%error, "Dropping unparsable frame");
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        if outbound {
            let tap = self.tap.read().clone();
            if let Some(tap) = tap {
                self.counters.tapped.fetch_add(1, Ordering::Relaxed);
                if let Err(error) = tap(frame) {
                    warn!(%error, "Tap failed to process frame");
                }
                return;
            }
        }
        self.deliver(frame);
    }

    fn deliver(&self, frame: Frame) {
        let Some(destination) = frame.find_ipv4().map(|ip| ip.destination) else {
            debug!("Dropping frame without an IPv4 header");
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let host = self.hosts.read().get(&destination).cloned();
        let handler = host.and_then(|host| host.handler.read().clone());
        match handler {
            Some(handler) => {
                trace!(%destination, len = frame.len(), "Delivering frame");
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                handler(frame);
            }
            None => {
                debug!(%destination, "No host for destination, frame dropped");
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// A host attached to a [`MemoryNetwork`]
pub struct MemoryInterface {
    name: String,
    index: u32,
    address: Ipv4Addr,
    mac: MacAddress,
    queue: Sender<Transit>,
    closed: Arc<AtomicBool>,
    handler: RwLock<Option<ReceiveHandler>>,
}

impl MemoryInterface {
    /// Install the callback receiving frames addressed to this host
    ///
    /// The callback runs on the network worker; frames it sends are queued.
    pub fn on_receive(&self, handler: impl Fn(Frame) + Send + Sync + 'static) {
        *self.handler.write() = Some(Arc::new(handler));
    }
}

impl Interface for MemoryInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn index(&self) -> u32 {
        self.index
    }

    fn address(&self) -> Ipv4Addr {
        self.address
    }

    fn mac(&self) -> MacAddress {
        self.mac
    }

    fn send(&self, frame: Frame) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PlatformError::Shutdown);
        }
        let captured = CapturedFrame::capture(self.interface_ref(), &frame);
        self.queue
            .send(Transit::Outbound(captured))
            .map_err(|_| PlatformError::Shutdown)
    }
}

impl std::fmt::Debug for MemoryInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryInterface")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("address", &self.address)
            .field("mac", &self.mac)
            .finish_non_exhaustive()
    }
}

/// In-memory segment switching frames between attached hosts
///
/// A tap holding a pipeline that sinks into this network forms a reference
/// cycle; [`shutdown`](Self::shutdown) breaks it.
pub struct MemoryNetwork {
    inner: Arc<Inner>,
    queue: Sender<Transit>,
    closed: Arc<AtomicBool>,
    next_index: AtomicU32,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryNetwork {
    /// Create the network and start its worker
    pub fn new() -> Result<Self> {
        let inner = Arc::new(Inner {
            hosts: RwLock::new(HashMap::new()),
            tap: RwLock::new(None),
            counters: Counters::default(),
        });
        let (queue, receiver) = unbounded();
        let worker = thread::Builder::new()
            .name("memory-network".to_string())
            .spawn({
                let inner = inner.clone();
                move || run_worker(&inner, &receiver)
            })?;

        Ok(Self {
            inner,
            queue,
            closed: Arc::new(AtomicBool::new(false)),
            next_index: AtomicU32::new(1),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Attach a host owning `address`
    pub fn attach(
        &self,
        name: impl Into<String>,
        address: Ipv4Addr,
        mac: MacAddress,
    ) -> Result<Arc<MemoryInterface>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PlatformError::Shutdown);
        }
        let mut hosts = self.inner.hosts.write();
        if hosts.contains_key(&address) {
            return Err(PlatformError::AddressInUse(address.to_string()));
        }
        let interface = Arc::new(MemoryInterface {
            name: name.into(),
            index: self.next_index.fetch_add(1, Ordering::Relaxed),
            address,
            mac,
            queue: self.queue.clone(),
            closed: self.closed.clone(),
            handler: RwLock::new(None),
        });
        info!(name = %interface.name, %address, %mac, "Interface attached");
        hosts.insert(address, interface.clone());
        Ok(interface)
    }

    /// Detach the host owning `address`
    pub fn detach(&self, address: Ipv4Addr) -> Result<Arc<MemoryInterface>> {
        let interface = self
            .inner
            .hosts
            .write()
            .remove(&address)
            .ok_or_else(|| PlatformError::InterfaceNotFound(address.to_string()))?;
        *interface.handler.write() = None;
        Ok(interface)
    }

    /// Host owning `address`
    pub fn interface(&self, address: Ipv4Addr) -> Option<Arc<MemoryInterface>> {
        self.inner.hosts.read().get(&address).cloned()
    }

    /// Addresses of all attached hosts
    pub fn addresses(&self) -> Vec<Ipv4Addr> {
        self.inner.hosts.read().keys().copied().collect()
    }

    /// Divert host traffic through `tap`
    pub fn set_tap(&self, tap: impl Fn(Frame) -> splice_core::Result<()> + Send + Sync + 'static) {
        *self.inner.tap.write() = Some(Arc::new(tap));
    }

    /// Deliver host traffic directly again
    pub fn clear_tap(&self) {
        *self.inner.tap.write() = None;
    }

    /// Current counters
    pub fn stats(&self) -> NetworkStats {
        let counters = &self.inner.counters;
        NetworkStats {
            transmitted: counters.transmitted.load(Ordering::Relaxed),
            tapped: counters.tapped.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Whether [`shutdown`](Self::shutdown) has run
    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop the worker and release the tap and every host callback
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.clear_tap();
        let _ = self.queue.send(Transit::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            if worker.thread().id() == thread::current().id() {
                warn!("Network shut down from its own worker, not joining");
            } else if worker.join().is_err() {
                warn!("Network worker panicked");
            }
        }
        for host in self.inner.hosts.read().values() {
            *host.handler.write() = None;
        }
        info!(stats = ?self.stats(), "Memory network shut down");
    }
}

impl FrameSink for MemoryNetwork {
    fn send(&self, frame: Frame) -> splice_core::Result<()> {
        if self.is_shut_down() {
            return Err(PlatformError::Shutdown.into());
        }
        let source = InterfaceRef {
            name: "sink".into(),
            index: 0,
        };
        self.queue
            .send(Transit::Inbound(CapturedFrame::capture(source, &frame)))
            .map_err(|_| PlatformError::Shutdown.into())
    }
}

impl Drop for MemoryNetwork {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("hosts", &self.inner.hosts.read().len())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn run_worker(inner: &Inner, receiver: &Receiver<Transit>) {
    for transit in receiver.iter() {
        match transit {
            Transit::Shutdown => break,
            Transit::Outbound(captured) => {
                inner.counters.transmitted.fetch_add(1, Ordering::Relaxed);
                inner.handle(captured, true);
            }
            Transit::Inbound(captured) => inner.handle(captured, false),
        }
    }
    debug!("Memory network worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use splice_core::frame::{EthernetFrame, FrameType, Ipv4Frame, RawFrame, UdpFrame};
    use std::time::Duration;

    const A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    fn mac(last: u8) -> MacAddress {
        MacAddress([0x02, 0, 0, 0, 0, last])
    }

    fn datagram(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Frame {
        let udp = UdpFrame {
            src_port: 5000,
            dst_port: 6000,
            payload: Some(Box::new(RawFrame::new(payload).into())),
        };
        let ip = Ipv4Frame::new(src, dst, udp.into());
        EthernetFrame::new(mac(1), mac(2), ip.into()).into()
    }

    fn collector(interface: &MemoryInterface) -> Receiver<Frame> {
        let (tx, rx) = bounded(16);
        interface.on_receive(move |frame| {
            let _ = tx.send(frame);
        });
        rx
    }

    #[test]
    fn test_direct_delivery() {
        let network = MemoryNetwork::new().unwrap();
        let a = network.attach("a", A, mac(1)).unwrap();
        let b = network.attach("b", B, mac(2)).unwrap();
        let received = collector(&b);

        a.send(datagram(A, B, b"ping")).unwrap();
        let frame = received.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(frame.frame_type(), FrameType::TrafficDescription);
        assert_eq!(frame.to_bytes(), datagram(A, B, b"ping").to_bytes());

        let stats = network.stats();
        assert_eq!(stats.transmitted, 1);
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.tapped, 0);
    }

    #[test]
    fn test_tap_sees_outbound_and_sink_delivers() {
        let network = Arc::new(MemoryNetwork::new().unwrap());
        let a = network.attach("a", A, mac(1)).unwrap();
        let b = network.attach("b", B, mac(2)).unwrap();
        let received = collector(&b);

        let (seen_tx, seen_rx) = bounded(4);
        let sink = Arc::downgrade(&network);
        network.set_tap(move |frame| {
            if let Frame::Traffic(description) = &frame {
                let _ = seen_tx.send(description.source.clone());
            }
            match sink.upgrade() {
                Some(network) => network.send(frame),
                None => Ok(()),
            }
        });

        a.send(datagram(A, B, b"via tap")).unwrap();
        let source = seen_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(source.map(|s| s.name.to_string()), Some("a".to_string()));
        received.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(seen_rx.try_recv().is_err(), "sink traffic must not be tapped again");
        assert_eq!(network.stats().tapped, 1);
        network.shutdown();
    }

    #[test]
    fn test_unknown_destination_dropped() {
        let network = MemoryNetwork::new().unwrap();
        let a = network.attach("a", A, mac(1)).unwrap();
        a.send(datagram(A, Ipv4Addr::new(10, 0, 0, 99), b"lost")).unwrap();
        network.shutdown();
        assert_eq!(network.stats().dropped, 1);
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let network = MemoryNetwork::new().unwrap();
        network.attach("a", A, mac(1)).unwrap();
        assert!(matches!(
            network.attach("a2", A, mac(3)),
            Err(PlatformError::AddressInUse(_))
        ));
        network.detach(A).unwrap();
        assert!(network.attach("a2", A, mac(3)).is_ok());
    }

    #[test]
    fn test_send_after_shutdown_fails() {
        let network = MemoryNetwork::new().unwrap();
        let a = network.attach("a", A, mac(1)).unwrap();
        network.shutdown();
        assert!(matches!(a.send(datagram(A, B, b"late")), Err(PlatformError::Shutdown)));
        assert!(FrameSink::send(&network, datagram(A, B, b"late")).is_err());
    }
}
