//! TCP flow interception
//!
//! [`TcpStreamModifier`] is a [`TrafficHandler`] that terminates selected
//! TCP flows in user space. A pure SYN of an intercepted flow creates a
//! [`TcpStreamModifierStack`]: Alice listens as the server and takes the
//! SYN, Bob opens a fresh connection to the real server, and the
//! [`StreamInterceptor`] chains stream modifiers between their streams.
//! Every later frame of the flow is consumed by one of the two stacks, and
//! their synthetic frames continue down the pipeline.
//!
//! Socket state changes and modifier events travel over a channel to a
//! dispatcher thread, which decides teardown and runs the
//! `StackCreated`/`StackDestroyed` observers. A timer thread drives
//! retransmission and timeouts of all live sockets.

mod interceptor;
mod stack;

pub use interceptor::{ConfiguredInterceptor, Operator};
pub use stack::{StackId, TcpStreamModifierStack};

use crate::error::Result;
use crate::frame::{Frame, TcpFlags};
use crate::modifier::{ModifierEvent, NetworkStreamModifier, Side};
use crate::pipeline::{HandlerAction, NextHandler, Stats, TrafficHandler};
use crate::stream::{NetworkStream, SocketStream};
use crate::tcp::{SocketConfig, StateChange, TcpIpStack, TcpState};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use dashmap::DashSet;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Host policy of a [`TcpStreamModifier`]
pub trait StreamInterceptor: Send + Sync + 'static {
    /// Whether frames between these endpoints are intercepted
    ///
    /// Asked for both directions of a flow, so a policy keyed on the server
    /// port must check either port.
    fn should_intercept(&self, src: Ipv4Addr, dst: Ipv4Addr, src_port: u16, dst_port: u16) -> bool;

    /// Build the modifiers relaying between the client-facing stream
    /// (`alice`) and the server-facing stream (`bob`)
    ///
    /// Several modifiers are chained through [`pipe`](crate::stream::pipe)s,
    /// the first reading `alice` and the last writing `bob`. The
    /// orchestrator starts them.
    fn create_and_link_stream_operators(
        &self,
        alice: Arc<dyn NetworkStream>,
        bob: Arc<dyn NetworkStream>,
    ) -> Result<Vec<NetworkStreamModifier>>;
}

/// Tunables of a [`TcpStreamModifier`]
#[derive(Debug, Clone)]
pub struct InterceptOptions {
    /// Configuration of every synthetic socket
    pub socket: SocketConfig,
    /// Never intercept flows from or to a registered local address
    pub auto_exclude_local: bool,
    /// Period of the socket timer
    pub tick_interval: Duration,
}

impl Default for InterceptOptions {
    fn default() -> Self {
        Self {
            socket: SocketConfig::default(),
            auto_exclude_local: true,
            tick_interval: Duration::from_millis(50),
        }
    }
}

/// Callback for stack lifecycle notifications
pub type StackObserver = Arc<dyn Fn(&Arc<TcpStreamModifierStack>) + Send + Sync>;

enum Event {
    Created(Arc<TcpStreamModifierStack>),
    Socket {
        id: StackId,
        side: Side,
        change: StateChange,
    },
    Modifier {
        id: StackId,
        index: usize,
        event: ModifierEvent,
    },
    Shutdown,
}

struct Shared<I> {
    interceptor: I,
    options: InterceptOptions,
    stacks: Mutex<HashMap<StackId, Arc<TcpStreamModifierStack>>>,
    next_id: AtomicU64,
    local_addresses: DashSet<Ipv4Addr>,
    accepting: AtomicBool,
    shutting_down: AtomicBool,
    next: RwLock<Option<NextHandler>>,
    stats: RwLock<Option<Arc<Stats>>>,
    events: Sender<Event>,
    created: RwLock<Vec<StackObserver>>,
    destroyed: RwLock<Vec<StackObserver>>,
}

struct Workers {
    dispatcher: JoinHandle<()>,
    timer: JoinHandle<()>,
    stop_timer: Sender<()>,
}

/// Orchestrator terminating intercepted TCP flows in mirrored synthetic stacks
pub struct TcpStreamModifier<I: StreamInterceptor> {
    shared: Arc<Shared<I>>,
    receiver: Mutex<Option<Receiver<Event>>>,
    workers: Mutex<Option<Workers>>,
}

fn is_pure_syn(frame: &Frame) -> bool {
    frame.find_tcp().is_some_and(|tcp| {
        tcp.flags.contains(TcpFlags::SYN)
            && !tcp.flags.intersects(TcpFlags::ACK | TcpFlags::RST | TcpFlags::FIN)
    })
}

impl<I: StreamInterceptor> Shared<I> {
    fn forward(&self, frame: Frame) {
        let next = self.next.read().clone();
        match next {
            Some(next) => {
                if let Err(error) = next.notify(frame) {
                    warn!(%error, "Forwarding synthetic frame failed");
                }
            }
            None => trace!("No next handler, synthetic frame discarded"),
        }
    }

    fn notify(observers: &RwLock<Vec<StackObserver>>, stack: &Arc<TcpStreamModifierStack>) {
        let observers = observers.read().clone();
        for observer in observers {
            observer(stack);
        }
    }

    fn lookup(&self, id: StackId) -> Option<Arc<TcpStreamModifierStack>> {
        let stack = self.stacks.lock().get(&id).cloned();
        // Ids are never reused: a missing id was either torn down already
        // (late event) or never handed out, which is a lifecycle bug
        assert!(
            stack.is_some() || id < self.next_id.load(Ordering::SeqCst),
            "event for stack {id}, which was never created"
        );
        stack
    }

    /// Build, wire and start a stack for the flow opened by `syn`
    fn create_stack(
        self: &Arc<Self>,
        syn: &Frame,
        client: SocketAddrV4,
        server: SocketAddrV4,
    ) -> Result<Arc<TcpStreamModifierStack>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let link = syn.find_ethernet().map(|eth| (eth.source, eth.destination));

        // Alice impersonates the server towards the client, Bob the client towards the server
        let alice = Arc::new(TcpIpStack::with_link(
            server,
            client,
            link.map(|(client_mac, server_mac)| (server_mac, client_mac)),
            self.options.socket.clone(),
        ));
        let bob = Arc::new(TcpIpStack::with_link(
            client,
            server,
            link,
            self.options.socket.clone(),
        ));

        for (side, stack) in [(Side::Alice, &alice), (Side::Bob, &bob)] {
            let weak: Weak<Self> = Arc::downgrade(self);
            stack.on_frame_encapsulated(move |frame| {
                if let Some(shared) = weak.upgrade() {
                    shared.forward(frame);
                }
            });
            let events = self.events.clone();
            stack.on_state_change(move |change| {
                let _ = events.send(Event::Socket { id, side, change });
            });
        }

        let alice_stream: Arc<dyn NetworkStream> = Arc::new(SocketStream::new(alice.clone()));
        let bob_stream: Arc<dyn NetworkStream> = Arc::new(SocketStream::new(bob.clone()));
        let modifiers = self
            .interceptor
            .create_and_link_stream_operators(alice_stream, bob_stream)?;

        for (index, modifier) in modifiers.iter().enumerate() {
            let events = self.events.clone();
            modifier.subscribe(move |event| {
                let _ = events.send(Event::Modifier {
                    id,
                    index,
                    event: event.clone(),
                });
            });
        }
        for modifier in &modifiers {
            if let Err(error) = modifier.start() {
                for started in &modifiers {
                    started.stop();
                }
                return Err(error);
            }
        }
        alice.listen()?;

        Ok(Arc::new(TcpStreamModifierStack::new(id, alice, bob, modifiers)))
    }

    fn on_socket_change(&self, id: StackId, side: Side, change: StateChange) {
        let Some(stack) = self.lookup(id) else {
            return;
        };
        trace!(stack = id, %side, old = %change.old, new = %change.new, "Socket state changed");

        if change.new == TcpState::Closed && change.reason.is_some_and(|r| r.is_abnormal()) {
            let other = match side {
                Side::Alice => stack.bob(),
                Side::Bob => stack.alice(),
            };
            if !other.state().is_closed() {
                debug!(
                    stack = id,
                    %side,
                    reason = ?change.reason,
                    "Peer side closed abnormally, aborting"
                );
                other.abort();
            }
        }
        if change.new.is_closed() && stack.sockets_closed() {
            stack.stop_modifiers();
        }
        self.teardown_if_closed(&stack);
    }

    fn on_modifier_event(&self, id: StackId, index: usize, event: &ModifierEvent) {
        let Some(stack) = self.lookup(id) else {
            return;
        };
        match event {
            ModifierEvent::LoopError { side, error, .. } => {
                warn!(stack = id, modifier = index, %side, %error, "Modifier loop failed");
            }
            ModifierEvent::LoopClosed(side) => {
                trace!(stack = id, modifier = index, %side, "Modifier loop closed");
                stack.loop_closed(index);
                self.teardown_if_closed(&stack);
            }
        }
    }

    fn teardown_if_closed(&self, stack: &Arc<TcpStreamModifierStack>) {
        if !stack.is_closed() {
            return;
        }
        // Whoever removes the stack owns its teardown
        let removed = self.stacks.lock().remove(&stack.id());
        if let Some(stack) = removed {
            self.finish(&stack);
        }
    }

    fn finish(&self, stack: &Arc<TcpStreamModifierStack>) {
        stack.teardown();
        if let Some(stats) = self.stats.read().as_ref() {
            stats.stack_destroyed();
        }
        info!(stack = stack.id(), "Stack destroyed");
        Self::notify(&self.destroyed, stack);
    }
}

fn dispatch<I: StreamInterceptor>(shared: Arc<Shared<I>>, events: Receiver<Event>) {
    for event in events.iter() {
        match event {
            Event::Shutdown => break,
            Event::Created(stack) => Shared::<I>::notify(&shared.created, &stack),
            Event::Socket { id, side, change } => shared.on_socket_change(id, side, change),
            Event::Modifier { id, index, event } => shared.on_modifier_event(id, index, &event),
        }
    }
    debug!("Dispatcher stopped");
}

fn run_timer<I: StreamInterceptor>(
    shared: Weak<Shared<I>>,
    stop: Receiver<()>,
    interval: Duration,
) {
    loop {
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let now = Instant::now();
        let stacks: Vec<_> = shared.stacks.lock().values().cloned().collect();
        for stack in stacks {
            stack.alice().tick(now);
            stack.bob().tick(now);
        }
    }
}

impl<I: StreamInterceptor> TcpStreamModifier<I> {
    /// Orchestrator with default options
    pub fn new(interceptor: I) -> Self {
        Self::with_options(interceptor, InterceptOptions::default())
    }

    /// Orchestrator with explicit options
    pub fn with_options(interceptor: I, options: InterceptOptions) -> Self {
        let (events, receiver) = unbounded();
        Self {
            shared: Arc::new(Shared {
                interceptor,
                options,
                stacks: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                local_addresses: DashSet::new(),
                accepting: AtomicBool::new(true),
                shutting_down: AtomicBool::new(false),
                next: RwLock::new(None),
                stats: RwLock::new(None),
                events,
                created: RwLock::new(Vec::new()),
                destroyed: RwLock::new(Vec::new()),
            }),
            receiver: Mutex::new(Some(receiver)),
            workers: Mutex::new(None),
        }
    }

    /// The host policy
    pub fn interceptor(&self) -> &I {
        &self.shared.interceptor
    }

    /// Register an address of this host
    pub fn add_local_address(&self, address: Ipv4Addr) {
        self.shared.local_addresses.insert(address);
    }

    /// Registered local addresses
    pub fn local_addresses(&self) -> Vec<Ipv4Addr> {
        self.shared.local_addresses.iter().map(|a| *a).collect()
    }

    /// Observe stack creation; runs on the dispatcher thread
    pub fn on_stack_created(
        &self,
        observer: impl Fn(&Arc<TcpStreamModifierStack>) + Send + Sync + 'static,
    ) {
        self.shared.created.write().push(Arc::new(observer));
    }

    /// Observe stack destruction; runs on the thread performing the teardown
    pub fn on_stack_destroyed(
        &self,
        observer: impl Fn(&Arc<TcpStreamModifierStack>) + Send + Sync + 'static,
    ) {
        self.shared.destroyed.write().push(Arc::new(observer));
    }

    /// Number of live stacks
    pub fn live_stacks(&self) -> usize {
        self.shared.stacks.lock().len()
    }

    /// Snapshot of the live stacks
    pub fn stacks(&self) -> Vec<Arc<TcpStreamModifierStack>> {
        self.shared.stacks.lock().values().cloned().collect()
    }

    /// Whether the dispatcher and timer threads are running
    pub fn is_running(&self) -> bool {
        self.workers.lock().is_some()
    }

    fn spawn_workers(&self) -> Result<()> {
        let mut workers = self.workers.lock();
        if workers.is_some() {
            return Ok(());
        }
        let Some(receiver) = self.receiver.lock().take() else {
            // Already shut down once
            return Ok(());
        };

        let shared = self.shared.clone();
        let dispatcher = std::thread::Builder::new()
            .name("splice-dispatch".into())
            .spawn(move || dispatch(shared, receiver))?;

        let (stop_timer, stop) = unbounded();
        let weak = Arc::downgrade(&self.shared);
        let interval = self.shared.options.tick_interval;
        let timer = std::thread::Builder::new()
            .name("splice-timer".into())
            .spawn(move || run_timer(weak, stop, interval))?;

        *workers = Some(Workers {
            dispatcher,
            timer,
            stop_timer,
        });
        Ok(())
    }
}

impl<I: StreamInterceptor> TrafficHandler for TcpStreamModifier<I> {
    fn name(&self) -> &str {
        "tcp-stream-modifier"
    }

    fn attach(&self, next: NextHandler) {
        *self.shared.stats.write() = next.stats();
        *self.shared.next.write() = Some(next);
    }

    fn handle(&self, frame: Frame) -> Result<HandlerAction> {
        let shared = &self.shared;
        if shared.shutting_down.load(Ordering::SeqCst) {
            return Ok(HandlerAction::Pass(frame));
        }
        let Some((src, src_port, dst, dst_port)) = frame.tcp_endpoints() else {
            return Ok(HandlerAction::Pass(frame));
        };
        if shared.options.auto_exclude_local
            && (shared.local_addresses.contains(&src) || shared.local_addresses.contains(&dst))
        {
            return Ok(HandlerAction::Pass(frame));
        }
        if !shared.interceptor.should_intercept(src, dst, src_port, dst_port) {
            return Ok(HandlerAction::Pass(frame));
        }

        let (stack, created) = {
            let mut stacks = shared.stacks.lock();
            let existing = stacks
                .values()
                .find(|s| s.alice().push_up(&frame, false) || s.bob().push_up(&frame, false))
                .cloned();
            match existing {
                Some(stack) => (stack, false),
                None if is_pure_syn(&frame) && shared.accepting.load(Ordering::SeqCst) => {
                    let client = SocketAddrV4::new(src, src_port);
                    let server = SocketAddrV4::new(dst, dst_port);
                    let stack = shared.create_stack(&frame, client, server)?;
                    stacks.insert(stack.id(), stack.clone());
                    (stack, true)
                }
                None => return Ok(HandlerAction::Pass(frame)),
            }
        };

        // Delivery happens outside the stacks lock: it runs listeners
        let _ = stack.alice().push_up(&frame, true) || stack.bob().push_up(&frame, true);

        if created {
            info!(
                stack = stack.id(),
                client = %stack.alice().remote(),
                server = %stack.bob().remote(),
                "Stack created"
            );
            if let Some(stats) = shared.stats.read().as_ref() {
                stats.stack_created();
            }
            if let Err(error) = stack.bob().connect_async() {
                warn!(stack = stack.id(), %error, "Connect to server failed");
                stack.abort();
            }
            let _ = shared.events.send(Event::Created(stack));
        }
        Ok(HandlerAction::Consumed)
    }

    fn start(&self) -> Result<()> {
        self.shared.options.socket.validate()?;
        self.shared.accepting.store(true, Ordering::SeqCst);
        self.spawn_workers()
    }

    fn stop(&self) {
        self.shared.accepting.store(false, Ordering::SeqCst);
    }

    fn cleanup(&self) {
        let shared = &self.shared;
        shared.shutting_down.store(true, Ordering::SeqCst);
        shared.accepting.store(false, Ordering::SeqCst);

        let stacks: Vec<_> = shared.stacks.lock().drain().map(|(_, s)| s).collect();
        if !stacks.is_empty() {
            info!(count = stacks.len(), "Tearing down live stacks");
        }
        for stack in &stacks {
            shared.finish(stack);
        }

        if let Some(workers) = self.workers.lock().take() {
            let _ = shared.events.send(Event::Shutdown);
            let _ = workers.stop_timer.send(());
            for (name, handle) in [("dispatcher", workers.dispatcher), ("timer", workers.timer)] {
                if handle.join().is_err() {
                    warn!(thread = name, "Worker thread panicked");
                }
            }
        }
        // A never-started orchestrator keeps no receiver around
        self.receiver.lock().take();
    }
}

impl<I: StreamInterceptor> Drop for TcpStreamModifier<I> {
    fn drop(&mut self) {
        if self.workers.get_mut().is_some() || !self.shared.stacks.lock().is_empty() {
            self.cleanup();
        }
    }
}

impl<I: StreamInterceptor> std::fmt::Debug for TcpStreamModifier<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpStreamModifier")
            .field("live_stacks", &self.live_stacks())
            .field("running", &self.is_running())
            .finish()
    }
}
