//! One intercepted flow: two mirrored TCP stacks plus their modifiers

use crate::modifier::NetworkStreamModifier;
use crate::tcp::TcpIpStack;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

/// Identifier of a [`TcpStreamModifierStack`], unique per orchestrator
pub type StackId = u64;

/// Bundle of the Alice and Bob stacks of one flow and the modifiers chained between them
///
/// Alice answers the client as if it were the server; Bob connects to the
/// server as if it were the client. Every modifier starts with two open
/// loops. The bundle is closed once both sockets are closed and every loop
/// has reported its end.
pub struct TcpStreamModifierStack {
    id: StackId,
    alice: Arc<TcpIpStack>,
    bob: Arc<TcpIpStack>,
    modifiers: Vec<NetworkStreamModifier>,
    open_loops: Mutex<Vec<u8>>,
    created_at: SystemTime,
}

impl TcpStreamModifierStack {
    /// Bundle the two stacks with their modifiers
    pub fn new(
        id: StackId,
        alice: Arc<TcpIpStack>,
        bob: Arc<TcpIpStack>,
        modifiers: Vec<NetworkStreamModifier>,
    ) -> Self {
        let open_loops = Mutex::new(vec![2; modifiers.len()]);
        Self {
            id,
            alice,
            bob,
            modifiers,
            open_loops,
            created_at: SystemTime::now(),
        }
    }

    /// Stack identifier
    pub fn id(&self) -> StackId {
        self.id
    }

    /// Client-facing stack
    pub fn alice(&self) -> &Arc<TcpIpStack> {
        &self.alice
    }

    /// Server-facing stack
    pub fn bob(&self) -> &Arc<TcpIpStack> {
        &self.bob
    }

    /// Modifiers from the Alice end to the Bob end
    pub fn modifiers(&self) -> &[NetworkStreamModifier] {
        &self.modifiers
    }

    /// When the stack was created
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Record the end of one loop of modifier `index`
    ///
    /// # Panics
    ///
    /// Panics if the modifier already reported both loops closed; each
    /// modifier reports exactly two loop ends.
    pub fn loop_closed(&self, index: usize) {
        let mut open = self.open_loops.lock();
        let count = open
            .get_mut(index)
            .unwrap_or_else(|| panic!("stack {}: no modifier with index {index}", self.id));
        assert!(
            *count > 0,
            "stack {}: modifier {index} reported more loop ends than it has loops",
            self.id
        );
        *count -= 1;
    }

    /// Whether every loop of every modifier has ended
    pub fn loops_finished(&self) -> bool {
        self.open_loops.lock().iter().all(|&n| n == 0)
    }

    /// Whether both sockets are Closed or TimeWait
    pub fn sockets_closed(&self) -> bool {
        self.alice.state().is_closed() && self.bob.state().is_closed()
    }

    /// Sockets closed and all loops ended
    pub fn is_closed(&self) -> bool {
        self.sockets_closed() && self.loops_finished()
    }

    /// Reset both connections
    pub fn abort(&self) {
        self.alice.abort();
        self.bob.abort();
    }

    /// Ask every modifier to stop without waiting
    pub fn stop_modifiers(&self) {
        for modifier in &self.modifiers {
            modifier.stop_async();
        }
    }

    /// Stop everything and wait for all loop threads
    ///
    /// Sockets still open are reset. A socket in TIME-WAIT keeps its state
    /// but is no longer ticked or routed to, so a FIN the peer retransmits
    /// after teardown passes through the pipeline unanswered.
    /// Must not run on one of the modifiers' loop threads.
    pub fn teardown(&self) {
        self.stop_modifiers();
        for stack in [&self.alice, &self.bob] {
            if !stack.state().is_closed() {
                stack.abort();
            }
        }
        for modifier in &self.modifiers {
            modifier.join();
            modifier.clear_listeners();
        }
        self.alice.clear_listeners();
        self.bob.clear_listeners();
        debug!(stack = self.id, "Stack torn down");
    }
}

impl fmt::Debug for TcpStreamModifierStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpStreamModifierStack")
            .field("id", &self.id)
            .field("alice", &self.alice)
            .field("bob", &self.bob)
            .field("modifiers", &self.modifiers.len())
            .field("open_loops", &*self.open_loops.lock())
            .finish()
    }
}
