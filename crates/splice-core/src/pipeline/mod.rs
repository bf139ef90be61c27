//! Traffic handler pipeline
//!
//! Frames enter with [`Pipeline::push_traffic`] and pass through an ordered
//! list of [`TrafficHandler`]s fixed at construction. Whatever survives the
//! last handler goes to the [`FrameSink`]. Handlers that produce frames on
//! their own threads inject them at the following stage through the
//! [`NextHandler`] they were attached to.

mod stats;

pub use stats::{Stats, StatsSnapshot};

use crate::error::Result;
use crate::frame::Frame;
use std::sync::{Arc, Weak};
use tracing::{debug, instrument, trace};

/// What a handler did with a frame
#[derive(Debug)]
pub enum HandlerAction {
    /// Continue with this frame
    Pass(Frame),
    /// Continue with these frames instead
    Replace(Vec<Frame>),
    /// The handler kept the frame
    Consumed,
}

/// One stage of a [`Pipeline`]
pub trait TrafficHandler: Send + Sync {
    /// Handler name for logs
    fn name(&self) -> &str;

    /// Receive the handle to the following stage; called once at build time
    fn attach(&self, next: NextHandler) {
        let _ = next;
    }

    /// Process one frame
    fn handle(&self, frame: Frame) -> Result<HandlerAction>;

    /// Begin processing
    fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Stop accepting new work
    fn stop(&self) {}

    /// Release everything the handler holds
    fn cleanup(&self) {}
}

/// Destination of frames leaving the pipeline
#[cfg_attr(test, mockall::automock)]
pub trait FrameSink: Send + Sync {
    /// Put a frame on the wire
    fn send(&self, frame: Frame) -> Result<()>;
}

struct Stages {
    handlers: Vec<Arc<dyn TrafficHandler>>,
    sink: Arc<dyn FrameSink>,
    stats: Arc<Stats>,
}

impl Stages {
    fn run_from(&self, start: usize, frame: Frame) -> Result<()> {
        let mut frames = vec![frame];
        for handler in self.handlers.iter().skip(start) {
            let mut next = Vec::with_capacity(frames.len());
            for frame in frames {
                match handler.handle(frame)? {
                    HandlerAction::Pass(frame) => next.push(frame),
                    HandlerAction::Replace(replacement) => next.extend(replacement),
                    HandlerAction::Consumed => {
                        trace!(handler = handler.name(), "Frame consumed");
                        self.stats.frame_consumed();
                    }
                }
            }
            frames = next;
            if frames.is_empty() {
                return Ok(());
            }
        }
        for frame in frames {
            self.stats.frame_out();
            self.sink.send(frame)?;
        }
        Ok(())
    }
}

/// Handle for injecting frames after a given stage (NotifyNext)
#[derive(Clone)]
pub struct NextHandler {
    stages: Weak<Stages>,
    index: usize,
}

impl NextHandler {
    /// Run `frame` through the stages after the owning handler
    ///
    /// Frames sent after the pipeline was dropped are discarded.
    pub fn notify(&self, frame: Frame) -> Result<()> {
        match self.stages.upgrade() {
            Some(stages) => stages.run_from(self.index, frame),
            None => {
                trace!("Pipeline gone, frame discarded");
                Ok(())
            }
        }
    }

    /// Counters of the owning pipeline
    pub fn stats(&self) -> Option<Arc<Stats>> {
        self.stages.upgrade().map(|s| s.stats.clone())
    }
}

impl std::fmt::Debug for NextHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NextHandler").field("index", &self.index).finish()
    }
}

/// Ordered chain of traffic handlers ending in a sink
pub struct Pipeline {
    stages: Arc<Stages>,
}

impl Pipeline {
    /// Build the pipeline and attach every handler to its successor
    pub fn new(handlers: Vec<Arc<dyn TrafficHandler>>, sink: Arc<dyn FrameSink>) -> Self {
        let stages = Arc::new(Stages {
            handlers,
            sink,
            stats: Arc::new(Stats::new()),
        });
        for (index, handler) in stages.handlers.iter().enumerate() {
            handler.attach(NextHandler {
                stages: Arc::downgrade(&stages),
                index: index + 1,
            });
        }
        Self { stages }
    }

    /// Number of handlers
    pub fn len(&self) -> usize {
        self.stages.handlers.len()
    }

    /// Whether there are no handlers
    pub fn is_empty(&self) -> bool {
        self.stages.handlers.is_empty()
    }

    /// Handler names in order
    pub fn handler_names(&self) -> Vec<&str> {
        self.stages.handlers.iter().map(|h| h.name()).collect()
    }

    /// Shared counters
    pub fn stats(&self) -> &Arc<Stats> {
        &self.stages.stats
    }

    /// Feed one frame from the capture side (PushTraffic)
    #[instrument(skip_all, fields(len = frame.len()))]
    pub fn push_traffic(&self, frame: Frame) -> Result<()> {
        self.stages.stats.frame_in();
        self.stages.run_from(0, frame)
    }

    /// Start every handler in order
    pub fn start(&self) -> Result<()> {
        for handler in &self.stages.handlers {
            handler.start()?;
            debug!(handler = handler.name(), "Handler started");
        }
        Ok(())
    }

    /// Stop every handler, last first
    pub fn stop(&self) {
        for handler in self.stages.handlers.iter().rev() {
            handler.stop();
        }
    }

    /// Clean up every handler, last first
    pub fn cleanup(&self) {
        for handler in self.stages.handlers.iter().rev() {
            handler.cleanup();
            debug!(handler = handler.name(), "Handler cleaned up");
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("handlers", &self.handler_names())
            .field("stats", &self.stages.stats.snapshot())
            .finish()
    }
}
