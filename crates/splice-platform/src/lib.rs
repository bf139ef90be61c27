//! # Splice Platform
//!
//! Attachment points for the interception pipeline.
//!
//! A real deployment feeds captured frames into a
//! [`Pipeline`](splice_core::Pipeline) and reinjects what comes out. This
//! crate defines that boundary ([`Interface`], [`CapturedFrame`]) and ships
//! [`MemoryNetwork`], a virtual segment used by the CLI demo and the
//! end-to-end tests.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod memory;
pub mod traits;

pub use error::{PlatformError, Result};
pub use memory::{MemoryInterface, MemoryNetwork, NetworkStats};
pub use traits::{register_local_addresses, CapturedFrame, Interface, LinkType};
