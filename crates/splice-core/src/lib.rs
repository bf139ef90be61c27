//! # Splice Core
//!
//! User-space TCP interception and stream rewriting.
//!
//! ## Architecture
//!
//! This crate provides:
//! - **Frames** - nested Ethernet/IPv4/TCP/UDP model, parsed and re-encoded on demand
//! - **Synthetic TCP** - a TCP state machine producing and consuming frames
//! - **Streams** - blocking byte streams over synthetic sockets and in-memory pipes
//! - **Modifiers** - two-loop relays that rewrite HTTP messages or raw bytes
//! - **Interception** - a traffic handler that splits selected flows into two
//!   synthetic connections with modifiers in between
//! - **Configuration** - profile-based TOML configuration
//!
//! ## Example
//!
//! ```rust,no_run
//! use splice_core::{Config, ConfiguredInterceptor, Pipeline, TcpStreamModifier};
//! use splice_core::pipeline::{FrameSink, TrafficHandler};
//! use std::sync::Arc;
//!
//! # fn sink() -> Arc<dyn FrameSink> { unimplemented!() }
//! # fn main() -> splice_core::Result<()> {
//! let config = Config::load("splice.toml")?;
//! let interceptor = ConfiguredInterceptor::from_config(&config)?;
//! let handler: Arc<dyn TrafficHandler> =
//!     Arc::new(TcpStreamModifier::with_options(interceptor, config.intercept_options()));
//!
//! let pipeline = Pipeline::new(vec![handler], sink());
//! pipeline.start()?;
//! // pipeline.push_traffic(frame)? for every captured frame
//! pipeline.cleanup();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod error;
pub mod frame;
pub mod intercept;
pub mod modifier;
pub mod pipeline;
pub mod stream;
pub mod tcp;

// Re-exports for convenience
pub use config::{Config, Profile};
pub use error::{Error, Result};
pub use frame::{Encodable, Frame};
pub use intercept::{
    ConfiguredInterceptor, StreamInterceptor, TcpStreamModifier, TcpStreamModifierStack,
};
pub use modifier::{HttpStreamOperator, NetworkStreamModifier, StreamReplacementOperator};
pub use pipeline::{HandlerAction, Pipeline, Stats, TrafficHandler};
pub use stream::{NetworkStream, SocketStream};
pub use tcp::{TcpIpStack, TcpSocket, TcpState};
