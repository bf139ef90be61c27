//! Platform-agnostic interface traits
//!
//! These traits define what an interception backend must provide: a named
//! attachment point that can put frames on the wire, and captured frames
//! carrying enough metadata to be fed into a [`Pipeline`](splice_core::Pipeline).

use crate::Result;
use bytes::Bytes;
use splice_core::frame::{InterfaceRef, TrafficDescriptionFrame};
use splice_core::{Frame, StreamInterceptor, TcpStreamModifier};
use std::net::Ipv4Addr;
use std::time::SystemTime;
use tracing::debug;

/// A network attachment point
pub trait Interface: Send + Sync {
    /// Interface name
    fn name(&self) -> &str;

    /// Interface index, unique within its network
    fn index(&self) -> u32;

    /// IPv4 address owned by the interface
    fn address(&self) -> Ipv4Addr;

    /// Link-layer address
    fn mac(&self) -> splice_core::frame::MacAddress;

    /// Transmit a frame
    fn send(&self, frame: Frame) -> Result<()>;

    /// Reference used to tag captured frames
    fn interface_ref(&self) -> InterfaceRef {
        InterfaceRef {
            name: self.name().into(),
            index: self.index(),
        }
    }
}

/// Register the address of every interface this host owns with `handler`
///
/// With `auto_exclude_local` set, flows the host itself originates or
/// terminates then pass through uninspected.
pub fn register_local_addresses<'a, I, T>(
    handler: &TcpStreamModifier<I>,
    interfaces: impl IntoIterator<Item = &'a T>,
) where
    I: StreamInterceptor,
    T: Interface + ?Sized + 'a,
{
    for interface in interfaces {
        debug!(name = interface.name(), address = %interface.address(), "Local address registered");
        handler.add_local_address(interface.address());
    }
}

/// Outermost header of captured bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// Ethernet II
    Ethernet,
    /// Bare IPv4, as on tunnels and loopback
    Ipv4,
}

/// A frame captured off an interface, still in wire form
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// Interface the frame was seen on
    pub interface: InterfaceRef,
    /// How `data` starts
    pub link: LinkType,
    /// Raw bytes
    pub data: Bytes,
    /// Capture timestamp
    pub captured_at: SystemTime,
}

impl CapturedFrame {
    /// Capture `frame` as it would appear on `interface`
    pub fn capture(interface: InterfaceRef, frame: &Frame) -> Self {
        let link = if frame.find_ethernet().is_some() {
            LinkType::Ethernet
        } else {
            LinkType::Ipv4
        };
        Self {
            interface,
            link,
            data: Bytes::from(frame.to_bytes()),
            captured_at: SystemTime::now(),
        }
    }

    /// Parse the bytes and wrap them in capture metadata
    pub fn into_frame(self) -> Result<Frame> {
        let inner = match self.link {
            LinkType::Ethernet => Frame::parse_ethernet(&self.data)?,
            LinkType::Ipv4 => Frame::parse_ipv4(&self.data)?,
        };
        let mut description = TrafficDescriptionFrame::new(Some(self.interface), inner);
        description.captured_at = self.captured_at;
        Ok(Frame::Traffic(description))
    }
}
