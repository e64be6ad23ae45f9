//! L2CAP (Logical Link Control and Adaptation Protocol) implementation
//!
//! This module provides the L2CAP implementation, which is responsible for:
//! - Multiplexing protocol channels over the ACL links of the host
//! - Segmentation and reassembly of packets
//! - Flow control for each channel
//! - Error control for each channel

pub mod channel;
pub mod constants;
pub mod core;
pub mod packet;
pub mod psm;
pub mod signaling;
pub mod types;
#[cfg(test)]
mod tests;

// Re-export the public API
pub use self::channel::{ChannelHandler, IncomingChannel, L2capChannel, ServiceAcceptor};
pub use self::core::{ChannelContext, L2capMux, MuxEvent, MuxSettings, MuxStats, OutgoingAcl};
pub use self::psm::Psm;
pub use self::signaling::SignalingMessage;
pub use self::types::*;
