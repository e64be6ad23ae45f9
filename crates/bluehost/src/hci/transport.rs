//! The boundary between the host core and the byte pipe to the controller

use std::collections::VecDeque;
use thiserror::Error;

/// Errors reported by a transport when sending
#[derive(Error, Debug)]
pub enum TransportError {
    /// The transport cannot take another packet right now; retry after
    /// `Host::on_transport_can_send_now`
    #[error("Transport would block")]
    WouldBlock,

    #[error("Transport closed")]
    Closed,

    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A byte-oriented channel to the controller.
///
/// Every buffer starts with its packet type tag. Inbound packets are pushed
/// into the host by the owner of the transport through
/// `Host::on_transport_packet`.
pub trait Transport {
    fn send(&mut self, packet: &[u8]) -> Result<(), TransportError>;
}

/// In-memory transport that records sent packets
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: VecDeque<Vec<u8>>,
    blocked: bool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent sends fail with `WouldBlock`
    pub fn set_blocked(&mut self, blocked: bool) {
        self.blocked = blocked;
    }

    /// Drain everything sent so far
    pub fn take_sent(&mut self) -> Vec<Vec<u8>> {
        self.sent.drain(..).collect()
    }

    pub fn sent(&self) -> impl Iterator<Item = &Vec<u8>> {
        self.sent.iter()
    }
}

impl Transport for RecordingTransport {
    fn send(&mut self, packet: &[u8]) -> Result<(), TransportError> {
        if self.blocked {
            return Err(TransportError::WouldBlock);
        }
        self.sent.push_back(packet.to_vec());
        Ok(())
    }
}
