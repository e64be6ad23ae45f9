//! Error types for the bluehost library
//!
//! This module defines the error taxonomy shared by the decoder, the HCI
//! state machine and the L2CAP multiplexer.

use crate::gap::BdAddr;
use crate::hci::transport::TransportError;
use crate::l2cap::L2capError;
use std::fmt;
use thiserror::Error;

/// A multi-step HCI procedure that can time out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Procedure {
    PowerOn,
    Command(u16),
    Inquiry,
    RemoteName,
    Connect,
    Pairing,
    ChannelOpen,
}

impl fmt::Display for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Procedure::PowerOn => write!(f, "power-on"),
            Procedure::Command(opcode) => write!(f, "command 0x{:04X}", opcode),
            Procedure::Inquiry => write!(f, "inquiry"),
            Procedure::RemoteName => write!(f, "remote name request"),
            Procedure::Connect => write!(f, "connection"),
            Procedure::Pairing => write!(f, "pairing"),
            Procedure::ChannelOpen => write!(f, "channel open"),
        }
    }
}

/// Errors produced by the host core
#[derive(Error, Debug)]
pub enum Error {
    #[error("Malformed {packet_type} packet: need {needed} bytes, got {actual}")]
    MalformedPacket {
        packet_type: &'static str,
        needed: usize,
        actual: usize,
    },

    #[error("Controller failed {procedure} with status 0x{status:02X}")]
    ControllerRejected { procedure: Procedure, status: u8 },

    #[error("Timed out waiting for {0}")]
    ProcedureTimeout(Procedure),

    #[error("Peer protocol violation: {0}")]
    PeerProtocolViolation(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    #[error("Operation would block")]
    WouldBlock,

    #[error("Controller is not ready")]
    NotReady,

    #[error("Connection attempt to {0} already pending")]
    AlreadyPending(BdAddr),

    #[error("Unknown connection handle 0x{0:04X}")]
    UnknownConnection(u16),

    #[error("Unknown channel 0x{0:04X}")]
    UnknownChannel(u16),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid state for operation")]
    InvalidState,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Connection registry corrupted: {0}")]
    RegistryCorrupted(String),

    #[error("L2CAP error: {0}")]
    L2cap(L2capError),
}

impl From<L2capError> for Error {
    fn from(err: L2capError) -> Self {
        match err {
            L2capError::WouldBlock => Error::WouldBlock,
            L2capError::ChannelNotFound(cid) => Error::UnknownChannel(cid),
            L2capError::UnknownLink(handle) => Error::UnknownConnection(handle),
            L2capError::ResourceLimitReached => Error::ResourceExhausted("dynamic channel identifiers"),
            L2capError::ProtocolError(reason) => Error::PeerProtocolViolation(reason),
            L2capError::Timeout => Error::ProcedureTimeout(Procedure::ChannelOpen),
            other => Error::L2cap(other),
        }
    }
}

impl Error {
    pub(crate) fn malformed(packet_type: &'static str, needed: usize, actual: usize) -> Self {
        Error::MalformedPacket {
            packet_type,
            needed,
            actual,
        }
    }

    /// Whether the error makes the whole stack unusable
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::RegistryCorrupted(_))
    }
}

/// Result type for host operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2cap_errors_map_to_host_errors() {
        assert!(matches!(
            Error::from(L2capError::ResourceLimitReached),
            Error::ResourceExhausted(_)
        ));
        assert!(matches!(
            Error::from(L2capError::ProtocolError("bad length".into())),
            Error::PeerProtocolViolation(reason) if reason == "bad length"
        ));
        assert!(matches!(
            Error::from(L2capError::Timeout),
            Error::ProcedureTimeout(Procedure::ChannelOpen)
        ));
        assert!(matches!(Error::from(L2capError::WouldBlock), Error::WouldBlock));
        assert!(matches!(
            Error::from(L2capError::PsmNotRegistered(0x1001)),
            Error::L2cap(L2capError::PsmNotRegistered(0x1001))
        ));
    }

    #[test]
    fn test_display() {
        let err = Error::ControllerRejected {
            procedure: Procedure::Command(0x0405),
            status: 0x0C,
        };
        assert_eq!(err.to_string(), "Controller failed command 0x0405 with status 0x0C");
        assert_eq!(
            Error::ProcedureTimeout(Procedure::Connect).to_string(),
            "Timed out waiting for connection"
        );
    }
}
