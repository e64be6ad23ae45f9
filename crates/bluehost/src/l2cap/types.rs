//! Type definitions for L2CAP operations
//!
//! This module contains core data structures used in L2CAP operations.

use super::constants::*;
use crate::gap::SecurityLevel;
use std::fmt;
use thiserror::Error;

/// Local or remote channel identifier
pub type ChannelId = u16;

/// Error types specific to L2CAP operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum L2capError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Signaling timeout")]
    Timeout,

    #[error("Remote device rejected connection: 0x{0:04X}")]
    ConnectionRejected(u16),

    #[error("Channel 0x{0:04X} not found")]
    ChannelNotFound(ChannelId),

    #[error("No ACL link with handle 0x{0:04X}")]
    UnknownLink(u16),

    #[error("Operation not supported")]
    NotSupported,

    #[error("Invalid state for operation")]
    InvalidState,

    #[error("SDU of {size} bytes exceeds MTU {mtu}")]
    MtuExceeded { size: usize, mtu: u16 },

    #[error("Resource limit reached")]
    ResourceLimitReached,

    #[error("PSM 0x{0:04X} not registered")]
    PsmNotRegistered(u16),

    #[error("Security requirements not met")]
    SecurityRequirementsNotMet,

    #[error("Connection terminated")]
    ConnectionTerminated,

    #[error("Channel send window exhausted")]
    WouldBlock,
}

/// Result type for L2CAP operations
pub type L2capResult<T> = std::result::Result<T, L2capError>;

/// Quality of Service (QoS) Flow Specification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosFlowSpec {
    /// QoS service type
    pub service_type: u8,
    /// Token rate (bytes/second)
    pub token_rate: u32,
    /// Token bucket size (bytes)
    pub token_bucket_size: u32,
    /// Peak bandwidth (bytes/second)
    pub peak_bandwidth: u32,
    /// Latency (microseconds)
    pub latency: u32,
    /// Delay variation (microseconds)
    pub delay_variation: u32,
}

impl Default for QosFlowSpec {
    fn default() -> Self {
        Self {
            service_type: 0x01, // Best effort
            token_rate: 0,
            token_bucket_size: 0,
            peak_bandwidth: 0,
            latency: 0xFFFF_FFFF,
            delay_variation: 0xFFFF_FFFF,
        }
    }
}

/// L2CAP Configuration Options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOptions {
    pub mtu: Option<u16>,
    pub flush_timeout: Option<u16>,
    pub qos: Option<QosFlowSpec>,
    pub retransmission: Option<RetransmissionFlowControl>,
    pub fcs: Option<u8>,
    pub ext_flow_spec: Option<ExtendedFlowSpec>,
    pub ext_window_size: Option<u16>,
    /// Types of non-hint options that were not understood
    pub unknown: Vec<u8>,
}

/// Retransmission and Flow Control modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetransmissionMode {
    #[default]
    Basic = 0,
    Retransmission = 1,
    FlowControl = 2,
    EnhancedRetransmission = 3,
    Streaming = 4,
}

impl RetransmissionMode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Basic),
            1 => Some(Self::Retransmission),
            2 => Some(Self::FlowControl),
            3 => Some(Self::EnhancedRetransmission),
            4 => Some(Self::Streaming),
            _ => None,
        }
    }
}

/// Retransmission and Flow Control option
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetransmissionFlowControl {
    pub mode: RetransmissionMode,
    /// I-frames the sender of the option can buffer unacknowledged
    pub tx_window_size: u8,
    pub max_transmit: u8,
    /// Retransmission timeout (ms)
    pub retransmit_timeout: u16,
    /// Monitor timeout (ms)
    pub monitor_timeout: u16,
    /// Largest I-frame payload the sender of the option accepts
    pub max_pdu_size: u16,
}

impl RetransmissionFlowControl {
    /// Option sent for an enhanced retransmission or streaming channel
    pub fn for_mode(mode: RetransmissionMode, tx_window_size: u8, max_pdu_size: u16) -> Self {
        match mode {
            RetransmissionMode::Streaming => Self {
                mode,
                max_pdu_size,
                ..Default::default()
            },
            _ => Self {
                mode,
                tx_window_size,
                max_transmit: L2CAP_ERTM_DEFAULT_MAX_TRANSMIT,
                retransmit_timeout: L2CAP_ERTM_RETRANSMISSION_TIMEOUT_MS,
                monitor_timeout: L2CAP_ERTM_MONITOR_TIMEOUT_MS,
                max_pdu_size,
            },
        }
    }
}

/// Extended Flow Specification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedFlowSpec {
    pub identifier: u8,
    pub service_type: u8,
    pub max_sdu_size: u16,
    pub sdu_inter_arrival_time: u32,
    pub access_latency: u32,
    pub flush_timeout: u32,
}

/// Channel operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChannelMode {
    #[default]
    Basic,
    EnhancedRetransmission,
    Streaming,
    LeCreditBased,
}

impl ChannelMode {
    /// Mode carried in the RFC configuration option, if any
    pub fn retransmission_mode(&self) -> Option<RetransmissionMode> {
        match self {
            Self::Basic => Some(RetransmissionMode::Basic),
            Self::EnhancedRetransmission => Some(RetransmissionMode::EnhancedRetransmission),
            Self::Streaming => Some(RetransmissionMode::Streaming),
            Self::LeCreditBased => None,
        }
    }

    /// Frames of this mode carry a control field and FCS
    pub fn uses_control_field(&self) -> bool {
        matches!(self, Self::EnhancedRetransmission | Self::Streaming)
    }
}

impl fmt::Display for ChannelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic => write!(f, "basic"),
            Self::EnhancedRetransmission => write!(f, "enhanced retransmission"),
            Self::Streaming => write!(f, "streaming"),
            Self::LeCreditBased => write!(f, "LE credit-based"),
        }
    }
}

/// L2CAP Channel State
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2capChannelState {
    Closed,
    /// Outgoing channel waiting for the link to reach the required security level
    WaitSecurity,
    /// Connection request sent
    WaitConnectRsp,
    /// Configuration exchange in progress
    Config,
    Open,
    WaitDisconnect,
}

impl fmt::Display for L2capChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::WaitSecurity => write!(f, "Waiting for security"),
            Self::WaitConnectRsp => write!(f, "Waiting for connection response"),
            Self::Config => write!(f, "Configuring"),
            Self::Open => write!(f, "Open"),
            Self::WaitDisconnect => write!(f, "Waiting for disconnection"),
        }
    }
}

/// Why a channel was closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by `close_channel`
    Local,
    /// Peer sent a disconnection request
    Remote,
    /// The ACL link went away
    LinkLost,
    /// Retransmission attempts exhausted
    RetransmissionFailed,
}

/// Parameters an outgoing channel is opened with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub psm: u16,
    pub mode: ChannelMode,
    /// MTU we can receive; the host default is used when `None`
    pub mtu: Option<u16>,
    pub required_security: SecurityLevel,
    /// LE credit-based: local MPS
    pub mps: u16,
    /// LE credit-based: credits granted to the peer on open; the host default is used when `None`
    pub initial_credits: Option<u16>,
    /// Enhanced retransmission: frames we can buffer unacknowledged
    pub tx_window: u8,
}

impl ChannelSpec {
    fn with_mode(psm: u16, mode: ChannelMode) -> Self {
        Self {
            psm,
            mode,
            mtu: None,
            required_security: SecurityLevel::Level0,
            mps: match mode {
                ChannelMode::LeCreditBased => L2CAP_LE_DEFAULT_MPS,
                _ => L2CAP_ERTM_DEFAULT_MPS,
            },
            initial_credits: None,
            tx_window: L2CAP_ERTM_DEFAULT_TX_WINDOW,
        }
    }

    pub fn basic(psm: u16) -> Self {
        Self::with_mode(psm, ChannelMode::Basic)
    }

    pub fn enhanced_retransmission(psm: u16) -> Self {
        Self::with_mode(psm, ChannelMode::EnhancedRetransmission)
    }

    pub fn streaming(psm: u16) -> Self {
        Self::with_mode(psm, ChannelMode::Streaming)
    }

    pub fn le_credit_based(psm: u16) -> Self {
        Self::with_mode(psm, ChannelMode::LeCreditBased)
    }

    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = Some(mtu);
        self
    }

    pub fn with_security(mut self, level: SecurityLevel) -> Self {
        self.required_security = level;
        self
    }

    pub fn with_mps(mut self, mps: u16) -> Self {
        self.mps = mps;
        self
    }

    pub fn with_initial_credits(mut self, credits: u16) -> Self {
        self.initial_credits = Some(credits);
        self
    }

    pub fn with_tx_window(mut self, window: u8) -> Self {
        self.tx_window = window.clamp(1, L2CAP_ERTM_MAX_TX_WINDOW);
        self
    }
}

/// Policy applied to incoming connections for a registered PSM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePolicy {
    pub min_security_level: SecurityLevel,
    pub mode: ChannelMode,
    pub mtu: Option<u16>,
}

impl Default for ServicePolicy {
    fn default() -> Self {
        Self {
            min_security_level: SecurityLevel::Level0,
            mode: ChannelMode::Basic,
            mtu: None,
        }
    }
}

/// L2CAP Connection Parameter Update request structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionParameterUpdate {
    /// Minimum connection interval (1.25ms units)
    pub conn_interval_min: u16,
    /// Maximum connection interval (1.25ms units)
    pub conn_interval_max: u16,
    /// Peripheral latency (number of events)
    pub conn_latency: u16,
    /// Connection supervision timeout (10ms units)
    pub supervision_timeout: u16,
}

impl ConnectionParameterUpdate {
    /// Validates that the parameters are within acceptable ranges
    pub fn validate(&self) -> bool {
        let interval_ok = self.conn_interval_min >= L2CAP_LE_CONN_INTERVAL_MIN
            && self.conn_interval_max <= L2CAP_LE_CONN_INTERVAL_MAX
            && self.conn_interval_min <= self.conn_interval_max;

        let latency_ok = self.conn_latency <= L2CAP_LE_CONN_LATENCY_MAX;

        let timeout_ok = self.supervision_timeout >= L2CAP_LE_SUPERVISION_TIMEOUT_MIN
            && self.supervision_timeout <= L2CAP_LE_SUPERVISION_TIMEOUT_MAX;

        // Supervision timeout (10ms) must exceed (1 + latency) * interval_max (1.25ms) * 2
        let relation_ok = (self.supervision_timeout as u32) * 4
            > (1 + self.conn_latency as u32) * (self.conn_interval_max as u32);

        interval_ok && latency_ok && timeout_ok && relation_ok
    }
}
