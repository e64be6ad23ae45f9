//! Host configuration
//!
//! Recognized options that steer the pairing sub-state-machine, the
//! power-on sequence and the L2CAP defaults.

use crate::gap::{IoCapability, SecurityLevel};
use crate::l2cap::constants::{L2CAP_DEFAULT_MTU, L2CAP_LE_DEFAULT_CREDITS};
use std::time::Duration;

/// What to do with a Secure Simple Pairing numeric comparison request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfirmationPolicy {
    /// Raise `HostEvent::UserConfirmationRequest` and wait for
    /// `Host::user_confirmation_reply`
    #[default]
    AskUser,
    /// Confirm without user interaction. Gives up MITM protection.
    AutoAccept,
    Reject,
}

/// What to do with a legacy PIN code request
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PinCodePolicy {
    #[default]
    AskUser,
    /// Reply with a fixed PIN (1 to 16 bytes)
    Fixed(String),
    Reject,
}

/// Configuration for a [`crate::Host`]
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub io_capability: IoCapability,
    pub secure_simple_pairing: bool,
    /// Minimum security level a link must reach after pairing
    pub min_security_level: SecurityLevel,
    pub bondable: bool,
    pub confirmation_policy: ConfirmationPolicy,
    pub pin_code_policy: PinCodePolicy,
    pub accept_incoming_connections: bool,
    pub connectable: bool,
    pub discoverable: bool,
    pub command_timeout: Duration,
    pub connect_timeout: Duration,
    pub pairing_timeout: Duration,
    pub name_request_timeout: Duration,
    pub l2cap_rtx_timeout: Duration,
    /// Commands allowed in flight at once; above 1 responses are matched by opcode
    pub max_outstanding_commands: u8,
    pub l2cap_local_mtu: u16,
    pub le_initial_credits: u16,
    /// Return credits to the peer once its remaining credits drop to this value
    pub le_credit_low_watermark: u16,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            io_capability: IoCapability::DisplayYesNo,
            secure_simple_pairing: true,
            min_security_level: SecurityLevel::Level0,
            bondable: true,
            confirmation_policy: ConfirmationPolicy::AskUser,
            pin_code_policy: PinCodePolicy::AskUser,
            accept_incoming_connections: true,
            connectable: true,
            discoverable: false,
            command_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(10),
            pairing_timeout: Duration::from_secs(30),
            name_request_timeout: Duration::from_secs(10),
            l2cap_rtx_timeout: Duration::from_secs(10),
            max_outstanding_commands: 1,
            l2cap_local_mtu: L2CAP_DEFAULT_MTU,
            le_initial_credits: L2CAP_LE_DEFAULT_CREDITS,
            le_credit_low_watermark: L2CAP_LE_DEFAULT_CREDITS / 2,
        }
    }
}

impl HostConfig {
    pub fn with_io_capability(mut self, io_capability: IoCapability) -> Self {
        self.io_capability = io_capability;
        self
    }

    pub fn with_secure_simple_pairing(mut self, enabled: bool) -> Self {
        self.secure_simple_pairing = enabled;
        self
    }

    pub fn with_min_security_level(mut self, level: SecurityLevel) -> Self {
        self.min_security_level = level;
        self
    }

    pub fn with_bondable(mut self, bondable: bool) -> Self {
        self.bondable = bondable;
        self
    }

    pub fn with_confirmation_policy(mut self, policy: ConfirmationPolicy) -> Self {
        self.confirmation_policy = policy;
        self
    }

    pub fn with_pin_code_policy(mut self, policy: PinCodePolicy) -> Self {
        self.pin_code_policy = policy;
        self
    }

    pub fn with_accept_incoming_connections(mut self, accept: bool) -> Self {
        self.accept_incoming_connections = accept;
        self
    }

    pub fn with_scan_mode(mut self, connectable: bool, discoverable: bool) -> Self {
        self.connectable = connectable;
        self.discoverable = discoverable;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_pairing_timeout(mut self, timeout: Duration) -> Self {
        self.pairing_timeout = timeout;
        self
    }

    pub fn with_name_request_timeout(mut self, timeout: Duration) -> Self {
        self.name_request_timeout = timeout;
        self
    }

    pub fn with_l2cap_rtx_timeout(mut self, timeout: Duration) -> Self {
        self.l2cap_rtx_timeout = timeout;
        self
    }

    pub fn with_max_outstanding_commands(mut self, count: u8) -> Self {
        self.max_outstanding_commands = count.max(1);
        self
    }

    pub fn with_l2cap_local_mtu(mut self, mtu: u16) -> Self {
        self.l2cap_local_mtu = mtu;
        self
    }

    pub fn with_le_credits(mut self, initial: u16, low_watermark: u16) -> Self {
        self.le_initial_credits = initial;
        self.le_credit_low_watermark = low_watermark.min(initial);
        self
    }

    /// Scan enable value written during power-on
    pub(crate) fn scan_enable(&self) -> u8 {
        use crate::hci::constants::{SCAN_INQUIRY, SCAN_PAGE};
        let mut value = 0;
        if self.connectable {
            value |= SCAN_PAGE;
        }
        if self.discoverable {
            value |= SCAN_INQUIRY;
        }
        value
    }
}
