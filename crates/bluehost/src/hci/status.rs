//! Classification of controller status and event codes
//!
//! Host procedures branch on the [`Outcome`] of a status byte rather than
//! the byte itself, and the dispatcher routes on the [`EventClass`] of an
//! event code. Both mappings are total over `u8`.

use crate::hci::constants::*;

// Status codes from the Core Specification, Vol 1, Part F
pub const STATUS_SUCCESS: u8 = 0x00;
pub const STATUS_UNKNOWN_HCI_COMMAND: u8 = 0x01;
pub const STATUS_UNKNOWN_CONNECTION_IDENTIFIER: u8 = 0x02;
pub const STATUS_HARDWARE_FAILURE: u8 = 0x03;
pub const STATUS_PAGE_TIMEOUT: u8 = 0x04;
pub const STATUS_AUTHENTICATION_FAILURE: u8 = 0x05;
pub const STATUS_PIN_OR_KEY_MISSING: u8 = 0x06;
pub const STATUS_MEMORY_CAPACITY_EXCEEDED: u8 = 0x07;
pub const STATUS_CONNECTION_TIMEOUT: u8 = 0x08;
pub const STATUS_CONNECTION_LIMIT_EXCEEDED: u8 = 0x09;
pub const STATUS_SYNCHRONOUS_CONNECTION_LIMIT_EXCEEDED: u8 = 0x0A;
pub const STATUS_ACL_CONNECTION_ALREADY_EXISTS: u8 = 0x0B;
pub const STATUS_COMMAND_DISALLOWED: u8 = 0x0C;
pub const STATUS_REJECTED_LIMITED_RESOURCES: u8 = 0x0D;
pub const STATUS_REJECTED_SECURITY_REASONS: u8 = 0x0E;
pub const STATUS_REJECTED_UNACCEPTABLE_BD_ADDR: u8 = 0x0F;
pub const STATUS_CONNECTION_ACCEPT_TIMEOUT_EXCEEDED: u8 = 0x10;
pub const STATUS_UNSUPPORTED_FEATURE_OR_PARAMETER: u8 = 0x11;
pub const STATUS_INVALID_HCI_COMMAND_PARAMETERS: u8 = 0x12;
pub const STATUS_REMOTE_USER_TERMINATED_CONNECTION: u8 = 0x13;
pub const STATUS_REMOTE_TERMINATED_LOW_RESOURCES: u8 = 0x14;
pub const STATUS_REMOTE_TERMINATED_POWER_OFF: u8 = 0x15;
pub const STATUS_CONNECTION_TERMINATED_BY_LOCAL_HOST: u8 = 0x16;
pub const STATUS_REPEATED_ATTEMPTS: u8 = 0x17;
pub const STATUS_PAIRING_NOT_ALLOWED: u8 = 0x18;
pub const STATUS_UNKNOWN_LMP_PDU: u8 = 0x19;
pub const STATUS_UNSUPPORTED_REMOTE_FEATURE: u8 = 0x1A;
pub const STATUS_SCO_OFFSET_REJECTED: u8 = 0x1B;
pub const STATUS_SCO_INTERVAL_REJECTED: u8 = 0x1C;
pub const STATUS_SCO_AIR_MODE_REJECTED: u8 = 0x1D;
pub const STATUS_INVALID_LMP_PARAMETERS: u8 = 0x1E;
pub const STATUS_UNSPECIFIED_ERROR: u8 = 0x1F;
pub const STATUS_UNSUPPORTED_LMP_PARAMETER_VALUE: u8 = 0x20;
pub const STATUS_ROLE_CHANGE_NOT_ALLOWED: u8 = 0x21;
pub const STATUS_LMP_RESPONSE_TIMEOUT: u8 = 0x22;
pub const STATUS_LMP_ERROR_TRANSACTION_COLLISION: u8 = 0x23;
pub const STATUS_LMP_PDU_NOT_ALLOWED: u8 = 0x24;
pub const STATUS_ENCRYPTION_MODE_NOT_ACCEPTABLE: u8 = 0x25;
pub const STATUS_LINK_KEY_CANNOT_BE_CHANGED: u8 = 0x26;
pub const STATUS_REQUESTED_QOS_NOT_SUPPORTED: u8 = 0x27;
pub const STATUS_INSTANT_PASSED: u8 = 0x28;
pub const STATUS_PAIRING_WITH_UNIT_KEY_NOT_SUPPORTED: u8 = 0x29;
pub const STATUS_DIFFERENT_TRANSACTION_COLLISION: u8 = 0x2A;
pub const STATUS_QOS_UNACCEPTABLE_PARAMETER: u8 = 0x2C;
pub const STATUS_QOS_REJECTED: u8 = 0x2D;
pub const STATUS_CHANNEL_CLASSIFICATION_NOT_SUPPORTED: u8 = 0x2E;
pub const STATUS_INSUFFICIENT_SECURITY: u8 = 0x2F;
pub const STATUS_PARAMETER_OUT_OF_MANDATORY_RANGE: u8 = 0x30;
pub const STATUS_ROLE_SWITCH_PENDING: u8 = 0x32;
pub const STATUS_RESERVED_SLOT_VIOLATION: u8 = 0x34;
pub const STATUS_ROLE_SWITCH_FAILED: u8 = 0x35;
pub const STATUS_EIR_TOO_LARGE: u8 = 0x36;
pub const STATUS_SSP_NOT_SUPPORTED_BY_HOST: u8 = 0x37;
pub const STATUS_HOST_BUSY_PAIRING: u8 = 0x38;
pub const STATUS_NO_SUITABLE_CHANNEL_FOUND: u8 = 0x39;
pub const STATUS_CONTROLLER_BUSY: u8 = 0x3A;
pub const STATUS_UNACCEPTABLE_CONNECTION_PARAMETERS: u8 = 0x3B;
pub const STATUS_ADVERTISING_TIMEOUT: u8 = 0x3C;
pub const STATUS_TERMINATED_MIC_FAILURE: u8 = 0x3D;
pub const STATUS_CONNECTION_FAILED_TO_BE_ESTABLISHED: u8 = 0x3E;
pub const STATUS_MAC_CONNECTION_FAILED: u8 = 0x3F;
pub const STATUS_COARSE_CLOCK_ADJUSTMENT_REJECTED: u8 = 0x40;
pub const STATUS_TYPE0_SUBMAP_NOT_DEFINED: u8 = 0x41;
pub const STATUS_UNKNOWN_ADVERTISING_IDENTIFIER: u8 = 0x42;
pub const STATUS_LIMIT_REACHED: u8 = 0x43;
pub const STATUS_OPERATION_CANCELLED_BY_HOST: u8 = 0x44;
pub const STATUS_PACKET_TOO_LONG: u8 = 0x45;

/// Coarse reason carried by a non-success outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    UnknownCommand,
    UnknownConnection,
    HardwareFailure,
    PageTimeout,
    AuthenticationFailure,
    KeyMissing,
    ResourcesExhausted,
    ConnectionTimeout,
    AlreadyConnected,
    CommandDisallowed,
    ConnectionRejected,
    Unsupported,
    InvalidParameters,
    RemoteTerminated,
    LocalTerminated,
    RepeatedAttempts,
    PairingNotAllowed,
    LinkProtocol,
    Unspecified,
    RoleSwitch,
    TransactionCollision,
    EncryptionNotAcceptable,
    Qos,
    InsufficientSecurity,
    Busy,
    ConnectionFailed,
    Cancelled,
}

/// Symbolic result of a status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    /// The procedure failed but the link/controller remain usable
    Recoverable(ErrorKind),
    /// The controller cannot perform this request at all
    Fatal(ErrorKind),
    /// Reserved or future code, carried verbatim
    Unrecognized(u8),
}

impl Outcome {
    pub fn is_success(self) -> bool {
        self == Outcome::Success
    }
}

/// Map a status byte to an outcome. Never panics.
pub fn classify(status: u8) -> Outcome {
    use ErrorKind::*;
    use Outcome::{Fatal, Recoverable};

    match status {
        STATUS_SUCCESS => Outcome::Success,
        STATUS_UNKNOWN_HCI_COMMAND => Fatal(UnknownCommand),
        STATUS_UNKNOWN_CONNECTION_IDENTIFIER => Recoverable(UnknownConnection),
        STATUS_HARDWARE_FAILURE => Fatal(HardwareFailure),
        STATUS_PAGE_TIMEOUT => Recoverable(PageTimeout),
        STATUS_AUTHENTICATION_FAILURE => Recoverable(AuthenticationFailure),
        STATUS_PIN_OR_KEY_MISSING => Recoverable(KeyMissing),
        STATUS_MEMORY_CAPACITY_EXCEEDED
        | STATUS_CONNECTION_LIMIT_EXCEEDED
        | STATUS_SYNCHRONOUS_CONNECTION_LIMIT_EXCEEDED
        | STATUS_LIMIT_REACHED => Recoverable(ResourcesExhausted),
        STATUS_CONNECTION_TIMEOUT
        | STATUS_CONNECTION_ACCEPT_TIMEOUT_EXCEEDED
        | STATUS_LMP_RESPONSE_TIMEOUT
        | STATUS_ADVERTISING_TIMEOUT => Recoverable(ConnectionTimeout),
        STATUS_ACL_CONNECTION_ALREADY_EXISTS => Recoverable(AlreadyConnected),
        STATUS_COMMAND_DISALLOWED => Recoverable(CommandDisallowed),
        STATUS_REJECTED_LIMITED_RESOURCES
        | STATUS_REJECTED_SECURITY_REASONS
        | STATUS_REJECTED_UNACCEPTABLE_BD_ADDR
        | STATUS_UNACCEPTABLE_CONNECTION_PARAMETERS
        | STATUS_NO_SUITABLE_CHANNEL_FOUND => Recoverable(ConnectionRejected),
        STATUS_UNSUPPORTED_FEATURE_OR_PARAMETER
        | STATUS_SSP_NOT_SUPPORTED_BY_HOST
        | STATUS_TYPE0_SUBMAP_NOT_DEFINED => Fatal(Unsupported),
        STATUS_INVALID_HCI_COMMAND_PARAMETERS
        | STATUS_PARAMETER_OUT_OF_MANDATORY_RANGE
        | STATUS_UNKNOWN_ADVERTISING_IDENTIFIER
        | STATUS_PACKET_TOO_LONG
        | STATUS_EIR_TOO_LARGE => Fatal(InvalidParameters),
        STATUS_REMOTE_USER_TERMINATED_CONNECTION
        | STATUS_REMOTE_TERMINATED_LOW_RESOURCES
        | STATUS_REMOTE_TERMINATED_POWER_OFF => Recoverable(RemoteTerminated),
        STATUS_CONNECTION_TERMINATED_BY_LOCAL_HOST => Recoverable(LocalTerminated),
        STATUS_REPEATED_ATTEMPTS => Recoverable(RepeatedAttempts),
        STATUS_PAIRING_NOT_ALLOWED | STATUS_PAIRING_WITH_UNIT_KEY_NOT_SUPPORTED => {
            Recoverable(PairingNotAllowed)
        }
        STATUS_UNKNOWN_LMP_PDU
        | STATUS_UNSUPPORTED_REMOTE_FEATURE
        | STATUS_SCO_OFFSET_REJECTED
        | STATUS_SCO_INTERVAL_REJECTED
        | STATUS_SCO_AIR_MODE_REJECTED
        | STATUS_INVALID_LMP_PARAMETERS
        | STATUS_UNSUPPORTED_LMP_PARAMETER_VALUE
        | STATUS_LMP_PDU_NOT_ALLOWED
        | STATUS_INSTANT_PASSED
        | STATUS_RESERVED_SLOT_VIOLATION
        | STATUS_TERMINATED_MIC_FAILURE
        | STATUS_COARSE_CLOCK_ADJUSTMENT_REJECTED => Recoverable(LinkProtocol),
        STATUS_UNSPECIFIED_ERROR => Recoverable(Unspecified),
        STATUS_ROLE_CHANGE_NOT_ALLOWED | STATUS_ROLE_SWITCH_PENDING | STATUS_ROLE_SWITCH_FAILED => {
            Recoverable(RoleSwitch)
        }
        STATUS_LMP_ERROR_TRANSACTION_COLLISION | STATUS_DIFFERENT_TRANSACTION_COLLISION => {
            Recoverable(TransactionCollision)
        }
        STATUS_ENCRYPTION_MODE_NOT_ACCEPTABLE | STATUS_LINK_KEY_CANNOT_BE_CHANGED => {
            Recoverable(EncryptionNotAcceptable)
        }
        STATUS_REQUESTED_QOS_NOT_SUPPORTED
        | STATUS_QOS_UNACCEPTABLE_PARAMETER
        | STATUS_QOS_REJECTED
        | STATUS_CHANNEL_CLASSIFICATION_NOT_SUPPORTED => Recoverable(Qos),
        STATUS_INSUFFICIENT_SECURITY => Recoverable(InsufficientSecurity),
        STATUS_HOST_BUSY_PAIRING | STATUS_CONTROLLER_BUSY => Recoverable(Busy),
        STATUS_CONNECTION_FAILED_TO_BE_ESTABLISHED | STATUS_MAC_CONNECTION_FAILED => {
            Recoverable(ConnectionFailed)
        }
        STATUS_OPERATION_CANCELLED_BY_HOST => Recoverable(Cancelled),
        other => Outcome::Unrecognized(other),
    }
}

/// Which part of the host an event code belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventClass {
    /// Command Complete / Command Status
    CommandFlow,
    /// Controller lifecycle (hardware error, buffer overflow)
    Controller,
    Discovery,
    Connection,
    Security,
    /// Number Of Completed Packets
    DataFlow,
    LeMeta,
    VendorSpecific,
    /// Assigned event the core has no handler for
    Other,
    /// Code with no assigned meaning
    Unrecognized(u8),
}

/// Map an event code to the component that should handle it. Never panics.
pub fn classify_event(code: u8) -> EventClass {
    match code {
        EVT_CMD_COMPLETE | EVT_CMD_STATUS => EventClass::CommandFlow,
        EVT_HARDWARE_ERROR | EVT_DATA_BUFFER_OVERFLOW => EventClass::Controller,
        EVT_INQUIRY_COMPLETE
        | EVT_INQUIRY_RESULT
        | EVT_REMOTE_NAME_REQ_COMPLETE
        | EVT_INQUIRY_RESULT_WITH_RSSI
        | EVT_EXTENDED_INQUIRY_RESULT => EventClass::Discovery,
        EVT_CONN_COMPLETE | EVT_CONN_REQUEST | EVT_DISCONN_COMPLETE | EVT_ROLE_CHANGE => {
            EventClass::Connection
        }
        EVT_AUTH_COMPLETE
        | EVT_ENCRYPTION_CHANGE
        | EVT_PIN_CODE_REQ
        | EVT_LINK_KEY_REQ
        | EVT_LINK_KEY_NOTIFY
        | EVT_ENCRYPTION_KEY_REFRESH_COMPLETE
        | EVT_IO_CAPABILITY_REQUEST
        | EVT_IO_CAPABILITY_RESPONSE
        | EVT_USER_CONFIRMATION_REQUEST
        | EVT_USER_PASSKEY_REQUEST
        | EVT_SIMPLE_PAIRING_COMPLETE
        | EVT_USER_PASSKEY_NOTIFICATION => EventClass::Security,
        EVT_NUM_COMP_PKTS => EventClass::DataFlow,
        EVT_LE_META_EVENT => EventClass::LeMeta,
        EVT_VENDOR_SPECIFIC => EventClass::VendorSpecific,
        code if crate::hci::names::is_assigned_event(code) => EventClass::Other,
        other => EventClass::Unrecognized(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_is_total() {
        for status in 0..=u8::MAX {
            let outcome = classify(status);
            if status == 0 {
                assert_eq!(outcome, Outcome::Success);
            } else {
                assert!(!outcome.is_success());
            }
        }
    }

    #[test]
    fn test_reserved_codes_are_unrecognized() {
        assert_eq!(classify(0x2B), Outcome::Unrecognized(0x2B));
        assert_eq!(classify(0x31), Outcome::Unrecognized(0x31));
        assert_eq!(classify(0x33), Outcome::Unrecognized(0x33));
        assert_eq!(classify(0xFF), Outcome::Unrecognized(0xFF));
    }

    #[test]
    fn test_procedure_relevant_codes() {
        assert_eq!(classify(STATUS_PAGE_TIMEOUT), Outcome::Recoverable(ErrorKind::PageTimeout));
        assert_eq!(classify(STATUS_HARDWARE_FAILURE), Outcome::Fatal(ErrorKind::HardwareFailure));
        assert_eq!(
            classify(STATUS_INSUFFICIENT_SECURITY),
            Outcome::Recoverable(ErrorKind::InsufficientSecurity)
        );
    }

    #[test]
    fn test_classify_event_is_total() {
        for code in 0..=u8::MAX {
            let _ = classify_event(code);
        }
        assert_eq!(classify_event(EVT_CMD_STATUS), EventClass::CommandFlow);
        assert_eq!(classify_event(EVT_LINK_KEY_REQ), EventClass::Security);
        assert_eq!(classify_event(0x0C), EventClass::Other);
        assert_eq!(classify_event(0x90), EventClass::Unrecognized(0x90));
    }
}
