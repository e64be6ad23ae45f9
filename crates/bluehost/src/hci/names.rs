//! Human-readable names for diagnostics
//!
//! Names are for logs only; control flow goes through [`crate::hci::status`].

use crate::hci::packet::PacketType;
use std::borrow::Cow;

fn assigned_event_name(code: u8) -> Option<&'static str> {
    let name = match code {
        0x01 => "INQUIRY_COMPLETE",
        0x02 => "INQUIRY_RESULT",
        0x03 => "CONNECTION_COMPLETE",
        0x04 => "CONNECTION_REQUEST",
        0x05 => "DISCONNECTION_COMPLETE",
        0x06 => "AUTHENTICATION_COMPLETE",
        0x07 => "REMOTE_NAME_REQUEST_COMPLETE",
        0x08 => "ENCRYPTION_CHANGE",
        0x09 => "CHANGE_CONNECTION_LINK_KEY_COMPLETE",
        0x0A => "LINK_KEY_TYPE_CHANGED",
        0x0B => "READ_REMOTE_SUPPORTED_FEATURES_COMPLETE",
        0x0C => "READ_REMOTE_VERSION_INFORMATION_COMPLETE",
        0x0D => "QOS_SETUP_COMPLETE",
        0x0E => "COMMAND_COMPLETE",
        0x0F => "COMMAND_STATUS",
        0x10 => "HARDWARE_ERROR",
        0x11 => "FLUSH_OCCURRED",
        0x12 => "ROLE_CHANGE",
        0x13 => "NUMBER_OF_COMPLETED_PACKETS",
        0x14 => "MODE_CHANGE",
        0x15 => "RETURN_LINK_KEYS",
        0x16 => "PIN_CODE_REQUEST",
        0x17 => "LINK_KEY_REQUEST",
        0x18 => "LINK_KEY_NOTIFICATION",
        0x19 => "LOOPBACK_COMMAND",
        0x1A => "DATA_BUFFER_OVERFLOW",
        0x1B => "MAX_SLOTS_CHANGE",
        0x1C => "READ_CLOCK_OFFSET_COMPLETE",
        0x1D => "CONNECTION_PACKET_TYPE_CHANGED",
        0x1E => "QOS_VIOLATION",
        // 0x1F reserved
        0x20 => "PAGE_SCAN_REPETITION_MODE_CHANGE",
        0x21 => "FLOW_SPECIFICATION_COMPLETE",
        0x22 => "INQUIRY_RESULT_WITH_RSSI",
        0x23 => "READ_REMOTE_EXTENDED_FEATURES_COMPLETE",
        // 0x24..=0x2B reserved
        0x2C => "SYNCHRONOUS_CONNECTION_COMPLETE",
        0x2D => "SYNCHRONOUS_CONNECTION_CHANGED",
        0x2E => "SNIFF_SUBRATING",
        0x2F => "EXTENDED_INQUIRY_RESULT",
        0x30 => "ENCRYPTION_KEY_REFRESH_COMPLETE",
        0x31 => "IO_CAPABILITY_REQUEST",
        0x32 => "IO_CAPABILITY_RESPONSE",
        0x33 => "USER_CONFIRMATION_REQUEST",
        0x34 => "USER_PASSKEY_REQUEST",
        0x35 => "REMOTE_OOB_DATA_REQUEST",
        0x36 => "SIMPLE_PAIRING_COMPLETE",
        // 0x37 reserved
        0x38 => "LINK_SUPERVISION_TIMEOUT_CHANGED",
        0x39 => "ENHANCED_FLUSH_COMPLETE",
        // 0x3A reserved
        0x3B => "USER_PASSKEY_NOTIFICATION",
        0x3C => "KEYPRESS_NOTIFICATION",
        0x3D => "REMOTE_HOST_SUPPORTED_FEATURES_NOTIFICATION",
        0x3E => "LE_META",
        // 0x3F reserved
        0x40 => "PHYSICAL_LINK_COMPLETE",
        0x41 => "CHANNEL_SELECTED",
        0x42 => "DISCONNECTION_PHYSICAL_LINK_COMPLETE",
        0x43 => "PHYSICAL_LINK_LOSS_EARLY_WARNING",
        0x44 => "PHYSICAL_LINK_RECOVERY",
        0x45 => "LOGICAL_LINK_COMPLETE",
        0x46 => "DISCONNECTION_LOGICAL_LINK_COMPLETE",
        0x47 => "FLOW_SPEC_MODIFY_COMPLETE",
        0x48 => "NUMBER_OF_COMPLETED_DATA_BLOCKS",
        0x49 => "AMP_START_TEST",
        0x4A => "AMP_TEST_END",
        0x4B => "AMP_RECEIVER_REPORT",
        0x4C => "SHORT_RANGE_MODE_CHANGE_COMPLETE",
        0x4D => "AMP_STATUS_CHANGE",
        0x4E => "TRIGGERED_CLOCK_CAPTURE",
        0x4F => "SYNCHRONIZATION_TRAIN_COMPLETE",
        0x50 => "SYNCHRONIZATION_TRAIN_RECEIVED",
        0x51 => "CONNECTIONLESS_PERIPHERAL_BROADCAST_RECEIVE",
        0x52 => "CONNECTIONLESS_PERIPHERAL_BROADCAST_TIMEOUT",
        0x53 => "TRUNCATED_PAGE_COMPLETE",
        0x54 => "PERIPHERAL_PAGE_RESPONSE_TIMEOUT",
        0x55 => "CONNECTIONLESS_PERIPHERAL_BROADCAST_CHANNEL_MAP_CHANGE",
        0x56 => "INQUIRY_RESPONSE_NOTIFICATION",
        0x57 => "AUTHENTICATED_PAYLOAD_TIMEOUT_EXPIRED",
        0x58 => "SAM_STATUS_CHANGE",
        0x59 => "ENCRYPTION_CHANGE_V2",
        0xFF => "VENDOR_SPECIFIC",
        _ => return None,
    };
    Some(name)
}

/// Whether the event code has an assigned meaning
pub fn is_assigned_event(code: u8) -> bool {
    assigned_event_name(code).is_some()
}

/// Symbolic name of an HCI event code, `Unknown(0x..)` when unassigned
pub fn event_name(code: u8) -> Cow<'static, str> {
    match assigned_event_name(code) {
        Some(name) => Cow::Borrowed(name),
        None => Cow::Owned(format!("Unknown(0x{:02X})", code)),
    }
}

fn assigned_status_name(status: u8) -> Option<&'static str> {
    let name = match status {
        0x00 => "SUCCESS",
        0x01 => "UNKNOWN_HCI_COMMAND",
        0x02 => "UNKNOWN_CONNECTION_IDENTIFIER",
        0x03 => "HARDWARE_FAILURE",
        0x04 => "PAGE_TIMEOUT",
        0x05 => "AUTHENTICATION_FAILURE",
        0x06 => "PIN_OR_KEY_MISSING",
        0x07 => "MEMORY_CAPACITY_EXCEEDED",
        0x08 => "CONNECTION_TIMEOUT",
        0x09 => "CONNECTION_LIMIT_EXCEEDED",
        0x0A => "SYNCHRONOUS_CONNECTION_LIMIT_TO_A_DEVICE_EXCEEDED",
        0x0B => "ACL_CONNECTION_ALREADY_EXISTS",
        0x0C => "COMMAND_DISALLOWED",
        0x0D => "CONNECTION_REJECTED_DUE_TO_LIMITED_RESOURCES",
        0x0E => "CONNECTION_REJECTED_DUE_TO_SECURITY_REASONS",
        0x0F => "CONNECTION_REJECTED_DUE_TO_UNACCEPTABLE_BD_ADDR",
        0x10 => "CONNECTION_ACCEPT_TIMEOUT_EXCEEDED",
        0x11 => "UNSUPPORTED_FEATURE_OR_PARAMETER_VALUE",
        0x12 => "INVALID_HCI_COMMAND_PARAMETERS",
        0x13 => "REMOTE_USER_TERMINATED_CONNECTION",
        0x14 => "REMOTE_DEVICE_TERMINATED_CONNECTION_DUE_TO_LOW_RESOURCES",
        0x15 => "REMOTE_DEVICE_TERMINATED_CONNECTION_DUE_TO_POWER_OFF",
        0x16 => "CONNECTION_TERMINATED_BY_LOCAL_HOST",
        0x17 => "REPEATED_ATTEMPTS",
        0x18 => "PAIRING_NOT_ALLOWED",
        0x19 => "UNKNOWN_LMP_PDU",
        0x1A => "UNSUPPORTED_REMOTE_FEATURE",
        0x1B => "SCO_OFFSET_REJECTED",
        0x1C => "SCO_INTERVAL_REJECTED",
        0x1D => "SCO_AIR_MODE_REJECTED",
        0x1E => "INVALID_LMP_PARAMETERS",
        0x1F => "UNSPECIFIED_ERROR",
        0x20 => "UNSUPPORTED_LMP_PARAMETER_VALUE",
        0x21 => "ROLE_CHANGE_NOT_ALLOWED",
        0x22 => "LMP_RESPONSE_TIMEOUT",
        0x23 => "LMP_ERROR_TRANSACTION_COLLISION",
        0x24 => "LMP_PDU_NOT_ALLOWED",
        0x25 => "ENCRYPTION_MODE_NOT_ACCEPTABLE",
        0x26 => "LINK_KEY_CANNOT_BE_CHANGED",
        0x27 => "REQUESTED_QOS_NOT_SUPPORTED",
        0x28 => "INSTANT_PASSED",
        0x29 => "PAIRING_WITH_UNIT_KEY_NOT_SUPPORTED",
        0x2A => "DIFFERENT_TRANSACTION_COLLISION",
        // 0x2B reserved
        0x2C => "QOS_UNACCEPTABLE_PARAMETER",
        0x2D => "QOS_REJECTED",
        0x2E => "CHANNEL_CLASSIFICATION_NOT_SUPPORTED",
        0x2F => "INSUFFICIENT_SECURITY",
        0x30 => "PARAMETER_OUT_OF_MANDATORY_RANGE",
        // 0x31 reserved
        0x32 => "ROLE_SWITCH_PENDING",
        // 0x33 reserved
        0x34 => "RESERVED_SLOT_VIOLATION",
        0x35 => "ROLE_SWITCH_FAILED",
        0x36 => "EXTENDED_INQUIRY_RESPONSE_TOO_LARGE",
        0x37 => "SECURE_SIMPLE_PAIRING_NOT_SUPPORTED_BY_HOST",
        0x38 => "HOST_BUSY_PAIRING",
        0x39 => "CONNECTION_REJECTED_DUE_TO_NO_SUITABLE_CHANNEL_FOUND",
        0x3A => "CONTROLLER_BUSY",
        0x3B => "UNACCEPTABLE_CONNECTION_PARAMETERS",
        0x3C => "ADVERTISING_TIMEOUT",
        0x3D => "CONNECTION_TERMINATED_DUE_TO_MIC_FAILURE",
        0x3E => "CONNECTION_FAILED_TO_BE_ESTABLISHED",
        0x3F => "MAC_CONNECTION_FAILED",
        0x40 => "COARSE_CLOCK_ADJUSTMENT_REJECTED",
        0x41 => "TYPE0_SUBMAP_NOT_DEFINED",
        0x42 => "UNKNOWN_ADVERTISING_IDENTIFIER",
        0x43 => "LIMIT_REACHED",
        0x44 => "OPERATION_CANCELLED_BY_HOST",
        0x45 => "PACKET_TOO_LONG",
        _ => return None,
    };
    Some(name)
}

/// Symbolic name of an HCI status code, `Unknown(0x..)` when unassigned
pub fn status_name(status: u8) -> Cow<'static, str> {
    match assigned_status_name(status) {
        Some(name) => Cow::Borrowed(name),
        None => Cow::Owned(format!("Unknown(0x{:02X})", status)),
    }
}

/// Symbolic name of a packet type tag, `Unknown(0x..)` when unassigned
pub fn packet_type_name(tag: u8) -> Cow<'static, str> {
    let name = match PacketType::from_u8(tag) {
        PacketType::Command => "HCI_COMMAND_DATA_PACKET",
        PacketType::Acl => "HCI_ACL_DATA_PACKET",
        PacketType::Sco => "HCI_SCO_DATA_PACKET",
        PacketType::Event => "HCI_EVENT_PACKET",
        PacketType::DaemonEvent => "DAEMON_EVENT_PACKET",
        PacketType::L2capData => "L2CAP_DATA_PACKET",
        PacketType::RfcommData => "RFCOMM_DATA_PACKET",
        PacketType::AttData => "ATT_DATA_PACKET",
        PacketType::SmData => "SM_DATA_PACKET",
        PacketType::SdpClient => "SDP_CLIENT_PACKET",
        PacketType::BnepData => "BNEP_DATA_PACKET",
        PacketType::UcdData => "UCD_DATA_PACKET",
        PacketType::GoepData => "GOEP_DATA_PACKET",
        PacketType::PbapData => "PBAP_DATA_PACKET",
        PacketType::AvrcpBrowsingData => "AVRCP_BROWSING_DATA_PACKET",
        PacketType::MapData => "MAP_DATA_PACKET",
        PacketType::Provisioning => "PROVISIONING_DATA_PACKET",
        PacketType::MeshNetwork => "MESH_NETWORK_PACKET",
        PacketType::MeshBeacon => "MESH_BEACON_PACKET",
        PacketType::LogMessage => "LOG_MESSAGE_PACKET",
        PacketType::Other(tag) => return Cow::Owned(format!("Unknown(0x{:02X})", tag)),
    };
    Cow::Borrowed(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_event_code_has_a_name() {
        for code in 0..=u8::MAX {
            let name = event_name(code);
            assert!(!name.is_empty());
            if !is_assigned_event(code) {
                assert_eq!(name, format!("Unknown(0x{:02X})", code));
            }
        }
        assert_eq!(event_name(0x0E), "COMMAND_COMPLETE");
        assert_eq!(event_name(0x1F), "Unknown(0x1F)");
    }

    #[test]
    fn test_every_status_code_has_a_name() {
        let mut assigned = 0;
        for status in 0..=u8::MAX {
            let name = status_name(status);
            if !name.starts_with("Unknown(") {
                assigned += 1;
            }
        }
        // 0x00..=0x45 minus three reserved codes
        assert_eq!(assigned, 0x46 - 3);
        assert_eq!(status_name(0x05), "AUTHENTICATION_FAILURE");
        assert_eq!(status_name(0x2B), "Unknown(0x2B)");
    }

    #[test]
    fn test_packet_type_names_round_trip_tags() {
        for tag in 0..=u8::MAX {
            assert_eq!(PacketType::from_u8(tag).as_u8(), tag);
            let _ = packet_type_name(tag);
        }
        assert_eq!(packet_type_name(0x04), "HCI_EVENT_PACKET");
        assert_eq!(packet_type_name(0x42), "Unknown(0x42)");
    }
}
