//! HCI protocol constants
//!
//! This module contains constants used in the Bluetooth HCI protocol.

// Packet type tags prefixed to every buffer crossing the transport boundary
pub const HCI_COMMAND_PKT: u8 = 0x01;
pub const HCI_ACL_PKT: u8 = 0x02;
pub const HCI_SCO_PKT: u8 = 0x03;
pub const HCI_EVENT_PKT: u8 = 0x04;
pub const DAEMON_EVENT_PKT: u8 = 0x05;
pub const L2CAP_DATA_PKT: u8 = 0x06;
pub const RFCOMM_DATA_PKT: u8 = 0x07;
pub const ATT_DATA_PKT: u8 = 0x08;
pub const SM_DATA_PKT: u8 = 0x09;
pub const SDP_CLIENT_PKT: u8 = 0x0A;
pub const BNEP_DATA_PKT: u8 = 0x0B;
pub const UCD_DATA_PKT: u8 = 0x0C;
pub const GOEP_DATA_PKT: u8 = 0x0D;
pub const PBAP_DATA_PKT: u8 = 0x0E;
pub const AVRCP_BROWSING_DATA_PKT: u8 = 0x0F;
pub const MAP_DATA_PKT: u8 = 0x10;
pub const PROVISIONING_DATA_PKT: u8 = 0x11;
pub const MESH_NETWORK_PKT: u8 = 0x12;
pub const MESH_BEACON_PKT: u8 = 0x13;
pub const LOG_MESSAGE_PKT: u8 = 0xFC;

// Header sizes (without the packet type tag)
pub const HCI_COMMAND_HEADER_SIZE: usize = 3;
pub const HCI_ACL_HEADER_SIZE: usize = 4;
pub const HCI_SCO_HEADER_SIZE: usize = 3;
pub const HCI_EVENT_HEADER_SIZE: usize = 2;

// Maximum size of HCI command parameters
pub const HCI_MAX_PARAM_LEN: usize = 255;

// ACL header bit fields
pub const ACL_HANDLE_MASK: u16 = 0x0FFF;
pub const ACL_PB_SHIFT: u16 = 12;
pub const ACL_BC_SHIFT: u16 = 14;

// Common OGF (Opcode Group Field) values
pub const OGF_LINK_CTL: u8 = 0x01;
pub const OGF_LINK_POLICY: u8 = 0x02;
pub const OGF_HOST_CTL: u8 = 0x03;
pub const OGF_INFO_PARAM: u8 = 0x04;
pub const OGF_STATUS_PARAM: u8 = 0x05;
pub const OGF_LE: u8 = 0x08;
pub const OGF_VENDOR: u8 = 0x3F;

// Link Control Commands (OGF: 0x01)
pub const OCF_INQUIRY: u16 = 0x0001;
pub const OCF_INQUIRY_CANCEL: u16 = 0x0002;
pub const OCF_CREATE_CONNECTION: u16 = 0x0005;
pub const OCF_DISCONNECT: u16 = 0x0006;
pub const OCF_CREATE_CONNECTION_CANCEL: u16 = 0x0008;
pub const OCF_ACCEPT_CONNECTION_REQUEST: u16 = 0x0009;
pub const OCF_REJECT_CONNECTION_REQUEST: u16 = 0x000A;
pub const OCF_LINK_KEY_REQUEST_REPLY: u16 = 0x000B;
pub const OCF_LINK_KEY_REQUEST_NEGATIVE_REPLY: u16 = 0x000C;
pub const OCF_PIN_CODE_REQUEST_REPLY: u16 = 0x000D;
pub const OCF_PIN_CODE_REQUEST_NEGATIVE_REPLY: u16 = 0x000E;
pub const OCF_AUTHENTICATION_REQUESTED: u16 = 0x0011;
pub const OCF_SET_CONNECTION_ENCRYPTION: u16 = 0x0013;
pub const OCF_REMOTE_NAME_REQUEST: u16 = 0x0019;
pub const OCF_REMOTE_NAME_REQUEST_CANCEL: u16 = 0x001A;
pub const OCF_IO_CAPABILITY_REQUEST_REPLY: u16 = 0x002B;
pub const OCF_USER_CONFIRMATION_REQUEST_REPLY: u16 = 0x002C;
pub const OCF_USER_CONFIRMATION_REQUEST_NEGATIVE_REPLY: u16 = 0x002D;
pub const OCF_USER_PASSKEY_REQUEST_REPLY: u16 = 0x002E;
pub const OCF_USER_PASSKEY_REQUEST_NEGATIVE_REPLY: u16 = 0x002F;
pub const OCF_IO_CAPABILITY_REQUEST_NEGATIVE_REPLY: u16 = 0x0034;

// Host Controller Commands (OGF: 0x03)
pub const OCF_SET_EVENT_MASK: u16 = 0x0001;
pub const OCF_RESET: u16 = 0x0003;
pub const OCF_WRITE_SCAN_ENABLE: u16 = 0x001A;
pub const OCF_WRITE_SIMPLE_PAIRING_MODE: u16 = 0x0056;

// Informational Parameters (OGF: 0x04)
pub const OCF_READ_LOCAL_VERSION: u16 = 0x0001;
pub const OCF_READ_BUFFER_SIZE: u16 = 0x0005;
pub const OCF_READ_BD_ADDR: u16 = 0x0009;

// LE Command OCF values (OGF: 0x08)
pub const OCF_LE_CREATE_CONNECTION: u16 = 0x000D;
pub const OCF_LE_CREATE_CONNECTION_CANCEL: u16 = 0x000E;
pub const OCF_LE_CONNECTION_UPDATE: u16 = 0x0013;

/// Build an opcode from its group and command fields
pub const fn opcode(ogf: u8, ocf: u16) -> u16 {
    ((ogf as u16) << 10) | (ocf & 0x03FF)
}

pub const OPCODE_NOP: u16 = 0x0000;
pub const OPCODE_RESET: u16 = opcode(OGF_HOST_CTL, OCF_RESET);
pub const OPCODE_INQUIRY: u16 = opcode(OGF_LINK_CTL, OCF_INQUIRY);
pub const OPCODE_INQUIRY_CANCEL: u16 = opcode(OGF_LINK_CTL, OCF_INQUIRY_CANCEL);
pub const OPCODE_CREATE_CONNECTION: u16 = opcode(OGF_LINK_CTL, OCF_CREATE_CONNECTION);
pub const OPCODE_DISCONNECT: u16 = opcode(OGF_LINK_CTL, OCF_DISCONNECT);
pub const OPCODE_REMOTE_NAME_REQUEST: u16 = opcode(OGF_LINK_CTL, OCF_REMOTE_NAME_REQUEST);
pub const OPCODE_AUTHENTICATION_REQUESTED: u16 = opcode(OGF_LINK_CTL, OCF_AUTHENTICATION_REQUESTED);
pub const OPCODE_LE_CREATE_CONNECTION: u16 = opcode(OGF_LE, OCF_LE_CREATE_CONNECTION);

// HCI Events
pub const EVT_INQUIRY_COMPLETE: u8 = 0x01;
pub const EVT_INQUIRY_RESULT: u8 = 0x02;
pub const EVT_CONN_COMPLETE: u8 = 0x03;
pub const EVT_CONN_REQUEST: u8 = 0x04;
pub const EVT_DISCONN_COMPLETE: u8 = 0x05;
pub const EVT_AUTH_COMPLETE: u8 = 0x06;
pub const EVT_REMOTE_NAME_REQ_COMPLETE: u8 = 0x07;
pub const EVT_ENCRYPTION_CHANGE: u8 = 0x08;
pub const EVT_CMD_COMPLETE: u8 = 0x0E;
pub const EVT_CMD_STATUS: u8 = 0x0F;
pub const EVT_HARDWARE_ERROR: u8 = 0x10;
pub const EVT_ROLE_CHANGE: u8 = 0x12;
pub const EVT_NUM_COMP_PKTS: u8 = 0x13;
pub const EVT_PIN_CODE_REQ: u8 = 0x16;
pub const EVT_LINK_KEY_REQ: u8 = 0x17;
pub const EVT_LINK_KEY_NOTIFY: u8 = 0x18;
pub const EVT_DATA_BUFFER_OVERFLOW: u8 = 0x1A;
pub const EVT_INQUIRY_RESULT_WITH_RSSI: u8 = 0x22;
pub const EVT_EXTENDED_INQUIRY_RESULT: u8 = 0x2F;
pub const EVT_ENCRYPTION_KEY_REFRESH_COMPLETE: u8 = 0x30;
pub const EVT_IO_CAPABILITY_REQUEST: u8 = 0x31;
pub const EVT_IO_CAPABILITY_RESPONSE: u8 = 0x32;
pub const EVT_USER_CONFIRMATION_REQUEST: u8 = 0x33;
pub const EVT_USER_PASSKEY_REQUEST: u8 = 0x34;
pub const EVT_SIMPLE_PAIRING_COMPLETE: u8 = 0x36;
pub const EVT_USER_PASSKEY_NOTIFICATION: u8 = 0x3B;
pub const EVT_LE_META_EVENT: u8 = 0x3E;
pub const EVT_VENDOR_SPECIFIC: u8 = 0xFF;

// LE Meta Events
pub const EVT_LE_CONN_COMPLETE: u8 = 0x01;
pub const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;
pub const EVT_LE_CONN_UPDATE_COMPLETE: u8 = 0x03;
pub const EVT_LE_ENHANCED_CONN_COMPLETE: u8 = 0x0A;

// Link types in Connection Complete / Connection Request
pub const LINK_TYPE_SCO: u8 = 0x00;
pub const LINK_TYPE_ACL: u8 = 0x01;
pub const LINK_TYPE_ESCO: u8 = 0x02;

// Write Scan Enable values
pub const SCAN_DISABLED: u8 = 0x00;
pub const SCAN_INQUIRY: u8 = 0x01;
pub const SCAN_PAGE: u8 = 0x02;

// Event mask enabling every classic event used by the host core
pub const DEFAULT_EVENT_MASK: u64 = 0x3DBF_F807_FFFB_FFFF;

// Accept Connection Request role values
pub const ROLE_BECOME_CENTRAL: u8 = 0x00;
pub const ROLE_REMAIN_PERIPHERAL: u8 = 0x01;
