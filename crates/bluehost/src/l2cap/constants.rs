//! L2CAP constants
//!
//! Channel identifiers, signaling codes, result codes and frame layout
//! values from the Bluetooth Core Specification Vol 3, Part A.

// Frame layout
pub const L2CAP_BASIC_HEADER_SIZE: usize = 4;
pub const L2CAP_COMMAND_HEADER_SIZE: usize = 4;
pub const L2CAP_CONTROL_SIZE: usize = 2;
pub const L2CAP_SDU_LENGTH_SIZE: usize = 2;
pub const L2CAP_FCS_SIZE: usize = 2;

// Fixed channel identifiers
pub const L2CAP_NULL_CID: u16 = 0x0000;
pub const L2CAP_SIGNALING_CID: u16 = 0x0001;
pub const L2CAP_CONNECTIONLESS_CID: u16 = 0x0002;
pub const L2CAP_ATTRIBUTE_PROTOCOL_CID: u16 = 0x0004;
pub const L2CAP_LE_SIGNALING_CID: u16 = 0x0005;
pub const L2CAP_SECURITY_MANAGER_CID: u16 = 0x0006;
pub const L2CAP_BR_EDR_SECURITY_MANAGER_CID: u16 = 0x0007;

// Dynamically allocated channel identifiers
pub const L2CAP_DYNAMIC_CID_MIN: u16 = 0x0040;
pub const L2CAP_DYNAMIC_CID_MAX: u16 = 0xFFFF;
pub const L2CAP_LE_DYNAMIC_CID_MAX: u16 = 0x007F;

// Signaling command codes
pub const L2CAP_COMMAND_REJECT: u8 = 0x01;
pub const L2CAP_CONNECTION_REQUEST: u8 = 0x02;
pub const L2CAP_CONNECTION_RESPONSE: u8 = 0x03;
pub const L2CAP_CONFIGURE_REQUEST: u8 = 0x04;
pub const L2CAP_CONFIGURE_RESPONSE: u8 = 0x05;
pub const L2CAP_DISCONNECTION_REQUEST: u8 = 0x06;
pub const L2CAP_DISCONNECTION_RESPONSE: u8 = 0x07;
pub const L2CAP_ECHO_REQUEST: u8 = 0x08;
pub const L2CAP_ECHO_RESPONSE: u8 = 0x09;
pub const L2CAP_INFORMATION_REQUEST: u8 = 0x0A;
pub const L2CAP_INFORMATION_RESPONSE: u8 = 0x0B;
pub const L2CAP_CONNECTION_PARAMETER_UPDATE_REQUEST: u8 = 0x12;
pub const L2CAP_CONNECTION_PARAMETER_UPDATE_RESPONSE: u8 = 0x13;
pub const L2CAP_LE_CREDIT_BASED_CONNECTION_REQUEST: u8 = 0x14;
pub const L2CAP_LE_CREDIT_BASED_CONNECTION_RESPONSE: u8 = 0x15;
pub const L2CAP_LE_FLOW_CONTROL_CREDIT: u8 = 0x16;

// Command reject reasons
pub const L2CAP_REJECT_NOT_UNDERSTOOD: u16 = 0x0000;
pub const L2CAP_REJECT_MTU_EXCEEDED: u16 = 0x0001;
pub const L2CAP_REJECT_INVALID_CID: u16 = 0x0002;

// Connection response results
pub const L2CAP_RESULT_SUCCESS: u16 = 0x0000;
pub const L2CAP_RESULT_PENDING: u16 = 0x0001;
pub const L2CAP_RESULT_PSM_NOT_SUPPORTED: u16 = 0x0002;
pub const L2CAP_RESULT_SECURITY_BLOCK: u16 = 0x0003;
pub const L2CAP_RESULT_NO_RESOURCES: u16 = 0x0004;
pub const L2CAP_RESULT_INVALID_SCID: u16 = 0x0006;
pub const L2CAP_RESULT_SCID_ALREADY_ALLOCATED: u16 = 0x0007;

// LE credit based connection response results
pub const L2CAP_LE_RESULT_SPSM_NOT_SUPPORTED: u16 = 0x0002;
pub const L2CAP_LE_RESULT_NO_RESOURCES: u16 = 0x0004;
pub const L2CAP_LE_RESULT_INSUFFICIENT_AUTHENTICATION: u16 = 0x0005;
pub const L2CAP_LE_RESULT_INSUFFICIENT_AUTHORIZATION: u16 = 0x0006;
pub const L2CAP_LE_RESULT_INSUFFICIENT_ENCRYPTION: u16 = 0x0008;
pub const L2CAP_LE_RESULT_INVALID_SCID: u16 = 0x0009;
pub const L2CAP_LE_RESULT_SCID_ALREADY_ALLOCATED: u16 = 0x000A;
pub const L2CAP_LE_RESULT_UNACCEPTABLE_PARAMETERS: u16 = 0x000B;

// Configure response results
pub const L2CAP_CONF_SUCCESS: u16 = 0x0000;
pub const L2CAP_CONF_UNACCEPTABLE_PARAMS: u16 = 0x0001;
pub const L2CAP_CONF_REJECTED: u16 = 0x0002;
pub const L2CAP_CONF_UNKNOWN_OPTIONS: u16 = 0x0003;
pub const L2CAP_CONF_PENDING: u16 = 0x0004;

/// Continuation flag of configure request/response
pub const L2CAP_CONF_FLAG_CONTINUATION: u16 = 0x0001;

// Configuration option types
pub const L2CAP_CONF_MTU: u8 = 0x01;
pub const L2CAP_CONF_FLUSH_TIMEOUT: u8 = 0x02;
pub const L2CAP_CONF_QOS: u8 = 0x03;
pub const L2CAP_CONF_RFC: u8 = 0x04;
pub const L2CAP_CONF_FCS: u8 = 0x05;
pub const L2CAP_CONF_EXT_FLOW_SPEC: u8 = 0x06;
pub const L2CAP_CONF_EXT_WINDOW: u8 = 0x07;
pub const L2CAP_CONF_HINT: u8 = 0x80;

// FCS option values
pub const L2CAP_FCS_NONE: u8 = 0x00;
pub const L2CAP_FCS_CRC16: u8 = 0x01;

// Information request types and results
pub const L2CAP_INFO_CONNECTIONLESS_MTU: u16 = 0x0001;
pub const L2CAP_INFO_EXTENDED_FEATURES: u16 = 0x0002;
pub const L2CAP_INFO_FIXED_CHANNELS: u16 = 0x0003;
pub const L2CAP_INFO_SUCCESS: u16 = 0x0000;
pub const L2CAP_INFO_NOT_SUPPORTED: u16 = 0x0001;

// Extended feature mask bits
pub const L2CAP_FEAT_FLOW_CONTROL: u32 = 0x0000_0001;
pub const L2CAP_FEAT_RETRANSMISSION: u32 = 0x0000_0002;
pub const L2CAP_FEAT_BIDIR_QOS: u32 = 0x0000_0004;
pub const L2CAP_FEAT_ENHANCED_RETRANSMISSION: u32 = 0x0000_0008;
pub const L2CAP_FEAT_STREAMING: u32 = 0x0000_0010;
pub const L2CAP_FEAT_FCS: u32 = 0x0000_0020;
pub const L2CAP_FEAT_EXT_FLOW_SPEC: u32 = 0x0000_0040;
pub const L2CAP_FEAT_FIXED_CHANNELS: u32 = 0x0000_0080;
pub const L2CAP_FEAT_EXT_WINDOW: u32 = 0x0000_0100;

/// Features advertised in response to an extended features request
pub const L2CAP_LOCAL_FEATURES: u32 = L2CAP_FEAT_ENHANCED_RETRANSMISSION
    | L2CAP_FEAT_STREAMING
    | L2CAP_FEAT_FCS
    | L2CAP_FEAT_FIXED_CHANNELS;

/// Fixed channels supported on BR/EDR: signaling and connectionless
pub const L2CAP_LOCAL_FIXED_CHANNELS: u64 = (1 << L2CAP_SIGNALING_CID) | (1 << L2CAP_CONNECTIONLESS_CID);

// MTU values
pub const L2CAP_MIN_MTU: u16 = 48;
pub const L2CAP_DEFAULT_MTU: u16 = 672;
pub const L2CAP_LE_MIN_MTU: u16 = 23;
pub const L2CAP_LE_DEFAULT_MTU: u16 = 512;
pub const L2CAP_LE_DEFAULT_MPS: u16 = 247;
pub const L2CAP_DEFAULT_FLUSH_TIMEOUT: u16 = 0xFFFF;

// LE credits
pub const L2CAP_LE_DEFAULT_CREDITS: u16 = 10;
pub const L2CAP_LE_MAX_CREDITS: u16 = 0xFFFF;

// Enhanced control field layout
pub const L2CAP_CTRL_FRAME_TYPE_MASK: u16 = 0x0001;
pub const L2CAP_CTRL_TXSEQ_MASK: u16 = 0x007E;
pub const L2CAP_CTRL_TXSEQ_SHIFT: u16 = 1;
pub const L2CAP_CTRL_SUPERVISORY_MASK: u16 = 0x000C;
pub const L2CAP_CTRL_SUPERVISORY_SHIFT: u16 = 2;
pub const L2CAP_CTRL_POLL: u16 = 0x0010;
pub const L2CAP_CTRL_FINAL: u16 = 0x0080;
pub const L2CAP_CTRL_REQSEQ_MASK: u16 = 0x3F00;
pub const L2CAP_CTRL_REQSEQ_SHIFT: u16 = 8;
pub const L2CAP_CTRL_SAR_MASK: u16 = 0xC000;
pub const L2CAP_CTRL_SAR_SHIFT: u16 = 14;

/// Sequence numbers of the enhanced control field wrap at 64
pub const L2CAP_SEQ_MODULO: u8 = 64;

// Supervisory functions
pub const L2CAP_SUPERVISORY_RR: u8 = 0x00;
pub const L2CAP_SUPERVISORY_REJ: u8 = 0x01;
pub const L2CAP_SUPERVISORY_RNR: u8 = 0x02;
pub const L2CAP_SUPERVISORY_SREJ: u8 = 0x03;

// Segmentation and reassembly
pub const L2CAP_SAR_UNSEGMENTED: u8 = 0x00;
pub const L2CAP_SAR_START: u8 = 0x01;
pub const L2CAP_SAR_END: u8 = 0x02;
pub const L2CAP_SAR_CONTINUATION: u8 = 0x03;

// Enhanced retransmission defaults
pub const L2CAP_ERTM_DEFAULT_TX_WINDOW: u8 = 8;
pub const L2CAP_ERTM_MAX_TX_WINDOW: u8 = 63;
pub const L2CAP_ERTM_DEFAULT_MAX_TRANSMIT: u8 = 3;
pub const L2CAP_ERTM_RETRANSMISSION_TIMEOUT_MS: u16 = 2000;
pub const L2CAP_ERTM_MONITOR_TIMEOUT_MS: u16 = 12000;
pub const L2CAP_ERTM_DEFAULT_MPS: u16 = 1010;

// LE connection parameter limits
pub const L2CAP_LE_CONN_INTERVAL_MIN: u16 = 0x0006;
pub const L2CAP_LE_CONN_INTERVAL_MAX: u16 = 0x0C80;
pub const L2CAP_LE_CONN_LATENCY_MAX: u16 = 0x01F3;
pub const L2CAP_LE_SUPERVISION_TIMEOUT_MIN: u16 = 0x000A;
pub const L2CAP_LE_SUPERVISION_TIMEOUT_MAX: u16 = 0x0C80;

// Connection parameter update results
pub const L2CAP_CONN_PARAM_ACCEPTED: u16 = 0x0000;
pub const L2CAP_CONN_PARAM_REJECTED: u16 = 0x0001;
