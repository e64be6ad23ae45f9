// Address types
pub const PUBLIC_DEVICE_ADDRESS: u8 = 0x00;
pub const RANDOM_DEVICE_ADDRESS: u8 = 0x01;
pub const PUBLIC_IDENTITY_ADDRESS: u8 = 0x02;
pub const RANDOM_IDENTITY_ADDRESS: u8 = 0x03;

// Inquiry access codes
pub const GAP_IAC_GENERAL_INQUIRY: u32 = 0x9E8B33;
pub const GAP_IAC_LIMITED_INQUIRY: u32 = 0x9E8B00;

// Inquiry length in 1.28 s units
pub const GAP_INQUIRY_DURATION_DEFAULT: u8 = 0x08;
pub const GAP_INQUIRY_DURATION_MAX: u8 = 0x30;

// Packet types allowed on classic ACL links (DM1/DH1/DM3/DH3/DM5/DH5)
pub const ACL_PACKET_TYPES_ALL: u16 = 0xCC18;

// Page scan repetition mode R1 and clock offset used without inquiry data
pub const PAGE_SCAN_MODE_R1: u8 = 0x01;

// LE Connection parameters
pub const LE_SCAN_INTERVAL: u16 = 0x0060;
pub const LE_SCAN_WINDOW: u16 = 0x0030;
pub const LE_CONN_INTERVAL_MIN: u16 = 0x0018;
pub const LE_CONN_INTERVAL_MAX: u16 = 0x0028;
pub const LE_CONN_LATENCY: u16 = 0x0000;
pub const LE_SUPERVISION_TIMEOUT: u16 = 0x01F4;
pub const LE_MIN_CE_LENGTH: u16 = 0x0000;
pub const LE_MAX_CE_LENGTH: u16 = 0x0000;

// Extended inquiry response data types
pub const EIR_TYPE_FLAGS: u8 = 0x01;
pub const EIR_TYPE_16BIT_SERVICE_UUID_PARTIAL: u8 = 0x02;
pub const EIR_TYPE_16BIT_SERVICE_UUID_COMPLETE: u8 = 0x03;
pub const EIR_TYPE_SHORT_LOCAL_NAME: u8 = 0x08;
pub const EIR_TYPE_COMPLETE_LOCAL_NAME: u8 = 0x09;
pub const EIR_TYPE_TX_POWER_LEVEL: u8 = 0x0A;
pub const EIR_TYPE_DEVICE_ID: u8 = 0x10;
pub const EIR_TYPE_MANUFACTURER_SPECIFIC: u8 = 0xFF;

// Remote names are at most 248 bytes, NUL padded
pub const REMOTE_NAME_MAX_LEN: usize = 248;
