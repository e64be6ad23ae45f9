//! Outgoing HCI commands

use crate::gap::{AuthRequirements, BdAddr, IoCapability};
use crate::hci::constants::*;

/// Commands issued by the host core
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HciCommand {
    // Link Control Commands (OGF: 0x01)
    Inquiry {
        lap: u32,
        length: u8,
        num_responses: u8,
    },
    InquiryCancel,
    CreateConnection {
        address: BdAddr,
        packet_type: u16,
        page_scan_repetition_mode: u8,
        clock_offset: u16,
        allow_role_switch: bool,
    },
    Disconnect {
        handle: u16,
        reason: u8,
    },
    CreateConnectionCancel {
        address: BdAddr,
    },
    AcceptConnectionRequest {
        address: BdAddr,
        role: u8,
    },
    RejectConnectionRequest {
        address: BdAddr,
        reason: u8,
    },
    LinkKeyRequestReply {
        address: BdAddr,
        key: [u8; 16],
    },
    LinkKeyRequestNegativeReply {
        address: BdAddr,
    },
    PinCodeRequestReply {
        address: BdAddr,
        pin: Vec<u8>,
    },
    PinCodeRequestNegativeReply {
        address: BdAddr,
    },
    AuthenticationRequested {
        handle: u16,
    },
    SetConnectionEncryption {
        handle: u16,
        enable: bool,
    },
    RemoteNameRequest {
        address: BdAddr,
        page_scan_repetition_mode: u8,
        clock_offset: u16,
    },
    RemoteNameRequestCancel {
        address: BdAddr,
    },
    IoCapabilityRequestReply {
        address: BdAddr,
        io_capability: IoCapability,
        oob_data_present: bool,
        auth_requirements: AuthRequirements,
    },
    IoCapabilityRequestNegativeReply {
        address: BdAddr,
        reason: u8,
    },
    UserConfirmationRequestReply {
        address: BdAddr,
    },
    UserConfirmationRequestNegativeReply {
        address: BdAddr,
    },
    UserPasskeyRequestReply {
        address: BdAddr,
        passkey: u32,
    },
    UserPasskeyRequestNegativeReply {
        address: BdAddr,
    },

    // Host Controller Commands (OGF: 0x03)
    SetEventMask {
        event_mask: u64,
    },
    Reset,
    WriteScanEnable {
        scan_enable: u8,
    },
    WriteSimplePairingMode {
        enabled: bool,
    },

    // Informational Parameters (OGF: 0x04)
    ReadLocalVersion,
    ReadBufferSize,
    ReadBdAddr,

    // LE Commands (OGF: 0x08)
    LeCreateConnection {
        peer_address: BdAddr,
        peer_address_type: u8,
    },
    LeCreateConnectionCancel,
    LeConnectionUpdate {
        handle: u16,
        interval_min: u16,
        interval_max: u16,
        latency: u16,
        supervision_timeout: u16,
    },
}

impl HciCommand {
    /// Get the OGF and OCF for this command
    pub fn opcode_parts(&self) -> (u8, u16) {
        match self {
            Self::Inquiry { .. } => (OGF_LINK_CTL, OCF_INQUIRY),
            Self::InquiryCancel => (OGF_LINK_CTL, OCF_INQUIRY_CANCEL),
            Self::CreateConnection { .. } => (OGF_LINK_CTL, OCF_CREATE_CONNECTION),
            Self::Disconnect { .. } => (OGF_LINK_CTL, OCF_DISCONNECT),
            Self::CreateConnectionCancel { .. } => (OGF_LINK_CTL, OCF_CREATE_CONNECTION_CANCEL),
            Self::AcceptConnectionRequest { .. } => (OGF_LINK_CTL, OCF_ACCEPT_CONNECTION_REQUEST),
            Self::RejectConnectionRequest { .. } => (OGF_LINK_CTL, OCF_REJECT_CONNECTION_REQUEST),
            Self::LinkKeyRequestReply { .. } => (OGF_LINK_CTL, OCF_LINK_KEY_REQUEST_REPLY),
            Self::LinkKeyRequestNegativeReply { .. } => {
                (OGF_LINK_CTL, OCF_LINK_KEY_REQUEST_NEGATIVE_REPLY)
            }
            Self::PinCodeRequestReply { .. } => (OGF_LINK_CTL, OCF_PIN_CODE_REQUEST_REPLY),
            Self::PinCodeRequestNegativeReply { .. } => {
                (OGF_LINK_CTL, OCF_PIN_CODE_REQUEST_NEGATIVE_REPLY)
            }
            Self::AuthenticationRequested { .. } => (OGF_LINK_CTL, OCF_AUTHENTICATION_REQUESTED),
            Self::SetConnectionEncryption { .. } => (OGF_LINK_CTL, OCF_SET_CONNECTION_ENCRYPTION),
            Self::RemoteNameRequest { .. } => (OGF_LINK_CTL, OCF_REMOTE_NAME_REQUEST),
            Self::RemoteNameRequestCancel { .. } => (OGF_LINK_CTL, OCF_REMOTE_NAME_REQUEST_CANCEL),
            Self::IoCapabilityRequestReply { .. } => (OGF_LINK_CTL, OCF_IO_CAPABILITY_REQUEST_REPLY),
            Self::IoCapabilityRequestNegativeReply { .. } => {
                (OGF_LINK_CTL, OCF_IO_CAPABILITY_REQUEST_NEGATIVE_REPLY)
            }
            Self::UserConfirmationRequestReply { .. } => {
                (OGF_LINK_CTL, OCF_USER_CONFIRMATION_REQUEST_REPLY)
            }
            Self::UserConfirmationRequestNegativeReply { .. } => {
                (OGF_LINK_CTL, OCF_USER_CONFIRMATION_REQUEST_NEGATIVE_REPLY)
            }
            Self::UserPasskeyRequestReply { .. } => (OGF_LINK_CTL, OCF_USER_PASSKEY_REQUEST_REPLY),
            Self::UserPasskeyRequestNegativeReply { .. } => {
                (OGF_LINK_CTL, OCF_USER_PASSKEY_REQUEST_NEGATIVE_REPLY)
            }

            Self::SetEventMask { .. } => (OGF_HOST_CTL, OCF_SET_EVENT_MASK),
            Self::Reset => (OGF_HOST_CTL, OCF_RESET),
            Self::WriteScanEnable { .. } => (OGF_HOST_CTL, OCF_WRITE_SCAN_ENABLE),
            Self::WriteSimplePairingMode { .. } => (OGF_HOST_CTL, OCF_WRITE_SIMPLE_PAIRING_MODE),

            Self::ReadLocalVersion => (OGF_INFO_PARAM, OCF_READ_LOCAL_VERSION),
            Self::ReadBufferSize => (OGF_INFO_PARAM, OCF_READ_BUFFER_SIZE),
            Self::ReadBdAddr => (OGF_INFO_PARAM, OCF_READ_BD_ADDR),

            Self::LeCreateConnection { .. } => (OGF_LE, OCF_LE_CREATE_CONNECTION),
            Self::LeCreateConnectionCancel => (OGF_LE, OCF_LE_CREATE_CONNECTION_CANCEL),
            Self::LeConnectionUpdate { .. } => (OGF_LE, OCF_LE_CONNECTION_UPDATE),
        }
    }

    /// Combined 16-bit opcode
    pub fn opcode(&self) -> u16 {
        let (ogf, ocf) = self.opcode_parts();
        opcode(ogf, ocf)
    }

    /// Raw parameter bytes
    fn parameters(&self) -> Vec<u8> {
        let mut params = Vec::new();

        match self {
            Self::InquiryCancel
            | Self::Reset
            | Self::ReadLocalVersion
            | Self::ReadBufferSize
            | Self::ReadBdAddr
            | Self::LeCreateConnectionCancel => {}

            Self::Inquiry { lap, length, num_responses } => {
                params.extend_from_slice(&lap.to_le_bytes()[..3]);
                params.push(*length);
                params.push(*num_responses);
            }

            Self::CreateConnection {
                address,
                packet_type,
                page_scan_repetition_mode,
                clock_offset,
                allow_role_switch,
            } => {
                params.extend_from_slice(address.as_slice());
                params.extend_from_slice(&packet_type.to_le_bytes());
                params.push(*page_scan_repetition_mode);
                params.push(0x00); // reserved
                params.extend_from_slice(&clock_offset.to_le_bytes());
                params.push(*allow_role_switch as u8);
            }

            Self::Disconnect { handle, reason } => {
                params.extend_from_slice(&handle.to_le_bytes());
                params.push(*reason);
            }

            Self::CreateConnectionCancel { address }
            | Self::LinkKeyRequestNegativeReply { address }
            | Self::PinCodeRequestNegativeReply { address }
            | Self::RemoteNameRequestCancel { address }
            | Self::UserConfirmationRequestReply { address }
            | Self::UserConfirmationRequestNegativeReply { address }
            | Self::UserPasskeyRequestNegativeReply { address } => {
                params.extend_from_slice(address.as_slice());
            }

            Self::AcceptConnectionRequest { address, role } => {
                params.extend_from_slice(address.as_slice());
                params.push(*role);
            }

            Self::RejectConnectionRequest { address, reason }
            | Self::IoCapabilityRequestNegativeReply { address, reason } => {
                params.extend_from_slice(address.as_slice());
                params.push(*reason);
            }

            Self::LinkKeyRequestReply { address, key } => {
                params.extend_from_slice(address.as_slice());
                params.extend_from_slice(key);
            }

            Self::PinCodeRequestReply { address, pin } => {
                let len = pin.len().min(16);
                params.extend_from_slice(address.as_slice());
                params.push(len as u8);
                params.extend_from_slice(&pin[..len]);
                params.resize(6 + 1 + 16, 0);
            }

            Self::AuthenticationRequested { handle } => {
                params.extend_from_slice(&handle.to_le_bytes());
            }

            Self::SetConnectionEncryption { handle, enable } => {
                params.extend_from_slice(&handle.to_le_bytes());
                params.push(*enable as u8);
            }

            Self::RemoteNameRequest {
                address,
                page_scan_repetition_mode,
                clock_offset,
            } => {
                params.extend_from_slice(address.as_slice());
                params.push(*page_scan_repetition_mode);
                params.push(0x00); // reserved
                params.extend_from_slice(&clock_offset.to_le_bytes());
            }

            Self::IoCapabilityRequestReply {
                address,
                io_capability,
                oob_data_present,
                auth_requirements,
            } => {
                params.extend_from_slice(address.as_slice());
                params.push(*io_capability as u8);
                params.push(*oob_data_present as u8);
                params.push(auth_requirements.bits());
            }

            Self::UserPasskeyRequestReply { address, passkey } => {
                params.extend_from_slice(address.as_slice());
                params.extend_from_slice(&passkey.to_le_bytes());
            }

            Self::SetEventMask { event_mask } => {
                params.extend_from_slice(&event_mask.to_le_bytes());
            }

            Self::WriteScanEnable { scan_enable } => params.push(*scan_enable),

            Self::WriteSimplePairingMode { enabled } => params.push(*enabled as u8),

            Self::LeCreateConnection {
                peer_address,
                peer_address_type,
            } => {
                use crate::gap::constants::*;
                params.extend_from_slice(&LE_SCAN_INTERVAL.to_le_bytes());
                params.extend_from_slice(&LE_SCAN_WINDOW.to_le_bytes());
                params.push(0x00); // no filter accept list
                params.push(*peer_address_type);
                params.extend_from_slice(peer_address.as_slice());
                params.push(0x00); // own address: public
                params.extend_from_slice(&LE_CONN_INTERVAL_MIN.to_le_bytes());
                params.extend_from_slice(&LE_CONN_INTERVAL_MAX.to_le_bytes());
                params.extend_from_slice(&LE_CONN_LATENCY.to_le_bytes());
                params.extend_from_slice(&LE_SUPERVISION_TIMEOUT.to_le_bytes());
                params.extend_from_slice(&LE_MIN_CE_LENGTH.to_le_bytes());
                params.extend_from_slice(&LE_MAX_CE_LENGTH.to_le_bytes());
            }

            Self::LeConnectionUpdate {
                handle,
                interval_min,
                interval_max,
                latency,
                supervision_timeout,
            } => {
                use crate::gap::constants::{LE_MAX_CE_LENGTH, LE_MIN_CE_LENGTH};
                params.extend_from_slice(&handle.to_le_bytes());
                params.extend_from_slice(&interval_min.to_le_bytes());
                params.extend_from_slice(&interval_max.to_le_bytes());
                params.extend_from_slice(&latency.to_le_bytes());
                params.extend_from_slice(&supervision_timeout.to_le_bytes());
                params.extend_from_slice(&LE_MIN_CE_LENGTH.to_le_bytes());
                params.extend_from_slice(&LE_MAX_CE_LENGTH.to_le_bytes());
            }
        }

        params
    }

    /// Convert the command to a raw HCI packet, including the type tag
    pub fn to_packet(&self) -> Vec<u8> {
        let params = self.parameters();

        let mut packet = Vec::with_capacity(1 + HCI_COMMAND_HEADER_SIZE + params.len());
        packet.push(HCI_COMMAND_PKT);
        packet.extend_from_slice(&self.opcode().to_le_bytes());
        packet.push(params.len().min(HCI_MAX_PARAM_LEN) as u8);
        packet.extend_from_slice(&params);
        packet
    }
}
