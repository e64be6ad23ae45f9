//! Typed HCI events
//!
//! Built on top of [`FieldView`]; variable-position fields are located from
//! the length fields that precede them.

use crate::error::Result;
use crate::gap::{eir_local_name, BdAddr, DiscoveredDevice, REMOTE_NAME_MAX_LEN};
use crate::hci::constants::*;
use crate::hci::packet::{EventPacket, FieldView};

/// Per-handle entry of a Number Of Completed Packets event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletedPackets {
    pub handle: u16,
    pub count: u16,
}

/// Decoded HCI event
#[derive(Debug, Clone)]
pub enum Event<'a> {
    InquiryComplete {
        status: u8,
    },
    /// Standard, RSSI and extended inquiry results
    InquiryResult(Vec<DiscoveredDevice>),
    ConnectionComplete {
        status: u8,
        handle: u16,
        address: BdAddr,
        link_type: u8,
        encryption_enabled: bool,
    },
    ConnectionRequest {
        address: BdAddr,
        class_of_device: u32,
        link_type: u8,
    },
    DisconnectionComplete {
        status: u8,
        handle: u16,
        reason: u8,
    },
    AuthenticationComplete {
        status: u8,
        handle: u16,
    },
    RemoteNameRequestComplete {
        status: u8,
        address: BdAddr,
        name: String,
    },
    EncryptionChange {
        status: u8,
        handle: u16,
        enabled: bool,
    },
    CommandComplete {
        num_packets: u8,
        opcode: u16,
        return_params: FieldView<'a>,
    },
    CommandStatus {
        status: u8,
        num_packets: u8,
        opcode: u16,
    },
    HardwareError {
        code: u8,
    },
    NumberOfCompletedPackets(Vec<CompletedPackets>),
    PinCodeRequest {
        address: BdAddr,
    },
    LinkKeyRequest {
        address: BdAddr,
    },
    LinkKeyNotification {
        address: BdAddr,
        key: [u8; 16],
        key_type: u8,
    },
    IoCapabilityRequest {
        address: BdAddr,
    },
    IoCapabilityResponse {
        address: BdAddr,
        io_capability: u8,
        oob_data_present: u8,
        auth_requirements: u8,
    },
    UserConfirmationRequest {
        address: BdAddr,
        numeric_value: u32,
    },
    UserPasskeyRequest {
        address: BdAddr,
    },
    UserPasskeyNotification {
        address: BdAddr,
        passkey: u32,
    },
    SimplePairingComplete {
        status: u8,
        address: BdAddr,
    },
    LeConnectionComplete {
        status: u8,
        handle: u16,
        role: u8,
        address_type: u8,
        address: BdAddr,
    },
    /// Assigned or unassigned event the core does not interpret
    Unknown {
        code: u8,
        params: FieldView<'a>,
    },
}

impl<'a> Event<'a> {
    /// Decode the parameters of an event packet
    pub fn parse(packet: &EventPacket<'a>) -> Result<Self> {
        let p = packet.params;

        let event = match packet.code {
            EVT_INQUIRY_COMPLETE => Event::InquiryComplete { status: p.u8(0)? },
            EVT_INQUIRY_RESULT => Event::InquiryResult(parse_inquiry_result(&p, false)?),
            EVT_INQUIRY_RESULT_WITH_RSSI => Event::InquiryResult(parse_inquiry_result(&p, true)?),
            EVT_EXTENDED_INQUIRY_RESULT => Event::InquiryResult(parse_extended_inquiry_result(&p)?),
            EVT_CONN_COMPLETE => Event::ConnectionComplete {
                status: p.u8(0)?,
                handle: p.u16(1)? & ACL_HANDLE_MASK,
                address: p.bd_addr(3)?,
                link_type: p.u8(9)?,
                encryption_enabled: p.u8(10)? != 0,
            },
            EVT_CONN_REQUEST => Event::ConnectionRequest {
                address: p.bd_addr(0)?,
                class_of_device: p.u24(6)?,
                link_type: p.u8(9)?,
            },
            EVT_DISCONN_COMPLETE => Event::DisconnectionComplete {
                status: p.u8(0)?,
                handle: p.u16(1)? & ACL_HANDLE_MASK,
                reason: p.u8(3)?,
            },
            EVT_AUTH_COMPLETE => Event::AuthenticationComplete {
                status: p.u8(0)?,
                handle: p.u16(1)? & ACL_HANDLE_MASK,
            },
            EVT_REMOTE_NAME_REQ_COMPLETE => {
                let status = p.u8(0)?;
                let address = p.bd_addr(1)?;
                // Some controllers truncate the padding; take what is there
                let raw = p.rest(7)?;
                let raw = &raw[..raw.len().min(REMOTE_NAME_MAX_LEN)];
                let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                Event::RemoteNameRequestComplete {
                    status,
                    address,
                    name: String::from_utf8_lossy(&raw[..end]).into_owned(),
                }
            }
            EVT_ENCRYPTION_CHANGE => Event::EncryptionChange {
                status: p.u8(0)?,
                handle: p.u16(1)? & ACL_HANDLE_MASK,
                enabled: p.u8(3)? != 0,
            },
            EVT_CMD_COMPLETE => Event::CommandComplete {
                num_packets: p.u8(0)?,
                opcode: p.u16(1)?,
                return_params: p.view_from(3)?,
            },
            EVT_CMD_STATUS => Event::CommandStatus {
                status: p.u8(0)?,
                num_packets: p.u8(1)?,
                opcode: p.u16(2)?,
            },
            EVT_HARDWARE_ERROR => Event::HardwareError { code: p.u8(0)? },
            EVT_NUM_COMP_PKTS => {
                let num_handles = p.u8(0)? as usize;
                p.require(1 + num_handles * 4)?;
                let mut entries = Vec::with_capacity(num_handles);
                for i in 0..num_handles {
                    entries.push(CompletedPackets {
                        handle: p.u16(1 + i * 4)? & ACL_HANDLE_MASK,
                        count: p.u16(3 + i * 4)?,
                    });
                }
                Event::NumberOfCompletedPackets(entries)
            }
            EVT_PIN_CODE_REQ => Event::PinCodeRequest { address: p.bd_addr(0)? },
            EVT_LINK_KEY_REQ => Event::LinkKeyRequest { address: p.bd_addr(0)? },
            EVT_LINK_KEY_NOTIFY => {
                let mut key = [0u8; 16];
                key.copy_from_slice(p.bytes(6, 16)?);
                Event::LinkKeyNotification {
                    address: p.bd_addr(0)?,
                    key,
                    key_type: p.u8(22)?,
                }
            }
            EVT_IO_CAPABILITY_REQUEST => Event::IoCapabilityRequest { address: p.bd_addr(0)? },
            EVT_IO_CAPABILITY_RESPONSE => Event::IoCapabilityResponse {
                address: p.bd_addr(0)?,
                io_capability: p.u8(6)?,
                oob_data_present: p.u8(7)?,
                auth_requirements: p.u8(8)?,
            },
            EVT_USER_CONFIRMATION_REQUEST => Event::UserConfirmationRequest {
                address: p.bd_addr(0)?,
                numeric_value: p.u32(6)?,
            },
            EVT_USER_PASSKEY_REQUEST => Event::UserPasskeyRequest { address: p.bd_addr(0)? },
            EVT_USER_PASSKEY_NOTIFICATION => Event::UserPasskeyNotification {
                address: p.bd_addr(0)?,
                passkey: p.u32(6)?,
            },
            EVT_SIMPLE_PAIRING_COMPLETE => Event::SimplePairingComplete {
                status: p.u8(0)?,
                address: p.bd_addr(1)?,
            },
            EVT_LE_META_EVENT => match p.u8(0)? {
                EVT_LE_CONN_COMPLETE | EVT_LE_ENHANCED_CONN_COMPLETE => Event::LeConnectionComplete {
                    status: p.u8(1)?,
                    handle: p.u16(2)? & ACL_HANDLE_MASK,
                    role: p.u8(4)?,
                    address_type: p.u8(5)?,
                    address: p.bd_addr(6)?,
                },
                _ => Event::Unknown { code: packet.code, params: p },
            },
            code => Event::Unknown { code, params: p },
        };

        Ok(event)
    }
}

// Both inquiry result formats use 14 bytes per response
const INQUIRY_RESPONSE_SIZE: usize = 14;

/// Parse Inquiry Result / Inquiry Result with RSSI.
///
/// Parameters are arrays of `num_responses` entries laid out one parameter
/// after another, so each field's offset depends on the response count.
fn parse_inquiry_result(p: &FieldView<'_>, with_rssi: bool) -> Result<Vec<DiscoveredDevice>> {
    let n = p.u8(0)? as usize;
    p.require(1 + n * INQUIRY_RESPONSE_SIZE)?;

    let addr_base = 1;
    let psrm_base = addr_base + 6 * n;
    // Inquiry Result carries two reserved bytes, the RSSI variant one
    let cod_base = psrm_base + if with_rssi { 2 * n } else { 3 * n };
    let clock_base = cod_base + 3 * n;
    let rssi_base = clock_base + 2 * n;

    let mut devices = Vec::with_capacity(n);
    for i in 0..n {
        devices.push(DiscoveredDevice {
            address: p.bd_addr(addr_base + 6 * i)?,
            page_scan_repetition_mode: p.u8(psrm_base + i)?,
            class_of_device: p.u24(cod_base + 3 * i)?,
            clock_offset: p.u16(clock_base + 2 * i)? & 0x7FFF,
            rssi: if with_rssi { Some(p.i8(rssi_base + i)?) } else { None },
            name: None,
        });
    }
    Ok(devices)
}

fn parse_extended_inquiry_result(p: &FieldView<'_>) -> Result<Vec<DiscoveredDevice>> {
    // Always a single response followed by 240 bytes of EIR data
    let eir = p.rest(15)?;
    Ok(vec![DiscoveredDevice {
        address: p.bd_addr(1)?,
        page_scan_repetition_mode: p.u8(7)?,
        class_of_device: p.u24(9)?,
        clock_offset: p.u16(12)? & 0x7FFF,
        rssi: Some(p.i8(14)?),
        name: eir_local_name(eir),
    }])
}
