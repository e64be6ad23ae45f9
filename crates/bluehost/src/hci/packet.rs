//! HCI packet decoding
//!
//! Raw buffers are interpreted as views over the caller's bytes. Every
//! accessor is bounds checked and reports `MalformedPacket` instead of
//! reading past the end of the buffer.

use crate::error::{Error, Result};
use crate::gap::BdAddr;
use crate::hci::constants::*;
use byteorder::{ByteOrder, LittleEndian};

/// Packet type tag preceding every buffer on the transport boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Command,
    Acl,
    Sco,
    Event,
    DaemonEvent,
    L2capData,
    RfcommData,
    AttData,
    SmData,
    SdpClient,
    BnepData,
    UcdData,
    GoepData,
    PbapData,
    AvrcpBrowsingData,
    MapData,
    Provisioning,
    MeshNetwork,
    MeshBeacon,
    LogMessage,
    /// A tag outside the known set, passed through untouched
    Other(u8),
}

impl PacketType {
    pub fn from_u8(tag: u8) -> Self {
        match tag {
            HCI_COMMAND_PKT => PacketType::Command,
            HCI_ACL_PKT => PacketType::Acl,
            HCI_SCO_PKT => PacketType::Sco,
            HCI_EVENT_PKT => PacketType::Event,
            DAEMON_EVENT_PKT => PacketType::DaemonEvent,
            L2CAP_DATA_PKT => PacketType::L2capData,
            RFCOMM_DATA_PKT => PacketType::RfcommData,
            ATT_DATA_PKT => PacketType::AttData,
            SM_DATA_PKT => PacketType::SmData,
            SDP_CLIENT_PKT => PacketType::SdpClient,
            BNEP_DATA_PKT => PacketType::BnepData,
            UCD_DATA_PKT => PacketType::UcdData,
            GOEP_DATA_PKT => PacketType::GoepData,
            PBAP_DATA_PKT => PacketType::PbapData,
            AVRCP_BROWSING_DATA_PKT => PacketType::AvrcpBrowsingData,
            MAP_DATA_PKT => PacketType::MapData,
            PROVISIONING_DATA_PKT => PacketType::Provisioning,
            MESH_NETWORK_PKT => PacketType::MeshNetwork,
            MESH_BEACON_PKT => PacketType::MeshBeacon,
            LOG_MESSAGE_PKT => PacketType::LogMessage,
            other => PacketType::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            PacketType::Command => HCI_COMMAND_PKT,
            PacketType::Acl => HCI_ACL_PKT,
            PacketType::Sco => HCI_SCO_PKT,
            PacketType::Event => HCI_EVENT_PKT,
            PacketType::DaemonEvent => DAEMON_EVENT_PKT,
            PacketType::L2capData => L2CAP_DATA_PKT,
            PacketType::RfcommData => RFCOMM_DATA_PKT,
            PacketType::AttData => ATT_DATA_PKT,
            PacketType::SmData => SM_DATA_PKT,
            PacketType::SdpClient => SDP_CLIENT_PKT,
            PacketType::BnepData => BNEP_DATA_PKT,
            PacketType::UcdData => UCD_DATA_PKT,
            PacketType::GoepData => GOEP_DATA_PKT,
            PacketType::PbapData => PBAP_DATA_PKT,
            PacketType::AvrcpBrowsingData => AVRCP_BROWSING_DATA_PKT,
            PacketType::MapData => MAP_DATA_PKT,
            PacketType::Provisioning => PROVISIONING_DATA_PKT,
            PacketType::MeshNetwork => MESH_NETWORK_PKT,
            PacketType::MeshBeacon => MESH_BEACON_PKT,
            PacketType::LogMessage => LOG_MESSAGE_PKT,
            PacketType::Other(tag) => tag,
        }
    }

    /// Static name used in diagnostics and `MalformedPacket` errors
    pub fn label(self) -> &'static str {
        match self {
            PacketType::Command => "command",
            PacketType::Acl => "ACL",
            PacketType::Sco => "SCO",
            PacketType::Event => "event",
            PacketType::Other(_) => "unknown",
            _ => "stack-internal",
        }
    }

    /// Minimum buffer length (without tag) before any field can be read
    pub fn min_length(self) -> usize {
        match self {
            PacketType::Command => HCI_COMMAND_HEADER_SIZE,
            PacketType::Acl => HCI_ACL_HEADER_SIZE,
            PacketType::Sco => HCI_SCO_HEADER_SIZE,
            PacketType::Event | PacketType::DaemonEvent => HCI_EVENT_HEADER_SIZE,
            _ => 0,
        }
    }
}

/// Bounds-checked, offset-based reads over a borrowed buffer
#[derive(Debug, Clone, Copy)]
pub struct FieldView<'a> {
    label: &'static str,
    data: &'a [u8],
}

impl<'a> FieldView<'a> {
    pub fn new(label: &'static str, data: &'a [u8]) -> Self {
        Self { label, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    /// Fail unless at least `needed` bytes are present
    pub fn require(&self, needed: usize) -> Result<()> {
        if self.data.len() < needed {
            return Err(Error::malformed(self.label, needed, self.data.len()));
        }
        Ok(())
    }

    pub fn bytes(&self, offset: usize, len: usize) -> Result<&'a [u8]> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| Error::malformed(self.label, usize::MAX, self.data.len()))?;
        self.require(end)?;
        Ok(&self.data[offset..end])
    }

    /// Everything from `offset` to the end of the view
    pub fn rest(&self, offset: usize) -> Result<&'a [u8]> {
        self.require(offset)?;
        Ok(&self.data[offset..])
    }

    /// A sub-view starting at `offset`
    pub fn view_from(&self, offset: usize) -> Result<FieldView<'a>> {
        Ok(FieldView::new(self.label, self.rest(offset)?))
    }

    pub fn u8(&self, offset: usize) -> Result<u8> {
        Ok(self.bytes(offset, 1)?[0])
    }

    pub fn i8(&self, offset: usize) -> Result<i8> {
        Ok(self.u8(offset)? as i8)
    }

    pub fn u16(&self, offset: usize) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.bytes(offset, 2)?))
    }

    pub fn u24(&self, offset: usize) -> Result<u32> {
        Ok(LittleEndian::read_u24(self.bytes(offset, 3)?))
    }

    pub fn u32(&self, offset: usize) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.bytes(offset, 4)?))
    }

    pub fn bd_addr(&self, offset: usize) -> Result<BdAddr> {
        let bytes = self.bytes(offset, 6)?;
        let mut addr = [0u8; 6];
        addr.copy_from_slice(bytes);
        Ok(BdAddr::new(addr))
    }
}

/// ACL packet boundary flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketBoundary {
    FirstNonFlushable,
    Continuation,
    FirstFlushable,
    CompleteAutoFlushable,
}

impl PacketBoundary {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => PacketBoundary::FirstNonFlushable,
            1 => PacketBoundary::Continuation,
            2 => PacketBoundary::FirstFlushable,
            _ => PacketBoundary::CompleteAutoFlushable,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            PacketBoundary::FirstNonFlushable => 0,
            PacketBoundary::Continuation => 1,
            PacketBoundary::FirstFlushable => 2,
            PacketBoundary::CompleteAutoFlushable => 3,
        }
    }

    pub fn is_start(self) -> bool {
        self != PacketBoundary::Continuation
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CommandPacket<'a> {
    pub opcode: u16,
    pub params: FieldView<'a>,
}

#[derive(Debug, Clone, Copy)]
pub struct EventPacket<'a> {
    pub code: u8,
    pub params: FieldView<'a>,
}

#[derive(Debug, Clone, Copy)]
pub struct AclPacket<'a> {
    pub handle: u16,
    pub boundary: PacketBoundary,
    pub broadcast: u8,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone, Copy)]
pub struct ScoPacket<'a> {
    pub handle: u16,
    pub status: u8,
    pub payload: &'a [u8],
}

/// A decoded packet borrowing from the input buffer
#[derive(Debug, Clone, Copy)]
pub enum Packet<'a> {
    Command(CommandPacket<'a>),
    Event(EventPacket<'a>),
    Acl(AclPacket<'a>),
    Sco(ScoPacket<'a>),
    /// Stack-internal and unknown packet types carry no header we interpret
    Other(PacketType, FieldView<'a>),
}

/// Interpret `buffer` (without the type tag) as a packet of `packet_type`.
///
/// Declared lengths are checked against the buffer before any payload is
/// exposed. Trailing bytes beyond a declared length are ignored.
pub fn decode(packet_type: PacketType, buffer: &[u8]) -> Result<Packet<'_>> {
    let view = FieldView::new(packet_type.label(), buffer);
    view.require(packet_type.min_length())?;

    match packet_type {
        PacketType::Command => {
            let opcode = view.u16(0)?;
            let len = view.u8(2)? as usize;
            let params = view.bytes(HCI_COMMAND_HEADER_SIZE, len)?;
            Ok(Packet::Command(CommandPacket {
                opcode,
                params: FieldView::new("command", params),
            }))
        }
        PacketType::Event | PacketType::DaemonEvent => {
            let code = view.u8(0)?;
            let len = view.u8(1)? as usize;
            let params = view.bytes(HCI_EVENT_HEADER_SIZE, len)?;
            let event = EventPacket {
                code,
                params: FieldView::new("event", params),
            };
            if packet_type == PacketType::Event {
                Ok(Packet::Event(event))
            } else {
                Ok(Packet::Other(packet_type, view))
            }
        }
        PacketType::Acl => {
            let header = view.u16(0)?;
            let len = view.u16(2)? as usize;
            let payload = view.bytes(HCI_ACL_HEADER_SIZE, len)?;
            Ok(Packet::Acl(AclPacket {
                handle: header & ACL_HANDLE_MASK,
                boundary: PacketBoundary::from_bits((header >> ACL_PB_SHIFT) as u8),
                broadcast: ((header >> ACL_BC_SHIFT) & 0x03) as u8,
                payload,
            }))
        }
        PacketType::Sco => {
            let header = view.u16(0)?;
            let len = view.u8(2)? as usize;
            let payload = view.bytes(HCI_SCO_HEADER_SIZE, len)?;
            Ok(Packet::Sco(ScoPacket {
                handle: header & ACL_HANDLE_MASK,
                status: ((header >> ACL_PB_SHIFT) & 0x03) as u8,
                payload,
            }))
        }
        other => Ok(Packet::Other(other, view)),
    }
}

/// Build an ACL data packet, including the type tag.
///
/// Fails if the payload does not fit the 16-bit length field.
pub fn encode_acl(handle: u16, boundary: PacketBoundary, payload: &[u8]) -> Result<Vec<u8>> {
    let len = u16::try_from(payload.len())
        .map_err(|_| Error::InvalidParameter(format!("ACL payload of {} bytes", payload.len())))?;
    let header = (handle & ACL_HANDLE_MASK) | ((boundary.bits() as u16) << ACL_PB_SHIFT);

    let mut packet = Vec::with_capacity(1 + HCI_ACL_HEADER_SIZE + payload.len());
    packet.push(HCI_ACL_PKT);
    packet.extend_from_slice(&header.to_le_bytes());
    packet.extend_from_slice(&len.to_le_bytes());
    packet.extend_from_slice(payload);
    Ok(packet)
}
