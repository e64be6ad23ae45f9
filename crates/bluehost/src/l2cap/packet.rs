//! L2CAP Packet handling
//!
//! Basic headers, signaling command headers, the enhanced control field
//! and the frame check sequence used by enhanced retransmission and
//! streaming channels.

use super::constants::*;
use super::types::{L2capError, L2capResult};
use byteorder::{ByteOrder, LittleEndian};

/// L2CAP Packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2capHeader {
    /// Length of the L2CAP payload in bytes
    pub length: u16,
    /// Channel Identifier
    pub channel_id: u16,
}

impl L2capHeader {
    pub fn new(length: u16, channel_id: u16) -> Self {
        Self { length, channel_id }
    }

    /// Parse an L2CAP header from raw bytes
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < L2CAP_BASIC_HEADER_SIZE {
            return None;
        }
        Some(Self {
            length: LittleEndian::read_u16(&data[0..2]),
            channel_id: LittleEndian::read_u16(&data[2..4]),
        })
    }

    pub fn to_bytes(&self) -> [u8; L2CAP_BASIC_HEADER_SIZE] {
        let mut result = [0u8; L2CAP_BASIC_HEADER_SIZE];
        LittleEndian::write_u16(&mut result[0..2], self.length);
        LittleEndian::write_u16(&mut result[2..4], self.channel_id);
        result
    }
}

/// A complete basic-mode L2CAP PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L2capPacket {
    pub header: L2capHeader,
    pub payload: Vec<u8>,
}

impl L2capPacket {
    pub fn new(channel_id: u16, payload: Vec<u8>) -> Self {
        Self {
            header: L2capHeader::new(payload.len() as u16, channel_id),
            payload,
        }
    }

    /// Parse a complete PDU. Bytes beyond the declared length are ignored.
    pub fn parse(data: &[u8]) -> L2capResult<Self> {
        let header = L2capHeader::parse(data)
            .ok_or_else(|| L2capError::ProtocolError("L2CAP header truncated".into()))?;
        let end = L2CAP_BASIC_HEADER_SIZE + header.length as usize;
        if data.len() < end {
            return Err(L2capError::ProtocolError(format!(
                "L2CAP payload truncated: need {} bytes, got {}",
                end,
                data.len()
            )));
        }
        Ok(Self {
            header,
            payload: data[L2CAP_BASIC_HEADER_SIZE..end].to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(self.size());
        result.extend_from_slice(&self.header.to_bytes());
        result.extend_from_slice(&self.payload);
        result
    }

    /// Get the full size of the packet in bytes
    pub fn size(&self) -> usize {
        L2CAP_BASIC_HEADER_SIZE + self.payload.len()
    }
}

/// Enhanced control field of I-frames and S-frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2capControlField {
    /// false for I-frames, true for S-frames
    pub supervisory: bool,
    pub tx_seq: u8,
    pub sar: u8,
    pub supervisory_function: u8,
    pub poll: bool,
    pub final_bit: bool,
    /// Acknowledges every frame up to `req_seq - 1`
    pub req_seq: u8,
}

impl L2capControlField {
    pub fn new_i_frame(tx_seq: u8, req_seq: u8, sar: u8, final_bit: bool) -> Self {
        Self {
            supervisory: false,
            tx_seq: tx_seq % L2CAP_SEQ_MODULO,
            sar,
            supervisory_function: 0,
            poll: false,
            final_bit,
            req_seq: req_seq % L2CAP_SEQ_MODULO,
        }
    }

    pub fn new_s_frame(supervisory_function: u8, req_seq: u8, poll: bool, final_bit: bool) -> Self {
        Self {
            supervisory: true,
            tx_seq: 0,
            sar: 0,
            supervisory_function,
            poll,
            final_bit,
            req_seq: req_seq % L2CAP_SEQ_MODULO,
        }
    }

    pub fn from_u16(control: u16) -> Self {
        let supervisory = control & L2CAP_CTRL_FRAME_TYPE_MASK != 0;
        let req_seq = ((control & L2CAP_CTRL_REQSEQ_MASK) >> L2CAP_CTRL_REQSEQ_SHIFT) as u8;
        let final_bit = control & L2CAP_CTRL_FINAL != 0;

        if supervisory {
            Self {
                supervisory,
                tx_seq: 0,
                sar: 0,
                supervisory_function: ((control & L2CAP_CTRL_SUPERVISORY_MASK)
                    >> L2CAP_CTRL_SUPERVISORY_SHIFT) as u8,
                poll: control & L2CAP_CTRL_POLL != 0,
                final_bit,
                req_seq,
            }
        } else {
            Self {
                supervisory,
                tx_seq: ((control & L2CAP_CTRL_TXSEQ_MASK) >> L2CAP_CTRL_TXSEQ_SHIFT) as u8,
                sar: ((control & L2CAP_CTRL_SAR_MASK) >> L2CAP_CTRL_SAR_SHIFT) as u8,
                supervisory_function: 0,
                poll: false,
                final_bit,
                req_seq,
            }
        }
    }

    pub fn to_u16(&self) -> u16 {
        let mut control = (self.req_seq as u16 & 0x3F) << L2CAP_CTRL_REQSEQ_SHIFT;
        if self.final_bit {
            control |= L2CAP_CTRL_FINAL;
        }

        if self.supervisory {
            control |= L2CAP_CTRL_FRAME_TYPE_MASK;
            control |= (self.supervisory_function as u16 & 0x03) << L2CAP_CTRL_SUPERVISORY_SHIFT;
            if self.poll {
                control |= L2CAP_CTRL_POLL;
            }
        } else {
            control |= (self.tx_seq as u16 & 0x3F) << L2CAP_CTRL_TXSEQ_SHIFT;
            control |= (self.sar as u16 & 0x03) << L2CAP_CTRL_SAR_SHIFT;
        }

        control
    }
}

/// L2CAP Command header used in signaling packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2capCommandHeader {
    pub code: u8,
    pub identifier: u8,
    /// Length of command parameters
    pub length: u16,
}

impl L2capCommandHeader {
    pub fn new(code: u8, identifier: u8, length: u16) -> Self {
        Self {
            code,
            identifier,
            length,
        }
    }

    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < L2CAP_COMMAND_HEADER_SIZE {
            return None;
        }
        Some(Self {
            code: data[0],
            identifier: data[1],
            length: LittleEndian::read_u16(&data[2..4]),
        })
    }

    pub fn to_bytes(&self) -> [u8; L2CAP_COMMAND_HEADER_SIZE] {
        let mut result = [self.code, self.identifier, 0, 0];
        LittleEndian::write_u16(&mut result[2..4], self.length);
        result
    }
}

/// CRC-16 frame check sequence (polynomial x^16 + x^15 + x^2 + 1, LSB first)
pub fn fcs16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &byte| {
        let mut crc = crc ^ byte as u16;
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xA001
            } else {
                crc >> 1
            };
        }
        crc
    })
}

/// Build an I-frame or S-frame PDU: header, control, optional SDU length, payload, FCS
pub fn build_frame(
    channel_id: u16,
    control: L2capControlField,
    sdu_length: Option<u16>,
    payload: &[u8],
    with_fcs: bool,
) -> Vec<u8> {
    let length = L2CAP_CONTROL_SIZE
        + sdu_length.map_or(0, |_| L2CAP_SDU_LENGTH_SIZE)
        + payload.len()
        + if with_fcs { L2CAP_FCS_SIZE } else { 0 };

    let mut frame = Vec::with_capacity(L2CAP_BASIC_HEADER_SIZE + length);
    frame.extend_from_slice(&L2capHeader::new(length as u16, channel_id).to_bytes());
    frame.extend_from_slice(&control.to_u16().to_le_bytes());
    if let Some(sdu_length) = sdu_length {
        frame.extend_from_slice(&sdu_length.to_le_bytes());
    }
    frame.extend_from_slice(payload);
    if with_fcs {
        let fcs = fcs16(&frame);
        frame.extend_from_slice(&fcs.to_le_bytes());
    }
    frame
}

/// Split a received I-frame or S-frame into its control field and
/// information payload. `pdu` is the complete PDU including its basic header.
pub fn parse_frame(pdu: &[u8], with_fcs: bool) -> L2capResult<(L2capControlField, &[u8])> {
    let trailer = if with_fcs { L2CAP_FCS_SIZE } else { 0 };
    if pdu.len() < L2CAP_BASIC_HEADER_SIZE + L2CAP_CONTROL_SIZE + trailer {
        return Err(L2capError::ProtocolError("frame too short".into()));
    }

    let body_end = pdu.len() - trailer;
    if with_fcs {
        let received = LittleEndian::read_u16(&pdu[body_end..]);
        let computed = fcs16(&pdu[..body_end]);
        if received != computed {
            return Err(L2capError::ProtocolError(format!(
                "FCS mismatch: received 0x{:04X}, computed 0x{:04X}",
                received, computed
            )));
        }
    }

    let control_end = L2CAP_BASIC_HEADER_SIZE + L2CAP_CONTROL_SIZE;
    let control = L2capControlField::from_u16(LittleEndian::read_u16(
        &pdu[L2CAP_BASIC_HEADER_SIZE..control_end],
    ));
    Ok((control, &pdu[control_end..body_end]))
}

/// Build an LE K-frame; the first frame of an SDU carries the SDU length
pub fn build_k_frame(channel_id: u16, sdu_length: Option<u16>, payload: &[u8]) -> Vec<u8> {
    let length = sdu_length.map_or(0, |_| L2CAP_SDU_LENGTH_SIZE) + payload.len();
    let mut frame = Vec::with_capacity(L2CAP_BASIC_HEADER_SIZE + length);
    frame.extend_from_slice(&L2capHeader::new(length as u16, channel_id).to_bytes());
    if let Some(sdu_length) = sdu_length {
        frame.extend_from_slice(&sdu_length.to_le_bytes());
    }
    frame.extend_from_slice(payload);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fcs_check_value() {
        assert_eq!(fcs16(b"123456789"), 0xBB3D);
        assert_eq!(fcs16(&[]), 0x0000);
    }

    #[test]
    fn test_i_frame_control_layout() {
        let control = L2capControlField::new_i_frame(5, 10, L2CAP_SAR_START, false);
        // TxSeq in bits 1-6, ReqSeq in bits 8-13, SAR in bits 14-15
        assert_eq!(control.to_u16(), (5 << 1) | (10 << 8) | (1 << 14));

        let parsed = L2capControlField::from_u16(control.to_u16());
        assert_eq!(parsed, control);
    }

    #[test]
    fn test_s_frame_control_layout() {
        let control = L2capControlField::new_s_frame(L2CAP_SUPERVISORY_REJ, 63, true, false);
        assert_eq!(control.to_u16(), 0x0001 | (1 << 2) | 0x0010 | (63 << 8));

        let parsed = L2capControlField::from_u16(control.to_u16());
        assert!(parsed.supervisory);
        assert!(parsed.poll);
        assert_eq!(parsed.supervisory_function, L2CAP_SUPERVISORY_REJ);
        assert_eq!(parsed.req_seq, 63);
    }

    #[test]
    fn test_frame_fcs_is_verified() {
        let control = L2capControlField::new_i_frame(1, 0, L2CAP_SAR_UNSEGMENTED, false);
        let mut frame = build_frame(0x0040, control, None, &[1, 2, 3], true);
        assert_eq!(frame.len(), 4 + 2 + 3 + 2);
        assert_eq!(LittleEndian::read_u16(&frame[0..2]), 7);

        let (parsed, payload) = parse_frame(&frame, true).unwrap();
        assert_eq!(parsed.tx_seq, 1);
        assert_eq!(payload, &[1, 2, 3]);

        frame[6] ^= 0xFF;
        assert!(matches!(parse_frame(&frame, true), Err(L2capError::ProtocolError(_))));
    }

    #[test]
    fn test_start_frame_carries_sdu_length() {
        let control = L2capControlField::new_i_frame(0, 0, L2CAP_SAR_START, false);
        let frame = build_frame(0x0041, control, Some(300), &[0xAA; 4], false);
        let (_, payload) = parse_frame(&frame, false).unwrap();
        assert_eq!(LittleEndian::read_u16(&payload[0..2]), 300);
        assert_eq!(&payload[2..], &[0xAA; 4]);
    }

    #[test]
    fn test_packet_parse_rejects_short_payload() {
        let packet = L2capPacket::new(0x0040, vec![1, 2, 3, 4]).to_bytes();
        assert!(L2capPacket::parse(&packet).is_ok());
        for len in 0..packet.len() {
            assert!(L2capPacket::parse(&packet[..len]).is_err());
        }
    }
}
