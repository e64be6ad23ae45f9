//! L2CAP Signaling channel implementation
//!
//! This module parses and serializes the commands carried on the BR/EDR
//! and LE signaling channels, including configuration options.

use super::constants::*;
use super::packet::{L2capCommandHeader, L2capPacket};
use super::types::*;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Handle for identifying signaling transactions
pub type SignalId = u8;

/// L2CAP Signaling message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    CommandReject {
        identifier: SignalId,
        reason: u16,
        data: Vec<u8>,
    },
    ConnectionRequest {
        identifier: SignalId,
        psm: u16,
        source_cid: u16,
    },
    ConnectionResponse {
        identifier: SignalId,
        destination_cid: u16,
        source_cid: u16,
        result: u16,
        status: u16,
    },
    ConfigureRequest {
        identifier: SignalId,
        destination_cid: u16,
        flags: u16,
        options: ConfigOptions,
    },
    ConfigureResponse {
        identifier: SignalId,
        source_cid: u16,
        flags: u16,
        result: u16,
        options: ConfigOptions,
    },
    DisconnectionRequest {
        identifier: SignalId,
        destination_cid: u16,
        source_cid: u16,
    },
    DisconnectionResponse {
        identifier: SignalId,
        destination_cid: u16,
        source_cid: u16,
    },
    EchoRequest {
        identifier: SignalId,
        data: Vec<u8>,
    },
    EchoResponse {
        identifier: SignalId,
        data: Vec<u8>,
    },
    InformationRequest {
        identifier: SignalId,
        info_type: u16,
    },
    InformationResponse {
        identifier: SignalId,
        info_type: u16,
        result: u16,
        data: Vec<u8>,
    },
    /// LE only
    ConnectionParameterUpdateRequest {
        identifier: SignalId,
        params: ConnectionParameterUpdate,
    },
    /// LE only
    ConnectionParameterUpdateResponse {
        identifier: SignalId,
        result: u16,
    },
    LeCreditBasedConnectionRequest {
        identifier: SignalId,
        le_psm: u16,
        source_cid: u16,
        mtu: u16,
        mps: u16,
        initial_credits: u16,
    },
    LeCreditBasedConnectionResponse {
        identifier: SignalId,
        destination_cid: u16,
        mtu: u16,
        mps: u16,
        initial_credits: u16,
        result: u16,
    },
    LeFlowControlCredit {
        identifier: SignalId,
        cid: u16,
        credits: u16,
    },
    /// A command code not valid on this signaling channel; answered with a reject
    Unknown {
        identifier: SignalId,
        code: u8,
        data: Vec<u8>,
    },
}

/// Little-endian field reader that reports which command was short
struct ParamReader<'a> {
    cursor: Cursor<&'a [u8]>,
    command: &'static str,
}

impl<'a> ParamReader<'a> {
    fn new(data: &'a [u8], command: &'static str) -> Self {
        Self {
            cursor: Cursor::new(data),
            command,
        }
    }

    fn short(&self) -> L2capError {
        L2capError::ProtocolError(format!("{} parameters too short", self.command))
    }

    fn u8(&mut self) -> L2capResult<u8> {
        self.cursor.read_u8().map_err(|_| self.short())
    }

    fn u16(&mut self) -> L2capResult<u16> {
        self.cursor.read_u16::<LittleEndian>().map_err(|_| self.short())
    }

    fn u32(&mut self) -> L2capResult<u32> {
        self.cursor.read_u32::<LittleEndian>().map_err(|_| self.short())
    }

    fn rest(&self) -> &'a [u8] {
        let data = *self.cursor.get_ref();
        &data[(self.cursor.position() as usize).min(data.len())..]
    }
}

impl SignalingMessage {
    /// Get the command code for this signaling message
    pub fn command_code(&self) -> u8 {
        match self {
            Self::CommandReject { .. } => L2CAP_COMMAND_REJECT,
            Self::ConnectionRequest { .. } => L2CAP_CONNECTION_REQUEST,
            Self::ConnectionResponse { .. } => L2CAP_CONNECTION_RESPONSE,
            Self::ConfigureRequest { .. } => L2CAP_CONFIGURE_REQUEST,
            Self::ConfigureResponse { .. } => L2CAP_CONFIGURE_RESPONSE,
            Self::DisconnectionRequest { .. } => L2CAP_DISCONNECTION_REQUEST,
            Self::DisconnectionResponse { .. } => L2CAP_DISCONNECTION_RESPONSE,
            Self::EchoRequest { .. } => L2CAP_ECHO_REQUEST,
            Self::EchoResponse { .. } => L2CAP_ECHO_RESPONSE,
            Self::InformationRequest { .. } => L2CAP_INFORMATION_REQUEST,
            Self::InformationResponse { .. } => L2CAP_INFORMATION_RESPONSE,
            Self::ConnectionParameterUpdateRequest { .. } => L2CAP_CONNECTION_PARAMETER_UPDATE_REQUEST,
            Self::ConnectionParameterUpdateResponse { .. } => L2CAP_CONNECTION_PARAMETER_UPDATE_RESPONSE,
            Self::LeCreditBasedConnectionRequest { .. } => L2CAP_LE_CREDIT_BASED_CONNECTION_REQUEST,
            Self::LeCreditBasedConnectionResponse { .. } => L2CAP_LE_CREDIT_BASED_CONNECTION_RESPONSE,
            Self::LeFlowControlCredit { .. } => L2CAP_LE_FLOW_CONTROL_CREDIT,
            Self::Unknown { code, .. } => *code,
        }
    }

    /// Get the identifier for this signaling message
    pub fn identifier(&self) -> SignalId {
        match self {
            Self::CommandReject { identifier, .. }
            | Self::ConnectionRequest { identifier, .. }
            | Self::ConnectionResponse { identifier, .. }
            | Self::ConfigureRequest { identifier, .. }
            | Self::ConfigureResponse { identifier, .. }
            | Self::DisconnectionRequest { identifier, .. }
            | Self::DisconnectionResponse { identifier, .. }
            | Self::EchoRequest { identifier, .. }
            | Self::EchoResponse { identifier, .. }
            | Self::InformationRequest { identifier, .. }
            | Self::InformationResponse { identifier, .. }
            | Self::ConnectionParameterUpdateRequest { identifier, .. }
            | Self::ConnectionParameterUpdateResponse { identifier, .. }
            | Self::LeCreditBasedConnectionRequest { identifier, .. }
            | Self::LeCreditBasedConnectionResponse { identifier, .. }
            | Self::LeFlowControlCredit { identifier, .. }
            | Self::Unknown { identifier, .. } => *identifier,
        }
    }

    /// Whether `code` may appear on the LE (`is_le`) or BR/EDR signaling channel
    fn allowed_on(code: u8, is_le: bool) -> bool {
        if is_le {
            matches!(
                code,
                L2CAP_COMMAND_REJECT
                    | L2CAP_DISCONNECTION_REQUEST
                    | L2CAP_DISCONNECTION_RESPONSE
                    | L2CAP_CONNECTION_PARAMETER_UPDATE_REQUEST
                    | L2CAP_CONNECTION_PARAMETER_UPDATE_RESPONSE
                    | L2CAP_LE_CREDIT_BASED_CONNECTION_REQUEST
                    | L2CAP_LE_CREDIT_BASED_CONNECTION_RESPONSE
                    | L2CAP_LE_FLOW_CONTROL_CREDIT
            )
        } else {
            (L2CAP_COMMAND_REJECT..=L2CAP_INFORMATION_RESPONSE).contains(&code)
        }
    }

    /// Parse configuration options from raw bytes
    pub fn parse_config_options(data: &[u8]) -> ConfigOptions {
        let mut options = ConfigOptions::default();
        let mut offset = 0;

        while offset + 2 <= data.len() {
            let raw_type = data[offset];
            let option_type = raw_type & !L2CAP_CONF_HINT;
            let option_length = data[offset + 1] as usize;

            if offset + 2 + option_length > data.len() {
                break;
            }

            let mut option = ParamReader::new(&data[offset + 2..offset + 2 + option_length], "option");

            match (option_type, option_length) {
                (L2CAP_CONF_MTU, 2) => options.mtu = option.u16().ok(),
                (L2CAP_CONF_FLUSH_TIMEOUT, 2) => options.flush_timeout = option.u16().ok(),
                (L2CAP_CONF_QOS, 22) => {
                    let _flags = option.u8();
                    options.qos = (|| {
                        Ok::<_, L2capError>(QosFlowSpec {
                            service_type: option.u8()?,
                            token_rate: option.u32()?,
                            token_bucket_size: option.u32()?,
                            peak_bandwidth: option.u32()?,
                            latency: option.u32()?,
                            delay_variation: option.u32()?,
                        })
                    })()
                    .ok();
                }
                (L2CAP_CONF_RFC, 9) => {
                    options.retransmission = (|| {
                        let mode = RetransmissionMode::from_u8(option.u8()?)
                            .ok_or_else(|| L2capError::ProtocolError("unknown RFC mode".into()))?;
                        Ok::<_, L2capError>(RetransmissionFlowControl {
                            mode,
                            tx_window_size: option.u8()?,
                            max_transmit: option.u8()?,
                            retransmit_timeout: option.u16()?,
                            monitor_timeout: option.u16()?,
                            max_pdu_size: option.u16()?,
                        })
                    })()
                    .ok();
                }
                (L2CAP_CONF_FCS, 1) => options.fcs = option.u8().ok(),
                (L2CAP_CONF_EXT_FLOW_SPEC, 16) => {
                    options.ext_flow_spec = (|| {
                        Ok::<_, L2capError>(ExtendedFlowSpec {
                            identifier: option.u8()?,
                            service_type: option.u8()?,
                            max_sdu_size: option.u16()?,
                            sdu_inter_arrival_time: option.u32()?,
                            access_latency: option.u32()?,
                            flush_timeout: option.u32()?,
                        })
                    })()
                    .ok();
                }
                (L2CAP_CONF_EXT_WINDOW, 2) => options.ext_window_size = option.u16().ok(),
                _ => {
                    // Hints may be skipped silently
                    if raw_type & L2CAP_CONF_HINT == 0 {
                        options.unknown.push(option_type);
                    }
                }
            }

            offset += 2 + option_length;
        }

        options
    }

    /// Serialize configuration options to bytes
    pub fn serialize_config_options(options: &ConfigOptions) -> Vec<u8> {
        let mut result = Vec::new();

        if let Some(mtu) = options.mtu {
            result.extend_from_slice(&[L2CAP_CONF_MTU, 2]);
            result.extend_from_slice(&mtu.to_le_bytes());
        }

        if let Some(timeout) = options.flush_timeout {
            result.extend_from_slice(&[L2CAP_CONF_FLUSH_TIMEOUT, 2]);
            result.extend_from_slice(&timeout.to_le_bytes());
        }

        if let Some(qos) = options.qos {
            result.extend_from_slice(&[L2CAP_CONF_QOS, 22, 0x00, qos.service_type]);
            result.extend_from_slice(&qos.token_rate.to_le_bytes());
            result.extend_from_slice(&qos.token_bucket_size.to_le_bytes());
            result.extend_from_slice(&qos.peak_bandwidth.to_le_bytes());
            result.extend_from_slice(&qos.latency.to_le_bytes());
            result.extend_from_slice(&qos.delay_variation.to_le_bytes());
        }

        if let Some(rfc) = options.retransmission {
            result.extend_from_slice(&[
                L2CAP_CONF_RFC,
                9,
                rfc.mode as u8,
                rfc.tx_window_size,
                rfc.max_transmit,
            ]);
            result.extend_from_slice(&rfc.retransmit_timeout.to_le_bytes());
            result.extend_from_slice(&rfc.monitor_timeout.to_le_bytes());
            result.extend_from_slice(&rfc.max_pdu_size.to_le_bytes());
        }

        if let Some(fcs) = options.fcs {
            result.extend_from_slice(&[L2CAP_CONF_FCS, 1, fcs]);
        }

        if let Some(spec) = options.ext_flow_spec {
            result.extend_from_slice(&[L2CAP_CONF_EXT_FLOW_SPEC, 16, spec.identifier, spec.service_type]);
            result.extend_from_slice(&spec.max_sdu_size.to_le_bytes());
            result.extend_from_slice(&spec.sdu_inter_arrival_time.to_le_bytes());
            result.extend_from_slice(&spec.access_latency.to_le_bytes());
            result.extend_from_slice(&spec.flush_timeout.to_le_bytes());
        }

        if let Some(window) = options.ext_window_size {
            result.extend_from_slice(&[L2CAP_CONF_EXT_WINDOW, 2]);
            result.extend_from_slice(&window.to_le_bytes());
        }

        result
    }

    /// Split a signaling C-frame payload into its commands.
    ///
    /// A truncated trailing command ends the walk; its error is returned
    /// in place so earlier commands are still processed.
    pub fn parse_all(data: &[u8], is_le: bool) -> Vec<L2capResult<Self>> {
        let mut messages = Vec::new();
        let mut offset = 0;

        while offset < data.len() {
            let rest = &data[offset..];
            let Some(header) = L2capCommandHeader::parse(rest) else {
                messages.push(Err(L2capError::ProtocolError("command header truncated".into())));
                break;
            };
            let end = L2CAP_COMMAND_HEADER_SIZE + header.length as usize;
            if rest.len() < end {
                messages.push(Err(L2capError::ProtocolError(format!(
                    "command 0x{:02X} declares {} bytes, {} present",
                    header.code,
                    header.length,
                    rest.len() - L2CAP_COMMAND_HEADER_SIZE
                ))));
                break;
            }
            messages.push(Self::parse(&rest[..end], is_le));
            offset += end;
        }

        messages
    }

    /// Parse a single signaling command, header included
    pub fn parse(data: &[u8], is_le: bool) -> L2capResult<Self> {
        let header = L2capCommandHeader::parse(data)
            .ok_or_else(|| L2capError::ProtocolError("command header truncated".into()))?;
        let end = L2CAP_COMMAND_HEADER_SIZE + header.length as usize;
        if data.len() < end {
            return Err(L2capError::ProtocolError("command parameters truncated".into()));
        }
        let params = &data[L2CAP_COMMAND_HEADER_SIZE..end];
        let identifier = header.identifier;

        if !Self::allowed_on(header.code, is_le) {
            return Ok(Self::Unknown {
                identifier,
                code: header.code,
                data: params.to_vec(),
            });
        }

        let message = match header.code {
            L2CAP_COMMAND_REJECT => {
                let mut r = ParamReader::new(params, "command reject");
                Self::CommandReject {
                    identifier,
                    reason: r.u16()?,
                    data: r.rest().to_vec(),
                }
            }
            L2CAP_CONNECTION_REQUEST => {
                let mut r = ParamReader::new(params, "connection request");
                Self::ConnectionRequest {
                    identifier,
                    psm: r.u16()?,
                    source_cid: r.u16()?,
                }
            }
            L2CAP_CONNECTION_RESPONSE => {
                let mut r = ParamReader::new(params, "connection response");
                Self::ConnectionResponse {
                    identifier,
                    destination_cid: r.u16()?,
                    source_cid: r.u16()?,
                    result: r.u16()?,
                    status: r.u16()?,
                }
            }
            L2CAP_CONFIGURE_REQUEST => {
                let mut r = ParamReader::new(params, "configure request");
                Self::ConfigureRequest {
                    identifier,
                    destination_cid: r.u16()?,
                    flags: r.u16()?,
                    options: Self::parse_config_options(r.rest()),
                }
            }
            L2CAP_CONFIGURE_RESPONSE => {
                let mut r = ParamReader::new(params, "configure response");
                Self::ConfigureResponse {
                    identifier,
                    source_cid: r.u16()?,
                    flags: r.u16()?,
                    result: r.u16()?,
                    options: Self::parse_config_options(r.rest()),
                }
            }
            L2CAP_DISCONNECTION_REQUEST => {
                let mut r = ParamReader::new(params, "disconnection request");
                Self::DisconnectionRequest {
                    identifier,
                    destination_cid: r.u16()?,
                    source_cid: r.u16()?,
                }
            }
            L2CAP_DISCONNECTION_RESPONSE => {
                let mut r = ParamReader::new(params, "disconnection response");
                Self::DisconnectionResponse {
                    identifier,
                    destination_cid: r.u16()?,
                    source_cid: r.u16()?,
                }
            }
            L2CAP_ECHO_REQUEST => Self::EchoRequest {
                identifier,
                data: params.to_vec(),
            },
            L2CAP_ECHO_RESPONSE => Self::EchoResponse {
                identifier,
                data: params.to_vec(),
            },
            L2CAP_INFORMATION_REQUEST => {
                let mut r = ParamReader::new(params, "information request");
                Self::InformationRequest {
                    identifier,
                    info_type: r.u16()?,
                }
            }
            L2CAP_INFORMATION_RESPONSE => {
                let mut r = ParamReader::new(params, "information response");
                Self::InformationResponse {
                    identifier,
                    info_type: r.u16()?,
                    result: r.u16()?,
                    data: r.rest().to_vec(),
                }
            }
            L2CAP_CONNECTION_PARAMETER_UPDATE_REQUEST => {
                let mut r = ParamReader::new(params, "connection parameter update request");
                Self::ConnectionParameterUpdateRequest {
                    identifier,
                    params: ConnectionParameterUpdate {
                        conn_interval_min: r.u16()?,
                        conn_interval_max: r.u16()?,
                        conn_latency: r.u16()?,
                        supervision_timeout: r.u16()?,
                    },
                }
            }
            L2CAP_CONNECTION_PARAMETER_UPDATE_RESPONSE => {
                let mut r = ParamReader::new(params, "connection parameter update response");
                Self::ConnectionParameterUpdateResponse {
                    identifier,
                    result: r.u16()?,
                }
            }
            L2CAP_LE_CREDIT_BASED_CONNECTION_REQUEST => {
                let mut r = ParamReader::new(params, "LE credit based connection request");
                Self::LeCreditBasedConnectionRequest {
                    identifier,
                    le_psm: r.u16()?,
                    source_cid: r.u16()?,
                    mtu: r.u16()?,
                    mps: r.u16()?,
                    initial_credits: r.u16()?,
                }
            }
            L2CAP_LE_CREDIT_BASED_CONNECTION_RESPONSE => {
                let mut r = ParamReader::new(params, "LE credit based connection response");
                Self::LeCreditBasedConnectionResponse {
                    identifier,
                    destination_cid: r.u16()?,
                    mtu: r.u16()?,
                    mps: r.u16()?,
                    initial_credits: r.u16()?,
                    result: r.u16()?,
                }
            }
            L2CAP_LE_FLOW_CONTROL_CREDIT => {
                let mut r = ParamReader::new(params, "flow control credit");
                Self::LeFlowControlCredit {
                    identifier,
                    cid: r.u16()?,
                    credits: r.u16()?,
                }
            }
            code => Self::Unknown {
                identifier,
                code,
                data: params.to_vec(),
            },
        };

        Ok(message)
    }

    /// Serialize the signaling message, command header included
    pub fn serialize(&self) -> Vec<u8> {
        let mut params = Vec::new();

        match self {
            Self::CommandReject { reason, data, .. } => {
                params.extend_from_slice(&reason.to_le_bytes());
                params.extend_from_slice(data);
            }
            Self::ConnectionRequest { psm, source_cid, .. } => {
                params.extend_from_slice(&psm.to_le_bytes());
                params.extend_from_slice(&source_cid.to_le_bytes());
            }
            Self::ConnectionResponse {
                destination_cid,
                source_cid,
                result,
                status,
                ..
            } => {
                for value in [destination_cid, source_cid, result, status] {
                    params.extend_from_slice(&value.to_le_bytes());
                }
            }
            Self::ConfigureRequest {
                destination_cid,
                flags,
                options,
                ..
            } => {
                params.extend_from_slice(&destination_cid.to_le_bytes());
                params.extend_from_slice(&flags.to_le_bytes());
                params.extend_from_slice(&Self::serialize_config_options(options));
            }
            Self::ConfigureResponse {
                source_cid,
                flags,
                result,
                options,
                ..
            } => {
                params.extend_from_slice(&source_cid.to_le_bytes());
                params.extend_from_slice(&flags.to_le_bytes());
                params.extend_from_slice(&result.to_le_bytes());
                params.extend_from_slice(&Self::serialize_config_options(options));
            }
            Self::DisconnectionRequest {
                destination_cid,
                source_cid,
                ..
            }
            | Self::DisconnectionResponse {
                destination_cid,
                source_cid,
                ..
            } => {
                params.extend_from_slice(&destination_cid.to_le_bytes());
                params.extend_from_slice(&source_cid.to_le_bytes());
            }
            Self::EchoRequest { data, .. } | Self::EchoResponse { data, .. } => {
                params.extend_from_slice(data);
            }
            Self::InformationRequest { info_type, .. } => {
                params.extend_from_slice(&info_type.to_le_bytes());
            }
            Self::InformationResponse {
                info_type,
                result,
                data,
                ..
            } => {
                params.extend_from_slice(&info_type.to_le_bytes());
                params.extend_from_slice(&result.to_le_bytes());
                params.extend_from_slice(data);
            }
            Self::ConnectionParameterUpdateRequest { params: update, .. } => {
                for value in [
                    update.conn_interval_min,
                    update.conn_interval_max,
                    update.conn_latency,
                    update.supervision_timeout,
                ] {
                    params.extend_from_slice(&value.to_le_bytes());
                }
            }
            Self::ConnectionParameterUpdateResponse { result, .. } => {
                params.extend_from_slice(&result.to_le_bytes());
            }
            Self::LeCreditBasedConnectionRequest {
                le_psm,
                source_cid,
                mtu,
                mps,
                initial_credits,
                ..
            } => {
                for value in [le_psm, source_cid, mtu, mps, initial_credits] {
                    params.extend_from_slice(&value.to_le_bytes());
                }
            }
            Self::LeCreditBasedConnectionResponse {
                destination_cid,
                mtu,
                mps,
                initial_credits,
                result,
                ..
            } => {
                for value in [destination_cid, mtu, mps, initial_credits, result] {
                    params.extend_from_slice(&value.to_le_bytes());
                }
            }
            Self::LeFlowControlCredit { cid, credits, .. } => {
                params.extend_from_slice(&cid.to_le_bytes());
                params.extend_from_slice(&credits.to_le_bytes());
            }
            Self::Unknown { data, .. } => params.extend_from_slice(data),
        }

        let header = L2capCommandHeader::new(self.command_code(), self.identifier(), params.len() as u16);
        let mut result = Vec::with_capacity(L2CAP_COMMAND_HEADER_SIZE + params.len());
        result.extend_from_slice(&header.to_bytes());
        result.extend_from_slice(&params);
        result
    }

    /// Create a signaling L2CAP packet from this message
    pub fn to_packet(&self, is_le: bool) -> L2capPacket {
        let channel_id = if is_le {
            L2CAP_LE_SIGNALING_CID
        } else {
            L2CAP_SIGNALING_CID
        };
        L2capPacket::new(channel_id, self.serialize())
    }
}
