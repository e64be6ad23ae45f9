//! L2CAP Channel implementation
//!
//! A channel is one logical connection to a peer's PSM over an ACL link.
//! Besides its identifiers and signaling state it carries the flow state
//! of its mode: nothing for basic mode, the transmit window and
//! sequence numbers for enhanced retransmission, sequence numbers for
//! streaming, and credit counters for LE credit-based channels.

use std::collections::VecDeque;
use std::fmt;
use std::ops::Range;
use std::time::{Duration, Instant};

use super::constants::*;
use super::core::ChannelContext;
use super::packet::{build_frame, build_k_frame, parse_frame, L2capControlField, L2capPacket};
use super::signaling::SignalId;
use super::types::*;
use crate::gap::SecurityLevel;
use byteorder::{ByteOrder, LittleEndian};

/// Upper-layer consumer of one channel.
///
/// Callbacks run after the multiplexer has finished updating its own
/// state, so the context may be used to send or close from inside them.
pub trait ChannelHandler {
    fn on_opened(&mut self, _ctx: &mut ChannelContext<'_>) {}

    fn on_open_failed(&mut self, _cid: ChannelId, _error: &L2capError) {}

    fn on_data(&mut self, ctx: &mut ChannelContext<'_>, sdu: &[u8]);

    /// The channel can accept at least one more SDU
    fn on_can_send_now(&mut self, _ctx: &mut ChannelContext<'_>) {}

    fn on_closed(&mut self, _cid: ChannelId, _reason: &CloseReason) {}
}

/// An incoming channel request for a registered PSM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingChannel {
    pub handle: u16,
    pub psm: u16,
    pub local_cid: ChannelId,
    pub remote_cid: ChannelId,
    pub mode: ChannelMode,
}

/// Decides whether to take an incoming channel, supplying its handler
pub trait ServiceAcceptor {
    fn accept(&mut self, request: &IncomingChannel) -> Option<Box<dyn ChannelHandler>>;
}

/// What receiving one PDU produced
#[derive(Debug, Default)]
pub(crate) struct RxResult {
    pub(crate) sdus: Vec<Vec<u8>>,
    /// Frames to transmit on this channel (acknowledgements, retransmissions)
    pub(crate) frames: Vec<Vec<u8>>,
    pub(crate) credits_to_grant: u16,
    /// The send window may have reopened
    pub(crate) window_opened: bool,
    pub(crate) violation: Option<String>,
    pub(crate) failed: bool,
}

impl RxResult {
    fn violation(reason: impl Into<String>) -> Self {
        Self {
            violation: Some(reason.into()),
            ..Default::default()
        }
    }
}

/// Reassembles SDUs from SAR-tagged I-frames
#[derive(Debug, Default)]
pub(crate) struct SduAssembly {
    expected: usize,
    buffer: Vec<u8>,
    active: bool,
}

impl SduAssembly {
    fn reset(&mut self) {
        self.active = false;
        self.expected = 0;
        self.buffer.clear();
    }

    fn push(&mut self, sar: u8, info: &[u8], mtu: u16) -> Result<Option<Vec<u8>>, String> {
        match sar {
            L2CAP_SAR_UNSEGMENTED => {
                let dropped = self.active;
                self.reset();
                if info.len() > mtu as usize {
                    return Err(format!("SDU of {} bytes exceeds MTU {}", info.len(), mtu));
                }
                if dropped {
                    log::warn!("Unsegmented SDU interrupted a partial SDU");
                }
                Ok(Some(info.to_vec()))
            }
            L2CAP_SAR_START => {
                self.reset();
                if info.len() < L2CAP_SDU_LENGTH_SIZE {
                    return Err("start frame without SDU length".into());
                }
                let length = LittleEndian::read_u16(info) as usize;
                if length > mtu as usize {
                    return Err(format!("SDU of {} bytes exceeds MTU {}", length, mtu));
                }
                self.active = true;
                self.expected = length;
                self.buffer.extend_from_slice(&info[L2CAP_SDU_LENGTH_SIZE..]);
                if self.buffer.len() >= self.expected {
                    self.reset();
                    return Err("start frame carries the whole SDU".into());
                }
                Ok(None)
            }
            _ => {
                if !self.active {
                    return Err("segment without start frame".into());
                }
                self.buffer.extend_from_slice(info);
                let is_end = sar == L2CAP_SAR_END;
                if self.buffer.len() > self.expected || (!is_end && self.buffer.len() == self.expected) {
                    self.reset();
                    return Err("segments exceed SDU length".into());
                }
                if !is_end {
                    return Ok(None);
                }
                if self.buffer.len() != self.expected {
                    self.reset();
                    return Err("end frame before SDU complete".into());
                }
                let sdu = std::mem::take(&mut self.buffer);
                self.reset();
                Ok(Some(sdu))
            }
        }
    }
}

/// An I-frame awaiting acknowledgement
#[derive(Debug, Clone)]
struct SentFrame {
    tx_seq: u8,
    sar: u8,
    sdu_length: Option<u16>,
    payload: Vec<u8>,
    transmit_count: u8,
}

/// Enhanced retransmission state
#[derive(Debug)]
pub(crate) struct ErtmState {
    /// Frames we accept unacknowledged, sent in our RFC option
    pub(crate) local_tx_window: u8,
    pub(crate) local_mps: u16,
    /// Frames we may have outstanding, from the peer's RFC option
    pub(crate) remote_tx_window: u8,
    pub(crate) remote_mps: u16,
    pub(crate) max_transmit: u8,
    pub(crate) retransmit_timeout: Duration,
    next_tx_seq: u8,
    expected_ack_seq: u8,
    unacked: VecDeque<SentFrame>,
    expected_tx_seq: u8,
    reject_sent: bool,
    remote_busy: bool,
    retransmit_deadline: Option<Instant>,
    rx: SduAssembly,
}

impl ErtmState {
    fn new(local_tx_window: u8, local_mps: u16) -> Self {
        Self {
            local_tx_window,
            local_mps,
            remote_tx_window: L2CAP_ERTM_DEFAULT_TX_WINDOW,
            remote_mps: L2CAP_ERTM_DEFAULT_MPS,
            max_transmit: L2CAP_ERTM_DEFAULT_MAX_TRANSMIT,
            retransmit_timeout: Duration::from_millis(L2CAP_ERTM_RETRANSMISSION_TIMEOUT_MS as u64),
            next_tx_seq: 0,
            expected_ack_seq: 0,
            unacked: VecDeque::new(),
            expected_tx_seq: 0,
            reject_sent: false,
            remote_busy: false,
            retransmit_deadline: None,
            rx: SduAssembly::default(),
        }
    }

    pub(crate) fn unacked(&self) -> usize {
        self.unacked.len()
    }

    fn window_open(&self) -> bool {
        !self.remote_busy && self.unacked.len() < self.remote_tx_window as usize
    }
}

/// Streaming mode state
#[derive(Debug)]
pub(crate) struct StreamingState {
    pub(crate) local_mps: u16,
    pub(crate) remote_mps: u16,
    next_tx_seq: u8,
    expected_tx_seq: u8,
    rx: SduAssembly,
}

/// LE credit-based flow state
#[derive(Debug)]
pub(crate) struct CreditState {
    /// K-frames we may still send
    pub(crate) tx_credits: u16,
    /// K-frames the peer may still send
    pub(crate) rx_credits: u16,
    pub(crate) local_mps: u16,
    pub(crate) remote_mps: u16,
    pub(crate) initial_rx_credits: u16,
    pub(crate) low_watermark: u16,
    rx_sdu: Option<(usize, Vec<u8>)>,
}

impl CreditState {
    /// Add credits granted by the peer; returns false if the total overflowed
    pub(crate) fn grant(&mut self, credits: u16) -> bool {
        match self.tx_credits.checked_add(credits) {
            Some(total) => {
                self.tx_credits = total;
                true
            }
            None => {
                self.tx_credits = L2CAP_LE_MAX_CREDITS;
                false
            }
        }
    }
}

#[derive(Debug)]
pub(crate) enum FlowState {
    Basic,
    Ertm(ErtmState),
    Streaming(StreamingState),
    Credit(CreditState),
}

/// Configuration exchange progress of a BR/EDR channel
#[derive(Debug, Default)]
pub(crate) struct ConfigState {
    /// Our configure request was accepted
    pub(crate) local_done: bool,
    /// We accepted the peer's configure request
    pub(crate) remote_done: bool,
    pub(crate) retries: u8,
    /// Options of a configure request split with the continuation flag
    pub(crate) partial_remote: Option<ConfigOptions>,
}

/// L2CAP Channel structure
pub struct L2capChannel {
    pub(crate) local_cid: ChannelId,
    pub(crate) remote_cid: ChannelId,
    pub(crate) handle: u16,
    pub(crate) psm: u16,
    pub(crate) mode: ChannelMode,
    pub(crate) state: L2capChannelState,
    pub(crate) outgoing: bool,
    pub(crate) local_mtu: u16,
    pub(crate) remote_mtu: u16,
    pub(crate) required_security: SecurityLevel,
    /// Identifier of our outstanding signaling request
    pub(crate) signal_id: Option<SignalId>,
    pub(crate) rtx_deadline: Option<Instant>,
    pub(crate) config: ConfigState,
    pub(crate) flow: FlowState,
    pub(crate) handler: Option<Box<dyn ChannelHandler>>,
    /// Raise `on_can_send_now` once the channel can send again
    pub(crate) wants_send: bool,
}

impl fmt::Debug for L2capChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("L2capChannel")
            .field("local_cid", &self.local_cid)
            .field("remote_cid", &self.remote_cid)
            .field("handle", &self.handle)
            .field("psm", &self.psm)
            .field("mode", &self.mode)
            .field("state", &self.state)
            .field("local_mtu", &self.local_mtu)
            .field("remote_mtu", &self.remote_mtu)
            .finish()
    }
}

/// Parameters for constructing a channel's flow state
pub(crate) struct FlowParams {
    pub(crate) mode: ChannelMode,
    pub(crate) mps: u16,
    pub(crate) tx_window: u8,
    pub(crate) initial_rx_credits: u16,
    pub(crate) low_watermark: u16,
}

impl L2capChannel {
    pub(crate) fn new(
        local_cid: ChannelId,
        handle: u16,
        psm: u16,
        local_mtu: u16,
        outgoing: bool,
        params: FlowParams,
    ) -> Self {
        let flow = match params.mode {
            ChannelMode::Basic => FlowState::Basic,
            ChannelMode::EnhancedRetransmission => {
                FlowState::Ertm(ErtmState::new(params.tx_window, params.mps))
            }
            ChannelMode::Streaming => FlowState::Streaming(StreamingState {
                local_mps: params.mps,
                remote_mps: L2CAP_ERTM_DEFAULT_MPS,
                next_tx_seq: 0,
                expected_tx_seq: 0,
                rx: SduAssembly::default(),
            }),
            ChannelMode::LeCreditBased => FlowState::Credit(CreditState {
                tx_credits: 0,
                rx_credits: params.initial_rx_credits,
                local_mps: params.mps,
                remote_mps: L2CAP_LE_MIN_MTU,
                initial_rx_credits: params.initial_rx_credits,
                low_watermark: params.low_watermark.min(params.initial_rx_credits),
                rx_sdu: None,
            }),
        };

        let remote_mtu = match params.mode {
            ChannelMode::LeCreditBased => L2CAP_LE_MIN_MTU,
            _ => L2CAP_DEFAULT_MTU,
        };

        Self {
            local_cid,
            remote_cid: L2CAP_NULL_CID,
            handle,
            psm,
            mode: params.mode,
            state: L2capChannelState::Closed,
            outgoing,
            local_mtu,
            remote_mtu,
            required_security: SecurityLevel::Level0,
            signal_id: None,
            rtx_deadline: None,
            config: ConfigState::default(),
            flow,
            handler: None,
            wants_send: false,
        }
    }

    pub fn local_cid(&self) -> ChannelId {
        self.local_cid
    }

    pub fn remote_cid(&self) -> ChannelId {
        self.remote_cid
    }

    pub fn handle(&self) -> u16 {
        self.handle
    }

    pub fn psm(&self) -> u16 {
        self.psm
    }

    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    pub fn state(&self) -> L2capChannelState {
        self.state
    }

    pub fn is_outgoing(&self) -> bool {
        self.outgoing
    }

    pub fn local_mtu(&self) -> u16 {
        self.local_mtu
    }

    pub fn remote_mtu(&self) -> u16 {
        self.remote_mtu
    }

    /// K-frames this side may still send; `None` for other modes
    pub fn tx_credits(&self) -> Option<u16> {
        match &self.flow {
            FlowState::Credit(credit) => Some(credit.tx_credits),
            _ => None,
        }
    }

    /// K-frames the peer may still send; `None` for other modes
    pub fn rx_credits(&self) -> Option<u16> {
        match &self.flow {
            FlowState::Credit(credit) => Some(credit.rx_credits),
            _ => None,
        }
    }

    /// I-frames sent and not yet acknowledged; `None` outside enhanced retransmission
    pub fn unacked_frames(&self) -> Option<usize> {
        match &self.flow {
            FlowState::Ertm(ertm) => Some(ertm.unacked()),
            _ => None,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state == L2capChannelState::Open
    }

    /// Whether at least a minimal SDU fits the current window or credits
    pub(crate) fn can_send(&self) -> bool {
        self.is_open()
            && match &self.flow {
                FlowState::Credit(credit) => credit.tx_credits > 0,
                FlowState::Ertm(ertm) => ertm.window_open(),
                _ => true,
            }
    }

    /// Options for our configure request
    pub(crate) fn local_config(&self) -> ConfigOptions {
        let mut options = ConfigOptions {
            mtu: Some(self.local_mtu),
            ..Default::default()
        };
        match &self.flow {
            FlowState::Ertm(ertm) => {
                options.retransmission = Some(RetransmissionFlowControl::for_mode(
                    RetransmissionMode::EnhancedRetransmission,
                    ertm.local_tx_window,
                    ertm.local_mps,
                ));
                options.fcs = Some(L2CAP_FCS_CRC16);
            }
            FlowState::Streaming(streaming) => {
                options.retransmission = Some(RetransmissionFlowControl::for_mode(
                    RetransmissionMode::Streaming,
                    0,
                    streaming.local_mps,
                ));
                options.fcs = Some(L2CAP_FCS_CRC16);
            }
            _ => {}
        }
        options
    }

    /// Check the peer's configuration; on success adopt it, otherwise
    /// return the result code and the options to propose instead.
    pub(crate) fn apply_remote_config(&mut self, options: &ConfigOptions) -> Result<(), (u16, ConfigOptions)> {
        if !options.unknown.is_empty() {
            return Err((L2CAP_CONF_UNKNOWN_OPTIONS, ConfigOptions::default()));
        }

        if let Some(mtu) = options.mtu {
            if mtu < L2CAP_MIN_MTU {
                let counter = ConfigOptions {
                    mtu: Some(L2CAP_MIN_MTU),
                    ..Default::default()
                };
                return Err((L2CAP_CONF_UNACCEPTABLE_PARAMS, counter));
            }
        }

        let requested = options
            .retransmission
            .map(|rfc| rfc.mode)
            .unwrap_or(RetransmissionMode::Basic);
        if self.mode.retransmission_mode() != Some(requested) {
            let counter = ConfigOptions {
                retransmission: self.local_config().retransmission.or(Some(RetransmissionFlowControl::default())),
                ..Default::default()
            };
            return Err((L2CAP_CONF_UNACCEPTABLE_PARAMS, counter));
        }

        self.remote_mtu = options.mtu.unwrap_or(L2CAP_DEFAULT_MTU);
        match (&mut self.flow, options.retransmission) {
            (FlowState::Ertm(ertm), Some(rfc)) => {
                ertm.remote_tx_window = rfc.tx_window_size.clamp(1, L2CAP_ERTM_MAX_TX_WINDOW);
                ertm.remote_mps = rfc.max_pdu_size.max(L2CAP_SDU_LENGTH_SIZE as u16 + 1);
                ertm.max_transmit = rfc.max_transmit;
                if rfc.retransmit_timeout > 0 {
                    ertm.retransmit_timeout = Duration::from_millis(rfc.retransmit_timeout as u64);
                }
            }
            (FlowState::Streaming(streaming), Some(rfc)) => {
                streaming.remote_mps = rfc.max_pdu_size.max(L2CAP_SDU_LENGTH_SIZE as u16 + 1);
            }
            _ => {}
        }
        Ok(())
    }

    /// Adopt LE credit-based parameters from the peer
    pub(crate) fn apply_le_params(&mut self, remote_cid: ChannelId, mtu: u16, mps: u16, credits: u16) {
        self.remote_cid = remote_cid;
        self.remote_mtu = mtu;
        if let FlowState::Credit(credit) = &mut self.flow {
            credit.remote_mps = mps.max(L2CAP_SDU_LENGTH_SIZE as u16 + 1);
            credit.tx_credits = credits;
        }
    }

    /// Sizes of the PDUs `send` would produce for an SDU of `len` bytes.
    ///
    /// Fails with `WouldBlock` when the window or credits do not cover
    /// every PDU of the SDU.
    pub(crate) fn plan_send(&self, len: usize) -> L2capResult<Vec<usize>> {
        if !self.is_open() {
            return Err(L2capError::InvalidState);
        }
        if len > self.remote_mtu as usize {
            return Err(L2capError::MtuExceeded {
                size: len,
                mtu: self.remote_mtu,
            });
        }

        let control = L2CAP_CONTROL_SIZE + L2CAP_FCS_SIZE;
        let sizes = match &self.flow {
            FlowState::Basic => vec![L2CAP_BASIC_HEADER_SIZE + len],
            FlowState::Credit(credit) => {
                let segments = k_frame_segments(len, credit.remote_mps);
                if segments.len() > credit.tx_credits as usize {
                    return Err(L2capError::WouldBlock);
                }
                segments
                    .iter()
                    .map(|(sdu_length, range)| frame_size(*sdu_length, range, 0))
                    .collect()
            }
            FlowState::Ertm(ertm) => {
                let segments = sar_segments(len, ertm.remote_mps);
                if ertm.remote_busy || ertm.unacked.len() + segments.len() > ertm.remote_tx_window as usize {
                    return Err(L2capError::WouldBlock);
                }
                segments
                    .iter()
                    .map(|(_, sdu_length, range)| frame_size(*sdu_length, range, control))
                    .collect()
            }
            FlowState::Streaming(streaming) => sar_segments(len, streaming.remote_mps)
                .iter()
                .map(|(_, sdu_length, range)| frame_size(*sdu_length, range, control))
                .collect(),
        };
        Ok(sizes)
    }

    /// Build the PDUs for `sdu`, consuming credits or window space.
    /// Callers must have checked `plan_send` first.
    pub(crate) fn build_pdus(&mut self, sdu: &[u8], now: Instant) -> Vec<Vec<u8>> {
        let remote_cid = self.remote_cid;
        match &mut self.flow {
            FlowState::Basic => vec![L2capPacket::new(remote_cid, sdu.to_vec()).to_bytes()],
            FlowState::Credit(credit) => k_frame_segments(sdu.len(), credit.remote_mps)
                .into_iter()
                .map(|(sdu_length, range)| {
                    credit.tx_credits = credit.tx_credits.saturating_sub(1);
                    build_k_frame(remote_cid, sdu_length, &sdu[range])
                })
                .collect(),
            FlowState::Ertm(ertm) => {
                let mut pdus = Vec::new();
                for (sar, sdu_length, range) in sar_segments(sdu.len(), ertm.remote_mps) {
                    let frame = SentFrame {
                        tx_seq: ertm.next_tx_seq,
                        sar,
                        sdu_length,
                        payload: sdu[range].to_vec(),
                        transmit_count: 1,
                    };
                    pdus.push(ertm_i_frame(remote_cid, &frame, ertm.expected_tx_seq));
                    ertm.next_tx_seq = seq_next(ertm.next_tx_seq);
                    ertm.unacked.push_back(frame);
                }
                if ertm.retransmit_deadline.is_none() {
                    ertm.retransmit_deadline = Some(now + ertm.retransmit_timeout);
                }
                pdus
            }
            FlowState::Streaming(streaming) => {
                let mut pdus = Vec::new();
                for (sar, sdu_length, range) in sar_segments(sdu.len(), streaming.remote_mps) {
                    let control = L2capControlField::new_i_frame(streaming.next_tx_seq, 0, sar, false);
                    pdus.push(build_frame(remote_cid, control, sdu_length, &sdu[range], true));
                    streaming.next_tx_seq = seq_next(streaming.next_tx_seq);
                }
                pdus
            }
        }
    }

    /// Process one complete PDU addressed to this channel
    pub(crate) fn receive(&mut self, pdu: &[u8], now: Instant) -> RxResult {
        let local_mtu = self.local_mtu;
        let remote_cid = self.remote_cid;
        let payload = &pdu[L2CAP_BASIC_HEADER_SIZE..];

        match &mut self.flow {
            FlowState::Basic => {
                if payload.len() > local_mtu as usize {
                    return RxResult::violation(format!(
                        "basic frame of {} bytes exceeds MTU {}",
                        payload.len(),
                        local_mtu
                    ));
                }
                RxResult {
                    sdus: vec![payload.to_vec()],
                    ..Default::default()
                }
            }
            FlowState::Credit(credit) => receive_k_frame(credit, payload, local_mtu),
            FlowState::Ertm(ertm) => receive_ertm(ertm, remote_cid, pdu, local_mtu, now),
            FlowState::Streaming(streaming) => {
                let (control, info) = match parse_frame(pdu, true) {
                    Ok(parsed) => parsed,
                    Err(e) => return RxResult::violation(e.to_string()),
                };
                if control.supervisory {
                    return RxResult::default();
                }
                if control.tx_seq != streaming.expected_tx_seq {
                    // Lost frames cannot be recovered in streaming mode
                    streaming.rx.reset();
                }
                streaming.expected_tx_seq = seq_next(control.tx_seq);
                match streaming.rx.push(control.sar, info, local_mtu) {
                    Ok(sdu) => RxResult {
                        sdus: sdu.into_iter().collect(),
                        ..Default::default()
                    },
                    Err(reason) => RxResult::violation(reason),
                }
            }
        }
    }

    /// Retransmission timer handling; returns frames to resend
    pub(crate) fn poll_timers(&mut self, now: Instant) -> RxResult {
        let remote_cid = self.remote_cid;
        let FlowState::Ertm(ertm) = &mut self.flow else {
            return RxResult::default();
        };
        match ertm.retransmit_deadline {
            Some(deadline) if deadline <= now => {
                let mut result = RxResult::default();
                retransmit(ertm, remote_cid, None, now, &mut result);
                result
            }
            _ => RxResult::default(),
        }
    }
}

fn frame_size(sdu_length: Option<u16>, range: &Range<usize>, control: usize) -> usize {
    L2CAP_BASIC_HEADER_SIZE
        + control
        + sdu_length.map_or(0, |_| L2CAP_SDU_LENGTH_SIZE)
        + range.len()
}

fn seq_next(seq: u8) -> u8 {
    (seq + 1) % L2CAP_SEQ_MODULO
}

/// Frames from `from` up to but excluding `to`, modulo 64
fn seq_distance(from: u8, to: u8) -> u8 {
    (to + L2CAP_SEQ_MODULO - from) % L2CAP_SEQ_MODULO
}

/// Split an SDU into I-frame segments no larger than `mps`
fn sar_segments(len: usize, mps: u16) -> Vec<(u8, Option<u16>, Range<usize>)> {
    let mps = (mps as usize).max(L2CAP_SDU_LENGTH_SIZE + 1);
    if len <= mps {
        return vec![(L2CAP_SAR_UNSEGMENTED, None, 0..len)];
    }

    let first = mps - L2CAP_SDU_LENGTH_SIZE;
    let mut segments = vec![(L2CAP_SAR_START, Some(len as u16), 0..first)];
    let mut offset = first;
    while offset < len {
        let end = (offset + mps).min(len);
        let sar = if end == len {
            L2CAP_SAR_END
        } else {
            L2CAP_SAR_CONTINUATION
        };
        segments.push((sar, None, offset..end));
        offset = end;
    }
    segments
}

/// Split an SDU into K-frames; the first carries the SDU length
fn k_frame_segments(len: usize, mps: u16) -> Vec<(Option<u16>, Range<usize>)> {
    let mps = (mps as usize).max(L2CAP_SDU_LENGTH_SIZE + 1);
    let first = (mps - L2CAP_SDU_LENGTH_SIZE).min(len);
    let mut segments = vec![(Some(len as u16), 0..first)];
    let mut offset = first;
    while offset < len {
        let end = (offset + mps).min(len);
        segments.push((None, offset..end));
        offset = end;
    }
    segments
}

fn receive_k_frame(credit: &mut CreditState, payload: &[u8], local_mtu: u16) -> RxResult {
    if credit.rx_credits == 0 {
        return RxResult::violation("K-frame received without credits");
    }
    credit.rx_credits -= 1;

    let mut result = if payload.len() > credit.local_mps as usize {
        credit.rx_sdu = None;
        RxResult::violation(format!(
            "K-frame of {} bytes exceeds MPS {}",
            payload.len(),
            credit.local_mps
        ))
    } else {
        match credit.rx_sdu.take() {
            None if payload.len() < L2CAP_SDU_LENGTH_SIZE => {
                RxResult::violation("first K-frame without SDU length")
            }
            None => {
                let length = LittleEndian::read_u16(payload) as usize;
                let data = &payload[L2CAP_SDU_LENGTH_SIZE..];
                if length > local_mtu as usize {
                    RxResult::violation(format!("SDU of {} bytes exceeds MTU {}", length, local_mtu))
                } else if data.len() > length {
                    RxResult::violation("K-frame exceeds SDU length")
                } else if data.len() == length {
                    RxResult {
                        sdus: vec![data.to_vec()],
                        ..Default::default()
                    }
                } else {
                    credit.rx_sdu = Some((length, data.to_vec()));
                    RxResult::default()
                }
            }
            Some((length, mut buffer)) => {
                buffer.extend_from_slice(payload);
                if buffer.len() > length {
                    RxResult::violation("K-frames exceed SDU length")
                } else if buffer.len() == length {
                    RxResult {
                        sdus: vec![buffer],
                        ..Default::default()
                    }
                } else {
                    credit.rx_sdu = Some((length, buffer));
                    RxResult::default()
                }
            }
        }
    };

    if credit.rx_credits <= credit.low_watermark {
        let grant = credit.initial_rx_credits - credit.rx_credits;
        if grant > 0 {
            credit.rx_credits = credit.initial_rx_credits;
            result.credits_to_grant = grant;
        }
    }
    result
}

fn ertm_i_frame(remote_cid: ChannelId, frame: &SentFrame, req_seq: u8) -> Vec<u8> {
    let control = L2capControlField::new_i_frame(frame.tx_seq, req_seq, frame.sar, false);
    build_frame(remote_cid, control, frame.sdu_length, &frame.payload, true)
}

fn ertm_s_frame(remote_cid: ChannelId, function: u8, req_seq: u8, final_bit: bool) -> Vec<u8> {
    let control = L2capControlField::new_s_frame(function, req_seq, false, final_bit);
    build_frame(remote_cid, control, None, &[], true)
}

/// Drop acknowledged frames; false if `req_seq` acknowledges frames never sent
fn ertm_acknowledge(ertm: &mut ErtmState, req_seq: u8, now: Instant) -> bool {
    let acked = seq_distance(ertm.expected_ack_seq, req_seq) as usize;
    if acked > ertm.unacked.len() {
        return false;
    }
    ertm.unacked.drain(..acked);
    ertm.expected_ack_seq = req_seq;
    ertm.retransmit_deadline = if ertm.unacked.is_empty() {
        None
    } else if acked > 0 {
        Some(now + ertm.retransmit_timeout)
    } else {
        ertm.retransmit_deadline
    };
    true
}

/// Resend unacknowledged frames, all of them or only `only`
fn retransmit(ertm: &mut ErtmState, remote_cid: ChannelId, only: Option<u8>, now: Instant, result: &mut RxResult) {
    let req_seq = ertm.expected_tx_seq;
    for frame in ertm.unacked.iter_mut() {
        if only.is_some_and(|seq| seq != frame.tx_seq) {
            continue;
        }
        if ertm.max_transmit != 0 && frame.transmit_count >= ertm.max_transmit {
            result.failed = true;
            return;
        }
        frame.transmit_count += 1;
        result.frames.push(ertm_i_frame(remote_cid, frame, req_seq));
    }
    if !ertm.unacked.is_empty() {
        ertm.retransmit_deadline = Some(now + ertm.retransmit_timeout);
    }
}

fn receive_ertm(ertm: &mut ErtmState, remote_cid: ChannelId, pdu: &[u8], local_mtu: u16, now: Instant) -> RxResult {
    let (control, info) = match parse_frame(pdu, true) {
        Ok(parsed) => parsed,
        Err(e) => return RxResult::violation(e.to_string()),
    };

    let mut result = RxResult::default();
    let was_open = ertm.window_open();

    if control.supervisory {
        if control.supervisory_function == L2CAP_SUPERVISORY_SREJ {
            retransmit(ertm, remote_cid, Some(control.req_seq), now, &mut result);
            return result;
        }
        if !ertm_acknowledge(ertm, control.req_seq, now) {
            return RxResult::violation(format!("ReqSeq {} acknowledges unsent frames", control.req_seq));
        }
        match control.supervisory_function {
            L2CAP_SUPERVISORY_RNR => ertm.remote_busy = true,
            L2CAP_SUPERVISORY_REJ => {
                ertm.remote_busy = false;
                retransmit(ertm, remote_cid, None, now, &mut result);
            }
            _ => ertm.remote_busy = false,
        }
        if control.poll {
            result.frames.push(ertm_s_frame(remote_cid, L2CAP_SUPERVISORY_RR, ertm.expected_tx_seq, true));
        }
    } else {
        if !ertm_acknowledge(ertm, control.req_seq, now) {
            return RxResult::violation(format!("ReqSeq {} acknowledges unsent frames", control.req_seq));
        }

        if control.tx_seq == ertm.expected_tx_seq {
            ertm.expected_tx_seq = seq_next(ertm.expected_tx_seq);
            ertm.reject_sent = false;
            match ertm.rx.push(control.sar, info, local_mtu) {
                Ok(Some(sdu)) => result.sdus.push(sdu),
                Ok(None) => {}
                Err(reason) => result.violation = Some(reason),
            }
            result.frames.push(ertm_s_frame(remote_cid, L2CAP_SUPERVISORY_RR, ertm.expected_tx_seq, false));
        } else {
            let behind = seq_distance(control.tx_seq, ertm.expected_tx_seq);
            let duplicate = behind > 0 && behind <= ertm.local_tx_window;
            if !duplicate && !ertm.reject_sent {
                ertm.reject_sent = true;
                result.frames.push(ertm_s_frame(remote_cid, L2CAP_SUPERVISORY_REJ, ertm.expected_tx_seq, false));
            }
        }
    }

    result.window_opened = !was_open && ertm.window_open();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sar_segments_cover_sdu() {
        let segments = sar_segments(250, 100);
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0], (L2CAP_SAR_START, Some(250), 0..98));
        assert_eq!(segments[1], (L2CAP_SAR_CONTINUATION, None, 98..198));
        assert_eq!(segments[2], (L2CAP_SAR_END, None, 198..250));

        assert_eq!(sar_segments(100, 100), vec![(L2CAP_SAR_UNSEGMENTED, None, 0..100)]);
    }

    #[test]
    fn test_k_frame_segments_reserve_sdu_length() {
        assert_eq!(k_frame_segments(21, 23), vec![(Some(21), 0..21)]);
        assert_eq!(k_frame_segments(22, 23), vec![(Some(22), 0..21), (None, 21..22)]);
        assert_eq!(k_frame_segments(0, 23), vec![(Some(0), 0..0)]);
    }

    #[test]
    fn test_sdu_assembly() {
        let mut assembly = SduAssembly::default();
        assert_eq!(assembly.push(L2CAP_SAR_START, &[5, 0, 1, 2], 100), Ok(None));
        assert_eq!(assembly.push(L2CAP_SAR_CONTINUATION, &[3], 100), Ok(None));
        assert_eq!(assembly.push(L2CAP_SAR_END, &[4, 5], 100), Ok(Some(vec![1, 2, 3, 4, 5])));

        assert!(assembly.push(L2CAP_SAR_END, &[1], 100).is_err());
        assert!(assembly.push(L2CAP_SAR_START, &[200, 0, 1], 100).is_err());
    }

    #[test]
    fn test_seq_distance_wraps() {
        assert_eq!(seq_distance(62, 1), 3);
        assert_eq!(seq_distance(5, 5), 0);
        assert_eq!(seq_next(63), 0);
    }

    #[test]
    fn test_credit_grant_saturates() {
        let mut credit = CreditState {
            tx_credits: 65000,
            rx_credits: 0,
            local_mps: 23,
            remote_mps: 23,
            initial_rx_credits: 0,
            low_watermark: 0,
            rx_sdu: None,
        };
        assert!(credit.grant(535));
        assert_eq!(credit.tx_credits, 65535);
        assert!(!credit.grant(1));
        assert_eq!(credit.tx_credits, L2CAP_LE_MAX_CREDITS);
    }
}
