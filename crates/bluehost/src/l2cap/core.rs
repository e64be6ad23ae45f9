//! L2CAP multiplexer
//!
//! This module provides the multiplexer that handles:
//! - Channel management and CID allocation
//! - ACL reassembly, fragmentation and controller buffer accounting
//! - Signaling commands
//! - Connection setup and teardown
//!
//! The multiplexer never touches the transport. Outgoing ACL packets are
//! queued and drained by the host with `pop_transmit`, and requests for
//! the host (authentication, connection parameter updates) come out of
//! `take_events`.

use super::channel::{
    ChannelHandler, FlowParams, FlowState, IncomingChannel, L2capChannel, RxResult, ServiceAcceptor,
};
use super::constants::*;
use super::packet::L2capHeader;
use super::psm::{is_valid_classic_psm, is_valid_le_psm, PsmAllocator};
use super::signaling::{SignalId, SignalingMessage};
use super::types::*;
use crate::config::HostConfig;
use crate::gap::{LinkType, Role, SecurityLevel};
use crate::hci::packet::{encode_acl, PacketBoundary};
use log::{debug, info, trace, warn};
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

/// Extended response timeout after a pending result
const ERTX_TIMEOUT: Duration = Duration::from_secs(60);

/// Multiplexer settings taken from the host configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxSettings {
    pub local_mtu: u16,
    pub le_initial_credits: u16,
    pub le_credit_low_watermark: u16,
    pub rtx_timeout: Duration,
}

impl Default for MuxSettings {
    fn default() -> Self {
        Self::from(&HostConfig::default())
    }
}

impl From<&HostConfig> for MuxSettings {
    fn from(config: &HostConfig) -> Self {
        Self {
            local_mtu: config.l2cap_local_mtu,
            le_initial_credits: config.le_initial_credits,
            le_credit_low_watermark: config.le_credit_low_watermark,
            rtx_timeout: config.l2cap_rtx_timeout,
        }
    }
}

/// Requests and reports the multiplexer raises for the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxEvent {
    /// An outgoing channel waits for the link to be authenticated
    SecurityRequired { handle: u16, level: SecurityLevel },
    /// A peripheral asked for new connection parameters and we accepted
    ConnectionParametersRequested {
        handle: u16,
        params: ConnectionParameterUpdate,
    },
    /// The central answered our connection parameter update request
    ConnectionParameterUpdateResult { handle: u16, accepted: bool },
    /// Data on a fixed channel other than signaling
    FixedChannelData {
        handle: u16,
        cid: ChannelId,
        data: Vec<u8>,
    },
    EchoResponse { handle: u16, data: Vec<u8> },
    InformationResponse {
        handle: u16,
        info_type: u16,
        result: u16,
        data: Vec<u8>,
    },
}

/// One ACL packet ready for the transport, type tag included
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingAcl {
    pub handle: u16,
    pub packet: Vec<u8>,
}

/// Multiplexer counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MuxStats {
    pub pdus_received: u64,
    pub pdus_sent: u64,
    pub protocol_violations: u64,
}

/// Upper-layer notifications, delivered after state updates settle
enum Notification {
    Opened(ChannelId),
    OpenFailed(ChannelId, L2capError),
    Data(ChannelId, Vec<u8>),
    CanSendNow(ChannelId),
    Closed(ChannelId, CloseReason),
}

struct Service {
    policy: ServicePolicy,
    acceptor: Box<dyn ServiceAcceptor>,
}

#[derive(Debug)]
struct PendingDisconnect {
    handle: u16,
    identifier: SignalId,
    deadline: Instant,
}

/// Per-link state of the multiplexer
#[derive(Debug)]
struct Link {
    link_type: LinkType,
    role: Role,
    security: SecurityLevel,
    next_identifier: SignalId,
    reassembly: Option<Vec<u8>>,
    /// Controller buffers held by packets of this link
    acl_in_flight: u16,
}

impl Link {
    fn is_le(&self) -> bool {
        self.link_type == LinkType::Le
    }

    /// Signaling identifiers run 1..=255; zero is never used
    fn allocate_identifier(&mut self) -> SignalId {
        let identifier = self.next_identifier;
        self.next_identifier = if identifier == u8::MAX { 1 } else { identifier + 1 };
        identifier
    }

    /// Collect ACL fragments until the L2CAP basic header length is satisfied
    fn reassemble(&mut self, boundary: PacketBoundary, payload: &[u8]) -> Result<Option<Vec<u8>>, String> {
        if boundary.is_start() {
            if let Some(partial) = self.reassembly.take() {
                warn!("Dropping incomplete L2CAP PDU of {} bytes", partial.len());
            }
            self.reassembly = Some(payload.to_vec());
        } else {
            match self.reassembly.as_mut() {
                Some(buffer) => buffer.extend_from_slice(payload),
                None => return Err("continuation fragment without start".into()),
            }
        }

        let Some(buffer) = self.reassembly.as_ref() else {
            return Ok(None);
        };
        let Some(header) = L2capHeader::parse(buffer) else {
            return Ok(None);
        };
        let total = L2CAP_BASIC_HEADER_SIZE + header.length as usize;
        match buffer.len().cmp(&total) {
            Ordering::Less => Ok(None),
            Ordering::Equal => Ok(self.reassembly.take()),
            Ordering::Greater => {
                self.reassembly = None;
                Err(format!("ACL data exceeds L2CAP length {}", header.length))
            }
        }
    }
}

/// L2CAP multiplexer over all ACL links of one host
pub struct L2capMux {
    settings: MuxSettings,
    links: HashMap<u16, Link>,
    /// Channels by local CID
    channels: HashMap<ChannelId, L2capChannel>,
    /// Registered services by (PSM, LE)
    services: HashMap<(u16, bool), Service>,
    /// Handlers of closed channels awaiting their final notification
    detached: HashMap<ChannelId, Box<dyn ChannelHandler>>,
    in_callback: Option<ChannelId>,
    notifications: VecDeque<Notification>,
    delivering: bool,
    pending_disconnects: Vec<PendingDisconnect>,
    next_cid: ChannelId,
    next_le_cid: ChannelId,
    psm_allocator: PsmAllocator,
    acl_packet_len: Option<usize>,
    acl_total: Option<u16>,
    acl_in_flight: u16,
    tx_queue: VecDeque<OutgoingAcl>,
    events: VecDeque<MuxEvent>,
    stats: MuxStats,
}

impl fmt::Debug for L2capMux {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("L2capMux")
            .field("links", &self.links.len())
            .field("channels", &self.channels.len())
            .field("services", &self.services.len())
            .field("queued", &self.tx_queue.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl Default for L2capMux {
    fn default() -> Self {
        Self::new(MuxSettings::default())
    }
}

/// Access to a channel from inside one of its handler callbacks
pub struct ChannelContext<'a> {
    mux: &'a mut L2capMux,
    cid: ChannelId,
}

impl ChannelContext<'_> {
    pub fn cid(&self) -> ChannelId {
        self.cid
    }

    pub fn channel(&self) -> Option<&L2capChannel> {
        self.mux.channel(self.cid)
    }

    pub fn send(&mut self, data: &[u8]) -> L2capResult<()> {
        self.mux.send(self.cid, data)
    }

    pub fn request_can_send_now(&mut self) -> L2capResult<()> {
        self.mux.request_can_send_now(self.cid)
    }

    pub fn close(&mut self) -> L2capResult<()> {
        self.mux.close_channel(self.cid)
    }

    /// The whole multiplexer, for work on other channels
    pub fn mux(&mut self) -> &mut L2capMux {
        self.mux
    }
}

impl L2capMux {
    pub fn new(settings: MuxSettings) -> Self {
        Self {
            settings,
            links: HashMap::new(),
            channels: HashMap::new(),
            services: HashMap::new(),
            detached: HashMap::new(),
            in_callback: None,
            notifications: VecDeque::new(),
            delivering: false,
            pending_disconnects: Vec::new(),
            next_cid: L2CAP_DYNAMIC_CID_MIN,
            next_le_cid: L2CAP_DYNAMIC_CID_MIN,
            psm_allocator: PsmAllocator::default(),
            acl_packet_len: None,
            acl_total: None,
            acl_in_flight: 0,
            tx_queue: VecDeque::new(),
            events: VecDeque::new(),
            stats: MuxStats::default(),
        }
    }

    pub fn settings(&self) -> &MuxSettings {
        &self.settings
    }

    pub fn stats(&self) -> &MuxStats {
        &self.stats
    }

    /// Controller ACL buffer geometry from Read Buffer Size.
    /// Until this is called buffers are treated as unlimited.
    pub fn set_acl_buffers(&mut self, packet_len: u16, count: u16) {
        debug!("ACL buffers: {} x {} bytes", count, packet_len);
        self.acl_packet_len = (packet_len > 0).then_some(packet_len as usize);
        self.acl_total = Some(count);
    }

    /// Free controller buffers, `None` when unlimited
    pub fn acl_buffers_available(&self) -> Option<u16> {
        self.acl_total.map(|total| total.saturating_sub(self.acl_in_flight))
    }

    pub fn queued_packets(&self) -> usize {
        self.tx_queue.len()
    }

    pub fn add_link(&mut self, handle: u16, link_type: LinkType, role: Role) {
        if self.links.contains_key(&handle) {
            warn!("L2CAP link 0x{:04X} already present", handle);
            return;
        }
        debug!("L2CAP link 0x{:04X} added ({:?}, {:?})", handle, link_type, role);
        self.links.insert(
            handle,
            Link {
                link_type,
                role,
                security: SecurityLevel::Level0,
                next_identifier: 1,
                reassembly: None,
                acl_in_flight: 0,
            },
        );
    }

    pub fn has_link(&self, handle: u16) -> bool {
        self.links.contains_key(&handle)
    }

    pub fn link_security(&self, handle: u16) -> Option<SecurityLevel> {
        self.links.get(&handle).map(|link| link.security)
    }

    /// Drop a link and every channel on it; returns the number of channels closed
    pub fn remove_link(&mut self, handle: u16) -> usize {
        let Some(link) = self.links.remove(&handle) else {
            return 0;
        };

        self.acl_in_flight = self.acl_in_flight.saturating_sub(link.acl_in_flight);
        self.tx_queue.retain(|outgoing| outgoing.handle != handle);
        self.pending_disconnects.retain(|pending| pending.handle != handle);

        let mut cids = self.channels_on_link(handle);
        cids.sort_unstable();
        for cid in &cids {
            if let Some(channel) = self.channels.remove(cid) {
                let notification = if channel.is_open() {
                    Notification::Closed(*cid, CloseReason::LinkLost)
                } else {
                    Notification::OpenFailed(*cid, L2capError::ConnectionTerminated)
                };
                self.detach(channel, notification);
            }
        }
        if !cids.is_empty() {
            info!("Closed {} L2CAP channels with link 0x{:04X}", cids.len(), handle);
        }

        self.wake_channels();
        self.deliver_notifications();
        cids.len()
    }

    /// Record a new link security level and resume channels waiting for it
    pub fn set_link_security(&mut self, handle: u16, level: SecurityLevel) {
        let Some(link) = self.links.get_mut(&handle) else {
            return;
        };
        link.security = level;

        let mut waiting: Vec<(ChannelId, bool)> = self
            .channels
            .values()
            .filter(|channel| channel.handle == handle && channel.state == L2capChannelState::WaitSecurity)
            .map(|channel| (channel.local_cid, channel.required_security <= level))
            .collect();
        waiting.sort_unstable();

        for (cid, satisfied) in waiting {
            if satisfied {
                self.send_connect_request(cid);
            } else {
                self.fail_open(cid, L2capError::SecurityRequirementsNotMet);
            }
        }
        self.deliver_notifications();
    }

    /// Authentication failed; channels waiting on it cannot open
    pub fn security_failed(&mut self, handle: u16) {
        let mut waiting: Vec<ChannelId> = self
            .channels
            .values()
            .filter(|channel| channel.handle == handle && channel.state == L2capChannelState::WaitSecurity)
            .map(|channel| channel.local_cid)
            .collect();
        waiting.sort_unstable();

        for cid in waiting {
            self.fail_open(cid, L2capError::SecurityRequirementsNotMet);
        }
        self.deliver_notifications();
    }

    /// Accept incoming channels for `psm` with the given policy
    pub fn register_service(
        &mut self,
        psm: u16,
        policy: ServicePolicy,
        acceptor: Box<dyn ServiceAcceptor>,
    ) -> L2capResult<()> {
        let le = policy.mode == ChannelMode::LeCreditBased;
        let valid = if le {
            is_valid_le_psm(psm)
        } else {
            is_valid_classic_psm(psm)
        };
        if !valid {
            return Err(L2capError::InvalidParameter(format!("Invalid PSM 0x{:04X}", psm)));
        }
        if self.services.contains_key(&(psm, le)) {
            return Err(L2capError::InvalidParameter(format!(
                "PSM 0x{:04X} already registered",
                psm
            )));
        }

        info!("Registered L2CAP service on PSM 0x{:04X} ({})", psm, policy.mode);
        self.services.insert((psm, le), Service { policy, acceptor });
        Ok(())
    }

    pub fn unregister_service(&mut self, psm: u16, le: bool) -> L2capResult<()> {
        self.services
            .remove(&(psm, le))
            .map(|_| ())
            .ok_or(L2capError::PsmNotRegistered(psm))
    }

    /// An unregistered dynamic PSM
    pub fn allocate_psm(&mut self, le: bool) -> Option<u16> {
        let services = &self.services;
        if le {
            self.psm_allocator.le(|psm| services.contains_key(&(psm, true)))
        } else {
            self.psm_allocator.classic(|psm| services.contains_key(&(psm, false)))
        }
    }

    /// Start opening a channel; the handler learns the outcome through
    /// `on_opened` or `on_open_failed`.
    pub fn open_channel(
        &mut self,
        handle: u16,
        spec: ChannelSpec,
        handler: Box<dyn ChannelHandler>,
    ) -> L2capResult<ChannelId> {
        let link = self.links.get(&handle).ok_or(L2capError::UnknownLink(handle))?;
        let le = spec.mode == ChannelMode::LeCreditBased;
        if le != link.is_le() {
            return Err(L2capError::InvalidParameter(format!(
                "{} channel on a {:?} link",
                spec.mode, link.link_type
            )));
        }

        let (psm_ok, min_mtu) = if le {
            (is_valid_le_psm(spec.psm), L2CAP_LE_MIN_MTU)
        } else {
            (is_valid_classic_psm(spec.psm), L2CAP_MIN_MTU)
        };
        if !psm_ok {
            return Err(L2capError::InvalidParameter(format!("Invalid PSM 0x{:04X}", spec.psm)));
        }
        let mtu = spec.mtu.unwrap_or(self.settings.local_mtu);
        if mtu < min_mtu {
            return Err(L2capError::InvalidParameter(format!("MTU {} below minimum {}", mtu, min_mtu)));
        }
        if le && spec.mps < L2CAP_LE_MIN_MTU {
            return Err(L2capError::InvalidParameter(format!("MPS {} below minimum", spec.mps)));
        }

        let link_security = link.security;
        let cid = self.allocate_cid(le)?;
        let initial_credits = spec.initial_credits.unwrap_or(self.settings.le_initial_credits);
        let mut channel = L2capChannel::new(
            cid,
            handle,
            spec.psm,
            mtu,
            true,
            FlowParams {
                mode: spec.mode,
                mps: spec.mps,
                tx_window: spec.tx_window,
                initial_rx_credits: initial_credits,
                low_watermark: self.settings.le_credit_low_watermark,
            },
        );
        channel.required_security = spec.required_security;
        channel.handler = Some(handler);
        self.channels.insert(cid, channel);

        if link_security < spec.required_security {
            debug!(
                "L2CAP channel 0x{:04X} waits for {:?} on 0x{:04X}",
                cid, spec.required_security, handle
            );
            if let Some(channel) = self.channels.get_mut(&cid) {
                channel.state = L2capChannelState::WaitSecurity;
            }
            self.events.push_back(MuxEvent::SecurityRequired {
                handle,
                level: spec.required_security,
            });
        } else {
            self.send_connect_request(cid);
        }

        self.deliver_notifications();
        Ok(cid)
    }

    /// Queue one SDU on an open channel.
    ///
    /// The SDU is either accepted whole or refused with `WouldBlock`; a
    /// refused channel gets `on_can_send_now` once it may retry.
    pub fn send(&mut self, cid: ChannelId, data: &[u8]) -> L2capResult<()> {
        let channel = self.channels.get(&cid).ok_or(L2capError::ChannelNotFound(cid))?;
        let handle = channel.handle;
        let sizes = match channel.plan_send(data.len()) {
            Ok(sizes) => sizes,
            Err(L2capError::WouldBlock) => {
                self.mark_blocked(cid);
                return Err(L2capError::WouldBlock);
            }
            Err(e) => return Err(e),
        };

        let fragments = sizes.iter().map(|size| self.acl_fragments(*size)).sum();
        if !self.acl_room(fragments) {
            self.mark_blocked(cid);
            return Err(L2capError::WouldBlock);
        }

        let pdus = match self.channels.get_mut(&cid) {
            Some(channel) => channel.build_pdus(data, Instant::now()),
            None => return Err(L2capError::ChannelNotFound(cid)),
        };
        trace!("L2CAP 0x{:04X}: sending {} bytes in {} PDUs", cid, data.len(), pdus.len());
        for pdu in pdus {
            self.enqueue_pdu(handle, pdu);
        }
        Ok(())
    }

    /// Ask for `on_can_send_now`, immediately if the channel can send
    pub fn request_can_send_now(&mut self, cid: ChannelId) -> L2capResult<()> {
        let room = self.acl_room(1);
        let channel = self.channels.get_mut(&cid).ok_or(L2capError::ChannelNotFound(cid))?;
        if room && channel.can_send() {
            self.notifications.push_back(Notification::CanSendNow(cid));
        } else {
            channel.wants_send = true;
        }
        self.deliver_notifications();
        Ok(())
    }

    /// Tear down a channel and tell the peer. Local state is released
    /// immediately; an unanswered disconnection request is forgotten
    /// after the signaling timeout.
    pub fn close_channel(&mut self, cid: ChannelId) -> L2capResult<()> {
        if !self.channels.contains_key(&cid) {
            return Err(L2capError::ChannelNotFound(cid));
        }
        debug!("Closing L2CAP channel 0x{:04X}", cid);
        self.close_with(cid, CloseReason::Local);
        self.deliver_notifications();
        Ok(())
    }

    /// Feed one ACL data packet from the controller
    pub fn on_acl_received(&mut self, handle: u16, boundary: PacketBoundary, payload: &[u8]) -> L2capResult<()> {
        let link = self.links.get_mut(&handle).ok_or(L2capError::UnknownLink(handle))?;
        let pdu = match link.reassemble(boundary, payload) {
            Ok(Some(pdu)) => pdu,
            Ok(None) => return Ok(()),
            Err(reason) => {
                self.violation(handle, &reason);
                return Ok(());
            }
        };

        self.stats.pdus_received += 1;
        self.route_pdu(handle, &pdu);
        self.deliver_notifications();
        Ok(())
    }

    /// The controller finished `count` packets of `handle`
    pub fn on_packets_completed(&mut self, handle: u16, count: u16) {
        let freed = match self.links.get_mut(&handle) {
            Some(link) => {
                let freed = count.min(link.acl_in_flight);
                link.acl_in_flight -= freed;
                freed
            }
            None => 0,
        };
        if freed < count {
            debug!(
                "Controller completed {} packets on 0x{:04X} beyond those in flight",
                count - freed,
                handle
            );
        }
        self.acl_in_flight = self.acl_in_flight.saturating_sub(freed);
        self.wake_channels();
        self.deliver_notifications();
    }

    /// Next ACL packet the controller has a buffer for
    pub fn pop_transmit(&mut self) -> Option<OutgoingAcl> {
        if let Some(total) = self.acl_total {
            if self.acl_in_flight >= total {
                return None;
            }
        }
        let outgoing = self.tx_queue.pop_front()?;
        self.acl_in_flight = self.acl_in_flight.saturating_add(1);
        if let Some(link) = self.links.get_mut(&outgoing.handle) {
            link.acl_in_flight = link.acl_in_flight.saturating_add(1);
        }
        Some(outgoing)
    }

    /// Put back a packet the transport could not take
    pub fn restore_transmit(&mut self, outgoing: OutgoingAcl) {
        self.acl_in_flight = self.acl_in_flight.saturating_sub(1);
        if let Some(link) = self.links.get_mut(&outgoing.handle) {
            link.acl_in_flight = link.acl_in_flight.saturating_sub(1);
        }
        self.tx_queue.push_front(outgoing);
    }

    /// Expire signaling and retransmission timers
    pub fn tick(&mut self, now: Instant) {
        let mut expired: Vec<ChannelId> = self
            .channels
            .values()
            .filter(|channel| channel.rtx_deadline.is_some_and(|deadline| deadline <= now))
            .map(|channel| channel.local_cid)
            .collect();
        expired.sort_unstable();
        for cid in expired {
            warn!("L2CAP signaling timeout on channel 0x{:04X}", cid);
            self.fail_open(cid, L2capError::Timeout);
        }

        self.pending_disconnects.retain(|pending| {
            let keep = pending.deadline > now;
            if !keep {
                debug!(
                    "Disconnection request {} on 0x{:04X} unanswered",
                    pending.identifier, pending.handle
                );
            }
            keep
        });

        let mut retransmitting: Vec<(ChannelId, u16)> = self
            .channels
            .values()
            .filter(|channel| channel.is_open() && matches!(channel.flow, FlowState::Ertm(_)))
            .map(|channel| (channel.local_cid, channel.handle))
            .collect();
        retransmitting.sort_unstable();
        for (cid, handle) in retransmitting {
            let result = match self.channels.get_mut(&cid) {
                Some(channel) => channel.poll_timers(now),
                None => continue,
            };
            if !result.frames.is_empty() {
                debug!("L2CAP 0x{:04X}: retransmitting {} frames", cid, result.frames.len());
            }
            self.apply_rx_result(handle, cid, result);
        }

        self.deliver_notifications();
    }

    /// Send an echo request on a BR/EDR link
    pub fn echo_request(&mut self, handle: u16, data: &[u8]) -> L2capResult<()> {
        let identifier = self.classic_identifier(handle)?;
        self.send_signal(
            handle,
            SignalingMessage::EchoRequest {
                identifier,
                data: data.to_vec(),
            },
        );
        Ok(())
    }

    /// Query a peer's extended features or fixed channels
    pub fn information_request(&mut self, handle: u16, info_type: u16) -> L2capResult<()> {
        let identifier = self.classic_identifier(handle)?;
        self.send_signal(handle, SignalingMessage::InformationRequest { identifier, info_type });
        Ok(())
    }

    /// As an LE peripheral, ask the central for new connection parameters
    pub fn request_connection_parameter_update(
        &mut self,
        handle: u16,
        params: ConnectionParameterUpdate,
    ) -> L2capResult<()> {
        if !params.validate() {
            return Err(L2capError::InvalidParameter("connection parameters out of range".into()));
        }
        let link = self.links.get_mut(&handle).ok_or(L2capError::UnknownLink(handle))?;
        if !link.is_le() || link.role != Role::Peripheral {
            return Err(L2capError::InvalidState);
        }
        let identifier = link.allocate_identifier();
        self.send_signal(
            handle,
            SignalingMessage::ConnectionParameterUpdateRequest { identifier, params },
        );
        Ok(())
    }

    pub fn take_events(&mut self) -> Vec<MuxEvent> {
        self.events.drain(..).collect()
    }

    pub fn channel(&self, cid: ChannelId) -> Option<&L2capChannel> {
        self.channels.get(&cid)
    }

    pub fn channels_on_link(&self, handle: u16) -> Vec<ChannelId> {
        self.channels
            .values()
            .filter(|channel| channel.handle == handle)
            .map(|channel| channel.local_cid)
            .collect()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn pending_disconnects(&self) -> usize {
        self.pending_disconnects.len()
    }

    fn classic_identifier(&mut self, handle: u16) -> L2capResult<SignalId> {
        let link = self.links.get_mut(&handle).ok_or(L2capError::UnknownLink(handle))?;
        if link.is_le() {
            return Err(L2capError::NotSupported);
        }
        Ok(link.allocate_identifier())
    }

    fn next_identifier(&mut self, handle: u16) -> Option<SignalId> {
        self.links.get_mut(&handle).map(Link::allocate_identifier)
    }

    fn allocate_cid(&mut self, le: bool) -> L2capResult<ChannelId> {
        let max = if le {
            L2CAP_LE_DYNAMIC_CID_MAX
        } else {
            L2CAP_DYNAMIC_CID_MAX
        };
        let span = (max - L2CAP_DYNAMIC_CID_MIN) as u32 + 1;
        let mut candidate = if le { self.next_le_cid } else { self.next_cid };
        if candidate > max {
            candidate = L2CAP_DYNAMIC_CID_MIN;
        }

        for _ in 0..span {
            let following = if candidate >= max {
                L2CAP_DYNAMIC_CID_MIN
            } else {
                candidate + 1
            };
            let in_use = self.channels.contains_key(&candidate)
                || self.detached.contains_key(&candidate)
                || self.in_callback == Some(candidate);
            if !in_use {
                if le {
                    self.next_le_cid = following;
                } else {
                    self.next_cid = following;
                }
                return Ok(candidate);
            }
            candidate = following;
        }
        Err(L2capError::ResourceLimitReached)
    }

    fn remote_cid_in_use(&self, handle: u16, remote_cid: ChannelId) -> bool {
        self.channels
            .values()
            .any(|channel| channel.handle == handle && channel.remote_cid == remote_cid)
    }

    fn acl_fragments(&self, pdu_len: usize) -> usize {
        let size = self.acl_packet_len.unwrap_or(usize::from(u16::MAX));
        pdu_len.div_ceil(size.max(1)).max(1)
    }

    /// Whether `fragments` more data packets fit the free controller buffers
    fn acl_room(&self, fragments: usize) -> bool {
        match self.acl_buffers_available() {
            None => true,
            Some(available) => self.tx_queue.len() + fragments <= available as usize,
        }
    }

    fn enqueue_pdu(&mut self, handle: u16, pdu: Vec<u8>) {
        let Some(link) = self.links.get(&handle) else {
            return;
        };
        let first = if link.is_le() {
            PacketBoundary::FirstNonFlushable
        } else {
            PacketBoundary::FirstFlushable
        };
        let size = self
            .acl_packet_len
            .unwrap_or(usize::from(u16::MAX))
            .clamp(1, usize::from(u16::MAX));
        for (index, chunk) in pdu.chunks(size).enumerate() {
            let boundary = if index == 0 {
                first
            } else {
                PacketBoundary::Continuation
            };
            match encode_acl(handle, boundary, chunk) {
                Ok(packet) => self.tx_queue.push_back(OutgoingAcl { handle, packet }),
                Err(e) => {
                    warn!("Dropping PDU for 0x{:04X}: {}", handle, e);
                    return;
                }
            }
        }
        self.stats.pdus_sent += 1;
    }

    fn send_signal(&mut self, handle: u16, message: SignalingMessage) {
        let Some(link) = self.links.get(&handle) else {
            return;
        };
        let is_le = link.is_le();
        trace!("L2CAP signaling to 0x{:04X}: {:?}", handle, message);
        let pdu = message.to_packet(is_le).to_bytes();
        self.enqueue_pdu(handle, pdu);
    }

    fn violation(&mut self, handle: u16, reason: &str) {
        self.stats.protocol_violations += 1;
        warn!("L2CAP protocol violation on 0x{:04X}: {}", handle, reason);
    }

    fn mark_blocked(&mut self, cid: ChannelId) {
        if let Some(channel) = self.channels.get_mut(&cid) {
            channel.wants_send = true;
        }
    }

    /// Raise `on_can_send_now` for blocked channels that can send again
    fn wake_channels(&mut self) {
        if !self.acl_room(1) {
            return;
        }
        let mut woken: Vec<ChannelId> = self
            .channels
            .values_mut()
            .filter(|channel| channel.wants_send && channel.can_send())
            .map(|channel| {
                channel.wants_send = false;
                channel.local_cid
            })
            .collect();
        woken.sort_unstable();
        self.notifications
            .extend(woken.into_iter().map(Notification::CanSendNow));
    }

    fn send_connect_request(&mut self, cid: ChannelId) {
        let deadline = Instant::now() + self.settings.rtx_timeout;
        let Some(channel) = self.channels.get_mut(&cid) else {
            return;
        };
        let Some(link) = self.links.get_mut(&channel.handle) else {
            return;
        };
        let identifier = link.allocate_identifier();
        channel.signal_id = Some(identifier);
        channel.state = L2capChannelState::WaitConnectRsp;
        channel.rtx_deadline = Some(deadline);

        let message = match &channel.flow {
            FlowState::Credit(credit) => SignalingMessage::LeCreditBasedConnectionRequest {
                identifier,
                le_psm: channel.psm,
                source_cid: cid,
                mtu: channel.local_mtu,
                mps: credit.local_mps,
                initial_credits: credit.initial_rx_credits,
            },
            _ => SignalingMessage::ConnectionRequest {
                identifier,
                psm: channel.psm,
                source_cid: cid,
            },
        };
        let handle = channel.handle;
        debug!(
            "L2CAP 0x{:04X}: connecting to PSM 0x{:04X} on 0x{:04X}",
            cid, channel.psm, handle
        );
        self.send_signal(handle, message);
    }

    fn send_configure_request(&mut self, cid: ChannelId) {
        let deadline = Instant::now() + self.settings.rtx_timeout;
        let Some(channel) = self.channels.get_mut(&cid) else {
            return;
        };
        let Some(link) = self.links.get_mut(&channel.handle) else {
            return;
        };
        let identifier = link.allocate_identifier();
        channel.signal_id = Some(identifier);
        channel.rtx_deadline = Some(deadline);

        let message = SignalingMessage::ConfigureRequest {
            identifier,
            destination_cid: channel.remote_cid,
            flags: 0,
            options: channel.local_config(),
        };
        let handle = channel.handle;
        self.send_signal(handle, message);
    }

    /// Ask the peer to drop its end of a channel we already removed
    fn request_disconnect(&mut self, channel: &L2capChannel) {
        if channel.remote_cid == L2CAP_NULL_CID {
            return;
        }
        let Some(identifier) = self.next_identifier(channel.handle) else {
            return;
        };
        self.send_signal(
            channel.handle,
            SignalingMessage::DisconnectionRequest {
                identifier,
                destination_cid: channel.remote_cid,
                source_cid: channel.local_cid,
            },
        );
        self.pending_disconnects.push(PendingDisconnect {
            handle: channel.handle,
            identifier,
            deadline: Instant::now() + self.settings.rtx_timeout,
        });
    }

    fn detach(&mut self, mut channel: L2capChannel, notification: Notification) {
        if let Some(handler) = channel.handler.take() {
            self.detached.insert(channel.local_cid, handler);
        }
        self.notifications.push_back(notification);
    }

    fn close_with(&mut self, cid: ChannelId, reason: CloseReason) {
        let Some(channel) = self.channels.remove(&cid) else {
            return;
        };
        self.request_disconnect(&channel);
        self.detach(channel, Notification::Closed(cid, reason));
    }

    fn fail_open(&mut self, cid: ChannelId, error: L2capError) {
        let Some(channel) = self.channels.remove(&cid) else {
            return;
        };
        debug!("L2CAP channel 0x{:04X} failed to open: {}", cid, error);
        self.request_disconnect(&channel);
        self.detach(channel, Notification::OpenFailed(cid, error));
    }

    fn check_config_complete(&mut self, cid: ChannelId) {
        let Some(channel) = self.channels.get_mut(&cid) else {
            return;
        };
        if channel.state != L2capChannelState::Config || !channel.config.local_done || !channel.config.remote_done {
            return;
        }
        channel.state = L2capChannelState::Open;
        channel.signal_id = None;
        channel.rtx_deadline = None;
        info!(
            "L2CAP channel 0x{:04X} open ({} mode, remote MTU {})",
            cid, channel.mode, channel.remote_mtu
        );
        self.notifications.push_back(Notification::Opened(cid));
    }

    fn route_pdu(&mut self, handle: u16, pdu: &[u8]) {
        let Some(header) = L2capHeader::parse(pdu) else {
            return;
        };
        let payload = &pdu[L2CAP_BASIC_HEADER_SIZE..];
        let is_le = self.links.get(&handle).is_some_and(Link::is_le);
        trace!(
            "L2CAP PDU on 0x{:04X} CID 0x{:04X}: {} bytes",
            handle,
            header.channel_id,
            payload.len()
        );

        match header.channel_id {
            L2CAP_SIGNALING_CID if !is_le => self.on_signaling(handle, payload, false),
            L2CAP_LE_SIGNALING_CID if is_le => self.on_signaling(handle, payload, true),
            L2CAP_SIGNALING_CID | L2CAP_LE_SIGNALING_CID => {
                self.violation(handle, "signaling on the wrong link type")
            }
            L2CAP_NULL_CID => self.violation(handle, "PDU on the null CID"),
            cid if cid >= L2CAP_DYNAMIC_CID_MIN => self.on_channel_pdu(handle, cid, pdu),
            cid => self.events.push_back(MuxEvent::FixedChannelData {
                handle,
                cid,
                data: payload.to_vec(),
            }),
        }
    }

    fn on_channel_pdu(&mut self, handle: u16, cid: ChannelId, pdu: &[u8]) {
        let Some(channel) = self.channels.get_mut(&cid) else {
            self.violation(handle, &format!("data for unknown channel 0x{:04X}", cid));
            return;
        };
        if channel.handle != handle || !channel.is_open() {
            self.violation(handle, &format!("data for channel 0x{:04X} that is not open here", cid));
            return;
        }
        let result = channel.receive(pdu, Instant::now());
        self.apply_rx_result(handle, cid, result);
    }

    fn apply_rx_result(&mut self, handle: u16, cid: ChannelId, result: RxResult) {
        if let Some(reason) = &result.violation {
            self.violation(handle, reason);
        }
        for frame in result.frames {
            self.enqueue_pdu(handle, frame);
        }
        if result.credits_to_grant > 0 {
            if let Some(identifier) = self.next_identifier(handle) {
                trace!("L2CAP 0x{:04X}: granting {} credits", cid, result.credits_to_grant);
                self.send_signal(
                    handle,
                    SignalingMessage::LeFlowControlCredit {
                        identifier,
                        cid,
                        credits: result.credits_to_grant,
                    },
                );
            }
        }
        self.notifications
            .extend(result.sdus.into_iter().map(|sdu| Notification::Data(cid, sdu)));

        if result.failed {
            warn!("L2CAP 0x{:04X}: retransmissions exhausted", cid);
            self.close_with(cid, CloseReason::RetransmissionFailed);
        } else if result.window_opened {
            self.wake_channels();
        }
    }

    fn on_signaling(&mut self, handle: u16, payload: &[u8], is_le: bool) {
        for message in SignalingMessage::parse_all(payload, is_le) {
            match message {
                Ok(message) => {
                    trace!("L2CAP signaling from 0x{:04X}: {:?}", handle, message);
                    self.on_signal(handle, message);
                }
                Err(e) => self.violation(handle, &e.to_string()),
            }
        }
    }

    fn on_signal(&mut self, handle: u16, message: SignalingMessage) {
        match message {
            SignalingMessage::CommandReject {
                identifier, reason, ..
            } => self.on_command_reject(handle, identifier, reason),
            SignalingMessage::ConnectionRequest {
                identifier,
                psm,
                source_cid,
            } => self.on_connection_request(handle, identifier, psm, source_cid),
            SignalingMessage::ConnectionResponse {
                identifier,
                destination_cid,
                source_cid,
                result,
                ..
            } => self.on_connection_response(handle, identifier, destination_cid, source_cid, result),
            SignalingMessage::ConfigureRequest {
                identifier,
                destination_cid,
                flags,
                options,
            } => self.on_configure_request(handle, identifier, destination_cid, flags, options),
            SignalingMessage::ConfigureResponse {
                identifier,
                source_cid,
                flags,
                result,
                options,
            } => self.on_configure_response(handle, identifier, source_cid, flags, result, options),
            SignalingMessage::DisconnectionRequest {
                identifier,
                destination_cid,
                source_cid,
            } => self.on_disconnection_request(handle, identifier, destination_cid, source_cid),
            SignalingMessage::DisconnectionResponse { identifier, .. } => {
                let before = self.pending_disconnects.len();
                self.pending_disconnects
                    .retain(|pending| !(pending.handle == handle && pending.identifier == identifier));
                if self.pending_disconnects.len() == before {
                    debug!("Unmatched disconnection response {} on 0x{:04X}", identifier, handle);
                }
            }
            SignalingMessage::EchoRequest { identifier, data } => {
                self.send_signal(handle, SignalingMessage::EchoResponse { identifier, data });
            }
            SignalingMessage::EchoResponse { data, .. } => {
                self.events.push_back(MuxEvent::EchoResponse { handle, data });
            }
            SignalingMessage::InformationRequest {
                identifier,
                info_type,
            } => {
                let (result, data) = match info_type {
                    L2CAP_INFO_CONNECTIONLESS_MTU => {
                        (L2CAP_INFO_SUCCESS, self.settings.local_mtu.to_le_bytes().to_vec())
                    }
                    L2CAP_INFO_EXTENDED_FEATURES => (L2CAP_INFO_SUCCESS, L2CAP_LOCAL_FEATURES.to_le_bytes().to_vec()),
                    L2CAP_INFO_FIXED_CHANNELS => {
                        (L2CAP_INFO_SUCCESS, L2CAP_LOCAL_FIXED_CHANNELS.to_le_bytes().to_vec())
                    }
                    _ => (L2CAP_INFO_NOT_SUPPORTED, Vec::new()),
                };
                self.send_signal(
                    handle,
                    SignalingMessage::InformationResponse {
                        identifier,
                        info_type,
                        result,
                        data,
                    },
                );
            }
            SignalingMessage::InformationResponse {
                info_type,
                result,
                data,
                ..
            } => {
                self.events.push_back(MuxEvent::InformationResponse {
                    handle,
                    info_type,
                    result,
                    data,
                });
            }
            SignalingMessage::ConnectionParameterUpdateRequest { identifier, params } => {
                self.on_parameter_update_request(handle, identifier, params)
            }
            SignalingMessage::ConnectionParameterUpdateResponse { result, .. } => {
                self.events.push_back(MuxEvent::ConnectionParameterUpdateResult {
                    handle,
                    accepted: result == L2CAP_CONN_PARAM_ACCEPTED,
                });
            }
            SignalingMessage::LeCreditBasedConnectionRequest {
                identifier,
                le_psm,
                source_cid,
                mtu,
                mps,
                initial_credits,
            } => self.on_le_connection_request(handle, identifier, le_psm, source_cid, mtu, mps, initial_credits),
            SignalingMessage::LeCreditBasedConnectionResponse {
                identifier,
                destination_cid,
                mtu,
                mps,
                initial_credits,
                result,
            } => self.on_le_connection_response(handle, identifier, destination_cid, mtu, mps, initial_credits, result),
            SignalingMessage::LeFlowControlCredit { cid, credits, .. } => {
                self.on_flow_control_credit(handle, cid, credits)
            }
            SignalingMessage::Unknown { identifier, code, .. } => {
                debug!("Rejecting unknown signaling code 0x{:02X} on 0x{:04X}", code, handle);
                self.send_signal(
                    handle,
                    SignalingMessage::CommandReject {
                        identifier,
                        reason: L2CAP_REJECT_NOT_UNDERSTOOD,
                        data: Vec::new(),
                    },
                );
            }
        }
    }

    fn reject_invalid_cid(&mut self, handle: u16, identifier: SignalId, local_cid: ChannelId, remote_cid: ChannelId) {
        debug!("Rejecting signaling {} for unknown CID 0x{:04X}", identifier, local_cid);
        let mut data = Vec::with_capacity(4);
        data.extend_from_slice(&local_cid.to_le_bytes());
        data.extend_from_slice(&remote_cid.to_le_bytes());
        self.send_signal(
            handle,
            SignalingMessage::CommandReject {
                identifier,
                reason: L2CAP_REJECT_INVALID_CID,
                data,
            },
        );
    }

    fn on_command_reject(&mut self, handle: u16, identifier: SignalId, reason: u16) {
        let waiting = self
            .channels
            .values()
            .find(|channel| channel.handle == handle && channel.signal_id == Some(identifier))
            .map(|channel| channel.local_cid);
        match waiting {
            Some(cid) => self.fail_open(
                cid,
                L2capError::ProtocolError(format!("request rejected, reason 0x{:04X}", reason)),
            ),
            None => {
                self.pending_disconnects
                    .retain(|pending| !(pending.handle == handle && pending.identifier == identifier));
                debug!("Command reject 0x{:04X} for request {} on 0x{:04X}", reason, identifier, handle);
            }
        }
    }

    fn on_connection_request(&mut self, handle: u16, identifier: SignalId, psm: u16, source_cid: ChannelId) {
        let Some(link_security) = self.link_security(handle) else {
            return;
        };
        let refuse = |result| SignalingMessage::ConnectionResponse {
            identifier,
            destination_cid: L2CAP_NULL_CID,
            source_cid,
            result,
            status: 0,
        };

        let key = (psm, false);
        let refusal = match self.services.get(&key) {
            None => Some(L2CAP_RESULT_PSM_NOT_SUPPORTED),
            Some(_) if source_cid < L2CAP_DYNAMIC_CID_MIN => Some(L2CAP_RESULT_INVALID_SCID),
            Some(_) if self.remote_cid_in_use(handle, source_cid) => Some(L2CAP_RESULT_SCID_ALREADY_ALLOCATED),
            Some(service) if link_security < service.policy.min_security_level => Some(L2CAP_RESULT_SECURITY_BLOCK),
            Some(_) => None,
        };
        if let Some(result) = refusal {
            info!("Refusing L2CAP connection to PSM 0x{:04X}: result 0x{:04X}", psm, result);
            self.send_signal(handle, refuse(result));
            return;
        }

        let Ok(cid) = self.allocate_cid(false) else {
            self.send_signal(handle, refuse(L2CAP_RESULT_NO_RESOURCES));
            return;
        };
        let Some(service) = self.services.get_mut(&key) else {
            return;
        };
        let policy = service.policy.clone();
        let request = IncomingChannel {
            handle,
            psm,
            local_cid: cid,
            remote_cid: source_cid,
            mode: policy.mode,
        };
        let Some(handler) = service.acceptor.accept(&request) else {
            self.send_signal(handle, refuse(L2CAP_RESULT_NO_RESOURCES));
            return;
        };

        let mut channel = L2capChannel::new(
            cid,
            handle,
            psm,
            policy.mtu.unwrap_or(self.settings.local_mtu),
            false,
            FlowParams {
                mode: policy.mode,
                mps: L2CAP_ERTM_DEFAULT_MPS,
                tx_window: L2CAP_ERTM_DEFAULT_TX_WINDOW,
                initial_rx_credits: 0,
                low_watermark: 0,
            },
        );
        channel.remote_cid = source_cid;
        channel.state = L2capChannelState::Config;
        channel.required_security = policy.min_security_level;
        channel.handler = Some(handler);
        self.channels.insert(cid, channel);

        info!("Accepted L2CAP channel 0x{:04X} for PSM 0x{:04X} on 0x{:04X}", cid, psm, handle);
        self.send_signal(
            handle,
            SignalingMessage::ConnectionResponse {
                identifier,
                destination_cid: cid,
                source_cid,
                result: L2CAP_RESULT_SUCCESS,
                status: 0,
            },
        );
        self.send_configure_request(cid);
    }

    fn on_connection_response(
        &mut self,
        handle: u16,
        identifier: SignalId,
        destination_cid: ChannelId,
        source_cid: ChannelId,
        result: u16,
    ) {
        let matched = self.channels.get(&source_cid).is_some_and(|channel| {
            channel.handle == handle
                && channel.state == L2capChannelState::WaitConnectRsp
                && channel.signal_id == Some(identifier)
        });
        if !matched {
            if result == L2CAP_RESULT_SUCCESS && destination_cid >= L2CAP_DYNAMIC_CID_MIN {
                // The peer opened a channel we no longer want
                debug!("Disconnecting stray channel 0x{:04X} on 0x{:04X}", destination_cid, handle);
                if let Some(identifier) = self.next_identifier(handle) {
                    self.send_signal(
                        handle,
                        SignalingMessage::DisconnectionRequest {
                            identifier,
                            destination_cid,
                            source_cid,
                        },
                    );
                }
            } else {
                self.violation(handle, &format!("unexpected connection response {}", identifier));
            }
            return;
        }

        match result {
            L2CAP_RESULT_SUCCESS => {
                if let Some(channel) = self.channels.get_mut(&source_cid) {
                    channel.remote_cid = destination_cid;
                    channel.state = L2capChannelState::Config;
                }
                self.send_configure_request(source_cid);
            }
            L2CAP_RESULT_PENDING => {
                if let Some(channel) = self.channels.get_mut(&source_cid) {
                    channel.rtx_deadline = Some(Instant::now() + ERTX_TIMEOUT);
                }
            }
            _ => {
                info!("L2CAP connection 0x{:04X} refused: result 0x{:04X}", source_cid, result);
                self.fail_open(source_cid, L2capError::ConnectionRejected(result));
            }
        }
    }

    fn on_configure_request(
        &mut self,
        handle: u16,
        identifier: SignalId,
        destination_cid: ChannelId,
        flags: u16,
        options: ConfigOptions,
    ) {
        let Some(channel) = self
            .channels
            .get_mut(&destination_cid)
            .filter(|channel| channel.handle == handle)
        else {
            self.reject_invalid_cid(handle, identifier, destination_cid, L2CAP_NULL_CID);
            return;
        };
        let source_cid = channel.remote_cid;

        if channel.state != L2capChannelState::Config {
            // Reconfiguration of an open channel is not supported
            self.send_signal(
                handle,
                SignalingMessage::ConfigureResponse {
                    identifier,
                    source_cid,
                    flags: 0,
                    result: L2CAP_CONF_REJECTED,
                    options: ConfigOptions::default(),
                },
            );
            return;
        }

        let mut combined = channel.config.partial_remote.take().unwrap_or_default();
        merge_options(&mut combined, options);
        if flags & L2CAP_CONF_FLAG_CONTINUATION != 0 {
            channel.config.partial_remote = Some(combined);
            self.send_signal(
                handle,
                SignalingMessage::ConfigureResponse {
                    identifier,
                    source_cid,
                    flags: L2CAP_CONF_FLAG_CONTINUATION,
                    result: L2CAP_CONF_SUCCESS,
                    options: ConfigOptions::default(),
                },
            );
            return;
        }

        let (result, reply) = match channel.apply_remote_config(&combined) {
            Ok(()) => {
                channel.config.remote_done = true;
                let reply = ConfigOptions {
                    retransmission: combined.retransmission,
                    ..Default::default()
                };
                (L2CAP_CONF_SUCCESS, reply)
            }
            Err((result, counter)) => {
                debug!(
                    "L2CAP 0x{:04X}: configuration refused with result 0x{:04X}",
                    destination_cid, result
                );
                (result, counter)
            }
        };

        self.send_signal(
            handle,
            SignalingMessage::ConfigureResponse {
                identifier,
                source_cid,
                flags: 0,
                result,
                options: reply,
            },
        );
        if result == L2CAP_CONF_SUCCESS {
            self.check_config_complete(destination_cid);
        }
    }

    fn on_configure_response(
        &mut self,
        handle: u16,
        identifier: SignalId,
        source_cid: ChannelId,
        flags: u16,
        result: u16,
        options: ConfigOptions,
    ) {
        enum Next {
            Wait,
            Complete,
            Retry,
            Fail(L2capError),
        }

        let rtx = self.settings.rtx_timeout;
        let Some(channel) = self.channels.get_mut(&source_cid).filter(|channel| {
            channel.handle == handle && channel.state == L2capChannelState::Config && channel.signal_id == Some(identifier)
        }) else {
            self.violation(handle, &format!("unexpected configure response {}", identifier));
            return;
        };

        let next = if flags & L2CAP_CONF_FLAG_CONTINUATION != 0 {
            Next::Wait
        } else {
            match result {
                L2CAP_CONF_SUCCESS => {
                    channel.config.local_done = true;
                    channel.signal_id = None;
                    // Still waiting for the peer's own request
                    channel.rtx_deadline = (!channel.config.remote_done).then(|| Instant::now() + rtx);
                    Next::Complete
                }
                L2CAP_CONF_PENDING => {
                    channel.rtx_deadline = Some(Instant::now() + ERTX_TIMEOUT);
                    Next::Wait
                }
                L2CAP_CONF_UNACCEPTABLE_PARAMS if channel.config.retries == 0 => {
                    let mode_ok = options
                        .retransmission
                        .map_or(true, |rfc| Some(rfc.mode) == channel.mode.retransmission_mode());
                    if mode_ok {
                        channel.config.retries += 1;
                        if let Some(mtu) = options.mtu {
                            channel.local_mtu = mtu.max(L2CAP_MIN_MTU);
                        }
                        Next::Retry
                    } else {
                        Next::Fail(L2capError::NotSupported)
                    }
                }
                _ => Next::Fail(L2capError::ConnectionRejected(result)),
            }
        };

        match next {
            Next::Wait => {}
            Next::Complete => self.check_config_complete(source_cid),
            Next::Retry => self.send_configure_request(source_cid),
            Next::Fail(error) => self.fail_open(source_cid, error),
        }
    }

    fn on_disconnection_request(
        &mut self,
        handle: u16,
        identifier: SignalId,
        destination_cid: ChannelId,
        source_cid: ChannelId,
    ) {
        let matched = self
            .channels
            .get(&destination_cid)
            .is_some_and(|channel| channel.handle == handle && channel.remote_cid == source_cid);
        if !matched {
            self.reject_invalid_cid(handle, identifier, destination_cid, source_cid);
            return;
        }

        self.send_signal(
            handle,
            SignalingMessage::DisconnectionResponse {
                identifier,
                destination_cid,
                source_cid,
            },
        );
        if let Some(channel) = self.channels.remove(&destination_cid) {
            info!("L2CAP channel 0x{:04X} closed by peer", destination_cid);
            let notification = if channel.is_open() {
                Notification::Closed(destination_cid, CloseReason::Remote)
            } else {
                Notification::OpenFailed(destination_cid, L2capError::ConnectionTerminated)
            };
            self.detach(channel, notification);
        }
    }

    fn on_parameter_update_request(&mut self, handle: u16, identifier: SignalId, params: ConnectionParameterUpdate) {
        let role = self.links.get(&handle).map(|link| link.role);
        if role != Some(Role::Central) {
            // Only the central applies connection parameters
            self.send_signal(
                handle,
                SignalingMessage::CommandReject {
                    identifier,
                    reason: L2CAP_REJECT_NOT_UNDERSTOOD,
                    data: Vec::new(),
                },
            );
            return;
        }

        let accepted = params.validate();
        self.send_signal(
            handle,
            SignalingMessage::ConnectionParameterUpdateResponse {
                identifier,
                result: if accepted {
                    L2CAP_CONN_PARAM_ACCEPTED
                } else {
                    L2CAP_CONN_PARAM_REJECTED
                },
            },
        );
        if accepted {
            self.events
                .push_back(MuxEvent::ConnectionParametersRequested { handle, params });
        } else {
            debug!("Rejected connection parameters {:?} on 0x{:04X}", params, handle);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_le_connection_request(
        &mut self,
        handle: u16,
        identifier: SignalId,
        le_psm: u16,
        source_cid: ChannelId,
        mtu: u16,
        mps: u16,
        initial_credits: u16,
    ) {
        let Some(link_security) = self.link_security(handle) else {
            return;
        };
        let refuse = |result| SignalingMessage::LeCreditBasedConnectionResponse {
            identifier,
            destination_cid: L2CAP_NULL_CID,
            mtu: 0,
            mps: 0,
            initial_credits: 0,
            result,
        };

        let key = (le_psm, true);
        let refusal = match self.services.get(&key) {
            None => Some(L2CAP_LE_RESULT_SPSM_NOT_SUPPORTED),
            Some(_) if !(L2CAP_DYNAMIC_CID_MIN..=L2CAP_LE_DYNAMIC_CID_MAX).contains(&source_cid) => {
                Some(L2CAP_LE_RESULT_INVALID_SCID)
            }
            Some(_) if self.remote_cid_in_use(handle, source_cid) => Some(L2CAP_LE_RESULT_SCID_ALREADY_ALLOCATED),
            Some(_) if mtu < L2CAP_LE_MIN_MTU || mps < L2CAP_LE_MIN_MTU => {
                Some(L2CAP_LE_RESULT_UNACCEPTABLE_PARAMETERS)
            }
            Some(service) if link_security < service.policy.min_security_level => {
                Some(L2CAP_LE_RESULT_INSUFFICIENT_AUTHENTICATION)
            }
            Some(_) => None,
        };
        if let Some(result) = refusal {
            info!("Refusing LE channel to SPSM 0x{:04X}: result 0x{:04X}", le_psm, result);
            self.send_signal(handle, refuse(result));
            return;
        }

        let Ok(cid) = self.allocate_cid(true) else {
            self.send_signal(handle, refuse(L2CAP_LE_RESULT_NO_RESOURCES));
            return;
        };
        let Some(service) = self.services.get_mut(&key) else {
            return;
        };
        let policy = service.policy.clone();
        let request = IncomingChannel {
            handle,
            psm: le_psm,
            local_cid: cid,
            remote_cid: source_cid,
            mode: ChannelMode::LeCreditBased,
        };
        let Some(handler) = service.acceptor.accept(&request) else {
            self.send_signal(handle, refuse(L2CAP_LE_RESULT_NO_RESOURCES));
            return;
        };

        let local_credits = self.settings.le_initial_credits;
        let mut channel = L2capChannel::new(
            cid,
            handle,
            le_psm,
            policy.mtu.unwrap_or(self.settings.local_mtu),
            false,
            FlowParams {
                mode: ChannelMode::LeCreditBased,
                mps: L2CAP_LE_DEFAULT_MPS,
                tx_window: 0,
                initial_rx_credits: local_credits,
                low_watermark: self.settings.le_credit_low_watermark,
            },
        );
        channel.apply_le_params(source_cid, mtu, mps, initial_credits);
        channel.state = L2capChannelState::Open;
        channel.required_security = policy.min_security_level;
        channel.handler = Some(handler);
        let response = SignalingMessage::LeCreditBasedConnectionResponse {
            identifier,
            destination_cid: cid,
            mtu: channel.local_mtu,
            mps: L2CAP_LE_DEFAULT_MPS,
            initial_credits: local_credits,
            result: L2CAP_RESULT_SUCCESS,
        };
        self.channels.insert(cid, channel);

        info!("Accepted LE channel 0x{:04X} for SPSM 0x{:04X} on 0x{:04X}", cid, le_psm, handle);
        self.send_signal(handle, response);
        self.notifications.push_back(Notification::Opened(cid));
    }

    #[allow(clippy::too_many_arguments)]
    fn on_le_connection_response(
        &mut self,
        handle: u16,
        identifier: SignalId,
        destination_cid: ChannelId,
        mtu: u16,
        mps: u16,
        initial_credits: u16,
        result: u16,
    ) {
        let waiting = self
            .channels
            .values()
            .find(|channel| {
                channel.handle == handle
                    && channel.state == L2capChannelState::WaitConnectRsp
                    && channel.signal_id == Some(identifier)
                    && channel.mode == ChannelMode::LeCreditBased
            })
            .map(|channel| channel.local_cid);
        let Some(cid) = waiting else {
            self.violation(handle, &format!("unexpected LE connection response {}", identifier));
            return;
        };

        if result != L2CAP_RESULT_SUCCESS {
            info!("LE channel 0x{:04X} refused: result 0x{:04X}", cid, result);
            self.fail_open(cid, L2capError::ConnectionRejected(result));
            return;
        }

        let valid = destination_cid >= L2CAP_DYNAMIC_CID_MIN && mtu >= L2CAP_LE_MIN_MTU && mps >= L2CAP_LE_MIN_MTU;
        let Some(channel) = self.channels.get_mut(&cid) else {
            return;
        };
        channel.apply_le_params(destination_cid, mtu, mps, initial_credits);
        if !valid {
            self.violation(handle, "LE connection response with invalid parameters");
            self.fail_open(cid, L2capError::ProtocolError("invalid LE channel parameters".into()));
            return;
        }
        channel.state = L2capChannelState::Open;
        channel.signal_id = None;
        channel.rtx_deadline = None;
        info!(
            "LE channel 0x{:04X} open (remote MTU {}, MPS {}, {} credits)",
            cid, mtu, mps, initial_credits
        );
        self.notifications.push_back(Notification::Opened(cid));
    }

    fn on_flow_control_credit(&mut self, handle: u16, remote_cid: ChannelId, credits: u16) {
        let granted = self
            .channels
            .values_mut()
            .find(|channel| channel.handle == handle && channel.remote_cid == remote_cid)
            .map(|channel| match &mut channel.flow {
                FlowState::Credit(credit) => Some(credit.grant(credits)),
                _ => None,
            });

        match granted {
            Some(Some(true)) => self.wake_channels(),
            Some(Some(false)) => {
                self.violation(handle, &format!("credit overflow on channel 0x{:04X}", remote_cid));
                self.wake_channels();
            }
            Some(None) => self.violation(handle, "credits for a channel without credit flow control"),
            None => self.violation(handle, &format!("credits for unknown channel 0x{:04X}", remote_cid)),
        }
    }

    fn deliver_notifications(&mut self) {
        if self.delivering {
            return;
        }
        self.delivering = true;
        while let Some(notification) = self.notifications.pop_front() {
            match notification {
                Notification::Opened(cid) => self.with_handler(cid, |handler, ctx| handler.on_opened(ctx)),
                Notification::Data(cid, sdu) => self.with_handler(cid, |handler, ctx| handler.on_data(ctx, &sdu)),
                Notification::CanSendNow(cid) => {
                    self.with_handler(cid, |handler, ctx| handler.on_can_send_now(ctx))
                }
                Notification::OpenFailed(cid, error) => {
                    if let Some(mut handler) = self.detached.remove(&cid) {
                        handler.on_open_failed(cid, &error);
                    }
                }
                Notification::Closed(cid, reason) => {
                    if let Some(mut handler) = self.detached.remove(&cid) {
                        handler.on_closed(cid, &reason);
                    }
                }
            }
        }
        self.delivering = false;
    }

    /// Run a callback with the channel's handler taken out of the table
    fn with_handler(&mut self, cid: ChannelId, callback: impl FnOnce(&mut dyn ChannelHandler, &mut ChannelContext<'_>)) {
        let Some(mut handler) = self.channels.get_mut(&cid).and_then(|channel| channel.handler.take()) else {
            return;
        };
        let previous = self.in_callback.replace(cid);
        callback(handler.as_mut(), &mut ChannelContext { mux: self, cid });
        self.in_callback = previous;

        match self.channels.get_mut(&cid) {
            Some(channel) => channel.handler = Some(handler),
            None => {
                self.detached.insert(cid, handler);
            }
        }
    }
}

fn merge_options(target: &mut ConfigOptions, update: ConfigOptions) {
    if update.mtu.is_some() {
        target.mtu = update.mtu;
    }
    if update.flush_timeout.is_some() {
        target.flush_timeout = update.flush_timeout;
    }
    if update.qos.is_some() {
        target.qos = update.qos;
    }
    if update.retransmission.is_some() {
        target.retransmission = update.retransmission;
    }
    if update.fcs.is_some() {
        target.fcs = update.fcs;
    }
    if update.ext_flow_spec.is_some() {
        target.ext_flow_spec = update.ext_flow_spec;
    }
    if update.ext_window_size.is_some() {
        target.ext_window_size = update.ext_window_size;
    }
    target.unknown.extend(update.unknown);
}
