//! Host core
//!
//! [`Host`] owns the transport and runs everything above it on the
//! caller's thread:
//! - the dispatch loop (`on_transport_packet`), which decodes and routes
//!   every packet from the controller
//! - the HCI procedures: power-on, inquiry, remote name, connect and pairing
//! - the L2CAP multiplexer, fed with ACL data and drained into the transport
//!
//! Nothing blocks. Procedures that wait for the controller keep their state
//! here and continue when the matching event arrives; results come out of
//! `take_events`. Timers advance through `tick`.

pub mod commands;
pub mod registry;
pub mod security;

pub use self::commands::{CommandContext, CommandQueue};
pub use self::registry::{
    ConnectOutcome, ConnectToken, ConnectionRecord, ConnectionRegistry, Direction, PendingOps,
};
pub use self::security::{Decision, LinkKeyDb, PairingMethod, SecurityManager, StoredLinkKey};

use crate::config::HostConfig;
use crate::error::{Error, Procedure, Result};
use crate::gap::{
    AddressType, BdAddr, DiscoveredDevice, LinkType, Role, SecurityLevel, ACL_PACKET_TYPES_ALL,
    GAP_IAC_GENERAL_INQUIRY, PAGE_SCAN_MODE_R1,
};
use crate::hci::constants::*;
use crate::hci::event::Event;
use crate::hci::packet::{AclPacket, EventPacket, FieldView};
use crate::hci::status::*;
use crate::hci::{
    classify, classify_event, decode, event_name, packet_type_name, status_name, EventClass, HciCommand, Outcome,
    Packet, PacketType, Transport, TransportError,
};
use crate::l2cap::{
    ChannelHandler, ChannelId, ChannelSpec, ConnectionParameterUpdate, L2capMux, MuxEvent, MuxSettings,
    ServiceAcceptor, ServicePolicy,
};
use log::{debug, error, info, trace, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::Instant;

/// Lifecycle of the controller as seen by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Off,
    Initializing,
    Working,
}

/// Commands of the power-on sequence, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerStep {
    Reset,
    ReadLocalVersion,
    ReadBdAddr,
    ReadBufferSize,
    SetEventMask,
    WriteSimplePairingMode,
    WriteScanEnable,
}

impl PowerStep {
    fn next(self) -> Option<PowerStep> {
        match self {
            PowerStep::Reset => Some(PowerStep::ReadLocalVersion),
            PowerStep::ReadLocalVersion => Some(PowerStep::ReadBdAddr),
            PowerStep::ReadBdAddr => Some(PowerStep::ReadBufferSize),
            PowerStep::ReadBufferSize => Some(PowerStep::SetEventMask),
            PowerStep::SetEventMask => Some(PowerStep::WriteSimplePairingMode),
            PowerStep::WriteSimplePairingMode => Some(PowerStep::WriteScanEnable),
            PowerStep::WriteScanEnable => None,
        }
    }

    /// Steps a controller may not support; power-on continues without them
    fn is_optional(self) -> bool {
        matches!(self, PowerStep::ReadLocalVersion | PowerStep::WriteSimplePairingMode)
    }

    fn command(self, config: &HostConfig) -> HciCommand {
        match self {
            PowerStep::Reset => HciCommand::Reset,
            PowerStep::ReadLocalVersion => HciCommand::ReadLocalVersion,
            PowerStep::ReadBdAddr => HciCommand::ReadBdAddr,
            PowerStep::ReadBufferSize => HciCommand::ReadBufferSize,
            PowerStep::SetEventMask => HciCommand::SetEventMask {
                event_mask: DEFAULT_EVENT_MASK,
            },
            PowerStep::WriteSimplePairingMode => HciCommand::WriteSimplePairingMode {
                enabled: config.secure_simple_pairing,
            },
            PowerStep::WriteScanEnable => HciCommand::WriteScanEnable {
                scan_enable: config.scan_enable(),
            },
        }
    }
}

/// Why a procedure did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// The controller reported a non-success status
    Status(u8),
    /// No terminal event within the configured bound
    Timeout,
    /// Cancelled by the application
    Cancelled,
}

impl Failure {
    /// Symbolic outcome of a controller status
    pub fn outcome(self) -> Option<Outcome> {
        match self {
            Failure::Status(status) => Some(classify(status)),
            _ => None,
        }
    }

    /// The error for `procedure` ending this way; `None` if it was cancelled
    pub fn into_error(self, procedure: Procedure) -> Option<Error> {
        match self {
            Failure::Status(status) => Some(Error::ControllerRejected { procedure, status }),
            Failure::Timeout => Some(Error::ProcedureTimeout(procedure)),
            Failure::Cancelled => None,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Status(status) => write!(f, "{} (0x{:02X})", status_name(*status), status),
            Failure::Timeout => write!(f, "timeout"),
            Failure::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingStatus {
    Success(SecurityLevel),
    Failed(Failure),
    /// The link was encrypted but below the level required
    InsufficientSecurity(SecurityLevel),
}

/// Reports for the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    PowerStateChanged(PowerState),
    PowerOnFailed(Failure),
    HardwareError {
        code: u8,
    },
    DeviceFound(DiscoveredDevice),
    InquiryComplete(std::result::Result<(), Failure>),
    RemoteName {
        address: BdAddr,
        result: std::result::Result<String, Failure>,
    },
    IncomingConnection {
        address: BdAddr,
        class_of_device: u32,
        accepted: bool,
    },
    Connected {
        handle: u16,
        address: BdAddr,
        link_type: LinkType,
        role: Role,
    },
    ConnectionFailed {
        address: BdAddr,
        failure: Failure,
    },
    Disconnected {
        handle: u16,
        address: BdAddr,
        reason: u8,
    },
    PairingStarted {
        address: BdAddr,
        ssp: bool,
    },
    UserConfirmationRequest {
        address: BdAddr,
        numeric_value: u32,
    },
    PasskeyRequest {
        address: BdAddr,
    },
    PasskeyNotification {
        address: BdAddr,
        passkey: u32,
    },
    PinCodeRequest {
        address: BdAddr,
    },
    PairingComplete {
        address: BdAddr,
        status: PairingStatus,
    },
    SecurityLevel {
        handle: u16,
        level: SecurityLevel,
    },
    /// A command with no procedure behind it failed
    CommandFailed {
        opcode: u16,
        failure: Failure,
    },
    L2cap(MuxEvent),
}

impl HostEvent {
    /// The failure this event reports, as an [`Error`]
    pub fn error(&self) -> Option<Error> {
        let (procedure, failure) = match self {
            HostEvent::PowerOnFailed(failure) => (Procedure::PowerOn, *failure),
            HostEvent::InquiryComplete(Err(failure)) => (Procedure::Inquiry, *failure),
            HostEvent::RemoteName {
                result: Err(failure), ..
            } => (Procedure::RemoteName, *failure),
            HostEvent::ConnectionFailed { failure, .. } => (Procedure::Connect, *failure),
            HostEvent::PairingComplete {
                status: PairingStatus::Failed(failure),
                ..
            } => (Procedure::Pairing, *failure),
            HostEvent::CommandFailed { opcode, failure } => (Procedure::Command(*opcode), *failure),
            _ => return None,
        };
        failure.into_error(procedure)
    }
}

/// Read Local Version Information results
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalVersion {
    pub hci_version: u8,
    pub hci_revision: u16,
    pub lmp_version: u8,
    pub manufacturer: u16,
    pub lmp_subversion: u16,
}

/// Host counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    pub events_received: u64,
    pub acl_received: u64,
    pub malformed_packets: u64,
    pub protocol_violations: u64,
    pub forwarded_packets: u64,
    pub commands_sent: u64,
    pub acl_sent: u64,
    pub command_timeouts: u64,
}

/// Receiver for packets the core does not interpret
pub trait PacketHandler {
    fn on_packet(&mut self, packet_type: PacketType, data: &[u8]);
}

impl<F> PacketHandler for F
where
    F: FnMut(PacketType, &[u8]),
{
    fn on_packet(&mut self, packet_type: PacketType, data: &[u8]) {
        self(packet_type, data)
    }
}

/// Bluetooth host core over one controller
pub struct Host<T: Transport> {
    transport: T,
    transport_blocked: bool,
    config: HostConfig,
    power: PowerState,
    local_address: Option<BdAddr>,
    local_version: Option<LocalVersion>,
    commands: CommandQueue,
    registry: ConnectionRegistry,
    security: SecurityManager,
    mux: L2capMux,
    inquiring: bool,
    /// Inquiry results, used for page scan mode and clock offset
    discovered: HashMap<BdAddr, DiscoveredDevice>,
    /// Outstanding remote name requests and their deadlines
    name_requests: HashMap<BdAddr, Instant>,
    /// Outgoing attempts given up on; a link that comes up anyway is dropped
    abandoned: HashSet<BdAddr>,
    packet_handler: Option<Box<dyn PacketHandler>>,
    events: VecDeque<HostEvent>,
    stats: Stats,
}

impl<T: Transport> fmt::Debug for Host<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("power", &self.power)
            .field("local_address", &self.local_address)
            .field("connections", &self.registry.len())
            .field("mux", &self.mux)
            .field("stats", &self.stats)
            .finish()
    }
}

impl<T: Transport> Host<T> {
    pub fn new(transport: T, config: HostConfig) -> Self {
        Self {
            transport,
            transport_blocked: false,
            commands: CommandQueue::new(config.max_outstanding_commands, config.command_timeout),
            security: SecurityManager::new(&config),
            mux: L2capMux::new(MuxSettings::from(&config)),
            config,
            power: PowerState::Off,
            local_address: None,
            local_version: None,
            registry: ConnectionRegistry::new(),
            inquiring: false,
            discovered: HashMap::new(),
            name_requests: HashMap::new(),
            abandoned: HashSet::new(),
            packet_handler: None,
            events: VecDeque::new(),
            stats: Stats::default(),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn power_state(&self) -> PowerState {
        self.power
    }

    pub fn local_address(&self) -> Option<BdAddr> {
        self.local_address
    }

    pub fn local_version(&self) -> Option<LocalVersion> {
        self.local_version
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn connection(&self, handle: u16) -> Option<&ConnectionRecord> {
        self.registry.lookup(handle)
    }

    pub fn l2cap(&self) -> &L2capMux {
        &self.mux
    }

    pub fn security(&self) -> &SecurityManager {
        &self.security
    }

    /// The link key database, e.g. to restore bonds
    pub fn link_keys_mut(&mut self) -> &mut LinkKeyDb {
        self.security.link_keys_mut()
    }

    pub fn is_inquiring(&self) -> bool {
        self.inquiring
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn stats(&self) -> Stats {
        let mut stats = self.stats.clone();
        stats.protocol_violations += self.mux.stats().protocol_violations;
        stats
    }

    pub fn take_events(&mut self) -> Vec<HostEvent> {
        self.events.drain(..).collect()
    }

    /// Receive packets the core does not handle itself
    pub fn set_packet_handler(&mut self, handler: Box<dyn PacketHandler>) {
        self.packet_handler = Some(handler);
    }

    fn require_working(&self) -> Result<()> {
        if self.power == PowerState::Working {
            Ok(())
        } else {
            Err(Error::NotReady)
        }
    }

    fn emit(&mut self, event: HostEvent) {
        trace!("Host event {:?}", event);
        self.events.push_back(event);
    }

    fn set_power(&mut self, state: PowerState) {
        if self.power != state {
            info!("Power state {:?} -> {:?}", self.power, state);
            self.power = state;
            self.emit(HostEvent::PowerStateChanged(state));
        }
    }

    // ---- power ----

    /// Start the power-on sequence; `PowerStateChanged(Working)` follows
    /// once the controller is configured
    pub fn power_on(&mut self) -> Result<()> {
        if self.power != PowerState::Off {
            return Err(Error::InvalidState);
        }
        self.set_power(PowerState::Initializing);
        let step = PowerStep::Reset;
        self.commands.push(step.command(&self.config), CommandContext::PowerOn(step));
        self.process()
    }

    /// Drop all connections, channels and procedures
    pub fn power_off(&mut self) -> Result<()> {
        if self.power == PowerState::Off {
            return Ok(());
        }
        info!("Powering off");
        self.teardown(STATUS_CONNECTION_TERMINATED_BY_LOCAL_HOST);
        self.set_power(PowerState::Off);
        Ok(())
    }

    fn teardown(&mut self, reason: u8) {
        self.commands.clear();
        self.transport_blocked = false;
        for record in self.registry.clear(&mut self.mux) {
            self.emit(HostEvent::Disconnected {
                handle: record.handle,
                address: record.address,
                reason,
            });
        }
        self.security.clear();
        self.abandoned.clear();

        if self.inquiring {
            self.inquiring = false;
            self.emit(HostEvent::InquiryComplete(Err(Failure::Cancelled)));
        }
        let mut names: Vec<BdAddr> = self.name_requests.drain().map(|(address, _)| address).collect();
        names.sort_unstable_by_key(|address| address.bytes);
        for address in names {
            self.emit(HostEvent::RemoteName {
                address,
                result: Err(Failure::Cancelled),
            });
        }
        // Events raised by channels closing with their links
        for event in self.mux.take_events() {
            self.emit(HostEvent::L2cap(event));
        }
    }

    fn power_on_failed(&mut self, failure: Failure) {
        warn!("Power-on failed: {}", failure);
        self.commands.clear();
        self.emit(HostEvent::PowerOnFailed(failure));
        self.set_power(PowerState::Off);
    }

    fn advance_power_on(&mut self, step: PowerStep, status: u8, params: Option<FieldView<'_>>) {
        if self.power != PowerState::Initializing {
            debug!("Power-on step {:?} completed while {:?}", step, self.power);
            return;
        }
        let params = match classify(status) {
            Outcome::Success => params,
            Outcome::Fatal(ErrorKind::UnknownCommand | ErrorKind::Unsupported) if step.is_optional() => {
                warn!("Controller does not support {:?}: {}", step, status_name(status));
                None
            }
            _ => {
                self.power_on_failed(Failure::Status(status));
                return;
            }
        };
        if let Some(params) = params {
            if let Err(e) = self.apply_power_step(step, &params) {
                warn!("Bad return parameters for {:?}: {}", step, e);
                self.stats.malformed_packets += 1;
                self.power_on_failed(Failure::Status(STATUS_UNSPECIFIED_ERROR));
                return;
            }
        }

        match step.next() {
            Some(next) => {
                debug!("Power-on: {:?}", next);
                self.commands.push(next.command(&self.config), CommandContext::PowerOn(next));
            }
            None => {
                info!(
                    "Controller ready at {}",
                    self.local_address.map(|a| a.to_string()).unwrap_or_default()
                );
                self.set_power(PowerState::Working);
            }
        }
    }

    fn apply_power_step(&mut self, step: PowerStep, params: &FieldView<'_>) -> Result<()> {
        match step {
            PowerStep::ReadLocalVersion => {
                let version = LocalVersion {
                    hci_version: params.u8(1)?,
                    hci_revision: params.u16(2)?,
                    lmp_version: params.u8(4)?,
                    manufacturer: params.u16(5)?,
                    lmp_subversion: params.u16(7)?,
                };
                debug!("Controller version {:?}", version);
                self.local_version = Some(version);
            }
            PowerStep::ReadBdAddr => {
                self.local_address = Some(params.bd_addr(1)?);
            }
            PowerStep::ReadBufferSize => {
                let acl_len = params.u16(1)?;
                let acl_count = params.u16(4)?;
                self.mux.set_acl_buffers(acl_len, acl_count);
            }
            _ => {}
        }
        Ok(())
    }

    // ---- discovery ----

    /// General inquiry for `length` x 1.28 s
    pub fn start_inquiry(&mut self, length: u8, max_responses: u8) -> Result<()> {
        self.require_working()?;
        if self.inquiring {
            return Err(Error::InvalidState);
        }
        if length == 0 || length > crate::gap::GAP_INQUIRY_DURATION_MAX {
            return Err(Error::InvalidParameter(format!("inquiry length {}", length)));
        }
        self.inquiring = true;
        self.commands.push(
            HciCommand::Inquiry {
                lap: GAP_IAC_GENERAL_INQUIRY,
                length,
                num_responses: max_responses,
            },
            CommandContext::Inquiry,
        );
        self.process()
    }

    pub fn stop_inquiry(&mut self) -> Result<()> {
        self.require_working()?;
        if !self.inquiring {
            return Err(Error::InvalidState);
        }
        if self.commands.discard_queued(|context| *context == CommandContext::Inquiry) > 0 {
            self.inquiring = false;
            self.emit(HostEvent::InquiryComplete(Err(Failure::Cancelled)));
        } else {
            self.commands.push(HciCommand::InquiryCancel, CommandContext::InquiryCancel);
        }
        self.process()
    }

    /// Ask a remote device for its name; the result arrives as `RemoteName`
    pub fn request_remote_name(&mut self, address: BdAddr) -> Result<()> {
        self.require_working()?;
        if self.name_requests.contains_key(&address) {
            return Err(Error::AlreadyPending(address));
        }
        let (page_scan_repetition_mode, clock_offset) = self.paging_parameters(&address);
        self.name_requests
            .insert(address, Instant::now() + self.config.name_request_timeout);
        self.commands.push(
            HciCommand::RemoteNameRequest {
                address,
                page_scan_repetition_mode,
                clock_offset,
            },
            CommandContext::RemoteName(address),
        );
        self.process()
    }

    /// Page scan repetition mode and clock offset learned from inquiry
    fn paging_parameters(&self, address: &BdAddr) -> (u8, u16) {
        match self.discovered.get(address) {
            // Bit 15 marks the clock offset as valid
            Some(device) => (device.page_scan_repetition_mode, device.clock_offset | 0x8000),
            None => (PAGE_SCAN_MODE_R1, 0),
        }
    }

    // ---- connections ----

    /// Create a BR/EDR connection
    pub fn connect(&mut self, address: BdAddr) -> Result<ConnectToken> {
        self.require_working()?;
        if self
            .registry
            .lookup_by_address(&address)
            .is_some_and(|record| record.link_type == LinkType::Classic)
        {
            return Err(Error::InvalidState);
        }
        let token = self
            .registry
            .begin_connect(address, LinkType::Classic, Direction::Outgoing, Instant::now())?;
        self.abandoned.remove(&address);
        let (page_scan_repetition_mode, clock_offset) = self.paging_parameters(&address);
        self.commands.push(
            HciCommand::CreateConnection {
                address,
                packet_type: ACL_PACKET_TYPES_ALL,
                page_scan_repetition_mode,
                clock_offset,
                allow_role_switch: true,
            },
            CommandContext::Connect(address),
        );
        self.process()?;
        Ok(token)
    }

    /// Create an LE connection as central
    pub fn connect_le(&mut self, address: BdAddr, address_type: AddressType) -> Result<ConnectToken> {
        self.require_working()?;
        if self
            .registry
            .lookup_by_address(&address)
            .is_some_and(|record| record.link_type == LinkType::Le)
        {
            return Err(Error::InvalidState);
        }
        let token = self
            .registry
            .begin_connect(address, LinkType::Le, Direction::Outgoing, Instant::now())?;
        self.abandoned.remove(&address);
        self.commands.push(
            HciCommand::LeCreateConnection {
                peer_address: address,
                peer_address_type: address_type.into(),
            },
            CommandContext::Connect(address),
        );
        self.process()?;
        Ok(token)
    }

    /// Abandon a connection attempt. A link the controller brings up
    /// anyway is disconnected.
    pub fn cancel_connect(&mut self, token: ConnectToken) -> Result<()> {
        let address = token.address();
        let link_type = match self.registry.pending(&address) {
            Some(pending) if pending.token == token && pending.direction == Direction::Outgoing => pending.link_type,
            _ => return Err(Error::InvalidState),
        };
        self.registry.cancel_connect(token);
        self.abort_connect(address, link_type);
        self.emit(HostEvent::ConnectionFailed {
            address,
            failure: Failure::Cancelled,
        });
        self.process()
    }

    /// Withdraw the create connection command for an abandoned attempt
    fn abort_connect(&mut self, address: BdAddr, link_type: LinkType) {
        self.abandoned.insert(address);
        let connect = CommandContext::Connect(address);
        if self.commands.discard_queued(|context| *context == connect) > 0 {
            return;
        }
        let command = match link_type {
            LinkType::Classic => HciCommand::CreateConnectionCancel { address },
            LinkType::Le => HciCommand::LeCreateConnectionCancel,
        };
        self.commands.push(command, CommandContext::ConnectCancel(address));
    }

    /// Disconnect a link; `Disconnected` follows from the controller
    pub fn disconnect(&mut self, handle: u16) -> Result<()> {
        self.require_working()?;
        if self.registry.lookup(handle).is_none() {
            return Err(Error::UnknownConnection(handle));
        }
        self.queue_disconnect(handle, STATUS_REMOTE_USER_TERMINATED_CONNECTION);
        self.process()
    }

    fn queue_disconnect(&mut self, handle: u16, reason: u8) {
        if let Some(record) = self.registry.lookup_mut(handle) {
            if record.pending.contains(PendingOps::DISCONNECT) {
                return;
            }
            record.pending |= PendingOps::DISCONNECT;
        }
        debug!("Disconnecting 0x{:04X}: {}", handle, status_name(reason));
        self.commands
            .push(HciCommand::Disconnect { handle, reason }, CommandContext::Disconnect(handle));
    }

    // ---- security ----

    /// Authenticate and encrypt a BR/EDR link
    pub fn authenticate(&mut self, handle: u16) -> Result<()> {
        self.require_working()?;
        let level = self.security.min_security_level().max(SecurityLevel::Level2);
        self.start_authentication(handle, level)?;
        self.process()
    }

    fn start_authentication(&mut self, handle: u16, level: SecurityLevel) -> Result<()> {
        let record = self
            .registry
            .lookup_mut(handle)
            .ok_or(Error::UnknownConnection(handle))?;
        if record.link_type == LinkType::Le {
            return Err(Error::InvalidState);
        }
        let address = record.address;
        let busy = record.pending.contains(PendingOps::AUTHENTICATION) || self.security.is_pairing(&address);
        self.security.start(address, level, Instant::now());
        if busy {
            return Ok(());
        }

        record.pending |= PendingOps::AUTHENTICATION;
        debug!("Authenticating 0x{:04X} for {:?}", handle, level);
        self.commands.push(
            HciCommand::AuthenticationRequested { handle },
            CommandContext::Authenticate(handle),
        );
        Ok(())
    }

    pub fn user_confirmation_reply(&mut self, address: BdAddr, accept: bool) -> Result<()> {
        self.require_working()?;
        let command = self.security.confirmation_reply(address, accept)?;
        self.commands.push(command, CommandContext::Plain);
        self.process()
    }

    /// Answer a passkey request; `None` rejects it
    pub fn passkey_reply(&mut self, address: BdAddr, passkey: Option<u32>) -> Result<()> {
        self.require_working()?;
        let command = self.security.passkey_reply(address, passkey)?;
        self.commands.push(command, CommandContext::Plain);
        self.process()
    }

    /// Answer a legacy PIN code request; `None` rejects it
    pub fn pin_code_reply(&mut self, address: BdAddr, pin: Option<&str>) -> Result<()> {
        self.require_working()?;
        let command = self.security.pin_code_reply(address, pin)?;
        self.commands.push(command, CommandContext::Plain);
        self.process()
    }

    fn pairing_failed(&mut self, address: BdAddr, failure: Failure) {
        warn!("Pairing with {} failed: {}", address, failure);
        self.security.finish(&address);
        let handle = self.registry.lookup_by_address(&address).map(|record| record.handle);
        if let Some(handle) = handle {
            if let Some(record) = self.registry.lookup_mut(handle) {
                record.pending.remove(PendingOps::AUTHENTICATION | PendingOps::ENCRYPTION);
            }
            self.mux.security_failed(handle);
        }
        self.emit(HostEvent::PairingComplete {
            address,
            status: PairingStatus::Failed(failure),
        });
    }

    /// Security level an encrypted link has, from the key that secured it
    fn encrypted_level(&self, record: &ConnectionRecord) -> SecurityLevel {
        record
            .key_type
            .or_else(|| self.security.link_keys().get(&record.address).map(|key| key.key_type))
            .map(|key_type| key_type.security_level())
            .unwrap_or(SecurityLevel::Level2)
    }

    fn security_established(&mut self, handle: u16) {
        let Some(record) = self.registry.lookup(handle) else {
            return;
        };
        let address = record.address;
        let level = self.encrypted_level(record);
        let required = self
            .security
            .finish(&address)
            .map(|session| session.required)
            .unwrap_or(SecurityLevel::Level0);

        if let Some(record) = self.registry.lookup_mut(handle) {
            record.security_level = level;
            record.pending.remove(PendingOps::AUTHENTICATION | PendingOps::ENCRYPTION);
        }

        if level < self.security.min_security_level() {
            warn!(
                "Link 0x{:04X} reached {:?}, below the minimum {:?}",
                handle,
                level,
                self.security.min_security_level()
            );
            self.mux.security_failed(handle);
            self.emit(HostEvent::PairingComplete {
                address,
                status: PairingStatus::InsufficientSecurity(level),
            });
            self.queue_disconnect(handle, STATUS_AUTHENTICATION_FAILURE);
            return;
        }

        info!("Link 0x{:04X} secured at {:?}", handle, level);
        self.mux.set_link_security(handle, level);
        self.emit(HostEvent::SecurityLevel { handle, level });
        let status = if level >= required {
            PairingStatus::Success(level)
        } else {
            PairingStatus::InsufficientSecurity(level)
        };
        self.emit(HostEvent::PairingComplete { address, status });
    }

    // ---- L2CAP ----

    /// Accept incoming channels on `psm`
    pub fn register_service(
        &mut self,
        psm: u16,
        policy: ServicePolicy,
        acceptor: Box<dyn ServiceAcceptor>,
    ) -> Result<()> {
        self.mux.register_service(psm, policy, acceptor)?;
        Ok(())
    }

    pub fn unregister_service(&mut self, psm: u16, le: bool) -> Result<()> {
        self.mux.unregister_service(psm, le)?;
        Ok(())
    }

    pub fn open_channel(
        &mut self,
        handle: u16,
        spec: ChannelSpec,
        handler: Box<dyn ChannelHandler>,
    ) -> Result<ChannelId> {
        self.require_working()?;
        if self.registry.lookup(handle).is_none() {
            return Err(Error::UnknownConnection(handle));
        }
        let cid = self.mux.open_channel(handle, spec, handler)?;
        self.process()?;
        Ok(cid)
    }

    /// Send one SDU; `WouldBlock` until the channel's `on_can_send_now`
    pub fn send(&mut self, cid: ChannelId, data: &[u8]) -> Result<()> {
        self.mux.send(cid, data)?;
        self.process()
    }

    pub fn request_can_send_now(&mut self, cid: ChannelId) -> Result<()> {
        self.mux.request_can_send_now(cid)?;
        self.process()
    }

    pub fn close_channel(&mut self, cid: ChannelId) -> Result<()> {
        self.mux.close_channel(cid)?;
        self.process()
    }

    pub fn echo_request(&mut self, handle: u16, data: &[u8]) -> Result<()> {
        self.mux.echo_request(handle, data)?;
        self.process()
    }

    pub fn information_request(&mut self, handle: u16, info_type: u16) -> Result<()> {
        self.mux.information_request(handle, info_type)?;
        self.process()
    }

    pub fn request_connection_parameter_update(
        &mut self,
        handle: u16,
        params: ConnectionParameterUpdate,
    ) -> Result<()> {
        self.mux.request_connection_parameter_update(handle, params)?;
        self.process()
    }

    // ---- dispatch loop ----

    /// Entry point for a buffer that still carries its packet type tag
    pub fn on_transport_buffer(&mut self, buffer: &[u8]) -> Result<()> {
        let Some((&tag, data)) = buffer.split_first() else {
            warn!("Dropping empty transport buffer");
            self.stats.malformed_packets += 1;
            return Ok(());
        };
        self.on_transport_packet(PacketType::from_u8(tag), data)
    }

    /// Handle one complete packet from the controller.
    ///
    /// Malformed packets are logged and dropped. Errors are returned only
    /// for transport failures and registry corruption.
    pub fn on_transport_packet(&mut self, packet_type: PacketType, data: &[u8]) -> Result<()> {
        let packet = match decode(packet_type, data) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Dropping packet: {}", e);
                self.stats.malformed_packets += 1;
                return Ok(());
            }
        };

        match packet {
            Packet::Event(event) => self.on_event(&event, data)?,
            Packet::Acl(acl) => self.on_acl(&acl),
            Packet::Command(_) | Packet::Sco(_) | Packet::Other(..) => self.forward(packet_type, data),
        }
        self.process()
    }

    /// The transport can take packets again after `WouldBlock`
    pub fn on_transport_can_send_now(&mut self) -> Result<()> {
        self.transport_blocked = false;
        self.process()
    }

    /// Expire timers of all procedures
    pub fn tick(&mut self, now: Instant) -> Result<()> {
        for expired in self.commands.expire(now) {
            self.stats.command_timeouts += 1;
            warn!(
                "{} ({:?})",
                Error::ProcedureTimeout(Procedure::Command(expired.opcode)),
                expired.context
            );
            self.on_command_timeout(expired.context, expired.opcode);
        }

        if self.power == PowerState::Working {
            for pending in self.registry.expire_pending(now, self.config.connect_timeout) {
                let address = pending.token.address();
                warn!("{:?} connection with {} timed out", pending.direction, address);
                if pending.direction == Direction::Outgoing {
                    self.abort_connect(address, pending.link_type);
                }
                self.emit(HostEvent::ConnectionFailed {
                    address,
                    failure: Failure::Timeout,
                });
            }

            let mut expired: Vec<BdAddr> = self
                .name_requests
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(address, _)| *address)
                .collect();
            expired.sort_unstable_by_key(|address| address.bytes);
            for address in expired {
                self.name_requests.remove(&address);
                warn!("Remote name request to {} timed out", address);
                let request = CommandContext::RemoteName(address);
                if self.commands.discard_queued(|context| *context == request) == 0 {
                    self.commands.push(
                        HciCommand::RemoteNameRequestCancel { address },
                        CommandContext::RemoteNameCancel(address),
                    );
                }
                self.emit(HostEvent::RemoteName {
                    address,
                    result: Err(Failure::Timeout),
                });
            }

            for session in self.security.expire(now) {
                self.pairing_failed(session.address, Failure::Timeout);
            }

            self.mux.tick(now);
        }

        self.process()
    }

    fn forward(&mut self, packet_type: PacketType, data: &[u8]) {
        self.stats.forwarded_packets += 1;
        debug!(
            "Unhandled {} packet: {}",
            packet_type_name(packet_type.as_u8()),
            hex::encode(data)
        );
        if let Some(handler) = self.packet_handler.as_mut() {
            handler.on_packet(packet_type, data);
        }
    }

    fn on_event(&mut self, packet: &EventPacket<'_>, raw: &[u8]) -> Result<()> {
        self.stats.events_received += 1;
        let class = classify_event(packet.code);
        trace!("{} ({:?})", event_name(packet.code), class);

        if matches!(
            class,
            EventClass::VendorSpecific | EventClass::Other | EventClass::Unrecognized(_)
        ) {
            self.forward(PacketType::Event, raw);
            return Ok(());
        }
        if self.power == PowerState::Off {
            debug!("Ignoring {} while off", event_name(packet.code));
            return Ok(());
        }

        let event = match Event::parse(packet) {
            Ok(event) => event,
            Err(e) => {
                warn!("Dropping {}: {}", event_name(packet.code), e);
                self.stats.malformed_packets += 1;
                return Ok(());
            }
        };

        match event {
            Event::CommandComplete {
                num_packets,
                opcode,
                return_params,
            } => {
                if let Some(context) = self.commands.on_response(opcode, num_packets) {
                    let status = match return_params.u8(0) {
                        Ok(status) => status,
                        Err(e) => {
                            warn!("Command Complete for 0x{:04X} without status: {}", opcode, e);
                            self.stats.malformed_packets += 1;
                            STATUS_UNSPECIFIED_ERROR
                        }
                    };
                    self.on_command_result(context, opcode, status, Some(return_params))?;
                }
            }
            Event::CommandStatus {
                status,
                num_packets,
                opcode,
            } => {
                if let Some(context) = self.commands.on_response(opcode, num_packets) {
                    self.on_command_result(context, opcode, status, None)?;
                }
            }
            Event::HardwareError { code } => self.controller_failed(code),
            Event::NumberOfCompletedPackets(entries) => {
                for entry in entries {
                    self.mux.on_packets_completed(entry.handle, entry.count);
                }
            }

            Event::InquiryResult(devices) => {
                for device in devices {
                    trace!("Found {} (class 0x{:06X})", device.address, device.class_of_device);
                    let known = self.discovered.get(&device.address);
                    let device = match known {
                        // Keep a name learned from an earlier extended result
                        Some(known) if device.name.is_none() => DiscoveredDevice {
                            name: known.name.clone(),
                            ..device
                        },
                        _ => device,
                    };
                    self.discovered.insert(device.address, device.clone());
                    self.emit(HostEvent::DeviceFound(device));
                }
            }
            Event::InquiryComplete { status } => {
                if self.inquiring {
                    self.inquiring = false;
                    let result = if classify(status).is_success() {
                        Ok(())
                    } else {
                        Err(Failure::Status(status))
                    };
                    self.emit(HostEvent::InquiryComplete(result));
                }
            }
            Event::RemoteNameRequestComplete { status, address, name } => {
                if self.name_requests.remove(&address).is_none() {
                    debug!("Remote name for {} arrived after the request ended", address);
                    return Ok(());
                }
                let result = if classify(status).is_success() {
                    if let Some(device) = self.discovered.get_mut(&address) {
                        device.name = Some(name.clone());
                    }
                    Ok(name)
                } else {
                    Err(Failure::Status(status))
                };
                self.emit(HostEvent::RemoteName { address, result });
            }

            Event::ConnectionRequest {
                address,
                class_of_device,
                link_type,
            } => self.on_connection_request(address, class_of_device, link_type),
            Event::ConnectionComplete {
                status,
                handle,
                address,
                link_type,
                encryption_enabled,
            } => {
                if link_type != LINK_TYPE_ACL {
                    self.forward(PacketType::Event, raw);
                    return Ok(());
                }
                self.on_connection_complete(status, handle, address, LinkType::Classic, None, encryption_enabled)?;
            }
            Event::LeConnectionComplete {
                status,
                handle,
                role,
                address,
                ..
            } => {
                let role = Role::from_hci(role);
                self.on_connection_complete(status, handle, address, LinkType::Le, Some(role), false)?;
            }
            Event::DisconnectionComplete { status, handle, reason } => {
                self.on_disconnection_complete(status, handle, reason)
            }

            Event::LinkKeyRequest { address } => {
                let reply = self.security.on_link_key_request(address);
                self.commands.push(reply, CommandContext::Plain);
            }
            Event::LinkKeyNotification { address, key, key_type } => {
                let key_type = self.security.on_link_key_notification(address, key, key_type);
                let handle = self.registry.lookup_by_address(&address).map(|record| record.handle);
                if let Some(record) = handle.and_then(|handle| self.registry.lookup_mut(handle)) {
                    record.key_type = Some(key_type);
                }
            }
            Event::IoCapabilityRequest { address } => {
                let reply = self.security.on_io_capability_request(address, Instant::now());
                self.commands.push(reply, CommandContext::Plain);
            }
            Event::IoCapabilityResponse {
                address,
                io_capability,
                auth_requirements,
                ..
            } => {
                if self
                    .security
                    .on_io_capability_response(address, io_capability, auth_requirements, Instant::now())
                {
                    self.emit(HostEvent::PairingStarted { address, ssp: true });
                }
            }
            Event::UserConfirmationRequest { address, numeric_value } => {
                match self.security.on_user_confirmation_request(address, Instant::now()) {
                    Decision::Reply(reply) => self.commands.push(reply, CommandContext::Plain),
                    Decision::AskUser => self.emit(HostEvent::UserConfirmationRequest { address, numeric_value }),
                }
            }
            Event::UserPasskeyRequest { address } => match self.security.on_passkey_request(address, Instant::now()) {
                Decision::Reply(reply) => self.commands.push(reply, CommandContext::Plain),
                Decision::AskUser => self.emit(HostEvent::PasskeyRequest { address }),
            },
            Event::UserPasskeyNotification { address, passkey } => {
                self.emit(HostEvent::PasskeyNotification { address, passkey })
            }
            Event::PinCodeRequest { address } => {
                let (legacy_started, decision) = self.security.on_pin_code_request(address, Instant::now());
                if legacy_started {
                    self.emit(HostEvent::PairingStarted { address, ssp: false });
                }
                match decision {
                    Decision::Reply(reply) => self.commands.push(reply, CommandContext::Plain),
                    Decision::AskUser => self.emit(HostEvent::PinCodeRequest { address }),
                }
            }
            Event::SimplePairingComplete { status, address } => {
                if !classify(status).is_success() {
                    self.pairing_failed(address, Failure::Status(status));
                } else {
                    debug!("Simple pairing with {} complete", address);
                }
            }
            Event::AuthenticationComplete { status, handle } => self.on_authentication_complete(status, handle),
            Event::EncryptionChange { status, handle, enabled } => self.on_encryption_change(status, handle, enabled),

            Event::Unknown { .. } => self.forward(PacketType::Event, raw),
        }
        Ok(())
    }

    /// The controller is unusable: drop everything and go to `Off`
    fn controller_failed(&mut self, code: u8) {
        error!("Controller hardware error 0x{:02X}", code);
        self.emit(HostEvent::HardwareError { code });
        self.teardown(STATUS_HARDWARE_FAILURE);
        self.set_power(PowerState::Off);
    }

    fn on_command_result(
        &mut self,
        context: CommandContext,
        opcode: u16,
        status: u8,
        params: Option<FieldView<'_>>,
    ) -> Result<()> {
        let outcome = classify(status);
        let failed = !outcome.is_success();
        if failed {
            debug!(
                "Command 0x{:04X} ({:?}) failed: {}",
                opcode,
                context,
                status_name(status)
            );
        }

        match context {
            CommandContext::PowerOn(step) => self.advance_power_on(step, status, params),
            _ if outcome == Outcome::Fatal(ErrorKind::HardwareFailure) => self.controller_failed(status),
            CommandContext::Inquiry => {
                if failed && self.inquiring {
                    self.inquiring = false;
                    self.emit(HostEvent::InquiryComplete(Err(Failure::Status(status))));
                }
            }
            CommandContext::InquiryCancel => {
                if !failed && self.inquiring {
                    self.inquiring = false;
                    self.emit(HostEvent::InquiryComplete(Err(Failure::Cancelled)));
                }
            }
            CommandContext::Connect(address) => {
                if failed {
                    if let Some(token) = self.registry.pending_token(&address) {
                        self.registry
                            .complete_connect(token, ConnectOutcome::Failed { status })?;
                        self.emit(HostEvent::ConnectionFailed {
                            address,
                            failure: Failure::Status(status),
                        });
                    }
                }
            }
            CommandContext::Accept(address) => {
                if failed {
                    self.incoming_failed(address, Failure::Status(status));
                }
            }
            CommandContext::RemoteName(address) => {
                if failed && self.name_requests.remove(&address).is_some() {
                    self.emit(HostEvent::RemoteName {
                        address,
                        result: Err(Failure::Status(status)),
                    });
                }
            }
            CommandContext::Authenticate(handle) | CommandContext::Encrypt(handle) => {
                if failed {
                    if let Some(address) = self.registry.lookup(handle).map(|record| record.address) {
                        self.pairing_failed(address, Failure::Status(status));
                    }
                }
            }
            CommandContext::Disconnect(handle) | CommandContext::ConnectionUpdate(handle) => {
                let flag = if matches!(context, CommandContext::Disconnect(_)) {
                    PendingOps::DISCONNECT
                } else {
                    PendingOps::CONNECTION_UPDATE
                };
                // Disconnect stays pending until Disconnection Complete
                if failed || flag == PendingOps::CONNECTION_UPDATE {
                    if let Some(record) = self.registry.lookup_mut(handle) {
                        record.pending.remove(flag);
                    }
                }
                if failed {
                    self.emit(HostEvent::CommandFailed {
                        opcode,
                        failure: Failure::Status(status),
                    });
                }
            }
            CommandContext::ConnectCancel(_) | CommandContext::RemoteNameCancel(_) => {}
            CommandContext::Plain => {
                if failed {
                    warn!("Command 0x{:04X} failed: {}", opcode, status_name(status));
                    self.emit(HostEvent::CommandFailed {
                        opcode,
                        failure: Failure::Status(status),
                    });
                }
            }
        }
        Ok(())
    }

    /// Release the pending entry of an incoming attempt we could not accept
    fn incoming_failed(&mut self, address: BdAddr, failure: Failure) {
        let Some(pending) = self.registry.pending(&address) else {
            return;
        };
        if pending.direction != Direction::Incoming {
            return;
        }
        let token = pending.token;
        warn!("Accepting connection from {} failed: {}", address, failure);
        self.registry.cancel_connect(token);
        self.emit(HostEvent::ConnectionFailed { address, failure });
    }

    fn on_command_timeout(&mut self, context: CommandContext, opcode: u16) {
        match context {
            CommandContext::PowerOn(_) => self.power_on_failed(Failure::Timeout),
            CommandContext::Inquiry => {
                if self.inquiring {
                    self.inquiring = false;
                    self.emit(HostEvent::InquiryComplete(Err(Failure::Timeout)));
                }
            }
            CommandContext::Connect(address) => {
                if let Some(token) = self.registry.pending_token(&address) {
                    self.registry.cancel_connect(token);
                    self.abandoned.insert(address);
                    self.emit(HostEvent::ConnectionFailed {
                        address,
                        failure: Failure::Timeout,
                    });
                }
            }
            CommandContext::Accept(address) => self.incoming_failed(address, Failure::Timeout),
            CommandContext::RemoteName(address) => {
                if self.name_requests.remove(&address).is_some() {
                    self.emit(HostEvent::RemoteName {
                        address,
                        result: Err(Failure::Timeout),
                    });
                }
            }
            CommandContext::Authenticate(handle) | CommandContext::Encrypt(handle) => {
                if let Some(address) = self.registry.lookup(handle).map(|record| record.address) {
                    self.pairing_failed(address, Failure::Timeout);
                }
            }
            CommandContext::Disconnect(handle) | CommandContext::ConnectionUpdate(handle) => {
                if let Some(record) = self.registry.lookup_mut(handle) {
                    record.pending.remove(PendingOps::DISCONNECT | PendingOps::CONNECTION_UPDATE);
                }
                self.emit(HostEvent::CommandFailed {
                    opcode,
                    failure: Failure::Timeout,
                });
            }
            CommandContext::InquiryCancel
            | CommandContext::ConnectCancel(_)
            | CommandContext::RemoteNameCancel(_)
            | CommandContext::Plain => self.emit(HostEvent::CommandFailed {
                opcode,
                failure: Failure::Timeout,
            }),
        }
    }

    fn on_connection_request(&mut self, address: BdAddr, class_of_device: u32, link_type: u8) {
        let reject_reason = if link_type != LINK_TYPE_ACL {
            Some(STATUS_REJECTED_LIMITED_RESOURCES)
        } else if !self.config.accept_incoming_connections {
            Some(STATUS_REJECTED_SECURITY_REASONS)
        } else if self
            .registry
            .begin_connect(address, LinkType::Classic, Direction::Incoming, Instant::now())
            .is_err()
        {
            // Our own attempt to the same device is in progress
            Some(STATUS_REJECTED_LIMITED_RESOURCES)
        } else {
            None
        };

        let accepted = reject_reason.is_none();
        match reject_reason {
            None => {
                info!("Accepting connection from {}", address);
                self.commands.push(
                    HciCommand::AcceptConnectionRequest {
                        address,
                        role: ROLE_REMAIN_PERIPHERAL,
                    },
                    CommandContext::Accept(address),
                );
            }
            Some(reason) => {
                info!("Rejecting connection from {}: {}", address, status_name(reason));
                self.commands
                    .push(HciCommand::RejectConnectionRequest { address, reason }, CommandContext::Plain);
            }
        }
        self.emit(HostEvent::IncomingConnection {
            address,
            class_of_device,
            accepted,
        });
    }

    fn on_connection_complete(
        &mut self,
        status: u8,
        handle: u16,
        address: BdAddr,
        link_type: LinkType,
        role: Option<Role>,
        encrypted: bool,
    ) -> Result<()> {
        let succeeded = classify(status).is_success();
        let token = match self.registry.pending_token(&address) {
            Some(token) => token,
            None if succeeded && self.abandoned.remove(&address) => {
                info!("Disconnecting stray link 0x{:04X} to {}", handle, address);
                self.commands.push(
                    HciCommand::Disconnect {
                        handle,
                        reason: STATUS_REMOTE_USER_TERMINATED_CONNECTION,
                    },
                    CommandContext::Disconnect(handle),
                );
                return Ok(());
            }
            None if succeeded => {
                // Links set up without a request from us, such as LE links
                // accepted while advertising
                let direction = match role {
                    Some(Role::Central) => Direction::Outgoing,
                    _ => Direction::Incoming,
                };
                self.registry
                    .begin_connect(address, link_type, direction, Instant::now())?
            }
            None => {
                self.abandoned.remove(&address);
                debug!(
                    "Connection to {} ended with {} with no attempt pending",
                    address,
                    status_name(status)
                );
                return Ok(());
            }
        };

        if !succeeded {
            self.registry.complete_connect(token, ConnectOutcome::Failed { status })?;
            self.emit(HostEvent::ConnectionFailed {
                address,
                failure: Failure::Status(status),
            });
            return Ok(());
        }

        let direction = self
            .registry
            .pending(&address)
            .map(|pending| pending.direction)
            .unwrap_or(Direction::Outgoing);
        let role = role.unwrap_or(match direction {
            Direction::Outgoing => Role::Central,
            Direction::Incoming => Role::Peripheral,
        });
        if self
            .registry
            .complete_connect(
                token,
                ConnectOutcome::Connected {
                    handle,
                    role,
                    encrypted,
                },
            )?
            .is_none()
        {
            return Ok(());
        }

        self.mux.add_link(handle, link_type, role);
        self.emit(HostEvent::Connected {
            handle,
            address,
            link_type,
            role,
        });

        let min = self.security.min_security_level();
        if link_type == LinkType::Classic && min > SecurityLevel::Level0 {
            self.start_authentication(handle, min)?;
        }
        Ok(())
    }

    fn on_disconnection_complete(&mut self, status: u8, handle: u16, reason: u8) {
        if !classify(status).is_success() {
            warn!("Disconnect of 0x{:04X} failed: {}", handle, status_name(status));
            if let Some(record) = self.registry.lookup_mut(handle) {
                record.pending.remove(PendingOps::DISCONNECT);
            }
            return;
        }

        let Some(record) = self.registry.remove(handle, &mut self.mux) else {
            debug!("Disconnection of untracked handle 0x{:04X}", handle);
            return;
        };
        self.commands.discard_queued(|context| context.handle() == Some(handle));
        info!(
            "Disconnected 0x{:04X} from {}: {}",
            handle,
            record.address,
            status_name(reason)
        );
        if self.security.finish(&record.address).is_some() {
            self.emit(HostEvent::PairingComplete {
                address: record.address,
                status: PairingStatus::Failed(Failure::Status(reason)),
            });
        }
        self.emit(HostEvent::Disconnected {
            handle,
            address: record.address,
            reason,
        });
    }

    fn on_authentication_complete(&mut self, status: u8, handle: u16) {
        let Some(record) = self.registry.lookup_mut(handle) else {
            debug!("Authentication complete for unknown handle 0x{:04X}", handle);
            return;
        };
        record.pending.remove(PendingOps::AUTHENTICATION);
        let address = record.address;

        match classify(status) {
            Outcome::Success => {}
            outcome => {
                if outcome == Outcome::Recoverable(ErrorKind::KeyMissing) {
                    // The peer lost the bond; pair from scratch next time
                    info!("{} rejected our link key, forgetting it", address);
                    self.security.link_keys_mut().remove(&address);
                }
                self.pairing_failed(address, Failure::Status(status));
                return;
            }
        }

        record.authenticated = true;
        if record.encrypted {
            self.security_established(handle);
        } else {
            record.pending |= PendingOps::ENCRYPTION;
            self.commands.push(
                HciCommand::SetConnectionEncryption { handle, enable: true },
                CommandContext::Encrypt(handle),
            );
        }
    }

    fn on_encryption_change(&mut self, status: u8, handle: u16, enabled: bool) {
        let Some(record) = self.registry.lookup_mut(handle) else {
            debug!("Encryption change for unknown handle 0x{:04X}", handle);
            return;
        };
        record.pending.remove(PendingOps::ENCRYPTION);
        let address = record.address;

        if !classify(status).is_success() {
            self.pairing_failed(address, Failure::Status(status));
            return;
        }

        record.encrypted = enabled;
        if enabled {
            self.security_established(handle);
        } else {
            info!("Encryption off on 0x{:04X}", handle);
            record.security_level = record.security_level.min(SecurityLevel::Level1);
        }
    }

    fn on_acl(&mut self, acl: &AclPacket<'_>) {
        self.stats.acl_received += 1;
        if self.registry.lookup(acl.handle).is_none() {
            warn!("ACL data for unknown handle 0x{:04X}", acl.handle);
            self.stats.protocol_violations += 1;
            return;
        }
        if let Err(e) = self.mux.on_acl_received(acl.handle, acl.boundary, acl.payload) {
            warn!("ACL data on 0x{:04X} dropped: {}", acl.handle, Error::from(e));
            self.stats.protocol_violations += 1;
        }
    }

    fn on_mux_event(&mut self, event: MuxEvent) {
        match event {
            MuxEvent::SecurityRequired { handle, level } => {
                if let Err(e) = self.start_authentication(handle, level) {
                    warn!("Cannot secure 0x{:04X} for L2CAP: {}", handle, e);
                    self.mux.security_failed(handle);
                }
            }
            MuxEvent::ConnectionParametersRequested { handle, params } => {
                if let Some(record) = self.registry.lookup_mut(handle) {
                    record.pending |= PendingOps::CONNECTION_UPDATE;
                }
                self.commands.push(
                    HciCommand::LeConnectionUpdate {
                        handle,
                        interval_min: params.conn_interval_min,
                        interval_max: params.conn_interval_max,
                        latency: params.conn_latency,
                        supervision_timeout: params.supervision_timeout,
                    },
                    CommandContext::ConnectionUpdate(handle),
                );
            }
            other => self.emit(HostEvent::L2cap(other)),
        }
    }

    /// Handle requests raised by the multiplexer, then drain queued
    /// commands and ACL packets into the transport
    fn process(&mut self) -> Result<()> {
        loop {
            let events = self.mux.take_events();
            if events.is_empty() {
                break;
            }
            for event in events {
                self.on_mux_event(event);
            }
        }
        self.flush()
    }

    fn flush(&mut self) -> Result<()> {
        if self.transport_blocked {
            return Ok(());
        }

        let now = Instant::now();
        loop {
            let Some(packet) = self.commands.peek_ready().map(|queued| queued.command.to_packet()) else {
                break;
            };
            match self.transport.send(&packet) {
                Ok(()) => {
                    self.commands.mark_sent(now);
                    self.stats.commands_sent += 1;
                }
                Err(TransportError::WouldBlock) => {
                    self.transport_blocked = true;
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }

        while let Some(outgoing) = self.mux.pop_transmit() {
            match self.transport.send(&outgoing.packet) {
                Ok(()) => self.stats.acl_sent += 1,
                Err(TransportError::WouldBlock) => {
                    self.mux.restore_transmit(outgoing);
                    self.transport_blocked = true;
                    return Ok(());
                }
                Err(e) => {
                    self.mux.restore_transmit(outgoing);
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}
