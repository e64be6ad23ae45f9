//! Pairing sessions and the link key database
//!
//! A session exists per remote address while pairing runs. Whether Secure
//! Simple Pairing or legacy PIN pairing is used is decided by what the peer
//! sends: an IO Capability Response selects SSP, a PIN Code Request without
//! one selects legacy pairing.

use crate::config::{ConfirmationPolicy, HostConfig, PinCodePolicy};
use crate::error::{Error, Result};
use crate::gap::{AuthRequirements, BdAddr, IoCapability, LinkKeyType, SecurityLevel};
use crate::hci::status::STATUS_PAIRING_NOT_ALLOWED;
use crate::hci::HciCommand;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::time::{Duration, Instant};

const PIN_CODE_MAX_LEN: usize = 16;
const PASSKEY_MAX: u32 = 999_999;

/// A stored BR/EDR link key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredLinkKey {
    pub key: [u8; 16],
    pub key_type: LinkKeyType,
}

impl StoredLinkKey {
    pub fn security_level(&self) -> SecurityLevel {
        self.key_type.security_level()
    }
}

/// In-memory link key database
#[derive(Debug, Default)]
pub struct LinkKeyDb {
    keys: HashMap<BdAddr, StoredLinkKey>,
}

impl LinkKeyDb {
    pub fn get(&self, address: &BdAddr) -> Option<&StoredLinkKey> {
        self.keys.get(address)
    }

    pub fn insert(&mut self, address: BdAddr, key: [u8; 16], key_type: LinkKeyType) {
        self.keys.insert(address, StoredLinkKey { key, key_type });
    }

    pub fn remove(&mut self, address: &BdAddr) -> Option<StoredLinkKey> {
        self.keys.remove(address)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingMethod {
    Undecided,
    SecureSimplePairing,
    Legacy,
}

/// Input the session waits for from the application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserRequest {
    Confirmation,
    Passkey,
    PinCode,
}

#[derive(Debug, Clone)]
pub struct PairingSession {
    pub address: BdAddr,
    /// We asked for authentication
    pub initiator: bool,
    pub method: PairingMethod,
    pub awaiting: Option<UserRequest>,
    /// Level the pairing must reach
    pub required: SecurityLevel,
    pub peer_io_capability: Option<IoCapability>,
    pub peer_auth_requirements: AuthRequirements,
    pub deadline: Instant,
}

/// What to do with a controller request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Reply(HciCommand),
    AskUser,
}

/// Pairing policy and state for all remote devices
#[derive(Debug)]
pub struct SecurityManager {
    io_capability: IoCapability,
    secure_simple_pairing: bool,
    bondable: bool,
    min_security_level: SecurityLevel,
    confirmation_policy: ConfirmationPolicy,
    pin_code_policy: PinCodePolicy,
    timeout: Duration,
    sessions: HashMap<BdAddr, PairingSession>,
    keys: LinkKeyDb,
}

impl SecurityManager {
    pub fn new(config: &HostConfig) -> Self {
        Self {
            io_capability: config.io_capability,
            secure_simple_pairing: config.secure_simple_pairing,
            bondable: config.bondable,
            min_security_level: config.min_security_level,
            confirmation_policy: config.confirmation_policy,
            pin_code_policy: config.pin_code_policy.clone(),
            timeout: config.pairing_timeout,
            sessions: HashMap::new(),
            keys: LinkKeyDb::default(),
        }
    }

    pub fn link_keys(&self) -> &LinkKeyDb {
        &self.keys
    }

    pub fn link_keys_mut(&mut self) -> &mut LinkKeyDb {
        &mut self.keys
    }

    pub fn min_security_level(&self) -> SecurityLevel {
        self.min_security_level
    }

    pub fn session(&self, address: &BdAddr) -> Option<&PairingSession> {
        self.sessions.get(address)
    }

    pub fn is_pairing(&self, address: &BdAddr) -> bool {
        self.sessions.contains_key(address)
    }

    /// Start a session we initiated. Returns false if one is already running.
    pub fn start(&mut self, address: BdAddr, required: SecurityLevel, now: Instant) -> bool {
        if let Some(session) = self.sessions.get_mut(&address) {
            session.required = session.required.max(required);
            return false;
        }
        debug!("Pairing with {} started locally (need {:?})", address, required);
        let session = self.new_session(address, true, required, now);
        self.sessions.insert(address, session);
        true
    }

    fn new_session(&self, address: BdAddr, initiator: bool, required: SecurityLevel, now: Instant) -> PairingSession {
        PairingSession {
            address,
            initiator,
            method: PairingMethod::Undecided,
            awaiting: None,
            required: required.max(self.min_security_level),
            peer_io_capability: None,
            peer_auth_requirements: AuthRequirements::empty(),
            deadline: now + self.timeout,
        }
    }

    /// The session for a peer-driven request, created when the peer started
    fn session_entry(&mut self, address: BdAddr, now: Instant) -> &mut PairingSession {
        if !self.sessions.contains_key(&address) {
            debug!("Pairing with {} started by peer", address);
        }
        let fresh = self.new_session(address, false, SecurityLevel::Level0, now);
        self.sessions.entry(address).or_insert(fresh)
    }

    /// Answer a Link Key Request from the database
    pub fn on_link_key_request(&mut self, address: BdAddr) -> HciCommand {
        let required = self
            .sessions
            .get(&address)
            .map(|session| session.required)
            .unwrap_or(SecurityLevel::Level0);

        match self.keys.get(&address) {
            Some(stored) if stored.security_level() >= required => {
                debug!("Link key for {} found ({:?})", address, stored.key_type);
                HciCommand::LinkKeyRequestReply {
                    address,
                    key: stored.key,
                }
            }
            Some(stored) => {
                info!(
                    "Stored {:?} key for {} too weak for {:?}, pairing again",
                    stored.key_type, address, required
                );
                HciCommand::LinkKeyRequestNegativeReply { address }
            }
            None => HciCommand::LinkKeyRequestNegativeReply { address },
        }
    }

    /// Authentication requirements sent in our IO Capability Request Reply
    pub fn local_auth_requirements(&self, required: SecurityLevel) -> AuthRequirements {
        let mut auth = AuthRequirements::empty();
        if self.bondable {
            auth |= AuthRequirements::GENERAL_BONDING;
        }
        if required >= SecurityLevel::Level3 {
            auth |= AuthRequirements::MITM_PROTECTION;
        }
        auth
    }

    pub fn on_io_capability_request(&mut self, address: BdAddr, now: Instant) -> HciCommand {
        if !self.secure_simple_pairing {
            debug!("Refusing SSP with {}: disabled", address);
            return HciCommand::IoCapabilityRequestNegativeReply {
                address,
                reason: STATUS_PAIRING_NOT_ALLOWED,
            };
        }

        let io_capability = self.io_capability;
        let required = self.session_entry(address, now).required;
        HciCommand::IoCapabilityRequestReply {
            address,
            io_capability,
            oob_data_present: false,
            auth_requirements: self.local_auth_requirements(required),
        }
    }

    /// Record the peer's capabilities. Returns true when this selects SSP
    /// for a session that had not chosen a method yet.
    pub fn on_io_capability_response(
        &mut self,
        address: BdAddr,
        io_capability: u8,
        auth_requirements: u8,
        now: Instant,
    ) -> bool {
        let session = self.session_entry(address, now);
        session.peer_io_capability = IoCapability::from_u8(io_capability);
        session.peer_auth_requirements = AuthRequirements::from_bits_truncate(auth_requirements);
        if session.method != PairingMethod::Undecided {
            return false;
        }
        session.method = PairingMethod::SecureSimplePairing;
        debug!(
            "SSP with {}: peer {:?}, {:?}",
            address, session.peer_io_capability, session.peer_auth_requirements
        );
        true
    }

    pub fn on_user_confirmation_request(&mut self, address: BdAddr, now: Instant) -> Decision {
        let policy = self.confirmation_policy;
        let session = self.session_entry(address, now);
        session.method = PairingMethod::SecureSimplePairing;
        match policy {
            ConfirmationPolicy::AutoAccept => {
                info!("Accepting numeric comparison with {} without user", address);
                Decision::Reply(HciCommand::UserConfirmationRequestReply { address })
            }
            ConfirmationPolicy::Reject => {
                Decision::Reply(HciCommand::UserConfirmationRequestNegativeReply { address })
            }
            ConfirmationPolicy::AskUser => {
                session.awaiting = Some(UserRequest::Confirmation);
                Decision::AskUser
            }
        }
    }

    pub fn on_passkey_request(&mut self, address: BdAddr, now: Instant) -> Decision {
        let can_type = self.io_capability == IoCapability::KeyboardOnly;
        let session = self.session_entry(address, now);
        session.method = PairingMethod::SecureSimplePairing;
        if !can_type {
            warn!("Passkey requested by {} but we have no keyboard", address);
            return Decision::Reply(HciCommand::UserPasskeyRequestNegativeReply { address });
        }
        session.awaiting = Some(UserRequest::Passkey);
        Decision::AskUser
    }

    /// Returns whether this request selects legacy pairing, and what to do
    pub fn on_pin_code_request(&mut self, address: BdAddr, now: Instant) -> (bool, Decision) {
        let policy = self.pin_code_policy.clone();
        let session = self.session_entry(address, now);
        let legacy_started = session.method != PairingMethod::Legacy;
        session.method = PairingMethod::Legacy;

        let decision = match policy {
            PinCodePolicy::Fixed(pin) => match pin_reply(address, Some(&pin)) {
                Ok(command) => Decision::Reply(command),
                Err(e) => {
                    warn!("Configured PIN unusable: {}", e);
                    Decision::Reply(HciCommand::PinCodeRequestNegativeReply { address })
                }
            },
            PinCodePolicy::Reject => Decision::Reply(HciCommand::PinCodeRequestNegativeReply { address }),
            PinCodePolicy::AskUser => {
                session.awaiting = Some(UserRequest::PinCode);
                Decision::AskUser
            }
        };
        (legacy_started, decision)
    }

    fn take_awaiting(&mut self, address: &BdAddr, request: UserRequest) -> Result<()> {
        let session = self.sessions.get_mut(address).ok_or(Error::InvalidState)?;
        if session.awaiting != Some(request) {
            return Err(Error::InvalidState);
        }
        session.awaiting = None;
        Ok(())
    }

    pub fn confirmation_reply(&mut self, address: BdAddr, accept: bool) -> Result<HciCommand> {
        self.take_awaiting(&address, UserRequest::Confirmation)?;
        Ok(if accept {
            HciCommand::UserConfirmationRequestReply { address }
        } else {
            HciCommand::UserConfirmationRequestNegativeReply { address }
        })
    }

    pub fn passkey_reply(&mut self, address: BdAddr, passkey: Option<u32>) -> Result<HciCommand> {
        if passkey.is_some_and(|passkey| passkey > PASSKEY_MAX) {
            return Err(Error::InvalidParameter("passkey above 999999".into()));
        }
        self.take_awaiting(&address, UserRequest::Passkey)?;
        Ok(match passkey {
            Some(passkey) => HciCommand::UserPasskeyRequestReply { address, passkey },
            None => HciCommand::UserPasskeyRequestNegativeReply { address },
        })
    }

    pub fn pin_code_reply(&mut self, address: BdAddr, pin: Option<&str>) -> Result<HciCommand> {
        let command = pin_reply(address, pin)?;
        self.take_awaiting(&address, UserRequest::PinCode)?;
        Ok(command)
    }

    /// Store a new key; returns its type
    pub fn on_link_key_notification(&mut self, address: BdAddr, key: [u8; 16], key_type: u8) -> LinkKeyType {
        let key_type = LinkKeyType::from_u8(key_type);
        if self.bondable {
            debug!("Storing {:?} link key for {}", key_type, address);
            self.keys.insert(address, key, key_type);
        } else {
            debug!("Not bondable, {:?} key for {} kept for this link only", key_type, address);
        }
        key_type
    }

    /// End the session with `address`
    pub fn finish(&mut self, address: &BdAddr) -> Option<PairingSession> {
        self.sessions.remove(address)
    }

    /// Sessions past their deadline, removed
    pub fn expire(&mut self, now: Instant) -> Vec<PairingSession> {
        let expired: Vec<BdAddr> = self
            .sessions
            .values()
            .filter(|session| session.deadline <= now)
            .map(|session| session.address)
            .collect();
        expired
            .into_iter()
            .filter_map(|address| self.sessions.remove(&address))
            .collect()
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
    }
}

fn pin_reply(address: BdAddr, pin: Option<&str>) -> Result<HciCommand> {
    let Some(pin) = pin else {
        return Ok(HciCommand::PinCodeRequestNegativeReply { address });
    };
    if pin.is_empty() || pin.len() > PIN_CODE_MAX_LEN {
        return Err(Error::InvalidParameter(format!(
            "PIN must be 1 to {} bytes, got {}",
            PIN_CODE_MAX_LEN,
            pin.len()
        )));
    }
    Ok(HciCommand::PinCodeRequestReply {
        address,
        pin: pin.as_bytes().to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> BdAddr {
        BdAddr::new([0x01, 0x02, 0x03, 0x04, 0x05, 0x06])
    }

    #[test]
    fn test_link_key_request_uses_database() {
        let mut security = SecurityManager::new(&HostConfig::default());
        assert_eq!(
            security.on_link_key_request(peer()),
            HciCommand::LinkKeyRequestNegativeReply { address: peer() }
        );

        security.link_keys_mut().insert(peer(), [7; 16], LinkKeyType::UnauthenticatedP192);
        assert_eq!(
            security.on_link_key_request(peer()),
            HciCommand::LinkKeyRequestReply {
                address: peer(),
                key: [7; 16]
            }
        );

        // An authenticated pairing is required; the unauthenticated key is not enough
        assert!(security.start(peer(), SecurityLevel::Level3, Instant::now()));
        assert_eq!(
            security.on_link_key_request(peer()),
            HciCommand::LinkKeyRequestNegativeReply { address: peer() }
        );
    }

    #[test]
    fn test_io_capability_reply_reflects_config() {
        let config = HostConfig::default()
            .with_io_capability(IoCapability::KeyboardOnly)
            .with_min_security_level(SecurityLevel::Level3);
        let mut security = SecurityManager::new(&config);

        match security.on_io_capability_request(peer(), Instant::now()) {
            HciCommand::IoCapabilityRequestReply {
                io_capability,
                auth_requirements,
                ..
            } => {
                assert_eq!(io_capability, IoCapability::KeyboardOnly);
                assert!(auth_requirements.contains(AuthRequirements::MITM_PROTECTION));
                assert!(auth_requirements.contains(AuthRequirements::GENERAL_BONDING));
            }
            other => panic!("unexpected {:?}", other),
        }

        let mut legacy_only = SecurityManager::new(&HostConfig::default().with_secure_simple_pairing(false));
        assert!(matches!(
            legacy_only.on_io_capability_request(peer(), Instant::now()),
            HciCommand::IoCapabilityRequestNegativeReply { reason: STATUS_PAIRING_NOT_ALLOWED, .. }
        ));
    }

    #[test]
    fn test_method_follows_received_capability() {
        let mut security = SecurityManager::new(&HostConfig::default());
        let now = Instant::now();
        assert!(security.on_io_capability_response(peer(), 0x01, 0x04, now));
        assert!(!security.on_io_capability_response(peer(), 0x01, 0x04, now));
        let session = security.session(&peer()).unwrap();
        assert_eq!(session.method, PairingMethod::SecureSimplePairing);
        assert_eq!(session.peer_io_capability, Some(IoCapability::DisplayYesNo));
        assert!(!session.initiator);

        let mut other = SecurityManager::new(&HostConfig::default());
        let (legacy, decision) = other.on_pin_code_request(peer(), now);
        assert!(legacy);
        assert_eq!(decision, Decision::AskUser);
        assert_eq!(other.session(&peer()).map(|s| s.method), Some(PairingMethod::Legacy));
    }

    #[test]
    fn test_confirmation_policies() {
        let now = Instant::now();
        let mut ask = SecurityManager::new(&HostConfig::default());
        assert_eq!(ask.on_user_confirmation_request(peer(), now), Decision::AskUser);
        assert!(ask.passkey_reply(peer(), Some(1)).is_err());
        assert_eq!(
            ask.confirmation_reply(peer(), true).unwrap(),
            HciCommand::UserConfirmationRequestReply { address: peer() }
        );
        // Answered already
        assert!(ask.confirmation_reply(peer(), true).is_err());

        let mut auto = SecurityManager::new(
            &HostConfig::default().with_confirmation_policy(ConfirmationPolicy::AutoAccept),
        );
        assert_eq!(
            auto.on_user_confirmation_request(peer(), now),
            Decision::Reply(HciCommand::UserConfirmationRequestReply { address: peer() })
        );

        let mut reject = SecurityManager::new(
            &HostConfig::default().with_confirmation_policy(ConfirmationPolicy::Reject),
        );
        assert_eq!(
            reject.on_user_confirmation_request(peer(), now),
            Decision::Reply(HciCommand::UserConfirmationRequestNegativeReply { address: peer() })
        );
    }

    #[test]
    fn test_pin_policies_and_validation() {
        let now = Instant::now();
        let mut fixed = SecurityManager::new(
            &HostConfig::default().with_pin_code_policy(PinCodePolicy::Fixed("0000".into())),
        );
        let (_, decision) = fixed.on_pin_code_request(peer(), now);
        assert_eq!(
            decision,
            Decision::Reply(HciCommand::PinCodeRequestReply {
                address: peer(),
                pin: b"0000".to_vec()
            })
        );

        let mut ask = SecurityManager::new(&HostConfig::default());
        ask.on_pin_code_request(peer(), now);
        assert!(ask.pin_code_reply(peer(), Some("")).is_err());
        assert!(ask.pin_code_reply(peer(), Some("01234567890123456")).is_err());
        // Still waiting after the invalid attempts
        assert_eq!(
            ask.pin_code_reply(peer(), None).unwrap(),
            HciCommand::PinCodeRequestNegativeReply { address: peer() }
        );
    }

    #[test]
    fn test_passkey_range() {
        let mut security =
            SecurityManager::new(&HostConfig::default().with_io_capability(IoCapability::KeyboardOnly));
        assert_eq!(security.on_passkey_request(peer(), Instant::now()), Decision::AskUser);
        assert!(security.passkey_reply(peer(), Some(1_000_000)).is_err());
        assert_eq!(
            security.passkey_reply(peer(), Some(123_456)).unwrap(),
            HciCommand::UserPasskeyRequestReply {
                address: peer(),
                passkey: 123_456
            }
        );

        let mut display_only =
            SecurityManager::new(&HostConfig::default().with_io_capability(IoCapability::DisplayOnly));
        assert_eq!(
            display_only.on_passkey_request(peer(), Instant::now()),
            Decision::Reply(HciCommand::UserPasskeyRequestNegativeReply { address: peer() })
        );
    }

    #[test]
    fn test_bondable_controls_storage_and_sessions_expire() {
        let mut security = SecurityManager::new(&HostConfig::default().with_bondable(false));
        let key_type = security.on_link_key_notification(peer(), [1; 16], 0x05);
        assert_eq!(key_type, LinkKeyType::AuthenticatedP192);
        assert!(security.link_keys().is_empty());

        let now = Instant::now();
        security.start(peer(), SecurityLevel::Level2, now);
        assert!(security.expire(now + Duration::from_secs(29)).is_empty());
        let expired = security.expire(now + Duration::from_secs(30));
        assert_eq!(expired.len(), 1);
        assert!(!security.is_pairing(&peer()));
    }
}
