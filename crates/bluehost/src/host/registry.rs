//! Connection registry
//!
//! Single source of truth for live and pending ACL links. Pending attempts
//! are keyed by device address, live links by connection handle. A handle
//! only becomes free again through [`ConnectionRegistry::remove`], which the
//! host calls once the controller has reported the disconnection.

use crate::error::{Error, Result};
use crate::gap::{BdAddr, LinkKeyType, LinkType, Role, SecurityLevel};
use crate::l2cap::L2capMux;
use bitflags::bitflags;
use log::{debug, error, info};
use std::collections::HashMap;
use std::time::{Duration, Instant};

bitflags! {
    /// Operations outstanding on a live link
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PendingOps: u8 {
        const AUTHENTICATION = 0x01;
        const ENCRYPTION = 0x02;
        const DISCONNECT = 0x04;
        const CONNECTION_UPDATE = 0x08;
    }
}

/// Who started a connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Proof of a pending connection attempt, handed out by `begin_connect`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectToken {
    id: u64,
    address: BdAddr,
}

impl ConnectToken {
    pub fn address(&self) -> BdAddr {
        self.address
    }
}

/// How a connection attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected { handle: u16, role: Role, encrypted: bool },
    Failed { status: u8 },
}

#[derive(Debug, Clone)]
pub struct PendingConnection {
    pub token: ConnectToken,
    pub link_type: LinkType,
    pub direction: Direction,
    pub started: Instant,
}

/// A live ACL link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub handle: u16,
    pub address: BdAddr,
    pub role: Role,
    pub link_type: LinkType,
    pub direction: Direction,
    pub security_level: SecurityLevel,
    pub encrypted: bool,
    pub authenticated: bool,
    /// Type of the link key in use, once known
    pub key_type: Option<LinkKeyType>,
    pub pending: PendingOps,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    pending: HashMap<BdAddr, PendingConnection>,
    records: HashMap<u16, ConnectionRecord>,
    next_token: u64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection attempt to `address`.
    ///
    /// Fails with `AlreadyPending` while another attempt to the same
    /// address is outstanding.
    pub fn begin_connect(
        &mut self,
        address: BdAddr,
        link_type: LinkType,
        direction: Direction,
        now: Instant,
    ) -> Result<ConnectToken> {
        if self.pending.contains_key(&address) {
            return Err(Error::AlreadyPending(address));
        }

        self.next_token += 1;
        let token = ConnectToken {
            id: self.next_token,
            address,
        };
        debug!("Pending {:?} {:?} connection to {}", direction, link_type, address);
        self.pending.insert(
            address,
            PendingConnection {
                token,
                link_type,
                direction,
                started: now,
            },
        );
        Ok(token)
    }

    /// The outstanding attempt to `address`, if any
    pub fn pending_token(&self, address: &BdAddr) -> Option<ConnectToken> {
        self.pending.get(address).map(|pending| pending.token)
    }

    pub fn pending(&self, address: &BdAddr) -> Option<&PendingConnection> {
        self.pending.get(address)
    }

    /// Resolve a pending attempt.
    ///
    /// Returns `Ok(None)` for a token that is no longer pending (cancelled
    /// or already completed); the caller decides what to do with a link the
    /// controller brought up anyway. A success reusing a live handle means
    /// the registry and the controller disagree and is reported as
    /// `RegistryCorrupted`.
    pub fn complete_connect(
        &mut self,
        token: ConnectToken,
        outcome: ConnectOutcome,
    ) -> Result<Option<&ConnectionRecord>> {
        let Some(pending) = self.pending.get(&token.address) else {
            debug!("Completion for {} without pending attempt", token.address);
            return Ok(None);
        };
        if pending.token != token {
            debug!("Stale completion for {}", token.address);
            return Ok(None);
        }

        match outcome {
            ConnectOutcome::Failed { status } => {
                info!("Connection to {} failed: status 0x{:02X}", token.address, status);
                self.pending.remove(&token.address);
                Ok(None)
            }
            ConnectOutcome::Connected {
                handle,
                role,
                encrypted,
            } => {
                if self.records.contains_key(&handle) {
                    error!("Handle 0x{:04X} reported for {} is still live", handle, token.address);
                    self.pending.remove(&token.address);
                    return Err(Error::RegistryCorrupted(format!(
                        "handle 0x{:04X} assigned twice",
                        handle
                    )));
                }
                let Some(pending) = self.pending.remove(&token.address) else {
                    return Ok(None);
                };
                info!(
                    "Connected to {} as 0x{:04X} ({:?}, {:?})",
                    token.address, handle, pending.link_type, role
                );
                let record = ConnectionRecord {
                    handle,
                    address: token.address,
                    role,
                    link_type: pending.link_type,
                    direction: pending.direction,
                    security_level: SecurityLevel::Level0,
                    encrypted,
                    authenticated: false,
                    key_type: None,
                    pending: PendingOps::empty(),
                };
                Ok(Some(&*self.records.entry(handle).or_insert(record)))
            }
        }
    }

    /// Drop a pending attempt. A later completion for it is a no-op.
    pub fn cancel_connect(&mut self, token: ConnectToken) -> bool {
        match self.pending.get(&token.address) {
            Some(pending) if pending.token == token => {
                debug!("Cancelled connection attempt to {}", token.address);
                self.pending.remove(&token.address);
                true
            }
            _ => false,
        }
    }

    /// Attempts older than `timeout` in either direction, removed from the
    /// registry
    pub fn expire_pending(&mut self, now: Instant, timeout: Duration) -> Vec<PendingConnection> {
        let mut expired: Vec<BdAddr> = self
            .pending
            .values()
            .filter(|pending| now.saturating_duration_since(pending.started) >= timeout)
            .map(|pending| pending.token.address)
            .collect();
        expired.sort_unstable_by_key(|address| address.bytes);

        expired
            .into_iter()
            .filter_map(|address| self.pending.remove(&address))
            .collect()
    }

    pub fn lookup(&self, handle: u16) -> Option<&ConnectionRecord> {
        self.records.get(&handle)
    }

    pub fn lookup_mut(&mut self, handle: u16) -> Option<&mut ConnectionRecord> {
        self.records.get_mut(&handle)
    }

    pub fn lookup_by_address(&self, address: &BdAddr) -> Option<&ConnectionRecord> {
        self.records.values().find(|record| record.address == *address)
    }

    /// Forget a disconnected link and every L2CAP channel on it
    pub fn remove(&mut self, handle: u16, mux: &mut L2capMux) -> Option<ConnectionRecord> {
        let record = self.records.remove(&handle)?;
        let closed = mux.remove_link(handle);
        info!(
            "Removed connection 0x{:04X} to {} ({} channels closed)",
            handle, record.address, closed
        );
        Some(record)
    }

    /// Drop everything, as on power off
    pub fn clear(&mut self, mux: &mut L2capMux) -> Vec<ConnectionRecord> {
        self.pending.clear();
        let mut handles: Vec<u16> = self.records.keys().copied().collect();
        handles.sort_unstable();
        handles
            .into_iter()
            .filter_map(|handle| self.remove(handle, mux))
            .collect()
    }

    pub fn handles(&self) -> Vec<u16> {
        let mut handles: Vec<u16> = self.records.keys().copied().collect();
        handles.sort_unstable();
        handles
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
