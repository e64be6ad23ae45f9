//! Command/event correlation
//!
//! Commands wait here until the controller has room for them. Each command
//! on the wire carries a [`CommandContext`] telling the host what the
//! matching Command Complete or Command Status continues. With one
//! outstanding command (the default) responses pair up in order; with more,
//! they are matched by opcode.

use super::PowerStep;
use crate::gap::BdAddr;
use crate::hci::constants::OPCODE_NOP;
use crate::hci::HciCommand;
use log::{debug, trace, warn};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// What a command's completion continues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandContext {
    PowerOn(PowerStep),
    Inquiry,
    InquiryCancel,
    Connect(BdAddr),
    /// Accept Connection Request for an incoming attempt
    Accept(BdAddr),
    ConnectCancel(BdAddr),
    RemoteName(BdAddr),
    RemoteNameCancel(BdAddr),
    Disconnect(u16),
    Authenticate(u16),
    Encrypt(u16),
    ConnectionUpdate(u16),
    /// Replies and settings with no procedure waiting on them
    Plain,
}

impl CommandContext {
    /// The connection handle the command refers to, if any
    pub fn handle(&self) -> Option<u16> {
        match *self {
            CommandContext::Disconnect(handle)
            | CommandContext::Authenticate(handle)
            | CommandContext::Encrypt(handle)
            | CommandContext::ConnectionUpdate(handle) => Some(handle),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuedCommand {
    pub command: HciCommand,
    pub context: CommandContext,
}

/// A command the controller has not answered yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlight {
    pub opcode: u16,
    pub context: CommandContext,
    pub deadline: Instant,
}

#[derive(Debug)]
pub struct CommandQueue {
    max_outstanding: usize,
    /// Command packets the controller last said it can accept
    credits: u8,
    timeout: Duration,
    waiting: VecDeque<QueuedCommand>,
    in_flight: VecDeque<InFlight>,
}

impl CommandQueue {
    pub fn new(max_outstanding: u8, timeout: Duration) -> Self {
        Self {
            max_outstanding: usize::from(max_outstanding.max(1)),
            credits: 1,
            timeout,
            waiting: VecDeque::new(),
            in_flight: VecDeque::new(),
        }
    }

    pub fn push(&mut self, command: HciCommand, context: CommandContext) {
        trace!("Queueing command 0x{:04X} for {:?}", command.opcode(), context);
        self.waiting.push_back(QueuedCommand { command, context });
    }

    /// The next command the controller has room for
    pub fn peek_ready(&self) -> Option<&QueuedCommand> {
        if self.credits == 0 || self.in_flight.len() >= self.max_outstanding {
            return None;
        }
        self.waiting.front()
    }

    /// Move the front command in flight after it went out on the transport
    pub fn mark_sent(&mut self, now: Instant) -> Option<u16> {
        let queued = self.waiting.pop_front()?;
        let opcode = queued.command.opcode();
        self.credits = self.credits.saturating_sub(1);
        self.in_flight.push_back(InFlight {
            opcode,
            context: queued.context,
            deadline: now + self.timeout,
        });
        Some(opcode)
    }

    /// Resolve the command a Command Complete or Command Status refers to.
    ///
    /// `num_packets` replaces the controller's credit count. A NOP opcode
    /// only carries credits.
    pub fn on_response(&mut self, opcode: u16, num_packets: u8) -> Option<CommandContext> {
        self.credits = num_packets;
        if opcode == OPCODE_NOP {
            return None;
        }

        match self.in_flight.iter().position(|entry| entry.opcode == opcode) {
            Some(index) => self.in_flight.remove(index).map(|entry| entry.context),
            None => {
                warn!("Response for command 0x{:04X} that is not in flight", opcode);
                None
            }
        }
    }

    /// Commands whose response deadline has passed
    pub fn expire(&mut self, now: Instant) -> Vec<InFlight> {
        let mut expired = Vec::new();
        self.in_flight.retain(|entry| {
            if entry.deadline <= now {
                expired.push(entry.clone());
                false
            } else {
                true
            }
        });
        if !expired.is_empty() {
            // Assume the controller can take another command
            self.credits = self.credits.max(1);
        }
        expired
    }

    /// Drop queued commands whose context matches, e.g. for a link that is gone
    pub fn discard_queued<F>(&mut self, mut matches: F) -> usize
    where
        F: FnMut(&CommandContext) -> bool,
    {
        let before = self.waiting.len();
        self.waiting.retain(|queued| !matches(&queued.context));
        let dropped = before - self.waiting.len();
        if dropped > 0 {
            debug!("Discarded {} queued commands", dropped);
        }
        dropped
    }

    /// Whether a command with this context is queued or in flight
    pub fn contains(&self, context: &CommandContext) -> bool {
        self.waiting.iter().any(|queued| queued.context == *context)
            || self.in_flight.iter().any(|entry| entry.context == *context)
    }

    pub fn clear(&mut self) {
        self.waiting.clear();
        self.in_flight.clear();
        self.credits = 1;
    }

    pub fn queued(&self) -> usize {
        self.waiting.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_idle(&self) -> bool {
        self.waiting.is_empty() && self.in_flight.is_empty()
    }
}
