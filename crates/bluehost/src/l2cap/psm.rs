//! Protocol/Service Multiplexer (PSM) handling for L2CAP
//!
//! This module names the assigned PSM values and checks PSM validity
//! for BR/EDR and LE channels.

use std::fmt;

/// Protocol/Service Multiplexer (PSM) values used in L2CAP.
///
/// See Bluetooth Core Specification Vol 3, Part A, Section 4.2 and the
/// assigned numbers for logical link control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Psm {
    Sdp,
    Rfcomm,
    TcsBin,
    TcsBinCordless,
    Bnep,
    HidControl,
    HidInterrupt,
    Upnp,
    Avctp,
    Avdtp,
    AvctpBrowsing,
    /// ATT over BR/EDR
    Att,
    ThreeDsp,
    /// Enhanced ATT over LE
    Eatt,
    /// Any other value, assigned at runtime or by a profile
    Dynamic(u16),
}

// First PSM of the BR/EDR dynamic range
pub const PSM_DYNAMIC_MIN: u16 = 0x1001;
// LE dynamic SPSM range
pub const LE_PSM_DYNAMIC_MIN: u16 = 0x0080;
pub const LE_PSM_DYNAMIC_MAX: u16 = 0x00FF;

impl Psm {
    /// Get the PSM value as u16
    pub fn value(&self) -> u16 {
        match self {
            Psm::Sdp => 0x0001,
            Psm::Rfcomm => 0x0003,
            Psm::TcsBin => 0x0005,
            Psm::TcsBinCordless => 0x0007,
            Psm::Bnep => 0x000F,
            Psm::HidControl => 0x0011,
            Psm::HidInterrupt => 0x0013,
            Psm::Upnp => 0x0015,
            Psm::Avctp => 0x0017,
            Psm::Avdtp => 0x0019,
            Psm::AvctpBrowsing => 0x001B,
            Psm::Att => 0x001F,
            Psm::ThreeDsp => 0x0021,
            Psm::Eatt => 0x0027,
            Psm::Dynamic(value) => *value,
        }
    }

    /// Map a raw value to a named PSM, falling back to `Dynamic`
    pub fn from_value(value: u16) -> Self {
        match value {
            0x0001 => Psm::Sdp,
            0x0003 => Psm::Rfcomm,
            0x0005 => Psm::TcsBin,
            0x0007 => Psm::TcsBinCordless,
            0x000F => Psm::Bnep,
            0x0011 => Psm::HidControl,
            0x0013 => Psm::HidInterrupt,
            0x0015 => Psm::Upnp,
            0x0017 => Psm::Avctp,
            0x0019 => Psm::Avdtp,
            0x001B => Psm::AvctpBrowsing,
            0x001F => Psm::Att,
            0x0021 => Psm::ThreeDsp,
            0x0027 => Psm::Eatt,
            other => Psm::Dynamic(other),
        }
    }

    /// BR/EDR PSMs are odd, with the least significant bit of the upper octet clear
    pub fn is_valid(&self) -> bool {
        is_valid_classic_psm(self.value())
    }
}

impl From<Psm> for u16 {
    fn from(psm: Psm) -> u16 {
        psm.value()
    }
}

/// Validity of a BR/EDR PSM
pub fn is_valid_classic_psm(value: u16) -> bool {
    value & 0x0101 == 0x0001
}

/// Validity of an LE simplified PSM
pub fn is_valid_le_psm(value: u16) -> bool {
    (0x0001..=LE_PSM_DYNAMIC_MAX).contains(&value)
}

impl fmt::Display for Psm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Psm::Sdp => write!(f, "SDP (0x0001)"),
            Psm::Rfcomm => write!(f, "RFCOMM (0x0003)"),
            Psm::TcsBin => write!(f, "TCS-BIN (0x0005)"),
            Psm::TcsBinCordless => write!(f, "TCS-BIN-CORDLESS (0x0007)"),
            Psm::Bnep => write!(f, "BNEP (0x000F)"),
            Psm::HidControl => write!(f, "HID-Control (0x0011)"),
            Psm::HidInterrupt => write!(f, "HID-Interrupt (0x0013)"),
            Psm::Upnp => write!(f, "UPnP (0x0015)"),
            Psm::Avctp => write!(f, "AVCTP (0x0017)"),
            Psm::Avdtp => write!(f, "AVDTP (0x0019)"),
            Psm::AvctpBrowsing => write!(f, "AVCTP-Browsing (0x001B)"),
            Psm::Att => write!(f, "ATT (0x001F)"),
            Psm::ThreeDsp => write!(f, "3DSP (0x0021)"),
            Psm::Eatt => write!(f, "EATT (0x0027)"),
            Psm::Dynamic(value) => write!(f, "Dynamic PSM (0x{:04X})", value),
        }
    }
}

/// Hands out unused dynamic PSMs for one multiplexer instance
#[derive(Debug)]
pub(crate) struct PsmAllocator {
    next_classic: u16,
    next_le: u16,
}

impl Default for PsmAllocator {
    fn default() -> Self {
        Self {
            next_classic: PSM_DYNAMIC_MIN,
            next_le: LE_PSM_DYNAMIC_MIN,
        }
    }
}

impl PsmAllocator {
    /// Next valid BR/EDR dynamic PSM for which `in_use` is false
    pub(crate) fn classic(&mut self, in_use: impl Fn(u16) -> bool) -> Option<u16> {
        let start = self.next_classic;
        loop {
            let candidate = self.next_classic;
            self.next_classic = next_classic_psm(candidate);
            if is_valid_classic_psm(candidate) && !in_use(candidate) {
                return Some(candidate);
            }
            if self.next_classic == start {
                return None;
            }
        }
    }

    /// Next LE dynamic SPSM for which `in_use` is false
    pub(crate) fn le(&mut self, in_use: impl Fn(u16) -> bool) -> Option<u16> {
        let start = self.next_le;
        loop {
            let candidate = self.next_le;
            self.next_le = if candidate >= LE_PSM_DYNAMIC_MAX {
                LE_PSM_DYNAMIC_MIN
            } else {
                candidate + 1
            };
            if !in_use(candidate) {
                return Some(candidate);
            }
            if self.next_le == start {
                return None;
            }
        }
    }
}

fn next_classic_psm(psm: u16) -> u16 {
    let mut next = psm.wrapping_add(2);
    if next & 0x0100 != 0 {
        // Skip the block whose upper octet is odd
        next = next.wrapping_add(0x0100);
    }
    if next < PSM_DYNAMIC_MIN {
        next = PSM_DYNAMIC_MIN;
    }
    next
}
