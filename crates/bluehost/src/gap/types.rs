use crate::error::Error;
use crate::gap::constants::*;
use bitflags::bitflags;
use std::fmt;
use std::str::FromStr;

/// Role of the local device on a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Central,
    Peripheral,
}

impl Role {
    pub fn from_hci(value: u8) -> Self {
        if value == 0x01 {
            Role::Peripheral
        } else {
            Role::Central
        }
    }
}

/// Physical transport of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkType {
    Classic,
    Le,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    Public,
    Random,
    PublicIdentity,
    RandomIdentity,
}

impl From<u8> for AddressType {
    fn from(value: u8) -> Self {
        match value {
            PUBLIC_DEVICE_ADDRESS => AddressType::Public,
            RANDOM_DEVICE_ADDRESS => AddressType::Random,
            PUBLIC_IDENTITY_ADDRESS => AddressType::PublicIdentity,
            RANDOM_IDENTITY_ADDRESS => AddressType::RandomIdentity,
            _ => AddressType::Public,
        }
    }
}

impl From<AddressType> for u8 {
    fn from(value: AddressType) -> Self {
        match value {
            AddressType::Public => PUBLIC_DEVICE_ADDRESS,
            AddressType::Random => RANDOM_DEVICE_ADDRESS,
            AddressType::PublicIdentity => PUBLIC_IDENTITY_ADDRESS,
            AddressType::RandomIdentity => RANDOM_IDENTITY_ADDRESS,
        }
    }
}

/// Device address, stored in wire (little-endian) byte order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BdAddr {
    pub bytes: [u8; 6],
}

impl BdAddr {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() >= 6 {
            let mut bytes = [0u8; 6];
            bytes.copy_from_slice(&slice[0..6]);
            Some(Self { bytes })
        } else {
            None
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.bytes[5],
            self.bytes[4],
            self.bytes[3],
            self.bytes[2],
            self.bytes[1],
            self.bytes[0]
        )
    }
}

impl FromStr for BdAddr {
    type Err = Error;

    /// Parses the human-readable `AA:BB:CC:DD:EE:FF` form (most significant byte first).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(Error::InvalidParameter(format!("bad address: {}", s)));
        }

        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            bytes[5 - i] = u8::from_str_radix(part, 16)
                .map_err(|_| Error::InvalidParameter(format!("bad address: {}", s)))?;
        }
        Ok(Self { bytes })
    }
}

/// Security level of a link, ordered from weakest to strongest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum SecurityLevel {
    /// No security, only allowed for SDP
    #[default]
    Level0,
    /// Low security, no encryption required
    Level1,
    /// Encrypted with an unauthenticated key
    Level2,
    /// Encrypted with an authenticated (MITM protected) key
    Level3,
    /// Authenticated Secure Connections key with 128-bit encryption
    Level4,
}

/// IO capability advertised during Secure Simple Pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoCapability {
    DisplayOnly = 0x00,
    DisplayYesNo = 0x01,
    KeyboardOnly = 0x02,
    NoInputNoOutput = 0x03,
}

impl IoCapability {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(IoCapability::DisplayOnly),
            0x01 => Some(IoCapability::DisplayYesNo),
            0x02 => Some(IoCapability::KeyboardOnly),
            0x03 => Some(IoCapability::NoInputNoOutput),
            _ => None,
        }
    }

    /// Whether a MITM-protected association model is possible between the two sides
    pub fn supports_mitm_with(self, peer: IoCapability) -> bool {
        use IoCapability::*;
        !matches!(
            (self, peer),
            (NoInputNoOutput, _)
                | (_, NoInputNoOutput)
                | (DisplayOnly, DisplayOnly)
                | (DisplayOnly, DisplayYesNo)
                | (DisplayYesNo, DisplayOnly)
        )
    }
}

bitflags! {
    /// Authentication requirements sent in the IO Capability Request Reply
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AuthRequirements: u8 {
        const MITM_PROTECTION = 0x01;
        const DEDICATED_BONDING = 0x02;
        const GENERAL_BONDING = 0x04;
    }
}

/// Link key type reported by Link Key Notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKeyType {
    Combination,
    LocalUnit,
    RemoteUnit,
    DebugCombination,
    UnauthenticatedP192,
    AuthenticatedP192,
    ChangedCombination,
    UnauthenticatedP256,
    AuthenticatedP256,
    Unknown(u8),
}

impl LinkKeyType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => LinkKeyType::Combination,
            0x01 => LinkKeyType::LocalUnit,
            0x02 => LinkKeyType::RemoteUnit,
            0x03 => LinkKeyType::DebugCombination,
            0x04 => LinkKeyType::UnauthenticatedP192,
            0x05 => LinkKeyType::AuthenticatedP192,
            0x06 => LinkKeyType::ChangedCombination,
            0x07 => LinkKeyType::UnauthenticatedP256,
            0x08 => LinkKeyType::AuthenticatedP256,
            other => LinkKeyType::Unknown(other),
        }
    }

    /// Security level an encrypted link reaches with a key of this type
    pub fn security_level(self) -> SecurityLevel {
        match self {
            LinkKeyType::AuthenticatedP256 => SecurityLevel::Level4,
            LinkKeyType::AuthenticatedP192 => SecurityLevel::Level3,
            LinkKeyType::Combination
            | LinkKeyType::ChangedCombination
            | LinkKeyType::UnauthenticatedP192
            | LinkKeyType::UnauthenticatedP256 => SecurityLevel::Level2,
            LinkKeyType::LocalUnit
            | LinkKeyType::RemoteUnit
            | LinkKeyType::DebugCombination
            | LinkKeyType::Unknown(_) => SecurityLevel::Level1,
        }
    }
}

/// A device found during inquiry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub address: BdAddr,
    pub page_scan_repetition_mode: u8,
    pub class_of_device: u32,
    pub clock_offset: u16,
    pub rssi: Option<i8>,
    pub name: Option<String>,
}

/// Split EIR/advertising data into (type, data) structures
pub fn parse_eir(data: &[u8]) -> Vec<(u8, &[u8])> {
    let mut result = Vec::new();
    let mut i = 0;

    while i < data.len() {
        let length = data[i] as usize;
        if length == 0 || i + 1 + length > data.len() {
            break;
        }

        result.push((data[i + 1], &data[i + 2..i + 1 + length]));
        i += 1 + length;
    }

    result
}

/// Extract the local name from EIR data, preferring the complete name
pub fn eir_local_name(data: &[u8]) -> Option<String> {
    let fields = parse_eir(data);
    fields
        .iter()
        .find(|(ty, _)| *ty == EIR_TYPE_COMPLETE_LOCAL_NAME)
        .or_else(|| fields.iter().find(|(ty, _)| *ty == EIR_TYPE_SHORT_LOCAL_NAME))
        .map(|(_, name)| String::from_utf8_lossy(name).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bd_addr_display_and_parse() {
        let addr: BdAddr = "00:1A:7D:DA:71:13".parse().unwrap();
        assert_eq!(addr.bytes, [0x13, 0x71, 0xDA, 0x7D, 0x1A, 0x00]);
        assert_eq!(addr.to_string(), "00:1A:7D:DA:71:13");

        assert!("00:1A:7D".parse::<BdAddr>().is_err());
        assert!("00:1A:7D:DA:71:ZZ".parse::<BdAddr>().is_err());
    }

    #[test]
    fn test_link_key_security_levels() {
        assert_eq!(LinkKeyType::from_u8(0x04).security_level(), SecurityLevel::Level2);
        assert_eq!(LinkKeyType::from_u8(0x05).security_level(), SecurityLevel::Level3);
        assert_eq!(LinkKeyType::from_u8(0x08).security_level(), SecurityLevel::Level4);
        assert_eq!(LinkKeyType::from_u8(0x00).security_level(), SecurityLevel::Level2);
        assert_eq!(LinkKeyType::from_u8(0x42), LinkKeyType::Unknown(0x42));
    }

    #[test]
    fn test_mitm_capability_matrix() {
        use IoCapability::*;
        assert!(DisplayYesNo.supports_mitm_with(DisplayYesNo));
        assert!(KeyboardOnly.supports_mitm_with(DisplayOnly));
        assert!(!NoInputNoOutput.supports_mitm_with(DisplayYesNo));
        assert!(!DisplayOnly.supports_mitm_with(DisplayYesNo));
    }

    #[test]
    fn test_eir_name() {
        let eir = [
            0x02, EIR_TYPE_FLAGS, 0x06,
            0x04, EIR_TYPE_SHORT_LOCAL_NAME, b'a', b'b', b'c',
            0x05, EIR_TYPE_COMPLETE_LOCAL_NAME, b'a', b'b', b'c', b'd',
            0x00, 0x00,
        ];
        assert_eq!(eir_local_name(&eir), Some("abcd".to_string()));

        // Truncated structure stops parsing
        let eir = [0x09, EIR_TYPE_COMPLETE_LOCAL_NAME, b'x'];
        assert_eq!(eir_local_name(&eir), None);
    }
}
