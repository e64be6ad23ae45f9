//! bluehost - the core of a Bluetooth host stack
//!
//! This library sits between a Bluetooth controller and the profiles above
//! it. It decodes HCI packets, drives the controller through power-on,
//! discovery, connection and pairing, and multiplexes L2CAP channels over
//! the resulting ACL links.
//!
//! The core is single threaded and never blocks: feed it packets with
//! [`Host::on_transport_packet`], advance timers with [`Host::tick`] and
//! collect results with [`Host::take_events`]. On Linux, [`HciSocket`]
//! provides a raw HCI transport.

pub mod config;
pub mod error;
pub mod gap;
pub mod hci;
pub mod host;
pub mod l2cap;

// Re-export common types for convenience
pub use config::{ConfirmationPolicy, HostConfig, PinCodePolicy};
pub use error::{Error, Procedure, Result};
pub use gap::{AddressType, BdAddr, IoCapability, LinkKeyType, LinkType, Role, SecurityLevel};
pub use hci::{HciCommand, HciSocket, PacketType, RecordingTransport, Transport, TransportError};
pub use host::{
    ConnectToken, ConnectionRecord, Failure, Host, HostEvent, LocalVersion, PacketHandler, PairingStatus,
    PowerState, Stats,
};
pub use l2cap::{
    ChannelContext, ChannelHandler, ChannelMode, ChannelSpec, IncomingChannel, L2capError, L2capMux, MuxEvent,
    ServiceAcceptor, ServicePolicy,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_starts_powered_off() {
        let host = Host::new(RecordingTransport::new(), HostConfig::default());
        assert_eq!(host.power_state(), PowerState::Off);
        assert!(host.transport().sent().next().is_none());
    }

    #[test]
    fn test_open_hci_socket() {
        // Needs privileges and an adapter; only checks that failure is an error, not a panic
        if let Ok(socket) = HciSocket::open(0) {
            drop(socket);
        }
    }
}
