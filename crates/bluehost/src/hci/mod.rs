//! Bluetooth HCI (Host Controller Interface) layer
//!
//! Packet decoding, typed events, command builders, status classification
//! and the transport boundary.

pub mod command;
pub mod constants;
pub mod event;
pub mod names;
pub mod packet;
pub mod socket;
pub mod status;
pub mod transport;


pub use command::HciCommand;
pub use event::{CompletedPackets, Event};
pub use names::{event_name, packet_type_name, status_name};
pub use packet::{decode, AclPacket, FieldView, Packet, PacketBoundary, PacketType};
pub use socket::HciSocket;
pub use status::{classify, classify_event, ErrorKind, EventClass, Outcome};
pub use transport::{RecordingTransport, Transport, TransportError};
