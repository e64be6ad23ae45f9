//! Linux HCI user-channel socket transport
//!
//! Binds a raw Bluetooth socket to `HCI_CHANNEL_USER`, which gives the host
//! core exclusive access to the controller. Packets on this channel carry the
//! same one-byte type tag used across the transport boundary.

use crate::hci::transport::{Transport, TransportError};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

// Bluetooth socket constants
const AF_BLUETOOTH: i32 = 31;
const BTPROTO_HCI: i32 = 1;
const HCI_CHANNEL_USER: u16 = 1;

// Largest packet the socket can deliver: tag + ACL header + 65535 payload
const MAX_PACKET_SIZE: usize = 1 + 4 + 0xFFFF;

/// Represents an HCI socket
#[derive(Debug)]
pub struct HciSocket {
    fd: RawFd,
}

#[repr(C)]
struct SockaddrHci {
    hci_family: libc::sa_family_t,
    hci_dev: u16,
    hci_channel: u16,
}

impl HciSocket {
    /// Opens the user channel of HCI device `dev_id` (0 for `hci0`).
    ///
    /// The device must be down and the caller needs `CAP_NET_ADMIN`.
    pub fn open(dev_id: u16) -> Result<Self, TransportError> {
        let fd = unsafe {
            libc::socket(
                AF_BLUETOOTH,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                BTPROTO_HCI,
            )
        };

        if fd < 0 {
            return Err(TransportError::Io(io::Error::last_os_error()));
        }

        let addr = SockaddrHci {
            hci_family: AF_BLUETOOTH as libc::sa_family_t,
            hci_dev: dev_id,
            hci_channel: HCI_CHANNEL_USER,
        };

        let result = unsafe {
            libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<SockaddrHci>() as libc::socklen_t,
            )
        };

        if result < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(TransportError::Io(err));
        }

        log::debug!("Opened HCI user channel on hci{}", dev_id);
        Ok(HciSocket { fd })
    }

    /// Wait up to `timeout` for the socket to become readable.
    ///
    /// Returns `Ok(false)` when the timeout expires.
    pub fn wait_readable(&self, timeout: Duration) -> Result<bool, TransportError> {
        let mut read_fds: libc::fd_set = unsafe { std::mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut read_fds);
            libc::FD_SET(self.fd, &mut read_fds);
        }

        let mut timeout_val = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };

        let result = unsafe {
            libc::select(
                self.fd + 1,
                &mut read_fds,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                &mut timeout_val,
            )
        };

        if result < 0 {
            return Err(TransportError::Io(io::Error::last_os_error()));
        }
        Ok(result > 0)
    }

    /// Read one complete packet, including its type tag
    pub fn read_packet(&self) -> Result<Vec<u8>, TransportError> {
        let mut buffer = vec![0u8; MAX_PACKET_SIZE];

        let bytes_read = unsafe {
            libc::read(
                self.fd,
                buffer.as_mut_ptr() as *mut libc::c_void,
                buffer.len(),
            )
        };

        if bytes_read < 0 {
            return Err(TransportError::Io(io::Error::last_os_error()));
        }
        if bytes_read == 0 {
            return Err(TransportError::Closed);
        }

        buffer.truncate(bytes_read as usize);
        Ok(buffer)
    }

    /// Read one packet, or `None` if nothing arrives within `timeout`
    pub fn read_packet_timeout(&self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        if !self.wait_readable(timeout)? {
            return Ok(None);
        }
        self.read_packet().map(Some)
    }
}

impl Transport for HciSocket {
    fn send(&mut self, packet: &[u8]) -> Result<(), TransportError> {
        let written = unsafe {
            libc::write(
                self.fd,
                packet.as_ptr() as *const libc::c_void,
                packet.len(),
            )
        };

        if written < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock => Err(TransportError::WouldBlock),
                _ => Err(TransportError::Io(err)),
            };
        }
        Ok(())
    }
}

impl AsRawFd for HciSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for HciSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
