//! Secure-transport seam.
//!
//! Record-layer protection (TLS or anything else) is an opaque capability
//! attached to an [`crate::Endpoint`].  When present, every read and write of
//! the endpoint and of the multiplexer goes through it instead of the raw
//! socket.

use std::io;
use std::net::TcpStream;

/// Which side of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Encrypting/decrypting wrapper over a connected socket.
///
/// Implementations use `&TcpStream` (which implements `Read` and `Write`) for
/// the raw bytes.  They must honour the socket's blocking mode and timeouts:
/// a non-blocking socket must surface `WouldBlock` rather than spin.
pub trait SecureTransport: Send {
    fn read(&mut self, socket: &TcpStream, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, socket: &TcpStream, buf: &[u8]) -> io::Result<usize>;

    /// Sends any protocol-level closing notification.
    fn close(&mut self, _socket: &TcpStream) -> io::Result<()> {
        Ok(())
    }
}

/// Creates a [`SecureTransport`] for a freshly accepted or connected socket,
/// performing whatever handshake the protocol needs.
pub trait SecureUpgrade: Send + Sync {
    fn upgrade(&self, socket: &TcpStream, role: Role) -> io::Result<Box<dyn SecureTransport>>;
}
