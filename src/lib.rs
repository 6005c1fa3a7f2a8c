//! A connection-oriented, reliable byte-stream transport layered over UDP: a
//! stop-and-wait TCP-like handshake, data transfer, and teardown state
//! machine running entirely over ordinary datagram sockets, with no TUN
//! device or root privileges required.

mod config;
mod conn;
mod demux;
mod engine;
mod err;
mod packet;
mod socket;

pub use config::Config;
pub use err::Error;
pub use packet::Packet;
pub use socket::{RdtListener, RdtStream};

use std::net::SocketAddr;

/// Actively opens a connection to `peer`. Blocks until the three-way
/// handshake completes.
pub fn connect(peer: SocketAddr, cfg: Config) -> Result<RdtStream, Error> {
    RdtStream::connect(peer, cfg)
}

/// Binds a passive-open endpoint on `local`. Call `accept()` on the result
/// to receive incoming connections.
pub fn bind(local: SocketAddr, cfg: Config) -> Result<RdtListener, Error> {
    RdtListener::bind(local, cfg)
}
