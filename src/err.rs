use std::net::SocketAddr;

/// Errors surfaced across the façade (connect/accept/send/recv/close) and the
/// underlying `std::io::Error` boundary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation is not valid in the connection's current state")]
    IllegalState,

    #[error("datagram transport failed sending to {0}")]
    TransportFailure(SocketAddr),

    #[error("listener on {0} already bound")]
    PortInUse(SocketAddr),

    #[error("connection to {0} was reset or torn down")]
    ConnectionClosed(SocketAddr),
}

/// Internal decode failures. These never reach application code; the
/// demultiplexer logs and drops the offending datagram (spec §7).
#[derive(Debug, thiserror::Error)]
pub(crate) enum CodecError {
    #[error("datagram too short to contain a header: {0} bytes")]
    Truncated(usize),

    #[error("declared payload length {declared} does not match the {actual} remaining bytes")]
    LengthMismatch { declared: usize, actual: usize },
}
