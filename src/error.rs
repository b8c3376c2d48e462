//! Error types for the stack.

use thiserror::Error;

/// Errors raised while parsing or validating a received packet.
///
/// These never propagate above the transport layer: the engine that hits one
/// drops the packet, bumps a counter and moves on.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    /// Packet is shorter than its mandatory header
    #[error("truncated packet")]
    Truncated,
    /// Version nibble does not match the protocol family
    #[error("unsupported version")]
    BadVersion,
    /// Header or message checksum does not verify
    #[error("checksum mismatch")]
    BadChecksum,
    /// Field contents violate the wire format
    #[error("malformed packet")]
    Malformed,
    /// Address bytes do not match the expected family
    #[error("address family mismatch")]
    AddressFamily,
}

/// Errors surfaced to the embedder when setting up or driving the stack.
#[derive(Error, Debug)]
pub enum StackError {
    /// Underlying device I/O failed
    #[error("device error: {0}")]
    Device(#[from] std::io::Error),
    /// A textual address did not parse
    #[error("bad address: {0}")]
    BadAddress(String),
}
