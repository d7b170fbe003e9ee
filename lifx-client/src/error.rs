use std::time::Duration;
use thiserror::Error;

/// Errors that can surface from the session layer.
///
/// Packet-parse errors (malformed size, unknown type routed to a subscriber that doesn't
/// want it) are recovered locally and never reach this type; see the crate docs.
#[derive(Error, Debug)]
pub enum Error {
    #[error("i/o error")]
    Io(#[from] std::io::Error),

    #[error("protocol error")]
    Protocol(#[from] lifx_core::Error),

    /// `_block_for` exhausted its retransmits without a reply.
    #[error("timed out waiting for device {device:012x} after {timeout:?} ({retransmits} retransmits)")]
    Timeout {
        device: u64,
        timeout: Duration,
        retransmits: u32,
    },

    /// A caller asked for both an ack and a response on the same request.
    #[error("a request cannot require both an acknowledgement and a response")]
    AckAndResponseBothRequested,

    /// A device hasn't told us (yet) what port a given service is reachable on.
    #[error("device {0:012x} has no known port for service {1:?}")]
    UnknownService(u64, lifx_core::Service),
}

pub type Result<T> = std::result::Result<T, Error>;
