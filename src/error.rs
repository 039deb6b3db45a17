use std::io;

use thiserror::Error;
use tracing::error;

/// Errors reported by a message ring.
///
/// Every variant except [`RingError::BufferTooSmall`] is fatal for the ring
/// that reported it: the ring is broken and later calls keep failing with
/// [`RingError::ConnectionLost`]. `BufferTooSmall` leaves the ring untouched
/// and the same message can be fetched again with a larger buffer.
#[derive(Debug, Error)]
pub enum RingError {
    /// The record exchange over the control socket failed. The socket itself
    /// is left open so the caller can fall back to plain TCP.
    #[error("handshake over the control socket failed: {0}")]
    HandshakeFailed(#[source] io::Error),

    /// A verbs call failed while creating or wiring up queue pair, memory
    /// regions or completion queues.
    #[error("verbs resource setup failed: {0}")]
    RdmaSetupFailed(#[source] io::Error),

    /// The provider rejected a send work request.
    #[error("provider rejected a send work request: {0}")]
    PostSendFailed(#[source] io::Error),

    /// An error completion was observed or the queue pair left the
    /// ready-to-send state.
    #[error("queue pair left the ready-to-send state")]
    ConnectionLost,

    /// The destination buffer cannot hold the next message. The message
    /// stays in the ring.
    #[error("destination holds {capacity} bytes but the next message has {needed}")]
    BufferTooSmall {
        /// Length of the pending message.
        needed: usize,
        /// Capacity the caller provided.
        capacity: usize,
    },

    /// The ring contains framing that cannot have been produced by a
    /// well-behaved peer.
    #[error("invalid ring framing: {0}")]
    ProtocolError(&'static str),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RingError>;

/// Capture the last OS error, log it with a note and return it.
pub(crate) fn log_ret_last_os_err(note: &str) -> io::Error {
    let err = io::Error::last_os_error();
    if note.is_empty() {
        error!("OS error {:?}", err);
    } else {
        error!("OS error {:?} in {}", err, note);
    }
    err
}

/// Capture the last OS error and only log it. For `Drop` impls, where
/// returning the error is not an option.
pub(crate) fn log_last_os_err(note: &str) {
    let _unused = log_ret_last_os_err(note);
}

/// Returns the last OS error without logging.
pub(crate) fn last_os_err() -> io::Error {
    io::Error::last_os_error()
}
