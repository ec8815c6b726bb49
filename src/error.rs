//! Error taxonomy for the messaging core.
//!
//! Every fallible library operation returns [`NetError`]. Grammar and
//! allocation failures surface synchronously to the caller; failures caused by
//! bytes arriving from a peer are logged at the ingest boundary and never
//! reach application code.

use thiserror::Error;

use crate::address::Address;

/// Result alias used throughout the crate.
pub type NetResult<T> = Result<T, NetError>;

/// Errors raised by the grammar, allocator, endpoint and phase scheduler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    /// Message string violates the `CHANNEL:NAME` grammar.
    #[error("malformed message '{msg}': {reason}")]
    MalformedMessage {
        /// The offending message string.
        msg: String,
        /// Which rule was violated.
        reason: String,
    },

    /// Packet type string is not one of the known types.
    #[error("invalid packet type: {0}")]
    InvalidPacketType(String),

    /// Channel string is not one of the known channels.
    #[error("invalid channel: {0}")]
    InvalidChannel(String),

    /// Address has an unknown prefix or a non-numeric ordinal.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Manually assigned address was already issued.
    #[error("address {0} already allocated")]
    AddressInUse(String),

    /// No local or remote handler is registered for the message.
    #[error("no handler for {0}")]
    NoHandler(String),

    /// The peer a call was waiting on closed before replying.
    #[error("peer disconnected before replying to {0}")]
    PeerDisconnected(String),

    /// A networked operation was attempted without a gateway or role.
    #[error("endpoint {0} is not connected")]
    NotConnected(String),

    /// A call waited longer than the configured timeout.
    #[error("call {msg} timed out after {millis}ms")]
    Timeout {
        /// Message that was called.
        msg: String,
        /// Timeout that elapsed.
        millis: u64,
    },

    /// A handler (local or remote) returned an error.
    #[error("handler for {msg} failed: {message}")]
    Handler {
        /// Message whose handler failed.
        msg: String,
        /// Error text reported by the handler.
        message: String,
    },

    /// The hub refused a protocol request.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The socket's outbound queue is gone.
    #[error("socket {0} is closed")]
    SocketClosed(String),

    /// Frame or packet could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// `run_phase_group` named a group the machine does not define.
    #[error("unknown phase group '{0}'")]
    UnknownPhaseGroup(String),

    /// A group was run before the groups declared ahead of it completed.
    #[error("phase group '{group}' cannot run before '{waiting_on}' completes")]
    PhaseOrder {
        /// Group that was requested.
        group: String,
        /// First earlier group that has not completed.
        waiting_on: String,
    },

    /// A `MACHINE/PHASE` or `MACHINE/GROUP` selector is malformed.
    #[error("invalid selector '{0}', expected MACHINE/NAME")]
    InvalidSelector(String),

    /// No machine with that name is registered.
    #[error("unknown phase machine '{0}'")]
    UnknownMachine(String),

    /// A phase hook failed; the group was halted.
    #[error("hook failed in {machine}/{phase}: {message}")]
    HookFailed {
        /// Machine name.
        machine: String,
        /// Phase whose hook failed.
        phase: String,
        /// Error text from the hook.
        message: String,
    },

    /// Transport-level I/O failure.
    #[error("io error: {0}")]
    Io(String),
}

impl NetError {
    /// Shorthand for a [`NetError::MalformedMessage`].
    pub(crate) fn malformed(msg: &str, reason: impl Into<String>) -> Self {
        Self::MalformedMessage {
            msg: msg.to_string(),
            reason: reason.into(),
        }
    }

    /// Peer-disconnected error naming the address (or socket label) that closed.
    pub(crate) fn disconnected(peer: Option<&Address>, label: &str) -> Self {
        match peer {
            Some(addr) => Self::PeerDisconnected(addr.to_string()),
            None => Self::PeerDisconnected(label.to_string()),
        }
    }
}

impl From<std::io::Error> for NetError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for NetError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}
