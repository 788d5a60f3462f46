//! Device protocol: framing, correlation and routing of shoe responses

pub mod codec;
pub mod command;
pub mod correlator;
pub mod pending;
pub mod reassembly;
pub mod response;

pub use codec::{CodecError, ResponseFrame};
pub use command::{Command, CommandKind, TimeoutPolicy};
pub use correlator::Correlator;
pub use pending::PendingRegistry;
pub use reassembly::{Assembled, ReassemblyBuffer};
pub use response::{DeviceResponse, Reply};

use thiserror::Error;

use crate::ble::BleError;

/// Failure of one protocol operation, as seen by its caller
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Not connected to device")]
    NotConnected,

    #[error("{0} timeout")]
    Timeout(CommandKind),

    #[error("{0}")]
    Device(String),

    #[error("Authentication required")]
    AuthenticationRequired,

    #[error("Session expired")]
    SessionExpired,

    #[error("Device is locked")]
    DeviceLocked,

    #[error("Gesture mismatch: {0}")]
    GestureMismatch(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("{0} already in progress")]
    AlreadyPending(CommandKind),

    #[error("No wallets found on device")]
    NoWallets,

    #[error("Unexpected reply to {0}")]
    UnexpectedReply(CommandKind),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Transport error: {0}")]
    Transport(#[from] BleError),
}

impl ProtocolError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProtocolError::Timeout(_))
    }
}
