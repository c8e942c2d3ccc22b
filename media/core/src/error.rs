//! Error and hangup cause types.

use std::io;

/// Cause placed on the channel when the media layer kills the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HangupCause {
    /// Negotiation-derived failures.
    IncompatibleDestination,
    /// Transport provisioning failures.
    DestinationOutOfOrder,
    /// RTP inactivity timer expired.
    MediaTimeout,
}

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("no RTP ports available")]
    PortsExhausted,

    #[error("external address lookup failed: {0}")]
    ExtAddressLookup(String),

    #[error("failed to set remote media address: {0}")]
    RemoteAddress(String),

    #[error("media handle is not ready")]
    NotReady,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl MediaError {
    /// The hangup cause a provisioning failure maps to.
    pub fn hangup_cause(&self) -> HangupCause {
        match self {
            MediaError::RemoteAddress(..) => HangupCause::IncompatibleDestination,
            _ => HangupCause::DestinationOutOfOrder,
        }
    }
}
