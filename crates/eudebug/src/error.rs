use eudebug_sip::SipError;
use thiserror::Error;

use crate::backend::{GpuMemoryError, ThreadControlError};

pub type Result<T> = std::result::Result<T, DebugError>;

/// Coarse error classes reported to the API layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    NotAvailable,
    NotReady,
    Unknown,
    UnsupportedFeature,
    UnsupportedVersion,
}

#[derive(Debug, Error)]
pub enum DebugError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("not available: {0}")]
    NotAvailable(&'static str),

    #[error("not ready: {0}")]
    NotReady(&'static str),

    #[error("{0}")]
    Unknown(&'static str),

    #[error("unsupported feature: {0}")]
    UnsupportedFeature(&'static str),

    #[error("unsupported version {0}")]
    UnsupportedVersion(u32),

    #[error("gpu memory access failed: {0}")]
    Memory(#[from] GpuMemoryError),

    #[error("thread control failed: {0}")]
    ThreadControl(#[from] ThreadControlError),

    #[error("state save area: {0}")]
    StateSaveArea(#[from] SipError),
}

impl DebugError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DebugError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            DebugError::NotAvailable(_) => ErrorKind::NotAvailable,
            DebugError::NotReady(_) => ErrorKind::NotReady,
            DebugError::Unknown(_) | DebugError::Memory(_) => ErrorKind::Unknown,
            DebugError::UnsupportedFeature(_) => ErrorKind::UnsupportedFeature,
            DebugError::UnsupportedVersion(_) => ErrorKind::UnsupportedVersion,
            DebugError::ThreadControl(_) => ErrorKind::NotAvailable,
            DebugError::StateSaveArea(SipError::UnsupportedImplicitArgsVersion(0)) => {
                ErrorKind::UnsupportedVersion
            }
            DebugError::StateSaveArea(SipError::UnsupportedImplicitArgsVersion(_)) => {
                ErrorKind::UnsupportedFeature
            }
            DebugError::StateSaveArea(_) => ErrorKind::Unknown,
        }
    }
}
