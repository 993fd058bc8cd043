use thiserror::Error;

pub type Result<T> = std::result::Result<T, SipError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SipError {
    #[error("invalid state save area magic")]
    InvalidMagic,

    #[error("unsupported state save area version {0}")]
    UnsupportedVersion(u8),

    #[error("truncated {what}: need {needed} bytes, have {len}")]
    Truncated {
        what: &'static str,
        needed: usize,
        len: usize,
    },

    #[error("invalid state save area header size {0} (in 8-byte units)")]
    InvalidSize(u8),

    #[error("invalid state save area geometry: {0}")]
    InvalidGeometry(&'static str),

    #[error("unsupported implicit args version {0}")]
    UnsupportedImplicitArgsVersion(u8),

    #[error("invalid packed register layout: {0}")]
    InvalidPackedLayout(&'static str),
}

pub(crate) fn ensure_len(buf: &[u8], needed: usize, what: &'static str) -> Result<()> {
    if buf.len() < needed {
        return Err(SipError::Truncated {
            what,
            needed,
            len: buf.len(),
        });
    }
    Ok(())
}
