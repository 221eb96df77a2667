use thiserror::Error;

pub type QuicheResult<T> = Result<T, QuicheError>;

/// Wire error codes from the host ABI (section 6). Every `QuicheError` variant
/// maps onto exactly one of these so the API boundary can always report a code.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Ok = 0,
    General = 1,
    Invalid = 2,
    Memory = 3,
    Io = 4,
    Crypto = 5,
    Version = 6,
    AlreadyFinished = 7,
}

/// Error kinds per the error handling design: protocol, crypto, I/O, resource, misuse.
#[derive(Debug, Error)]
pub enum QuicheError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("crypto/handshake error: {0}")]
    Crypto(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("resource exhausted: {0}")]
    Resource(String),

    #[error("misuse: {0}")]
    Misuse(String),

    #[error("unsupported version")]
    Version,
}

impl QuicheError {
    /// The numeric code this error should surface through the host ABI.
    pub fn code(&self) -> ErrorCode {
        match self {
            QuicheError::Protocol(_) => ErrorCode::Invalid,
            QuicheError::Crypto(_) => ErrorCode::Crypto,
            QuicheError::Io(_) => ErrorCode::Io,
            QuicheError::Resource(_) => ErrorCode::Memory,
            QuicheError::Misuse(_) => ErrorCode::AlreadyFinished,
            QuicheError::Version => ErrorCode::Version,
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        QuicheError::Protocol(msg.into())
    }

    pub fn misuse(msg: impl Into<String>) -> Self {
        QuicheError::Misuse(msg.into())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for QuicheError {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        QuicheError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            err.to_string(),
        ))
    }
}

pub fn require(cond: bool, msg: &str) -> QuicheResult<()> {
    if !cond {
        return Err(QuicheError::protocol(msg));
    }
    Ok(())
}
