use num_enum::TryFromPrimitive;
use thiserror::Error;

/// Error code byte carried in a SESS reply. The value 0 means success and is
///  deliberately not a member.
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum SessErrorCode {
    Auth = 1,
    Busy = 2,
    Conn = 3,
    PVer = 4,
    Expr = 5,
    Mesg = 6,
}

/// The session error taxonomy surfaced to the `connect` caller. All of these
///  are final: no error is retried above the reliability layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("invalid authentication token")]
    Auth,
    #[error("already logged in")]
    Busy,
    #[error("could not connect to server")]
    Conn,
    #[error("this client is too old")]
    PVer,
    #[error("authentication token expired")]
    Expr,
    #[error("connection failed: {0}")]
    Mesg(String),
    #[error("connection failed with unknown error code {0}")]
    Unknown(u8),
}

impl SessionError {
    /// Maps a nonzero SESS error code (plus the follow-up string carried by
    ///  `Mesg` replies) to the typed error.
    pub fn from_code(code: u8, message: Option<String>) -> SessionError {
        match SessErrorCode::try_from(code) {
            Ok(SessErrorCode::Auth) => SessionError::Auth,
            Ok(SessErrorCode::Busy) => SessionError::Busy,
            Ok(SessErrorCode::Conn) => SessionError::Conn,
            Ok(SessErrorCode::PVer) => SessionError::PVer,
            Ok(SessErrorCode::Expr) => SessionError::Expr,
            Ok(SessErrorCode::Mesg) => SessionError::Mesg(message.unwrap_or_default()),
            Err(_) => SessionError::Unknown(code),
        }
    }
}
