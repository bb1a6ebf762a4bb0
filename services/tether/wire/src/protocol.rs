//! Command and error vocabulary shared by both sides of a session.

use crate::WireError;

/// Command codes reserved by the session protocol.
///
/// Any other positive code is an application command routed to the
/// handler's callback.
pub mod command {
    /// Handshake request accepted
    pub const ACCEPT: i16 = 1;
    /// Handshake request refused; the error field says why
    pub const DENY: i16 = 2;
    /// Open a brand new session
    pub const NEW_CLIENT: i16 = 3;
    /// Open an additional channel for an existing session
    pub const NOT_NEW_CLIENT: i16 = 4;
    /// Reserved
    pub const CLIENT_ID: i16 = 5;
    /// Reserved
    pub const HANDLER_ID: i16 = 6;
    /// Ask the session to stop one of its handlers
    pub const STOP_HANDLER: i16 = 7;
    /// Recover a broken channel
    pub const RECONNECT: i16 = 8;
    /// Reserved
    pub const CANCEL: i16 = 9;

    /// Whether `code` belongs to the reserved protocol range.
    pub fn is_reserved(code: i16) -> bool {
        (ACCEPT..=CANCEL).contains(&code)
    }
}

/// Error codes carried by a `DENY` response
#[repr(i16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The handshake command was not recognized
    UnknownCode = 1,
    /// No session exists for the presented client id
    ClientNotFound = 2,
    /// No recovery is pending for the presented handler id
    HandlerNotFound = 3,
}

impl TryFrom<i16> for ErrorCode {
    type Error = WireError;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ErrorCode::UnknownCode),
            2 => Ok(ErrorCode::ClientNotFound),
            3 => Ok(ErrorCode::HandlerNotFound),
            _ => Err(WireError::UnknownErrorCode(value)),
        }
    }
}

impl From<ErrorCode> for i16 {
    fn from(code: ErrorCode) -> Self {
        code as i16
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::UnknownCode => "UNKNOWN_CODE",
            ErrorCode::ClientNotFound => "CLIENT_NOT_FOUND",
            ErrorCode::HandlerNotFound => "HANDLER_NOT_FOUND",
        };
        f.write_str(name)
    }
}
