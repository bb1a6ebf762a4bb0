//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Not enough bytes to decode a header
    #[error("incomplete header: need {needed} bytes, have {have}")]
    Incomplete {
        /// Bytes required
        needed: usize,
        /// Bytes available
        have: usize,
    },

    /// A command or error code set through the public API was not positive
    #[error("{field} code must be positive, got {value}")]
    NonPositiveCode {
        /// Which header field was rejected
        field: &'static str,
        /// The rejected value
        value: i16,
    },

    /// Payload variants require at least one byte
    #[error("payload must not be empty")]
    EmptyPayload,

    /// Payload exceeds the length field or the receiver's limit
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Header carries a negative length other than the no-payload sentinel
    #[error("invalid payload length {0}")]
    InvalidLength(i32),

    /// Payload byte count disagrees with the header
    #[error("payload length mismatch: header says {expected}, got {actual}")]
    LengthMismatch {
        /// Length announced by the header
        expected: usize,
        /// Length actually supplied
        actual: usize,
    },

    /// Recomputed MD5 digest differs from the header digest
    #[error("checksum error on {len}-byte payload")]
    ChecksumMismatch {
        /// Payload length that failed verification
        len: usize,
    },

    /// Error code outside the protocol vocabulary
    #[error("unknown error code {0}")]
    UnknownErrorCode(i16),

    /// Frame has no payload where one was required
    #[error("frame carries no payload")]
    MissingPayload,

    /// Frame has no command where one was required
    #[error("frame carries no command")]
    MissingCommand,

    /// Payload serialization failure
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Payload serializer errors
#[derive(Error, Debug)]
pub enum CodecError {
    /// Value could not be serialized
    #[error("payload encode failed: {0}")]
    Encode(String),

    /// Bytes could not be deserialized into the requested type
    #[error("payload decode failed: {0}")]
    Decode(String),
}
