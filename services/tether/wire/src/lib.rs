//! Frame header, checksummed framing variants and payload serialization for tether.
//!
//! This crate is the pure encode/decode layer of the tether session protocol.
//! It performs no I/O: the session crate moves the bytes it produces over TCP.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------------------+
//! | i16 command          | command code, -1 when absent           |
//! +----------------------+----------------------------------------+
//! | i16 error            | error code, -1 when absent             |
//! +----------------------+----------------------------------------+
//! | i32 payload_len      | payload byte count, -1 when no payload |
//! +----------------------+----------------------------------------+
//! | [u8; 16] digest      | MD5 of the payload, zero when absent   |
//! +----------------------+----------------------------------------+
//! | u8 check_connection  | 1 marks a liveness probe               |
//! +----------------------+----------------------------------------+
//! | payload              | exactly payload_len bytes              |
//! +----------------------+----------------------------------------+
//! ```
//!
//! All integers are big-endian. The digest is an integrity check against
//! accidental corruption only.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod frame;
pub mod header;
pub mod protocol;

// Re-export main types
pub use codec::{CborCodec, PayloadCodec};
pub use error::{CodecError, WireError};
pub use frame::{payload_digest, Frame};
pub use header::{FrameHeader, ABSENT_CODE, DIGEST_SIZE, HEADER_SIZE, NO_PAYLOAD};
pub use protocol::{command, ErrorCode};
