//! Fixed 25-byte frame header.
//!
//! Every frame starts with this header. Fields that a framing variant does
//! not use hold the `-1` sentinel.

use bytes::{Buf, BufMut, BytesMut};

/// Header size in bytes
pub const HEADER_SIZE: usize = 25;

/// Size of the MD5 payload digest
pub const DIGEST_SIZE: usize = 16;

/// Sentinel for an absent command or error code
pub const ABSENT_CODE: i16 = -1;

/// Sentinel for a frame without payload
pub const NO_PAYLOAD: i32 = -1;

/// Frame header (25 bytes, big-endian)
///
/// The sentinel values are written directly into the fields and never pass
/// through the positive-code validation that [`crate::Frame`] constructors
/// apply to caller-supplied codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Command code, or [`ABSENT_CODE`]
    pub command: i16,
    /// Error code, or [`ABSENT_CODE`]
    pub error: i16,
    /// Payload length, or [`NO_PAYLOAD`]
    pub payload_len: i32,
    /// MD5 of the payload; all zero when there is no payload
    pub digest: [u8; DIGEST_SIZE],
    /// Marks a liveness probe
    pub check_connection: bool,
}

impl Default for FrameHeader {
    fn default() -> Self {
        Self {
            command: ABSENT_CODE,
            error: ABSENT_CODE,
            payload_len: NO_PAYLOAD,
            digest: [0; DIGEST_SIZE],
            check_connection: false,
        }
    }
}

impl FrameHeader {
    /// Header-only probe frame used by the initiator's keep-alive
    pub fn probe() -> Self {
        Self {
            check_connection: true,
            ..Self::default()
        }
    }

    /// Command code, if the variant carries one
    pub fn command(&self) -> Option<i16> {
        (self.command != ABSENT_CODE).then_some(self.command)
    }

    /// Error code, if the variant carries one
    pub fn error(&self) -> Option<i16> {
        (self.error != ABSENT_CODE).then_some(self.error)
    }

    /// Number of payload bytes that follow the header, `None` for no payload
    pub fn payload_size(&self) -> Result<Option<usize>, crate::WireError> {
        match self.payload_len {
            NO_PAYLOAD => Ok(None),
            len if len < 0 => Err(crate::WireError::InvalidLength(len)),
            len => Ok(Some(len as usize)),
        }
    }

    /// Encode the header to bytes (big-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i16(self.command);
        buf.put_i16(self.error);
        buf.put_i32(self.payload_len);
        if self.payload_len == NO_PAYLOAD {
            buf.put_bytes(0, DIGEST_SIZE);
        } else {
            buf.put_slice(&self.digest);
        }
        buf.put_u8(u8::from(self.check_connection));
    }

    /// Encode into a fresh fixed-size array
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        self.encode(&mut buf);
        let mut out = [0u8; HEADER_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    /// Decode the header from bytes (big-endian)
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, crate::WireError> {
        if buf.remaining() < HEADER_SIZE {
            return Err(crate::WireError::Incomplete {
                needed: HEADER_SIZE,
                have: buf.remaining(),
            });
        }

        let command = buf.get_i16();
        let error = buf.get_i16();
        let payload_len = buf.get_i32();
        let mut digest = [0u8; DIGEST_SIZE];
        buf.copy_to_slice(&mut digest);
        let check_connection = buf.get_u8() != 0;

        if payload_len == NO_PAYLOAD {
            digest = [0; DIGEST_SIZE];
        }

        Ok(Self {
            command,
            error,
            payload_len,
            digest,
            check_connection,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_default_header_is_absent() {
        let header = FrameHeader::default();
        assert_eq!(header.command(), None);
        assert_eq!(header.error(), None);
        assert_eq!(header.payload_size().unwrap(), None);
        assert!(!header.check_connection);
    }

    #[test]
    fn test_header_encode_decode() {
        let header = FrameHeader {
            command: 120,
            error: 4,
            payload_len: 3,
            digest: [7; DIGEST_SIZE],
            check_connection: false,
        };

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);

        let mut bytes = buf.freeze();
        let decoded = FrameHeader::decode(&mut bytes).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn test_header_layout_is_big_endian() {
        let header = FrameHeader {
            command: 0x0102,
            error: 0x0304,
            payload_len: 0x05060708,
            digest: [0xAA; DIGEST_SIZE],
            check_connection: true,
        };

        let bytes = header.to_bytes();
        assert_eq!(&bytes[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&bytes[8..24], &[0xAA; DIGEST_SIZE]);
        assert_eq!(bytes[24], 1);
    }

    #[test]
    fn test_probe_header_zeroes_digest() {
        let mut probe = FrameHeader::probe();
        probe.digest = [9; DIGEST_SIZE];

        let bytes = probe.to_bytes();
        assert_eq!(&bytes[..8], &[0xFF; 8]);
        assert_eq!(&bytes[8..24], &[0; DIGEST_SIZE]);

        let decoded = FrameHeader::decode(&mut Bytes::copy_from_slice(&bytes)).unwrap();
        assert!(decoded.check_connection);
        assert_eq!(decoded.digest, [0; DIGEST_SIZE]);
    }

    #[test]
    fn test_incomplete_header() {
        let mut short = Bytes::from_static(&[0u8; HEADER_SIZE - 1]);
        assert!(matches!(
            FrameHeader::decode(&mut short),
            Err(crate::WireError::Incomplete { needed: HEADER_SIZE, have: 24 })
        ));
    }

    #[test]
    fn test_invalid_payload_length() {
        let header = FrameHeader {
            payload_len: -7,
            ..FrameHeader::default()
        };
        assert!(matches!(
            header.payload_size(),
            Err(crate::WireError::InvalidLength(-7))
        ));
    }

    #[test]
    fn test_header_field_combinations() {
        let codes = [ABSENT_CODE, i16::MIN, -5, 0, 1, 7, i16::MAX];
        let lengths = [NO_PAYLOAD, 0, 1, HEADER_SIZE as i32, i32::MAX];
        let digests = [[0u8; DIGEST_SIZE], [0xAB; DIGEST_SIZE], *b"0123456789abcdef"];

        let mut checked = 0;
        for command in codes {
            for error in codes {
                for payload_len in lengths {
                    for digest in digests {
                        for check_connection in [false, true] {
                            let header = FrameHeader {
                                command,
                                error,
                                payload_len,
                                digest,
                                check_connection,
                            };
                            let bytes = header.to_bytes();
                            let decoded = FrameHeader::decode(&mut &bytes[..]).unwrap();

                            let expected_digest = if payload_len == NO_PAYLOAD {
                                [0; DIGEST_SIZE]
                            } else {
                                digest
                            };
                            assert_eq!(decoded.command, command);
                            assert_eq!(decoded.error, error);
                            assert_eq!(decoded.payload_len, payload_len);
                            assert_eq!(decoded.digest, expected_digest);
                            assert_eq!(decoded.check_connection, check_connection);

                            assert_eq!(decoded.command(), (command != ABSENT_CODE).then_some(command));
                            assert_eq!(decoded.error(), (error != ABSENT_CODE).then_some(error));
                            assert_eq!(
                                decoded.payload_size().unwrap(),
                                (payload_len != NO_PAYLOAD).then_some(payload_len as usize)
                            );
                            checked += 1;
                        }
                    }
                }
            }
        }
        assert_eq!(checked, 7 * 7 * 5 * 3 * 2);
    }

    #[test]
    fn test_negative_lengths_other_than_sentinel() {
        for payload_len in [-2, i32::MIN] {
            let header = FrameHeader {
                payload_len,
                ..FrameHeader::default()
            };
            let decoded = FrameHeader::decode(&mut &header.to_bytes()[..]).unwrap();
            assert_eq!(decoded.payload_len, payload_len);
            assert!(matches!(
                decoded.payload_size(),
                Err(crate::WireError::InvalidLength(len)) if len == payload_len
            ));
        }
    }
}
