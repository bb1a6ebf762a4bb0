//! Framing variants and checksum verification.
//!
//! A frame is a [`FrameHeader`] plus an optional payload. The five variants
//! differ only in which header fields are meaningful:
//!
//! | variant                      | command | error | payload |
//! |------------------------------|---------|-------|---------|
//! | [`Frame::control`]           | yes     | -1    | none    |
//! | [`Frame::control_with_error`]| yes     | yes   | none    |
//! | [`Frame::raw`]               | -1      | -1    | yes     |
//! | [`Frame::with_payload`]      | yes     | -1    | yes     |
//! | [`Frame::with_error_payload`]| yes     | yes   | yes     |

use bytes::{Bytes, BytesMut};
use md5::{Digest, Md5};
use serde::{de::DeserializeOwned, Serialize};

use crate::header::{FrameHeader, DIGEST_SIZE, HEADER_SIZE};
use crate::{PayloadCodec, WireError};

/// MD5 digest of a payload
pub fn payload_digest(payload: &[u8]) -> [u8; DIGEST_SIZE] {
    let mut out = [0u8; DIGEST_SIZE];
    out.copy_from_slice(&Md5::digest(payload));
    out
}

/// A header plus optional payload, exchanged atomically
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    header: FrameHeader,
    payload: Option<Bytes>,
}

impl Frame {
    /// Control-only frame
    pub fn control(command: i16) -> Result<Self, WireError> {
        Ok(Self {
            header: FrameHeader {
                command: positive("command", command)?,
                ..FrameHeader::default()
            },
            payload: None,
        })
    }

    /// Control frame with an error code and no payload
    pub fn control_with_error(command: i16, error: i16) -> Result<Self, WireError> {
        Ok(Self {
            header: FrameHeader {
                command: positive("command", command)?,
                error: positive("error", error)?,
                ..FrameHeader::default()
            },
            payload: None,
        })
    }

    /// Raw payload with checksum and no command
    pub fn raw(payload: impl Into<Bytes>) -> Result<Self, WireError> {
        Self::assemble(FrameHeader::default(), payload.into())
    }

    /// Command plus payload
    pub fn with_payload(command: i16, payload: impl Into<Bytes>) -> Result<Self, WireError> {
        let header = FrameHeader {
            command: positive("command", command)?,
            ..FrameHeader::default()
        };
        Self::assemble(header, payload.into())
    }

    /// Command, error code and payload
    pub fn with_error_payload(
        command: i16,
        error: i16,
        payload: impl Into<Bytes>,
    ) -> Result<Self, WireError> {
        let header = FrameHeader {
            command: positive("command", command)?,
            error: positive("error", error)?,
            ..FrameHeader::default()
        };
        Self::assemble(header, payload.into())
    }

    /// Command plus a serialized value
    pub fn with_value<T, C>(command: i16, value: &T, codec: &C) -> Result<Self, WireError>
    where
        T: Serialize + ?Sized,
        C: PayloadCodec,
    {
        Self::with_payload(command, codec.encode(value)?)
    }

    /// Header-only liveness probe
    pub fn probe() -> Self {
        Self {
            header: FrameHeader::probe(),
            payload: None,
        }
    }

    fn assemble(mut header: FrameHeader, payload: Bytes) -> Result<Self, WireError> {
        if payload.is_empty() {
            return Err(WireError::EmptyPayload);
        }
        header.payload_len =
            i32::try_from(payload.len()).map_err(|_| WireError::PayloadTooLarge(payload.len()))?;
        header.digest = payload_digest(&payload);
        Ok(Self {
            header,
            payload: Some(payload),
        })
    }

    /// Rebuild a frame from a received header and payload, verifying the checksum
    pub fn from_parts(header: FrameHeader, payload: Option<Bytes>) -> Result<Self, WireError> {
        match (header.payload_size()?, payload) {
            (None, None) => Ok(Self {
                header,
                payload: None,
            }),
            (None, Some(extra)) => Err(WireError::LengthMismatch {
                expected: 0,
                actual: extra.len(),
            }),
            (Some(expected), None) => Err(WireError::LengthMismatch {
                expected,
                actual: 0,
            }),
            (Some(expected), Some(payload)) => {
                if payload.len() != expected {
                    return Err(WireError::LengthMismatch {
                        expected,
                        actual: payload.len(),
                    });
                }
                if payload_digest(&payload) != header.digest {
                    return Err(WireError::ChecksumMismatch { len: expected });
                }
                Ok(Self {
                    header,
                    payload: Some(payload),
                })
            }
        }
    }

    /// Decode one complete frame from a contiguous buffer
    pub fn decode(mut buf: Bytes) -> Result<Self, WireError> {
        let header = FrameHeader::decode(&mut buf)?;
        let payload = match header.payload_size()? {
            None => None,
            Some(len) => {
                if buf.len() < len {
                    return Err(WireError::Incomplete {
                        needed: len,
                        have: buf.len(),
                    });
                }
                Some(buf.split_to(len))
            }
        };
        Self::from_parts(header, payload)
    }

    /// Header followed by payload, ready for a single write
    pub fn encode(&self) -> Bytes {
        let payload_len = self.payload.as_ref().map_or(0, Bytes::len);
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload_len);
        self.header.encode(&mut buf);
        if let Some(payload) = &self.payload {
            buf.extend_from_slice(payload);
        }
        buf.freeze()
    }

    /// Frame header
    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    /// Command code, if present
    pub fn command(&self) -> Option<i16> {
        self.header.command()
    }

    /// Error code, if present
    pub fn error(&self) -> Option<i16> {
        self.header.error()
    }

    /// Payload bytes, if present
    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    /// Consume the frame, keeping the payload
    pub fn into_payload(self) -> Option<Bytes> {
        self.payload
    }

    /// Whether this is a liveness probe
    pub fn is_probe(&self) -> bool {
        self.header.check_connection
    }

    /// Deserialize the payload into a `T`
    pub fn value<T, C>(&self, codec: &C) -> Result<T, WireError>
    where
        T: DeserializeOwned,
        C: PayloadCodec,
    {
        let payload = self.payload.as_ref().ok_or(WireError::MissingPayload)?;
        Ok(codec.decode(payload)?)
    }
}

fn positive(field: &'static str, value: i16) -> Result<i16, WireError> {
    if value <= 0 {
        return Err(WireError::NonPositiveCode { field, value });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::ABSENT_CODE;
    use crate::CborCodec;

    #[test]
    fn test_variant_fields() {
        let control = Frame::control(12).unwrap();
        assert_eq!(control.command(), Some(12));
        assert_eq!(control.error(), None);
        assert!(control.payload().is_none());

        let with_error = Frame::control_with_error(12, 4).unwrap();
        assert_eq!(with_error.error(), Some(4));
        assert_eq!(with_error.header().payload_len, -1);

        let raw = Frame::raw(&b"abc"[..]).unwrap();
        assert_eq!(raw.header().command, ABSENT_CODE);
        assert_eq!(raw.header().payload_len, 3);

        let full = Frame::with_error_payload(12, 4, &b"abc"[..]).unwrap();
        assert_eq!(full.command(), Some(12));
        assert_eq!(full.error(), Some(4));
        assert_eq!(full.header().digest, payload_digest(b"abc"));
    }

    #[test]
    fn test_rejects_non_positive_codes() {
        assert!(matches!(
            Frame::control(0),
            Err(WireError::NonPositiveCode { field: "command", value: 0 })
        ));
        assert!(matches!(
            Frame::control_with_error(5, -1),
            Err(WireError::NonPositiveCode { field: "error", value: -1 })
        ));
        assert!(Frame::with_payload(-3, &b"x"[..]).is_err());
    }

    #[test]
    fn test_rejects_empty_payload() {
        assert!(matches!(Frame::raw(Bytes::new()), Err(WireError::EmptyPayload)));
        assert!(matches!(
            Frame::with_payload(10, Vec::<u8>::new()),
            Err(WireError::EmptyPayload)
        ));
    }

    #[test]
    fn test_frame_decode_matches_encode() {
        let frame = Frame::with_error_payload(120, 4, vec![1u8, 2, 3, 4, 5]).unwrap();
        let decoded = Frame::decode(frame.encode()).unwrap();
        assert_eq!(decoded, frame);

        let control = Frame::control(77).unwrap();
        assert_eq!(control.encode().len(), HEADER_SIZE);
        assert_eq!(Frame::decode(control.encode()).unwrap(), control);
    }

    #[test]
    fn test_corrupted_payload_fails_checksum() {
        let frame = Frame::with_payload(9, vec![0x10u8; 64]).unwrap();

        for position in [0, 31, 63] {
            let mut wire = BytesMut::from(&frame.encode()[..]);
            wire[HEADER_SIZE + position] ^= 0x01;
            assert!(matches!(
                Frame::decode(wire.freeze()),
                Err(WireError::ChecksumMismatch { len: 64 })
            ));
        }
    }

    #[test]
    fn test_from_parts_length_mismatch() {
        let frame = Frame::raw(&b"hello"[..]).unwrap();
        let header = *frame.header();

        assert!(matches!(
            Frame::from_parts(header, Some(Bytes::from_static(b"hell"))),
            Err(WireError::LengthMismatch { expected: 5, actual: 4 })
        ));
        assert!(matches!(
            Frame::from_parts(header, None),
            Err(WireError::LengthMismatch { expected: 5, actual: 0 })
        ));
    }

    #[test]
    fn test_value_payload() {
        let codec = CborCodec;
        let frame = Frame::with_value(15, &vec!["a".to_string(), "b".to_string()], &codec).unwrap();
        let back: Vec<String> = frame.value(&codec).unwrap();
        assert_eq!(back, vec!["a", "b"]);

        let control = Frame::control(15).unwrap();
        let missing: Result<Vec<String>, _> = control.value(&codec);
        assert!(matches!(missing, Err(WireError::MissingPayload)));
    }

    #[test]
    fn test_probe_frame() {
        let probe = Frame::probe();
        assert!(probe.is_probe());
        assert_eq!(probe.command(), None);
        assert_eq!(probe.encode().len(), HEADER_SIZE);
    }

    #[test]
    fn test_variants_fill_unused_fields_with_sentinels() {
        use crate::header::{DIGEST_SIZE, NO_PAYLOAD};

        let payload = Bytes::from_static(b"payload");
        let cases = [
            (Frame::control(11).unwrap(), 11, ABSENT_CODE, false),
            (Frame::control_with_error(11, 3).unwrap(), 11, 3, false),
            (Frame::raw(payload.clone()).unwrap(), ABSENT_CODE, ABSENT_CODE, true),
            (Frame::with_payload(11, payload.clone()).unwrap(), 11, ABSENT_CODE, true),
            (Frame::with_error_payload(11, 3, payload.clone()).unwrap(), 11, 3, true),
        ];

        for (frame, command, error, has_payload) in cases {
            let header = *frame.header();
            assert_eq!(header.command, command);
            assert_eq!(header.error, error);
            assert!(!header.check_connection);
            if has_payload {
                assert_eq!(header.payload_len, payload.len() as i32);
                assert_eq!(header.digest, payload_digest(&payload));
                assert_eq!(frame.payload(), Some(&payload));
            } else {
                assert_eq!(header.payload_len, NO_PAYLOAD);
                assert_eq!(header.digest, [0; DIGEST_SIZE]);
                assert_eq!(frame.payload(), None);
            }
            assert_eq!(Frame::decode(frame.encode()).unwrap(), frame);
        }
    }

    #[test]
    fn test_sentinel_is_refused_as_explicit_code() {
        let payload = &b"x"[..];
        assert!(Frame::control(-1).is_err());
        assert!(Frame::control_with_error(-1, 3).is_err());
        assert!(Frame::control_with_error(11, -1).is_err());
        assert!(Frame::with_payload(-1, payload).is_err());
        assert!(Frame::with_error_payload(-1, 3, payload).is_err());
        assert!(Frame::with_error_payload(11, -1, payload).is_err());
    }
}
