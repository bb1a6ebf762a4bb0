//! Payload serialization.
//!
//! Generic values travel as frame payloads through a [`PayloadCodec`]. The
//! engine only needs this seam for its own control payloads; applications
//! are free to pick another implementation.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

use crate::CodecError;

/// Binary serializer used to turn payload values into bytes and back
pub trait PayloadCodec: Send + Sync {
    /// Serialize `value` into payload bytes
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, CodecError>;

    /// Deserialize payload bytes into a `T`
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// CBOR payload codec backed by `ciborium`
#[derive(Debug, Clone, Copy, Default)]
pub struct CborCodec;

impl PayloadCodec for CborCodec {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, CodecError> {
        let mut out = Vec::new();
        ciborium::ser::into_writer(value, &mut out)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(Bytes::from(out))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        ciborium::de::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Reading {
        sensor: String,
        values: Vec<u32>,
    }

    #[test]
    fn test_cbor_value() {
        let codec = CborCodec;
        let reading = Reading {
            sensor: "north".to_string(),
            values: vec![3, 1, 4],
        };

        let bytes = codec.encode(&reading).unwrap();
        let back: Reading = codec.decode(&bytes).unwrap();
        assert_eq!(back, reading);
    }

    #[test]
    fn test_cbor_decode_garbage() {
        let codec = CborCodec;
        let result: Result<Reading, _> = codec.decode(&[0xFF, 0x00, 0x13]);
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }
}
