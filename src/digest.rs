//! Content digest — fixed-width object identifier.

use sha2::{Digest as _, Sha256};
use std::fmt;

/// Width of a digest in bytes. The wire format carries exactly this many
/// bytes after a message's 2-byte type tag; the codec and the object store
/// agree on this one width.
pub const DIGEST_LEN: usize = 32;

/// Opaque content digest. Equality and ordering are byte equality over the
/// raw digest bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Digest of `data`, used both by tests and by the store's
    /// verify-on-commit step.
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        let out = hasher.finalize();
        let mut bytes = [0u8; DIGEST_LEN];
        bytes.copy_from_slice(&out);
        Self(bytes)
    }

    /// Canonical textual form: lowercase hex, used as the filesystem name
    /// inside the object store's tmp/new/cur directories.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, DigestParseError> {
        let bytes = hex::decode(s).map_err(|_| DigestParseError)?;
        let arr: [u8; DIGEST_LEN] = bytes
            .try_into()
            .map_err(|_| DigestParseError)?;
        Ok(Self(arr))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid digest: expected {DIGEST_LEN}-byte hex string")]
pub struct DigestParseError;

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let d = Digest::of(b"hello world");
        let hex = d.to_hex();
        assert_eq!(hex.len(), DIGEST_LEN * 2);
        let back = Digest::from_hex(&hex).unwrap();
        assert_eq!(d, back);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(Digest::from_hex("abcd").is_err());
        assert!(Digest::from_hex(&"ff".repeat(33)).is_err());
    }

    #[test]
    fn distinct_inputs_distinct_digests() {
        assert_ne!(Digest::of(b"a"), Digest::of(b"b"));
    }
}
