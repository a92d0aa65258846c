use sha1::{Digest, Sha1};
use std::fmt::{Debug, Formatter};

/// A [PayloadHash] identifies an in-flight message by the SHA-1 digest of the original user
///  payload. Both peers compute the digest over the same bytes, so an acknowledgement carrying
///  the digest matches the sender's pending entry without any negotiated ids.
///
/// Hash collisions are treated as a match - at SHA-1 strength that is acceptable for keying
///  retransmission state (this is not an integrity or authentication mechanism).
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct PayloadHash([u8; Self::SERIALIZED_LEN]);

impl PayloadHash {
    pub const SERIALIZED_LEN: usize = 20;

    /// NB: a fresh hasher per call - the digest state must never be shared between
    ///  concurrent callers
    pub fn of(payload: &[u8]) -> PayloadHash {
        let mut sha1 = Sha1::new();
        sha1.update(payload);
        PayloadHash(sha1.finalize().into())
    }

    pub fn from_bytes(bytes: [u8; Self::SERIALIZED_LEN]) -> PayloadHash {
        PayloadHash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; Self::SERIALIZED_LEN] {
        &self.0
    }
}

impl Debug for PayloadHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}
