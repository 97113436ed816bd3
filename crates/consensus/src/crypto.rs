//! Digests and signatures
//!
//! Digests are BLAKE3 over little-endian fields behind a per-kind domain
//! prefix; signatures are Ed25519 over the 32-byte digest.

use crate::types::{Epoch, Round, Value};
use borsh::{BorshDeserialize, BorshSerialize};
use std::fmt;

const OBSERVATION_DOMAIN: &[u8] = b"oracle-consensus/observation/v1";
pub(crate) const REPORT_DOMAIN: &[u8] = b"oracle-consensus/report/v1";

/// 32-byte BLAKE3 digest
#[derive(Clone, Copy, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<blake3::Hash> for Digest {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", short_b58(&self.0))
    }
}

/// Ed25519 signature bytes
#[derive(Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Signature(pub [u8; 64]);

impl Signature {
    pub fn to_dalek(&self) -> ed25519_dalek::Signature {
        ed25519_dalek::Signature::from_bytes(&self.0)
    }
}

impl From<ed25519_dalek::Signature> for Signature {
    fn from(sig: ed25519_dalek::Signature) -> Self {
        Self(sig.to_bytes())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", short_b58(&self.0))
    }
}

fn short_b58(bytes: &[u8]) -> String {
    let mut s = bs58::encode(bytes).into_string();
    s.truncate(8);
    s
}

/// Digest an observer signs: `hash(epoch, round, value)`
pub fn observation_digest(epoch: Epoch, round: Round, value: Value) -> Digest {
    let mut hasher = blake3::Hasher::new();
    hasher.update(OBSERVATION_DOMAIN);
    hasher.update(&epoch.to_le_bytes());
    hasher.update(&round.to_le_bytes());
    hasher.update(&value.to_le_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observation_digest_binds_every_field() {
        let base = observation_digest(7, 1, 100);
        assert_eq!(base, observation_digest(7, 1, 100));
        assert_ne!(base, observation_digest(8, 1, 100));
        assert_ne!(base, observation_digest(7, 2, 100));
        assert_ne!(base, observation_digest(7, 1, 101));
    }
}
