//! Key store and key files
//!
//! The key store is built once at startup and injected into each state
//! machine; nothing reads keys from global state.

use crate::crypto::{Digest, Signature};
use crate::error::KeyStoreError;
use crate::types::NodeIndex;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Public keys of every node plus this node's signing key
pub struct KeyStore {
    index: NodeIndex,
    signing_key: SigningKey,
    public_keys: Vec<VerifyingKey>,
}

impl KeyStore {
    /// Create a key store, checking the signing key belongs to `index`
    pub fn new(
        index: NodeIndex,
        signing_key: SigningKey,
        public_keys: Vec<VerifyingKey>,
    ) -> Result<Self, KeyStoreError> {
        let expected = public_keys
            .get(index as usize)
            .ok_or(KeyStoreError::IndexOutOfRange {
                index,
                len: public_keys.len(),
            })?;
        if *expected != signing_key.verifying_key() {
            return Err(KeyStoreError::KeyMismatch(index));
        }
        Ok(Self {
            index,
            signing_key,
            public_keys,
        })
    }

    /// Load the key store for `index` from a JSON key file
    pub fn from_key_file<P: AsRef<Path>>(path: P, index: NodeIndex) -> Result<Self, KeyStoreError> {
        let file = KeyFile::load(&path)?;
        let store = file.key_store(index)?;
        tracing::info!(
            "Loaded {} public keys from {:?} for node {}",
            store.num_nodes(),
            path.as_ref(),
            index
        );
        Ok(store)
    }

    /// This node's index
    pub fn index(&self) -> NodeIndex {
        self.index
    }

    /// Number of nodes with a known public key
    pub fn num_nodes(&self) -> usize {
        self.public_keys.len()
    }

    pub fn is_known(&self, node: NodeIndex) -> bool {
        (node as usize) < self.public_keys.len()
    }

    pub fn public_key(&self, node: NodeIndex) -> Option<&VerifyingKey> {
        self.public_keys.get(node as usize)
    }

    /// Sign a digest with this node's key
    pub fn sign(&self, digest: &Digest) -> Signature {
        self.signing_key.sign(digest.as_bytes()).into()
    }

    /// Verify `signature` from `signer` over `digest`; unknown signers fail
    pub fn verify(&self, signer: NodeIndex, digest: &Digest, signature: &Signature) -> bool {
        match self.public_key(signer) {
            Some(key) => key
                .verify_strict(digest.as_bytes(), &signature.to_dalek())
                .is_ok(),
            None => false,
        }
    }
}

/// JSON key file: base58 keys indexed by node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFile {
    pub public_keys: Vec<String>,
    pub private_keys: Vec<String>,
}

impl KeyFile {
    /// Generate fresh keys for `num_nodes` nodes
    pub fn generate(num_nodes: usize) -> Self {
        let signing_keys: Vec<SigningKey> = (0..num_nodes)
            .map(|_| SigningKey::from_bytes(&rand::random::<[u8; 32]>()))
            .collect();
        Self::from_signing_keys(&signing_keys)
    }

    pub fn from_signing_keys(signing_keys: &[SigningKey]) -> Self {
        Self {
            public_keys: signing_keys
                .iter()
                .map(|k| bs58::encode(k.verifying_key().as_bytes()).into_string())
                .collect(),
            private_keys: signing_keys
                .iter()
                .map(|k| bs58::encode(k.to_bytes()).into_string())
                .collect(),
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, KeyStoreError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), KeyStoreError> {
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Decode every public key
    pub fn verifying_keys(&self) -> Result<Vec<VerifyingKey>, KeyStoreError> {
        self.public_keys
            .iter()
            .map(|s| {
                let bytes = decode_32(s)?;
                VerifyingKey::from_bytes(&bytes)
                    .map_err(|e| KeyStoreError::Encoding(e.to_string()))
            })
            .collect()
    }

    /// Build the key store of node `index`
    pub fn key_store(&self, index: NodeIndex) -> Result<KeyStore, KeyStoreError> {
        if self.public_keys.len() != self.private_keys.len() {
            return Err(KeyStoreError::LengthMismatch);
        }
        let private = self
            .private_keys
            .get(index as usize)
            .ok_or(KeyStoreError::IndexOutOfRange {
                index,
                len: self.private_keys.len(),
            })?;
        let signing_key = SigningKey::from_bytes(&decode_32(private)?);
        KeyStore::new(index, signing_key, self.verifying_keys()?)
    }
}

fn decode_32(s: &str) -> Result<[u8; 32], KeyStoreError> {
    let bytes = bs58::decode(s)
        .into_vec()
        .map_err(|e| KeyStoreError::Encoding(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| KeyStoreError::Encoding(format!("expected 32 bytes in {s}")))
}
