//! Shared fixtures for unit and protocol tests

use crate::crypto::observation_digest;
use crate::keys::KeyStore;
use crate::types::{Epoch, NodeIndex, Observation, ProtocolParams, Round, Value};
use ed25519_dalek::SigningKey;

/// Deterministic key stores for nodes `0..n`
pub(crate) fn key_stores(n: usize) -> Vec<KeyStore> {
    let signing_keys: Vec<SigningKey> = (0..n)
        .map(|i| SigningKey::from_bytes(&[i as u8 + 1; 32]))
        .collect();
    let public_keys: Vec<_> = signing_keys.iter().map(|k| k.verifying_key()).collect();

    signing_keys
        .into_iter()
        .enumerate()
        .map(|(i, key)| KeyStore::new(i as NodeIndex, key, public_keys.clone()).unwrap())
        .collect()
}

/// Observation of `value` signed by the owner of `keys`
pub(crate) fn signed_observation(
    keys: &KeyStore,
    epoch: Epoch,
    round: Round,
    value: Value,
) -> Observation {
    Observation {
        value,
        signature: keys.sign(&observation_digest(epoch, round, value)),
        node: keys.index(),
    }
}

/// Short timers and a low round cap so tests reach every transition quickly
pub(crate) fn params(num_nodes: usize, faults: usize) -> ProtocolParams {
    ProtocolParams {
        num_nodes,
        faults,
        echo_threshold: num_nodes - faults,
        max_round: 3,
        round_timeout_ms: 2_000,
        grace_period_ms: 50,
        max_observe_jitter_ms: 10,
    }
}
