//! Reports and attested bundles
//!
//! A [`Report`] is the canonical, sorted selection of a quorum of observations.
//! An [`AttestedReport`] packages a report with more than F follower
//! signatures over its digest and is what followers echo and deliver.

use crate::crypto::{observation_digest, Digest, Signature, REPORT_DOMAIN};
use crate::error::Rejection;
use crate::keys::KeyStore;
use crate::types::{Epoch, NodeIndex, Observation, ProtocolParams, Round};
use borsh::{BorshDeserialize, BorshSerialize};
use std::collections::BTreeSet;

/// Canonical ordered sequence of exactly `quorum` observations
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Report {
    observations: Vec<Observation>,
}

impl Report {
    /// Wrap observations as received off the wire; call [`Report::check_canonical`]
    /// before trusting them.
    pub fn from_observations(observations: Vec<Observation>) -> Self {
        Self { observations }
    }

    /// Assemble the canonical report from every observation recorded so far.
    ///
    /// Observations are sorted by `(value, node)`. When more than `quorum`
    /// arrived during the grace period, the middle `quorum` entries are kept
    /// so outliers on either side are trimmed evenly. Returns `None` when
    /// fewer than `quorum` are available.
    pub fn assemble<I>(observations: I, quorum: usize) -> Option<Self>
    where
        I: IntoIterator<Item = Observation>,
    {
        let mut sorted: Vec<Observation> = observations.into_iter().collect();
        if quorum == 0 || sorted.len() < quorum {
            return None;
        }
        sorted.sort_by_key(Observation::sort_key);

        let skip = (sorted.len() - quorum) / 2;
        let observations = sorted.into_iter().skip(skip).take(quorum).collect();
        Some(Self { observations })
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Median observed value
    pub fn median(&self) -> Option<u64> {
        self.observations.get(self.observations.len() / 2).map(|o| o.value)
    }

    /// Digest followers sign, bound to the epoch and round
    pub fn digest(&self, epoch: Epoch, round: Round) -> Digest {
        let mut hasher = blake3::Hasher::new();
        hasher.update(REPORT_DOMAIN);
        hasher.update(&epoch.to_le_bytes());
        hasher.update(&round.to_le_bytes());
        hasher.update(&(self.observations.len() as u64).to_le_bytes());
        for obs in &self.observations {
            hasher.update(&obs.node.to_le_bytes());
            hasher.update(&obs.value.to_le_bytes());
            hasher.update(&obs.signature.0);
        }
        hasher.finalize().into()
    }

    /// Exact length, strict `(value, node)` ordering, distinct known observers
    pub fn check_canonical(&self, quorum: usize, num_nodes: usize) -> Result<(), Rejection> {
        if self.observations.len() != quorum {
            return Err(Rejection::MalformedReport("length differs from quorum"));
        }
        if self
            .observations
            .windows(2)
            .any(|w| w[0].sort_key() >= w[1].sort_key())
        {
            return Err(Rejection::MalformedReport("not sorted ascending"));
        }
        let mut seen = BTreeSet::new();
        for obs in &self.observations {
            if obs.node as usize >= num_nodes {
                return Err(Rejection::MalformedReport("unknown observer"));
            }
            if !seen.insert(obs.node) {
                return Err(Rejection::MalformedReport("observer appears twice"));
            }
        }
        Ok(())
    }

    /// Verify every embedded observation signature against its observer
    pub fn verify_observations(
        &self,
        keys: &KeyStore,
        epoch: Epoch,
        round: Round,
    ) -> Result<(), Rejection> {
        for obs in &self.observations {
            let digest = observation_digest(epoch, round, obs.value);
            if !keys.verify(obs.node, &digest, &obs.signature) {
                return Err(Rejection::BadSignature { signer: obs.node });
            }
        }
        Ok(())
    }
}

/// A report plus the follower signatures that attest it
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct AttestedReport {
    epoch: Epoch,
    round: Round,
    report: Report,
    signatures: Vec<Signature>,
    signers: Vec<NodeIndex>,
}

impl AttestedReport {
    /// Package a report with collected `(signer, signature)` pairs.
    /// Signers are stored in ascending index order.
    pub fn build(
        epoch: Epoch,
        round: Round,
        report: Report,
        mut collected: Vec<(NodeIndex, Signature)>,
    ) -> Self {
        collected.sort_by_key(|(signer, _)| *signer);
        let (signers, signatures) = collected.into_iter().unzip();
        Self {
            epoch,
            round,
            report,
            signatures,
            signers,
        }
    }

    /// Assemble from raw parts as received off the wire; call
    /// [`AttestedReport::verify`] before trusting it.
    pub fn from_parts(
        epoch: Epoch,
        round: Round,
        report: Report,
        signatures: Vec<Signature>,
        signers: Vec<NodeIndex>,
    ) -> Self {
        Self {
            epoch,
            round,
            report,
            signatures,
            signers,
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn report(&self) -> &Report {
        &self.report
    }

    pub fn signatures(&self) -> &[Signature] {
        &self.signatures
    }

    pub fn signers(&self) -> &[NodeIndex] {
        &self.signers
    }

    pub fn digest(&self) -> Digest {
        self.report.digest(self.epoch, self.round)
    }

    /// Full bundle verification: epoch, more than F signatures, distinct
    /// known signers, canonical report and valid signatures over its digest.
    pub fn verify(
        &self,
        keys: &KeyStore,
        params: &ProtocolParams,
        epoch: Epoch,
    ) -> Result<(), Rejection> {
        if self.epoch != epoch {
            return Err(Rejection::EpochMismatch {
                expected: epoch,
                got: self.epoch,
            });
        }
        if self.signatures.len() != self.signers.len() {
            return Err(Rejection::SignerCountMismatch {
                signatures: self.signatures.len(),
                signers: self.signers.len(),
            });
        }
        if self.signatures.len() <= params.faults {
            return Err(Rejection::InsufficientSignatures {
                got: self.signatures.len(),
                faults: params.faults,
            });
        }

        let mut seen = BTreeSet::new();
        for signer in &self.signers {
            if !keys.is_known(*signer) {
                return Err(Rejection::UnknownNode(*signer));
            }
            if !seen.insert(*signer) {
                return Err(Rejection::DuplicateSigner(*signer));
            }
        }

        self.report
            .check_canonical(params.quorum(), params.num_nodes)?;

        let digest = self.digest();
        for (signer, signature) in self.signers.iter().zip(&self.signatures) {
            if !keys.verify(*signer, &digest, signature) {
                return Err(Rejection::BadSignature { signer: *signer });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{key_stores, signed_observation};

    fn params(num_nodes: usize, faults: usize) -> ProtocolParams {
        let mut params = ProtocolParams::for_network(num_nodes);
        params.faults = faults;
        params
    }

    #[test]
    fn test_assemble_sorts_by_value_then_node() {
        let keys = key_stores(5);
        let obs = vec![
            signed_observation(&keys[3], 1, 1, 50),
            signed_observation(&keys[1], 1, 1, 50),
            signed_observation(&keys[4], 1, 1, 10),
        ];

        let report = Report::assemble(obs, 3).unwrap();
        let order: Vec<(u64, NodeIndex)> =
            report.observations().iter().map(Observation::sort_key).collect();
        assert_eq!(order, vec![(10, 4), (50, 1), (50, 3)]);
        assert!(report.check_canonical(3, 5).is_ok());
    }

    #[test]
    fn test_assemble_trims_extra_observations_evenly() {
        let keys = key_stores(5);
        let obs: Vec<Observation> = [(0, 5), (1, 1), (2, 3), (3, 1000), (4, 4)]
            .iter()
            .map(|(i, v)| signed_observation(&keys[*i], 1, 1, *v))
            .collect();

        let report = Report::assemble(obs, 3).unwrap();
        let values: Vec<u64> = report.observations().iter().map(|o| o.value).collect();
        assert_eq!(values, vec![3, 4, 5]);
        assert_eq!(report.median(), Some(4));
    }

    #[test]
    fn test_assemble_needs_quorum() {
        let keys = key_stores(3);
        let obs = vec![signed_observation(&keys[0], 1, 1, 1)];
        assert!(Report::assemble(obs, 3).is_none());
    }

    #[test]
    fn test_unsorted_report_rejected() {
        let keys = key_stores(5);
        let report = Report::from_observations(vec![
            signed_observation(&keys[0], 1, 1, 20),
            signed_observation(&keys[1], 1, 1, 10),
            signed_observation(&keys[2], 1, 1, 30),
        ]);
        assert_eq!(
            report.check_canonical(3, 5),
            Err(Rejection::MalformedReport("not sorted ascending"))
        );
    }

    #[test]
    fn test_duplicate_observer_rejected() {
        let keys = key_stores(5);
        let report = Report::from_observations(vec![
            signed_observation(&keys[0], 1, 1, 10),
            signed_observation(&keys[0], 1, 1, 20),
            signed_observation(&keys[2], 1, 1, 30),
        ]);
        assert_eq!(
            report.check_canonical(3, 5),
            Err(Rejection::MalformedReport("observer appears twice"))
        );
        assert_eq!(
            report.check_canonical(2, 5),
            Err(Rejection::MalformedReport("length differs from quorum"))
        );
    }

    #[test]
    fn test_verify_observations_catches_forged_signature() {
        let keys = key_stores(3);
        let mut forged = signed_observation(&keys[1], 1, 1, 20);
        forged.node = 2;
        let report =
            Report::from_observations(vec![signed_observation(&keys[0], 1, 1, 10), forged]);

        assert_eq!(
            report.verify_observations(&keys[0], 1, 1),
            Err(Rejection::BadSignature { signer: 2 })
        );
        // wrong round invalidates honest signatures too
        let honest = Report::from_observations(vec![signed_observation(&keys[0], 1, 1, 10)]);
        assert!(honest.verify_observations(&keys[1], 1, 1).is_ok());
        assert!(honest.verify_observations(&keys[1], 1, 2).is_err());
    }

    #[test]
    fn test_attested_report_verification() {
        let keys = key_stores(4);
        let params = params(4, 1);
        let obs: Vec<Observation> = (0..3)
            .map(|i| signed_observation(&keys[i], 9, 2, 100 + i as u64))
            .collect();
        let report = Report::assemble(obs, 3).unwrap();
        let digest = report.digest(9, 2);

        let bundle = AttestedReport::build(
            9,
            2,
            report.clone(),
            vec![(2, keys[2].sign(&digest)), (0, keys[0].sign(&digest))],
        );
        assert_eq!(bundle.signers(), &[0, 2]);
        assert!(bundle.verify(&keys[3], &params, 9).is_ok());
        assert!(matches!(
            bundle.verify(&keys[3], &params, 10),
            Err(Rejection::EpochMismatch { .. })
        ));

        let single = AttestedReport::build(9, 2, report.clone(), vec![(0, keys[0].sign(&digest))]);
        assert_eq!(
            single.verify(&keys[3], &params, 9),
            Err(Rejection::InsufficientSignatures { got: 1, faults: 1 })
        );

        let sig = keys[1].sign(&digest);
        let duplicated =
            AttestedReport::from_parts(9, 2, report.clone(), vec![sig, sig], vec![1, 1]);
        assert_eq!(
            duplicated.verify(&keys[3], &params, 9),
            Err(Rejection::DuplicateSigner(1))
        );

        let wrong_round = report.digest(9, 3);
        let stale = AttestedReport::build(
            9,
            2,
            report,
            vec![(0, keys[0].sign(&wrong_round)), (1, keys[1].sign(&digest))],
        );
        assert_eq!(
            stale.verify(&keys[3], &params, 9),
            Err(Rejection::BadSignature { signer: 0 })
        );
    }
}
