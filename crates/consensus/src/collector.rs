//! Per-round collectors for observations and report signatures
//!
//! Both collectors are indexed by node and hold at most one entry per node.
//! Signature checks happen before recording; the collectors only enforce
//! presence and counting.

use crate::crypto::{Digest, Signature};
use crate::error::Rejection;
use crate::types::{NodeIndex, Observation};

/// At most one observation per node for the current round
#[derive(Debug, Clone)]
pub struct ObservationCollector {
    slots: Vec<Option<Observation>>,
    count: usize,
    quorum: usize,
}

impl ObservationCollector {
    pub fn new(num_nodes: usize, quorum: usize) -> Self {
        Self {
            slots: vec![None; num_nodes],
            count: 0,
            quorum,
        }
    }

    /// Drop everything recorded for the previous round
    pub fn reset(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.count = 0;
    }

    pub fn has_observation(&self, node: NodeIndex) -> bool {
        matches!(self.slots.get(node as usize), Some(Some(_)))
    }

    /// Record a verified observation.
    ///
    /// Returns `true` exactly when this observation brought the count to the
    /// quorum, so callers can fire the grace transition once.
    pub fn record(&mut self, observation: Observation) -> Result<bool, Rejection> {
        let node = observation.node;
        let slot = self
            .slots
            .get_mut(node as usize)
            .ok_or(Rejection::UnknownNode(node))?;
        if slot.is_some() {
            return Err(Rejection::DuplicateObservation(node));
        }
        *slot = Some(observation);
        self.count += 1;
        Ok(self.count == self.quorum)
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Recorded observations in node order
    pub fn observations(&self) -> impl Iterator<Item = &Observation> {
        self.slots.iter().flatten()
    }
}

/// At most one signature per follower over the current report digest
#[derive(Debug, Clone)]
pub struct ReportCollector {
    digest: Option<Digest>,
    signatures: Vec<Option<Signature>>,
    count: usize,
    faults: usize,
}

impl ReportCollector {
    pub fn new(num_nodes: usize, faults: usize) -> Self {
        Self {
            digest: None,
            signatures: vec![None; num_nodes],
            count: 0,
            faults,
        }
    }

    /// Clear collected signatures and attest `digest` from now on
    pub fn reset(&mut self, digest: Option<Digest>) {
        self.digest = digest;
        self.signatures.iter_mut().for_each(|slot| *slot = None);
        self.count = 0;
    }

    /// Digest currently being attested
    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    pub fn has_signed(&self, signer: NodeIndex) -> bool {
        matches!(self.signatures.get(signer as usize), Some(Some(_)))
    }

    /// Record a verified signature from `signer` over `digest`.
    ///
    /// Returns `true` when the collector holds more than F signatures.
    pub fn record(
        &mut self,
        signer: NodeIndex,
        digest: &Digest,
        signature: Signature,
    ) -> Result<bool, Rejection> {
        match &self.digest {
            None => return Err(Rejection::NoActiveReport),
            Some(current) if current != digest => return Err(Rejection::ReportMismatch),
            Some(_) => {}
        }
        let slot = self
            .signatures
            .get_mut(signer as usize)
            .ok_or(Rejection::UnknownNode(signer))?;
        if slot.is_some() {
            return Err(Rejection::DuplicateReport(signer));
        }
        *slot = Some(signature);
        self.count += 1;
        Ok(self.is_complete())
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_complete(&self) -> bool {
        self.count > self.faults
    }

    /// Collected `(signer, signature)` pairs in signer order
    pub fn collected(&self) -> Vec<(NodeIndex, Signature)> {
        self.signatures
            .iter()
            .enumerate()
            .filter_map(|(i, sig)| sig.map(|s| (i as NodeIndex, s)))
            .collect()
    }
}
