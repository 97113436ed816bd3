//! Echo dissemination state for one round.
//!
//! Two-phase reliable broadcast: the leader's final bundle seeds each
//! follower's own echo, and any verified peer echo is adopted and re-sent if
//! the follower has not echoed yet. A follower completes the round once it
//! has seen echoes from `threshold` distinct nodes (its own included).

use crate::report::AttestedReport;
use crate::types::NodeIndex;
use std::collections::BTreeSet;

#[derive(Debug, Clone)]
pub struct EchoDisseminator {
    threshold: usize,
    sent: Option<AttestedReport>,
    received: BTreeSet<NodeIndex>,
}

impl EchoDisseminator {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            sent: None,
            received: BTreeSet::new(),
        }
    }

    pub fn reset(&mut self) {
        self.sent = None;
        self.received.clear();
    }

    /// Bundle this node has echoed, if any
    pub fn sent(&self) -> Option<&AttestedReport> {
        self.sent.as_ref()
    }

    pub fn has_echoed(&self) -> bool {
        self.sent.is_some()
    }

    /// Adopt `bundle` as this node's echo. Returns `false` if one was
    /// already adopted this round; the first adoption wins.
    pub fn adopt(&mut self, bundle: AttestedReport) -> bool {
        if self.sent.is_some() {
            return false;
        }
        self.sent = Some(bundle);
        true
    }

    pub fn has_received(&self, sender: NodeIndex) -> bool {
        self.received.contains(&sender)
    }

    /// Record a verified echo from `sender`. Returns `false` on a duplicate.
    pub fn record(&mut self, sender: NodeIndex) -> bool {
        self.received.insert(sender)
    }

    pub fn received_count(&self) -> usize {
        self.received.len()
    }

    pub fn threshold_reached(&self) -> bool {
        self.received.len() >= self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::Report;

    fn bundle(round: u64) -> AttestedReport {
        AttestedReport::build(1, round, Report::from_observations(vec![]), vec![])
    }

    #[test]
    fn test_first_adoption_wins() {
        let mut echo = EchoDisseminator::new(2);
        assert!(echo.adopt(bundle(1)));
        assert!(!echo.adopt(bundle(2)));
        assert_eq!(echo.sent().unwrap().round(), 1);
    }

    #[test]
    fn test_threshold_counts_distinct_senders() {
        let mut echo = EchoDisseminator::new(3);
        assert!(echo.record(0));
        assert!(!echo.record(0));
        assert!(echo.record(4));
        assert!(!echo.threshold_reached());
        assert!(echo.record(2));
        assert!(echo.threshold_reached());
        assert_eq!(echo.received_count(), 3);

        echo.reset();
        assert!(!echo.has_received(0));
        assert!(!echo.has_echoed());
    }
}
