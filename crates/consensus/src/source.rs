//! Value sources feeding follower observations

use crate::types::{Round, Value};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;

/// Produces the value a node observes for a round.
///
/// Called once per round in which the node is asked to observe. Errors are
/// logged by the node and the round proceeds without this node's observation.
#[async_trait]
pub trait ValueSource: Send + Sync {
    async fn get_value(&self, round: Round) -> anyhow::Result<Value>;
}

/// Always observes the same value
#[derive(Debug, Clone, Copy)]
pub struct FixedValue(pub Value);

#[async_trait]
impl ValueSource for FixedValue {
    async fn get_value(&self, _round: Round) -> anyhow::Result<Value> {
        Ok(self.0)
    }
}

/// Random walk around a starting value, for demos and local networks
#[derive(Debug)]
pub struct RandomWalk {
    current: Mutex<Value>,
    max_step: Value,
}

impl RandomWalk {
    pub fn new(start: Value, max_step: Value) -> Self {
        Self {
            current: Mutex::new(start),
            max_step,
        }
    }
}

#[async_trait]
impl ValueSource for RandomWalk {
    async fn get_value(&self, round: Round) -> anyhow::Result<Value> {
        let step = rand::thread_rng().gen_range(0..=self.max_step.saturating_mul(2));
        let mut current = self.current.lock();
        *current = current.saturating_add(step).saturating_sub(self.max_step);
        tracing::trace!(round, value = *current, "Random walk step");
        Ok(*current)
    }
}
