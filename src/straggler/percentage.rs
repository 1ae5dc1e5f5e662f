//! Threshold-based straggler policy: no timer, ends the round once a
//! reporting fraction of the assignees has completed.

use crate::straggler::cutoff::StragglerCallback;
use crate::straggler::StragglerPolicy;
use async_trait::async_trait;

pub struct PercentageBasedStragglerHandling {
    pub threshold: f64,
}

impl PercentageBasedStragglerHandling {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

#[async_trait]
impl StragglerPolicy for PercentageBasedStragglerHandling {
    async fn start_policy(&self, _callback: StragglerCallback) {
        // Callback-less: there is no timer to arm.
    }

    async fn reset_policy_for_round(&self) {}

    async fn straggler_cutoff_check(&self, done: usize, total: usize) -> bool {
        if total == 0 {
            return false;
        }
        (done as f64) / (total as f64) >= self.threshold
    }
}
