//! Straggler Policy (C4): a timer-and-quorum predicate deciding when a
//! round may terminate early, leaving some collaborators behind.

pub mod cutoff;
pub mod percentage;

pub use cutoff::CutoffTimeBasedStragglerHandling;
pub use percentage::PercentageBasedStragglerHandling;

use async_trait::async_trait;

/// Capability set shared by every straggler policy variant.
#[async_trait]
pub trait StragglerPolicy: Send + Sync {
    /// Arms the policy for a newly dispatched round. `callback` is invoked
    /// (on whatever scheduler the policy uses) when the cutoff elapses.
    async fn start_policy(&self, callback: crate::straggler::cutoff::StragglerCallback);

    /// Cancels any pending timer and clears round-scoped state.
    async fn reset_policy_for_round(&self);

    /// Returns true once the round should end early given the current
    /// completion count.
    async fn straggler_cutoff_check(&self, done: usize, total: usize) -> bool;

    /// Retunes the cutoff deadline, if this policy variant has one.
    /// No-op default for variants without a timer (e.g. percentage-based).
    fn set_straggler_cutoff_time(&self, _new_cutoff_secs: f64) {}
}
