//! One-shot timer straggler policy, grounded line-for-line on
//! `CutoffTimeBasedStragglerHandling` from the original aggregator: a
//! `threading.Timer` there becomes a detached `tokio::spawn`ed sleep here,
//! matching the coordinator lock re-entry pattern the teacher's
//! `mesh/elastic.rs::start_heartbeat_monitor` uses for its own background task.

use crate::straggler::StragglerPolicy;
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

pub const MINIMUM_CUTOFF_SECONDS: f64 = 20.0;

/// Callback invoked on cutoff expiry. Returns a boxed future so it can
/// re-acquire the async coordinator lock before running `_straggler_cutoff_time_elapsed`.
pub type StragglerCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct State {
    round_start_time: Option<Instant>,
    straggler_cutoff_time: f64,
    minimum_reporting: usize,
    expired: bool,
    generation: u64,
    callback: Option<StragglerCallback>,
}

pub struct CutoffTimeBasedStragglerHandling {
    state: Arc<Mutex<State>>,
}

impl CutoffTimeBasedStragglerHandling {
    pub fn new(straggler_cutoff_time_secs: f64, minimum_reporting: usize) -> Self {
        assert!(minimum_reporting > 0, "minimum_reporting cannot be 0");
        let cutoff = Self::clamp_cutoff(straggler_cutoff_time_secs);
        if cutoff.is_infinite() {
            info!("straggler cutoff disabled (straggler_cutoff_time = inf)");
        }
        Self {
            state: Arc::new(Mutex::new(State {
                round_start_time: None,
                straggler_cutoff_time: cutoff,
                minimum_reporting,
                expired: false,
                generation: 0,
                callback: None,
            })),
        }
    }

    fn clamp_cutoff(secs: f64) -> f64 {
        if secs.is_infinite() {
            secs
        } else {
            secs.max(MINIMUM_CUTOFF_SECONDS)
        }
    }

    fn time_expired(state: &State) -> bool {
        match state.round_start_time {
            Some(start) => start.elapsed().as_secs_f64() > state.straggler_cutoff_time,
            None => false,
        }
    }

    fn spawn_timer(state: Arc<Mutex<State>>, delay: Duration, generation: u64) {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let callback = {
                let mut state = state.lock();
                if state.generation != generation {
                    return;
                }
                state.expired = true;
                state.callback.clone()
            };
            if let Some(callback) = callback {
                callback().await;
            }
        });
    }

    /// Forwards to §4.3's `set_straggler_cutoff_time`: cancels the pending
    /// timer, applies the new cutoff, and either fires immediately (if the
    /// new deadline has already passed) or re-arms for the remainder.
    pub fn set_straggler_cutoff_time(&self, new_cutoff_secs: f64) {
        let (generation, callback, remaining) = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.straggler_cutoff_time = Self::clamp_cutoff(new_cutoff_secs);

            if Self::time_expired(&state) {
                state.expired = true;
                (state.generation, state.callback.clone(), None)
            } else {
                let remaining = state.round_start_time.map(|start| {
                    let elapsed = start.elapsed().as_secs_f64();
                    Duration::from_secs_f64((state.straggler_cutoff_time - elapsed).max(0.0))
                });
                (state.generation, None::<StragglerCallback>, remaining)
            }
        };

        if let Some(callback) = callback {
            tokio::spawn(async move {
                callback().await;
            });
        } else if let Some(remaining) = remaining {
            Self::spawn_timer(self.state.clone(), remaining, generation);
        }
    }
}

#[async_trait]
impl StragglerPolicy for CutoffTimeBasedStragglerHandling {
    async fn start_policy(&self, callback: StragglerCallback) {
        let disabled = self.state.lock().straggler_cutoff_time.is_infinite();
        if disabled {
            return;
        }

        self.reset_policy_for_round().await;

        let (generation, cutoff) = {
            let mut state = self.state.lock();
            state.round_start_time = Some(Instant::now());
            state.callback = Some(callback);
            (state.generation, state.straggler_cutoff_time)
        };

        Self::spawn_timer(self.state.clone(), Duration::from_secs_f64(cutoff), generation);
    }

    async fn reset_policy_for_round(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.round_start_time = None;
        state.expired = false;
    }

    async fn straggler_cutoff_check(&self, done: usize, total: usize) -> bool {
        let _ = total;
        let state = self.state.lock();
        if !state.expired {
            return false;
        }
        done >= state.minimum_reporting
    }

    fn set_straggler_cutoff_time(&self, new_cutoff_secs: f64) {
        CutoffTimeBasedStragglerHandling::set_straggler_cutoff_time(self, new_cutoff_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn fires_after_cutoff_and_respects_minimum_reporting() {
        let policy = CutoffTimeBasedStragglerHandling::new(MINIMUM_CUTOFF_SECONDS, 2);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();

        let callback: StragglerCallback = Arc::new(move || {
            let fired = fired_clone.clone();
            Box::pin(async move {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        });
        let _ = callback;

        // manually force expiry without waiting the real 20s floor
        {
            let mut state = policy.state.lock();
            state.round_start_time = Some(Instant::now() - Duration::from_secs(100));
            state.expired = true;
        }

        assert!(!policy.straggler_cutoff_check(1, 3).await);
        assert!(policy.straggler_cutoff_check(2, 3).await);
    }

    #[test]
    fn cutoff_is_clamped_to_minimum() {
        let policy = CutoffTimeBasedStragglerHandling::new(1.0, 1);
        assert_eq!(policy.state.lock().straggler_cutoff_time, MINIMUM_CUTOFF_SECONDS);
    }

    #[test]
    #[should_panic]
    fn zero_minimum_reporting_panics() {
        CutoffTimeBasedStragglerHandling::new(30.0, 0);
    }
}
