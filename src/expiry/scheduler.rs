//! Single-timer expiration scheduler.

use crate::error::Result;
use crate::types::Timestamp;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Boxed future returned by the sweep callback.
pub type SweepFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

type FindUpcoming = Box<dyn Fn(Timestamp) -> Vec<Timestamp> + Send + Sync>;
type SweepFn = Box<dyn Fn(Timestamp) -> SweepFuture + Send + Sync>;

/// Scheduler tuning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Shortest delay a timer is ever armed with.
    pub min_delay: Duration,
    /// Longest delay between two sweeps, and the time box of one sweep.
    pub upkeep_window: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(500),
            upkeep_window: Duration::from_secs(30),
        }
    }
}

struct Armed {
    target: Timestamp,
    generation: u64,
    handle: JoinHandle<()>,
}

struct SchedulerState {
    stopped: bool,
    sweeping: bool,
    armed: Option<Armed>,
    next_generation: u64,
}

struct SchedulerInner {
    config: SchedulerConfig,
    find_upcoming: FindUpcoming,
    sweep: SweepFn,
    state: Mutex<SchedulerState>,
}

/// Keeps exactly one timer armed for the next expiration deadline.
///
/// The scheduler knows nothing about what expires: it asks `find_upcoming`
/// for the deadlines inside the upkeep window and calls `sweep` when the
/// timer fires. A sweep that fails or outlives the upkeep window is logged
/// and the timer is re-armed as usual.
#[derive(Clone)]
pub struct ExpirationScheduler {
    inner: Arc<SchedulerInner>,
}

impl ExpirationScheduler {
    /// Create a stopped scheduler.
    pub fn new<F, S, Fut>(config: SchedulerConfig, find_upcoming: F, sweep: S) -> Self
    where
        F: Fn(Timestamp) -> Vec<Timestamp> + Send + Sync + 'static,
        S: Fn(Timestamp) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                find_upcoming: Box::new(find_upcoming),
                sweep: Box::new(move |now| Box::pin(sweep(now))),
                state: Mutex::new(SchedulerState {
                    stopped: true,
                    sweeping: false,
                    armed: None,
                    next_generation: 0,
                }),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Enable the scheduler and arm it for the next deadline.
    pub fn start(&self) {
        self.inner.state.lock().stopped = false;
        self.request_rearm();
    }

    /// Disable the scheduler and cancel the armed timer.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        state.stopped = true;
        if let Some(armed) = state.armed.take() {
            armed.handle.abort();
        }
    }

    /// Arm for the earliest upcoming deadline, or the end of the upkeep
    /// window when nothing is due before it.
    pub fn request_rearm(&self) {
        if !self.is_active() {
            return;
        }
        let horizon = Timestamp::now() + self.inner.config.upkeep_window;
        let next = (self.inner.find_upcoming)(horizon)
            .into_iter()
            .min()
            .map_or(horizon, |at| at.min(horizon));
        self.arm(next);
    }

    /// Arm the timer for `deadline`, no sooner than the minimum delay.
    ///
    /// An already armed timer is only replaced when the new target fires
    /// strictly sooner.
    pub fn arm(&self, deadline: Timestamp) {
        let mut state = self.inner.state.lock();
        if state.stopped || state.sweeping {
            return;
        }
        let now = Timestamp::now();
        let delay = now.until(deadline).max(self.inner.config.min_delay);
        let target = now + delay;

        if let Some(armed) = &state.armed {
            if target >= armed.target {
                trace!(%target, armed = %armed.target, "keeping earlier timer");
                return;
            }
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!(%target, "no async runtime, expiration timer not armed");
            return;
        };
        if let Some(previous) = state.armed.take() {
            previous.handle.abort();
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        let weak = Arc::downgrade(&self.inner);
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(scheduler) = upgrade(&weak) {
                scheduler.sweep_once(Some(generation)).await;
            }
        });
        trace!(%target, delay_ms = delay.as_millis() as u64, "expiration timer armed");
        state.armed = Some(Armed {
            target,
            generation,
            handle,
        });
    }

    /// Run one sweep now, time-boxed by the upkeep window, then re-arm.
    /// Does nothing while another sweep is running or when stopped.
    pub async fn fire(&self) {
        self.sweep_once(None).await;
    }

    /// `timer` is the generation of the timer task calling in, if any; a
    /// timer that has been replaced in the meantime does nothing.
    async fn sweep_once(&self, timer: Option<u64>) {
        {
            let mut state = self.inner.state.lock();
            if state.sweeping || state.stopped {
                return;
            }
            match timer {
                Some(generation) => {
                    if state.armed.as_ref().map(|armed| armed.generation) != Some(generation) {
                        return;
                    }
                    // Our own task: detach, never abort.
                    state.armed = None;
                }
                None => {
                    if let Some(armed) = state.armed.take() {
                        armed.handle.abort();
                    }
                }
            }
            state.sweeping = true;
        }

        let now = Timestamp::now();
        let sweep = (self.inner.sweep)(now);
        match tokio::time::timeout(self.inner.config.upkeep_window, sweep).await {
            Ok(Ok(())) => debug!(%now, "sweep finished"),
            Ok(Err(e)) => warn!(error = %e, "sweep failed"),
            Err(_) => warn!(
                window_ms = self.inner.config.upkeep_window.as_millis() as u64,
                "sweep timed out"
            ),
        }

        self.inner.state.lock().sweeping = false;
        self.request_rearm();
    }

    /// Fire time of the armed timer.
    pub fn armed_at(&self) -> Option<Timestamp> {
        self.inner.state.lock().armed.as_ref().map(|armed| armed.target)
    }

    pub fn is_sweeping(&self) -> bool {
        self.inner.state.lock().sweeping
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.state.lock().stopped
    }

    fn is_active(&self) -> bool {
        let state = self.inner.state.lock();
        !state.stopped && !state.sweeping
    }
}

fn upgrade(weak: &Weak<SchedulerInner>) -> Option<ExpirationScheduler> {
    weak.upgrade().map(|inner| ExpirationScheduler { inner })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn idle_scheduler() -> ExpirationScheduler {
        ExpirationScheduler::new(SchedulerConfig::default(), |_| Vec::new(), |_| async { Ok(()) })
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_stopped() {
        let scheduler = idle_scheduler();
        assert!(scheduler.is_stopped());
        scheduler.arm(Timestamp::now());
        assert_eq!(scheduler.armed_at(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_arms_upkeep_window() {
        let scheduler = idle_scheduler();
        let now = Timestamp::now();
        scheduler.start();
        assert_eq!(scheduler.armed_at(), Some(now + Duration::from_secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_replaces_only_sooner_targets() {
        let scheduler = idle_scheduler();
        scheduler.start();
        let now = Timestamp::now();

        scheduler.arm(now + Duration::from_secs(10));
        assert_eq!(scheduler.armed_at(), Some(now + Duration::from_secs(10)));

        scheduler.arm(now + Duration::from_secs(20));
        assert_eq!(scheduler.armed_at(), Some(now + Duration::from_secs(10)));

        scheduler.arm(now + Duration::from_secs(10));
        assert_eq!(scheduler.armed_at(), Some(now + Duration::from_secs(10)));

        scheduler.arm(now + Duration::from_secs(5));
        assert_eq!(scheduler.armed_at(), Some(now + Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_clamps_to_min_delay() {
        let scheduler = idle_scheduler();
        scheduler.start();
        let now = Timestamp::now();
        scheduler.arm(Timestamp(0));
        assert_eq!(scheduler.armed_at(), Some(now + Duration::from_millis(500)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_timer() {
        let sweeps = Arc::new(AtomicUsize::new(0));
        let counter = sweeps.clone();
        let scheduler = ExpirationScheduler::new(
            SchedulerConfig::default(),
            |_| Vec::new(),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
        );
        scheduler.start();
        scheduler.stop();
        assert_eq!(scheduler.armed_at(), None);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(sweeps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_sweep_is_rescheduled() {
        let sweeps = Arc::new(AtomicUsize::new(0));
        let counter = sweeps.clone();
        let scheduler = ExpirationScheduler::new(
            SchedulerConfig::default(),
            |_| Vec::new(),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(StoreError::SweepFailed("boom".to_string())) }
            },
        );
        scheduler.start();
        scheduler.fire().await;

        assert_eq!(sweeps.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_sweeping());
        assert!(scheduler.armed_at().is_some());
    }
}
