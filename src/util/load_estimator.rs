use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

#[cfg(test)] use mockall::automock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;


const HISTORY_LENGTH: usize = 10;
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// A signal for 'this process is too busy to notice incoming data in time'. Protocols consult
///  it before declaring the peer dead, so that CPU starvation on our side does not cause
///  spurious timeouts.
#[cfg_attr(test, automock)]
pub trait LoadEstimator: Send + Sync + 'static {
    /// 0.0 (idle) to 1.0 (starved)
    fn load(&self) -> f64;

    fn has_high_load(&self) -> bool {
        self.load() >= 0.5
    }
}

struct TickHistory {
    /// newest first
    ticks: [Instant; HISTORY_LENGTH],
}
impl TickHistory {
    fn new(now: Instant) -> TickHistory {
        let mut ticks = [now; HISTORY_LENGTH];
        for (i, tick) in ticks.iter_mut().enumerate() {
            *tick = now.checked_sub(TICK_INTERVAL * i as u32).unwrap_or(now);
        }
        TickHistory { ticks }
    }

    fn record(&mut self, now: Instant) {
        self.ticks.rotate_right(1);
        self.ticks[0] = now;
    }

    fn load(&self, now: Instant) -> f64 {
        let history_limit = TICK_INTERVAL * (HISTORY_LENGTH as u32 + 1);
        let num_recent = self.ticks.iter()
            .filter(|&&t| now.saturating_duration_since(t) <= history_limit)
            .count();
        1.0 - num_recent as f64 / HISTORY_LENGTH as f64
    }
}

/// Estimates load by having a task record a timestamp once per second: the fewer ticks were
///  recorded during the last [HISTORY_LENGTH] seconds, the more starved the runtime is.
pub struct TickLoadEstimator {
    history: Arc<Mutex<TickHistory>>,
    tick_handle: Mutex<JoinHandle<()>>,
}
impl TickLoadEstimator {
    /// Starts the ticking task, so this must be called in the context of a Tokio runtime. Load
    ///  is measured for that runtime only.
    pub fn new() -> TickLoadEstimator {
        let history = Arc::new(Mutex::new(TickHistory::new(Instant::now())));
        let tick_handle = spawn_ticker(&history);

        TickLoadEstimator {
            history,
            tick_handle: Mutex::new(tick_handle),
        }
    }

    /// Restarts the ticking task on the current runtime if it is gone, e.g. because the runtime
    ///  it was started on was shut down. Must be called in the context of a Tokio runtime.
    pub fn ensure_ticking(&self) {
        let mut tick_handle = self.tick_handle.lock().unwrap_or_else(PoisonError::into_inner);
        if !tick_handle.is_finished() {
            return;
        }

        debug!("load estimator stopped ticking - restarting it on the current runtime");
        *self.history.lock().unwrap_or_else(PoisonError::into_inner) = TickHistory::new(Instant::now());
        *tick_handle = spawn_ticker(&self.history);
    }
}

fn spawn_ticker(history: &Arc<Mutex<TickHistory>>) -> JoinHandle<()> {
    let history_weak = Arc::downgrade(history);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + TICK_INTERVAL, TICK_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match history_weak.upgrade() {
                Some(history) => history.lock().unwrap_or_else(PoisonError::into_inner).record(Instant::now()),
                None => break,
            }
        }
    })
}

impl LoadEstimator for TickLoadEstimator {
    fn load(&self) -> f64 {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
            .load(Instant::now())
    }
}

impl Drop for TickLoadEstimator {
    fn drop(&mut self) {
        self.tick_handle.lock().unwrap_or_else(PoisonError::into_inner)
            .abort();
    }
}

/// The process-wide estimator that protocols use unless they are configured with a different
///  one. It is created on first use. If the runtime it ticks on is shut down, the next call
///  moves its ticking to the caller's runtime.
pub fn global_load_estimator() -> Arc<dyn LoadEstimator> {
    static INSTANCE: OnceLock<Arc<TickLoadEstimator>> = OnceLock::new();
    let estimator = INSTANCE.get_or_init(|| {
        debug!("starting global load estimator");
        Arc::new(TickLoadEstimator::new())
    });
    estimator.ensure_ticking();
    estimator.clone()
}
