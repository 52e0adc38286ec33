//! Tick sources for the session timer.
//!
//! The machine never sleeps on its own. It asks a [`TimerScheduler`] for a
//! periodic callback and holds the returned [`TimerHandle`]; cancelling or
//! dropping the handle stops the callbacks. [`TokioTimer`] ticks in real
//! time, [`ManualTimer`] ticks when told to, which is what tests use.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{AbortHandle, Abortable};
use parking_lot::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::trace;

pub type TickFn = Arc<dyn Fn() + Send + Sync>;

/// Something that can call `on_tick` every `period` until told to stop.
pub trait TimerScheduler: Send + Sync {
    fn start(&self, period: Duration, on_tick: TickFn) -> TimerHandle;
}

/// Ownership of one running tick stream.
///
/// After [`cancel`](TimerHandle::cancel) returns, the callback is not invoked
/// again, even if a tick was already due.
#[derive(Debug)]
pub struct TimerHandle {
    live: Arc<AtomicBool>,
    abort: Option<AbortHandle>,
}

impl TimerHandle {
    fn new(live: Arc<AtomicBool>, abort: Option<AbortHandle>) -> Self {
        Self { live, abort }
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Stop the tick stream. Calling this more than once is harmless.
    pub fn cancel(&mut self) {
        self.live.store(false, Ordering::SeqCst);
        if let Some(abort) = self.abort.take() {
            abort.abort();
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Real-time ticks on the tokio runtime.
///
/// The first tick fires one full period after `start`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioTimer;

impl TimerScheduler for TokioTimer {
    fn start(&self, period: Duration, on_tick: TickFn) -> TimerHandle {
        let live = Arc::new(AtomicBool::new(true));
        let (abort, registration) = AbortHandle::new_pair();

        let task_live = live.clone();
        let ticks = async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticks.tick().await;
                if !task_live.load(Ordering::SeqCst) {
                    break;
                }
                trace!("timer tick");
                on_tick();
            }
        };
        tokio::spawn(Abortable::new(ticks, registration));

        TimerHandle::new(live, Some(abort))
    }
}

struct ManualEntry {
    live: Arc<AtomicBool>,
    on_tick: TickFn,
}

/// Ticks on demand. Clones share the same set of timers.
#[derive(Clone, Default)]
pub struct ManualTimer {
    entries: Arc<Mutex<Vec<ManualEntry>>>,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire one tick on every live timer. Returns how many fired.
    pub fn fire(&self) -> usize {
        let callbacks: Vec<TickFn> = {
            let mut entries = self.entries.lock();
            entries.retain(|entry| entry.live.load(Ordering::SeqCst));
            entries.iter().map(|entry| entry.on_tick.clone()).collect()
        };
        for on_tick in &callbacks {
            on_tick();
        }
        callbacks.len()
    }

    /// Fire `n` ticks in a row.
    pub fn advance(&self, n: usize) {
        for _ in 0..n {
            self.fire();
        }
    }

    pub fn active_count(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.live.load(Ordering::SeqCst))
            .count()
    }
}

impl TimerScheduler for ManualTimer {
    fn start(&self, _period: Duration, on_tick: TickFn) -> TimerHandle {
        let live = Arc::new(AtomicBool::new(true));
        self.entries.lock().push(ManualEntry {
            live: live.clone(),
            on_tick,
        });
        TimerHandle::new(live, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, TickFn) {
        let count = Arc::new(AtomicUsize::new(0));
        let tick_count = count.clone();
        let on_tick: TickFn = Arc::new(move || {
            tick_count.fetch_add(1, Ordering::SeqCst);
        });
        (count, on_tick)
    }

    #[test]
    fn manual_timer_fires_only_live_handles() {
        let timer = ManualTimer::new();
        let (count, on_tick) = counter();

        let mut first = timer.start(Duration::from_secs(1), on_tick.clone());
        let _second = timer.start(Duration::from_secs(1), on_tick);
        assert_eq!(timer.fire(), 2);

        first.cancel();
        first.cancel();
        assert!(!first.is_live());
        assert_eq!(timer.fire(), 1);
        assert_eq!(timer.active_count(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn dropping_handle_cancels() {
        let timer = ManualTimer::new();
        let (count, on_tick) = counter();

        drop(timer.start(Duration::from_secs(1), on_tick));
        assert_eq!(timer.fire(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_timer_ticks_once_per_period() {
        let (count, on_tick) = counter();
        let mut handle = TokioTimer.start(Duration::from_secs(1), on_tick);

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        handle.cancel();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
