//! Tick-aligned callback queue
//!
//! The tick queue is the one place where work produced on foreign threads
//! is handed to the engine owner. Callbacks may be scheduled from any
//! thread; they only run when the host loop calls [`TickScheduler::drain`].

use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::mpsc;

/// A zero-argument callback run on a tick
pub type TickCallback = Box<dyn FnOnce() + Send + 'static>;

/// Serialized queue drained once per tick
pub trait TickQueue: Send + Sync {
    /// Run `callback` on the next tick
    fn schedule(&self, callback: TickCallback);

    /// Run `callback` once `ticks` ticks have passed (at least one)
    fn schedule_after(&self, ticks: u64, callback: TickCallback);

    /// Number of ticks drained so far
    fn current_tick(&self) -> u64;
}

struct Delayed {
    due: u64,
    seq: u64,
    callback: TickCallback,
}

/// Channel-backed [`TickQueue`]
///
/// `drain` first runs delayed callbacks that came due, then every callback
/// that was queued before the drain started, in FIFO order. Callbacks queued
/// while draining wait for the next tick.
pub struct TickScheduler {
    tx: mpsc::UnboundedSender<TickCallback>,
    rx: Mutex<mpsc::UnboundedReceiver<TickCallback>>,
    delayed: Mutex<Vec<Delayed>>,
    queued: AtomicUsize,
    tick: AtomicU64,
    seq: AtomicU64,
}

impl TickScheduler {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            delayed: Mutex::new(Vec::new()),
            queued: AtomicUsize::new(0),
            tick: AtomicU64::new(0),
            seq: AtomicU64::new(0),
        }
    }

    /// Callbacks waiting for the next drain
    pub fn pending(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Delayed callbacks not yet due
    pub fn delayed(&self) -> usize {
        self.delayed.lock().len()
    }

    /// Advance one tick and run what is due. Returns the number of callbacks run.
    pub fn drain(&self) -> usize {
        let tick = self.tick.fetch_add(1, Ordering::AcqRel) + 1;
        let mut ran = 0;

        let mut due: Vec<Delayed> = {
            let mut delayed = self.delayed.lock();
            let (ready, waiting): (Vec<_>, Vec<_>) =
                delayed.drain(..).partition(|entry| entry.due <= tick);
            *delayed = waiting;
            ready
        };
        due.sort_by_key(|entry| (entry.due, entry.seq));
        for entry in due {
            run_callback(tick, entry.callback);
            ran += 1;
        }

        let budget = self.queued.load(Ordering::Acquire);
        for _ in 0..budget {
            let next = self.rx.lock().try_recv();
            match next {
                Ok(callback) => {
                    self.queued.fetch_sub(1, Ordering::AcqRel);
                    run_callback(tick, callback);
                    ran += 1;
                }
                Err(_) => break,
            }
        }

        if ran > 0 {
            tracing::trace!("Tick {} ran {} callbacks", tick, ran);
        }
        ran
    }
}

impl Default for TickScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TickQueue for TickScheduler {
    fn schedule(&self, callback: TickCallback) {
        self.queued.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(callback).is_err() {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            tracing::warn!("Tick queue closed, dropping callback");
        }
    }

    fn schedule_after(&self, ticks: u64, callback: TickCallback) {
        let due = self.tick.load(Ordering::Acquire).saturating_add(ticks.max(1));
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.delayed.lock().push(Delayed { due, seq, callback });
    }

    fn current_tick(&self) -> u64 {
        self.tick.load(Ordering::Acquire)
    }
}

/// A panicking callback must not take the rest of the tick down with it
fn run_callback(tick: u64, callback: TickCallback) {
    if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
        tracing::error!("Tick callback panicked during tick {}", tick);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) -> TickCallback) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let make = move |n: u32| -> TickCallback {
            let sink = sink.clone();
            Box::new(move || sink.lock().push(n))
        };
        (log, make)
    }

    #[test]
    fn test_fifo_order() {
        let scheduler = TickScheduler::new();
        let (log, make) = recorder();

        for n in 0..5 {
            scheduler.schedule(make(n));
        }
        assert_eq!(scheduler.pending(), 5);
        assert_eq!(scheduler.drain(), 5);
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_nothing_runs_before_drain() {
        let scheduler = TickScheduler::new();
        let (log, make) = recorder();
        scheduler.schedule(make(1));
        assert!(log.lock().is_empty());
        scheduler.drain();
        assert_eq!(*log.lock(), vec![1]);
    }

    #[test]
    fn test_scheduled_during_drain_waits() {
        let scheduler = Arc::new(TickScheduler::new());
        let (log, make) = recorder();

        let inner = scheduler.clone();
        let second = make(2);
        let sink = log.clone();
        scheduler.schedule(Box::new(move || {
            sink.lock().push(1);
            inner.schedule(second);
        }));

        assert_eq!(scheduler.drain(), 1);
        assert_eq!(*log.lock(), vec![1]);
        assert_eq!(scheduler.drain(), 1);
        assert_eq!(*log.lock(), vec![1, 2]);
    }

    #[test]
    fn test_delayed_callbacks() {
        let scheduler = TickScheduler::new();
        let (log, make) = recorder();

        scheduler.schedule_after(3, make(3));
        scheduler.schedule_after(1, make(1));
        scheduler.schedule_after(0, make(0));
        assert_eq!(scheduler.delayed(), 3);

        scheduler.drain();
        assert_eq!(*log.lock(), vec![1, 0]);
        scheduler.drain();
        assert_eq!(*log.lock(), vec![1, 0]);
        scheduler.drain();
        assert_eq!(*log.lock(), vec![1, 0, 3]);
        assert_eq!(scheduler.current_tick(), 3);
    }

    #[test]
    fn test_huge_delay_never_comes_due() {
        let scheduler = TickScheduler::new();
        let (log, make) = recorder();

        scheduler.drain();
        scheduler.schedule_after(u64::MAX, make(1));
        scheduler.schedule_after(1, make(2));
        scheduler.drain();
        scheduler.drain();
        assert_eq!(*log.lock(), vec![2]);
        assert_eq!(scheduler.delayed(), 1);
    }

    #[test]
    fn test_panic_does_not_abort_drain() {
        let scheduler = TickScheduler::new();
        let (log, make) = recorder();

        scheduler.schedule(make(1));
        scheduler.schedule(Box::new(|| panic!("bad callback")));
        scheduler.schedule(make(2));

        assert_eq!(scheduler.drain(), 3);
        assert_eq!(*log.lock(), vec![1, 2]);
    }
}
