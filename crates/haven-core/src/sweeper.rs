//! Owned background cleanup tasks.
//!
//! Each guard store is swept on its own interval by a task that lives until
//! [`Sweeper::stop`] is called. A failing pass is logged and the loop keeps
//! running.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// A store that can drop its stale records.
pub trait Sweep: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Remove stale records, returning how many were removed.
    fn sweep(&self) -> usize;
}

/// Run a single pass, containing any panic raised by the store.
pub fn run_pass(target: &dyn Sweep) -> Option<usize> {
    match std::panic::catch_unwind(AssertUnwindSafe(|| target.sweep())) {
        Ok(removed) => {
            if removed > 0 {
                tracing::debug!(store = target.name(), removed, "sweep removed stale records");
            }
            Some(removed)
        }
        Err(_) => {
            tracing::warn!(store = target.name(), "sweep pass failed");
            None
        }
    }
}

pub struct Sweeper {
    name: &'static str,
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    /// Spawn the sweep loop on the current tokio runtime.
    pub fn start(target: Arc<dyn Sweep>, every: Duration) -> Self {
        let name = target.name();
        let shutdown = Arc::new(Notify::new());
        let stop = shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await; // skip immediate first tick
            loop {
                tokio::select! {
                    _ = stop.notified() => break,
                    _ = interval.tick() => {
                        run_pass(target.as_ref());
                    }
                }
            }
            tracing::debug!(store = name, "sweeper stopped");
        });
        tracing::debug!(store = name, every_ms = every.as_millis() as u64, "sweeper started");
        Self {
            name,
            shutdown,
            handle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signal the loop to exit and wait for it.
    pub async fn stop(self) {
        self.shutdown.notify_one();
        if let Err(err) = self.handle.await {
            tracing::warn!(store = self.name, "sweeper task ended abnormally: {}", err);
        }
    }
}

/// The sweepers for every guard store, stopped together.
#[derive(Default)]
pub struct SweeperSet {
    sweepers: Vec<Sweeper>,
}

impl SweeperSet {
    pub fn push(&mut self, sweeper: Sweeper) {
        self.sweepers.push(sweeper);
    }

    pub fn len(&self) -> usize {
        self.sweepers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sweepers.is_empty()
    }

    pub async fn stop(self) {
        for sweeper in self.sweepers {
            sweeper.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        passes: AtomicUsize,
        panic_on_first: bool,
    }

    impl Sweep for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn sweep(&self) -> usize {
            let pass = self.passes.fetch_add(1, Ordering::SeqCst);
            if self.panic_on_first && pass == 0 {
                panic!("store unavailable");
            }
            1
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sweeps_on_interval_until_stopped() {
        let target = Arc::new(Counting::default());
        let sweeper = Sweeper::start(target.clone(), Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(target.passes.load(Ordering::SeqCst), 3);

        sweeper.stop().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(target.passes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_pass_does_not_end_loop() {
        let target = Arc::new(Counting {
            passes: AtomicUsize::new(0),
            panic_on_first: true,
        });
        let sweeper = Sweeper::start(target.clone(), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(target.passes.load(Ordering::SeqCst), 2);
        sweeper.stop().await;
    }

    #[test]
    fn run_pass_reports_failure() {
        let target = Counting {
            passes: AtomicUsize::new(0),
            panic_on_first: true,
        };
        assert_eq!(run_pass(&target), None);
        assert_eq!(run_pass(&target), Some(1));
    }
}
