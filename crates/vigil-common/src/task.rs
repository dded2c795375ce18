//! Fixed-interval background tasks with cooperative shutdown.
//!
//! Every tick runs inside `catch_unwind`, so a panicking tick is logged and
//! the loop carries on at the next scheduled instant. Stopping never
//! interrupts a running tick: the loop only observes the stop signal while it
//! is waiting for the next one.

use std::{
    any::Any,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::FutureExt;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error};

use crate::time::{now, until_next_boundary};

#[derive(Debug, Clone)]
pub struct StopSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn stop(&self) {
        self.sender.send_replace(true);
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    pub period: Duration,
    /// Fire on wall-clock multiples of `period` instead of relative to spawn.
    pub aligned: bool,
}

impl Schedule {
    pub fn every(period: Duration) -> Self {
        Self {
            period,
            aligned: false,
        }
    }

    pub fn aligned(period: Duration) -> Self {
        Self {
            period,
            aligned: true,
        }
    }

    fn first_delay(&self) -> Duration {
        if self.aligned {
            until_next_boundary(&now(), self.period)
        } else {
            self.period
        }
    }
}

pub struct PeriodicTask {
    name: String,
    handle: JoinHandle<()>,
    ticks: Arc<AtomicU64>,
    panics: Arc<AtomicU64>,
}

impl PeriodicTask {
    pub fn spawn<F, Fut>(
        name: impl Into<String>,
        schedule: Schedule,
        stop: &StopSignal,
        mut tick: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let ticks = Arc::new(AtomicU64::new(0));
        let panics = Arc::new(AtomicU64::new(0));
        let mut stop_rx = stop.subscribe();

        let task_name = name.clone();
        let task_ticks = Arc::clone(&ticks);
        let task_panics = Arc::clone(&panics);
        let handle = tokio::spawn(async move {
            let period = schedule.period.max(Duration::from_millis(1));
            let start = Instant::now() + schedule.first_delay();
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                if *stop_rx.borrow_and_update() {
                    break;
                }

                tokio::select! {
                    biased;
                    changed = stop_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    _ = ticker.tick() => {}
                }

                let outcome = AssertUnwindSafe(async { tick().await }).catch_unwind().await;
                task_ticks.fetch_add(1, Ordering::Relaxed);
                if let Err(panic) = outcome {
                    task_panics.fetch_add(1, Ordering::Relaxed);
                    error!(
                        task = %task_name,
                        panic = %panic_message(panic.as_ref()),
                        "periodic task tick panicked"
                    );
                }
            }

            debug!(task = %task_name, "periodic task stopped");
        });

        Self {
            name,
            handle,
            ticks,
            panics,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn completed_ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn panicked_ticks(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }

    /// Waits for the loop to exit. Call after `StopSignal::stop`.
    pub async fn join(self) {
        if let Err(err) = self.handle.await {
            error!(task = %self.name, error = %err, "periodic task terminated abnormally");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }
    "non-string panic payload".to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;

    #[tokio::test]
    async fn panicking_tick_does_not_end_the_loop() {
        let stop = StopSignal::new();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);

        let task = PeriodicTask::spawn(
            "flaky",
            Schedule::every(Duration::from_millis(5)),
            &stop,
            move || {
                let call = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call == 0 {
                        panic!("first tick fails");
                    }
                }
            },
        );

        while calls.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        stop.stop();
        let panicked = task.panicked_ticks();
        task.join().await;

        assert_eq!(panicked, 1);
        assert!(calls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn stop_lets_the_running_tick_finish() {
        let stop = StopSignal::new();
        let finished = Arc::new(AtomicBool::new(false));
        let started = Arc::new(AtomicBool::new(false));
        let tick_finished = Arc::clone(&finished);
        let tick_started = Arc::clone(&started);

        let task = PeriodicTask::spawn(
            "slow",
            Schedule::every(Duration::from_millis(5)),
            &stop,
            move || {
                let started = Arc::clone(&tick_started);
                let finished = Arc::clone(&tick_finished);
                async move {
                    started.store(true, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    finished.store(true, Ordering::SeqCst);
                }
            },
        );

        while !started.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        stop.stop();
        task.join().await;

        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn already_stopped_signal_never_ticks() {
        let stop = StopSignal::new();
        stop.stop();

        let task = PeriodicTask::spawn(
            "idle",
            Schedule::every(Duration::from_millis(1)),
            &stop,
            || async {},
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(task.completed_ticks(), 0);
        task.join().await;
    }
}
