//! Owned background tasks with explicit shutdown
//!
//! Periodic housekeeping (cache sweeps, writer auto-flush, memory sampling)
//! runs in tokio tasks that are owned by whoever spawned them. Each task
//! watches a shutdown channel and is joined on [`BackgroundTask::stop`].

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Receiver side handed to a background loop
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolves once shutdown has been requested (or the owner was dropped)
    pub async fn recv(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Returns true if shutdown has been requested
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}

/// A spawned, stoppable, joinable task
pub struct BackgroundTask {
    name: &'static str,
    tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    /// Spawns `body` with a fresh shutdown signal
    pub fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(ShutdownSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(body(ShutdownSignal { rx }));
        tracing::debug!(task = name, "Background task started");
        Self { name, tx, handle }
    }

    /// Spawns a loop that calls `tick` every `period` until stopped
    ///
    /// The first tick fires after one full period.
    pub fn every<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        Self::spawn(name, move |mut shutdown| async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => tick().await,
                    _ = shutdown.recv() => break,
                }
            }
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signals shutdown and waits for the task to exit
    pub async fn stop(self) {
        let _ = self.tx.send(true);
        if let Err(e) = self.handle.await {
            tracing::warn!(task = self.name, "Background task ended abnormally: {}", e);
        } else {
            tracing::debug!(task = self.name, "Background task stopped");
        }
    }
}
