// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Periodic security token renewal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::UaResult;

/// Renews a channel's security token on a schedule.
#[async_trait]
pub trait Renewable: Send + Sync {
    /// Runs one OpenSecureChannel renewal.
    async fn renew(&self) -> UaResult<()>;

    /// Lifetime of the current token as revised by the server.
    fn token_lifetime(&self) -> Duration;

    /// Gives up on the channel after too many failed renewals.
    async fn abandon(&self);
}

/// Renewal period for a token lifetime: `ceil(lifetime * 0.75)`.
pub fn renewal_interval(lifetime: Duration) -> Duration {
    let millis = lifetime.as_millis() as u64;
    Duration::from_millis((millis * 3).div_ceil(4).max(1))
}

enum KeepAliveCommand {
    Stop,
}

/// Background task renewing the token every `ceil(lifetime * 0.75)` ms.
///
/// The period is recomputed after every renewal, so a revised lifetime
/// reschedules the loop. Failures are retried at the same cadence; with a
/// failure limit set, reaching it abandons the channel.
pub struct KeepAliveLoop {
    sender: mpsc::Sender<KeepAliveCommand>,
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl KeepAliveLoop {
    /// Starts the loop. It holds only a weak reference to `target`.
    pub fn spawn<R>(target: Weak<R>, failure_limit: Option<u32>) -> Self
    where
        R: Renewable + 'static,
    {
        let (sender, receiver) = mpsc::channel(1);
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(Self::worker(target, receiver, failure_limit, shutdown.clone()));
        Self {
            sender,
            shutdown,
            handle: Mutex::new(Some(handle)),
        }
    }

    async fn worker<R>(
        target: Weak<R>,
        mut receiver: mpsc::Receiver<KeepAliveCommand>,
        failure_limit: Option<u32>,
        shutdown: Arc<AtomicBool>,
    ) where
        R: Renewable + 'static,
    {
        let mut failures = 0u32;

        loop {
            let Some(lifetime) = target.upgrade().map(|t| t.token_lifetime()) else {
                break;
            };
            let period = renewal_interval(lifetime);
            debug!(period_ms = period.as_millis() as u64, "Scheduling token renewal");

            tokio::select! {
                command = receiver.recv() => match command {
                    Some(KeepAliveCommand::Stop) | None => break,
                },
                _ = tokio::time::sleep(period) => {}
            }

            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            let Some(target) = target.upgrade() else {
                break;
            };

            match target.renew().await {
                Ok(()) => failures = 0,
                Err(e) => {
                    failures += 1;
                    e.log("keepalive renewal");
                    if failure_limit.is_some_and(|limit| failures >= limit) {
                        warn!(failures, "Token renewal failure limit reached, abandoning channel");
                        shutdown.store(true, Ordering::Relaxed);
                        target.abandon().await;
                        break;
                    }
                }
            }
        }

        debug!("Keepalive loop stopped");
    }

    /// Signals the loop to stop without waiting for it.
    pub fn stop(&self) {
        if self.shutdown.swap(true, Ordering::Relaxed) {
            return;
        }
        let _ = self.sender.try_send(KeepAliveCommand::Stop);
        info!("Keepalive loop stop requested");
    }

    /// Returns `true` once the loop has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.lock().as_ref().map_or(true, |handle| handle.is_finished())
    }

    /// Stops the loop and waits for it to exit.
    pub async fn join(&self) {
        self.stop();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for KeepAliveLoop {
    fn drop(&mut self) {
        // The worker sees the closed command channel and exits on its own.
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for KeepAliveLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepAliveLoop")
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{TimeoutError, UaError};
    use std::sync::atomic::AtomicU32;

    struct Counter {
        renewals: AtomicU32,
        fail: bool,
        abandoned: AtomicBool,
        lifetime: Mutex<Duration>,
    }

    impl Counter {
        fn new(lifetime_ms: u64, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                renewals: AtomicU32::new(0),
                fail,
                abandoned: AtomicBool::new(false),
                lifetime: Mutex::new(Duration::from_millis(lifetime_ms)),
            })
        }
    }

    #[async_trait]
    impl Renewable for Counter {
        async fn renew(&self) -> UaResult<()> {
            self.renewals.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(UaError::from(TimeoutError::negotiation(
                    "OpenSecureChannel",
                    Duration::from_secs(1),
                )));
            }
            Ok(())
        }

        fn token_lifetime(&self) -> Duration {
            *self.lifetime.lock()
        }

        async fn abandon(&self) {
            self.abandoned.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_renewal_interval() {
        assert_eq!(renewal_interval(Duration::from_millis(1000)), Duration::from_millis(750));
        assert_eq!(renewal_interval(Duration::from_millis(3)), Duration::from_millis(3));
        assert_eq!(renewal_interval(Duration::from_millis(10)), Duration::from_millis(8));
        assert_eq!(
            renewal_interval(Duration::from_millis(3_600_000)),
            Duration::from_millis(2_700_000)
        );
        assert_eq!(renewal_interval(Duration::ZERO), Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_renews_on_schedule() {
        let target = Counter::new(1000, false);
        let keepalive = KeepAliveLoop::spawn(Arc::downgrade(&target), None);

        tokio::time::sleep(Duration::from_millis(740)).await;
        assert_eq!(target.renewals.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(target.renewals.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(750)).await;
        assert_eq!(target.renewals.load(Ordering::SeqCst), 2);

        keepalive.join().await;
        assert!(keepalive.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_limit_abandons() {
        let target = Counter::new(100, true);
        let keepalive = KeepAliveLoop::spawn(Arc::downgrade(&target), Some(3));

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(target.renewals.load(Ordering::SeqCst), 3);
        assert!(target.abandoned.load(Ordering::SeqCst));
        assert!(keepalive.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_retry_forever_without_limit() {
        let target = Counter::new(100, true);
        let keepalive = KeepAliveLoop::spawn(Arc::downgrade(&target), None);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(target.renewals.load(Ordering::SeqCst) >= 10);
        assert!(!target.abandoned.load(Ordering::SeqCst));
        keepalive.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_target_dropped() {
        let target = Counter::new(100, false);
        let keepalive = KeepAliveLoop::spawn(Arc::downgrade(&target), None);
        drop(target);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(keepalive.is_finished());
    }
}
