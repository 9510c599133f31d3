use std::{
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use thiserror::Error;
use tokio::{sync::watch, time::Instant};
use tracing::{debug, info, warn};

use crate::condition::ShutdownRegistry;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for ShutdownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ShutdownState::Running => "running",
            ShutdownState::Draining => "draining",
            ShutdownState::Stopped => "stopped",
        })
    }
}

/// A request arrived after draining began. Safe to retry elsewhere or later.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("Server is going offline, try again later")]
pub struct ShutdownRejection;

struct Inner {
    state: watch::Sender<ShutdownState>,
    in_flight: AtomicUsize,
    registry: ShutdownRegistry,
    poll_interval: Duration,
    timeout: Option<Duration>,
    draining_since: Mutex<Option<Instant>>,
}

/// Tracks in-flight requests and decides when the process may exit.
///
/// `Running → Draining` happens once, on [`begin_draining`]. While draining,
/// [`try_enter`] rejects new work. The monitor moves to `Stopped` when no
/// request is in flight and every registered condition is ready, or when the
/// optional timeout has elapsed since draining began.
///
/// [`begin_draining`]: ShutdownCoordinator::begin_draining
/// [`try_enter`]: ShutdownCoordinator::try_enter
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

impl ShutdownCoordinator {
    pub fn new(registry: ShutdownRegistry) -> Self {
        Self::with_settings(registry, DEFAULT_POLL_INTERVAL, None)
    }

    pub fn with_settings(
        registry: ShutdownRegistry,
        poll_interval: Duration,
        timeout: Option<Duration>,
    ) -> Self {
        let (state, _) = watch::channel(ShutdownState::Running);
        Self {
            inner: Arc::new(Inner {
                state,
                in_flight: AtomicUsize::new(0),
                registry,
                poll_interval,
                timeout,
                draining_since: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ShutdownState {
        *self.inner.state.borrow()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state() != ShutdownState::Running
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> &ShutdownRegistry {
        &self.inner.registry
    }

    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.inner.state.subscribe()
    }

    /// Enters `Draining`. Returns `false` when already draining or stopped.
    pub fn begin_draining(&self) -> bool {
        let changed = self.inner.state.send_if_modified(|state| {
            if *state == ShutdownState::Running {
                *state = ShutdownState::Draining;
                true
            } else {
                false
            }
        });
        if changed {
            *self.draining_since() = Some(Instant::now());
            info!(in_flight = self.in_flight(), "shutdown requested, draining");
        } else {
            info!(state = %self.state(), "repeated shutdown request ignored");
        }
        changed
    }

    /// Registers one unit of in-flight work. The count drops when the guard
    /// does, however the work ends.
    pub fn try_enter(&self) -> Result<InFlightGuard, ShutdownRejection> {
        // count first so a concurrent monitor tick can't observe zero and stop
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlightGuard {
            inner: self.inner.clone(),
        };
        if self.state() != ShutdownState::Running {
            return Err(ShutdownRejection);
        }
        Ok(guard)
    }

    /// One monitor step. Only has an effect while draining.
    pub async fn tick(&self) -> ShutdownState {
        let state = self.state();
        if state != ShutdownState::Draining {
            return state;
        }

        let mut ready = true;
        let in_flight = self.in_flight();
        if in_flight > 0 {
            debug!(in_flight, "waiting for in-flight requests");
            ready = false;
        }
        for condition in self.inner.registry.snapshot() {
            if !condition.is_ready().await {
                info!(condition = %condition.description(), "shutdown condition not satisfied yet, waiting");
                ready = false;
            }
        }
        // a request may have slipped in while conditions were evaluated
        if ready && self.in_flight() == 0 {
            info!("all shutdown conditions satisfied");
            return self.stop();
        }

        let since = *self.draining_since();
        if let (Some(timeout), Some(since)) = (self.inner.timeout, since) {
            let elapsed = since.elapsed();
            if elapsed > timeout {
                warn!(
                    timeout_secs = timeout.as_secs_f64(),
                    elapsed_secs = elapsed.as_secs_f64(),
                    in_flight = self.in_flight(),
                    "shutdown timeout reached, stopping anyway"
                );
                return self.stop();
            }
        }
        ShutdownState::Draining
    }

    /// Polls [`tick`](Self::tick) at the configured interval until stopped.
    pub async fn monitor(&self) {
        let mut ticker = tokio::time::interval(self.inner.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.tick().await == ShutdownState::Stopped {
                break;
            }
        }
    }

    /// Resolves once the coordinator reaches `Stopped`.
    pub async fn stopped(&self) {
        let mut rx = self.subscribe();
        // the sender lives in `self`, so the channel can't close here
        let _ = rx.wait_for(|state| *state == ShutdownState::Stopped).await;
    }

    fn stop(&self) -> ShutdownState {
        self.inner.state.send_replace(ShutdownState::Stopped);
        ShutdownState::Stopped
    }

    fn draining_since(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.inner
            .draining_since
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Decrements the in-flight count on drop.
#[must_use = "the request is only counted while the guard is alive"]
pub struct InFlightGuard {
    inner: Arc<Inner>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> ShutdownCoordinator {
        ShutdownCoordinator::with_settings(ShutdownRegistry::new(), Duration::from_millis(5), None)
    }

    #[tokio::test]
    async fn running_ticks_do_nothing() {
        let coordinator = coordinator();
        assert_eq!(coordinator.tick().await, ShutdownState::Running);
        assert!(coordinator.try_enter().is_ok());
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn draining_is_idempotent_and_rejects_new_work() {
        let coordinator = coordinator();
        let guard = coordinator.try_enter().unwrap();
        assert!(coordinator.begin_draining());
        assert!(!coordinator.begin_draining());
        assert_eq!(coordinator.try_enter().err(), Some(ShutdownRejection));
        assert_eq!(coordinator.in_flight(), 1);

        assert_eq!(coordinator.tick().await, ShutdownState::Draining);
        drop(guard);
        assert_eq!(coordinator.tick().await, ShutdownState::Stopped);
        assert!(!coordinator.begin_draining());
    }

    #[tokio::test]
    async fn false_condition_vetoes_stop_indefinitely() {
        let coordinator = coordinator();
        coordinator.registry().register_fn("flush pending", || async { false });
        coordinator.begin_draining();
        for _ in 0..1000 {
            assert_eq!(coordinator.tick().await, ShutdownState::Draining);
        }
    }

    #[tokio::test]
    async fn condition_release_allows_stop() {
        let coordinator = coordinator();
        let id = coordinator.registry().register_fn("job", || async { false });
        coordinator.begin_draining();
        assert_eq!(coordinator.tick().await, ShutdownState::Draining);
        coordinator.registry().deregister(id);
        assert_eq!(coordinator.tick().await, ShutdownState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_forces_stop() {
        let coordinator = ShutdownCoordinator::with_settings(
            ShutdownRegistry::new(),
            Duration::from_millis(100),
            Some(Duration::from_secs(2)),
        );
        coordinator.registry().register_fn("stuck", || async { false });
        coordinator.begin_draining();

        let monitor = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.monitor().await }
        });
        tokio::time::timeout(Duration::from_secs(10), coordinator.stopped())
            .await
            .unwrap();
        monitor.await.unwrap();
        assert_eq!(coordinator.state(), ShutdownState::Stopped);
    }

    #[tokio::test]
    async fn monitor_stops_after_drain() {
        let coordinator = coordinator();
        let guard = coordinator.try_enter().unwrap();
        let monitor = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.monitor().await }
        });
        coordinator.begin_draining();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(coordinator.state(), ShutdownState::Draining);
        drop(guard);
        monitor.await.unwrap();
        assert_eq!(coordinator.state(), ShutdownState::Stopped);
    }
}
