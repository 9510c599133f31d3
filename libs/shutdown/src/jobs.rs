use std::{
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        Arc, Mutex, MutexGuard, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};

pub const DEFAULT_CANCEL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

struct TrackedJob {
    name: String,
    group: Option<String>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct JobsInner {
    next_id: AtomicU64,
    jobs: Mutex<HashMap<JobId, TrackedJob>>,
    sweeping: AtomicBool,
}

impl JobsInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, TrackedJob>> {
        self.jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Long-running tasks tied to the service lifetime.
///
/// Finished jobs remove themselves from the tracked set, except while a
/// cancellation sweep is running. A sweep drains a snapshot out of the set,
/// cancels it, and repeats until nothing new was spawned in the meantime.
#[derive(Clone)]
pub struct BackgroundJobSupervisor {
    inner: Arc<JobsInner>,
    cancel_timeout: Duration,
}

impl Default for BackgroundJobSupervisor {
    fn default() -> Self {
        Self::new(DEFAULT_CANCEL_TIMEOUT)
    }
}

impl BackgroundJobSupervisor {
    /// `cancel_timeout` bounds the wait for each cancelled job. Jobs still
    /// running after it are abandoned.
    pub fn new(cancel_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(JobsInner::default()),
            cancel_timeout,
        }
    }

    pub fn spawn<F>(&self, name: impl Into<String>, job: F) -> JobId
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.spawn_job(None, name.into(), job)
    }

    /// Spawns a job that [`cancel_group`](Self::cancel_group) can stop
    /// together with the rest of its group.
    pub fn spawn_in<F>(&self, group: impl Into<String>, name: impl Into<String>, job: F) -> JobId
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.spawn_job(Some(group.into()), name.into(), job)
    }

    fn spawn_job<F>(&self, group: Option<String>, name: String, job: F) -> JobId
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = JobId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let weak: Weak<JobsInner> = Arc::downgrade(&self.inner);
        let task_name = name.clone();

        // hold the lock across spawn so the job can't finish before it's tracked
        let mut jobs = self.inner.lock();
        let handle = tokio::spawn(
            async move {
                match AssertUnwindSafe(job).catch_unwind().await {
                    Ok(Ok(())) => debug!(job = %task_name, "background job finished"),
                    Ok(Err(err)) => error!(job = %task_name, error = %err, "background job failed"),
                    Err(_) => error!(job = %task_name, "background job panicked"),
                }
                if let Some(inner) = weak.upgrade() {
                    if !inner.sweeping.load(Ordering::SeqCst) {
                        inner.lock().remove(&id);
                    }
                }
            }
            .in_current_span(),
        );
        debug!(job = %name, group = ?group, "background job spawned");
        jobs.insert(id, TrackedJob {
            name,
            group,
            handle,
        });
        id
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of the tracked jobs, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().values().map(|job| job.name.clone()).collect();
        names.sort();
        names
    }

    /// Cancels and awaits every job spawned in `group`. Returns how many
    /// were tracked.
    pub async fn cancel_group(&self, group: &str) -> usize {
        let selected: Vec<TrackedJob> = {
            let mut jobs = self.inner.lock();
            let ids: Vec<JobId> = jobs
                .iter()
                .filter(|(_, job)| job.group.as_deref() == Some(group))
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| jobs.remove(id)).collect()
        };
        let count = selected.len();
        info!(group, jobs = count, "cancelling background job group");
        self.cancel_all(selected).await;
        count
    }

    /// Cancels and awaits every tracked job, including jobs spawned while
    /// the sweep is running. Returns once the tracked set is empty.
    pub async fn shutdown(&self) {
        self.inner.sweeping.store(true, Ordering::SeqCst);
        let mut round = 0usize;
        loop {
            let snapshot: Vec<TrackedJob> =
                self.inner.lock().drain().map(|(_, job)| job).collect();
            if snapshot.is_empty() {
                break;
            }
            round += 1;
            info!(jobs = snapshot.len(), round, "cancelling background jobs");
            self.cancel_all(snapshot).await;
        }
        self.inner.sweeping.store(false, Ordering::SeqCst);

        // jobs that finished between the last snapshot and the flag reset
        // skipped their own removal
        self.inner.lock().retain(|_, job| !job.handle.is_finished());
    }

    async fn cancel_all(&self, jobs: Vec<TrackedJob>) {
        for job in &jobs {
            job.handle.abort();
        }
        for TrackedJob { name, handle, .. } in jobs {
            match tokio::time::timeout(self.cancel_timeout, handle).await {
                Ok(Ok(())) => debug!(job = %name, "background job completed before cancellation"),
                Ok(Err(err)) if err.is_cancelled() => debug!(job = %name, "background job cancelled"),
                Ok(Err(err)) => warn!(job = %name, error = %err, "background job ended abnormally"),
                Err(_) => warn!(
                    job = %name,
                    timeout_secs = self.cancel_timeout.as_secs_f64(),
                    "background job did not stop in time, abandoning"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tracing_test::traced_test;

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn finished_jobs_remove_themselves() {
        let jobs = BackgroundJobSupervisor::default();
        jobs.spawn("quick", async { anyhow::Ok(()) });
        tokio::time::timeout(Duration::from_secs(1), async {
            while !jobs.is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    #[traced_test]
    async fn failures_are_logged() {
        let jobs = BackgroundJobSupervisor::default();
        jobs.spawn("sync", async {
            Err::<(), _>(anyhow::anyhow!("upstream unavailable"))
        });
        tokio::time::timeout(Duration::from_secs(1), async {
            while !jobs.is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(logs_contain("background job failed"));
        assert!(logs_contain("upstream unavailable"));
    }

    #[tokio::test]
    async fn shutdown_cancels_everything() {
        let jobs = BackgroundJobSupervisor::default();
        let dropped = Arc::new(AtomicUsize::new(0));
        for name in ["a", "b", "c"] {
            let dropped = dropped.clone();
            jobs.spawn(name, async move {
                struct OnDrop(Arc<AtomicUsize>);
                impl Drop for OnDrop {
                    fn drop(&mut self) {
                        self.0.fetch_add(1, Ordering::SeqCst);
                    }
                }
                let _marker = OnDrop(dropped);
                std::future::pending::<()>().await;
                anyhow::Ok(())
            });
        }
        settle().await;
        assert_eq!(jobs.names(), vec!["a", "b", "c"]);

        jobs.shutdown().await;
        assert!(jobs.is_empty());
        assert_eq!(dropped.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancel_group_leaves_other_groups_running() {
        let jobs = BackgroundJobSupervisor::default();
        jobs.spawn_in("bot-a", "poller", std::future::pending());
        jobs.spawn_in("bot-a", "reminders", std::future::pending());
        jobs.spawn_in("bot-b", "poller", std::future::pending());
        settle().await;

        assert_eq!(jobs.cancel_group("bot-a").await, 2);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs.cancel_group("bot-a").await, 0);
        jobs.shutdown().await;
        assert!(jobs.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn jobs_spawned_during_shutdown_are_cancelled() {
        let jobs = BackgroundJobSupervisor::new(Duration::from_secs(2));
        let started = Arc::new(AtomicBool::new(false));
        let flag = started.clone();
        jobs.spawn("slow", async move {
            flag.store(true, Ordering::SeqCst);
            // ignores the abort for a while, keeping the sweep busy
            std::thread::sleep(Duration::from_millis(200));
            anyhow::Ok(())
        });
        while !started.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }

        let sweep = tokio::spawn({
            let jobs = jobs.clone();
            async move { jobs.shutdown().await }
        });
        while jobs.names().iter().any(|name| name == "slow") {
            tokio::task::yield_now().await;
        }
        let late_dropped = Arc::new(AtomicBool::new(false));
        let marker = late_dropped.clone();
        jobs.spawn("late", async move {
            struct OnDrop(Arc<AtomicBool>);
            impl Drop for OnDrop {
                fn drop(&mut self) {
                    self.0.store(true, Ordering::SeqCst);
                }
            }
            let _marker = OnDrop(marker);
            std::future::pending::<()>().await;
            anyhow::Ok(())
        });
        jobs.spawn("late-quick", async { anyhow::Ok(()) });

        sweep.await.unwrap();
        assert!(jobs.is_empty(), "still tracked: {:?}", jobs.names());
        assert!(late_dropped.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[traced_test]
    async fn stubborn_job_is_abandoned_after_timeout() {
        let jobs = BackgroundJobSupervisor::new(Duration::from_millis(50));
        let started = Arc::new(AtomicBool::new(false));
        let flag = started.clone();
        jobs.spawn("blocking", async move {
            flag.store(true, Ordering::SeqCst);
            // never yields, so the abort can't land until it returns
            std::thread::sleep(Duration::from_millis(500));
            anyhow::Ok(())
        });
        while !started.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }

        let began = std::time::Instant::now();
        jobs.shutdown().await;
        assert!(began.elapsed() < Duration::from_millis(400));
        assert!(jobs.is_empty());
        assert!(logs_contain("abandoning"));
    }
}
