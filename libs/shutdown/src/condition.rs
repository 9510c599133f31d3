use std::{
    collections::BTreeMap,
    fmt,
    future::Future,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::debug;

/// A readiness predicate consulted while the service drains.
#[async_trait]
pub trait ShutdownCondition: Send + Sync {
    fn description(&self) -> String;

    /// `true` once this condition no longer holds shutdown back.
    async fn is_ready(&self) -> bool;
}

type ReadyFn = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

/// Condition backed by an async closure.
pub struct FnCondition {
    description: String,
    predicate: ReadyFn,
}

impl FnCondition {
    pub fn new<F, Fut>(description: impl Into<String>, predicate: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        Self {
            description: description.into(),
            predicate: Arc::new(move || Box::pin(predicate())),
        }
    }
}

#[async_trait]
impl ShutdownCondition for FnCondition {
    fn description(&self) -> String {
        self.description.clone()
    }

    async fn is_ready(&self) -> bool {
        (self.predicate)().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConditionId(u64);

#[derive(Default)]
struct RegistryInner {
    next_id: AtomicU64,
    conditions: Mutex<BTreeMap<ConditionId, Arc<dyn ShutdownCondition>>>,
}

/// Explicit set of shutdown conditions. Cloning shares the same set.
#[derive(Clone, Default)]
pub struct ShutdownRegistry {
    inner: Arc<RegistryInner>,
}

impl ShutdownRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, condition: Arc<dyn ShutdownCondition>) -> ConditionId {
        let id = ConditionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(condition = %condition.description(), "shutdown condition registered");
        self.lock().insert(id, condition);
        id
    }

    pub fn register_fn<F, Fut>(&self, description: impl Into<String>, predicate: F) -> ConditionId
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.register(Arc::new(FnCondition::new(description, predicate)))
    }

    /// Returns whether the id was registered.
    pub fn deregister(&self, id: ConditionId) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current conditions, in registration order. Callers
    /// iterate the copy, so registration during evaluation is safe.
    pub fn snapshot(&self) -> Vec<Arc<dyn ShutdownCondition>> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<ConditionId, Arc<dyn ShutdownCondition>>> {
        // a poisoned map is still structurally valid
        self.inner
            .conditions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for ShutdownRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownRegistry")
            .field("conditions", &self.len())
            .finish()
    }
}

struct PreventState {
    reason: String,
    preventing: AtomicBool,
}

#[async_trait]
impl ShutdownCondition for PreventState {
    fn description(&self) -> String {
        format!("PreventShutdown({:?})", self.reason)
    }

    async fn is_ready(&self) -> bool {
        !self.preventing.load(Ordering::SeqCst)
    }
}

/// Holds shutdown back while a critical section is open.
///
/// ```ignore
/// let flush = PreventShutdown::new(&registry, "flushing batched writes");
/// loop {
///     flush.run(write_batch()).await?;
///     let _idle = flush.allow_shutdown();
///     tokio::time::sleep(Duration::from_secs(10)).await;
/// }
/// ```
///
/// The condition is deregistered when this value is dropped.
pub struct PreventShutdown {
    state: Arc<PreventState>,
    registry: ShutdownRegistry,
    id: ConditionId,
}

impl PreventShutdown {
    pub fn new(registry: &ShutdownRegistry, reason: impl Into<String>) -> Self {
        let state = Arc::new(PreventState {
            reason: reason.into(),
            preventing: AtomicBool::new(false),
        });
        let id = registry.register(state.clone());
        Self {
            state,
            registry: registry.clone(),
            id,
        }
    }

    pub fn reason(&self) -> &str {
        &self.state.reason
    }

    pub fn is_preventing(&self) -> bool {
        self.state.preventing.load(Ordering::SeqCst)
    }

    /// Blocks shutdown until the guard is dropped.
    pub fn hold(&self) -> HoldGuard<'_> {
        debug!(reason = %self.state.reason, "entering shutdown prevention");
        self.state.preventing.store(true, Ordering::SeqCst);
        HoldGuard { owner: self }
    }

    /// Lifts the prevention until the guard is dropped, then restores
    /// whatever was in effect before.
    pub fn allow_shutdown(&self) -> AllowGuard<'_> {
        let initial = self.state.preventing.swap(false, Ordering::SeqCst);
        debug!(reason = %self.state.reason, initial, "allowing shutdown temporarily");
        AllowGuard {
            owner: self,
            initial,
        }
    }

    /// Runs `fut` with shutdown held back for its whole duration.
    pub async fn run<F: Future>(&self, fut: F) -> F::Output {
        let _hold = self.hold();
        fut.await
    }
}

impl Drop for PreventShutdown {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
    }
}

impl fmt::Debug for PreventShutdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreventShutdown")
            .field("reason", &self.state.reason)
            .field("preventing", &self.is_preventing())
            .finish()
    }
}

#[must_use = "shutdown is only held while the guard is alive"]
pub struct HoldGuard<'a> {
    owner: &'a PreventShutdown,
}

impl Drop for HoldGuard<'_> {
    fn drop(&mut self) {
        debug!(reason = %self.owner.state.reason, "leaving shutdown prevention");
        self.owner.state.preventing.store(false, Ordering::SeqCst);
    }
}

#[must_use = "shutdown is only allowed while the guard is alive"]
pub struct AllowGuard<'a> {
    owner: &'a PreventShutdown,
    initial: bool,
}

impl Drop for AllowGuard<'_> {
    fn drop(&mut self) {
        self.owner
            .state
            .preventing
            .store(self.initial, Ordering::SeqCst);
    }
}
