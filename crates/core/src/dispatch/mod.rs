//! Request dispatch: memory fast path, per-key deduplication, pausable
//! background fetches and delivery to a single consumer.
//!
//! ```text
//! request(key, target)
//!   ├─ memory hit ───────────────────────────────► Ready(image)
//!   ├─ key in flight ── attach target ───────────► Joined
//!   └─ register, submit to WorkerPool ───────────► Scheduled
//!         task: pause gate → disk tier → Resolver → TieredCache::put
//!               → Delivery for every waiter → registry entry removed
//! ```
//!
//! A fetch task waits on the disk tier's readiness, so the cache must be
//! initialized ([`FetchDispatcher::init_cache`]) before fetches can finish
//! unless its disk tier is disabled. Cache operations run as pool control
//! tasks, so an init requested after a burst of fetches is never stuck
//! behind them.

mod delivery;
mod pause;
mod registry;

pub use delivery::{Delivery, DeliveryReceiver, DeliverySender, TargetId, Targets, delivery_channel};
pub use pause::PauseGate;
pub use registry::{DeliveryPolicy, InFlightRegistry, Registration, RegistryStats};

use crate::cache::TieredCache;
use crate::image::CachedImage;
use crate::pool::{PoolError, WorkerPool};
use async_trait::async_trait;
use registry::InFlightGuard;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Produces an image for a key that missed both cache tiers.
///
/// The lifecycle hooks run alongside the matching cache operation so that
/// any private state of the resolver follows the cache.
#[async_trait]
pub trait Resolver: Send + Sync + 'static {
    /// `None` on any failure.
    async fn resolve(&self, key: &str) -> Option<CachedImage>;

    async fn init(&self) {}

    async fn clear(&self) {}

    async fn flush(&self) {}

    async fn close(&self) {}
}

/// How a request relates to other requests for the same key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestMode {
    /// At most one fetch per key; later requests join it.
    #[default]
    Deduplicated,
    /// Always run a separate fetch for this target.
    Independent,
}

#[derive(Debug)]
pub enum RequestOutcome {
    /// Served from memory; no delivery follows.
    Ready(Arc<CachedImage>),
    /// A fetch was scheduled; a [`Delivery`] follows.
    Scheduled,
    /// Attached to a running fetch; a [`Delivery`] follows.
    Joined,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("INVALID_INPUT: empty key")]
    EmptyKey,

    #[error("REJECTED: {0}")]
    Rejected(#[from] PoolError),
}

/// Cache-wide operation run on the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheOp {
    Init,
    Clear,
    Flush,
    Close,
}

/// Resolves when a submitted cache operation has finished.
#[derive(Debug)]
pub struct Completion(oneshot::Receiver<()>);

impl Completion {
    /// `false` if the operation was dropped before finishing.
    pub async fn wait(self) -> bool {
        self.0.await.is_ok()
    }
}

struct Inner {
    cache: Arc<TieredCache>,
    pool: WorkerPool,
    resolver: Arc<dyn Resolver>,
    registry: Arc<InFlightRegistry>,
    pause: PauseGate,
    deliveries: DeliverySender,
    mode: RequestMode,
    policy: DeliveryPolicy,
}

/// Front door for image requests. Cheap to clone.
#[derive(Clone)]
pub struct FetchDispatcher {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for FetchDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchDispatcher")
            .field("mode", &self.inner.mode)
            .field("policy", &self.inner.policy)
            .field("in_flight", &self.inner.registry.len())
            .field("paused", &self.inner.pause.is_paused())
            .finish()
    }
}

/// Builder for [`FetchDispatcher`].
pub struct DispatcherBuilder {
    cache: Arc<TieredCache>,
    pool: WorkerPool,
    resolver: Arc<dyn Resolver>,
    deliveries: DeliverySender,
    mode: RequestMode,
    policy: DeliveryPolicy,
}

impl DispatcherBuilder {
    /// Default mode of [`FetchDispatcher::request`].
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn delivery_policy(mut self, policy: DeliveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> FetchDispatcher {
        FetchDispatcher {
            inner: Arc::new(Inner {
                cache: self.cache,
                pool: self.pool,
                resolver: self.resolver,
                registry: Arc::new(InFlightRegistry::new()),
                pause: PauseGate::new(),
                deliveries: self.deliveries,
                mode: self.mode,
                policy: self.policy,
            }),
        }
    }
}

impl FetchDispatcher {
    pub fn builder(
        cache: Arc<TieredCache>,
        pool: WorkerPool,
        resolver: Arc<dyn Resolver>,
        deliveries: DeliverySender,
    ) -> DispatcherBuilder {
        DispatcherBuilder {
            cache,
            pool,
            resolver,
            deliveries,
            mode: RequestMode::default(),
            policy: DeliveryPolicy::default(),
        }
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.inner.cache
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    /// Request `key` for `target` with the dispatcher's default mode.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::EmptyKey` for an empty key and
    /// `DispatchError::Rejected` when the pool refuses the fetch.
    pub fn request(&self, key: &str, target: TargetId) -> Result<RequestOutcome, DispatchError> {
        self.request_with(key, target, self.inner.mode)
    }

    pub fn request_with(&self, key: &str, target: TargetId, mode: RequestMode) -> Result<RequestOutcome, DispatchError> {
        if key.is_empty() {
            return Err(DispatchError::EmptyKey);
        }
        if let Some(image) = self.inner.cache.get_memory(key) {
            return Ok(RequestOutcome::Ready(image));
        }

        match mode {
            RequestMode::Deduplicated => self.schedule_deduplicated(key, target),
            RequestMode::Independent => {
                let inner = self.inner.clone();
                let key = key.to_string();
                let deliveries = inner.deliveries.clone();
                self.inner.pool.submit(async move {
                    let guard = InFlightGuard::single(target, key, deliveries);
                    inner.fetch(guard).await;
                })?;
                Ok(RequestOutcome::Scheduled)
            }
        }
    }

    fn schedule_deduplicated(&self, key: &str, target: TargetId) -> Result<RequestOutcome, DispatchError> {
        let inner = &self.inner;
        if inner.registry.register(key, target) == Registration::Joined {
            return Ok(RequestOutcome::Joined);
        }

        let task_inner = inner.clone();
        let task_key = key.to_string();
        let submitted = inner.pool.submit(async move {
            let guard = InFlightGuard::registered(
                task_inner.registry.clone(),
                task_key,
                task_inner.deliveries.clone(),
                task_inner.policy,
            );
            task_inner.fetch(guard).await;
        });

        if let Err(e) = submitted {
            // targets that joined before the rejection still get an answer
            for waiter in inner.registry.take(key).into_iter().filter(|waiter| *waiter != target) {
                delivery::send(&inner.deliveries, waiter, key, None);
            }
            return Err(DispatchError::Rejected(e));
        }
        Ok(RequestOutcome::Scheduled)
    }

    /// Hold started fetches before they touch the disk tier or network.
    pub fn pause(&self) {
        self.inner.pause.pause();
    }

    pub fn resume(&self) {
        self.inner.pause.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.pause.is_paused()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn registry_stats(&self) -> RegistryStats {
        self.inner.registry.stats()
    }

    pub fn init_cache(&self) -> Result<Completion, DispatchError> {
        self.submit_op(CacheOp::Init)
    }

    pub fn clear_cache(&self) -> Result<Completion, DispatchError> {
        self.submit_op(CacheOp::Clear)
    }

    pub fn flush_cache(&self) -> Result<Completion, DispatchError> {
        self.submit_op(CacheOp::Flush)
    }

    pub fn close_cache(&self) -> Result<Completion, DispatchError> {
        self.submit_op(CacheOp::Close)
    }

    fn submit_op(&self, op: CacheOp) -> Result<Completion, DispatchError> {
        let inner = self.inner.clone();
        let (done, completion) = oneshot::channel();
        self.inner.pool.spawn_control(async move {
            inner.run_op(op).await;
            let _ = done.send(());
        })?;
        Ok(Completion(completion))
    }
}

impl Inner {
    async fn fetch(&self, guard: InFlightGuard) {
        let image = self.load(guard.key()).await;
        guard.finish(image);
    }

    async fn load(&self, key: &str) -> Option<Arc<CachedImage>> {
        self.pause.wait_resumed().await;

        if let Some(image) = self.cache.get_persistent(key).await {
            self.cache.insert_memory(key, image.clone());
            return Some(image);
        }

        match self.resolver.resolve(key).await {
            Some(image) => {
                let image = Arc::new(image);
                self.cache.put(key, image.clone()).await;
                Some(image)
            }
            None => {
                tracing::debug!(key, "Fetch produced no image");
                None
            }
        }
    }

    async fn run_op(&self, op: CacheOp) {
        match op {
            CacheOp::Init => {
                self.cache.init_persistent_tier().await;
                self.resolver.init().await;
            }
            CacheOp::Clear => {
                self.cache.evict_all().await;
                self.resolver.clear().await;
            }
            CacheOp::Flush => {
                self.cache.flush().await;
                self.resolver.flush().await;
            }
            CacheOp::Close => {
                self.cache.close().await;
                self.resolver.close().await;
            }
        }
        tracing::debug!(?op, "Cache operation finished");
    }
}
