//! In-flight fetch tracking.
//!
//! The first request for a key registers it and schedules the fetch; later
//! requests for the same key only attach their target. Completion takes the
//! waiting targets out of the map in one step, so a request arriving after
//! that schedules a fresh fetch.

use super::delivery::{self, DeliverySender, TargetId};
use crate::image::CachedImage;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Which of the attached targets receive a deduplicated result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPolicy {
    /// Every attached target, in the order they attached.
    #[default]
    AllWaiters,
    /// Only the most recently attached target.
    LatestWaiter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The key was not in flight; the caller must schedule the fetch.
    New,
    /// A fetch is already running; the target will receive its result.
    Joined,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total_requests: u64,
    pub joined_requests: u64,
    pub new_requests: u64,
}

#[derive(Debug, Default)]
struct Inner {
    waiters: HashMap<String, Vec<TargetId>>,
    stats: RegistryStats,
}

/// Keys with a scheduled or running fetch, and who is waiting on each.
#[derive(Debug, Default)]
pub struct InFlightRegistry {
    inner: Mutex<Inner>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `target` for `key` in a single critical section.
    pub fn register(&self, key: &str, target: TargetId) -> Registration {
        let mut inner = self.inner.lock();
        inner.stats.total_requests += 1;

        if let Some(waiters) = inner.waiters.get_mut(key) {
            waiters.push(target);
            let attached = waiters.len();
            inner.stats.joined_requests += 1;
            tracing::debug!(key, attached, "Joined in-flight fetch");
            Registration::Joined
        } else {
            inner.waiters.insert(key.to_string(), vec![target]);
            inner.stats.new_requests += 1;
            tracing::debug!(key, in_flight = inner.waiters.len(), "New fetch");
            Registration::New
        }
    }

    /// Remove `key`, returning its waiters in attach order.
    pub fn take(&self, key: &str) -> Vec<TargetId> {
        self.inner.lock().waiters.remove(key).unwrap_or_default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().waiters.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RegistryStats {
        self.inner.lock().stats
    }
}

/// Where a fetch task finds the targets to deliver to.
#[derive(Debug)]
enum Waiters {
    Registered(Arc<InFlightRegistry>),
    Single(TargetId),
}

/// Delivers the task's outcome exactly once.
///
/// Dropping the guard without [`finish`](Self::finish), as happens when the
/// task panics, delivers a failure and clears the registry entry.
#[derive(Debug)]
pub(crate) struct InFlightGuard {
    key: String,
    waiters: Waiters,
    deliveries: DeliverySender,
    policy: DeliveryPolicy,
    done: bool,
}

impl InFlightGuard {
    pub(crate) fn registered(
        registry: Arc<InFlightRegistry>,
        key: String,
        deliveries: DeliverySender,
        policy: DeliveryPolicy,
    ) -> Self {
        Self { key, waiters: Waiters::Registered(registry), deliveries, policy, done: false }
    }

    pub(crate) fn single(target: TargetId, key: String, deliveries: DeliverySender) -> Self {
        Self { key, waiters: Waiters::Single(target), deliveries, policy: DeliveryPolicy::AllWaiters, done: false }
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn finish(mut self, image: Option<Arc<CachedImage>>) {
        self.deliver(image);
    }

    fn deliver(&mut self, image: Option<Arc<CachedImage>>) {
        if self.done {
            return;
        }
        self.done = true;

        let mut targets = match &self.waiters {
            Waiters::Registered(registry) => registry.take(&self.key),
            Waiters::Single(target) => vec![*target],
        };
        if self.policy == DeliveryPolicy::LatestWaiter {
            targets = targets.pop().into_iter().collect();
        }

        for target in targets {
            delivery::send(&self.deliveries, target, &self.key, image.clone());
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if !self.done {
            tracing::warn!(key = %self.key, "Fetch task ended without a result");
            self.deliver(None);
        }
    }
}
