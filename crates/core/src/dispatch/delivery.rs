//! Delivery of fetch results to the consumer context.
//!
//! Workers never touch targets. They send a [`Delivery`] naming a
//! [`TargetId`]; the consumer owns the targets in a [`Targets`] arena and
//! applies deliveries on its own task.

use crate::image::CachedImage;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Handle to a consumer-owned target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(u64);

impl TargetId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Outcome of one fetch for one target. `image` is `None` on any failure.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub target: TargetId,
    pub key: String,
    pub image: Option<Arc<CachedImage>>,
}

pub type DeliverySender = mpsc::UnboundedSender<Delivery>;
pub type DeliveryReceiver = mpsc::UnboundedReceiver<Delivery>;

pub fn delivery_channel() -> (DeliverySender, DeliveryReceiver) {
    mpsc::unbounded_channel()
}

/// Send one delivery; a dropped consumer only loses the result.
pub(crate) fn send(tx: &DeliverySender, target: TargetId, key: &str, image: Option<Arc<CachedImage>>) {
    let delivered = image.is_some();
    if tx.send(Delivery { target, key: key.to_string(), image }).is_err() {
        tracing::debug!(key, target = target.raw(), "Consumer gone, dropping delivery");
    } else {
        tracing::trace!(key, target = target.raw(), delivered, "Delivered fetch result");
    }
}

#[derive(Debug)]
struct Slot<T> {
    target: T,
    /// Key the target currently wants; results for other keys are stale.
    wanted: Option<String>,
}

/// Consumer-side arena of targets.
#[derive(Debug)]
pub struct Targets<T> {
    next: u64,
    slots: HashMap<TargetId, Slot<T>>,
}

impl<T> Default for Targets<T> {
    fn default() -> Self {
        Self { next: 0, slots: HashMap::new() }
    }
}

impl<T> Targets<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, target: T) -> TargetId {
        let id = TargetId(self.next);
        self.next += 1;
        self.slots.insert(id, Slot { target, wanted: None });
        id
    }

    /// Record that `id` now wants `key`; deliveries for any earlier key are
    /// ignored from here on.
    pub fn bind(&mut self, id: TargetId, key: impl Into<String>) -> bool {
        match self.slots.get_mut(&id) {
            Some(slot) => {
                slot.wanted = Some(key.into());
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: TargetId) -> Option<&T> {
        self.slots.get(&id).map(|slot| &slot.target)
    }

    pub fn get_mut(&mut self, id: TargetId) -> Option<&mut T> {
        self.slots.get_mut(&id).map(|slot| &mut slot.target)
    }

    /// Discard a target; later deliveries to it are no-ops.
    pub fn remove(&mut self, id: TargetId) -> Option<T> {
        self.slots.remove(&id).map(|slot| slot.target)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Hand `delivery` to its target. Returns `false` if the target was
    /// discarded or has been rebound to another key.
    pub fn apply<F>(&mut self, delivery: Delivery, f: F) -> bool
    where
        F: FnOnce(&mut T, Option<Arc<CachedImage>>),
    {
        let Some(slot) = self.slots.get_mut(&delivery.target) else {
            return false;
        };
        if slot.wanted.as_deref().is_some_and(|wanted| wanted != delivery.key) {
            tracing::trace!(key = %delivery.key, "Ignoring stale delivery");
            return false;
        }
        f(&mut slot.target, delivery.image);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::fixtures::solid;

    fn delivery(target: TargetId, key: &str, with_image: bool) -> Delivery {
        Delivery {
            target,
            key: key.to_string(),
            image: with_image.then(|| Arc::new(solid(1, 1, [0, 0, 0, 255]))),
        }
    }

    #[test]
    fn test_apply_to_live_target() {
        let mut targets = Targets::new();
        let id = targets.insert(None);

        assert!(targets.apply(delivery(id, "a", true), |slot, image| *slot = image));
        assert!(targets.get(id).unwrap().is_some());
    }

    #[test]
    fn test_apply_to_discarded_target_is_noop() {
        let mut targets: Targets<Vec<String>> = Targets::new();
        let id = targets.insert(Vec::new());
        targets.remove(id);

        let mut called = false;
        assert!(!targets.apply(delivery(id, "a", true), |_, _| called = true));
        assert!(!called);
    }

    #[test]
    fn test_rebound_target_ignores_stale_key() {
        let mut targets = Targets::new();
        let id = targets.insert(0u32);
        targets.bind(id, "old");
        targets.bind(id, "new");

        assert!(!targets.apply(delivery(id, "old", true), |n, _| *n += 1));
        assert!(targets.apply(delivery(id, "new", false), |n, _| *n += 1));
        assert_eq!(targets.get(id), Some(&1));
    }

    #[test]
    fn test_ids_are_unique() {
        let mut targets = Targets::new();
        let a = targets.insert(());
        targets.remove(a);
        let b = targets.insert(());
        assert_ne!(a, b);
        assert_eq!(targets.len(), 1);
    }

    #[tokio::test]
    async fn test_send_after_consumer_dropped() {
        let (tx, rx) = delivery_channel();
        drop(rx);
        send(&tx, TargetId::new(1), "a", None);
    }
}
