// Subject-keyed waiter registry with a wildcard bucket.
use ahash::RandomState;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;
use tokio::sync::oneshot;
use waggle_common::ids::{DeviceId, WaitRequestId};

const SHARD_COUNT: usize = 16;

/// What a waiter is interested in: one device, or any change at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subject {
    Device(DeviceId),
    Any,
}

/// Advisory wake-up payload: which subject changed. Waiters re-validate
/// against the authoritative store, so this is a hint, not data.
#[derive(Debug, Clone, Copy)]
pub struct WakeHint {
    pub subject: DeviceId,
}

/// Fire-at-most-once completion handle.
///
/// Clones share the underlying slot: a multi-key registration hands one
/// handle to several buckets, and whichever bucket fires first consumes it.
#[derive(Clone)]
pub struct WakeHandle {
    slot: Arc<Mutex<Option<oneshot::Sender<WakeHint>>>>,
}

impl WakeHandle {
    /// Returns true if this call actually delivered the wake-up.
    pub fn fire(&self, hint: WakeHint) -> bool {
        let Some(sender) = self.slot.lock().take() else {
            return false;
        };
        // The receiver may already be gone (waiter timed out); that is a
        // normal race, not an error.
        sender.send(hint).is_ok()
    }

    pub fn fired(&self) -> bool {
        self.slot.lock().is_none()
    }
}

/// Receiver half held by the waiter while it blocks.
pub struct WakeSignal {
    rx: oneshot::Receiver<WakeHint>,
}

impl WakeSignal {
    // Resolves on fire; `None` if every handle clone was dropped unfired.
    pub async fn wait(self) -> Option<WakeHint> {
        self.rx.await.ok()
    }
}

pub fn wake_pair() -> (WakeHandle, WakeSignal) {
    let (tx, rx) = oneshot::channel();
    (
        WakeHandle {
            slot: Arc::new(Mutex::new(Some(tx))),
        },
        WakeSignal { rx },
    )
}

type Bucket = HashMap<WaitRequestId, WakeHandle, RandomState>;

#[derive(Default)]
struct Shard {
    buckets: Mutex<HashMap<DeviceId, Bucket, RandomState>>,
}

/// Concurrent multi-map from subject to pending waiters.
///
/// Subject buckets live in hash-selected shards, so operations on
/// different devices do not contend; the wildcard bucket is shared and
/// drained by every notification. `notify` removes the subscriptions it
/// wakes, and `remove` is idempotent, so the registry and the waiter can
/// both clean up the same registration without coordination.
pub struct SubscriptionRegistry {
    shards: Vec<Shard>,
    wildcard: Mutex<Bucket>,
    hasher: RandomState,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Shard::default()).collect(),
            wildcard: Mutex::new(Bucket::default()),
            hasher: RandomState::new(),
        }
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, subject: Subject, request_id: WaitRequestId, handle: WakeHandle) {
        match subject {
            Subject::Any => {
                self.wildcard.lock().insert(request_id, handle);
            }
            Subject::Device(device) => {
                let mut buckets = self.shard(&device).buckets.lock();
                buckets.entry(device).or_default().insert(request_id, handle);
            }
        }
    }

    /// Idempotent: removing an absent (or already-fired) registration is a
    /// no-op. Returns whether an entry was removed.
    pub fn remove(&self, subject: Subject, request_id: WaitRequestId) -> bool {
        match subject {
            Subject::Any => self.wildcard.lock().remove(&request_id).is_some(),
            Subject::Device(device) => {
                let mut buckets = self.shard(&device).buckets.lock();
                let Some(bucket) = buckets.get_mut(&device) else {
                    return false;
                };
                let removed = bucket.remove(&request_id).is_some();
                if bucket.is_empty() {
                    buckets.remove(&device);
                }
                removed
            }
        }
    }

    /// Wake everyone registered for `subject`, plus every wildcard waiter.
    ///
    /// The matched buckets are drained under their locks, then the handles
    /// are fired with the locks released. Returns the number of waiters
    /// actually woken.
    pub fn notify(&self, subject: DeviceId) -> usize {
        let mut matched: Vec<WakeHandle> = Vec::new();
        {
            let mut buckets = self.shard(&subject).buckets.lock();
            if let Some(bucket) = buckets.remove(&subject) {
                matched.extend(bucket.into_values());
            }
        }
        {
            let mut wildcard = self.wildcard.lock();
            matched.extend(wildcard.drain().map(|(_, handle)| handle));
        }
        let hint = WakeHint { subject };
        let mut woken = 0;
        for handle in matched {
            if handle.fire(hint) {
                woken += 1;
            }
        }
        woken
    }

    /// Total pending registrations across all buckets.
    pub fn subscription_count(&self) -> usize {
        let mut count = self.wildcard.lock().len();
        for shard in &self.shards {
            count += shard
                .buckets
                .lock()
                .values()
                .map(|bucket| bucket.len())
                .sum::<usize>();
        }
        count
    }

    fn shard(&self, device: &DeviceId) -> &Shard {
        let mut hasher = self.hasher.build_hasher();
        device.hash(&mut hasher);
        &self.shards[(hasher.finish() % SHARD_COUNT as u64) as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notify_wakes_subject_waiter() {
        let registry = SubscriptionRegistry::new();
        let device = DeviceId::new();
        let (handle, signal) = wake_pair();
        registry.insert(Subject::Device(device), WaitRequestId::new(), handle);

        assert_eq!(registry.notify(device), 1);
        let hint = signal.wait().await.expect("woken");
        assert_eq!(hint.subject, device);
        assert_eq!(registry.subscription_count(), 0);
    }

    #[tokio::test]
    async fn notify_wakes_wildcard_waiter_for_any_subject() {
        let registry = SubscriptionRegistry::new();
        let (handle, signal) = wake_pair();
        registry.insert(Subject::Any, WaitRequestId::new(), handle);

        assert_eq!(registry.notify(DeviceId::new()), 1);
        assert!(signal.wait().await.is_some());
    }

    #[tokio::test]
    async fn notify_wakes_subject_and_wildcard_together() {
        let registry = SubscriptionRegistry::new();
        let device = DeviceId::new();
        let (subject_handle, subject_signal) = wake_pair();
        let (wildcard_handle, wildcard_signal) = wake_pair();
        registry.insert(Subject::Device(device), WaitRequestId::new(), subject_handle);
        registry.insert(Subject::Any, WaitRequestId::new(), wildcard_handle);

        assert_eq!(registry.notify(device), 2);
        assert!(subject_signal.wait().await.is_some());
        assert!(wildcard_signal.wait().await.is_some());
    }

    #[test]
    fn notify_ignores_other_subjects() {
        let registry = SubscriptionRegistry::new();
        let watched = DeviceId::new();
        let (handle, _signal) = wake_pair();
        registry.insert(Subject::Device(watched), WaitRequestId::new(), handle);

        assert_eq!(registry.notify(DeviceId::new()), 0);
        assert_eq!(registry.subscription_count(), 1);
    }

    #[test]
    fn notify_drains_fired_registrations() {
        let registry = SubscriptionRegistry::new();
        let device = DeviceId::new();
        let (handle, _signal) = wake_pair();
        registry.insert(Subject::Device(device), WaitRequestId::new(), handle);

        assert_eq!(registry.notify(device), 1);
        // Second event for the same subject finds nobody waiting.
        assert_eq!(registry.notify(device), 0);
    }

    #[test]
    fn remove_is_idempotent_from_either_side() {
        let registry = SubscriptionRegistry::new();
        let device = DeviceId::new();
        let request_id = WaitRequestId::new();
        let (handle, _signal) = wake_pair();
        registry.insert(Subject::Device(device), request_id, handle);

        assert!(registry.remove(Subject::Device(device), request_id));
        assert!(!registry.remove(Subject::Device(device), request_id));

        // Removing after a notify already drained the bucket is also a no-op.
        let request_id = WaitRequestId::new();
        let (handle, _signal) = wake_pair();
        registry.insert(Subject::Device(device), request_id, handle);
        registry.notify(device);
        assert!(!registry.remove(Subject::Device(device), request_id));
        assert_eq!(registry.subscription_count(), 0);
    }

    #[tokio::test]
    async fn shared_handle_fires_at_most_once() {
        let registry = SubscriptionRegistry::new();
        let first = DeviceId::new();
        let second = DeviceId::new();
        let request_id = WaitRequestId::new();
        let (handle, signal) = wake_pair();
        registry.insert(Subject::Device(first), request_id, handle.clone());
        registry.insert(Subject::Device(second), request_id, handle.clone());

        assert_eq!(registry.notify(first), 1);
        assert!(handle.fired());
        // The other bucket still holds its entry, but firing it is a no-op.
        assert_eq!(registry.notify(second), 0);
        let hint = signal.wait().await.expect("woken once");
        assert_eq!(hint.subject, first);
    }

    #[test]
    fn fire_after_receiver_dropped_reports_no_wake() {
        let (handle, signal) = wake_pair();
        drop(signal);
        assert!(!handle.fire(WakeHint {
            subject: DeviceId::new(),
        }));
        assert!(handle.fired());
    }

    #[test]
    fn distinct_requests_on_one_subject_all_wake() {
        let registry = SubscriptionRegistry::new();
        let device = DeviceId::new();
        let signals: Vec<WakeSignal> = (0..3)
            .map(|_| {
                let (handle, signal) = wake_pair();
                registry.insert(Subject::Device(device), WaitRequestId::new(), handle);
                signal
            })
            .collect();

        assert_eq!(registry.notify(device), signals.len());
        assert_eq!(registry.subscription_count(), 0);
    }
}
