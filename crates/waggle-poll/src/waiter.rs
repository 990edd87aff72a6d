// Long-poll orchestration: check, register, re-check, wait, clean up.
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;
use waggle_common::ids::WaitRequestId;

use crate::config::WaitConfig;
use crate::registry::{wake_pair, Subject, SubscriptionRegistry, WakeHandle};
use crate::{PollError, Result};

/// Result of one poll call. An empty answer is a normal outcome, not an
/// error.
#[derive(Debug, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    Found(Vec<T>),
    TimedOut,
}

impl<T> WaitOutcome<T> {
    pub fn is_found(&self) -> bool {
        matches!(self, WaitOutcome::Found(_))
    }

    pub fn into_items(self) -> Vec<T> {
        match self {
            WaitOutcome::Found(items) => items,
            WaitOutcome::TimedOut => Vec::new(),
        }
    }
}

/// Block until `query` returns data for one of `subjects`, or the clamped
/// wait elapses.
///
/// The sequence is: query once (the common already-has-data case registers
/// nothing), register a wake handle under every subject, query again to
/// close the window where an event fired before the registration existed,
/// then block on the handle. Every exit path (data found, wake-up,
/// timeout, or cancellation of the calling task) removes the registration
/// before returning; a completed call leaves nothing behind in the
/// registry.
///
/// An empty `subjects` slice registers a single wildcard subscription.
/// `requested_wait` of zero means "check once, never block"; `None` uses
/// the configured default. The store and the event feed need not be
/// updated atomically: it is enough that a store write is eventually
/// followed by the matching notify.
pub async fn subscribe_and_wait<T, F, Fut>(
    registry: &SubscriptionRegistry,
    subjects: &[Subject],
    requested_wait: Option<Duration>,
    config: &WaitConfig,
    query: F,
) -> WaitOutcome<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Vec<T>>,
{
    let found = query().await;
    if !found.is_empty() {
        return WaitOutcome::Found(found);
    }
    let wait = config.clamp(requested_wait);
    if wait.is_zero() {
        return WaitOutcome::TimedOut;
    }

    let request_id = WaitRequestId::new();
    let (handle, signal) = wake_pair();
    let registration = Registration::new(registry, subjects, request_id, handle);
    debug!(request_id = %request_id, subjects = registration.subjects.len(), "waiting for change");

    // An event may have fired between the first query and the
    // registration; a second look closes that window.
    let found = query().await;
    if !found.is_empty() {
        drop(registration);
        return WaitOutcome::Found(found);
    }

    let woken = tokio::time::timeout(wait, signal.wait()).await.is_ok();
    debug!(request_id = %request_id, woken, "wait finished");
    drop(registration);

    let found = query().await;
    if found.is_empty() {
        WaitOutcome::TimedOut
    } else {
        WaitOutcome::Found(found)
    }
}

// Removes every inserted registration on drop, which is what makes the
// cleanup hold on cancellation as well as on normal return.
struct Registration<'a> {
    registry: &'a SubscriptionRegistry,
    subjects: Vec<Subject>,
    request_id: WaitRequestId,
}

impl<'a> Registration<'a> {
    fn new(
        registry: &'a SubscriptionRegistry,
        subjects: &[Subject],
        request_id: WaitRequestId,
        handle: WakeHandle,
    ) -> Self {
        let subjects = if subjects.is_empty() {
            vec![Subject::Any]
        } else {
            subjects.to_vec()
        };
        for subject in &subjects {
            registry.insert(*subject, request_id, handle.clone());
        }
        Self {
            registry,
            subjects,
            request_id,
        }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        for subject in &self.subjects {
            self.registry.remove(*subject, self.request_id);
        }
    }
}

/// Caps how many poll calls may be suspended at once.
///
/// Each admitted call holds one permit for its whole lifetime; when every
/// permit is taken, further calls are rejected immediately with
/// [`PollError::Saturated`] instead of piling up unbounded.
pub struct WaitPool {
    permits: Arc<Semaphore>,
}

impl WaitPool {
    pub fn new(max_waiters: usize) -> Result<Self> {
        if max_waiters == 0 {
            return Err(PollError::ZeroWaiters);
        }
        Ok(Self {
            permits: Arc::new(Semaphore::new(max_waiters)),
        })
    }

    pub fn from_config(config: &WaitConfig) -> Result<Self> {
        Self::new(config.max_waiters)
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// [`subscribe_and_wait`] behind the admission gate.
    pub async fn subscribe_and_wait<T, F, Fut>(
        &self,
        registry: &SubscriptionRegistry,
        subjects: &[Subject],
        requested_wait: Option<Duration>,
        config: &WaitConfig,
        query: F,
    ) -> Result<WaitOutcome<T>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Vec<T>>,
    {
        let Ok(_permit) = self.permits.try_acquire() else {
            debug!("wait pool saturated, rejecting poll call");
            return Err(PollError::Saturated);
        };
        Ok(subscribe_and_wait(registry, subjects, requested_wait, config, query).await)
    }
}
