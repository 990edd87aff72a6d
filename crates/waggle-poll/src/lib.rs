// Long-poll wait core: subscription registry, wake handles, and the
// subscribe/re-check/wait/cleanup orchestration used by polling endpoints.
//
// The registry never inspects payloads; it only fans a "subject changed"
// hint out to whoever registered interest. Waiters re-validate against the
// authoritative query on every wake-up, so a spurious or duplicate wake is
// harmless.

pub mod config;

mod hub;
mod registry;
mod relay;
mod waiter;

pub use config::WaitConfig;
pub use hub::{Feed, SubscriptionHub};
pub use registry::{wake_pair, Subject, SubscriptionRegistry, WakeHandle, WakeHint, WakeSignal};
pub use relay::{publish_change, EventRelay, DEFAULT_EVENT_TOPIC};
pub use waiter::{subscribe_and_wait, WaitOutcome, WaitPool};

pub type Result<T> = std::result::Result<T, PollError>;

#[derive(thiserror::Error, Debug)]
pub enum PollError {
    #[error("transport error: {0}")]
    Transport(#[from] waggle_transport::TransportError),
    #[error("wire error: {0}")]
    Wire(#[from] waggle_wire::Error),
    #[error("unknown feed: {0}")]
    UnknownFeed(String),
    // The wait pool is at capacity; the caller should surface this as an
    // overload response rather than queue indefinitely.
    #[error("too many concurrent poll calls")]
    Saturated,
    #[error("wait pool capacity must be non-zero")]
    ZeroWaiters,
}
