// Bridges the change-event topic onto the in-process registries.
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;
use waggle_common::ids::DeviceId;
use waggle_transport::{Transport, TransportConsumer, TransportError};
use waggle_wire::Message;

use crate::hub::{Feed, SubscriptionHub};
use crate::Result;

pub const DEFAULT_EVENT_TOPIC: &str = "change_events";

/// Consumes `Message::Change` events and notifies the matching feed's
/// registry. Every relay joins the event topic under its own consumer
/// group, so each process observes the full change stream.
///
/// A store write anywhere in the platform is followed by a change event on
/// this topic; that ordering (write, then event) is all the waiters need.
pub struct EventRelay {
    consumer: Arc<dyn TransportConsumer>,
    task: JoinHandle<()>,
}

impl EventRelay {
    pub async fn start(
        transport: Arc<dyn Transport>,
        topic: &str,
        hub: Arc<SubscriptionHub>,
    ) -> Result<Self> {
        let group = format!("poll-relay-{}", Uuid::new_v4());
        let consumer = transport.consumer(topic, &group).await?;
        let task = tokio::spawn(run_relay(Arc::clone(&consumer), hub));
        Ok(Self { consumer, task })
    }

    pub async fn shutdown(self) {
        self.consumer.wakeup();
        let _ = self.task.await;
    }
}

async fn run_relay(consumer: Arc<dyn TransportConsumer>, hub: Arc<SubscriptionHub>) {
    debug!("event relay started");
    loop {
        match consumer.poll().await {
            Ok(batch) => {
                for delivery in batch {
                    match Message::decode(&delivery.payload) {
                        Ok(Message::Change { feed, subject }) => {
                            let Ok(feed) = feed.parse::<Feed>() else {
                                warn!(feed = %feed, "change event for unknown feed");
                                continue;
                            };
                            let Ok(subject) = subject.parse::<DeviceId>() else {
                                warn!(subject = %subject, "change event with invalid subject");
                                continue;
                            };
                            let woken = hub.registry(feed).notify(subject);
                            debug!(feed = %feed, subject = %subject, woken, "change event relayed");
                        }
                        Ok(_) => {
                            debug!("ignoring non-change message on event topic");
                        }
                        Err(err) => {
                            warn!(error = %err, "dropping undecodable change event");
                        }
                    }
                }
            }
            Err(TransportError::Wakeup) => break,
            Err(err) => {
                warn!(error = %err, "event relay stopped");
                break;
            }
        }
    }
    debug!("event relay exited");
}

/// Publish a change event for `subject` on `feed`. Store writers call this
/// after committing, keyed by subject so events for one device stay
/// ordered.
pub async fn publish_change(
    transport: &dyn Transport,
    topic: &str,
    feed: Feed,
    subject: DeviceId,
) -> Result<()> {
    let payload = Message::Change {
        feed: feed.as_str().to_string(),
        subject: subject.to_string(),
    }
    .encode()?;
    transport.publish(topic, &subject.to_string(), payload).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WaitConfig;
    use crate::registry::Subject;
    use crate::waiter::{subscribe_and_wait, WaitOutcome};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::time::Duration;
    use waggle_transport::LogTransport;

    #[tokio::test]
    async fn change_event_wakes_a_blocked_waiter() {
        let transport: Arc<dyn Transport> = Arc::new(LogTransport::new());
        let hub = Arc::new(SubscriptionHub::new());
        let relay = EventRelay::start(Arc::clone(&transport), DEFAULT_EVENT_TOPIC, Arc::clone(&hub))
            .await
            .expect("relay");

        let device = DeviceId::new();
        let store: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let writer = {
            let transport = Arc::clone(&transport);
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                store.lock().push("notified");
                publish_change(
                    transport.as_ref(),
                    DEFAULT_EVENT_TOPIC,
                    Feed::Notifications,
                    device,
                )
                .await
                .expect("publish change");
            })
        };

        let outcome = subscribe_and_wait(
            hub.notifications(),
            &[Subject::Device(device)],
            Some(Duration::from_secs(5)),
            &WaitConfig::default(),
            || async { store.lock().clone() },
        )
        .await;

        writer.await.expect("writer");
        assert_eq!(outcome, WaitOutcome::Found(vec!["notified"]));
        assert_eq!(hub.notifications().subscription_count(), 0);

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_events_do_not_stop_the_relay() {
        let transport: Arc<dyn Transport> = Arc::new(LogTransport::new());
        let hub = Arc::new(SubscriptionHub::new());
        let relay = EventRelay::start(Arc::clone(&transport), DEFAULT_EVENT_TOPIC, Arc::clone(&hub))
            .await
            .expect("relay");

        transport
            .publish(
                DEFAULT_EVENT_TOPIC,
                "junk",
                Bytes::from_static(b"{not a change event"),
            )
            .await
            .expect("publish");
        // Unknown feed and invalid subject are dropped the same way.
        transport
            .publish(
                DEFAULT_EVENT_TOPIC,
                "junk",
                Message::Change {
                    feed: "telemetry".to_string(),
                    subject: DeviceId::new().to_string(),
                }
                .encode()
                .expect("encode"),
            )
            .await
            .expect("publish");

        let device = DeviceId::new();
        let (handle, signal) = crate::registry::wake_pair();
        hub.notifications().insert(
            Subject::Device(device),
            waggle_common::ids::WaitRequestId::new(),
            handle,
        );
        publish_change(
            transport.as_ref(),
            DEFAULT_EVENT_TOPIC,
            Feed::Notifications,
            device,
        )
        .await
        .expect("publish change");

        let hint = tokio::time::timeout(Duration::from_secs(5), signal.wait())
            .await
            .expect("timely")
            .expect("woken");
        assert_eq!(hint.subject, device);

        relay.shutdown().await;
    }
}
