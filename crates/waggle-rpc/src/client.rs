// Client side: correlation table and response dispatch.
use ahash::RandomState;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;
use waggle_transport::{Transport, TransportConsumer, TransportError};
use waggle_wire::{Message, Request, Response};

use crate::{Result, RpcConfig, RpcError};

type ResponseCallback = Arc<dyn Fn(Response) + Send + Sync>;

struct PendingCall {
    single_reply: bool,
    callback: ResponseCallback,
}

// Outstanding calls keyed by correlation id. An entry exists from the
// moment the request is handed to the transport until its terminal
// response is dispatched or the call is abandoned.
#[derive(Default)]
struct CorrelationTable {
    entries: Mutex<HashMap<String, PendingCall, RandomState>>,
}

impl CorrelationTable {
    fn register(
        &self,
        correlation_id: &str,
        single_reply: bool,
        callback: ResponseCallback,
    ) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(correlation_id) {
            return Err(RpcError::DuplicateCorrelation(correlation_id.to_string()));
        }
        entries.insert(
            correlation_id.to_string(),
            PendingCall {
                single_reply,
                callback,
            },
        );
        Ok(())
    }

    fn remove(&self, correlation_id: &str) -> bool {
        self.entries.lock().remove(correlation_id).is_some()
    }

    fn dispatch(&self, mut response: Response) {
        let callback = {
            let mut entries = self.entries.lock();
            let Some(pending) = entries.get(&response.correlation_id) else {
                // Expected after timeouts, abandonment or redelivery races.
                debug!(
                    correlation_id = %response.correlation_id,
                    "dropping response with no outstanding call"
                );
                return;
            };
            // A single-reply call treats its first response as terminal,
            // whatever the flag says.
            if pending.single_reply {
                response.last = true;
            }
            let callback = Arc::clone(&pending.callback);
            if response.last {
                // Removal is keyed on the entry just looked up, so exactly
                // one of several racing terminal deliveries wins; the rest
                // find the entry gone and drop above.
                entries.remove(&response.correlation_id);
            }
            callback
        };
        // The table lock is released before user code runs.
        callback(response);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// RPC client: publishes requests and dispatches responses to per-call
/// callbacks from a pool of reply-consumer tasks.
///
/// Callbacks run on the consumer tasks, never on the calling task; they
/// must be fast or hand work off.
pub struct RpcClient {
    transport: Arc<dyn Transport>,
    config: RpcConfig,
    table: Arc<CorrelationTable>,
    consumers: Vec<Arc<dyn TransportConsumer>>,
    tasks: Vec<JoinHandle<()>>,
}

impl RpcClient {
    pub async fn start(transport: Arc<dyn Transport>, config: RpcConfig) -> Result<Self> {
        let table = Arc::new(CorrelationTable::default());
        // A fresh group per client so every client observes every response
        // and filters by its own correlation table.
        let group = format!("rpc-client-{}", Uuid::new_v4());
        let mut consumers = Vec::with_capacity(config.consumer_tasks);
        let mut tasks = Vec::with_capacity(config.consumer_tasks);
        for index in 0..config.consumer_tasks {
            let consumer = transport.consumer(&config.reply_topic, &group).await?;
            consumers.push(Arc::clone(&consumer));
            tasks.push(tokio::spawn(run_response_consumer(
                index,
                consumer,
                Arc::clone(&table),
            )));
        }
        Ok(Self {
            transport,
            config,
            table,
            consumers,
            tasks,
        })
    }

    /// Fire-and-forget publish; no reply is expected and none is tracked.
    pub async fn send(&self, request: Request) -> Result<()> {
        self.publish_request(&request).await
    }

    /// Register `callback` for the request's responses, then publish.
    ///
    /// A correlation id is generated when the request carries none. The
    /// registration completes before the request is handed to the
    /// transport, so a response can never arrive without a listener.
    /// Returns the correlation id of the outstanding call.
    pub async fn call(
        &self,
        mut request: Request,
        callback: impl Fn(Response) + Send + Sync + 'static,
    ) -> Result<String> {
        if request.correlation_id.is_empty() {
            request.correlation_id = Uuid::new_v4().to_string();
        }
        let correlation_id = request.correlation_id.clone();
        self.table
            .register(&correlation_id, request.single_reply, Arc::new(callback))?;
        if let Err(err) = self.publish_request(&request).await {
            self.table.remove(&correlation_id);
            return Err(err);
        }
        Ok(correlation_id)
    }

    /// Drop an outstanding call. Responses arriving afterwards are dropped
    /// silently. Idempotent.
    pub fn abandon(&self, correlation_id: &str) -> bool {
        self.table.remove(correlation_id)
    }

    pub async fn shutdown(self) {
        for consumer in &self.consumers {
            consumer.wakeup();
        }
        for task in self.tasks {
            let _ = task.await;
        }
    }

    async fn publish_request(&self, request: &Request) -> Result<()> {
        let payload = Message::Request(request.clone()).encode()?;
        // Key on the correlation id: the whole exchange shares a partition,
        // which is what preserves response order for streamed replies.
        self.transport
            .publish(&self.config.request_topic, &request.correlation_id, payload)
            .await?;
        Ok(())
    }
}

async fn run_response_consumer(
    index: usize,
    consumer: Arc<dyn TransportConsumer>,
    table: Arc<CorrelationTable>,
) {
    debug!(index, "response consumer started");
    loop {
        match consumer.poll().await {
            Ok(batch) => {
                for delivery in batch {
                    match Message::decode(&delivery.payload) {
                        Ok(Message::Response(response)) => table.dispatch(response),
                        Ok(_) => {
                            debug!(index, "ignoring non-response message on reply topic");
                        }
                        Err(err) => {
                            warn!(index, error = %err, "dropping undecodable reply message");
                        }
                    }
                }
            }
            Err(TransportError::Wakeup) => break,
            Err(err) => {
                warn!(index, error = %err, "response consumer stopped");
                break;
            }
        }
    }
    debug!(index, "response consumer exited");
}
