// Server side: consumer pool, bounded work queue, worker pool.
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use waggle_transport::{Transport, TransportConsumer, TransportError};
use waggle_wire::{Message, Request, Response};

use crate::{RequestHandler, Result, RpcConfig};

/// Publishes responses onto the reply topic, keyed by correlation id so
/// every response of one exchange lands in the same partition.
///
/// Cloneable so application code can stream additional responses for an
/// open correlation id outside the handler.
#[derive(Clone)]
pub struct ResponsePublisher {
    transport: Arc<dyn Transport>,
    reply_topic: Arc<str>,
}

impl ResponsePublisher {
    pub async fn publish(&self, response: Response) -> Result<()> {
        let key = response.correlation_id.clone();
        let payload = Message::Response(response).encode()?;
        self.transport.publish(&self.reply_topic, &key, payload).await?;
        Ok(())
    }
}

/// RPC server: a pool of request-consumer tasks feeding a bounded queue of
/// worker tasks that execute the registered handler.
///
/// `start` returns only after every consumer has joined the server group,
/// so a request published right after startup is observed. A handler fault
/// (error or panic) is converted into exactly one terminal failed response;
/// the caller is never left unanswered by a handler problem.
pub struct RpcServer {
    consumers: Vec<Arc<dyn TransportConsumer>>,
    consumer_tasks: Vec<JoinHandle<()>>,
    worker_tasks: Vec<JoinHandle<()>>,
    publisher: ResponsePublisher,
    shutdown_grace: Duration,
}

impl RpcServer {
    pub async fn start(
        transport: Arc<dyn Transport>,
        config: RpcConfig,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Self> {
        let publisher = ResponsePublisher {
            transport: Arc::clone(&transport),
            reply_topic: Arc::from(config.reply_topic.as_str()),
        };

        // Bounded hand-off between consumption and execution: when every
        // worker is busy and the queue is full, `send` blocks the consumer,
        // which is the backpressure path.
        let (work_tx, work_rx) = mpsc::channel::<Request>(config.queue_depth);
        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));

        let mut worker_tasks = Vec::with_capacity(config.worker_tasks);
        for index in 0..config.worker_tasks {
            worker_tasks.push(tokio::spawn(run_worker(
                index,
                Arc::clone(&work_rx),
                Arc::clone(&handler),
                publisher.clone(),
            )));
        }

        let mut consumers = Vec::with_capacity(config.consumer_tasks);
        let mut consumer_tasks = Vec::with_capacity(config.consumer_tasks);
        for index in 0..config.consumer_tasks {
            let consumer = transport
                .consumer(&config.request_topic, &config.server_group)
                .await?;
            consumers.push(Arc::clone(&consumer));
            consumer_tasks.push(tokio::spawn(run_request_consumer(
                index,
                consumer,
                work_tx.clone(),
            )));
        }
        // Workers exit once all consumer-held senders are gone.
        drop(work_tx);

        Ok(Self {
            consumers,
            consumer_tasks,
            worker_tasks,
            publisher,
            shutdown_grace: config.shutdown_grace,
        })
    }

    pub fn publisher(&self) -> ResponsePublisher {
        self.publisher.clone()
    }

    /// Stop intake, drain in-flight work for a bounded grace period, then
    /// abort whatever is still running.
    pub async fn shutdown(self) {
        for consumer in &self.consumers {
            consumer.wakeup();
        }
        for task in self.consumer_tasks {
            let _ = task.await;
        }
        let mut worker_tasks = self.worker_tasks;
        let drained = tokio::time::timeout(self.shutdown_grace, async {
            for task in worker_tasks.iter_mut() {
                let _ = task.await;
            }
        })
        .await;
        if drained.is_err() {
            warn!("shutdown grace period elapsed, aborting workers");
            for task in &worker_tasks {
                task.abort();
            }
        }
    }
}

async fn run_request_consumer(
    index: usize,
    consumer: Arc<dyn TransportConsumer>,
    work_tx: mpsc::Sender<Request>,
) {
    debug!(index, "request consumer started");
    loop {
        match consumer.poll().await {
            Ok(batch) => {
                for delivery in batch {
                    match Message::decode(&delivery.payload) {
                        Ok(Message::Request(request)) => {
                            if work_tx.send(request).await.is_err() {
                                debug!(index, "work queue closed");
                                return;
                            }
                        }
                        Ok(_) => {
                            debug!(index, "ignoring non-request message on request topic");
                        }
                        Err(err) => {
                            warn!(index, error = %err, "dropping undecodable request message");
                        }
                    }
                }
            }
            Err(TransportError::Wakeup) => break,
            Err(err) => {
                warn!(index, error = %err, "request consumer stopped");
                break;
            }
        }
    }
    debug!(index, "request consumer exited");
}

async fn run_worker(
    index: usize,
    work_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Request>>>,
    handler: Arc<dyn RequestHandler>,
    publisher: ResponsePublisher,
) {
    debug!(index, "worker started");
    loop {
        // The receiver lock is held only while dequeuing, never while the
        // handler runs, so workers execute in parallel.
        let request = { work_rx.lock().await.recv().await };
        let Some(request) = request else { break };
        execute(Arc::clone(&handler), &publisher, request).await;
    }
    debug!(index, "worker exited");
}

async fn execute(handler: Arc<dyn RequestHandler>, publisher: &ResponsePublisher, request: Request) {
    let correlation_id = request.correlation_id.clone();
    let single_reply = request.single_reply;
    // The handler runs in its own task so a panic is contained here and
    // still produces a terminal failed response.
    let outcome = tokio::spawn(async move { handler.handle(request).await }).await;
    let responses = match outcome {
        Ok(Ok(responses)) => {
            if responses.is_empty() && single_reply {
                vec![Response::failure(
                    &correlation_id,
                    "handler error: no response produced",
                )]
            } else {
                responses
            }
        }
        Ok(Err(err)) => {
            debug!(correlation_id = %correlation_id, error = %err, "handler fault");
            vec![Response::failure(&correlation_id, err.to_string())]
        }
        Err(join) => {
            let description = panic_description(join);
            warn!(correlation_id = %correlation_id, description, "handler panicked");
            vec![Response::failure(
                &correlation_id,
                format!("handler panic: {description}"),
            )]
        }
    };
    for mut response in responses {
        // Responses always carry the correlation id of the request that
        // produced them, whatever the handler filled in.
        response.correlation_id = correlation_id.clone();
        if let Err(err) = publisher.publish(response).await {
            warn!(correlation_id = %correlation_id, error = %err, "failed to publish response");
            break;
        }
    }
}

fn panic_description(err: tokio::task::JoinError) -> String {
    match err.try_into_panic() {
        Ok(panic) => {
            if let Some(message) = panic.downcast_ref::<&str>() {
                (*message).to_string()
            } else if let Some(message) = panic.downcast_ref::<String>() {
                message.clone()
            } else {
                "unknown panic".to_string()
            }
        }
        Err(_) => "handler task cancelled".to_string(),
    }
}
