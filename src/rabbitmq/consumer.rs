// src/rabbitmq/consumer.rs
//
// Per-queue receive loop. Fetching and callback execution are split: the
// fetch side hands each delivery to a dispatcher and immediately asks for the
// next one, while the dispatcher runs callbacks strictly in arrival order.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::amqp_client::DeliveryStream;
use super::errors::RabbitMQError;
use super::message::Delivery;

/// Receives deliveries for a queue.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: Delivery);
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, delivery: Delivery) {
        (self)(delivery).await
    }
}

/// Why a receive loop stopped.
#[derive(Debug)]
pub enum LoopExit {
    /// The broker or transport closed the consumer.
    Closed,
    /// Fetching failed; consumption of this queue is over.
    Failed(RabbitMQError),
}

/// Dispatch queue depth when no prefetch limit bounds the broker.
const UNLIMITED_PREFETCH_BACKLOG: usize = 64;

/// Depth of the fetch-to-dispatch queue for a channel's prefetch limit.
pub(crate) fn dispatch_capacity(prefetch_count: u16) -> usize {
    match prefetch_count {
        0 => UNLIMITED_PREFETCH_BACKLOG,
        n => usize::from(n),
    }
}

/// Aborts the dispatcher if the receive loop is cancelled. A loop that ends
/// on its own lets the dispatcher finish what was already fetched.
struct Dispatcher(Option<JoinHandle<()>>);

impl Dispatcher {
    fn detach(mut self) {
        self.0.take();
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if let Some(task) = self.0.take() {
            task.abort();
        }
    }
}

pub(crate) async fn receive_loop(
    queue: String,
    channel_number: u16,
    capacity: usize,
    mut stream: Box<dyn DeliveryStream>,
    handler: Arc<dyn MessageHandler>,
) -> LoopExit {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let dispatcher = Dispatcher(Some(tokio::spawn(dispatch(queue.clone(), rx, handler))));

    let exit = loop {
        match stream.next_delivery().await {
            Ok(Some(raw)) => {
                let delivery = Delivery::from_raw(raw, &queue, channel_number);
                if tx.send(delivery).await.is_err() {
                    debug!(queue = %queue, "Dispatcher gone, stopping receive loop");
                    break LoopExit::Closed;
                }
            }
            Ok(None) => {
                debug!(queue = %queue, "Connection to queue closed");
                break LoopExit::Closed;
            }
            Err(e) => {
                error!(queue = %queue, "Error receiving message: {}", e);
                break LoopExit::Failed(e);
            }
        }
    };
    dispatcher.detach();
    exit
}

async fn dispatch(
    queue: String,
    mut deliveries: mpsc::Receiver<Delivery>,
    handler: Arc<dyn MessageHandler>,
) {
    while let Some(delivery) = deliveries.recv().await {
        let delivery_tag = delivery.delivery_tag;
        let handler = handler.clone();

        // Own task so a panicking handler doesn't stop the queue.
        if let Err(e) = tokio::spawn(async move { handler.handle(delivery).await }).await {
            error!(queue = %queue, delivery_tag, "Message handler failed: {}", e);
        }
    }
    debug!(queue = %queue, "Dispatcher finished");
}
