// tests/common/mod.rs
//
// In-memory broker implementing the codec traits, with switches for the
// failure modes the session layer has to survive.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rabbit_session::rabbitmq::backoff::ReconnectSettings;
use rabbit_session::rabbitmq::schema::{Arguments, BindingConfig, QueueConfig};
use rabbit_session::rabbitmq::{
    AmqpChannel, AmqpConnector, AmqpTransport, Compression, ConnectionInfo, ConnectionManager,
    Delivery, DeliveryStream, ExchangeConfig, ExchangeType, MessageProperties, QueueDescriptor,
    QueueSchema, RabbitMQError, RawDelivery, Result, SessionSettings,
};
use tokio::sync::{mpsc, watch};

pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub connection: usize,
    pub channel: u16,
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub mandatory: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerInfo {
    pub connection: usize,
    pub channel: u16,
    pub queue: String,
    pub consumer_tag: String,
    pub exclusive: bool,
}

struct Consumer {
    info: ConsumerInfo,
    sender: Option<mpsc::UnboundedSender<RawDelivery>>,
}

struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

#[derive(Default)]
struct BrokerState {
    refuse_connections: bool,
    reject_logins: bool,
    conflicting_queues: HashSet<String>,
    failing_declarations: HashMap<String, usize>,
    slow_publish: Option<(String, Duration)>,

    connect_attempts: Vec<Instant>,
    connections: usize,
    live: Option<(usize, watch::Sender<Option<String>>)>,
    transport_closes: Vec<(usize, String)>,
    opened_channels: Vec<(usize, u16)>,
    qos: Vec<(usize, u16, u16)>,
    declared_queues: Vec<(usize, u16, String)>,
    declared_exchanges: Vec<String>,
    bindings: Vec<Binding>,
    consumers: Vec<Consumer>,
    published: Vec<Published>,
    acks: Vec<(u16, u64)>,
    rejects: Vec<(u16, u64, bool)>,
    next_delivery_tag: u64,
}

impl BrokerState {
    fn route(&mut self, exchange: &str, routing_key: &str, body: &[u8], properties: &MessageProperties) {
        let queues: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && topic_matches(&b.routing_key, routing_key))
            .map(|b| b.queue.clone())
            .collect();
        for queue in queues {
            self.push_to(&queue, exchange, routing_key, body.to_vec(), properties.clone());
        }
    }

    fn push_to(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> bool {
        self.next_delivery_tag += 1;
        let delivery_tag = self.next_delivery_tag;
        let consumer = self
            .consumers
            .iter()
            .find(|c| c.info.queue == queue && c.sender.is_some());
        match consumer.and_then(|c| c.sender.as_ref()) {
            Some(sender) => sender
                .send(RawDelivery {
                    delivery_tag,
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    redelivered: false,
                    properties,
                    body,
                })
                .is_ok(),
            None => false,
        }
    }

    fn close_consumers(&mut self, matches: impl Fn(&ConsumerInfo) -> bool) {
        for consumer in self.consumers.iter_mut().filter(|c| matches(&c.info)) {
            consumer.sender = None;
        }
    }
}

fn topic_matches(pattern: &str, key: &str) -> bool {
    if pattern == "#" {
        return true;
    }
    match pattern.strip_suffix(".#") {
        Some(prefix) => key == prefix || key.starts_with(&format!("{}.", prefix)),
        None => pattern == key,
    }
}

#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }

    pub fn connector(&self) -> Arc<dyn AmqpConnector> {
        Arc::new(MockConnector { broker: self.clone() })
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    pub fn reject_logins(&self, reject: bool) {
        self.lock().reject_logins = reject;
    }

    /// Declaring this queue fails with PRECONDITION_FAILED and closes the channel.
    pub fn add_conflicting_queue(&self, queue: &str) {
        self.lock().conflicting_queues.insert(queue.to_string());
    }

    /// The next `times` declarations of `queue` fail with a channel fault.
    pub fn fail_declaration(&self, queue: &str, times: usize) {
        self.lock().failing_declarations.insert(queue.to_string(), times);
    }

    /// Publishes whose routing key starts with `prefix` take `delay` to complete.
    pub fn slow_publish(&self, prefix: &str, delay: Duration) {
        self.lock().slow_publish = Some((prefix.to_string(), delay));
    }

    pub fn connect_attempts(&self) -> Vec<Instant> {
        self.lock().connect_attempts.clone()
    }

    pub fn connections(&self) -> usize {
        self.lock().connections
    }

    pub fn transport_closes(&self) -> Vec<(usize, String)> {
        self.lock().transport_closes.clone()
    }

    pub fn opened_channels(&self) -> Vec<(usize, u16)> {
        self.lock().opened_channels.clone()
    }

    pub fn qos_calls(&self) -> Vec<(usize, u16, u16)> {
        self.lock().qos.clone()
    }

    pub fn declared_queues(&self) -> Vec<(usize, u16, String)> {
        self.lock().declared_queues.clone()
    }

    pub fn declared_exchanges(&self) -> Vec<String> {
        self.lock().declared_exchanges.clone()
    }

    pub fn published(&self) -> Vec<Published> {
        self.lock().published.clone()
    }

    pub fn acks(&self) -> Vec<(u16, u64)> {
        self.lock().acks.clone()
    }

    pub fn rejects(&self) -> Vec<(u16, u64, bool)> {
        self.lock().rejects.clone()
    }

    /// Consumers that are still attached.
    pub fn active_consumers(&self) -> Vec<ConsumerInfo> {
        self.lock()
            .consumers
            .iter()
            .filter(|c| c.sender.is_some())
            .map(|c| c.info.clone())
            .collect()
    }

    /// Pushes a message straight into `queue`. False if nobody consumes it.
    pub fn deliver(&self, queue: &str, body: &[u8], properties: MessageProperties) -> bool {
        self.lock().push_to(queue, "", queue, body.to_vec(), properties)
    }

    /// Cancels every consumer of `queue`, as the broker does when a queue is deleted.
    pub fn close_queue(&self, queue: &str) {
        self.lock().close_consumers(|c| c.queue == queue);
    }

    /// Kills the live connection as a socket reset would.
    pub fn drop_connection(&self, reason: &str) {
        let mut state = self.lock();
        if let Some((id, closed)) = state.live.take() {
            closed.send_replace(Some(reason.to_string()));
            state.close_consumers(|c| c.connection == id);
        }
    }
}

struct MockConnector {
    broker: MockBroker,
}

#[async_trait]
impl AmqpConnector for MockConnector {
    async fn connect(&self, _info: &ConnectionInfo) -> Result<Arc<dyn AmqpTransport>> {
        let mut state = self.broker.lock();
        state.connect_attempts.push(Instant::now());
        if state.refuse_connections {
            return Err(RabbitMQError::ConnectionError("connection refused".into()));
        }

        state.connections += 1;
        let id = state.connections;
        let (closed, _) = watch::channel(None);
        state.live = Some((id, closed.clone()));

        Ok(Arc::new(MockTransport {
            broker: self.broker.clone(),
            id,
            closed,
        }))
    }
}

struct MockTransport {
    broker: MockBroker,
    id: usize,
    closed: watch::Sender<Option<String>>,
}

#[async_trait]
impl AmqpTransport for MockTransport {
    async fn authenticate(&self, user: &str, _password: &str) -> Result<()> {
        if self.broker.lock().reject_logins {
            return Err(RabbitMQError::AuthenticationError(format!(
                "ACCESS_REFUSED - login refused for user '{}'",
                user
            )));
        }
        Ok(())
    }

    async fn open_channel(&self, number: u16) -> Result<Arc<dyn AmqpChannel>> {
        if self.closed.borrow().is_some() {
            return Err(RabbitMQError::ConnectionError("connection closed".into()));
        }
        self.broker.lock().opened_channels.push((self.id, number));
        Ok(Arc::new(MockChannel {
            broker: self.broker.clone(),
            connection: self.id,
            number,
            closed: AtomicBool::new(false),
        }))
    }

    async fn closed(&self) -> String {
        let mut closed = self.closed.subscribe();
        let reason = match closed.wait_for(Option::is_some).await {
            Ok(reason) => (*reason).clone(),
            Err(_) => None,
        };
        reason.unwrap_or_else(|| "transport dropped".to_string())
    }

    async fn close(&self, reason: &str) -> Result<()> {
        let id = self.id;
        self.closed.send_replace(Some(reason.to_string()));
        let mut state = self.broker.lock();
        state.transport_closes.push((id, reason.to_string()));
        state.close_consumers(|c| c.connection == id);
        if state.live.as_ref().is_some_and(|(live, _)| *live == id) {
            state.live = None;
        }
        Ok(())
    }
}

struct MockChannel {
    broker: MockBroker,
    connection: usize,
    number: u16,
    closed: AtomicBool,
}

impl MockChannel {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RabbitMQError::ChannelError(format!(
                "channel {} is closed",
                self.number
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl AmqpChannel for MockChannel {
    fn number(&self) -> u16 {
        self.number
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()> {
        self.check_open()?;
        self.broker
            .lock()
            .qos
            .push((self.connection, self.number, prefetch_count));
        Ok(())
    }

    async fn queue_declare(&self, queue: &QueueDescriptor) -> Result<()> {
        self.check_open()?;
        let mut state = self.broker.lock();
        if state.conflicting_queues.contains(&queue.name) {
            self.closed.store(true, Ordering::SeqCst);
            let (connection, number) = (self.connection, self.number);
            state.close_consumers(|c| c.connection == connection && c.channel == number);
            return Err(RabbitMQError::DeclarationConflict(format!(
                "PRECONDITION_FAILED - inequivalent arg for queue '{}'",
                queue.name
            )));
        }
        if let Some(remaining) = state.failing_declarations.get_mut(&queue.name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RabbitMQError::ChannelError(format!(
                    "NOT_FOUND - no vhost for queue '{}'",
                    queue.name
                )));
            }
        }
        state
            .declared_queues
            .push((self.connection, self.number, queue.name.clone()));
        Ok(())
    }

    async fn exchange_declare(&self, exchange: &ExchangeConfig) -> Result<()> {
        self.check_open()?;
        self.broker
            .lock()
            .declared_exchanges
            .push(exchange.name.clone());
        Ok(())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        _arguments: &Arguments,
    ) -> Result<()> {
        self.check_open()?;
        self.broker.lock().bindings.push(Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        exclusive: bool,
    ) -> Result<Box<dyn DeliveryStream>> {
        self.check_open()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        self.broker.lock().consumers.push(Consumer {
            info: ConsumerInfo {
                connection: self.connection,
                channel: self.number,
                queue: queue.to_string(),
                consumer_tag: consumer_tag.to_string(),
                exclusive,
            },
            sender: Some(sender),
        });
        Ok(Box::new(MockStream { receiver }))
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
        mandatory: bool,
    ) -> Result<()> {
        self.check_open()?;
        let delay = match &self.broker.lock().slow_publish {
            Some((prefix, delay)) if routing_key.starts_with(prefix.as_str()) => Some(*delay),
            _ => None,
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.broker.lock();
        state.published.push(Published {
            connection: self.connection,
            channel: self.number,
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            properties: properties.clone(),
            mandatory,
        });
        state.route(exchange, routing_key, body, properties);
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64, _multiple: bool) -> Result<()> {
        self.check_open()?;
        self.broker.lock().acks.push((self.number, delivery_tag));
        Ok(())
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.check_open()?;
        self.broker
            .lock()
            .rejects
            .push((self.number, delivery_tag, requeue));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let (connection, number) = (self.connection, self.number);
        self.broker
            .lock()
            .close_consumers(|c| c.connection == connection && c.channel == number);
        Ok(())
    }
}

struct MockStream {
    receiver: mpsc::UnboundedReceiver<RawDelivery>,
}

#[async_trait]
impl DeliveryStream for MockStream {
    async fn next_delivery(&mut self) -> Result<Option<RawDelivery>> {
        Ok(self.receiver.recv().await)
    }
}

/// Schema shared by the integration tests.
pub fn schema() -> QueueSchema {
    let queue = |name: &str, exchange: &str, routing_key: &str| QueueConfig {
        name: name.to_string(),
        durable: true,
        exclusive: false,
        auto_delete: false,
        arguments: Arguments::new(),
        bindings: vec![BindingConfig {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            arguments: Arguments::new(),
        }],
    };

    QueueSchema::default()
        .with_exchange("$Events", ExchangeConfig::new("events", ExchangeType::Topic))
        .with_exchange(
            "$Compressed",
            ExchangeConfig::new("events.compressed", ExchangeType::Topic)
                .with_compression(Compression::Deflate),
        )
        .with_queue("$Alerts", queue("alerts", "$Events", "alert.#"))
        .with_queue("$Audit", queue("audit", "$Events", "#"))
        .with_queue("$Archive", queue("archive", "$Compressed", "#"))
        .with_queue("$DeviceEvents", queue("events.device.{device}", "$Events", "device.{device}.#"))
}

pub fn settings(prefetch_count: u16) -> SessionSettings {
    SessionSettings {
        prefetch_count,
        reconnect: ReconnectSettings {
            initial_delay_ms: 20,
            max_delay_ms: 200,
            factor: 2.0,
            jitter: 0.0,
            max_attempts: None,
        },
    }
}

/// A manager wired to `broker`, not yet started.
pub fn manager(broker: &MockBroker, prefetch_count: u16) -> ConnectionManager {
    ConnectionManager::new(
        ConnectionInfo::default(),
        Arc::new(schema()),
        broker.connector(),
        settings(prefetch_count),
    )
}

pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("timed out waiting")
}

/// Polls `condition` until it holds or the wait budget runs out.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition never became true");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Collects deliveries handed to it.
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<Delivery>>>,
}

impl Recorder {
    pub fn handler(&self) -> impl Fn(Delivery) -> futures::future::Ready<()> + Send + Sync + 'static {
        let seen = self.seen.clone();
        move |delivery| {
            seen.lock().unwrap().push(delivery);
            futures::future::ready(())
        }
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.seen.lock().unwrap().clone()
    }

    pub fn bodies(&self) -> Vec<Vec<u8>> {
        self.deliveries().into_iter().map(|d| d.body).collect()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}
