// src/rabbitmq/session.rs
//
// One physical connection's lifecycle. A session is built on every
// (re)connect from the state the manager keeps; nothing in here survives a
// disconnect.

use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::amqp_client::{AmqpTransport, ConnectionInfo};
use super::channel_manager::{ChannelConfig, ChannelManager};
use super::consumer::{dispatch_capacity, receive_loop, LoopExit, MessageHandler};
use super::errors::{RabbitMQError, Result};
use super::event_hook::{AuthOutcome, SessionHooks, SessionReady};
use super::message::{self, Delivery};
use super::publisher::{Confirmation, PendingSend, SendBuffer, SendReport};
use super::schema::{QueueDescriptor, SchemaAdapter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    ChannelOpening,
    Declaring,
    Ready,
    Draining,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Authenticating => "authenticating",
            SessionState::ChannelOpening => "channel-opening",
            SessionState::Declaring => "declaring",
            SessionState::Ready => "ready",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// A queue registration: kept by the manager and replayed on every session.
#[derive(Clone)]
pub struct QueueBinding {
    pub queue: QueueDescriptor,
    pub handler: Arc<dyn MessageHandler>,
    pub exclusive: bool,
}

impl fmt::Debug for QueueBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueBinding")
            .field("queue", &self.queue.name)
            .field("exclusive", &self.exclusive)
            .finish()
    }
}

/// State that outlives any single connection. Owned by the manager, read by
/// whichever session is current.
pub(crate) struct SharedState {
    pub info: ConnectionInfo,
    pub schema: Arc<dyn SchemaAdapter>,
    pub hooks: SessionHooks,
    pub bindings: tokio::sync::Mutex<Vec<QueueBinding>>,
    pub outbox: SendBuffer,
    pub transport_open: AtomicBool,
    current: Mutex<Option<Arc<Session>>>,
}

impl SharedState {
    pub fn new(info: ConnectionInfo, schema: Arc<dyn SchemaAdapter>) -> Self {
        Self {
            info,
            schema,
            hooks: SessionHooks::new(),
            bindings: tokio::sync::Mutex::new(Vec::new()),
            outbox: SendBuffer::new(),
            transport_open: AtomicBool::new(false),
            current: Mutex::new(None),
        }
    }

    /// The ready session, if any.
    pub fn current(&self) -> Option<Arc<Session>> {
        self.lock_current().clone()
    }

    fn is_current(&self, session: &Session) -> bool {
        self.lock_current()
            .as_ref()
            .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), session))
    }

    fn install(&self, session: Arc<Session>) {
        *self.lock_current() = Some(session);
    }

    /// Clears the slot only if `session` still holds it.
    fn retire(&self, session: &Session) {
        let mut current = self.lock_current();
        if current
            .as_ref()
            .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), session))
        {
            *current = None;
        }
    }

    fn lock_current(&self) -> MutexGuard<'_, Option<Arc<Session>>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct ActiveConsumer {
    binding: QueueBinding,
    channel_number: u16,
    task: JoinHandle<()>,
}

pub struct Session {
    generation: u64,
    shared: Arc<SharedState>,
    transport: Arc<dyn AmqpTransport>,
    channels: ChannelManager,
    state: watch::Sender<SessionState>,
    lost: watch::Sender<Option<String>>,
    consumers: Mutex<Vec<ActiveConsumer>>,
    // Held across a declaration and any channel recovery it causes.
    declaring: tokio::sync::Mutex<()>,
}

impl Session {
    pub(crate) fn new(
        generation: u64,
        transport: Arc<dyn AmqpTransport>,
        shared: Arc<SharedState>,
        prefetch_count: u16,
    ) -> Arc<Self> {
        let channels = ChannelManager::new(
            transport.clone(),
            ChannelConfig {
                prefetch_count,
                id: format!("session-{}", generation),
            },
        );
        let (state, _) = watch::channel(SessionState::Connecting);
        let (lost, _) = watch::channel(None);

        Arc::new(Self {
            generation,
            shared,
            transport,
            channels,
            state,
            lost,
            consumers: Mutex::new(Vec::new()),
            declaring: tokio::sync::Mutex::new(()),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn channel_number(&self) -> Option<u16> {
        self.channels.current_number()
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(generation = self.generation, "Session {} -> {}", previous, next);
        }
    }

    /// Runs the handshake through to `Ready`, then reports the connection and
    /// flushes whatever was buffered. Failures are reported through the hooks
    /// as well as returned.
    pub(crate) async fn start(self: &Arc<Self>) -> Result<()> {
        let info = &self.shared.info;
        self.set_state(SessionState::Authenticating);

        if let Err(e) = self.transport.authenticate(&info.user, &info.password).await {
            warn!("Error authenticating to {} as {}: {}", info.host, info.user, e);
            self.set_state(SessionState::Closed);
            self.shared.hooks.authenticated.fire(AuthOutcome::Rejected {
                user: info.user.clone(),
                reason: e.to_string(),
            });
            return Err(e);
        }
        debug!("Successfully authenticated as {}", info.user);
        self.shared.hooks.authenticated.fire(AuthOutcome::Accepted {
            user: info.user.clone(),
        });

        if let Err(e) = self.establish().await {
            error!(generation = self.generation, "Unable to connect: {}", e);
            self.set_state(SessionState::Closed);
            self.shared
                .hooks
                .connection_failed
                .fire(format!("session setup failed: {}", e));
            return Err(e);
        }

        let ready = SessionReady {
            generation: self.generation,
            channel_number: self.channel_number().unwrap_or_default(),
        };
        info!(generation = self.generation, "Session ready");
        self.shared.hooks.connection_made.fire(ready);

        self.drain(true).await;
        Ok(())
    }

    async fn establish(self: &Arc<Self>) -> Result<()> {
        self.set_state(SessionState::ChannelOpening);
        self.channels.open().await?;

        self.set_state(SessionState::Declaring);
        // Held until the session is installed so a concurrent `listen` either
        // lands in this snapshot or sees the session as current.
        let bindings = self.shared.bindings.lock().await;
        debug!("Binding to {} queues", bindings.len());

        for binding in bindings.iter() {
            self.declare_queue(&binding.queue).await?;
        }
        for binding in bindings.iter() {
            self.start_consumer(binding.clone()).await?;
        }

        self.set_state(SessionState::Ready);
        self.shared.install(self.clone());
        drop(bindings);
        Ok(())
    }

    /// Declares the bound exchanges, the queue and its bindings. A queue that
    /// already exists with other arguments is used as it is.
    pub async fn declare_queue(self: &Arc<Self>, queue: &QueueDescriptor) -> Result<()> {
        let _declaring = self.declaring.lock().await;
        let channel = self.channels.get_channel()?;
        for binding in &queue.bindings {
            channel.exchange_declare(&binding.exchange).await?;
        }

        match channel.queue_declare(queue).await {
            Ok(()) => debug!(queue = %queue.name, "Queue declared"),
            Err(e) if e.is_declaration_conflict() => {
                warn!(
                    queue = %queue.name,
                    "Queue exists with different arguments, using it as is: {}", e
                );
                self.recover_channel().await?;
            }
            Err(e) => return Err(e),
        }

        let channel = self.channels.get_channel()?;
        for binding in &queue.bindings {
            channel
                .queue_bind(
                    &queue.name,
                    &binding.exchange.name,
                    &binding.routing_key,
                    &binding.arguments,
                )
                .await?;
        }
        Ok(())
    }

    /// Replaces the channel the broker closed on us. Consumers that were
    /// running on it are restarted on the new one.
    async fn recover_channel(self: &Arc<Self>) -> Result<()> {
        let channel = self.channels.reopen().await?;
        let number = channel.number();
        info!(generation = self.generation, number, "Reopened channel after declaration conflict");

        let stale: Vec<QueueBinding> = {
            let mut consumers = self.lock_consumers();
            let (stale, live): (Vec<_>, Vec<_>) = consumers
                .drain(..)
                .partition(|consumer| consumer.channel_number != number);
            *consumers = live;
            stale.into_iter().map(|consumer| consumer.binding).collect()
        };

        for binding in stale {
            debug!(queue = %binding.queue.name, "Resuming consumer on channel {}", number);
            self.start_consumer(binding).await?;
        }
        Ok(())
    }

    async fn start_consumer(self: &Arc<Self>, binding: QueueBinding) -> Result<()> {
        let channel = self.channels.get_channel()?;
        let consumer_tag = format!("consumer-{}", Uuid::new_v4());
        let stream = channel
            .basic_consume(&binding.queue.name, &consumer_tag, binding.exclusive)
            .await?;
        let channel_number = channel.number();
        info!(queue = %binding.queue.name, consumer_tag, "Listening to queue");

        let session: Weak<Session> = Arc::downgrade(self);
        let queue = binding.queue.name.clone();
        let handler = binding.handler.clone();
        let capacity = dispatch_capacity(self.channels.prefetch_count());
        let task = tokio::spawn(async move {
            let exit = receive_loop(queue.clone(), channel_number, capacity, stream, handler).await;
            if let Some(session) = session.upgrade() {
                session.on_loop_exit(&queue, channel_number, exit).await;
            }
        });

        self.lock_consumers().push(ActiveConsumer {
            binding,
            channel_number,
            task,
        });
        Ok(())
    }

    async fn on_loop_exit(&self, queue: &str, channel_number: u16, exit: LoopExit) {
        match exit {
            LoopExit::Closed => {
                // A conflict closes the channel before it is replaced; wait for that to settle.
                let _declaring = self.declaring.lock().await;
                let superseded = self.channels.current_number() != Some(channel_number);
                if superseded || self.state() != SessionState::Ready {
                    debug!(queue, channel_number, "Receive loop ended with its channel");
                } else {
                    self.mark_lost(format!("queue '{}' closed", queue));
                }
            }
            LoopExit::Failed(e) => {
                error!(queue, "Stopped consuming: {}", e);
            }
        }
    }

    /// Declares and starts consuming; returns once consumption has begun.
    pub async fn listen_to_queue(self: &Arc<Self>, binding: QueueBinding) -> Result<()> {
        if self.state() != SessionState::Ready {
            return Err(RabbitMQError::NotConnected);
        }
        let result = async {
            self.declare_queue(&binding.queue).await?;
            self.start_consumer(binding.clone()).await
        }
        .await;

        if let Err(e) = &result {
            error!(queue = %binding.queue.name, "Failed to listen: {}", e);
            self.mark_lost(format!("listening to '{}' failed: {}", binding.queue.name, e));
        }
        result
    }

    /// Resolves, encodes and publishes one message.
    pub async fn send_message(&self, send: PendingSend) -> Result<Confirmation> {
        let exchange = self.shared.schema.resolve_exchange(&send.exchange)?;
        let channel = self.channels.get_channel()?;

        if send.options.declare_exchange {
            channel.exchange_declare(&exchange).await?;
        }

        let encoded = message::encode(send.payload, send.options.headers, &exchange)?;
        channel
            .basic_publish(
                &exchange.name,
                &send.routing_key,
                &encoded.body,
                &encoded.properties,
                send.options.mandatory,
            )
            .await?;

        Ok(Confirmation {
            exchange: exchange.name,
            routing_key: send.routing_key,
            channel_number: channel.number(),
        })
    }

    /// Takes every buffered send and transmits them, most recent first.
    /// Returns `None` without touching the buffer if this session is not the
    /// current ready one, or if another drain already took everything.
    pub async fn drain_send_buffer(&self) -> Option<SendReport> {
        self.drain(false).await
    }

    /// The drain right after connecting always reports, even with nothing to
    /// send; later drains only report what they carried.
    async fn drain(&self, initial: bool) -> Option<SendReport> {
        if self.state() != SessionState::Ready || !self.shared.is_current(self) {
            return None;
        }

        let (mut pending, waiters) = self.shared.outbox.take_all();
        if pending.is_empty() && !initial {
            return None;
        }

        let mut sends = Vec::with_capacity(pending.len());
        while let Some(send) = pending.pop() {
            sends.push(self.send_message(send));
        }

        let results: Vec<_> = join_all(sends)
            .await
            .into_iter()
            .map(|result| {
                result.map_err(|e| {
                    warn!(generation = self.generation, "Failed to send buffered message: {}", e);
                    e.to_string()
                })
            })
            .collect();

        let report = SendReport { results };
        debug!(sent = report.sent(), total = report.results.len(), "Flushed send buffer");
        waiters.deliver(&report);
        self.shared.hooks.initial_send.fire(report.clone());
        Some(report)
    }

    pub async fn acknowledge(&self, delivery: &Delivery, multiple: bool) -> Result<()> {
        let channel = self.channel_for(delivery)?;
        channel
            .basic_ack(delivery.delivery_tag, multiple)
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    pub async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        let channel = self.channel_for(delivery)?;
        channel
            .basic_reject(delivery.delivery_tag, requeue)
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    fn channel_for(&self, delivery: &Delivery) -> Result<Arc<dyn super::amqp_client::AmqpChannel>> {
        let channel = self.channels.get_channel()?;
        if channel.number() != delivery.channel_number {
            return Err(RabbitMQError::ChannelError(format!(
                "delivery {} arrived on channel {}, which has been replaced by channel {}",
                delivery.delivery_tag,
                delivery.channel_number,
                channel.number()
            )));
        }
        Ok(channel)
    }

    /// Signals the manager that this connection is no longer usable.
    pub(crate) fn mark_lost(&self, reason: String) {
        self.lost.send_if_modified(|lost| {
            if lost.is_none() {
                *lost = Some(reason);
                true
            } else {
                false
            }
        });
    }

    /// Resolves once something inside the session declared the connection lost.
    pub(crate) async fn lost(&self) -> String {
        let mut receiver = self.lost.subscribe();
        let reason = match receiver.wait_for(Option::is_some).await {
            Ok(reason) => (*reason).clone(),
            Err(_) => None,
        };
        reason.unwrap_or_else(|| "session dropped".to_string())
    }

    /// Stops consumption and releases the channel. The transport itself is
    /// closed by the manager.
    pub(crate) async fn close(&self) {
        if self.state() == SessionState::Closed {
            self.shared.retire(self);
            return;
        }
        self.set_state(SessionState::Draining);
        self.shared.retire(self);

        let consumers: Vec<ActiveConsumer> = self.lock_consumers().drain(..).collect();
        for consumer in consumers {
            consumer.task.abort();
        }
        self.channels.close().await;
        self.set_state(SessionState::Closed);
    }

    fn lock_consumers(&self) -> MutexGuard<'_, Vec<ActiveConsumer>> {
        self.consumers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
