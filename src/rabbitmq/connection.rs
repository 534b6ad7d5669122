// src/rabbitmq/connection.rs
//
// Long-lived connection manager. Holds everything that has to survive a
// reconnect and runs a supervisor task that builds a new session on every
// successful transport connect.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use futures::future::{self, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::amqp_client::{AmqpConnector, AmqpTransport, ConnectionInfo};
use super::backoff::{ReconnectPolicy, ReconnectSettings};
use super::consumer::MessageHandler;
use super::errors::{RabbitMQError, Result};
use super::event_hook::SessionHooks;
use super::lapin_client::LapinConnector;
use super::message::{Delivery, Payload};
use super::publisher::{PendingSend, SendOptions, SendReport};
use super::schema::{QueueDescriptor, Replacements, SchemaAdapter};
use super::session::{QueueBinding, Session, SessionState, SharedState};

/// Per-session tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Unacknowledged deliveries per channel; 0 disables QoS.
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,
    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

fn default_prefetch_count() -> u16 {
    10
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            prefetch_count: default_prefetch_count(),
            reconnect: ReconnectSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// A live connection was torn down and `connection-lost` fired.
    ConnectionShut,
    /// There was no connection to tear down.
    NotConnected,
}

pub struct ConnectionManager {
    shared: Arc<SharedState>,
    connector: Arc<dyn AmqpConnector>,
    settings: SessionSettings,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        info: ConnectionInfo,
        schema: Arc<dyn SchemaAdapter>,
        connector: Arc<dyn AmqpConnector>,
        settings: SessionSettings,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(SharedState::new(info, schema)),
            connector,
            settings,
            shutdown,
            supervisor: Mutex::new(None),
        }
    }

    /// Builds a manager backed by lapin and starts connecting right away.
    pub fn connect(
        info: ConnectionInfo,
        schema: impl SchemaAdapter + 'static,
        settings: SessionSettings,
    ) -> Self {
        let manager = Self::new(info, Arc::new(schema), Arc::new(LapinConnector::new()), settings);
        manager.start();
        manager
    }

    /// Spawns the supervisor. Calling it again is a no-op.
    pub fn start(&self) {
        let mut supervisor = self.supervisor.lock().unwrap_or_else(|p| p.into_inner());
        if supervisor.is_some() {
            return;
        }
        *supervisor = Some(tokio::spawn(supervise(
            self.shared.clone(),
            self.connector.clone(),
            self.settings.clone(),
            self.shutdown.subscribe(),
        )));
    }

    pub fn hooks(&self) -> &SessionHooks {
        &self.shared.hooks
    }

    pub fn schema(&self) -> &Arc<dyn SchemaAdapter> {
        &self.shared.schema
    }

    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.shared.info
    }

    pub fn is_connected(&self) -> bool {
        self.shared.current().is_some()
    }

    pub fn current_session(&self) -> Option<Arc<Session>> {
        self.shared.current()
    }

    /// State of the ready session, `None` between connections.
    pub fn session_state(&self) -> Option<SessionState> {
        self.shared.current().map(|session| session.state())
    }

    /// Number of sends waiting for a ready session.
    pub fn pending_sends(&self) -> usize {
        self.shared.outbox.len()
    }

    /// Registers `handler` for the schema queue `queue_id`. The binding is
    /// kept and consumed on every future connection.
    pub async fn listen<H>(&self, queue_id: &str, handler: H, exclusive: bool) -> Result<()>
    where
        H: MessageHandler,
    {
        let queue = self.shared.schema.resolve_queue(queue_id, &Replacements::new())?;
        self.listen_queue(queue, handler, exclusive).await
    }

    pub async fn listen_queue<H>(&self, queue: QueueDescriptor, handler: H, exclusive: bool) -> Result<()>
    where
        H: MessageHandler,
    {
        let binding = QueueBinding {
            queue,
            handler: Arc::new(handler),
            exclusive,
        };

        let current = {
            let mut bindings = self.shared.bindings.lock().await;
            bindings.push(binding.clone());
            self.shared.current()
        };

        match current {
            Some(session) => match session.listen_to_queue(binding).await {
                Err(RabbitMQError::NotConnected) => {
                    debug!("Session is going away; binding kept for the next connection");
                    Ok(())
                }
                other => other,
            },
            None => {
                debug!(queue = %binding.queue.name, "Not connected; will listen once connected");
                Ok(())
            }
        }
    }

    /// Queues a message for sending. The returned future resolves with the
    /// report of the drain that transmitted it. Must be called from within a
    /// Tokio runtime.
    pub fn send(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: impl Into<Payload>,
        options: SendOptions,
    ) -> BoxFuture<'static, Result<SendReport>> {
        let report = self.shared.outbox.push_tracked(PendingSend {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.into(),
            options,
        });

        match self.shared.current() {
            Some(session) => {
                tokio::spawn(async move { session.drain_send_buffer().await });
            }
            None => {
                debug!(pending = self.shared.outbox.len(), "Not connected; message buffered");
            }
        }
        async move { report.await.map_err(|_| RabbitMQError::ShuttingDown) }.boxed()
    }

    /// Declares a schema queue now if connected, otherwise as soon as the next
    /// connection is made. Resolves with the concrete queue name.
    pub fn create_queue(
        &self,
        queue_id: &str,
        replacements: Option<&Replacements>,
    ) -> BoxFuture<'static, Result<String>> {
        let empty = Replacements::new();
        let descriptor = match self
            .shared
            .schema
            .resolve_queue(queue_id, replacements.unwrap_or(&empty))
        {
            Ok(descriptor) => descriptor,
            Err(e) => return future::ready(Err(e)).boxed(),
        };

        let made = self.shared.hooks.connection_made.wait();
        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            let session = match shared.current() {
                Some(session) => session,
                None => {
                    debug!(queue = %descriptor.name, "Not connected; declaring once connected");
                    made.await.ok_or(RabbitMQError::ShuttingDown)?;
                    shared.current().ok_or(RabbitMQError::NotConnected)?
                }
            };
            session.declare_queue(&descriptor).await?;
            Ok(descriptor.name)
        });

        async move {
            task.await
                .map_err(|e| RabbitMQError::Unknown(format!("queue declaration task failed: {}", e)))?
        }
        .boxed()
    }

    pub async fn acknowledge(&self, delivery: &Delivery, multiple: bool) -> Result<()> {
        let session = self.shared.current().ok_or(RabbitMQError::NotConnected)?;
        session.acknowledge(delivery, multiple).await
    }

    pub async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        let session = self.shared.current().ok_or(RabbitMQError::NotConnected)?;
        session.reject(delivery, requeue).await
    }

    /// Stops reconnecting and closes the transport. Resolves after
    /// `connection-lost` has fired, or immediately if there was no connection.
    pub async fn shutdown(&self) -> ShutdownOutcome {
        let lost = self.shared.hooks.connection_lost.wait();
        let connected = self.shared.transport_open.load(Ordering::SeqCst);
        info!("Shutting down connection manager");
        self.shutdown.send_replace(true);

        if connected {
            lost.await;
        }

        let supervisor = self.supervisor.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = supervisor {
            if let Err(e) = handle.await {
                warn!("Supervisor task ended abnormally: {}", e);
            }
        }

        if connected {
            ShutdownOutcome::ConnectionShut
        } else {
            ShutdownOutcome::NotConnected
        }
    }
}

/// Resolves once shutdown is requested or the manager is dropped.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn supervise(
    shared: Arc<SharedState>,
    connector: Arc<dyn AmqpConnector>,
    settings: SessionSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut policy = ReconnectPolicy::new(settings.reconnect.clone());
    let mut generation = 0u64;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let info = &shared.info;
        info!("Connecting to {}:{}{}", info.host, info.port, info.vhost);
        let connected = tokio::select! {
            result = connector.connect(info) => Some(result),
            _ = stopped(&mut shutdown) => None,
        };

        match connected {
            None => break,
            Some(Err(e)) => {
                warn!("Failed to connect to {}:{}: {}", info.host, info.port, e);
                shared.hooks.connection_failed.fire(format!(
                    "connection to {}:{} failed: {}",
                    info.host, info.port, e
                ));
            }
            Some(Ok(transport)) => {
                policy.reset();
                generation += 1;
                shared.transport_open.store(true, Ordering::SeqCst);

                let reason = run_session(
                    &shared,
                    transport.clone(),
                    generation,
                    settings.prefetch_count,
                    &mut shutdown,
                )
                .await;

                if let Err(e) = transport.close(&reason).await {
                    debug!("Transport did not close cleanly: {}", e);
                }
                shared.transport_open.store(false, Ordering::SeqCst);
                info!(generation, "Connection lost: {}", reason);
                shared.hooks.connection_lost.fire(reason);
            }
        }

        if *shutdown.borrow() {
            break;
        }

        match policy.next_delay() {
            Some(delay) => {
                info!(attempt = policy.attempts(), "Reconnecting in {:?}", delay);
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = stopped(&mut shutdown) => break,
                }
            }
            None => {
                error!("Giving up after {} reconnection attempts", policy.attempts());
                break;
            }
        }
    }

    debug!("Connection supervisor stopped");
}

/// Runs one session until its transport dies, it reports itself lost, or
/// shutdown is requested. Returns the reason.
async fn run_session(
    shared: &Arc<SharedState>,
    transport: Arc<dyn AmqpTransport>,
    generation: u64,
    prefetch_count: u16,
    shutdown: &mut watch::Receiver<bool>,
) -> String {
    let session = Session::new(generation, transport.clone(), shared.clone(), prefetch_count);

    let started = tokio::select! {
        result = session.start() => Some(result),
        _ = stopped(shutdown) => None,
    };

    let reason = match started {
        None => "shutdown requested".to_string(),
        Some(Err(e)) => format!("session {} did not start: {}", generation, e),
        Some(Ok(())) => tokio::select! {
            reason = transport.closed() => reason,
            reason = session.lost() => reason,
            _ = stopped(shutdown) => "shutdown requested".to_string(),
        },
    };

    session.close().await;
    reason
}
