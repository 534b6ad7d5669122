// src/rabbitmq/publisher.rs
//
// Outbound buffering. Every send is appended here; whichever session is
// current drains the whole buffer when it is ready.

use std::sync::Mutex;

use tokio::sync::oneshot;

use super::amqp_client::Headers;
use super::message::Payload;

#[derive(Debug, Clone, PartialEq)]
pub struct SendOptions {
    pub mandatory: bool,
    pub headers: Headers,
    pub declare_exchange: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            mandatory: false,
            headers: Headers::new(),
            declare_exchange: true,
        }
    }
}

impl SendOptions {
    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn without_exchange_declare(mut self) -> Self {
        self.declare_exchange = false;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.headers.insert(key.into(), value);
        self
    }
}

/// A send waiting for a ready session.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSend {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Payload,
    pub options: SendOptions,
}

/// Hand-off marker: the transport accepted the message. Not a broker ack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub exchange: String,
    pub routing_key: String,
    pub channel_number: u16,
}

/// Outcome of one buffer drain, in transmit order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendReport {
    pub results: Vec<Result<Confirmation, String>>,
}

impl SendReport {
    pub fn sent(&self) -> usize {
        self.results.iter().filter(|r| r.is_ok()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &String> {
        self.results.iter().filter_map(|r| r.as_ref().err())
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

struct Queued {
    send: PendingSend,
    waiter: Option<oneshot::Sender<SendReport>>,
}

/// Callers whose sends were taken by one drain; they all get its report.
#[derive(Default)]
pub struct ReportWaiters(Vec<oneshot::Sender<SendReport>>);

impl ReportWaiters {
    pub fn deliver(self, report: &SendReport) {
        for waiter in self.0 {
            // The caller may have stopped waiting.
            let _ = waiter.send(report.clone());
        }
    }
}

/// Ordered outbound buffer shared across reconnects.
#[derive(Default)]
pub struct SendBuffer {
    pending: Mutex<Vec<Queued>>,
}

impl SendBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, send: PendingSend) {
        self.lock().push(Queued { send, waiter: None });
    }

    /// Queues a send and returns the receiver for the report of whichever
    /// drain ends up transmitting it.
    pub fn push_tracked(&self, send: PendingSend) -> oneshot::Receiver<SendReport> {
        let (waiter, report) = oneshot::channel();
        self.lock().push(Queued {
            send,
            waiter: Some(waiter),
        });
        report
    }

    /// Takes everything queued so far; a concurrent drain gets what arrives later.
    pub fn take_all(&self) -> (Vec<PendingSend>, ReportWaiters) {
        let queued = std::mem::take(&mut *self.lock());
        let mut sends = Vec::with_capacity(queued.len());
        let mut waiters = ReportWaiters::default();
        for Queued { send, waiter } in queued {
            sends.push(send);
            waiters.0.extend(waiter);
        }
        (sends, waiters)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Queued>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
