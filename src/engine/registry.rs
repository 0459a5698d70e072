//! Live connection table.
//!
//! A single actor task owns the routing-key → [`Sink`] map; every register,
//! unregister and lookup goes through its command channel. The payload itself
//! is handed to the sink by the sending task, so a stalled sink only holds up
//! its own sender and never the actor. Sends issued one after another to a key
//! reach its sink in that order. Delivery is at-most-once: a key with no live
//! sink drops the payload, and a sink that does not accept a payload within the
//! send timeout is closed and removed.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::location::SubjectType;
use crate::observability::metrics::Metrics;

pub fn subject_key(subject_type: SubjectType, subject_id: &str) -> String {
    format!("{subject_type}:{subject_id}")
}

pub fn order_key(order_id: &str) -> String {
    format!("order:{order_id}")
}

pub fn driver_key(driver_id: &str) -> String {
    subject_key(SubjectType::Driver, driver_id)
}

struct SinkShutdown {
    closed: AtomicBool,
    notify: Notify,
}

/// Outbound half of one live connection.
///
/// Clones share identity and the close signal; the connection's writer task
/// holds the matching [`SinkReceiver`].
#[derive(Clone)]
pub struct Sink {
    id: Uuid,
    tx: mpsc::Sender<String>,
    shutdown: Arc<SinkShutdown>,
}

pub struct SinkReceiver {
    rx: mpsc::Receiver<String>,
    shutdown: Arc<SinkShutdown>,
}

#[derive(Debug, thiserror::Error)]
enum TransportClosed {
    #[error("sink already closed")]
    Closed,
    #[error("receiver dropped")]
    ReceiverGone,
    #[error("send timed out after {0:?}")]
    TimedOut(Duration),
}

impl Sink {
    pub fn channel(capacity: usize) -> (Sink, SinkReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let shutdown = Arc::new(SinkShutdown {
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        });

        (
            Sink {
                id: Uuid::new_v4(),
                tx,
                shutdown: shutdown.clone(),
            },
            SinkReceiver { rx, shutdown },
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Signals the writer to stop. Returns `true` only for the call that
    /// actually closed the sink.
    pub fn close(&self) -> bool {
        if self.shutdown.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shutdown.notify.notify_one();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.closed.load(Ordering::Acquire)
    }

    async fn deliver(&self, payload: String, timeout: Duration) -> Result<(), TransportClosed> {
        if self.is_closed() {
            return Err(TransportClosed::Closed);
        }

        let payload = match self.tx.try_send(payload) {
            Ok(()) => return Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => return Err(TransportClosed::ReceiverGone),
            Err(mpsc::error::TrySendError::Full(payload)) => payload,
        };

        match tokio::time::timeout(timeout, self.tx.send(payload)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportClosed::ReceiverGone),
            Err(_) => Err(TransportClosed::TimedOut(timeout)),
        }
    }
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sink")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SinkReceiver {
    /// Next payload, or `None` once the sink is closed or every sender is gone.
    pub async fn recv(&mut self) -> Option<String> {
        if self.shutdown.closed.load(Ordering::Acquire) {
            return None;
        }

        tokio::select! {
            biased;
            _ = self.shutdown.notify.notified() => None,
            payload = self.rx.recv() => payload,
        }
    }
}

enum Command {
    Register {
        key: String,
        sink: Sink,
    },
    Unregister {
        key: String,
        sink_id: Uuid,
    },
    Lookup {
        key: String,
        respond_to: oneshot::Sender<Option<Sink>>,
    },
    CloseAll {
        respond_to: oneshot::Sender<usize>,
    },
    Len {
        respond_to: oneshot::Sender<usize>,
    },
}

/// Handle to the registry actor. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionRegistry {
    tx: mpsc::Sender<Command>,
    send_timeout: Duration,
}

impl ConnectionRegistry {
    pub fn spawn(command_buffer: usize, send_timeout: Duration, metrics: Metrics) -> Self {
        let (tx, rx) = mpsc::channel(command_buffer.max(1));
        let actor = RegistryActor {
            sinks: HashMap::new(),
            metrics,
        };
        tokio::spawn(actor.run(rx));

        Self { tx, send_timeout }
    }

    pub async fn register(&self, key: impl Into<String>, sink: Sink) {
        let key = key.into();
        if let Err(mpsc::error::SendError(command)) =
            self.tx.send(Command::Register { key, sink }).await
        {
            if let Command::Register { key, sink } = command {
                warn!(key = %key, "registry stopped; closing connection");
                sink.close();
            }
        }
    }

    pub async fn unregister(&self, key: impl Into<String>, sink: &Sink) {
        let command = Command::Unregister {
            key: key.into(),
            sink_id: sink.id(),
        };
        if self.tx.send(command).await.is_err() {
            debug!("registry stopped before unregister");
        }
    }

    /// Hands `payload` to the sink registered under `key`. Returns `true` if a
    /// live sink accepted it; there is no acknowledgement from the client.
    pub async fn send_to(&self, key: impl Into<String>, payload: impl Into<String>) -> bool {
        let key = key.into();
        let (respond_to, response) = oneshot::channel();
        let command = Command::Lookup {
            key: key.clone(),
            respond_to,
        };
        if self.tx.send(command).await.is_err() {
            return false;
        }
        let Ok(Some(sink)) = response.await else {
            return false;
        };

        match sink.deliver(payload.into(), self.send_timeout).await {
            Ok(()) => true,
            Err(reason) => {
                warn!(key = %key, %reason, "dropping dead connection");
                sink.close();
                self.unregister(key, &sink).await;
                false
            }
        }
    }

    /// Closes every sink and empties the table. Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let (respond_to, response) = oneshot::channel();
        if self.tx.send(Command::CloseAll { respond_to }).await.is_err() {
            return 0;
        }
        response.await.unwrap_or(0)
    }

    pub async fn len(&self) -> usize {
        let (respond_to, response) = oneshot::channel();
        if self.tx.send(Command::Len { respond_to }).await.is_err() {
            return 0;
        }
        response.await.unwrap_or(0)
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

struct RegistryActor {
    sinks: HashMap<String, Sink>,
    metrics: Metrics,
}

impl RegistryActor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        debug!("connection registry started");

        while let Some(command) = rx.recv().await {
            match command {
                Command::Register { key, sink } => self.register(key, sink),
                Command::Unregister { key, sink_id } => self.unregister(&key, sink_id),
                Command::Lookup { key, respond_to } => {
                    let _ = respond_to.send(self.sinks.get(&key).cloned());
                }
                Command::CloseAll { respond_to } => {
                    let _ = respond_to.send(self.close_all());
                }
                Command::Len { respond_to } => {
                    let _ = respond_to.send(self.sinks.len());
                }
            }
        }

        let closed = self.close_all();
        info!(closed, "connection registry stopped");
    }

    fn register(&mut self, key: String, sink: Sink) {
        let sink_id = sink.id();
        if let Some(previous) = self.sinks.insert(key.clone(), sink) {
            if previous.id() != sink_id {
                previous.close();
                info!(key = %key, "replaced existing connection");
            }
        }
        self.metrics.active_connections.set(self.sinks.len() as i64);
    }

    fn unregister(&mut self, key: &str, sink_id: Uuid) {
        let current = self.sinks.get(key).map(Sink::id);
        if current == Some(sink_id) {
            if let Some(sink) = self.sinks.remove(key) {
                sink.close();
            }
            self.metrics.active_connections.set(self.sinks.len() as i64);
        }
    }

    fn close_all(&mut self) -> usize {
        let closed = self.sinks.len();
        for (_, sink) in self.sinks.drain() {
            sink.close();
        }
        self.metrics.active_connections.set(0);
        closed
    }
}
