//! Node agent server
//!
//! Subscribes to the node's request subject and answers each inbound
//! message through the dispatcher. Deliveries and the messages inside one
//! delivery are handled strictly in order by a single task.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, RwLock};

use super::dispatcher::Dispatcher;
use crate::bus::{BusError, Delivery, MessageBus};
use crate::protocol::{tags, ControlMessage};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Events emitted by the server
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Subscribed and consuming
    Started { subject: String },
    /// A reply was sent
    Replied { name: String, level: String },
    /// A message was handled without sending a reply
    Dropped { name: String, reason: String },
    /// A delivery or reply failed
    Error { message: String },
    /// Consumption loop ended
    Stopped,
}

/// Control server for one node
pub struct ControlServer {
    /// Request router
    dispatcher: Arc<Dispatcher>,
    /// Transport
    bus: Arc<dyn MessageBus>,
    /// Subject to consume requests from
    subject: String,
    /// Event sender
    event_tx: mpsc::Sender<ServerEvent>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::Receiver<ServerEvent>>,
    /// Shutdown signal
    shutdown_tx: Option<mpsc::Sender<()>>,
    /// Whether the consumption loop is running
    running: Arc<RwLock<bool>>,
}

impl ControlServer {
    pub fn new(dispatcher: Dispatcher, bus: Arc<dyn MessageBus>, subject: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            dispatcher: Arc::new(dispatcher),
            bus,
            subject: subject.into(),
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx: None,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.event_rx.take()
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Subscribe and spawn the consumption loop
    pub async fn start(&mut self) -> ServerResult<()> {
        {
            let running = self.running.read().await;
            if *running {
                return Err(ServerError::AlreadyRunning);
            }
        }

        let mut subscription = self.bus.subscribe(&self.subject).await?;
        tracing::info!(
            "Serving controls for {} on {}",
            self.dispatcher.hostname(),
            self.subject
        );

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        {
            let mut running = self.running.write().await;
            *running = true;
        }

        emit(
            &self.event_tx,
            ServerEvent::Started {
                subject: self.subject.clone(),
            },
        );

        let dispatcher = self.dispatcher.clone();
        let bus = self.bus.clone();
        let event_tx = self.event_tx.clone();
        let running = self.running.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Server shutdown requested");
                        break;
                    }
                    delivery = subscription.next() => {
                        match delivery {
                            Some(delivery) => {
                                let finished = process_delivery(
                                    &dispatcher,
                                    bus.as_ref(),
                                    delivery,
                                    &mut shutdown_rx,
                                    &event_tx,
                                )
                                .await;
                                if !finished {
                                    tracing::info!("Server shutdown requested, abandoning batch");
                                    break;
                                }
                            }
                            None => {
                                tracing::warn!("Subscription to {} closed", subscription.subject());
                                break;
                            }
                        }
                    }
                }
            }

            let mut running = running.write().await;
            *running = false;

            emit(&event_tx, ServerEvent::Stopped);
        });

        Ok(())
    }

    /// Signal the consumption loop to stop
    ///
    /// Messages not yet handled are lost.
    pub async fn stop(&mut self) -> ServerResult<()> {
        {
            let running = self.running.read().await;
            if !*running {
                return Err(ServerError::NotRunning);
            }
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }

        Ok(())
    }

    /// Check if the server is running
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

/// Events are best effort; a full queue never stalls dispatch
fn emit(event_tx: &mpsc::Sender<ServerEvent>, event: ServerEvent) {
    if event_tx.try_send(event).is_err() {
        tracing::trace!("Server event dropped");
    }
}

fn shutdown_requested(shutdown_rx: &mut mpsc::Receiver<()>) -> bool {
    !matches!(shutdown_rx.try_recv(), Err(TryRecvError::Empty))
}

/// Handle every message of one delivery
///
/// Returns `false` if a shutdown was requested before the batch finished.
async fn process_delivery(
    dispatcher: &Dispatcher,
    bus: &dyn MessageBus,
    delivery: Delivery,
    shutdown_rx: &mut mpsc::Receiver<()>,
    event_tx: &mpsc::Sender<ServerEvent>,
) -> bool {
    let messages = match ControlMessage::decode(&delivery.payload) {
        Ok(messages) => messages,
        Err(e) => {
            tracing::error!("Failed to decode message on {}: {}", delivery.subject, e);
            emit(
                event_tx,
                ServerEvent::Error {
                    message: format!("decode failed: {}", e),
                },
            );
            return true;
        }
    };

    for message in messages {
        if shutdown_requested(shutdown_rx) {
            return false;
        }

        let reply = match dispatcher.handle(&message) {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                emit(
                    event_tx,
                    ServerEvent::Dropped {
                        name: message.name().to_string(),
                        reason: "non-local command".to_string(),
                    },
                );
                continue;
            }
            Err(e) => {
                tracing::error!("Cannot answer {}: {}", message.name(), e);
                emit(event_tx, ServerEvent::Error { message: e.to_string() });
                continue;
            }
        };

        let Some(reply_to) = delivery.reply.as_deref() else {
            tracing::warn!("No reply address for {}, discarding reply", message.name());
            emit(
                event_tx,
                ServerEvent::Dropped {
                    name: message.name().to_string(),
                    reason: "no reply address".to_string(),
                },
            );
            continue;
        };

        match bus.publish(reply_to, reply.encode()).await {
            Ok(()) => emit(
                event_tx,
                ServerEvent::Replied {
                    name: reply.name().to_string(),
                    level: reply.tag(tags::LEVEL).unwrap_or_default().to_string(),
                },
            ),
            Err(e) => {
                tracing::error!("Failed to send reply for {}: {}", message.name(), e);
                emit(event_tx, ServerEvent::Error { message: e.to_string() });
            }
        }
    }

    true
}
