//! In-process message bus
//!
//! Subjects live in a shared table; every matching subscription gets its
//! own copy of a published message. Requests use a private `_INBOX.<uuid>`
//! reply subject.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::{subject_matches, BusError, BusResult, Delivery, MessageBus, Subscription};

/// Queue depth of each subscription unless configured otherwise
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

struct Subscriber {
    pattern: String,
    sender: mpsc::Sender<Delivery>,
}

/// Message bus living entirely inside this process
#[derive(Clone)]
pub struct InProcessBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    queue_depth: usize,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self::with_queue_depth(DEFAULT_QUEUE_DEPTH)
    }

    pub fn with_queue_depth(queue_depth: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            queue_depth: queue_depth.max(1),
        }
    }

    /// Live senders for a subject; closed subscriptions are pruned
    fn matching(&self, subject: &str) -> BusResult<Vec<mpsc::Sender<Delivery>>> {
        let mut subscribers = self.subscribers.lock().map_err(|_| BusError::Closed)?;
        subscribers.retain(|s| !s.sender.is_closed());
        Ok(subscribers
            .iter()
            .filter(|s| subject_matches(&s.pattern, subject))
            .map(|s| s.sender.clone())
            .collect())
    }

    /// Hand a copy to every matching subscription without waiting
    ///
    /// A full queue drops the message for that subscriber only. Returns the
    /// number of subscriptions the subject reached, full or not.
    fn deliver(&self, subject: &str, payload: Bytes, reply: Option<String>) -> BusResult<usize> {
        let targets = self.matching(subject)?;
        let mut reached = 0;
        for sender in targets {
            let delivery = Delivery {
                subject: subject.to_string(),
                payload: payload.clone(),
                reply: reply.clone(),
            };
            match sender.try_send(delivery) {
                Ok(()) => reached += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!("Slow consumer on {}, message dropped", subject);
                    reached += 1;
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        Ok(reached)
    }

    fn register(&self, subject: &str, depth: usize) -> BusResult<Subscription> {
        let (sender, receiver) = mpsc::channel(depth);
        let mut subscribers = self.subscribers.lock().map_err(|_| BusError::Closed)?;
        subscribers.push(Subscriber {
            pattern: subject.to_string(),
            sender,
        });
        Ok(Subscription::new(subject, receiver))
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InProcessBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> BusResult<()> {
        let reached = self.deliver(subject, payload, None)?;
        tracing::trace!("Published to {} ({} subscribers)", subject, reached);
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> BusResult<Subscription> {
        if subject.is_empty() {
            return Err(BusError::Subscribe {
                subject: subject.to_string(),
                message: "empty subject".to_string(),
            });
        }
        self.register(subject, self.queue_depth)
    }

    async fn request(&self, subject: &str, payload: Bytes, timeout: Duration) -> BusResult<Bytes> {
        let inbox = format!("_INBOX.{}", uuid::Uuid::new_v4().simple());
        let mut replies = self.register(&inbox, 1)?;

        let reached = self.deliver(subject, payload, Some(inbox))?;
        if reached == 0 {
            return Err(BusError::NoResponders(subject.to_string()));
        }

        match tokio::time::timeout(timeout, replies.next()).await {
            Ok(Some(delivery)) => Ok(delivery.payload),
            Ok(None) => Err(BusError::Closed),
            Err(_) => Err(BusError::Timeout {
                subject: subject.to_string(),
                timeout_ms: timeout.as_millis(),
            }),
        }
    }
}
