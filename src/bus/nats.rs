//! NATS message bus

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{BusError, BusResult, Delivery, MessageBus, Subscription};
use crate::config::BusConfig;

/// Message bus backed by a NATS server connection
#[derive(Clone)]
pub struct NatsBus {
    client: async_nats::Client,
    queue_depth: usize,
}

impl NatsBus {
    /// Connect using the configured address and credentials
    ///
    /// Username and password take precedence over a credentials file.
    pub async fn connect(config: &BusConfig) -> BusResult<Self> {
        let addr = config.address();
        let connect_error = |message: String| BusError::Connect {
            addr: addr.clone(),
            message,
        };

        let mut options = async_nats::ConnectOptions::new();
        match (&config.username, &config.password, &config.credentials_file) {
            (Some(user), Some(password), _) => {
                options = options.user_and_password(user.clone(), password.clone());
            }
            (_, _, Some(path)) => {
                if !path.exists() {
                    return Err(connect_error(format!(
                        "credentials file {} does not exist",
                        path.display()
                    )));
                }
                options = options
                    .credentials_file(path)
                    .await
                    .map_err(|e| connect_error(e.to_string()))?;
            }
            _ => {}
        }

        tracing::debug!("Connecting to NATS at {}", addr);
        let client = options
            .connect(addr.as_str())
            .await
            .map_err(|e| connect_error(e.to_string()))?;
        tracing::info!("Connected to NATS at {}", addr);

        Ok(Self {
            client,
            queue_depth: config.outstanding_messages.max(1),
        })
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> BusResult<()> {
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| BusError::Publish {
                subject: subject.to_string(),
                message: e.to_string(),
            })
    }

    async fn subscribe(&self, subject: &str) -> BusResult<Subscription> {
        let mut subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| BusError::Subscribe {
                subject: subject.to_string(),
                message: e.to_string(),
            })?;
        tracing::debug!("Subscribed to {}", subject);

        let (sender, receiver) = mpsc::channel(self.queue_depth);
        tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                let delivery = Delivery {
                    subject: message.subject.to_string(),
                    payload: message.payload,
                    reply: message.reply.map(|r| r.to_string()),
                };
                if sender.send(delivery).await.is_err() {
                    break;
                }
            }
        });

        Ok(Subscription::new(subject, receiver))
    }

    async fn request(&self, subject: &str, payload: Bytes, timeout: Duration) -> BusResult<Bytes> {
        match tokio::time::timeout(timeout, self.client.request(subject.to_string(), payload)).await {
            Ok(Ok(message)) => Ok(message.payload),
            Ok(Err(e)) => Err(BusError::Request {
                subject: subject.to_string(),
                message: e.to_string(),
            }),
            Err(_) => Err(BusError::Timeout {
                subject: subject.to_string(),
                timeout_ms: timeout.as_millis(),
            }),
        }
    }
}
