//! surveyor-transport: the pub/sub fabric surveys travel over.
//!
//! The survey engine only needs two primitives: subscribe to a subject and
//! publish a message carrying a reply subject. Anything that offers those
//! can carry surveys.
//!
//! # Architecture
//!
//! ```text
//! Transport (trait)
//!   ├── subscribe(subject) → Subscription (bounded mpsc of Message)
//!   ├── publish(subject, reply, payload)
//!   └── new_inbox() → unique reply subject
//!
//! LocalBus       in-process fabric, sender identity attached to messages
//! MqttTransport  rumqttc client, reply subject carried in an envelope
//! ```

pub mod local;
pub mod mqtt;
mod table;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

pub use local::{LocalBus, Responder};
pub use mqtt::{MqttSettings, MqttTransport};

/// Messages buffered per subscription before new ones are dropped.
pub const SUBSCRIPTION_CAPACITY: usize = 1024;

/// Result type alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("subscribe to {subject} failed: {reason}")]
    Subscribe { subject: String, reason: String },

    #[error("publish to {subject} failed: {reason}")]
    Publish { subject: String, reason: String },
}

/// A message delivered to a subscription.
#[derive(Debug, Clone)]
pub struct Message {
    pub subject: String,
    /// Where the publisher expects an answer.
    pub reply: Option<String>,
    pub payload: Bytes,
    /// Identity of the publisher, when the fabric knows it.
    pub sender: Option<String>,
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    subject: String,
    rx: mpsc::Receiver<Message>,
    on_drop: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(subject: &str, rx: mpsc::Receiver<Message>) -> Self {
        Self {
            subject: subject.to_string(),
            rx,
            on_drop: None,
        }
    }

    /// Run `f` when the subscription is dropped.
    pub fn on_drop(mut self, f: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.on_drop = Some(Box::new(f));
        self
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next message, or `None` once the transport closed the subscription.
    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("subject", &self.subject)
            .finish_non_exhaustive()
    }
}

/// Request/reply and subscribe capability over a pub/sub fabric.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Subscribe to an exact subject.
    async fn subscribe(&self, subject: &str) -> TransportResult<Subscription>;

    /// Publish `payload` on `subject`, optionally naming a reply subject.
    async fn publish(
        &self,
        subject: &str,
        reply: Option<&str>,
        payload: Bytes,
    ) -> TransportResult<()>;

    /// Prefix for reply inboxes created by [`Transport::new_inbox`].
    fn inbox_prefix(&self) -> &str;

    /// Whether the fabric is currently reachable.
    fn is_connected(&self) -> bool;

    /// A subject nobody else will ever publish on.
    fn new_inbox(&self) -> String {
        format!("{}{}", self.inbox_prefix(), uuid::Uuid::new_v4().simple())
    }
}
