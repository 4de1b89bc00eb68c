//! In-process pub/sub bus.
//!
//! Every publish is tagged with the publisher's identity, so subscribers can
//! tell who actually sent a message. Responders stand in for cluster servers
//! answering surveys.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::table::Subscribers;
use crate::{Message, Subscription, Transport, TransportError, TransportResult};

const DEFAULT_INBOX_PREFIX: &str = "surveyor/_INBOX/";

#[derive(Clone)]
pub struct LocalBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    subscribers: Arc<Subscribers>,
    connected: AtomicBool,
    published: AtomicU64,
    identity: String,
    inbox_prefix: String,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::with_identity("surveyor")
    }

    /// A bus whose own publishes carry `identity` as the sender.
    pub fn with_identity(identity: &str) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Arc::new(Subscribers::default()),
                connected: AtomicBool::new(true),
                published: AtomicU64::new(0),
                identity: identity.to_string(),
                inbox_prefix: DEFAULT_INBOX_PREFIX.to_string(),
            }),
        }
    }

    /// Mark the bus reachable or not. Going down closes every subscription.
    pub fn set_connected(&self, connected: bool) {
        let was = self.inner.connected.swap(connected, Ordering::SeqCst);
        if was && !connected {
            self.inner.subscribers.clear();
            debug!("local bus disconnected");
        }
    }

    /// Publish on behalf of `sender`.
    pub fn publish_as(
        &self,
        sender: &str,
        subject: &str,
        reply: Option<&str>,
        payload: Bytes,
    ) -> TransportResult<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.dispatch(Message {
            subject: subject.to_string(),
            reply: reply.map(str::to_string),
            payload,
            sender: Some(sender.to_string()),
        });
        Ok(())
    }

    /// Total messages published since the bus was created.
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.inner.subscribers.count(subject)
    }

    /// Answer every request on `subject` as `sender`. `reply_fn` builds the
    /// answer; returning `None` stays silent for that request.
    pub async fn respond<F>(
        &self,
        subject: &str,
        sender: &str,
        reply_fn: F,
    ) -> TransportResult<Responder>
    where
        F: Fn(&Message) -> Option<Bytes> + Send + Sync + 'static,
    {
        self.respond_after(subject, sender, Duration::ZERO, reply_fn)
            .await
    }

    /// Like [`LocalBus::respond`], but each answer is sent `delay` after the
    /// request arrived.
    pub async fn respond_after<F>(
        &self,
        subject: &str,
        sender: &str,
        delay: Duration,
        reply_fn: F,
    ) -> TransportResult<Responder>
    where
        F: Fn(&Message) -> Option<Bytes> + Send + Sync + 'static,
    {
        let mut sub = self.subscribe(subject).await?;
        let bus = self.clone();
        let sender = sender.to_string();

        let handle = tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                let Some(reply) = msg.reply.as_deref() else {
                    continue;
                };
                let Some(payload) = reply_fn(&msg) else {
                    continue;
                };
                if delay.is_zero() {
                    let _ = bus.publish_as(&sender, reply, None, payload);
                } else {
                    let bus = bus.clone();
                    let sender = sender.clone();
                    let reply = reply.to_string();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = bus.publish_as(&sender, &reply, None, payload);
                    });
                }
            }
        });

        Ok(Responder { handle })
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LocalBus {
    async fn subscribe(&self, subject: &str) -> TransportResult<Subscription> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let (id, rx) = self.inner.subscribers.add(subject);
        let subscribers = Arc::clone(&self.inner.subscribers);
        let owned = subject.to_string();
        Ok(Subscription::new(subject, rx).on_drop(move || {
            subscribers.remove(&owned, id);
        }))
    }

    async fn publish(
        &self,
        subject: &str,
        reply: Option<&str>,
        payload: Bytes,
    ) -> TransportResult<()> {
        let identity = self.inner.identity.clone();
        self.publish_as(&identity, subject, reply, payload)
    }

    fn inbox_prefix(&self) -> &str {
        &self.inner.inbox_prefix
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}

/// A running responder. Dropping it stops answering.
pub struct Responder {
    handle: JoinHandle<()>,
}

impl Responder {
    pub fn shutdown(self) {
        // Drop aborts the task.
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
