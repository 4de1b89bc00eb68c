//! Subject → subscriber routing shared by the transports.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::warn;

use crate::{Message, SUBSCRIPTION_CAPACITY};

type Senders = Vec<(u64, mpsc::Sender<Message>)>;

#[derive(Default)]
pub(crate) struct Subscribers {
    routes: Mutex<HashMap<String, Senders>>,
    next_id: AtomicU64,
}

impl Subscribers {
    /// Register a new subscriber on `subject`.
    pub(crate) fn add(&self, subject: &str) -> (u64, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut routes = self.routes.lock().expect("subscribers lock");
        routes.entry(subject.to_string()).or_default().push((id, tx));
        (id, rx)
    }

    /// Remove one subscriber. Returns true if `subject` has none left.
    pub(crate) fn remove(&self, subject: &str, id: u64) -> bool {
        let mut routes = self.routes.lock().expect("subscribers lock");
        let Some(senders) = routes.get_mut(subject) else {
            return true;
        };
        senders.retain(|(sid, _)| *sid != id);
        if senders.is_empty() {
            routes.remove(subject);
            true
        } else {
            false
        }
    }

    /// Deliver a message to every subscriber of its subject. Returns the
    /// number of subscribers that accepted it.
    pub(crate) fn dispatch(&self, msg: Message) -> usize {
        let senders: Senders = {
            let routes = self.routes.lock().expect("subscribers lock");
            match routes.get(&msg.subject) {
                Some(s) => s.clone(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for (_, tx) in senders {
            match tx.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subject = %msg.subject, "subscriber full, message dropped");
                }
                // Receiver dropped; its Subscription::drop cleans up the route.
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    /// Drop every subscriber, closing their channels.
    pub(crate) fn clear(&self) {
        self.routes.lock().expect("subscribers lock").clear();
    }

    pub(crate) fn subjects(&self) -> Vec<String> {
        self.routes
            .lock()
            .expect("subscribers lock")
            .keys()
            .cloned()
            .collect()
    }

    pub(crate) fn count(&self, subject: &str) -> usize {
        self.routes
            .lock()
            .expect("subscribers lock")
            .get(subject)
            .map(Vec::len)
            .unwrap_or(0)
    }
}
