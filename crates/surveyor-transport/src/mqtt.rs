//! MQTT adapter.
//!
//! MQTT has no native reply subject, so a request is published as a small
//! JSON envelope `{"reply_to": "...", "payload": "..."}`. Incoming messages
//! that decode as an envelope surface with `reply` set; anything else is
//! delivered raw. MQTT does not identify publishers, so `sender` is always
//! `None` here.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::table::Subscribers;
use crate::{Message, Subscription, Transport, TransportError, TransportResult};

const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);
const REQUEST_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub credentials: Option<(String, String)>,
    pub connect_timeout: Duration,
    pub keep_alive: Duration,
    pub inbox_prefix: String,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "surveyor".to_string(),
            credentials: None,
            connect_timeout: Duration::from_secs(5),
            keep_alive: Duration::from_secs(15),
            inbox_prefix: "surveyor/_INBOX/".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    reply_to: String,
    payload: String,
}

struct Shared {
    subscribers: Arc<Subscribers>,
    connected: AtomicBool,
}

pub struct MqttTransport {
    client: AsyncClient,
    shared: Arc<Shared>,
    inbox_prefix: String,
    event_loop: JoinHandle<()>,
}

impl MqttTransport {
    /// Connect to the broker. Fails if no ConnAck arrives within
    /// `connect_timeout` or the broker refuses the session.
    pub async fn connect(settings: MqttSettings) -> TransportResult<Self> {
        let mut opts = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        opts.set_keep_alive(settings.keep_alive);
        opts.set_clean_session(true);
        if let Some((user, password)) = &settings.credentials {
            opts.set_credentials(user, password);
        }

        let (client, eventloop) = AsyncClient::new(opts, REQUEST_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            subscribers: Arc::new(Subscribers::default()),
            connected: AtomicBool::new(false),
        });

        let (ready_tx, ready_rx) = oneshot::channel();
        let event_loop = tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            Arc::clone(&shared),
            ready_tx,
        ));

        let outcome = tokio::time::timeout(settings.connect_timeout, ready_rx).await;
        let failure = match outcome {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(reason))) => Some(reason),
            Ok(Err(_)) => Some("event loop stopped".to_string()),
            Err(_) => Some(format!(
                "no answer from {}:{} within {:?}",
                settings.host, settings.port, settings.connect_timeout
            )),
        };
        if let Some(reason) = failure {
            event_loop.abort();
            return Err(TransportError::Connect(reason));
        }

        info!(host = %settings.host, port = settings.port, "connected to broker");
        Ok(Self {
            client,
            shared,
            inbox_prefix: settings.inbox_prefix,
            event_loop,
        })
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    shared: Arc<Shared>,
    ready: oneshot::Sender<Result<(), String>>,
) {
    let mut ready = Some(ready);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    let reason = format!("broker refused connection: {:?}", ack.code);
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Err(reason));
                        return;
                    }
                    warn!(%reason, "reconnect refused");
                    continue;
                }

                shared.connected.store(true, Ordering::SeqCst);
                match ready.take() {
                    Some(tx) => {
                        let _ = tx.send(Ok(()));
                    }
                    None => {
                        // Clean sessions forget subscriptions across reconnects.
                        for subject in shared.subscribers.subjects() {
                            if let Err(e) = client.try_subscribe(&subject, QoS::AtMostOnce) {
                                warn!(%subject, error = %e, "resubscribe failed");
                            }
                        }
                        info!("reconnected to broker");
                    }
                }
            }
            Ok(Event::Incoming(Incoming::Publish(p))) => {
                let msg = decode(&p.topic, p.payload);
                if shared.subscribers.dispatch(msg) == 0 {
                    debug!(topic = %p.topic, "message with no subscriber");
                }
            }
            Ok(Event::Incoming(Incoming::Disconnect)) => {
                shared.connected.store(false, Ordering::SeqCst);
                warn!("broker sent disconnect");
            }
            Ok(_) => {}
            Err(e) => {
                shared.connected.store(false, Ordering::SeqCst);
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(e.to_string()));
                    return;
                }
                warn!(error = %e, "broker connection error");
                tokio::time::sleep(RECONNECT_BACKOFF).await;
            }
        }
    }
}

fn decode(topic: &str, payload: Bytes) -> Message {
    match serde_json::from_slice::<Envelope>(&payload) {
        Ok(env) => Message {
            subject: topic.to_string(),
            reply: Some(env.reply_to),
            payload: Bytes::from(env.payload.into_bytes()),
            sender: None,
        },
        Err(_) => Message {
            subject: topic.to_string(),
            reply: None,
            payload,
            sender: None,
        },
    }
}

fn encode(reply: Option<&str>, payload: Bytes) -> Result<Vec<u8>, String> {
    match reply {
        None => Ok(payload.to_vec()),
        Some(reply_to) => {
            let payload = String::from_utf8(payload.to_vec())
                .map_err(|_| "request payload is not UTF-8".to_string())?;
            serde_json::to_vec(&Envelope {
                reply_to: reply_to.to_string(),
                payload,
            })
            .map_err(|e| e.to_string())
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn subscribe(&self, subject: &str) -> TransportResult<Subscription> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let (id, rx) = self.shared.subscribers.add(subject);
        if let Err(e) = self.client.subscribe(subject, QoS::AtMostOnce).await {
            self.shared.subscribers.remove(subject, id);
            return Err(TransportError::Subscribe {
                subject: subject.to_string(),
                reason: e.to_string(),
            });
        }

        let subscribers = Arc::clone(&self.shared.subscribers);
        let client = self.client.clone();
        let owned = subject.to_string();
        Ok(Subscription::new(subject, rx).on_drop(move || {
            if subscribers.remove(&owned, id) {
                let _ = client.try_unsubscribe(&owned);
            }
        }))
    }

    async fn publish(
        &self,
        subject: &str,
        reply: Option<&str>,
        payload: Bytes,
    ) -> TransportResult<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let body = encode(reply, payload).map_err(|reason| TransportError::Publish {
            subject: subject.to_string(),
            reason,
        })?;
        self.client
            .publish(subject, QoS::AtMostOnce, false, body)
            .await
            .map_err(|e| TransportError::Publish {
                subject: subject.to_string(),
                reason: e.to_string(),
            })
    }

    fn inbox_prefix(&self) -> &str {
        &self.inbox_prefix
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_wrapped_in_envelope() {
        let body = encode(Some("inbox/1"), Bytes::from_static(br#"{"scope":"full"}"#)).unwrap();
        let msg = decode("ping", Bytes::from(body));
        assert_eq!(msg.reply.as_deref(), Some("inbox/1"));
        assert_eq!(&msg.payload[..], br#"{"scope":"full"}"#);
        assert!(msg.sender.is_none());
    }

    #[test]
    fn plain_message_passes_through() {
        let body = encode(None, Bytes::from_static(b"{\"server\":{}}")).unwrap();
        let msg = decode("inbox/1", Bytes::from(body));
        assert!(msg.reply.is_none());
        assert_eq!(&msg.payload[..], b"{\"server\":{}}");
    }

    #[test]
    fn non_utf8_request_is_rejected() {
        assert!(encode(Some("r"), Bytes::from_static(&[0xff, 0xfe])).is_err());
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        // Grab a free port and release it so nothing listens there.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let settings = MqttSettings {
            port,
            connect_timeout: Duration::from_secs(2),
            ..MqttSettings::default()
        };
        let err = MqttTransport::connect(settings).await.err().unwrap();
        assert!(matches!(err, TransportError::Connect(_)));
    }
}
