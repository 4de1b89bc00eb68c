//! surveyor-engine: one scatter/gather round per call.
//!
//! A survey subscribes to a fresh reply inbox, publishes a single request on
//! the scope's subject, then gathers replies until either the expected
//! number of distinct servers answered or the deadline passed. A deadline
//! with missing answers is a partial survey, not an error.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use surveyor_core::{NodeReport, SurveyScope, SurveySnapshot};
use surveyor_transport::{Transport, TransportError};

/// Result type alias for surveys.
pub type SurveyResult<T> = Result<T, SurveyError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SurveyError {
    #[error("transport unavailable: {0}")]
    Transport(#[from] TransportError),

    #[error("failed to encode survey request: {0}")]
    Encode(String),
}

#[derive(Debug, Serialize)]
struct SurveyRequest {
    scope: SurveyScope,
}

/// Sends surveys on one subject and gathers the answers.
pub struct SurveyEngine {
    transport: Arc<dyn Transport>,
    subject: String,
    scope: SurveyScope,
    /// Most distinct servers any single survey has heard from.
    high_water: AtomicUsize,
}

impl SurveyEngine {
    pub fn new(transport: Arc<dyn Transport>, subject: &str, scope: SurveyScope) -> Self {
        Self {
            transport,
            subject: subject.to_string(),
            scope,
            high_water: AtomicUsize::new(0),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn scope(&self) -> SurveyScope {
        self.scope
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Run one survey.
    ///
    /// With `expected` set, collection stops as soon as that many distinct
    /// servers answered. Otherwise it runs for the full `timeout` and the
    /// snapshot's expected count is the high-water mark of servers seen.
    pub async fn survey(
        &self,
        timeout: Duration,
        expected: Option<usize>,
    ) -> SurveyResult<SurveySnapshot> {
        let epoch = unix_now();
        let started = Instant::now();
        let deadline = started + timeout;

        let request = serde_json::to_vec(&SurveyRequest { scope: self.scope })
            .map_err(|e| SurveyError::Encode(e.to_string()))?;

        let inbox = self.transport.new_inbox();
        let mut sub = self.transport.subscribe(&inbox).await?;
        self.transport
            .publish(&self.subject, Some(&inbox), Bytes::from(request))
            .await?;

        let mut replies: BTreeMap<String, NodeReport> = BTreeMap::new();
        let mut malformed = 0usize;
        let mut duplicates = 0usize;

        loop {
            if expected.is_some_and(|n| replies.len() >= n) {
                debug!(subject = %self.subject, "all expected servers answered");
                break;
            }

            let msg = match tokio::time::timeout_at(deadline, sub.next()).await {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    warn!(subject = %self.subject, "reply subscription closed mid-survey");
                    // Replies missing because the link dropped say nothing about the servers.
                    if !self.transport.is_connected() {
                        return Err(TransportError::NotConnected.into());
                    }
                    break;
                }
                Err(_) => break,
            };

            let report = match NodeReport::parse(&msg.payload, msg.sender.as_deref()) {
                Ok(report) => report,
                Err(e) => {
                    malformed += 1;
                    warn!(error = %e, "dropping malformed reply");
                    continue;
                }
            };

            let report = match self.scope {
                SurveyScope::Full => report,
                SurveyScope::Basic => report.without_core(),
            };

            let server_id = report.identity.server_id.clone();
            if replies.contains_key(&server_id) {
                duplicates += 1;
                warn!(%server_id, "dropping duplicate reply");
                continue;
            }
            replies.insert(server_id, report);
        }
        drop(sub);

        let received = replies.len();
        let seen = self.high_water.fetch_max(received, Ordering::Relaxed).max(received);
        let expected_count = expected.unwrap_or(seen);

        let snapshot = SurveySnapshot {
            epoch,
            duration: started.elapsed(),
            scope: self.scope,
            replies,
            expected_count,
            received_count: received,
            malformed_count: malformed,
            duplicate_count: duplicates,
        };

        debug!(
            subject = %self.subject,
            received = snapshot.received_count,
            expected = snapshot.expected_count,
            malformed = snapshot.malformed_count,
            duplicates = snapshot.duplicate_count,
            elapsed_ms = snapshot.duration.as_millis() as u64,
            "survey complete"
        );
        if snapshot.received_count < snapshot.expected_count {
            warn!(
                missing = snapshot.missing_count(),
                "survey finished with servers missing"
            );
        }

        Ok(snapshot)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use surveyor_core::{CoreReport, CoreStats, DataStats, NodeIdentity, RouteReport};
    use surveyor_transport::{LocalBus, Responder};

    const SUBJECT: &str = "surveyor/sys/req/server/ping";

    fn report(id: &str) -> NodeReport {
        NodeReport {
            identity: NodeIdentity::new(id, &format!("name-{id}"), "c1", "127.0.0.1"),
            core: CoreStats::Present(CoreReport {
                start_epoch: 1,
                mem_bytes: 1024,
                cores: 2,
                cpu_percent: 1.5,
                connections: 1,
                total_connections: 1,
                subscriptions: 1,
                sent: DataStats::default(),
                received: DataStats::default(),
                slow_consumers: 0,
            }),
            routes: vec![RouteReport {
                route_id: 1,
                name: "peer".to_string(),
                sent: DataStats::default(),
                received: DataStats::default(),
                pending_bytes: 0,
            }],
            gateways: Vec::new(),
        }
    }

    async fn server(bus: &LocalBus, id: &str) -> Responder {
        let payload = Bytes::from(report(id).to_json().unwrap());
        bus.respond(SUBJECT, id, move |_| Some(payload.clone()))
            .await
            .unwrap()
    }

    fn engine(bus: &LocalBus, scope: SurveyScope) -> SurveyEngine {
        SurveyEngine::new(Arc::new(bus.clone()), SUBJECT, scope)
    }

    #[tokio::test]
    async fn gathers_all_replies() {
        let bus = LocalBus::new();
        let _a = server(&bus, "A").await;
        let _b = server(&bus, "B").await;
        let _c = server(&bus, "C").await;

        let snapshot = engine(&bus, SurveyScope::Full)
            .survey(Duration::from_secs(2), Some(3))
            .await
            .unwrap();

        assert_eq!(snapshot.received_count, 3);
        assert_eq!(snapshot.expected_count, 3);
        assert!(snapshot.contains("A") && snapshot.contains("B") && snapshot.contains("C"));
        assert!(snapshot.replies["A"].core.is_present());
        // Early completion, well before the deadline.
        assert!(snapshot.duration < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn nobody_answering_is_an_empty_snapshot() {
        let bus = LocalBus::new();
        let snapshot = engine(&bus, SurveyScope::Full)
            .survey(Duration::from_millis(50), None)
            .await
            .unwrap();

        assert_eq!(snapshot.received_count, 0);
        assert_eq!(snapshot.expected_count, 0);
        assert!(snapshot.replies.is_empty());
    }

    #[tokio::test]
    async fn partial_survey_counts_missing() {
        let bus = LocalBus::new();
        let _a = server(&bus, "A").await;

        let snapshot = engine(&bus, SurveyScope::Full)
            .survey(Duration::from_millis(100), Some(3))
            .await
            .unwrap();

        assert_eq!(snapshot.received_count, 1);
        assert_eq!(snapshot.expected_count, 3);
        assert_eq!(snapshot.missing_count(), 2);
    }

    #[tokio::test]
    async fn duplicates_are_dropped_and_counted() {
        let bus = LocalBus::new();
        let _a1 = server(&bus, "A").await;
        let _a2 = server(&bus, "A").await;

        let snapshot = engine(&bus, SurveyScope::Full)
            .survey(Duration::from_millis(100), None)
            .await
            .unwrap();

        assert_eq!(snapshot.received_count, 1);
        assert_eq!(snapshot.duplicate_count, 1);
    }

    #[tokio::test]
    async fn malformed_and_impersonated_replies_are_dropped() {
        let bus = LocalBus::new();
        let _good = server(&bus, "A").await;
        let _garbage = bus
            .respond(SUBJECT, "B", |_| Some(Bytes::from_static(b"{nope")))
            .await
            .unwrap();
        // "C" claims to be "A".
        let forged = Bytes::from(report("A").to_json().unwrap());
        let _forger = bus
            .respond(SUBJECT, "C", move |_| Some(forged.clone()))
            .await
            .unwrap();

        let snapshot = engine(&bus, SurveyScope::Full)
            .survey(Duration::from_millis(100), None)
            .await
            .unwrap();

        assert_eq!(snapshot.received_count, 1);
        assert_eq!(snapshot.malformed_count, 2);
        assert_eq!(snapshot.duplicate_count, 0);
    }

    #[tokio::test]
    async fn basic_scope_strips_core() {
        let bus = LocalBus::new();
        let payload = Bytes::from(report("A").to_json().unwrap());
        let _a = bus
            .respond("surveyor/req/server/ping", "A", move |_| Some(payload.clone()))
            .await
            .unwrap();

        let engine = SurveyEngine::new(
            Arc::new(bus.clone()),
            "surveyor/req/server/ping",
            SurveyScope::Basic,
        );
        let snapshot = engine.survey(Duration::from_secs(1), Some(1)).await.unwrap();

        let reply = &snapshot.replies["A"];
        assert_eq!(reply.core, CoreStats::Absent);
        assert_eq!(reply.routes.len(), 1);
        assert_eq!(snapshot.scope, SurveyScope::Basic);
    }

    #[tokio::test]
    async fn request_names_the_scope() {
        let bus = LocalBus::new();
        let _a = bus
            .respond(SUBJECT, "A", |msg| {
                let body: serde_json::Value = serde_json::from_slice(&msg.payload).ok()?;
                (body["scope"] == "full").then(|| Bytes::from(report("A").to_json().unwrap()))
            })
            .await
            .unwrap();

        let snapshot = engine(&bus, SurveyScope::Full)
            .survey(Duration::from_secs(1), Some(1))
            .await
            .unwrap();
        assert_eq!(snapshot.received_count, 1);
    }

    #[tokio::test]
    async fn expected_count_tracks_high_water_mark() {
        let bus = LocalBus::new();
        let engine = engine(&bus, SurveyScope::Full);
        let a = server(&bus, "A").await;
        let _b = server(&bus, "B").await;

        let first = engine.survey(Duration::from_millis(100), None).await.unwrap();
        assert_eq!(first.expected_count, 2);

        a.shutdown();
        tokio::task::yield_now().await;

        let second = engine.survey(Duration::from_millis(100), None).await.unwrap();
        assert_eq!(second.received_count, 1);
        assert_eq!(second.expected_count, 2);
    }

    #[tokio::test]
    async fn transport_down_is_an_error() {
        let bus = LocalBus::new();
        bus.set_connected(false);

        let err = engine(&bus, SurveyScope::Full)
            .survey(Duration::from_millis(50), None)
            .await
            .unwrap_err();
        assert_eq!(err, SurveyError::Transport(TransportError::NotConnected));
    }

    #[tokio::test]
    async fn transport_dropping_mid_survey_is_an_error() {
        let bus = LocalBus::new();
        let _a = server(&bus, "A").await;
        let survey = engine(&bus, SurveyScope::Full);

        let dropper = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            dropper.set_connected(false);
        });

        let err = survey
            .survey(Duration::from_millis(300), None)
            .await
            .unwrap_err();
        assert_eq!(err, SurveyError::Transport(TransportError::NotConnected));
    }

    #[tokio::test]
    async fn inbox_is_released_after_survey() {
        let bus = LocalBus::new();
        let _a = server(&bus, "A").await;
        engine(&bus, SurveyScope::Full)
            .survey(Duration::from_millis(50), Some(1))
            .await
            .unwrap();

        // Only the responder's request subscription remains.
        assert_eq!(bus.subscriber_count(SUBJECT), 1);
        assert_eq!(bus.published_count(), 2);
    }
}
