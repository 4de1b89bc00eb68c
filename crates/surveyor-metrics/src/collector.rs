//! Scrape-driven survey collector.
//!
//! Each scrape either reuses recent samples or waits on a survey. At most
//! one survey runs at a time: scrapes arriving while one is in flight share
//! its outcome. Surveys run in their own task, so a scrape that gives up
//! waiting does not cancel the survey, and its result still lands in the
//! cache for the next scrape.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use surveyor_core::{NodeIdentity, SurveySnapshot};
use surveyor_engine::{SurveyEngine, SurveyError};
use surveyor_liveness::{LivenessState, LivenessTracker};

use crate::builder::{MetricSample, build};

/// Result type alias for scrapes.
pub type CollectResult<T> = Result<T, CollectError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollectError {
    #[error("survey failed: {0}")]
    Survey(#[from] SurveyError),

    #[error("no survey completed within {0:?}")]
    Timeout(Duration),

    #[error("survey task ended without a result")]
    Aborted,
}

#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub namespace: String,
    /// How long each survey gathers replies.
    pub survey_timeout: Duration,
    /// Samples younger than this are served without a new survey.
    pub min_interval: Duration,
    /// How long a scrape waits for a survey before falling back.
    pub scrape_timeout: Duration,
    pub expected_servers: Option<usize>,
    pub expected_members: Vec<NodeIdentity>,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            namespace: "nats".to_string(),
            survey_timeout: Duration::from_secs(3),
            min_interval: Duration::from_secs(1),
            scrape_timeout: Duration::from_secs(10),
            expected_servers: None,
            expected_members: Vec::new(),
        }
    }
}

type Samples = Arc<Vec<MetricSample>>;
type Outcome = CollectResult<Samples>;

struct Cached {
    samples: Samples,
    snapshot: Arc<SurveySnapshot>,
    taken_at: Instant,
}

struct Inner {
    engine: SurveyEngine,
    settings: CollectorSettings,
    tracker: Mutex<LivenessTracker>,
    cache: RwLock<Option<Cached>>,
    in_flight: tokio::sync::Mutex<Option<watch::Receiver<Option<Outcome>>>>,
    surveys: AtomicU64,
}

/// Serves metric samples to scrapes, surveying the cluster as needed.
#[derive(Clone)]
pub struct SurveyCollector {
    inner: Arc<Inner>,
}

impl SurveyCollector {
    pub fn new(engine: SurveyEngine, settings: CollectorSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                settings,
                tracker: Mutex::new(LivenessTracker::new()),
                cache: RwLock::new(None),
                in_flight: tokio::sync::Mutex::new(None),
                surveys: AtomicU64::new(0),
            }),
        }
    }

    pub fn settings(&self) -> &CollectorSettings {
        &self.inner.settings
    }

    /// Samples for one scrape.
    ///
    /// Recent samples are served as is. Otherwise the scrape waits, up to
    /// the scrape timeout, for the in-flight survey (launching one if
    /// needed). If that survey fails or is too slow, the previous samples
    /// are served; only with nothing cached does the scrape fail.
    pub async fn scrape(&self) -> CollectResult<Samples> {
        if let Some(samples) = self.fresh() {
            debug!("serving cached samples");
            return Ok(samples);
        }

        let mut rx = self.join_or_launch().await;
        let deadline = self.inner.settings.scrape_timeout;
        let outcome = match tokio::time::timeout(deadline, wait_outcome(&mut rx)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(CollectError::Timeout(deadline)),
        };

        match outcome {
            Ok(samples) => Ok(samples),
            Err(e) => match self.cached() {
                Some(samples) => {
                    warn!(error = %e, "serving stale samples");
                    Ok(samples)
                }
                None => Err(e),
            },
        }
    }

    /// Run a survey now and wait for it, without a scrape deadline.
    pub async fn prime(&self) -> CollectResult<Samples> {
        let mut rx = self.join_or_launch().await;
        wait_outcome(&mut rx).await
    }

    /// Surveys launched so far.
    pub fn survey_count(&self) -> u64 {
        self.inner.surveys.load(Ordering::Relaxed)
    }

    /// Latest samples, however old.
    pub fn cached(&self) -> Option<Samples> {
        let cache = self.inner.cache.read().expect("cache lock");
        cache.as_ref().map(|c| Arc::clone(&c.samples))
    }

    pub fn liveness(&self) -> LivenessState {
        self.inner.tracker.lock().expect("tracker lock").state().clone()
    }

    /// Forget a server and drop it from the cached samples. Returns whether
    /// the server was known.
    pub fn prune(&self, server_id: &str) -> bool {
        let mut tracker = self.inner.tracker.lock().expect("tracker lock");
        if tracker.prune(server_id).is_none() {
            return false;
        }

        let mut cache = self.inner.cache.write().expect("cache lock");
        if let Some(cached) = cache.as_mut() {
            let mut snapshot = (*cached.snapshot).clone();
            snapshot.replies.remove(server_id);
            cached.samples = Arc::new(build(
                &self.inner.settings.namespace,
                &snapshot,
                tracker.state(),
            ));
            cached.snapshot = Arc::new(snapshot);
        }
        true
    }

    fn fresh(&self) -> Option<Samples> {
        let cache = self.inner.cache.read().expect("cache lock");
        cache
            .as_ref()
            .filter(|c| c.taken_at.elapsed() < self.inner.settings.min_interval)
            .map(|c| Arc::clone(&c.samples))
    }

    async fn join_or_launch(&self) -> watch::Receiver<Option<Outcome>> {
        let mut slot = self.inner.in_flight.lock().await;
        if let Some(rx) = slot.as_ref() {
            return rx.clone();
        }

        // A survey may have finished while we waited for the slot.
        if let Some(samples) = self.fresh() {
            let (_, rx) = watch::channel(Some(Ok(samples)));
            return rx;
        }

        let (tx, rx) = watch::channel(None);
        *slot = Some(rx.clone());
        drop(slot);

        let n = self.inner.surveys.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(survey = n, subject = %self.inner.engine.subject(), "launching survey");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let outcome = inner.run_survey().await;
            if let Err(e) = &outcome {
                warn!(error = %e, "survey failed");
            }
            // Clear the slot first so a waiter that scrapes again can launch.
            inner.in_flight.lock().await.take();
            let _ = tx.send(Some(outcome));
        });

        rx
    }
}

impl Inner {
    async fn run_survey(&self) -> Outcome {
        let snapshot = self
            .engine
            .survey(self.settings.survey_timeout, self.settings.expected_servers)
            .await?;

        // Same lock order as prune: tracker, then cache.
        let mut tracker = self.tracker.lock().expect("tracker lock");
        let delta = tracker.update(&snapshot, &self.settings.expected_members);
        if !delta.is_empty() {
            info!(
                added = delta.added.len(),
                recovered = delta.recovered.len(),
                lost = delta.lost.len(),
                up = tracker.state().up_count(),
                "liveness changed"
            );
        }
        let samples = Arc::new(build(&self.settings.namespace, &snapshot, tracker.state()));

        let mut cache = self.cache.write().expect("cache lock");
        *cache = Some(Cached {
            samples: Arc::clone(&samples),
            snapshot: Arc::new(snapshot),
            taken_at: Instant::now(),
        });
        Ok(samples)
    }
}

async fn wait_outcome(rx: &mut watch::Receiver<Option<Outcome>>) -> Outcome {
    loop {
        let current = rx.borrow_and_update().clone();
        if let Some(outcome) = current {
            return outcome;
        }
        if rx.changed().await.is_err() {
            return rx.borrow().clone().unwrap_or(Err(CollectError::Aborted));
        }
    }
}
