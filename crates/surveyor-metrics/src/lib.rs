//! surveyor-metrics: turning surveys into Prometheus metrics.
//!
//! # Architecture
//!
//! ```text
//! SurveyCollector
//!   ├── scrape() ← called per /metrics request
//!   │     ├── fresh cache → served as is
//!   │     └── otherwise joins or launches the single in-flight survey
//!   ├── survey task: SurveyEngine → LivenessTracker → build()
//!   └── prune() → forget a server, rebuild cached samples
//!
//! build()             pure: snapshot + liveness → sorted MetricSamples
//! render_prometheus() samples → text/plain for the /metrics endpoint
//! ```

pub mod builder;
pub mod collector;
pub mod prometheus;

pub use builder::{MetricKind, MetricSample, build};
pub use collector::{CollectError, CollectResult, CollectorSettings, SurveyCollector};
pub use prometheus::{CONTENT_TYPE, render_prometheus};
