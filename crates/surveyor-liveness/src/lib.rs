//! surveyor-liveness: which servers are up, across surveys.
//!
//! Every server that ever answered, or that was configured as an expected
//! member, has an entry. A survey reply marks it up; a survey without its
//! reply marks it down. Entries are only removed by an explicit prune.

pub mod tracker;

pub use tracker::{LivenessDelta, LivenessState, LivenessTracker, MemberLiveness};
