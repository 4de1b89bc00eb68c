//! Liveness tracking from survey snapshots.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use surveyor_core::{NodeIdentity, SurveySnapshot};

/// Liveness of one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberLiveness {
    /// Labels from the latest reply, or from the configured hint until the
    /// server first answers.
    pub identity: NodeIdentity,
    /// Epoch of the last survey this server answered.
    pub last_seen: Option<u64>,
    pub consecutive_misses: u32,
    pub up: bool,
}

/// All tracked servers, keyed by server id.
#[derive(Debug, Clone, Default)]
pub struct LivenessState {
    members: BTreeMap<String, MemberLiveness>,
}

impl LivenessState {
    pub fn get(&self, server_id: &str) -> Option<&MemberLiveness> {
        self.members.get(server_id)
    }

    /// Members in server-id order.
    pub fn iter(&self) -> impl Iterator<Item = &MemberLiveness> {
        self.members.values()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn up_count(&self) -> usize {
        self.members.values().filter(|m| m.up).count()
    }
}

/// What changed in one update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LivenessDelta {
    /// Entries created by this update.
    pub added: Vec<String>,
    /// Went from down to up.
    pub recovered: Vec<String>,
    /// Went from up to down.
    pub lost: Vec<String>,
}

impl LivenessDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.recovered.is_empty() && self.lost.is_empty()
    }
}

/// Applies survey results to the liveness state.
///
/// A single missed survey marks a server down and a single reply brings it
/// back up.
#[derive(Debug, Default)]
pub struct LivenessTracker {
    state: LivenessState,
}

impl LivenessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &LivenessState {
        &self.state
    }

    /// Fold one survey into the state.
    ///
    /// The expected set is `expected_members` plus every server already
    /// tracked. Expected servers missing from the snapshot are marked down;
    /// hinted servers that never answered get a down entry with their hinted
    /// labels.
    pub fn update(
        &mut self,
        snapshot: &SurveySnapshot,
        expected_members: &[NodeIdentity],
    ) -> LivenessDelta {
        let mut delta = LivenessDelta::default();
        let members = &mut self.state.members;

        for (server_id, reply) in &snapshot.replies {
            match members.get_mut(server_id) {
                Some(member) => {
                    if !member.up {
                        info!(%server_id, "server recovered");
                        delta.recovered.push(server_id.clone());
                    }
                    member.identity = reply.identity.clone();
                    member.last_seen = Some(snapshot.epoch);
                    member.consecutive_misses = 0;
                    member.up = true;
                }
                None => {
                    debug!(%server_id, cluster = %reply.identity.cluster, "new server");
                    members.insert(
                        server_id.clone(),
                        MemberLiveness {
                            identity: reply.identity.clone(),
                            last_seen: Some(snapshot.epoch),
                            consecutive_misses: 0,
                            up: true,
                        },
                    );
                    delta.added.push(server_id.clone());
                }
            }
        }

        for hint in expected_members {
            if members.contains_key(&hint.server_id) {
                continue;
            }
            // Counted as a miss by the loop below.
            members.insert(
                hint.server_id.clone(),
                MemberLiveness {
                    identity: hint.clone(),
                    last_seen: None,
                    consecutive_misses: 0,
                    up: false,
                },
            );
            delta.added.push(hint.server_id.clone());
        }

        for (server_id, member) in members.iter_mut() {
            if snapshot.contains(server_id) {
                continue;
            }
            member.consecutive_misses = member.consecutive_misses.saturating_add(1);
            if member.up {
                warn!(
                    %server_id,
                    misses = member.consecutive_misses,
                    "server missed survey, marked down"
                );
                delta.lost.push(server_id.clone());
            }
            member.up = false;
        }

        delta
    }

    /// Forget a server entirely.
    pub fn prune(&mut self, server_id: &str) -> Option<MemberLiveness> {
        let removed = self.state.members.remove(server_id);
        if removed.is_some() {
            info!(%server_id, "server pruned");
        }
        removed
    }
}
