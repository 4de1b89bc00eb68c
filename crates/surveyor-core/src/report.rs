//! Node reports: what a single server says about itself in reply to a survey.
//!
//! The wire document mirrors a server's `STATSZ` event: a `server` identity
//! block and an optional `statsz` block. Core statistics are only present
//! when the server answered on the privileged subject, so they are modelled
//! as [`CoreStats::Absent`] rather than zero-filled.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for report parsing.
pub type ReportResult<T> = Result<T, ReportError>;

/// Reasons a reply is rejected as malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReportError {
    #[error("reply is not a valid report: {0}")]
    Decode(String),

    #[error("reply has no server id")]
    MissingServerId,

    #[error("sender {sender} does not match reported server id {server_id}")]
    SenderMismatch { sender: String, server_id: String },
}

/// Identity of a cluster member. `server_id` is the unique key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub server_id: String,
    pub server_name: String,
    pub cluster: String,
    pub host: String,
}

impl NodeIdentity {
    pub fn new(server_id: &str, server_name: &str, cluster: &str, host: &str) -> Self {
        Self {
            server_id: server_id.to_string(),
            server_name: server_name.to_string(),
            cluster: cluster.to_string(),
            host: host.to_string(),
        }
    }
}

/// Message and byte counters for one direction of traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataStats {
    #[serde(default)]
    pub msgs: u64,
    #[serde(default)]
    pub bytes: u64,
}

/// Self-reported process statistics of a server.
#[derive(Debug, Clone, PartialEq)]
pub struct CoreReport {
    /// Server start time, unix seconds.
    pub start_epoch: u64,
    pub mem_bytes: u64,
    pub cores: u32,
    pub cpu_percent: f64,
    pub connections: u64,
    pub total_connections: u64,
    pub subscriptions: u64,
    pub sent: DataStats,
    pub received: DataStats,
    pub slow_consumers: u64,
}

impl CoreReport {
    /// Seconds the server has been up as of `epoch`.
    pub fn uptime_secs(&self, epoch: u64) -> u64 {
        epoch.saturating_sub(self.start_epoch)
    }
}

/// Core statistics are either fully present or entirely absent.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreStats {
    Present(CoreReport),
    Absent,
}

impl CoreStats {
    pub fn as_present(&self) -> Option<&CoreReport> {
        match self {
            CoreStats::Present(core) => Some(core),
            CoreStats::Absent => None,
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, CoreStats::Present(_))
    }
}

/// Counters for one intra-cluster route, keyed by `(server_id, route_id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteReport {
    pub route_id: u64,
    /// Name of the remote server.
    pub name: String,
    pub sent: DataStats,
    pub received: DataStats,
    pub pending_bytes: u64,
}

/// Counters for one inter-cluster gateway, keyed by
/// `(server_id, name, gateway_id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayReport {
    pub gateway_id: u64,
    pub name: String,
    pub sent: DataStats,
    pub received: DataStats,
    pub inbound_connections: u64,
}

/// A fully parsed reply from one server.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeReport {
    pub identity: NodeIdentity,
    pub core: CoreStats,
    pub routes: Vec<RouteReport>,
    pub gateways: Vec<GatewayReport>,
}

impl NodeReport {
    /// Parse a reply payload.
    ///
    /// `sender` is the identity the transport attributes the message to, if
    /// it knows one. When given it must match the reported server id.
    pub fn parse(payload: &[u8], sender: Option<&str>) -> ReportResult<Self> {
        let wire: ReplyWire =
            serde_json::from_slice(payload).map_err(|e| ReportError::Decode(e.to_string()))?;

        let server_id = wire.server.id.trim();
        if server_id.is_empty() {
            return Err(ReportError::MissingServerId);
        }
        if let Some(sender) = sender
            && sender != server_id
        {
            return Err(ReportError::SenderMismatch {
                sender: sender.to_string(),
                server_id: server_id.to_string(),
            });
        }

        let identity = NodeIdentity {
            server_id: server_id.to_string(),
            server_name: wire.server.name,
            cluster: wire.server.cluster,
            host: wire.server.host,
        };

        let Some(statsz) = wire.statsz else {
            return Ok(Self {
                identity,
                core: CoreStats::Absent,
                routes: Vec::new(),
                gateways: Vec::new(),
            });
        };

        // The `mem` field marks the core block; without it the rest of the
        // core fields are meaningless.
        let core = match statsz.mem {
            Some(mem_bytes) => CoreStats::Present(CoreReport {
                start_epoch: statsz.start.unwrap_or_default(),
                mem_bytes,
                cores: statsz.cores.unwrap_or_default(),
                cpu_percent: statsz.cpu.unwrap_or_default(),
                connections: statsz.connections.unwrap_or_default(),
                total_connections: statsz.total_connections.unwrap_or_default(),
                subscriptions: statsz.subscriptions.unwrap_or_default(),
                sent: statsz.sent.unwrap_or_default(),
                received: statsz.received.unwrap_or_default(),
                slow_consumers: statsz.slow_consumers.unwrap_or_default(),
            }),
            None => CoreStats::Absent,
        };

        let routes = statsz
            .routes
            .into_iter()
            .map(|r| RouteReport {
                route_id: r.rid,
                name: r.name,
                sent: r.sent,
                received: r.received,
                pending_bytes: r.pending,
            })
            .collect();

        let gateways = statsz
            .gateways
            .into_iter()
            .map(|g| GatewayReport {
                gateway_id: g.gwid,
                name: g.name,
                sent: g.sent,
                received: g.received,
                inbound_connections: g.inbound_connections,
            })
            .collect();

        Ok(Self {
            identity,
            core,
            routes,
            gateways,
        })
    }

    /// Encode this report in the reply wire format.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&ReplyWire::from(self))
    }

    /// Drop the core block, keeping identity, routes, and gateways.
    pub fn without_core(mut self) -> Self {
        self.core = CoreStats::Absent;
        self
    }
}

// ── Wire format ────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct ReplyWire {
    server: ServerWire,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    statsz: Option<StatszWire>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ServerWire {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    cluster: String,
    #[serde(default)]
    host: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StatszWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    start: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mem: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cores: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cpu: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    connections: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    total_connections: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subscriptions: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sent: Option<DataStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    received: Option<DataStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    slow_consumers: Option<u64>,
    #[serde(default)]
    routes: Vec<RouteWire>,
    #[serde(default)]
    gateways: Vec<GatewayWire>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RouteWire {
    rid: u64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    sent: DataStats,
    #[serde(default)]
    received: DataStats,
    #[serde(default)]
    pending: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct GatewayWire {
    gwid: u64,
    name: String,
    #[serde(default)]
    sent: DataStats,
    #[serde(default)]
    received: DataStats,
    #[serde(default)]
    inbound_connections: u64,
}

impl From<&NodeReport> for ReplyWire {
    fn from(report: &NodeReport) -> Self {
        let server = ServerWire {
            id: report.identity.server_id.clone(),
            name: report.identity.server_name.clone(),
            cluster: report.identity.cluster.clone(),
            host: report.identity.host.clone(),
        };

        let mut statsz = StatszWire::default();
        if let CoreStats::Present(core) = &report.core {
            statsz.start = Some(core.start_epoch);
            statsz.mem = Some(core.mem_bytes);
            statsz.cores = Some(core.cores);
            statsz.cpu = Some(core.cpu_percent);
            statsz.connections = Some(core.connections);
            statsz.total_connections = Some(core.total_connections);
            statsz.subscriptions = Some(core.subscriptions);
            statsz.sent = Some(core.sent);
            statsz.received = Some(core.received);
            statsz.slow_consumers = Some(core.slow_consumers);
        }
        statsz.routes = report
            .routes
            .iter()
            .map(|r| RouteWire {
                rid: r.route_id,
                name: r.name.clone(),
                sent: r.sent,
                received: r.received,
                pending: r.pending_bytes,
            })
            .collect();
        statsz.gateways = report
            .gateways
            .iter()
            .map(|g| GatewayWire {
                gwid: g.gateway_id,
                name: g.name.clone(),
                sent: g.sent,
                received: g.received,
                inbound_connections: g.inbound_connections,
            })
            .collect();

        let empty = !report.core.is_present() && statsz.routes.is_empty() && statsz.gateways.is_empty();
        Self {
            server,
            statsz: if empty { None } else { Some(statsz) },
        }
    }
}
