//! Metric sample construction.
//!
//! `build` is a pure function of the latest snapshot and the liveness state.
//! Liveness samples cover every known server; core samples only exist for
//! servers whose reply in this snapshot carried core stats.

use std::collections::BTreeMap;

use surveyor_core::{NodeIdentity, NodeReport, SurveySnapshot};
use surveyor_liveness::LivenessState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Gauge,
    Counter,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

/// One exported value.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub name: String,
    pub kind: MetricKind,
    pub help: &'static str,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

impl MetricSample {
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }
}

struct Emitter<'a> {
    namespace: &'a str,
    samples: Vec<MetricSample>,
}

impl Emitter<'_> {
    fn push(
        &mut self,
        suffix: &str,
        kind: MetricKind,
        help: &'static str,
        labels: &BTreeMap<String, String>,
        value: f64,
    ) {
        self.samples.push(MetricSample {
            name: format!("{}_{suffix}", self.namespace),
            kind,
            help,
            labels: labels.clone(),
            value,
        });
    }

    fn label(&self, name: &str) -> String {
        format!("{}_{name}", self.namespace)
    }

    fn server_labels(&self, identity: &NodeIdentity) -> BTreeMap<String, String> {
        BTreeMap::from([
            (self.label("server_cluster"), identity.cluster.clone()),
            (self.label("server_host"), identity.host.clone()),
            (self.label("server_id"), identity.server_id.clone()),
        ])
    }
}

/// Build every sample for one scrape, sorted by name then labels.
pub fn build(namespace: &str, snapshot: &SurveySnapshot, liveness: &LivenessState) -> Vec<MetricSample> {
    use MetricKind::Gauge;

    let mut out = Emitter {
        namespace,
        samples: Vec::new(),
    };

    for member in liveness.iter() {
        let labels = out.server_labels(&member.identity);
        let value = if member.up { 1.0 } else { 0.0 };
        out.push("up", Gauge, "Whether the server answered the latest survey.", &labels, value);
    }

    for reply in snapshot.replies.values() {
        core_samples(&mut out, snapshot.epoch, reply);
        route_samples(&mut out, reply);
        gateway_samples(&mut out, reply);
    }

    let none = BTreeMap::new();
    out.push(
        "survey_expected_count",
        Gauge,
        "Servers the latest survey expected to answer.",
        &none,
        snapshot.expected_count as f64,
    );
    out.push(
        "survey_surveyed_count",
        Gauge,
        "Servers that answered the latest survey.",
        &none,
        snapshot.received_count as f64,
    );
    out.push(
        "survey_malformed_count",
        Gauge,
        "Replies dropped by the latest survey as malformed.",
        &none,
        snapshot.malformed_count as f64,
    );
    out.push(
        "survey_duplicate_count",
        Gauge,
        "Duplicate replies dropped by the latest survey.",
        &none,
        snapshot.duplicate_count as f64,
    );
    out.push(
        "survey_duration_seconds",
        Gauge,
        "Time the latest survey spent collecting replies.",
        &none,
        snapshot.duration.as_secs_f64(),
    );

    let mut samples = out.samples;
    samples.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));
    samples
}

fn core_samples(out: &mut Emitter<'_>, epoch: u64, reply: &NodeReport) {
    use MetricKind::{Counter, Gauge};

    let Some(core) = reply.core.as_present() else {
        return;
    };
    let labels = out.server_labels(&reply.identity);

    out.push("core_mem_bytes", Gauge, "Resident memory in bytes.", &labels, core.mem_bytes as f64);
    out.push("core_cpu_percentage", Gauge, "CPU usage percentage.", &labels, core.cpu_percent);
    out.push("core_cores", Gauge, "Number of CPU cores.", &labels, core.cores as f64);
    out.push(
        "core_connection_count",
        Gauge,
        "Current client connections.",
        &labels,
        core.connections as f64,
    );
    out.push(
        "core_total_connection_count",
        Counter,
        "Client connections since start.",
        &labels,
        core.total_connections as f64,
    );
    out.push(
        "core_subs_count",
        Gauge,
        "Active subscriptions.",
        &labels,
        core.subscriptions as f64,
    );
    out.push("core_sent_msgs_count", Counter, "Messages sent.", &labels, core.sent.msgs as f64);
    out.push("core_sent_bytes", Counter, "Bytes sent.", &labels, core.sent.bytes as f64);
    out.push(
        "core_recv_msgs_count",
        Counter,
        "Messages received.",
        &labels,
        core.received.msgs as f64,
    );
    out.push("core_recv_bytes", Counter, "Bytes received.", &labels, core.received.bytes as f64);
    out.push(
        "core_slow_consumer_count",
        Counter,
        "Slow consumers detected.",
        &labels,
        core.slow_consumers as f64,
    );
    out.push(
        "core_uptime_seconds",
        Gauge,
        "Seconds since the server started.",
        &labels,
        core.uptime_secs(epoch) as f64,
    );
}

fn route_samples(out: &mut Emitter<'_>, reply: &NodeReport) {
    use MetricKind::{Counter, Gauge};

    for route in &reply.routes {
        let mut labels = out.server_labels(&reply.identity);
        labels.insert(out.label("server_route_id"), route.route_id.to_string());

        out.push(
            "core_route_sent_msg_count",
            Counter,
            "Messages sent over the route.",
            &labels,
            route.sent.msgs as f64,
        );
        out.push(
            "core_route_sent_bytes",
            Counter,
            "Bytes sent over the route.",
            &labels,
            route.sent.bytes as f64,
        );
        out.push(
            "core_route_recv_msg_count",
            Counter,
            "Messages received over the route.",
            &labels,
            route.received.msgs as f64,
        );
        out.push(
            "core_route_recv_bytes",
            Counter,
            "Bytes received over the route.",
            &labels,
            route.received.bytes as f64,
        );
        out.push(
            "core_route_pending_bytes",
            Gauge,
            "Bytes pending on the route.",
            &labels,
            route.pending_bytes as f64,
        );
    }
}

fn gateway_samples(out: &mut Emitter<'_>, reply: &NodeReport) {
    use MetricKind::{Counter, Gauge};

    for gateway in &reply.gateways {
        let mut labels = out.server_labels(&reply.identity);
        labels.insert(out.label("server_gateway_name"), gateway.name.clone());
        labels.insert(out.label("server_gateway_id"), gateway.gateway_id.to_string());

        out.push(
            "core_gateway_sent_msgs_count",
            Counter,
            "Messages sent over the gateway.",
            &labels,
            gateway.sent.msgs as f64,
        );
        out.push(
            "core_gateway_sent_bytes",
            Counter,
            "Bytes sent over the gateway.",
            &labels,
            gateway.sent.bytes as f64,
        );
        out.push(
            "core_gateway_recv_msg_count",
            Counter,
            "Messages received over the gateway.",
            &labels,
            gateway.received.msgs as f64,
        );
        out.push(
            "core_gateway_recv_bytes",
            Counter,
            "Bytes received over the gateway.",
            &labels,
            gateway.received.bytes as f64,
        );
        out.push(
            "core_gateway_inbound_connection_count",
            Gauge,
            "Inbound gateway connections.",
            &labels,
            gateway.inbound_connections as f64,
        );
    }
}
