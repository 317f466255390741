//! Minimal metrics registry for the agent.
//!
//! Counter/gauge/histogram families with dynamic labels backed by `DashMap`,
//! rendered in Prometheus text format. Label sets are flattened into sorted
//! key vectors so rendering order is deterministic. Histogram buckets are
//! fixed in microseconds to avoid floating point math.

use dashmap::DashMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

type LabelKey = Vec<(String, String)>;

fn label_key(labels: &[(&str, &str)]) -> LabelKey {
    let mut key: LabelKey = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    key.sort();
    key
}

fn escape_label(v: &str) -> String {
    v.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

fn render_labels(key: &LabelKey) -> String {
    key.iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label(v)))
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Default)]
pub struct CounterVec {
    map: DashMap<LabelKey, AtomicU64>,
}

impl CounterVec {
    pub fn inc(&self, labels: &[(&str, &str)]) {
        self.add(labels, 1);
    }

    pub fn add(&self, labels: &[(&str, &str)], v: u64) {
        self.map
            .entry(label_key(labels))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(v, Ordering::Relaxed);
    }

    /// Current value for an exact label set (0 if never touched).
    pub fn get(&self, labels: &[(&str, &str)]) -> u64 {
        self.map
            .get(&label_key(labels))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn render(&self, name: &str, out: &mut String) {
        let _ = writeln!(out, "# TYPE {} counter", name);
        for r in self.map.iter() {
            let val = r.value().load(Ordering::Relaxed);
            let _ = writeln!(out, "{}{{{}}} {}", name, render_labels(r.key()), val);
        }
    }
}

#[derive(Default)]
pub struct GaugeVec {
    map: DashMap<LabelKey, AtomicI64>,
}

impl GaugeVec {
    pub fn set(&self, labels: &[(&str, &str)], v: i64) {
        self.map
            .entry(label_key(labels))
            .or_insert_with(|| AtomicI64::new(0))
            .store(v, Ordering::Relaxed);
    }

    pub fn get(&self, labels: &[(&str, &str)]) -> i64 {
        self.map
            .get(&label_key(labels))
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn render(&self, name: &str, out: &mut String) {
        let _ = writeln!(out, "# TYPE {} gauge", name);
        for r in self.map.iter() {
            let val = r.value().load(Ordering::Relaxed);
            let _ = writeln!(out, "{}{{{}}} {}", name, render_labels(r.key()), val);
        }
    }
}

// 100us, 500us, 1ms, 5ms, 10ms, 50ms, 100ms, 500ms, 1s
const BUCKETS_MICROS: [u64; 9] = [
    100, 500, 1_000, 5_000, 10_000, 50_000, 100_000, 500_000, 1_000_000,
];

#[derive(Default)]
struct AtomicHistogram {
    count: AtomicU64,
    sum: AtomicU64,
    buckets: [AtomicU64; 9],
}

#[derive(Default)]
pub struct HistogramVec {
    map: DashMap<LabelKey, AtomicHistogram>,
}

impl HistogramVec {
    pub fn observe(&self, labels: &[(&str, &str)], duration: Duration) {
        let hist = self
            .map
            .entry(label_key(labels))
            .or_insert_with(AtomicHistogram::default);
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);

        hist.count.fetch_add(1, Ordering::Relaxed);
        hist.sum.fetch_add(micros, Ordering::Relaxed);
        // cumulative
        for (i, &b) in BUCKETS_MICROS.iter().enumerate() {
            if micros <= b {
                hist.buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// `le` is rendered in integer microseconds.
    fn render(&self, name: &str, out: &mut String) {
        let _ = writeln!(out, "# TYPE {} histogram", name);
        for r in self.map.iter() {
            let hist = r.value();
            let label_str = render_labels(r.key());
            let prefix = if label_str.is_empty() {
                String::new()
            } else {
                format!("{},", label_str)
            };

            for (i, &le) in BUCKETS_MICROS.iter().enumerate() {
                let count = hist.buckets[i].load(Ordering::Relaxed);
                let _ = writeln!(out, "{}_bucket{{{}le=\"{}\"}} {}", name, prefix, le, count);
            }
            let count = hist.count.load(Ordering::Relaxed);
            let _ = writeln!(out, "{}_bucket{{{}le=\"+Inf\"}} {}", name, prefix, count);
            let sum = hist.sum.load(Ordering::Relaxed);
            let _ = writeln!(out, "{}_sum{{{}}} {}", name, label_str, sum);
            let _ = writeln!(out, "{}_count{{{}}} {}", name, label_str, count);
        }
    }
}

/// Every metric the agent exports.
#[derive(Default)]
pub struct AgentMetrics {
    /// labels: scope, func
    pub rpc_received: CounterVec,
    /// labels: scope, code
    pub rpc_rejected: CounterVec,
    /// labels: scope, func
    pub rpc_unknown: CounterVec,
    /// labels: scope, func
    pub dispatch_duration: HistogramVec,
    /// labels: outcome (ok, error, timeout)
    pub subscribe_attempts: CounterVec,
    pub subscribe_permanent_failures: CounterVec,
    pub groups_active: GaugeVec,
    /// labels: state
    pub heartbeats_sent: CounterVec,
    /// labels: outcome (applied, failed)
    pub policies_applied: CounterVec,
    /// labels: full
    pub resets: CounterVec,
}

impl AgentMetrics {
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.rpc_received.render("orb_agent_rpc_received_total", &mut out);
        self.rpc_rejected.render("orb_agent_rpc_rejected_total", &mut out);
        self.rpc_unknown.render("orb_agent_rpc_unknown_total", &mut out);
        self.dispatch_duration.render("orb_agent_dispatch_duration_micros", &mut out);
        self.subscribe_attempts.render("orb_agent_subscribe_attempts_total", &mut out);
        self.subscribe_permanent_failures
            .render("orb_agent_subscribe_permanent_failures_total", &mut out);
        self.groups_active.render("orb_agent_groups_active", &mut out);
        self.heartbeats_sent.render("orb_agent_heartbeats_sent_total", &mut out);
        self.policies_applied.render("orb_agent_policies_applied_total", &mut out);
        self.resets.render("orb_agent_resets_total", &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_order_does_not_matter() {
        let c = CounterVec::default();
        c.inc(&[("scope", "core"), ("func", "agent-stop")]);
        c.inc(&[("func", "agent-stop"), ("scope", "core")]);
        assert_eq!(c.get(&[("scope", "core"), ("func", "agent-stop")]), 2);
    }

    #[test]
    fn renders_prometheus_text() {
        let m = AgentMetrics::default();
        m.heartbeats_sent.inc(&[("state", "online")]);
        m.groups_active.set(&[], 3);
        m.dispatch_duration
            .observe(&[("scope", "group")], Duration::from_micros(700));

        let text = m.render();
        assert!(text.contains("orb_agent_heartbeats_sent_total{state=\"online\"} 1"));
        assert!(text.contains("orb_agent_groups_active{} 3"));
        assert!(text.contains("orb_agent_dispatch_duration_micros_bucket{scope=\"group\",le=\"500\"} 0"));
        assert!(text.contains("orb_agent_dispatch_duration_micros_bucket{scope=\"group\",le=\"1000\"} 1"));
    }
}
