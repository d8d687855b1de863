// Daemon metrics
//
// A private Prometheus registry owned by the daemon. Counters are bumped by the
// transport and the pipeline; `status` renders them as JSON or as the text
// exposition format.

use anyhow::Result;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde_json::{json, Value};

/// Counters shared by every connection (cheap to clone)
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    requests: IntCounterVec,
    results: IntCounterVec,
    escalations: IntCounterVec,
    inference_failures: IntCounterVec,
    errors: IntCounterVec,
    connections: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("fazai".to_string()), None)?;

        let requests = IntCounterVec::new(
            Opts::new("requests_total", "Requests received, by action"),
            &["action"],
        )?;
        let results = IntCounterVec::new(
            Opts::new("results_total", "Successful terminal results, by tier"),
            &["tier"],
        )?;
        let escalations = IntCounterVec::new(
            Opts::new("escalations_total", "Tier escalations, by the tier that gave up"),
            &["from"],
        )?;
        let inference_failures = IntCounterVec::new(
            Opts::new("inference_failures_total", "Inference failures, by kind"),
            &["kind"],
        )?;
        let errors = IntCounterVec::new(
            Opts::new("errors_total", "Error events sent, by kind"),
            &["kind"],
        )?;
        let connections = IntGauge::new("connections", "Live client connections")?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(results.clone()))?;
        registry.register(Box::new(escalations.clone()))?;
        registry.register(Box::new(inference_failures.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(connections.clone()))?;

        Ok(Self {
            registry,
            requests,
            results,
            escalations,
            inference_failures,
            errors,
            connections,
        })
    }

    pub fn record_request(&self, action: &str) {
        self.requests.with_label_values(&[action]).inc();
    }

    pub fn record_result(&self, tier: &str) {
        self.results.with_label_values(&[tier]).inc();
    }

    pub fn record_escalation(&self, from: &str) {
        self.escalations.with_label_values(&[from]).inc();
    }

    pub fn record_inference_failure(&self, kind: &str) {
        self.inference_failures.with_label_values(&[kind]).inc();
    }

    pub fn record_error(&self, kind: &str) {
        self.errors.with_label_values(&[kind]).inc();
    }

    pub fn connection_opened(&self) {
        self.connections.inc();
    }

    pub fn connection_closed(&self) {
        self.connections.dec();
    }

    pub fn live_connections(&self) -> i64 {
        self.connections.get()
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render_text(&self) -> String {
        let mut buf = Vec::new();
        if TextEncoder::new().encode(&self.registry.gather(), &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }

    /// Flat JSON summary: `{metric: {label: value}}`, read back from the text
    /// exposition so it always matches what `render_text` reports.
    pub fn summary(&self) -> Value {
        let mut out = serde_json::Map::new();
        for line in self.render_text().lines() {
            if line.starts_with('#') || line.trim().is_empty() {
                continue;
            }
            let Some((series, value)) = line.rsplit_once(' ') else {
                continue;
            };
            let value: f64 = value.parse().unwrap_or(0.0);
            let (name, label) = match series.split_once('{') {
                Some((name, labels)) => {
                    let label = labels
                        .trim_end_matches('}')
                        .split_once('=')
                        .map(|(_, v)| v.trim_matches('"').to_string())
                        .unwrap_or_else(|| "value".to_string());
                    (name, label)
                }
                None => (series, "value".to_string()),
            };
            let key = name.trim_start_matches("fazai_").to_string();
            let entry = out
                .entry(key)
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            if let Value::Object(map) = entry {
                map.insert(label, json!(value as i64));
            }
        }
        Value::Object(out)
    }
}
