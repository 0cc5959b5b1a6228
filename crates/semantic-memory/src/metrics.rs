//! Prometheus instruments for the store. Recording before `init_metrics`
//! is a no-op.
use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Registry, TextEncoder};
use std::sync::OnceLock;
use tracing::warn;

use crate::memory_db::Provider;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}
static VECTORS_ADDED: OnceLock<IntCounterVec> = OnceLock::new();
static SEARCHES: OnceLock<IntCounterVec> = OnceLock::new();
static REBUILDS: OnceLock<IntCounterVec> = OnceLock::new();
static SNAPSHOT_FAILURES: OnceLock<IntCounterVec> = OnceLock::new();
static INDEX_POINTS: OnceLock<IntGaugeVec> = OnceLock::new();

pub fn init_metrics() {
    register_counter(&VECTORS_ADDED, "thought_vectors_added_total", "Thought vectors added per provider", &["provider"]);
    register_counter(&SEARCHES, "similarity_searches_total", "Similarity searches per provider", &["provider"]);
    register_counter(&REBUILDS, "index_rebuilds_total", "Index rebuilds per provider and reason", &["provider", "reason"]);
    register_counter(&SNAPSHOT_FAILURES, "snapshot_write_failures_total", "Failed index snapshot writes", &["provider"]);

    if INDEX_POINTS.get().is_none() {
        match IntGaugeVec::new(prometheus::opts!("index_points", "Points currently held by each index"), &["provider"]) {
            Ok(gauge) => {
                REGISTRY.register(Box::new(gauge.clone())).ok();
                let _ = INDEX_POINTS.set(gauge);
            }
            Err(e) => warn!("Failed to create index_points gauge: {}", e),
        }
    }
}

fn register_counter(cell: &OnceLock<IntCounterVec>, name: &str, help: &str, labels: &[&str]) {
    if cell.get().is_some() {
        return;
    }
    match IntCounterVec::new(prometheus::opts!(name, help), labels) {
        Ok(counter) => {
            REGISTRY.register(Box::new(counter.clone())).ok();
            let _ = cell.set(counter);
        }
        Err(e) => warn!("Failed to create {} counter: {}", name, e),
    }
}

pub fn inc_vectors_added(provider: Provider) {
    if let Some(counter) = VECTORS_ADDED.get() {
        counter.with_label_values(&[provider.as_str()]).inc();
    }
}

pub fn inc_searches(provider: Provider) {
    if let Some(counter) = SEARCHES.get() {
        counter.with_label_values(&[provider.as_str()]).inc();
    }
}

pub fn inc_rebuilds(provider: Provider, reason: &str) {
    if let Some(counter) = REBUILDS.get() {
        counter.with_label_values(&[provider.as_str(), reason]).inc();
    }
}

pub fn inc_snapshot_failures(provider: Provider) {
    if let Some(counter) = SNAPSHOT_FAILURES.get() {
        counter.with_label_values(&[provider.as_str()]).inc();
    }
}

pub fn set_index_points(provider: Provider, points: usize) {
    if let Some(gauge) = INDEX_POINTS.get() {
        gauge.with_label_values(&[provider.as_str()]).set(points as i64);
    }
}

/// Text exposition of every registered instrument
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent_and_render_includes_counters() {
        init_metrics();
        init_metrics();
        inc_vectors_added(Provider::Local);
        inc_rebuilds(Provider::Remote, "snapshot_missing");
        set_index_points(Provider::Local, 3);

        let text = render();
        assert!(text.contains("thought_vectors_added_total"));
        assert!(text.contains("index_rebuilds_total"));
        assert!(text.contains("reason=\"snapshot_missing\""));
    }
}
