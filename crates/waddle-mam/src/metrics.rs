//! Archive metrics for observability.
//!
//! Uses the global OpenTelemetry meter provider, which must be initialized by
//! the host application. Without one every instrument is a no-op.

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

static METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    METER.get_or_init(|| opentelemetry::global::meter("waddle-mam"))
}

// ============================================================================
// Counters (Cumulative)
// ============================================================================

/// Counter for items written by the archivers.
pub fn archived_items() -> Counter<u64> {
    meter()
        .u64_counter("mam.archiver.items")
        .with_description("Total items written to the archive store")
        .with_unit("item")
        .build()
}

/// Counter for batches dropped after a store failure.
pub fn dropped_batches() -> Counter<u64> {
    meter()
        .u64_counter("mam.archiver.dropped_batches")
        .with_description("Total archive batches dropped after a store failure")
        .with_unit("batch")
        .build()
}

/// Counter for archive queries, by backend.
pub fn queries() -> Counter<u64> {
    meter()
        .u64_counter("mam.queries")
        .with_description("Total archive queries served")
        .with_unit("query")
        .build()
}

/// Counter for documents added to the full-text index.
pub fn indexed_documents() -> Counter<u64> {
    meter()
        .u64_counter("mam.index.documents")
        .with_description("Total documents added to the full-text index")
        .with_unit("document")
        .build()
}

/// Counter for conversation lifecycle events.
pub fn conversation_events() -> Counter<u64> {
    meter()
        .u64_counter("mam.conversations.events")
        .with_description("Conversations created and ended")
        .with_unit("event")
        .build()
}

// ============================================================================
// Gauges (Current State)
// ============================================================================

pub fn queue_depth() -> Gauge<i64> {
    meter()
        .i64_gauge("mam.archiver.queue_depth")
        .with_description("Items waiting in an archiver queue")
        .with_unit("item")
        .build()
}

pub fn active_conversations() -> Gauge<i64> {
    meter()
        .i64_gauge("mam.conversations.active")
        .with_description("Conversations currently tracked in memory")
        .with_unit("conversation")
        .build()
}

// ============================================================================
// Histograms (Latency)
// ============================================================================

pub fn query_latency() -> Histogram<f64> {
    meter()
        .f64_histogram("mam.query.latency")
        .with_description("Archive query latency, gate wait excluded")
        .with_unit("ms")
        .build()
}

pub fn gate_wait() -> Histogram<f64> {
    meter()
        .f64_histogram("mam.gate.wait")
        .with_description("Time queries spent waiting for pending archive writes")
        .with_unit("ms")
        .build()
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

pub fn record_archived(archiver: &str, count: usize) {
    archived_items().add(count as u64, &[KeyValue::new("archiver", archiver.to_string())]);
}

pub fn record_dropped_batch(archiver: &str) {
    dropped_batches().add(1, &[KeyValue::new("archiver", archiver.to_string())]);
}

pub fn record_queue_depth(archiver: &str, depth: usize) {
    queue_depth().record(depth as i64, &[KeyValue::new("archiver", archiver.to_string())]);
}

/// Record a served query and its latency in milliseconds.
pub fn record_query(backend: &str, latency_ms: f64) {
    let attributes = [KeyValue::new("backend", backend.to_string())];
    queries().add(1, &attributes);
    query_latency().record(latency_ms, &attributes);
}

pub fn record_indexed(count: usize) {
    indexed_documents().add(count as u64, &[]);
}

/// Record a gate wait; `interrupted` marks waits cut short before the ETA.
pub fn record_gate_wait(wait_ms: f64, interrupted: bool) {
    gate_wait().record(
        wait_ms,
        &[KeyValue::new(
            "result",
            if interrupted { "interrupted" } else { "complete" },
        )],
    );
}

pub fn record_conversation_event(event: &str) {
    conversation_events().add(1, &[KeyValue::new("event", event.to_string())]);
}

pub fn record_active_conversations(count: usize) {
    active_conversations().record(count as i64, &[]);
}
