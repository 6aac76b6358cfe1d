// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Exporter events and the counters that record them.
//!
//! Shard buffers, the router and the session manager report what they do
//! through an injected [`EventSink`]. Implementations must return quickly:
//! they are called on the routing and flushing paths.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Why a shard buffer was flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlushReason {
    /// The next span would have crossed the batch size threshold.
    Size,
    /// The periodic flush timer fired.
    Interval,
    /// The buffer was retired by a map swap or a shutdown.
    Retire,
}

impl FlushReason {
    /// Label used in logs and metric attributes.
    pub fn as_str(self) -> &'static str {
        match self {
            FlushReason::Size => "size",
            FlushReason::Interval => "interval",
            FlushReason::Retire => "retire",
        }
    }
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Details of one completed flush.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushEvent<'a> {
    /// Shard that was flushed.
    pub shard_id: &'a str,
    /// What triggered the flush.
    pub reason: FlushReason,
    /// Number of spans in the record.
    pub span_count: u64,
    /// Size of the encoded span list before compression.
    pub uncompressed_bytes: u64,
    /// Size of the record payload, magic prefix included.
    pub compressed_bytes: u64,
}

impl FlushEvent<'_> {
    /// Uncompressed over compressed size.
    pub fn compression_ratio(&self) -> f64 {
        if self.compressed_bytes == 0 {
            return 0.0;
        }
        self.uncompressed_bytes as f64 / self.compressed_bytes as f64
    }
}

/// Receiver of exporter events. Every method defaults to a no-op.
#[allow(unused_variables)]
pub trait EventSink: Send + Sync {
    /// A span was handed to the router.
    fn span_enqueued(&self) {}

    /// The router finished with a span, whether buffered or dropped.
    fn span_dequeued(&self) {}

    /// A span was replaced by a drop marker because of its size.
    fn oversized_span_dropped(&self, shard_id: &str, size: usize) {}

    /// No shard owns the span's partition key; the span was dropped.
    fn span_unroutable(&self, partition_key: &str) {}

    /// A shard buffer produced a record.
    fn batch_flushed(&self, event: &FlushEvent<'_>) {}

    /// A batch could not be delivered and was discarded.
    fn batch_dropped(&self, shard_id: &str, span_count: u64, reason: &str) {}

    /// A connection attempt to the control plane failed.
    fn connect_failed(&self, endpoint: &str) {}

    /// Fetching the sharding config failed.
    fn assignment_fetch_failed(&self) {}
}

/// Event sink that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEvents;

impl EventSink for NoopEvents {}

/// Counters kept for one shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardCounts {
    /// Spans written into flushed records.
    pub flushed_spans: u64,
    /// Records produced.
    pub flushed_span_lists: u64,
    /// Payload bytes of produced records.
    pub flushed_bytes: u64,
    /// Spans replaced by a drop marker.
    pub oversized_spans: u64,
    /// Spans inside discarded batches.
    pub dropped_spans: u64,
}

/// Point-in-time copy of [`ExporterMetrics`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    /// Spans handed to the router.
    pub enqueued_spans: u64,
    /// Spans the router finished with.
    pub dequeued_spans: u64,
    /// Spans written into flushed records.
    pub flushed_spans: u64,
    /// Records produced.
    pub flushed_span_lists: u64,
    /// Records produced because a batch reached the size threshold.
    pub size_flushes: u64,
    /// Records produced by the periodic flush.
    pub interval_flushes: u64,
    /// Records produced when a buffer was retired.
    pub retire_flushes: u64,
    /// Payload bytes of produced records.
    pub flushed_bytes: u64,
    /// Compression factor of the most recent record.
    pub last_compression_factor: u64,
    /// Spans replaced by a drop marker.
    pub oversized_spans: u64,
    /// Original bytes of the replaced spans.
    pub oversized_span_bytes: u64,
    /// Spans dropped because no shard owned them.
    pub unroutable_spans: u64,
    /// Batches discarded after a failed handoff.
    pub dropped_batches: u64,
    /// Spans inside the discarded batches.
    pub dropped_spans: u64,
    /// Failed control plane connection attempts.
    pub connect_failures: u64,
    /// Failed sharding config fetches.
    pub assignment_fetch_failures: u64,
    /// Per-shard counters, keyed by shard id.
    pub shards: BTreeMap<String, ShardCounts>,
}

/// Atomic counters for the exporter's events.
#[derive(Debug, Default)]
pub struct ExporterMetrics {
    name: String,
    enqueued_spans: AtomicU64,
    dequeued_spans: AtomicU64,
    flushed_spans: AtomicU64,
    flushed_span_lists: AtomicU64,
    size_flushes: AtomicU64,
    interval_flushes: AtomicU64,
    retire_flushes: AtomicU64,
    flushed_bytes: AtomicU64,
    last_compression_factor: AtomicU64,
    oversized_spans: AtomicU64,
    oversized_span_bytes: AtomicU64,
    unroutable_spans: AtomicU64,
    dropped_batches: AtomicU64,
    dropped_spans: AtomicU64,
    connect_failures: AtomicU64,
    assignment_fetch_failures: AtomicU64,
    shards: Mutex<BTreeMap<String, ShardCounts>>,
}

impl ExporterMetrics {
    /// Create counters labelled with the exporter name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Exporter name these counters belong to.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn update_shard(&self, shard_id: &str, update: impl FnOnce(&mut ShardCounts)) {
        let mut shards = self.shards.lock().unwrap_or_else(PoisonError::into_inner);
        match shards.get_mut(shard_id) {
            Some(counts) => update(counts),
            None => update(shards.entry(shard_id.to_string()).or_default()),
        }
    }

    /// Read every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            enqueued_spans: load(&self.enqueued_spans),
            dequeued_spans: load(&self.dequeued_spans),
            flushed_spans: load(&self.flushed_spans),
            flushed_span_lists: load(&self.flushed_span_lists),
            size_flushes: load(&self.size_flushes),
            interval_flushes: load(&self.interval_flushes),
            retire_flushes: load(&self.retire_flushes),
            flushed_bytes: load(&self.flushed_bytes),
            last_compression_factor: load(&self.last_compression_factor),
            oversized_spans: load(&self.oversized_spans),
            oversized_span_bytes: load(&self.oversized_span_bytes),
            unroutable_spans: load(&self.unroutable_spans),
            dropped_batches: load(&self.dropped_batches),
            dropped_spans: load(&self.dropped_spans),
            connect_failures: load(&self.connect_failures),
            assignment_fetch_failures: load(&self.assignment_fetch_failures),
            shards: self
                .shards
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}

impl EventSink for ExporterMetrics {
    fn span_enqueued(&self) {
        let _ = self.enqueued_spans.fetch_add(1, Ordering::Relaxed);
    }

    fn span_dequeued(&self) {
        let _ = self.dequeued_spans.fetch_add(1, Ordering::Relaxed);
    }

    fn oversized_span_dropped(&self, shard_id: &str, size: usize) {
        let _ = self.oversized_spans.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .oversized_span_bytes
            .fetch_add(size as u64, Ordering::Relaxed);
        self.update_shard(shard_id, |counts| counts.oversized_spans += 1);
    }

    fn span_unroutable(&self, _partition_key: &str) {
        let _ = self.unroutable_spans.fetch_add(1, Ordering::Relaxed);
    }

    fn batch_flushed(&self, event: &FlushEvent<'_>) {
        let _ = self
            .flushed_spans
            .fetch_add(event.span_count, Ordering::Relaxed);
        let _ = self.flushed_span_lists.fetch_add(1, Ordering::Relaxed);
        let by_reason = match event.reason {
            FlushReason::Size => &self.size_flushes,
            FlushReason::Interval => &self.interval_flushes,
            FlushReason::Retire => &self.retire_flushes,
        };
        let _ = by_reason.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .flushed_bytes
            .fetch_add(event.compressed_bytes, Ordering::Relaxed);
        self.last_compression_factor
            .store(event.compression_ratio() as u64, Ordering::Relaxed);
        self.update_shard(event.shard_id, |counts| {
            counts.flushed_spans += event.span_count;
            counts.flushed_span_lists += 1;
            counts.flushed_bytes += event.compressed_bytes;
        });
    }

    // The drop reason is logged by the buffer; counts are per shard only.
    fn batch_dropped(&self, shard_id: &str, span_count: u64, _reason: &str) {
        let _ = self.dropped_batches.fetch_add(1, Ordering::Relaxed);
        let _ = self.dropped_spans.fetch_add(span_count, Ordering::Relaxed);
        self.update_shard(shard_id, |counts| counts.dropped_spans += span_count);
    }

    fn connect_failed(&self, _endpoint: &str) {
        let _ = self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn assignment_fetch_failed(&self) {
        let _ = self
            .assignment_fetch_failures
            .fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_ratio() {
        let event = FlushEvent {
            shard_id: "abc",
            reason: FlushReason::Size,
            span_count: 3,
            uncompressed_bytes: 900,
            compressed_bytes: 300,
        };
        assert_eq!(event.compression_ratio(), 3.0);

        let empty = FlushEvent {
            compressed_bytes: 0,
            ..event
        };
        assert_eq!(empty.compression_ratio(), 0.0);
    }

    #[test]
    fn test_counters_record_events() {
        let metrics = ExporterMetrics::new("omnitelk");
        metrics.span_enqueued();
        metrics.span_enqueued();
        metrics.span_dequeued();
        metrics.oversized_span_dropped("abc", 2_000_000);
        metrics.span_unroutable("00ff");
        metrics.batch_flushed(&FlushEvent {
            shard_id: "abc",
            reason: FlushReason::Interval,
            span_count: 10,
            uncompressed_bytes: 4000,
            compressed_bytes: 500,
        });
        metrics.batch_dropped("abc", 7, "sink closed");
        metrics.connect_failed("http://localhost:1");
        metrics.assignment_fetch_failed();

        let snapshot = metrics.snapshot();
        assert_eq!(metrics.name(), "omnitelk");
        assert_eq!(snapshot.enqueued_spans, 2);
        assert_eq!(snapshot.dequeued_spans, 1);
        assert_eq!(snapshot.oversized_spans, 1);
        assert_eq!(snapshot.oversized_span_bytes, 2_000_000);
        assert_eq!(snapshot.unroutable_spans, 1);
        assert_eq!(snapshot.flushed_spans, 10);
        assert_eq!(snapshot.flushed_span_lists, 1);
        assert_eq!(snapshot.flushed_bytes, 500);
        assert_eq!(snapshot.last_compression_factor, 8);
        assert_eq!(snapshot.dropped_batches, 1);
        assert_eq!(snapshot.dropped_spans, 7);
        assert_eq!(snapshot.connect_failures, 1);
        assert_eq!(snapshot.assignment_fetch_failures, 1);
        assert_eq!(snapshot.interval_flushes, 1);
    }

    #[test]
    fn test_counts_by_reason_and_shard() {
        let metrics = ExporterMetrics::new("omnitelk");
        let flush = |shard_id, reason, span_count| FlushEvent {
            shard_id,
            reason,
            span_count,
            uncompressed_bytes: 1000,
            compressed_bytes: 100,
        };
        metrics.batch_flushed(&flush("a", FlushReason::Size, 4));
        metrics.batch_flushed(&flush("a", FlushReason::Size, 6));
        metrics.batch_flushed(&flush("b", FlushReason::Interval, 1));
        metrics.batch_flushed(&flush("b", FlushReason::Retire, 2));
        metrics.oversized_span_dropped("b", 5_000_000);
        metrics.batch_dropped("c", 3, "sink");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.size_flushes, 2);
        assert_eq!(snapshot.interval_flushes, 1);
        assert_eq!(snapshot.retire_flushes, 1);
        assert_eq!(snapshot.flushed_span_lists, 4);

        assert_eq!(
            snapshot.shards["a"],
            ShardCounts {
                flushed_spans: 10,
                flushed_span_lists: 2,
                flushed_bytes: 200,
                ..Default::default()
            }
        );
        assert_eq!(snapshot.shards["b"].flushed_spans, 3);
        assert_eq!(snapshot.shards["b"].oversized_spans, 1);
        assert_eq!(snapshot.shards["c"].dropped_spans, 3);
        assert_eq!(snapshot.shards.len(), 3);
    }

    #[test]
    fn test_flush_reason_labels() {
        assert_eq!(FlushReason::Size.to_string(), "size");
        assert_eq!(FlushReason::Interval.as_str(), "interval");
        assert_eq!(FlushReason::Retire.as_str(), "retire");
    }
}
