// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Sharded OmnitelK trace exporter.
//!
//! Spans are partitioned by the MD5 hash of their trace id across the shards
//! assigned by a control plane. Each shard batches its spans, gzips the batch
//! behind an 8-byte magic prefix and hands the record to a [`RecordSink`],
//! flushing on size or on a timer.
//!
//! # Architecture
//!
//! ```text
//!              export(ExportTraceServiceRequest)
//!                            │
//!                            ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        OmnitelkExporter                          │
//! │                                                                  │
//! │  ingestion queue ──▶ drain task ──▶ Router ──┬──▶ ShardBuffer a  │
//! │   (flume, bounded)                (semaphore) ├──▶ ShardBuffer b  │
//! │                                     ▲         └──▶ ShardBuffer c  │
//! │  session task ── ShardMap ──────────┘                │           │
//! │     │                                                │           │
//! └─────┼────────────────────────────────────────────────┼───────────┘
//!       │ GetShardingConfig (gRPC)                       │ EncodedRecord
//!       ▼                                                ▼
//!  control plane                                  RecordSink (flume)
//! ```

pub mod backoff;
pub mod config;
pub mod control_plane;
pub mod error;
pub mod exporter;
pub mod metrics;
pub mod proto;
pub mod router;
pub mod shard_buffer;
pub mod shard_map;
pub mod sink;
pub mod translate;

pub use config::Config;
pub use control_plane::{ControlPlane, GrpcControlPlane, ShardingConfigSource};
pub use error::{Error, Result};
pub use exporter::{OmnitelkExporter, SessionState};
pub use metrics::{
    EventSink, ExporterMetrics, FlushEvent, FlushReason, MetricsSnapshot, NoopEvents, ShardCounts,
};
pub use router::Router;
pub use shard_map::{ShardDescriptor, ShardMap};
pub use sink::{
    create_record_channel, EncodedRecord, RecordReceiver, RecordSender, RecordSink,
    COMPRESSED_MAGIC,
};
