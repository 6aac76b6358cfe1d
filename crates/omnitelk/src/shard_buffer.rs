// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Per-shard span buffer.
//!
//! A buffer accumulates spans for one shard and turns them into an
//! [`EncodedRecord`] when either trigger fires:
//!
//! - size: the next span would bring the buffered bytes to `max_batch_bytes`;
//! - time: the periodic flush task finds a non-empty buffer.
//!
//! All mutation happens under the buffer's own async mutex, so appends and
//! flushes of one shard never interleave and two flushes never overlap. The
//! lock is held while the record is handed to the sink, which makes a slow
//! sink back-pressure the spans routed to this shard.

use crate::error::{Error, Result};
use crate::metrics::{EventSink, FlushEvent, FlushReason};
use crate::proto::{SpanList, SpanRecord};
use crate::shard_map::ShardDescriptor;
use crate::sink::{EncodedRecord, RecordSink, COMPRESSED_MAGIC};
use crate::translate;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use prost::Message;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Expected number of spans per batch, used to size the span list up front.
const AVG_BATCH_SIZE: usize = 1000;

/// Tunables shared by every buffer of a shard map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSettings {
    /// Buffered bytes at which the buffer is flushed before appending.
    pub max_batch_bytes: usize,
    /// Period of the background flush.
    pub flush_interval: Duration,
}

/// Serializes and gzips span lists, reusing its scratch space across flushes.
struct Compressor {
    level: Compression,
    encoded: Vec<u8>,
    frame_capacity: usize,
}

impl Compressor {
    fn new() -> Self {
        Self {
            level: Compression::default(),
            encoded: Vec::new(),
            frame_capacity: COMPRESSED_MAGIC.len(),
        }
    }

    /// Returns the framed payload and the uncompressed size.
    fn compress(&mut self, list: &SpanList) -> Result<(Bytes, usize)> {
        self.encoded.clear();
        list.encode(&mut self.encoded)
            .map_err(|e| Error::Serialization {
                message: e.to_string(),
            })?;

        let mut frame = Vec::with_capacity(self.frame_capacity);
        frame.extend_from_slice(&COMPRESSED_MAGIC);
        let gzip_error = |e: std::io::Error| Error::Serialization {
            message: format!("gzip failed: {e}"),
        };
        let mut encoder = GzEncoder::new(frame, self.level);
        encoder.write_all(&self.encoded).map_err(gzip_error)?;
        let frame = encoder.finish().map_err(gzip_error)?;

        self.frame_capacity = frame.len();
        Ok((Bytes::from(frame), self.encoded.len()))
    }
}

/// State guarded by the buffer lock.
struct BufferState {
    spans: Vec<SpanRecord>,
    size: usize,
    compressor: Compressor,
    retired: bool,
}

/// Handle for the periodic flush task of one buffer.
struct FlushHandle {
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<()>,
}

/// Buffer of spans owned by one shard.
pub struct ShardBuffer {
    shard: ShardDescriptor,
    settings: BufferSettings,
    sink: Arc<dyn RecordSink>,
    events: Arc<dyn EventSink>,
    state: tokio::sync::Mutex<BufferState>,
    flush_task: Mutex<Option<FlushHandle>>,
}

impl ShardBuffer {
    /// Create an idle buffer. Call [`ShardBuffer::start`] to enable the
    /// periodic flush.
    pub fn new(
        shard: ShardDescriptor,
        settings: BufferSettings,
        sink: Arc<dyn RecordSink>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            shard,
            settings,
            sink,
            events,
            state: tokio::sync::Mutex::new(BufferState {
                spans: Vec::with_capacity(AVG_BATCH_SIZE),
                size: 0,
                compressor: Compressor::new(),
                retired: false,
            }),
            flush_task: Mutex::new(None),
        }
    }

    /// Shard this buffer belongs to.
    pub fn shard(&self) -> &ShardDescriptor {
        &self.shard
    }

    /// Bytes currently buffered.
    pub async fn current_size(&self) -> usize {
        self.state.lock().await.size
    }

    /// Spans currently buffered.
    pub async fn span_count(&self) -> usize {
        self.state.lock().await.spans.len()
    }

    /// Spawn the periodic flush task. Calling it again has no effect.
    pub fn start(self: &Arc<Self>) {
        let mut flush_task = self
            .flush_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if flush_task.is_some() {
            return;
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let join_handle = tokio::spawn(flush_periodically(
            Arc::downgrade(self),
            self.settings.flush_interval,
            shutdown_rx,
        ));
        *flush_task = Some(FlushHandle {
            shutdown_tx,
            join_handle,
        });
    }

    /// Append a span, flushing first if it would reach the size threshold.
    ///
    /// A retired buffer refuses the span and hands it back so that the
    /// caller can route it against the current shard map.
    pub async fn put(
        &self,
        record: SpanRecord,
        size: usize,
    ) -> std::result::Result<(), SpanRecord> {
        let mut state = self.state.lock().await;
        if state.retired {
            return Err(record);
        }

        if state.size + size >= self.settings.max_batch_bytes {
            self.flush_locked(&mut state, FlushReason::Size).await;
        }

        state.spans.push(record);
        state.size += size;
        Ok(())
    }

    /// Flush whatever is buffered. Does nothing when empty.
    pub async fn flush(&self, reason: FlushReason) {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state, reason).await;
    }

    /// Stop the periodic flush, refuse further spans and flush the rest.
    pub async fn stop(&self) {
        let flush_task = self
            .flush_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(FlushHandle {
            shutdown_tx,
            join_handle,
        }) = flush_task
        {
            let _ = shutdown_tx.send(());
            if let Err(e) = join_handle.await {
                tracing::warn!(
                    shard_id = %self.shard.shard_id(),
                    error = %e,
                    "Flush task ended abnormally"
                );
            }
        }

        let mut state = self.state.lock().await;
        state.retired = true;
        self.flush_locked(&mut state, FlushReason::Retire).await;
    }

    async fn flush_locked(&self, state: &mut BufferState, reason: FlushReason) {
        if state.spans.is_empty() {
            return;
        }

        let span_count = state.spans.len() as u64;
        let partition_key = translate::partition_key(&state.spans[0]);

        // Move the spans into a list for encoding, then put the emptied
        // vector back so its capacity is reused by the next batch.
        let list = SpanList {
            spans: std::mem::take(&mut state.spans),
        };
        let compressed = state.compressor.compress(&list);
        state.spans = list.spans;
        state.spans.clear();
        state.size = 0;

        let shard_id = self.shard.shard_id();
        let (payload, uncompressed_bytes) = match compressed {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(
                    shard_id = %shard_id,
                    span_count,
                    error = %e,
                    "Failed to encode span list"
                );
                self.events
                    .batch_dropped(shard_id, span_count, "serialization");
                return;
            }
        };

        let compressed_bytes = payload.len() as u64;
        let record = EncodedRecord {
            payload,
            partition_key,
            span_count,
            uncompressed_bytes: uncompressed_bytes as u64,
        };

        match self.sink.produce(record).await {
            Ok(()) => {
                let event = FlushEvent {
                    shard_id,
                    reason,
                    span_count,
                    uncompressed_bytes: uncompressed_bytes as u64,
                    compressed_bytes,
                };
                tracing::debug!(
                    shard_id = %shard_id,
                    reason = %reason,
                    span_count,
                    compressed_bytes,
                    compression_ratio = event.compression_ratio(),
                    "Flushed span list"
                );
                self.events.batch_flushed(&event);
            }
            Err(e) => {
                tracing::warn!(
                    shard_id = %shard_id,
                    reason = %reason,
                    span_count,
                    error = %e,
                    "Dropped span list"
                );
                self.events.batch_dropped(shard_id, span_count, "sink");
            }
        }
    }
}

async fn flush_periodically(
    buffer: Weak<ShardBuffer>,
    flush_interval: Duration,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + flush_interval, flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            _ = ticker.tick() => {
                let Some(buffer) = buffer.upgrade() else {
                    break;
                };
                let mut state = buffer.state.lock().await;
                if state.size > 0 {
                    buffer.flush_locked(&mut state, FlushReason::Interval).await;
                }
            }
        }
    }
}
