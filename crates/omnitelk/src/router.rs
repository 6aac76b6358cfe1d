// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Span router.
//!
//! The router owns the active [`ShardMap`] together with one [`ShardBuffer`]
//! per shard. Both live in a single immutable shard set behind an
//! `RwLock<Arc<_>>`: a map change builds a complete new set and swaps the
//! pointer, so a routing task always sees a consistent map/buffer pairing.
//!
//! Routing tasks that raced a swap and reach a retired buffer get their span
//! handed back and route it again against the new set. Outgoing buffers are
//! flushed one final time when they are retired.
//!
//! Admission control is a semaphore bounding the number of spans inside the
//! routing path at once. Stopping the router waits for those spans, then
//! closes the semaphore so that blocked callers fail with
//! [`Error::PipelineStopped`].

use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics::EventSink;
use crate::proto::SpanRecord;
use crate::shard_buffer::{BufferSettings, ShardBuffer};
use crate::shard_map::ShardMap;
use crate::sink::RecordSink;
use crate::translate::{self, UNSUPPORTED_SIZE_REASON};
use prost::Message;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Router tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterSettings {
    /// Buffered bytes at which a shard buffer flushes.
    pub max_batch_bytes: usize,
    /// Period of the per-shard background flush.
    pub flush_interval: Duration,
    /// Spans encoded larger than this are replaced by a drop marker.
    pub max_span_bytes: usize,
    /// Maximum number of spans in the routing path at once.
    pub max_in_flight_spans: usize,
}

impl From<&Config> for RouterSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_batch_bytes: config.max_batch_bytes,
            flush_interval: config.flush_interval,
            max_span_bytes: config.max_span_bytes,
            max_in_flight_spans: config.max_in_flight_spans,
        }
    }
}

/// Buffered content of one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardStats {
    /// Shard identifier.
    pub shard_id: String,
    /// Spans waiting for the next flush.
    pub buffered_spans: usize,
    /// Bytes waiting for the next flush.
    pub buffered_bytes: usize,
}

/// A shard map and the buffers created for it, index for index.
#[derive(Default)]
struct ShardSet {
    map: ShardMap,
    buffers: Vec<Arc<ShardBuffer>>,
}

/// Routes spans to the buffer of the shard that owns their partition key.
pub struct Router {
    settings: RouterSettings,
    sink: Arc<dyn RecordSink>,
    events: Arc<dyn EventSink>,
    active: RwLock<Arc<ShardSet>>,
    admission: Arc<Semaphore>,
    admission_permits: u32,
    /// Serializes map swaps with each other and with stop.
    swap_lock: tokio::sync::Mutex<()>,
    stopped: AtomicBool,
}

impl Router {
    /// Create a router with no shards. Spans routed before the first
    /// [`Router::set_shard_map`] are dropped as unroutable.
    pub fn new(
        settings: RouterSettings,
        sink: Arc<dyn RecordSink>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let admission_permits = u32::try_from(settings.max_in_flight_spans.max(1))
            .unwrap_or(u32::MAX);
        Self {
            settings,
            sink,
            events,
            active: RwLock::new(Arc::new(ShardSet::default())),
            admission: Arc::new(Semaphore::new(admission_permits as usize)),
            admission_permits,
            swap_lock: tokio::sync::Mutex::new(()),
            stopped: AtomicBool::new(false),
        }
    }

    fn active_set(&self) -> Arc<ShardSet> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace_active_set(&self, set: ShardSet) -> Arc<ShardSet> {
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *active, Arc::new(set))
    }

    /// Copy of the shard map currently in effect.
    pub fn shard_map(&self) -> ShardMap {
        self.active_set().map.clone()
    }

    /// Whether [`Router::stop`] has been called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Buffered spans and bytes of every active shard.
    pub async fn shard_stats(&self) -> Vec<ShardStats> {
        let set = self.active_set();
        let mut stats = Vec::with_capacity(set.buffers.len());
        for buffer in &set.buffers {
            stats.push(ShardStats {
                shard_id: buffer.shard().shard_id().to_string(),
                buffered_spans: buffer.span_count().await,
                buffered_bytes: buffer.current_size().await,
            });
        }
        stats
    }

    /// Install a new shard map.
    ///
    /// New buffers are started before the swap. The buffers of the previous
    /// map are stopped afterwards, which flushes whatever they still hold.
    pub async fn set_shard_map(&self, map: ShardMap) -> Result<()> {
        let _swap = self.swap_lock.lock().await;
        if self.is_stopped() {
            return Err(Error::PipelineStopped);
        }

        for issue in map.coverage_issues() {
            tracing::warn!(%issue, "Shard map does not cover the hash space cleanly");
        }

        let buffer_settings = BufferSettings {
            max_batch_bytes: self.settings.max_batch_bytes,
            flush_interval: self.settings.flush_interval,
        };
        let buffers: Vec<Arc<ShardBuffer>> = map
            .shards()
            .iter()
            .map(|shard| {
                Arc::new(ShardBuffer::new(
                    shard.clone(),
                    buffer_settings,
                    Arc::clone(&self.sink),
                    Arc::clone(&self.events),
                ))
            })
            .collect();
        for buffer in &buffers {
            buffer.start();
        }

        let shard_count = map.len();
        let previous = self.replace_active_set(ShardSet { map, buffers });
        for buffer in &previous.buffers {
            buffer.stop().await;
        }

        tracing::info!(
            shards = shard_count,
            retired_shards = previous.buffers.len(),
            "Installed shard map"
        );
        Ok(())
    }

    /// Route one span, waiting for an admission slot first.
    ///
    /// Per-span failures are reported through events and returned so that
    /// callers can observe them; the span is not retried.
    pub async fn route(&self, record: SpanRecord) -> Result<()> {
        self.events.span_enqueued();
        let Ok(_permit) = self.admission.acquire().await else {
            return Err(self.refuse_after_stop());
        };
        self.route_admitted(record).await
    }

    /// Wait for an admission slot, then route the span on its own task.
    ///
    /// Returns once the task is spawned. Fails only when the router is
    /// stopped.
    pub async fn dispatch(self: &Arc<Self>, record: SpanRecord) -> Result<()> {
        self.events.span_enqueued();
        let Ok(permit) = Arc::clone(&self.admission).acquire_owned().await else {
            return Err(self.refuse_after_stop());
        };

        let router = Arc::clone(self);
        drop(tokio::spawn(async move {
            let _ = router.route_admitted(record).await;
            drop(permit);
        }));
        Ok(())
    }

    /// Admission is closed: the enqueued span leaves without being routed.
    fn refuse_after_stop(&self) -> Error {
        self.events.span_dequeued();
        Error::PipelineStopped
    }

    async fn route_admitted(&self, record: SpanRecord) -> Result<()> {
        let result = self.place(record).await;
        self.events.span_dequeued();
        result
    }

    async fn place(&self, mut record: SpanRecord) -> Result<()> {
        let partition_key = translate::partition_key(&record);
        let mut size = record.encoded_len();
        let mut size_checked = false;

        loop {
            if self.is_stopped() {
                tracing::warn!(partition_key = %partition_key, "Dropping span routed after stop");
                return Err(Error::PipelineStopped);
            }

            let set = self.active_set();
            let (index, shard) = match set.map.find_shard(&partition_key) {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping unroutable span");
                    self.events.span_unroutable(&partition_key);
                    return Err(e);
                }
            };

            if !size_checked {
                size_checked = true;
                if size > self.settings.max_span_bytes {
                    let oversized = Error::OversizedSpan {
                        size,
                        limit: self.settings.max_span_bytes,
                    };
                    tracing::warn!(
                        shard_id = %shard.shard_id(),
                        error = %oversized,
                        "Replacing span body with drop marker"
                    );
                    self.events.oversized_span_dropped(shard.shard_id(), size);
                    translate::mark_dropped(&mut record, UNSUPPORTED_SIZE_REASON, size);
                    size = record.encoded_len();
                }
            }

            match set.buffers[index].put(record, size).await {
                Ok(()) => return Ok(()),
                Err(returned) => {
                    // The buffer was retired under us. If the active set is
                    // still the one we used, nothing newer exists to go to.
                    if Arc::ptr_eq(&set, &self.active_set()) {
                        return Err(Error::ShardRetired {
                            shard_id: shard.shard_id().to_string(),
                        });
                    }
                    record = returned;
                }
            }
        }
    }

    /// Stop routing: wait for in-flight spans, close admission, and stop
    /// every buffer. Safe to call more than once.
    pub async fn stop(&self) {
        let _swap = self.swap_lock.lock().await;
        if self.stopped.load(Ordering::Acquire) {
            return;
        }

        // Holding every permit means no span is inside the routing path.
        match self.admission.acquire_many(self.admission_permits).await {
            Ok(permits) => permits.forget(),
            Err(_) => tracing::debug!("Admission already closed"),
        }
        self.stopped.store(true, Ordering::Release);
        self.admission.close();

        let previous = self.replace_active_set(ShardSet::default());
        for buffer in &previous.buffers {
            buffer.stop().await;
        }
        tracing::info!(shards = previous.buffers.len(), "Router stopped");
    }
}
