// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Configuration for the OmnitelK exporter.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable that caps the number of spans routed concurrently.
pub const MAX_IN_FLIGHT_ENV: &str = "MAX_KINESIS_RECEIVERS";

/// Default exporter name used to label events.
const DEFAULT_NAME: &str = "omnitelk";

/// Default ingestion queue capacity, in spans.
const DEFAULT_QUEUE_SIZE: usize = 100_000;

/// Default size at which a shard buffer is flushed.
const DEFAULT_MAX_BATCH_BYTES: usize = 100_000;

/// Default ceiling for a single encoded span.
const DEFAULT_MAX_SPAN_BYTES: usize = 900_000;

/// Default periodic flush interval.
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Default maximum number of spans in the routing path at once.
const DEFAULT_MAX_IN_FLIGHT_SPANS: usize = 1024;

/// Default delay before the first reconnect attempt.
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Default upper bound on the reconnect delay.
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Configuration for the OmnitelK exporter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// gRPC endpoint of the sharding control plane.
    pub endpoint: String,

    /// Exporter name attached to every emitted event.
    #[serde(default = "default_name")]
    pub name: String,

    /// Capacity of the ingestion queue. `export` blocks when it is full.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Accumulated span bytes at which a shard buffer flushes.
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,

    /// Spans larger than this are replaced by a drop marker.
    #[serde(default = "default_max_span_bytes")]
    pub max_span_bytes: usize,

    /// Interval of the per-shard periodic flush.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Maximum number of spans being routed concurrently.
    #[serde(default = "default_max_in_flight_spans")]
    pub max_in_flight_spans: usize,

    /// Delay before the first reconnect attempt.
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Upper bound on the reconnect delay.
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,

    /// How often an active session re-fetches the sharding config.
    /// If not set, the config is fetched once per connection.
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub refresh_interval: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            name: default_name(),
            queue_size: DEFAULT_QUEUE_SIZE,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            max_span_bytes: DEFAULT_MAX_SPAN_BYTES,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_in_flight_spans: DEFAULT_MAX_IN_FLIGHT_SPANS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            refresh_interval: None,
        }
    }
}

impl Config {
    /// Create a configuration for the given control plane endpoint.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// Set the per-shard flush threshold.
    #[must_use]
    pub fn with_max_batch_bytes(mut self, max_batch_bytes: usize) -> Self {
        self.max_batch_bytes = max_batch_bytes;
        self
    }

    /// Set the per-span size ceiling.
    #[must_use]
    pub fn with_max_span_bytes(mut self, max_span_bytes: usize) -> Self {
        self.max_span_bytes = max_span_bytes;
        self
    }

    /// Set the periodic flush interval.
    #[must_use]
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /// Set the ingestion queue capacity.
    #[must_use]
    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    /// Set the admission bound.
    #[must_use]
    pub fn with_max_in_flight_spans(mut self, max_in_flight_spans: usize) -> Self {
        self.max_in_flight_spans = max_in_flight_spans;
        self
    }

    /// Set the reconnect backoff bounds.
    #[must_use]
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Set the assignment refresh interval.
    #[must_use]
    pub fn with_refresh_interval(mut self, refresh_interval: Duration) -> Self {
        self.refresh_interval = Some(refresh_interval);
        self
    }

    /// Apply operator overrides from the process environment.
    ///
    /// A positive integer in `MAX_KINESIS_RECEIVERS` replaces
    /// `max_in_flight_spans`; anything else is ignored.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        let value = std::env::var(MAX_IN_FLIGHT_ENV).ok();
        self.with_max_in_flight_override(value.as_deref())
    }

    fn with_max_in_flight_override(mut self, value: Option<&str>) -> Self {
        if let Some(limit) = value
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|limit| *limit > 0)
        {
            self.max_in_flight_spans = limit;
        }
        self
    }

    /// Check that every tunable is usable.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| {
            Err(Error::InvalidConfig {
                message: message.to_string(),
            })
        };

        if self.queue_size == 0 {
            return invalid("queue_size must be greater than zero");
        }
        if self.max_batch_bytes == 0 {
            return invalid("max_batch_bytes must be greater than zero");
        }
        if self.max_span_bytes == 0 {
            return invalid("max_span_bytes must be greater than zero");
        }
        if self.flush_interval.is_zero() {
            return invalid("flush_interval must be greater than zero");
        }
        if self.max_in_flight_spans == 0 {
            return invalid("max_in_flight_spans must be greater than zero");
        }
        if self.initial_backoff.is_zero() || self.initial_backoff > self.max_backoff {
            return invalid("initial_backoff must be positive and not exceed max_backoff");
        }
        if matches!(self.refresh_interval, Some(interval) if interval.is_zero()) {
            return invalid("refresh_interval must be greater than zero");
        }
        Ok(())
    }
}

fn default_name() -> String {
    DEFAULT_NAME.to_string()
}

fn default_queue_size() -> usize {
    DEFAULT_QUEUE_SIZE
}

fn default_max_batch_bytes() -> usize {
    DEFAULT_MAX_BATCH_BYTES
}

fn default_max_span_bytes() -> usize {
    DEFAULT_MAX_SPAN_BYTES
}

fn default_flush_interval() -> Duration {
    DEFAULT_FLUSH_INTERVAL
}

fn default_max_in_flight_spans() -> usize {
    DEFAULT_MAX_IN_FLIGHT_SPANS
}

fn default_initial_backoff() -> Duration {
    DEFAULT_INITIAL_BACKOFF
}

fn default_max_backoff() -> Duration {
    DEFAULT_MAX_BACKOFF
}
