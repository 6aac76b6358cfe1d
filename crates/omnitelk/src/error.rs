// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors for the OmnitelK exporter.

/// Errors that can occur while exporting spans through the sharded pipeline.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The control connection could not be established. Retried with backoff.
    #[error("Failed to connect to {endpoint}: {message}")]
    Connection {
        /// Control plane endpoint.
        endpoint: String,
        /// Underlying error description.
        message: String,
    },

    /// The sharding config could not be fetched over an open connection.
    #[error("Failed to fetch sharding config: {message}")]
    AssignmentFetch {
        /// Underlying error description.
        message: String,
    },

    /// No shard in the active map owns the hash of the partition key.
    #[error("No shard found for partition key {key}")]
    NoShardForKey {
        /// The partition key that could not be placed.
        key: String,
    },

    /// A span exceeded the per-span size ceiling.
    #[error("Span of {size} bytes exceeds the {limit} byte limit")]
    OversizedSpan {
        /// Encoded size of the span.
        size: usize,
        /// Configured ceiling.
        limit: usize,
    },

    /// A span list could not be encoded or compressed.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Underlying error description.
        message: String,
    },

    /// The pipeline has been stopped and accepts no more spans.
    #[error("Pipeline stopped")]
    PipelineStopped,

    /// An incoming batch could not be translated into routable spans.
    #[error("Failed to translate span batch: {message}")]
    Translation {
        /// Reason the batch was rejected.
        message: String,
    },

    /// A shard boundary could not be decoded into a hash key.
    #[error("Invalid hash key for shard {shard_id}: {message}")]
    InvalidShardKey {
        /// Shard carrying the bad boundary.
        shard_id: String,
        /// Reason the boundary was rejected.
        message: String,
    },

    /// The configuration is invalid.
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Reason the configuration was rejected.
        message: String,
    },

    /// The output sink refused an encoded record.
    #[error("Record sink error: {message}")]
    Sink {
        /// Underlying error description.
        message: String,
    },

    /// The shard buffer was retired by a shard map swap.
    #[error("Shard {shard_id} has been retired")]
    ShardRetired {
        /// Retired shard.
        shard_id: String,
    },
}

/// Result type for exporter operations.
pub type Result<T> = std::result::Result<T, Error>;
