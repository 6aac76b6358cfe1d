// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Output side of the exporter.
//!
//! Every flush produces one [`EncodedRecord`] that is handed to a
//! [`RecordSink`]. The bundled sink is a bounded flume channel: the exporter
//! holds the [`RecordSender`] and the transport that writes to the stream
//! pulls records from the [`RecordReceiver`], possibly on its own thread.

use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;

/// Fixed prefix identifying the framing of a record payload (`om:jsplz`).
pub const COMPRESSED_MAGIC: [u8; 8] = [111, 109, 58, 106, 115, 112, 108, 122];

/// A compressed span list ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedRecord {
    /// Magic prefix followed by the gzip stream of the encoded span list.
    pub payload: Bytes,
    /// Partition key of the first span in the batch.
    pub partition_key: String,
    /// Number of spans in the batch.
    pub span_count: u64,
    /// Size of the span list before compression.
    pub uncompressed_bytes: u64,
}

impl EncodedRecord {
    /// The gzip stream without the magic prefix.
    pub fn compressed_body(&self) -> &[u8] {
        self.payload
            .get(COMPRESSED_MAGIC.len()..)
            .unwrap_or_default()
    }

    /// Whether the payload starts with the expected magic prefix.
    pub fn has_magic(&self) -> bool {
        self.payload.starts_with(&COMPRESSED_MAGIC)
    }
}

/// Destination of encoded records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Take ownership of a record. Errors mean the record was not accepted.
    async fn produce(&self, record: EncodedRecord) -> Result<()>;
}

/// Sender half of a record channel, held by the exporter.
#[derive(Debug, Clone)]
pub struct RecordSender {
    record_tx: flume::Sender<EncodedRecord>,
}

impl RecordSender {
    /// Send a record, waiting for room when the channel is full.
    pub async fn send_async(&self, record: EncodedRecord) -> Result<()> {
        self.record_tx
            .send_async(record)
            .await
            .map_err(|_| Error::Sink {
                message: "record receiver disconnected".to_string(),
            })
    }

    /// Try to send a record without waiting.
    pub fn try_send(&self, record: EncodedRecord) -> Result<()> {
        self.record_tx.try_send(record).map_err(|e| match e {
            flume::TrySendError::Full(_) => Error::Sink {
                message: "record channel is full".to_string(),
            },
            flume::TrySendError::Disconnected(_) => Error::Sink {
                message: "record receiver disconnected".to_string(),
            },
        })
    }

    /// Returns true if the receiver has been dropped.
    pub fn is_disconnected(&self) -> bool {
        self.record_tx.is_disconnected()
    }
}

#[async_trait]
impl RecordSink for RecordSender {
    async fn produce(&self, record: EncodedRecord) -> Result<()> {
        self.send_async(record).await
    }
}

/// Receiver half of a record channel, held by the transport.
#[derive(Debug, Clone)]
pub struct RecordReceiver {
    record_rx: flume::Receiver<EncodedRecord>,
}

impl RecordReceiver {
    /// Blocking receive of the next record.
    ///
    /// Returns `None` once every sender is dropped and the channel is drained.
    pub fn recv(&self) -> Option<EncodedRecord> {
        self.record_rx.recv().ok()
    }

    /// Receive the next record asynchronously.
    pub async fn recv_async(&self) -> Option<EncodedRecord> {
        self.record_rx.recv_async().await.ok()
    }

    /// Try to receive a record without blocking.
    pub fn try_recv(&self) -> Option<EncodedRecord> {
        self.record_rx.try_recv().ok()
    }

    /// Receive with a timeout.
    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Option<EncodedRecord> {
        self.record_rx.recv_timeout(timeout).ok()
    }

    /// Take every record currently queued.
    pub fn drain(&self) -> Vec<EncodedRecord> {
        self.record_rx.drain().collect()
    }

    /// Number of records waiting.
    pub fn len(&self) -> usize {
        self.record_rx.len()
    }

    /// Returns true if no record is waiting.
    pub fn is_empty(&self) -> bool {
        self.record_rx.is_empty()
    }

    /// Returns true if every sender has been dropped.
    pub fn is_disconnected(&self) -> bool {
        self.record_rx.is_disconnected()
    }
}

/// Creates a bounded record channel.
///
/// # Arguments
///
/// * `capacity` - Number of records that may wait for the transport.
pub fn create_record_channel(capacity: usize) -> (RecordSender, RecordReceiver) {
    let (record_tx, record_rx) = flume::bounded(capacity);
    (RecordSender { record_tx }, RecordReceiver { record_rx })
}
