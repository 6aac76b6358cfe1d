// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Conversion of incoming OTLP trace requests into routable span records.

use crate::error::{Error, Result};
use crate::proto::SpanRecord;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, KeyValue};
use std::fmt::Write;

/// Attribute set on spans whose body was dropped.
pub const DROPPED_KEY: &str = "omnition.dropped";
/// Attribute holding the reason a span body was dropped.
pub const DROPPED_REASON_KEY: &str = "omnition.dropped.reason";
/// Attribute holding the encoded size of the dropped span.
pub const DROPPED_SIZE_KEY: &str = "omnition.dropped.size";
/// Reason recorded for spans over the size ceiling.
pub const UNSUPPORTED_SIZE_REASON: &str = "unsupported size";

const TRACE_ID_LEN: usize = 16;

/// Flatten a request into one record per span.
///
/// Every span keeps the resource and scope it was reported under. A span
/// with a malformed trace id rejects the whole request.
pub fn flatten_request(request: ExportTraceServiceRequest) -> Result<Vec<SpanRecord>> {
    let mut records = Vec::new();
    for resource_spans in request.resource_spans {
        for scope_spans in resource_spans.scope_spans {
            for span in scope_spans.spans {
                if span.trace_id.len() != TRACE_ID_LEN {
                    return Err(Error::Translation {
                        message: format!(
                            "span {:?} has a {}-byte trace id, expected {TRACE_ID_LEN}",
                            span.name,
                            span.trace_id.len()
                        ),
                    });
                }
                records.push(SpanRecord {
                    resource: resource_spans.resource.clone(),
                    scope: scope_spans.scope.clone(),
                    span: Some(span),
                });
            }
        }
    }
    Ok(records)
}

/// Partition key of a record, derived from its trace id.
///
/// The 16 bytes are read as big-endian high and low halves. A zero high
/// half gives the low half in hex without padding; otherwise the high half
/// is written unpadded followed by the low half padded to 16 digits. Ids of
/// any other length are written as plain hex.
pub fn partition_key(record: &SpanRecord) -> String {
    let trace_id = record
        .span
        .as_ref()
        .map(|span| span.trace_id.as_slice())
        .unwrap_or_default();

    let Some((high, low)) = split_trace_id(trace_id) else {
        let mut key = String::with_capacity(trace_id.len() * 2);
        for byte in trace_id {
            let _ = write!(key, "{byte:02x}");
        }
        return key;
    };
    if high == 0 {
        format!("{low:x}")
    } else {
        format!("{high:x}{low:016x}")
    }
}

fn split_trace_id(trace_id: &[u8]) -> Option<(u64, u64)> {
    let bytes: [u8; TRACE_ID_LEN] = trace_id.try_into().ok()?;
    let (high, low) = bytes.split_at(TRACE_ID_LEN / 2);
    Some((
        u64::from_be_bytes(high.try_into().ok()?),
        u64::from_be_bytes(low.try_into().ok()?),
    ))
}

/// Replace the span body with a marker recording why and how big it was.
///
/// Identity, timing and status are kept so the trace stays navigable.
pub fn mark_dropped(record: &mut SpanRecord, reason: &str, original_size: usize) {
    let Some(span) = record.span.as_mut() else {
        return;
    };
    span.attributes = vec![
        key_value(DROPPED_KEY, any_value::Value::BoolValue(true)),
        key_value(
            DROPPED_REASON_KEY,
            any_value::Value::StringValue(reason.to_string()),
        ),
        key_value(
            DROPPED_SIZE_KEY,
            any_value::Value::IntValue(i64::try_from(original_size).unwrap_or(i64::MAX)),
        ),
    ];
    span.dropped_attributes_count = 0;
    span.events.clear();
    span.dropped_events_count = 0;
    span.links.clear();
    span.dropped_links_count = 0;
}

fn key_value(key: &str, value: any_value::Value) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue { value: Some(value) }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry_proto::tonic::common::v1::InstrumentationScope;
    use opentelemetry_proto::tonic::resource::v1::Resource;
    use opentelemetry_proto::tonic::trace::v1::span::Event;
    use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Span};
    use prost::Message;

    fn span(name: &str, trace_id: Vec<u8>) -> Span {
        Span {
            name: name.to_string(),
            trace_id,
            span_id: vec![1; 8],
            ..Default::default()
        }
    }

    fn request(spans: Vec<Span>) -> ExportTraceServiceRequest {
        ExportTraceServiceRequest {
            resource_spans: vec![ResourceSpans {
                resource: Some(Resource {
                    attributes: vec![key_value(
                        "service.name",
                        any_value::Value::StringValue("checkout".into()),
                    )],
                    ..Default::default()
                }),
                scope_spans: vec![ScopeSpans {
                    scope: Some(InstrumentationScope {
                        name: "tests".into(),
                        ..Default::default()
                    }),
                    spans,
                    ..Default::default()
                }],
                ..Default::default()
            }],
        }
    }

    #[test]
    fn test_flatten_keeps_resource_and_scope() {
        let records = flatten_request(request(vec![
            span("a", vec![0xab; 16]),
            span("b", vec![0x01; 16]),
        ]))
        .unwrap();

        assert_eq!(records.len(), 2);
        for record in &records {
            let resource = record.resource.as_ref().unwrap();
            assert_eq!(resource.attributes[0].key, "service.name");
            assert_eq!(record.scope.as_ref().unwrap().name, "tests");
        }
        assert_eq!(records[1].span.as_ref().unwrap().name, "b");
    }

    #[test]
    fn test_bad_trace_id_rejects_batch() {
        let result = flatten_request(request(vec![
            span("good", vec![0xab; 16]),
            span("bad", vec![0xab; 4]),
        ]));
        assert!(matches!(result, Err(Error::Translation { .. })));
    }

    fn keyed(trace_id: u128) -> SpanRecord {
        SpanRecord {
            span: Some(span("a", trace_id.to_be_bytes().to_vec())),
            ..Default::default()
        }
    }

    #[test]
    fn test_partition_key_low_half_only() {
        assert_eq!(partition_key(&keyed(0x2a)), "2a");
        assert_eq!(partition_key(&keyed(0)), "0");
        assert_eq!(partition_key(&keyed(u128::from(u64::MAX))), "ffffffffffffffff");
    }

    #[test]
    fn test_partition_key_high_half_unpadded() {
        // High half with a leading zero nibble, low half needing padding.
        let trace_id = (0x0abc_u128 << 64) | 0x1;
        assert_eq!(partition_key(&keyed(trace_id)), "abc0000000000000001");
    }

    #[test]
    fn test_partition_key_full_width() {
        let trace_id = 0xf123_4567_89ab_cdef_0011_2233_4455_6677_u128;
        assert_eq!(
            partition_key(&keyed(trace_id)),
            "f123456789abcdef0011223344556677"
        );
    }

    #[test]
    fn test_partition_key_other_lengths() {
        assert_eq!(partition_key(&SpanRecord::default()), "");
        let short = SpanRecord {
            span: Some(span("a", vec![0x00, 0x2a])),
            ..Default::default()
        };
        assert_eq!(partition_key(&short), "002a");
    }

    #[test]
    fn test_mark_dropped_replaces_body() {
        let mut big = span("big", vec![7; 16]);
        big.attributes = (0..100)
            .map(|i| {
                key_value(
                    &format!("attr.{i}"),
                    any_value::Value::StringValue("x".repeat(100)),
                )
            })
            .collect();
        big.events = vec![Event {
            name: "exception".into(),
            ..Default::default()
        }];
        let mut record = SpanRecord {
            span: Some(big),
            ..Default::default()
        };
        let original_size = record.encoded_len();

        mark_dropped(&mut record, UNSUPPORTED_SIZE_REASON, original_size);

        let span = record.span.as_ref().unwrap();
        assert_eq!(span.name, "big");
        assert_eq!(span.trace_id, vec![7; 16]);
        assert!(span.events.is_empty());
        assert_eq!(span.attributes.len(), 3);
        assert_eq!(span.attributes[0].key, DROPPED_KEY);
        assert_eq!(
            span.attributes[2].value,
            Some(AnyValue {
                value: Some(any_value::Value::IntValue(original_size as i64))
            })
        );
        assert!(record.encoded_len() < original_size);
    }
}
