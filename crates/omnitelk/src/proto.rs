// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Protobuf messages of the OmnitelK protocol and the control plane client.
//!
//! The messages are declared with `prost` derives so that no protoc step is
//! needed at build time. Field tags match `omnitelk.proto`.

use opentelemetry_proto::tonic::common::v1::InstrumentationScope;
use opentelemetry_proto::tonic::resource::v1::Resource;
use opentelemetry_proto::tonic::trace::v1::Span;

/// Request for the current sharding config. Carries no parameters.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ConfigRequest {}

/// One shard and the inclusive hash range it owns.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ShardDefinition {
    /// Shard identifier.
    #[prost(string, tag = "1")]
    pub shard_id: ::prost::alloc::string::String,
    /// Big-endian unsigned start of the hash range.
    #[prost(bytes = "vec", tag = "2")]
    pub starting_hash_key: ::prost::alloc::vec::Vec<u8>,
    /// Big-endian unsigned end of the hash range.
    #[prost(bytes = "vec", tag = "3")]
    pub ending_hash_key: ::prost::alloc::vec::Vec<u8>,
}

/// Sharding config returned by the control plane.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ShardingConfig {
    /// Shard definitions, in no particular order.
    #[prost(message, repeated, tag = "1")]
    pub shard_definitions: ::prost::alloc::vec::Vec<ShardDefinition>,
}

/// A span together with the resource and scope it was reported under.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SpanRecord {
    /// Resource of the process that emitted the span.
    #[prost(message, optional, tag = "1")]
    pub resource: ::core::option::Option<Resource>,
    /// Instrumentation scope of the span.
    #[prost(message, optional, tag = "2")]
    pub scope: ::core::option::Option<InstrumentationScope>,
    /// The span itself.
    #[prost(message, optional, tag = "3")]
    pub span: ::core::option::Option<Span>,
}

/// The uncompressed body of an encoded record.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SpanList {
    /// Spans in the order they were buffered.
    #[prost(message, repeated, tag = "1")]
    pub spans: ::prost::alloc::vec::Vec<SpanRecord>,
}

/// Client for the `omnitelk.OmnitelK` service.
pub mod omnitel_k_client {
    use tonic::codegen::http::uri::PathAndQuery;
    use tonic::codegen::{Body, Bytes, StdError};

    /// Thin wrapper over a tonic gRPC client.
    #[derive(Debug, Clone)]
    pub struct OmnitelKClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl OmnitelKClient<tonic::transport::Channel> {
        /// Attempt to create a new client by connecting to a given endpoint.
        pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
        where
            D: TryInto<tonic::transport::Endpoint>,
            D::Error: Into<StdError>,
        {
            let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
            Ok(Self::new(conn))
        }
    }

    impl<T> OmnitelKClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + Send,
    {
        /// Wrap an established transport.
        pub fn new(inner: T) -> Self {
            let inner = tonic::client::Grpc::new(inner);
            Self { inner }
        }

        /// Fetch the current sharding config.
        pub async fn get_sharding_config(
            &mut self,
            request: impl tonic::IntoRequest<super::ConfigRequest>,
        ) -> Result<tonic::Response<super::ShardingConfig>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = PathAndQuery::from_static("/omnitelk.OmnitelK/GetShardingConfig");
            self.inner.unary(request.into_request(), path, codec).await
        }
    }
}
