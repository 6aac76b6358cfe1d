// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Control plane connection.
//!
//! The session manager only needs two things from the control plane: open a
//! connection, and fetch the sharding config over it. Both are behind traits
//! so the session logic can be driven without a network.

use crate::error::{Error, Result};
use crate::proto::omnitel_k_client::OmnitelKClient;
use crate::proto::{ConfigRequest, ShardingConfig};
use async_trait::async_trait;
use tonic::transport::Channel;

/// Factory for control connections.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Address used in logs and events.
    fn endpoint(&self) -> &str;

    /// Open a new control connection.
    async fn connect(&self) -> Result<Box<dyn ShardingConfigSource>>;
}

/// An open control connection.
#[async_trait]
pub trait ShardingConfigSource: Send {
    /// Fetch the current sharding config.
    async fn fetch_sharding_config(&mut self) -> Result<ShardingConfig>;
}

/// Control plane reached over gRPC.
#[derive(Debug, Clone)]
pub struct GrpcControlPlane {
    endpoint: String,
}

impl GrpcControlPlane {
    /// Create a control plane for the given endpoint URI.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl ControlPlane for GrpcControlPlane {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn connect(&self) -> Result<Box<dyn ShardingConfigSource>> {
        let client = OmnitelKClient::connect(self.endpoint.clone())
            .await
            .map_err(|e| Error::Connection {
                endpoint: self.endpoint.clone(),
                message: e.to_string(),
            })?;
        Ok(Box::new(GrpcConfigSource { client }))
    }
}

struct GrpcConfigSource {
    client: OmnitelKClient<Channel>,
}

#[async_trait]
impl ShardingConfigSource for GrpcConfigSource {
    async fn fetch_sharding_config(&mut self) -> Result<ShardingConfig> {
        let response = self
            .client
            .get_sharding_config(ConfigRequest {})
            .await
            .map_err(|status| Error::AssignmentFetch {
                message: format!("{}: {}", status.code(), status.message()),
            })?;
        Ok(response.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_failure_is_connection_error() {
        // Nothing listens on port 1.
        let control_plane = GrpcControlPlane::new("http://127.0.0.1:1");
        assert_eq!(control_plane.endpoint(), "http://127.0.0.1:1");

        match control_plane.connect().await {
            Err(Error::Connection { endpoint, .. }) => {
                assert_eq!(endpoint, "http://127.0.0.1:1");
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("connect should fail"),
        }
    }

    #[tokio::test]
    async fn test_invalid_uri_is_connection_error() {
        let control_plane = GrpcControlPlane::new("not a uri");
        assert!(matches!(
            control_plane.connect().await,
            Err(Error::Connection { .. })
        ));
    }
}
