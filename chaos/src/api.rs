//! Nomad HTTP API probes.

use crate::config::ApiConfig;
use async_trait::async_trait;
use chaos_core::{ChaosError, ClusterApi, Node, Result, RunContext};
use reqwest::StatusCode;
use tracing::debug;

const TOKEN_HEADER: &str = "X-Nomad-Token";

/// Base URL of a node's agent API.
pub fn base_url(config: &ApiConfig, node: &Node) -> String {
    format!("{}://{}:{}", config.scheme, node.public_ip, config.port)
}

#[derive(Debug, Clone)]
pub struct NomadApi {
    client: reqwest::Client,
    config: ApiConfig,
}

impl NomadApi {
    pub fn new(config: ApiConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self { client, config })
    }

    async fn get(&self, ctx: &RunContext, node: &Node, path: &str) -> Result<reqwest::Response> {
        let url = format!("{}{}", base_url(&self.config, node), path);
        let mut request = self.client.get(&url);
        if let Some(token) = &self.config.token {
            request = request.header(TOKEN_HEADER, token);
        }
        debug!(node = %node.name, %url, "api request");
        ctx.run(request.send())
            .await?
            .map_err(|e| ChaosError::remote(format!("GET {url}: {e}")))
    }
}

#[async_trait]
impl ClusterApi for NomadApi {
    async fn leader(&self, ctx: &RunContext, node: &Node) -> Result<String> {
        let response = self.get(ctx, node, "/v1/status/leader").await?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(ChaosError::remote(format!(
                "leader query on {} returned {status}",
                node.name
            )));
        }
        let leader: String = ctx
            .run(response.json())
            .await?
            .map_err(|e| ChaosError::remote(format!("decoding leader from {}: {e}", node.name)))?;
        Ok(leader)
    }

    async fn healthy(&self, ctx: &RunContext, node: &Node) -> Result<bool> {
        let response = self.get(ctx, node, "/v1/agent/health").await?;
        Ok(response.status() == StatusCode::OK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaos_core::NodeRole;

    #[test]
    fn test_base_url() {
        let node = Node::new(NodeRole::Server, 0, "203.0.113.5", "10.0.0.5");
        assert_eq!(base_url(&ApiConfig::default(), &node), "http://203.0.113.5:4646");

        let config = ApiConfig {
            scheme: "https".to_string(),
            port: 14646,
            ..ApiConfig::default()
        };
        assert_eq!(base_url(&config, &node), "https://203.0.113.5:14646");
    }

    #[tokio::test]
    async fn test_unreachable_node_is_remote_failure() {
        let api = NomadApi::new(ApiConfig {
            port: 1,
            request_timeout_secs: 2,
            ..ApiConfig::default()
        })
        .unwrap();
        let node = Node::new(NodeRole::Server, 0, "127.0.0.1", "127.0.0.1");
        let err = api
            .healthy(&RunContext::background(), &node)
            .await
            .unwrap_err();
        assert!(matches!(err, ChaosError::RemoteFailure(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_cancelled_context_short_circuits() {
        let api = NomadApi::new(ApiConfig::default()).unwrap();
        let (ctx, cancel) = RunContext::new();
        cancel.cancel();
        let node = Node::new(NodeRole::Server, 0, "192.0.2.1", "10.0.0.1");
        assert_eq!(api.leader(&ctx, &node).await.unwrap_err(), ChaosError::Cancelled);
    }
}
