//! Third-party relay service client
//!
//! First submission tier: hand the encoded call to a commercial relay
//! network that fronts gas in exchange for the offered fee. Submission
//! returns a task id; completion is observed through the contract event
//! bus, not through the relay API.

use crate::error::{RouterError, RouterResult};

use async_trait::async_trait;
use ethers::types::{Address, Bytes, U256};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

#[cfg(test)]
use mockall::automock;

/// One relayed call.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub chain_id: u64,
    pub to: Address,
    pub data: Bytes,
    pub fee_asset: Address,
    pub fee_amount: U256,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait RelayService: Send + Sync {
    /// Whether the service accepts submissions for this chain.
    fn is_chain_supported(&self, chain_id: u64) -> bool;

    /// Submit the call; returns the service's task id on acceptance.
    async fn submit(&self, request: RelayRequest) -> RouterResult<String>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelayResponse {
    task_id: String,
}

pub struct HttpRelayService {
    client: reqwest::Client,
    endpoint: String,
    supported_chains: Vec<u64>,
}

impl HttpRelayService {
    pub fn new(endpoint: String, supported_chains: Vec<u64>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            supported_chains,
        }
    }
}

#[async_trait]
impl RelayService for HttpRelayService {
    fn is_chain_supported(&self, chain_id: u64) -> bool {
        self.supported_chains.contains(&chain_id)
    }

    async fn submit(&self, request: RelayRequest) -> RouterResult<String> {
        let url = format!("{}/relays/{}", self.endpoint, request.chain_id);
        let body = json!({
            "dest": format!("{:?}", request.to),
            "data": format!("0x{}", hex::encode(&request.data)),
            "token": format!("{:?}", request.fee_asset),
            "relayerFee": request.fee_amount.to_string(),
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RouterError::RelayService(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(RouterError::RelayService(format!(
                "relay service returned {}: {}",
                status, text
            )));
        }

        let parsed: RelayResponse = response
            .json()
            .await
            .map_err(|e| RouterError::RelayService(e.to_string()))?;

        info!(
            chain_id = request.chain_id,
            task_id = %parsed.task_id,
            "Relay service accepted submission"
        );
        Ok(parsed.task_id)
    }
}
