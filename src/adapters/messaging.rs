//! Meta-transaction messaging client
//!
//! Second submission tier: publish a signed meta-transaction request to the
//! gateway of the peer relayer network. Exactly one publish per attempt;
//! like the relay tier, completion is observed through the contract event
//! bus.

use crate::error::{RouterError, RouterResult};

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use serde_json::json;
use tracing::info;

#[cfg(test)]
use mockall::automock;

/// A request for a peer relayer to submit the call on our behalf.
#[derive(Debug, Clone)]
pub struct MetaTxRequest {
    pub transaction_id: H256,
    pub chain_id: u64,
    pub to: Address,
    pub data: Bytes,
    pub relayer_fee_asset: Address,
    pub relayer_fee: U256,
    /// Router signature over the fee terms, verified on chain.
    pub fee_signature: Bytes,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Messaging: Send + Sync {
    /// Publish the request. Fire and forget: acceptance here only means the
    /// gateway took the message.
    async fn publish_meta_tx(&self, request: MetaTxRequest) -> RouterResult<()>;
}

pub struct HttpMessaging {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpMessaging {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Messaging for HttpMessaging {
    async fn publish_meta_tx(&self, request: MetaTxRequest) -> RouterResult<()> {
        let url = format!("{}/metatx", self.endpoint);
        let body = json!({
            "transactionId": format!("{:?}", request.transaction_id),
            "chainId": request.chain_id,
            "to": format!("{:?}", request.to),
            "data": format!("0x{}", hex::encode(&request.data)),
            "relayerFeeAsset": format!("{:?}", request.relayer_fee_asset),
            "relayerFee": request.relayer_fee.to_string(),
            "signature": format!("0x{}", hex::encode(&request.fee_signature)),
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RouterError::Messaging(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(RouterError::Messaging(format!(
                "messaging gateway returned {}: {}",
                status, text
            )));
        }

        info!(
            transaction_id = ?request.transaction_id,
            chain_id = request.chain_id,
            "Published meta-transaction request"
        );
        Ok(())
    }
}
