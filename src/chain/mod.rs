//! Chain module - multi-chain gateways and contract event listening
//!
//! This module provides:
//! - Multi-RPC gateway management with automatic failover
//! - Transaction submission with confirmation gating
//! - Per-chain transaction-manager event listeners feeding the event bus

pub mod gateway;
pub mod listener;

pub use gateway::{ChainGateway, EthGateway, TransactionRequestData};
pub use listener::ChainListener;

use crate::config::Settings;
use crate::error::{RouterError, RouterResult};
use crate::events::ContractEventBus;

use dashmap::DashMap;
use ethers::signers::LocalWallet;
use ethers::types::Address;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info};

/// Manages gateways and listeners for all configured chains.
pub struct ChainManager {
    gateways: DashMap<u64, Arc<dyn ChainGateway>>,
    listeners: DashMap<u64, Arc<ChainListener>>,
    event_bus: Arc<ContractEventBus>,
    shutdown: Arc<RwLock<bool>>,
}

impl ChainManager {
    /// Create gateways and listeners for all enabled chains.
    pub fn new(
        settings: &Settings,
        wallet: LocalWallet,
        event_bus: Arc<ContractEventBus>,
    ) -> RouterResult<Self> {
        let gateways: DashMap<u64, Arc<dyn ChainGateway>> = DashMap::new();
        let listeners = DashMap::new();

        for (_, chain_config) in settings.enabled_chains() {
            info!(
                "Initializing chain {} (ID: {})",
                chain_config.name, chain_config.chain_id
            );

            let gateway: Arc<dyn ChainGateway> =
                Arc::new(EthGateway::new(chain_config.clone(), wallet.clone())?);
            gateways.insert(chain_config.chain_id, gateway.clone());

            let listener = ChainListener::new(
                chain_config.clone(),
                gateway.clone(),
                event_bus.clone(),
            );
            listeners.insert(chain_config.chain_id, Arc::new(listener));

            info!("Chain {} initialized successfully", chain_config.name);
        }

        Ok(Self {
            gateways,
            listeners,
            event_bus,
            shutdown: Arc::new(RwLock::new(false)),
        })
    }

    /// Construct from pre-built gateways. Listeners are not created; tests
    /// and direct-mode tools use this.
    pub fn from_gateways(
        gateways: Vec<Arc<dyn ChainGateway>>,
        event_bus: Arc<ContractEventBus>,
    ) -> Self {
        let map: DashMap<u64, Arc<dyn ChainGateway>> = DashMap::new();
        for gateway in gateways {
            map.insert(gateway.chain_id(), gateway);
        }
        Self {
            gateways: map,
            listeners: DashMap::new(),
            event_bus,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Run all chain listeners until shutdown.
    pub async fn start_listeners(&self) {
        let mut handles = Vec::new();

        for entry in self.listeners.iter() {
            let listener = entry.value().clone();
            let shutdown = self.shutdown.clone();

            let handle = tokio::spawn(async move {
                loop {
                    if *shutdown.read().await {
                        break;
                    }

                    if let Err(e) = listener.listen().await {
                        error!("Listener error for chain {}: {}", listener.chain_id(), e);
                        tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
                    }
                }
            });

            handles.push(handle);
        }

        futures::future::join_all(handles).await;
    }

    pub fn event_bus(&self) -> &Arc<ContractEventBus> {
        &self.event_bus
    }

    pub fn get_gateway(&self, chain_id: u64) -> RouterResult<Arc<dyn ChainGateway>> {
        self.gateways
            .get(&chain_id)
            .map(|g| g.clone())
            .ok_or(RouterError::ChainNotConfigured { chain_id })
    }

    pub fn connected_chains(&self) -> Vec<u64> {
        self.gateways.iter().map(|e| *e.key()).collect()
    }

    /// Signer address used across all chains.
    pub fn signer_address(&self) -> Option<Address> {
        self.gateways
            .iter()
            .next()
            .map(|entry| entry.value().wallet_address())
    }

    /// Check each chain's head is reachable.
    pub async fn health_check(&self) -> Vec<(u64, bool)> {
        let mut results = Vec::new();

        let gateways: Vec<(u64, Arc<dyn ChainGateway>)> = self
            .gateways
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        for (chain_id, gateway) in gateways {
            let healthy = gateway.get_block_number().await.is_ok();
            results.push((chain_id, healthy));

            crate::metrics::record_chain_health(chain_id, healthy);
        }

        results
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        info!("Chain manager stopped");
    }
}
