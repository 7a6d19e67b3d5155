//! Prometheus metrics and the HTTP surface exposing them
//!
//! Counters mirror the transfer lifecycle: per-side prepared, fulfilled and
//! cancelled counts plus their failure counterparts, and the financial
//! series (gas consumed by reason, relayer fees paid, fees collected,
//! transferred volume) in asset base units. Served on `/metrics` with a
//! `/health` liveness endpoint beside it.

use axum::{routing::get, Json, Router};
use ethers::types::{Address, U256};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_int_gauge, CounterVec, Encoder, GaugeVec,
    IntGauge, TextEncoder,
};
use serde::Serialize;
use std::net::SocketAddr;
use tracing::info;

const TRANSFER_LABELS: &[&str] = &[
    "sending_chain_id",
    "receiving_chain_id",
    "asset_name",
];

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "crossflow_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).unwrap();

    pub static ref CONTRACT_EVENTS: CounterVec = register_counter_vec!(
        "crossflow_contract_events_total",
        "Transaction-manager events observed by type",
        &["chain_id", "event_type"]
    ).unwrap();

    // Reconciliation metrics
    pub static ref ACTIVE_TRANSACTIONS: IntGauge = register_int_gauge!(
        "crossflow_active_transactions",
        "Transfers requiring action in the latest poll"
    ).unwrap();

    pub static ref TRACKED_TRANSACTIONS: IntGauge = register_int_gauge!(
        "crossflow_tracked_transactions",
        "Entries currently held by the dedup tracker"
    ).unwrap();

    // Transfer lifecycle counters
    pub static ref ATTEMPTED_TRANSFER: CounterVec = register_counter_vec!(
        "crossflow_attempted_transfers_total",
        "Transfers where the receiver side was prepared",
        TRANSFER_LABELS
    ).unwrap();

    pub static ref COMPLETED_TRANSFER: CounterVec = register_counter_vec!(
        "crossflow_completed_transfers_total",
        "Transfers completed with a sender-side fulfill",
        TRANSFER_LABELS
    ).unwrap();

    pub static ref SUCCESSFUL_AUCTION: CounterVec = register_counter_vec!(
        "crossflow_successful_auctions_total",
        "Auction bids that resulted in an on-chain commitment",
        TRANSFER_LABELS
    ).unwrap();

    pub static ref SENDER_PREPARED: CounterVec = register_counter_vec!(
        "crossflow_sender_prepared_total",
        "Sender-side prepares acted on",
        TRANSFER_LABELS
    ).unwrap();

    pub static ref RECEIVER_PREPARED: CounterVec = register_counter_vec!(
        "crossflow_receiver_prepared_total",
        "Receiver-side prepares submitted",
        TRANSFER_LABELS
    ).unwrap();

    pub static ref RECEIVER_FAILED_PREPARE: CounterVec = register_counter_vec!(
        "crossflow_receiver_failed_prepare_total",
        "Receiver-side prepare attempts that failed",
        TRANSFER_LABELS
    ).unwrap();

    pub static ref SENDER_FULFILLED: CounterVec = register_counter_vec!(
        "crossflow_sender_fulfilled_total",
        "Sender-side fulfills submitted",
        TRANSFER_LABELS
    ).unwrap();

    pub static ref RECEIVER_FULFILLED: CounterVec = register_counter_vec!(
        "crossflow_receiver_fulfilled_total",
        "Receiver-side fulfills observed and acted on",
        TRANSFER_LABELS
    ).unwrap();

    pub static ref SENDER_FAILED_FULFILL: CounterVec = register_counter_vec!(
        "crossflow_sender_failed_fulfill_total",
        "Sender-side fulfill attempts that failed",
        TRANSFER_LABELS
    ).unwrap();

    pub static ref SENDER_CANCELLED: CounterVec = register_counter_vec!(
        "crossflow_sender_cancelled_total",
        "Sender-side cancels submitted",
        TRANSFER_LABELS
    ).unwrap();

    pub static ref RECEIVER_CANCELLED: CounterVec = register_counter_vec!(
        "crossflow_receiver_cancelled_total",
        "Receiver-side cancels submitted",
        TRANSFER_LABELS
    ).unwrap();

    pub static ref SENDER_FAILED_CANCEL: CounterVec = register_counter_vec!(
        "crossflow_sender_failed_cancel_total",
        "Sender-side cancel attempts that failed",
        TRANSFER_LABELS
    ).unwrap();

    pub static ref RECEIVER_FAILED_CANCEL: CounterVec = register_counter_vec!(
        "crossflow_receiver_failed_cancel_total",
        "Receiver-side cancel attempts that failed",
        TRANSFER_LABELS
    ).unwrap();

    pub static ref SENDER_EXPIRED: CounterVec = register_counter_vec!(
        "crossflow_sender_expired_total",
        "Transfers whose sender side expired",
        TRANSFER_LABELS
    ).unwrap();

    pub static ref RECEIVER_EXPIRED: CounterVec = register_counter_vec!(
        "crossflow_receiver_expired_total",
        "Transfers whose receiver side expired",
        TRANSFER_LABELS
    ).unwrap();

    // Financial metrics, in native asset base units
    pub static ref GAS_CONSUMED: CounterVec = register_counter_vec!(
        "crossflow_gas_consumed_wei_total",
        "Gas spent by the router's own signer, by reason",
        &["chain_id", "reason"]
    ).unwrap();

    pub static ref RELAYER_FEES_PAID: CounterVec = register_counter_vec!(
        "crossflow_relayer_fees_paid_total",
        "Fees paid to external relayers, in fee-asset base units",
        &["chain_id", "asset_id"]
    ).unwrap();

    pub static ref FEES_COLLECTED: CounterVec = register_counter_vec!(
        "crossflow_fees_collected_total",
        "Spread collected on completed transfers, in sending-asset units",
        &["chain_id", "asset_name"]
    ).unwrap();

    pub static ref TOTAL_TRANSFERRED_VOLUME: CounterVec = register_counter_vec!(
        "crossflow_transferred_volume_total",
        "Volume delivered to users, in receiving-asset units",
        &["chain_id", "asset_name"]
    ).unwrap();
}

/// Label values shared by the transfer lifecycle counters.
#[derive(Debug, Clone)]
pub struct TransferLabels {
    pub sending_chain_id: u64,
    pub receiving_chain_id: u64,
    pub asset_name: String,
}

impl TransferLabels {
    fn values(&self) -> [String; 3] {
        [
            self.sending_chain_id.to_string(),
            self.receiving_chain_id.to_string(),
            self.asset_name.clone(),
        ]
    }
}

pub fn inc_transfer_counter(counter: &CounterVec, labels: &TransferLabels) {
    let values = labels.values();
    counter
        .with_label_values(&[&values[0], &values[1], &values[2]])
        .inc();
}

pub fn record_chain_health(chain_id: u64, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_contract_event(chain_id: u64, event_type: &str) {
    CONTRACT_EVENTS
        .with_label_values(&[&chain_id.to_string(), event_type])
        .inc();
}

pub fn record_active_transactions(count: usize) {
    ACTIVE_TRANSACTIONS.set(count as i64);
}

pub fn record_tracked_transactions(count: usize) {
    TRACKED_TRANSACTIONS.set(count as i64);
}

pub fn record_gas_consumed(chain_id: u64, reason: &str, wei: U256) {
    GAS_CONSUMED
        .with_label_values(&[&chain_id.to_string(), reason])
        .inc_by(u256_to_f64(wei));
}

pub fn record_relayer_fee_paid(chain_id: u64, asset_id: Address, amount: U256) {
    RELAYER_FEES_PAID
        .with_label_values(&[&chain_id.to_string(), &format!("{:?}", asset_id)])
        .inc_by(u256_to_f64(amount));
}

pub fn record_fees_collected(chain_id: u64, asset_name: &str, amount: U256) {
    FEES_COLLECTED
        .with_label_values(&[&chain_id.to_string(), asset_name])
        .inc_by(u256_to_f64(amount));
}

pub fn record_transferred_volume(chain_id: u64, asset_name: &str, amount: U256) {
    TOTAL_TRANSFERRED_VOLUME
        .with_label_values(&[&chain_id.to_string(), asset_name])
        .inc_by(u256_to_f64(amount));
}

/// Lossy but monotonic conversion for counter increments.
fn u256_to_f64(value: U256) -> f64 {
    value.to_string().parse().unwrap_or(f64::MAX)
}

/// Prometheus metrics server with a liveness endpoint
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/health", get(health_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u256_conversion_is_monotonic_for_small_values() {
        assert_eq!(u256_to_f64(U256::from(0u64)), 0.0);
        assert_eq!(u256_to_f64(U256::from(21000u64)), 21000.0);
    }

    #[test]
    fn transfer_counters_accept_labels() {
        let labels = TransferLabels {
            sending_chain_id: 1337,
            receiving_chain_id: 1338,
            asset_name: "USDC".to_string(),
        };
        inc_transfer_counter(&ATTEMPTED_TRANSFER, &labels);
        inc_transfer_counter(&ATTEMPTED_TRANSFER, &labels);
        let value = ATTEMPTED_TRANSFER
            .with_label_values(&["1337", "1338", "USDC"])
            .get();
        assert!(value >= 2.0);
    }
}
