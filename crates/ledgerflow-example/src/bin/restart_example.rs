// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Restart Example - A waiting flow survives its node going down.
//!
//! This example shows:
//! - Loading configuration from the environment (and `.env`)
//! - A buyer flow parked in the checkpoint store while the seller is offline
//! - The buyer node crashing and restarting from its checkpoints
//! - The restored flow completing once the seller answers
//!
//! Set `LEDGERFLOW_CHECKPOINT_DB` to keep checkpoints in a SQLite file; otherwise they are
//! kept in memory for the life of the process.
//!
//! Run with: cargo run -p ledgerflow-example --bin restart_example

use std::sync::Arc;

use ledgerflow_core::{
    CheckpointStore, Config, FlowRuntime, InMemoryCheckpointStore, InMemoryNetwork, PeerAddress,
    open_store,
};
use ledgerflow_example::{ProvideQuote, Quote, QuoteRequest, RequestQuote, init_tracing};
use tracing::{error, info, warn};

async fn start_node(
    network: &InMemoryNetwork,
    name: &str,
    store: Arc<dyn CheckpointStore>,
    config: &Config,
) -> anyhow::Result<FlowRuntime> {
    let runtime = FlowRuntime::builder()
        .network(Arc::new(network.endpoint(PeerAddress::new(name))))
        .store(store)
        .config(config.scheduler())
        .flow::<RequestQuote>()
        .flow::<ProvideQuote>()
        .payload::<QuoteRequest>()
        .payload::<Quote>()
        .build()?
        .start()
        .await?;
    Ok(runtime)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    init_tracing(env!("CARGO_CRATE_NAME"));

    info!("=== Restart Example: flows survive a node restart ===");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;
    info!(
        node = %config.node_name,
        checkpoint_db = ?config.checkpoint_db,
        checkpointing = config.checkpointing,
        "Configuration loaded"
    );
    if !config.checkpointing {
        warn!("Checkpointing is off; the buyer flow will not survive the restart");
    }

    let network = InMemoryNetwork::new();
    let store = open_store(&config).await?;
    let buyer_name = config.node_name.clone();
    let buyer_address = PeerAddress::new(buyer_name.as_str());

    // First run: the seller is offline, so the request waits in its mailbox.
    let buyer = start_node(&network, &buyer_name, store.clone(), &config).await?;
    let purchase = buyer
        .manager()
        .add_flow(RequestQuote::new(PeerAddress::new("seller"), "widget", 3))
        .await?;
    let flow_id = purchase.id();

    while buyer
        .manager()
        .snapshot()
        .await?
        .flow(flow_id)
        .is_none_or(|flow| flow.awaiting.is_none())
    {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    info!(flow_id = %flow_id, "Buyer flow is waiting for a quote; crashing the buyer");

    network.disconnect(&buyer_address);
    buyer.shutdown().await?;

    // Second run: restore, then bring the seller online.
    let buyer = start_node(&network, &buyer_name, store.clone(), &config).await?;
    let report = buyer.restore_report();
    info!(
        restored = report.restored.len(),
        failed = report.failed.len(),
        "Buyer restarted"
    );
    for (id, e) in &report.failed {
        warn!(flow_id = %id, error = %e, "Checkpoint could not be restored");
    }

    let restored = buyer.manager().handle::<Quote>(flow_id).await?;

    let seller_store = Arc::new(InMemoryCheckpointStore::new());
    let seller = start_node(&network, "seller", seller_store, &config).await?;
    let sale = seller
        .manager()
        .add_flow(ProvideQuote::new(buyer_address.clone(), 990))
        .await?;

    match restored {
        Some(handle) => {
            let quote = handle.result().await?;
            info!(
                item = %quote.item,
                total_cents = quote.total_cents(),
                "Restored buyer flow received its quote"
            );
        }
        None => warn!(flow_id = %flow_id, "Buyer flow was not restored"),
    }
    let total = sale.result().await?;
    info!(total_cents = total, "Seller finished");

    buyer.shutdown().await?;
    seller.shutdown().await?;

    info!("Restart example completed successfully!");
    Ok(())
}
