// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Quote Example - Two nodes exchanging a request and a reply.
//!
//! This example shows:
//! - Two schedulers sharing an in-memory network
//! - Custom payload types
//! - A send-and-receive flow and a receive-then-send flow
//! - Scheduler metrics after the exchange
//!
//! Run with: cargo run -p ledgerflow-example --bin quote_example

use std::sync::Arc;

use ledgerflow_core::{FlowRuntime, InMemoryNetwork, PeerAddress};
use ledgerflow_example::{ProvideQuote, Quote, QuoteRequest, RequestQuote, init_tracing};
use tracing::info;

async fn start_node(network: &InMemoryNetwork, name: &str) -> anyhow::Result<FlowRuntime> {
    let runtime = FlowRuntime::builder()
        .network(Arc::new(network.endpoint(PeerAddress::new(name))))
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
    init_tracing(env!("CARGO_CRATE_NAME"));

    info!("=== Quote Example: request and reply between two nodes ===");

    let network = InMemoryNetwork::new();
    let buyer = start_node(&network, "buyer").await?;
    let seller = start_node(&network, "seller").await?;

    let sale = seller
        .manager()
        .add_flow(ProvideQuote::new(PeerAddress::new("buyer"), 1_250))
        .await?;
    let purchase = buyer
        .manager()
        .add_flow(RequestQuote::new(PeerAddress::new("seller"), "widget", 8))
        .await?;

    let quote = purchase.result().await?;
    info!(
        item = %quote.item,
        quantity = quote.quantity,
        unit_price_cents = quote.unit_price_cents,
        total_cents = quote.total_cents(),
        "Buyer received quote"
    );

    let total = sale.result().await?;
    info!(total_cents = total, "Seller finished");

    info!(metrics = ?buyer.manager().metrics(), "Buyer metrics");
    info!(metrics = ?seller.manager().metrics(), "Seller metrics");

    buyer.shutdown().await?;
    seller.shutdown().await?;

    info!("Quote example completed successfully!");
    Ok(())
}
