// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flows shared by the example binaries.
//!
//! A buyer asks a seller for a quote and waits for the answer; the seller waits for a
//! request, prices it and replies without waiting for anything else.

use ledgerflow_core::{FlowContext, FlowError, FlowLogic, FlowPayload, FlowStep, PeerAddress, SessionId};
use serde::{Deserialize, Serialize};

/// Topic both sides of the quote exchange talk on.
pub const QUOTE_TOPIC: &str = "quote";

/// Buyer-chosen session for one exchange.
pub const QUOTE_SESSION: SessionId = SessionId(42);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteRequest {
    pub item: String,
    pub quantity: u32,
}

impl FlowPayload for QuoteRequest {
    const TYPE_TAG: &'static str = "example.quote_request";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub item: String,
    pub quantity: u32,
    pub unit_price_cents: u64,
}

impl Quote {
    pub fn total_cents(&self) -> u64 {
        self.unit_price_cents * u64::from(self.quantity)
    }
}

impl FlowPayload for Quote {
    const TYPE_TAG: &'static str = "example.quote";
}

/// Buyer side: send a request, wait for the quote.
#[derive(Debug, Serialize, Deserialize)]
pub enum RequestQuote {
    Start {
        seller: PeerAddress,
        request: QuoteRequest,
    },
    AwaitingQuote {
        request: QuoteRequest,
    },
}

impl RequestQuote {
    pub fn new(seller: PeerAddress, item: &str, quantity: u32) -> Self {
        RequestQuote::Start {
            seller,
            request: QuoteRequest {
                item: item.to_string(),
                quantity,
            },
        }
    }
}

impl FlowLogic for RequestQuote {
    type Output = Quote;
    const FLOW_TYPE: &'static str = "example.request_quote";

    fn advance(&mut self, ctx: &mut FlowContext) -> Result<FlowStep<Quote>, FlowError> {
        match self {
            RequestQuote::Start { seller, request } => {
                let request = request.clone();
                ctx.send_and_receive::<Quote, _>(
                    QUOTE_TOPIC,
                    seller.clone(),
                    QUOTE_SESSION,
                    QUOTE_SESSION,
                    &request,
                )?;
                *self = RequestQuote::AwaitingQuote { request };
                Ok(FlowStep::Suspend)
            }
            RequestQuote::AwaitingQuote { request } => {
                let quote = ctx.received::<Quote>()?.validate(|quote| {
                    if quote.item != request.item || quote.quantity != request.quantity {
                        return Err(FlowError::protocol(format!(
                            "quote is for {} x {}, asked for {} x {}",
                            quote.quantity, quote.item, request.quantity, request.item
                        )));
                    }
                    Ok(quote)
                })?;
                Ok(FlowStep::Complete(quote))
            }
        }
    }
}

/// Seller side: wait for a request, answer with a price.
#[derive(Debug, Serialize, Deserialize)]
pub enum ProvideQuote {
    Start {
        buyer: PeerAddress,
        unit_price_cents: u64,
    },
    AwaitingRequest {
        buyer: PeerAddress,
        unit_price_cents: u64,
    },
    Quoted {
        total_cents: u64,
    },
}

impl ProvideQuote {
    pub fn new(buyer: PeerAddress, unit_price_cents: u64) -> Self {
        ProvideQuote::Start {
            buyer,
            unit_price_cents,
        }
    }
}

impl FlowLogic for ProvideQuote {
    type Output = u64;
    const FLOW_TYPE: &'static str = "example.provide_quote";

    fn advance(&mut self, ctx: &mut FlowContext) -> Result<FlowStep<u64>, FlowError> {
        match self {
            ProvideQuote::Start {
                buyer,
                unit_price_cents,
            } => {
                let next = ProvideQuote::AwaitingRequest {
                    buyer: buyer.clone(),
                    unit_price_cents: *unit_price_cents,
                };
                ctx.receive::<QuoteRequest>(QUOTE_TOPIC, QUOTE_SESSION)?;
                *self = next;
                Ok(FlowStep::Suspend)
            }
            ProvideQuote::AwaitingRequest {
                buyer,
                unit_price_cents,
            } => {
                let request = ctx.received::<QuoteRequest>()?.validate(|request| {
                    if request.quantity == 0 {
                        Err(FlowError::protocol("quantity must be positive"))
                    } else {
                        Ok(request)
                    }
                })?;
                let quote = Quote {
                    item: request.item,
                    quantity: request.quantity,
                    unit_price_cents: *unit_price_cents,
                };
                ctx.send(QUOTE_TOPIC, buyer.clone(), QUOTE_SESSION, &quote)?;
                *self = ProvideQuote::Quoted {
                    total_cents: quote.total_cents(),
                };
                Ok(FlowStep::Suspend)
            }
            ProvideQuote::Quoted { total_cents } => Ok(FlowStep::Complete(*total_cents)),
        }
    }
}

/// Tracing setup shared by the binaries.
///
/// Without `RUST_LOG`, shows `info` from the engine and from `binary`, the calling
/// binary's crate name.
pub fn init_tracing(binary: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("ledgerflow_core=info,{}=info", binary).into()),
        )
        .init();
}
