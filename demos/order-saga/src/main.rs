//! # Order Saga Example
//!
//! An order saga coordinating payment and shipping consumers over the
//! in-memory transport. Run with `RUST_LOG=courier_core=debug` to watch the
//! pipeline.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use courier_core::{
    impl_message, Behavior, BusBuilder, BusConfig, ConsumeContext, Consumer, InMemorySagaRepository, RetryPolicy,
    State, StateMachine, StateMachineBuilder,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderSubmitted {
    order_id: Uuid,
    total_cents: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChargePayment {
    order_id: Uuid,
    total_cents: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PaymentCaptured {
    order_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PaymentDeclined {
    order_id: Uuid,
    reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ShipOrder {
    order_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderShipped {
    order_id: Uuid,
    tracking: String,
}

impl_message!(OrderSubmitted, "orders:OrderSubmitted");
impl_message!(ChargePayment, "payments:ChargePayment");
impl_message!(PaymentCaptured, "payments:PaymentCaptured");
impl_message!(PaymentDeclined, "payments:PaymentDeclined");
impl_message!(ShipOrder, "shipping:ShipOrder");
impl_message!(OrderShipped, "shipping:OrderShipped");

// ============================================================================
// Saga
// ============================================================================

const AWAITING_PAYMENT: State = State::from_static("AwaitingPayment");
const AWAITING_SHIPMENT: State = State::from_static("AwaitingShipment");

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct OrderState {
    total_cents: u64,
    tracking: Option<String>,
}

/// `finished` counts orders that reached a final state.
fn order_saga(finished: Arc<AtomicUsize>) -> Result<StateMachine<OrderState>> {
    let declined = finished.clone();
    let machine = StateMachineBuilder::new("OrderSaga")
        .define_state(AWAITING_PAYMENT)
        .define_state(AWAITING_SHIPMENT)
        .correlate_by::<OrderSubmitted>(|m| m.order_id.into())
        .correlate_by::<PaymentCaptured>(|m| m.order_id.into())
        .correlate_by::<PaymentDeclined>(|m| m.order_id.into())
        .correlate_by::<OrderShipped>(|m| m.order_id.into())
        .initially(
            Behavior::<OrderState, OrderSubmitted>::new()
                .then(|ctx| {
                    let OrderSubmitted { order_id, total_cents } = *ctx.message();
                    ctx.data_mut().total_cents = total_cents;
                    ctx.publish(&ChargePayment { order_id, total_cents })?;
                    Ok(())
                })
                .transition_to(AWAITING_PAYMENT),
        )
        .during([AWAITING_PAYMENT])
        .when(
            Behavior::<OrderState, PaymentCaptured>::new()
                .then(|ctx| {
                    let order_id = ctx.message().order_id;
                    ctx.publish(&ShipOrder { order_id })?;
                    Ok(())
                })
                .transition_to(AWAITING_SHIPMENT),
        )
        .when(
            Behavior::<OrderState, PaymentDeclined>::new()
                .then(move |ctx| {
                    info!(order_id = %ctx.message().order_id, reason = %ctx.message().reason, "Order cancelled");
                    declined.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .finalize(),
        )
        .during([AWAITING_SHIPMENT])
        .when(
            Behavior::<OrderState, OrderShipped>::new()
                .then(move |ctx| {
                    let OrderShipped { order_id, tracking } = ctx.message().clone();
                    info!(%order_id, %tracking, total_cents = ctx.data().total_cents, "Order complete");
                    ctx.data_mut().tracking = Some(tracking);
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .finalize(),
        )
        .build()?;
    Ok(machine)
}

// ============================================================================
// Consumers
// ============================================================================

/// Declines anything above the card limit.
struct PaymentGateway {
    limit_cents: u64,
}

#[async_trait]
impl Consumer<ChargePayment> for PaymentGateway {
    async fn consume(&self, ctx: &ConsumeContext<ChargePayment>) -> Result<()> {
        let charge = ctx.message();
        if charge.total_cents > self.limit_cents {
            ctx.publish(&PaymentDeclined {
                order_id: charge.order_id,
                reason: format!("{} exceeds limit", charge.total_cents),
            })
            .await?;
        } else {
            info!(order_id = %charge.order_id, total_cents = charge.total_cents, "Payment captured");
            ctx.publish(&PaymentCaptured {
                order_id: charge.order_id,
            })
            .await?;
        }
        Ok(())
    }
}

struct Warehouse;

#[async_trait]
impl Consumer<ShipOrder> for Warehouse {
    async fn consume(&self, ctx: &ConsumeContext<ShipOrder>) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.publish(&OrderShipped {
            order_id: ctx.message().order_id,
            tracking: format!("TRK-{}", &ctx.message_id().to_string()[..8]),
        })
        .await?;
        Ok(())
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let finished = Arc::new(AtomicUsize::new(0));
    let repository = Arc::new(InMemorySagaRepository::<OrderState>::new());
    let bus = BusBuilder::new()
        .config(
            BusConfig::from_env()
                .with_concurrency(4)
                .with_retry(RetryPolicy::interval(2, Duration::from_millis(50))),
        )
        .add_saga(Arc::new(order_saga(finished.clone())?), repository.clone())
        .add_consumer::<ChargePayment, _>(PaymentGateway { limit_cents: 50_000 })
        .add_consumer::<ShipOrder, _>(Warehouse)
        .build()?;
    bus.start().await?;

    let orders = [1_999, 74_500, 12_000];
    for total_cents in orders {
        let order_id = Uuid::new_v4();
        info!(%order_id, total_cents, "Submitting order");
        bus.publish(&OrderSubmitted { order_id, total_cents }).await?;
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while finished.load(Ordering::SeqCst) < orders.len() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    info!(
        finished = finished.load(Ordering::SeqCst),
        open_sagas = repository.len(),
        "Done"
    );

    bus.stop().await?;
    Ok(())
}
