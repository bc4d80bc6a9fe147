//! Order intake scenario.
//!
//! Orders are scored by an external API, saved with a blocking database
//! write and then confirmed.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{CallError, ValidationError};
use crate::pipeline::config::PipelineConfig;
use crate::pipeline::stages::ItemHandler;
use crate::scheduler::job::WorkItem;

use super::plan::{CallPlan, PlannedResponse, SimTimings, SimulatedService};

/// Orders at or above this amount get the high score.
pub const HIGH_VALUE_THRESHOLD: i64 = 100_000;

/// Latencies of the order scenario.
pub const ORDER_TIMINGS: SimTimings = SimTimings {
    ok_latency: Duration::from_millis(2200),
    error_latency: Duration::from_millis(1800),
    timeout_overshoot: Duration::from_millis(3000),
    blocking: Duration::from_millis(1500),
    finalize: Duration::ZERO,
};

/// Pace at which sample orders arrive.
pub const ORDER_INGEST_INTERVAL: Duration = Duration::from_millis(1200);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub customer: String,
    pub amount: i64,
}

/// Score returned by the order API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderScore(pub u32);

/// An order persisted by the blocking step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedOrder {
    pub order_id: String,
    pub score: u32,
}

pub struct OrderHandler {
    service: SimulatedService,
}

impl OrderHandler {
    pub fn new(timings: SimTimings, call_timeout: Duration) -> Self {
        Self {
            service: SimulatedService::new(timings, call_timeout),
        }
    }

    /// Sets the planned API responses for `order_id`.
    pub fn with_plan(mut self, order_id: impl Into<String>, plan: CallPlan) -> Self {
        self.service.set_plan(order_id, plan);
        self
    }

    pub fn service(&self) -> &SimulatedService {
        &self.service
    }
}

fn score_for(amount: i64) -> u32 {
    if amount >= HIGH_VALUE_THRESHOLD {
        95
    } else {
        80
    }
}

#[async_trait]
impl ItemHandler for OrderHandler {
    type Payload = Order;
    type Response = OrderScore;
    type Artifact = SavedOrder;

    fn validate(&self, item: &WorkItem<Order>) -> Result<(), ValidationError> {
        if item.payload.amount <= 0 {
            return Err(ValidationError::new(format!(
                "amount must be positive: {}",
                item.payload.amount
            )));
        }
        Ok(())
    }

    async fn call(&self, item: &WorkItem<Order>, attempt: u32) -> Result<OrderScore, CallError> {
        let amount = item.payload.amount;
        self.service
            .respond(&item.id, attempt, "temporary upstream error", || {
                OrderScore(score_for(amount))
            })
            .await
    }

    fn blocking_step(&self, item: &WorkItem<Order>, score: OrderScore) -> anyhow::Result<SavedOrder> {
        std::thread::sleep(self.service.timings().blocking);
        info!(item_id = %item.id, score = score.0, "Order saved");
        Ok(SavedOrder {
            order_id: item.id.clone(),
            score: score.0,
        })
    }

    async fn finalize(&self, item: &WorkItem<Order>, saved: SavedOrder) -> anyhow::Result<String> {
        tokio::time::sleep(self.service.timings().finalize).await;
        Ok(format!(
            "order {} for {} confirmed (score={})",
            saved.order_id, item.payload.customer, saved.score
        ))
    }
}

/// Pipeline settings of the order scenario.
pub fn order_config() -> PipelineConfig {
    PipelineConfig::default().with_ingest_interval(ORDER_INGEST_INTERVAL)
}

/// The six sample orders and a handler primed with their API plans.
pub fn sample_orders(
    timings: SimTimings,
    call_timeout: Duration,
) -> (OrderHandler, Vec<WorkItem<Order>>) {
    use PlannedResponse::{Error, Ok, Timeout};

    let orders: [(&str, &str, i64, Vec<PlannedResponse>); 6] = [
        ("ORD-1001", "Aoyama Shoji", 120_000, vec![Ok]),
        ("ORD-1002", "Kitagawa Store", 54_000, vec![Timeout, Ok]),
        ("ORD-1003", "Chuo Office", 330_000, vec![Error, Ok]),
        ("ORD-1004", "Towa Denki", 90_000, vec![Ok]),
        ("ORD-1005", "Minamino Kikaku", 75_000, vec![Timeout, Timeout, Ok]),
        ("ORD-1006", "Nishihara Logistics", 41_000, vec![Ok]),
    ];

    let mut handler = OrderHandler::new(timings, call_timeout);
    let mut items = Vec::with_capacity(orders.len());
    for (id, customer, amount, plan) in orders {
        handler = handler.with_plan(id, CallPlan::new(plan));
        items.push(WorkItem::new(
            id,
            Order {
                customer: customer.to_string(),
                amount,
            },
        ));
    }
    (handler, items)
}
