//! Domain events
use crate::domain::aggregates::{OrderStatus, PaymentStatus};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CheckoutEvent {
    OrderPlaced { order_id: Uuid, order_number: String, total: Decimal },
    StockDepleted { product_id: Uuid },
    OrderStatusChanged { order_id: Uuid, status: OrderStatus, payment_status: PaymentStatus },
}

impl CheckoutEvent {
    /// Subject the event is published under.
    pub fn subject(&self) -> &'static str {
        match self {
            Self::OrderPlaced { .. } => "checkout.order_placed",
            Self::StockDepleted { .. } => "checkout.stock_depleted",
            Self::OrderStatusChanged { .. } => "checkout.order_status_changed",
        }
    }
}
