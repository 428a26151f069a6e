//! Order Aggregate
//!
//! An order is a financial record: its totals and lines are frozen at placement
//! and never re-derived from live products or cart lines. Only `status` and
//! `payment_status` move afterwards.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

use crate::domain::aggregates::{CartLine, Product};
use crate::domain::events::CheckoutEvent;
use crate::domain::pricing::Totals;
use crate::domain::value_objects::{round_currency, ActorIdentity};
use crate::domain::variant::Variant;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ShippingDetails {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1, max = 255))]
    pub first_name: String,
    #[validate(length(min = 1, max = 255))]
    pub last_name: String,
    #[validate(length(min = 1, max = 20))]
    pub phone: String,
    #[validate(length(min = 1))]
    pub address_line_1: String,
    pub address_line_2: Option<String>,
    #[validate(length(min = 1, max = 255))]
    pub city: String,
    #[validate(length(min = 1, max = 255))]
    pub state: String,
    #[validate(length(min = 1, max = 20))]
    pub postal_code: String,
    #[validate(length(min = 1, max = 255))]
    pub country: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod { BankTransfer, CreditCard }

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus { #[default] Pending, Processing, Shipped, Completed, Cancelled }

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus { #[default] Pending, Paid, Failed, Refunded }

macro_rules! string_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str { match self { $(Self::$variant => $text),+ } }
        }
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
        }
        impl FromStr for $ty {
            type Err = OrderError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s { $($text => Ok(Self::$variant),)+ other => Err(OrderError::UnknownValue(other.to_string())) }
            }
        }
    };
}

string_enum!(PaymentMethod { BankTransfer => "bank_transfer", CreditCard => "credit_card" });
string_enum!(OrderStatus { Pending => "pending", Processing => "processing", Shipped => "shipped", Completed => "completed", Cancelled => "cancelled" });
string_enum!(PaymentStatus { Pending => "pending", Paid => "paid", Failed => "failed", Refunded => "refunded" });

impl OrderStatus {
    pub fn is_terminal(&self) -> bool { matches!(self, Self::Completed | Self::Cancelled) }
}

/// Frozen copy of a cart line. `quantity` counts bottles for bottle variants and units
/// otherwise; `stock_units` is what left the warehouse (capsules or units).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    pub product_sku: String,
    pub quantity: u32,
    pub unit_price: Decimal,
    pub total: Decimal,
    pub variant: Variant,
    pub stock_units: u32,
}

impl OrderLine {
    pub fn capture(line: &CartLine, product: &Product) -> Self {
        let quantity = line.variant.as_bottle().map_or(line.quantity, |b| b.bottles);
        Self {
            id: Uuid::new_v4(), product_id: product.id, product_name: product.name.clone(), product_sku: product.sku.clone(),
            quantity, unit_price: line.unit_price, total: round_currency(line.base_total()), variant: line.variant.clone(),
            stock_units: line.stock_units(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderHeader {
    pub id: Uuid,
    pub order_number: String,
    pub actor: ActorIdentity,
    pub shipping: ShippingDetails,
    pub payment_method: PaymentMethod,
    pub health_check: Option<serde_json::Value>,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub totals: Totals,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Order {
    #[serde(flatten)]
    header: OrderHeader,
    lines: Vec<OrderLine>,
    #[serde(skip)]
    events: Vec<CheckoutEvent>,
}

impl Order {
    pub fn place(
        actor: ActorIdentity,
        shipping: ShippingDetails,
        payment_method: PaymentMethod,
        health_check: Option<serde_json::Value>,
        lines: Vec<OrderLine>,
        totals: Totals,
    ) -> Result<Self, OrderError> {
        if lines.is_empty() { return Err(OrderError::NoItems); }
        let now = Utc::now();
        let header = OrderHeader {
            id: Uuid::new_v4(), order_number: next_order_number(), actor, shipping, payment_method, health_check,
            status: OrderStatus::Pending, payment_status: PaymentStatus::Pending, totals, created_at: now, updated_at: now,
        };
        let mut order = Self { header, lines, events: vec![] };
        order.raise_event(CheckoutEvent::OrderPlaced {
            order_id: order.header.id, order_number: order.header.order_number.clone(), total: order.header.totals.total,
        });
        Ok(order)
    }

    pub fn restore(header: OrderHeader, lines: Vec<OrderLine>) -> Self { Self { header, lines, events: vec![] } }

    pub fn id(&self) -> Uuid { self.header.id }
    pub fn order_number(&self) -> &str { &self.header.order_number }
    pub fn actor(&self) -> &ActorIdentity { &self.header.actor }
    pub fn header(&self) -> &OrderHeader { &self.header }
    pub fn status(&self) -> OrderStatus { self.header.status }
    pub fn payment_status(&self) -> PaymentStatus { self.header.payment_status }
    pub fn totals(&self) -> &Totals { &self.header.totals }
    pub fn lines(&self) -> &[OrderLine] { &self.lines }

    pub fn update_status(&mut self, status: Option<OrderStatus>, payment_status: Option<PaymentStatus>) -> Result<(), OrderError> {
        if let Some(next) = status {
            if self.header.status.is_terminal() && next != self.header.status {
                return Err(OrderError::CannotTransition { from: self.header.status, to: next });
            }
            self.header.status = next;
        }
        if let Some(payment) = payment_status { self.header.payment_status = payment; }
        self.touch();
        self.raise_event(CheckoutEvent::OrderStatusChanged {
            order_id: self.header.id, status: self.header.status, payment_status: self.header.payment_status,
        });
        Ok(())
    }

    pub fn record_stock_depleted(&mut self, product_id: Uuid) {
        self.raise_event(CheckoutEvent::StockDepleted { product_id });
    }

    pub fn take_events(&mut self) -> Vec<CheckoutEvent> { std::mem::take(&mut self.events) }
    fn raise_event(&mut self, e: CheckoutEvent) { self.events.push(e); }
    fn touch(&mut self) { self.header.updated_at = Utc::now(); }
}

fn next_order_number() -> String { format!("ORD-{:08}", rand::random::<u32>() % 100_000_000) }

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderError { NoItems, CannotTransition { from: OrderStatus, to: OrderStatus }, UnknownValue(String) }
impl std::error::Error for OrderError {}
impl fmt::Display for OrderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoItems => write!(f, "No items"),
            Self::CannotTransition { from, to } => write!(f, "Cannot move a {from} order to {to}"),
            Self::UnknownValue(v) => write!(f, "Unknown value '{v}'"),
        }
    }
}
