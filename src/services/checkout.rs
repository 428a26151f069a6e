//! Checkout assembly
//!
//! Both the cart page and the checkout page are priced here, against one
//! [`PricingConfig`] read per call, so they always agree with each other and
//! with the order that is eventually placed.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::domain::aggregates::{CartLine, Product};
use crate::domain::pricing::{PriceEngine, PricingConfig, Totals};
use crate::domain::value_objects::{ActorIdentity, Percentage};
use crate::domain::variant::{BottleTier, Variant};
use crate::settings::load_pricing_config;
use crate::store::CommerceStore;
use crate::{CheckoutError, Result};

/// A cart line with what the actor is shown for it.
#[derive(Debug, Clone, Serialize)]
pub struct PricedLine {
    #[serde(flatten)]
    pub line: CartLine,
    pub product_name: String,
    pub product_sku: String,
    /// Tax-inclusive price per unit, or per bottle for bottle lines.
    pub display_unit_price: Decimal,
    pub display_total: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_tier: Option<BottleTier>,
}

impl PricedLine {
    fn new(engine: &PriceEngine, line: CartLine, product: &Product) -> Self {
        let (unit_base, display_tier) = match &line.variant {
            Variant::Bottle(b) => (b.tier.price, Some(engine.tax_inclusive_tier(&b.tier))),
            Variant::Plain => (line.unit_price, None),
        };
        Self {
            display_unit_price: engine.tax_inclusive_price(unit_base),
            display_total: engine.tax_inclusive_price(line.base_total()),
            display_tier,
            product_name: product.name.clone(),
            product_sku: product.sku.clone(),
            line,
        }
    }
}

/// Figures shared by the cart summary and the checkout snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceBreakdown {
    #[serde(flatten)]
    pub totals: Totals,
    pub subtotal_before_tax: Decimal,
    pub tax_rate: Percentage,
}

impl PriceBreakdown {
    fn of(engine: &PriceEngine, lines: &[PricedLine]) -> Self {
        let totals = engine.totals(lines.iter().map(|l| l.line.base_total()).sum());
        Self { subtotal_before_tax: engine.subtotal_before_tax(totals.subtotal), tax_rate: engine.display_tax_rate(), totals }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CartSummary {
    pub lines: Vec<PricedLine>,
    pub item_count: u64,
    #[serde(flatten)]
    pub prices: PriceBreakdown,
}

/// Frozen, re-validated copy of a cart. Order placement prices from this and
/// nothing else.
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutSnapshot {
    pub actor: ActorIdentity,
    pub lines: Vec<PricedLine>,
    #[serde(flatten)]
    pub prices: PriceBreakdown,
    pub config: PricingConfig,
    pub taken_at: DateTime<Utc>,
}

impl CheckoutSnapshot {
    pub fn totals(&self) -> &Totals { &self.prices.totals }
}

#[derive(Debug, Clone)]
pub enum Checkout {
    Ready(CheckoutSnapshot),
    Empty,
}

#[derive(Clone)]
pub struct CheckoutAssembler {
    store: Arc<dyn CommerceStore>,
}

impl CheckoutAssembler {
    pub fn new(store: Arc<dyn CommerceStore>) -> Self { Self { store } }

    /// Prices the cart as it stands. Nothing is dropped; lines whose product has
    /// disappeared from the catalog are left out of the figures.
    #[instrument(skip(self), fields(actor = %actor))]
    pub async fn cart_summary(&self, actor: &ActorIdentity) -> Result<CartSummary> {
        let engine = PriceEngine::new(load_pricing_config(&*self.store).await?);
        let mut lines = Vec::new();
        for line in self.store.cart_lines(actor).await? {
            match self.store.product(line.product_id).await? {
                Some(product) => lines.push(PricedLine::new(&engine, line, &product)),
                None => warn!(line_id = %line.id, product_id = %line.product_id, "Cart line refers to a missing product"),
            }
        }
        let prices = PriceBreakdown::of(&engine, &lines);
        let item_count = lines.iter().map(|l| u64::from(l.line.quantity)).sum();
        Ok(CartSummary { lines, item_count, prices })
    }

    /// Re-validates every line against live stock. Lines gone unavailable make the
    /// whole call fail with `CartChanged` unless none remain, which is `Empty`.
    #[instrument(skip(self), fields(actor = %actor))]
    pub async fn build_snapshot(&self, actor: &ActorIdentity) -> Result<Checkout> {
        let config = load_pricing_config(&*self.store).await?;
        let engine = PriceEngine::new(config.clone());

        let mut lines = Vec::new();
        let mut dropped = 0;
        for line in self.store.cart_lines(actor).await? {
            match self.store.product(line.product_id).await? {
                Some(product) if still_purchasable(&product, &line) => lines.push(PricedLine::new(&engine, line, &product)),
                _ => dropped += 1,
            }
        }

        if lines.is_empty() {
            return Ok(Checkout::Empty);
        }
        if dropped > 0 {
            info!(dropped, "Cart changed since it was last shown");
            return Err(CheckoutError::CartChanged { dropped });
        }

        let prices = PriceBreakdown::of(&engine, &lines);
        Ok(Checkout::Ready(CheckoutSnapshot { actor: actor.clone(), lines, prices, config, taken_at: Utc::now() }))
    }
}

fn still_purchasable(product: &Product, line: &CartLine) -> bool {
    product.is_available() && product.stock.admits(line.stock_units())
}
