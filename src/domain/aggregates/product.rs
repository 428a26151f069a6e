//! Product Aggregate
//!
//! Products are owned by the catalog; checkout reads them and only ever
//! touches their stock.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::value_objects::Stock;
use crate::domain::variant::BottleTier;

pub const DEFAULT_CAPSULES_PER_BOTTLE: u32 = 50;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub sku: String,
    pub price: Decimal,
    pub sale_price: Option<Decimal>,
    pub stock: Stock,
    pub in_stock: bool,
    pub is_active: bool,
    pub is_bottle_based: bool,
    pub capsules_per_bottle: Option<u32>,
    pub bottle_pricing_tiers: Vec<BottleTier>,
    pub bottles_only: bool,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    pub fn create(sku: impl Into<String>, name: impl Into<String>, price: Decimal) -> Self {
        Self {
            id: Uuid::new_v4(), name: name.into(), sku: sku.into(), price, sale_price: None,
            stock: Stock::Unlimited, in_stock: true, is_active: true, is_bottle_based: false,
            capsules_per_bottle: None, bottle_pricing_tiers: vec![], bottles_only: false, updated_at: Utc::now(),
        }
    }

    pub fn with_stock(mut self, units: u32) -> Self {
        self.stock = Stock::Limited(units);
        self.in_stock = units > 0;
        self
    }

    pub fn with_sale_price(mut self, sale_price: Decimal) -> Self { self.sale_price = Some(sale_price); self }

    pub fn bottle_based(mut self, capsules_per_bottle: u32, tiers: Vec<BottleTier>, bottles_only: bool) -> Self {
        self.is_bottle_based = true;
        self.capsules_per_bottle = Some(capsules_per_bottle);
        self.bottle_pricing_tiers = tiers;
        self.bottles_only = bottles_only;
        self
    }

    /// Active, flagged in stock, and not at a zero stock count.
    pub fn is_available(&self) -> bool { self.is_active && self.in_stock && !self.stock.is_exhausted() }

    pub fn base_unit_price(&self) -> Decimal { self.sale_price.unwrap_or(self.price) }

    pub fn is_on_sale(&self) -> bool { self.sale_price.is_some_and(|s| s < self.price) }

    pub fn requires_bottle_variant(&self) -> bool { self.is_bottle_based && self.bottles_only }

    /// Tiers apply only to bottle-based products.
    pub fn tiers(&self) -> &[BottleTier] {
        if self.is_bottle_based { &self.bottle_pricing_tiers } else { &[] }
    }

    /// A product without configured tiers accepts any tier.
    pub fn offers_tier(&self, tier: &BottleTier) -> bool {
        self.tiers().is_empty() || self.tiers().iter().any(|t| t.capsules == tier.capsules)
    }

    pub fn capsules_per_bottle(&self) -> u32 { self.capsules_per_bottle.filter(|c| *c > 0).unwrap_or(DEFAULT_CAPSULES_PER_BOTTLE) }

    pub fn remove_inventory(&mut self, units: u32) {
        if let Stock::Limited(_) = self.stock {
            self.stock = self.stock.after_consuming(units);
            self.in_stock = !self.stock.is_exhausted();
        }
        self.touch();
    }

    fn touch(&mut self) { self.updated_at = Utc::now(); }
}
