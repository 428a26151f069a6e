//! Cart Aggregate

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::value_objects::ActorIdentity;
use crate::domain::pricing::bottle_tier_derived_price;
use crate::domain::variant::{self, BottleTier, CanonicalKey, Variant};

/// One cart line. `unit_price` is a base price: the flat unit price, or the tier price per
/// bottle for bottle variants. `quantity` counts capsules for bottle variants, units otherwise.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub id: Uuid,
    pub actor: ActorIdentity,
    pub product_id: Uuid,
    pub quantity: u32,
    pub unit_price: Decimal,
    pub variant: Variant,
    pub variant_key: CanonicalKey,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CartLine {
    pub fn new(actor: ActorIdentity, product_id: Uuid, quantity: u32, unit_price: Decimal, variant: Variant) -> Self {
        let now = Utc::now();
        let quantity = line_quantity(&variant, quantity);
        let line = Self { id: Uuid::new_v4(), actor, product_id, quantity, unit_price, variant_key: variant.canonical_key(), variant, created_at: now, updated_at: now };
        line.priced(unit_price)
    }

    pub fn belongs_to(&self, actor: &ActorIdentity) -> bool { &self.actor == actor }

    /// Base (pre-markup, pre-tax) total of the line.
    pub fn base_total(&self) -> Decimal {
        match &self.variant {
            Variant::Bottle(b) => b.base_total(),
            Variant::Plain => self.unit_price * Decimal::from(self.quantity),
        }
    }

    /// Units this line takes out of stock (capsules for bottle lines).
    pub fn stock_units(&self) -> u32 { self.quantity }

    /// Capsules per bottle of the selected tier, if this is a bottle line.
    pub fn capsules_per_bottle(&self) -> Option<u32> { self.variant.as_bottle().map(|b| b.tier.capsules) }

    /// Line after another add of the same product and variant key.
    pub fn merged_with(&self, quantity: u32, incoming: &Variant) -> Self {
        let variant = variant::merge(&self.variant, incoming);
        let quantity = match &variant { Variant::Bottle(b) => b.total_capsules, Variant::Plain => self.quantity.saturating_add(quantity) };
        self.revised(quantity, variant)
    }

    /// Line with its quantity and variant replaced outright.
    pub fn replaced_with(&self, quantity: u32, variant: Variant) -> Self {
        self.revised(line_quantity(&variant, quantity), variant)
    }

    /// Sets the base unit price. A bottle line's tier carries the same price per bottle.
    pub fn priced(mut self, unit_price: Decimal) -> Self {
        self.unit_price = unit_price;
        if let Variant::Bottle(b) = &mut self.variant {
            if b.tier.price != unit_price {
                b.tier = bottle_tier_derived_price(BottleTier { price: unit_price, price_per_capsule: None, ..b.tier.clone() });
            }
        }
        self
    }

    fn revised(&self, quantity: u32, variant: Variant) -> Self {
        Self { quantity, variant_key: variant.canonical_key(), variant, updated_at: Utc::now(), ..self.clone() }
    }
}

fn line_quantity(variant: &Variant, quantity: u32) -> u32 {
    variant.as_bottle().map_or(quantity, |b| b.total_capsules)
}

/// All lines an actor currently holds.
#[derive(Clone, Debug, Serialize)]
pub struct Cart {
    actor: ActorIdentity,
    lines: Vec<CartLine>,
}

impl Cart {
    pub fn new(actor: ActorIdentity, lines: Vec<CartLine>) -> Self { Self { actor, lines } }
    pub fn actor(&self) -> &ActorIdentity { &self.actor }
    pub fn lines(&self) -> &[CartLine] { &self.lines }
    pub fn into_lines(self) -> Vec<CartLine> { self.lines }
    pub fn is_empty(&self) -> bool { self.lines.is_empty() }
    pub fn line_count(&self) -> usize { self.lines.len() }
    pub fn item_count(&self) -> u64 { self.lines.iter().map(|l| u64::from(l.quantity)).sum() }
    pub fn base_subtotal(&self) -> Decimal { self.lines.iter().map(CartLine::base_total).sum() }
}
