//! Price engine
//!
//! Every price the actor sees (cart, checkout, placed order) goes through
//! [`PriceEngine`], built from one immutable [`PricingConfig`] snapshot.
//! Formulas round to 2 decimal places at the very end only.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::value_objects::{round_currency, Percentage};
use crate::domain::variant::BottleTier;

pub const DEFAULT_TAX_RATE: Decimal = Decimal::TEN;
pub const DEFAULT_PRICE_INCREASE: Decimal = Decimal::TEN;
pub const DEFAULT_SHIPPING_FEE: Decimal = Decimal::from_parts(500, 0, 0, false, 0);
pub const DEFAULT_FREE_SHIPPING_THRESHOLD: Decimal = Decimal::from_parts(10_000, 0, 0, false, 0);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingConfig {
    pub tax_enabled: bool,
    pub tax_rate: Percentage,
    pub price_increase: Percentage,
    pub shipping_enabled: bool,
    pub shipping_fee: Decimal,
    pub free_shipping_threshold: Decimal,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            tax_enabled: true,
            tax_rate: Percentage::new(DEFAULT_TAX_RATE),
            price_increase: Percentage::new(DEFAULT_PRICE_INCREASE),
            shipping_enabled: true,
            shipping_fee: DEFAULT_SHIPPING_FEE,
            free_shipping_threshold: DEFAULT_FREE_SHIPPING_THRESHOLD,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PriceEngine {
    config: PricingConfig,
}

impl PriceEngine {
    pub fn new(config: PricingConfig) -> Self { Self { config } }
    pub fn config(&self) -> &PricingConfig { &self.config }

    /// `base * (1 + increase%)`, times `(1 + tax%)` when tax is enabled.
    pub fn tax_inclusive_price(&self, base: Decimal) -> Decimal {
        let marked_up = base * self.config.price_increase.multiplier();
        if !self.config.tax_enabled { return round_currency(marked_up); }
        round_currency(marked_up * self.config.tax_rate.multiplier())
    }

    /// Tax portion of an already tax-inclusive amount.
    pub fn tax_amount(&self, tax_inclusive: Decimal) -> Decimal {
        if !self.config.tax_enabled { return Decimal::ZERO; }
        round_currency(tax_inclusive - self.marked_up_portion(tax_inclusive))
    }

    /// Tax-inclusive amount with the tax taken back out (base plus markup).
    pub fn subtotal_before_tax(&self, tax_inclusive: Decimal) -> Decimal {
        if !self.config.tax_enabled { return tax_inclusive; }
        round_currency(self.marked_up_portion(tax_inclusive))
    }

    pub fn shipping_fee(&self, subtotal: Decimal) -> Decimal {
        if !self.config.shipping_enabled || subtotal >= self.config.free_shipping_threshold {
            return Decimal::ZERO;
        }
        self.config.shipping_fee
    }

    /// Tax rate for display; zero while tax is disabled.
    pub fn display_tax_rate(&self) -> Percentage {
        if self.config.tax_enabled { self.config.tax_rate } else { Percentage::zero() }
    }

    /// Tier as shown to the actor: price and per-capsule price tax-inclusive.
    pub fn tax_inclusive_tier(&self, tier: &BottleTier) -> BottleTier {
        let tier = bottle_tier_derived_price(tier.clone());
        BottleTier {
            capsules: tier.capsules,
            price: self.tax_inclusive_price(tier.price),
            price_per_capsule: tier.price_per_capsule.map(|p| self.tax_inclusive_price(p)),
        }
    }

    pub fn totals(&self, base_subtotal: Decimal) -> Totals {
        let subtotal = self.tax_inclusive_price(base_subtotal);
        let tax = self.tax_amount(subtotal);
        let shipping = self.shipping_fee(subtotal);
        Totals { base_subtotal, subtotal, tax, shipping, total: subtotal + shipping }
    }

    fn marked_up_portion(&self, tax_inclusive: Decimal) -> Decimal {
        let increase = self.config.price_increase.multiplier();
        let base = tax_inclusive / (increase * self.config.tax_rate.multiplier());
        base * increase
    }
}

/// Fills in `price_per_capsule` as `price / capsules` when the tier lacks one.
pub fn bottle_tier_derived_price(mut tier: BottleTier) -> BottleTier {
    if tier.price_per_capsule.is_none() && tier.capsules > 0 {
        tier.price_per_capsule = Some(tier.price / Decimal::from(tier.capsules));
    }
    tier
}

/// Priced figures of a cart. `tax` is contained in `subtotal`, never added on top.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub base_subtotal: Decimal,
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub shipping: Decimal,
    pub total: Decimal,
}
