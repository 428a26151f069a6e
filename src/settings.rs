//! Pricing and shipping settings
//!
//! Settings are plain key/value strings. Checkout reads them once per request
//! into an immutable [`PricingConfig`] so every figure of that request is
//! computed against the same values.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;

use crate::domain::pricing::{
    PricingConfig, DEFAULT_FREE_SHIPPING_THRESHOLD, DEFAULT_PRICE_INCREASE, DEFAULT_SHIPPING_FEE, DEFAULT_TAX_RATE,
};
use crate::domain::value_objects::Percentage;
use crate::store::StoreError;

pub const TAX_ENABLED: &str = "tax_enabled";
pub const TAX_RATE: &str = "tax_rate";
pub const PRICE_INCREASE_PERCENTAGE: &str = "price_increase_percentage";
pub const SHIPPING_ENABLED: &str = "shipping_enabled";
pub const SHIPPING_FEE: &str = "shipping_fee";
pub const FREE_SHIPPING_THRESHOLD: &str = "free_shipping_threshold";

/// Values the settings table is seeded with.
pub const DEFAULT_SETTINGS: &[(&str, &str)] = &[
    (TAX_ENABLED, "1"),
    (TAX_RATE, "10"),
    (PRICE_INCREASE_PERCENTAGE, "10"),
    (SHIPPING_ENABLED, "1"),
    (SHIPPING_FEE, "500"),
    (FREE_SHIPPING_THRESHOLD, "10000"),
];

#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Every stored setting, read in one go.
    async fn settings(&self) -> Result<HashMap<String, String>, StoreError>;

    async fn put_setting(&self, key: &str, value: &str) -> Result<(), StoreError>;

    async fn get_or(&self, key: &str, default: &str) -> Result<String, StoreError> {
        Ok(self.settings().await?.remove(key).unwrap_or_else(|| default.to_string()))
    }

    async fn is_enabled(&self, key: &str) -> Result<bool, StoreError> {
        Ok(flag(self.settings().await?.get(key)))
    }
}

pub async fn load_pricing_config<S: SettingsStore + ?Sized>(store: &S) -> Result<PricingConfig, StoreError> {
    Ok(pricing_config_from(&store.settings().await?))
}

/// Builds a config from raw settings. Missing, unparsable or negative numbers fall back
/// to the documented defaults; flags are on only for `"1"` or `"true"`.
pub fn pricing_config_from(values: &HashMap<String, String>) -> PricingConfig {
    PricingConfig {
        tax_enabled: flag(values.get(TAX_ENABLED)),
        tax_rate: Percentage::new(number(values, TAX_RATE, DEFAULT_TAX_RATE)),
        price_increase: Percentage::new(number(values, PRICE_INCREASE_PERCENTAGE, DEFAULT_PRICE_INCREASE)),
        shipping_enabled: flag(values.get(SHIPPING_ENABLED)),
        shipping_fee: number(values, SHIPPING_FEE, DEFAULT_SHIPPING_FEE),
        free_shipping_threshold: number(values, FREE_SHIPPING_THRESHOLD, DEFAULT_FREE_SHIPPING_THRESHOLD),
    }
}

fn flag(value: Option<&String>) -> bool {
    matches!(value.map(|v| v.trim()), Some("1" | "true"))
}

fn number(values: &HashMap<String, String>, key: &str, default: Decimal) -> Decimal {
    let Some(raw) = values.get(key) else { return default };
    match Decimal::from_str(raw.trim()) {
        Ok(v) if !v.is_sign_negative() => v,
        Ok(_) => {
            tracing::warn!(key, value = %raw, %default, "Negative setting, using default");
            default
        }
        Err(_) => {
            tracing::warn!(key, value = %raw, %default, "Unparsable setting, using default");
            default
        }
    }
}
