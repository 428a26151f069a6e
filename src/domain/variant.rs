//! Cart line variants
//!
//! A cart or order line carries either no variant at all or a bottle selection
//! (`{type: "bottle", tier, bottles, total_capsules}`). Storage and the HTTP
//! surface exchange variants as loosely-typed JSON documents; everything inside
//! the crate works with the tagged [`Variant`] union. Line identity uses
//! [`CanonicalKey`], computed at the application layer so lookups are a plain
//! string equality on every storage backend.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::domain::pricing::bottle_tier_derived_price;
use crate::domain::value_objects::{decimal_from_json, decimal_to_json};

/// Fields that describe how much of a variant was selected, not which variant it is.
const QUANTITY_FIELDS: &[&str] = &["tier", "bottles", "total_capsules"];
const BOTTLE_TYPE: &str = "bottle";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BottleTier {
    pub capsules: u32,
    pub price: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_per_capsule: Option<Decimal>,
}

impl BottleTier {
    pub fn new(capsules: u32, price: Decimal) -> Self { Self { capsules, price, price_per_capsule: None } }

    fn from_document(doc: &Value) -> Result<Self, VariantError> {
        let obj = doc.as_object().ok_or(VariantError::MissingTier)?;
        let capsules = obj.get("capsules").and_then(decimal_from_json)
            .filter(|c| c.fract().is_zero() && *c > Decimal::ZERO)
            .and_then(|c| c.to_u32())
            .ok_or_else(|| VariantError::InvalidTier("capsules must be a positive whole number".into()))?;
        let price = obj.get("price").and_then(decimal_from_json)
            .filter(|p| !p.is_sign_negative())
            .ok_or_else(|| VariantError::InvalidTier("price must be a non-negative number".into()))?;
        let price_per_capsule = match obj.get("price_per_capsule") {
            None | Some(Value::Null) => None,
            Some(v) => Some(decimal_from_json(v).ok_or_else(|| VariantError::InvalidTier("price_per_capsule must be numeric".into()))?),
        };
        Ok(bottle_tier_derived_price(Self { capsules, price, price_per_capsule }))
    }

    fn to_document(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("capsules".into(), Value::from(self.capsules));
        obj.insert("price".into(), decimal_to_json(self.price));
        if let Some(ppc) = self.price_per_capsule { obj.insert("price_per_capsule".into(), decimal_to_json(ppc)); }
        Value::Object(obj)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BottleVariant {
    pub tier: BottleTier,
    pub bottles: u32,
    pub total_capsules: u32,
}

impl BottleVariant {
    pub fn new(tier: BottleTier, bottles: u32) -> Self {
        let total_capsules = bottles.saturating_mul(tier.capsules);
        Self { tier, bottles, total_capsules }
    }

    /// Base (pre-markup, pre-tax) price of the whole selection.
    pub fn base_total(&self) -> Decimal { self.tier.price * Decimal::from(self.bottles) }
}

/// Variant attached to a cart or order line.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "Value", try_from = "Value")]
pub enum Variant {
    #[default]
    Plain,
    Bottle(BottleVariant),
}

impl Variant {
    /// Parses a raw variant document. `quantity` is the requested capsule count and is only
    /// consulted when a bottle document omits `bottles`.
    pub fn from_document(doc: &Value, quantity: u32) -> Result<Self, VariantError> {
        Self::parse(doc, |obj, tier| match obj.get("bottles") {
            None | Some(Value::Null) => Ok(quantity / tier.capsules),
            Some(v) => v.as_u64().and_then(|b| u32::try_from(b).ok()).ok_or(VariantError::InvalidBottles),
        })
    }

    /// Parses a raw variant document, taking the bottle count from the caller instead of
    /// the document.
    pub fn from_document_with_bottles(doc: &Value, bottles: u32) -> Result<Self, VariantError> {
        Self::parse(doc, |_, _| Ok(bottles))
    }

    fn parse<F>(doc: &Value, bottles: F) -> Result<Self, VariantError>
    where
        F: FnOnce(&Map<String, Value>, &BottleTier) -> Result<u32, VariantError>,
    {
        if is_empty_document(doc) { return Ok(Self::Plain); }
        let obj = doc.as_object().ok_or(VariantError::Unsupported)?;
        let kind = obj.get("type").and_then(Value::as_str);
        if kind.is_some_and(|k| k != BOTTLE_TYPE) || (kind.is_none() && !obj.contains_key("tier")) {
            return Err(VariantError::Unsupported);
        }

        let tier = BottleTier::from_document(obj.get("tier").ok_or(VariantError::MissingTier)?)?;
        let bottles = bottles(obj, &tier)?;
        if bottles == 0 { return Err(VariantError::InvalidBottles); }
        Ok(Self::Bottle(BottleVariant::new(tier, bottles)))
    }

    pub fn to_document(&self) -> Value {
        match self {
            Self::Plain => Value::Null,
            Self::Bottle(b) => {
                let mut obj = Map::new();
                obj.insert("type".into(), Value::from(BOTTLE_TYPE));
                obj.insert("tier".into(), b.tier.to_document());
                obj.insert("bottles".into(), Value::from(b.bottles));
                obj.insert("total_capsules".into(), Value::from(b.total_capsules));
                Value::Object(obj)
            }
        }
    }

    pub fn as_bottle(&self) -> Option<&BottleVariant> {
        match self { Self::Bottle(b) => Some(b), Self::Plain => None }
    }

    pub fn is_bottle(&self) -> bool { self.as_bottle().is_some() }

    pub fn canonical_key(&self) -> CanonicalKey { canonicalize(&self.to_document()) }
}

impl From<Variant> for Value {
    fn from(v: Variant) -> Self { v.to_document() }
}

impl TryFrom<Value> for Variant {
    type Error = VariantError;
    fn try_from(doc: Value) -> Result<Self, Self::Error> { Self::from_document(&doc, 0) }
}

/// Equality key of a variant document.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CanonicalKey(String);

impl CanonicalKey {
    const PLAIN: &'static str = "none";

    pub fn plain() -> Self { Self(Self::PLAIN.to_string()) }
    pub fn from_stored(value: impl Into<String>) -> Self { Self(value.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
    pub fn is_plain(&self) -> bool { self.0 == Self::PLAIN }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// Maps every "no variant" spelling (`null`, `{}`, `[]`, `""`) to one key, otherwise
/// serializes the identifying part of the document with sorted keys and normalized numbers.
pub fn canonicalize(doc: &Value) -> CanonicalKey {
    if is_empty_document(doc) { return CanonicalKey::plain(); }
    let identity = match doc {
        Value::Object(obj) => Value::Object(obj.iter().filter(|(k, _)| !QUANTITY_FIELDS.contains(&k.as_str())).map(|(k, v)| (k.clone(), v.clone())).collect()),
        other => other.clone(),
    };
    let mut out = String::new();
    write_canonical(&identity, &mut out);
    CanonicalKey(out)
}

/// Combines a line's stored variant with a newly added one of the same key.
///
/// Bottle counts add up; the incoming tier replaces the stored one only when its capsule
/// count differs. `total_capsules` is recomputed so it always equals `bottles * tier.capsules`.
pub fn merge(existing: &Variant, incoming: &Variant) -> Variant {
    match (existing, incoming) {
        (Variant::Bottle(e), Variant::Bottle(i)) => {
            let tier = if e.tier.capsules != i.tier.capsules { i.tier.clone() } else { e.tier.clone() };
            Variant::Bottle(BottleVariant::new(tier, e.bottles.saturating_add(i.bottles)))
        }
        (Variant::Plain, Variant::Bottle(_)) => incoming.clone(),
        (_, Variant::Plain) => existing.clone(),
    }
}

fn is_empty_document(doc: &Value) -> bool {
    match doc {
        Value::Null => true,
        Value::Object(o) => o.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => match decimal_from_json(value) {
            Some(d) => out.push_str(&d.normalize().to_string()),
            None => out.push_str(&n.to_string()),
        },
        Value::String(s) => out.push_str(&Value::String(s.clone()).to_string()),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 { out.push(','); }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(obj) => {
            let mut keys: Vec<&String> = obj.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 { out.push(','); }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&obj[key], out);
            }
            out.push('}');
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariantError { Unsupported, MissingTier, InvalidTier(String), InvalidBottles }
impl std::error::Error for VariantError {}
impl fmt::Display for VariantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported => write!(f, "unsupported variant document"),
            Self::MissingTier => write!(f, "bottle variant is missing its tier"),
            Self::InvalidTier(msg) => write!(f, "invalid bottle tier: {msg}"),
            Self::InvalidBottles => write!(f, "bottle count must be at least 1"),
        }
    }
}
