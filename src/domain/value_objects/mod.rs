//! Value Objects for checkout

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Who owns a cart: an authenticated user or an anonymous session, never both.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ActorIdentity {
    User(Uuid),
    Session(String),
}

impl ActorIdentity {
    pub fn resolve(user_id: Option<Uuid>, session_id: Option<String>) -> Result<Self, ActorError> {
        let session_id = session_id.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        match (user_id, session_id) {
            (Some(user), None) => Ok(Self::User(user)),
            (None, Some(session)) => Ok(Self::Session(session)),
            (Some(_), Some(_)) => Err(ActorError::Ambiguous),
            (None, None) => Err(ActorError::Missing),
        }
    }

    pub fn user_id(&self) -> Option<Uuid> {
        match self { Self::User(id) => Some(*id), Self::Session(_) => None }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self { Self::User(_) => None, Self::Session(id) => Some(id) }
    }
}

impl fmt::Display for ActorIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self { Self::User(id) => write!(f, "user:{id}"), Self::Session(id) => write!(f, "session:{id}") }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)] pub enum ActorError { Missing, Ambiguous }
impl std::error::Error for ActorError {}
impl fmt::Display for ActorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => write!(f, "request carries neither a user id nor a session id"),
            Self::Ambiguous => write!(f, "request carries both a user id and a session id"),
        }
    }
}

/// Percentage value object, e.g. `10` for 10%.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Percentage(Decimal);

impl Percentage {
    pub fn new(value: Decimal) -> Self { Self(value) }
    pub fn zero() -> Self { Self(Decimal::ZERO) }
    pub fn value(&self) -> Decimal { self.0 }
    /// `1 + value / 100`
    pub fn multiplier(&self) -> Decimal { Decimal::ONE + self.0 / Decimal::ONE_HUNDRED }
}

impl fmt::Display for Percentage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}%", self.0.normalize()) }
}

/// Stock level of a product. `Unlimited` corresponds to a null `stock_quantity`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Option<i32>", into = "Option<i32>")]
pub enum Stock {
    #[default]
    Unlimited,
    Limited(u32),
}

impl Stock {
    pub fn from_column(value: Option<i32>) -> Self {
        match value { None => Self::Unlimited, Some(v) => Self::Limited(u32::try_from(v).unwrap_or(0)) }
    }

    pub fn to_column(self) -> Option<i32> {
        match self { Self::Unlimited => None, Self::Limited(v) => Some(i32::try_from(v).unwrap_or(i32::MAX)) }
    }

    pub fn available(&self) -> Option<u32> {
        match self { Self::Unlimited => None, Self::Limited(v) => Some(*v) }
    }

    pub fn is_exhausted(&self) -> bool { matches!(self, Self::Limited(0)) }

    pub fn admits(&self, units: u32) -> bool {
        match self { Self::Unlimited => true, Self::Limited(v) => units <= *v }
    }

    /// Stock after `units` leave the warehouse; never below zero.
    pub fn after_consuming(self, units: u32) -> Self {
        match self { Self::Unlimited => Self::Unlimited, Self::Limited(v) => Self::Limited(v.saturating_sub(units)) }
    }
}

impl From<Option<i32>> for Stock { fn from(v: Option<i32>) -> Self { Self::from_column(v) } }
impl From<Stock> for Option<i32> { fn from(s: Stock) -> Self { s.to_column() } }

/// Rounds a currency amount to 2 decimal places, half away from zero.
pub fn round_currency(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Reads a decimal out of a loosely-typed JSON value (number or numeric string).
pub fn decimal_from_json(value: &serde_json::Value) -> Option<Decimal> {
    let text = match value {
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s.trim().to_string(),
        _ => return None,
    };
    Decimal::from_str(&text).or_else(|_| Decimal::from_scientific(&text)).ok()
}

/// Writes a decimal as a JSON number, integral values without a fraction.
pub fn decimal_to_json(value: Decimal) -> serde_json::Value {
    use rust_decimal::prelude::ToPrimitive;
    let value = value.normalize();
    if value.scale() == 0 {
        if let Some(i) = value.to_i64() { return serde_json::Value::from(i); }
    }
    value.to_f64().and_then(serde_json::Number::from_f64).map(serde_json::Value::Number).unwrap_or(serde_json::Value::Null)
}
