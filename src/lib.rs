//! Storefront Checkout
//!
//! Turns a mutable, concurrently-accessed shopping cart into an immutable,
//! financially-correct order without overselling.
//!
//! ## Features
//! - Flat per-unit and tiered bottle pricing through one price engine
//! - Tax and shipping surcharges, decomposable for display
//! - Cart line deduplication on a canonical variant key
//! - Checkout snapshots that drop lines gone unavailable since add-to-cart
//! - Atomic order placement with conditional per-product stock decrement

pub mod config;
pub mod domain;
pub mod http;
pub mod services;
pub mod settings;
pub mod store;

use thiserror::Error;
use uuid::Uuid;

use crate::domain::aggregates::OrderError;
use crate::domain::value_objects::ActorError;
use crate::domain::variant::VariantError;
use crate::store::{CommitError, StoreError};

pub use crate::domain::aggregates::{Cart, CartLine, Order, OrderLine, Product};
pub use crate::domain::pricing::{PriceEngine, PricingConfig, Totals};
pub use crate::domain::value_objects::ActorIdentity;
pub use crate::domain::variant::Variant;
pub use crate::services::{CartService, Checkout, CheckoutAssembler, CheckoutSnapshot, OrderPlacer};

// =============================================================================
// Error Types
// =============================================================================

#[derive(Error, Debug)]
pub enum CheckoutError {
    #[error("This product is out of stock.")]
    OutOfStock { product_id: Uuid },

    #[error("{}", stock_message(.available, .capsules_per_bottle))]
    InsufficientStock { product_id: Uuid, available: u32, capsules_per_bottle: Option<u32> },

    #[error("This product can only be purchased in bottle quantities. Please select a bottle option.")]
    VariantRequired { product_id: Uuid },

    #[error("This cart line belongs to another shopper.")]
    Forbidden,

    #[error("{dropped} item(s) in your cart are no longer available or have insufficient stock. Please update your cart.")]
    CartChanged { dropped: usize },

    #[error("Your cart is empty.")]
    EmptyCart,

    #[error("Product not found.")]
    ProductNotFound(Uuid),

    #[error("Cart line not found.")]
    CartLineNotFound(Uuid),

    #[error("Order not found.")]
    OrderNotFound(Uuid),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Storage error: {0}")]
    Persistence(#[from] StoreError),
}

fn stock_message(available: &u32, capsules_per_bottle: &Option<u32>) -> String {
    match capsules_per_bottle.filter(|c| *c > 0) {
        Some(per_bottle) => {
            let bottles = available / per_bottle;
            let noun = if bottles == 1 { "bottle" } else { "bottles" };
            format!("Only {available} capsules ({bottles} {noun}) available in stock.")
        }
        None => format!("Only {available} items available in stock."),
    }
}

impl From<ActorError> for CheckoutError {
    fn from(e: ActorError) -> Self { Self::InvalidInput(e.to_string()) }
}

impl From<VariantError> for CheckoutError {
    fn from(e: VariantError) -> Self { Self::InvalidInput(e.to_string()) }
}

impl From<validator::ValidationErrors> for CheckoutError {
    fn from(e: validator::ValidationErrors) -> Self { Self::InvalidInput(e.to_string()) }
}

impl From<OrderError> for CheckoutError {
    fn from(e: OrderError) -> Self {
        match e {
            OrderError::NoItems => Self::EmptyCart,
            other => Self::InvalidInput(other.to_string()),
        }
    }
}

impl From<CommitError> for CheckoutError {
    fn from(e: CommitError) -> Self {
        match e {
            CommitError::InsufficientStock { product_id, available } => Self::InsufficientStock { product_id, available, capsules_per_bottle: None },
            CommitError::ProductNotFound(id) => Self::ProductNotFound(id),
            CommitError::Store(e) => Self::Persistence(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, CheckoutError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_stock_messages() {
        let err = CheckoutError::InsufficientStock { product_id: Uuid::nil(), available: 5, capsules_per_bottle: None };
        assert_eq!(err.to_string(), "Only 5 items available in stock.");
        let err = CheckoutError::InsufficientStock { product_id: Uuid::nil(), available: 90, capsules_per_bottle: Some(30) };
        assert_eq!(err.to_string(), "Only 90 capsules (3 bottles) available in stock.");
        let err = CheckoutError::InsufficientStock { product_id: Uuid::nil(), available: 45, capsules_per_bottle: Some(30) };
        assert_eq!(err.to_string(), "Only 45 capsules (1 bottle) available in stock.");
    }

    #[test]
    fn test_cart_changed_message() {
        assert_eq!(
            CheckoutError::CartChanged { dropped: 2 }.to_string(),
            "2 item(s) in your cart are no longer available or have insufficient stock. Please update your cart."
        );
    }

    #[test]
    fn test_order_error_conversion() {
        assert!(matches!(CheckoutError::from(OrderError::NoItems), CheckoutError::EmptyCart));
    }
}
