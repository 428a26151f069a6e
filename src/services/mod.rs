//! Application services
//!
//! - [`CartService`]: cart line lifecycle for one actor
//! - [`CheckoutAssembler`]: priced, stock-validated views of a cart
//! - [`OrderPlacer`]: turns a checkout snapshot into an order in one atomic commit

pub mod cart;
pub mod checkout;
pub mod orders;

pub use cart::{AddItem, CartService, UpdateItem};
pub use checkout::{CartSummary, Checkout, CheckoutAssembler, CheckoutSnapshot, PriceBreakdown, PricedLine};
pub use orders::{OrderPlacer, PlaceOrderRequest, StatusUpdate};

use crate::domain::aggregates::Product;
use crate::store::CommerceStore;
use crate::{CheckoutError, Result};
use uuid::Uuid;

async fn load_product(store: &dyn CommerceStore, id: Uuid) -> Result<Product> {
    store.product(id).await?.ok_or(CheckoutError::ProductNotFound(id))
}
