//! Aggregates module
pub mod product;
pub mod order;
pub mod cart;

pub use product::{Product, DEFAULT_CAPSULES_PER_BOTTLE};
pub use order::{Order, OrderError, OrderHeader, OrderLine, OrderStatus, PaymentMethod, PaymentStatus, ShippingDetails};
pub use cart::{Cart, CartLine};
