//! Checkout domain: value objects, variants, pricing, aggregates and events.
pub mod aggregates;
pub mod events;
pub mod pricing;
pub mod value_objects;
pub mod variant;
