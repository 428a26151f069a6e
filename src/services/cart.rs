//! Cart service
//!
//! A cart line moves through `absent -> present -> (merged on add)* -> removed`.
//! The stock check on add and update is advisory: it keeps obviously doomed
//! carts out but reserves nothing. Checkout re-validates.

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use super::load_product;
use crate::domain::aggregates::{Cart, CartLine, Product};
use crate::domain::pricing::bottle_tier_derived_price;
use crate::domain::value_objects::{decimal_from_json, round_currency, ActorIdentity};
use crate::domain::variant::{BottleVariant, Variant};
use crate::store::{CommerceStore, StoreError};
use crate::{CheckoutError, Result};

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AddItem {
    pub product_id: Uuid,
    /// Units, or capsules for a bottle product.
    #[validate(range(min = 1))]
    pub quantity: u32,
    #[serde(default)]
    pub variant: Value,
    /// Server-computed tier price. Ignored for products without a bottle variant.
    #[serde(default)]
    pub price: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UpdateItem {
    /// Units, or bottles for a bottle line.
    #[validate(range(min = 1))]
    pub quantity: u32,
    #[serde(default)]
    pub variant: Option<Value>,
    #[serde(default)]
    pub price: Option<Value>,
}

#[derive(Clone)]
pub struct CartService {
    store: Arc<dyn CommerceStore>,
}

impl CartService {
    pub fn new(store: Arc<dyn CommerceStore>) -> Self { Self { store } }

    #[instrument(skip(self, req), fields(actor = %actor, product_id = %req.product_id, quantity = req.quantity))]
    pub async fn add_item(&self, actor: &ActorIdentity, req: AddItem) -> Result<CartLine> {
        req.validate()?;
        let product = load_product(&*self.store, req.product_id).await?;
        ensure_for_sale(&product)?;

        let variant = catalog_variant(&product, Variant::from_document(&req.variant, req.quantity)?)?;
        let unit_price = resolve_unit_price(&product, &variant, req.price.as_ref(), product.base_unit_price())?;

        let key = variant.canonical_key();
        let saved = match self.store.find_cart_line(actor, product.id, &key).await? {
            Some(existing) => self.merge_into(&product, existing, req.quantity, &variant, unit_price).await?,
            None => {
                let line = CartLine::new(actor.clone(), product.id, req.quantity, unit_price, variant.clone()).priced(unit_price);
                ensure_stock(&product, &line)?;
                match self.store.save_cart_line(&line).await {
                    // A concurrent add created the line between lookup and insert.
                    Err(StoreError::Conflict(reason)) => {
                        let existing = self.store.find_cart_line(actor, product.id, &key).await?.ok_or(StoreError::Conflict(reason))?;
                        debug!(line_id = %existing.id, "Lost insert race, merging into existing line");
                        self.merge_into(&product, existing, req.quantity, &variant, unit_price).await?
                    }
                    other => other?,
                }
            }
        };
        debug!(line_id = %saved.id, quantity = saved.quantity, "Cart line saved");
        Ok(saved)
    }

    async fn merge_into(&self, product: &Product, existing: CartLine, quantity: u32, variant: &Variant, unit_price: Decimal) -> Result<CartLine> {
        let line = existing.merged_with(quantity, variant).priced(unit_price);
        ensure_stock(product, &line)?;
        Ok(self.store.save_cart_line(&line).await?)
    }

    #[instrument(skip(self, req), fields(actor = %actor, quantity = req.quantity))]
    pub async fn update_item(&self, actor: &ActorIdentity, line_id: Uuid, req: UpdateItem) -> Result<CartLine> {
        req.validate()?;
        let line = self.owned_line(actor, line_id).await?.ok_or(CheckoutError::CartLineNotFound(line_id))?;
        let product = load_product(&*self.store, line.product_id).await?;
        ensure_for_sale(&product)?;

        let supplied = req.variant.as_ref().map(|doc| Variant::from_document_with_bottles(doc, req.quantity)).transpose()?;
        let variant = match (supplied, &line.variant) {
            (Some(v @ Variant::Bottle(_)), _) => v,
            (_, Variant::Bottle(b)) => Variant::Bottle(BottleVariant::new(b.tier.clone(), req.quantity)),
            (_, Variant::Plain) => Variant::Plain,
        };
        let variant = catalog_variant(&product, variant)?;
        let unit_price = resolve_unit_price(&product, &variant, req.price.as_ref(), line.unit_price)?;

        let key = variant.canonical_key();
        if key != line.variant_key {
            if let Some(other) = self.store.find_cart_line(actor, line.product_id, &key).await? {
                if other.id != line.id {
                    return Err(CheckoutError::InvalidInput("another cart line already holds this product with that variant".into()));
                }
            }
        }

        let updated = line.replaced_with(req.quantity, variant).priced(unit_price);
        ensure_stock(&product, &updated)?;
        Ok(self.store.save_cart_line(&updated).await?)
    }

    /// Removing a line that no longer exists succeeds.
    #[instrument(skip(self), fields(actor = %actor))]
    pub async fn remove_item(&self, actor: &ActorIdentity, line_id: Uuid) -> Result<()> {
        if self.owned_line(actor, line_id).await?.is_some() {
            self.store.delete_cart_line(actor, line_id).await?;
        }
        Ok(())
    }

    pub async fn list_items(&self, actor: &ActorIdentity) -> Result<Cart> {
        Ok(Cart::new(actor.clone(), self.store.cart_lines(actor).await?))
    }

    /// Sum of line quantities.
    pub async fn count(&self, actor: &ActorIdentity) -> Result<u64> {
        Ok(self.list_items(actor).await?.item_count())
    }

    /// The line, if it exists. Fails with `Forbidden` when someone else owns it.
    async fn owned_line(&self, actor: &ActorIdentity, line_id: Uuid) -> Result<Option<CartLine>> {
        match self.store.cart_line(line_id).await? {
            Some(line) if !line.belongs_to(actor) => Err(CheckoutError::Forbidden),
            found => Ok(found),
        }
    }
}

fn ensure_for_sale(product: &Product) -> Result<()> {
    if !product.is_available() {
        return Err(CheckoutError::OutOfStock { product_id: product.id });
    }
    Ok(())
}

/// Checks the variant against the product and prices a bottle tier from the catalog
/// when the product lists it.
fn catalog_variant(product: &Product, variant: Variant) -> Result<Variant> {
    let Variant::Bottle(selected) = variant else {
        if product.requires_bottle_variant() {
            return Err(CheckoutError::VariantRequired { product_id: product.id });
        }
        return Ok(Variant::Plain);
    };
    if !product.is_bottle_based {
        return Err(CheckoutError::InvalidInput(format!("{} is not sold in bottles", product.name)));
    }
    if !product.offers_tier(&selected.tier) {
        return Err(CheckoutError::InvalidInput(format!("{} has no {}-capsule bottle", product.name, selected.tier.capsules)));
    }
    let tier = product.tiers().iter().find(|t| t.capsules == selected.tier.capsules).cloned().map(bottle_tier_derived_price).unwrap_or(selected.tier);
    Ok(Variant::Bottle(BottleVariant::new(tier, selected.bottles)))
}

/// Base unit price of a line: the explicit price for bottle variants when numeric
/// (rounded to cents), else the tier price; `fallback` for everything else.
fn resolve_unit_price(product: &Product, variant: &Variant, explicit: Option<&Value>, fallback: Decimal) -> Result<Decimal> {
    let explicit = match explicit {
        None | Some(Value::Null) => None,
        Some(raw) => {
            let parsed = decimal_from_json(raw);
            if parsed.is_none() {
                warn!(product_id = %product.id, price = %raw, "Ignoring non-numeric explicit price");
            }
            parsed
        }
    };
    match (variant, explicit) {
        (Variant::Bottle(_), Some(price)) if price.is_sign_negative() => Err(CheckoutError::InvalidInput("price must not be negative".into())),
        (Variant::Bottle(_), Some(price)) => Ok(round_currency(price)),
        (Variant::Bottle(b), None) => Ok(b.tier.price),
        (Variant::Plain, Some(_)) => {
            warn!(product_id = %product.id, "Ignoring explicit price for a product without bottle tiers");
            Ok(fallback)
        }
        (Variant::Plain, None) => Ok(fallback),
    }
}

fn ensure_stock(product: &Product, line: &CartLine) -> Result<()> {
    if product.stock.admits(line.stock_units()) {
        return Ok(());
    }
    Err(CheckoutError::InsufficientStock {
        product_id: product.id,
        available: product.stock.available().unwrap_or(0),
        capsules_per_bottle: line.capsules_per_bottle(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::variant::BottleTier;
    use crate::services::fixtures::*;
    use crate::store::{CartRepository, ProductCatalog};
    use proptest::prelude::*;
    use serde_json::json;

    fn add(product: &Product, quantity: u32, variant: Value) -> AddItem {
        AddItem { product_id: product.id, quantity, variant, price: None }
    }

    #[tokio::test]
    async fn test_add_plain_item() {
        let product = plain(10);
        let store = store_with(&[&product]).await;
        let carts = CartService::new(store.clone());
        let line = carts.add_item(&session("a"), add(&product, 2, Value::Null)).await.unwrap();
        assert_eq!(line.quantity, 2);
        assert_eq!(line.unit_price, dec(1000));
        assert!(line.variant_key.is_plain());
        assert_eq!(carts.count(&session("a")).await.unwrap(), 2);
        assert_eq!(carts.count(&session("b")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_add_uses_sale_price() {
        let product = plain(10).with_sale_price(dec(800));
        let store = store_with(&[&product]).await;
        let line = CartService::new(store).add_item(&session("a"), add(&product, 1, json!({}))).await.unwrap();
        assert_eq!(line.unit_price, dec(800));
    }

    #[tokio::test]
    async fn test_add_two_bottles() {
        let product = bottled(1000);
        let store = store_with(&[&product]).await;
        let line = CartService::new(store).add_item(&session("a"), add(&product, 60, bottle_doc(2))).await.unwrap();
        let bottle = line.variant.as_bottle().unwrap();
        assert_eq!(line.quantity, 60);
        assert_eq!((bottle.bottles, bottle.total_capsules), (2, 60));
        assert_eq!(line.unit_price, dec(13500));
    }

    #[tokio::test]
    async fn test_insufficient_stock_creates_nothing() {
        let product = plain(5);
        let store = store_with(&[&product]).await;
        let err = CartService::new(store.clone()).add_item(&session("a"), add(&product, 6, Value::Null)).await.unwrap_err();
        assert!(matches!(err, CheckoutError::InsufficientStock { available: 5, .. }));
        assert!(store.cart_lines(&session("a")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_merge_is_checked_against_stock() {
        let product = plain(5);
        let store = store_with(&[&product]).await;
        let carts = CartService::new(store);
        carts.add_item(&session("a"), add(&product, 3, Value::Null)).await.unwrap();
        let err = carts.add_item(&session("a"), add(&product, 3, json!([]))).await.unwrap_err();
        assert!(matches!(err, CheckoutError::InsufficientStock { available: 5, capsules_per_bottle: None, .. }));
    }

    #[tokio::test]
    async fn test_bottle_merge_and_stock_message() {
        let product = bottled(90);
        let store = store_with(&[&product]).await;
        let carts = CartService::new(store);
        carts.add_item(&session("a"), add(&product, 60, bottle_doc(2))).await.unwrap();
        let merged = carts.add_item(&session("a"), add(&product, 30, bottle_doc(1))).await.unwrap();
        assert_eq!(merged.quantity, 90);
        assert_eq!(carts.list_items(&session("a")).await.unwrap().line_count(), 1);

        let err = carts.add_item(&session("a"), add(&product, 30, bottle_doc(1))).await.unwrap_err();
        assert_eq!(err.to_string(), "Only 90 capsules (3 bottles) available in stock.");
    }

    #[tokio::test]
    async fn test_out_of_stock_and_inactive() {
        let sold_out = plain(0);
        let mut inactive = plain(10);
        inactive.is_active = false;
        let store = store_with(&[&sold_out, &inactive]).await;
        let carts = CartService::new(store);
        for product in [&sold_out, &inactive] {
            let err = carts.add_item(&session("a"), add(product, 1, Value::Null)).await.unwrap_err();
            assert!(matches!(err, CheckoutError::OutOfStock { .. }));
        }
    }

    #[tokio::test]
    async fn test_bottles_only_requires_variant() {
        let product = bottled(100);
        let store = store_with(&[&product]).await;
        let err = CartService::new(store).add_item(&session("a"), add(&product, 30, Value::Null)).await.unwrap_err();
        assert!(matches!(err, CheckoutError::VariantRequired { .. }));
    }

    #[tokio::test]
    async fn test_rejects_unknown_tier_and_non_bottle_product() {
        let bottle = bottled(1000);
        let regular = plain(1000);
        let store = store_with(&[&bottle, &regular]).await;
        let carts = CartService::new(store);
        let odd_tier = json!({"type": "bottle", "tier": {"capsules": 45, "price": 100}, "bottles": 1});
        assert!(matches!(carts.add_item(&session("a"), add(&bottle, 45, odd_tier)).await, Err(CheckoutError::InvalidInput(_))));
        assert!(matches!(carts.add_item(&session("a"), add(&regular, 30, bottle_doc(1))).await, Err(CheckoutError::InvalidInput(_))));
        assert!(matches!(carts.add_item(&session("a"), add(&regular, 0, Value::Null)).await, Err(CheckoutError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_catalog_tier_price_wins_over_document() {
        let product = bottled(1000);
        let store = store_with(&[&product]).await;
        let doc = json!({"type": "bottle", "tier": {"capsules": 30, "price": 1}, "bottles": 1});
        let line = CartService::new(store).add_item(&session("a"), add(&product, 30, doc)).await.unwrap();
        assert_eq!(line.unit_price, dec(13500));
    }

    #[tokio::test]
    async fn test_explicit_price() {
        let bottle = bottled(1000);
        let regular = plain(1000);
        let store = store_with(&[&bottle, &regular]).await;
        let carts = CartService::new(store);

        let req = AddItem { price: Some(json!("12000")), ..add(&bottle, 30, bottle_doc(1)) };
        let line = carts.add_item(&session("a"), req).await.unwrap();
        assert_eq!(line.unit_price, dec(12000));
        assert_eq!(line.variant.as_bottle().unwrap().tier.price, dec(12000));

        let req = AddItem { price: Some(json!(1)), ..add(&regular, 1, Value::Null) };
        assert_eq!(carts.add_item(&session("a"), req).await.unwrap().unit_price, dec(1000));

        let req = AddItem { price: Some(json!(-5)), ..add(&bottle, 30, bottle_doc(1)) };
        assert!(matches!(carts.add_item(&session("b"), req).await, Err(CheckoutError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_explicit_price_is_rounded_to_cents() {
        let bottle = bottled(1000);
        let carts = CartService::new(store_with(&[&bottle]).await);

        let req = AddItem { price: Some(json!("12000.555")), ..add(&bottle, 60, bottle_doc(2)) };
        let line = carts.add_item(&session("a"), req).await.unwrap();
        assert_eq!(line.unit_price, Decimal::new(1_200_056, 2));
        assert_eq!(line.variant.as_bottle().unwrap().tier.price, line.unit_price);
        assert_eq!(line.base_total(), Decimal::new(2_400_112, 2));
    }

    #[tokio::test]
    async fn test_update_replaces_quantity() {
        let product = plain(10);
        let store = store_with(&[&product]).await;
        let carts = CartService::new(store);
        let line = carts.add_item(&session("a"), add(&product, 2, Value::Null)).await.unwrap();
        let updated = carts.update_item(&session("a"), line.id, UpdateItem { quantity: 7, variant: None, price: None }).await.unwrap();
        assert_eq!((updated.id, updated.quantity), (line.id, 7));
        let err = carts.update_item(&session("a"), line.id, UpdateItem { quantity: 11, variant: None, price: None }).await.unwrap_err();
        assert!(matches!(err, CheckoutError::InsufficientStock { available: 10, .. }));
    }

    #[tokio::test]
    async fn test_update_bottle_line_counts_bottles() {
        let product = bottled(1000);
        let store = store_with(&[&product]).await;
        let carts = CartService::new(store);
        let line = carts.add_item(&session("a"), add(&product, 60, bottle_doc(2))).await.unwrap();

        let updated = carts.update_item(&session("a"), line.id, UpdateItem { quantity: 3, variant: None, price: None }).await.unwrap();
        assert_eq!(updated.quantity, 90);
        assert_eq!(updated.variant.as_bottle().unwrap().bottles, 3);

        let tier60 = json!({"type": "bottle", "tier": {"capsules": 60, "price": 25000}});
        let updated = carts.update_item(&session("a"), line.id, UpdateItem { quantity: 2, variant: Some(tier60), price: None }).await.unwrap();
        assert_eq!(updated.quantity, 120);
        assert_eq!(updated.unit_price, dec(25000));
        assert_eq!(updated.variant.as_bottle().unwrap().tier, bottle_tier_derived_price(BottleTier::new(60, dec(25000))));
    }

    #[tokio::test]
    async fn test_add_merges_when_a_concurrent_add_wins_the_insert() {
        let product = plain(10);
        let store = store_with(&[&product]).await;
        let carts = CartService::new(store.clone());
        let first = carts.add_item(&session("a"), add(&product, 2, Value::Null)).await.unwrap();

        store.miss_next_lookup();
        let second = carts.add_item(&session("a"), add(&product, 3, Value::Null)).await.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.quantity, 5);
        assert_eq!(store.cart_lines(&session("a")).await.unwrap().len(), 1);

        store.miss_next_lookup();
        let err = carts.add_item(&session("a"), add(&product, 6, Value::Null)).await.unwrap_err();
        assert!(matches!(err, CheckoutError::InsufficientStock { available: 10, .. }));
    }

    #[tokio::test]
    async fn test_update_rejects_variant_held_by_another_line() {
        let product = Product::create("NMN-MIX", "NMN", dec(500)).with_stock(1000).bottle_based(30, vec![tier30()], false);
        let store = store_with(&[&product]).await;
        let carts = CartService::new(store.clone());
        let loose = carts.add_item(&session("a"), add(&product, 5, Value::Null)).await.unwrap();
        carts.add_item(&session("a"), add(&product, 30, bottle_doc(1))).await.unwrap();

        let update = carts.update_item(&session("a"), loose.id, UpdateItem { quantity: 2, variant: Some(bottle_doc(2)), price: None }).await;
        assert!(matches!(update, Err(CheckoutError::InvalidInput(_))));
        let untouched = store.cart_line(loose.id).await.unwrap().unwrap();
        assert_eq!(untouched.quantity, 5);
        assert!(!untouched.variant.is_bottle());
    }

    #[tokio::test]
    async fn test_ownership_is_checked_before_mutation() {
        let product = plain(10);
        let store = store_with(&[&product]).await;
        let carts = CartService::new(store.clone());
        let line = carts.add_item(&session("owner"), add(&product, 1, Value::Null)).await.unwrap();

        let update = carts.update_item(&session("intruder"), line.id, UpdateItem { quantity: 5, variant: None, price: None }).await;
        assert!(matches!(update, Err(CheckoutError::Forbidden)));
        assert!(matches!(carts.remove_item(&session("intruder"), line.id).await, Err(CheckoutError::Forbidden)));
        assert_eq!(store.cart_line(line.id).await.unwrap().unwrap().quantity, 1);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let product = plain(10);
        let store = store_with(&[&product]).await;
        let carts = CartService::new(store);
        let line = carts.add_item(&session("a"), add(&product, 1, Value::Null)).await.unwrap();
        carts.remove_item(&session("a"), line.id).await.unwrap();
        carts.remove_item(&session("a"), line.id).await.unwrap();
        carts.remove_item(&session("a"), Uuid::new_v4()).await.unwrap();
        assert!(carts.list_items(&session("a")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_product() {
        let store = store_with(&[]).await;
        let req = AddItem { product_id: Uuid::new_v4(), quantity: 1, variant: Value::Null, price: None };
        assert!(matches!(CartService::new(store).add_item(&session("a"), req).await, Err(CheckoutError::ProductNotFound(_))));
    }

    #[tokio::test]
    async fn test_users_and_sessions_do_not_share_lines() {
        let product = plain(10);
        let store = store_with(&[&product]).await;
        let carts = CartService::new(store.clone());
        let user = ActorIdentity::User(Uuid::new_v4());
        carts.add_item(&user, add(&product, 1, Value::Null)).await.unwrap();
        carts.add_item(&session("a"), add(&product, 2, Value::Null)).await.unwrap();
        assert_eq!(carts.count(&user).await.unwrap(), 1);
        assert_eq!(carts.count(&session("a")).await.unwrap(), 2);
        assert_eq!(store.product(product.id).await.unwrap().unwrap().stock.available(), Some(10));
    }

    proptest! {
        #[test]
        fn prop_adds_merge_commutatively(a in 1u32..50, b in 1u32..50) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let (split, whole) = rt.block_on(async {
                let product = plain(1000);
                let store = store_with(&[&product]).await;
                let carts = CartService::new(store);
                carts.add_item(&session("split"), add(&product, a, Value::Null)).await.unwrap();
                let split = carts.add_item(&session("split"), add(&product, b, Value::Null)).await.unwrap();
                let whole = carts.add_item(&session("whole"), add(&product, a + b, Value::Null)).await.unwrap();
                (split, whole)
            });
            prop_assert_eq!(split.quantity, whole.quantity);
            prop_assert_eq!(split.unit_price, whole.unit_price);
            prop_assert_eq!(split.base_total(), whole.base_total());
            prop_assert_eq!(split.variant_key, whole.variant_key);
        }
    }
}
