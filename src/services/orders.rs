//! Order placement
//!
//! A checkout attempt goes `validated snapshot -> stock locked -> committed | aborted`.
//! Stock is re-read here even though the snapshot already checked it: the snapshot
//! may be minutes old, and the store's conditional decrement is the final word.

use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;
use validator::Validate;

use super::checkout::CheckoutSnapshot;
use super::load_product;
use crate::domain::aggregates::{Order, OrderLine, OrderStatus, PaymentMethod, PaymentStatus, Product, ShippingDetails};
use crate::domain::value_objects::ActorIdentity;
use crate::store::{CommerceStore, CommitError, OrderCommit, StockReservation};
use crate::{CheckoutError, Result};

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PlaceOrderRequest {
    #[serde(flatten)]
    #[validate]
    pub shipping: ShippingDetails,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub health_check: Option<Value>,
    #[serde(default)]
    pub risk_acknowledged: bool,
    #[serde(default)]
    pub resale_prohibited: bool,
}

impl PlaceOrderRequest {
    fn check(&self) -> Result<()> {
        self.validate()?;
        if !self.risk_acknowledged || !self.resale_prohibited {
            return Err(CheckoutError::InvalidInput("You must acknowledge the product risks and the resale prohibition.".into()));
        }
        if self.health_check.as_ref().is_some_and(|h| !(h.is_null() || h.is_array() || h.is_object())) {
            return Err(CheckoutError::InvalidInput("health_check must be a list or an object".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusUpdate {
    pub status: Option<OrderStatus>,
    pub payment_status: Option<PaymentStatus>,
}

#[derive(Clone)]
pub struct OrderPlacer {
    store: Arc<dyn CommerceStore>,
}

impl OrderPlacer {
    pub fn new(store: Arc<dyn CommerceStore>) -> Self { Self { store } }

    #[instrument(skip(self, snapshot, req), fields(actor = %actor, lines = snapshot.lines.len()))]
    pub async fn place_order(&self, actor: &ActorIdentity, snapshot: &CheckoutSnapshot, req: PlaceOrderRequest) -> Result<Order> {
        if &snapshot.actor != actor {
            return Err(CheckoutError::Forbidden);
        }
        req.check()?;
        if snapshot.lines.is_empty() {
            return Err(CheckoutError::EmptyCart);
        }

        let mut reserved: BTreeMap<Uuid, u32> = BTreeMap::new();
        let mut per_bottle: HashMap<Uuid, u32> = HashMap::new();
        let mut lines = Vec::with_capacity(snapshot.lines.len());
        for priced in &snapshot.lines {
            let line = &priced.line;
            let product = load_product(&*self.store, line.product_id).await?;
            if let Some(capsules) = line.capsules_per_bottle() {
                per_bottle.insert(product.id, capsules);
            }
            let units = reserved.entry(product.id).or_default();
            *units = units.saturating_add(line.stock_units());
            if !product.is_available() || !product.stock.admits(*units) {
                return Err(CheckoutError::InsufficientStock {
                    product_id: product.id,
                    available: sellable_units(&product),
                    capsules_per_bottle: per_bottle.get(&product.id).copied(),
                });
            }
            lines.push(OrderLine::capture(line, &product));
        }

        let mut order = Order::place(actor.clone(), req.shipping, req.payment_method, req.health_check, lines, snapshot.totals().clone())?;
        let reservations: Vec<StockReservation> = reserved.into_iter().map(|(product_id, units)| StockReservation { product_id, units }).collect();
        let cart_line_ids: Vec<Uuid> = snapshot.lines.iter().map(|l| l.line.id).collect();

        let committed = self.store.commit_order(OrderCommit { order: &order, reservations: &reservations, cart_line_ids: &cart_line_ids }).await;
        let levels = match committed {
            Ok(levels) => levels,
            Err(CommitError::InsufficientStock { product_id, available }) => {
                info!(%product_id, available, "Stock ran out before commit");
                return Err(CheckoutError::InsufficientStock { product_id, available, capsules_per_bottle: per_bottle.get(&product_id).copied() });
            }
            Err(e) => {
                error!(error = %e, order_number = order.order_number(), "Order commit rolled back");
                return Err(e.into());
            }
        };

        for level in levels.iter().filter(|l| l.remaining.is_exhausted()) {
            info!(product_id = %level.product_id, "Product sold out");
            order.record_stock_depleted(level.product_id);
        }
        info!(order_id = %order.id(), order_number = order.order_number(), total = %order.totals().total, "Order placed");
        Ok(order)
    }

    /// An order, only for the actor that placed it.
    pub async fn order(&self, actor: &ActorIdentity, id: Uuid) -> Result<Order> {
        let order = self.store.order(id).await?.ok_or(CheckoutError::OrderNotFound(id))?;
        if order.actor() != actor {
            return Err(CheckoutError::Forbidden);
        }
        Ok(order)
    }

    #[instrument(skip(self))]
    pub async fn update_status(&self, id: Uuid, update: StatusUpdate) -> Result<Order> {
        if update.status.is_none() && update.payment_status.is_none() {
            return Err(CheckoutError::InvalidInput("nothing to update".into()));
        }
        let mut order = self.store.order(id).await?.ok_or(CheckoutError::OrderNotFound(id))?;
        order.update_status(update.status, update.payment_status)?;
        self.store.save_order_status(&order).await?;
        info!(order_number = order.order_number(), status = %order.status(), payment_status = %order.payment_status(), "Order status updated");
        Ok(order)
    }
}

fn sellable_units(product: &Product) -> u32 {
    if !product.is_active || !product.in_stock {
        return 0;
    }
    product.stock.available().unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::order::tests::shipping;
    use crate::domain::events::CheckoutEvent;
    use crate::domain::value_objects::Stock;
    use crate::services::checkout::Checkout;
    use crate::services::fixtures::*;
    use crate::services::{AddItem, CartService, CheckoutAssembler};
    use crate::store::{CartRepository, MemoryStore, OrderRepository, ProductCatalog};

    fn request() -> PlaceOrderRequest {
        PlaceOrderRequest {
            shipping: shipping(), payment_method: PaymentMethod::BankTransfer, health_check: None,
            risk_acknowledged: true, resale_prohibited: true,
        }
    }

    async fn snapshot_for(store: &Arc<MemoryStore>, who: &str, product: &Product, quantity: u32, variant: Value) -> CheckoutSnapshot {
        CartService::new(store.clone())
            .add_item(&session(who), AddItem { product_id: product.id, quantity, variant, price: None })
            .await
            .unwrap();
        match CheckoutAssembler::new(store.clone()).build_snapshot(&session(who)).await.unwrap() {
            Checkout::Ready(snapshot) => snapshot,
            Checkout::Empty => panic!("expected a snapshot"),
        }
    }

    #[tokio::test]
    async fn test_place_order() {
        let product = plain(5);
        let store = store_with(&[&product]).await;
        let snapshot = snapshot_for(&store, "a", &product, 2, Value::Null).await;

        let mut order = OrderPlacer::new(store.clone()).place_order(&session("a"), &snapshot, request()).await.unwrap();

        assert_eq!(order.totals(), snapshot.totals());
        assert_eq!(order.lines()[0].quantity, 2);
        assert_eq!(order.lines()[0].total, dec(2000));
        assert!(matches!(order.take_events().as_slice(), [CheckoutEvent::OrderPlaced { .. }]));
        assert_eq!(store.product(product.id).await.unwrap().unwrap().stock, Stock::Limited(3));
        assert!(store.cart_lines(&session("a")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bottle_order_reserves_capsules() {
        let product = bottled(60);
        let store = store_with(&[&product]).await;
        let snapshot = snapshot_for(&store, "a", &product, 60, bottle_doc(2)).await;

        let mut order = OrderPlacer::new(store.clone()).place_order(&session("a"), &snapshot, request()).await.unwrap();

        let line = &order.lines()[0];
        assert_eq!((line.quantity, line.stock_units, line.unit_price), (2, 60, dec(13500)));
        let stored = store.product(product.id).await.unwrap().unwrap();
        assert_eq!(stored.stock, Stock::Limited(0));
        assert!(!stored.in_stock);
        let events = order.take_events();
        assert!(events.contains(&CheckoutEvent::StockDepleted { product_id: product.id }));
    }

    #[tokio::test]
    async fn test_stock_rechecked_at_commit() {
        let product = plain(5);
        let store = store_with(&[&product]).await;
        let snapshot = snapshot_for(&store, "a", &product, 3, Value::Null).await;
        store.save_product(&product.clone().with_stock(2)).await.unwrap();

        let err = OrderPlacer::new(store.clone()).place_order(&session("a"), &snapshot, request()).await.unwrap_err();

        assert!(matches!(err, CheckoutError::InsufficientStock { available: 2, .. }));
        assert_eq!(store.cart_lines(&session("a")).await.unwrap().len(), 1);
        assert_eq!(store.product(product.id).await.unwrap().unwrap().stock, Stock::Limited(2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_oversell_under_concurrency() {
        let product = plain(1);
        let store = store_with(&[&product]).await;
        let first = snapshot_for(&store, "a", &product, 1, Value::Null).await;
        let second = snapshot_for(&store, "b", &product, 1, Value::Null).await;
        let placer = OrderPlacer::new(store.clone());

        let tasks = [("a", first), ("b", second)].map(|(who, snapshot)| {
            let placer = placer.clone();
            tokio::spawn(async move { placer.place_order(&session(who), &snapshot, request()).await })
        });
        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.iter().any(|r| matches!(r, Err(CheckoutError::InsufficientStock { available: 0, .. }))));
        assert_eq!(store.product(product.id).await.unwrap().unwrap().stock, Stock::Limited(0));
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_no_trace() {
        let product = plain(5);
        let store = store_with(&[&product]).await;
        let snapshot = snapshot_for(&store, "a", &product, 2, Value::Null).await;
        store.fail_next_commit();

        let err = OrderPlacer::new(store.clone()).place_order(&session("a"), &snapshot, request()).await.unwrap_err();

        assert!(matches!(err, CheckoutError::Persistence(_)));
        assert_eq!(store.product(product.id).await.unwrap().unwrap().stock, Stock::Limited(5));
        assert_eq!(store.cart_lines(&session("a")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_order_lines_are_frozen() {
        let product = plain(5);
        let store = store_with(&[&product]).await;
        let snapshot = snapshot_for(&store, "a", &product, 1, Value::Null).await;
        let placer = OrderPlacer::new(store.clone());
        let order = placer.place_order(&session("a"), &snapshot, request()).await.unwrap();

        let mut renamed = store.product(product.id).await.unwrap().unwrap();
        renamed.name = "Vitamin C Forte".into();
        renamed.sku = "VIT-C2".into();
        renamed.price = dec(9999);
        store.save_product(&renamed).await.unwrap();

        let stored = placer.order(&session("a"), order.id()).await.unwrap();
        assert_eq!(stored.lines(), order.lines());
        assert_eq!(stored.lines()[0].product_name, "Vitamin C");
        assert_eq!(stored.totals(), order.totals());
    }

    #[tokio::test]
    async fn test_request_validation_happens_before_writes() {
        let product = plain(5);
        let store = store_with(&[&product]).await;
        let snapshot = snapshot_for(&store, "a", &product, 1, Value::Null).await;
        let placer = OrderPlacer::new(store.clone());

        let unacknowledged = PlaceOrderRequest { resale_prohibited: false, ..request() };
        assert!(matches!(placer.place_order(&session("a"), &snapshot, unacknowledged).await, Err(CheckoutError::InvalidInput(_))));
        let bad_email = PlaceOrderRequest { shipping: ShippingDetails { email: "nope".into(), ..shipping() }, ..request() };
        assert!(matches!(placer.place_order(&session("a"), &snapshot, bad_email).await, Err(CheckoutError::InvalidInput(_))));
        assert!(matches!(placer.place_order(&session("b"), &snapshot, request()).await, Err(CheckoutError::Forbidden)));
        assert_eq!(store.product(product.id).await.unwrap().unwrap().stock, Stock::Limited(5));
    }

    #[tokio::test]
    async fn test_empty_snapshot() {
        let product = plain(5);
        let store = store_with(&[&product]).await;
        let mut snapshot = snapshot_for(&store, "a", &product, 1, Value::Null).await;
        snapshot.lines.clear();
        let err = OrderPlacer::new(store).place_order(&session("a"), &snapshot, request()).await.unwrap_err();
        assert!(matches!(err, CheckoutError::EmptyCart));
    }

    #[tokio::test]
    async fn test_order_visibility_and_status() {
        let product = plain(5);
        let store = store_with(&[&product]).await;
        let snapshot = snapshot_for(&store, "a", &product, 1, Value::Null).await;
        let placer = OrderPlacer::new(store.clone());
        let order = placer.place_order(&session("a"), &snapshot, request()).await.unwrap();

        assert!(matches!(placer.order(&session("b"), order.id()).await, Err(CheckoutError::Forbidden)));
        assert!(matches!(placer.order(&session("a"), Uuid::new_v4()).await, Err(CheckoutError::OrderNotFound(_))));

        let update = StatusUpdate { status: Some(OrderStatus::Shipped), payment_status: Some(PaymentStatus::Paid) };
        placer.update_status(order.id(), update).await.unwrap();
        let stored = store.order(order.id()).await.unwrap().unwrap();
        assert_eq!((stored.status(), stored.payment_status()), (OrderStatus::Shipped, PaymentStatus::Paid));
        assert_eq!(stored.totals(), order.totals());

        placer.update_status(order.id(), StatusUpdate { status: Some(OrderStatus::Cancelled), payment_status: None }).await.unwrap();
        let reopen = placer.update_status(order.id(), StatusUpdate { status: Some(OrderStatus::Pending), payment_status: None }).await;
        assert!(matches!(reopen, Err(CheckoutError::InvalidInput(_))));
        assert!(matches!(placer.update_status(order.id(), StatusUpdate::default()).await, Err(CheckoutError::InvalidInput(_))));
    }
}
