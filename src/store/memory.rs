//! In-memory backend
//!
//! One mutex guards the whole state, so a commit is trivially atomic: it validates
//! and stages every change on copies and applies them only once nothing can fail.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};

use super::{CartRepository, CommitError, OrderCommit, OrderRepository, ProductCatalog, StockLevel, StoreError};
use crate::domain::aggregates::{CartLine, Order, Product};
use crate::domain::value_objects::ActorIdentity;
use crate::domain::variant::CanonicalKey;
use crate::settings::{SettingsStore, DEFAULT_SETTINGS};

#[derive(Default)]
struct State {
    products: HashMap<Uuid, Product>,
    cart_lines: HashMap<Uuid, CartLine>,
    orders: HashMap<Uuid, Order>,
    settings: HashMap<String, String>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    #[cfg(test)]
    fail_next_commit: AtomicBool,
    #[cfg(test)]
    miss_next_lookup: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    /// Store seeded with the default pricing settings.
    pub fn with_default_settings() -> Self {
        let settings = DEFAULT_SETTINGS.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        Self { state: Mutex::new(State { settings, ..State::default() }), ..Self::default() }
    }

    /// Makes the next commit fail after its stock checks pass.
    #[cfg(test)]
    pub(crate) fn fail_next_commit(&self) { self.fail_next_commit.store(true, Ordering::SeqCst); }

    #[cfg(test)]
    fn injected_failure(&self) -> Result<(), StoreError> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected commit failure".into()));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn injected_failure(&self) -> Result<(), StoreError> { Ok(()) }

    /// Makes the next `find_cart_line` report nothing, as if a concurrent add had
    /// not landed yet.
    #[cfg(test)]
    pub(crate) fn miss_next_lookup(&self) { self.miss_next_lookup.store(true, Ordering::SeqCst); }

    #[cfg(test)]
    fn lookup_missed(&self) -> bool { self.miss_next_lookup.swap(false, Ordering::SeqCst) }

    #[cfg(not(test))]
    fn lookup_missed(&self) -> bool { false }
}

/// Conditional decrement shared by `decrement_stock` and `commit_order`.
fn take_stock(product: &mut Product, units: u32) -> bool {
    if !product.stock.admits(units) {
        return false;
    }
    product.remove_inventory(units);
    true
}

fn without_events(order: &Order) -> Order { Order::restore(order.header().clone(), order.lines().to_vec()) }

#[async_trait]
impl ProductCatalog for MemoryStore {
    async fn product(&self, id: Uuid) -> Result<Option<Product>, StoreError> {
        Ok(self.state.lock().await.products.get(&id).cloned())
    }

    async fn save_product(&self, product: &Product) -> Result<(), StoreError> {
        self.state.lock().await.products.insert(product.id, product.clone());
        Ok(())
    }

    async fn decrement_stock(&self, id: Uuid, units: u32) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state.products.get_mut(&id).is_some_and(|product| take_stock(product, units)))
    }
}

#[async_trait]
impl CartRepository for MemoryStore {
    async fn cart_lines(&self, actor: &ActorIdentity) -> Result<Vec<CartLine>, StoreError> {
        let state = self.state.lock().await;
        let mut lines: Vec<CartLine> = state.cart_lines.values().filter(|l| l.belongs_to(actor)).cloned().collect();
        lines.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(lines)
    }

    async fn cart_line(&self, id: Uuid) -> Result<Option<CartLine>, StoreError> {
        Ok(self.state.lock().await.cart_lines.get(&id).cloned())
    }

    async fn find_cart_line(&self, actor: &ActorIdentity, product_id: Uuid, key: &CanonicalKey) -> Result<Option<CartLine>, StoreError> {
        if self.lookup_missed() {
            return Ok(None);
        }
        let state = self.state.lock().await;
        Ok(state.cart_lines.values().find(|l| l.belongs_to(actor) && l.product_id == product_id && &l.variant_key == key).cloned())
    }

    async fn save_cart_line(&self, line: &CartLine) -> Result<CartLine, StoreError> {
        let mut state = self.state.lock().await;
        let clash = state.cart_lines.values().any(|l| {
            l.id != line.id && l.actor == line.actor && l.product_id == line.product_id && l.variant_key == line.variant_key
        });
        if clash {
            return Err(StoreError::Conflict(format!("cart already holds product {} with variant {}", line.product_id, line.variant_key)));
        }
        state.cart_lines.insert(line.id, line.clone());
        Ok(line.clone())
    }

    async fn delete_cart_line(&self, actor: &ActorIdentity, id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if !state.cart_lines.get(&id).is_some_and(|l| l.belongs_to(actor)) { return Ok(false); }
        Ok(state.cart_lines.remove(&id).is_some())
    }
}

#[async_trait]
impl OrderRepository for MemoryStore {
    async fn commit_order(&self, commit: OrderCommit<'_>) -> Result<Vec<StockLevel>, CommitError> {
        let mut state = self.state.lock().await;

        let mut staged = Vec::with_capacity(commit.reservations.len());
        for reservation in commit.reservations {
            let mut product = state.products.get(&reservation.product_id).cloned().ok_or(CommitError::ProductNotFound(reservation.product_id))?;
            if !take_stock(&mut product, reservation.units) {
                return Err(CommitError::InsufficientStock { product_id: product.id, available: product.stock.available().unwrap_or(0) });
            }
            staged.push(product);
        }
        self.injected_failure()?;

        let levels = staged.iter().map(|p| StockLevel { product_id: p.id, remaining: p.stock }).collect();
        for product in staged {
            state.products.insert(product.id, product);
        }
        let actor = commit.order.actor().clone();
        for id in commit.cart_line_ids {
            if state.cart_lines.get(id).is_some_and(|l| l.belongs_to(&actor)) {
                state.cart_lines.remove(id);
            }
        }
        state.orders.insert(commit.order.id(), without_events(commit.order));
        Ok(levels)
    }

    async fn order(&self, id: Uuid) -> Result<Option<Order>, StoreError> {
        Ok(self.state.lock().await.orders.get(&id).map(without_events))
    }

    async fn save_order_status(&self, order: &Order) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let stored = state.orders.get_mut(&order.id()).ok_or_else(|| StoreError::Conflict(format!("order {} does not exist", order.id())))?;
        let mut header = stored.header().clone();
        header.status = order.status();
        header.payment_status = order.payment_status();
        header.updated_at = order.header().updated_at;
        *stored = Order::restore(header, stored.lines().to_vec());
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn settings(&self) -> Result<HashMap<String, String>, StoreError> {
        Ok(self.state.lock().await.settings.clone())
    }

    async fn put_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.state.lock().await.settings.insert(key.to_string(), value.to_string());
        Ok(())
    }
}
