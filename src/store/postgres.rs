//! PostgreSQL backend (sqlx)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::collections::HashMap;
use std::fmt::Display;
use uuid::Uuid;

use super::{CartRepository, CommitError, OrderCommit, OrderRepository, ProductCatalog, StockLevel, StoreError};
use crate::domain::aggregates::{CartLine, Order, OrderHeader, OrderLine, Product, ShippingDetails};
use crate::domain::pricing::Totals;
use crate::domain::value_objects::{ActorIdentity, Stock};
use crate::domain::variant::{BottleTier, CanonicalKey, Variant};
use crate::settings::SettingsStore;

/// Conditional decrement: touches no row unless the product has `$2` units left.
/// Unlimited stock (NULL) always matches and stays NULL.
const DECREMENT_STOCK: &str = "UPDATE products SET \
    stock_quantity = CASE WHEN stock_quantity IS NULL THEN NULL ELSE GREATEST(stock_quantity - $2, 0) END, \
    in_stock = CASE WHEN stock_quantity IS NULL THEN in_stock ELSE stock_quantity - $2 > 0 END, \
    updated_at = NOW() \
    WHERE id = $1 AND (stock_quantity IS NULL OR stock_quantity >= $2) \
    RETURNING stock_quantity";

const ACTOR_MATCH: &str = "user_id IS NOT DISTINCT FROM $2 AND session_id IS NOT DISTINCT FROM $3";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self { Self { pool } }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new().max_connections(max_connections).connect(url).await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool { &self.pool }
}

#[derive(sqlx::FromRow)]
struct ProductRow {
    id: Uuid,
    name: String,
    sku: String,
    price: Decimal,
    sale_price: Option<Decimal>,
    stock_quantity: Option<i32>,
    in_stock: bool,
    is_active: bool,
    is_bottle_based: bool,
    capsules_per_bottle: Option<i32>,
    bottle_pricing_tiers: Json<Vec<BottleTier>>,
    bottles_only: bool,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ProductRow> for Product {
    type Error = StoreError;

    fn try_from(row: ProductRow) -> Result<Self, StoreError> {
        let capsules_per_bottle = row.capsules_per_bottle.map(|c| to_u32(c, "products", row.id)).transpose()?;
        Ok(Product {
            id: row.id, name: row.name, sku: row.sku, price: row.price, sale_price: row.sale_price,
            stock: Stock::from_column(row.stock_quantity), in_stock: row.in_stock, is_active: row.is_active,
            is_bottle_based: row.is_bottle_based, capsules_per_bottle, bottle_pricing_tiers: row.bottle_pricing_tiers.0,
            bottles_only: row.bottles_only, updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CartRow {
    id: Uuid,
    user_id: Option<Uuid>,
    session_id: Option<String>,
    product_id: Uuid,
    quantity: i32,
    price: Decimal,
    variant: Option<Json<Value>>,
    variant_key: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CartRow> for CartLine {
    type Error = StoreError;

    fn try_from(row: CartRow) -> Result<Self, StoreError> {
        let actor = ActorIdentity::resolve(row.user_id, row.session_id).map_err(|e| corrupt("cart_items", row.id, e))?;
        let quantity = to_u32(row.quantity, "cart_items", row.id)?;
        let doc = row.variant.map(|j| j.0).unwrap_or(Value::Null);
        let variant = Variant::from_document(&doc, quantity).map_err(|e| corrupt("cart_items", row.id, e))?;
        Ok(CartLine {
            id: row.id, actor, product_id: row.product_id, quantity, unit_price: row.price, variant,
            variant_key: CanonicalKey::from_stored(row.variant_key), created_at: row.created_at, updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    order_number: String,
    user_id: Option<Uuid>,
    session_id: Option<String>,
    email: String,
    first_name: String,
    last_name: String,
    phone: String,
    address_line_1: String,
    address_line_2: Option<String>,
    city: String,
    state: String,
    postal_code: String,
    country: String,
    payment_method: String,
    health_check: Option<Json<Value>>,
    status: String,
    payment_status: String,
    base_subtotal: Decimal,
    subtotal: Decimal,
    tax: Decimal,
    shipping: Decimal,
    total: Decimal,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for OrderHeader {
    type Error = StoreError;

    fn try_from(row: OrderRow) -> Result<Self, StoreError> {
        let id = row.id;
        Ok(OrderHeader {
            id,
            order_number: row.order_number,
            actor: ActorIdentity::resolve(row.user_id, row.session_id).map_err(|e| corrupt("orders", id, e))?,
            shipping: ShippingDetails {
                email: row.email, first_name: row.first_name, last_name: row.last_name, phone: row.phone,
                address_line_1: row.address_line_1, address_line_2: row.address_line_2, city: row.city, state: row.state,
                postal_code: row.postal_code, country: row.country,
            },
            payment_method: row.payment_method.parse().map_err(|e| corrupt("orders", id, e))?,
            health_check: row.health_check.map(|j| j.0),
            status: row.status.parse().map_err(|e| corrupt("orders", id, e))?,
            payment_status: row.payment_status.parse().map_err(|e| corrupt("orders", id, e))?,
            totals: Totals { base_subtotal: row.base_subtotal, subtotal: row.subtotal, tax: row.tax, shipping: row.shipping, total: row.total },
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OrderItemRow {
    id: Uuid,
    product_id: Uuid,
    product_name: String,
    product_sku: String,
    quantity: i32,
    unit_price: Decimal,
    total: Decimal,
    variant: Option<Json<Value>>,
    stock_units: i32,
}

impl TryFrom<OrderItemRow> for OrderLine {
    type Error = StoreError;

    fn try_from(row: OrderItemRow) -> Result<Self, StoreError> {
        let quantity = to_u32(row.quantity, "order_items", row.id)?;
        let doc = row.variant.map(|j| j.0).unwrap_or(Value::Null);
        Ok(OrderLine {
            id: row.id, product_id: row.product_id, product_name: row.product_name, product_sku: row.product_sku, quantity,
            unit_price: row.unit_price, total: row.total,
            variant: Variant::from_document(&doc, quantity).map_err(|e| corrupt("order_items", row.id, e))?,
            stock_units: to_u32(row.stock_units, "order_items", row.id)?,
        })
    }
}

fn corrupt(table: &str, id: Uuid, detail: impl Display) -> StoreError {
    StoreError::Corrupt(format!("{table} row {id}: {detail}"))
}

fn to_u32(value: i32, table: &str, id: Uuid) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| corrupt(table, id, format!("negative count {value}")))
}

fn to_i32(value: u32, what: &str) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::OutOfRange(format!("{what} {value} does not fit an INTEGER column")))
}

fn variant_column(variant: &Variant) -> Option<Json<Value>> {
    match variant {
        Variant::Plain => None,
        Variant::Bottle(_) => Some(Json(variant.to_document())),
    }
}

fn unique_violation_as_conflict(e: sqlx::Error, what: impl Display) -> StoreError {
    if let sqlx::Error::Database(ref db) = e {
        if db.is_unique_violation() {
            return StoreError::Conflict(what.to_string());
        }
    }
    StoreError::Database(e)
}

#[async_trait]
impl ProductCatalog for PgStore {
    async fn product(&self, id: Uuid) -> Result<Option<Product>, StoreError> {
        let row = sqlx::query_as::<_, ProductRow>("SELECT * FROM products WHERE id = $1").bind(id).fetch_optional(&self.pool).await?;
        row.map(Product::try_from).transpose()
    }

    async fn save_product(&self, p: &Product) -> Result<(), StoreError> {
        let capsules_per_bottle = p.capsules_per_bottle.map(|c| to_i32(c, "capsules_per_bottle")).transpose()?;
        sqlx::query(
            "INSERT INTO products (id, name, sku, price, sale_price, stock_quantity, in_stock, is_active, is_bottle_based, capsules_per_bottle, bottle_pricing_tiers, bottles_only, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
             ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, sku = EXCLUDED.sku, price = EXCLUDED.price, sale_price = EXCLUDED.sale_price, \
             stock_quantity = EXCLUDED.stock_quantity, in_stock = EXCLUDED.in_stock, is_active = EXCLUDED.is_active, \
             is_bottle_based = EXCLUDED.is_bottle_based, capsules_per_bottle = EXCLUDED.capsules_per_bottle, \
             bottle_pricing_tiers = EXCLUDED.bottle_pricing_tiers, bottles_only = EXCLUDED.bottles_only, updated_at = EXCLUDED.updated_at",
        )
        .bind(p.id).bind(&p.name).bind(&p.sku).bind(p.price).bind(p.sale_price).bind(p.stock.to_column()).bind(p.in_stock)
        .bind(p.is_active).bind(p.is_bottle_based).bind(capsules_per_bottle).bind(Json(&p.bottle_pricing_tiers)).bind(p.bottles_only).bind(p.updated_at)
        .execute(&self.pool).await
        .map_err(|e| unique_violation_as_conflict(e, format!("sku {} already exists", p.sku)))?;
        Ok(())
    }

    async fn decrement_stock(&self, id: Uuid, units: u32) -> Result<bool, StoreError> {
        let row: Option<(Option<i32>,)> = sqlx::query_as(DECREMENT_STOCK).bind(id).bind(to_i32(units, "units")?).fetch_optional(&self.pool).await?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl CartRepository for PgStore {
    async fn cart_lines(&self, actor: &ActorIdentity) -> Result<Vec<CartLine>, StoreError> {
        let sql = "SELECT * FROM cart_items WHERE user_id IS NOT DISTINCT FROM $1 AND session_id IS NOT DISTINCT FROM $2 ORDER BY created_at, id";
        let rows = sqlx::query_as::<_, CartRow>(sql).bind(actor.user_id()).bind(actor.session_id()).fetch_all(&self.pool).await?;
        rows.into_iter().map(CartLine::try_from).collect()
    }

    async fn cart_line(&self, id: Uuid) -> Result<Option<CartLine>, StoreError> {
        let row = sqlx::query_as::<_, CartRow>("SELECT * FROM cart_items WHERE id = $1").bind(id).fetch_optional(&self.pool).await?;
        row.map(CartLine::try_from).transpose()
    }

    async fn find_cart_line(&self, actor: &ActorIdentity, product_id: Uuid, key: &CanonicalKey) -> Result<Option<CartLine>, StoreError> {
        let sql = format!("SELECT * FROM cart_items WHERE product_id = $1 AND {ACTOR_MATCH} AND variant_key = $4");
        let row = sqlx::query_as::<_, CartRow>(&sql)
            .bind(product_id).bind(actor.user_id()).bind(actor.session_id()).bind(key.as_str())
            .fetch_optional(&self.pool).await?;
        row.map(CartLine::try_from).transpose()
    }

    async fn save_cart_line(&self, line: &CartLine) -> Result<CartLine, StoreError> {
        let row = sqlx::query_as::<_, CartRow>(
            "INSERT INTO cart_items (id, user_id, session_id, product_id, quantity, price, variant, variant_key, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (id) DO UPDATE SET quantity = EXCLUDED.quantity, price = EXCLUDED.price, variant = EXCLUDED.variant, \
             variant_key = EXCLUDED.variant_key, updated_at = EXCLUDED.updated_at \
             RETURNING *",
        )
        .bind(line.id).bind(line.actor.user_id()).bind(line.actor.session_id()).bind(line.product_id)
        .bind(to_i32(line.quantity, "quantity")?).bind(line.unit_price).bind(variant_column(&line.variant)).bind(line.variant_key.as_str())
        .bind(line.created_at).bind(line.updated_at)
        .fetch_one(&self.pool).await
        .map_err(|e| unique_violation_as_conflict(e, format!("cart already holds product {} with variant {}", line.product_id, line.variant_key)))?;
        CartLine::try_from(row)
    }

    async fn delete_cart_line(&self, actor: &ActorIdentity, id: Uuid) -> Result<bool, StoreError> {
        let sql = format!("DELETE FROM cart_items WHERE id = $1 AND {ACTOR_MATCH}");
        let result = sqlx::query(&sql).bind(id).bind(actor.user_id()).bind(actor.session_id()).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl OrderRepository for PgStore {
    async fn commit_order(&self, commit: OrderCommit<'_>) -> Result<Vec<StockLevel>, CommitError> {
        let order = commit.order;
        let header = order.header();
        let mut tx = self.pool.begin().await?;

        let mut levels = Vec::with_capacity(commit.reservations.len());
        for reservation in commit.reservations {
            let decremented: Option<(Option<i32>,)> = sqlx::query_as(DECREMENT_STOCK)
                .bind(reservation.product_id).bind(to_i32(reservation.units, "units")?)
                .fetch_optional(&mut *tx).await?;
            match decremented {
                Some((remaining,)) => levels.push(StockLevel { product_id: reservation.product_id, remaining: Stock::from_column(remaining) }),
                None => {
                    let current: Option<(Option<i32>,)> = sqlx::query_as("SELECT stock_quantity FROM products WHERE id = $1")
                        .bind(reservation.product_id).fetch_optional(&mut *tx).await?;
                    return Err(match current {
                        None => CommitError::ProductNotFound(reservation.product_id),
                        Some((stock,)) => CommitError::InsufficientStock {
                            product_id: reservation.product_id,
                            available: Stock::from_column(stock).available().unwrap_or(0),
                        },
                    });
                }
            }
        }

        let s = &header.shipping;
        let t = &header.totals;
        sqlx::query(
            "INSERT INTO orders (id, order_number, user_id, session_id, email, first_name, last_name, phone, address_line_1, address_line_2, \
             city, state, postal_code, country, payment_method, health_check, status, payment_status, base_subtotal, subtotal, tax, shipping, total, \
             created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25)",
        )
        .bind(header.id).bind(&header.order_number).bind(header.actor.user_id()).bind(header.actor.session_id())
        .bind(&s.email).bind(&s.first_name).bind(&s.last_name).bind(&s.phone).bind(&s.address_line_1).bind(&s.address_line_2)
        .bind(&s.city).bind(&s.state).bind(&s.postal_code).bind(&s.country)
        .bind(header.payment_method.as_str()).bind(header.health_check.as_ref().map(Json))
        .bind(header.status.as_str()).bind(header.payment_status.as_str())
        .bind(t.base_subtotal).bind(t.subtotal).bind(t.tax).bind(t.shipping).bind(t.total)
        .bind(header.created_at).bind(header.updated_at)
        .execute(&mut *tx).await
        .map_err(|e| unique_violation_as_conflict(e, format!("order number {} already exists", header.order_number)))?;

        for (position, line) in order.lines().iter().enumerate() {
            let position = i32::try_from(position).map_err(|_| StoreError::OutOfRange(format!("order line position {position}")))?;
            sqlx::query(
                "INSERT INTO order_items (id, order_id, position, product_id, product_name, product_sku, quantity, unit_price, total, variant, stock_units) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            )
            .bind(line.id).bind(header.id).bind(position).bind(line.product_id).bind(&line.product_name).bind(&line.product_sku)
            .bind(to_i32(line.quantity, "quantity")?).bind(line.unit_price).bind(line.total).bind(variant_column(&line.variant))
            .bind(to_i32(line.stock_units, "stock_units")?)
            .execute(&mut *tx).await?;
        }

        let sql = format!("DELETE FROM cart_items WHERE id = ANY($1) AND {ACTOR_MATCH}");
        sqlx::query(&sql)
            .bind(commit.cart_line_ids.to_vec()).bind(header.actor.user_id()).bind(header.actor.session_id())
            .execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(levels)
    }

    async fn order(&self, id: Uuid) -> Result<Option<Order>, StoreError> {
        let Some(row) = sqlx::query_as::<_, OrderRow>("SELECT * FROM orders WHERE id = $1").bind(id).fetch_optional(&self.pool).await? else {
            return Ok(None);
        };
        let items = sqlx::query_as::<_, OrderItemRow>("SELECT * FROM order_items WHERE order_id = $1 ORDER BY position")
            .bind(id).fetch_all(&self.pool).await?;
        let lines = items.into_iter().map(OrderLine::try_from).collect::<Result<Vec<_>, _>>()?;
        Ok(Some(Order::restore(OrderHeader::try_from(row)?, lines)))
    }

    async fn save_order_status(&self, order: &Order) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE orders SET status = $2, payment_status = $3, updated_at = $4 WHERE id = $1")
            .bind(order.id()).bind(order.status().as_str()).bind(order.payment_status().as_str()).bind(order.header().updated_at)
            .execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!("order {} does not exist", order.id())));
        }
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for PgStore {
    async fn settings(&self) -> Result<HashMap<String, String>, StoreError> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM settings").fetch_all(&self.pool).await?;
        Ok(rows.into_iter().collect())
    }

    async fn put_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO settings (key, value) VALUES ($1, $2) ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()")
            .bind(key).bind(value).execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::{OrderStatus, PaymentMethod};
    use serde_json::json;

    fn cart_row(variant: Option<Value>, quantity: i32) -> CartRow {
        CartRow {
            id: Uuid::new_v4(), user_id: None, session_id: Some("s-1".into()), product_id: Uuid::new_v4(), quantity,
            price: Decimal::new(13500, 0), variant: variant.map(Json), variant_key: "{\"type\":\"bottle\"}".into(),
            created_at: Utc::now(), updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_cart_row_with_bottle_variant() {
        let doc = json!({"type": "bottle", "tier": {"capsules": 30, "price": 13500}, "bottles": 2, "total_capsules": 60});
        let line = CartLine::try_from(cart_row(Some(doc), 60)).unwrap();
        assert_eq!(line.actor, ActorIdentity::Session("s-1".into()));
        assert_eq!(line.variant.as_bottle().unwrap().bottles, 2);
        assert_eq!(line.base_total(), Decimal::new(27000, 0));
    }

    #[test]
    fn test_corrupt_cart_rows_are_reported() {
        assert!(matches!(CartLine::try_from(cart_row(None, -1)), Err(StoreError::Corrupt(_))));
        let mut row = cart_row(None, 1);
        row.user_id = Some(Uuid::new_v4());
        assert!(matches!(CartLine::try_from(row), Err(StoreError::Corrupt(_))));
        assert!(matches!(CartLine::try_from(cart_row(Some(json!({"size": "L"})), 1)), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_order_row_parses_enums() {
        let row = OrderRow {
            id: Uuid::new_v4(), order_number: "ORD-00000001".into(), user_id: Some(Uuid::new_v4()), session_id: None,
            email: "a@b.co".into(), first_name: "A".into(), last_name: "B".into(), phone: "1".into(), address_line_1: "x".into(),
            address_line_2: None, city: "c".into(), state: "s".into(), postal_code: "p".into(), country: "JP".into(),
            payment_method: "credit_card".into(), health_check: None, status: "shipped".into(), payment_status: "paid".into(),
            base_subtotal: Decimal::ONE, subtotal: Decimal::ONE, tax: Decimal::ZERO, shipping: Decimal::ZERO, total: Decimal::ONE,
            created_at: Utc::now(), updated_at: Utc::now(),
        };
        let header = OrderHeader::try_from(row).unwrap();
        assert_eq!(header.payment_method, PaymentMethod::CreditCard);
        assert_eq!(header.status, OrderStatus::Shipped);
    }

    #[test]
    fn test_plain_variant_is_stored_as_null() {
        assert!(variant_column(&Variant::Plain).is_none());
        assert_eq!(to_i32(u32::MAX, "units").unwrap_err().to_string(), "Value out of range: units 4294967295 does not fit an INTEGER column");
    }
}
