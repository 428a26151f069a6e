//! HTTP surface
//!
//! The caller's identity arrives in `x-user-id` (a UUID) or `x-session-id`,
//! exactly one of them. How those are authenticated is the gateway's business.

use axum::async_trait;
use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domain::events::CheckoutEvent;
use crate::domain::value_objects::ActorIdentity;
use crate::services::{AddItem, CartService, Checkout, CheckoutAssembler, OrderPlacer, PlaceOrderRequest, StatusUpdate, UpdateItem};
use crate::store::CommerceStore;
use crate::{CheckoutError, Result};

pub const USER_HEADER: &str = "x-user-id";
pub const SESSION_HEADER: &str = "x-session-id";

#[derive(Clone)]
pub struct AppState {
    pub carts: CartService,
    pub checkout: CheckoutAssembler,
    pub orders: OrderPlacer,
    pub nats: Option<async_nats::Client>,
}

impl AppState {
    pub fn new(store: Arc<dyn CommerceStore>, nats: Option<async_nats::Client>) -> Self {
        Self {
            carts: CartService::new(store.clone()),
            checkout: CheckoutAssembler::new(store.clone()),
            orders: OrderPlacer::new(store),
            nats,
        }
    }

    async fn publish(&self, events: Vec<CheckoutEvent>) {
        for event in events {
            let payload = match serde_json::to_vec(&event) {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, subject = event.subject(), "Failed to encode event");
                    continue;
                }
            };
            match &self.nats {
                Some(client) => {
                    if let Err(e) = client.publish(event.subject().to_string(), payload.into()).await {
                        warn!(error = %e, subject = event.subject(), "Failed to publish event");
                    }
                }
                None => info!(subject = event.subject(), payload = %String::from_utf8_lossy(&payload), "Checkout event"),
            }
        }
    }
}

/// The requesting actor.
pub struct Actor(pub ActorIdentity);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Actor {
    type Rejection = CheckoutError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> std::result::Result<Self, Self::Rejection> {
        let header = |name: &str| parts.headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);
        let user_id = header(USER_HEADER)
            .map(|raw| Uuid::parse_str(raw.trim()).map_err(|_| CheckoutError::InvalidInput(format!("{USER_HEADER} must be a UUID"))))
            .transpose()?;
        Ok(Self(ActorIdentity::resolve(user_id, header(SESSION_HEADER))?))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { Json(json!({"status": "healthy", "service": "storefront-checkout"})) }))
        .route("/api/v1/cart", get(cart_summary).post(add_to_cart))
        .route("/api/v1/cart/count", get(cart_count))
        .route("/api/v1/cart/:line_id", put(update_cart_line).delete(remove_cart_line))
        .route("/api/v1/checkout", get(checkout_summary))
        .route("/api/v1/orders", post(place_order))
        .route("/api/v1/orders/:id", get(get_order))
        .route("/api/v1/admin/orders/:id/status", put(update_order_status))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn cart_summary(State(s): State<AppState>, Actor(actor): Actor) -> Result<impl IntoResponse> {
    Ok(Json(s.checkout.cart_summary(&actor).await?))
}

async fn add_to_cart(State(s): State<AppState>, Actor(actor): Actor, Json(r): Json<AddItem>) -> Result<impl IntoResponse> {
    Ok((StatusCode::CREATED, Json(s.carts.add_item(&actor, r).await?)))
}

async fn cart_count(State(s): State<AppState>, Actor(actor): Actor) -> Result<impl IntoResponse> {
    Ok(Json(json!({"count": s.carts.count(&actor).await?})))
}

async fn update_cart_line(State(s): State<AppState>, Actor(actor): Actor, Path(line_id): Path<Uuid>, Json(r): Json<UpdateItem>) -> Result<impl IntoResponse> {
    Ok(Json(s.carts.update_item(&actor, line_id, r).await?))
}

async fn remove_cart_line(State(s): State<AppState>, Actor(actor): Actor, Path(line_id): Path<Uuid>) -> Result<StatusCode> {
    s.carts.remove_item(&actor, line_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn checkout_summary(State(s): State<AppState>, Actor(actor): Actor) -> Result<impl IntoResponse> {
    match s.checkout.build_snapshot(&actor).await? {
        Checkout::Ready(snapshot) => Ok(Json(snapshot)),
        Checkout::Empty => Err(CheckoutError::EmptyCart),
    }
}

/// Re-assembles the checkout from the live cart and places it.
async fn place_order(State(s): State<AppState>, Actor(actor): Actor, Json(r): Json<PlaceOrderRequest>) -> Result<impl IntoResponse> {
    let Checkout::Ready(snapshot) = s.checkout.build_snapshot(&actor).await? else {
        return Err(CheckoutError::EmptyCart);
    };
    let mut order = s.orders.place_order(&actor, &snapshot, r).await?;
    s.publish(order.take_events()).await;
    Ok((StatusCode::CREATED, Json(order)))
}

async fn get_order(State(s): State<AppState>, Actor(actor): Actor, Path(id): Path<Uuid>) -> Result<impl IntoResponse> {
    Ok(Json(s.orders.order(&actor, id).await?))
}

async fn update_order_status(State(s): State<AppState>, Path(id): Path<Uuid>, Json(r): Json<StatusUpdate>) -> Result<impl IntoResponse> {
    let mut order = s.orders.update_status(id, r).await?;
    s.publish(order.take_events()).await;
    Ok(Json(order))
}

impl CheckoutError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::OutOfStock { .. } | Self::InsufficientStock { .. } | Self::CartChanged { .. } => StatusCode::CONFLICT,
            Self::VariantRequired { .. } | Self::EmptyCart => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::ProductNotFound(_) | Self::CartLineNotFound(_) | Self::OrderNotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::OutOfStock { .. } => "out_of_stock",
            Self::InsufficientStock { .. } => "insufficient_stock",
            Self::VariantRequired { .. } => "variant_required",
            Self::Forbidden => "forbidden",
            Self::CartChanged { .. } => "cart_changed",
            Self::EmptyCart => "empty_cart",
            Self::ProductNotFound(_) => "product_not_found",
            Self::CartLineNotFound(_) => "cart_line_not_found",
            Self::OrderNotFound(_) => "order_not_found",
            Self::InvalidInput(_) => "invalid_input",
            Self::Persistence(_) => "persistence_failure",
        }
    }
}

impl IntoResponse for CheckoutError {
    fn into_response(self) -> Response {
        let message = match &self {
            Self::Persistence(e) => {
                error!(error = %e, "Request failed on storage");
                "Something went wrong on our side. Please try again.".to_string()
            }
            other => other.to_string(),
        };
        let mut body = json!({"error": self.code(), "message": message});
        match &self {
            Self::InsufficientStock { product_id, available, .. } => {
                body["product_id"] = json!(product_id);
                body["available"] = json!(available);
            }
            Self::OutOfStock { product_id } | Self::VariantRequired { product_id } => body["product_id"] = json!(product_id),
            Self::CartChanged { dropped } => body["dropped"] = json!(dropped),
            _ => {}
        }
        (self.status(), Json(body)).into_response()
    }
}
