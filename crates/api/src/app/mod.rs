//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: pipeline wiring (stores, queue, workers, real-time bus)
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request/response DTOs and JSON mapping helpers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::AppServices;

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub jwt_secret: String,
    /// Required in `x-internal-token` on `/internal/*` when set.
    pub internal_token: Option<String>,
}

impl ApiSettings {
    pub fn new(jwt_secret: impl Into<String>) -> Self {
        Self {
            jwt_secret: jwt_secret.into(),
            internal_token: None,
        }
    }

    pub fn with_internal_token(mut self, token: Option<String>) -> Self {
        self.internal_token = token;
        self
    }
}

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(settings: ApiSettings, services: Arc<AppServices>) -> Router {
    let jwt = Arc::new(bulkjobs_auth::Hs256JwtValidator::new(settings.jwt_secret.into_bytes()));
    let auth_state = middleware::AuthState { jwt };
    let internal_state = middleware::InternalAuthState {
        token: settings.internal_token.map(Arc::from),
    };

    // Protected routes: require a bearer token.
    let protected = routes::router()
        .layer(Extension(services.clone()))
        .layer(axum::middleware::from_fn_with_state(
            auth_state,
            middleware::auth_middleware,
        ));

    // Worker-to-API bridge: shared secret instead of a user token.
    let internal = Router::new()
        .nest("/internal", routes::internal::router())
        .layer(Extension(services))
        .layer(axum::middleware::from_fn_with_state(
            internal_state,
            middleware::internal_auth_middleware,
        ));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(protected)
        .merge(internal)
        .layer(ServiceBuilder::new())
}
