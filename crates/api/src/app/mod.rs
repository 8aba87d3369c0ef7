//! HTTP application wiring (Axum router + job services).
//!
//! - `services.rs`: the job subsystem shared by handlers and the worker
//! - `routes/`: HTTP handlers, one file per surface
//! - `dto.rs`: request/response bodies
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use costwise_auth::Hs256JwtValidator;
use costwise_infra::jobs::JobStore;

use crate::config::ApiConfig;
use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router (used by `main.rs` and the black-box tests).
pub fn build_app<S: JobStore>(config: &ApiConfig, services: Arc<services::JobServices<S>>) -> Router {
    let jwt = Arc::new(Hs256JwtValidator::new(config.jwt_secret.clone().into_bytes()));
    let auth_state = middleware::AuthState { jwt };

    // Protected routes: require a bearer token carrying the tenant.
    let protected = routes::router::<S>().layer(axum::middleware::from_fn_with_state(
        auth_state,
        middleware::auth_middleware,
    ));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::internal::router::<S>())
        .merge(protected)
        .layer(
            ServiceBuilder::new()
                .layer(Extension(services))
                .layer(Extension(routes::internal::InternalSecret::new(
                    config.internal_secret.clone(),
                ))),
        )
}
