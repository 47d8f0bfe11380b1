//! Authorization gateway in front of the storefront.
//!
//! Every request except `/health` passes the access gate (rate limits,
//! session refresh, admin resolution, CSRF, route classes) before it reaches
//! a gateway endpoint or the upstream pass-through.

pub mod access;
pub mod admin;
pub mod clock;
pub mod config;
pub mod csrf;
pub mod handlers;
pub mod headers;
pub mod logger;
pub mod middleware;
pub mod openapi;
pub mod proxy;
pub mod rate_limit;
pub mod retry;
pub mod routes;
pub mod session;
pub mod state;
pub mod store;

use anyhow::{Context, Result};
use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Request},
    middleware::from_fn_with_state,
    routing::options,
    Router,
};
use secrecy::ExposeSecret;
use sqlx::postgres::PgPoolOptions;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{debug_span, info, Span};
use ulid::Ulid;
use utoipa_swagger_ui::SwaggerUi;

use self::{
    admin::HttpPrivilegeDirectory,
    clock::{Clock, SystemClock},
    config::GatewayConfig,
    handlers::health,
    session::HttpIdentityProvider,
    state::{GatewayState, Stores},
};

const REQUEST_ID: &str = "x-request-id";

/// Build the gateway application around an assembled state.
pub fn router(state: Arc<GatewayState>) -> Router {
    let (gateway, _) = openapi::gateway_router().split_for_parts();
    let gated = gateway
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", openapi::openapi()))
        .fallback(proxy::forward)
        .layer(from_fn_with_state(state.clone(), middleware::gate))
        .with_state(state.clone());

    let (liveness, _) = openapi::health_router().split_for_parts();
    liveness
        .route("/health", options(health::health))
        .with_state(state.clone())
        .fallback_service(gated)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static(REQUEST_ID),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(REQUEST_ID)))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(from_fn_with_state(state, middleware::security_headers))
                // A panicking request answers 500, still with the security headers.
                .layer(CatchPanicLayer::new()),
        )
}

/// Connect the stores and remote services, then serve until interrupted.
///
/// # Errors
/// Returns an error if the configuration is invalid, the store database is
/// unreachable or the server fails to start.
pub async fn new(port: u16, config: GatewayConfig) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let identity = HttpIdentityProvider::new(
        &config.identity().url,
        config.identity().api_key.clone(),
        config.identity_timeout(),
        clock.clone(),
    )
    .context("Failed to build identity provider client")?;
    let directory = HttpPrivilegeDirectory::new(
        &config.privilege().url,
        config.privilege().api_key.clone(),
    )
    .context("Failed to build privilege directory client")?;

    let stores = match config.store_dsn() {
        Some(dsn) => {
            let pool = PgPoolOptions::new()
                .min_connections(1)
                .max_connections(5)
                .max_lifetime(Duration::from_secs(60 * 2))
                .test_before_acquire(true)
                .connect(dsn.expose_secret())
                .await
                .context("Failed to connect to database")?;
            Stores::postgres(pool).await?
        }
        None => Stores::memory(),
    };

    let environment = config.environment();
    let state = Arc::new(GatewayState::new(
        config,
        Arc::new(identity),
        Arc::new(directory),
        stores,
        clock,
    )?);

    let app = router(state);
    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{} ({})", port, environment);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Gracefully shutdown");
        }
    })
    .await?;

    Ok(())
}

// Headers are left out: they carry session tokens.
fn make_span(request: &Request<Body>) -> Span {
    let path = request.uri().path();
    let method = request.method().as_str();
    let request_id = request
        .headers()
        .get(REQUEST_ID)
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");

    debug_span!("http-request", method, path, request_id)
}
