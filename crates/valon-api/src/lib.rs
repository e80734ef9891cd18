//! HTTP plane: the endpoint-update API peers call to publish themselves.

pub mod handlers;

use std::net::SocketAddr;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::timeout::TimeoutLayer;

pub use handlers::ApiState;

/// Per-request deadline; a stuck KV write must not pin a connection.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn serve(state: ApiState, listener: TcpListener) -> anyhow::Result<()> {
    let app = Router::new()
        .route(
            "/api/endpoint",
            post(handlers::handle_endpoint_update)
                .fallback(handlers::handle_method_not_allowed),
        )
        .route(
            "/api/endpoint/delete",
            post(handlers::handle_endpoint_delete)
                .delete(handlers::handle_endpoint_delete)
                .fallback(handlers::handle_method_not_allowed),
        )
        .route(
            "/health",
            get(handlers::handle_health).fallback(handlers::handle_method_not_allowed),
        )
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state);

    tracing::info!(addr = %listener.local_addr()?, "endpoint api listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
