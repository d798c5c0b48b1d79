use std::{iter::once, net::SocketAddr, sync::Arc};

use {
    anyhow::Context,
    axum::{
        Router,
        http::header,
        middleware,
        routing::{get, post},
    },
    bambooclaw_config::GatewayConfig,
    tokio::net::TcpListener,
    tokio_util::sync::CancellationToken,
    tower_http::{
        limit::RequestBodyLimitLayer, sensitive_headers::SetSensitiveRequestHeadersLayer,
        trace::TraceLayer,
    },
    tracing::info,
};

use crate::{auth_middleware::require_bearer, routes, state::GatewayState};

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(state: Arc<GatewayState>) -> Router {
    let protected = Router::new()
        .route("/webhook", post(routes::webhook))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_bearer,
        ));

    Router::new()
        .route("/health", get(routes::health))
        .route("/pair", post(routes::pair))
        .merge(protected)
        .layer(RequestBodyLimitLayer::new(state.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(SetSensitiveRequestHeadersLayer::new(once(
            header::AUTHORIZATION,
        )))
        .with_state(state)
}

/// A bound but not yet serving gateway.
pub struct GatewayServer {
    listener: TcpListener,
    state: Arc<GatewayState>,
}

impl GatewayServer {
    /// Bind `config.host:config.port`. Non-loopback hosts need
    /// `allow_public_bind`.
    pub async fn bind(config: &GatewayConfig, state: Arc<GatewayState>) -> anyhow::Result<Self> {
        state.gate.check_bind(&config.host)?;
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .with_context(|| format!("binding gateway to {}:{}", config.host, config.port))?;
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `cancel` fires, then drain in-flight requests.
    pub async fn serve(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let addr = self.local_addr()?;
        let app = build_gateway_app(self.state);
        info!(%addr, "gateway listening");
        axum::serve(
            self.listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
        info!("gateway stopped");
        Ok(())
    }
}
