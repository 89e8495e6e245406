use axum::{Router, middleware};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::handler::{self, AppState};

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .merge(handler::stream::stream_router())
        .nest("/hls", handler::hls::hls_router())
        .with_state(state)
        .merge(stream_dashboard::app_router(None))
        .layer(middleware::from_fn(handler::cors))
}

pub(crate) fn start_api_server(
    listen: String,
    state: AppState,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(state);

        let listener = match TcpListener::bind(&listen).await {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("api: failed to bind {}: {}", listen, e);
                cancel.cancel();
                return;
            }
        };
        log::info!("api: listening on {}", listen);
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(cancel))
            .await
        {
            log::error!("api: server error: {}", e);
        }
    })
}

async fn shutdown_signal(cancel: CancellationToken) {
    cancel.cancelled().await;
    log::info!("api: shutting down");
}

#[cfg(test)]
#[path = "api_test.rs"]
mod api_test;
