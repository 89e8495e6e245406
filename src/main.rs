use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{
    handler::AppState,
    pipeline::{FfmpegBackend, PipelineController},
};

mod api;
mod config;
mod handler;
mod pipeline;

fn init_logging() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .filter_module("frame_bus", log::LevelFilter::Debug)
        .filter_module("detect_stream", log::LevelFilter::Debug)
        .parse_default_env()
        .init();
}

#[tokio::main]
async fn main() {
    init_logging();
    frame_bus::init().expect("frame_bus init");

    // the server comes up even with a broken configuration; /start reports it
    let (listen, hls_dir) = match config::load() {
        Ok(config) => (config.listen, config.hls_dir),
        Err(e) => {
            log::warn!("config: {:#}", e);
            let defaults = config::Settings::default();
            (defaults.listen, defaults.hls_dir)
        }
    };

    let controller = Arc::new(PipelineController::new(
        Arc::new(FfmpegBackend),
        Arc::new(config::load),
    ));

    let cancel = CancellationToken::new();
    let server = api::start_api_server(
        listen,
        AppState {
            controller: controller.clone(),
            hls_dir,
        },
        cancel.clone(),
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
            },
        }
    }

    controller.stop().await;
    if let Err(e) = server.await {
        log::error!("api: server task failed: {}", e);
    }
}
