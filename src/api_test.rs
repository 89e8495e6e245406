use std::sync::Arc;

use serde_json::Value;
use tokio::net::TcpListener;

use super::router;
use crate::{
    handler::AppState,
    pipeline::{
        PipelineController, PipelineState,
        testing::{RecordingLauncher, ScriptedSource, TestBackend, loader, segmented_settings},
    },
};

async fn serve(state: AppState) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{}", addr)
}

async fn post(client: &reqwest::Client, url: String) -> Value {
    let response = client.post(url).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    response.json().await.unwrap()
}

#[tokio::test]
async fn test_start_stop_status() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = RecordingLauncher::default();
    let backend = TestBackend {
        source: ScriptedSource::live(&[]),
        launcher: launcher.clone(),
    };
    let controller = Arc::new(PipelineController::new(
        Arc::new(backend),
        loader(segmented_settings(dir.path())),
    ));
    let base = serve(AppState {
        controller: controller.clone(),
        hls_dir: dir.path().to_path_buf(),
    })
    .await;
    let client = reqwest::Client::new();

    assert_eq!(post(&client, format!("{}/start", base)).await["status"], "started");
    assert_eq!(
        post(&client, format!("{}/start", base)).await["status"],
        "already streaming"
    );

    tokio::time::timeout(
        std::time::Duration::from_secs(5),
        controller.wait_for(|s| s == PipelineState::Running),
    )
    .await
    .unwrap();
    let status: Value = client
        .get(format!("{}/status", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["state"], "Running");
    assert_eq!(status["sessions"], 1);

    assert_eq!(post(&client, format!("{}/stop", base)).await["status"], "stopped");
    assert_eq!(post(&client, format!("{}/stop", base)).await["status"], "stopped");
    assert_eq!(controller.state(), PipelineState::Stopped);
    assert_eq!(launcher.running(), 0);
}

#[tokio::test]
async fn test_start_reports_configuration_errors() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = segmented_settings(dir.path());
    settings.hls_segments = 0;
    let backend = TestBackend {
        source: ScriptedSource::live(&[]),
        launcher: RecordingLauncher::default(),
    };
    let controller = Arc::new(PipelineController::new(Arc::new(backend), loader(settings)));
    let base = serve(AppState {
        controller,
        hls_dir: dir.path().to_path_buf(),
    })
    .await;

    let body = post(&reqwest::Client::new(), format!("{}/start", base)).await;
    assert_eq!(body["status"], "failed");
    assert!(body["error"].as_str().unwrap().contains("segment"));
}

#[tokio::test]
async fn test_cors_preflight() {
    let dir = tempfile::tempdir().unwrap();
    let backend = TestBackend {
        source: ScriptedSource::live(&[]),
        launcher: RecordingLauncher::default(),
    };
    let controller = Arc::new(PipelineController::new(
        Arc::new(backend),
        loader(segmented_settings(dir.path())),
    ));
    let base = serve(AppState {
        controller,
        hls_dir: dir.path().to_path_buf(),
    })
    .await;

    let response = reqwest::Client::new()
        .request(reqwest::Method::OPTIONS, format!("{}/start", base))
        .header("Origin", "http://player.local")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);
    assert_eq!(
        response.headers()["access-control-allow-origin"],
        "http://player.local"
    );

    let response = reqwest::get(format!("{}/status", base)).await.unwrap();
    assert_eq!(response.headers()["access-control-allow-origin"], "*");
}

#[tokio::test]
async fn test_hls_follows_session_output_dir() {
    let boot_dir = tempfile::tempdir().unwrap();
    let session_dir = tempfile::tempdir().unwrap();
    std::fs::write(boot_dir.path().join("old.m3u8"), "#EXTM3U\n").unwrap();
    let backend = TestBackend {
        source: ScriptedSource::live(&[]),
        launcher: RecordingLauncher::default(),
    };
    let controller = Arc::new(PipelineController::new(
        Arc::new(backend),
        loader(segmented_settings(session_dir.path())),
    ));
    let base = serve(AppState {
        controller: controller.clone(),
        hls_dir: boot_dir.path().to_path_buf(),
    })
    .await;

    let before = reqwest::get(format!("{}/hls/old.m3u8", base)).await.unwrap();
    assert_eq!(before.status(), reqwest::StatusCode::OK);

    let client = reqwest::Client::new();
    assert_eq!(post(&client, format!("{}/start", base)).await["status"], "started");
    tokio::time::timeout(
        std::time::Duration::from_secs(5),
        controller.wait_for(|s| s == PipelineState::Running),
    )
    .await
    .unwrap();
    std::fs::write(session_dir.path().join("stream.m3u8"), "#EXTM3U\n").unwrap();

    let current = reqwest::get(format!("{}/hls/stream.m3u8", base)).await.unwrap();
    assert_eq!(current.status(), reqwest::StatusCode::OK);
    let stale = reqwest::get(format!("{}/hls/old.m3u8", base)).await.unwrap();
    assert_eq!(stale.status(), reqwest::StatusCode::NOT_FOUND);

    post(&client, format!("{}/stop", base)).await;
}
