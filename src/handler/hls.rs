use std::path::{Component, Path, PathBuf};

use axum::{
    Router,
    extract::{Path as UrlPath, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};

use crate::handler::{ApiResult, AppState};

pub fn hls_router() -> Router<AppState> {
    Router::new().route("/{*file}", get(serve))
}

async fn serve(
    State(app): State<AppState>,
    UrlPath(file): UrlPath<String>,
) -> ApiResult<Response> {
    let Some(path) = resolve(&app.output_dir(), &file) else {
        return Ok((StatusCode::BAD_REQUEST, "invalid path").into_response());
    };

    let body = match tokio::fs::read(&path).await {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(StatusCode::NOT_FOUND.into_response());
        }
        Err(e) => return Err(anyhow::anyhow!("read {}: {}", path.display(), e).into()),
    };

    let content_type = content_type(&path);
    // the playlist is rewritten every segment
    let cache = if content_type == PLAYLIST {
        "no-cache"
    } else {
        "max-age=60"
    };
    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, cache),
        ],
        body,
    )
        .into_response())
}

const PLAYLIST: &str = "application/vnd.apple.mpegurl";

/// Joins `file` under `dir`, refusing anything that could leave it.
pub fn resolve(dir: &Path, file: &str) -> Option<PathBuf> {
    let relative = Path::new(file);
    if file.is_empty() || file.contains('\\') {
        return None;
    }
    if !relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        return None;
    }
    Some(dir.join(relative))
}

pub fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("m3u8") => PLAYLIST,
        Some("ts") => "video/mp2t",
        Some("m4s") => "video/iso.segment",
        Some("mp4") => "video/mp4",
        Some("vtt") => "text/vtt",
        _ => "application/octet-stream",
    }
}
