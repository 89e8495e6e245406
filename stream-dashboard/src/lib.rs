//! Static player page served next to the control API.

use axum::Router;
use axum_embed::{FallbackBehavior, ServeEmbed};
use rust_embed::RustEmbed;

#[derive(RustEmbed, Clone)]
#[folder = "app/dist/"]
struct PlayerAssets;

/// Serves the embedded player under `prefix`, or as the fallback of the
/// whole router when no prefix is given.
pub fn app_router(prefix: Option<&str>) -> Router {
    let assets = ServeEmbed::<PlayerAssets>::with_parameters(
        Some("index.html".to_string()),
        FallbackBehavior::Ok,
        Some("index.html".to_string()),
    );

    match prefix {
        Some(prefix) => Router::new().nest_service(prefix, assets),
        None => Router::new().fallback_service(assets),
    }
}
