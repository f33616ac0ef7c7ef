//! Serves a list of tags to apps presenting a valid App Check token.
//!
//! ```sh
//! PROJECT_NUMBER=123456789 RUST_LOG=info cargo run --example tags
//! curl -H "X-Firebase-AppCheck: $TOKEN" http://localhost:8080/
//! ```

use axum::{routing::get, Json, Router};
use axum_app_check::{AppCheckConfig, AppCheckLayer, AppId, KeySetCacheBuilder, TokenVerifier};
use serde::Serialize;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Serialize)]
struct Tag {
    id: &'static str,
    name: &'static str,
}

const TAGS: [Tag; 3] = [
    Tag { id: "1", name: "Blue" },
    Tag { id: "2", name: "Red" },
    Tag { id: "3", name: "Green" },
];

async fn get_tags(app_id: AppId) -> Json<Value> {
    Json(json!({ "data": TAGS, "app": app_id.as_str() }))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppCheckConfig::from_env()?;
    let keys = KeySetCacheBuilder::from_config(&config)
        .with_refresh_error_handler(|err| tracing::error!(error = %err, "JWKS refresh failed"))
        .build()
        .await?;
    let verifier = TokenVerifier::new(&config, keys.clone());

    let router = Router::new()
        .route("/", get(get_tags))
        .layer(AppCheckLayer::from_config(&config, verifier));

    let listener = tokio::net::TcpListener::bind("localhost:8080").await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    keys.shutdown().await?;
    Ok(())
}
