//! App Check token verification [middleware for `axum`](https://docs.rs/axum/latest/axum/middleware/index.html).
//!
//! ## Overview
//!
//! Clients attest their authenticity by sending a short-lived, signed App Check token in the
//! `X-Firebase-AppCheck` header. The token is a [JSON Web Token (JWT)](https://datatracker.ietf.org/doc/html/rfc7519)
//! signed with one of the keys published as a [JWK set](https://datatracker.ietf.org/doc/html/rfc7517) at
//! `https://firebaseappcheck.googleapis.com/v1beta/jwks`. Those keys rotate, so they are fetched at startup, kept in
//! memory and refreshed periodically.
//!
//! This crate provides:
//!
//! - **[`KeySetCache`]**: the published keys, fetched once at startup and refreshed every 6 hours (by default) in the
//!   background. A token signed with an unknown key ID triggers one additional refresh. A failed refresh keeps the
//!   previous keys.
//! - **[`TokenVerifier`]**: checks the signature, the validity window, the header's `alg` and `typ`, the audience
//!   (`projects/<project number>`) and the issuer of a token and returns the attested [`AppId`], or the
//!   [`Rejection`] reason.
//! - **[`AppCheckLayer`]**: a `tower` layer that rejects requests without a valid token with `401 Unauthorized` and
//!   makes the [`AppId`] available to handlers.
//!
//! ## Quickstart
//!
//! ```rust,no_run
//! use axum::{routing::get, Router};
//! use axum_app_check::{AppCheckConfig, AppCheckLayer, AppId, KeySetCache, TokenVerifier};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Reads `PROJECT_NUMBER` and optional overrides from the environment.
//!     let config = AppCheckConfig::from_env()?;
//!
//!     // Fails if the keys cannot be fetched.
//!     let keys = KeySetCache::from_config(&config).await?;
//!     let verifier = TokenVerifier::new(&config, keys.clone());
//!
//!     let router = Router::new()
//!         .route("/", get(|app_id: AppId| async move { format!("Hello, app #{app_id}") }))
//!         .layer(AppCheckLayer::from_config(&config, verifier));
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//!     axum::serve(listener, router).await?;
//!
//!     keys.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod authorization;
pub mod config;

pub use authorization::AppCheckLayer;
pub use config::AppCheckConfig;
pub use error::{Error, Rejection};
pub use jwk_set::KeySet;
pub use jwks_cache::{KeySetCache, KeySetCacheBuilder, RefreshErrorHandler};
pub use verifier::{issuer_matches, AppId, TokenVerifier};

mod error;
mod jwk_set;
mod jwks_cache;
mod remote_jwk_set;
mod verifier;

#[cfg(test)]
mod testutil;
