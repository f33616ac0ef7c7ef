use std::task::{Context, Poll};

use axum::extract::{FromRequestParts, Request};
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use http::{HeaderMap, HeaderName};
use tower::Layer;
use tower_service::Service;

use crate::config::{AppCheckConfig, DEFAULT_TOKEN_HEADER};
use crate::verifier::{AppId, TokenVerifier};
use crate::Rejection;

/// `tower` layer that only lets requests through that carry a valid App Check token.
///
/// Verified requests get their [`AppId`] attached as a request extension. All other requests are
/// answered with `401 Unauthorized` and a generic body; the reason is only logged.
#[derive(Clone)]
pub struct AppCheckLayer {
    verifier: TokenVerifier,
    header_name: HeaderName,
}

impl AppCheckLayer {
    /// Reads the token from the `X-Firebase-AppCheck` header.
    pub fn new(verifier: TokenVerifier) -> Self {
        Self {
            verifier,
            header_name: HeaderName::from_static(DEFAULT_TOKEN_HEADER),
        }
    }

    /// Uses the header configured in `config`.
    pub fn from_config(config: &AppCheckConfig, verifier: TokenVerifier) -> Self {
        Self::new(verifier).with_header_name(config.header_name().clone())
    }

    pub fn with_header_name(mut self, header_name: HeaderName) -> Self {
        self.header_name = header_name;
        self
    }
}

impl<S> Layer<S> for AppCheckLayer {
    type Service = AppCheckService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AppCheckService {
            inner,
            verifier: self.verifier.clone(),
            header_name: self.header_name.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AppCheckService<S> {
    inner: S,
    verifier: TokenVerifier,
    header_name: HeaderName,
}

impl<S> Service<Request> for AppCheckService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        // Move the original service into the closure instead of its clone. This makes sure that the original service is
        // `call`ed instead of the cloned one, which might not be ready yet (`poll_ready` hasn't been called on the
        // clone yet).
        // See [docs](https://docs.rs/tower/latest/tower/trait.Service.html#be-careful-when-cloning-inner-services).
        let inner_clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, inner_clone);

        let verifier = self.verifier.clone();
        let token = token_from_headers(req.headers(), &self.header_name);
        Box::pin(async move {
            match verifier.verify(&token).await {
                Ok(app_id) => {
                    req.extensions_mut().insert(app_id);
                    inner.call(req).await
                }
                Err(rejection) => Ok(rejection.into_response()),
            }
        })
    }
}

/// The token header's value; missing and non-UTF-8 values count as no token.
fn token_from_headers(headers: &HeaderMap, header_name: &HeaderName) -> String {
    headers
        .get(header_name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

impl<S> FromRequestParts<S> for AppId
where
    S: Send + Sync,
{
    type Rejection = Rejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AppId>()
            .cloned()
            .ok_or(Rejection::MissingToken)
    }
}
