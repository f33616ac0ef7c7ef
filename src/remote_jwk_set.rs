use std::{
    task::{Context, Poll},
    time::Duration,
};

use futures::future::BoxFuture;
use http::header::CACHE_CONTROL;
use jsonwebtoken::jwk::JwkSet;
use reqwest::Client;
use tower::{util::BoxCloneSyncService, ServiceBuilder, ServiceExt};
use tower_service::Service;
use url::Url;

use crate::{config::DEFAULT_FETCH_TIMEOUT, Error};

/// A JWK set as returned by the key distribution endpoint.
#[derive(Debug, Clone)]
pub(crate) struct FetchedJwkSet {
    pub(crate) jwk_set: JwkSet,
    /// `max-age` from the response's `Cache-Control` header, if any.
    pub(crate) max_age: Option<Duration>,
}

/// Builder for configuring a `RemoteJwkSet`.
pub(crate) struct RemoteJwkSetBuilder {
    url: Url,
    timeout: Duration,
    http_client: Option<Client>,
}

impl RemoteJwkSetBuilder {
    pub(crate) fn new(url: Url) -> Self {
        Self {
            url,
            timeout: DEFAULT_FETCH_TIMEOUT,
            http_client: None,
        }
    }

    /// Bounds the duration of a single fetch; an elapsed timeout counts as a failed fetch.
    pub(crate) fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub(crate) fn with_http_client(mut self, http_client: Client) -> Self {
        self.http_client = Some(http_client);
        self
    }

    pub(crate) fn build(self) -> RemoteJwkSet {
        let request_service = JwkSetRequestService {
            http_client: self.http_client.unwrap_or_default(),
            url: self.url.clone(),
        };

        let timeout = self.timeout;
        let service_tower = ServiceBuilder::new()
            .map_err(move |err| Error::from_service_error(err, timeout))
            .timeout(timeout)
            .service(request_service);

        RemoteJwkSet {
            url: self.url,
            service_tower: BoxCloneSyncService::new(service_tower),
        }
    }
}

/// Fetches the JWK set from a remote endpoint.
#[derive(Clone)]
pub(crate) struct RemoteJwkSet {
    url: Url,
    service_tower: BoxCloneSyncService<(), FetchedJwkSet, Error>,
}

impl RemoteJwkSet {
    pub(crate) fn builder(url: Url) -> RemoteJwkSetBuilder {
        RemoteJwkSetBuilder::new(url)
    }

    pub(crate) fn url(&self) -> &Url {
        &self.url
    }

    pub(crate) async fn fetch(&self) -> Result<FetchedJwkSet, Error> {
        self.service_tower.clone().oneshot(()).await
    }
}

/// Helper service wrapping a `reqwest::Client` to fetch a JWK Set from a given URL.
#[derive(Clone)]
struct JwkSetRequestService {
    http_client: Client,
    url: Url,
}

impl Service<()> for JwkSetRequestService {
    type Response = FetchedJwkSet;
    type Error = Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: ()) -> Self::Future {
        let http_client = self.http_client.clone();
        let url = self.url.clone();
        Box::pin(async move {
            let response = http_client.get(url).send().await?;

            if !response.status().is_success() {
                return Err(Error::KeySetResponseError {
                    status_code: response.status(),
                });
            }

            let max_age = response
                .headers()
                .get(CACHE_CONTROL)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_max_age);

            let body = response.bytes().await?;
            let jwk_set: JwkSet = serde_json::from_slice(&body)
                .map_err(|err| Error::KeySetParseFailed(err.to_string()))?;

            Ok(FetchedJwkSet { jwk_set, max_age })
        })
    }
}

/// Extracts `max-age` from a `Cache-Control` header value.
fn parse_max_age(cache_control: &str) -> Option<Duration> {
    cache_control.split(',').find_map(|directive| {
        let (name, value) = directive.trim().split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("max-age") {
            return None;
        }
        value
            .trim()
            .trim_matches('"')
            .parse::<u64>()
            .ok()
            .map(Duration::from_secs)
    })
}
