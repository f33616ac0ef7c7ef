use std::time::Duration;

use axum::{
    response::{IntoResponse, Response},
    Json,
};
use http::StatusCode;
use serde_json::json;

/// Infrastructure errors raised while configuring the gate or maintaining the key set.
#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to fetch JWK set")]
    KeySetFetchFailed(#[from] reqwest::Error),
    #[error("fetching JWK set timed out after {0:?}")]
    KeySetFetchTimeout(Duration),
    #[error("received error response when fetching JWK set: {status_code}")]
    KeySetResponseError { status_code: StatusCode },
    #[error("failed to parse JWK set: {0}")]
    KeySetParseFailed(String),
    #[error("key set cache has already been shut down")]
    AlreadyShutDown,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// An error of unexpected type from a layer of the fetch service stack. The layers in use only
    /// produce timeouts and [`Error`]s, so this is reserved for layers added later.
    #[error("key set service failed")]
    Service(#[source] tower::BoxError),
}

impl Error {
    /// Converts the boxed error coming out of the fetch service stack back into an [`Error`].
    pub(crate) fn from_service_error(err: tower::BoxError, timeout: Duration) -> Self {
        if err.is::<tower::timeout::error::Elapsed>() {
            return Error::KeySetFetchTimeout(timeout);
        }
        match err.downcast::<Error>() {
            Ok(err) => *err,
            Err(err) => Error::Service(err),
        }
    }
}

/// Reason an App Check token was not accepted.
///
/// Rejections are terminal for the request. The reason is logged server-side; callers only ever
/// see the generic response produced by [`IntoResponse`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    #[error("no token found")]
    MissingToken,
    #[error("token is malformed")]
    MalformedToken,
    #[error("token is signed with an unknown key")]
    UnknownKey,
    #[error("token signature is invalid")]
    InvalidSignature,
    #[error("token has expired")]
    Expired,
    #[error("token is not valid yet")]
    NotYetValid,
    #[error("invalid algorithm")]
    InvalidAlgorithm,
    #[error("invalid type")]
    InvalidType,
    #[error("invalid audience")]
    InvalidAudience,
    #[error("invalid issuer")]
    InvalidIssuer,
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": "Unauthorized",
        }));
        (StatusCode::UNAUTHORIZED, body).into_response()
    }
}
