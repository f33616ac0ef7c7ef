//! Key generation, token minting and a mock JWKS endpoint for unit tests.

use std::time::{Duration, SystemTime};

use jsonwebtoken::{
    jwk::{AlgorithmParameters, CommonParameters, Jwk, JwkSet, KeyAlgorithm, RSAKeyParameters, RSAKeyType},
    Algorithm, EncodingKey, Header,
};
use serde_json::{json, Value};
use url::Url;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

use crate::{
    config::{AppCheckConfig, DEFAULT_ISSUER_BASE},
    KeySetCache,
};

pub(crate) const PROJECT_NUMBER: &str = "123";
pub(crate) const APP_ID: &str = "1:123:web:0a1b2c3d4e5f";
pub(crate) const JWKS_PATH: &str = "/v1beta/jwks";

/// An RSA signing key together with its public JWK.
pub(crate) struct TestKey {
    kid: String,
    private_der: Vec<u8>,
    n: Vec<u8>,
    e: Vec<u8>,
}

impl TestKey {
    pub(crate) fn generate(kid: &str) -> Self {
        let rsa = openssl::rsa::Rsa::generate(2048).unwrap();
        Self {
            kid: kid.to_string(),
            private_der: rsa.private_key_to_der().unwrap(),
            n: rsa.n().to_vec(),
            e: rsa.e().to_vec(),
        }
    }

    pub(crate) fn kid(&self) -> &str {
        &self.kid
    }

    pub(crate) fn jwk(&self) -> Jwk {
        Jwk {
            common: CommonParameters {
                key_algorithm: Some(KeyAlgorithm::RS256),
                key_id: Some(self.kid.clone()),
                ..CommonParameters::default()
            },
            algorithm: AlgorithmParameters::RSA(RSAKeyParameters {
                key_type: RSAKeyType::RSA,
                n: base64_url::encode(&self.n),
                e: base64_url::encode(&self.e),
            }),
        }
    }

    pub(crate) fn jwk_set(&self) -> JwkSet {
        JwkSet {
            keys: vec![self.jwk()],
        }
    }

    /// Signs `claims` with this key under a header carrying this key's `kid`.
    pub(crate) fn sign(&self, mut header: Header, claims: &Value) -> String {
        header.kid = Some(self.kid.clone());
        jsonwebtoken::encode(&header, claims, &EncodingKey::from_rsa_der(&self.private_der)).unwrap()
    }

    /// A token that passes every check for [`PROJECT_NUMBER`].
    pub(crate) fn valid_token(&self) -> String {
        self.sign(Header::new(Algorithm::RS256), &valid_claims())
    }
}

pub(crate) fn now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// Claims as issued by App Check for [`PROJECT_NUMBER`].
pub(crate) fn valid_claims() -> Value {
    let issued_at = now();
    json!({
        "iss": format!("{DEFAULT_ISSUER_BASE}{PROJECT_NUMBER}"),
        "sub": APP_ID,
        "aud": [format!("projects/{PROJECT_NUMBER}"), "projects/my-project-id"],
        "iat": issued_at,
        "exp": issued_at + 3600,
    })
}

/// Replaces the compact-serialized header of `token` by `header`, keeping payload and signature.
pub(crate) fn with_raw_header(token: &str, header: &Value) -> String {
    let (_, rest) = token.split_once('.').unwrap();
    format!("{}.{rest}", base64_url::encode(&header.to_string()))
}

/// Replaces the payload of `token` by `claims`, keeping header and signature.
pub(crate) fn with_raw_payload(token: &str, claims: &Value) -> String {
    let mut parts = token.split('.');
    let header = parts.next().unwrap();
    let _payload = parts.next().unwrap();
    let signature = parts.next().unwrap();
    format!(
        "{header}.{}.{signature}",
        base64_url::encode(&claims.to_string())
    )
}

/// Wiremock-backed JWKS endpoint.
pub(crate) struct MockKeyServer {
    server: MockServer,
}

impl MockKeyServer {
    /// Starts a server without any mounted responses.
    pub(crate) async fn empty() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    /// Starts a server that serves `keys` on every request.
    pub(crate) async fn serving(keys: &[&TestKey]) -> Self {
        let server = Self::empty().await;
        server.mount_keys(keys, None, None).await;
        server
    }

    /// Serves `keys`, optionally for a limited number of requests and with an expected number of
    /// hits that is verified when the server is dropped.
    pub(crate) async fn mount_keys(&self, keys: &[&TestKey], times: Option<u64>, expect: Option<u64>) {
        let jwk_set = JwkSet {
            keys: keys.iter().map(|key| key.jwk()).collect(),
        };
        let mut mock = Mock::given(method("GET"))
            .and(path(JWKS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(jwk_set));
        if let Some(times) = times {
            mock = mock.up_to_n_times(times);
        }
        if let Some(expect) = expect {
            mock = mock.expect(expect);
        }
        mock.mount(&self.server).await;
    }

    /// Serves `keys` after a delay of `delay` on every request.
    pub(crate) async fn mount_slow_keys(&self, keys: &[&TestKey], delay: Duration) {
        let jwk_set = JwkSet {
            keys: keys.iter().map(|key| key.jwk()).collect(),
        };
        Mock::given(method("GET"))
            .and(path(JWKS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(jwk_set).set_delay(delay))
            .mount(&self.server)
            .await;
    }

    pub(crate) async fn mount_failure(&self, status: u16) {
        Mock::given(method("GET"))
            .and(path(JWKS_PATH))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.server)
            .await;
    }

    pub(crate) async fn reset(&self) {
        self.server.reset().await;
    }

    pub(crate) async fn request_count(&self) -> usize {
        self.server
            .received_requests()
            .await
            .map(|requests| requests.len())
            .unwrap_or_default()
    }

    pub(crate) fn jwks_url(&self) -> Url {
        Url::parse(&format!("{}{JWKS_PATH}", self.server.uri())).unwrap()
    }

    pub(crate) fn config(&self) -> AppCheckConfig {
        AppCheckConfig::new(PROJECT_NUMBER)
            .unwrap()
            .with_jwks_url(self.jwks_url())
            .with_fetch_timeout(Duration::from_secs(2))
            .unwrap()
    }

    pub(crate) async fn cache(&self) -> KeySetCache {
        KeySetCache::from_config(&self.config()).await.unwrap()
    }
}
