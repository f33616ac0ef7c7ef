use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, SystemTime},
};

use jsonwebtoken::{jwk::JwkSet, DecodingKey};
use url::Url;

use crate::Error;

/// An immutable snapshot of the signing keys published at a JWKS endpoint.
///
/// A new snapshot is built for every successful fetch and swapped in as a whole; a snapshot is never
/// modified after construction.
#[derive(Clone)]
pub struct KeySet {
    keys: HashMap<String, Arc<DecodingKey>>,
    source: Url,
    fetched_at: SystemTime,
    refresh_interval: Duration,
    time_to_live: Duration,
    generation: u64,
}

impl KeySet {
    /// Builds a snapshot from a fetched JWK set.
    ///
    /// Keys without a `kid` or whose parameters cannot be turned into a decoding key are skipped.
    /// Fails if no usable key remains.
    pub(crate) fn from_jwk_set(
        jwk_set: &JwkSet,
        source: Url,
        refresh_interval: Duration,
        max_age: Option<Duration>,
        generation: u64,
    ) -> Result<Self, Error> {
        let mut keys = HashMap::with_capacity(jwk_set.keys.len());
        for jwk in &jwk_set.keys {
            let Some(kid) = jwk.common.key_id.as_deref() else {
                tracing::warn!(%source, "skipping JWK without kid");
                continue;
            };
            match DecodingKey::from_jwk(jwk) {
                Ok(key) => {
                    keys.insert(kid.to_string(), Arc::new(key));
                }
                Err(err) => {
                    tracing::warn!(%source, kid, error = %err, "skipping unusable JWK");
                }
            }
        }

        if keys.is_empty() {
            return Err(Error::KeySetParseFailed(
                "JWK set contains no usable keys".to_string(),
            ));
        }

        Ok(Self {
            keys,
            source,
            fetched_at: SystemTime::now(),
            refresh_interval,
            time_to_live: max_age.unwrap_or(refresh_interval),
            generation,
        })
    }

    pub fn get(&self, kid: &str) -> Option<Arc<DecodingKey>> {
        self.keys.get(kid).cloned()
    }

    pub fn contains(&self, kid: &str) -> bool {
        self.keys.contains_key(kid)
    }

    pub fn kids(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn source(&self) -> &Url {
        &self.source
    }

    pub fn fetched_at(&self) -> SystemTime {
        self.fetched_at
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    pub fn time_to_live(&self) -> Duration {
        self.time_to_live
    }

    /// Increases with every snapshot a cache swaps in, possibly skipping numbers of failed fetches.
    /// The first fetch is generation 1.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the snapshot is older than its time-to-live.
    pub fn is_expired(&self, now: SystemTime) -> bool {
        now.duration_since(self.fetched_at)
            .map(|age| age > self.time_to_live)
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for KeySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of debug output.
        let mut kids: Vec<&str> = self.kids().collect();
        kids.sort_unstable();
        f.debug_struct("KeySet")
            .field("kids", &kids)
            .field("source", &self.source.as_str())
            .field("fetched_at", &self.fetched_at)
            .field("time_to_live", &self.time_to_live)
            .field("generation", &self.generation)
            .finish()
    }
}
