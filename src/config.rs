use std::{env, time::Duration};

use http::HeaderName;
use jsonwebtoken::Algorithm;
use url::Url;

use crate::Error;

/// Endpoint publishing the App Check public keys.
pub const DEFAULT_JWKS_URL: &str = "https://firebaseappcheck.googleapis.com/v1beta/jwks";

/// Prefix of the `iss` claim; the project number is appended to it.
pub const DEFAULT_ISSUER_BASE: &str = "https://firebaseappcheck.googleapis.com/";

/// Header carrying the App Check token.
pub const DEFAULT_TOKEN_HEADER: &str = "x-firebase-appcheck";

/// The published keys may be cached for up to 6 hours.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Upper bound for a single key set fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest accepted refresh interval. Longer intervals cannot be scheduled reliably.
pub const MAX_REFRESH_INTERVAL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Settings for verifying App Check tokens.
///
/// Built once at startup and treated as immutable afterwards.
#[derive(Debug, Clone)]
pub struct AppCheckConfig {
    pub(crate) project_number: String,
    pub(crate) jwks_url: Url,
    pub(crate) issuer_base: String,
    pub(crate) refresh_interval: Duration,
    pub(crate) fetch_timeout: Duration,
    pub(crate) reactive_refresh_cooldown: Option<Duration>,
    pub(crate) algorithm: Algorithm,
    pub(crate) token_type: String,
    pub(crate) header_name: HeaderName,
}

impl AppCheckConfig {
    /// Creates a configuration for the given project number with the App Check defaults.
    pub fn new(project_number: impl Into<String>) -> Result<Self, Error> {
        let project_number = project_number.into();
        if project_number.trim().is_empty() {
            return Err(Error::InvalidConfig("project number must not be empty".to_string()));
        }

        let jwks_url = Url::parse(DEFAULT_JWKS_URL)
            .map_err(|err| Error::InvalidConfig(format!("invalid JWKS URL: {err}")))?;

        Ok(Self {
            project_number,
            jwks_url,
            issuer_base: DEFAULT_ISSUER_BASE.to_string(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            reactive_refresh_cooldown: None,
            algorithm: Algorithm::RS256,
            token_type: "JWT".to_string(),
            header_name: HeaderName::from_static(DEFAULT_TOKEN_HEADER),
        })
    }

    /// Reads the configuration from the process environment.
    ///
    /// `PROJECT_NUMBER` is required. `APP_CHECK_JWKS_URL`, `APP_CHECK_REFRESH_INTERVAL_SECS` and
    /// `APP_CHECK_FETCH_TIMEOUT_SECS` override the defaults when set.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_vars(|name| env::var(name).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let project_number = var("PROJECT_NUMBER")
            .ok_or_else(|| Error::InvalidConfig("PROJECT_NUMBER is not set".to_string()))?;
        let mut config = Self::new(project_number)?;

        if let Some(url) = var("APP_CHECK_JWKS_URL") {
            let url = Url::parse(&url).map_err(|err| {
                Error::InvalidConfig(format!("APP_CHECK_JWKS_URL is not a valid URL: {err}"))
            })?;
            config = config.with_jwks_url(url);
        }
        if let Some(interval) = duration_var(&var, "APP_CHECK_REFRESH_INTERVAL_SECS")? {
            config = config.with_refresh_interval(interval)?;
        }
        if let Some(timeout) = duration_var(&var, "APP_CHECK_FETCH_TIMEOUT_SECS")? {
            config = config.with_fetch_timeout(timeout)?;
        }
        Ok(config)
    }

    pub fn with_jwks_url(mut self, jwks_url: Url) -> Self {
        self.jwks_url = jwks_url;
        self
    }

    pub fn with_issuer_base(mut self, issuer_base: impl Into<String>) -> Self {
        self.issuer_base = issuer_base.into();
        self
    }

    /// Sets how often the key set is refreshed in the background.
    ///
    /// Must be non-zero and at most [`MAX_REFRESH_INTERVAL`].
    pub fn with_refresh_interval(mut self, interval: Duration) -> Result<Self, Error> {
        validate_refresh_interval(interval)?;
        self.refresh_interval = interval;
        Ok(self)
    }

    /// Bounds the time a single key set fetch may take.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Result<Self, Error> {
        if timeout.is_zero() {
            return Err(Error::InvalidConfig("fetch timeout must be non-zero".to_string()));
        }
        self.fetch_timeout = timeout;
        Ok(self)
    }

    /// Minimum time between two refreshes triggered by unknown key IDs.
    pub fn with_reactive_refresh_cooldown(mut self, cooldown: Duration) -> Self {
        self.reactive_refresh_cooldown = Some(cooldown);
        self
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_token_type(mut self, token_type: impl Into<String>) -> Self {
        self.token_type = token_type.into();
        self
    }

    pub fn with_header_name(mut self, header_name: HeaderName) -> Self {
        self.header_name = header_name;
        self
    }

    pub fn project_number(&self) -> &str {
        &self.project_number
    }

    pub fn jwks_url(&self) -> &Url {
        &self.jwks_url
    }

    pub fn header_name(&self) -> &HeaderName {
        &self.header_name
    }

    /// The audience entry a token must carry: `projects/<project number>`.
    pub fn expected_audience(&self) -> String {
        format!("projects/{}", self.project_number)
    }

    /// The text the `iss` claim must contain: issuer base followed by the project number.
    pub fn expected_issuer(&self) -> String {
        format!("{}{}", self.issuer_base, self.project_number)
    }
}

pub(crate) fn validate_refresh_interval(interval: Duration) -> Result<(), Error> {
    if interval.is_zero() {
        return Err(Error::InvalidConfig("refresh interval must be non-zero".to_string()));
    }
    if interval > MAX_REFRESH_INTERVAL {
        return Err(Error::InvalidConfig(format!(
            "refresh interval must be at most {MAX_REFRESH_INTERVAL:?}, got {interval:?}"
        )));
    }
    Ok(())
}

fn duration_var(var: impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<Duration>, Error> {
    match var(name) {
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|err| Error::InvalidConfig(format!("{name} is not a number of seconds: {err}"))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod test {
    use std::{collections::HashMap, time::Duration};

    use jsonwebtoken::Algorithm;

    use super::{AppCheckConfig, DEFAULT_FETCH_TIMEOUT, DEFAULT_REFRESH_INTERVAL, MAX_REFRESH_INTERVAL};
    use crate::Error;

    fn from_vars(vars: &[(&str, &str)]) -> Result<AppCheckConfig, Error> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        AppCheckConfig::from_vars(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = AppCheckConfig::new("123").unwrap();

        assert_eq!(config.project_number(), "123");
        assert_eq!(config.jwks_url().as_str(), "https://firebaseappcheck.googleapis.com/v1beta/jwks");
        assert_eq!(config.header_name().as_str(), "x-firebase-appcheck");
        assert_eq!(config.refresh_interval, DEFAULT_REFRESH_INTERVAL);
        assert_eq!(config.algorithm, Algorithm::RS256);
        assert_eq!(config.token_type, "JWT");
        assert_eq!(config.expected_audience(), "projects/123");
        assert_eq!(config.expected_issuer(), "https://firebaseappcheck.googleapis.com/123");
    }

    #[test]
    fn test_rejects_empty_project_number() {
        assert!(matches!(AppCheckConfig::new("  "), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_zero_durations() {
        let config = AppCheckConfig::new("123").unwrap();
        assert!(config.clone().with_refresh_interval(Duration::ZERO).is_err());
        assert!(config.with_fetch_timeout(Duration::ZERO).is_err());
    }

    #[test]
    fn test_rejects_refresh_interval_that_cannot_be_scheduled() {
        let config = AppCheckConfig::new("123").unwrap();

        assert!(matches!(
            config.clone().with_refresh_interval(Duration::from_secs(u64::MAX)),
            Err(Error::InvalidConfig(_))
        ));
        assert!(config.clone().with_refresh_interval(MAX_REFRESH_INTERVAL + Duration::from_secs(1)).is_err());
        let config = config.with_refresh_interval(MAX_REFRESH_INTERVAL).unwrap();
        assert_eq!(config.refresh_interval, MAX_REFRESH_INTERVAL);
    }

    #[test]
    fn test_from_vars_requires_project_number() {
        assert!(matches!(from_vars(&[]), Err(Error::InvalidConfig(_))));
        assert!(matches!(from_vars(&[("PROJECT_NUMBER", "")]), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_from_vars_uses_defaults() {
        let config = from_vars(&[("PROJECT_NUMBER", "987")]).unwrap();

        assert_eq!(config.project_number(), "987");
        assert_eq!(config.jwks_url().as_str(), "https://firebaseappcheck.googleapis.com/v1beta/jwks");
        assert_eq!(config.refresh_interval, DEFAULT_REFRESH_INTERVAL);
        assert_eq!(config.fetch_timeout, DEFAULT_FETCH_TIMEOUT);
    }

    #[test]
    fn test_from_vars_applies_overrides() {
        let config = from_vars(&[
            ("PROJECT_NUMBER", "987"),
            ("APP_CHECK_JWKS_URL", "http://localhost:9000/jwks"),
            ("APP_CHECK_REFRESH_INTERVAL_SECS", " 600 "),
            ("APP_CHECK_FETCH_TIMEOUT_SECS", "3"),
        ])
        .unwrap();

        assert_eq!(config.jwks_url().as_str(), "http://localhost:9000/jwks");
        assert_eq!(config.refresh_interval, Duration::from_secs(600));
        assert_eq!(config.fetch_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_from_vars_rejects_invalid_values() {
        for (name, value) in [
            ("APP_CHECK_JWKS_URL", "not a url"),
            ("APP_CHECK_REFRESH_INTERVAL_SECS", "six hours"),
            ("APP_CHECK_REFRESH_INTERVAL_SECS", "-5"),
            ("APP_CHECK_REFRESH_INTERVAL_SECS", "0"),
            ("APP_CHECK_REFRESH_INTERVAL_SECS", "18446744073709551615"),
            ("APP_CHECK_FETCH_TIMEOUT_SECS", "1.5"),
            ("APP_CHECK_FETCH_TIMEOUT_SECS", "0"),
        ] {
            let result = from_vars(&[("PROJECT_NUMBER", "987"), (name, value)]);
            assert!(
                matches!(result, Err(Error::InvalidConfig(_))),
                "{name}={value} was accepted"
            );
        }
    }

    #[test]
    fn test_from_env_reads_process_environment() {
        // The only test touching these variables.
        std::env::set_var("PROJECT_NUMBER", "555");
        std::env::set_var("APP_CHECK_REFRESH_INTERVAL_SECS", "60");
        let config = AppCheckConfig::from_env();
        std::env::remove_var("PROJECT_NUMBER");
        std::env::remove_var("APP_CHECK_REFRESH_INTERVAL_SECS");

        let config = config.unwrap();
        assert_eq!(config.project_number(), "555");
        assert_eq!(config.refresh_interval, Duration::from_secs(60));
    }
}
