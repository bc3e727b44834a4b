//! Resolve where and how records are delivered.
//!
//! The webhook URL and display overrides come from a named configuration snapshot, falling back
//! to the values the pipeline was constructed with. The resolved `Endpoint` is cached and only
//! fetched again when it is invalidated or older than the configured maximum age. Webhook URLs
//! embed credentials, so only their host is ever logged.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use relay_common::config_source::{first_value, ConfigSource, ConfigSourceError, Snapshot};
use relay_common::webhook::MessageOverrides;
use reqwest::Url;

use crate::error::ConfigurationError;

pub const WEBHOOK_URL_KEY: &str = "webhookUrl";
/// Older name of `WEBHOOK_URL_KEY`, honoured when `webhookUrl` is not set.
pub const SLACK_URL_KEY: &str = "slackUrl";
pub const USERNAME_KEY: &str = "username";
pub const ICON_URL_KEY: &str = "iconUrl";
pub const ICON_EMOJI_KEY: &str = "iconEmoji";

/// A delivery destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: Url,
    pub overrides: MessageOverrides,
}

impl Endpoint {
    pub fn parse(url: &str, overrides: MessageOverrides) -> Result<Endpoint, ConfigurationError> {
        let url = Url::parse(url).map_err(ConfigurationError::InvalidUrl)?;

        match url.scheme() {
            "http" | "https" => Ok(Endpoint { url, overrides }),
            scheme => Err(ConfigurationError::UnsupportedScheme(scheme.to_owned())),
        }
    }

    /// Host of the webhook URL, safe to log.
    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or("<unknown>")
    }
}

/// Destination values supplied when constructing a pipeline.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EndpointSettings {
    pub url: Option<String>,
    pub overrides: MessageOverrides,
}

impl EndpointSettings {
    /// Resolve an endpoint where non-empty snapshot entries take precedence over these settings.
    pub fn resolve(&self, snapshot: &Snapshot) -> Result<Endpoint, ConfigurationError> {
        let pick = |keys: &[&str], fallback: &Option<String>| {
            first_value(snapshot, keys)
                .map(str::to_owned)
                .or_else(|| fallback.clone())
        };

        let url = pick(&[WEBHOOK_URL_KEY, SLACK_URL_KEY], &self.url)
            .ok_or(ConfigurationError::NoDestination)?;
        let overrides = MessageOverrides {
            username: pick(&[USERNAME_KEY], &self.overrides.username),
            icon_url: pick(&[ICON_URL_KEY], &self.overrides.icon_url),
            icon_emoji: pick(&[ICON_EMOJI_KEY], &self.overrides.icon_emoji),
        };

        Endpoint::parse(&url, overrides)
    }
}

/// A named entry in a configuration source.
#[derive(Clone)]
pub struct ConfigBinding {
    pub source: Arc<dyn ConfigSource>,
    pub name: String,
}

impl ConfigBinding {
    pub fn new(source: Arc<dyn ConfigSource>, name: &str) -> Self {
        Self {
            source,
            name: name.to_owned(),
        }
    }
}

struct Cached {
    endpoint: Arc<Endpoint>,
    fetched_at: Instant,
}

pub struct EndpointResolver {
    fallback: EndpointSettings,
    binding: Option<ConfigBinding>,
    max_age: Option<Duration>,
    cached: RwLock<Cached>,
    stale: AtomicBool,
}

impl EndpointResolver {
    /// Resolve the initial endpoint. Also returns the snapshot it was resolved from, so callers
    /// can read other configuration keys from it.
    ///
    /// A snapshot that cannot be fetched is treated as empty, but a destination that cannot be
    /// resolved is an error.
    pub async fn start(
        fallback: EndpointSettings,
        binding: Option<ConfigBinding>,
    ) -> Result<(EndpointResolver, Snapshot), ConfigurationError> {
        let snapshot = match fetch(binding.as_ref()).await {
            Ok(snapshot) => snapshot,
            Err(error) => {
                tracing::warn!("using pipeline settings for endpoint: {}", error);
                Snapshot::new()
            }
        };

        let endpoint = fallback.resolve(&snapshot)?;
        tracing::info!(host = endpoint.host(), "resolved webhook endpoint");

        let resolver = EndpointResolver {
            fallback,
            binding,
            max_age: None,
            cached: RwLock::new(Cached {
                endpoint: Arc::new(endpoint),
                fetched_at: Instant::now(),
            }),
            stale: AtomicBool::new(false),
        };

        Ok((resolver, snapshot))
    }

    /// Refresh the endpoint once it has been cached for longer than `max_age`. Zero disables it.
    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = (!max_age.is_zero()).then_some(max_age);
        self
    }

    /// The endpoint to deliver to, refreshed first if it was invalidated or has expired.
    pub async fn current(&self) -> Arc<Endpoint> {
        let (endpoint, fetched_at) = self.cached();
        let expired = self
            .max_age
            .is_some_and(|max_age| fetched_at.elapsed() >= max_age);

        if expired || self.stale.load(Ordering::Acquire) {
            self.refresh().await
        } else {
            endpoint
        }
    }

    /// Fetch the snapshot again and replace the cached endpoint. When the snapshot cannot be
    /// fetched or does not resolve to a valid endpoint, the previous endpoint is kept.
    pub async fn refresh(&self) -> Arc<Endpoint> {
        self.stale.store(false, Ordering::Release);
        metrics::counter!("webhook_relay_endpoint_refreshes_total").increment(1);

        let resolved = match fetch(self.binding.as_ref()).await {
            Ok(snapshot) => self.fallback.resolve(&snapshot),
            Err(error) => {
                tracing::warn!("failed to refresh endpoint configuration: {}", error);
                return self.keep_previous();
            }
        };

        let endpoint = match resolved {
            Ok(endpoint) => endpoint,
            Err(error) => {
                tracing::error!("refreshed endpoint configuration is invalid: {}", error);
                return self.keep_previous();
            }
        };

        let mut cached = self.cached.write().unwrap_or_else(PoisonError::into_inner);
        if *cached.endpoint != endpoint {
            tracing::info!(host = endpoint.host(), "webhook endpoint changed");
            cached.endpoint = Arc::new(endpoint);
        }
        cached.fetched_at = Instant::now();

        cached.endpoint.clone()
    }

    /// Mark the cached endpoint stale so the next call to `current` refreshes it.
    pub fn invalidate(&self) {
        self.stale.store(true, Ordering::Release);
    }

    /// The cached endpoint and when it was fetched, without refreshing it.
    pub fn cached(&self) -> (Arc<Endpoint>, Instant) {
        let cached = self.cached.read().unwrap_or_else(PoisonError::into_inner);
        (cached.endpoint.clone(), cached.fetched_at)
    }

    /// Keep the previous endpoint but restart its age, so a broken source is not polled on
    /// every delivery.
    fn keep_previous(&self) -> Arc<Endpoint> {
        let mut cached = self.cached.write().unwrap_or_else(PoisonError::into_inner);
        cached.fetched_at = Instant::now();
        cached.endpoint.clone()
    }
}

async fn fetch(binding: Option<&ConfigBinding>) -> Result<Snapshot, ConfigSourceError> {
    match binding {
        Some(binding) => binding.source.snapshot(&binding.name).await,
        None => Ok(Snapshot::new()),
    }
}

#[cfg(test)]
mod tests {
    use relay_common::config_source::StaticConfigSource;

    use super::*;

    fn settings(url: Option<&str>) -> EndpointSettings {
        EndpointSettings {
            url: url.map(str::to_owned),
            overrides: MessageOverrides {
                username: Some("fallback-user".to_owned()),
                ..Default::default()
            },
        }
    }

    fn binding(source: &StaticConfigSource) -> Option<ConfigBinding> {
        Some(ConfigBinding::new(Arc::new(source.clone()), "alerts"))
    }

    #[tokio::test]
    async fn test_snapshot_takes_precedence() {
        let source = StaticConfigSource::new();
        source.insert("alerts", WEBHOOK_URL_KEY, "https://hooks.example.com/a");
        source.insert("alerts", ICON_EMOJI_KEY, ":fire:");
        source.insert("alerts", "messageField", "body");

        let (resolver, snapshot) =
            EndpointResolver::start(settings(Some("https://fallback.example.com/")), binding(&source))
                .await
                .unwrap();
        let (endpoint, _) = resolver.cached();

        assert_eq!(endpoint.url.as_str(), "https://hooks.example.com/a");
        assert_eq!(endpoint.overrides.username.as_deref(), Some("fallback-user"));
        assert_eq!(endpoint.overrides.icon_emoji.as_deref(), Some(":fire:"));
        assert_eq!(snapshot.get("messageField").map(String::as_str), Some("body"));
    }

    #[tokio::test]
    async fn test_slack_url_key_names_destination() {
        let source = StaticConfigSource::new();
        source.insert("alerts", SLACK_URL_KEY, "https://hooks.slack.example.com/services/T0");

        let (resolver, _) = EndpointResolver::start(settings(None), binding(&source))
            .await
            .unwrap();
        assert_eq!(
            resolver.cached().0.url.as_str(),
            "https://hooks.slack.example.com/services/T0"
        );

        source.insert("alerts", WEBHOOK_URL_KEY, "https://hooks.example.com/preferred");
        assert_eq!(
            resolver.refresh().await.url.as_str(),
            "https://hooks.example.com/preferred"
        );
    }

    #[tokio::test]
    async fn test_missing_snapshot_falls_back_to_settings() {
        let source = StaticConfigSource::new();

        let (resolver, snapshot) =
            EndpointResolver::start(settings(Some("http://localhost:8080/hook")), binding(&source))
                .await
                .unwrap();

        assert!(snapshot.is_empty());
        assert_eq!(resolver.cached().0.host(), "localhost");
    }

    #[tokio::test]
    async fn test_start_errors() {
        let err = EndpointResolver::start(settings(None), None).await.err().unwrap();
        assert!(matches!(err, ConfigurationError::NoDestination));

        let err = EndpointResolver::start(settings(Some("not a url")), None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConfigurationError::InvalidUrl(_)));

        let err = EndpointResolver::start(settings(Some("ftp://example.com/hook")), None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConfigurationError::UnsupportedScheme(scheme) if scheme == "ftp"));
    }

    #[tokio::test]
    async fn test_invalidate_refreshes_once() {
        let source = StaticConfigSource::new();
        source.insert("alerts", WEBHOOK_URL_KEY, "https://hooks.example.com/old");

        let (resolver, _) = EndpointResolver::start(settings(None), binding(&source))
            .await
            .unwrap();
        source.insert("alerts", WEBHOOK_URL_KEY, "https://hooks.example.com/new");

        assert_eq!(
            resolver.current().await.url.as_str(),
            "https://hooks.example.com/old"
        );
        assert_eq!(source.fetch_count(), 1);

        resolver.invalidate();
        assert_eq!(
            resolver.current().await.url.as_str(),
            "https://hooks.example.com/new"
        );
        resolver.current().await;
        assert_eq!(source.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_endpoint() {
        let source = StaticConfigSource::new();
        source.insert("alerts", WEBHOOK_URL_KEY, "https://hooks.example.com/old");

        let (resolver, _) = EndpointResolver::start(settings(None), binding(&source))
            .await
            .unwrap();

        source.insert("alerts", WEBHOOK_URL_KEY, "::invalid::");
        assert_eq!(
            resolver.refresh().await.url.as_str(),
            "https://hooks.example.com/old"
        );

        source.remove("alerts");
        assert_eq!(
            resolver.refresh().await.url.as_str(),
            "https://hooks.example.com/old"
        );
    }

    #[tokio::test]
    async fn test_max_age_expires_endpoint() {
        let source = StaticConfigSource::new();
        source.insert("alerts", WEBHOOK_URL_KEY, "https://hooks.example.com/old");

        let (resolver, _) = EndpointResolver::start(settings(None), binding(&source))
            .await
            .unwrap();
        let resolver = resolver.max_age(Duration::from_millis(20));
        source.insert("alerts", WEBHOOK_URL_KEY, "https://hooks.example.com/new");

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(
            resolver.current().await.url.as_str(),
            "https://hooks.example.com/new"
        );
    }
}
