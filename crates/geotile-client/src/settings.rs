//! Client configuration.
//!
//! [`ClientSettings`] is assembled with `with_*` builders. Retry behaviour
//! can also be loaded from a configuration file through [`RetryConfig`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use geotile_core::thread::TaskScheduler;
use geotile_core::{ApiError, ApiResponse, BackdownStrategy, ErrorCode, ExponentialBackdownStrategy};
use serde::Deserialize;

use crate::network::Network;

/// Decides whether a failed attempt is retried.
pub type RetryCondition = Arc<dyn Fn(&ApiError) -> bool + Send + Sync>;

/// Produces the bearer token attached to each request.
pub type TokenProvider = Arc<dyn Fn() -> ApiResponse<String> + Send + Sync>;

/// The default [`RetryCondition`]: throttling, server errors and timeouts.
#[must_use]
pub fn default_retry_condition(error: &ApiError) -> bool {
    if let Some(status) = error.http_status() {
        return status == 429 || (500..600).contains(&status);
    }
    matches!(
        error.code(),
        ErrorCode::RequestTimeout | ErrorCode::NetworkConnection
    )
}

/// How requests are retried.
#[derive(Clone)]
pub struct RetrySettings {
    /// Retries after the initial attempt.
    pub max_attempts: u32,
    /// Limit of a single attempt, and of the total time spent waiting
    /// between attempts.
    pub timeout: Duration,
    /// The period after a failure before the first retry.
    pub initial_backdown_period: Duration,
    pub backdown_strategy: Arc<dyn BackdownStrategy>,
    pub retry_condition: RetryCondition,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout: Duration::from_secs(60),
            initial_backdown_period: Duration::from_millis(200),
            backdown_strategy: Arc::new(ExponentialBackdownStrategy::new()),
            retry_condition: Arc::new(default_retry_condition),
        }
    }
}

impl RetrySettings {
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_initial_backdown_period(mut self, period: Duration) -> Self {
        self.initial_backdown_period = period;
        self
    }

    #[must_use]
    pub fn with_backdown_strategy(mut self, strategy: impl BackdownStrategy + 'static) -> Self {
        self.backdown_strategy = Arc::new(strategy);
        self
    }

    #[must_use]
    pub fn with_retry_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&ApiError) -> bool + Send + Sync + 'static,
    {
        self.retry_condition = Arc::new(condition);
        self
    }
}

impl fmt::Debug for RetrySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetrySettings")
            .field("max_attempts", &self.max_attempts)
            .field("timeout", &self.timeout)
            .field("initial_backdown_period", &self.initial_backdown_period)
            .finish_non_exhaustive()
    }
}

/// Serializable form of [`RetrySettings`].
///
/// Missing fields take the defaults of [`RetrySettings`].
///
/// ```
/// use geotile_client::RetryConfig;
///
/// let config: RetryConfig = serde_json::from_str(r#"{ "max_attempts": 5 }"#).unwrap();
/// assert_eq!(config.max_attempts, 5);
/// assert_eq!(config.timeout_secs, 60);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub timeout_secs: u64,
    pub initial_backdown_period_ms: u64,
    /// Upper bound of a single backdown wait.
    pub max_backdown_period_ms: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout_secs: 60,
            initial_backdown_period_ms: 200,
            max_backdown_period_ms: None,
        }
    }
}

impl From<RetryConfig> for RetrySettings {
    fn from(config: RetryConfig) -> Self {
        let strategy = match config.max_backdown_period_ms {
            Some(cap) => ExponentialBackdownStrategy::with_cap(Duration::from_millis(cap)),
            None => ExponentialBackdownStrategy::new(),
        };
        RetrySettings::default()
            .with_max_attempts(config.max_attempts)
            .with_timeout(Duration::from_secs(config.timeout_secs))
            .with_initial_backdown_period(Duration::from_millis(config.initial_backdown_period_ms))
            .with_backdown_strategy(strategy)
    }
}

/// Bearer token source attached to every request.
#[derive(Clone)]
pub struct AuthenticationSettings {
    provider: TokenProvider,
}

impl AuthenticationSettings {
    /// Request a token from `provider` before each attempt.
    pub fn new<F>(provider: F) -> Self
    where
        F: Fn() -> ApiResponse<String> + Send + Sync + 'static,
    {
        Self {
            provider: Arc::new(provider),
        }
    }

    /// Always use the same token.
    #[must_use]
    pub fn with_static_token(token: impl Into<String>) -> Self {
        let token = token.into();
        Self::new(move || Ok(token.clone()))
    }

    /// Fetch a token from the provider.
    pub fn token(&self) -> ApiResponse<String> {
        (self.provider)()
    }
}

impl fmt::Debug for AuthenticationSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticationSettings").finish_non_exhaustive()
    }
}

/// Everything an [`ApiClient`](crate::ApiClient) needs to send requests.
#[derive(Clone)]
pub struct ClientSettings {
    pub network: Arc<dyn Network>,
    /// Runs asynchronous calls. Without one they run on the calling thread.
    pub scheduler: Option<Arc<dyn TaskScheduler>>,
    pub retry_settings: RetrySettings,
    pub authentication: Option<AuthenticationSettings>,
}

impl ClientSettings {
    /// Settings with the default retry policy, no scheduler and no
    /// authentication.
    pub fn new(network: Arc<dyn Network>) -> Self {
        Self {
            network,
            scheduler: None,
            retry_settings: RetrySettings::default(),
            authentication: None,
        }
    }

    #[must_use]
    pub fn with_scheduler(mut self, scheduler: Arc<dyn TaskScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    #[must_use]
    pub fn with_retry_settings(mut self, retry_settings: RetrySettings) -> Self {
        self.retry_settings = retry_settings;
        self
    }

    #[must_use]
    pub fn with_authentication(mut self, authentication: AuthenticationSettings) -> Self {
        self.authentication = Some(authentication);
        self
    }
}

impl fmt::Debug for ClientSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSettings")
            .field("scheduler", &self.scheduler.is_some())
            .field("retry_settings", &self.retry_settings)
            .field("authentication", &self.authentication)
            .finish_non_exhaustive()
    }
}
