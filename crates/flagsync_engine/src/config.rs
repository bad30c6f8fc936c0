//! Configuration for the sync engine.

use crate::backoff::BackoffCounter;
use std::time::Duration;

/// Default base URL of the flags and segments API.
pub const DEFAULT_SDK_URL: &str = "https://sdk.flagsync.dev/api";
/// Default base URL of the streaming authentication API.
pub const DEFAULT_AUTH_URL: &str = "https://auth.flagsync.dev/api";
/// Default URL of the streaming endpoint.
pub const DEFAULT_STREAMING_URL: &str = "https://streaming.flagsync.dev/sse";
/// Default polling interval.
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(60);
/// Default time to wait for the initial sync before reporting a timeout.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);
/// Default base of the streaming reconnect backoff.
pub const DEFAULT_RECONNECT_BACKOFF_BASE: Duration = Duration::from_secs(1);
/// Default upper bound of every backoff.
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(30 * 60);
/// Default time without traffic after which the stream is considered dead.
pub const DEFAULT_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(70);
/// Default margin before token expiry at which the token is refreshed.
pub const DEFAULT_TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(600);
/// Default delay between `pause()` and closing the stream.
pub const DEFAULT_BACKGROUND_DISCONNECT_DELAY: Duration = Duration::from_secs(60);

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Matching key whose segments are synchronized.
    pub user_key: String,
    /// Base URL of the flags and segments API.
    pub sdk_url: String,
    /// Base URL of the streaming authentication API.
    pub auth_url: String,
    /// URL of the streaming endpoint.
    pub streaming_url: String,
    /// Whether streaming is attempted at all.
    pub streaming_enabled: bool,
    /// Interval of the periodic polling fallback.
    pub polling_interval: Duration,
    /// Maximum wait for the initial sync.
    pub ready_timeout: Duration,
    /// Base of the streaming reconnect backoff.
    pub reconnect_backoff_base: Duration,
    /// Upper bound of the streaming reconnect backoff.
    pub backoff_cap: Duration,
    /// Time without traffic after which the stream is considered dead.
    pub keep_alive_timeout: Duration,
    /// Margin before token expiry at which the token is refreshed.
    pub token_refresh_margin: Duration,
    /// Delay between `pause()` and closing the stream.
    pub background_disconnect_delay: Duration,
    /// Retry configuration for targeted fetches.
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// Creates a configuration with default endpoints for a matching key.
    pub fn new(user_key: impl Into<String>) -> Self {
        Self {
            user_key: user_key.into(),
            sdk_url: DEFAULT_SDK_URL.to_string(),
            auth_url: DEFAULT_AUTH_URL.to_string(),
            streaming_url: DEFAULT_STREAMING_URL.to_string(),
            streaming_enabled: true,
            polling_interval: DEFAULT_POLLING_INTERVAL,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            reconnect_backoff_base: DEFAULT_RECONNECT_BACKOFF_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
            keep_alive_timeout: DEFAULT_KEEP_ALIVE_TIMEOUT,
            token_refresh_margin: DEFAULT_TOKEN_REFRESH_MARGIN,
            background_disconnect_delay: DEFAULT_BACKGROUND_DISCONNECT_DELAY,
            retry: RetryConfig::default(),
        }
    }

    /// Sets all three service endpoints.
    pub fn with_endpoints(
        mut self,
        sdk_url: impl Into<String>,
        auth_url: impl Into<String>,
        streaming_url: impl Into<String>,
    ) -> Self {
        self.sdk_url = sdk_url.into();
        self.auth_url = auth_url.into();
        self.streaming_url = streaming_url.into();
        self
    }

    /// Enables or disables streaming.
    pub fn with_streaming_enabled(mut self, enabled: bool) -> Self {
        self.streaming_enabled = enabled;
        self
    }

    /// Sets the polling interval.
    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    /// Sets the ready timeout.
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Sets the base and cap of the reconnect backoff.
    pub fn with_reconnect_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.reconnect_backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    /// Sets the keep-alive timeout.
    pub fn with_keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.keep_alive_timeout = timeout;
        self
    }

    /// Sets the token refresh margin.
    pub fn with_token_refresh_margin(mut self, margin: Duration) -> Self {
        self.token_refresh_margin = margin;
        self
    }

    /// Sets the background disconnect delay. Zero disconnects on `pause()`.
    pub fn with_background_disconnect_delay(mut self, delay: Duration) -> Self {
        self.background_disconnect_delay = delay;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Backoff counter used between streaming reconnects.
    pub fn reconnect_backoff(&self) -> BackoffCounter {
        BackoffCounter::new(self.reconnect_backoff_base).with_cap(self.backoff_cap)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("")
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// A fresh backoff counter for one retry sequence.
    pub fn backoff(&self) -> BackoffCounter {
        BackoffCounter::new(self.initial_delay).with_cap(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
