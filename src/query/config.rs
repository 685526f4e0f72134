use std::time::Duration;

/// Delay between fetch attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDelay {
    /// Always wait the same amount of time.
    Fixed(Duration),
    /// Wait `base * 2^failures`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl RetryDelay {
    /// Delay before the attempt following `failure_count` failures.
    pub fn for_failures(&self, failure_count: u32) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Exponential { base, max } => {
                let factor = 2_u32.checked_pow(failure_count.saturating_sub(1)).unwrap_or(u32::MAX);
                base.checked_mul(factor).map_or(max, |delay| delay.min(max))
            }
        }
    }
}

impl Default for RetryDelay {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

/// How long an unobserved query stays cached unless configured otherwise.
pub const DEFAULT_CACHE_TIME: Duration = Duration::from_secs(5 * 60);

/// Client-wide defaults for queries and mutations.
///
/// Options set on an individual query take precedence over these values.
#[derive(Debug, Clone)]
pub struct QueryConfig {
    /// How long data is considered fresh before becoming stale.
    ///
    /// Fresh data is served from the cache without refetching. Stale data is
    /// still served, but mounting a new observer refetches it in the background.
    pub stale_time: Duration,

    /// How long a query without observers is kept before it is removed.
    pub cache_time: Duration,

    /// How many times a failed query fetch is retried.
    pub retry: u32,

    pub retry_delay: RetryDelay,

    /// How many times a failed mutation is retried.
    pub mutation_retry: u32,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            stale_time: Duration::from_secs(0), // immediately stale
            cache_time: DEFAULT_CACHE_TIME,
            retry: 3,
            retry_delay: RetryDelay::default(),
            mutation_retry: 0,
        }
    }
}

impl QueryConfig {
    /// Creates a configuration with the given stale time and retry count.
    #[must_use]
    pub const fn new(stale_time: Duration, retry: u32) -> Self {
        Self {
            stale_time,
            cache_time: DEFAULT_CACHE_TIME,
            retry,
            retry_delay: RetryDelay::Exponential {
                base: Duration::from_secs(1),
                max: Duration::from_secs(30),
            },
            mutation_retry: 0,
        }
    }

    #[must_use]
    pub const fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    #[must_use]
    pub const fn with_cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = cache_time;
        self
    }

    #[must_use]
    pub const fn with_retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub const fn with_retry_delay(mut self, retry_delay: RetryDelay) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    #[must_use]
    pub const fn with_mutation_retry(mut self, retry: u32) -> Self {
        self.mutation_retry = retry;
        self
    }
}
