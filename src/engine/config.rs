//! Engine tuning knobs.

use std::time::Duration;

/// Configuration shared by an engine run and inherited by nested
/// container/subflow runs.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Per-node circular buffer capacity.
    pub queue_capacity: usize,
    /// Default lease duration for checked-out envelopes.
    pub visibility_timeout: Duration,
    /// Default retry budget for nodes that do not set their own.
    pub default_max_retries: u32,
    /// Timer wake for lease-expiry recovery when no new arrivals occur.
    pub idle_tick: Duration,
    /// How long queues must stay drained before the run counts as done.
    pub completion_grace: Duration,
    /// Dead-letter queue capacity (shared across the run's nodes).
    pub dead_letter_capacity: usize,
    /// Cancel remaining workers when a node fails with no Fail route.
    /// Parallel containers set this from `cancelSiblingsOnFailure`.
    pub cancel_on_unrouted_failure: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            visibility_timeout: Duration::from_secs(30),
            default_max_retries: 3,
            idle_tick: Duration::from_millis(100),
            completion_grace: Duration::from_millis(50),
            dead_letter_capacity: 128,
            cancel_on_unrouted_failure: false,
        }
    }
}

impl EngineConfig {
    /// Build a config from `FLOWLOOM_*` environment variables, loading
    /// `.env` first. Unset or unparsable variables keep their defaults.
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = Self::default();
        if let Some(v) = env_parse::<usize>("FLOWLOOM_QUEUE_CAPACITY") {
            config.queue_capacity = v.max(1);
        }
        if let Some(v) = env_parse::<u64>("FLOWLOOM_VISIBILITY_TIMEOUT_MS") {
            config.visibility_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u32>("FLOWLOOM_MAX_RETRIES") {
            config.default_max_retries = v;
        }
        if let Some(v) = env_parse::<u64>("FLOWLOOM_IDLE_TICK_MS") {
            config.idle_tick = Duration::from_millis(v.max(1));
        }
        if let Some(v) = env_parse::<u64>("FLOWLOOM_COMPLETION_GRACE_MS") {
            config.completion_grace = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<usize>("FLOWLOOM_DEAD_LETTER_CAPACITY") {
            config.dead_letter_capacity = v.max(1);
        }
        config
    }

    #[must_use]
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_default_max_retries(mut self, retries: u32) -> Self {
        self.default_max_retries = retries;
        self
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
