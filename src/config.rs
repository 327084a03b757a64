//! Node and link configuration.
//!
//! All durations are milliseconds of scheduler time. A [`Config`] can be
//! built in code through the `with_*` setters or loaded from TOML; missing
//! fields fall back to the defaults below.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Default bucket capacity and replication factor.
pub const DEFAULT_K: usize = 10;

/// Default lookup fan-out.
pub const DEFAULT_ALPHA: usize = 3;

/// Default per-attempt RPC timeout.
pub const DEFAULT_TIMEOUT_PERIOD: u64 = 500;

/// Default number of resends after the first attempt.
pub const DEFAULT_ATTEMPTS_NUMBER: u32 = 2;

/// Default republish period (one hour).
pub const DEFAULT_REPUBLISH_TIME: u64 = 3_600_000;

/// Default republish jitter window (one minute).
pub const DEFAULT_REPUBLISH_TIME_DELTA: u64 = 60_000;

/// Default item lifetime (one day).
pub const DEFAULT_EXPIRATION_TIME: u64 = 86_400_000;

/// Default routing-table refresh period (one minute).
pub const DEFAULT_MIN_RT_CHECK_TIME_INTERVAL: u64 = 60_000;

/// Default number of close-contact removals that forces early republish.
pub const DEFAULT_REPUBLISH_THRESHOLD: u32 = 4;

/// Protocol parameters of a single node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bucket capacity; also the number of replicas a store targets.
    pub k: usize,
    /// Maximum concurrently pending requests per lookup.
    pub alpha: usize,
    /// Time to wait for a response before resending.
    pub timeout_period: u64,
    /// Resends after the first attempt before the peer is declared down.
    pub attempts_number: u32,
    pub republish_time: u64,
    pub republish_time_delta: u64,
    /// Lifetime of items stored through [`crate::node::KadNode::store_default`].
    pub expiration_time: u64,
    /// Interval between routing-table staleness checks.
    pub min_rt_check_time_interval: u64,
    #[serde(alias = "republish_treshhold")]
    pub republish_threshold: u32,
    /// Let the holder's sibling bucket replace contacts with closer ones.
    pub force_k: bool,
    /// Tell peers about nodes found dead during a lookup.
    pub downlist: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            timeout_period: DEFAULT_TIMEOUT_PERIOD,
            attempts_number: DEFAULT_ATTEMPTS_NUMBER,
            republish_time: DEFAULT_REPUBLISH_TIME,
            republish_time_delta: DEFAULT_REPUBLISH_TIME_DELTA,
            expiration_time: DEFAULT_EXPIRATION_TIME,
            min_rt_check_time_interval: DEFAULT_MIN_RT_CHECK_TIME_INTERVAL,
            republish_threshold: DEFAULT_REPUBLISH_THRESHOLD,
            force_k: true,
            downlist: true,
        }
    }
}

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text).context("invalid node configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            bail!("k must be at least 1");
        }
        if self.alpha == 0 {
            bail!("alpha must be at least 1");
        }
        if self.alpha > self.k {
            bail!("alpha ({}) cannot exceed k ({})", self.alpha, self.k);
        }
        if self.timeout_period == 0 {
            bail!("timeout_period must be positive");
        }
        if self.republish_time_delta > self.republish_time {
            bail!(
                "republish_time_delta ({}) cannot exceed republish_time ({})",
                self.republish_time_delta,
                self.republish_time
            );
        }
        if self.min_rt_check_time_interval == 0 {
            bail!("min_rt_check_time_interval must be positive");
        }
        Ok(())
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn with_alpha(mut self, alpha: usize) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_timeout_period(mut self, ms: u64) -> Self {
        self.timeout_period = ms;
        self
    }

    pub fn with_attempts_number(mut self, attempts: u32) -> Self {
        self.attempts_number = attempts;
        self
    }

    /// Set the republish period and its jitter window.
    pub fn with_republish(mut self, period: u64, delta: u64) -> Self {
        self.republish_time = period;
        self.republish_time_delta = delta;
        self
    }

    pub fn with_expiration_time(mut self, ms: u64) -> Self {
        self.expiration_time = ms;
        self
    }

    pub fn with_rt_check_interval(mut self, ms: u64) -> Self {
        self.min_rt_check_time_interval = ms;
        self
    }

    pub fn with_republish_threshold(mut self, count: u32) -> Self {
        self.republish_threshold = count;
        self
    }

    pub fn with_force_k(mut self, enabled: bool) -> Self {
        self.force_k = enabled;
        self
    }

    pub fn with_downlist(mut self, enabled: bool) -> Self {
        self.downlist = enabled;
        self
    }
}

/// Behaviour of simulated links between nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Base one-way delay.
    pub delay: u64,
    /// Uniform extra delay drawn from `[0, delay_jitter]`.
    pub delay_jitter: u64,
    /// Probability in `[0, 1]` that a message is dropped.
    pub packet_loss: f64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            delay: 50,
            delay_jitter: 50,
            packet_loss: 0.1,
        }
    }
}

impl LinkConfig {
    /// Zero-delay, lossless links.
    pub fn instant() -> Self {
        Self {
            delay: 0,
            delay_jitter: 0,
            packet_loss: 0.0,
        }
    }

    /// Fixed delay, no jitter, no loss.
    pub fn fixed(delay: u64) -> Self {
        Self {
            delay,
            delay_jitter: 0,
            packet_loss: 0.0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.packet_loss) {
            bail!("packet_loss must lie in [0, 1], got {}", self.packet_loss);
        }
        Ok(())
    }
}
