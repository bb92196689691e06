use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Reflector and dispatch settings for one informer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InformerConfig {
    /// Re-deliver every cached object at this interval.
    pub resync_period: Option<Duration>,
    /// First pause after a failed list/watch; doubles per consecutive failure.
    pub watch_backoff_base: Duration,
    pub watch_backoff_max: Duration,
    /// How often a delta batch whose handler failed is retried before it is dropped.
    pub max_requeues: u32,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self {
            resync_period: None,
            watch_backoff_base: Duration::from_millis(500),
            watch_backoff_max: Duration::from_secs(30),
            max_requeues: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub workers: usize,
    pub informer: InformerConfig,
    /// Per-key reconcile retry backoff.
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Give up on a key after this many consecutive failed reconciles. `None`: retry forever.
    pub max_retries: Option<u32>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            informer: InformerConfig::default(),
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(1000),
            max_retries: None,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    lookup(name).and_then(|s| s.trim().parse().ok())
}

impl ControllerConfig {
    /// Defaults overridden by `REKON_*` environment variables. Unparsable values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(n) = parsed::<usize>(&lookup, "REKON_WORKERS") {
            cfg.workers = n.max(1);
        }
        if let Some(secs) = parsed::<u64>(&lookup, "REKON_RESYNC_SECS") {
            cfg.informer.resync_period = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = parsed::<u64>(&lookup, "REKON_WATCH_BACKOFF_MAX_SECS") {
            cfg.informer.watch_backoff_max = Duration::from_secs(secs);
        }
        if let Some(n) = parsed::<u32>(&lookup, "REKON_DISPATCH_REQUEUES") {
            cfg.informer.max_requeues = n;
        }
        if let Some(ms) = parsed::<u64>(&lookup, "REKON_BACKOFF_BASE_MS") {
            cfg.backoff_base = Duration::from_millis(ms);
        }
        if let Some(secs) = parsed::<u64>(&lookup, "REKON_BACKOFF_MAX_SECS") {
            cfg.backoff_max = Duration::from_secs(secs);
        }
        if let Some(n) = parsed::<u32>(&lookup, "REKON_MAX_RETRIES") {
            cfg.max_retries = Some(n);
        }
        cfg
    }
}
