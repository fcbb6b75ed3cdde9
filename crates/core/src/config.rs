//! Runtime configuration.
//!
//! Tunable constants for the scheduler, adapters, and transports. Values can
//! be loaded from a TOML file; every field has a documented default matching
//! the constants in [`crate::deadline`].

use crate::deadline::{
    DeadlineTime, CROSS_DOMAIN_DEADLINE, DEFAULT_CONSTRUCTION_DEADLINE, PROXY_GC_DEADLINE,
};
use crate::error::{CoreResult, SystemException};
use serde::Deserialize;
use std::path::Path;

/// Configuration for one protection-domain runtime instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Worker threads backing the cooperative scheduler.
    pub worker_threads: usize,

    /// Cap on total in-flight requests; exceeding returns NO_RESOURCES.
    pub max_inflight_requests: u32,

    /// Cap on a POA manager's pending queue; exceeding returns TRANSIENT.
    pub manager_queue_cap: usize,

    /// Construction deadline for binder and service constructions (100 ns units).
    pub construction_deadline: DeadlineTime,

    /// Construction deadline for cross-domain unmarshal (100 ns units).
    pub cross_domain_deadline: DeadlineTime,

    /// Deadline of the deferred revive-or-die pass on dropped references.
    pub proxy_gc_deadline: DeadlineTime,

    /// Interval between DGC heartbeat confirmations, in milliseconds.
    pub heartbeat_interval_ms: u64,

    /// Minimum lifetime of an unreferenced remote reference, in milliseconds.
    pub release_window_ms: u64,

    /// Immediate-reply budget in bytes. Mirrors the pinned wire constant
    /// `ReplyImmediate::MAX_DATA_SIZE`; informational only.
    pub immediate_reply_budget: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            max_inflight_requests: 1024,
            manager_queue_cap: 256,
            construction_deadline: DEFAULT_CONSTRUCTION_DEADLINE,
            cross_domain_deadline: CROSS_DOMAIN_DEADLINE,
            proxy_gc_deadline: PROXY_GC_DEADLINE,
            heartbeat_interval_ms: 30_000,
            release_window_ms: 120_000,
            immediate_reply_budget: 24,
        }
    }
}

impl RuntimeConfig {
    /// Parses a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> CoreResult<Self> {
        let config: RuntimeConfig =
            toml::from_str(text).map_err(|_| SystemException::bad_param(0))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration file from disk.
    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let text =
            std::fs::read_to_string(path.as_ref()).map_err(|_| SystemException::initialize())?;
        Self::from_toml_str(&text)
    }

    /// Rejects configurations the runtime cannot operate with.
    pub fn validate(&self) -> CoreResult<()> {
        if self.worker_threads == 0
            || self.max_inflight_requests == 0
            || self.manager_queue_cap == 0
            || self.construction_deadline == 0
        {
            return Err(SystemException::bad_param(0));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        RuntimeConfig::default().validate().expect("default config");
    }

    #[test]
    fn toml_overrides_defaults() {
        let config =
            RuntimeConfig::from_toml_str("worker_threads = 8\nmanager_queue_cap = 16\n").unwrap();
        assert_eq!(config.worker_threads, 8);
        assert_eq!(config.manager_queue_cap, 16);
        assert_eq!(
            config.max_inflight_requests,
            RuntimeConfig::default().max_inflight_requests
        );
    }

    #[test]
    fn zero_workers_rejected() {
        assert!(RuntimeConfig::from_toml_str("worker_threads = 0").is_err());
    }

    #[test]
    fn unknown_field_rejected() {
        assert!(RuntimeConfig::from_toml_str("no_such_knob = 1").is_err());
    }
}
