//! Controller configuration
//!
//! Policy values (timeouts, intervals, backoff bounds) live here rather than
//! as constants so deployments can tune them without a rebuild.

use std::time::Duration;

use crate::Error;

/// Default timeout for a single discovery request
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Default number of concurrent discovery attempts per probe
pub const DEFAULT_PROBE_ATTEMPTS: usize = 5;

/// Path probed on the backing service
pub const DEFAULT_DISCOVERY_PATH: &str = "/apis";

/// Default interval at which every known APIService is re-enqueued
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Default floor for per-key retry backoff
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(5);

/// Default ceiling for per-key retry backoff
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Default number of reconcile workers
pub const DEFAULT_WORKERS: usize = 5;

/// Runtime configuration for the availability controller
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Timeout applied to each discovery request
    pub probe_timeout: Duration,
    /// Concurrent discovery attempts; any success marks the service available
    pub probe_attempts: usize,
    /// Path appended to the resolved service URL
    pub discovery_path: String,
    /// Periodic re-enqueue interval for all known APIServices
    pub resync_interval: Duration,
    /// First retry delay after a failed pass
    pub backoff_base: Duration,
    /// Upper bound on the retry delay
    pub backoff_max: Duration,
    /// Number of concurrent reconcile workers
    pub workers: usize,
    /// Skip TLS verification of the backing service certificate
    pub insecure_skip_tls_verify: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            probe_attempts: DEFAULT_PROBE_ATTEMPTS,
            discovery_path: DEFAULT_DISCOVERY_PATH.to_string(),
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
            workers: DEFAULT_WORKERS,
            insecure_skip_tls_verify: false,
        }
    }
}

impl ControllerConfig {
    /// Check that the configuration can drive a working controller
    pub fn validate(&self) -> Result<(), Error> {
        if self.probe_timeout.is_zero() {
            return Err(Error::config("probe timeout must be non-zero"));
        }
        if self.probe_attempts == 0 {
            return Err(Error::config("probe attempts must be at least 1"));
        }
        if !self.discovery_path.starts_with('/') {
            return Err(Error::config(format!(
                "discovery path {:?} must start with '/'",
                self.discovery_path
            )));
        }
        if self.resync_interval.is_zero() {
            return Err(Error::config("resync interval must be non-zero"));
        }
        if self.backoff_base.is_zero() {
            return Err(Error::config("backoff base must be non-zero"));
        }
        if self.backoff_max < self.backoff_base {
            return Err(Error::config(format!(
                "backoff max ({:?}) is below backoff base ({:?})",
                self.backoff_max, self.backoff_base
            )));
        }
        if self.workers == 0 {
            return Err(Error::config("at least one worker is required"));
        }
        Ok(())
    }
}
