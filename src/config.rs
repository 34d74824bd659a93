//! Runtime configuration and logging bootstrap
//!
//! Everything is read from the environment so the shim can be configured
//! without touching the process that loads it:
//!
//! - `HWC2_COMPAT_SERVICE`: composer service name (default `default`)
//! - `HWC2_COMPAT_LOG`: `tracing` filter directive (default `info`)

use tracing_subscriber::EnvFilter;

pub const SERVICE_ENV: &str = "HWC2_COMPAT_SERVICE";
pub const LOG_ENV: &str = "HWC2_COMPAT_LOG";

pub const DEFAULT_SERVICE: &str = "default";
pub const VR_SERVICE: &str = "vr";
pub const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShimConfig {
    /// Name of the composer instance to connect to
    pub service_name: String,
    pub log_filter: String,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE.to_string(),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl ShimConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(name) = lookup(SERVICE_ENV).filter(|s| !s.is_empty()) {
            config.service_name = name;
        }
        if let Some(filter) = lookup(LOG_ENV).filter(|s| !s.is_empty()) {
            config.log_filter = filter;
        }
        config
    }

    /// Service to connect to. Asking for the VR composer overrides the
    /// configured name.
    pub fn service_for(&self, use_vr_composer: bool) -> &str {
        if use_vr_composer {
            VR_SERVICE
        } else {
            &self.service_name
        }
    }
}

/// Install a stderr `fmt` subscriber filtered by `filter`.
///
/// Safe to call more than once; only the first call installs anything.
pub fn init_logging(filter: &str) {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}
