//! Runtime configuration
//!
//! Settings are read from `WAYLAYER_*` environment variables. Missing values
//! use the defaults, malformed values are logged and ignored.

use std::time::Duration;

use log::{debug, warn};

/// Environment variable prefix for all settings
pub const ENV_PREFIX: &str = "WAYLAYER_";

/// Layer manager configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Interval of synthetic frame callbacks for surfaces without a buffer
    pub emulated_frame_interval: Duration,
    /// Interval of the main-thread frame tick in the event loop
    pub frame_interval: Duration,
    /// Allocate GPU (dma-buf) buffers when an allocator is available
    pub use_dmabuf: bool,
    /// Bind wp_fractional_scale_v1 and honor fractional scales
    pub fractional_scale: bool,
    /// Number of free buffers a layer keeps around for recycling
    pub max_spare_buffers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            emulated_frame_interval: Duration::from_millis(16),
            frame_interval: Duration::from_millis(16),
            use_dmabuf: true,
            fractional_scale: true,
            max_spare_buffers: 2,
        }
    }
}

impl Config {
    /// Load configuration from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(ms) = parse_value::<u64>("EMULATED_FRAME_MS", get("EMULATED_FRAME_MS")) {
            config.emulated_frame_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_value::<u64>("FRAME_INTERVAL_MS", get("FRAME_INTERVAL_MS")) {
            if ms == 0 {
                warn!("{}FRAME_INTERVAL_MS must be non-zero, keeping default", ENV_PREFIX);
            } else {
                config.frame_interval = Duration::from_millis(ms);
            }
        }
        if let Some(flag) = parse_flag("USE_DMABUF", get("USE_DMABUF")) {
            config.use_dmabuf = flag;
        }
        if let Some(flag) = parse_flag("FRACTIONAL_SCALE", get("FRACTIONAL_SCALE")) {
            config.fractional_scale = flag;
        }
        if let Some(count) = parse_value::<usize>("MAX_SPARE_BUFFERS", get("MAX_SPARE_BUFFERS")) {
            config.max_spare_buffers = count;
        }

        debug!("Loaded config {:?}", config);
        config
    }
}

fn parse_value<T: std::str::FromStr>(name: &str, raw: Option<String>) -> Option<T> {
    let raw = raw?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring malformed {}{}={:?}", ENV_PREFIX, name, raw);
            None
        }
    }
}

fn parse_flag(name: &str, raw: Option<String>) -> Option<bool> {
    let raw = raw?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!("Ignoring malformed {}{}={:?}", ENV_PREFIX, name, raw);
            None
        }
    }
}
