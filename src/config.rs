//! Analysis configuration
//!
//! Optional TOML file tuning the decoder and the compliance checkers.
//! Every value has a default matching the protocol rules, so running
//! without a config file is the common case.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CilscopeError, Result};

/// Root configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Framing decoder settings
    pub decoder: DecoderSettings,

    /// Compliance checker thresholds
    pub checker: CheckerSettings,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| CilscopeError::ConfigError(format!("failed to read config file: {}", e)))?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| CilscopeError::ConfigError(format!("failed to parse config: {}", e)))
    }
}

/// Framing decoder settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderSettings {
    /// Destination ports treated as valid streams even when the capture
    /// missed the connection greeting
    pub force_ports: Vec<u16>,

    /// Largest declared frame length accepted before a flow is treated as
    /// corrupt and dropped
    pub max_frame_len: u64,
}

impl Default for DecoderSettings {
    fn default() -> Self {
        Self {
            force_ports: Vec::new(),
            max_frame_len: 256 * 1024 * 1024,
        }
    }
}

/// Compliance checker thresholds
///
/// Defaults follow the published protocol rules; the rate bounds carry a
/// half-second grace margin on each side.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckerSettings {
    /// Largest tolerated offset between capture time and message timestamp
    pub timestamp_max_error: f64,
    pub spectrum_usage_min_rate: f64,
    pub spectrum_usage_max_rate: f64,
    pub spectrum_voxel_max_time_offset: f64,
    pub location_update_min_rate: f64,
    pub location_update_max_rate: f64,
    pub location_info_max_history: f64,
    pub detailed_performance_min_rate: f64,
    pub detailed_performance_max_rate: f64,
    pub detailed_performance_max_history: f64,
    /// Minimum number of rate-limited messages required before the rate
    /// checks are meaningful
    pub rate_limited_min_count: u64,
    pub frequency_min: f64,
    pub frequency_max: f64,
    pub latitude_min: f64,
    pub latitude_max: f64,
    pub longitude_min: f64,
    pub longitude_max: f64,
    pub radio_id_min: u32,
    pub radio_id_max: u32,
    /// Longest tolerated gap between registration keepalives
    pub keepalive_max_interval: f64,
}

impl Default for CheckerSettings {
    fn default() -> Self {
        Self {
            timestamp_max_error: 5.0,
            spectrum_usage_min_rate: 0.5,
            spectrum_usage_max_rate: 30.5,
            spectrum_voxel_max_time_offset: 60.5,
            location_update_min_rate: 0.5,
            location_update_max_rate: 30.5,
            location_info_max_history: 60.5,
            detailed_performance_min_rate: 0.5,
            detailed_performance_max_rate: 10.5,
            detailed_performance_max_history: 10.5,
            rate_limited_min_count: 2,
            // 900 MHz..1100 MHz band with a 20 MHz guard on each side
            frequency_min: 900e6 - 20e6,
            frequency_max: 1100e6 + 20e6,
            latitude_min: -90.0,
            latitude_max: 90.0,
            longitude_min: -180.0,
            longitude_max: 180.0,
            radio_id_min: 1,
            radio_id_max: 128,
            keepalive_max_interval: 30.5,
        }
    }
}
