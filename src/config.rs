//! Configuration for yantra-core
//!
//! Loads configuration from a TOML file. All homing/calibration tuning
//! values and MMU protocol timings are named fields here so they can be
//! adjusted per printer model without code changes.

use crate::error::Result;
use crate::motion::kinematics::CoreXyGeometry;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub geometry: CoreXyGeometry,
    pub homing: HomingConfig,
    pub mmu: MmuConfig,
    pub logging: LoggingConfig,
}

/// Tuning for the precise-homing measurement routines
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HomingConfig {
    /// Distance from the physical home corner at which the refinement
    /// grid is anchored (mm)
    pub origin_offset_mm: f32,

    /// Retry budget for the opposed bump pairs in one cycle measurement.
    /// Two consecutive pairs must agree within `bump_max_err_mm` before
    /// the budget runs out.
    pub bump_retries: u8,

    /// Agreement tolerance between consecutive bump pairs (mm)
    pub bump_max_err_mm: f32,

    /// RMS current applied to the holding (non-measured) motor during a
    /// cycle measurement (mA)
    pub holding_current_ma: u32,

    /// Optional RMS current override for the measured motor (mA).
    /// `None` keeps the configured running current.
    pub measure_current_ma: Option<u32>,

    /// Feedrate for bump probes (mm/s)
    pub measure_feedrate_mm_s: f32,

    /// Feedrate for repositioning moves during refinement (mm/s)
    pub home_feedrate_mm_s: f32,

    /// A grid point whose fractional cycle distance is closer than this
    /// to the halfway line is considered unstable and gets revalidated
    /// (fraction of one AB cycle)
    pub stability_threshold: f32,
}

/// MMU protocol timings and link parameters
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MmuConfig {
    /// Serial port of the MMU link (UART variant)
    pub port: String,
    /// Baud rate of the MMU link
    pub baud: u32,

    /// Heartbeat query period while idle or polling a command (ms)
    pub heartbeat_period_ms: u64,
    /// Link-layer timeout: no traffic within this window is a
    /// communication timeout (ms)
    pub link_timeout_ms: u64,

    /// Per-stage retry budget for the version handshake
    pub version_retries: u8,
    /// Consecutive identical drop-out-class failures required before the
    /// failure is surfaced upward (see `mmu::logic::DropOutFilter`)
    pub dropout_occurrences: u8,
    /// Automatic retries granted for user button presses
    pub button_retries: u8,

    /// MMU firmware version this printer firmware is compatible with
    /// (major, minor, patch)
    pub supported_version: [u8; 3],

    /// Init register: extra filament load distance (mm)
    pub extra_load_distance: u8,
    /// Init register: pulley slow feedrate (mm/s)
    pub pulley_slow_feedrate: u8,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log output (stdout, stderr, or file path)
    pub output: String,
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Default configuration for a 250mm CoreXY printer with min-homing
    /// on both axes and 16-microstep drivers.
    ///
    /// Suitable for testing and development. Production deployments
    /// should use a proper TOML configuration file.
    pub fn corexy_defaults() -> Self {
        Self {
            geometry: CoreXyGeometry::default(),
            homing: HomingConfig::default(),
            mmu: MmuConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                output: "stdout".to_string(),
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::corexy_defaults()
    }
}

impl Default for HomingConfig {
    fn default() -> Self {
        Self {
            origin_offset_mm: 5.0,
            bump_retries: 6,
            bump_max_err_mm: 0.1,
            holding_current_ma: 600,
            measure_current_ma: None,
            measure_feedrate_mm_s: 40.0,
            home_feedrate_mm_s: 50.0,
            stability_threshold: 0.25,
        }
    }
}

impl Default for MmuConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyS2".to_string(),
            baud: 115_200,
            heartbeat_period_ms: 300,
            link_timeout_ms: 2000,
            version_retries: 3,
            dropout_occurrences: 3,
            button_retries: 3,
            supported_version: [3, 0, 3],
            extra_load_distance: 30,
            pulley_slow_feedrate: 20,
        }
    }
}
