//! Engine configuration
//!
//! A single aggregate configuration structure. Defaults match a global
//! network; every field can be overridden from a JSON file (partial files are
//! fine) or from `AUTOLOC_*` environment variables.

use crate::error::{AutolocError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::str::FromStr;

/// Kind of network the engine is tuned for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkType {
    Global,
    Regional,
    Local,
}

impl FromStr for NetworkType {
    type Err = AutolocError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "global" | "globalnetwork" => Ok(NetworkType::Global),
            "regional" | "regionalnetwork" => Ok(NetworkType::Regional),
            "local" | "localnetwork" => Ok(NetworkType::Local),
            other => Err(AutolocError::Config(format!("unknown network type '{}'", other))),
        }
    }
}

/// Which origin wins when two equivalent origins are merged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeCriterion {
    /// Higher origin score is the base of the merge
    Score,
    /// More defining phases is the base of the merge
    DefiningPhaseCount,
}

impl FromStr for MergeCriterion {
    type Err = AutolocError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "score" => Ok(MergeCriterion::Score),
            "definingphasecount" | "phasecount" => Ok(MergeCriterion::DefiningPhaseCount),
            other => Err(AutolocError::Config(format!("unknown merge criterion '{}'", other))),
        }
    }
}

/// Configuration of the autoloc engine
///
/// Times are in seconds, distances in degrees unless the name says km.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Picks and origins older than this are purged
    pub max_age: f64,

    /// Sliding window of the per-station recent-pick throttle
    pub dynamic_pick_threshold_interval: f64,

    #[serde(rename = "goodRMS", alias = "goodRms")]
    pub good_rms: f64,
    #[serde(rename = "maxRMS", alias = "maxRms")]
    pub max_rms: f64,

    /// Residual above which an arrival is not used for location
    pub max_residual_use: f64,

    /// Residual above which an excluded arrival is dropped entirely
    pub max_residual_keep: f64,

    pub default_depth: f64,
    pub default_depth_stickiness: f64,
    pub try_default_depth: bool,
    pub adopt_manual_depth: bool,
    pub minimum_depth: f64,
    pub max_depth: f64,

    pub max_azi_gap_secondary: f64,
    pub max_sta_dist: f64,
    pub default_max_nuc_dist: f64,

    #[serde(rename = "minPickSNR", alias = "minPickSnr")]
    pub min_pick_snr: f64,
    pub min_pick_affinity: f64,
    pub min_phase_count: usize,
    pub min_score: f64,
    #[serde(rename = "minStaCountIgnorePKP", alias = "minStaCountIgnorePkp")]
    pub min_sta_count_ignore_pkp: usize,
    pub min_score_bypass_nucleator: f64,
    pub max_allowed_fake_probability: f64,
    pub dist_slope: f64,

    pub cleanup_interval: f64,

    pub xxl_enabled: bool,
    pub xxl_min_amplitude: f64,
    #[serde(rename = "xxlMinSNR", alias = "xxlMinSnr")]
    pub xxl_min_snr: f64,
    pub xxl_min_phase_count: usize,
    pub xxl_max_sta_dist: f64,
    pub xxl_max_depth: f64,
    pub xxl_dead_time: f64,

    pub publication_interval_time_slope: f64,
    pub publication_interval_time_intercept: f64,
    pub publication_interval_pick_count: usize,

    #[serde(rename = "aggressivePKP", alias = "aggressivePkp")]
    pub aggressive_pkp: bool,
    pub network_type: NetworkType,

    /// Network aperture used by the distance score; 0 disables it in favour
    /// of the station's maximum nucleation distance
    pub network_size_km: f64,

    pub use_manual_picks: bool,
    pub use_manual_origins: bool,
    pub use_imported_origins: bool,

    /// Clock follows the pick stream instead of the wall clock
    pub playback: bool,
    pub offline: bool,

    /// Do not hand origins to the reporting sink
    pub test: bool,
    pub report_all_phases: bool,

    /// Run the iterative outlier-exclusion loop in score enhancement
    pub enable_outlier_enhancement: bool,
    pub merge_criterion: MergeCriterion,

    pub grid_file: Option<String>,
    pub station_config_file: Option<String>,
    pub pick_log_file: Option<String>,

    #[serde(rename = "amplTypeSNR", alias = "amplTypeSnr")]
    pub ampl_type_snr: String,
    pub ampl_type_abs: String,

    /// Interval of the housekeeping timer in the playback runtime
    pub wakeup_interval: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_age: 6.0 * 3600.0,
            dynamic_pick_threshold_interval: 3600.0,
            good_rms: 1.5,
            max_rms: 3.5,
            max_residual_use: 7.0,
            max_residual_keep: 21.0,
            default_depth: 10.0,
            default_depth_stickiness: 0.5,
            try_default_depth: true,
            adopt_manual_depth: false,
            minimum_depth: 5.0,
            max_depth: 1000.0,
            max_azi_gap_secondary: 360.0,
            max_sta_dist: 180.0,
            default_max_nuc_dist: 180.0,
            min_pick_snr: 3.0,
            min_pick_affinity: 0.05,
            min_phase_count: 6,
            min_score: 8.0,
            min_sta_count_ignore_pkp: 15,
            min_score_bypass_nucleator: 40.0,
            max_allowed_fake_probability: 0.2,
            dist_slope: 1.0,
            cleanup_interval: 3600.0,
            xxl_enabled: false,
            xxl_min_amplitude: 10000.0,
            xxl_min_snr: 8.0,
            xxl_min_phase_count: 4,
            xxl_max_sta_dist: 15.0,
            xxl_max_depth: 100.0,
            xxl_dead_time: 120.0,
            publication_interval_time_slope: 0.5,
            publication_interval_time_intercept: 0.0,
            publication_interval_pick_count: 20,
            aggressive_pkp: true,
            network_type: NetworkType::Global,
            network_size_km: 0.0,
            use_manual_picks: false,
            use_manual_origins: false,
            use_imported_origins: false,
            playback: false,
            offline: false,
            test: false,
            report_all_phases: false,
            enable_outlier_enhancement: false,
            merge_criterion: MergeCriterion::Score,
            grid_file: None,
            station_config_file: None,
            pick_log_file: None,
            ampl_type_snr: "snr".to_string(),
            ampl_type_abs: "mb".to_string(),
            wakeup_interval: 5.0,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_path(key: &str, default: Option<String>) -> Option<String> {
    match env::var(key) {
        Ok(s) if s.is_empty() => None,
        Ok(s) => Some(s),
        Err(_) => default,
    }
}

impl Config {
    /// Load configuration from a JSON file; missing keys keep their defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&text)?;
        config.validated()
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `AUTOLOC_*` environment overrides to this configuration
    ///
    /// Environment variables (a selection):
    /// - `AUTOLOC_MAX_AGE`, `AUTOLOC_MAX_RMS`, `AUTOLOC_MAX_RESIDUAL`
    /// - `AUTOLOC_DEFAULT_DEPTH`, `AUTOLOC_DEFAULT_DEPTH_STICKINESS`
    /// - `AUTOLOC_MIN_PHASE_COUNT`, `AUTOLOC_MIN_SCORE`
    /// - `AUTOLOC_XXL_ENABLE`, `AUTOLOC_XXL_MIN_AMPLITUDE`
    /// - `AUTOLOC_GRID_FILE`, `AUTOLOC_STATION_CONFIG`, `AUTOLOC_PICK_LOG`
    /// - `AUTOLOC_PLAYBACK`, `AUTOLOC_TEST`, `AUTOLOC_NETWORK_TYPE`
    pub fn with_env_overrides(self) -> Self {
        let d = self;
        Self {
            max_age: env_or("AUTOLOC_MAX_AGE", d.max_age),
            dynamic_pick_threshold_interval: env_or(
                "AUTOLOC_DYNAMIC_PICK_THRESHOLD_INTERVAL",
                d.dynamic_pick_threshold_interval,
            ),
            good_rms: env_or("AUTOLOC_GOOD_RMS", d.good_rms),
            max_rms: env_or("AUTOLOC_MAX_RMS", d.max_rms),
            max_residual_use: env_or("AUTOLOC_MAX_RESIDUAL", d.max_residual_use),
            max_residual_keep: d.max_residual_keep,
            default_depth: env_or("AUTOLOC_DEFAULT_DEPTH", d.default_depth),
            default_depth_stickiness: env_or(
                "AUTOLOC_DEFAULT_DEPTH_STICKINESS",
                d.default_depth_stickiness,
            ),
            try_default_depth: env_or("AUTOLOC_TRY_DEFAULT_DEPTH", d.try_default_depth),
            adopt_manual_depth: env_or("AUTOLOC_ADOPT_MANUAL_DEPTH", d.adopt_manual_depth),
            minimum_depth: env_or("AUTOLOC_MINIMUM_DEPTH", d.minimum_depth),
            max_depth: env_or("AUTOLOC_MAX_DEPTH", d.max_depth),
            max_azi_gap_secondary: env_or("AUTOLOC_MAX_SGAP", d.max_azi_gap_secondary),
            max_sta_dist: env_or("AUTOLOC_MAX_STATION_DISTANCE", d.max_sta_dist),
            default_max_nuc_dist: env_or(
                "AUTOLOC_DEFAULT_MAX_NUCLEATION_DISTANCE",
                d.default_max_nuc_dist,
            ),
            min_pick_snr: env_or("AUTOLOC_MIN_PICK_SNR", d.min_pick_snr),
            min_pick_affinity: env_or("AUTOLOC_MIN_PICK_AFFINITY", d.min_pick_affinity),
            min_phase_count: env_or("AUTOLOC_MIN_PHASE_COUNT", d.min_phase_count),
            min_score: env_or("AUTOLOC_MIN_SCORE", d.min_score),
            min_sta_count_ignore_pkp: env_or(
                "AUTOLOC_MIN_STA_COUNT_IGNORE_PKP",
                d.min_sta_count_ignore_pkp,
            ),
            min_score_bypass_nucleator: env_or(
                "AUTOLOC_MIN_SCORE_BYPASS_NUCLEATOR",
                d.min_score_bypass_nucleator,
            ),
            max_allowed_fake_probability: env_or(
                "AUTOLOC_MAX_ALLOWED_FAKE_PROBABILITY",
                d.max_allowed_fake_probability,
            ),
            dist_slope: env_or("AUTOLOC_DIST_SLOPE", d.dist_slope),
            cleanup_interval: env_or("AUTOLOC_CLEANUP_INTERVAL", d.cleanup_interval),
            xxl_enabled: env_or("AUTOLOC_XXL_ENABLE", d.xxl_enabled),
            xxl_min_amplitude: env_or("AUTOLOC_XXL_MIN_AMPLITUDE", d.xxl_min_amplitude),
            xxl_min_snr: env_or("AUTOLOC_XXL_MIN_SNR", d.xxl_min_snr),
            xxl_min_phase_count: env_or("AUTOLOC_XXL_MIN_PHASE_COUNT", d.xxl_min_phase_count),
            xxl_max_sta_dist: env_or("AUTOLOC_XXL_MAX_STATION_DISTANCE", d.xxl_max_sta_dist),
            xxl_max_depth: env_or("AUTOLOC_XXL_MAX_DEPTH", d.xxl_max_depth),
            xxl_dead_time: env_or("AUTOLOC_XXL_DEAD_TIME", d.xxl_dead_time),
            publication_interval_time_slope: env_or(
                "AUTOLOC_PUBLICATION_INTERVAL_TIME_SLOPE",
                d.publication_interval_time_slope,
            ),
            publication_interval_time_intercept: env_or(
                "AUTOLOC_PUBLICATION_INTERVAL_TIME_INTERCEPT",
                d.publication_interval_time_intercept,
            ),
            publication_interval_pick_count: env_or(
                "AUTOLOC_PUBLICATION_INTERVAL_PICK_COUNT",
                d.publication_interval_pick_count,
            ),
            aggressive_pkp: env_or("AUTOLOC_AGGRESSIVE_PKP", d.aggressive_pkp),
            network_type: env_or("AUTOLOC_NETWORK_TYPE", d.network_type),
            network_size_km: env_or("AUTOLOC_NETWORK_SIZE_KM", d.network_size_km),
            use_manual_picks: env_or("AUTOLOC_USE_MANUAL_PICKS", d.use_manual_picks),
            use_manual_origins: env_or("AUTOLOC_USE_MANUAL_ORIGINS", d.use_manual_origins),
            use_imported_origins: env_or("AUTOLOC_USE_IMPORTED_ORIGINS", d.use_imported_origins),
            playback: env_or("AUTOLOC_PLAYBACK", d.playback),
            offline: env_or("AUTOLOC_OFFLINE", d.offline),
            test: env_or("AUTOLOC_TEST", d.test),
            report_all_phases: env_or("AUTOLOC_REPORT_ALL_PHASES", d.report_all_phases),
            enable_outlier_enhancement: env_or(
                "AUTOLOC_ENABLE_OUTLIER_ENHANCEMENT",
                d.enable_outlier_enhancement,
            ),
            merge_criterion: env_or("AUTOLOC_MERGE_CRITERION", d.merge_criterion),
            grid_file: env_path("AUTOLOC_GRID_FILE", d.grid_file),
            station_config_file: env_path("AUTOLOC_STATION_CONFIG", d.station_config_file),
            pick_log_file: env_path("AUTOLOC_PICK_LOG", d.pick_log_file),
            ampl_type_snr: env::var("AUTOLOC_AMPL_TYPE_SNR").unwrap_or(d.ampl_type_snr),
            ampl_type_abs: env::var("AUTOLOC_AMPL_TYPE_ABS").unwrap_or(d.ampl_type_abs),
            wakeup_interval: env_or("AUTOLOC_WAKEUP_INTERVAL", d.wakeup_interval),
        }
    }

    /// Check consistency and derive dependent values
    pub fn validated(mut self) -> Result<Self> {
        if self.max_residual_keep < 3.0 * self.max_residual_use {
            self.max_residual_keep = 3.0 * self.max_residual_use;
        }
        if self.max_rms < self.good_rms {
            return Err(AutolocError::Config(format!(
                "maxRMS ({}) must not be smaller than goodRMS ({})",
                self.max_rms, self.good_rms
            )));
        }
        if self.min_phase_count < 4 {
            return Err(AutolocError::Config(format!(
                "minPhaseCount must be at least 4, got {}",
                self.min_phase_count
            )));
        }
        if self.max_age < 0.0 {
            return Err(AutolocError::Config("maxAge must not be negative".to_string()));
        }
        self.default_depth_stickiness = self.default_depth_stickiness.clamp(0.0, 1.0);
        Ok(self)
    }
}
