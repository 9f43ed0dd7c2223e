//! Configuration management for tracker tuning
//!
//! This module provides runtime configuration loading from JSON files so the
//! detector thresholds, evaluator responsiveness and weight tables can be
//! adjusted without recompilation. The weight tables live here rather than in
//! the evaluators because they differ between firmware revisions; the
//! defaults below are the most recent tables.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard};

use crate::error::ConfigError;
use crate::state::{Micros, TWO_BAR_LENGTH};

/// Longest slope window a channel detector keeps history for
pub const MAX_SLOPE_WINDOW: usize = 600;

/// Upper bound for the tempo latency smoothing amount
pub const MAX_LATENCY_SMOOTHING: u16 = 8;

/// Highest inter-onset multiple of tau the tempo evaluator scores
pub const MAX_IOI_MULTIPLE: usize = 16;

/// Complete application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub tempo: TempoConfig,
    #[serde(default)]
    pub clock: ClockConfig,
    #[serde(default)]
    pub audio: AudioConfig,
}

/// Onset filter parameters for one drum channel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelFilterConfig {
    /// Amount subtracted from the envelope per sample while it decays
    pub decay: u16,
    /// Minimum envelope rise across the slope window that counts as an onset
    pub slope_threshold: i32,
    /// Number of envelope samples between the two slope points
    pub slope_window: usize,
    /// Retrigger gate after an onset, in microseconds
    pub gate_us: Micros,
}

impl Default for ChannelFilterConfig {
    fn default() -> Self {
        Self {
            decay: 20,
            slope_threshold: 100,
            slope_window: 50,
            gate_us: 200_000,
        }
    }
}

/// Onset detector configuration (one filter per instrument)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    #[serde(default)]
    pub kick: ChannelFilterConfig,
    #[serde(default)]
    pub snare: ChannelFilterConfig,
}

/// Sync evaluator parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Responsiveness of the phase correction
    pub beta: f64,
    /// Window narrowing ratio applied after a confident match
    pub narrow_ratio: f64,
    /// Window widening ratio applied after a miss
    pub expand_ratio: f64,
    /// Accuracy margin above theta required before tightening
    pub headroom: f64,
    /// Sigma never drops below `tau / sigma_width_factor`
    pub sigma_width_factor: u32,
    /// Threshold restored on reset
    pub initial_theta: f64,
    /// Weight per instrument (kick, snare) and bar position
    pub weights: [[f64; TWO_BAR_LENGTH]; 2],
}

impl Default for SyncConfig {
    fn default() -> Self {
        let row = [
            1.0, 0.1, 1.0, 0.1, 1.0, 0.1, 1.0, 0.1, 1.0, 0.1, 1.0, 0.1, 1.0, 0.1, 1.0, 0.1,
        ];
        Self {
            beta: 0.6,
            narrow_ratio: 1.0,
            expand_ratio: 1.0,
            headroom: 0.1,
            sigma_width_factor: 10,
            initial_theta: 0.8,
            weights: [row, row],
        }
    }
}

/// Tempo evaluator parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempoConfig {
    /// Responsiveness of the tempo correction
    pub alpha: f64,
    /// Corrections smaller than this are not sent to the clock
    pub deadband_us: Micros,
    /// Accuracy margin above theta required before tightening
    pub headroom: f64,
    /// Sigma never drops below `tau / sigma_width_factor`
    pub sigma_width_factor: u32,
    /// Threshold restored on reset
    pub initial_theta: f64,
    /// Weight per inter-onset interval measured in tatums (index 0..=16)
    pub weights: [f64; MAX_IOI_MULTIPLE + 1],
}

impl Default for TempoConfig {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            deadband_us: 900,
            headroom: 0.1,
            sigma_width_factor: 20,
            initial_theta: 0.8,
            weights: [
                0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.92, 0.0, 0.8, 0.0, 0.0, 0.0, 0.0,
            ],
        }
    }
}

/// Beat clock parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClockConfig {
    /// Tau used before any performance has been bootstrapped (120 BPM)
    pub default_tau_us: Micros,
    /// Number of upcoming bar positions a tempo correction is spread across
    pub latency_smoothing: u16,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            default_tau_us: 250_000,
            latency_smoothing: 0,
        }
    }
}

/// Sensor input configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Raw sampling rate of the sensor input in Hz
    pub sample_rate: u32,
    /// Raw samples averaged into one detector frame
    pub oversampling: usize,
    /// Detector frames per sample block
    pub block_frames: usize,
    /// Number of pre-allocated sample blocks
    pub buffer_count: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            oversampling: 8,
            block_frames: 32,
            buffer_count: 16,
        }
    }
}

impl AudioConfig {
    /// Duration of one detector frame in microseconds
    pub fn frame_period_us(&self) -> f64 {
        self.oversampling.max(1) as f64 * 1_000_000.0 / self.sample_rate.max(1) as f64
    }
}

/// Patch describing tunable updates applied while the tracker runs.
///
/// Every externally tunable value has exactly one write-point: this patch.
/// Missing fields leave the current value untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamPatch {
    #[serde(default)]
    pub kick: Option<ChannelFilterConfig>,
    #[serde(default)]
    pub snare: Option<ChannelFilterConfig>,
    #[serde(default)]
    pub beta: Option<f64>,
    #[serde(default)]
    pub narrow_ratio: Option<f64>,
    #[serde(default)]
    pub expand_ratio: Option<f64>,
    #[serde(default)]
    pub alpha: Option<f64>,
    #[serde(default)]
    pub latency_smoothing: Option<u16>,
}

impl AppConfig {
    /// Load configuration from JSON file
    ///
    /// # Returns
    /// The parsed configuration, or the defaults (with a warning) if the file
    /// is missing or malformed.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Self {
        match Self::try_load(&path) {
            Ok(config) => {
                log::info!("[Config] Loaded configuration from {:?}", path.as_ref());
                config
            }
            Err(err) => {
                log::warn!(
                    "[Config] Failed to load config {:?}: {}. Using defaults.",
                    path.as_ref(),
                    err
                );
                Self::default()
            }
        }
    }

    /// Load and validate configuration, surfacing every failure
    pub fn try_load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(&path)?;
        let config: AppConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the values the tracker relies on for well-formed arithmetic
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.clock.default_tau_us <= 0 {
            return Err(invalid("clock.default_tau_us", "must be > 0"));
        }
        if self.clock.latency_smoothing > MAX_LATENCY_SMOOTHING {
            return Err(invalid(
                "clock.latency_smoothing",
                &format!("must be <= {}", MAX_LATENCY_SMOOTHING),
            ));
        }
        if self.sync.sigma_width_factor == 0 {
            return Err(invalid("sync.sigma_width_factor", "must be > 0"));
        }
        if self.tempo.sigma_width_factor == 0 {
            return Err(invalid("tempo.sigma_width_factor", "must be > 0"));
        }
        for (name, channel) in [("kick", &self.detector.kick), ("snare", &self.detector.snare)] {
            if channel.slope_window == 0 || channel.slope_window >= MAX_SLOPE_WINDOW {
                return Err(invalid(
                    &format!("detector.{}.slope_window", name),
                    &format!("must be within 1..{}", MAX_SLOPE_WINDOW),
                ));
            }
            if channel.gate_us < 0 {
                return Err(invalid(&format!("detector.{}.gate_us", name), "must be >= 0"));
            }
        }
        if self.audio.oversampling == 0 || self.audio.block_frames == 0 {
            return Err(invalid("audio", "oversampling and block_frames must be > 0"));
        }
        if self.audio.buffer_count < 2 {
            return Err(invalid("audio.buffer_count", "must be >= 2"));
        }
        Ok(())
    }

    /// Apply a tunables patch in place
    pub fn apply_patch(&mut self, patch: &ParamPatch) {
        if let Some(kick) = patch.kick {
            self.detector.kick = kick;
        }
        if let Some(snare) = patch.snare {
            self.detector.snare = snare;
        }
        if let Some(beta) = patch.beta {
            self.sync.beta = beta;
        }
        if let Some(narrow) = patch.narrow_ratio {
            self.sync.narrow_ratio = narrow;
        }
        if let Some(expand) = patch.expand_ratio {
            self.sync.expand_ratio = expand;
        }
        if let Some(alpha) = patch.alpha {
            self.tempo.alpha = alpha;
        }
        if let Some(smoothing) = patch.latency_smoothing {
            self.clock.latency_smoothing = smoothing.min(MAX_LATENCY_SMOOTHING);
        }
    }
}

/// Live configuration shared by the tracker threads.
///
/// Workers read the section they need at the start of each block, pass or
/// correction; `apply_patch` is the only writer.
#[derive(Debug, Clone, Default)]
pub struct Tunables {
    inner: Arc<RwLock<AppConfig>>,
}

impl Tunables {
    pub fn new(config: AppConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, AppConfig> {
        self.inner.read().unwrap_or_else(|poisoned| {
            log::error!("[Tunables] lock poisoned, using last written values");
            poisoned.into_inner()
        })
    }

    /// Copy of the whole configuration
    pub fn current(&self) -> AppConfig {
        self.read().clone()
    }

    pub fn detector(&self) -> DetectorConfig {
        self.read().detector
    }

    pub fn sync(&self) -> SyncConfig {
        self.read().sync.clone()
    }

    pub fn tempo(&self) -> TempoConfig {
        self.read().tempo.clone()
    }

    pub fn latency_smoothing(&self) -> u16 {
        self.read().clock.latency_smoothing
    }

    pub fn apply_patch(&self, patch: &ParamPatch) {
        let mut config = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        config.apply_patch(patch);
        log::info!("[Tunables] Applied patch {:?}", patch);
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
