use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    backend::{AudioFormat, ColorSpace},
    Result,
};

/// Top-level configuration structure for the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub session: SessionConfig,
    pub sync: SyncConfig,
    pub tick: TickConfig,
}

impl EngineConfig {
    /// Parses a configuration from JSON. Missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads and parses a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// What a session does once its presentation time crosses the stop bound.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopAction {
    #[default]
    Pause,
    Stop,
}

/// Per-session settings handed to the backend on open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub audio_buffer_size: usize,
    pub audio_format: AudioFormat,
    pub color_space: ColorSpace,
    pub stop_action: StopAction,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            audio_buffer_size: 4 * 1024,
            audio_format: AudioFormat::default(),
            color_space: ColorSpace::default(),
            stop_action: StopAction::default(),
        }
    }
}

/// Drift correction settings for [`crate::ClockSynchronizer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub drift_threshold_ms: u64,
    /// Re-check drift even when the presentation time has not moved.
    pub force_periodic_update: bool,
}

impl SyncConfig {
    pub fn threshold_seconds(&self) -> f64 {
        self.drift_threshold_ms as f64 / 1000.0
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            drift_threshold_ms: 30,
            force_periodic_update: false,
        }
    }
}

/// Cadence of [`crate::TickEngine`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TickConfig {
    pub period_ms: u64,
}

impl TickConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms.max(1))
    }
}

impl Default for TickConfig {
    fn default() -> Self {
        Self { period_ms: 31 }
    }
}
