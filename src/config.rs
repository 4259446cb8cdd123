// src/config.rs
//
// Session configuration, loadable from JSON.

use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::dissonance::DissonanceConfig;
use crate::error::Result;
use crate::optimizer::SolverMethod;
use crate::timbre::{SynthPreset, Timbre};
use crate::voice::Envelope;

const DEFAULT_TICK: f64 = 0.01;

/// Settings shared by every voice the tuner starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthConfig {
    /// Scales note velocities into absolute amplitudes.
    pub global_amplitude: f64,
    pub timbre: Timbre,
    pub envelope: Envelope,
}

impl SynthConfig {
    pub fn from_preset(preset: &SynthPreset) -> Self {
        Self {
            timbre: preset.timbre.clone(),
            envelope: preset.envelope,
            ..Self::default()
        }
    }
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            global_amplitude: 0.01,
            timbre: Timbre::default(),
            envelope: Envelope::default(),
        }
    }
}

/// Top-level tuner configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    /// Seconds between periodic tuning passes.
    pub tuning_interval: f64,

    /// Seconds between receiving a note event and forwarding it to the
    /// sound output; the time budget of the optimiser.
    pub audio_lag: f64,

    /// Polling granularity of the tuning loop (s).
    pub tick: f64,

    pub save_session_log: bool,

    pub dissonance: DissonanceConfig,

    pub synth: SynthConfig,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            tuning_interval: 0.3,
            audio_lag: 0.3,
            tick: DEFAULT_TICK,
            save_session_log: false,
            // Live sessions run unbounded conjugate gradient.
            dissonance: DissonanceConfig {
                method: SolverMethod::ConjugateGradient,
                relative_bounds: None,
                ..DissonanceConfig::default()
            },
            synth: SynthConfig::default(),
        }
    }
}

impl TunerConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Non-positive or non-finite ticks fall back to 10 ms.
    pub fn tick_duration(&self) -> Duration {
        if self.tick.is_finite() && self.tick > 0.0 {
            Duration::from_secs_f64(self.tick)
        } else {
            Duration::from_secs_f64(DEFAULT_TICK)
        }
    }

    pub fn audio_lag_duration(&self) -> Duration {
        seconds(self.audio_lag)
    }

    pub fn tuning_interval_seconds(&self) -> f64 {
        self.tuning_interval.max(0.0)
    }
}

/// Negative or non-finite values become zero.
fn seconds(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TunerConfig::default();
        assert_eq!(config.tuning_interval, 0.3);
        assert_eq!(config.audio_lag, 0.3);
        assert_eq!(config.dissonance.method, SolverMethod::ConjugateGradient);
        assert_eq!(config.dissonance.relative_bounds, None);
        assert_eq!(config.dissonance.amplitude_threshold, 0.00002);
        assert_eq!(config.synth.global_amplitude, 0.01);
        assert_eq!(config.synth.envelope, Envelope::new(0.1, 0.1, 0.8, 0.2));
        assert!(!config.save_session_log);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = TunerConfig::from_json_str(
            r#"{
                "audio_lag": 0.1,
                "dissonance": { "method": "l_bfgs_b", "max_iterations": 50 },
                "synth": { "envelope": { "release_time": 1.5 } }
            }"#,
        )
        .unwrap();

        assert_eq!(config.audio_lag, 0.1);
        assert_eq!(config.tuning_interval, 0.3);
        assert_eq!(config.dissonance.method, SolverMethod::LBfgsB);
        assert_eq!(config.dissonance.max_iterations, Some(50));
        // Missing fields come from DissonanceConfig::default()
        assert!(config.dissonance.relative_bounds.is_some());
        assert_eq!(config.synth.envelope.release_time, 1.5);
        assert_eq!(config.synth.envelope.attack_time, 0.1);
        assert_eq!(config.synth.timbre.len(), 12);
    }

    #[test]
    fn test_json_roundtrip() {
        let mut config = TunerConfig::default();
        config.synth = SynthConfig::from_preset(&SynthPreset::piano());
        config.save_session_log = true;

        let json = config.to_json_string().unwrap();
        let loaded = TunerConfig::from_json_str(&json).unwrap();
        assert!(loaded.save_session_log);
        assert_eq!(loaded.dissonance.method, config.dissonance.method);
        assert_eq!(loaded.synth.envelope, config.synth.envelope);
        assert_eq!(loaded.synth.timbre.partials_amp()[1], 5.4);
        assert_eq!(loaded.synth.timbre.len(), 11);
    }

    #[test]
    fn test_bad_json_is_an_error() {
        assert!(TunerConfig::from_json_str("{ not json").is_err());
        assert!(TunerConfig::from_json_file("/nonexistent/adaptune.json").is_err());
    }

    #[test]
    fn test_durations_are_sanitized() {
        let config = TunerConfig {
            tick: -1.0,
            audio_lag: f64::NAN,
            tuning_interval: -2.0,
            ..TunerConfig::default()
        };
        assert_eq!(config.tick_duration(), Duration::from_millis(10));
        assert_eq!(config.audio_lag_duration(), Duration::ZERO);
        assert_eq!(config.tuning_interval_seconds(), 0.0);
    }
}
