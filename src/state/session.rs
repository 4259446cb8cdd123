// src/state/session.rs
//
// Session log.
//
// A session optionally records every tuning pass: what was sounding, what
// the audio analysis reported, and where the optimiser moved the notes.
// It can be serialized for later analysis.

use std::{
    fs,
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::config::TunerConfig;
use crate::dissonance::DissonanceModel;
use crate::error::Result;
use crate::optimizer::SolverMethod;
use crate::scale::{NamedTuning, Scale, ScaleTable, equal_temperament_frequency};

/// Tuner parameters in effect for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionParams {
    pub tuning_interval: f64,
    pub audio_lag: f64,
    pub method: SolverMethod,
    pub relative_bounds: Option<(f64, f64)>,
    pub max_iterations: Option<usize>,
}

impl From<&TunerConfig> for SessionParams {
    fn from(config: &TunerConfig) -> Self {
        Self {
            tuning_interval: config.tuning_interval,
            audio_lag: config.audio_lag,
            method: config.dissonance.method,
            relative_bounds: config.dissonance.relative_bounds,
            max_iterations: config.dissonance.max_iterations,
        }
    }
}

/// One tuning pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningRecord {
    /// Seconds since the session started.
    pub elapsed: f64,

    pub pitches: Vec<u8>,

    /// Equal-tempered starting point of the pass.
    pub fundamentals_freq: Vec<f64>,
    pub fundamentals_amp: Vec<f64>,

    pub partials_pos: Vec<f64>,
    pub partials_amp: Vec<f64>,

    pub fixed_freq: Vec<f64>,
    pub fixed_amp: Vec<f64>,

    pub tuned_fundamentals: Vec<f64>,

    pub success: bool,
    pub message: String,
}

/// Dissonance of one recorded chord under three tunings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DissonanceComparison {
    pub tuned: f64,
    pub equal_tempered: f64,
    /// Natural (JI) keyed to C4.
    pub just_intonation: f64,
}

impl TuningRecord {
    /// Score the tuned, equal-tempered and just-intonation versions of the chord.
    pub fn dissonance_comparison(&self, model: &DissonanceModel) -> DissonanceComparison {
        let score = |fundamentals: &[f64]| {
            model
                .single_dissonance_and_gradient(
                    fundamentals,
                    &self.fundamentals_amp,
                    &self.partials_pos,
                    &self.partials_amp,
                    &self.fixed_freq,
                    &self.fixed_amp,
                )
                .0
        };

        let just = Scale::with_tuning(NamedTuning::Natural);
        let et: Vec<f64> = self
            .pitches
            .iter()
            .map(|&p| equal_temperament_frequency(p))
            .collect();
        let ji: Vec<f64> = self.pitches.iter().map(|&p| just.frequency(p)).collect();

        DissonanceComparison {
            tuned: score(&self.tuned_fundamentals),
            equal_tempered: score(&et),
            just_intonation: score(&ji),
        }
    }
}

/// Everything a session recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionLog {
    pub name: String,
    pub params: SessionParams,
    pub tunings: Vec<TuningRecord>,
}

impl SessionLog {
    /// A log named after the current wall-clock time.
    pub fn new(params: SessionParams) -> Self {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self::with_name(format!("tuning_session_log_{}", stamp), params)
    }

    pub fn with_name(name: impl Into<String>, params: SessionParams) -> Self {
        Self {
            name: name.into(),
            params,
            tunings: Vec::new(),
        }
    }

    pub fn push(&mut self, record: TuningRecord) {
        self.tunings.push(record);
    }

    pub fn len(&self) -> usize {
        self.tunings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunings.is_empty()
    }

    pub fn default_file_name(&self) -> String {
        format!("{}.json", self.name)
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn read_json(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// [`TuningRecord::dissonance_comparison`] for every pass, with its time.
    pub fn dissonance_comparisons(&self, model: &DissonanceModel) -> Vec<(f64, DissonanceComparison)> {
        self.tunings
            .iter()
            .map(|record| (record.elapsed, record.dissonance_comparison(model)))
            .collect()
    }
}
