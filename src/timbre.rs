// src/timbre.rs
//
// Partial spectra and synth presets.
//
// Every complex tone in one optimisation shares a single timbre: relative
// partial positions (1.0 = fundamental) and relative partial amplitudes.

use serde::{Deserialize, Serialize};

use crate::voice::Envelope;

/// Relative partial positions and amplitudes, always of equal length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawTimbre", into = "RawTimbre")]
pub struct Timbre {
    partials_pos: Vec<f64>,
    partials_amp: Vec<f64>,
}

/// Unchecked serialized form.
#[derive(Serialize, Deserialize)]
struct RawTimbre {
    partials_pos: Vec<f64>,
    partials_amp: Vec<f64>,
}

impl From<RawTimbre> for Timbre {
    fn from(raw: RawTimbre) -> Self {
        Timbre::new(raw.partials_pos, raw.partials_amp)
    }
}

impl From<Timbre> for RawTimbre {
    fn from(timbre: Timbre) -> Self {
        RawTimbre {
            partials_pos: timbre.partials_pos,
            partials_amp: timbre.partials_amp,
        }
    }
}

impl Timbre {
    /// Both sides are cut to the shorter one.
    pub fn new(mut partials_pos: Vec<f64>, mut partials_amp: Vec<f64>) -> Self {
        let len = partials_pos.len().min(partials_amp.len());
        partials_pos.truncate(len);
        partials_amp.truncate(len);
        Self {
            partials_pos,
            partials_amp,
        }
    }

    /// A single sine.
    pub fn sine() -> Self {
        Self::new(vec![1.0], vec![1.0])
    }

    /// `n` harmonic partials of equal strength.
    pub fn harmonic(n: usize) -> Self {
        Self::new(Self::harmonic_positions(n), vec![1.0; n])
    }

    /// `n` harmonic partials with amplitudes `base^i`.
    pub fn exponential(n: usize, base: f64) -> Self {
        Self::new(Self::harmonic_positions(n), Self::exponential_amplitudes(n, base))
    }

    /// `n` harmonic partials with amplitudes `1 / (i * factor)`.
    pub fn inverse(n: usize, factor: f64) -> Self {
        Self::new(Self::harmonic_positions(n), Self::inverse_amplitudes(n, factor))
    }

    /// `1, 2, ..., n`.
    pub fn harmonic_positions(n: usize) -> Vec<f64> {
        (1..=n).map(|i| i as f64).collect()
    }

    /// `octave^log2(i)` for `i` in `1..=n`; `octave = 2` gives harmonic positions.
    pub fn stretched_positions(n: usize, octave: f64) -> Vec<f64> {
        (1..=n).map(|i| octave.powf((i as f64).log2())).collect()
    }

    pub fn exponential_amplitudes(n: usize, base: f64) -> Vec<f64> {
        (0..n).map(|i| base.powi(i as i32)).collect()
    }

    pub fn inverse_amplitudes(n: usize, factor: f64) -> Vec<f64> {
        (1..=n).map(|i| 1.0 / (i as f64 * factor)).collect()
    }

    pub fn partials_pos(&self) -> &[f64] {
        &self.partials_pos
    }

    pub fn partials_amp(&self) -> &[f64] {
        &self.partials_amp
    }

    pub fn len(&self) -> usize {
        self.partials_pos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partials_pos.is_empty()
    }

    /// Replace the positions. Amplitudes are cut, or padded with silent partials.
    pub fn set_partials_pos(&mut self, partials_pos: Vec<f64>) {
        self.partials_amp.resize(partials_pos.len(), 0.0);
        self.partials_pos = partials_pos;
    }

    /// Replace the amplitudes. Positions are cut, or padded with harmonics.
    pub fn set_partials_amp(&mut self, partials_amp: Vec<f64>) {
        let len = partials_amp.len();
        if self.partials_pos.len() > len {
            self.partials_pos.truncate(len);
        } else {
            let start = self.partials_pos.len();
            self.partials_pos.extend((start + 1..=len).map(|i| i as f64));
        }
        self.partials_amp = partials_amp;
    }
}

impl Default for Timbre {
    fn default() -> Self {
        Self::exponential(12, 0.88)
    }
}

/// Timbre and envelope of a named instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthPreset {
    pub name: String,
    pub timbre: Timbre,
    pub envelope: Envelope,

    /// Portamento time of the external synth (s).
    pub glide_time: f64,
}

impl SynthPreset {
    pub fn piano() -> Self {
        let amps = vec![3.7, 5.4, 1.2, 1.1, 0.95, 0.6, 0.5, 0.65, 0.0, 0.1, 0.2];
        Self {
            name: "piano".into(),
            timbre: Timbre::new(Timbre::harmonic_positions(amps.len()), amps),
            envelope: Envelope::new(0.0001, 4.0, 0.0, 0.5),
            glide_time: 0.0,
        }
    }

    pub fn pad() -> Self {
        Self {
            name: "pad".into(),
            timbre: Timbre::exponential(11, 3.0 / 5.0),
            envelope: Envelope::new(0.7, 1.0, 0.9, 2.5),
            glide_time: 1.5,
        }
    }

    pub fn by_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "piano" => Some(Self::piano()),
            "pad" => Some(Self::pad()),
            _ => None,
        }
    }
}
