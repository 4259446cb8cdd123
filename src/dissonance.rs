// src/dissonance.rs
//
// Psychoacoustic dissonance model and the tuning optimiser built on it.
//
// A set of complex tones shares one timbre (relative partial positions and
// amplitudes). Their fundamentals are the optimisation variables; an
// optional list of fixed frequencies (e.g. peaks detected in live audio)
// takes part in the score but never moves.
//
// The model is pure: no shared state, no I/O.

use serde::{Deserialize, Serialize};

use crate::optimizer::{OptimizationResult, SolverMethod, SolverOptions, minimize};

/// Replacement for a non-positive amplitude threshold.
const AMPLITUDE_THRESHOLD_FLOOR: f64 = 1e-8;

/// Pairs spaced further apart than this many critical bandwidths are ignored.
const MAX_RELEVANT_SPACING: f64 = 1.46;

/// Settings of the dissonance model and its optimiser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DissonanceConfig {
    /// Amplitude of a barely audible 1 kHz sine in the listening setup.
    pub amplitude_threshold: f64,

    pub method: SolverMethod,

    /// Per-fundamental box `[f * low, f * high]`; `None` disables bounds.
    pub relative_bounds: Option<(f64, f64)>,

    /// `None` lets the solver run to its own stopping criterion.
    pub max_iterations: Option<usize>,
}

impl DissonanceConfig {
    /// ±1/36 octave, a third of an equal-tempered semitone.
    pub fn third_of_semitone() -> (f64, f64) {
        (2f64.powf(-1.0 / 36.0), 2f64.powf(1.0 / 36.0))
    }
}

impl Default for DissonanceConfig {
    fn default() -> Self {
        Self {
            amplitude_threshold: 0.00002,
            method: SolverMethod::LBfgsB,
            relative_bounds: Some(Self::third_of_semitone()),
            max_iterations: None,
        }
    }
}

/// The second member of a relevant pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairPartner {
    /// A partial of another complex tone.
    Partial { tone: usize, partial: usize },

    /// An entry of the fixed-frequency list.
    Fixed { index: usize },
}

/// Partial `partial` of complex tone `tone`, paired with `partner`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelevantPair {
    pub tone: usize,
    pub partial: usize,
    pub partner: PairPartner,
}

impl RelevantPair {
    pub fn partials(tone: usize, partial: usize, other_tone: usize, other_partial: usize) -> Self {
        Self {
            tone,
            partial,
            partner: PairPartner::Partial {
                tone: other_tone,
                partial: other_partial,
            },
        }
    }

    pub fn fixed(tone: usize, partial: usize, index: usize) -> Self {
        Self {
            tone,
            partial,
            partner: PairPartner::Fixed { index },
        }
    }
}

/// Quasi-constants of one optimisation: the pairs worth scoring and, per
/// pair, its critical bandwidth and volume factor.
///
/// Both depend on frequency, but so weakly over the small perturbations one
/// optimisation explores that they are computed once up front.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelevantPairs {
    pub pairs: Vec<RelevantPair>,
    pub critical_bandwidths: Vec<f64>,
    pub volume_factors: Vec<f64>,
}

impl RelevantPairs {
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn position(&self, pair: &RelevantPair) -> Option<usize> {
        self.pairs.iter().position(|p| p == pair)
    }

    fn push(&mut self, pair: RelevantPair, critical_bandwidth: f64, volume_factor: f64) {
        self.pairs.push(pair);
        self.critical_bandwidths.push(critical_bandwidth);
        self.volume_factors.push(volume_factor);
    }
}

/// Critical bandwidth around the mean of two frequencies (Zwicker & Terhardt).
#[inline]
pub fn critical_bandwidth(p1: f64, p2: f64) -> f64 {
    25.0 + 75.0 * (1.0 + 3.5e-7 * (p1 + p2).powi(2)).powf(0.69)
}

/// Sethares roughness of two sines `h` critical bandwidths apart.
#[inline]
pub fn roughness(h: f64) -> f64 {
    h * h * (-8.0 * h).exp()
}

/// Scores and minimises the dissonance of complex tones.
#[derive(Debug, Clone)]
pub struct DissonanceModel {
    config: DissonanceConfig,
    amplitude_threshold_log: f64,
}

impl Default for DissonanceModel {
    fn default() -> Self {
        Self::new(DissonanceConfig::default())
    }
}

impl DissonanceModel {
    pub fn new(config: DissonanceConfig) -> Self {
        let mut model = Self {
            config,
            amplitude_threshold_log: 0.0,
        };
        model.set_amplitude_threshold(model.config.amplitude_threshold);
        model
    }

    pub fn config(&self) -> &DissonanceConfig {
        &self.config
    }

    pub fn amplitude_threshold(&self) -> f64 {
        10f64.powf(self.amplitude_threshold_log)
    }

    /// Non-positive thresholds are replaced by a tiny positive floor.
    pub fn set_amplitude_threshold(&mut self, amplitude_threshold: f64) {
        let threshold = if amplitude_threshold > 0.0 {
            amplitude_threshold
        } else {
            AMPLITUDE_THRESHOLD_FLOOR
        };
        self.config.amplitude_threshold = threshold;
        self.amplitude_threshold_log = threshold.log10();
    }

    pub fn set_method(&mut self, method: SolverMethod) {
        self.config.method = method;
    }

    pub fn set_relative_bounds(&mut self, relative_bounds: Option<(f64, f64)>) {
        self.config.relative_bounds = relative_bounds;
    }

    pub fn set_max_iterations(&mut self, max_iterations: Option<usize>) {
        self.config.max_iterations = max_iterations;
    }

    /// Approximate auditory level (in units of 20 dB) of a partial.
    ///
    /// Drops the 2-5 kHz bump of the threshold-in-quiet curve; only the
    /// cut-off at the edges of the hearing range matters here.
    #[inline]
    fn auditory_level(&self, amplitude: f64, frequency: f64) -> f64 {
        amplitude.log10()
            - self.amplitude_threshold_log
            - 45.71633305 * frequency.powf(-0.8)
            - 5e-17 * frequency.powi(4)
    }

    /// Select the partial pairs that contribute to the dissonance.
    ///
    /// Considers every pair of partials of two different complex tones and
    /// every (partial, fixed frequency) pair. A pair is kept if it is closer
    /// than 1.46 critical bandwidths, both amplitudes are positive and at
    /// least one partial is audible.
    pub fn filter_relevant_pairs(
        &self,
        fundamentals_freq: &[f64],
        fundamentals_amp: &[f64],
        partials_pos: &[f64],
        partials_amp: &[f64],
        fixed_freq: &[f64],
        fixed_amp: &[f64],
    ) -> RelevantPairs {
        let tones = fundamentals_freq.len().min(fundamentals_amp.len());
        let partials = partials_pos.len().min(partials_amp.len());
        let fixed = fixed_freq.len().min(fixed_amp.len());

        let mut relevant = RelevantPairs::default();
        if tones == 0 || (tones == 1 && fixed == 0) {
            return relevant;
        }

        let frequency = |tone: usize, partial: usize| fundamentals_freq[tone] * partials_pos[partial];
        let amplitude = |tone: usize, partial: usize| fundamentals_amp[tone] * partials_amp[partial];

        for i in 0..tones {
            for j in (i + 1)..tones {
                for k in 0..partials {
                    for l in 0..partials {
                        self.consider(
                            &mut relevant,
                            RelevantPair::partials(i, k, j, l),
                            (frequency(i, k), amplitude(i, k)),
                            (frequency(j, l), amplitude(j, l)),
                        );
                    }
                }
            }
        }

        for i in 0..tones {
            for k in 0..partials {
                for f in 0..fixed {
                    self.consider(
                        &mut relevant,
                        RelevantPair::fixed(i, k, f),
                        (frequency(i, k), amplitude(i, k)),
                        (fixed_freq[f], fixed_amp[f]),
                    );
                }
            }
        }

        relevant
    }

    fn consider(
        &self,
        relevant: &mut RelevantPairs,
        pair: RelevantPair,
        (p1, a1): (f64, f64),
        (p2, a2): (f64, f64),
    ) {
        if !(p1 > 0.0 && p2 > 0.0 && a1 > 0.0 && a2 > 0.0) {
            return;
        }

        let cb = critical_bandwidth(p1, p2);
        let h = (p1 - p2).abs() / cb;
        if !(h < MAX_RELEVANT_SPACING) {
            return;
        }

        let v1 = self.auditory_level(a1, p1);
        let v2 = self.auditory_level(a2, p2);
        if v1 <= 0.0 && v2 <= 0.0 {
            return;
        }

        relevant.push(pair, cb, v1.min(v2));
    }

    /// Total dissonance and its gradient with respect to the fundamentals.
    ///
    /// `relevant` must come from [`Self::filter_relevant_pairs`] for tones,
    /// timbre and fixed frequencies of the same shape.
    pub fn dissonance_and_gradient(
        &self,
        fundamentals_freq: &[f64],
        partials_pos: &[f64],
        fixed_freq: &[f64],
        relevant: &RelevantPairs,
    ) -> (f64, Vec<f64>) {
        let mut gradient = vec![0.0; fundamentals_freq.len()];
        let mut total = 0.0;

        for ((pair, &cb), &volume_factor) in relevant
            .pairs
            .iter()
            .zip(&relevant.critical_bandwidths)
            .zip(&relevant.volume_factors)
        {
            let r1 = partials_pos[pair.partial];
            let p1 = fundamentals_freq[pair.tone] * r1;
            let (p2, other) = match pair.partner {
                PairPartner::Partial { tone, partial } => {
                    let r2 = partials_pos[partial];
                    (fundamentals_freq[tone] * r2, Some((tone, r2)))
                }
                PairPartner::Fixed { index } => (fixed_freq[index], None),
            };

            let h = (p1 - p2).abs() / cb;
            let decay = (-8.0 * h).exp();
            total += h * h * decay * volume_factor;

            let direction = if p1 > p2 { 1.0 } else { -1.0 };
            let slope = volume_factor * 2.0 * h * decay * (1.0 - 4.0 * h) * direction / cb;

            // Interval correction; without it raising a tone always looks better.
            gradient[pair.tone] += slope * r1 * (0.5 * (p2 / p1 - 1.0) + 1.0);
            if let Some((tone, r2)) = other {
                gradient[tone] -= slope * r2 * (0.5 * (p1 / p2 - 1.0) + 1.0);
            }
        }

        (total, gradient)
    }

    /// Find fundamentals that minimise the dissonance near the given ones.
    ///
    /// Never fails: a solver that does not converge yields `success == false`
    /// together with the best fundamentals it found.
    pub fn tune(
        &self,
        fundamentals_freq: &[f64],
        fundamentals_amp: &[f64],
        partials_pos: &[f64],
        partials_amp: &[f64],
        fixed_freq: &[f64],
        fixed_amp: &[f64],
    ) -> OptimizationResult {
        if fundamentals_freq.is_empty() {
            return OptimizationResult::trivial(Vec::new(), "no optimization variables");
        }

        let relevant = self.filter_relevant_pairs(
            fundamentals_freq,
            fundamentals_amp,
            partials_pos,
            partials_amp,
            fixed_freq,
            fixed_amp,
        );

        let bounds: Option<Vec<(f64, f64)>> = self
            .config
            .relative_bounds
            .map(|(low, high)| fundamentals_freq.iter().map(|f| (f * low, f * high)).collect());

        let options = SolverOptions {
            method: self.config.method,
            max_iterations: self.config.max_iterations,
            ..Default::default()
        };

        minimize(
            |x: &[f64]| self.dissonance_and_gradient(x, partials_pos, fixed_freq, &relevant),
            fundamentals_freq,
            bounds.as_deref(),
            &options,
        )
    }

    /// One-off evaluation at the given fundamentals, e.g. for diagnostics.
    pub fn single_dissonance_and_gradient(
        &self,
        fundamentals_freq: &[f64],
        fundamentals_amp: &[f64],
        partials_pos: &[f64],
        partials_amp: &[f64],
        fixed_freq: &[f64],
        fixed_amp: &[f64],
    ) -> (f64, Vec<f64>) {
        let relevant = self.filter_relevant_pairs(
            fundamentals_freq,
            fundamentals_amp,
            partials_pos,
            partials_amp,
            fixed_freq,
            fixed_amp,
        );
        self.dissonance_and_gradient(fundamentals_freq, partials_pos, fixed_freq, &relevant)
    }
}
