// src/scale.rs
//
// Pitch → frequency table and historical 12-tone tunings.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TuningError};

pub const PITCHES_PER_OCTAVE: usize = 12;

const MIDI_PITCHES: usize = 128;

const PITCH_CLASS_NAMES: [&str; PITCHES_PER_OCTAVE] =
    ["C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B"];

/// Frequency of a MIDI pitch in equal temperament, A4 = 440 Hz.
#[inline]
pub fn equal_temperament_frequency(pitch: u8) -> f64 {
    440.0 * 2f64.powf((pitch as f64 - 69.0) / 12.0)
}

#[inline]
pub fn cents_to_ratio(cents: f64) -> f64 {
    2f64.powf(cents / 1200.0)
}

#[inline]
pub fn ratio_to_cents(ratio: f64) -> f64 {
    ratio.log2() * 1200.0
}

/// Validate a MIDI pitch number.
pub fn check_pitch(pitch: i64) -> Result<u8> {
    u8::try_from(pitch)
        .ok()
        .filter(|p| (*p as usize) < MIDI_PITCHES)
        .ok_or(TuningError::PitchOutOfRange(pitch))
}

/// `"A4"` → 69, `"Bb3"` → 58, `"C-1"` → 0.
pub fn pitch_from_name(name: &str) -> Result<u8> {
    let invalid = || TuningError::InvalidPitchName(name.to_string());
    let trimmed = name.trim();
    let mut chars = trimmed.chars();

    let class: i64 = match chars.next().map(|c| c.to_ascii_uppercase()) {
        Some('C') => 0,
        Some('D') => 2,
        Some('E') => 4,
        Some('F') => 5,
        Some('G') => 7,
        Some('A') => 9,
        Some('B') => 11,
        _ => return Err(invalid()),
    };

    let rest = chars.as_str();
    let (accidental, octave) = match rest.chars().next() {
        Some('#') => (1, &rest[1..]),
        Some('b') => (-1, &rest[1..]),
        _ => (0, rest),
    };
    let octave: i64 = octave.parse().map_err(|_| invalid())?;

    let pitch = octave
        .checked_add(1)
        .and_then(|o| o.checked_mul(12))
        .and_then(|p| p.checked_add(class + accidental))
        .ok_or(TuningError::PitchOutOfRange(octave))?;
    check_pitch(pitch)
}

/// Name of a pitch, always spelled with sharps.
pub fn pitch_name(pitch: u8) -> String {
    let octave = pitch as i64 / 12 - 1;
    format!("{}{}", PITCH_CLASS_NAMES[pitch as usize % 12], octave)
}

/// A MIDI number (`"69"`) or a pitch name (`"A4"`).
pub fn parse_pitch(text: &str) -> Result<u8> {
    match text.trim().parse::<i64>() {
        Ok(number) => check_pitch(number),
        Err(_) => pitch_from_name(text),
    }
}

/// Historical 12-tone tunings, rounded to the nearest cent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamedTuning {
    EqualTemperament,
    Pythagorean,
    /// Just intonation.
    Natural,
    Kirnberger3,
    Vallotti,
    Werckmeister3,
}

impl NamedTuning {
    pub const ALL: [NamedTuning; 6] = [
        NamedTuning::EqualTemperament,
        NamedTuning::Pythagorean,
        NamedTuning::Natural,
        NamedTuning::Kirnberger3,
        NamedTuning::Vallotti,
        NamedTuning::Werckmeister3,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            NamedTuning::EqualTemperament => "12TET",
            NamedTuning::Pythagorean => "Pythagorean",
            NamedTuning::Natural => "Natural (JI)",
            NamedTuning::Kirnberger3 => "Kirnberger 3",
            NamedTuning::Vallotti => "Vallotti",
            NamedTuning::Werckmeister3 => "Werckmeister 3",
        }
    }

    /// Intervals above the reference pitch class.
    pub fn cents(&self) -> [f64; PITCHES_PER_OCTAVE] {
        match self {
            NamedTuning::EqualTemperament => {
                [0., 100., 200., 300., 400., 500., 600., 700., 800., 900., 1000., 1100.]
            }
            // Loy 2011, Musimathics p. 56
            NamedTuning::Pythagorean => {
                [0., 90., 204., 294., 408., 498., 612., 702., 792., 906., 996., 1110.]
            }
            NamedTuning::Natural => {
                [0., 112., 204., 316., 386., 498., 610., 702., 814., 884., 996., 1088.]
            }
            // Sethares 2005, Tuning, Timbre, Spectrum, Scale p. 377
            NamedTuning::Kirnberger3 => {
                [0., 90., 193., 294., 386., 498., 590., 697., 792., 890., 996., 1088.]
            }
            NamedTuning::Vallotti => {
                [0., 90., 196., 294., 392., 498., 588., 698., 792., 894., 996., 1090.]
            }
            NamedTuning::Werckmeister3 => {
                [0., 90., 192., 294., 390., 498., 588., 696., 792., 888., 996., 1092.]
            }
        }
    }

    /// Reference pitch and frequency the table is laid out from.
    ///
    /// Equal temperament hangs off A4; the others are keyed to C.
    pub fn reference(&self) -> (u8, f64) {
        match self {
            NamedTuning::EqualTemperament => (69, 440.0),
            _ => (60, 261.63),
        }
    }
}

impl fmt::Display for NamedTuning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for NamedTuning {
    type Err = TuningError;

    fn from_str(s: &str) -> Result<Self> {
        let key: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();

        match key.as_str() {
            "et" | "12tet" | "equaltemperament" => Ok(NamedTuning::EqualTemperament),
            "py" | "pythagorean" => Ok(NamedTuning::Pythagorean),
            "ji" | "just" | "natural" | "naturalji" => Ok(NamedTuning::Natural),
            "kirnberger3" | "kirnberger" => Ok(NamedTuning::Kirnberger3),
            "vallotti" | "valloti" => Ok(NamedTuning::Vallotti),
            "werckmeister3" | "werkmeister3" | "werckmeister" => Ok(NamedTuning::Werckmeister3),
            _ => Err(TuningError::UnknownTuning(s.to_string())),
        }
    }
}

/// Source of default frequencies for notes that arrive without one.
pub trait ScaleTable: Send {
    fn frequency(&self, pitch: u8) -> f64;

    /// Re-tune every pitch.
    fn apply_tuning(&mut self, tuning: NamedTuning);
}

/// Frequencies of all 128 MIDI pitches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scale {
    reference_pitch: u8,
    reference_frequency: f64,
    frequencies: Vec<f64>,
}

impl Scale {
    /// Equal temperament around the given reference.
    pub fn new(reference_pitch: u8, reference_frequency: f64) -> Self {
        let mut scale = Self {
            reference_pitch,
            reference_frequency,
            frequencies: vec![0.0; MIDI_PITCHES],
        };
        scale.tune_all_equal_temperament();
        scale
    }

    pub fn with_tuning(tuning: NamedTuning) -> Self {
        let mut scale = Self::default();
        scale.apply_tuning(tuning);
        scale
    }

    pub fn reference(&self) -> (u8, f64) {
        (self.reference_pitch, self.reference_frequency)
    }

    /// Takes effect on the next `tune_all_*` call.
    pub fn set_reference(&mut self, reference_pitch: u8, reference_frequency: f64) {
        self.reference_pitch = reference_pitch;
        self.reference_frequency = reference_frequency;
    }

    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    pub fn tune_pitch(&mut self, pitch: u8, frequency: f64) {
        if let Some(slot) = self.frequencies.get_mut(pitch as usize) {
            *slot = frequency;
        }
    }

    /// Tune `pitch` and all its octaves.
    pub fn tune_pitch_class(&mut self, pitch: u8, frequency: f64) {
        let base = pitch as i64;
        for (p, slot) in self.frequencies.iter_mut().enumerate() {
            let offset = p as i64 - base;
            if offset.rem_euclid(12) == 0 {
                *slot = frequency * 2f64.powi(offset.div_euclid(12) as i32);
            }
        }
    }

    /// Intervals (frequency ratios) above the reference, one per pitch class.
    pub fn tune_all_by_ratio(&mut self, ratios: &[f64; PITCHES_PER_OCTAVE]) {
        for (i, ratio) in ratios.iter().enumerate() {
            let pitch = (self.reference_pitch as usize + i) % MIDI_PITCHES;
            self.tune_pitch_class(pitch as u8, ratio * self.reference_frequency);
        }
    }

    pub fn tune_all_by_cents(&mut self, cents: &[f64; PITCHES_PER_OCTAVE]) {
        self.tune_all_by_ratio(&cents.map(cents_to_ratio));
    }

    pub fn tune_all_equal_temperament(&mut self) {
        let ratios = std::array::from_fn(|i| 2f64.powf(i as f64 / 12.0));
        self.tune_all_by_ratio(&ratios);
    }
}

impl Default for Scale {
    fn default() -> Self {
        Self::new(69, 440.0)
    }
}

impl ScaleTable for Scale {
    fn frequency(&self, pitch: u8) -> f64 {
        self.frequencies
            .get(pitch as usize)
            .copied()
            .unwrap_or_else(|| equal_temperament_frequency(pitch))
    }

    fn apply_tuning(&mut self, tuning: NamedTuning) {
        let (pitch, frequency) = tuning.reference();
        self.set_reference(pitch, frequency);
        self.tune_all_by_cents(&tuning.cents());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_pitch_names() {
        assert_eq!(pitch_from_name("A4").unwrap(), 69);
        assert_eq!(pitch_from_name("A#4").unwrap(), 70);
        assert_eq!(pitch_from_name("Bb4").unwrap(), 70);
        assert_eq!(pitch_from_name("C-1").unwrap(), 0);
        assert_eq!(pitch_from_name("G9").unwrap(), 127);
        assert_eq!(pitch_from_name("c4").unwrap(), 60);

        assert_eq!(pitch_name(70), "A#4");
        assert_eq!(pitch_name(0), "C-1");
        assert_eq!(pitch_name(60), "C4");
    }

    #[test]
    fn test_invalid_pitches() {
        assert!(matches!(pitch_from_name("H4"), Err(TuningError::InvalidPitchName(_))));
        assert!(matches!(pitch_from_name("A"), Err(TuningError::InvalidPitchName(_))));
        assert!(matches!(pitch_from_name("G#9"), Err(TuningError::PitchOutOfRange(128))));
        assert!(matches!(parse_pitch("-3"), Err(TuningError::PitchOutOfRange(-3))));
        assert_eq!(parse_pitch(" 64 ").unwrap(), 64);
        assert_eq!(parse_pitch("E4").unwrap(), 64);
    }

    #[test]
    fn test_huge_octaves_are_out_of_range() {
        assert!(matches!(
            pitch_from_name("C9223372036854775807"),
            Err(TuningError::PitchOutOfRange(_))
        ));
        assert!(matches!(
            pitch_from_name("B-9223372036854775808"),
            Err(TuningError::PitchOutOfRange(_))
        ));
        assert!(matches!(
            parse_pitch("Cb768614336404564650"),
            Err(TuningError::PitchOutOfRange(_))
        ));
        assert!(crate::event::NoteEvent::named_note_on("A99999999999999999", 1.0).is_err());
    }

    #[test]
    fn test_default_scale_is_equal_temperament() {
        let scale = Scale::default();
        for pitch in [0u8, 21, 60, 69, 108, 127] {
            assert_relative_eq!(
                scale.frequency(pitch),
                equal_temperament_frequency(pitch),
                max_relative = 1e-12
            );
        }
        assert_eq!(scale.frequency(69), 440.0);
        assert_relative_eq!(scale.frequency(81), 880.0, max_relative = 1e-12);
    }

    #[test]
    fn test_just_intonation_from_c4() {
        let scale = Scale::with_tuning(NamedTuning::Natural);
        assert_eq!(scale.reference(), (60, 261.63));
        assert_relative_eq!(scale.frequency(60), 261.63, max_relative = 1e-12);
        assert_relative_eq!(scale.frequency(72), 523.26, max_relative = 1e-12);
        assert_relative_eq!(scale.frequency(48), 130.815, max_relative = 1e-12);
        // 702 cents: a fifth, rounded to the cent
        assert_relative_eq!(scale.frequency(67) / scale.frequency(60), 1.5, max_relative = 1e-3);
        assert_relative_eq!(scale.frequency(64) / scale.frequency(60), 1.25, max_relative = 1e-3);
    }

    #[test]
    fn test_back_to_equal_temperament() {
        let mut scale = Scale::with_tuning(NamedTuning::Pythagorean);
        scale.apply_tuning(NamedTuning::EqualTemperament);
        assert_eq!(scale.reference(), (69, 440.0));
        assert_relative_eq!(scale.frequency(64), equal_temperament_frequency(64), max_relative = 1e-12);
    }

    #[test]
    fn test_tune_pitch_class_covers_octaves() {
        let mut scale = Scale::default();
        scale.tune_pitch_class(69, 432.0);
        assert_eq!(scale.frequency(69), 432.0);
        assert_eq!(scale.frequency(57), 216.0);
        assert_eq!(scale.frequency(93), 1728.0);

        scale.tune_pitch(70, 450.0);
        assert_eq!(scale.frequency(70), 450.0);
    }

    #[test]
    fn test_tuning_names() {
        assert_eq!("ji".parse::<NamedTuning>().unwrap(), NamedTuning::Natural);
        assert_eq!("Natural (JI)".parse::<NamedTuning>().unwrap(), NamedTuning::Natural);
        assert_eq!("et".parse::<NamedTuning>().unwrap(), NamedTuning::EqualTemperament);
        assert_eq!("Werckmeister 3".parse::<NamedTuning>().unwrap(), NamedTuning::Werckmeister3);
        assert!(matches!("meantone".parse::<NamedTuning>(), Err(TuningError::UnknownTuning(_))));

        for tuning in NamedTuning::ALL {
            assert_eq!(tuning.name().parse::<NamedTuning>().unwrap(), tuning);
            assert_eq!(tuning.cents()[0], 0.0);
        }
    }

    #[test]
    fn test_cents_conversion() {
        assert_relative_eq!(cents_to_ratio(1200.0), 2.0);
        assert_relative_eq!(ratio_to_cents(1.5), 701.955, max_relative = 1e-5);
    }
}
