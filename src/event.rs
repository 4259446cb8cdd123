// src/event.rs

use crate::error::Result;
use crate::scale::parse_pitch;

/// ===============================
/// Note events
/// ===============================

/// A discrete event from a note source (controller, file player, script).
///
/// These events:
/// - arrive asynchronously, from any thread
/// - are turned into one short-lived handler task each
/// - carry no timing; the receiver stamps them on arrival
#[derive(Debug, Clone, PartialEq)]
pub enum NoteEvent {
    /// `velocity` in [0, 1]. `frequency` overrides the scale lookup.
    NoteOn {
        pitch: u8,
        velocity: f64,
        frequency: Option<f64>,
    },

    NoteOff { pitch: u8 },

    /// Silence everything.
    Stop,
}

impl NoteEvent {
    pub fn note_on(pitch: u8, velocity: f64) -> Self {
        NoteEvent::NoteOn {
            pitch,
            velocity,
            frequency: None,
        }
    }

    pub fn note_off(pitch: u8) -> Self {
        NoteEvent::NoteOff { pitch }
    }

    /// Pitch given as a MIDI number or a name such as `"C#4"`.
    pub fn named_note_on(pitch: &str, velocity: f64) -> Result<Self> {
        Ok(Self::note_on(parse_pitch(pitch)?, velocity))
    }

    pub fn named_note_off(pitch: &str) -> Result<Self> {
        Ok(Self::note_off(parse_pitch(pitch)?))
    }

    pub fn pitch(&self) -> Option<u8> {
        match self {
            NoteEvent::NoteOn { pitch, .. } | NoteEvent::NoteOff { pitch } => Some(*pitch),
            NoteEvent::Stop => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TuningError;

    #[test]
    fn test_named_events() {
        assert_eq!(NoteEvent::named_note_on("A4", 0.5).unwrap(), NoteEvent::note_on(69, 0.5));
        assert_eq!(NoteEvent::named_note_off("61").unwrap(), NoteEvent::note_off(61));
        assert!(matches!(
            NoteEvent::named_note_on("X4", 0.5),
            Err(TuningError::InvalidPitchName(_))
        ));
        assert_eq!(NoteEvent::Stop.pitch(), None);
        assert_eq!(NoteEvent::note_off(3).pitch(), Some(3));
    }
}
