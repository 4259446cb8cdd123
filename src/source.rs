// src/source.rs
//
// Input sources.
//
// A source runs on its own pump thread and pushes what it observes into a
// running session through a `TunerHandle`:
// - note sources deliver note-on / note-off / stop events
// - audio peak sources deliver the fixed reference tones detected in an
//   audio signal (possibly none)
//
// Pumps block until their input is exhausted or the session's stop signal
// fires. Real devices (MIDI ports, microphones) implement the same traits
// outside this crate; the scripted sources here play back prepared data.

use std::time::Duration;

use log::debug;

use crate::error::{Result, TuningError};
use crate::event::NoteEvent;
use crate::scheduler::{FixedFrequencies, TunerHandle};
use crate::signal::StopSignal;

/// Something that produces note events.
pub trait NoteSource {
    /// Deliver events into `handle` until done or `stop` fires.
    fn pump(&mut self, handle: &TunerHandle, stop: &StopSignal) -> Result<()>;
}

/// Something that detects fixed reference tones.
pub trait AudioPeakSource {
    /// Deliver peak frames into `handle` until done or `stop` fires.
    fn pump(&mut self, handle: &TunerHandle, stop: &StopSignal) -> Result<()>;
}

fn seconds(s: f64) -> Duration {
    Duration::try_from_secs_f64(s.max(0.0)).unwrap_or_default()
}

// ═════════════════════════════════════════════════════════════════
// Scripted notes
// ═════════════════════════════════════════════════════════════════

/// A timed list of note events, played like a MIDI file.
///
/// Each event carries the delay (seconds) since the previous one. When the
/// script ends, or the stop signal interrupts it, a final `Stop` is issued
/// so nothing keeps sounding.
#[derive(Debug, Clone, Default)]
pub struct ScriptedNotes {
    events: Vec<(f64, NoteEvent)>,
}

impl ScriptedNotes {
    pub fn new(events: Vec<(f64, NoteEvent)>) -> Self {
        Self { events }
    }

    pub fn push(&mut self, delay: f64, event: NoteEvent) {
        self.events.push((delay, event));
    }

    pub fn events(&self) -> &[(f64, NoteEvent)] {
        &self.events
    }

    /// Total playing time.
    pub fn duration(&self) -> f64 {
        self.events.iter().map(|(delay, _)| delay.max(0.0)).sum()
    }

    /// Hold `pitches` together for `hold` seconds, starting after `delay`.
    pub fn chord(delay: f64, pitches: &[u8], velocity: f64, hold: f64) -> Self {
        let mut script = Self::default();
        for (i, &pitch) in pitches.iter().enumerate() {
            script.push(if i == 0 { delay } else { 0.0 }, NoteEvent::note_on(pitch, velocity));
        }
        for (i, &pitch) in pitches.iter().enumerate() {
            script.push(if i == 0 { hold } else { 0.0 }, NoteEvent::note_off(pitch));
        }
        script
    }
}

impl NoteSource for ScriptedNotes {
    fn pump(&mut self, handle: &TunerHandle, stop: &StopSignal) -> Result<()> {
        if self.events.is_empty() {
            return Err(TuningError::SourceUnavailable("no notes loaded".into()));
        }

        for (delay, event) in &self.events {
            if stop.sleep(seconds(*delay)) {
                debug!("note script interrupted");
                break;
            }
            handle.handle_event(event.clone());
        }

        handle.stop_all();
        Ok(())
    }
}

// ═════════════════════════════════════════════════════════════════
// Scripted peaks
// ═════════════════════════════════════════════════════════════════

/// A fixed sequence of peak frames, one every `interval`.
#[derive(Debug, Clone)]
pub struct ScriptedPeaks {
    frames: Vec<FixedFrequencies>,
    interval: Duration,
    repeat: bool,
}

impl ScriptedPeaks {
    pub fn new(frames: Vec<FixedFrequencies>, interval: Duration, repeat: bool) -> Self {
        Self {
            frames,
            interval,
            repeat,
        }
    }

    /// The same frame over and over, e.g. a drone.
    pub fn steady(frame: FixedFrequencies, interval: Duration) -> Self {
        Self::new(vec![frame], interval, true)
    }
}

impl AudioPeakSource for ScriptedPeaks {
    fn pump(&mut self, handle: &TunerHandle, stop: &StopSignal) -> Result<()> {
        if self.frames.is_empty() {
            return Err(TuningError::SourceUnavailable("no peak frames".into()));
        }

        loop {
            for frame in &self.frames {
                handle.set_fixed_frequencies(frame.frequencies.clone(), frame.amplitudes.clone());
                if stop.sleep(self.interval) {
                    return Ok(());
                }
            }
            if !self.repeat {
                return Ok(());
            }
        }
    }
}
