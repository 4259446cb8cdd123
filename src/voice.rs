// src/voice.rs
//
// One sounding note and its ADSR envelope.
//
// The envelope is only tracked here, not rendered: the external sound
// engine synthesises the signal. The tuner needs the current level to know
// which notes still count as running.

use serde::{Deserialize, Serialize};

use crate::timbre::Timbre;

/// Four-segment piecewise-linear envelope (seconds, level in [0, 1]).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Envelope {
    pub attack_time: f64,
    pub decay_time: f64,
    pub sustain_level: f64,
    pub release_time: f64,
}

impl Envelope {
    pub fn new(attack_time: f64, decay_time: f64, sustain_level: f64, release_time: f64) -> Self {
        Self {
            attack_time,
            decay_time,
            sustain_level,
            release_time,
        }
    }

    /// Level `t` seconds after the press, key still held.
    pub fn pressed_height(&self, t: f64) -> f64 {
        if t < self.attack_time {
            t / self.attack_time
        } else if t < self.attack_time + self.decay_time {
            1.0 + (self.sustain_level - 1.0) * (t - self.attack_time) / self.decay_time
        } else {
            self.sustain_level
        }
    }

    /// Level `t` seconds after the release, starting from `level`.
    pub fn released_height(&self, t: f64, level: f64) -> f64 {
        if t < self.release_time {
            level * (1.0 - t / self.release_time)
        } else {
            0.0
        }
    }
}

impl Default for Envelope {
    fn default() -> Self {
        Self::new(0.1, 0.1, 0.8, 0.2)
    }
}

/// Where a voice is in its envelope.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VoiceState {
    /// Key held since `since`.
    Pressed { since: f64 },

    /// Key let go at `since`, when the envelope stood at `level`.
    Released { since: f64, level: f64 },
}

/// Key data of one pitch slot.
///
/// Times are in seconds of the owning scheduler's clock.
#[derive(Debug, Clone, PartialEq)]
pub struct Voice {
    pub pitch: u8,

    /// Absolute target amplitude (velocity × global amplitude).
    pub amplitude: f64,

    /// Current fundamental; retuning leaves the envelope alone.
    pub frequency: f64,

    pub envelope: Envelope,
    pub timbre: Timbre,

    /// Registration counter, distinguishes successive notes on one pitch.
    pub generation: u64,

    state: VoiceState,
}

impl Voice {
    /// A voice pressed at `now`.
    pub fn new(
        pitch: u8,
        amplitude: f64,
        frequency: f64,
        envelope: Envelope,
        timbre: Timbre,
        generation: u64,
        now: f64,
    ) -> Self {
        Self {
            pitch,
            amplitude,
            frequency,
            envelope,
            timbre,
            generation,
            state: VoiceState::Pressed { since: now },
        }
    }

    #[inline]
    pub fn state(&self) -> VoiceState {
        self.state
    }

    #[inline]
    pub fn is_pressed(&self) -> bool {
        matches!(self.state, VoiceState::Pressed { .. })
    }

    /// Pressed, or released less than `release_time` ago.
    pub fn is_running(&self, now: f64) -> bool {
        match self.state {
            VoiceState::Pressed { .. } => true,
            VoiceState::Released { since, .. } => now - since < self.envelope.release_time,
        }
    }

    pub fn envelope_height(&self, now: f64) -> f64 {
        match self.state {
            VoiceState::Pressed { since } => self.envelope.pressed_height(now - since),
            VoiceState::Released { since, level } => self.envelope.released_height(now - since, level),
        }
    }

    pub fn current_amplitude(&self, now: f64) -> f64 {
        self.amplitude * self.envelope_height(now)
    }

    /// No-op unless pressed.
    pub fn release(&mut self, now: f64) {
        if self.is_pressed() {
            let level = self.envelope_height(now);
            self.state = VoiceState::Released { since: now, level };
        }
    }

    /// Release with a zero release time; the voice stops running at once.
    pub fn fast_release(&mut self, now: f64) {
        self.envelope.release_time = 0.0;
        self.release(now);
    }
}
