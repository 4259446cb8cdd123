// src/voice_table.rs

use log::warn;

use crate::config::SynthConfig;
use crate::error::Result;
use crate::output::SoundOutput;
use crate::voice::Voice;

pub const PITCH_COUNT: usize = 128;

static EMPTY_SLOT: VoiceSlot = VoiceSlot::Empty;

/// One MIDI pitch's entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum VoiceSlot {
    #[default]
    Empty,
    Occupied(Voice),
}

/// What the sound output currently does for a pitch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputState {
    /// Nothing allocated.
    #[default]
    Silent,
    /// Started, not yet released.
    Sounding,
    /// Released, fading out; still holds resources.
    Releasing,
}

/// Live key data of all 128 pitches plus the shared synth settings.
///
/// Responsibilities:
/// - register note-on / note-off / stop (key data only)
/// - forward the delayed commands to the sound output
/// - keep the output's view of each pitch consistent
///
/// Does NOT:
/// - lock anything (the scheduler wraps it in a mutex)
/// - sleep or wait
pub struct VoiceTable {
    slots: Vec<VoiceSlot>,
    output_states: [OutputState; PITCH_COUNT],
    synth: SynthConfig,
    next_generation: u64,
}

impl VoiceTable {
    pub fn new(synth: SynthConfig) -> Self {
        Self {
            slots: vec![VoiceSlot::Empty; PITCH_COUNT],
            output_states: [OutputState::Silent; PITCH_COUNT],
            synth,
            next_generation: 1,
        }
    }

    pub fn synth(&self) -> &SynthConfig {
        &self.synth
    }

    /// Applies to notes registered from now on.
    pub fn set_synth(&mut self, synth: SynthConfig) {
        self.synth = synth;
    }

    pub fn voice(&self, pitch: u8) -> Option<&Voice> {
        match self.slots.get(pitch as usize) {
            Some(VoiceSlot::Occupied(voice)) => Some(voice),
            _ => None,
        }
    }

    fn voice_mut(&mut self, pitch: u8) -> Option<&mut Voice> {
        match self.slots.get_mut(pitch as usize) {
            Some(VoiceSlot::Occupied(voice)) => Some(voice),
            _ => None,
        }
    }

    /// `Empty` for pitches outside the MIDI range.
    pub fn slot(&self, pitch: u8) -> &VoiceSlot {
        self.slots.get(pitch as usize).unwrap_or(&EMPTY_SLOT)
    }

    /// `Silent` for pitches outside the MIDI range.
    pub fn output_state(&self, pitch: u8) -> OutputState {
        self.output_states.get(pitch as usize).copied().unwrap_or_default()
    }

    fn set_output_state(&mut self, pitch: u8, state: OutputState) {
        if let Some(slot) = self.output_states.get_mut(pitch as usize) {
            *slot = state;
        }
    }

    /// Pitches, in ascending order, whose voice is still running.
    pub fn running(&self, now: f64) -> impl Iterator<Item = &Voice> + '_ {
        self.slots.iter().filter_map(move |slot| match slot {
            VoiceSlot::Occupied(voice) if voice.is_running(now) => Some(voice),
            _ => None,
        })
    }

    pub fn occupied(&self) -> impl Iterator<Item = &Voice> + '_ {
        self.slots.iter().filter_map(|slot| match slot {
            VoiceSlot::Occupied(voice) => Some(voice),
            VoiceSlot::Empty => None,
        })
    }

    // ═════════════════════════════════════════════════════════════
    // Registration (key data only)
    // ═════════════════════════════════════════════════════════════

    /// Put a fresh, pressed voice on `pitch`. Returns its generation, or
    /// `None` if `pitch` is not a MIDI pitch.
    ///
    /// Whatever was registered on the pitch before is replaced; a voice
    /// still held by the output is freed when the new one starts.
    pub fn register_note_on(&mut self, pitch: u8, velocity: f64, frequency: f64, now: f64) -> Option<u64> {
        if pitch as usize >= PITCH_COUNT {
            return None;
        }
        let generation = self.next_generation;
        self.next_generation += 1;

        let voice = Voice::new(
            pitch,
            self.synth.global_amplitude * velocity,
            frequency,
            self.synth.envelope,
            self.synth.timbre.clone(),
            generation,
            now,
        );
        self.slots[pitch as usize] = VoiceSlot::Occupied(voice);
        Some(generation)
    }

    /// No-op if nothing is registered or it is already released.
    pub fn register_note_off(&mut self, pitch: u8, now: f64) {
        if let Some(voice) = self.voice_mut(pitch) {
            voice.release(now);
        }
    }

    pub fn register_stop_all(&mut self, now: f64) {
        for slot in &mut self.slots {
            if let VoiceSlot::Occupied(voice) = slot {
                voice.fast_release(now);
            }
        }
    }

    // ═════════════════════════════════════════════════════════════
    // Output commands
    // ═════════════════════════════════════════════════════════════

    /// Start the voice registered as `generation` on `pitch`.
    ///
    /// Skipped (returns `Ok(false)`) when the slot was re-registered since.
    /// A voice that was let go during the lag starts and is released at
    /// once, so the output still sees a complete note.
    pub fn play_note_on(&mut self, pitch: u8, generation: u64, output: &dyn SoundOutput) -> Result<bool> {
        let (frequency, amplitude, pressed) = match self.voice(pitch) {
            Some(voice) if voice.generation == generation => {
                (voice.frequency, voice.amplitude, voice.is_pressed())
            }
            _ => return Ok(false),
        };

        if self.output_state(pitch) != OutputState::Silent {
            self.set_output_state(pitch, OutputState::Silent);
            output.fast_release_and_free(pitch)?;
        }

        output.start_voice(pitch, frequency, amplitude)?;
        self.set_output_state(pitch, OutputState::Sounding);

        if !pressed {
            self.set_output_state(pitch, OutputState::Releasing);
            output.release(pitch)?;
        }
        Ok(true)
    }

    /// Release the sounding voice on `pitch`.
    ///
    /// Skipped when the key was pressed again in the meantime or nothing
    /// is sounding.
    pub fn play_note_off(&mut self, pitch: u8, output: &dyn SoundOutput) -> Result<bool> {
        if self.voice(pitch).is_some_and(Voice::is_pressed) {
            return Ok(false);
        }
        if self.output_state(pitch) != OutputState::Sounding {
            return Ok(false);
        }

        self.set_output_state(pitch, OutputState::Releasing);
        output.release(pitch)?;
        Ok(true)
    }

    /// Fast-release and free every voice the output holds.
    ///
    /// Keeps going after a failure and reports the first one.
    pub fn play_stop_all(&mut self, output: &dyn SoundOutput) -> Result<()> {
        let mut first_error = None;
        for (index, state) in self.output_states.iter_mut().enumerate() {
            if *state == OutputState::Silent {
                continue;
            }
            *state = OutputState::Silent;
            if let Err(e) = output.fast_release_and_free(index as u8) {
                warn!("failed to free voice {}: {}", index, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// New fundamental for the voice on `pitch`, forwarded if it is held by
    /// the output. Returns `false` if no voice is registered.
    pub fn retune(&mut self, pitch: u8, frequency: f64, output: &dyn SoundOutput) -> Result<bool> {
        let Some(voice) = self.voice_mut(pitch) else {
            return Ok(false);
        };
        voice.frequency = frequency;

        if self.output_state(pitch) != OutputState::Silent {
            output.set_frequency(pitch, frequency)?;
        }
        Ok(true)
    }

    /// New velocity for the voice on `pitch`, scaled by the global amplitude.
    pub fn set_velocity(&mut self, pitch: u8, velocity: f64, output: &dyn SoundOutput) -> Result<bool> {
        let amplitude = self.synth.global_amplitude * velocity;
        let Some(voice) = self.voice_mut(pitch) else {
            return Ok(false);
        };
        voice.amplitude = amplitude;

        if self.output_state(pitch) != OutputState::Silent {
            output.set_amplitude(pitch, amplitude)?;
        }
        Ok(true)
    }
}
