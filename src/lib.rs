// src/lib.rs
//
// Library entry point.
//
// Two cores:
// - `dissonance` + `optimizer`: score a set of complex tones and move their
//   fundamentals to a less dissonant configuration
// - `scheduler`: keep a live table of sounding notes and re-tune it
//   periodically while note events and detected audio peaks stream in

mod clock;
mod config;
mod controller;
mod dissonance;
mod error;
mod event;
mod optimizer;
mod output;
mod scale;
mod scheduler;
mod signal;
mod source;
mod timbre;
mod voice;
mod voice_table;

pub mod state;

// Re-export key types for Rust consumers
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{SynthConfig, TunerConfig};
pub use controller::{ControlSender, TuningController, control_channel};
pub use dissonance::{
    DissonanceConfig, DissonanceModel, PairPartner, RelevantPair, RelevantPairs,
    critical_bandwidth, roughness,
};
pub use error::{Result, TuningError};
pub use event::NoteEvent;
pub use optimizer::{OptimizationResult, SolverMethod, SolverOptions, minimize};
pub use output::{LoggingOutput, OutputCommand, RecordingOutput, SilentOutput, SoundOutput};
pub use scale::{
    NamedTuning, Scale, ScaleTable, equal_temperament_frequency, parse_pitch, pitch_from_name,
    pitch_name,
};
pub use scheduler::{FixedFrequencies, TunerHandle, TuningScheduler};
pub use signal::{StopSignal, TuningRequest};
pub use source::{AudioPeakSource, NoteSource, ScriptedNotes, ScriptedPeaks};
pub use timbre::{SynthPreset, Timbre};
pub use voice::{Envelope, Voice, VoiceState};
pub use voice_table::{OutputState, PITCH_COUNT, VoiceSlot, VoiceTable};
