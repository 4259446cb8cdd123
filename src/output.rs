// src/output.rs
//
// Boundary to the external sound engine.
//
// The tuner never renders audio. It tells a synthesiser which voices to
// start, retune, release and free; the synthesiser does the DSP.

use log::{debug, info};
use parking_lot::Mutex;

use crate::error::Result;
use crate::scale::pitch_name;

/// Commands understood by the external synthesiser, one voice per pitch.
///
/// Called from the tuning loop and from note handler threads, always while
/// the voice table is locked, so calls for one session never interleave.
pub trait SoundOutput: Send + Sync {
    /// Acquire the device. Called once when a session starts.
    fn prepare(&self) -> Result<()> {
        Ok(())
    }

    fn start_voice(&self, pitch: u8, frequency: f64, amplitude: f64) -> Result<()>;

    /// Glide to a new fundamental without touching amplitude or envelope.
    fn set_frequency(&self, pitch: u8, frequency: f64) -> Result<()>;

    fn set_amplitude(&self, pitch: u8, amplitude: f64) -> Result<()>;

    /// Normal envelope release.
    fn release(&self, pitch: u8) -> Result<()>;

    /// Near-instant release, then free the voice's resources.
    fn fast_release_and_free(&self, pitch: u8) -> Result<()>;
}

/// Accepts everything, plays nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentOutput;

impl SoundOutput for SilentOutput {
    fn start_voice(&self, _pitch: u8, _frequency: f64, _amplitude: f64) -> Result<()> {
        Ok(())
    }

    fn set_frequency(&self, _pitch: u8, _frequency: f64) -> Result<()> {
        Ok(())
    }

    fn set_amplitude(&self, _pitch: u8, _amplitude: f64) -> Result<()> {
        Ok(())
    }

    fn release(&self, _pitch: u8) -> Result<()> {
        Ok(())
    }

    fn fast_release_and_free(&self, _pitch: u8) -> Result<()> {
        Ok(())
    }
}

/// Writes every command to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingOutput;

impl SoundOutput for LoggingOutput {
    fn prepare(&self) -> Result<()> {
        info!("sound output ready (log only)");
        Ok(())
    }

    fn start_voice(&self, pitch: u8, frequency: f64, amplitude: f64) -> Result<()> {
        info!(
            "start {} at {:.3} Hz, amplitude {:.4}",
            pitch_name(pitch),
            frequency,
            amplitude
        );
        Ok(())
    }

    fn set_frequency(&self, pitch: u8, frequency: f64) -> Result<()> {
        debug!("retune {} to {:.3} Hz", pitch_name(pitch), frequency);
        Ok(())
    }

    fn set_amplitude(&self, pitch: u8, amplitude: f64) -> Result<()> {
        debug!("amplitude of {} set to {:.4}", pitch_name(pitch), amplitude);
        Ok(())
    }

    fn release(&self, pitch: u8) -> Result<()> {
        info!("release {}", pitch_name(pitch));
        Ok(())
    }

    fn fast_release_and_free(&self, pitch: u8) -> Result<()> {
        info!("free {}", pitch_name(pitch));
        Ok(())
    }
}

/// One command as seen by a [`RecordingOutput`].
#[derive(Debug, Clone, PartialEq)]
pub enum OutputCommand {
    Prepare,
    Start {
        pitch: u8,
        frequency: f64,
        amplitude: f64,
    },
    SetFrequency {
        pitch: u8,
        frequency: f64,
    },
    SetAmplitude {
        pitch: u8,
        amplitude: f64,
    },
    Release {
        pitch: u8,
    },
    FastReleaseAndFree {
        pitch: u8,
    },
}

impl OutputCommand {
    pub fn pitch(&self) -> Option<u8> {
        match self {
            OutputCommand::Prepare => None,
            OutputCommand::Start { pitch, .. }
            | OutputCommand::SetFrequency { pitch, .. }
            | OutputCommand::SetAmplitude { pitch, .. }
            | OutputCommand::Release { pitch }
            | OutputCommand::FastReleaseAndFree { pitch } => Some(*pitch),
        }
    }
}

/// Keeps every command in order, for inspection.
#[derive(Debug, Default)]
pub struct RecordingOutput {
    commands: Mutex<Vec<OutputCommand>>,
}

impl RecordingOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> Vec<OutputCommand> {
        self.commands.lock().clone()
    }

    /// Commands addressed to one pitch.
    pub fn commands_for(&self, pitch: u8) -> Vec<OutputCommand> {
        self.commands
            .lock()
            .iter()
            .filter(|c| c.pitch() == Some(pitch))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.commands.lock().clear();
    }

    fn push(&self, command: OutputCommand) -> Result<()> {
        self.commands.lock().push(command);
        Ok(())
    }
}

impl SoundOutput for RecordingOutput {
    fn prepare(&self) -> Result<()> {
        self.push(OutputCommand::Prepare)
    }

    fn start_voice(&self, pitch: u8, frequency: f64, amplitude: f64) -> Result<()> {
        self.push(OutputCommand::Start {
            pitch,
            frequency,
            amplitude,
        })
    }

    fn set_frequency(&self, pitch: u8, frequency: f64) -> Result<()> {
        self.push(OutputCommand::SetFrequency { pitch, frequency })
    }

    fn set_amplitude(&self, pitch: u8, amplitude: f64) -> Result<()> {
        self.push(OutputCommand::SetAmplitude { pitch, amplitude })
    }

    fn release(&self, pitch: u8) -> Result<()> {
        self.push(OutputCommand::Release { pitch })
    }

    fn fast_release_and_free(&self, pitch: u8) -> Result<()> {
        self.push(OutputCommand::FastReleaseAndFree { pitch })
    }
}
