// src/scheduler.rs
//
// Real-time tuning scheduler.
//
// Threads of a session:
// - one tuning loop, re-tuning the running voices every `tuning_interval`
//   or as soon as a note-on asks for it
// - one pump per attached source (notes, audio peaks)
// - one short-lived handler per note event, which registers the event at
//   once and forwards it to the sound output `audio_lag` later
//
// Lock discipline: voice table before scale table; no lock is held across a
// sleep or across the optimisation itself.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
};

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::clock::{Clock, MonotonicClock};
use crate::config::{SynthConfig, TunerConfig};
use crate::dissonance::DissonanceModel;
use crate::error::{Result, TuningError};
use crate::event::NoteEvent;
use crate::optimizer::OptimizationResult;
use crate::output::SoundOutput;
use crate::scale::{
    NamedTuning, Scale, ScaleTable, check_pitch, equal_temperament_frequency, pitch_name,
};
use crate::signal::{StopSignal, TuningRequest};
use crate::source::{AudioPeakSource, NoteSource};
use crate::state::{SessionLog, SessionParams, TuningRecord};
use crate::voice::Voice;
use crate::voice_table::VoiceTable;

/// Reference tones detected in the audio input.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FixedFrequencies {
    pub frequencies: Vec<f64>,
    pub amplitudes: Vec<f64>,
}

/// State shared by every thread of a session.
struct Shared {
    config: TunerConfig,
    model: DissonanceModel,
    clock: Arc<dyn Clock>,
    output: Arc<dyn SoundOutput>,

    voices: Mutex<VoiceTable>,
    scale: Mutex<Box<dyn ScaleTable>>,
    fixed: Mutex<FixedFrequencies>,

    tuning_request: TuningRequest,
    suspended: AtomicBool,
    stop: StopSignal,

    handlers: Mutex<Vec<JoinHandle<()>>>,
    session_log: Mutex<Option<SessionLog>>,

    /// Clock time of `start`, stored as f64 bits.
    started_at_bits: AtomicU64,
}

/// Owns the long-lived threads of a tuning session.
///
/// Responsibilities:
/// - start and stop the tuning loop and the source pumps
/// - join every handler on shutdown and silence the output
///
/// Everything else goes through the [`TunerHandle`] it hands out.
pub struct TuningScheduler {
    shared: Arc<Shared>,
    tuning_thread: Option<JoinHandle<()>>,
    pumps: Vec<JoinHandle<()>>,
}

impl TuningScheduler {
    /// Equal temperament, wall-clock time.
    pub fn new(config: TunerConfig, output: Arc<dyn SoundOutput>) -> Self {
        Self::with_parts(
            config,
            output,
            Arc::new(MonotonicClock::new()),
            Box::new(Scale::default()),
        )
    }

    pub fn with_parts(
        config: TunerConfig,
        output: Arc<dyn SoundOutput>,
        clock: Arc<dyn Clock>,
        scale: Box<dyn ScaleTable>,
    ) -> Self {
        let shared = Shared {
            model: DissonanceModel::new(config.dissonance.clone()),
            voices: Mutex::new(VoiceTable::new(config.synth.clone())),
            config,
            clock,
            output,
            scale: Mutex::new(scale),
            fixed: Mutex::new(FixedFrequencies::default()),
            tuning_request: TuningRequest::new(),
            suspended: AtomicBool::new(false),
            stop: StopSignal::new(),
            handlers: Mutex::new(Vec::new()),
            session_log: Mutex::new(None),
            started_at_bits: AtomicU64::new(0f64.to_bits()),
        };

        Self {
            shared: Arc::new(shared),
            tuning_thread: None,
            pumps: Vec::new(),
        }
    }

    pub fn handle(&self) -> TunerHandle {
        TunerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn is_running(&self) -> bool {
        self.tuning_thread.is_some()
    }

    /// Prepare the output and launch the tuning loop.
    ///
    /// An output that cannot be prepared aborts the session before any
    /// thread is started.
    pub fn start(&mut self) -> Result<TunerHandle> {
        if self.is_running() {
            return Err(TuningError::AlreadyRunning);
        }

        let shared = &self.shared;
        shared.output.prepare()?;

        shared.stop.reset();
        shared.suspended.store(false, Ordering::Release);
        *shared.fixed.lock() = FixedFrequencies::default();
        *shared.session_log.lock() = shared
            .config
            .save_session_log
            .then(|| SessionLog::new(SessionParams::from(&shared.config)));
        shared
            .started_at_bits
            .store(shared.clock.now().to_bits(), Ordering::Release);

        let loop_shared = Arc::clone(shared);
        let tuning_thread = thread::Builder::new()
            .name("adaptune-tuner".into())
            .spawn(move || loop_shared.tuning_loop())?;
        self.tuning_thread = Some(tuning_thread);

        info!(
            "tuning scheduler started: interval {:.3}s, audio lag {:.3}s, {}",
            shared.config.tuning_interval,
            shared.config.audio_lag,
            shared.model.config().method.name()
        );
        Ok(self.handle())
    }

    /// Pump note events from `source` until the session stops.
    pub fn attach_note_source<S>(&mut self, mut source: S) -> Result<()>
    where
        S: NoteSource + Send + 'static,
    {
        let handle = self.handle();
        let stop = self.shared.stop.clone();
        let pump = thread::Builder::new()
            .name("adaptune-notes".into())
            .spawn(move || {
                if let Err(e) = source.pump(&handle, &stop) {
                    warn!("note source stopped: {}", e);
                }
            })?;
        self.pumps.push(pump);
        Ok(())
    }

    /// Pump detected peaks from `source` until the session stops.
    pub fn attach_peak_source<S>(&mut self, mut source: S) -> Result<()>
    where
        S: AudioPeakSource + Send + 'static,
    {
        let handle = self.handle();
        let stop = self.shared.stop.clone();
        let pump = thread::Builder::new()
            .name("adaptune-peaks".into())
            .spawn(move || {
                if let Err(e) = source.pump(&handle, &stop) {
                    warn!("audio peak source stopped: {}", e);
                }
            })?;
        self.pumps.push(pump);
        Ok(())
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.shared.stop.clone()
    }

    /// Stop every thread, wait for them, then free all voices.
    pub fn stop(&mut self) {
        let shared = &self.shared;
        shared.stop.trigger();

        if let Some(tuning_thread) = self.tuning_thread.take() {
            if tuning_thread.join().is_err() {
                error!("tuning loop panicked");
            }
        }
        for pump in self.pumps.drain(..) {
            if pump.join().is_err() {
                error!("source pump panicked");
            }
        }
        shared.join_handlers();

        let mut voices = shared.voices.lock();
        voices.register_stop_all(shared.clock.now());
        if let Err(e) = voices.play_stop_all(shared.output.as_ref()) {
            warn!("could not free all voices: {}", e);
        }
        info!("tuning scheduler stopped");
    }
}

impl Drop for TuningScheduler {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}

/// Cheap, cloneable access to a session, for sources and controllers.
#[derive(Clone)]
pub struct TunerHandle {
    shared: Arc<Shared>,
}

impl TunerHandle {
    // ═════════════════════════════════════════════════════════════
    // Note events
    // ═════════════════════════════════════════════════════════════

    /// Spawn a handler for `event`. Ignored once the session is stopping,
    /// and for pitches outside the MIDI range.
    pub fn handle_event(&self, event: NoteEvent) {
        if self.shared.stop.is_triggered() {
            debug!("session stopping, dropping {:?}", event);
            return;
        }
        if let Some(Err(e)) = event.pitch().map(|p| check_pitch(i64::from(p))) {
            warn!("dropping {:?}: {}", event, e);
            return;
        }

        match event {
            NoteEvent::NoteOn {
                pitch,
                velocity,
                frequency,
            } => self.spawn_handler("note-on", move |shared| {
                shared.note_on_task(pitch, velocity, frequency)
            }),
            NoteEvent::NoteOff { pitch } => {
                self.spawn_handler("note-off", move |shared| shared.note_off_task(pitch))
            }
            NoteEvent::Stop => self.spawn_handler("stop", |shared| shared.stop_all_task()),
        }
    }

    pub fn note_on(&self, pitch: u8, velocity: f64) {
        self.handle_event(NoteEvent::note_on(pitch, velocity));
    }

    pub fn note_off(&self, pitch: u8) {
        self.handle_event(NoteEvent::note_off(pitch));
    }

    pub fn stop_all(&self) {
        self.handle_event(NoteEvent::Stop);
    }

    fn spawn_handler<F>(&self, kind: &'static str, task: F)
    where
        F: FnOnce(&Shared) + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("adaptune-{}", kind))
            .spawn(move || {
                if panic::catch_unwind(AssertUnwindSafe(|| task(&shared))).is_err() {
                    error!("{} handler panicked", kind);
                }
            });

        match spawned {
            Ok(handler) => {
                let mut handlers = self.shared.handlers.lock();
                handlers.retain(|h| !h.is_finished());
                handlers.push(handler);
            }
            Err(e) => error!("could not spawn {} handler: {}", kind, e),
        }
    }

    // ═════════════════════════════════════════════════════════════
    // Live parameters
    // ═════════════════════════════════════════════════════════════

    /// Replace the detected reference tones wholesale.
    pub fn set_fixed_frequencies(&self, frequencies: Vec<f64>, amplitudes: Vec<f64>) {
        *self.shared.fixed.lock() = FixedFrequencies {
            frequencies,
            amplitudes,
        };
    }

    pub fn fixed_frequencies(&self) -> FixedFrequencies {
        self.shared.fixed.lock().clone()
    }

    /// Change the velocity of a registered note.
    pub fn set_note_amplitude(&self, pitch: u8, velocity: f64) {
        let mut voices = self.shared.voices.lock();
        if let Err(e) = voices.set_velocity(pitch, velocity, self.shared.output.as_ref()) {
            warn!("could not set amplitude of {}: {}", pitch_name(pitch), e);
        }
    }

    /// Timbre, envelope and global amplitude of notes registered from now on.
    pub fn set_synth(&self, synth: SynthConfig) {
        self.shared.voices.lock().set_synth(synth);
    }

    // ═════════════════════════════════════════════════════════════
    // Tuning mode
    // ═════════════════════════════════════════════════════════════

    pub fn request_tuning(&self) {
        self.shared.tuning_request.set();
    }

    pub fn suspend_tuning(&self) {
        self.shared.suspended.store(true, Ordering::Release);
    }

    /// Back to adaptive tuning, with a pass as soon as possible.
    pub fn resume_tuning(&self) {
        self.shared.suspended.store(false, Ordering::Release);
        self.shared.tuning_request.set();
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.is_suspended()
    }

    /// Suspend adaptive tuning, re-tune the scale and move every registered
    /// voice to its new scale frequency.
    pub fn apply_static_tuning(&self, tuning: NamedTuning) {
        self.suspend_tuning();

        let shared = &self.shared;
        let mut voices = shared.voices.lock();
        let mut scale = shared.scale.lock();
        scale.apply_tuning(tuning);

        let pitches: Vec<u8> = voices.occupied().map(|v| v.pitch).collect();
        for pitch in pitches {
            if let Err(e) = voices.retune(pitch, scale.frequency(pitch), shared.output.as_ref()) {
                warn!("could not retune {}: {}", pitch_name(pitch), e);
            }
        }
        info!("static tuning: {}", tuning);
    }

    /// Run one tuning pass now, on the calling thread.
    pub fn run_tuning_pass(&self) -> Option<OptimizationResult> {
        self.shared.tuning_pass()
    }

    // ═════════════════════════════════════════════════════════════
    // Readback
    // ═════════════════════════════════════════════════════════════

    pub fn voice(&self, pitch: u8) -> Option<Voice> {
        self.shared.voices.lock().voice(pitch).cloned()
    }

    pub fn running_pitches(&self) -> Vec<u8> {
        let now = self.shared.clock.now();
        self.shared.voices.lock().running(now).map(|v| v.pitch).collect()
    }

    pub fn session_log(&self) -> Option<SessionLog> {
        self.shared.session_log.lock().clone()
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.shared.stop.clone()
    }

    pub fn model(&self) -> &DissonanceModel {
        &self.shared.model
    }
}

impl Shared {
    fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    fn started_at(&self) -> f64 {
        f64::from_bits(self.started_at_bits.load(Ordering::Acquire))
    }

    fn tuning_loop(&self) {
        let tick = self.config.tick_duration();
        let interval = self.config.tuning_interval_seconds();
        let mut timer = interval;

        while !self.stop.is_triggered() {
            timer -= tick.as_secs_f64();

            if (timer <= 0.0 || self.tuning_request.take()) && !self.is_suspended() {
                if panic::catch_unwind(AssertUnwindSafe(|| self.tuning_pass())).is_err() {
                    error!("tuning pass panicked, continuing");
                }
                timer = interval;
            } else {
                thread::sleep(tick);
            }
        }
        debug!("tuning loop finished");
    }

    /// Snapshot the running voices, optimise, write the result back.
    fn tuning_pass(&self) -> Option<OptimizationResult> {
        let now = self.clock.now();

        let (pitches, fundamentals_amp, timbre) = {
            let voices = self.voices.lock();
            let mut pitches = Vec::new();
            let mut amplitudes = Vec::new();
            for voice in voices.running(now) {
                pitches.push(voice.pitch);
                amplitudes.push(voice.amplitude);
            }
            (pitches, amplitudes, voices.synth().timbre.clone())
        };

        if pitches.is_empty() {
            return None;
        }

        // Always start from equal temperament, not from the previous result.
        let fundamentals_freq: Vec<f64> = pitches
            .iter()
            .map(|&p| equal_temperament_frequency(p))
            .collect();

        let fixed = self.fixed.lock().clone();

        let result = self.model.tune(
            &fundamentals_freq,
            &fundamentals_amp,
            timbre.partials_pos(),
            timbre.partials_amp(),
            &fixed.frequencies,
            &fixed.amplitudes,
        );

        if !result.success {
            warn!("tuning pass did not converge: {}", result.message);
        }
        debug!(
            "tuned {:?}: dissonance {:.5}, {} iterations, {} evaluations",
            pitches, result.objective, result.iterations, result.evaluations
        );

        if self.is_suspended() {
            return Some(result);
        }

        if let Some(log) = self.session_log.lock().as_mut() {
            log.push(TuningRecord {
                elapsed: now - self.started_at(),
                pitches: pitches.clone(),
                fundamentals_freq,
                fundamentals_amp,
                partials_pos: timbre.partials_pos().to_vec(),
                partials_amp: timbre.partials_amp().to_vec(),
                fixed_freq: fixed.frequencies,
                fixed_amp: fixed.amplitudes,
                tuned_fundamentals: result.x.clone(),
                success: result.success,
                message: result.message.clone(),
            });
        }

        let mut voices = self.voices.lock();
        for (&pitch, &frequency) in pitches.iter().zip(&result.x) {
            if let Err(e) = voices.retune(pitch, frequency, self.output.as_ref()) {
                warn!("could not retune {}: {}", pitch_name(pitch), e);
            }
        }

        Some(result)
    }

    fn note_on_task(&self, pitch: u8, velocity: f64, frequency: Option<f64>) {
        let generation = {
            let mut voices = self.voices.lock();
            let frequency = frequency.unwrap_or_else(|| self.scale.lock().frequency(pitch));
            voices.register_note_on(pitch, velocity, frequency, self.clock.now())
        };
        let Some(generation) = generation else {
            warn!("note-on for pitch {} outside the MIDI range", pitch);
            return;
        };
        self.tuning_request.set();

        thread::sleep(self.config.audio_lag_duration());

        let mut voices = self.voices.lock();
        if self.stopped_during_lag("start", pitch) {
            return;
        }
        match voices.play_note_on(pitch, generation, self.output.as_ref()) {
            Ok(true) => {}
            Ok(false) => debug!("start of {} superseded", pitch_name(pitch)),
            Err(e) => warn!("could not start {}: {}", pitch_name(pitch), e),
        }
    }

    fn note_off_task(&self, pitch: u8) {
        self.voices.lock().register_note_off(pitch, self.clock.now());

        thread::sleep(self.config.audio_lag_duration());

        let mut voices = self.voices.lock();
        if self.stopped_during_lag("release", pitch) {
            return;
        }
        if let Err(e) = voices.play_note_off(pitch, self.output.as_ref()) {
            warn!("could not release {}: {}", pitch_name(pitch), e);
        }
    }

    fn stop_all_task(&self) {
        self.voices.lock().register_stop_all(self.clock.now());

        thread::sleep(self.config.audio_lag_duration());

        let mut voices = self.voices.lock();
        if self.stop.is_triggered() {
            return;
        }
        if let Err(e) = voices.play_stop_all(self.output.as_ref()) {
            warn!("could not free all voices: {}", e);
        }
    }

    /// Checked with the voice table locked: once the session is stopping,
    /// `TuningScheduler::stop` owns the final free and handlers must not
    /// touch the output any more.
    fn stopped_during_lag(&self, command: &str, pitch: u8) -> bool {
        let stopped = self.stop.is_triggered();
        if stopped {
            debug!("session stopping, skipping {} of {}", command, pitch_name(pitch));
        }
        stopped
    }

    /// Join handlers until none are left; handlers may still be spawned
    /// while earlier ones are joined.
    fn join_handlers(&self) {
        loop {
            let batch = std::mem::take(&mut *self.handlers.lock());
            if batch.is_empty() {
                break;
            }
            for handler in batch {
                if handler.join().is_err() {
                    error!("note handler panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::output::{OutputCommand, RecordingOutput};
    use crate::voice::Envelope;
    use std::{
        sync::atomic::AtomicUsize,
        time::{Duration, Instant},
    };

    fn quiet_config() -> TunerConfig {
        TunerConfig {
            // Only requested passes during the test.
            tuning_interval: 3600.0,
            audio_lag: 0.02,
            tick: 0.002,
            ..TunerConfig::default()
        }
    }

    fn scheduler(config: TunerConfig) -> (TuningScheduler, Arc<RecordingOutput>, Arc<ManualClock>) {
        let output = Arc::new(RecordingOutput::new());
        let clock = Arc::new(ManualClock::new(0.0));
        let scheduler = TuningScheduler::with_parts(
            config,
            output.clone(),
            clock.clone(),
            Box::new(Scale::default()),
        );
        (scheduler, output, clock)
    }

    /// Register and start `pitch` at equal temperament, bypassing the lag.
    fn sound(scheduler: &TuningScheduler, pitch: u8) {
        let shared = &scheduler.shared;
        let mut voices = shared.voices.lock();
        let generation = voices
            .register_note_on(pitch, 1.0, equal_temperament_frequency(pitch), shared.clock.now())
            .unwrap();
        voices.play_note_on(pitch, generation, shared.output.as_ref()).unwrap();
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    /// No second start without a free in between; releases only while sounding.
    fn assert_consistent(commands: &[OutputCommand]) {
        let mut state = [0u8; 128]; // 0 silent, 1 sounding, 2 releasing
        for command in commands {
            match *command {
                OutputCommand::Start { pitch, .. } => {
                    assert_eq!(state[pitch as usize], 0, "double start in {:?}", commands);
                    state[pitch as usize] = 1;
                }
                OutputCommand::Release { pitch } => {
                    assert_eq!(state[pitch as usize], 1, "stray release in {:?}", commands);
                    state[pitch as usize] = 2;
                }
                OutputCommand::FastReleaseAndFree { pitch } => {
                    assert_ne!(state[pitch as usize], 0, "stray free in {:?}", commands);
                    state[pitch as usize] = 0;
                }
                OutputCommand::SetFrequency { pitch, .. } | OutputCommand::SetAmplitude { pitch, .. } => {
                    assert_ne!(state[pitch as usize], 0, "update of silent voice in {:?}", commands);
                }
                OutputCommand::Prepare => {}
            }
        }
    }

    #[test]
    fn test_tuning_pass_moves_major_triad_towards_just_intonation() {
        let (scheduler, output, _clock) = scheduler(quiet_config());
        let handle = scheduler.handle();
        for pitch in [69, 73, 76] {
            sound(&scheduler, pitch);
        }

        let timbre = scheduler.shared.config.synth.timbre.clone();
        let global = scheduler.shared.config.synth.global_amplitude;
        handle.set_fixed_frequencies(
            timbre.partials_pos().iter().map(|p| 440.0 * p).collect(),
            timbre.partials_amp().iter().map(|a| global * a).collect(),
        );
        output.clear();

        let result = handle.run_tuning_pass().expect("three running voices");
        assert!(result.success, "{}", result.message);
        assert_eq!(result.x.len(), 3);

        let root = handle.voice(69).unwrap().frequency;
        let third = handle.voice(73).unwrap().frequency;
        let fifth = handle.voice(76).unwrap().frequency;
        let et_third = equal_temperament_frequency(73) / 440.0;
        let et_fifth = equal_temperament_frequency(76) / 440.0;

        assert!(third < equal_temperament_frequency(73));
        assert!((third / root - 1.25).abs() < (et_third - 1.25).abs());
        assert!((fifth / root - 1.5).abs() < (et_fifth - 1.5).abs());

        let updates: Vec<u8> = output
            .commands()
            .iter()
            .filter_map(|c| match c {
                OutputCommand::SetFrequency { pitch, .. } => Some(*pitch),
                _ => None,
            })
            .collect();
        assert_eq!(updates, vec![69, 73, 76]);
    }

    #[test]
    fn test_tuning_pass_without_voices() {
        let (scheduler, output, _clock) = scheduler(quiet_config());
        assert!(scheduler.handle().run_tuning_pass().is_none());
        assert!(output.commands().is_empty());
    }

    #[test]
    fn test_tuning_pass_restarts_from_equal_temperament() {
        let (scheduler, _output, _clock) = scheduler(quiet_config());
        let handle = scheduler.handle();
        sound(&scheduler, 69);
        {
            let shared = &scheduler.shared;
            shared.voices.lock().retune(69, 430.0, shared.output.as_ref()).unwrap();
        }

        // A lone tone has nothing to be dissonant with.
        let result = handle.run_tuning_pass().unwrap();
        assert_eq!(result.x, vec![440.0]);
        assert_eq!(handle.voice(69).unwrap().frequency, 440.0);
    }

    #[test]
    fn test_suspended_pass_is_not_applied() {
        let (scheduler, _output, _clock) = scheduler(quiet_config());
        let handle = scheduler.handle();
        sound(&scheduler, 69);
        {
            let shared = &scheduler.shared;
            shared.voices.lock().retune(69, 430.0, shared.output.as_ref()).unwrap();
        }

        handle.suspend_tuning();
        assert!(handle.run_tuning_pass().is_some());
        assert_eq!(handle.voice(69).unwrap().frequency, 430.0);
    }

    #[test]
    fn test_released_voices_leave_the_pass() {
        let mut config = quiet_config();
        config.save_session_log = true;
        config.synth.envelope = Envelope::new(0.0, 0.0, 1.0, 0.5);
        let (mut scheduler, _output, clock) = scheduler(config);
        let handle = scheduler.start().unwrap();

        sound(&scheduler, 69);
        sound(&scheduler, 76);
        clock.set(1.0);
        scheduler.shared.voices.lock().register_note_off(76, 1.0);

        clock.set(1.25);
        handle.run_tuning_pass();
        clock.set(2.0);
        handle.run_tuning_pass();
        assert_eq!(handle.running_pitches(), vec![69]);

        let log = handle.session_log().unwrap();
        let pitches: Vec<Vec<u8>> = log.tunings.iter().map(|t| t.pitches.clone()).collect();
        assert!(pitches.contains(&vec![69, 76]));
        assert_eq!(pitches.last(), Some(&vec![69]));
        assert_eq!(log.tunings.last().unwrap().elapsed, 2.0);

        scheduler.stop();
    }

    #[test]
    fn test_note_on_sounds_after_lag_with_scale_frequency() {
        let (mut scheduler, output, _clock) = scheduler(quiet_config());
        let handle = scheduler.start().unwrap();

        handle.note_on(69, 0.5);
        assert!(wait_until(Duration::from_secs(5), || !output.commands_for(69).is_empty()));

        let voice = handle.voice(69).unwrap();
        assert_eq!(voice.amplitude, 0.005);
        assert_eq!(
            output.commands_for(69)[0],
            OutputCommand::Start {
                pitch: 69,
                frequency: 440.0,
                amplitude: 0.005
            }
        );

        scheduler.stop();
        assert_eq!(
            output.commands_for(69).last(),
            Some(&OutputCommand::FastReleaseAndFree { pitch: 69 })
        );
    }

    #[test]
    fn test_note_on_with_explicit_frequency() {
        let (mut scheduler, output, _clock) = scheduler(quiet_config());
        let handle = scheduler.start().unwrap();
        handle.suspend_tuning();

        handle.handle_event(NoteEvent::NoteOn {
            pitch: 60,
            velocity: 1.0,
            frequency: Some(256.0),
        });
        assert!(wait_until(Duration::from_secs(5), || !output.commands_for(60).is_empty()));
        assert!(matches!(
            output.commands_for(60)[0],
            OutputCommand::Start { frequency, .. } if frequency == 256.0
        ));

        scheduler.stop();
    }

    #[test]
    fn test_note_on_then_off_within_lag_stays_consistent() {
        let (mut scheduler, output, _clock) = scheduler(quiet_config());
        let handle = scheduler.start().unwrap();

        for _ in 0..5 {
            handle.note_on(62, 1.0);
            handle.note_off(62);
        }
        handle.note_on(64, 1.0);
        handle.note_off(64);
        handle.note_on(64, 1.0);

        scheduler.shared.join_handlers();
        scheduler.stop();

        let commands = output.commands();
        assert_consistent(&commands);
        let starts = commands
            .iter()
            .filter(|c| matches!(c, OutputCommand::Start { .. }))
            .count();
        assert!(starts >= 2);
        assert_eq!(scheduler.shared.voices.lock().running(0.0).count(), 0);
    }

    #[test]
    fn test_stop_event_frees_everything() {
        let (mut scheduler, output, _clock) = scheduler(quiet_config());
        let handle = scheduler.start().unwrap();

        handle.note_on(60, 1.0);
        handle.note_on(67, 1.0);
        assert!(wait_until(Duration::from_secs(5), || {
            output
                .commands()
                .iter()
                .filter(|c| matches!(c, OutputCommand::Start { .. }))
                .count()
                == 2
        }));

        handle.stop_all();
        assert!(wait_until(Duration::from_secs(5), || {
            output
                .commands()
                .iter()
                .filter(|c| matches!(c, OutputCommand::FastReleaseAndFree { .. }))
                .count()
                == 2
        }));
        assert!(handle.running_pitches().is_empty());

        scheduler.stop();
        assert_consistent(&output.commands());
    }

    #[test]
    fn test_loop_retunes_after_note_on() {
        let (mut scheduler, output, _clock) = scheduler(quiet_config());
        let handle = scheduler.start().unwrap();

        for pitch in [69, 73, 76] {
            handle.note_on(pitch, 1.0);
        }
        let et_ratio = equal_temperament_frequency(73) / 440.0;
        assert!(wait_until(Duration::from_secs(10), || {
            match (handle.voice(69), handle.voice(73)) {
                (Some(root), Some(third)) => third.frequency / root.frequency < et_ratio - 1e-4,
                _ => false,
            }
        }));

        scheduler.stop();
        assert_consistent(&output.commands());
    }

    #[test]
    fn test_start_twice_is_an_error() {
        let (mut scheduler, output, _clock) = scheduler(quiet_config());
        scheduler.start().unwrap();
        assert!(matches!(scheduler.start(), Err(TuningError::AlreadyRunning)));
        scheduler.stop();
        assert!(!scheduler.is_running());
        assert_eq!(output.commands(), vec![OutputCommand::Prepare]);
    }

    struct BrokenDevice;

    impl SoundOutput for BrokenDevice {
        fn prepare(&self) -> Result<()> {
            Err(TuningError::Output("no device".into()))
        }
        fn start_voice(&self, _: u8, _: f64, _: f64) -> Result<()> {
            Ok(())
        }
        fn set_frequency(&self, _: u8, _: f64) -> Result<()> {
            Ok(())
        }
        fn set_amplitude(&self, _: u8, _: f64) -> Result<()> {
            Ok(())
        }
        fn release(&self, _: u8) -> Result<()> {
            Ok(())
        }
        fn fast_release_and_free(&self, _: u8) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_unpreparable_output_aborts_start() {
        let mut scheduler = TuningScheduler::new(quiet_config(), Arc::new(BrokenDevice));
        assert!(matches!(scheduler.start(), Err(TuningError::Output(_))));
        assert!(!scheduler.is_running());
    }

    /// Panics on every retune.
    #[derive(Default)]
    struct PanickyOutput {
        retunes: AtomicUsize,
    }

    impl SoundOutput for PanickyOutput {
        fn start_voice(&self, _: u8, _: f64, _: f64) -> Result<()> {
            Ok(())
        }
        fn set_frequency(&self, _: u8, _: f64) -> Result<()> {
            self.retunes.fetch_add(1, Ordering::SeqCst);
            panic!("synth crashed");
        }
        fn set_amplitude(&self, _: u8, _: f64) -> Result<()> {
            Ok(())
        }
        fn release(&self, _: u8) -> Result<()> {
            Ok(())
        }
        fn fast_release_and_free(&self, _: u8) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_loop_survives_panicking_pass() {
        let output = Arc::new(PanickyOutput::default());
        let config = TunerConfig {
            tuning_interval: 0.01,
            tick: 0.002,
            ..quiet_config()
        };
        let mut scheduler = TuningScheduler::with_parts(
            config,
            output.clone(),
            Arc::new(ManualClock::new(0.0)),
            Box::new(Scale::default()),
        );
        scheduler.start().unwrap();
        sound(&scheduler, 69);

        assert!(wait_until(Duration::from_secs(10), || output.retunes.load(Ordering::SeqCst) >= 3));
        assert!(scheduler.is_running());
        scheduler.stop();
    }

    #[test]
    fn test_static_tuning_suspends_and_retunes() {
        let (scheduler, output, _clock) = scheduler(quiet_config());
        let handle = scheduler.handle();
        sound(&scheduler, 60);
        output.clear();

        handle.apply_static_tuning(NamedTuning::Natural);
        assert!(handle.is_suspended());
        assert_eq!(handle.voice(60).unwrap().frequency, 261.63);
        assert_eq!(
            output.commands(),
            vec![OutputCommand::SetFrequency {
                pitch: 60,
                frequency: 261.63
            }]
        );

        handle.resume_tuning();
        assert!(!handle.is_suspended());
        assert!(scheduler.shared.tuning_request.take());
    }

    #[test]
    fn test_fixed_frequencies_are_replaced() {
        let (scheduler, _output, _clock) = scheduler(quiet_config());
        let handle = scheduler.handle();

        handle.set_fixed_frequencies(vec![100.0, 200.0], vec![1.0, 0.5]);
        handle.set_fixed_frequencies(vec![300.0], vec![0.1]);
        assert_eq!(
            handle.fixed_frequencies(),
            FixedFrequencies {
                frequencies: vec![300.0],
                amplitudes: vec![0.1]
            }
        );

        handle.set_fixed_frequencies(Vec::new(), Vec::new());
        assert_eq!(handle.fixed_frequencies(), FixedFrequencies::default());
    }

    #[test]
    fn test_set_note_amplitude() {
        let (scheduler, output, _clock) = scheduler(quiet_config());
        let handle = scheduler.handle();
        sound(&scheduler, 69);
        output.clear();

        handle.set_note_amplitude(69, 0.5);
        assert_eq!(handle.voice(69).unwrap().amplitude, 0.005);
        assert_eq!(
            output.commands(),
            vec![OutputCommand::SetAmplitude {
                pitch: 69,
                amplitude: 0.005
            }]
        );
    }

    #[test]
    fn test_events_after_stop_are_dropped() {
        let (mut scheduler, output, _clock) = scheduler(quiet_config());
        let handle = scheduler.start().unwrap();
        scheduler.stop();

        handle.note_on(69, 1.0);
        thread::sleep(Duration::from_millis(50));
        assert!(handle.voice(69).is_none());
        assert_eq!(output.commands(), vec![OutputCommand::Prepare]);
    }

    #[test]
    fn test_handler_outliving_stop_does_not_sound() {
        let config = TunerConfig {
            audio_lag: 0.2,
            ..quiet_config()
        };
        let (mut scheduler, output, _clock) = scheduler(config);
        scheduler.start().unwrap();

        // A note-on that got past the stop check but is not tracked as a handler.
        let shared = Arc::clone(&scheduler.shared);
        let late = thread::spawn(move || shared.note_on_task(69, 1.0, None));
        thread::sleep(Duration::from_millis(50));

        scheduler.stop();
        late.join().unwrap();

        let shared = &scheduler.shared;
        shared.note_off_task(69);
        shared.stop_all_task();
        assert_eq!(output.commands(), vec![OutputCommand::Prepare]);
    }

    #[test]
    fn test_pitch_outside_midi_range_is_dropped() {
        let (scheduler, output, _clock) = scheduler(quiet_config());
        let handle = scheduler.handle();
        sound(&scheduler, 64);
        sound(&scheduler, 72);
        output.clear();

        handle.note_on(200, 1.0);
        handle.note_off(200);
        scheduler.shared.note_on_task(200, 1.0, Some(1000.0));
        scheduler.shared.join_handlers();

        assert_eq!(handle.voice(72).unwrap().pitch, 72);
        assert_eq!(handle.running_pitches(), vec![64, 72]);
        assert!(output.commands().is_empty());

        let result = handle.run_tuning_pass().unwrap();
        assert_eq!(result.x.len(), 2);
        assert!(result.x.iter().all(|f| *f < 1000.0));
    }
}
