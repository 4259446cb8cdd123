// src/main.rs
//
// Demo session: an A-major chord with added octave, played against the
// partials of an A3 drone detected as fixed reference tones. Voices go to a
// logging sound output; the dissonance of every tuning pass is printed at
// the end.

use std::{path::PathBuf, process, sync::Arc, thread, time::Duration};

use clap::Parser;
use log::{error, info};

use adaptune::{
    FixedFrequencies, LoggingOutput, NamedTuning, Result, ScriptedNotes, ScriptedPeaks, SynthConfig,
    SynthPreset, TunerConfig, TuningScheduler, control_channel,
};

/// ===============================
/// Arguments
/// ===============================

#[derive(Parser, Debug)]
#[command(name = "adaptune")]
#[command(about = "Adaptive tuning demo: an A-major chord tuned against a drone")]
struct Args {
    /// Tuner configuration (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the session log (JSON) here
    #[arg(long)]
    session_log: Option<PathBuf>,

    /// Play a static tuning instead of adaptive tuning (et, ji, pythagorean, ...)
    #[arg(long = "static", value_parser = parse_tuning)]
    static_tuning: Option<NamedTuning>,

    /// Synth preset (piano, pad)
    #[arg(long, value_parser = parse_preset)]
    preset: Option<SynthPreset>,
}

fn parse_tuning(name: &str) -> std::result::Result<NamedTuning, String> {
    name.parse().map_err(|e: adaptune::TuningError| e.to_string())
}

fn parse_preset(name: &str) -> std::result::Result<SynthPreset, String> {
    SynthPreset::by_name(name).ok_or_else(|| format!("unknown preset: {}", name))
}

/// ===============================
/// Main
/// ===============================

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run(Args::parse()) {
        error!("{}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    // --------------------------------
    // Configuration
    // --------------------------------

    let mut config = match &args.config {
        Some(path) => TunerConfig::from_json_file(path)?,
        None => TunerConfig::default(),
    };
    config.save_session_log = true;
    if let Some(preset) = &args.preset {
        info!("synth preset: {}", preset.name);
        config.synth = SynthConfig {
            global_amplitude: config.synth.global_amplitude,
            ..SynthConfig::from_preset(preset)
        };
    }

    // The drone shares the synth's timbre.
    let drone = 220.0;
    let timbre = &config.synth.timbre;
    let fixed = FixedFrequencies {
        frequencies: timbre.partials_pos().iter().map(|p| drone * p).collect(),
        amplitudes: timbre
            .partials_amp()
            .iter()
            .map(|a| config.synth.global_amplitude * a)
            .collect(),
    };

    let script = ScriptedNotes::chord(0.2, &[69, 73, 76, 81], 0.8, 2.0);
    let playing_time = script.duration() + config.audio_lag.max(0.0) + 0.5;

    // --------------------------------
    // Session
    // --------------------------------

    let mut scheduler = TuningScheduler::new(config, Arc::new(LoggingOutput));
    let handle = scheduler.start()?;
    let (sender, mut controller) = control_channel(handle.clone(), scheduler.stop_signal());
    let control = thread::spawn(move || controller.run());

    if let Some(tuning) = args.static_tuning {
        sender.static_tuning(tuning);
    }

    scheduler.attach_peak_source(ScriptedPeaks::steady(fixed, Duration::from_millis(100)))?;
    scheduler.attach_note_source(script)?;

    scheduler.stop_signal().sleep(Duration::from_secs_f64(playing_time));
    sender.stop();
    if control.join().is_err() {
        error!("controller panicked");
    }
    scheduler.stop();

    // --------------------------------
    // Report
    // --------------------------------

    let Some(log) = handle.session_log() else {
        return Ok(());
    };

    println!("{} tuning passes", log.len());
    println!("{:>8}  {:>10}  {:>10}  {:>10}", "time", "tuned", "ET", "JI");
    for (elapsed, comparison) in log.dissonance_comparisons(handle.model()) {
        println!(
            "{:>8.3}  {:>10.5}  {:>10.5}  {:>10.5}",
            elapsed, comparison.tuned, comparison.equal_tempered, comparison.just_intonation
        );
    }

    if let Some(path) = &args.session_log {
        log.write_json(path)?;
        println!("session log written to {}", path.display());
    }
    Ok(())
}
