//! Operator control of a running tuning session.
//!
//! # Architecture
//!
//! - The **operator side** (a console, a UI, a test) owns a [`ControlSender`]
//! - The **controller thread** owns the [`TuningController`] and applies
//!   commands to the session through its [`TunerHandle`]
//! - Communication is a single MPSC channel of [`ControlCommand`]s
//!
//! # Usage
//!
//! ```ignore
//! let handle = scheduler.start()?;
//! let (sender, mut controller) = control_channel(handle, scheduler.stop_signal());
//! std::thread::spawn(move || controller.run());
//!
//! sender.static_tuning(NamedTuning::Natural);
//! sender.enable_adaptive();
//! sender.stop();
//! ```

use std::{
    sync::mpsc::{self, Receiver, RecvTimeoutError, Sender},
    time::Duration,
};

use log::{debug, info};

use crate::scale::NamedTuning;
use crate::scheduler::TunerHandle;
use crate::signal::StopSignal;
use crate::state::ControlCommand;

/// How often a waiting controller checks the stop signal.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Create a linked sender / controller pair for one session.
pub fn control_channel(handle: TunerHandle, stop: StopSignal) -> (ControlSender, TuningController) {
    let (command_tx, command_rx) = mpsc::channel();
    let sender = ControlSender { command_tx };
    let controller = TuningController {
        handle,
        stop,
        command_rx,
    };
    (sender, controller)
}

// ═══════════════════════════════════════════════════════════════════
// ControlSender - operator side
// ═══════════════════════════════════════════════════════════════════

/// Cloneable sending half. Sends never block.
#[derive(Clone)]
pub struct ControlSender {
    command_tx: Sender<ControlCommand>,
}

impl ControlSender {
    /// Returns `false` once the controller is gone.
    pub fn send(&self, command: ControlCommand) -> bool {
        self.command_tx.send(command).is_ok()
    }

    pub fn enable_adaptive(&self) -> bool {
        self.send(ControlCommand::EnableAdaptive)
    }

    pub fn static_tuning(&self, tuning: NamedTuning) -> bool {
        self.send(ControlCommand::StaticTuning(tuning))
    }

    pub fn stop(&self) -> bool {
        self.send(ControlCommand::Stop)
    }
}

// ═══════════════════════════════════════════════════════════════════
// TuningController - session side
// ═══════════════════════════════════════════════════════════════════

/// Applies queued commands to a session.
pub struct TuningController {
    handle: TunerHandle,
    stop: StopSignal,
    command_rx: Receiver<ControlCommand>,
}

impl TuningController {
    /// Apply every queued command without blocking. Returns how many.
    pub fn process_commands(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(command) = self.command_rx.try_recv() {
            self.apply(command);
            applied += 1;
        }
        applied
    }

    pub fn apply(&mut self, command: ControlCommand) {
        info!("control: {}", command);
        match command {
            ControlCommand::EnableAdaptive => self.handle.resume_tuning(),
            ControlCommand::StaticTuning(tuning) => self.handle.apply_static_tuning(tuning),
            ControlCommand::Stop => self.stop.trigger(),
        }
    }

    /// Apply commands as they arrive until the session stops or every
    /// sender is dropped.
    pub fn run(&mut self) {
        while !self.stop.is_triggered() {
            match self.command_rx.recv_timeout(POLL_INTERVAL) {
                Ok(command) => self.apply(command),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("all control senders dropped");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunerConfig;
    use crate::output::RecordingOutput;
    use crate::scheduler::TuningScheduler;
    use std::{sync::Arc, thread};

    fn scheduler() -> TuningScheduler {
        TuningScheduler::new(TunerConfig::default(), Arc::new(RecordingOutput::new()))
    }

    #[test]
    fn test_commands_are_applied_in_order() {
        let scheduler = scheduler();
        let handle = scheduler.handle();
        let (sender, mut controller) = control_channel(handle.clone(), scheduler.stop_signal());

        assert!(sender.static_tuning(NamedTuning::Pythagorean));
        assert_eq!(controller.process_commands(), 1);
        assert!(handle.is_suspended());

        assert!(sender.static_tuning(NamedTuning::Natural));
        assert!(sender.enable_adaptive());
        assert_eq!(controller.process_commands(), 2);
        assert!(!handle.is_suspended());

        assert_eq!(controller.process_commands(), 0);
    }

    #[test]
    fn test_stop_command_triggers_stop_signal() {
        let scheduler = scheduler();
        let stop = scheduler.stop_signal();
        let (sender, mut controller) = control_channel(scheduler.handle(), stop.clone());

        sender.stop();
        controller.process_commands();
        assert!(stop.is_triggered());
    }

    #[test]
    fn test_run_until_stopped() {
        let scheduler = scheduler();
        let stop = scheduler.stop_signal();
        let (sender, mut controller) = control_channel(scheduler.handle(), stop.clone());

        let worker = thread::spawn(move || controller.run());
        sender.enable_adaptive();
        sender.stop();
        worker.join().unwrap();
        assert!(stop.is_triggered());
    }

    #[test]
    fn test_run_ends_when_senders_dropped() {
        let scheduler = scheduler();
        let (sender, mut controller) = control_channel(scheduler.handle(), scheduler.stop_signal());
        drop(sender);
        controller.run();
        assert!(!scheduler.stop_signal().is_triggered());
    }

    #[test]
    fn test_send_after_controller_dropped() {
        let scheduler = scheduler();
        let (sender, controller) = control_channel(scheduler.handle(), scheduler.stop_signal());
        drop(controller);
        assert!(!sender.enable_adaptive());
    }
}
