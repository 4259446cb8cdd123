// src/state/mod.rs
//
// Declarative session state.
//
// Plain data that crosses thread or process boundaries: the commands an
// operator sends to a running session and the log a session leaves behind.
//
// Key principles:
// - All structures are plain data (no locks, no handles)
// - The session log is serializable (for save/load)
// - Commands are the only way an operator changes a running session

mod command;
mod session;

pub use command::*;
pub use session::*;
