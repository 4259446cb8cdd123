// Commands from an operator to a running tuning session.
//
// Commands are queued on a channel and applied by the `TuningController`.

use std::{fmt, str::FromStr};

use crate::error::TuningError;
use crate::scale::NamedTuning;

/// A control-surface command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Resume adaptive tuning and re-tune at once.
    EnableAdaptive,

    /// Suspend adaptive tuning and apply a fixed tuning to the scale.
    StaticTuning(NamedTuning),

    /// End the session.
    Stop,
}

impl FromStr for ControlCommand {
    type Err = TuningError;

    /// `a` / `adaptive`, `exit` / `stop` / `quit`, or a tuning name (`et`, `ji`, ...).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "a" | "adaptive" => Ok(ControlCommand::EnableAdaptive),
            "exit" | "stop" | "quit" => Ok(ControlCommand::Stop),
            other => other.parse().map(ControlCommand::StaticTuning),
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlCommand::EnableAdaptive => f.write_str("adaptive tuning"),
            ControlCommand::StaticTuning(tuning) => write!(f, "static tuning ({})", tuning),
            ControlCommand::Stop => f.write_str("stop"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!("a".parse::<ControlCommand>().unwrap(), ControlCommand::EnableAdaptive);
        assert_eq!(" Adaptive ".parse::<ControlCommand>().unwrap(), ControlCommand::EnableAdaptive);
        assert_eq!("exit".parse::<ControlCommand>().unwrap(), ControlCommand::Stop);
        assert_eq!(
            "ji".parse::<ControlCommand>().unwrap(),
            ControlCommand::StaticTuning(NamedTuning::Natural)
        );
        assert_eq!(
            "ET".parse::<ControlCommand>().unwrap(),
            ControlCommand::StaticTuning(NamedTuning::EqualTemperament)
        );
        assert!(matches!(
            "louder".parse::<ControlCommand>(),
            Err(TuningError::UnknownTuning(_))
        ));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            ControlCommand::StaticTuning(NamedTuning::Vallotti).to_string(),
            "static tuning (Vallotti)"
        );
    }
}
