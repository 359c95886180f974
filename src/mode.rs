//! The process-wide operating mode.
//!
//! Exactly one mode is active.  Transitions only happen through
//! [`ModeCommand`]s and take effect for the next packet routed; nothing
//! buffered under the previous mode is drained or replayed.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperatingMode {
    #[default]
    Idle,
    Logging,
    Plotting,
    Predicting,
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperatingMode::Idle => "idle",
            OperatingMode::Logging => "logging",
            OperatingMode::Plotting => "plotting",
            OperatingMode::Predicting => "predicting",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeCommand {
    StartLogging,
    StopLogging,
    StartPlotting,
    StopPlotting,
    StartPredicting,
    StopPredicting,
    /// Return to Idle from any mode.  Used after a failed inference.
    Reset,
}

/// A mode change that actually happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: OperatingMode,
    pub to: OperatingMode,
}

impl Transition {
    pub fn leaves(&self, mode: OperatingMode) -> bool {
        self.from == mode && self.to != mode
    }

    pub fn enters(&self, mode: OperatingMode) -> bool {
        self.to == mode
    }
}

#[derive(Debug, Default)]
pub struct ModeMachine {
    current: OperatingMode,
}

impl ModeMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> OperatingMode {
        self.current
    }

    /// Apply a command.
    ///
    /// A `Start*` always (re)enters its mode, even if already active, so that
    /// entry effects such as recreating log sinks run again.  A `Stop*` for a
    /// mode that is not active is ignored and returns `None`.
    pub fn apply(&mut self, cmd: ModeCommand) -> Option<Transition> {
        use ModeCommand::*;
        use OperatingMode::*;

        let target = match (cmd, self.current) {
            (StartLogging, _) => Logging,
            (StartPlotting, _) => Plotting,
            (StartPredicting, _) => Predicting,
            (StopLogging, Logging) | (StopPlotting, Plotting) | (StopPredicting, Predicting) => {
                Idle
            }
            (StopLogging | StopPlotting | StopPredicting, _) => return None,
            (Reset, Idle) => return None,
            (Reset, _) => Idle,
        };

        let from = self.current;
        self.current = target;
        Some(Transition { from, to: target })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_idle() {
        assert_eq!(ModeMachine::new().current(), OperatingMode::Idle);
    }

    #[test]
    fn start_and_stop() {
        let mut m = ModeMachine::new();
        let t = m.apply(ModeCommand::StartLogging).unwrap();
        assert_eq!(t.from, OperatingMode::Idle);
        assert!(t.enters(OperatingMode::Logging));
        let t = m.apply(ModeCommand::StopLogging).unwrap();
        assert!(t.leaves(OperatingMode::Logging));
        assert_eq!(m.current(), OperatingMode::Idle);
    }

    #[test]
    fn stop_of_inactive_mode_is_ignored() {
        let mut m = ModeMachine::new();
        m.apply(ModeCommand::StartPlotting);
        assert_eq!(m.apply(ModeCommand::StopLogging), None);
        assert_eq!(m.current(), OperatingMode::Plotting);
    }

    #[test]
    fn start_switches_directly_between_modes() {
        let mut m = ModeMachine::new();
        m.apply(ModeCommand::StartLogging);
        let t = m.apply(ModeCommand::StartPredicting).unwrap();
        assert!(t.leaves(OperatingMode::Logging));
        assert!(t.enters(OperatingMode::Predicting));
    }

    #[test]
    fn restart_reenters_same_mode() {
        let mut m = ModeMachine::new();
        m.apply(ModeCommand::StartPredicting);
        let t = m.apply(ModeCommand::StartPredicting).unwrap();
        assert!(t.enters(OperatingMode::Predicting));
        assert!(!t.leaves(OperatingMode::Predicting));
    }

    #[test]
    fn reset_returns_to_idle() {
        let mut m = ModeMachine::new();
        assert_eq!(m.apply(ModeCommand::Reset), None);
        m.apply(ModeCommand::StartPredicting);
        let t = m.apply(ModeCommand::Reset).unwrap();
        assert_eq!(t.to, OperatingMode::Idle);
    }
}
