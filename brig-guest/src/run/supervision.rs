//! Foreground supervision as a pure state machine.
//!
//! The engine feeds it reaped children and control tokens; it answers with
//! the next action. Nothing here touches a process.

use brig_proto::ControlToken;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

/// How far the host has escalated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimeoutPhase {
    /// No timeout signalled.
    #[default]
    None,
    /// Soft timeout: the command was asked to terminate.
    Soft,
    /// Hard timeout: the sequence is abandoned.
    Hard,
}

/// Coarse view of a foreground run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Children running, no timeout.
    Running,
    /// Children running after a soft timeout.
    Terminating,
    /// Every tracked child has been reaped.
    Terminated,
}

/// What the engine should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Keep waiting.
    Continue,
    /// Deliver a signal, then keep waiting.
    Signal(Pid, Signal),
    /// All tracked children are gone.
    Finish,
    /// Kill whatever is still running and stop supervising.
    Abandon,
}

/// Tracks the command child and its optional output relay.
#[derive(Debug)]
pub struct Supervision {
    /// The command child.
    child: Pid,
    /// The output relay, when the run has one.
    relay: Option<Pid>,
    /// The command child has not been reaped yet.
    child_running: bool,
    /// The relay has not been reaped yet.
    relay_running: bool,
    /// Exit status of the command child, once reaped.
    status: Option<WaitStatus>,
    /// Escalation seen so far.
    phase: TimeoutPhase,
}

impl Supervision {
    /// Starts supervising `child` and, if present, `relay`.
    pub const fn new(child: Pid, relay: Option<Pid>) -> Self {
        Self {
            child,
            relay,
            child_running: true,
            relay_running: relay.is_some(),
            status: None,
            phase: TimeoutPhase::None,
        }
    }

    /// Current coarse state.
    pub const fn state(&self) -> State {
        if !self.child_running && !self.relay_running {
            State::Terminated
        } else if matches!(self.phase, TimeoutPhase::None) {
            State::Running
        } else {
            State::Terminating
        }
    }

    /// Escalation seen so far.
    pub const fn phase(&self) -> TimeoutPhase {
        self.phase
    }

    /// Exit status of the command child, once reaped.
    pub const fn status(&self) -> Option<WaitStatus> {
        self.status
    }

    /// Tracked children not yet reaped.
    pub fn running(&self) -> impl Iterator<Item = Pid> {
        let child = self.child_running.then_some(self.child);
        let relay = self.relay.filter(|_| self.relay_running);
        child.into_iter().chain(relay)
    }

    /// A child was reaped. Unknown pids (earlier daemons, orphans) are ignored.
    pub fn on_reaped(&mut self, pid: Pid, status: WaitStatus) -> Action {
        if pid == self.child && self.child_running {
            self.child_running = false;
            self.status = Some(status);
        } else if Some(pid) == self.relay && self.relay_running {
            self.relay_running = false;
        }
        self.settle()
    }

    /// A control token arrived from the host.
    pub fn on_control(&mut self, token: ControlToken) -> Action {
        match token {
            ControlToken::Soft => {
                self.phase = self.phase.max(TimeoutPhase::Soft);
                if self.child_running {
                    Action::Signal(self.child, Signal::SIGTERM)
                } else {
                    self.settle()
                }
            }
            ControlToken::Hard => {
                self.phase = TimeoutPhase::Hard;
                Action::Abandon
            }
        }
    }

    /// `Finish` once nothing is left, else `Continue`.
    fn settle(&self) -> Action {
        if self.state() == State::Terminated {
            Action::Finish
        } else {
            Action::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHILD: Pid = Pid::from_raw(10);
    const RELAY: Pid = Pid::from_raw(11);

    fn exited(pid: Pid, code: i32) -> WaitStatus {
        WaitStatus::Exited(pid, code)
    }

    #[test]
    fn finishes_when_the_child_exits() {
        let mut s = Supervision::new(CHILD, None);
        assert_eq!(s.state(), State::Running);
        assert_eq!(s.on_reaped(CHILD, exited(CHILD, 3)), Action::Finish);
        assert_eq!(s.state(), State::Terminated);
        assert_eq!(s.status(), Some(exited(CHILD, 3)));
        assert_eq!(s.phase(), TimeoutPhase::None);
    }

    #[test]
    fn waits_for_the_relay_too() {
        let mut s = Supervision::new(CHILD, Some(RELAY));
        assert_eq!(s.on_reaped(CHILD, exited(CHILD, 0)), Action::Continue);
        assert_eq!(s.running().collect::<Vec<_>>(), [RELAY]);
        assert_eq!(s.on_reaped(RELAY, exited(RELAY, 0)), Action::Finish);
    }

    #[test]
    fn relay_may_exit_first() {
        let mut s = Supervision::new(CHILD, Some(RELAY));
        assert_eq!(s.on_reaped(RELAY, exited(RELAY, 0)), Action::Continue);
        assert_eq!(s.on_reaped(CHILD, exited(CHILD, 1)), Action::Finish);
        assert_eq!(s.status(), Some(exited(CHILD, 1)));
    }

    #[test]
    fn unknown_children_are_ignored() {
        let mut s = Supervision::new(CHILD, None);
        let stray = Pid::from_raw(99);
        assert_eq!(s.on_reaped(stray, exited(stray, 0)), Action::Continue);
        assert_eq!(s.state(), State::Running);
    }

    #[test]
    fn soft_timeout_terminates_the_child() {
        let mut s = Supervision::new(CHILD, Some(RELAY));
        assert_eq!(
            s.on_control(ControlToken::Soft),
            Action::Signal(CHILD, Signal::SIGTERM)
        );
        assert_eq!(s.state(), State::Terminating);
        assert_eq!(s.phase(), TimeoutPhase::Soft);

        let killed = WaitStatus::Signaled(CHILD, Signal::SIGTERM, false);
        assert_eq!(s.on_reaped(CHILD, killed), Action::Continue);
        assert_eq!(s.on_reaped(RELAY, exited(RELAY, 0)), Action::Finish);
        assert_eq!(s.phase(), TimeoutPhase::Soft);
    }

    #[test]
    fn soft_timeout_after_child_exit_sends_nothing() {
        let mut s = Supervision::new(CHILD, Some(RELAY));
        s.on_reaped(CHILD, exited(CHILD, 0));
        assert_eq!(s.on_control(ControlToken::Soft), Action::Continue);
        assert_eq!(s.phase(), TimeoutPhase::Soft);
    }

    #[test]
    fn hard_timeout_abandons() {
        let mut s = Supervision::new(CHILD, Some(RELAY));
        s.on_control(ControlToken::Soft);
        assert_eq!(s.on_control(ControlToken::Hard), Action::Abandon);
        assert_eq!(s.phase(), TimeoutPhase::Hard);
        assert_eq!(s.running().collect::<Vec<_>>(), [CHILD, RELAY]);

        // A late soft token never downgrades.
        s.on_control(ControlToken::Soft);
        assert_eq!(s.phase(), TimeoutPhase::Hard);
    }
}
