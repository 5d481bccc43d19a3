//! Run-level control state shared between the scheduler and callers of
//! `pause`/`resume`/`cancel`/`step`.
//!
//! Held in a `tokio::sync::watch` channel so the scheduler can sleep until
//! something changes instead of polling.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Lifecycle of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlState {
    pub status: RunStatus,
    pub debug: bool,
    /// Dispatches allowed before the next `step()` in debug mode.
    pub step_credits: u32,
}

#[derive(Debug)]
pub struct RunControl {
    tx: watch::Sender<ControlState>,
}

impl RunControl {
    pub fn new(debug: bool) -> Self {
        let (tx, _) = watch::channel(ControlState { status: RunStatus::Idle, debug, step_credits: 0 });
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<ControlState> {
        self.tx.subscribe()
    }

    pub fn status(&self) -> RunStatus {
        self.tx.borrow().status
    }

    pub fn is_debug(&self) -> bool {
        self.tx.borrow().debug
    }

    fn transition(&self, from: &[RunStatus], to: RunStatus) -> bool {
        self.tx.send_if_modified(|s| {
            if from.contains(&s.status) {
                s.status = to;
                true
            } else {
                false
            }
        })
    }

    /// Idle → Running. Debug mode gets one credit so the start node runs.
    pub fn start(&self) -> bool {
        self.tx.send_if_modified(|s| {
            if s.status != RunStatus::Idle {
                return false;
            }
            s.status = RunStatus::Running;
            s.step_credits += u32::from(s.debug);
            true
        })
    }

    pub fn pause(&self) -> bool {
        self.transition(&[RunStatus::Running], RunStatus::Paused)
    }

    pub fn resume(&self) -> bool {
        self.transition(&[RunStatus::Paused], RunStatus::Running)
    }

    pub fn cancel(&self) -> bool {
        self.transition(&[RunStatus::Idle, RunStatus::Running, RunStatus::Paused], RunStatus::Cancelled)
    }

    /// Move a live run to its terminal status. A cancelled run stays cancelled.
    pub fn finish(&self, status: RunStatus) {
        self.transition(&[RunStatus::Running, RunStatus::Paused], status);
    }

    /// Allow one more dispatch in debug mode.
    pub fn step(&self) {
        self.tx.send_modify(|s| s.step_credits = s.step_credits.saturating_add(1));
    }

    pub fn set_debug(&self, debug: bool) {
        self.tx.send_if_modified(|s| {
            let changed = s.debug != debug;
            s.debug = debug;
            changed
        });
    }

    /// Whether the scheduler may start another node right now.
    pub fn may_dispatch(&self) -> bool {
        let s = self.tx.borrow();
        s.status == RunStatus::Running && (!s.debug || s.step_credits > 0)
    }

    pub fn consume_credit(&self) {
        self.tx.send_if_modified(|s| {
            if s.debug && s.step_credits > 0 {
                s.step_credits -= 1;
                true
            } else {
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_resume_cancel_transitions() {
        let control = RunControl::new(false);
        assert!(!control.pause());
        assert!(control.start());
        assert!(!control.start());
        assert!(control.pause());
        assert!(!control.may_dispatch());
        assert!(control.resume());
        assert!(control.may_dispatch());
        assert!(control.cancel());
        control.finish(RunStatus::Completed);
        assert_eq!(control.status(), RunStatus::Cancelled);
        assert!(control.status().is_terminal());
    }

    #[test]
    fn debug_mode_spends_credits() {
        let control = RunControl::new(true);
        control.start();
        assert!(control.may_dispatch());
        control.consume_credit();
        assert!(!control.may_dispatch());
        control.step();
        assert!(control.may_dispatch());
        control.set_debug(false);
        control.consume_credit();
        assert!(control.may_dispatch());
    }
}
