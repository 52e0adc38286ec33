//! Session state and its transitions.
//!
//! The state is a plain value. Commands are applied by a pure function that
//! returns the next state plus what should happen to the tick stream; the
//! [`SessionMachine`](super::SessionMachine) carries out the timer side of
//! that and publishes the state to the graph.
//!
//! ```text
//!   start ──> studying ──move_to_quiz──> quiz ──complete──> completed
//!                │ ▲                      │ ▲
//!          pause │ │ resume         pause │ │ resume
//!                ▼ │                      ▼ │
//!              (paused)                 (paused)
//! ```

use serde::{Deserialize, Serialize};

use crate::ids::{SectionId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Studying,
    Quiz,
    Completed,
}

/// One study session.
///
/// Invariants, upheld by [`SessionCommand::apply`]:
/// - `is_paused` and `is_timer_running` are never both true
/// - `elapsed_seconds` never decreases
/// - once `phase` is `Completed`, nothing changes any more
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub task_id: Option<TaskId>,
    pub section_id: Option<SectionId>,
    pub phase: Phase,
    pub elapsed_seconds: u64,
    pub is_paused: bool,
    pub is_timer_running: bool,
}

impl SessionState {
    /// A fresh session, studying with the timer running.
    pub fn started(task_id: Option<TaskId>, section_id: Option<SectionId>) -> Self {
        Self {
            task_id,
            section_id,
            phase: Phase::Studying,
            elapsed_seconds: 0,
            is_paused: false,
            is_timer_running: true,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.phase == Phase::Completed
    }
}

/// Everything that can change a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Start {
        task_id: Option<TaskId>,
        section_id: Option<SectionId>,
    },
    Pause,
    Resume,
    MoveToQuiz,
    Complete,
    Tick,
}

/// What the owner of the tick stream has to do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerDirective {
    /// Leave the tick stream as it is.
    Keep,
    /// Cancel any tick stream and start a new one.
    Start,
    /// Cancel the tick stream.
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub state: Option<SessionState>,
    pub timer: TimerDirective,
}

impl Transition {
    fn keep(state: Option<&SessionState>) -> Self {
        Self {
            state: state.cloned(),
            timer: TimerDirective::Keep,
        }
    }

    fn to(state: SessionState, timer: TimerDirective) -> Self {
        Self {
            state: Some(state),
            timer,
        }
    }
}

impl SessionCommand {
    /// Apply the command to `current` (`None` when no session exists).
    ///
    /// Commands that do not apply in the current state return it unchanged
    /// with [`TimerDirective::Keep`].
    pub fn apply(self, current: Option<&SessionState>) -> Transition {
        let Some(state) = current else {
            return match self {
                SessionCommand::Start {
                    task_id,
                    section_id,
                } => Transition::to(
                    SessionState::started(task_id, section_id),
                    TimerDirective::Start,
                ),
                _ => Transition::keep(None),
            };
        };

        match self {
            SessionCommand::Start {
                task_id,
                section_id,
            } => Transition::to(
                SessionState::started(task_id, section_id),
                TimerDirective::Start,
            ),
            _ if state.is_completed() => Transition::keep(current),
            SessionCommand::Pause if !state.is_paused => Transition::to(
                SessionState {
                    is_paused: true,
                    is_timer_running: false,
                    ..state.clone()
                },
                TimerDirective::Cancel,
            ),
            SessionCommand::Resume if !state.is_timer_running => Transition::to(
                SessionState {
                    is_paused: false,
                    is_timer_running: true,
                    ..state.clone()
                },
                TimerDirective::Start,
            ),
            SessionCommand::MoveToQuiz if state.phase == Phase::Studying => Transition::to(
                SessionState {
                    phase: Phase::Quiz,
                    ..state.clone()
                },
                TimerDirective::Keep,
            ),
            SessionCommand::Complete => Transition::to(
                SessionState {
                    phase: Phase::Completed,
                    is_paused: false,
                    is_timer_running: false,
                    ..state.clone()
                },
                TimerDirective::Cancel,
            ),
            SessionCommand::Tick if state.is_timer_running => Transition::to(
                SessionState {
                    elapsed_seconds: state.elapsed_seconds.saturating_add(1),
                    ..state.clone()
                },
                TimerDirective::Keep,
            ),
            _ => Transition::keep(current),
        }
    }
}
