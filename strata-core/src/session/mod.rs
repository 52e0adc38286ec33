//! Study Session
//!
//! The session is a small state machine (`studying → quiz → completed`, with
//! an orthogonal pause flag) and an elapsed-seconds counter driven by a
//! periodic timer.
//!
//! - [`SessionCommand::apply`] holds the pure transition rules
//! - [`TimerScheduler`] abstracts the tick source
//! - [`SessionMachine`] ties the two together and publishes the state to
//!   the graph

mod machine;
mod state;
mod timer;

pub use machine::SessionMachine;
pub use state::{Phase, SessionCommand, SessionState, TimerDirective, Transition};
pub use timer::{ManualTimer, TickFn, TimerHandle, TimerScheduler, TokioTimer};
