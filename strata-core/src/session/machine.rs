//! Session State Machine
//!
//! [`SessionMachine`] owns the study session. Its state lives in a state node
//! of the [`Store`], so anything in the graph can derive from it, and its
//! commands drive a [`TimerScheduler`] that ticks the elapsed-time counter.
//!
//! # Timer ownership
//!
//! The machine holds at most one [`TimerHandle`]. Starting a tick stream
//! always cancels the previous one first, and every stream is tagged with a
//! generation number. A tick that was already in flight when its stream was
//! cancelled carries a stale generation and is discarded, as is any tick that
//! arrives after [`dispose`](SessionMachine::dispose).

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use super::state::{SessionCommand, SessionState, TimerDirective, Transition};
use super::timer::{TickFn, TimerHandle, TimerScheduler};
use crate::config::SessionConfig;
use crate::ids::{SectionId, TaskId};
use crate::reactive::{Node, NodeSpec, Store};

pub struct SessionMachine {
    shared: Arc<MachineShared>,
}

struct MachineShared {
    store: Store,
    node: Node<Option<SessionState>>,
    scheduler: Arc<dyn TimerScheduler>,
    period: Duration,
    control: Mutex<Control>,
}

struct Control {
    timer: Option<TimerHandle>,
    generation: u64,
    disposed: bool,
}

impl SessionMachine {
    /// Create a machine with no session, hosting its state in `store`.
    pub fn new(store: &Store, scheduler: Arc<dyn TimerScheduler>, config: &SessionConfig) -> Self {
        let node = store.register(NodeSpec::state(None).label("session"));
        // tokio intervals reject a zero period.
        let period = config.tick_period().max(Duration::from_millis(1));

        Self {
            shared: Arc::new(MachineShared {
                store: store.clone(),
                node,
                scheduler,
                period,
                control: Mutex::new(Control {
                    timer: None,
                    generation: 0,
                    disposed: false,
                }),
            }),
        }
    }

    /// The state node, for watching or deriving from.
    pub fn node(&self) -> Node<Option<SessionState>> {
        self.shared.node
    }

    /// Snapshot of the current session, `None` when there is none.
    pub fn state(&self) -> Option<SessionState> {
        self.shared.current()
    }

    /// Start a fresh session, replacing any existing one.
    pub fn start_session(&self, task_id: Option<TaskId>, section_id: Option<SectionId>) {
        self.shared.dispatch(SessionCommand::Start {
            task_id,
            section_id,
        });
    }

    pub fn pause_session(&self) {
        self.shared.dispatch(SessionCommand::Pause);
    }

    pub fn resume_session(&self) {
        self.shared.dispatch(SessionCommand::Resume);
    }

    pub fn move_to_quiz(&self) {
        self.shared.dispatch(SessionCommand::MoveToQuiz);
    }

    pub fn complete_session(&self) {
        self.shared.dispatch(SessionCommand::Complete);
    }

    /// Inject one tick, as if the timer had fired.
    ///
    /// Ticking a disposed machine is a caller bug: it asserts in debug builds
    /// and is discarded otherwise.
    pub fn tick(&self) {
        let mut control = self.shared.control.lock();
        if control.disposed {
            error!("tick delivered to a disposed session machine");
            debug_assert!(!control.disposed, "tick delivered to a disposed session machine");
            return;
        }
        self.shared.apply(&mut control, SessionCommand::Tick);
    }

    /// Stop the timer and drop the session. Every later tick is discarded.
    pub fn dispose(&self) {
        let mut control = self.shared.control.lock();
        if control.disposed {
            return;
        }
        control.disposed = true;
        MachineShared::cancel_timer(&mut control);
        debug!("session machine disposed");

        if self.shared.current().is_some() {
            self.shared.publish(None);
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.control.lock().disposed
    }
}

impl Drop for SessionMachine {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl MachineShared {
    fn current(&self) -> Option<SessionState> {
        match self.store.peek(&self.node) {
            Some(Ok(state)) => state,
            _ => None,
        }
    }

    fn publish(&self, state: Option<SessionState>) {
        self.store
            .set(&self.node, state)
            .expect("session node is a registered state node");
    }

    fn dispatch(self: &Arc<Self>, command: SessionCommand) {
        let mut control = self.control.lock();
        if control.disposed {
            warn!(?command, "command sent to a disposed session machine, ignoring");
            return;
        }
        debug!(?command, "session command");
        self.apply(&mut control, command);
    }

    /// Run one command against the current state. The control lock is held
    /// throughout, so commands and ticks never interleave.
    fn apply(self: &Arc<Self>, control: &mut Control, command: SessionCommand) {
        let current = self.current();

        if let (SessionCommand::Start { .. }, Some(old)) = (&command, &current) {
            if !old.is_completed() {
                warn!(
                    elapsed = old.elapsed_seconds,
                    phase = ?old.phase,
                    "starting a new session over one still in progress"
                );
            }
        }

        let Transition { state, timer } = command.apply(current.as_ref());

        match timer {
            TimerDirective::Keep => {}
            TimerDirective::Cancel => Self::cancel_timer(control),
            TimerDirective::Start => {
                Self::cancel_timer(control);
                self.start_timer(control);
            }
        }

        if state != current {
            self.publish(state);
        }
    }

    fn start_timer(self: &Arc<Self>, control: &mut Control) {
        let generation = control.generation;
        let weak = Arc::downgrade(self);
        let on_tick: TickFn = Arc::new(move || Self::on_timer_tick(&weak, generation));

        control.timer = Some(self.scheduler.start(self.period, on_tick));
        debug!(generation, period = ?self.period, "session timer started");
    }

    fn cancel_timer(control: &mut Control) {
        if let Some(mut timer) = control.timer.take() {
            timer.cancel();
            debug!(generation = control.generation, "session timer cancelled");
        }
        control.generation += 1;
    }

    fn on_timer_tick(weak: &Weak<Self>, generation: u64) {
        let Some(shared) = weak.upgrade() else {
            trace!("tick after session machine was dropped, discarding");
            return;
        };
        let mut control = shared.control.lock();
        if control.disposed || control.generation != generation {
            trace!(generation, "stale session tick, discarding");
            return;
        }
        shared.apply(&mut control, SessionCommand::Tick);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ManualTimer, Phase};

    fn machine() -> (Store, ManualTimer, SessionMachine) {
        let store = Store::new();
        let timer = ManualTimer::new();
        let machine = SessionMachine::new(
            &store,
            Arc::new(timer.clone()),
            &SessionConfig::default(),
        );
        (store, timer, machine)
    }

    fn elapsed(machine: &SessionMachine) -> u64 {
        machine.state().expect("session started").elapsed_seconds
    }

    /// Scheduler that keeps firing callbacks even after their handle is
    /// cancelled, like a tick that was already queued.
    #[derive(Clone, Default)]
    struct LeakyTimer {
        callbacks: Arc<Mutex<Vec<TickFn>>>,
    }

    impl TimerScheduler for LeakyTimer {
        fn start(&self, _period: Duration, on_tick: TickFn) -> TimerHandle {
            self.callbacks.lock().push(on_tick);
            ManualTimer::new().start(Duration::from_secs(1), Arc::new(|| {}))
        }
    }

    #[test]
    fn no_session_until_started() {
        let (_store, timer, machine) = machine();
        assert_eq!(machine.state(), None);

        machine.pause_session();
        machine.tick();
        assert_eq!(machine.state(), None);
        assert_eq!(timer.active_count(), 0);
    }

    #[test]
    fn ticks_pause_resume_complete() {
        let (_store, timer, machine) = machine();
        machine.start_session(Some(TaskId::from("t1")), Some(SectionId::from("s1")));

        timer.advance(5);
        machine.pause_session();
        assert_eq!(elapsed(&machine), 5);
        assert_eq!(timer.active_count(), 0);

        machine.resume_session();
        timer.advance(3);
        machine.complete_session();

        let state = machine.state().unwrap();
        assert_eq!(state.elapsed_seconds, 8);
        assert_eq!(state.phase, Phase::Completed);

        timer.advance(4);
        machine.tick();
        assert_eq!(elapsed(&machine), 8);
    }

    #[test]
    fn pausing_twice_changes_nothing() {
        let (_store, timer, machine) = machine();
        machine.start_session(None, None);
        timer.advance(2);

        machine.pause_session();
        let once = machine.state();
        machine.pause_session();

        assert_eq!(machine.state(), once);
        assert_eq!(timer.active_count(), 0);
    }

    #[test]
    fn quiz_keeps_timer_running() {
        let (_store, timer, machine) = machine();
        machine.start_session(None, None);
        machine.move_to_quiz();
        timer.fire();

        let state = machine.state().unwrap();
        assert_eq!(state.phase, Phase::Quiz);
        assert_eq!(state.elapsed_seconds, 1);
    }

    #[test]
    fn at_most_one_timer_per_session() {
        let (_store, timer, machine) = machine();
        machine.start_session(None, None);
        machine.resume_session();
        assert_eq!(timer.active_count(), 1);

        machine.start_session(Some(TaskId::from("t2")), None);
        assert_eq!(timer.active_count(), 1);

        timer.fire();
        assert_eq!(elapsed(&machine), 1);
    }

    #[test]
    fn restart_resets_elapsed_time() {
        let (_store, timer, machine) = machine();
        machine.start_session(Some(TaskId::from("t1")), None);
        timer.advance(4);

        machine.start_session(Some(TaskId::from("t2")), None);
        let state = machine.state().unwrap();
        assert_eq!(state.elapsed_seconds, 0);
        assert_eq!(state.task_id, Some(TaskId::from("t2")));
    }

    #[test]
    fn tick_in_flight_after_cancel_is_discarded() {
        let store = Store::new();
        let leaky = LeakyTimer::default();
        let machine = SessionMachine::new(
            &store,
            Arc::new(leaky.clone()),
            &SessionConfig::default(),
        );

        machine.start_session(None, None);
        machine.pause_session();
        machine.resume_session();

        let callbacks = leaky.callbacks.lock().clone();
        assert_eq!(callbacks.len(), 2);

        // First stream was cancelled by the pause.
        (callbacks[0])();
        assert_eq!(elapsed(&machine), 0);

        (callbacks[1])();
        assert_eq!(elapsed(&machine), 1);
    }

    #[test]
    fn dispose_discards_later_ticks() {
        let store = Store::new();
        let leaky = LeakyTimer::default();
        let machine = SessionMachine::new(
            &store,
            Arc::new(leaky.clone()),
            &SessionConfig::default(),
        );
        let node = machine.node();

        machine.start_session(None, None);
        machine.dispose();
        machine.dispose();

        let callbacks = leaky.callbacks.lock().clone();
        (callbacks[0])();

        assert!(machine.is_disposed());
        assert_eq!(machine.state(), None);
        assert_eq!(store.peek(&node), Some(Ok(None)));
    }

    #[test]
    fn tick_after_drop_is_ignored() {
        let store = Store::new();
        let leaky = LeakyTimer::default();
        let machine = SessionMachine::new(
            &store,
            Arc::new(leaky.clone()),
            &SessionConfig::default(),
        );
        machine.start_session(None, None);
        drop(machine);

        let callbacks = leaky.callbacks.lock().clone();
        (callbacks[0])();
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "disposed session machine")]
    fn injected_tick_after_dispose_asserts() {
        let (_store, _timer, machine) = machine();
        machine.start_session(None, None);
        machine.dispose();
        machine.tick();
    }

    #[tokio::test]
    async fn state_changes_reach_subscribers() {
        let (store, timer, machine) = machine();
        let mut sub = store.watch(&machine.node()).unwrap();
        assert_eq!(sub.next().await, Some(Ok(None)));

        machine.start_session(Some(TaskId::from("t1")), None);
        timer.advance(2);

        let state = sub.next().await.unwrap().unwrap().unwrap();
        assert_eq!(state.elapsed_seconds, 2);
        assert!(state.is_timer_running);
    }

    #[tokio::test(start_paused = true)]
    async fn real_timer_counts_seconds() {
        let store = Store::new();
        let machine = SessionMachine::new(
            &store,
            Arc::new(crate::session::TokioTimer),
            &SessionConfig::default(),
        );

        machine.start_session(None, None);
        tokio::time::sleep(Duration::from_millis(5500)).await;
        machine.pause_session();
        assert_eq!(elapsed(&machine), 5);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(elapsed(&machine), 5);
    }
}
