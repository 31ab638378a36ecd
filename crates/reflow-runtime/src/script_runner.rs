#![forbid(unsafe_code)]

//! Background execution of a session's script.
//!
//! A [`ScriptRunner`] owns at most one live script thread. The thread runs
//! the script, and between runs asks [`ScriptRequests`] what to do next:
//!
//! ```text
//!   spawn ──▶ run ──┬── finished ── on_scriptrunner_ready ──┬── Rerun ──▶ run
//!                   │                                      └── Stop ──▶ exit
//!                   ├── Interrupt::Rerun ─────────────────────────────▶ run
//!                   └── Interrupt::Stop ──────────────────────────────▶ exit
//! ```
//!
//! Every run is framed on the outgoing queue the same way: the queue is
//! cleared (keeping lifecycle messages), then `NewSession` and
//! `SessionStatusChanged(true)` are queued, then the script's own output,
//! then `ScriptFinished`. When the thread exits it queues
//! `SessionStatusChanged(false)`.
//!
//! Progress is reported to the control thread as [`ScriptRunnerEvent`]s.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, mpsc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use reflow_core::{ForwardMsg, NewSession, ScriptFinishedStatus, SessionId};
use tracing::field::Empty;
use web_time::Instant;

use crate::config::RunnerConfig;
use crate::error::{RunnerError, ScriptError};
use crate::forward_msg_queue::ForwardMsgQueue;
use crate::script::{Interrupt, Script, ScriptContext};
use crate::script_requests::{RerunData, ScriptRequest, ScriptRequestType, ScriptRequests};
use crate::session_state::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    /// Never spawned.
    Initial,
    Running,
    StopRequested,
    RerunRequested,
    /// Parked at a yield point until resumed.
    Paused,
    /// The thread has exited; a new spawn is allowed.
    Stopped,
}

impl RunnerState {
    #[must_use]
    pub fn is_alive(self) -> bool {
        !matches!(self, Self::Initial | Self::Stopped)
    }
}

/// How one run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    CompileError,
    ForRerun,
    Stopped,
    /// The body returned an error or panicked; an exception element was shown.
    Errored,
}

impl RunOutcome {
    #[must_use]
    pub fn finished_status(self) -> ScriptFinishedStatus {
        match self {
            Self::Success | Self::Stopped | Self::Errored => ScriptFinishedStatus::FinishedSuccessfully,
            Self::CompileError => ScriptFinishedStatus::FinishedWithCompileError,
            Self::ForRerun => ScriptFinishedStatus::FinishedEarlyForRerun,
        }
    }

    fn from_interrupt(interrupt: &Interrupt) -> Self {
        match interrupt {
            Interrupt::Stop => Self::Stopped,
            Interrupt::Rerun(_) => Self::ForRerun,
        }
    }

    /// Whether the body reached its end, so every widget it uses was declared.
    #[must_use]
    pub fn completed(self) -> bool {
        matches!(self, Self::Success | Self::Errored)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptRunnerEvent {
    ScriptStarted { run_id: u64, query_string: String },
    ScriptStopped { run_id: u64, outcome: RunOutcome },
    /// The script thread exited.
    Shutdown,
}

/// State shared between the runner handle and its thread.
#[derive(Debug)]
pub(crate) struct RunnerShared {
    state: Mutex<RunnerState>,
    wake: Condvar,
    paused: AtomicBool,
    poll_interval: Duration,
}

impl RunnerShared {
    pub(crate) fn new(config: &RunnerConfig) -> Self {
        Self {
            state: Mutex::new(RunnerState::Initial),
            wake: Condvar::new(),
            paused: AtomicBool::new(false),
            poll_interval: config.pause_poll_interval(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RunnerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> RunnerState {
        *self.lock_state()
    }

    fn set_state(&self, next: RunnerState) {
        *self.lock_state() = next;
    }

    /// Record a stop or rerun request and wake a paused script. The caller
    /// holds the state lock across the coordinator update.
    fn on_request(&self, state: &mut RunnerState, next: RunnerState) {
        self.paused.store(false, Ordering::Release);
        *state = next;
        self.wake.notify_all();
    }

    /// Block the script thread while paused. Returns early once a stop or
    /// rerun is pending.
    pub(crate) fn park_while_paused(&self, requests: &ScriptRequests) {
        if !self.paused.load(Ordering::Acquire) {
            return;
        }
        tracing::debug!(target: "reflow.runner", "script parked");
        let mut state = self.lock_state();
        while self.paused.load(Ordering::Acquire) && requests.state() == ScriptRequestType::Continue {
            state = match self.wake.wait_timeout(state, self.poll_interval) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        drop(state);
        tracing::debug!(target: "reflow.runner", "script unparked");
    }
}

/// Owner of a session's script thread.
pub struct ScriptRunner {
    session_id: SessionId,
    script: Arc<dyn Script>,
    queue: Arc<ForwardMsgQueue>,
    session_state: Arc<Mutex<SessionState>>,
    requests: Arc<ScriptRequests>,
    shared: Arc<RunnerShared>,
    next_run_id: Arc<AtomicU64>,
    events: mpsc::Sender<ScriptRunnerEvent>,
    thread_name: String,
    handle: Option<JoinHandle<()>>,
}

impl ScriptRunner {
    pub fn new(
        session_id: SessionId,
        script: Arc<dyn Script>,
        queue: Arc<ForwardMsgQueue>,
        session_state: Arc<Mutex<SessionState>>,
        config: &RunnerConfig,
        events: mpsc::Sender<ScriptRunnerEvent>,
    ) -> Self {
        Self {
            session_id,
            script,
            queue,
            session_state,
            requests: Arc::new(ScriptRequests::new()),
            shared: Arc::new(RunnerShared::new(config)),
            next_run_id: Arc::new(AtomicU64::new(0)),
            events,
            thread_name: config.thread_name.clone(),
            handle: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> RunnerState {
        self.shared.state()
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.state().is_alive()
    }

    /// Start the script thread with `initial` as the first run's input.
    ///
    /// Legal only before the first spawn or after the previous thread
    /// stopped; the previous thread is joined and a fresh [`ScriptRequests`]
    /// installed.
    pub fn spawn(&mut self, initial: RerunData) -> Result<(), RunnerError> {
        match self.state() {
            RunnerState::Initial => {}
            RunnerState::Stopped => {
                self.join()?;
                self.requests = Arc::new(ScriptRequests::new());
            }
            _ => return Err(RunnerError::AlreadyRunning),
        }

        self.shared.paused.store(false, Ordering::Release);
        self.shared.set_state(RunnerState::Running);

        let worker = ScriptThread {
            session_id: self.session_id,
            script: Arc::clone(&self.script),
            queue: Arc::clone(&self.queue),
            session_state: Arc::clone(&self.session_state),
            requests: Arc::clone(&self.requests),
            shared: Arc::clone(&self.shared),
            next_run_id: Arc::clone(&self.next_run_id),
            events: self.events.clone(),
        };
        let spawned = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || worker.run_loop(initial));

        match spawned {
            Ok(handle) => {
                tracing::debug!(target: "reflow.runner", session = %self.session_id, "script thread spawned");
                self.handle = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.shared.set_state(RunnerState::Stopped);
                Err(RunnerError::Spawn(err))
            }
        }
    }

    /// Ask the live thread to rerun. `false` when there is no live thread or
    /// it is already stopping; the caller should respawn instead.
    pub fn request_rerun(&self, data: RerunData) -> bool {
        let mut state = self.shared.lock_state();
        if !state.is_alive() || !self.requests.request_rerun(data) {
            return false;
        }
        self.shared.on_request(&mut state, RunnerState::RerunRequested);
        true
    }

    pub fn request_stop(&self) {
        let mut state = self.shared.lock_state();
        if !state.is_alive() {
            return;
        }
        self.requests.request_stop();
        self.shared.on_request(&mut state, RunnerState::StopRequested);
    }

    /// Park the script at its next yield point. `false` if not running.
    pub fn pause(&self) -> bool {
        let mut state = self.shared.lock_state();
        if *state != RunnerState::Running {
            return false;
        }
        self.shared.paused.store(true, Ordering::Release);
        *state = RunnerState::Paused;
        true
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Release);
        let mut state = self.shared.lock_state();
        if *state == RunnerState::Paused {
            *state = RunnerState::Running;
        }
        self.shared.wake.notify_all();
    }

    /// Wait for the script thread to exit.
    pub fn join(&mut self) -> Result<(), RunnerError> {
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| RunnerError::ThreadPanicked),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ScriptRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptRunner")
            .field("session_id", &self.session_id)
            .field("script", &self.script.name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for ScriptRunner {
    fn drop(&mut self) {
        // The thread sees the stop at its next yield point; don't block here.
        self.request_stop();
    }
}

struct ScriptThread {
    session_id: SessionId,
    script: Arc<dyn Script>,
    queue: Arc<ForwardMsgQueue>,
    session_state: Arc<Mutex<SessionState>>,
    requests: Arc<ScriptRequests>,
    shared: Arc<RunnerShared>,
    next_run_id: Arc<AtomicU64>,
    events: mpsc::Sender<ScriptRunnerEvent>,
}

impl ScriptThread {
    fn lock_session_state(&self) -> MutexGuard<'_, SessionState> {
        self.session_state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn run_loop(self, initial: RerunData) {
        let mut next = Some(initial);
        while let Some(data) = next.take() {
            next = match self.run_script(data) {
                Some(Interrupt::Rerun(data)) => Some(data),
                Some(Interrupt::Stop) => None,
                None => match self.requests.on_scriptrunner_ready() {
                    ScriptRequest::Rerun(data) => Some(data),
                    ScriptRequest::Stop => None,
                },
            };
        }

        self.queue.enqueue(ForwardMsg::session_status(false));
        self.shared.set_state(RunnerState::Stopped);
        tracing::debug!(target: "reflow.runner", session = %self.session_id, "script thread exiting");
        let _ = self.events.send(ScriptRunnerEvent::Shutdown);
    }

    /// Execute one run. Returns the interrupt that ended it early, if any.
    fn run_script(&self, data: RerunData) -> Option<Interrupt> {
        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        let span = tracing::debug_span!(
            "reflow.script_run",
            session = %self.session_id,
            run_id,
            duration_us = Empty,
        );
        let _guard = span.enter();

        {
            let mut state = self.shared.lock_state();
            if *state == RunnerState::RerunRequested {
                *state = RunnerState::Running;
            }
        }

        self.queue.clear(true);
        self.queue.enqueue(ForwardMsg::new_session(NewSession {
            session_id: self.session_id,
            script_run_id: run_id,
            main_script_name: self.script.name().to_owned(),
            query_string: data.query_string.clone(),
        }));
        self.queue.enqueue(ForwardMsg::session_status(true));
        let _ = self.events.send(ScriptRunnerEvent::ScriptStarted {
            run_id,
            query_string: data.query_string.clone(),
        });
        tracing::debug!(target: "reflow.runner", query = %data.query_string, "script run started");

        let mut ctx = ScriptContext::new(
            &self.requests,
            &self.shared,
            &self.queue,
            &self.session_state,
            data.query_string,
            run_id,
        );
        let main = ScriptContext::main();

        let callbacks = panic::catch_unwind(AssertUnwindSafe(|| {
            self.lock_session_state()
                .on_script_will_rerun(data.widget_states.as_ref());
        }));

        let (outcome, interrupt) = if let Err(payload) = callbacks {
            let message = panic_message(payload.as_ref());
            tracing::warn!(target: "reflow.runner", %message, "widget callback panicked");
            ctx.push_exception(&main, "Panic", &message);
            (RunOutcome::Errored, None)
        } else if let Err(err) = self.script.prepare() {
            tracing::warn!(target: "reflow.runner", error = %err, "script failed to prepare");
            ctx.push_exception(&main, "CompileError", &err.message);
            (RunOutcome::CompileError, None)
        } else {
            let result = panic::catch_unwind(AssertUnwindSafe(|| self.script.run(&mut ctx)));
            match (ctx.take_delivered(), result) {
                (Some(interrupt), Ok(Err(ScriptError::Interrupted(_)))) => {
                    (RunOutcome::from_interrupt(&interrupt), Some(interrupt))
                }
                (Some(interrupt), _) => {
                    tracing::warn!(
                        target: "reflow.runner",
                        interrupt = %interrupt,
                        "script did not propagate an interrupt; honoring it"
                    );
                    (RunOutcome::from_interrupt(&interrupt), Some(interrupt))
                }
                (None, Ok(Ok(()))) => (RunOutcome::Success, None),
                (None, Ok(Err(ScriptError::Interrupted(Interrupt::Rerun(next))))) => {
                    (RunOutcome::ForRerun, Some(Interrupt::Rerun(next)))
                }
                (None, Ok(Err(ScriptError::Interrupted(Interrupt::Stop)))) => {
                    (RunOutcome::Stopped, Some(Interrupt::Stop))
                }
                (None, Ok(Err(err))) => {
                    tracing::warn!(target: "reflow.runner", error = %err, "script returned an error");
                    let message = match &err {
                        ScriptError::Failed { message, .. } => message.clone(),
                        other => other.to_string(),
                    };
                    ctx.push_exception(&main, err.type_name(), &message);
                    (RunOutcome::Errored, None)
                }
                (None, Err(payload)) => {
                    let message = panic_message(payload.as_ref());
                    tracing::warn!(target: "reflow.runner", %message, "script panicked");
                    ctx.push_exception(&main, "Panic", &message);
                    (RunOutcome::Errored, None)
                }
            }
        };

        self.lock_session_state().on_script_finished(outcome.completed());
        self.queue
            .enqueue(ForwardMsg::script_finished(outcome.finished_status()));

        let duration_us = elapsed_us(start.elapsed());
        span.record("duration_us", duration_us);
        tracing::debug!(
            target: "reflow.runner",
            outcome = ?outcome,
            duration_us,
            "script run finished"
        );
        let _ = self
            .events
            .send(ScriptRunnerEvent::ScriptStopped { run_id, outcome });

        interrupt
    }
}

fn elapsed_us(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "script panicked".to_owned()
    }
}
