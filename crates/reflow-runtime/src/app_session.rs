#![forbid(unsafe_code)]

//! One client session: its script runner, outgoing queue and state, wired to
//! the shared message cache.
//!
//! The transport drives an [`AppSession`] from a single control thread:
//!
//! ```rust,ignore
//! let cache = Arc::new(ForwardMsgCache::new(config.max_cached_message_age));
//! let mut session = AppSession::new(Arc::new(script), Arc::clone(&cache), config);
//! session.request_rerun(None)?;
//! loop {
//!     for msg in session.flush_outgoing() {
//!         transport.send(msg);
//!     }
//!     // ...on client input: session.request_rerun(Some(data))?;
//! }
//! ```
//!
//! # Run Counting
//!
//! The session's run count advances each time a `ScriptFinished` message is
//! delivered by [`AppSession::flush_outgoing`], not when the script thread
//! finishes. Cache ages are therefore measured in runs the client has
//! actually seen.

use std::sync::{Arc, Mutex, MutexGuard, mpsc};

use reflow_core::{ForwardMsg, SessionId, is_cacheable_msg, populate_hash_if_needed};

use crate::config::RuntimeConfig;
use crate::error::SessionError;
use crate::forward_msg_cache::ForwardMsgCache;
use crate::forward_msg_queue::ForwardMsgQueue;
use crate::script::Script;
use crate::script_requests::RerunData;
use crate::script_runner::{RunnerState, ScriptRunner, ScriptRunnerEvent};
use crate::session_state::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppSessionState {
    AppNotRunning,
    AppIsRunning,
    ShutdownRequested,
}

pub struct AppSession {
    id: SessionId,
    cache: Arc<ForwardMsgCache>,
    queue: Arc<ForwardMsgQueue>,
    session_state: Arc<Mutex<SessionState>>,
    runner: ScriptRunner,
    events: mpsc::Receiver<ScriptRunnerEvent>,
    min_cached_message_size: usize,
    script_run_count: u64,
    last_query_string: String,
    shutdown_requested: bool,
}

impl AppSession {
    #[must_use]
    pub fn new(script: Arc<dyn Script>, cache: Arc<ForwardMsgCache>, config: RuntimeConfig) -> Self {
        let id = SessionId::next();
        let queue = Arc::new(ForwardMsgQueue::new());
        let session_state = Arc::new(Mutex::new(SessionState::new()));
        let (tx, rx) = mpsc::channel();
        let runner = ScriptRunner::new(
            id,
            script,
            Arc::clone(&queue),
            Arc::clone(&session_state),
            &config.runner,
            tx,
        );
        tracing::info!(target: "reflow.session", session = %id, "session created");
        Self {
            id,
            cache,
            queue,
            session_state,
            runner,
            events: rx,
            min_cached_message_size: config.min_cached_message_size,
            script_run_count: 0,
            last_query_string: String::new(),
            shutdown_requested: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> AppSessionState {
        if self.shutdown_requested {
            AppSessionState::ShutdownRequested
        } else if self.runner.is_alive() {
            AppSessionState::AppIsRunning
        } else {
            AppSessionState::AppNotRunning
        }
    }

    #[must_use]
    pub fn runner_state(&self) -> RunnerState {
        self.runner.state()
    }

    /// Runs whose `ScriptFinished` has been delivered so far.
    #[must_use]
    pub fn script_run_count(&self) -> u64 {
        self.script_run_count
    }

    /// Lock the session state, e.g. to inspect it between runs.
    pub fn session_state(&self) -> MutexGuard<'_, SessionState> {
        self.session_state.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[must_use]
    pub fn queue(&self) -> &ForwardMsgQueue {
        &self.queue
    }

    /// Start or restart the script.
    ///
    /// `None` reruns with the last query string and no new widget snapshot.
    /// The request goes to the live script thread if it will take it;
    /// otherwise the previous thread is joined and a new one spawned.
    pub fn request_rerun(&mut self, data: Option<RerunData>) -> Result<(), SessionError> {
        if self.shutdown_requested {
            return Err(SessionError::ShutDown);
        }
        let data = data.unwrap_or_else(|| RerunData::new(self.last_query_string.clone(), None));
        self.last_query_string.clone_from(&data.query_string);

        if self.runner.request_rerun(data.clone()) {
            tracing::debug!(target: "reflow.session", session = %self.id, "rerun handed to live runner");
            return Ok(());
        }

        self.runner.join()?;
        self.runner.spawn(data)?;
        tracing::debug!(target: "reflow.session", session = %self.id, "script runner respawned");
        Ok(())
    }

    pub fn request_stop(&self) {
        self.runner.request_stop();
    }

    pub fn pause(&self) -> bool {
        self.runner.pause()
    }

    pub fn resume(&self) {
        self.runner.resume();
    }

    /// Runner events received since the last call.
    pub fn poll_events(&mut self) -> Vec<ScriptRunnerEvent> {
        self.events.try_iter().collect()
    }

    /// Drain the outgoing queue for delivery.
    ///
    /// Large payloads this session already holds are replaced by reference
    /// messages. Each delivered `ScriptFinished` advances the run count and
    /// expires stale cache references.
    pub fn flush_outgoing(&mut self) -> Vec<ForwardMsg> {
        let msgs = self.queue.flush();
        let mut out = Vec::with_capacity(msgs.len());
        for mut msg in msgs {
            let finished = msg.script_finished_status().is_some();
            if is_cacheable_msg(&msg, self.min_cached_message_size) {
                msg.metadata.cacheable = true;
                out.push(self.route_through_cache(msg));
            } else {
                out.push(msg);
            }

            if finished {
                self.script_run_count += 1;
                self.cache
                    .remove_expired_entries_for_session(self.id, self.script_run_count);
            }
        }
        out
    }

    fn route_through_cache(&self, mut msg: ForwardMsg) -> ForwardMsg {
        if let Err(err) = populate_hash_if_needed(&mut msg) {
            tracing::warn!(target: "reflow.session", error = %err, "hashing failed; sending full payload");
            return msg;
        }

        let outgoing = if self
            .cache
            .has_message_reference(&msg, self.id, self.script_run_count)
        {
            match ForwardMsgCache::create_reference_msg(&msg) {
                Ok(reference) => reference,
                Err(err) => {
                    tracing::warn!(target: "reflow.session", error = %err, "reference failed; sending full payload");
                    msg.clone()
                }
            }
        } else {
            msg.clone()
        };

        if let Err(err) = self.cache.add_message(&msg, self.id, self.script_run_count) {
            tracing::warn!(target: "reflow.session", error = %err, "failed to cache message");
        }
        outgoing
    }

    /// Stop and join the script thread, then release everything this
    /// session holds, including its cache references.
    pub fn shutdown(&mut self) -> Result<(), SessionError> {
        if self.shutdown_requested {
            return Ok(());
        }
        self.shutdown_requested = true;
        self.runner.request_stop();
        let joined = self.runner.join();

        self.cache.remove_refs_for_session(self.id);
        self.session_state().clear();
        self.queue.clear(false);
        tracing::info!(target: "reflow.session", session = %self.id, "session shut down");
        joined.map_err(SessionError::from)
    }
}

impl std::fmt::Debug for AppSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("script_run_count", &self.script_run_count)
            .finish_non_exhaustive()
    }
}

impl Drop for AppSession {
    fn drop(&mut self) {
        if !self.shutdown_requested {
            self.runner.request_stop();
            self.cache.remove_refs_for_session(self.id);
        }
    }
}
