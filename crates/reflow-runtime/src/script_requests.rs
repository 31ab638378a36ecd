#![forbid(unsafe_code)]

//! Rerun/stop request coordination between the control thread and the
//! script thread.
//!
//! [`ScriptRequests`] is a small mutex-guarded state machine:
//!
//! ```text
//!              request_rerun            on_scriptrunner_yield / _ready
//!   CONTINUE ───────────────▶ RERUN ─────────────────────────────▶ CONTINUE
//!      │                        │  request_rerun (coalesce)
//!      │                        ◀──┘
//!      │ request_stop / on_scriptrunner_ready
//!      ▼
//!    STOP   (terminal: request_rerun returns false)
//! ```
//!
//! The control thread only ever calls `request_*`; the script thread only
//! ever calls `on_scriptrunner_*`. `yield` is the mid-run check and leaves a
//! stop in place; `ready` is the end-of-run check and either hands over a
//! late rerun or stops the coordinator.

use std::sync::Mutex;

use reflow_core::{WidgetStates, coalesce_widget_states};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptRequestType {
    Continue,
    Stop,
    Rerun,
}

/// Inputs for one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RerunData {
    pub query_string: String,
    /// Full client widget snapshot; `None` keeps whatever is pending.
    pub widget_states: Option<WidgetStates>,
}

impl RerunData {
    #[must_use]
    pub fn new(query_string: impl Into<String>, widget_states: Option<WidgetStates>) -> Self {
        Self {
            query_string: query_string.into(),
            widget_states,
        }
    }

    /// Merge a newer request into this pending one. The newer query string
    /// wins; widget snapshots follow [`coalesce_widget_states`].
    #[must_use]
    pub fn coalesce(&self, newer: RerunData) -> RerunData {
        RerunData {
            widget_states: coalesce_widget_states(
                self.widget_states.as_ref(),
                newer.widget_states.as_ref(),
            ),
            query_string: newer.query_string,
        }
    }
}

/// What the script thread must do next.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptRequest {
    Stop,
    Rerun(RerunData),
}

impl ScriptRequest {
    #[must_use]
    pub fn request_type(&self) -> ScriptRequestType {
        match self {
            Self::Stop => ScriptRequestType::Stop,
            Self::Rerun(_) => ScriptRequestType::Rerun,
        }
    }
}

#[derive(Debug)]
struct RequestsInner {
    state: ScriptRequestType,
    rerun_data: RerunData,
}

/// Thread-safe coordinator for one script thread's lifetime.
#[derive(Debug)]
pub struct ScriptRequests {
    inner: Mutex<RequestsInner>,
}

impl Default for ScriptRequests {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptRequests {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RequestsInner {
                state: ScriptRequestType::Continue,
                rerun_data: RerunData::default(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RequestsInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[must_use]
    pub fn state(&self) -> ScriptRequestType {
        self.lock().state
    }

    /// Rerun data waiting to be picked up, if a rerun is pending.
    #[must_use]
    pub fn pending_rerun_data(&self) -> Option<RerunData> {
        let inner = self.lock();
        (inner.state == ScriptRequestType::Rerun).then(|| inner.rerun_data.clone())
    }

    /// Stop the script at its next yield point. Always succeeds.
    pub fn request_stop(&self) {
        let mut inner = self.lock();
        if inner.state != ScriptRequestType::Stop {
            tracing::debug!(target: "reflow.requests", from = ?inner.state, "stop requested");
        }
        inner.state = ScriptRequestType::Stop;
    }

    /// Ask for a rerun. Returns `false` once stopped.
    pub fn request_rerun(&self, data: RerunData) -> bool {
        let mut inner = self.lock();
        match inner.state {
            ScriptRequestType::Stop => {
                tracing::debug!(target: "reflow.requests", "rerun refused: coordinator stopped");
                false
            }
            ScriptRequestType::Continue => {
                inner.state = ScriptRequestType::Rerun;
                inner.rerun_data = data;
                true
            }
            ScriptRequestType::Rerun => {
                let coalesced = inner.rerun_data.coalesce(data);
                inner.rerun_data = coalesced;
                tracing::trace!(target: "reflow.requests", "rerun coalesced with pending request");
                true
            }
        }
    }

    /// Called by the script thread at each yield point.
    ///
    /// `None` means keep going. A stop is reported without clearing it.
    pub fn on_scriptrunner_yield(&self) -> Option<ScriptRequest> {
        let mut inner = self.lock();
        match inner.state {
            ScriptRequestType::Continue => None,
            ScriptRequestType::Stop => Some(ScriptRequest::Stop),
            ScriptRequestType::Rerun => {
                inner.state = ScriptRequestType::Continue;
                Some(ScriptRequest::Rerun(std::mem::take(&mut inner.rerun_data)))
            }
        }
    }

    /// Called by the script thread when a run finishes. A pending rerun is
    /// handed over; otherwise the coordinator stops for good.
    pub fn on_scriptrunner_ready(&self) -> ScriptRequest {
        let mut inner = self.lock();
        match inner.state {
            ScriptRequestType::Rerun => {
                inner.state = ScriptRequestType::Continue;
                ScriptRequest::Rerun(std::mem::take(&mut inner.rerun_data))
            }
            ScriptRequestType::Continue | ScriptRequestType::Stop => {
                inner.state = ScriptRequestType::Stop;
                ScriptRequest::Stop
            }
        }
    }
}
