#![forbid(unsafe_code)]

//! The script contract and the handle a running script works through.
//!
//! A [`Script`] is re-executed top to bottom on every interaction. It talks
//! to the session only through [`ScriptContext`], and every call that emits
//! output is a yield point: if a stop or rerun is pending, the call returns
//! [`Interrupt`] and the script is expected to propagate it with `?`.
//!
//! ```rust,ignore
//! let script = script_fn("hello", |ctx| {
//!     let main = ScriptContext::main();
//!     ctx.text(&main, "Hello")?;
//!     let clicked = ctx.widget(&main, "Click", WidgetMetadata::new("btn", WidgetValue::Trigger(false)))?;
//!     if clicked.is_active_trigger() {
//!         ctx.text(&main, "clicked")?;
//!     }
//!     Ok(())
//! });
//! ```
//!
//! Code between yield points cannot be interrupted. A script that loops
//! without emitting should call [`ScriptContext::checkpoint`] itself.
//!
//! Once a yield point has reported an interrupt, the context keeps it: every
//! later yield point reports it again, and the runner acts on it when the
//! body returns even if the script dropped the error.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use reflow_core::{Block, DeltaPath, Element, ForwardMsg, NamedDataSet, RootContainer, WidgetValue};
use thiserror::Error;

use crate::error::{CompileError, ScriptError};
use crate::forward_msg_queue::ForwardMsgQueue;
use crate::script_requests::{RerunData, ScriptRequest, ScriptRequests};
use crate::script_runner::RunnerShared;
use crate::session_state::{SessionState, WidgetMetadata};

/// Control-flow signal returned from a yield point.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Interrupt {
    #[error("script stop requested")]
    Stop,
    #[error("script rerun requested")]
    Rerun(RerunData),
}

impl From<ScriptRequest> for Interrupt {
    fn from(request: ScriptRequest) -> Self {
        match request {
            ScriptRequest::Stop => Self::Stop,
            ScriptRequest::Rerun(data) => Self::Rerun(data),
        }
    }
}

/// A re-executable script body.
pub trait Script: Send + Sync {
    /// Name reported in `NewSession` messages.
    fn name(&self) -> &str;

    /// Validate the body before a run. A failure is reported as a compile
    /// error and the body is skipped.
    fn prepare(&self) -> Result<(), CompileError> {
        Ok(())
    }

    fn run(&self, ctx: &mut ScriptContext<'_>) -> Result<(), ScriptError>;
}

/// A [`Script`] backed by a closure.
pub struct FnScript<F> {
    name: String,
    body: F,
}

impl<F> FnScript<F>
where
    F: Fn(&mut ScriptContext<'_>) -> Result<(), ScriptError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, body: F) -> Self {
        Self {
            name: name.into(),
            body,
        }
    }
}

impl<F> fmt::Debug for FnScript<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnScript").field("name", &self.name).finish_non_exhaustive()
    }
}

impl<F> Script for FnScript<F>
where
    F: Fn(&mut ScriptContext<'_>) -> Result<(), ScriptError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, ctx: &mut ScriptContext<'_>) -> Result<(), ScriptError> {
        (self.body)(ctx)
    }
}

/// Shorthand for [`FnScript::new`].
pub fn script_fn<F>(name: impl Into<String>, body: F) -> FnScript<F>
where
    F: Fn(&mut ScriptContext<'_>) -> Result<(), ScriptError> + Send + Sync,
{
    FnScript::new(name, body)
}

/// Per-run handle passed to [`Script::run`].
pub struct ScriptContext<'a> {
    requests: &'a ScriptRequests,
    shared: &'a RunnerShared,
    queue: &'a ForwardMsgQueue,
    session_state: &'a Mutex<SessionState>,
    query_string: String,
    run_id: u64,
    cursors: HashMap<DeltaPath, u32>,
    delivered: Option<Interrupt>,
}

impl<'a> ScriptContext<'a> {
    pub(crate) fn new(
        requests: &'a ScriptRequests,
        shared: &'a RunnerShared,
        queue: &'a ForwardMsgQueue,
        session_state: &'a Mutex<SessionState>,
        query_string: String,
        run_id: u64,
    ) -> Self {
        Self {
            requests,
            shared,
            queue,
            session_state,
            query_string,
            run_id,
            cursors: HashMap::new(),
            delivered: None,
        }
    }

    /// Path of the main container.
    #[must_use]
    pub fn main() -> DeltaPath {
        DeltaPath::root(RootContainer::Main)
    }

    #[must_use]
    pub fn sidebar() -> DeltaPath {
        DeltaPath::root(RootContainer::Sidebar)
    }

    #[must_use]
    pub fn query_string(&self) -> &str {
        &self.query_string
    }

    #[must_use]
    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    /// Yield point. Parks while the runner is paused, then reports any
    /// pending stop or rerun.
    ///
    /// A rerun that arrives after an earlier one was reported is merged into
    /// it; a stop replaces it.
    pub fn checkpoint(&mut self) -> Result<(), Interrupt> {
        if self.delivered.is_none() {
            self.shared.park_while_paused(self.requests);
        }
        if let Some(request) = self.requests.on_scriptrunner_yield() {
            let next = match (self.delivered.take(), request) {
                (Some(Interrupt::Rerun(pending)), ScriptRequest::Rerun(newer)) => {
                    Interrupt::Rerun(pending.coalesce(newer))
                }
                (_, request) => request.into(),
            };
            self.delivered = Some(next);
        }
        match &self.delivered {
            Some(interrupt) => Err(interrupt.clone()),
            None => Ok(()),
        }
    }

    /// The interrupt a yield point reported during this run, if any.
    pub(crate) fn take_delivered(&mut self) -> Option<Interrupt> {
        self.delivered.take()
    }

    /// Claim the next child position under `parent`.
    pub fn next_path(&mut self, parent: &DeltaPath) -> DeltaPath {
        let cursor = self.cursors.entry(parent.clone()).or_insert(0);
        let path = parent.child(*cursor);
        *cursor += 1;
        path
    }

    /// Queue `msg` after a yield point.
    pub fn enqueue(&mut self, msg: ForwardMsg) -> Result<(), Interrupt> {
        self.checkpoint()?;
        self.queue.enqueue(msg);
        Ok(())
    }

    /// Emit `element` as the next child of `parent`.
    pub fn element(&mut self, parent: &DeltaPath, element: Element) -> Result<DeltaPath, Interrupt> {
        let path = self.next_path(parent);
        self.enqueue(ForwardMsg::new_element(path.clone(), element))?;
        Ok(path)
    }

    pub fn text(&mut self, parent: &DeltaPath, body: impl Into<String>) -> Result<DeltaPath, Interrupt> {
        self.element(parent, Element::Text { body: body.into() })
    }

    /// Open a container as the next child of `parent`; returns its path for
    /// use as a parent.
    pub fn block(&mut self, parent: &DeltaPath, block: Block) -> Result<DeltaPath, Interrupt> {
        let path = self.next_path(parent);
        self.enqueue(ForwardMsg::add_block(path.clone(), block))?;
        Ok(path)
    }

    /// Append rows to the data element already emitted at `target`.
    pub fn add_rows(&mut self, target: &DeltaPath, data: NamedDataSet) -> Result<(), Interrupt> {
        self.enqueue(ForwardMsg::add_rows(target.clone(), data))
    }

    /// Instantiate a widget and emit it as the next child of `parent`.
    ///
    /// Returns the value the script should act on this run.
    pub fn widget(
        &mut self,
        parent: &DeltaPath,
        label: impl Into<String>,
        metadata: WidgetMetadata,
    ) -> Result<WidgetValue, ScriptError> {
        let id = metadata.id.clone();
        let registered = self.session_state().register_widget(metadata)?;
        self.element(
            parent,
            Element::Widget {
                id,
                label: label.into(),
                value: registered.value.clone(),
                set_value: registered.value_changed,
            },
        )?;
        Ok(registered.value)
    }

    /// Lock the session state. Drop the guard before calling
    /// [`widget`](Self::widget).
    pub fn session_state(&self) -> MutexGuard<'a, SessionState> {
        self.session_state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Emit an exception element without yielding.
    pub(crate) fn push_exception(&mut self, parent: &DeltaPath, type_name: &str, message: &str) {
        let path = self.next_path(parent);
        self.queue.enqueue(ForwardMsg::new_element(
            path,
            Element::Exception {
                type_name: type_name.to_owned(),
                message: message.to_owned(),
                stack_trace: Vec::new(),
            },
        ));
    }
}

impl fmt::Debug for ScriptContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptContext")
            .field("run_id", &self.run_id)
            .field("query_string", &self.query_string)
            .finish_non_exhaustive()
    }
}
