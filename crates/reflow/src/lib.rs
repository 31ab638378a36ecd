#![forbid(unsafe_code)]

//! reflow public facade crate.
//!
//! Re-exports the message model from `reflow-core` and the session runtime
//! from `reflow-runtime`, plus a prelude for writing scripts.

use thiserror::Error;

// --- Core re-exports -------------------------------------------------------

pub use reflow_core::{
    Block, Delta, DeltaPath, Element, ForwardMsg, ForwardMsgKind, HashError, MessageHash,
    NamedDataSet, RootContainer, ScriptFinishedStatus, SessionId, WidgetId, WidgetState,
    WidgetStates, WidgetValue,
};

// --- Runtime re-exports ----------------------------------------------------

pub use reflow_runtime::{
    AppSession, AppSessionState, CompileError, ConfigError, ForwardMsgCache, Interrupt,
    RerunData, RunnerConfig, RuntimeConfig, Script, ScriptContext, ScriptError, SessionError,
    SessionState, SessionStateError, WidgetMetadata, script_fn,
};

// --- Errors ---------------------------------------------------------------

/// Top-level error type for reflow hosts.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Hash(#[from] HashError),
}

/// Standard result type for reflow host APIs.
pub type Result<T> = std::result::Result<T, Error>;

// --- Prelude --------------------------------------------------------------

pub mod prelude {
    pub use crate::{
        AppSession, Block, DeltaPath, Element, Error, ForwardMsg, ForwardMsgCache, Interrupt,
        RerunData, Result, RuntimeConfig, Script, ScriptContext, ScriptError, WidgetMetadata,
        WidgetStates, WidgetValue, script_fn,
    };

    pub use crate::{core, runtime};
}

pub use reflow_core as core;
pub use reflow_runtime as runtime;
