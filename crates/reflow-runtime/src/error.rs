#![forbid(unsafe_code)]

//! Error types for the reflow runtime.

use reflow_core::WidgetId;
use thiserror::Error;

use crate::script::Interrupt;

/// Consistency violations raised to the script by [`SessionState`](crate::SessionState).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionStateError {
    #[error("`{key}` not found in session state")]
    KeyNotFound { key: String },

    #[error("`{key}` cannot be modified after the widget with this key is instantiated")]
    WidgetWriteAfterCreation { key: String },

    #[error("widget id `{id}` was registered twice in one run")]
    DuplicateWidgetId { id: WidgetId },

    #[error("value stored under `{key}` does not fit the widget's value type")]
    InvalidWidgetValue { key: String },
}

/// The script body could not be prepared; reported as a compile error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CompileError {
    pub message: String,
}

impl CompileError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Everything a script body can return.
///
/// `Interrupted` is a control-flow signal, not a failure: the runner handles
/// it once at the top of its loop. Every other variant is shown to the user
/// as an exception element.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error(transparent)]
    Interrupted(#[from] Interrupt),

    #[error(transparent)]
    SessionState(#[from] SessionStateError),

    #[error("{type_name}: {message}")]
    Failed { type_name: String, message: String },
}

impl ScriptError {
    /// A user-level failure with a free-form message.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            type_name: "ScriptError".to_owned(),
            message: message.into(),
        }
    }

    /// Wrap any error, keeping its type name for display. An [`Interrupt`]
    /// stays a control-flow signal.
    #[must_use]
    pub fn from_error<E: std::error::Error + 'static>(err: E) -> Self {
        if let Some(interrupt) = (&err as &dyn std::any::Any).downcast_ref::<Interrupt>() {
            return Self::Interrupted(interrupt.clone());
        }
        let type_name = std::any::type_name::<E>()
            .rsplit("::")
            .next()
            .unwrap_or("Error")
            .to_owned();
        Self::Failed {
            type_name,
            message: err.to_string(),
        }
    }

    /// Name shown in the exception element.
    #[must_use]
    pub fn type_name(&self) -> &str {
        match self {
            Self::Interrupted(_) => "Interrupt",
            Self::SessionState(_) => "SessionStateError",
            Self::Failed { type_name, .. } => type_name,
        }
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("script thread is already running")]
    AlreadyRunning,

    #[error("failed to spawn script thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("script thread panicked outside the script body")]
    ThreadPanicked,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session has been shut down")]
    ShutDown,

    #[error(transparent)]
    Runner(#[from] RunnerError),
}
