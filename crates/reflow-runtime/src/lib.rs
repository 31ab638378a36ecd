#![forbid(unsafe_code)]

//! reflow runtime
//!
//! This crate re-executes a script from the top on every client interaction
//! and streams the result back as incremental UI messages.
//!
//! # Key Components
//!
//! - [`ScriptRequests`] - Stop/rerun coordination between control and script threads
//! - [`ScriptRunner`] - Owner of the single background script thread
//! - [`ScriptContext`] - Handle a running [`Script`] emits output through
//! - [`ForwardMsgQueue`] - Per-session outgoing mailbox that coalesces deltas
//! - [`ForwardMsgCache`] - Shared, content-addressed cache of large payloads
//! - [`SessionState`] - Values that survive across runs
//! - [`AppSession`] - One client session wiring the above together
//!
//! # Role in reflow
//! `reflow-runtime` sits on top of `reflow-core`'s message model. It owns
//! every thread and lock; the transport only calls into [`AppSession`].
//!
//! # Threads
//! Each session has one control thread (the caller) and at most one script
//! thread. Interruption is cooperative: the script observes stop and rerun
//! requests only at yield points.

pub mod app_session;
pub mod config;
pub mod error;
pub mod forward_msg_cache;
pub mod forward_msg_queue;
pub mod script;
pub mod script_requests;
pub mod script_runner;
pub mod session_state;

pub use app_session::{AppSession, AppSessionState};
pub use config::{ConfigError, DEFAULT_MIN_CACHED_MESSAGE_SIZE, RunnerConfig, RuntimeConfig};
pub use error::{CompileError, RunnerError, ScriptError, SessionError, SessionStateError};
pub use forward_msg_cache::{CACHE_CATEGORY, CacheStat, ForwardMsgCache};
pub use forward_msg_queue::ForwardMsgQueue;
pub use script::{FnScript, Interrupt, Script, ScriptContext, script_fn};
pub use script_requests::{RerunData, ScriptRequest, ScriptRequestType, ScriptRequests};
pub use script_runner::{RunOutcome, RunnerState, ScriptRunner, ScriptRunnerEvent};
pub use session_state::{RegisterWidgetResult, SessionState, WidgetCallback, WidgetMetadata};
