#![forbid(unsafe_code)]

//! reflow core types.
//!
//! This crate holds the data model shared by every part of a reflow session:
//! the outgoing message format, the positions those messages target, the
//! widget snapshots a client sends with each interaction, and the content
//! hashing used to deduplicate large payloads.
//!
//! # Key Components
//!
//! - [`ForwardMsg`] - An outgoing UI-update or lifecycle message
//! - [`Delta`] - Mutation of one element or block, with its composition rules
//! - [`DeltaPath`] - Location of an element in the rendered tree
//! - [`WidgetStates`] - Client widget snapshot, plus [`coalesce_widget_states`]
//! - [`MessageHash`] - Content hash that ignores per-delivery metadata
//!
//! # Role in reflow
//! `reflow-core` has no threads and no locks. `reflow-runtime` builds the
//! request state machine, the script runner, the outgoing queue and the
//! shared message cache on top of these types.

pub mod delta_path;
pub mod forward_msg;
pub mod hashing;
pub mod session_id;
pub mod widget_state;

pub use delta_path::{DeltaPath, RootContainer};
pub use forward_msg::{
    Block, Delta, Element, ForwardMsg, ForwardMsgKind, ForwardMsgMetadata, NamedDataSet,
    NewSession, PageInfo, ScriptFinishedStatus, SessionStatus,
};
pub use hashing::{
    HashError, MessageHash, compute_hash, create_reference_msg, encoded_len, is_cacheable_msg,
    message_hash, populate_hash_if_needed,
};
pub use session_id::SessionId;
pub use widget_state::{WidgetId, WidgetState, WidgetStates, WidgetValue, coalesce_widget_states};
