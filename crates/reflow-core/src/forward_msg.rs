#![forbid(unsafe_code)]

//! Outgoing messages from a session to its client.
//!
//! A [`ForwardMsg`] is either a session-lifecycle notice (new session, status
//! change, script finished) or a [`Delta`] that mutates one position of the
//! rendered tree. Deltas carry the composition rules the outgoing queue uses
//! to drop updates the client would never see.
//!
//! # Composition
//!
//! | pending \ arriving | `NewElement` | `AddBlock` | `AddRows` |
//! |--------------------|--------------|------------|-----------|
//! | `NewElement`       | replace      | replace    | append    |
//! | `AddBlock`         | append       | append     | append    |
//! | `AddRows`          | replace      | replace    | append    |
//!
//! A pending `AddBlock` is never replaced: later messages in the queue may
//! address children of that block.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::delta_path::DeltaPath;
use crate::hashing::MessageHash;
use crate::session_id::SessionId;
use crate::widget_state::{WidgetId, WidgetValue};

/// Per-delivery data that is excluded from the content hash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardMsgMetadata {
    /// Whether the transport may replace this message with a reference.
    #[serde(default)]
    pub cacheable: bool,
    /// Target of a delta; empty for lifecycle messages.
    #[serde(default)]
    pub delta_path: DeltaPath,
}

/// An outgoing message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardMsg {
    /// Content hash, filled by [`crate::populate_hash_if_needed`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<MessageHash>,
    #[serde(default)]
    pub metadata: ForwardMsgMetadata,
    pub kind: ForwardMsgKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum ForwardMsgKind {
    NewSession(NewSession),
    SessionStatusChanged(SessionStatus),
    ScriptFinished(ScriptFinishedStatus),
    PageInfoChanged(PageInfo),
    Delta(Delta),
    /// Stand-in for a payload the client already holds.
    RefHash(MessageHash),
    ParentMessage(String),
}

impl ForwardMsgKind {
    /// Short name for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::NewSession(_) => "new_session",
            Self::SessionStatusChanged(_) => "session_status_changed",
            Self::ScriptFinished(_) => "script_finished",
            Self::PageInfoChanged(_) => "page_info_changed",
            Self::Delta(delta) => delta.name(),
            Self::RefHash(_) => "ref_hash",
            Self::ParentMessage(_) => "parent_message",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSession {
    pub session_id: SessionId,
    pub script_run_id: u64,
    pub main_script_name: String,
    pub query_string: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub script_is_running: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptFinishedStatus {
    FinishedSuccessfully,
    FinishedWithCompileError,
    /// The run was cut short by a rerun; the client must not reset widget
    /// state it only partially received.
    FinishedEarlyForRerun,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    pub query_string: String,
}

/// Mutation of one position in the rendered tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delta {
    NewElement(Element),
    AddBlock(Block),
    AddRows(NamedDataSet),
}

impl Delta {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::NewElement(_) => "new_element",
            Self::AddBlock(_) => "add_block",
            Self::AddRows(_) => "add_rows",
        }
    }

    /// Whether this delta may replace a pending delta at the same path.
    #[must_use]
    pub fn is_composable(&self) -> bool {
        match self {
            Self::NewElement(_) | Self::AddBlock(_) => true,
            Self::AddRows(_) => false,
        }
    }

    /// Whether `self`, arriving after `pending`, overwrites it.
    #[must_use]
    pub fn replaces(&self, pending: &Delta) -> bool {
        match pending {
            Self::AddBlock(_) => false,
            Self::NewElement(_) | Self::AddRows(_) => self.is_composable(),
        }
    }

    /// The delta to keep in place of `old`, or `None` if `new` must be
    /// queued separately.
    #[must_use]
    pub fn compose(old: &Delta, new: &Delta) -> Option<Delta> {
        new.replaces(old).then(|| new.clone())
    }
}

/// A rendered element. Widget implementations live outside this crate;
/// they describe themselves through these variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "element", rename_all = "snake_case")]
pub enum Element {
    Empty,
    Text {
        body: String,
    },
    Markdown {
        body: String,
        allow_html: bool,
    },
    Json {
        body: Value,
    },
    DataFrame {
        data: NamedDataSet,
    },
    Widget {
        id: WidgetId,
        label: String,
        value: WidgetValue,
        /// Set when the value was written by the script this run and the
        /// client must adopt it.
        set_value: bool,
    },
    Exception {
        type_name: String,
        message: String,
        stack_trace: Vec<String>,
    },
}

/// A layout container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "block", rename_all = "snake_case")]
pub enum Block {
    Vertical { border: bool },
    Horizontal { gap: Option<String> },
    Column { weight: f64 },
    Expandable { label: String, expanded: bool },
    Tab { label: String },
    Form { form_id: String },
}

/// Tabular payload for data frames and row appends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedDataSet {
    pub name: Option<String>,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ForwardMsg {
    #[must_use]
    pub fn new(kind: ForwardMsgKind) -> Self {
        Self {
            hash: None,
            metadata: ForwardMsgMetadata::default(),
            kind,
        }
    }

    #[must_use]
    pub fn delta(path: DeltaPath, delta: Delta) -> Self {
        Self {
            hash: None,
            metadata: ForwardMsgMetadata {
                cacheable: false,
                delta_path: path,
            },
            kind: ForwardMsgKind::Delta(delta),
        }
    }

    #[must_use]
    pub fn new_element(path: DeltaPath, element: Element) -> Self {
        Self::delta(path, Delta::NewElement(element))
    }

    #[must_use]
    pub fn add_block(path: DeltaPath, block: Block) -> Self {
        Self::delta(path, Delta::AddBlock(block))
    }

    #[must_use]
    pub fn add_rows(path: DeltaPath, data: NamedDataSet) -> Self {
        Self::delta(path, Delta::AddRows(data))
    }

    #[must_use]
    pub fn new_session(new_session: NewSession) -> Self {
        Self::new(ForwardMsgKind::NewSession(new_session))
    }

    #[must_use]
    pub fn session_status(script_is_running: bool) -> Self {
        Self::new(ForwardMsgKind::SessionStatusChanged(SessionStatus {
            script_is_running,
        }))
    }

    #[must_use]
    pub fn script_finished(status: ScriptFinishedStatus) -> Self {
        Self::new(ForwardMsgKind::ScriptFinished(status))
    }

    #[must_use]
    pub fn page_info(query_string: impl Into<String>) -> Self {
        Self::new(ForwardMsgKind::PageInfoChanged(PageInfo {
            query_string: query_string.into(),
        }))
    }

    #[must_use]
    pub fn as_delta(&self) -> Option<&Delta> {
        match &self.kind {
            ForwardMsgKind::Delta(delta) => Some(delta),
            _ => None,
        }
    }

    /// Path the queue coalesces on: present only for deltas with a
    /// non-empty target.
    #[must_use]
    pub fn delta_path(&self) -> Option<&DeltaPath> {
        match self.kind {
            ForwardMsgKind::Delta(_) if !self.metadata.delta_path.is_empty() => {
                Some(&self.metadata.delta_path)
            }
            _ => None,
        }
    }

    /// Messages that track script/session progress rather than content.
    #[must_use]
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self.kind,
            ForwardMsgKind::NewSession(_)
                | ForwardMsgKind::ScriptFinished(_)
                | ForwardMsgKind::SessionStatusChanged(_)
                | ForwardMsgKind::ParentMessage(_)
        )
    }

    #[must_use]
    pub fn script_finished_status(&self) -> Option<ScriptFinishedStatus> {
        match self.kind {
            ForwardMsgKind::ScriptFinished(status) => Some(status),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_reference(&self) -> bool {
        matches!(self.kind, ForwardMsgKind::RefHash(_))
    }
}
