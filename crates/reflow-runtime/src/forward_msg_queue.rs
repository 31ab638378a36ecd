#![forbid(unsafe_code)]

//! Per-session outgoing mailbox.
//!
//! The script thread enqueues, the control thread flushes. Between flushes,
//! a delta aimed at a path that already has a pending delta may replace it
//! in place (see [`Delta::replaces`](reflow_core::Delta::replaces)), so a
//! client that falls behind receives only the latest state of each element.
//!
//! # Coalescing Rules
//!
//! - Messages without a delta path are always appended.
//! - `AddRows` is always appended.
//! - A pending `AddBlock` is never overwritten; the new delta is appended and
//!   becomes the entry later deltas at that path compose against.
//! - Otherwise `NewElement` / `AddBlock` overwrite the pending entry and keep
//!   its position.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use reflow_core::{DeltaPath, ForwardMsg, ForwardMsgKind, ScriptFinishedStatus};

#[derive(Debug, Default)]
struct QueueInner {
    queue: Vec<ForwardMsg>,
    delta_index: HashMap<DeltaPath, usize>,
}

/// Ordered, coalescing queue of outgoing messages.
#[derive(Debug, Default)]
pub struct ForwardMsgQueue {
    inner: Mutex<QueueInner>,
}

impl ForwardMsgQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn enqueue(&self, msg: ForwardMsg) {
        let mut inner = self.lock();
        let Some(path) = msg.delta_path().cloned() else {
            inner.queue.push(msg);
            return;
        };

        if let Some(&index) = inner.delta_index.get(&path) {
            let replaces = match (&inner.queue[index].kind, &msg.kind) {
                (ForwardMsgKind::Delta(pending), ForwardMsgKind::Delta(arriving)) => {
                    arriving.replaces(pending)
                }
                _ => false,
            };
            if replaces {
                tracing::trace!(
                    target: "reflow.queue",
                    path = %path,
                    kind = msg.kind.name(),
                    "replaced pending delta"
                );
                inner.queue[index] = msg;
                return;
            }
        }

        let position = inner.queue.len();
        inner.delta_index.insert(path, position);
        inner.queue.push(msg);
    }

    /// Take everything queued so far, in order.
    #[must_use]
    pub fn flush(&self) -> Vec<ForwardMsg> {
        let mut inner = self.lock();
        inner.delta_index.clear();
        std::mem::take(&mut inner.queue)
    }

    /// Drop queued messages.
    ///
    /// With `retain_lifecycle`, session-lifecycle messages survive so a client
    /// mid-stream still learns that the previous run ended; a successful
    /// finish among them is rewritten to "finished early for rerun".
    pub fn clear(&self, retain_lifecycle: bool) {
        let mut inner = self.lock();
        inner.delta_index.clear();
        if !retain_lifecycle {
            inner.queue.clear();
            return;
        }

        let before = inner.queue.len();
        inner.queue.retain(ForwardMsg::is_lifecycle);
        for msg in &mut inner.queue {
            if let ForwardMsgKind::ScriptFinished(status) = &mut msg.kind
                && *status == ScriptFinishedStatus::FinishedSuccessfully
            {
                *status = ScriptFinishedStatus::FinishedEarlyForRerun;
                msg.hash = None;
            }
        }
        tracing::trace!(
            target: "reflow.queue",
            dropped = before - inner.queue.len(),
            kept = inner.queue.len(),
            "cleared queue, retaining lifecycle messages"
        );
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }
}
