#![forbid(unsafe_code)]

//! Process-wide cache of large outgoing messages.
//!
//! Many sessions running the same script produce byte-identical payloads
//! (an unchanged data frame, a long markdown block). The cache stores each
//! payload once, keyed by its content hash, and remembers for every session
//! the last run in which that session was sent the payload. While that
//! reference is younger than `max_age` runs, the transport sends the session
//! a [`RefHash`](reflow_core::ForwardMsgKind::RefHash) message instead of the
//! full payload.
//!
//! # Lifetime
//!
//! ```text
//! add_message(m, A, 0)    entry{A:0}            created
//! add_message(m, B, 0)    entry{A:0, B:0}       shared
//! add_message(m, A, 3)    entry{A:3, B:0}       refreshed
//! expire(B, run 2)        entry{A:3}            B's ref dropped (age 2 > 1)
//! remove_refs(A)          -                     destroyed
//! ```
//!
//! The cache is constructed explicitly and handed to each session as an
//! `Arc`; all access goes through one internal mutex.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard};

use reflow_core::{ForwardMsg, HashError, MessageHash, SessionId, encoded_len, message_hash};

/// Label reported in [`CacheStat::category_name`].
pub const CACHE_CATEGORY: &str = "ForwardMessageCache";

/// Memory accounting for one cached payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStat {
    pub category_name: &'static str,
    pub cache_name: String,
    pub byte_length: usize,
}

#[derive(Debug)]
struct CacheEntry {
    msg: Arc<ForwardMsg>,
    byte_len: usize,
    session_run_counts: HashMap<SessionId, u64>,
}

impl CacheEntry {
    fn add_session_ref(&mut self, session: SessionId, run_count: u64) {
        let slot = self.session_run_counts.entry(session).or_insert(run_count);
        if run_count < *slot {
            tracing::error!(
                target: "reflow.cache",
                session = %session,
                run_count,
                previous = *slot,
                "run count went backwards; keeping the newer reference"
            );
            return;
        }
        *slot = run_count;
    }

    fn session_ref_age(&self, session: SessionId, run_count: u64) -> Option<u64> {
        self.session_run_counts
            .get(&session)
            .map(|last_seen| run_count.saturating_sub(*last_seen))
    }

    fn has_refs(&self) -> bool {
        !self.session_run_counts.is_empty()
    }
}

/// Content-addressed message cache shared by every session in the process.
#[derive(Debug)]
pub struct ForwardMsgCache {
    max_age: u64,
    entries: Mutex<HashMap<MessageHash, CacheEntry>>,
}

impl ForwardMsgCache {
    /// `max_age` is the number of runs a session's reference stays live
    /// without being refreshed.
    #[must_use]
    pub fn new(max_age: u64) -> Self {
        Self {
            max_age,
            entries: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn max_age(&self) -> u64 {
        self.max_age
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<MessageHash, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store `msg` if new and record that `session` was sent it in run
    /// `run_count`. Returns the content hash.
    pub fn add_message(
        &self,
        msg: &ForwardMsg,
        session: SessionId,
        run_count: u64,
    ) -> Result<MessageHash, HashError> {
        let hash = message_hash(msg)?;
        let mut entries = self.lock();
        let entry = match entries.entry(hash.clone()) {
            Entry::Occupied(occupied) => occupied.into_mut(),
            Entry::Vacant(vacant) => {
                let byte_len = encoded_len(msg)?;
                let mut stored = msg.clone();
                stored.hash = Some(hash.clone());
                tracing::debug!(
                    target: "reflow.cache",
                    hash = hash.short(),
                    byte_len,
                    session = %session,
                    "cached new message"
                );
                vacant.insert(CacheEntry {
                    msg: Arc::new(stored),
                    byte_len,
                    session_run_counts: HashMap::new(),
                })
            }
        };
        entry.add_session_ref(session, run_count);
        Ok(hash)
    }

    /// The cached payload for `hash`, if still present.
    #[must_use]
    pub fn get_message(&self, hash: &MessageHash) -> Option<Arc<ForwardMsg>> {
        self.lock().get(hash).map(|entry| Arc::clone(&entry.msg))
    }

    /// True if `session` holds a live reference to `msg`'s payload at
    /// `run_count`. A message that cannot be hashed has no reference.
    #[must_use]
    pub fn has_message_reference(
        &self,
        msg: &ForwardMsg,
        session: SessionId,
        run_count: u64,
    ) -> bool {
        let Ok(hash) = message_hash(msg) else {
            return false;
        };
        self.lock()
            .get(&hash)
            .and_then(|entry| entry.session_ref_age(session, run_count))
            .is_some_and(|age| age <= self.max_age)
    }

    /// Drop `session`'s references older than `max_age` runs, and any entry
    /// left without references.
    pub fn remove_expired_entries_for_session(&self, session: SessionId, current_run_count: u64) {
        let max_age = self.max_age;
        let mut expired_refs = 0usize;
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| {
            let expired = entry
                .session_ref_age(session, current_run_count)
                .is_some_and(|age| age > max_age);
            if expired {
                entry.session_run_counts.remove(&session);
                expired_refs += 1;
            }
            entry.has_refs()
        });
        let removed = before - entries.len();
        if expired_refs > 0 {
            tracing::debug!(
                target: "reflow.cache",
                session = %session,
                current_run_count,
                max_age,
                expired_refs,
                removed_entries = removed,
                "expired cache references"
            );
        }
    }

    /// Drop every reference held by `session` (client disconnected).
    pub fn remove_refs_for_session(&self, session: SessionId) {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| {
            entry.session_run_counts.remove(&session);
            entry.has_refs()
        });
        tracing::debug!(
            target: "reflow.cache",
            session = %session,
            removed_entries = before - entries.len(),
            "removed session references"
        );
    }

    /// Reference message to send in place of `msg`.
    pub fn create_reference_msg(msg: &ForwardMsg) -> Result<ForwardMsg, HashError> {
        reflow_core::create_reference_msg(msg)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// One [`CacheStat`] per cached payload.
    #[must_use]
    pub fn get_stats(&self) -> Vec<CacheStat> {
        self.lock()
            .values()
            .map(|entry| CacheStat {
                category_name: CACHE_CATEGORY,
                cache_name: String::new(),
                byte_length: entry.byte_len,
            })
            .collect()
    }

    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.lock().values().map(|entry| entry.byte_len).sum()
    }
}
