#![forbid(unsafe_code)]

//! Content hashing of outgoing messages.
//!
//! The hash covers only [`ForwardMsg::kind`]: metadata such as the target
//! delta path is left out, so the same payload rendered at two positions, or
//! by two sessions, hashes equal and is cached once.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::forward_msg::{ForwardMsg, ForwardMsgKind};

/// Hex-encoded BLAKE3 digest of a message's content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageHash(String);

impl MessageHash {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex digits, for logs.
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for MessageHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum HashError {
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Hash the content of `msg`, ignoring metadata and any stored hash.
pub fn compute_hash(msg: &ForwardMsg) -> Result<MessageHash, HashError> {
    let encoded = serde_json::to_vec(&msg.kind)?;
    let digest = blake3::hash(&encoded);
    Ok(MessageHash(digest.to_hex().to_string()))
}

/// The stored hash if present, else a freshly computed one.
pub fn message_hash(msg: &ForwardMsg) -> Result<MessageHash, HashError> {
    match &msg.hash {
        Some(hash) => Ok(hash.clone()),
        None => compute_hash(msg),
    }
}

/// Compute and store the hash on first use; later calls are free.
pub fn populate_hash_if_needed(msg: &mut ForwardMsg) -> Result<MessageHash, HashError> {
    if let Some(hash) = &msg.hash {
        return Ok(hash.clone());
    }
    let hash = compute_hash(msg)?;
    msg.hash = Some(hash.clone());
    Ok(hash)
}

/// A small message pointing at `msg`'s cached payload, with `msg`'s metadata.
pub fn create_reference_msg(msg: &ForwardMsg) -> Result<ForwardMsg, HashError> {
    let hash = message_hash(msg)?;
    Ok(ForwardMsg {
        hash: None,
        metadata: msg.metadata.clone(),
        kind: ForwardMsgKind::RefHash(hash),
    })
}

/// Length of the encoded message, used for cacheability and cache stats.
pub fn encoded_len(msg: &ForwardMsg) -> Result<usize, HashError> {
    Ok(serde_json::to_vec(msg)?.len())
}

/// Whether the transport should route `msg` through the message cache.
///
/// Reference and new-session messages never are; everything else is when its
/// encoded size reaches `min_size`. Encoding failures count as uncacheable.
#[must_use]
pub fn is_cacheable_msg(msg: &ForwardMsg, min_size: usize) -> bool {
    if matches!(
        msg.kind,
        ForwardMsgKind::RefHash(_) | ForwardMsgKind::NewSession(_)
    ) {
        return false;
    }
    encoded_len(msg).is_ok_and(|len| len >= min_size)
}
