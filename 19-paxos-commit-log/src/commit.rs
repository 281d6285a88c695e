//! Commits: the values the cluster agrees on.
//!
//! A commit is an immutable change set. Its `commit_id` is the log position it
//! occupies once decided, so the entry at index *i* always carries id *i*.
//! Index 0 is the empty genesis commit that every replica starts with.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Position of a commit in the replicated log.
pub type CommitId = u64;

/// A single change set. Equality is structural, including file bytes.
///
/// Ordered maps keep the encoded form deterministic, which matters because the
/// proposer compares the decided value against the client's proposal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub commit_id: CommitId,
    pub author: String,
    pub message: String,
    /// Nanoseconds since the Unix epoch, as stamped by the client.
    pub timestamp: u64,
    pub changed_files: BTreeMap<String, Vec<u8>>,
    pub removed_files: BTreeSet<String>,
}

impl Commit {
    /// The fixed empty commit at index 0.
    pub fn genesis() -> Self {
        Self::default()
    }

    /// Starts a commit targeting `commit_id`, stamped with the current time.
    pub fn new(commit_id: CommitId, author: impl Into<String>, message: impl Into<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or_default();
        Self {
            commit_id,
            author: author.into(),
            message: message.into(),
            timestamp,
            ..Self::default()
        }
    }

    /// Records new content for `path`.
    pub fn with_file(mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.changed_files.insert(path.into(), contents.into());
        self
    }

    /// Records the removal of `path`.
    pub fn with_removed(mut self, path: impl Into<String>) -> Self {
        self.removed_files.insert(path.into());
        self
    }
}
