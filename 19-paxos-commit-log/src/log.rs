//! The decided-commit log.

use crate::commit::{Commit, CommitId};

/// The log broke the rule that index *i* holds commit id *i*.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogError {
    #[error("log is empty, genesis commit missing")]
    Empty,
    #[error("entry at index {index} carries commit id {found}")]
    Gap { index: usize, found: CommitId },
    #[error("genesis commit at index 0 is not empty")]
    Genesis,
}

/// Ordered sequence of decided commits, index 0 being genesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusLog {
    entries: Vec<Commit>,
}

impl Default for ConsensusLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsensusLog {
    pub fn new() -> Self {
        Self {
            entries: vec![Commit::genesis()],
        }
    }

    /// Rebuilds a log from persisted entries, checking every index.
    pub fn from_entries(entries: Vec<Commit>) -> Result<Self, LogError> {
        let log = Self { entries };
        log.verify()?;
        Ok(log)
    }

    /// Every index *i* must hold commit id *i*, starting from genesis.
    pub fn verify(&self) -> Result<(), LogError> {
        let first = self.entries.first().ok_or(LogError::Empty)?;
        if *first != Commit::genesis() {
            return Err(LogError::Genesis);
        }
        for (index, commit) in self.entries.iter().enumerate() {
            if commit.commit_id != index as CommitId {
                return Err(LogError::Gap {
                    index,
                    found: commit.commit_id,
                });
            }
        }
        Ok(())
    }

    pub fn entries(&self) -> &[Commit] {
        &self.entries
    }

    /// Id of the last entry.
    pub fn tail_id(&self) -> CommitId {
        self.entries.last().map_or(0, |commit| commit.commit_id)
    }

    /// Slot the next decided value lands in.
    pub fn next_id(&self) -> CommitId {
        self.entries.len() as CommitId
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entry carrying `id`, if present.
    pub fn get(&self, id: CommitId) -> Option<&Commit> {
        self.entries
            .iter()
            .rev()
            .find(|commit| commit.commit_id == id)
    }

    /// Whether slot `id` already holds a decided value.
    pub fn is_decided(&self, id: CommitId) -> bool {
        self.get(id).is_some()
    }

    /// Appends `commit` iff it fills the next free slot.
    pub fn append_next(&mut self, commit: Commit) -> bool {
        if commit.commit_id != self.next_id() {
            return false;
        }
        self.entries.push(commit);
        true
    }

    /// Appends `commit` iff its id is beyond the current tail, gaps allowed.
    ///
    /// Only a replica catching up takes this path; the gap is either filled by
    /// the next merge or truncated afterwards.
    pub fn append_beyond_tail(&mut self, commit: Commit) -> bool {
        if commit.commit_id <= self.tail_id() {
            return false;
        }
        self.entries.push(commit);
        true
    }

    /// Commits with id in `(base, tail]`, increasing.
    pub fn commits_after(&self, base: CommitId) -> Vec<Commit> {
        self.entries
            .iter()
            .filter(|commit| commit.commit_id > base)
            .cloned()
            .collect()
    }

    /// Folds `commits` in by id: extends the tail, replaces equal ids, and
    /// inserts missing ids in order. Returns how many entries changed.
    pub fn merge(&mut self, commits: Vec<Commit>) -> usize {
        let mut changed = 0;
        for commit in commits {
            if commit.commit_id > self.tail_id() {
                self.entries.push(commit);
                changed += 1;
                continue;
            }
            match self
                .entries
                .iter()
                .position(|existing| existing.commit_id >= commit.commit_id)
            {
                Some(index) if self.entries[index].commit_id == commit.commit_id => {
                    if self.entries[index] != commit {
                        self.entries[index] = commit;
                        changed += 1;
                    }
                }
                Some(index) => {
                    self.entries.insert(index, commit);
                    changed += 1;
                }
                None => {
                    self.entries.push(commit);
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Id of the last entry of the gap-free prefix: the largest *i* such that
    /// every index up to *i* holds its own id.
    ///
    /// Equal to [`tail_id`](Self::tail_id) except while a catching-up replica
    /// holds a decision it observed past a gap.
    pub fn dense_tail(&self) -> CommitId {
        self.first_gap().map_or(self.tail_id(), |index| index as CommitId - 1)
    }

    /// Drops every entry from the first index that does not hold its own id.
    /// Returns the dropped entries.
    pub fn truncate_to_dense_prefix(&mut self) -> Vec<Commit> {
        match self.first_gap() {
            Some(index) => self.entries.split_off(index),
            None => Vec::new(),
        }
    }

    /// Index of the first entry past genesis whose id differs from its index.
    fn first_gap(&self) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .skip(1)
            .find(|(index, commit)| commit.commit_id != *index as CommitId)
            .map(|(index, _)| index)
    }
}
