//! The per-replica ballot/log store.
//!
//! One mutex guards the decided log, the ballot counters and the vote
//! tallies, so tallying a vote and appending the decision it completes happen
//! as one step. A condition variable next to it lets proposers sleep until
//! the learner fills their slot.
//!
//! Network sends never happen while the guard is held; callers compute what to
//! send, drop the guard, then send.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tracing::error;

use crate::ballot::{BallotState, ProposalNumber, VoteTally};
use crate::commit::{Commit, CommitId};
use crate::log::ConsensusLog;
use crate::storage::LogStorage;

/// Everything guarded by the store mutex.
#[derive(Debug, Default)]
pub struct StoreState {
    pub log: ConsensusLog,
    pub ballot: BallotState,
    pub tally: VoteTally,
}

/// What a proposer finds when its wait for a decision ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotOutcome {
    /// The slot holds this decided value.
    Decided(Commit),
    /// The deadline passed with the slot still empty here. `rejected` tells
    /// whether a majority turned the proposal down meanwhile.
    TimedOut { rejected: bool },
}

#[derive(Debug, Default)]
pub struct ReplicaStore {
    state: Mutex<StoreState>,
    decided: Condvar,
    storage: Option<LogStorage>,
}

impl ReplicaStore {
    pub fn new(log: ConsensusLog, storage: Option<LogStorage>) -> Self {
        Self {
            state: Mutex::new(StoreState {
                log,
                ..StoreState::default()
            }),
            decided: Condvar::new(),
            storage,
        }
    }

    /// An empty in-memory store holding only genesis.
    pub fn in_memory() -> Self {
        Self::new(ConsensusLog::new(), None)
    }

    pub fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn tail_id(&self) -> CommitId {
        self.lock().log.tail_id()
    }

    pub fn commits_after(&self, base: CommitId) -> Vec<Commit> {
        self.lock().log.commits_after(base)
    }

    /// Snapshot of every entry, genesis included.
    pub fn entries(&self) -> Vec<Commit> {
        self.lock().log.entries().to_vec()
    }

    /// Writes the log to stable storage if this replica has any.
    ///
    /// Takes the log rather than the store so callers can persist while still
    /// holding the guard. A failed write is logged, not fatal: the decision is
    /// already agreed by a majority.
    pub fn persist(&self, log: &ConsensusLog) {
        if let Some(storage) = &self.storage {
            if let Err(err) = storage.save(log) {
                error!(path = %storage.path().display(), error = %err, "failed to persist log");
            }
        }
    }

    /// Wakes every proposer waiting on a decision.
    pub fn notify_decided(&self) {
        self.decided.notify_all();
    }

    /// Blocks until `slot` is decided, up to `timeout`.
    ///
    /// A majority rejection of `proposal` is not a verdict: a higher-numbered
    /// proposer may have been promised the same value and still get it
    /// decided. Only the slot's contents settle the outcome.
    pub fn await_slot(&self, proposal: ProposalNumber, slot: CommitId, timeout: Duration) -> SlotOutcome {
        let guard = self.lock();
        let (guard, _) = self
            .decided
            .wait_timeout_while(guard, timeout, |state| !state.log.is_decided(slot))
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match guard.log.get(slot) {
            Some(commit) => SlotOutcome::Decided(commit.clone()),
            None => SlotOutcome::TimedOut {
                rejected: guard.tally.is_resolved(proposal) && !guard.tally.is_learned(proposal),
            },
        }
    }
}
