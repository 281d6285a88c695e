//! The learner role: turning gossiped votes into decided log entries.
//!
//! Every acceptor gossips its verdict to every replica, so each replica
//! tallies the same votes and learns decisions independently. Two variants
//! share the tallying logic and differ only in where a learned value may land:
//!
//! - [`VotingLearner`]: the normal mode. Appends only into the next free slot.
//! - [`ObserverLearner`]: used while catching up. Takes any decision beyond
//!   the local tail and reports when one round has completed.

use tracing::{debug, info};

use crate::commit::{Commit, CommitId};
use crate::log::ConsensusLog;
use crate::message::PaxosMessage;
use crate::store::ReplicaStore;
use crate::topology::ReplicaTopology;

/// Where a learned value ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Appended,
    /// The log already holds that slot.
    Skipped,
    /// The value belongs past the next free slot; this replica is behind.
    Ahead { next_id: CommitId },
}

/// Result of feeding one message to a learner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Not a vote.
    Ignored,
    Pending,
    Learned { commit_id: CommitId, appended: bool },
    Ahead { commit_id: CommitId, next_id: CommitId },
    Rejected,
}

pub trait Learner: Send {
    /// Whether this replica also answers Prepare and AcceptRequest.
    fn votes(&self) -> bool;

    /// Puts a freshly learned value into the log.
    fn place(&mut self, log: &mut ConsensusLog, commit: Commit) -> Placement;

    /// Whether the learner has seen everything it was started for.
    fn round_complete(&self) -> bool {
        false
    }

    /// Tallies an `Accepted` or `RejectAcceptRequest` vote.
    ///
    /// The tally, the append and the persist happen under one store guard, so
    /// a decision reached twice (duplicate or late votes) is placed at most
    /// once. Waiters are woken after the guard is dropped.
    fn learn(&mut self, store: &ReplicaStore, topology: &ReplicaTopology, message: &PaxosMessage) -> Decision {
        let decision = match message {
            PaxosMessage::Accepted {
                proposal,
                commit,
                voter,
            } => {
                let mut state = store.lock();
                let votes = state.tally.record_accept(*proposal, *voter);
                state.ballot.observe(*proposal);
                if !topology.is_majority(votes) || !state.tally.mark_learned(*proposal) {
                    return Decision::Pending;
                }
                let commit_id = commit.commit_id;
                state.ballot.retire_accepted(commit_id);

                let placement = self.place(&mut state.log, commit.clone());
                if placement == Placement::Appended {
                    store.persist(&state.log);
                }
                debug!(proposal, commit_id, ?placement, votes, "learned decision");
                match placement {
                    Placement::Appended => Decision::Learned {
                        commit_id,
                        appended: true,
                    },
                    Placement::Skipped => Decision::Learned {
                        commit_id,
                        appended: false,
                    },
                    Placement::Ahead { next_id } => Decision::Ahead { commit_id, next_id },
                }
            }
            PaxosMessage::RejectAcceptRequest { proposal, voter } => {
                let mut state = store.lock();
                let votes = state.tally.record_reject(*proposal, *voter);
                state.ballot.observe(*proposal);
                if !topology.is_majority(votes) || !state.tally.mark_rejected(*proposal) {
                    return Decision::Pending;
                }
                debug!(proposal, votes, "proposal rejected by majority");
                Decision::Rejected
            }
            _ => return Decision::Ignored,
        };
        store.notify_decided();
        decision
    }
}

/// Learner of a full voting member.
#[derive(Debug, Default)]
pub struct VotingLearner;

impl Learner for VotingLearner {
    fn votes(&self) -> bool {
        true
    }

    fn place(&mut self, log: &mut ConsensusLog, commit: Commit) -> Placement {
        let next_id = log.next_id();
        if commit.commit_id > next_id {
            return Placement::Ahead { next_id };
        }
        if log.append_next(commit) {
            Placement::Appended
        } else {
            Placement::Skipped
        }
    }
}

/// Learner of a replica that is still catching up.
///
/// Never votes. Finishes after its first learned decision, whether or not the
/// value could be placed.
#[derive(Debug, Default)]
pub struct ObserverLearner {
    learned: bool,
}

impl Learner for ObserverLearner {
    fn votes(&self) -> bool {
        false
    }

    fn place(&mut self, log: &mut ConsensusLog, commit: Commit) -> Placement {
        self.learned = true;
        let commit_id = commit.commit_id;
        if log.append_beyond_tail(commit) {
            info!(commit_id, "observed decision while catching up");
            Placement::Appended
        } else {
            Placement::Skipped
        }
    }

    fn round_complete(&self) -> bool {
        self.learned
    }
}
