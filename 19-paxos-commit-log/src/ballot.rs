//! Ballot numbering, acceptor memory and vote tallies.
//!
//! Proposal numbers are `round * N + replica_id`, so every replica draws from
//! its own residue class modulo N. Numbers are globally unique and a replica
//! can always pick one larger than anything it has seen.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::commit::CommitId;
use crate::message::AcceptedValue;
use crate::topology::ReplicaId;

pub type ProposalNumber = u64;

/// Per-replica ballot counters.
#[derive(Debug, Default, Clone)]
pub struct BallotState {
    /// Max over every Prepare, AcceptRequest and vote number observed.
    pub highest_seen: ProposalNumber,
    pub last_promised: Option<ProposalNumber>,
    pub last_accepted: Option<AcceptedValue>,
    /// Last number handed to a local proposer.
    last_allocated: ProposalNumber,
}

impl BallotState {
    /// Picks a fresh number owned by `id`, larger than anything seen or
    /// previously allocated here.
    pub fn next_proposal_number(&mut self, id: ReplicaId, replicas: usize) -> ProposalNumber {
        let n = replicas as ProposalNumber;
        let id = id as ProposalNumber;
        let base = self.highest_seen.max(self.last_allocated);
        let mut number = base / n * n + id;
        if number <= base {
            number += n;
        }
        self.last_allocated = number;
        number
    }

    pub fn observe(&mut self, proposal: ProposalNumber) {
        self.highest_seen = self.highest_seen.max(proposal);
    }

    /// Forgets the accepted value once a later slot has been decided.
    ///
    /// A value accepted for the decided slot itself is kept: a proposer still
    /// racing for that slot must see it echoed and re-propose it.
    pub fn retire_accepted(&mut self, decided_slot: CommitId) {
        if self
            .last_accepted
            .as_ref()
            .is_some_and(|accepted| accepted.commit.commit_id < decided_slot)
        {
            self.last_accepted = None;
        }
    }
}

/// Learner bookkeeping: vote counts plus which proposals are settled.
#[derive(Debug, Default)]
pub struct VoteTally {
    accepted: BTreeMap<ProposalNumber, HashSet<ReplicaId>>,
    rejected: BTreeMap<ProposalNumber, HashSet<ReplicaId>>,
    learned: BTreeSet<ProposalNumber>,
    resolved: BTreeSet<ProposalNumber>,
}

impl VoteTally {
    /// Records an `Accepted` vote and returns the number of distinct voters.
    pub fn record_accept(&mut self, proposal: ProposalNumber, voter: ReplicaId) -> usize {
        let voters = self.accepted.entry(proposal).or_default();
        voters.insert(voter);
        voters.len()
    }

    /// Records a `RejectAcceptRequest` vote and returns the number of distinct voters.
    pub fn record_reject(&mut self, proposal: ProposalNumber, voter: ReplicaId) -> usize {
        let voters = self.rejected.entry(proposal).or_default();
        voters.insert(voter);
        voters.len()
    }

    /// Marks `proposal` learned. Returns false if it already was.
    ///
    /// Everything kept for lower numbers is dropped: any replica still
    /// proposing under them has not seen this decision, and learning a lower
    /// number later would add nothing the slot check does not already cover.
    pub fn mark_learned(&mut self, proposal: ProposalNumber) -> bool {
        if !self.learned.insert(proposal) {
            return false;
        }
        self.resolved.insert(proposal);
        self.accepted = self.accepted.split_off(&proposal);
        self.rejected = self.rejected.split_off(&proposal);
        self.learned = self.learned.split_off(&proposal);
        self.resolved = self.resolved.split_off(&proposal);
        true
    }

    pub fn is_learned(&self, proposal: ProposalNumber) -> bool {
        self.learned.contains(&proposal)
    }

    /// Marks `proposal` settled without a decision (majority rejected it).
    pub fn mark_rejected(&mut self, proposal: ProposalNumber) -> bool {
        self.resolved.insert(proposal)
    }

    /// Learned or majority-rejected.
    pub fn is_resolved(&self, proposal: ProposalNumber) -> bool {
        self.resolved.contains(&proposal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::Commit;

    #[test]
    fn numbers_stay_in_own_residue_class() {
        let mut ballot = BallotState::default();
        for _ in 0..10 {
            let number = ballot.next_proposal_number(2, 5);
            assert_eq!(number % 5, 2);
        }
    }

    #[test]
    fn numbers_exceed_everything_seen() {
        let mut ballot = BallotState::default();
        ballot.observe(17);
        let number = ballot.next_proposal_number(1, 5);
        assert_eq!(number, 21);

        ballot.observe(21);
        assert_eq!(ballot.next_proposal_number(1, 5), 26);
    }

    #[test]
    fn first_number_is_never_zero() {
        let mut ballot = BallotState::default();
        assert_eq!(ballot.next_proposal_number(0, 3), 3);
    }

    #[test]
    fn concurrent_local_proposers_get_distinct_numbers() {
        let mut ballot = BallotState::default();
        let first = ballot.next_proposal_number(0, 3);
        let second = ballot.next_proposal_number(0, 3);
        assert!(second > first);
    }

    #[test]
    fn distinct_replicas_never_collide() {
        let mut numbers = HashSet::new();
        for id in 0..5 {
            let mut ballot = BallotState::default();
            ballot.observe(40);
            assert!(numbers.insert(ballot.next_proposal_number(id, 5)));
        }
    }

    #[test]
    fn accepted_value_retires_only_after_later_slot() {
        let mut ballot = BallotState::default();
        ballot.last_accepted = Some(AcceptedValue {
            proposal: 4,
            commit: Commit::new(2, "a", "m"),
        });
        ballot.retire_accepted(2);
        assert!(ballot.last_accepted.is_some());
        ballot.retire_accepted(3);
        assert!(ballot.last_accepted.is_none());
    }

    #[test]
    fn duplicate_votes_count_once() {
        let mut tally = VoteTally::default();
        assert_eq!(tally.record_accept(4, 0), 1);
        assert_eq!(tally.record_accept(4, 0), 1);
        assert_eq!(tally.record_accept(4, 2), 2);
        assert_eq!(tally.record_reject(4, 1), 1);
        assert_eq!(tally.record_reject(4, 1), 1);
    }

    #[test]
    fn learning_is_reported_once_and_prunes_lower_numbers() {
        let mut tally = VoteTally::default();
        tally.record_accept(3, 0);
        tally.record_accept(8, 0);
        tally.mark_rejected(5);
        assert!(tally.mark_learned(2));

        assert!(tally.mark_learned(8));
        assert!(!tally.mark_learned(8));
        assert!(tally.is_learned(8));
        assert!(tally.is_resolved(8));
        assert!(!tally.is_learned(2));
        assert!(!tally.is_resolved(5));

        // Votes kept for 8 survive; those for 3 were dropped.
        assert_eq!(tally.record_accept(8, 1), 2);
        assert_eq!(tally.record_accept(3, 1), 1);
    }

    #[test]
    fn rejection_resolves_without_learning() {
        let mut tally = VoteTally::default();
        assert!(tally.mark_rejected(6));
        assert!(tally.is_resolved(6));
        assert!(!tally.is_learned(6));
    }
}
