//! The proposer role: one two-phase ballot per client commit request.
//!
//! ```text
//! Idle -> Preparing -> Promised -> Accepting -> Decided
//!                   \-> RejectedPrepare       \-> RejectedAccept
//!                   \-> TimedOut              \-> TimedOut
//! ```
//!
//! The proposer never appends anything itself. After broadcasting its
//! AcceptRequest it sleeps on the store until the learner (which sees the
//! gossiped votes) fills the slot. A majority rejection wakes it but does not
//! end the wait: a higher proposer may still get the same value decided.

use std::fmt;
use std::time::Instant;

use tracing::{debug, warn};

use crate::ballot::ProposalNumber;
use crate::bus::Received;
use crate::commit::{Commit, CommitId};
use crate::message::{AcceptedValue, CommitResponse, PAXOS_TITLE, PaxosMessage, fresh_title};
use crate::replica::ReplicaContext;
use crate::store::SlotOutcome;
use crate::topology::ReplicaTopology;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Preparing,
    Promised,
    RejectedPrepare,
    Accepting,
    Decided,
    RejectedAccept,
    TimedOut,
}

/// How a commit request ended, as reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Accepted,
    InvalidCommitId,
    /// Another value holds (or was chosen for) the slot.
    Stale,
    PrepareRejected,
    PrepareTimedOut,
    RoundTimedOut,
}

impl Outcome {
    pub fn is_accepted(self) -> bool {
        self == Outcome::Accepted
    }

    pub fn comment(self) -> &'static str {
        match self {
            Outcome::Accepted => "",
            Outcome::InvalidCommitId => "invalid commit id",
            Outcome::Stale => "Please sync",
            Outcome::PrepareRejected => "Paxos prepare message was rejected",
            Outcome::PrepareTimedOut => "Paxos prepare timed out",
            Outcome::RoundTimedOut => "Paxos round timed out",
        }
    }

    /// Maps the end of the decision wait to a client answer.
    pub fn settle(proposed: &Commit, slot: SlotOutcome) -> Self {
        match slot {
            SlotOutcome::Decided(decided) if decided == *proposed => Outcome::Accepted,
            SlotOutcome::Decided(_) => Outcome::Stale,
            SlotOutcome::TimedOut { rejected: true } => Outcome::Stale,
            SlotOutcome::TimedOut { rejected: false } => Outcome::RoundTimedOut,
        }
    }

    pub fn into_response(self) -> CommitResponse {
        CommitResponse {
            accepted: self.is_accepted(),
            comment: self.comment().to_string(),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Accepted => f.write_str("accepted"),
            other => f.write_str(other.comment()),
        }
    }
}

/// Where the prepare phase stands after a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareVerdict {
    Waiting,
    Promised,
    Rejected,
}

/// Promise/reject counts for one proposal number, plus the highest-numbered
/// value any promising acceptor had already accepted for the target slot.
#[derive(Debug)]
pub struct PrepareTally {
    proposal: ProposalNumber,
    slot: CommitId,
    promises: usize,
    rejects: usize,
    prior: Option<AcceptedValue>,
}

impl PrepareTally {
    pub fn new(proposal: ProposalNumber, slot: CommitId) -> Self {
        Self {
            proposal,
            slot,
            promises: 0,
            rejects: 0,
            prior: None,
        }
    }

    /// Counts one reply. Replies for other proposal numbers are ignored, and so
    /// are echoed values for other slots.
    pub fn record(&mut self, reply: PaxosMessage, topology: &ReplicaTopology) -> PrepareVerdict {
        match reply {
            PaxosMessage::Promise { proposal, prior } if proposal == self.proposal => {
                self.promises += 1;
                if let Some(prior) = prior.filter(|prior| prior.commit.commit_id == self.slot) {
                    let higher = self
                        .prior
                        .as_ref()
                        .map_or(true, |current| prior.proposal > current.proposal);
                    if higher {
                        self.prior = Some(prior);
                    }
                }
            }
            PaxosMessage::RejectPrepare { proposal } if proposal == self.proposal => {
                self.rejects += 1;
            }
            _ => return PrepareVerdict::Waiting,
        }

        if topology.is_majority(self.promises) {
            PrepareVerdict::Promised
        } else if topology.is_majority(self.rejects) {
            PrepareVerdict::Rejected
        } else {
            PrepareVerdict::Waiting
        }
    }

    /// The value to propose: an echoed prior wins over the client's commit.
    pub fn choose(self, proposed: &Commit) -> Commit {
        self.prior
            .map(|prior| prior.commit)
            .unwrap_or_else(|| proposed.clone())
    }
}

pub struct Proposer<'a> {
    ctx: &'a ReplicaContext,
    proposal: ProposalNumber,
    phase: Phase,
}

impl<'a> Proposer<'a> {
    pub fn new(ctx: &'a ReplicaContext) -> Self {
        Self {
            ctx,
            proposal: 0,
            phase: Phase::Idle,
        }
    }

    fn enter(&mut self, phase: Phase) {
        debug!(
            replica = self.ctx.id,
            proposal = self.proposal,
            from = ?self.phase,
            to = ?phase,
            "proposer phase"
        );
        self.phase = phase;
    }

    /// Drives one ballot for `proposed` into slot `proposed.commit_id`.
    pub fn propose(&mut self, proposed: &Commit) -> Outcome {
        let slot = proposed.commit_id;
        if slot == 0 {
            return Outcome::InvalidCommitId;
        }
        if let Some(decided) = self.ctx.store.lock().log.get(slot) {
            return if decided == proposed {
                Outcome::Accepted
            } else {
                Outcome::Stale
            };
        }

        self.proposal = self
            .ctx
            .store
            .lock()
            .ballot
            .next_proposal_number(self.ctx.id, self.ctx.topology.len());

        let chosen = match self.prepare(slot) {
            Ok(tally) => tally.choose(proposed),
            Err(outcome) => return outcome,
        };
        if chosen != *proposed {
            debug!(
                replica = self.ctx.id,
                proposal = self.proposal,
                slot = chosen.commit_id,
                "re-proposing previously accepted value"
            );
        }

        self.enter(Phase::Accepting);
        self.ctx.broadcast(
            PAXOS_TITLE,
            &PaxosMessage::AcceptRequest {
                proposal: self.proposal,
                commit: chosen,
            },
        );

        let slot_outcome = self
            .ctx
            .store
            .await_slot(self.proposal, slot, self.ctx.timeouts.decision);
        self.enter(match &slot_outcome {
            SlotOutcome::Decided(_) => Phase::Decided,
            SlotOutcome::TimedOut { rejected: true } => Phase::RejectedAccept,
            SlotOutcome::TimedOut { rejected: false } => Phase::TimedOut,
        });
        Outcome::settle(proposed, slot_outcome)
    }

    /// Phase one: gathers a majority of promises within the prepare deadline.
    fn prepare(&mut self, slot: CommitId) -> Result<PrepareTally, Outcome> {
        self.enter(Phase::Preparing);
        let title = fresh_title();
        self.ctx.broadcast(
            PAXOS_TITLE,
            &PaxosMessage::Prepare {
                proposal: self.proposal,
                response_title: title.clone(),
            },
        );

        let mut tally = PrepareTally::new(self.proposal, slot);
        let deadline = Instant::now() + self.ctx.timeouts.prepare;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.enter(Phase::TimedOut);
                return Err(Outcome::PrepareTimedOut);
            }
            let reply = match self.ctx.bus.receive_message::<PaxosMessage>(&title, remaining) {
                Received::Message(reply, _) => reply,
                Received::Malformed(envelope) => {
                    warn!(replica = self.ctx.id, from = ?envelope.reply_addr(), "discarded malformed prepare reply");
                    continue;
                }
                Received::TimedOut => continue,
            };
            match tally.record(reply, &self.ctx.topology) {
                PrepareVerdict::Waiting => {}
                PrepareVerdict::Promised => {
                    self.enter(Phase::Promised);
                    return Ok(tally);
                }
                PrepareVerdict::Rejected => {
                    self.enter(Phase::RejectedPrepare);
                    return Err(Outcome::PrepareRejected);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology(n: usize) -> ReplicaTopology {
        ReplicaTopology::new((0..n).map(|i| format!("127.0.0.1:{}", 7200 + i)).collect()).unwrap()
    }

    fn promise(proposal: ProposalNumber, prior: Option<(ProposalNumber, &Commit)>) -> PaxosMessage {
        PaxosMessage::Promise {
            proposal,
            prior: prior.map(|(number, commit)| AcceptedValue {
                proposal: number,
                commit: commit.clone(),
            }),
        }
    }

    #[test]
    fn majority_of_promises_completes_prepare() {
        let topology = topology(5);
        let mut tally = PrepareTally::new(12, 1);
        assert_eq!(tally.record(promise(12, None), &topology), PrepareVerdict::Waiting);
        assert_eq!(tally.record(promise(12, None), &topology), PrepareVerdict::Waiting);
        assert_eq!(tally.record(promise(12, None), &topology), PrepareVerdict::Promised);
    }

    #[test]
    fn majority_of_rejects_fails_prepare() {
        let topology = topology(3);
        let mut tally = PrepareTally::new(4, 1);
        let reject = || PaxosMessage::RejectPrepare { proposal: 4 };
        assert_eq!(tally.record(reject(), &topology), PrepareVerdict::Waiting);
        assert_eq!(tally.record(reject(), &topology), PrepareVerdict::Rejected);
    }

    #[test]
    fn stale_replies_are_not_counted() {
        let topology = topology(3);
        let mut tally = PrepareTally::new(7, 1);
        assert_eq!(tally.record(promise(4, None), &topology), PrepareVerdict::Waiting);
        assert_eq!(tally.record(promise(4, None), &topology), PrepareVerdict::Waiting);
        assert_eq!(tally.record(promise(7, None), &topology), PrepareVerdict::Waiting);
    }

    #[test]
    fn highest_numbered_prior_wins() {
        let topology = topology(5);
        let ours = Commit::new(3, "client", "mine");
        let older = Commit::new(3, "a", "older");
        let newer = Commit::new(3, "b", "newer");

        let mut tally = PrepareTally::new(20, 3);
        tally.record(promise(20, Some((6, &older))), &topology);
        tally.record(promise(20, Some((11, &newer))), &topology);
        tally.record(promise(20, Some((9, &older))), &topology);
        assert_eq!(tally.choose(&ours), newer);
    }

    #[test]
    fn priors_for_other_slots_are_ignored() {
        let topology = topology(3);
        let ours = Commit::new(5, "client", "mine");
        let old_slot = Commit::new(4, "a", "already decided elsewhere");

        let mut tally = PrepareTally::new(9, 5);
        tally.record(promise(9, Some((6, &old_slot))), &topology);
        tally.record(promise(9, None), &topology);
        assert_eq!(tally.choose(&ours), ours);
    }

    #[test]
    fn client_value_used_without_prior() {
        let topology = topology(3);
        let ours = Commit::new(1, "client", "mine");
        let mut tally = PrepareTally::new(3, 1);
        tally.record(promise(3, None), &topology);
        tally.record(promise(3, None), &topology);
        assert_eq!(tally.choose(&ours), ours);
    }

    #[test]
    fn own_value_decided_after_rejection_is_accepted() {
        let ours = Commit::new(2, "client", "mine");
        let theirs = Commit::new(2, "other", "theirs");
        assert_eq!(Outcome::settle(&ours, SlotOutcome::Decided(ours.clone())), Outcome::Accepted);
        assert_eq!(Outcome::settle(&ours, SlotOutcome::Decided(theirs)), Outcome::Stale);
        assert_eq!(Outcome::settle(&ours, SlotOutcome::TimedOut { rejected: true }), Outcome::Stale);
        assert_eq!(
            Outcome::settle(&ours, SlotOutcome::TimedOut { rejected: false }),
            Outcome::RoundTimedOut
        );
    }

    #[test]
    fn outcomes_map_to_wire_comments() {
        let accepted = Outcome::Accepted.into_response();
        assert!(accepted.accepted);
        assert_eq!(accepted.comment, "");

        let stale = Outcome::Stale.into_response();
        assert!(!stale.accepted);
        assert_eq!(stale.comment, "Please sync");

        assert_eq!(Outcome::PrepareTimedOut.comment(), "Paxos prepare timed out");
        assert_eq!(Outcome::PrepareRejected.comment(), "Paxos prepare message was rejected");
        assert_eq!(Outcome::RoundTimedOut.comment(), "Paxos round timed out");
        assert_eq!(Outcome::RoundTimedOut.to_string(), "Paxos round timed out");
        assert_eq!(Outcome::Accepted.to_string(), "accepted");
    }
}
