//! The acceptor role: the cluster's distributed memory.
//!
//! An acceptor promises never to accept numbers below the highest Prepare it
//! answered, and reports what it has already accepted so that a later
//! proposer re-proposes that value instead of overwriting it.

use tracing::debug;

use crate::ballot::{BallotState, ProposalNumber};
use crate::commit::Commit;
use crate::message::{AcceptedValue, PaxosMessage};
use crate::topology::ReplicaId;

/// What the acceptor wants sent after handling one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptorResponse {
    /// Answer the proposer on the title it is waiting on.
    Reply {
        response_title: String,
        message: PaxosMessage,
    },
    /// Broadcast to every replica's learner.
    Gossip(PaxosMessage),
}

impl AcceptorResponse {
    pub fn message(&self) -> &PaxosMessage {
        match self {
            AcceptorResponse::Reply { message, .. } | AcceptorResponse::Gossip(message) => message,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Acceptor {
    id: ReplicaId,
}

impl Acceptor {
    pub fn new(id: ReplicaId) -> Self {
        Self { id }
    }

    /// Handles Prepare and AcceptRequest; other messages are not for the acceptor.
    pub fn handle(&self, ballot: &mut BallotState, message: &PaxosMessage) -> Option<AcceptorResponse> {
        let response = match message {
            PaxosMessage::Prepare {
                proposal,
                response_title,
            } => AcceptorResponse::Reply {
                response_title: response_title.clone(),
                message: self.on_prepare(ballot, *proposal),
            },
            PaxosMessage::AcceptRequest { proposal, commit } => {
                AcceptorResponse::Gossip(self.on_accept_request(ballot, *proposal, commit))
            }
            _ => return None,
        };
        ballot.observe(message.proposal());
        Some(response)
    }

    fn on_prepare(&self, ballot: &mut BallotState, proposal: ProposalNumber) -> PaxosMessage {
        if proposal > ballot.highest_seen {
            ballot.last_promised = Some(proposal);
            debug!(replica = self.id, proposal, "promised");
            PaxosMessage::Promise {
                proposal,
                prior: ballot.last_accepted.clone(),
            }
        } else {
            debug!(
                replica = self.id,
                proposal,
                highest_seen = ballot.highest_seen,
                "rejected prepare"
            );
            PaxosMessage::RejectPrepare { proposal }
        }
    }

    fn on_accept_request(&self, ballot: &mut BallotState, proposal: ProposalNumber, commit: &Commit) -> PaxosMessage {
        let allowed = ballot
            .last_promised
            .map_or(true, |promised| proposal >= promised);
        if allowed {
            ballot.last_accepted = Some(AcceptedValue {
                proposal,
                commit: commit.clone(),
            });
            debug!(replica = self.id, proposal, slot = commit.commit_id, "accepted");
            PaxosMessage::Accepted {
                proposal,
                commit: commit.clone(),
                voter: self.id,
            }
        } else {
            debug!(replica = self.id, proposal, "rejected accept request");
            PaxosMessage::RejectAcceptRequest {
                proposal,
                voter: self.id,
            }
        }
    }
}
