//! Wire shapes and framing.
//!
//! Every exchange is one frame on a freshly opened TCP connection:
//!
//! - 4 bytes: frame length (big-endian u32)
//! - N bytes: bincode-encoded [`Envelope`]
//!
//! The envelope's payload is itself bincode-encoded; its concrete type is
//! implied by the title it is routed under (see the `*_TITLE` constants).

use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::ballot::ProposalNumber;
use crate::commit::{Commit, CommitId};
use crate::topology::ReplicaId;

/// Title for [`SyncRequest`]s.
pub const SYNC_TITLE: &str = "SyncRequest";
/// Title for [`CommitRequest`]s.
pub const COMMIT_TITLE: &str = "CommitRequest";
/// Title for [`UpdateLogRequest`]s exchanged between replicas.
pub const UPDATE_LOG_TITLE: &str = "UpdateLog";
/// Title for [`PaxosMessage`]s addressed to a replica's acceptor and learner.
pub const PAXOS_TITLE: &str = "Paxos";

/// Upper bound on a single frame. Commits carry whole files, so this is generous.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Generates a fresh correlation title for routing one reply.
pub fn fresh_title() -> String {
    nanoid::nanoid!()
}

/// Unit routed by the message bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub title: String,
    /// Listening port of the sender, so replies can find it.
    pub reply_port: u16,
    pub payload: Vec<u8>,
    /// Stamped by the receiving side from the connection's remote address.
    #[serde(skip)]
    pub reply_host: Option<IpAddr>,
}

impl Envelope {
    pub fn new(title: impl Into<String>, reply_port: u16, payload: Vec<u8>) -> Self {
        Self {
            title: title.into(),
            reply_port,
            payload,
            reply_host: None,
        }
    }

    /// Address replies should be sent to, once the receiver has stamped the host.
    pub fn reply_addr(&self) -> Option<SocketAddr> {
        self.reply_host
            .map(|host| SocketAddr::new(host, self.reply_port))
    }

    /// Decodes the payload as `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        decode(&self.payload)
    }
}

/// Client asks for every commit after `base_commit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub response_title: String,
    pub base_commit: CommitId,
}

/// Commits with id in `(base_commit, tail]`, in increasing order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub commits: Vec<Commit>,
}

/// Client proposes `proposed_commit` for slot `proposed_commit.commit_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub response_title: String,
    pub base_commit: CommitId,
    pub proposed_commit: Commit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResponse {
    pub accepted: bool,
    pub comment: String,
}

/// Replica-to-replica log transfer used by catch-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateLogRequest {
    pub response_title: String,
    pub base_commit: CommitId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateLogResponse {
    pub commits: Vec<Commit>,
}

/// A value an acceptor has accepted but not yet seen decided.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedValue {
    pub proposal: ProposalNumber,
    pub commit: Commit,
}

/// Consensus protocol messages. Each variant carries only what its step needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaxosMessage {
    Prepare {
        proposal: ProposalNumber,
        response_title: String,
    },
    Promise {
        proposal: ProposalNumber,
        prior: Option<AcceptedValue>,
    },
    RejectPrepare {
        proposal: ProposalNumber,
    },
    /// Answered only by gossip: every learner, the proposer's own included,
    /// hears the verdict on the Paxos title.
    AcceptRequest {
        proposal: ProposalNumber,
        commit: Commit,
    },
    Accepted {
        proposal: ProposalNumber,
        commit: Commit,
        voter: ReplicaId,
    },
    RejectAcceptRequest {
        proposal: ProposalNumber,
        voter: ReplicaId,
    },
}

impl PaxosMessage {
    pub fn proposal(&self) -> ProposalNumber {
        match self {
            PaxosMessage::Prepare { proposal, .. }
            | PaxosMessage::Promise { proposal, .. }
            | PaxosMessage::RejectPrepare { proposal }
            | PaxosMessage::AcceptRequest { proposal, .. }
            | PaxosMessage::Accepted { proposal, .. }
            | PaxosMessage::RejectAcceptRequest { proposal, .. } => *proposal,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PaxosMessage::Prepare { .. } => "prepare",
            PaxosMessage::Promise { .. } => "promise",
            PaxosMessage::RejectPrepare { .. } => "reject_prepare",
            PaxosMessage::AcceptRequest { .. } => "accept_request",
            PaxosMessage::Accepted { .. } => "accepted",
            PaxosMessage::RejectAcceptRequest { .. } => "reject_accept_request",
        }
    }
}

/// Failures reading or decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame io: {0}")]
    Io(#[from] io::Error),
    #[error("frame of {0} bytes exceeds limit")]
    TooLarge(usize),
    #[error("malformed payload: {0}")]
    Decode(#[from] bincode::Error),
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, FrameError> {
    Ok(bincode::serialize(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, FrameError> {
    Ok(bincode::deserialize(bytes)?)
}

/// Writes one length-prefixed frame.
pub fn write_frame<W: Write>(writer: &mut W, bytes: &[u8]) -> Result<(), FrameError> {
    if bytes.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(bytes.len()));
    }
    let len = bytes.len() as u32;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(bytes)?;
    writer.flush()?;
    Ok(())
}

/// Reads exactly one length-prefixed frame.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}
