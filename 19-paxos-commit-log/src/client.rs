//! Client side of the sync and commit requests.
//!
//! Each attempt picks a random server, sends the request under a fresh
//! response title, and waits for one reply. An attempt that times out is
//! retried against another random pick; its late reply, if any, lands on an
//! abandoned title and is eventually evicted.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tracing::{debug, warn};

use crate::bus::{MessageBus, Received};
use crate::commit::{Commit, CommitId};
use crate::config::Timeouts;
use crate::message::{
    COMMIT_TITLE, CommitRequest, CommitResponse, SYNC_TITLE, SyncRequest, SyncResponse, fresh_title,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("no servers configured")]
    NoServers,
    #[error("no server answered after {attempts} attempts")]
    Unreachable { attempts: usize },
}

pub struct Client {
    bus: Arc<MessageBus>,
    servers: Vec<String>,
    attempt_timeout: Duration,
    attempts: usize,
}

impl Client {
    pub fn with_bus(bus: Arc<MessageBus>, servers: Vec<String>) -> Self {
        let defaults = Timeouts::default();
        Self {
            bus,
            servers,
            attempt_timeout: defaults.client_attempt,
            attempts: defaults.client_attempts,
        }
    }

    pub fn with_timeouts(mut self, timeouts: &Timeouts) -> Self {
        self.attempt_timeout = timeouts.client_attempt;
        self.attempts = timeouts.client_attempts;
        self
    }

    /// Fetches every decided commit after `base`.
    pub fn sync(&self, base: CommitId) -> Result<Vec<Commit>, ClientError> {
        self.retry(|server| self.sync_via(server, base))
    }

    /// Proposes `commit` for slot `commit.commit_id`.
    ///
    /// `Ok` carries the server's verdict, which may be a refusal such as
    /// "Please sync"; `Err` means no server answered at all.
    pub fn commit(&self, base: CommitId, commit: &Commit) -> Result<CommitResponse, ClientError> {
        self.retry(|server| self.commit_via(server, base, commit))
    }

    /// One sync attempt against a specific server.
    pub fn sync_via(&self, server: &str, base: CommitId) -> Option<Vec<Commit>> {
        let title = fresh_title();
        let request = SyncRequest {
            response_title: title.clone(),
            base_commit: base,
        };
        self.bus.send_message(server, SYNC_TITLE, &request);
        self.await_reply::<SyncResponse>(&title)
            .map(|response| response.commits)
    }

    /// One commit attempt against a specific server.
    pub fn commit_via(&self, server: &str, base: CommitId, commit: &Commit) -> Option<CommitResponse> {
        let title = fresh_title();
        let request = CommitRequest {
            response_title: title.clone(),
            base_commit: base,
            proposed_commit: commit.clone(),
        };
        self.bus.send_message(server, COMMIT_TITLE, &request);
        self.await_reply::<CommitResponse>(&title)
    }

    /// Releases the client's listening port.
    pub fn shutdown(&self) {
        self.bus.shutdown();
    }

    fn retry<T>(&self, mut attempt: impl FnMut(&str) -> Option<T>) -> Result<T, ClientError> {
        if self.servers.is_empty() {
            return Err(ClientError::NoServers);
        }
        let mut rng = rand::thread_rng();
        for round in 1..=self.attempts {
            let Some(server) = self.servers.choose(&mut rng) else {
                return Err(ClientError::NoServers);
            };
            if let Some(reply) = attempt(server.as_str()) {
                return Ok(reply);
            }
            debug!(%server, round, "no reply, retrying");
        }
        warn!(attempts = self.attempts, "giving up, no server answered");
        Err(ClientError::Unreachable {
            attempts: self.attempts,
        })
    }

    fn await_reply<T: serde::de::DeserializeOwned>(&self, title: &str) -> Option<T> {
        match self.bus.receive_message::<T>(title, self.attempt_timeout) {
            Received::Message(reply, _) => Some(reply),
            Received::Malformed(envelope) => {
                warn!(title, from = ?envelope.reply_addr(), "malformed reply");
                None
            }
            Received::TimedOut => None,
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.bus.shutdown();
    }
}
