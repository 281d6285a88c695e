//! Replica configuration.
//!
//! Plain structs with defaults. The binary builds them from its command line;
//! tests build them directly with shorter timeouts.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, ensure};

use crate::topology::{ReplicaId, ReplicaTopology};

/// Every deadline a replica or client waits on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    /// Whole prepare phase, from first Prepare sent to majority.
    pub prepare: Duration,
    /// Wait for the learner to settle an accepted proposal.
    pub decision: Duration,
    /// How long each handler loop blocks before rechecking shutdown.
    pub poll: Duration,
    /// Wait for the first usable UpdateLog reply.
    pub catch_up_reply: Duration,
    /// Bound on the observer round during catch-up.
    pub observe: Duration,
    /// Idle time after which an unwatched title is evicted.
    pub title_grace: Duration,
    /// One client attempt, request to response.
    pub client_attempt: Duration,
    pub client_attempts: usize,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            prepare: Duration::from_secs(10),
            decision: Duration::from_secs(30),
            poll: Duration::from_secs(2),
            catch_up_reply: Duration::from_secs(5),
            observe: Duration::from_secs(30),
            title_grace: Duration::from_secs(60),
            client_attempt: Duration::from_secs(10),
            client_attempts: 5,
        }
    }
}

/// Identity, membership and tuning for one replica.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    pub id: ReplicaId,
    pub topology: ReplicaTopology,
    /// Where the log is persisted; `None` keeps it in memory only.
    pub storage: Option<PathBuf>,
    /// Run the catch-up protocol before serving.
    pub catch_up: bool,
    pub timeouts: Timeouts,
}

impl ReplicaConfig {
    pub fn new(id: ReplicaId, topology: ReplicaTopology) -> Result<Self> {
        ensure!(
            id < topology.len(),
            "replica id {id} out of range for {} replicas",
            topology.len()
        );
        Ok(Self {
            id,
            topology,
            storage: None,
            catch_up: true,
            timeouts: Timeouts::default(),
        })
    }

    /// This replica's own entry in the membership list.
    pub fn listen_addr(&self) -> &str {
        self.topology.address(self.id).unwrap_or_default()
    }

    pub fn with_storage(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage = Some(path.into());
        self
    }

    pub fn with_catch_up(mut self, catch_up: bool) -> Self {
        self.catch_up = catch_up;
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

/// Parses `host:port` peer entries, in replica-id order, into a topology.
///
/// Entries are trimmed; empty entries are an error rather than silently
/// shifting every later replica id.
pub fn parse_peers(entries: &[String]) -> Result<ReplicaTopology> {
    let mut replicas = Vec::with_capacity(entries.len());
    for (id, entry) in entries.iter().enumerate() {
        let addr = entry.trim();
        ensure!(!addr.is_empty(), "peer entry {id} is empty");
        let (host, port) = addr
            .rsplit_once(':')
            .with_context(|| format!("invalid peer entry '{addr}', expected host:port"))?;
        ensure!(!host.is_empty(), "peer entry '{addr}' has no host");
        port.parse::<u16>()
            .with_context(|| format!("invalid port in peer entry '{addr}'"))?;
        replicas.push(addr.to_string());
    }
    ensure!(
        !replicas.is_empty(),
        "at least one --peer entry is required (include self)"
    );
    ReplicaTopology::new(replicas)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_ordered_peer_list() {
        let topology = parse_peers(&entries(&["127.0.0.1:7101", " 127.0.0.1:7102 ", "localhost:7103"])).unwrap();
        assert_eq!(topology.len(), 3);
        assert_eq!(topology.address(1), Some("127.0.0.1:7102"));
        assert_eq!(topology.address(2), Some("localhost:7103"));
    }

    #[test]
    fn rejects_malformed_entries() {
        assert!(parse_peers(&[]).is_err());
        assert!(parse_peers(&entries(&["127.0.0.1"])).is_err());
        assert!(parse_peers(&entries(&["127.0.0.1:http"])).is_err());
        assert!(parse_peers(&entries(&[":7101"])).is_err());
        assert!(parse_peers(&entries(&["127.0.0.1:7101", ""])).is_err());
    }

    #[test]
    fn config_requires_id_in_membership() {
        let topology = parse_peers(&entries(&["127.0.0.1:7101", "127.0.0.1:7102"])).unwrap();
        assert!(ReplicaConfig::new(2, topology.clone()).is_err());

        let config = ReplicaConfig::new(1, topology).unwrap();
        assert_eq!(config.listen_addr(), "127.0.0.1:7102");
        assert!(config.catch_up);
        assert_eq!(config.timeouts, Timeouts::default());
    }
}
