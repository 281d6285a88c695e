use anyhow::{Result, ensure};

/// Index of a replica in the fixed membership list.
pub type ReplicaId = usize;

/// Fixed replica membership: addresses in replica-id order, self included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaTopology {
    replicas: Vec<String>,
}

impl ReplicaTopology {
    pub fn new(replicas: Vec<String>) -> Result<Self> {
        ensure!(!replicas.is_empty(), "topology requires at least one replica");
        for (id, addr) in replicas.iter().enumerate() {
            ensure!(
                !replicas[..id].contains(addr),
                "replica address {addr} listed twice"
            );
        }
        Ok(Self { replicas })
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    pub fn addresses(&self) -> &[String] {
        &self.replicas
    }

    pub fn address(&self, id: ReplicaId) -> Option<&str> {
        self.replicas.get(id).map(String::as_str)
    }

    /// Addresses of every replica except `id`.
    pub fn peers_of(&self, id: ReplicaId) -> impl Iterator<Item = &str> {
        self.replicas
            .iter()
            .enumerate()
            .filter(move |(other, _)| *other != id)
            .map(|(_, addr)| addr.as_str())
    }

    /// Strictly more than half of the replica set.
    pub fn is_majority(&self, votes: usize) -> bool {
        votes * 2 > self.replicas.len()
    }
}
