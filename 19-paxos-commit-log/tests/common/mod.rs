//! Test harness for clusters of real replicas talking over loopback TCP.

#![allow(dead_code)]

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use paxos_commit_log::bus::MessageBus;
use paxos_commit_log::client::Client;
use paxos_commit_log::commit::{Commit, CommitId};
use paxos_commit_log::config::{ReplicaConfig, Timeouts};
use paxos_commit_log::replica::{Replica, ReplicaHandle};
use paxos_commit_log::topology::ReplicaTopology;
use tempfile::TempDir;

/// Deadlines short enough for tests, long enough for a loaded CI machine.
pub fn test_timeouts() -> Timeouts {
    Timeouts {
        prepare: Duration::from_secs(5),
        decision: Duration::from_secs(5),
        poll: Duration::from_millis(50),
        catch_up_reply: Duration::from_secs(1),
        observe: Duration::from_millis(500),
        title_grace: Duration::from_secs(60),
        client_attempt: Duration::from_secs(10),
        client_attempts: 3,
    }
}

pub struct TestCluster {
    topology: ReplicaTopology,
    replicas: Vec<Option<ReplicaHandle>>,
    storage: Option<TempDir>,
    timeouts: Timeouts,
}

impl TestCluster {
    /// Spawns `n` in-memory replicas on ephemeral loopback ports.
    pub fn spawn(n: usize) -> Result<Self> {
        Self::spawn_with(n, test_timeouts(), false)
    }

    /// Spawns `n` replicas that persist their logs under a temp directory.
    pub fn spawn_persistent(n: usize) -> Result<Self> {
        Self::spawn_with(n, test_timeouts(), true)
    }

    pub fn spawn_with(n: usize, timeouts: Timeouts, persistent: bool) -> Result<Self> {
        let mut buses = Vec::with_capacity(n);
        for _ in 0..n {
            buses.push(MessageBus::bind("127.0.0.1:0")?);
        }
        let topology = ReplicaTopology::new(buses.iter().map(|bus| bus.local_addr().to_string()).collect())?;
        let storage = if persistent {
            Some(tempfile::tempdir()?)
        } else {
            None
        };

        let mut cluster = Self {
            topology,
            replicas: Vec::with_capacity(n),
            storage,
            timeouts,
        };
        for (id, bus) in buses.into_iter().enumerate() {
            let config = cluster.config(id, false)?;
            cluster.replicas.push(Some(Replica::start_with_bus(config, bus)?));
        }
        Ok(cluster)
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.topology.addresses().to_vec()
    }

    pub fn address(&self, id: usize) -> String {
        self.topology.addresses()[id].clone()
    }

    pub fn storage_path(&self, id: usize) -> Option<PathBuf> {
        self.storage
            .as_ref()
            .map(|dir| dir.path().join(format!("replica-{id}.log")))
    }

    fn config(&self, id: usize, catch_up: bool) -> Result<ReplicaConfig> {
        let mut config = ReplicaConfig::new(id, self.topology.clone())?
            .with_catch_up(catch_up)
            .with_timeouts(self.timeouts.clone());
        if let Some(path) = self.storage_path(id) {
            config = config.with_storage(path);
        }
        Ok(config)
    }

    pub fn replica(&self, id: usize) -> &ReplicaHandle {
        match &self.replicas[id] {
            Some(handle) => handle,
            None => panic!("replica {id} is stopped"),
        }
    }

    /// Shuts replica `id` down and releases its port.
    pub fn stop(&mut self, id: usize) {
        if let Some(handle) = self.replicas[id].take() {
            handle.shutdown();
        }
    }

    /// Starts replica `id` again on its old address.
    pub fn restart(&mut self, id: usize, catch_up: bool) -> Result<()> {
        self.stop(id);
        let handle = Replica::start(self.config(id, catch_up)?)?;
        self.replicas[id] = Some(handle);
        Ok(())
    }

    /// A client that talks to every replica.
    pub fn client(&self) -> Result<Client> {
        self.client_for(self.addresses())
    }

    /// A client restricted to the given servers.
    pub fn client_for(&self, servers: Vec<String>) -> Result<Client> {
        let bus = MessageBus::bind("127.0.0.1:0")?;
        Ok(Client::with_bus(bus, servers).with_timeouts(&self.timeouts))
    }

    pub fn tails(&self) -> Vec<Option<CommitId>> {
        self.replicas
            .iter()
            .map(|replica| replica.as_ref().map(ReplicaHandle::tail_id))
            .collect()
    }

    /// Waits until every running replica reports `tail`.
    pub fn wait_for_tail(&self, tail: CommitId, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            let tails = self.tails();
            if tails.iter().flatten().all(|&t| t == tail) {
                return Ok(());
            }
            if start.elapsed() > timeout {
                bail!("timeout waiting for tail {tail}, tails are {tails:?}");
            }
            thread::sleep(Duration::from_millis(20));
        }
    }

    /// Waits until replica `id` reports at least `tail`.
    pub fn wait_for_replica_tail(&self, id: usize, tail: CommitId, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            let current = self.replica(id).tail_id();
            if current >= tail {
                return Ok(());
            }
            if start.elapsed() > timeout {
                bail!("timeout waiting for replica {id} to reach tail {tail}, at {current}");
            }
            thread::sleep(Duration::from_millis(20));
        }
    }

    pub fn shutdown(mut self) {
        for id in 0..self.replicas.len() {
            self.stop(id);
        }
    }
}

/// A commit for `slot` that is unique to `author`.
pub fn commit_by(slot: CommitId, author: &str) -> Commit {
    Commit::new(slot, author, format!("{author} writes slot {slot}"))
        .with_file(format!("{author}.txt"), format!("slot {slot}\n").into_bytes())
}
