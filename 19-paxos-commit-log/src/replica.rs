//! Replica lifecycle: startup, the long-lived loops, and shutdown.
//!
//! A running replica is a handful of threads sharing one [`ReplicaContext`]:
//!
//! - **Handler loops**: sync, commit, update-log and Paxos, each polling its
//!   title on the bus (see [`crate::handlers`])
//! - **Proposer threads**: one per client commit request, short-lived
//! - **Title sweeper**: evicts abandoned reply titles from the bus
//! - **Lag repair**: at most one at a time, started by the Paxos loop
//!
//! Startup loads the persisted log, optionally runs catch-up, and only then
//! starts serving.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::bus::MessageBus;
use crate::catchup;
use crate::commit::{Commit, CommitId};
use crate::config::{ReplicaConfig, Timeouts};
use crate::handlers;
use crate::log::ConsensusLog;
use crate::message::{self, Envelope};
use crate::storage::LogStorage;
use crate::store::ReplicaStore;
use crate::topology::{ReplicaId, ReplicaTopology};

/// State shared by every thread of one replica.
pub struct ReplicaContext {
    pub id: ReplicaId,
    pub topology: ReplicaTopology,
    pub bus: Arc<MessageBus>,
    pub store: ReplicaStore,
    pub timeouts: Timeouts,
    closing: AtomicBool,
    repairing: AtomicBool,
}

impl ReplicaContext {
    pub fn new(config: &ReplicaConfig, bus: Arc<MessageBus>, store: ReplicaStore) -> Self {
        Self {
            id: config.id,
            topology: config.topology.clone(),
            bus,
            store,
            timeouts: config.timeouts.clone(),
            closing: AtomicBool::new(false),
            repairing: AtomicBool::new(false),
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Claims the single lag-repair slot. Returns false if a repair is running.
    pub(crate) fn begin_repair(&self) -> bool {
        !self.repairing.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn end_repair(&self) {
        self.repairing.store(false, Ordering::Release);
    }

    /// Sends `value` under `title` to every replica, self included.
    pub fn broadcast<T: Serialize>(&self, title: &str, value: &T) {
        let payload = match message::encode(value) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(replica = self.id, title, error = %err, "failed to encode broadcast");
                return;
            }
        };
        for addr in self.topology.addresses() {
            self.bus.send(addr.as_str(), title, payload.clone());
        }
    }

    /// Answers `request` at the address it came from.
    pub fn reply<T: Serialize>(&self, request: &Envelope, title: &str, value: &T) {
        match request.reply_addr() {
            Some(addr) => self.bus.send_message(addr, title, value),
            None => warn!(replica = self.id, title, "request carries no reply address"),
        }
    }
}

/// Point-in-time view of a replica, for the console and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaStatus {
    pub id: ReplicaId,
    pub addr: SocketAddr,
    pub tail_id: CommitId,
    pub replicas: usize,
}

impl fmt::Display for ReplicaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "replica {} of {} at {}, tail commit {}",
            self.id, self.replicas, self.addr, self.tail_id
        )
    }
}

pub struct Replica;

impl Replica {
    /// Binds the replica's own address from the membership list and starts it.
    pub fn start(config: ReplicaConfig) -> Result<ReplicaHandle> {
        let bus = MessageBus::bind(config.listen_addr())
            .with_context(|| format!("replica {} failed to bind", config.id))?;
        Self::start_with_bus(config, bus)
    }

    /// Starts a replica on an already bound bus.
    ///
    /// Tests bind every bus on an ephemeral port first, then build the
    /// membership list from the ports they got.
    ///
    /// # Errors
    ///
    /// A persisted log that cannot be read or fails its consistency check
    /// aborts startup. Catch-up failures never do.
    pub fn start_with_bus(config: ReplicaConfig, bus: Arc<MessageBus>) -> Result<ReplicaHandle> {
        let result = Self::boot(&config, Arc::clone(&bus));
        if result.is_err() {
            bus.shutdown();
        }
        result
    }

    fn boot(config: &ReplicaConfig, bus: Arc<MessageBus>) -> Result<ReplicaHandle> {
        let storage = config.storage.clone().map(LogStorage::new);
        let log = match &storage {
            Some(storage) => storage
                .load()
                .with_context(|| format!("replica {} cannot restore its log", config.id))?
                .unwrap_or_default(),
            None => ConsensusLog::new(),
        };
        info!(replica = config.id, tail = log.tail_id(), addr = %bus.local_addr(), "starting replica");

        let ctx = Arc::new(ReplicaContext::new(config, bus, ReplicaStore::new(log, storage)));
        if config.catch_up {
            catchup::catch_up(&ctx)
                .with_context(|| format!("replica {} caught up to an inconsistent log", config.id))?;
        }

        let threads = match handlers::spawn_all(&ctx) {
            Ok(threads) => threads,
            Err(err) => {
                ctx.closing.store(true, Ordering::Release);
                return Err(err);
            }
        };
        info!(replica = ctx.id, tail = ctx.store.tail_id(), "replica serving");
        Ok(ReplicaHandle {
            ctx,
            threads,
        })
    }
}

/// Owner of a running replica.
///
/// Dropping the handle shuts the replica down.
pub struct ReplicaHandle {
    ctx: Arc<ReplicaContext>,
    threads: Vec<JoinHandle<()>>,
}

impl ReplicaHandle {
    pub fn id(&self) -> ReplicaId {
        self.ctx.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.ctx.bus.local_addr()
    }

    pub fn tail_id(&self) -> CommitId {
        self.ctx.store.tail_id()
    }

    /// Snapshot of the decided log, genesis included.
    pub fn entries(&self) -> Vec<Commit> {
        self.ctx.store.entries()
    }

    pub fn status(&self) -> ReplicaStatus {
        ReplicaStatus {
            id: self.ctx.id,
            addr: self.local_addr(),
            tail_id: self.tail_id(),
            replicas: self.ctx.topology.len(),
        }
    }

    /// Stops every loop, waits for them, and closes the socket.
    ///
    /// Loops notice the flag within one poll interval. Proposer threads still
    /// running are left to hit their own deadlines.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.ctx.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(replica = self.ctx.id, "shutting down");
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        self.ctx.bus.shutdown();
        info!(replica = self.ctx.id, "replica stopped");
    }
}

impl Drop for ReplicaHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
