//! Long-lived poll loops, one per well-known title.
//!
//! Every loop blocks on its title for at most one poll interval, then checks
//! the shutdown flag. Payloads that fail to decode for their title are logged
//! and dropped; the loop keeps going.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use tracing::{debug, info, trace, warn};

use crate::acceptor::{Acceptor, AcceptorResponse};
use crate::bus::Received;
use crate::catchup;
use crate::learner::{Decision, Learner, VotingLearner};
use crate::message::{
    COMMIT_TITLE, CommitRequest, Envelope, PAXOS_TITLE, PaxosMessage, SYNC_TITLE, SyncRequest,
    SyncResponse, UPDATE_LOG_TITLE, UpdateLogRequest, UpdateLogResponse,
};
use crate::proposer::Proposer;
use crate::replica::ReplicaContext;

/// Starts the sync, commit, update-log and Paxos loops plus the title sweeper.
pub fn spawn_all(ctx: &Arc<ReplicaContext>) -> Result<Vec<JoinHandle<()>>> {
    let loops: [(&str, fn(Arc<ReplicaContext>)); 5] = [
        ("sync", run_sync_loop),
        ("commit", run_commit_loop),
        ("update-log", run_update_log_loop),
        ("paxos", |ctx| {
            let mut learner = VotingLearner;
            run_paxos_loop(&ctx, &mut learner, None);
        }),
        ("sweeper", run_title_sweeper),
    ];

    let mut handles = Vec::with_capacity(loops.len());
    for (name, body) in loops {
        let ctx = Arc::clone(ctx);
        let handle = thread::Builder::new()
            .name(format!("{name}-{}", ctx.id))
            .spawn(move || body(ctx))
            .with_context(|| format!("failed to spawn {name} loop"))?;
        handles.push(handle);
    }
    Ok(handles)
}

/// Polls `title` until shutdown, handing each decoded message to `handle`.
fn serve<T, F>(ctx: &ReplicaContext, title: &str, mut handle: F)
where
    T: DeserializeOwned,
    F: FnMut(T, Envelope),
{
    while !ctx.is_closing() {
        match ctx.bus.receive_message::<T>(title, ctx.timeouts.poll) {
            Received::Message(message, envelope) => handle(message, envelope),
            Received::Malformed(envelope) => {
                warn!(replica = ctx.id, title, from = ?envelope.reply_addr(), "discarded malformed message");
            }
            Received::TimedOut => {}
        }
    }
    debug!(replica = ctx.id, title, "loop stopped");
}

fn run_sync_loop(ctx: Arc<ReplicaContext>) {
    serve(&ctx, SYNC_TITLE, |request: SyncRequest, envelope| {
        let commits = ctx.store.commits_after(request.base_commit);
        info!(
            replica = ctx.id,
            base = request.base_commit,
            returned = commits.len(),
            "served sync request"
        );
        ctx.reply(&envelope, &request.response_title, &SyncResponse { commits });
    });
}

fn run_update_log_loop(ctx: Arc<ReplicaContext>) {
    serve(&ctx, UPDATE_LOG_TITLE, |request: UpdateLogRequest, envelope| {
        let commits = ctx.store.commits_after(request.base_commit);
        debug!(
            replica = ctx.id,
            base = request.base_commit,
            returned = commits.len(),
            "served update-log request"
        );
        ctx.reply(&envelope, &request.response_title, &UpdateLogResponse { commits });
    });
}

/// Runs each commit request's proposer on its own thread so that concurrent
/// requests overlap their network rounds.
fn run_commit_loop(ctx: Arc<ReplicaContext>) {
    serve(&ctx, COMMIT_TITLE, |request: CommitRequest, envelope| {
        info!(
            replica = ctx.id,
            slot = request.proposed_commit.commit_id,
            base = request.base_commit,
            "received commit request"
        );
        let proposer_ctx = Arc::clone(&ctx);
        let spawned = thread::Builder::new()
            .name(format!("proposer-{}", ctx.id))
            .spawn(move || {
                let outcome = Proposer::new(&proposer_ctx).propose(&request.proposed_commit);
                info!(
                    replica = proposer_ctx.id,
                    slot = request.proposed_commit.commit_id,
                    %outcome,
                    "commit request finished"
                );
                proposer_ctx.reply(&envelope, &request.response_title, &outcome.into_response());
            });
        if let Err(err) = spawned {
            warn!(replica = ctx.id, error = %err, "failed to spawn proposer");
        }
    });
}

/// Feeds Paxos traffic to the acceptor (if the learner votes) and the learner.
///
/// Runs until shutdown, until `deadline`, or until the learner reports its
/// round complete. Returns whether the round completed.
pub fn run_paxos_loop(ctx: &Arc<ReplicaContext>, learner: &mut dyn Learner, deadline: Option<Instant>) -> bool {
    let acceptor = Acceptor::new(ctx.id);
    while !ctx.is_closing() {
        if learner.round_complete() {
            return true;
        }
        let mut wait = ctx.timeouts.poll;
        if let Some(deadline) = deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            wait = wait.min(remaining);
        }

        let (message, envelope) = match ctx.bus.receive_message::<PaxosMessage>(PAXOS_TITLE, wait) {
            Received::Message(message, envelope) => (message, envelope),
            Received::Malformed(envelope) => {
                warn!(replica = ctx.id, from = ?envelope.reply_addr(), "discarded malformed paxos message");
                continue;
            }
            Received::TimedOut => continue,
        };

        trace!(
            replica = ctx.id,
            kind = message.kind(),
            proposal = message.proposal(),
            "paxos message"
        );
        if learner.votes() {
            let response = acceptor.handle(&mut ctx.store.lock().ballot, &message);
            match response {
                Some(AcceptorResponse::Reply {
                    response_title,
                    message,
                }) => ctx.reply(&envelope, &response_title, &message),
                Some(AcceptorResponse::Gossip(message)) => ctx.broadcast(PAXOS_TITLE, &message),
                None => {}
            }
        }

        match learner.learn(&ctx.store, &ctx.topology, &message) {
            Decision::Ahead { commit_id, next_id } => {
                warn!(replica = ctx.id, commit_id, next_id, "decision beyond local log, repairing");
                catchup::repair_in_background(ctx, commit_id);
            }
            Decision::Learned {
                commit_id,
                appended: true,
            } => info!(replica = ctx.id, commit_id, "appended decided commit"),
            _ => {}
        }
    }
    learner.round_complete()
}

/// Periodically drops reply titles nobody collected.
fn run_title_sweeper(ctx: Arc<ReplicaContext>) {
    let mut last_sweep = Instant::now();
    while !ctx.is_closing() {
        thread::sleep(ctx.timeouts.poll);
        if last_sweep.elapsed() < ctx.timeouts.title_grace {
            continue;
        }
        let evicted = ctx.bus.evict_idle(ctx.timeouts.title_grace);
        if evicted > 0 {
            debug!(replica = ctx.id, evicted, "swept idle titles");
        }
        last_sweep = Instant::now();
    }
}
