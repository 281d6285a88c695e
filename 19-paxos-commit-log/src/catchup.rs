//! Bringing a lagging replica's log up to date.
//!
//! A replica that starts with catch-up enabled runs, before serving:
//!
//! 1. [`pull_log`] from its peers
//! 2. the Paxos loop with an [`ObserverLearner`] for one decided round
//! 3. [`pull_log`] again, covering whatever was decided meanwhile
//! 4. truncates the log to its gap-free prefix, dropping an observed decision
//!    whose gap the pull did not fill, and verifies the result
//!
//! Pulls always ask for the commits after the gap-free prefix, so a decision
//! observed past a gap never moves the request base. Each step is best
//! effort: a replica that cannot reach anyone still starts.
//!
//! A running voting replica that learns a decision past its next free slot
//! calls [`repair_in_background`], which pulls until the gap is closed.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::bus::Received;
use crate::commit::{Commit, CommitId};
use crate::handlers;
use crate::learner::ObserverLearner;
use crate::log::LogError;
use crate::message::{UPDATE_LOG_TITLE, UpdateLogRequest, UpdateLogResponse, fresh_title};
use crate::replica::ReplicaContext;

const REPAIR_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatchUpError {
    #[error("no usable update-log reply from {peers} peers within {waited:?}")]
    NoUsableReply { peers: usize, waited: Duration },
}

/// Why an update-log reply cannot be merged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplyProblem {
    #[error("reply starts at commit {first}, beyond local tail {tail} + 1")]
    Detached { first: CommitId, tail: CommitId },
    #[error("reply contains the genesis commit")]
    Genesis,
    #[error("reply ids are not dense: {previous} followed by {next}")]
    NotDense { previous: CommitId, next: CommitId },
}

/// Checks that `commits` is a dense run starting no later than `tail + 1`.
pub fn validate_reply(tail: CommitId, commits: &[Commit]) -> Result<(), ReplyProblem> {
    let Some(first) = commits.first() else {
        return Ok(());
    };
    if first.commit_id == 0 {
        return Err(ReplyProblem::Genesis);
    }
    if first.commit_id > tail + 1 {
        return Err(ReplyProblem::Detached {
            first: first.commit_id,
            tail,
        });
    }
    for pair in commits.windows(2) {
        if pair[1].commit_id != pair[0].commit_id + 1 {
            return Err(ReplyProblem::NotDense {
                previous: pair[0].commit_id,
                next: pair[1].commit_id,
            });
        }
    }
    Ok(())
}

/// Asks every peer for the commits after the local gap-free prefix and merges
/// the first usable non-empty reply. Returns how many entries changed.
///
/// Peers that have nothing newer answer with an empty list; if every answer
/// is empty the log is already current and nothing is merged.
pub fn pull_log(ctx: &ReplicaContext) -> Result<usize, CatchUpError> {
    let peers: Vec<&str> = ctx.topology.peers_of(ctx.id).collect();
    if peers.is_empty() {
        return Ok(0);
    }

    let tail = ctx.store.lock().log.dense_tail();
    let title = fresh_title();
    let request = UpdateLogRequest {
        response_title: title.clone(),
        base_commit: tail,
    };
    for peer in &peers {
        ctx.bus.send_message(*peer, UPDATE_LOG_TITLE, &request);
    }

    let waited = ctx.timeouts.catch_up_reply;
    let deadline = Instant::now() + waited;
    let mut empty_replies = 0;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let (reply, envelope) = match ctx.bus.receive_message::<UpdateLogResponse>(&title, remaining) {
            Received::Message(reply, envelope) => (reply, envelope),
            Received::Malformed(envelope) => {
                warn!(replica = ctx.id, from = ?envelope.reply_addr(), "discarded malformed update-log reply");
                continue;
            }
            Received::TimedOut => break,
        };

        if reply.commits.is_empty() {
            empty_replies += 1;
            if empty_replies == peers.len() {
                debug!(replica = ctx.id, tail, "every peer is at or behind local tail");
                return Ok(0);
            }
            continue;
        }

        let mut state = ctx.store.lock();
        if let Err(problem) = validate_reply(state.log.dense_tail(), &reply.commits) {
            warn!(replica = ctx.id, from = ?envelope.reply_addr(), %problem, "ignoring update-log reply");
            continue;
        }
        let received = reply.commits.len();
        let changed = state.log.merge(reply.commits);
        if changed > 0 {
            ctx.store.persist(&state.log);
        }
        let new_tail = state.log.tail_id();
        drop(state);
        ctx.store.notify_decided();
        info!(replica = ctx.id, received, changed, tail = new_tail, "merged peer log");
        return Ok(changed);
    }

    if empty_replies > 0 {
        return Ok(0);
    }
    Err(CatchUpError::NoUsableReply {
        peers: peers.len(),
        waited,
    })
}

/// Runs the startup catch-up sequence.
///
/// Unreachable peers are only logged. The one error is a log that still
/// fails its consistency check after truncation, which must not be served.
pub fn catch_up(ctx: &Arc<ReplicaContext>) -> Result<(), LogError> {
    info!(replica = ctx.id, tail = ctx.store.tail_id(), "catching up");

    if let Err(err) = pull_log(ctx) {
        warn!(replica = ctx.id, error = %err, "first log pull failed");
    }

    let mut observer = ObserverLearner::default();
    let deadline = Instant::now() + ctx.timeouts.observe;
    if !handlers::run_paxos_loop(ctx, &mut observer, Some(deadline)) {
        warn!(replica = ctx.id, "no decision observed while catching up");
    }

    if let Err(err) = pull_log(ctx) {
        warn!(replica = ctx.id, error = %err, "second log pull failed");
    }

    let mut state = ctx.store.lock();
    let dropped = state.log.truncate_to_dense_prefix();
    if !dropped.is_empty() {
        let ids: Vec<CommitId> = dropped.iter().map(|commit| commit.commit_id).collect();
        warn!(replica = ctx.id, ?ids, "dropped entries past a gap");
        ctx.store.persist(&state.log);
    }
    state.log.verify()?;
    info!(replica = ctx.id, tail = state.log.tail_id(), "catch-up finished");
    Ok(())
}

/// Pulls missing history on a background thread, at most one at a time.
///
/// Peers may not have appended `target` yet when the first pull reaches
/// them, so the pull is repeated a few times until the local tail covers it.
pub fn repair_in_background(ctx: &Arc<ReplicaContext>, target: CommitId) {
    if !ctx.begin_repair() {
        return;
    }
    let repair_ctx = Arc::clone(ctx);
    let spawned = thread::Builder::new()
        .name(format!("lag-repair-{}", ctx.id))
        .spawn(move || {
            repair_until(&repair_ctx, target);
            repair_ctx.end_repair();
        });
    if let Err(err) = spawned {
        warn!(replica = ctx.id, error = %err, "failed to spawn lag repair");
        ctx.end_repair();
    }
}

fn repair_until(ctx: &ReplicaContext, target: CommitId) {
    for attempt in 1..=REPAIR_ATTEMPTS {
        if ctx.is_closing() {
            return;
        }
        if let Err(err) = pull_log(ctx) {
            warn!(replica = ctx.id, attempt, error = %err, "lag repair pull failed");
        }
        let tail = ctx.store.tail_id();
        if tail >= target {
            info!(replica = ctx.id, tail, "lag repair finished");
            return;
        }
        thread::sleep(ctx.timeouts.poll);
    }
    warn!(replica = ctx.id, target, tail = ctx.store.tail_id(), "lag repair gave up");
}
