//! Replicated version-control commit log agreed through Paxos.
//!
//! A fixed set of replicas agree on one globally ordered log of commits.
//! Clients do two things: fetch every commit after the one they know
//! (`SyncRequest`), and propose the next commit (`CommitRequest`). A proposal
//! wins only if a majority of replicas accept it for that log position.
//!
//! # Architecture
//!
//! Every replica runs all three Paxos roles over one shared store:
//!
//! - **Proposer**: one thread per client commit request, runs prepare/accept
//! - **Acceptor**: answers Prepare and AcceptRequest, gossips its verdicts
//! - **Learner**: tallies gossiped verdicts and appends decided commits
//!
//! All traffic rides on a [`bus::MessageBus`]: fire-and-forget sends plus
//! blocking receives keyed by title. Request/response is built from that by
//! sending a fresh response title with each request.
//!
//! The store keeps the log, the ballot counters and the vote tallies behind one
//! mutex, with a condition variable that proposers sleep on until the learner
//! settles their proposal.
//!
//! # Modules
//!
//! - [`bus`]: title-routed message bus over TCP
//! - [`message`]: envelopes, request shapes, Paxos messages, framing
//! - [`commit`], [`log`], [`storage`]: the decided log and its persistence
//! - [`ballot`], [`store`]: proposal numbering, vote tallies, shared state
//! - [`acceptor`], [`learner`], [`proposer`]: the Paxos roles
//! - [`handlers`], [`catchup`], [`replica`]: loops, catch-up and lifecycle
//! - [`client`], [`console`], [`config`], [`topology`]: the outer surface

pub mod acceptor;
pub mod ballot;
pub mod bus;
pub mod catchup;
pub mod client;
pub mod commit;
pub mod config;
pub mod console;
pub mod handlers;
pub mod learner;
pub mod log;
pub mod message;
pub mod proposer;
pub mod replica;
pub mod storage;
pub mod store;
pub mod topology;
