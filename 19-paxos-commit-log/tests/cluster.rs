//! End-to-end tests for commits and syncs against running clusters.

mod common;

use std::thread;
use std::time::Duration;

use anyhow::Result;
use common::{TestCluster, commit_by, test_timeouts};
use paxos_commit_log::config::Timeouts;

#[test]
fn commit_is_replicated_and_synced() -> Result<()> {
    let cluster = TestCluster::spawn(3)?;
    let client = cluster.client()?;

    let commit = commit_by(1, "alice");
    let response = client.commit(0, &commit)?;
    assert!(response.accepted, "commit refused: {}", response.comment);
    assert_eq!(response.comment, "");

    cluster.wait_for_tail(1, Duration::from_secs(5))?;
    for id in 0..cluster.len() {
        let synced = client
            .sync_via(&cluster.address(id), 0)
            .expect("replica answers sync");
        assert_eq!(synced, vec![commit.clone()], "replica {id} disagrees");
    }

    cluster.shutdown();
    Ok(())
}

#[test]
fn sync_returns_only_commits_after_base() -> Result<()> {
    let cluster = TestCluster::spawn(3)?;
    let client = cluster.client()?;

    let mut committed = Vec::new();
    for slot in 1..=4 {
        let commit = commit_by(slot, "bob");
        assert!(client.commit(slot - 1, &commit)?.accepted);
        cluster.wait_for_tail(slot, Duration::from_secs(5))?;
        committed.push(commit);
    }

    assert_eq!(client.sync(0)?, committed);
    assert_eq!(client.sync(2)?, committed[2..].to_vec());
    assert!(client.sync(4)?.is_empty());
    assert!(client.sync(40)?.is_empty());

    cluster.shutdown();
    Ok(())
}

#[test]
fn conflicting_commit_is_told_to_sync() -> Result<()> {
    let cluster = TestCluster::spawn(3)?;
    let client = cluster.client()?;

    let first = commit_by(1, "alice");
    assert!(client.commit(0, &first)?.accepted);
    cluster.wait_for_tail(1, Duration::from_secs(5))?;

    let late = commit_by(1, "carol");
    let response = client.commit(0, &late)?;
    assert!(!response.accepted);
    assert_eq!(response.comment, "Please sync");

    // A client retrying the exact commit that won is told it was accepted.
    let retry = client.commit(0, &first)?;
    assert!(retry.accepted);

    let genesis = client.commit(0, &commit_by(0, "mallory"))?;
    assert!(!genesis.accepted);
    assert_eq!(genesis.comment, "invalid commit id");

    assert_eq!(cluster.tails(), vec![Some(1); 3]);
    cluster.shutdown();
    Ok(())
}

#[test]
fn concurrent_rounds_have_exactly_one_winner() -> Result<()> {
    const REPLICAS: usize = 5;
    const ROUNDS: u64 = 10;

    let cluster = TestCluster::spawn(REPLICAS)?;
    let addresses = cluster.addresses();

    for slot in 1..=ROUNDS {
        let accepted = thread::scope(|scope| -> Result<usize> {
            let mut workers = Vec::new();
            for (i, server) in addresses.iter().enumerate() {
                let client = cluster.client()?;
                workers.push(scope.spawn(move || {
                    let commit = commit_by(slot, &format!("client-{i}"));
                    client.commit_via(server, slot - 1, &commit)
                }));
            }
            let mut accepted = 0;
            for worker in workers {
                let response = worker
                    .join()
                    .expect("client thread panicked")
                    .expect("replica answered commit request");
                if response.accepted {
                    accepted += 1;
                }
            }
            Ok(accepted)
        })?;
        assert_eq!(accepted, 1, "round {slot} had {accepted} winners");
        cluster.wait_for_tail(slot, Duration::from_secs(10))?;
    }

    let reference = cluster.replica(0).entries();
    assert_eq!(reference.len() as u64, ROUNDS + 1);
    for id in 1..REPLICAS {
        assert_eq!(cluster.replica(id).entries(), reference, "replica {id} diverged");
    }

    cluster.shutdown();
    Ok(())
}

#[test]
fn minority_failure_keeps_cluster_live() -> Result<()> {
    let mut cluster = TestCluster::spawn(5)?;
    cluster.stop(3);
    cluster.stop(4);

    let client = cluster.client_for(cluster.addresses()[..3].to_vec())?;
    for slot in 1..=3 {
        let response = client.commit(slot - 1, &commit_by(slot, "dave"))?;
        assert!(response.accepted, "slot {slot} refused: {}", response.comment);
    }
    cluster.wait_for_tail(3, Duration::from_secs(5))?;

    cluster.shutdown();
    Ok(())
}

#[test]
fn majority_failure_times_out_prepare() -> Result<()> {
    let timeouts = Timeouts {
        prepare: Duration::from_millis(500),
        ..test_timeouts()
    };
    let mut cluster = TestCluster::spawn_with(3, timeouts, false)?;
    cluster.stop(1);
    cluster.stop(2);

    let client = cluster.client()?;
    let response = client
        .commit_via(&cluster.address(0), 0, &commit_by(1, "erin"))
        .expect("surviving replica answers");
    assert!(!response.accepted);
    assert_eq!(response.comment, "Paxos prepare timed out");
    assert_eq!(cluster.replica(0).tail_id(), 0);

    cluster.shutdown();
    Ok(())
}
