//! Ranks as separate processes: the test binary re-executes itself once per
//! child rank.

mod common;

use common::{kmer, record, unique_job};
use kmerdht_core::{force_destroy, KmerHashMap, ShmRendezvous};
use std::process::{Child, Command};

const CHILD_ENV: &str = "KMERDHT_CHILD";
const PER_RANK: u64 = 64;
/// Inserts of one shared key made by every rank.
const SAME_KEY_PER_RANK: usize = 20;
const SHARED_SEED: u64 = 1 << 20;

fn run_rank(job: &str, rank: usize, ranks: usize, capacity: usize) {
    let comm = ShmRendezvous::join(job, rank, ranks).unwrap();
    let table = KmerHashMap::new(comm, job, capacity).unwrap();
    let me = rank as u64;
    for i in 0..PER_RANK {
        assert!(table.insert(&record(me * PER_RANK + i)));
    }
    let shared = record(SHARED_SEED);
    for _ in 0..SAME_KEY_PER_RANK {
        assert!(table.insert(&shared));
    }
    table.barrier().unwrap();
    let holding = (0..capacity)
        .filter(|&i| table.record_handle(i).read() == Some(shared))
        .count();
    assert_eq!(holding, ranks * SAME_KEY_PER_RANK, "rank {rank}");
    assert_eq!(table.find(shared.key()), Some(shared));
    for seed in 0..ranks as u64 * PER_RANK {
        assert_eq!(table.find(&kmer(seed)), Some(record(seed)), "rank {rank} seed {seed}");
    }
    assert_eq!(table.find(&kmer(1 << 30)), None);
    table.teardown().unwrap();
}

fn spawn_rank(job: &str, rank: usize, ranks: usize, capacity: usize) -> Child {
    Command::new(std::env::current_exe().unwrap())
        .args(["child_rank_entry", "--exact", "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, format!("{job}:{rank}:{ranks}:{capacity}"))
        .spawn()
        .unwrap()
}

/// Entry point for child ranks; does nothing in a normal test run.
#[test]
fn child_rank_entry() {
    let Ok(args) = std::env::var(CHILD_ENV) else {
        return;
    };
    let parts: Vec<&str> = args.split(':').collect();
    let [job, rank, ranks, capacity] = parts[..] else {
        panic!("malformed {CHILD_ENV}: {args}");
    };
    run_rank(
        job,
        rank.parse().unwrap(),
        ranks.parse().unwrap(),
        capacity.parse().unwrap(),
    );
}

#[test]
fn three_processes_share_one_table() {
    let job = unique_job("xproc");
    let (ranks, capacity) = (3, 1_000);
    let children: Vec<Child> = (1..ranks)
        .map(|r| spawn_rank(&job, r, ranks, capacity))
        .collect();
    run_rank(&job, 0, ranks, capacity);
    for mut child in children {
        assert!(child.wait().unwrap().success());
    }
    force_destroy(&job, ranks).unwrap();
}
