//! End-to-end jobs over the real control plane: coordinator and workers in
//! one process, talking tarpc over loopback, shuffling through a temp
//! working directory.

use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

use minimr::mr::coordinator::{
    Assignment, Coordinator, CoordinatorOptions, MapReduceClient, TaskKind,
};
use minimr::mr::function::wc;
use minimr::mr::worker::run_worker;
use serial_test::serial;
use tarpc::tokio_serde::formats::Json;
use tarpc::{client, context};
use tempfile::TempDir;
use tokio::time::sleep;

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

async fn connect(addr: SocketAddr) -> MapReduceClient {
    let transport = tarpc::serde_transport::tcp::connect(addr, Json::default)
        .await
        .expect("connecting to coordinator");
    MapReduceClient::new(client::Config::default(), transport).spawn()
}

/// Switch into a fresh scratch directory for one job. The guard must stay
/// alive for the whole test.
fn job_dir() -> TempDir {
    let dir = tempfile::tempdir().expect("creating scratch dir");
    std::env::set_current_dir(dir.path()).expect("entering scratch dir");
    dir
}

async fn wait_for_done(coordinator: &Coordinator) {
    tokio::time::timeout(Duration::from_secs(20), async {
        while !coordinator.done() {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("job did not finish in time");
}

/// What a single-process word count over `texts` would produce.
fn naive_counts(texts: &[&str]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for text in texts {
        let words = text
            .split(|c: char| !c.is_ascii_alphabetic())
            .filter(|word| !word.is_empty());
        for word in words {
            *counts.entry(word.to_string()).or_insert(0) += 1;
        }
    }
    counts
}

/// Merge all `mr-out-*` files, checking each is sorted by key on the way.
fn read_outputs(n_reduce: usize) -> BTreeMap<String, usize> {
    let mut merged = BTreeMap::new();
    for partition in 0..n_reduce {
        let text = fs::read_to_string(format!("mr-out-{partition}"))
            .unwrap_or_else(|_| panic!("mr-out-{partition} missing"));
        let mut previous = String::new();
        for line in text.lines() {
            let (word, count) = line.split_once(' ').expect("malformed output line");
            assert!(previous.as_str() < word, "keys must ascend within a partition");
            previous = word.to_string();
            let clashed = merged.insert(word.to_string(), count.parse::<usize>().unwrap());
            assert!(clashed.is_none(), "key {word} appeared in two partitions");
        }
    }
    merged
}

#[tokio::test]
#[serial]
async fn single_worker_counts_two_files() {
    let _dir = job_dir();
    let texts = [
        "It was the best of times, it was the worst of times.",
        "The quick brown fox -- the quick brown fox! jumps.",
    ];
    fs::write("pg-0.txt", texts[0]).unwrap();
    fs::write("pg-1.txt", texts[1]).unwrap();

    let coordinator = Coordinator::new(vec!["pg-0.txt".into(), "pg-1.txt".into()], 2);
    let addr = coordinator.start(loopback()).await.unwrap();

    let worker = tokio::spawn(run_worker(connect(addr).await, 1, wc::map, wc::reduce));
    wait_for_done(&coordinator).await;
    worker.await.unwrap().unwrap();

    assert_eq!(read_outputs(2), naive_counts(&texts));
}

#[tokio::test]
#[serial]
async fn two_workers_share_a_job() {
    let _dir = job_dir();
    let mut files = Vec::new();
    let mut texts = Vec::new();
    for i in 0..4 {
        let file = format!("pg-{i}.txt");
        let text = format!("alpha beta gamma delta file{i} alpha beta");
        fs::write(&file, &text).unwrap();
        files.push(file);
        texts.push(text);
    }

    let coordinator = Coordinator::new(files, 3);
    let addr = coordinator.start(loopback()).await.unwrap();

    let a = tokio::spawn(run_worker(connect(addr).await, 1, wc::map, wc::reduce));
    let b = tokio::spawn(run_worker(connect(addr).await, 2, wc::map, wc::reduce));
    wait_for_done(&coordinator).await;
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    let texts: Vec<&str> = texts.iter().map(String::as_str).collect();
    assert_eq!(read_outputs(3), naive_counts(&texts));
}

#[tokio::test]
#[serial]
async fn stalled_worker_is_reclaimed_and_its_late_submit_ignored() {
    let _dir = job_dir();
    let text = "to be or not to be";
    fs::write("pg-0.txt", text).unwrap();

    let options = CoordinatorOptions {
        task_timeout: Duration::from_millis(300),
        ..CoordinatorOptions::default()
    };
    let coordinator = Coordinator::with_options(vec!["pg-0.txt".into()], 1, options);
    let addr = coordinator.start(loopback()).await.unwrap();

    // worker 101 claims the map task and then goes silent
    let stalled = connect(addr).await;
    stalled.get_reduce_count(context::current(), 101).await.unwrap();
    let held = stalled.get_task(context::current(), 101).await.unwrap();
    assert!(matches!(held, Assignment::Map { id: 0, .. }));

    // a healthy worker arrives; the watchdog hands the task over to it
    let healthy = tokio::spawn(run_worker(connect(addr).await, 102, wc::map, wc::reduce));
    wait_for_done(&coordinator).await;
    healthy.await.unwrap().unwrap();

    let before = read_outputs(1);
    assert_eq!(before, naive_counts(&[text]));

    // the stalled worker finally reports in; nothing may change
    stalled
        .submit_task(context::current(), 101, 0, TaskKind::Map)
        .await
        .unwrap();
    assert!(coordinator.done());
    assert_eq!(read_outputs(1), before);
}

#[tokio::test]
#[serial]
async fn reduce_only_job_produces_empty_outputs() {
    let _dir = job_dir();

    let coordinator = Coordinator::new(Vec::new(), 3);
    let addr = coordinator.start(loopback()).await.unwrap();

    let worker = tokio::spawn(run_worker(connect(addr).await, 1, wc::map, wc::reduce));
    wait_for_done(&coordinator).await;
    worker.await.unwrap().unwrap();

    for partition in 0..3 {
        let out = fs::read_to_string(format!("mr-out-{partition}")).unwrap();
        assert_eq!(out, "", "partition {partition} should be empty");
    }
}

#[tokio::test]
#[serial]
async fn fail_fast_job_ends_after_three_timeouts() {
    let _dir = job_dir();
    fs::write("pg-0.txt", "abandoned words").unwrap();

    let options = CoordinatorOptions {
        task_timeout: Duration::from_millis(100),
        fail_fast: true,
        ..CoordinatorOptions::default()
    };
    let coordinator = Coordinator::with_options(vec!["pg-0.txt".into()], 1, options);
    let addr = coordinator.start(loopback()).await.unwrap();

    // workers that claim tasks and vanish without ever submitting
    let client = connect(addr).await;
    client.get_reduce_count(context::current(), 1).await.unwrap();
    for _ in 0..3 {
        loop {
            match client.get_task(context::current(), 1).await.unwrap() {
                Assignment::Map { .. } => break,
                Assignment::Idle => sleep(Duration::from_millis(20)).await,
                other => panic!("unexpected assignment {other:?}"),
            }
        }
    }

    wait_for_done(&coordinator).await;
    assert_eq!(
        client.get_task(context::current(), 1).await.unwrap(),
        Assignment::Exit
    );
}
