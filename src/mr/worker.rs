//! Worker side: a stateless loop that polls the coordinator for a task,
//! executes it against the shared filesystem and reports back. Nothing here
//! survives across tasks; a crashed worker is indistinguishable from a slow
//! one and is handled entirely by the coordinator's watchdog.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::time::Duration;

use anyhow::Context as _;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tarpc::context;
use tracing::{debug, info, warn};

use crate::mr::coordinator::{Assignment, MapReduceClient, TaskKind};
use crate::mr::shuffle;

/// Delay between polls when the coordinator has nothing for us, and after a
/// failed execution. Well under the coordinator's reclamation timeout so a
/// reclaimed task is picked up quickly.
const POLL_INTERVAL: Duration = Duration::from_millis(150);

/// One record of intermediate data, as emitted by map and consumed by
/// reduce. Serialized as one self-describing JSON object per record so
/// partition files can be decoded as a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// User map function: `(input path, contents)` to emitted records.
pub type MapFn = fn(&str, &str) -> Vec<KeyValue>;
/// User reduce function: key and all its values to one output value.
pub type ReduceFn = fn(&str, &[String]) -> String;

/// 32-bit FNV-1a with the sign bit masked off, so `key_hash(k) % r` is a
/// stable partition for any reduce fan-out.
pub fn key_hash(key: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in key.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(16777619);
    }
    hash & 0x7fffffff
}

/// Drives one worker against an already-connected coordinator client until
/// the job is over. `worker_id` must be unique among live workers; the
/// `mrworker` binary passes its pid.
pub async fn run_worker(
    client: MapReduceClient,
    worker_id: i32,
    mapf: MapFn,
    reducef: ReduceFn,
) -> anyhow::Result<()> {
    let n_reduce = client
        .get_reduce_count(context::current(), worker_id)
        .await
        .context("cannot obtain reduce count from coordinator")?;
    info!(worker = worker_id, n_reduce, "worker registered");

    loop {
        match client.get_task(context::current(), worker_id).await? {
            Assignment::Map { id, file } => {
                match exec_map(mapf, &file, id, n_reduce, worker_id) {
                    Ok(()) => {
                        client
                            .submit_task(context::current(), worker_id, id as i64, TaskKind::Map)
                            .await?;
                    }
                    Err(err) => {
                        // leave the task unsubmitted; the watchdog will
                        // reschedule it, possibly to someone else
                        warn!(worker = worker_id, task = id, "map task failed: {err:#}");
                        tokio::time::sleep(POLL_INTERVAL).await;
                    }
                }
            }
            Assignment::Reduce { id } => match exec_reduce(reducef, id, worker_id) {
                Ok(()) => {
                    client
                        .submit_task(context::current(), worker_id, id as i64, TaskKind::Reduce)
                        .await?;
                }
                Err(err) => {
                    warn!(worker = worker_id, task = id, "reduce task failed: {err:#}");
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            },
            Assignment::Idle => tokio::time::sleep(POLL_INTERVAL).await,
            Assignment::Exit => {
                info!(worker = worker_id, "no more work, exiting");
                return Ok(());
            }
        }
    }
}

/// Map execution: read the split, run the user function, scatter the
/// records across `n_reduce` partition files, then publish them all.
pub fn exec_map(
    mapf: MapFn,
    input: &str,
    map_id: usize,
    n_reduce: usize,
    worker_id: i32,
) -> anyhow::Result<()> {
    let contents =
        fs::read_to_string(input).with_context(|| format!("reading map input {input}"))?;
    let records = mapf(input, &contents);
    debug!(task = map_id, records = records.len(), "map function done");

    let mut outputs = Vec::with_capacity(n_reduce);
    for partition in 0..n_reduce {
        let path = shuffle::map_output_temp(map_id, partition, worker_id);
        let file =
            File::create(&path).with_context(|| format!("creating {}", path.display()))?;
        outputs.push(BufWriter::new(file));
    }

    if n_reduce > 0 {
        for kv in &records {
            let partition = key_hash(&kv.key) as usize % n_reduce;
            serde_json::to_writer(&mut outputs[partition], kv)?;
            outputs[partition].write_all(b"\n")?;
        }
    }

    for output in &mut outputs {
        output.flush()?;
    }
    drop(outputs);

    // publication point: rename everything at once, after the whole task
    // succeeded, so readers never see a partial partition
    for partition in 0..n_reduce {
        shuffle::publish(
            &shuffle::map_output_temp(map_id, partition, worker_id),
            &shuffle::map_output(map_id, partition),
        )
        .with_context(|| format!("publishing map output {map_id}-{partition}"))?;
    }
    Ok(())
}

/// Reduce execution: merge every published record of this partition, reduce
/// key by key in sorted order, publish the output file.
pub fn exec_reduce(reducef: ReduceFn, reduce_id: usize, worker_id: i32) -> anyhow::Result<()> {
    let mut grouped: HashMap<String, Vec<String>> = HashMap::new();
    for path in shuffle::published_map_outputs(reduce_id)? {
        let file = File::open(&path).with_context(|| format!("opening {}", path.display()))?;
        let records = serde_json::Deserializer::from_reader(BufReader::new(file))
            .into_iter::<KeyValue>();
        for record in records {
            let kv = record.with_context(|| format!("decoding {}", path.display()))?;
            grouped.entry(kv.key).or_default().push(kv.value);
        }
    }

    let mut keys: Vec<&String> = grouped.keys().collect();
    keys.par_sort_unstable();

    let temp = shuffle::reduce_output_temp(reduce_id, worker_id);
    let file = File::create(&temp).with_context(|| format!("creating {}", temp.display()))?;
    let mut out = BufWriter::new(file);
    for key in keys {
        let value = reducef(key, &grouped[key]);
        writeln!(out, "{key} {value}")?;
    }
    out.flush()?;
    drop(out);

    shuffle::publish(&temp, &shuffle::reduce_output(reduce_id))
        .with_context(|| format!("publishing reduce output {reduce_id}"))?;
    Ok(())
}
