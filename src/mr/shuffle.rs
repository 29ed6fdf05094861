//! On-disk rendezvous between map producers and reduce consumers.
//!
//! Intermediate data is addressed by `(map task, reduce partition)`. A map
//! worker writes partition `p` of map task `m` to the worker-private name
//! `tmp/mr-<m>-<p>-<workerId>` and renames it to the canonical
//! `tmp/mr-<m>-<p>` once the whole task succeeded. The rename is the
//! publication point: a reducer scanning the shuffle directory either sees a
//! complete file or none at all. Reduce outputs follow the same discipline,
//! landing as `mr-out-<p>` in the job's working directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;

/// Directory holding intermediate files, relative to the job's working
/// directory. Recreated empty on coordinator startup.
pub const SHUFFLE_DIR: &str = "tmp";

/// Canonical name of a published map output partition.
pub fn map_output(map_id: usize, partition: usize) -> PathBuf {
    PathBuf::from(format!("{SHUFFLE_DIR}/mr-{map_id}-{partition}"))
}

/// Worker-private name a map output is written under before publication.
pub fn map_output_temp(map_id: usize, partition: usize, worker_id: i32) -> PathBuf {
    PathBuf::from(format!("{SHUFFLE_DIR}/mr-{map_id}-{partition}-{worker_id}"))
}

/// Final reduce output, in the job's working directory.
pub fn reduce_output(partition: usize) -> PathBuf {
    PathBuf::from(format!("mr-out-{partition}"))
}

/// Worker-private name a reduce output is written under before publication.
pub fn reduce_output_temp(partition: usize, worker_id: i32) -> PathBuf {
    PathBuf::from(format!("{SHUFFLE_DIR}/mr-out-{partition}-{worker_id}"))
}

/// Atomically move a finished file to its canonical name.
///
/// Duplicate executions of the same task may publish twice; the second
/// rename overwrites the first, which is safe as long as the user functions
/// are deterministic.
pub fn publish(temp: &Path, target: &Path) -> io::Result<()> {
    fs::rename(temp, target)
}

/// All published map outputs for one reduce partition, in map-index order.
///
/// The glob alone is not enough: with single-digit worker ids a still-private
/// `mr-<m>-<p>-<w>` could match `mr-*-<p>`, so every candidate is re-checked
/// against the exact canonical shape.
pub fn published_map_outputs(partition: usize) -> anyhow::Result<Vec<PathBuf>> {
    let pattern = format!("{SHUFFLE_DIR}/mr-*-{partition}");
    let mut found = Vec::new();
    for entry in glob::glob(&pattern).context("bad shuffle glob pattern")? {
        let path = entry?;
        if parse_map_output(&path).map(|(_, p)| p) == Some(partition) {
            found.push(path);
        }
    }
    found.sort_by_key(|path| parse_map_output(path).map(|(m, _)| m));
    Ok(found)
}

/// `tmp/mr-<m>-<p>` → `(m, p)`. Anything else, including worker-suffixed
/// temporaries, is `None`.
fn parse_map_output(path: &Path) -> Option<(usize, usize)> {
    let name = path.file_name()?.to_str()?;
    let rest = name.strip_prefix("mr-")?;
    let (map_id, partition) = rest.split_once('-')?;
    Some((map_id.parse().ok()?, partition.parse().ok()?))
}

/// Clear leftovers from a previous run and recreate the shuffle directory.
/// Called once, on coordinator startup, before any task is dispatched.
pub fn prepare_job_dir() -> anyhow::Result<()> {
    for entry in glob::glob("mr-out-*").context("bad output glob pattern")? {
        let path = entry?;
        fs::remove_file(&path)
            .with_context(|| format!("removing stale output {}", path.display()))?;
    }
    match fs::remove_dir_all(SHUFFLE_DIR) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).context("clearing shuffle directory"),
    }
    fs::create_dir(SHUFFLE_DIR).context("creating shuffle directory")?;
    Ok(())
}
