//! Coordinator: task table, scheduler, failure detector and control plane.
//!
//! All job state lives behind a single mutex. The three RPC handlers and the
//! watchdog timers each take it for the full duration of their work; every
//! touch is O(M + R) and no I/O happens under the lock.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tarpc::context;
use tarpc::server::incoming::Incoming;
use tarpc::tokio_serde::formats::Json;
use tracing::{debug, error, info, warn};

use crate::mr::shuffle;

/// How long a dispatched task may stay unacknowledged before it is handed to
/// another worker.
pub const TASK_TIMEOUT: Duration = Duration::from_secs(10);

/// Reclamations tolerated before an opted-in coordinator abandons the job.
const FAIL_FAST_LIMIT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    Map,
    Reduce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Pending,
    Running,
    Done,
}

#[derive(Debug, Clone)]
struct Task {
    state: TaskState,
    /// Input path; empty for reduce tasks, whose inputs are derived from
    /// their index.
    file: String,
    /// Worker last given this task. Meaningful only while `Running`; kept
    /// untouched on timeout reverts so stale completions can be traced.
    assignee: i32,
}

impl Task {
    fn new(file: String) -> Self {
        Self { state: TaskState::Pending, file, assignee: -1 }
    }
}

/// What a worker gets back from `get_task`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Assignment {
    /// Run the user map function over `file`.
    Map { id: usize, file: String },
    /// Merge and reduce partition `id`.
    Reduce { id: usize },
    /// Nothing schedulable right now; poll again shortly.
    Idle,
    /// Job finished; terminate.
    Exit,
}

/// Derives a locality hint from a map input path, compared against a
/// worker's position in the registration order.
pub type LocalityFn = fn(&str) -> Option<String>;

/// Benchmark input convention: the character right after `pg-` names the
/// worker the file is local to.
pub fn pg_locality(path: &str) -> Option<String> {
    let at = path.find("pg-")? + 3;
    path[at..].chars().next().map(|c| c.to_string())
}

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorOptions {
    pub task_timeout: Duration,
    /// Testing hook: give up on the whole job after three reclamations
    /// instead of retrying forever.
    pub fail_fast: bool,
    pub locality: LocalityFn,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self { task_timeout: TASK_TIMEOUT, fail_fast: false, locality: pg_locality }
    }
}

#[derive(Debug)]
struct State {
    map_tasks: Vec<Task>,
    reduce_tasks: Vec<Task>,
    /// Map tasks not yet `Done`. Kept as a counter so `done()` and the phase
    /// barrier don't rescan the table.
    map_pending: usize,
    reduce_pending: usize,
    fail_count: u32,
    /// Workers in registration order; a worker's position here is its
    /// locality. Append-only for the lifetime of the job.
    workers: Vec<i32>,
}

#[derive(Debug, Clone)]
pub struct Coordinator {
    state: Arc<Mutex<State>>,
    opts: CoordinatorOptions,
}

impl Coordinator {
    /// One map task per input file, `n_reduce` reduce tasks.
    pub fn new(files: Vec<String>, n_reduce: usize) -> Self {
        Self::with_options(files, n_reduce, CoordinatorOptions::default())
    }

    pub fn with_options(files: Vec<String>, n_reduce: usize, opts: CoordinatorOptions) -> Self {
        let map_tasks: Vec<Task> = files.into_iter().map(Task::new).collect();
        let reduce_tasks = vec![Task::new(String::new()); n_reduce];
        let state = State {
            map_pending: map_tasks.len(),
            reduce_pending: reduce_tasks.len(),
            map_tasks,
            reduce_tasks,
            fail_count: 0,
            workers: Vec::new(),
        };
        Self { state: Arc::new(Mutex::new(state)), opts }
    }

    /// Clears leftovers from any previous run and starts serving the control
    /// plane on `addr`. Returns the bound address (useful with port 0).
    pub async fn start(&self, addr: SocketAddr) -> anyhow::Result<SocketAddr> {
        shuffle::prepare_job_dir().context("preparing job directory")?;

        let listener = tarpc::serde_transport::tcp::listen(addr, Json::default)
            .await
            .with_context(|| format!("binding control plane on {addr}"))?;
        let local_addr = listener.local_addr();
        tokio::spawn(
            listener
                // Accept valid connections, drop anything else
                .filter_map(|conn| async { conn.ok() })
                .map(tarpc::server::BaseChannel::with_defaults)
                .execute(self.clone().serve()),
        );
        info!(addr = %local_addr, "control plane listening");
        Ok(local_addr)
    }

    /// True once every map and reduce task has completed. Polled by the
    /// driver; workers learn the same thing through `Assignment::Exit`.
    pub fn done(&self) -> bool {
        let st = self.state.lock().unwrap();
        st.map_pending == 0 && st.reduce_pending == 0
    }

    /// `get_reduce_count` body: registers the worker and returns R.
    fn register(&self, worker_id: i32) -> usize {
        let mut st = self.state.lock().unwrap();
        if !st.workers.contains(&worker_id) {
            st.workers.push(worker_id);
            info!(worker = worker_id, position = st.workers.len() - 1, "worker registered");
        }
        st.reduce_tasks.len()
    }

    /// `get_task` body: dispatch from the map table until the map phase is
    /// over, then from the reduce table, then tell workers to exit.
    fn assign(&self, worker_id: i32) -> Assignment {
        let assignment = {
            let mut st = self.state.lock().unwrap();
            if st.map_pending > 0 {
                match pick_map(&mut st, worker_id, self.opts.locality) {
                    Some(id) => Assignment::Map { id, file: st.map_tasks[id].file.clone() },
                    None => Assignment::Idle,
                }
            } else if st.reduce_pending > 0 {
                match pick_reduce(&mut st, worker_id) {
                    Some(id) => Assignment::Reduce { id },
                    None => Assignment::Idle,
                }
            } else {
                Assignment::Exit
            }
        };

        match &assignment {
            Assignment::Map { id, .. } => {
                debug!(worker = worker_id, task = id, "dispatched map task");
                self.watch(TaskKind::Map, *id);
            }
            Assignment::Reduce { id } => {
                debug!(worker = worker_id, task = id, "dispatched reduce task");
                self.watch(TaskKind::Reduce, *id);
            }
            Assignment::Idle | Assignment::Exit => {}
        }
        assignment
    }

    /// Fire-and-forget failure detector, one per dispatch. If the task is
    /// still `Running` when the timer fires it becomes schedulable again.
    /// Timers from earlier dispatches of the same task are left running;
    /// the state check at fire time makes them no-ops.
    fn watch(&self, kind: TaskKind, id: usize) {
        let state = Arc::clone(&self.state);
        let timeout = self.opts.task_timeout;
        let fail_fast = self.opts.fail_fast;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut st = state.lock().unwrap();
            let reverted = {
                let task = match kind {
                    TaskKind::Map => &mut st.map_tasks[id],
                    TaskKind::Reduce => &mut st.reduce_tasks[id],
                };
                if task.state == TaskState::Running {
                    task.state = TaskState::Pending;
                    Some(task.assignee)
                } else {
                    None
                }
            };
            if let Some(worker) = reverted {
                st.fail_count += 1;
                warn!(?kind, task = id, worker, "task timed out, rescheduling");
                if fail_fast && st.fail_count >= FAIL_FAST_LIMIT {
                    st.map_pending = 0;
                    st.reduce_pending = 0;
                    warn!(failures = st.fail_count, "giving up on job");
                }
            }
        });
    }

    /// `submit_task` body. Accepted only if the task is still `Running` under
    /// the submitting worker; completions from preempted workers fall through
    /// silently, which is the sole guard against double-counting.
    fn complete(&self, worker_id: i32, task_id: i64, kind: TaskKind) {
        let mut st = self.state.lock().unwrap();
        let accepted = {
            let tasks = match kind {
                TaskKind::Map => &mut st.map_tasks,
                TaskKind::Reduce => &mut st.reduce_tasks,
            };
            let task = match usize::try_from(task_id).ok().and_then(|id| tasks.get_mut(id)) {
                Some(task) => task,
                None => {
                    // Workers only ever echo ids we handed them; anything
                    // else is a programming error, not a runtime condition.
                    error!(task = task_id, ?kind, "malformed task submission");
                    std::process::exit(1);
                }
            };
            if task.state == TaskState::Running && task.assignee == worker_id {
                task.state = TaskState::Done;
                true
            } else {
                debug!(worker = worker_id, task = task_id, "stale completion ignored");
                false
            }
        };
        if !accepted {
            return;
        }
        match kind {
            TaskKind::Map => {
                st.map_pending -= 1;
                debug!(task = task_id, left = st.map_pending, "map task done");
                if st.map_pending == 0 {
                    info!("map phase complete, reduce phase begins");
                }
            }
            TaskKind::Reduce => {
                st.reduce_pending -= 1;
                debug!(task = task_id, left = st.reduce_pending, "reduce task done");
                if st.reduce_pending == 0 {
                    info!("reduce phase complete");
                }
            }
        }
    }
}

/// Locality-aware map dispatch: first pending task whose input location
/// matches the worker's position in the registry, else the first pending
/// task. Unregistered workers and unlocated inputs just get the fallback.
fn pick_map(st: &mut State, worker_id: i32, locality: LocalityFn) -> Option<usize> {
    let at = st
        .workers
        .iter()
        .position(|w| *w == worker_id)
        .map(|position| position.to_string());
    let mut picked = None;
    for (id, task) in st.map_tasks.iter().enumerate() {
        if task.state != TaskState::Pending {
            continue;
        }
        if picked.is_none() {
            picked = Some(id);
        }
        if at.is_some() && at.as_deref() == locality(&task.file).as_deref() {
            picked = Some(id);
            break;
        }
    }
    let id = picked?;
    claim(&mut st.map_tasks[id], worker_id);
    Some(id)
}

/// Reduce inputs are everywhere, so plain index order is as good as anything.
fn pick_reduce(st: &mut State, worker_id: i32) -> Option<usize> {
    let id = st.reduce_tasks.iter().position(|t| t.state == TaskState::Pending)?;
    claim(&mut st.reduce_tasks[id], worker_id);
    Some(id)
}

fn claim(task: &mut Task, worker_id: i32) {
    task.state = TaskState::Running;
    task.assignee = worker_id;
}

/// Control-plane surface. Workers call `get_reduce_count` exactly once at
/// startup, then loop over `get_task`/`submit_task`.
#[tarpc::service]
pub trait MapReduce {
    /// Registers the worker and returns the reduce fan-out R.
    async fn get_reduce_count(worker_id: i32) -> usize;
    /// Non-blocking task request.
    async fn get_task(worker_id: i32) -> Assignment;
    /// Completion signal; silently dropped unless the task is still running
    /// under this worker.
    async fn submit_task(worker_id: i32, task_id: i64, kind: TaskKind);
}

#[tarpc::server]
impl MapReduce for Coordinator {
    async fn get_reduce_count(self, _: context::Context, worker_id: i32) -> usize {
        self.register(worker_id)
    }

    async fn get_task(self, _: context::Context, worker_id: i32) -> Assignment {
        self.assign(worker_id)
    }

    async fn submit_task(self, _: context::Context, worker_id: i32, task_id: i64, kind: TaskKind) {
        self.complete(worker_id, task_id, kind)
    }
}
