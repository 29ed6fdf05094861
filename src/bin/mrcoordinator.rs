use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use minimr::mr::coordinator::{Coordinator, CoordinatorOptions};
use tokio::time::sleep;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Runs a MapReduce job over the given input files, one map task per file.
/// Workers connect over TCP; results land in `mr-out-*` in the current
/// directory.
#[derive(Debug, Parser)]
struct Args {
    /// Input files, one map task each.
    files: Vec<PathBuf>,

    /// Number of reduce tasks (and output files).
    #[arg(short = 'r', long, default_value_t = 10)]
    reduce_tasks: usize,

    /// Address the control plane listens on.
    #[arg(long, default_value = "127.0.0.1:1030")]
    listen: SocketAddr,

    /// Abandon the job after three task timeouts instead of retrying
    /// forever. Testing hook.
    #[arg(long, hide = true)]
    fail_fast: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let files: Vec<String> = args.files.iter().map(|f| f.display().to_string()).collect();
    info!(maps = files.len(), reduces = args.reduce_tasks, "starting job");

    let options = CoordinatorOptions { fail_fast: args.fail_fast, ..Default::default() };
    let coordinator = Coordinator::with_options(files, args.reduce_tasks, options);
    coordinator.start(args.listen).await?;

    while !coordinator.done() {
        sleep(Duration::from_secs(1)).await;
    }

    info!("job complete, results in mr-out-*");
    Ok(())
}
