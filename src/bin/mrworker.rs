use std::net::SocketAddr;

use anyhow::Context as _;
use clap::Parser;
use minimr::mr::coordinator::MapReduceClient;
use minimr::mr::function;
use minimr::mr::worker::run_worker;
use tarpc::client;
use tarpc::tokio_serde::formats::Json;
use tracing_subscriber::EnvFilter;

/// A MapReduce worker process. Polls the coordinator for tasks until the job
/// is done, then exits. Run as many of these as you want cores used.
#[derive(Debug, Parser)]
struct Args {
    /// Coordinator control-plane address.
    #[arg(long, default_value = "127.0.0.1:1030")]
    connect: SocketAddr,

    /// Which bundled application to run.
    #[arg(long, default_value = "wc")]
    app: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let (mapf, reducef) = function::lookup(&args.app)
        .with_context(|| format!("unknown application {:?}", args.app))?;

    let transport = tarpc::serde_transport::tcp::connect(args.connect, Json::default)
        .await
        .with_context(|| format!("connecting to coordinator at {}", args.connect))?;
    let client = MapReduceClient::new(client::Config::default(), transport).spawn();

    // pid is unique among live workers on this host, which is all the
    // coordinator needs
    let worker_id = std::process::id() as i32;
    run_worker(client, worker_id, mapf, reducef).await
}
