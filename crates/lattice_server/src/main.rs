// Lattice region-server binary entry point.
//
// Wires the runtime together for a standalone/single-host deployment: a
// local-directory filesystem and an in-process master that assigns the
// root catalog region at startup. Networked deployments embed
// `RegionServer` with their own `MasterClient` and `Dfs` implementations.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use lattice_server::master::InProcessMaster;
use lattice_server::messages::MasterInstruction;
use lattice_server::region::{FamilySchema, RegionDescriptor, TableSchema, ROOT_TABLE};
use lattice_server::{fs::LocalDfs, RegionServer, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "lattice-regionserver")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a region server in the foreground.
    Start(StartArgs),
    /// Operators stop a server via signal or the daemon script.
    Stop,
}

#[derive(Parser, Debug)]
struct StartArgs {
    /// Bind address for the client request surface.
    #[arg(long, env = "LATTICE_REGIONSERVER_BIND")]
    bind: Option<SocketAddr>,

    /// Root directory of the shared filesystem.
    #[arg(long, env = "LATTICE_ROOTDIR")]
    rootdir: Option<PathBuf>,

    /// Heartbeat interval to the master (ms).
    #[arg(long, env = "LATTICE_MSG_INTERVAL_MS")]
    msg_interval_ms: Option<u64>,

    /// Request handler pool size.
    #[arg(long, env = "LATTICE_HANDLER_COUNT")]
    handler_count: Option<usize>,

    /// Status page port; negative disables.
    #[arg(long, env = "LATTICE_INFO_PORT")]
    info_port: Option<i32>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Start(start) => {
            if let Err(err) = run_server(start).await {
                tracing::error!(error = ?err, "can not start region server");
                std::process::exit(-1);
            }
        }
        Command::Stop => {
            eprintln!(
                "to shut down a region server, send it a termination signal \
                 or use the daemon script; there is no stop verb"
            );
        }
    }
}

async fn run_server(args: StartArgs) -> anyhow::Result<()> {
    let mut config = ServerConfig::default();
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(rootdir) = args.rootdir {
        config.root_dir = rootdir;
    }
    if let Some(interval) = args.msg_interval_ms {
        config.msg_interval_ms = interval;
    }
    if let Some(handlers) = args.handler_count {
        config.handler_count = handlers;
    }
    if let Some(port) = args.info_port {
        config.info_port = port;
    }

    // Standalone topology: this node hosts the root catalog region.
    let master = Arc::new(InProcessMaster::new(HashMap::new()));
    master.enqueue(vec![MasterInstruction::OpenRegion(RegionDescriptor::new(
        TableSchema::new(ROOT_TABLE, vec![FamilySchema::new("info")]),
        Vec::new(),
        Vec::new(),
    ))]);

    let server = RegionServer::new(config, Arc::new(LocalDfs), master);
    let ctx = server.context();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("termination signal received; stopping region server");
            ctx.stop();
        }
    });
    server.run().await
}
