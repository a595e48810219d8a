//! `kadalu`: every Kadalu process in one binary.
//!
//! | Subcommand | Runs |
//! |---|---|
//! | `csi` | CSI provisioner or node plugin on a unix socket. |
//! | `operator` | `KadaluStorage` pool controller. |
//! | `server` | One storage unit (`glusterfsd` + self-heal daemon). |
//! | `quotad` | XFS project-quota crawler. |
//! | `monitor` | Supervisor that keeps a fixed set of processes running. |

mod config;
mod monitor;
mod server;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use libcsi::mount::ProcMountProbe;
use libcsi::quota::{CrawlerConfig, QuotaCrawler};
use libcsi::transport::{CsiRole, serve};
use libcsi::{CsiConfig, KadaluBackend};
use libpool::PoolRegistry;
use libpool::constants::{GLUSTERD_WORKDIR, KADALU_QUOTA_INFO, POOL_INFO_DIR, XFS_QUOTA_BIN};
use liboperator::OperatorConfig;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::RUNTIME;
use crate::monitor::{Monitor, ProcessSpec, parse_process_spec};
use crate::server::ServerArgs;

#[derive(Parser, Debug)]
#[command(name = "kadalu", version, about = "Kadalu storage for Kubernetes")]
struct Cli {
    #[arg(long, global = true, value_enum, default_value = "json")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the CSI driver.
    Csi(CsiArgs),
    /// Run the KadaluStorage pool controller.
    Operator(OperatorArgs),
    /// Run one storage unit.
    Server(ServerArgs),
    /// Enforce XFS project quotas on local bricks.
    Quotad(QuotadArgs),
    /// Supervise a set of processes.
    Monitor(MonitorArgs),
}

#[derive(Args, Debug)]
struct CsiArgs {
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix://plugin/csi.sock")]
    endpoint: String,
    /// provisioner or nodeplugin.
    #[arg(long, env = "CSI_ROLE", default_value = "provisioner")]
    role: CsiRole,
    /// Falls back to `$HOSTNAME`.
    #[arg(long, env = "NODEID")]
    node_id: Option<String>,
    #[arg(long, env = "SECRET_GLUSTERQUOTA_SSH_USERNAME")]
    quota_ssh_user: Option<String>,
    #[arg(long, default_value = POOL_INFO_DIR)]
    info_dir: PathBuf,
}

#[derive(Args, Debug)]
struct OperatorArgs {
    #[arg(long, env = "KADALU_NAMESPACE", default_value = "kadalu")]
    namespace: String,
    #[arg(long, env = "IMAGES_HUB", default_value = "docker.io")]
    images_hub: String,
    /// Print the KadaluStorage CRD and exit.
    #[arg(long)]
    print_crd: bool,
}

#[derive(Args, Debug)]
struct QuotadArgs {
    /// Seconds between two crawls.
    #[arg(long, default_value_t = 2)]
    interval: u64,
    #[arg(long, default_value = GLUSTERD_WORKDIR)]
    glusterd_workdir: PathBuf,
    #[arg(long, default_value = KADALU_QUOTA_INFO)]
    kadalu_info: PathBuf,
    #[arg(long, default_value = XFS_QUOTA_BIN)]
    xfs_quota_bin: String,
}

#[derive(Args, Debug)]
struct MonitorArgs {
    /// `NAME=COMMAND [ARGS...]`, repeatable.
    #[arg(short, long = "process", value_parser = parse_process_spec, required = true)]
    processes: Vec<ProcessSpec>,
}

fn init_tracing(format: LogFormat) {
    let default_level = if RUNTIME.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Resolves on the first SIGINT or SIGTERM.
fn shutdown_signal() -> anyhow::Result<impl Future<Output = ()> + Send + 'static> {
    let mut term = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let mut int = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    Ok(async move {
        tokio::select! {
            _ = term.recv() => info!("received SIGTERM"),
            _ = int.recv() => info!("received SIGINT"),
        }
    })
}

async fn run_csi(args: CsiArgs) -> anyhow::Result<()> {
    let node_id = args
        .node_id
        .filter(|n| !n.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_default();
    let config = CsiConfig {
        node_id,
        vendor_version: RUNTIME.version.clone(),
        info_dir: args.info_dir.clone(),
        quota_ssh_user: args.quota_ssh_user.filter(|u| !u.is_empty()),
        ..Default::default()
    };
    let registry = PoolRegistry::new(&args.info_dir);
    let backend = Arc::new(KadaluBackend::new(
        config,
        registry,
        Arc::new(ProcMountProbe::default()),
    ));

    info!(endpoint = %args.endpoint, role = ?args.role, version = %RUNTIME.version, "starting CSI driver");
    let shutdown = shutdown_signal()?;
    let served = serve(&args.endpoint, args.role, Arc::clone(&backend), shutdown).await;
    backend.shutdown().await;
    served.context("CSI server failed")
}

async fn run_operator(args: OperatorArgs) -> anyhow::Result<()> {
    if args.print_crd {
        println!("{}", liboperator::crd_manifest()?);
        return Ok(());
    }
    let config = OperatorConfig::new(args.namespace, &args.images_hub, &RUNTIME.version);
    liboperator::run(config, shutdown_signal()?)
        .await
        .context("pool controller failed")
}

async fn run_quotad(args: QuotadArgs) -> anyhow::Result<()> {
    let crawler = QuotaCrawler::new(CrawlerConfig {
        glusterd_workdir: args.glusterd_workdir,
        kadalu_info: args.kadalu_info,
        xfs_quota_bin: args.xfs_quota_bin,
    });
    info!(interval = args.interval, "starting quota crawler");
    crawler
        .run(Duration::from_secs(args.interval), shutdown_signal()?)
        .await;
    Ok(())
}

async fn run_monitor(args: MonitorArgs) -> anyhow::Result<()> {
    let shutdown = shutdown_signal()?;
    let mut monitor = Monitor::new(args.processes);
    monitor.start()?;
    let (_reload, signals) = mpsc::channel(1);
    monitor.run(shutdown, signals).await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Csi(args) => run_csi(args).await,
        Command::Operator(args) => run_operator(args).await,
        Command::Server(args) => server::run(args, shutdown_signal()?).await,
        Command::Quotad(args) => run_quotad(args).await,
        Command::Monitor(args) => run_monitor(args).await,
    }
}
