//! Storage-unit entrypoint.
//!
//! Prepares the brick (device mount, `.glusterfs`, volume-id xattr), writes
//! the unit's volfiles, and supervises `glusterfsd` plus the self-heal daemon
//! when the pool replicates. A watcher regenerates the volfiles whenever the
//! pool descriptor changes and SIGHUPs the children so they reload.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Args;
use libpool::constants::{
    GLUSTERD_PORT, GLUSTERFS_BIN, GLUSTERFSD_BIN, MKFS_XFS_BIN, MOUNT_BIN, POOL_INFO_DIR,
    VOLFILES_DIR, VOLUME_ID_XATTR,
};
use libpool::exec::execute;
use libpool::volfile::{brick_volfile_id, brick_volfile_path, shd_volfile_path, write_pool_volfiles};
use libpool::xattr::{self, SetMode};
use libpool::{Brick, PoolInfo, PoolRegistry};
use nix::sys::signal::Signal;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::monitor::{Monitor, ProcessSpec};

const PROBE_XATTR: &str = "user.kadalu.probe";

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Pool this unit belongs to.
    #[arg(long, env = "VOLUME")]
    pub volume: String,
    #[arg(long, env = "VOLUME_ID")]
    pub volume_id: String,
    /// Brick directory inside the container.
    #[arg(long, env = "BRICK_PATH")]
    pub brick_path: PathBuf,
    #[arg(long, env = "BRICK_INDEX")]
    pub brick_index: u32,
    #[arg(long, env = "NODEID", default_value = "")]
    pub node_id: String,
    /// Block device backing the brick, if any.
    #[arg(long, env = "BRICK_DEVICE", default_value = "")]
    pub brick_device: String,
    /// Where the device is mounted; defaults to the brick's parent.
    #[arg(long, env = "BRICK_DEVICE_DIR", default_value = "")]
    pub brick_device_dir: String,
    #[arg(long, env = "BRICK_FS", default_value = "xfs")]
    pub brick_fs: String,
    #[arg(long, default_value = POOL_INFO_DIR)]
    pub info_dir: PathBuf,
    #[arg(long, default_value = VOLFILES_DIR)]
    pub volfiles_dir: PathBuf,
    #[arg(long, default_value = GLUSTERFSD_BIN)]
    pub glusterfsd_bin: String,
    #[arg(long, default_value = GLUSTERFS_BIN)]
    pub glusterfs_bin: String,
    #[arg(long, default_value = MKFS_XFS_BIN)]
    pub mkfs_bin: String,
    #[arg(long, default_value = MOUNT_BIN)]
    pub mount_bin: String,
    /// Seconds between two reads of the pool descriptor.
    #[arg(long, default_value_t = 10)]
    pub watch_interval: u64,
}

impl ServerArgs {
    fn device_mount_dir(&self) -> PathBuf {
        if !self.brick_device_dir.is_empty() {
            return PathBuf::from(&self.brick_device_dir);
        }
        self.brick_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.brick_path.clone())
    }

    fn mkfs_program(&self) -> String {
        if self.brick_fs == "xfs" {
            self.mkfs_bin.clone()
        } else {
            format!("mkfs.{}", self.brick_fs)
        }
    }

    fn info_path(&self) -> PathBuf {
        self.info_dir.join(format!("{}.info", self.volume))
    }
}

/// Mount the brick device, formatting it first when it carries no
/// filesystem.
pub async fn prepare_device(args: &ServerArgs) -> anyhow::Result<()> {
    let device = args.brick_device.as_str();
    let dir = args.device_mount_dir();
    std::fs::create_dir_all(&dir).with_context(|| format!("mkdir {}", dir.display()))?;
    let dir_arg = dir.to_string_lossy().into_owned();
    let mount_args = ["-t", args.brick_fs.as_str(), device, dir_arg.as_str()];

    match execute(&args.mount_bin, mount_args).await {
        Ok(_) => {}
        Err(e) if e.stderr_contains("already mounted") => {
            info!(device, dir = %dir.display(), "device already mounted");
            return Ok(());
        }
        Err(e) if e.stderr_contains("wrong fs type") => {
            info!(device, fs = %args.brick_fs, "no filesystem on device, formatting");
            execute(&args.mkfs_program(), [device])
                .await
                .with_context(|| format!("failed to format {device}"))?;
            match execute(&args.mount_bin, mount_args).await {
                Ok(_) => {}
                Err(e) if e.stderr_contains("already mounted") => {}
                Err(e) => return Err(e).with_context(|| format!("failed to mount {device}")),
            }
        }
        Err(e) => return Err(e).with_context(|| format!("failed to mount {device}")),
    }
    info!(device, dir = %dir.display(), "device mounted");
    Ok(())
}

/// Create the brick layout, check xattr support, and stamp the volume id.
///
/// The volume-id xattr is only ever created; a brick already stamped with a
/// different id is refused.
pub fn prepare_brick(brick: &Path, volume_id: &str) -> anyhow::Result<()> {
    let meta = brick.join(".glusterfs");
    std::fs::create_dir_all(&meta).with_context(|| format!("mkdir {}", meta.display()))?;

    probe_xattr(brick)
        .with_context(|| format!("brick {} does not support extended attributes", brick.display()))?;

    let id = uuid::Uuid::parse_str(volume_id)
        .with_context(|| format!("invalid volume id {volume_id:?}"))?;
    match xattr::set(brick, VOLUME_ID_XATTR, id.as_bytes(), SetMode::CreateOnly) {
        Ok(()) => info!(brick = %brick.display(), %id, "volume id set"),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            let existing = xattr::get(brick, VOLUME_ID_XATTR)?.unwrap_or_default();
            if existing != id.as_bytes() {
                bail!(
                    "brick {} already belongs to another volume",
                    brick.display()
                );
            }
            debug!(brick = %brick.display(), "volume id already present");
        }
        Err(e) => {
            return Err(e).with_context(|| format!("failed to set {VOLUME_ID_XATTR}"));
        }
    }
    Ok(())
}

fn probe_xattr(path: &Path) -> io::Result<()> {
    xattr::set(path, PROBE_XATTR, b"1", SetMode::Any)?;
    let value = xattr::get(path, PROBE_XATTR)?;
    xattr::remove(path, PROBE_XATTR)?;
    if value.as_deref() != Some(b"1".as_slice()) {
        return Err(io::Error::other("xattr read back a different value"));
    }
    Ok(())
}

fn local_brick(pool: &PoolInfo, index: u32) -> anyhow::Result<&Brick> {
    pool.bricks
        .iter()
        .find(|b| b.brick_index == index)
        .with_context(|| format!("pool {} has no storage unit {index}", pool.volname))
}

/// Write this unit's volfiles for `pool`. Returns whether any changed.
pub fn regenerate(dir: &Path, pool: &PoolInfo, index: u32) -> anyhow::Result<bool> {
    let brick = local_brick(pool, index)?;
    let changed = write_pool_volfiles(dir, pool, &[brick])?;
    Ok(!changed.is_empty())
}

/// `glusterfsd` for the unit, plus `glustershd` for replicated and
/// dispersed pools.
pub fn process_specs(args: &ServerArgs, pool: &PoolInfo, brick: &Brick) -> Vec<ProcessSpec> {
    let volfile_id = brick_volfile_id(pool, brick);
    let node_id = if brick.node_id.is_empty() {
        args.node_id.clone()
    } else {
        brick.node_id.clone()
    };

    let mut specs = vec![ProcessSpec::new(
        "glusterfsd",
        args.glusterfsd_bin.clone(),
        [
            "-N".to_owned(),
            "--volfile-id".to_owned(),
            volfile_id.clone(),
            "-f".to_owned(),
            brick_volfile_path(&args.volfiles_dir, pool, brick)
                .to_string_lossy()
                .into_owned(),
            "--brick-name".to_owned(),
            brick.brick_path.clone(),
            "--xlator-option".to_owned(),
            format!("*-posix.glusterd-uuid={node_id}"),
            "--brick-port".to_owned(),
            GLUSTERD_PORT.to_string(),
            "--xlator-option".to_owned(),
            format!("{}-server.listen-port={GLUSTERD_PORT}", pool.volname),
            "--process-name".to_owned(),
            "brick".to_owned(),
            "-l".to_owned(),
            "-".to_owned(),
        ],
    )];

    if pool.pool_type.needs_self_heal() {
        specs.push(ProcessSpec::new(
            "glustershd",
            args.glusterfs_bin.clone(),
            [
                "-N".to_owned(),
                "--volfile-id".to_owned(),
                format!("gluster/glustershd-{}", pool.volname),
                "-f".to_owned(),
                shd_volfile_path(&args.volfiles_dir, pool)
                    .to_string_lossy()
                    .into_owned(),
                "--process-name".to_owned(),
                "glustershd".to_owned(),
                "--client-pid=-6".to_owned(),
                "-l".to_owned(),
                "-".to_owned(),
            ],
        ));
    }
    specs
}

/// Detects changes of the pool descriptor file.
pub struct InfoWatcher {
    path: PathBuf,
    last: Option<String>,
}

impl InfoWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last: None,
        }
    }

    /// Remember the current content without reporting it as a change.
    pub fn prime(&mut self) {
        self.last = std::fs::read_to_string(&self.path).ok();
    }

    /// The new descriptor when the file changed since the last call.
    ///
    /// Unparseable content is reported as an error and not remembered, so
    /// the next call retries it.
    pub fn poll(&mut self) -> anyhow::Result<Option<PoolInfo>> {
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        if self.last.as_deref() == Some(raw.as_str()) {
            return Ok(None);
        }
        let pool: PoolInfo = serde_json::from_str(&raw)
            .with_context(|| format!("parse {}", self.path.display()))?;
        pool.validate()?;
        self.last = Some(raw);
        Ok(Some(pool))
    }
}

async fn watch_descriptor(
    mut watcher: InfoWatcher,
    volfiles_dir: PathBuf,
    index: u32,
    interval: Duration,
    reload: mpsc::Sender<Signal>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let pool = match watcher.poll() {
            Ok(Some(pool)) => pool,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "cannot load pool descriptor");
                continue;
            }
        };
        match regenerate(&volfiles_dir, &pool, index) {
            Ok(true) => {
                info!(pool = %pool.volname, "pool descriptor changed, reloading");
                if reload.send(Signal::SIGHUP).await.is_err() {
                    return;
                }
            }
            Ok(false) => debug!(pool = %pool.volname, "descriptor changed, volfiles identical"),
            Err(e) => warn!(error = %e, "failed to regenerate volfiles"),
        }
    }
}

/// Run the storage unit until `shutdown` resolves.
pub async fn run<F>(args: ServerArgs, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    if !args.brick_device.is_empty() {
        prepare_device(&args).await?;
    }
    prepare_brick(&args.brick_path, &args.volume_id)?;

    let registry = PoolRegistry::new(&args.info_dir);
    let pool = registry
        .by_name(&args.volume)
        .await?
        .with_context(|| format!("no descriptor for pool {}", args.volume))?;
    let brick = local_brick(&pool, args.brick_index)?.clone();
    regenerate(&args.volfiles_dir, &pool, args.brick_index)?;

    let mut monitor = Monitor::new(process_specs(&args, &pool, &brick));
    monitor.start()?;
    info!(pool = %pool.volname, unit = args.brick_index, "storage unit running");

    let mut watcher = InfoWatcher::new(args.info_path());
    watcher.prime();
    let (tx, rx) = mpsc::channel(4);
    let watch = tokio::spawn(watch_descriptor(
        watcher,
        args.volfiles_dir.clone(),
        args.brick_index,
        Duration::from_secs(args.watch_interval),
        tx,
    ));

    monitor.run(shutdown, rx).await;
    watch.abort();
    Ok(())
}
