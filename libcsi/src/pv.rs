//! PV layout on a mounted pool.
//!
//! ```text
//! <mount>/
//!   stat.db
//!   <type>/<h0>/<h1>/<name>            # directory or sparse file
//!   info/<type>/<h0>/<h1>/<name>.json  # {"size": .., "path_prefix": ..}
//! ```
//!
//! The info file is the commit point of a PV: it is written last, once the
//! data path exists and quota and ledger are settled, and removed after the
//! data path is gone. A readable info file always has data behind it.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use libpool::constants::{ARCHIVED_PREFIX, PV_INFO_DIR};
use libpool::exec::{
    ENOTCONN_INTERVAL, ENOTCONN_TIMEOUT, errno_of, execute, retry_errors, retry_errors_async,
};
use libpool::{PvType, ReclaimPolicy};
use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::CsiError;

/// Contents of a PV info file.
#[derive(Serialize, Deserialize)]
struct InfoFile {
    size: u64,
    path_prefix: String,
}

/// A PV located on a pool mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundPv {
    pub name: String,
    pub pvtype: PvType,
    pub size: u64,
}

impl FoundPv {
    pub fn path(&self) -> String {
        self.pvtype.pv_path(&self.name)
    }
}

fn io_err(context: impl std::fmt::Display, e: std::io::Error) -> CsiError {
    CsiError::BackendError(format!("{context}: {e}"))
}

/// `<mount>/info/<type>/<h0>/<h1>/<name>.json`.
pub fn info_path(mount: &Path, pvtype: PvType, name: &str) -> PathBuf {
    mount
        .join(PV_INFO_DIR)
        .join(pvtype.path_prefix(name))
        .join(format!("{name}.json"))
}

/// `<mount>/<type>/<h0>/<h1>/<name>`.
pub fn data_path(mount: &Path, pvtype: PvType, name: &str) -> PathBuf {
    mount.join(pvtype.pv_path(name))
}

fn archived(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{ARCHIVED_PREFIX}{name}"))
}

pub async fn read_info(path: &Path) -> Result<u64, CsiError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| io_err(format!("read {}", path.display()), e))?;
    let info: InfoFile = serde_json::from_str(&raw)
        .map_err(|e| CsiError::BackendError(format!("parse {}: {e}", path.display())))?;
    Ok(info.size)
}

/// Write the info file through a temporary file and rename.
pub async fn write_info(mount: &Path, pvtype: PvType, name: &str, size: u64) -> Result<(), CsiError> {
    let path = info_path(mount, pvtype, name);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_err(format!("mkdir {}", parent.display()), e))?;
    }
    let body = serde_json::to_string(&InfoFile {
        size,
        path_prefix: pvtype.path_prefix(name),
    })
    .map_err(CsiError::internal)?;

    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, body)
        .await
        .map_err(|e| io_err(format!("write {}", tmp.display()), e))?;
    tokio::fs::rename(&tmp, &path)
        .await
        .map_err(|e| io_err(format!("rename {}", path.display()), e))?;
    Ok(())
}

fn exists_on_pool(path: &Path) -> nix::Result<bool> {
    match nix::sys::stat::stat(path) {
        Ok(_) => Ok(true),
        Err(Errno::ENOENT) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Probe the three candidate info paths of `name` on one pool.
pub async fn search(mount: &Path, name: &str) -> Result<Option<FoundPv>, CsiError> {
    for pvtype in PvType::ALL {
        let path = info_path(mount, pvtype, name);
        let context = format!("stat {}", path.display());
        let exists = retry_errors(
            &context,
            || exists_on_pool(&path),
            &[Errno::ENOTCONN],
            ENOTCONN_TIMEOUT,
            ENOTCONN_INTERVAL,
        )
        .await?;
        if exists {
            let size = read_info(&path).await?;
            return Ok(Some(FoundPv {
                name: name.to_owned(),
                pvtype,
                size,
            }));
        }
    }
    Ok(None)
}

fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            walk(&path, out)?;
            continue;
        }
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if file_name.ends_with(".json") && !file_name.starts_with(ARCHIVED_PREFIX) {
            out.push(path);
        }
    }
    Ok(())
}

/// Every live info file under `<mount>/info`, sorted. Archived entries and
/// temporary files are skipped.
pub async fn info_files(mount: &Path) -> Result<Vec<PathBuf>, CsiError> {
    let root = mount.join(PV_INFO_DIR);
    let context = format!("walk {}", root.display());
    let mut files = retry_errors_async(
        &context,
        || {
            let root = root.clone();
            async move {
                tokio::task::spawn_blocking(move || {
                    let mut files = Vec::new();
                    walk(&root, &mut files).map(|()| files).map_err(|e| errno_of(&e))
                })
                .await
                .unwrap_or(Err(Errno::EIO))
            }
        },
        &[Errno::ENOTCONN],
        ENOTCONN_TIMEOUT,
        ENOTCONN_INTERVAL,
    )
    .await?;
    files.sort();
    Ok(files)
}

/// PV name of an info file path.
pub fn name_of(info_file: &Path) -> Option<String> {
    info_file
        .file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_owned)
}

/// Create the data path of a new PV. The info file is not written; see
/// [`write_info`].
///
/// For file-backed PVs an existing data file is a replay of an earlier
/// request that never reached its info write; it is moved aside to
/// `<path>.<epoch>` and a fresh file is created.
pub async fn allocate(
    mount: &Path,
    pvtype: PvType,
    name: &str,
    size: u64,
    mkfs: Option<(&str, &str)>,
) -> Result<PathBuf, CsiError> {
    let abspath = data_path(mount, pvtype, name);

    match pvtype {
        PvType::Subvol => {
            tokio::fs::create_dir_all(&abspath)
                .await
                .map_err(|e| io_err(format!("mkdir {}", abspath.display()), e))?;
        }
        PvType::Virtblock | PvType::Rawblock => {
            if let Some(parent) = abspath.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| io_err(format!("mkdir {}", parent.display()), e))?;
            }
            if tokio::fs::try_exists(&abspath).await.unwrap_or(false) {
                let epoch = epoch_secs();
                let aside = abspath.with_file_name(format!("{name}.{epoch}"));
                warn!(pv = name, aside = %aside.display(), "moving stale backing file aside");
                tokio::fs::rename(&abspath, &aside)
                    .await
                    .map_err(|e| io_err(format!("rename {}", abspath.display()), e))?;
            }

            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&abspath)
                .await
                .map_err(|e| io_err(format!("create {}", abspath.display()), e))?;
            file.set_len(size)
                .await
                .map_err(|e| io_err(format!("truncate {}", abspath.display()), e))?;
            drop(file);

            if pvtype == PvType::Virtblock
                && let Some((bin, fstype)) = mkfs
            {
                let target = abspath.display().to_string();
                let args: Vec<&str> = if fstype == "xfs" {
                    vec![target.as_str()]
                } else {
                    vec!["-F", target.as_str()]
                };
                execute(bin, &args).await?;
                debug!(pv = name, fstype, "backing file formatted");
            }
        }
    }

    debug!(pv = name, %pvtype, size, "data path allocated");
    Ok(abspath)
}

/// Remove the data path of a PV that was never committed. Errors are logged.
pub async fn discard(mount: &Path, pvtype: PvType, name: &str) {
    let abspath = data_path(mount, pvtype, name);
    let removed = match pvtype {
        PvType::Subvol => tokio::fs::remove_dir_all(&abspath).await,
        PvType::Virtblock | PvType::Rawblock => tokio::fs::remove_file(&abspath).await,
    };
    match removed {
        Ok(()) => info!(pv = name, path = %abspath.display(), "uncommitted data path removed"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(pv = name, path = %abspath.display(), error = %e, "cannot remove uncommitted data path"),
    }
    prune_prefix(&abspath, 3).await;
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// `rmdir` the hash-prefix directories above `leaf`, innermost first.
async fn prune_prefix(leaf: &Path, levels: usize) {
    let mut dir = leaf.parent();
    for _ in 0..levels {
        let Some(d) = dir else { break };
        match tokio::fs::remove_dir(d).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) if e.kind() == ErrorKind::DirectoryNotEmpty => {
                info!(dir = %d.display(), "prefix directory still in use");
                break;
            }
            Err(e) => {
                warn!(dir = %d.display(), error = %e, "cannot remove prefix directory");
                break;
            }
        }
        dir = d.parent();
    }
}

/// Apply `policy` to the data and info of `pv`.
pub async fn remove(mount: &Path, pv: &FoundPv, policy: ReclaimPolicy) -> Result<(), CsiError> {
    let abspath = data_path(mount, pv.pvtype, &pv.name);
    let infopath = info_path(mount, pv.pvtype, &pv.name);

    match policy {
        ReclaimPolicy::Retain => {
            info!(pv = %pv.name, "reclaim policy retain, keeping data");
        }
        ReclaimPolicy::Archive => {
            for path in [&abspath, &infopath] {
                if tokio::fs::try_exists(path).await.unwrap_or(false) {
                    tokio::fs::rename(path, archived(path))
                        .await
                        .map_err(|e| io_err(format!("archive {}", path.display()), e))?;
                }
            }
            info!(pv = %pv.name, "pv archived");
        }
        ReclaimPolicy::Delete => {
            let removed = match pv.pvtype {
                PvType::Subvol => tokio::fs::remove_dir_all(&abspath).await,
                PvType::Virtblock | PvType::Rawblock => tokio::fs::remove_file(&abspath).await,
            };
            match removed {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(io_err(format!("remove {}", abspath.display()), e)),
            }
            match tokio::fs::remove_file(&infopath).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(io_err(format!("remove {}", infopath.display()), e)),
            }
            prune_prefix(&abspath, 3).await;
            prune_prefix(&infopath, 3).await;
            info!(pv = %pv.name, "pv deleted");
        }
    }
    Ok(())
}

/// Grow the backing store of `pv` to `new_size` and record the new size.
pub async fn resize(mount: &Path, pv: &FoundPv, new_size: u64) -> Result<(), CsiError> {
    if pv.pvtype != PvType::Subvol {
        let abspath = data_path(mount, pv.pvtype, &pv.name);
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&abspath)
            .await
            .map_err(|e| io_err(format!("open {}", abspath.display()), e))?;
        file.set_len(new_size)
            .await
            .map_err(|e| io_err(format!("truncate {}", abspath.display()), e))?;
    }
    write_info(mount, pv.pvtype, &pv.name, new_size).await
}
