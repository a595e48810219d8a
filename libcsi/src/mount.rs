//! Pool FUSE mounts.
//!
//! Each pool is mounted at most once per process at
//! `/mnt/<pool>[_<external-volname>][_<suffix>]`. The suffix separates mounts
//! of the same pool that were requested with different client options.
//!
//! A mount is started only after two checks for an existing client: one
//! without the lock and one with `mount_lock` held. The second check, the
//! exec and the bookkeeping all happen under the lock.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use libpool::constants::GLUSTERD_PORT;
use libpool::exec::{ENOTCONN_INTERVAL, ENOTCONN_TIMEOUT, execute, retry_errors};
use libpool::{PoolInfo, PoolMode, pv_hash};
use nix::errno::Errno;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::CsiConfig;
use crate::error::CsiError;

/// Observes running FUSE clients and mounted filesystems.
#[async_trait]
pub trait MountProbe: Send + Sync {
    /// A client for `volfile_id` is serving `mountpoint`.
    async fn is_mounted(&self, volfile_id: &str, mountpoint: &Path) -> bool;

    /// Capacity in bytes of the filesystem mounted at `mountpoint`.
    async fn capacity(&self, mountpoint: &Path) -> Result<u64, CsiError>;
}

/// [`MountProbe`] backed by `/proc` and `statvfs`.
#[derive(Debug, Clone)]
pub struct ProcMountProbe {
    proc_root: PathBuf,
}

impl Default for ProcMountProbe {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
        }
    }
}

/// `true` when the NUL-separated `cmdline` names `volfile_id` and ends at
/// `mountpoint`.
fn cmdline_matches(cmdline: &[u8], volfile_id: &str, mountpoint: &str) -> bool {
    let args: Vec<&str> = cmdline
        .split(|b| *b == 0)
        .filter_map(|a| std::str::from_utf8(a).ok())
        .filter(|a| !a.is_empty())
        .collect();

    let names_volume = args.windows(2).any(|w| w[0] == "--volfile-id" && w[1] == volfile_id)
        || args
            .iter()
            .any(|a| a.strip_prefix("--volfile-id=") == Some(volfile_id));
    names_volume && args.contains(&mountpoint)
}

#[async_trait]
impl MountProbe for ProcMountProbe {
    async fn is_mounted(&self, volfile_id: &str, mountpoint: &Path) -> bool {
        let Some(target) = mountpoint.to_str() else {
            return false;
        };
        let mut dir = match tokio::fs::read_dir(&self.proc_root).await {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "cannot scan processes");
                return false;
            }
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            let is_pid = entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.bytes().all(|b| b.is_ascii_digit()));
            if !is_pid {
                continue;
            }
            // Processes may exit between readdir and read.
            let Ok(cmdline) = tokio::fs::read(entry.path().join("cmdline")).await else {
                continue;
            };
            if cmdline_matches(&cmdline, volfile_id, target) {
                return true;
            }
        }
        false
    }

    async fn capacity(&self, mountpoint: &Path) -> Result<u64, CsiError> {
        let context = format!("statvfs {}", mountpoint.display());
        let stat = retry_errors(
            &context,
            || nix::sys::statvfs::statvfs(mountpoint),
            &[Errno::ENOTCONN],
            ENOTCONN_TIMEOUT,
            ENOTCONN_INTERVAL,
        )
        .await?;
        Ok(stat.fragment_size() as u64 * stat.blocks() as u64)
    }
}

/// Return `true` if `path` is currently listed as a mount point in
/// `/proc/self/mounts`.
///
/// `/proc/self/mounts` uses octal escapes (`\040` for space, etc.). Kubelet
/// target paths contain no whitespace, so direct comparison is enough.
pub async fn is_mountpoint(path: &str) -> bool {
    let contents = match tokio::fs::read_to_string("/proc/self/mounts").await {
        Ok(c) => c,
        Err(_) => return false,
    };
    // Format: <device> <mountpoint> <fstype> <options> <dump> <pass>
    contents
        .lines()
        .any(|line| line.split_whitespace().nth(1) == Some(path))
}

/// Short digest distinguishing mounts made with non-default options.
pub fn mount_suffix(extra_opts: &[String], extra_mount_opts: &[String]) -> Option<String> {
    if extra_opts.is_empty() && extra_mount_opts.is_empty() {
        return None;
    }
    let joined = format!("{}|{}", extra_opts.join(","), extra_mount_opts.join(","));
    Some(pv_hash(&joined)[..8].to_owned())
}

/// Starts and stops pool FUSE clients.
pub struct MountManager {
    mount_root: PathBuf,
    glusterfs_bin: String,
    umount_bin: String,
    log_file: PathBuf,
    probe: Arc<dyn MountProbe>,
    mount_lock: Mutex<()>,
}

impl MountManager {
    pub fn new(config: &CsiConfig, probe: Arc<dyn MountProbe>) -> Self {
        Self {
            mount_root: config.mount_root.clone(),
            glusterfs_bin: config.glusterfs_bin.clone(),
            umount_bin: config.umount_bin.clone(),
            log_file: config.client_log_file.clone(),
            probe,
            mount_lock: Mutex::new(()),
        }
    }

    pub fn probe(&self) -> &dyn MountProbe {
        self.probe.as_ref()
    }

    pub fn mountpoint(&self, pool: &PoolInfo, suffix: Option<&str>) -> PathBuf {
        let mut name = pool.volname.clone();
        if pool.mode().is_external() && !pool.gluster_volname.is_empty() {
            name.push('_');
            name.push_str(&pool.gluster_volname);
        }
        if let Some(suffix) = suffix.filter(|s| !s.is_empty()) {
            name.push('_');
            name.push_str(suffix);
        }
        self.mount_root.join(name)
    }

    /// Arguments for the FUSE client. `extra_opts` become `--<opt>` flags and
    /// `extra_mount_opts` are handed to FUSE verbatim.
    pub fn client_args(
        &self,
        pool: &PoolInfo,
        mountpoint: &Path,
        extra_opts: &[String],
        extra_mount_opts: &[String],
    ) -> Vec<String> {
        let mut args = Vec::new();
        if pool.mode() == PoolMode::ExternalGluster {
            args.extend(["--process-name".to_owned(), "fuse".to_owned()]);
        }
        args.extend([
            "-l".to_owned(),
            self.log_file.display().to_string(),
            "--volfile-id".to_owned(),
            pool.mount_src().to_owned(),
        ]);

        let mut port = GLUSTERD_PORT.to_string();
        for server in pool.volfile_servers() {
            let host = match server.split_once(':') {
                Some((host, p)) => {
                    port = p.to_owned();
                    host.to_owned()
                }
                None => server,
            };
            args.push(format!("--volfile-server={host}"));
        }
        args.push(format!("--volfile-server-port={port}"));

        if matches!(pool.mode(), PoolMode::Native | PoolMode::ExternalKadalu) {
            args.push(format!("--client-pid={}", libpool::constants::QUOTA_CLIENT_PID));
        }

        args.extend(
            extra_opts
                .iter()
                .map(|o| format!("--{}", o.trim_start_matches('-'))),
        );
        if !extra_mount_opts.is_empty() {
            args.push(format!("--fuse-mountopts={}", extra_mount_opts.join(",")));
        }
        args.push(mountpoint.display().to_string());
        args
    }

    /// Mount `pool` unless a client already serves it and return the
    /// mountpoint.
    #[instrument(skip_all, fields(pool = %pool.volname))]
    pub async fn mount(
        &self,
        pool: &PoolInfo,
        suffix: Option<&str>,
        extra_opts: &[String],
        extra_mount_opts: &[String],
    ) -> Result<PathBuf, CsiError> {
        let mountpoint = self.mountpoint(pool, suffix);
        let src = pool.mount_src();

        if self.probe.is_mounted(src, &mountpoint).await {
            debug!(mountpoint = %mountpoint.display(), "pool already mounted");
            return Ok(mountpoint);
        }

        let _guard = self.mount_lock.lock().await;
        if self.probe.is_mounted(src, &mountpoint).await {
            debug!(mountpoint = %mountpoint.display(), "pool mounted by a concurrent caller");
            return Ok(mountpoint);
        }

        tokio::fs::create_dir_all(&mountpoint)
            .await
            .map_err(|e| CsiError::MountFailed {
                path: mountpoint.display().to_string(),
                reason: e.to_string(),
            })?;

        let args = self.client_args(pool, &mountpoint, extra_opts, extra_mount_opts);
        let result = match execute(&self.glusterfs_bin, &args).await {
            Err(e)
                if e.stderr_contains("invalid option")
                    && !(extra_opts.is_empty() && extra_mount_opts.is_empty()) =>
            {
                warn!(error = %e, "client rejected extra options, retrying without them");
                let args = self.client_args(pool, &mountpoint, &[], &[]);
                execute(&self.glusterfs_bin, &args).await
            }
            other => other,
        };

        match result {
            Ok(_) => {}
            Err(e) if e.stderr_contains("already mounted") => {
                debug!(mountpoint = %mountpoint.display(), "client reports already mounted");
            }
            Err(e) => {
                return Err(CsiError::MountFailed {
                    path: mountpoint.display().to_string(),
                    reason: e.to_string(),
                });
            }
        }

        info!(mountpoint = %mountpoint.display(), volfile_id = src, "pool mounted");
        Ok(mountpoint)
    }

    /// Lazily unmount `path`. A path that is not mounted is not an error.
    pub async fn unmount(&self, path: &Path) -> Result<(), CsiError> {
        let target = path.display().to_string();
        match execute(&self.umount_bin, ["-l", target.as_str()]).await {
            Ok(_) => {
                info!(path = %target, "unmounted");
                Ok(())
            }
            Err(e) if e.stderr_contains("not mounted") => Ok(()),
            Err(e) => Err(CsiError::UnmountFailed {
                path: target,
                reason: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Treats a mountpoint as mounted once it holds a `.mounted` marker, and
    /// reports a fixed capacity.
    pub struct MarkerProbe {
        pub capacity: u64,
    }

    #[async_trait]
    impl MountProbe for MarkerProbe {
        async fn is_mounted(&self, _volfile_id: &str, mountpoint: &Path) -> bool {
            mountpoint.join(".mounted").exists()
        }

        async fn capacity(&self, _mountpoint: &Path) -> Result<u64, CsiError> {
            Ok(self.capacity)
        }
    }

    /// Write an executable shell script.
    pub fn script(dir: &Path, name: &str, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    /// A fake FUSE client that logs its arguments and drops the marker into
    /// the mountpoint (its last argument).
    pub fn fake_glusterfs(dir: &Path) -> String {
        let log = dir.join("glusterfs.log");
        script(
            dir,
            "glusterfs",
            &format!(
                "echo \"$@\" >> {log}\nfor last; do :; done\ntouch \"$last/.mounted\"",
                log = log.display()
            ),
        )
    }
}
