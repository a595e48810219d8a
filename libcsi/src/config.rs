//! Paths and helper binaries used by the driver.

use std::path::PathBuf;

use libpool::constants::{
    CLIENT_LOG_FILE, FINDMNT_BIN, GLUSTERFS_BIN, LOSETUP_BIN, MKFS_XFS_BIN, MOUNT_BIN,
    MOUNT_ROOT, POOL_INFO_DIR, SSH_BIN, UMOUNT_BIN, XFS_GROWFS_BIN,
};

/// Runtime configuration of the CSI driver.
///
/// Defaults point at the production locations inside the Kadalu CSI image.
#[derive(Debug, Clone)]
pub struct CsiConfig {
    /// Name reported by `NodeGetInfo`.
    pub node_id: String,
    /// Version reported by `GetPluginInfo`.
    pub vendor_version: String,
    /// Directory holding the `<pool>.info` descriptors.
    pub info_dir: PathBuf,
    /// Parent of every pool FUSE mount.
    pub mount_root: PathBuf,
    pub client_log_file: PathBuf,
    pub glusterfs_bin: String,
    pub mkfs_xfs_bin: String,
    pub xfs_growfs_bin: String,
    pub mount_bin: String,
    pub umount_bin: String,
    pub losetup_bin: String,
    pub findmnt_bin: String,
    pub ssh_bin: String,
    /// Remote user for external-gluster directory quotas. Unset disables them.
    pub quota_ssh_user: Option<String>,
    /// Set the simple-quota xattrs on native subvol PVs.
    pub simple_quota: bool,
}

impl Default for CsiConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
            info_dir: PathBuf::from(POOL_INFO_DIR),
            mount_root: PathBuf::from(MOUNT_ROOT),
            client_log_file: PathBuf::from(CLIENT_LOG_FILE),
            glusterfs_bin: GLUSTERFS_BIN.to_owned(),
            mkfs_xfs_bin: MKFS_XFS_BIN.to_owned(),
            xfs_growfs_bin: XFS_GROWFS_BIN.to_owned(),
            mount_bin: MOUNT_BIN.to_owned(),
            umount_bin: UMOUNT_BIN.to_owned(),
            losetup_bin: LOSETUP_BIN.to_owned(),
            findmnt_bin: FINDMNT_BIN.to_owned(),
            ssh_bin: SSH_BIN.to_owned(),
            quota_ssh_user: None,
            simple_quota: true,
        }
    }
}
