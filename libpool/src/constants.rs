//! Well-known paths, ports and names.

/// CSI driver name registered with kubelet and used as StorageClass provisioner.
pub const DRIVER_NAME: &str = "kadalu.gluster";

/// Directory where the operator's info ConfigMap is mounted.
pub const POOL_INFO_DIR: &str = "/var/lib/gluster";

/// Parent directory of every pool FUSE mount.
pub const MOUNT_ROOT: &str = "/mnt";

/// Directory holding generated volfiles inside storage-unit pods.
pub const VOLFILES_DIR: &str = "/var/lib/kadalu/volfiles";

/// Log file passed to every FUSE client.
pub const CLIENT_LOG_FILE: &str = "/var/log/gluster/gluster.log";

/// Static brick list consumed by the quota crawler.
pub const KADALU_QUOTA_INFO: &str = "/var/lib/glusterd/kadalu.info";

/// Root of glusterd's state directory (external clusters).
pub const GLUSTERD_WORKDIR: &str = "/var/lib/glusterd";

/// Port every storage-unit process listens on.
pub const GLUSTERD_PORT: u16 = 24007;

/// Ledger file name, relative to the pool mount.
pub const LEDGER_FILE: &str = "stat.db";

/// Directory under the pool mount that holds PV info JSON files.
pub const PV_INFO_DIR: &str = "info";

/// Prefix given to data and info files of archived PVs.
pub const ARCHIVED_PREFIX: &str = "archived-";

/// Share of the free space kept back when placing a PV.
pub const RESERVED_PERCENT: u64 = 10;

/// Client pid that lets simple-quota xattrs through the FUSE mount.
pub const QUOTA_CLIENT_PID: i32 = -14;

/// Default tie-breaker used by Replica2 pools.
pub const DEFAULT_TIEBREAKER_NODE: &str = "tie-breaker.kadalu.io";
pub const DEFAULT_TIEBREAKER_PATH: &str = "/mnt";

/// Xattr stamped on every brick root.
pub const VOLUME_ID_XATTR: &str = "trusted.glusterfs.volume-id";

/// Simple-quota xattrs.
pub const SQUOTA_NAMESPACE_XATTR: &str = "trusted.glusterfs.namespace";
pub const SQUOTA_LIMIT_XATTR: &str = "trusted.gfs.squota.limit";

pub const GLUSTERFS_BIN: &str = "/opt/sbin/glusterfs";
pub const GLUSTERFSD_BIN: &str = "/usr/sbin/glusterfsd";
pub const MKFS_XFS_BIN: &str = "/sbin/mkfs.xfs";
pub const XFS_GROWFS_BIN: &str = "/sbin/xfs_growfs";
pub const MOUNT_BIN: &str = "/bin/mount";
pub const UMOUNT_BIN: &str = "/bin/umount";
pub const LOSETUP_BIN: &str = "losetup";
pub const FINDMNT_BIN: &str = "findmnt";
pub const XFS_QUOTA_BIN: &str = "xfs_quota";
pub const SSH_BIN: &str = "ssh";
