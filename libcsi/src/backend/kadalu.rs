//! Kadalu storage backend for CSI.
//!
//! [`KadaluBackend`] implements [`CsiIdentity`], [`CsiController`], and
//! [`CsiNode`] on top of GlusterFS storage pools. PVs are carved out of a
//! pool's FUSE mount as directories (subvol) or sparse files (virtblock,
//! rawblock); see [`crate::pv`] for the on-pool layout.
//!
//! # Locking
//!
//! * `MountManager::mount_lock` serializes FUSE client start-up.
//! * `statfile_lock` is held from the capacity read through the info-file
//!   write, so a pool is never over-committed by concurrent creates.
//! * `creating` holds one lock per PV name for the whole of `CreateVolume`,
//!   so two requests for the same name never place it twice.
//! * `lister` holds the one in-flight `ListVolumes` cursor.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use libpool::constants::DRIVER_NAME;
use libpool::exec::execute;
use libpool::{
    KadaluFormat, PoolFilter, PoolInfo, PoolLedger, PoolMode, PoolRegistry, PoolType, PvType,
    ReclaimPolicy,
};
use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::CsiConfig;
use crate::context::VolumeContext;
use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::listing::{PoolSource, VolumeLister};
use crate::mount::{MountManager, MountProbe, is_mountpoint, mount_suffix};
use crate::node::CsiNode;
use crate::pv::{self, FoundPv};
use crate::quota::QuotaEnforcer;
use crate::types::*;

const DEFAULT_FSTYPE: &str = "xfs";

fn split_opts(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// `devtmpfs[/loop3]` or `/dev/loop3` → `/dev/loop3`.
fn loop_device_from_source(source: &str) -> Option<String> {
    let source = source.trim();
    if source.starts_with("/dev/") {
        return Some(source.to_owned());
    }
    let inner = source.split_once('[')?.1.strip_suffix(']')?;
    if inner.starts_with("/dev/") {
        Some(inner.to_owned())
    } else {
        Some(format!("/dev{inner}"))
    }
}

/// A PV found on a mounted pool.
struct Located {
    pool: PoolInfo,
    mount: PathBuf,
    pv: FoundPv,
}

/// Concrete CSI backend for Kadalu storage pools.
///
/// Runs as the provisioner (controller role) or as the node plugin; both
/// roles share the pool registry and mount manager.
pub struct KadaluBackend {
    config: CsiConfig,
    registry: PoolRegistry,
    mounts: MountManager,
    quota: QuotaEnforcer,
    statfile_lock: Mutex<()>,
    /// Open ledgers, keyed by pool name.
    ledgers: DashMap<String, Arc<PoolLedger>>,
    /// PV names with a `CreateVolume` in flight.
    creating: DashMap<String, Arc<Mutex<()>>>,
    lister: Mutex<Option<VolumeLister>>,
}

impl KadaluBackend {
    pub fn new(config: CsiConfig, registry: PoolRegistry, probe: Arc<dyn MountProbe>) -> Self {
        Self {
            mounts: MountManager::new(&config, probe),
            quota: QuotaEnforcer::new(&config),
            config,
            registry,
            statfile_lock: Mutex::new(()),
            ledgers: DashMap::new(),
            creating: DashMap::new(),
            lister: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CsiConfig {
        &self.config
    }

    /// Close every open ledger connection.
    pub async fn shutdown(&self) {
        let ledgers: Vec<_> = self.ledgers.iter().map(|l| Arc::clone(l.value())).collect();
        self.ledgers.clear();
        for ledger in ledgers {
            ledger.close().await;
        }
    }

    // -----------------------------------------------------------------------
    // Pool helpers
    // -----------------------------------------------------------------------

    /// Mount `pool` with the client options from its descriptor.
    async fn mount_pool(&self, pool: &PoolInfo) -> Result<PathBuf, CsiError> {
        let opts = split_opts(&pool.gluster_options);
        let suffix = mount_suffix(&opts, &pool.mount_options);
        self.mounts
            .mount(pool, suffix.as_deref(), &opts, &pool.mount_options)
            .await
    }

    async fn ledger(&self, pool: &PoolInfo, mount: &Path) -> Result<Arc<PoolLedger>, CsiError> {
        if let Some(ledger) = self.ledgers.get(&pool.volname) {
            return Ok(Arc::clone(ledger.value()));
        }
        let opened = Arc::new(PoolLedger::open(mount, &pool.volname).await?);
        let (ledger, lost) = match self.ledgers.entry(pool.volname.clone()) {
            Entry::Occupied(existing) => (Arc::clone(existing.get()), Some(opened)),
            Entry::Vacant(slot) => (Arc::clone(slot.insert(opened).value()), None),
        };
        if let Some(lost) = lost {
            debug!(pool = %pool.volname, "ledger opened concurrently, closing duplicate");
            lost.close().await;
        }
        Ok(ledger)
    }

    /// Every pool that can be mounted right now. Pools that fail to mount
    /// are logged and skipped.
    async fn mounted_pools(&self) -> Result<Vec<(PoolInfo, PathBuf)>, CsiError> {
        let mut mounted = Vec::new();
        for pool in self.registry.list(&PoolFilter::default()).await? {
            match self.mount_pool(&pool).await {
                Ok(mount) => mounted.push((pool, mount)),
                Err(e) => warn!(pool = %pool.volname, error = %e, "skipping pool that failed to mount"),
            }
        }
        Ok(mounted)
    }

    /// Find `name` on any pool.
    async fn locate(&self, name: &str) -> Result<Option<Located>, CsiError> {
        for (pool, mount) in self.mounted_pools().await? {
            if let Some(pv) = pv::search(&mount, name).await? {
                debug!(pv = name, pool = %pool.volname, "pv located");
                return Ok(Some(Located { pool, mount, pv }));
            }
        }
        Ok(None)
    }

    fn volume(&self, pool: &PoolInfo, pv: &FoundPv, params: &StorageClassParams) -> Volume {
        let mut mount_options = pool.mount_options.clone();
        mount_options.extend(params.storage_options.iter().cloned());
        let context = VolumeContext {
            pool_mode: pool.mode(),
            pool_name: pool.volname.clone(),
            pvtype: pv.pvtype,
            fstype: params
                .fstype
                .clone()
                .unwrap_or_else(|| DEFAULT_FSTYPE.to_owned()),
            single_pv_per_pool: pool.single_pv_per_pool,
            path: pv.path(),
            options: pool.gluster_options.clone(),
            mount_options,
            gluster_volname: pool.gluster_volname.clone(),
            gluster_hosts: pool.gluster_hosts.clone(),
        };
        Volume {
            volume_id: VolumeId(pv.name.clone()),
            capacity_bytes: pv.size,
            volume_context: context.to_map(),
        }
    }

    /// Try to place `name` on `pool`. `Ok(None)` means the pool has no room.
    async fn place_on(
        &self,
        pool: &PoolInfo,
        name: &str,
        pvtype: PvType,
        size: u64,
        fstype: &str,
    ) -> Result<Option<FoundPv>, CsiError> {
        let mount = self.mount_pool(pool).await?;
        let ledger = self.ledger(pool, &mount).await?;

        let _guard = self.statfile_lock.lock().await;
        let total = self.mounts.probe().capacity(&mount).await?;
        ledger.update_summary(total).await?;
        let stats = ledger.get_stats().await?;

        if pool.single_pv_per_pool && stats.pvs > 0 {
            debug!(pool = %pool.volname, "single-pv pool already in use");
            return Ok(None);
        }
        if !stats.fits(size) {
            debug!(
                pool = %pool.volname,
                size,
                free = stats.free,
                reserved = stats.reserved(),
                "pool too small"
            );
            return Ok(None);
        }

        if let Err(e) = self
            .materialize(pool, &mount, &ledger, name, pvtype, size, fstype)
            .await
        {
            warn!(pool = %pool.volname, pv = name, error = %e, "create failed, rolling back");
            if let Err(e) = ledger.remove_pv_record(name).await {
                warn!(pool = %pool.volname, pv = name, error = %e, "ledger rollback failed");
            }
            pv::discard(&mount, pvtype, name).await;
            return Err(e);
        }

        Ok(Some(FoundPv {
            name: name.to_owned(),
            pvtype,
            size,
        }))
    }

    /// Allocate the data path, enforce quota, credit the ledger and finally
    /// write the info file that makes the PV visible.
    #[allow(clippy::too_many_arguments)]
    async fn materialize(
        &self,
        pool: &PoolInfo,
        mount: &Path,
        ledger: &PoolLedger,
        name: &str,
        pvtype: PvType,
        size: u64,
        fstype: &str,
    ) -> Result<(), CsiError> {
        let mkfs = (pvtype == PvType::Virtblock).then_some((self.config.mkfs_xfs_bin.as_str(), fstype));
        let abspath = pv::allocate(mount, pvtype, name, size, mkfs).await?;
        if pvtype == PvType::Subvol {
            self.quota
                .apply(pool, &abspath, &pvtype.pv_path(name), size)
                .await?;
        }
        ledger.update_pv_record(name, size).await?;
        pv::write_info(mount, pvtype, name, size).await?;
        info!(pool = %pool.volname, pv = name, %pvtype, size, "pv committed");
        Ok(())
    }

    /// Return the existing PV named like `req` or place a new one. Runs under
    /// the per-name lock.
    async fn provision(
        &self,
        req: &CreateVolumeRequest,
        pvtype: PvType,
        params: &StorageClassParams,
    ) -> Result<Volume, CsiError> {
        if let Some(found) = self.locate(&req.name).await? {
            if found.pv.size != req.capacity_bytes {
                return Err(CsiError::AlreadyExists(req.name.clone()));
            }
            info!(pool = %found.pool.volname, "volume already exists");
            return Ok(self.volume(&found.pool, &found.pv, params));
        }

        let mut pools = self.registry.list(&params.pool_filter(pvtype)).await?;
        if pools.is_empty() {
            return Err(CsiError::ResourceExhausted(format!(
                "no pool accepts {pvtype} volumes with these parameters"
            )));
        }
        pools.shuffle(&mut rand::rng());

        let fstype = params.fstype.as_deref().unwrap_or(DEFAULT_FSTYPE);
        for pool in &pools {
            match self
                .place_on(pool, &req.name, pvtype, req.capacity_bytes, fstype)
                .await
            {
                Ok(Some(pv)) => {
                    info!(pool = %pool.volname, %pvtype, "volume created");
                    return Ok(self.volume(pool, &pv, params));
                }
                Ok(None) => {}
                Err(e @ CsiError::MountFailed { .. }) => {
                    warn!(pool = %pool.volname, error = %e, "skipping pool");
                }
                Err(e) => return Err(e),
            }
        }

        Err(CsiError::ResourceExhausted(format!(
            "{} bytes do not fit on any of {} candidate pools",
            req.capacity_bytes,
            pools.len()
        )))
    }

    /// Pool to publish a PV from. External pools without a descriptor are
    /// rebuilt from the volume context.
    async fn publish_pool(&self, ctx: &VolumeContext) -> Result<PoolInfo, CsiError> {
        if let Some(pool) = self.registry.by_name(&ctx.pool_name).await? {
            return Ok(pool);
        }
        if !ctx.pool_mode.is_external() {
            return Err(CsiError::BackendError(format!(
                "pool {} is not known on this node",
                ctx.pool_name
            )));
        }
        Ok(PoolInfo {
            volname: ctx.pool_name.clone(),
            volume_id: String::new(),
            pool_type: PoolType::External,
            kadalu_format: match ctx.pool_mode {
                PoolMode::ExternalGluster => KadaluFormat::NonNative,
                _ => KadaluFormat::Native,
            },
            pv_reclaim_policy: ReclaimPolicy::default(),
            bricks: Vec::new(),
            disperse: None,
            tiebreaker: None,
            options: Default::default(),
            single_pv_per_pool: ctx.single_pv_per_pool,
            supported_pvtype: Default::default(),
            gluster_hosts: ctx.gluster_hosts.clone(),
            gluster_volname: ctx.gluster_volname.clone(),
            gluster_options: ctx.options.clone(),
            mount_options: Vec::new(),
        })
    }

    /// Make a grown virtblock file visible to its filesystem, if attached.
    async fn grow_virtblock(&self, backing: &Path) {
        let backing = backing.display().to_string();
        let attached = match execute(&self.config.losetup_bin, ["-j", backing.as_str()]).await {
            Ok(out) => out.stdout,
            Err(e) => {
                warn!(file = %backing, error = %e, "cannot query loop devices");
                return;
            }
        };
        for device in attached.lines().filter_map(|l| l.split_once(':')).map(|(d, _)| d) {
            if let Err(e) = execute(&self.config.losetup_bin, ["-c", device]).await {
                warn!(device, error = %e, "loop capacity refresh failed");
                continue;
            }
            let target = match execute(
                &self.config.findmnt_bin,
                ["-n", "-o", "TARGET", "-S", device],
            )
            .await
            {
                Ok(out) => out.stdout.lines().next().unwrap_or_default().trim().to_owned(),
                Err(_) => continue,
            };
            if target.is_empty() {
                continue;
            }
            match execute(&self.config.xfs_growfs_bin, ["-d", target.as_str()]).await {
                Ok(_) => info!(device, target, "filesystem grown"),
                Err(e) => warn!(device, target, error = %e, "xfs_growfs failed"),
            }
        }
    }

    async fn run_mount(&self, args: &[&str], target: &str) -> Result<(), CsiError> {
        execute(&self.config.mount_bin, args)
            .await
            .map(|_| ())
            .map_err(|e| CsiError::MountFailed {
                path: target.to_owned(),
                reason: e.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// CsiIdentity
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiIdentity for KadaluBackend {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: DRIVER_NAME.to_owned(),
            vendor_version: self.config.vendor_version.clone(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        let ready = tokio::fs::metadata(self.registry.info_dir())
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !ready {
            warn!(dir = %self.registry.info_dir().display(), "pool info directory missing");
        }
        Ok(ready)
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(vec![PluginCapability::ControllerService])
    }
}

// ---------------------------------------------------------------------------
// CsiController
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiController for KadaluBackend {
    #[instrument(skip(self, req), fields(name = %req.name, size = req.capacity_bytes))]
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        if req.name.is_empty() {
            return Err(CsiError::InvalidArgument("volume name is required".into()));
        }
        if req.volume_capabilities.is_empty() {
            return Err(CsiError::InvalidArgument(
                "volume capabilities are required".into(),
            ));
        }
        if req.capacity_bytes == 0 {
            return Err(CsiError::InvalidArgument("volume size is required".into()));
        }

        let params = StorageClassParams::parse(&req.parameters)?;
        let pvtype = if req.volume_capabilities.iter().any(VolumeCapability::is_block) {
            PvType::Rawblock
        } else {
            params.pvtype.unwrap_or(PvType::Subvol)
        };
        if pvtype.requires_single_writer()
            && !req
                .volume_capabilities
                .iter()
                .all(|c| c.access_mode.is_single_node_writer())
        {
            return Err(CsiError::InvalidArgument(format!(
                "{pvtype} volumes support only single node writer access"
            )));
        }

        let name_lock = Arc::clone(self.creating.entry(req.name.clone()).or_default().value());
        let result = {
            let _creating = name_lock.lock().await;
            self.provision(&req, pvtype, &params).await
        };
        drop(name_lock);
        // Only the map still holds the lock once no request waits on it.
        self.creating
            .remove_if(&req.name, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    #[instrument(skip(self), fields(volume_id = %volume_id))]
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        let Some(found) = self.locate(&volume_id.0).await? else {
            debug!("volume not found, treating as already deleted");
            return Ok(());
        };
        let policy = found.pool.pv_reclaim_policy;
        let ledger = self.ledger(&found.pool, &found.mount).await?;

        let _guard = self.statfile_lock.lock().await;
        pv::remove(&found.mount, &found.pv, policy).await?;
        if policy != ReclaimPolicy::Retain {
            ledger.remove_pv_record(&found.pv.name).await?;
        }
        info!(pool = %found.pool.volname, ?policy, "volume deleted");
        Ok(())
    }

    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError> {
        if capabilities.is_empty() {
            return Err(CsiError::InvalidArgument(
                "volume capabilities are required".into(),
            ));
        }
        if self.locate(&volume_id.0).await?.is_none() {
            return Err(CsiError::VolumeNotFound(volume_id.0.clone()));
        }
        Ok(capabilities.iter().all(|c| c.access_mode.is_supported()))
    }

    #[instrument(skip(self))]
    async fn list_volumes(
        &self,
        starting_token: &str,
        max_entries: usize,
    ) -> Result<ListVolumesPage, CsiError> {
        let mut lister = self.lister.lock().await;

        if starting_token.is_empty() {
            let pools = self.mounted_pools().await?;
            if pools.is_empty() {
                return Err(CsiError::Aborted("no storage pool is available yet".into()));
            }
            *lister = Some(VolumeLister::new(
                pools
                    .into_iter()
                    .map(|(pool, mount)| PoolSource {
                        name: pool.volname,
                        mount,
                    }),
            ));
        }

        let current = lister
            .as_mut()
            .ok_or_else(|| CsiError::Aborted(format!("no listing at token {starting_token}")))?;
        if !starting_token.is_empty() && starting_token != current.token() {
            return Err(CsiError::Aborted(format!(
                "token {starting_token} does not continue the listing at {}",
                current.token()
            )));
        }

        let page = current.next_page(max_entries).await?;
        if page.next_token.is_empty() {
            *lister = None;
        }
        Ok(page)
    }

    #[instrument(skip(self), fields(volume_id = %volume_id))]
    async fn expand_volume(
        &self,
        volume_id: &VolumeId,
        capacity_bytes: u64,
    ) -> Result<u64, CsiError> {
        let Some(found) = self.locate(&volume_id.0).await? else {
            return Err(CsiError::VolumeNotFound(volume_id.0.clone()));
        };
        if found.pool.mode() == PoolMode::ExternalGluster {
            info!(pool = %found.pool.volname, "expansion is not managed on external gluster pools");
            return Ok(capacity_bytes);
        }
        if capacity_bytes <= found.pv.size {
            debug!(current = found.pv.size, "volume already large enough");
            return Ok(found.pv.size);
        }

        let ledger = self.ledger(&found.pool, &found.mount).await?;
        let _guard = self.statfile_lock.lock().await;
        let total = self.mounts.probe().capacity(&found.mount).await?;
        ledger.update_summary(total).await?;
        let stats = ledger.get_stats().await?;
        let delta = capacity_bytes - found.pv.size;
        if !stats.fits(delta) {
            return Err(CsiError::ResourceExhausted(format!(
                "pool {} cannot grow {} by {delta} bytes",
                found.pool.volname, volume_id
            )));
        }

        pv::resize(&found.mount, &found.pv, capacity_bytes).await?;
        match found.pv.pvtype {
            PvType::Subvol => {
                let abspath = pv::data_path(&found.mount, PvType::Subvol, &found.pv.name);
                self.quota
                    .apply(&found.pool, &abspath, &found.pv.path(), capacity_bytes)
                    .await?;
            }
            PvType::Virtblock => {
                self.grow_virtblock(&pv::data_path(&found.mount, PvType::Virtblock, &found.pv.name))
                    .await;
            }
            PvType::Rawblock => {}
        }
        ledger.update_pv_record(&found.pv.name, capacity_bytes).await?;

        info!(from = found.pv.size, to = capacity_bytes, "volume expanded");
        Ok(capacity_bytes)
    }

    async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
        Ok(vec![
            ControllerCapability::CreateDeleteVolume,
            ControllerCapability::ListVolumes,
            ControllerCapability::ExpandVolume,
        ])
    }
}

// ---------------------------------------------------------------------------
// CsiNode
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiNode for KadaluBackend {
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, target_path = %req.target_path))]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        if req.target_path.is_empty() {
            return Err(CsiError::InvalidArgument("target path is required".into()));
        }
        if is_mountpoint(&req.target_path).await {
            debug!("target already mounted, assuming idempotent retry");
            return Ok(());
        }

        let ctx = VolumeContext::from_map(&req.volume_context)?;
        let pool = self.publish_pool(&ctx).await?;
        let opts = split_opts(&ctx.options);
        let suffix = mount_suffix(&opts, &ctx.mount_options);
        let mount = self
            .mounts
            .mount(&pool, suffix.as_deref(), &opts, &ctx.mount_options)
            .await?;
        let source = mount.join(&ctx.path).display().to_string();
        let target = req.target_path.as_str();
        let mount_err = |e: std::io::Error| CsiError::MountFailed {
            path: target.to_owned(),
            reason: e.to_string(),
        };

        match ctx.pvtype {
            PvType::Subvol | PvType::Virtblock => {
                tokio::fs::create_dir_all(target).await.map_err(mount_err)?;
                let mut args = if ctx.pvtype == PvType::Subvol {
                    vec!["--bind"]
                } else {
                    vec!["-t", ctx.fstype.as_str()]
                };
                if req.read_only {
                    args.extend(["-o", "ro"]);
                }
                args.extend([source.as_str(), target]);
                self.run_mount(&args, target).await?;
                tokio::fs::set_permissions(target, std::fs::Permissions::from_mode(0o777))
                    .await
                    .map_err(mount_err)?;
            }
            PvType::Rawblock => {
                if let Some(parent) = Path::new(target).parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(mount_err)?;
                }
                tokio::fs::OpenOptions::new()
                    .create(true)
                    .truncate(false)
                    .write(true)
                    .open(target)
                    .await
                    .map_err(mount_err)?;
                let out = execute(&self.config.losetup_bin, ["-f", "--show", source.as_str()]).await?;
                let device = out.stdout.trim().to_owned();
                if device.is_empty() {
                    return Err(CsiError::MountFailed {
                        path: target.to_owned(),
                        reason: "losetup returned no device".into(),
                    });
                }
                self.run_mount(&["--bind", device.as_str(), target], target)
                    .await?;
                debug!(device, "loop device attached");
            }
        }

        info!(pool = %pool.volname, pvtype = %ctx.pvtype, read_only = req.read_only, "volume published");
        Ok(())
    }

    #[instrument(skip(self), fields(volume_id = %volume_id))]
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        if target_path.is_empty() {
            return Err(CsiError::InvalidArgument("target path is required".into()));
        }

        if target_path.contains("/volumeDevices/") {
            match execute(
                &self.config.findmnt_bin,
                ["-n", "-o", "SOURCE", "-T", target_path],
            )
            .await
            {
                Ok(out) => {
                    if let Some(device) = out.stdout.lines().next().and_then(loop_device_from_source) {
                        if let Err(e) = execute(&self.config.losetup_bin, ["-d", device.as_str()]).await {
                            warn!(device, error = %e, "loop device detach failed");
                        } else {
                            debug!(device, "loop device detached");
                        }
                    }
                }
                Err(e) => debug!(error = %e, "no loop device behind target"),
            }
        }

        self.mounts.unmount(Path::new(target_path)).await?;
        info!(target_path, "volume unpublished");
        Ok(())
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(NodeInfo {
            node_id: self.config.node_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use libpool::Brick;

    use super::*;
    use crate::mount::testing::{MarkerProbe, fake_glusterfs, script};

    const GIB: u64 = 1024 * 1024 * 1024;

    fn replica3(name: &str) -> PoolInfo {
        PoolInfo {
            volname: name.into(),
            volume_id: "0d7f3a54-6f4c-4a43-9c0e-1e5bbf3b4c11".into(),
            pool_type: PoolType::Replica3,
            kadalu_format: KadaluFormat::Native,
            pv_reclaim_policy: ReclaimPolicy::Delete,
            bricks: (0..3)
                .map(|i| Brick {
                    brick_path: format!("/bricks/{name}/data/brick"),
                    node: format!("server-{name}-{i}-0.{name}"),
                    node_id: format!("node-{i}"),
                    kube_hostname: format!("n{}", i + 1),
                    brick_index: i,
                    ..Default::default()
                })
                .collect(),
            disperse: None,
            tiebreaker: None,
            options: Default::default(),
            single_pv_per_pool: false,
            supported_pvtype: Default::default(),
            gluster_hosts: vec![],
            gluster_volname: String::new(),
            gluster_options: String::new(),
            mount_options: vec![],
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        root: PathBuf,
        backend: KadaluBackend,
    }

    impl Fixture {
        fn mount(&self, pool: &str) -> PathBuf {
            self.root.join("mnt").join(pool)
        }

        fn calls(&self, name: &str) -> String {
            std::fs::read_to_string(self.root.join(format!("{name}.calls"))).unwrap_or_default()
        }
    }

    fn logging_script(root: &Path, name: &str, extra: &str) -> String {
        let calls = root.join(format!("{name}.calls"));
        script(
            root,
            name,
            &format!("echo \"$@\" >> {}\n{extra}", calls.display()),
        )
    }

    fn external(name: &str) -> PoolInfo {
        PoolInfo {
            volname: name.into(),
            volume_id: String::new(),
            pool_type: PoolType::External,
            kadalu_format: KadaluFormat::NonNative,
            bricks: vec![],
            gluster_hosts: vec!["g1:24007".into()],
            gluster_volname: "gvol".into(),
            ..replica3(name)
        }
    }

    fn fixture(capacity: u64, pools: &[PoolInfo]) -> Fixture {
        fixture_with(capacity, pools, |_, _| {})
    }

    fn fixture_with(
        capacity: u64,
        pools: &[PoolInfo],
        tweak: impl FnOnce(&mut CsiConfig, &Path),
    ) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        let info_dir = root.join("info");
        std::fs::create_dir_all(&info_dir).unwrap();
        for pool in pools {
            std::fs::write(
                info_dir.join(format!("{}.info", pool.volname)),
                pool.to_json().unwrap(),
            )
            .unwrap();
        }

        let mut config = CsiConfig {
            node_id: "node-a".into(),
            info_dir: info_dir.clone(),
            mount_root: root.join("mnt"),
            client_log_file: root.join("client.log"),
            glusterfs_bin: fake_glusterfs(&root),
            mkfs_xfs_bin: logging_script(&root, "mkfs.xfs", ""),
            xfs_growfs_bin: logging_script(&root, "xfs_growfs", ""),
            mount_bin: logging_script(&root, "mount", ""),
            umount_bin: logging_script(&root, "umount", ""),
            losetup_bin: logging_script(
                &root,
                "losetup",
                "case \"$1\" in -f) echo /dev/loop7;; esac",
            ),
            findmnt_bin: logging_script(&root, "findmnt", "echo 'devtmpfs[/loop7]'"),
            ..Default::default()
        };
        tweak(&mut config, &root);
        let registry = PoolRegistry::new(info_dir).with_wait(Duration::from_millis(10), 1);
        let backend = KadaluBackend::new(config, registry, Arc::new(MarkerProbe { capacity }));
        Fixture {
            _tmp: tmp,
            root,
            backend,
        }
    }

    fn create_req(name: &str, size: u64, cap: VolumeCapability) -> CreateVolumeRequest {
        CreateVolumeRequest {
            name: name.into(),
            capacity_bytes: size,
            volume_capabilities: vec![cap],
            parameters: HashMap::new(),
        }
    }

    fn mnmw() -> VolumeCapability {
        VolumeCapability::mount(AccessMode::MultiNodeMultiWriter)
    }

    async fn stats(f: &Fixture, pool: &str) -> libpool::PoolStats {
        stats_at(&f.mount(pool), pool).await
    }

    async fn stats_at(mount: &Path, pool: &str) -> libpool::PoolStats {
        let ledger = PoolLedger::open(mount, pool).await.unwrap();
        let stats = ledger.get_stats().await.unwrap();
        ledger.close().await;
        stats
    }

    #[tokio::test]
    async fn create_replica3_subvol() {
        let f = fixture(10 * GIB, &[replica3("pool-a")]);
        let vol = f
            .backend
            .create_volume(create_req("pvc-1", GIB, mnmw()))
            .await
            .unwrap();

        assert_eq!(vol.volume_id.0, "pvc-1");
        assert_eq!(vol.capacity_bytes, GIB);
        let ctx = &vol.volume_context;
        assert_eq!(ctx["pool_mode"], "native");
        assert_eq!(ctx["pool_name"], "pool-a");
        assert_eq!(ctx["type"], "subvol");
        assert_eq!(ctx["fs"], "xfs");
        assert_eq!(ctx["path"], PvType::Subvol.pv_path("pvc-1"));

        assert!(pv::info_path(&f.mount("pool-a"), PvType::Subvol, "pvc-1").is_file());
        assert!(pv::data_path(&f.mount("pool-a"), PvType::Subvol, "pvc-1").is_dir());
        f.backend.shutdown().await;
        let stats = stats(&f, "pool-a").await;
        assert_eq!(stats.used, GIB);
        assert_eq!(stats.pvs, 1);
    }

    #[tokio::test]
    async fn block_requires_single_writer() {
        let f = fixture(10 * GIB, &[replica3("pool-a")]);
        let err = f
            .backend
            .create_volume(create_req(
                "pvc-2",
                GIB,
                VolumeCapability::block(AccessMode::MultiNodeMultiWriter),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::InvalidArgument(_)));
        assert!(!f.mount("pool-a").join("rawblock").exists());

        let vol = f
            .backend
            .create_volume(create_req(
                "pvc-2",
                GIB,
                VolumeCapability::block(AccessMode::SingleNodeWriter),
            ))
            .await
            .unwrap();
        assert_eq!(vol.volume_context["type"], "rawblock");
        let data = pv::data_path(&f.mount("pool-a"), PvType::Rawblock, "pvc-2");
        assert_eq!(std::fs::metadata(data).unwrap().len(), GIB);
    }

    #[tokio::test]
    async fn virtblock_is_formatted() {
        let f = fixture(10 * GIB, &[replica3("pool-a")]);
        let mut req = create_req(
            "pvc-v",
            GIB,
            VolumeCapability::mount(AccessMode::SingleNodeWriter),
        );
        req.parameters.insert("pvtype".into(), "virtblock".into());
        let vol = f.backend.create_volume(req).await.unwrap();
        assert_eq!(vol.volume_context["type"], "virtblock");

        let data = pv::data_path(&f.mount("pool-a"), PvType::Virtblock, "pvc-v");
        assert_eq!(f.calls("mkfs.xfs").trim(), data.display().to_string());
    }

    #[tokio::test]
    async fn recreate_is_idempotent() {
        let f = fixture(10 * GIB, &[replica3("pool-a")]);
        let first = f
            .backend
            .create_volume(create_req("pvc-1", GIB, mnmw()))
            .await
            .unwrap();
        let second = f
            .backend
            .create_volume(create_req("pvc-1", GIB, mnmw()))
            .await
            .unwrap();
        assert_eq!(first, second);

        let err = f
            .backend
            .create_volume(create_req("pvc-1", 2 * GIB, mnmw()))
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn reserved_headroom_is_kept() {
        let f = fixture(10 * GIB, &[replica3("pool-a")]);
        f.backend
            .create_volume(create_req("big", 8 * GIB, mnmw()))
            .await
            .unwrap();

        let free = 2 * GIB;
        let available = free - free / 10;
        let err = f
            .backend
            .create_volume(create_req("too-big", available + 1, mnmw()))
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::ResourceExhausted(_)));
        assert!(pv::search(&f.mount("pool-a"), "too-big").await.unwrap().is_none());

        f.backend
            .create_volume(create_req("just-fits", available, mnmw()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn single_pv_pool_takes_one_volume() {
        let mut pool = replica3("solo");
        pool.single_pv_per_pool = true;
        let f = fixture(10 * GIB, &[pool]);
        f.backend
            .create_volume(create_req("pvc-1", GIB, mnmw()))
            .await
            .unwrap();
        let err = f
            .backend
            .create_volume(create_req("pvc-2", GIB, mnmw()))
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn unknown_pool_name_is_exhausted() {
        let f = fixture(10 * GIB, &[replica3("pool-a")]);
        let mut req = create_req("pvc-1", GIB, mnmw());
        req.parameters.insert("storage_name".into(), "pool-z".into());
        assert!(matches!(
            f.backend.create_volume(req).await,
            Err(CsiError::ResourceExhausted(_))
        ));
    }

    #[tokio::test]
    async fn expand_subvol_updates_ledger_and_quota() {
        let f = fixture(10 * GIB, &[replica3("pool-a")]);
        f.backend
            .create_volume(create_req("pvc-1", GIB, mnmw()))
            .await
            .unwrap();

        let id = VolumeId::from("pvc-1");
        assert_eq!(f.backend.expand_volume(&id, 2 * GIB).await.unwrap(), 2 * GIB);
        assert_eq!(f.backend.expand_volume(&id, 3 * GIB).await.unwrap(), 3 * GIB);

        let mount = f.mount("pool-a");
        let info = pv::info_path(&mount, PvType::Subvol, "pvc-1");
        assert_eq!(pv::read_info(&info).await.unwrap(), 3 * GIB);

        // Only observable where trusted xattrs are writable.
        let dir = pv::data_path(&mount, PvType::Subvol, "pvc-1");
        if let Ok(Some(limit)) =
            libpool::xattr::get(&dir, libpool::constants::SQUOTA_LIMIT_XATTR)
        {
            assert_eq!(limit, (3 * GIB).to_string().into_bytes());
        }

        f.backend.shutdown().await;
        let stats = stats(&f, "pool-a").await;
        assert_eq!(stats.used, 3 * GIB);

        assert!(matches!(
            f.backend.expand_volume(&VolumeId::from("nope"), GIB).await,
            Err(CsiError::VolumeNotFound(_))
        ));
    }

    fn quota_over_ssh(exit: &'static str) -> impl FnOnce(&mut CsiConfig, &Path) {
        move |config, root| {
            config.ssh_bin = logging_script(root, "ssh", exit);
            config.quota_ssh_user = Some("kadalu".into());
        }
    }

    #[tokio::test]
    async fn failed_quota_leaves_no_volume_behind() {
        let f = fixture_with(10 * GIB, &[external("ext")], quota_over_ssh("exit 1"));
        let mount = f.root.join("mnt/ext_gvol");

        for attempt in 1..=2 {
            assert!(
                f.backend
                    .create_volume(create_req("pvc-q", GIB, mnmw()))
                    .await
                    .is_err()
            );
            assert_eq!(f.calls("ssh").lines().count(), attempt);
            assert!(!pv::info_path(&mount, PvType::Subvol, "pvc-q").exists());
            assert!(!pv::data_path(&mount, PvType::Subvol, "pvc-q").exists());
        }
        assert!(pv::search(&mount, "pvc-q").await.unwrap().is_none());

        f.backend.shutdown().await;
        let stats = stats_at(&mount, "ext").await;
        assert_eq!(stats.pvs, 0);
        assert_eq!(stats.used, 0);
    }

    #[tokio::test]
    async fn external_gluster_quota_and_expand() {
        let f = fixture_with(10 * GIB, &[external("ext")], quota_over_ssh(""));
        let mount = f.root.join("mnt/ext_gvol");
        let vol = f
            .backend
            .create_volume(create_req("pvc-s", GIB, mnmw()))
            .await
            .unwrap();
        assert_eq!(vol.volume_context["pool_mode"], "external-gluster");

        let calls = f.calls("ssh");
        assert_eq!(calls.lines().count(), 1);
        assert!(calls.contains(&format!(
            "limit-usage /{} 1020054732",
            PvType::Subvol.pv_path("pvc-s")
        )));

        // The external cluster owns the size; nothing on the pool changes.
        let id = VolumeId::from("pvc-s");
        assert_eq!(f.backend.expand_volume(&id, 5 * GIB).await.unwrap(), 5 * GIB);
        assert_eq!(f.calls("ssh").lines().count(), 1);
        let info = pv::info_path(&mount, PvType::Subvol, "pvc-s");
        assert_eq!(pv::read_info(&info).await.unwrap(), GIB);

        f.backend.shutdown().await;
        let stats = stats_at(&mount, "ext").await;
        assert_eq!(stats.pvs, 1);
        assert_eq!(stats.used, GIB);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_of_one_name_place_it_once() {
        let f = Arc::new(fixture(
            100 * GIB,
            &[replica3("pool-a"), replica3("pool-b"), replica3("pool-c")],
        ));
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let f = Arc::clone(&f);
                tokio::spawn(async move {
                    f.backend
                        .create_volume(create_req("pvc-race", GIB, mnmw()))
                        .await
                })
            })
            .collect();
        let mut volumes = Vec::new();
        for task in tasks {
            volumes.push(task.await.unwrap().unwrap());
        }
        assert!(volumes.windows(2).all(|w| w[0] == w[1]));

        let placed: Vec<_> = ["pool-a", "pool-b", "pool-c"]
            .into_iter()
            .filter(|p| pv::info_path(&f.mount(p), PvType::Subvol, "pvc-race").exists())
            .collect();
        assert_eq!(placed.len(), 1);
        assert!(f.backend.creating.is_empty());

        f.backend.shutdown().await;
        let mut used = 0;
        for pool in ["pool-a", "pool-b", "pool-c"] {
            used += stats(&f, pool).await.used;
        }
        assert_eq!(used, GIB);
    }

    #[tokio::test]
    async fn concurrent_ledger_opens_share_one_connection() {
        let f = fixture(10 * GIB, &[replica3("pool-a")]);
        let pool = replica3("pool-a");
        let mount = f.backend.mount_pool(&pool).await.unwrap();
        let (a, b) = tokio::join!(
            f.backend.ledger(&pool, &mount),
            f.backend.ledger(&pool, &mount)
        );
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(f.backend.ledgers.len(), 1);
    }

    #[tokio::test]
    async fn expand_rawblock_truncates() {
        let f = fixture(10 * GIB, &[replica3("pool-a")]);
        f.backend
            .create_volume(create_req(
                "pvc-r",
                GIB,
                VolumeCapability::block(AccessMode::SingleNodeWriter),
            ))
            .await
            .unwrap();
        f.backend
            .expand_volume(&VolumeId::from("pvc-r"), 2 * GIB)
            .await
            .unwrap();
        let data = pv::data_path(&f.mount("pool-a"), PvType::Rawblock, "pvc-r");
        assert_eq!(std::fs::metadata(data).unwrap().len(), 2 * GIB);
    }

    #[tokio::test]
    async fn delete_follows_reclaim_policy() {
        let mut archive = replica3("archive-pool");
        archive.pv_reclaim_policy = ReclaimPolicy::Archive;
        let f = fixture(10 * GIB, &[replica3("pool-a")]);
        f.backend
            .create_volume(create_req("pvc-1", GIB, mnmw()))
            .await
            .unwrap();

        let id = VolumeId::from("pvc-1");
        f.backend.delete_volume(&id).await.unwrap();
        let mount = f.mount("pool-a");
        assert!(!pv::info_path(&mount, PvType::Subvol, "pvc-1").exists());
        assert!(!pv::data_path(&mount, PvType::Subvol, "pvc-1").exists());

        // Deleting again is a no-op.
        f.backend.delete_volume(&id).await.unwrap();
        f.backend.shutdown().await;
        assert_eq!(stats(&f, "pool-a").await.used, 0);

        let f = fixture(10 * GIB, &[archive]);
        f.backend
            .create_volume(create_req("pvc-a", GIB, mnmw()))
            .await
            .unwrap();
        f.backend.delete_volume(&VolumeId::from("pvc-a")).await.unwrap();
        let mount = f.mount("archive-pool");
        let data = pv::data_path(&mount, PvType::Subvol, "pvc-a");
        assert!(!data.exists());
        assert!(data.with_file_name("archived-pvc-a").is_dir());
        assert!(pv::search(&mount, "pvc-a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retain_keeps_data_and_ledger() {
        let mut pool = replica3("keep");
        pool.pv_reclaim_policy = ReclaimPolicy::Retain;
        let f = fixture(10 * GIB, &[pool]);
        f.backend
            .create_volume(create_req("pvc-1", GIB, mnmw()))
            .await
            .unwrap();
        f.backend.delete_volume(&VolumeId::from("pvc-1")).await.unwrap();
        assert!(pv::search(&f.mount("keep"), "pvc-1").await.unwrap().is_some());
        f.backend.shutdown().await;
        assert_eq!(stats(&f, "keep").await.used, GIB);
    }

    #[tokio::test]
    async fn validate_capabilities() {
        let f = fixture(10 * GIB, &[replica3("pool-a")]);
        f.backend
            .create_volume(create_req("pvc-1", GIB, mnmw()))
            .await
            .unwrap();
        let id = VolumeId::from("pvc-1");

        assert!(
            f.backend
                .validate_volume_capabilities(&id, &[mnmw(), VolumeCapability::mount(AccessMode::SingleNodeWriter)])
                .await
                .unwrap()
        );
        assert!(
            !f.backend
                .validate_volume_capabilities(&id, &[VolumeCapability::mount(AccessMode::MultiNodeReaderOnly)])
                .await
                .unwrap()
        );
        assert!(matches!(
            f.backend
                .validate_volume_capabilities(&VolumeId::from("missing"), &[mnmw()])
                .await,
            Err(CsiError::VolumeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_volumes_pages() {
        let f = fixture(100 * GIB, &[replica3("pool-a")]);
        let mount = f.mount("pool-a");
        for i in 0..100 {
            pv::testing::committed(&mount, PvType::Subvol, &format!("pvc-{i}"), GIB).await;
        }

        let mut seen = Vec::new();
        let mut token = String::new();
        for (expected_len, expected_token) in [(30, "30"), (30, "60"), (30, "90"), (10, "")] {
            let page = f.backend.list_volumes(&token, 30).await.unwrap();
            assert_eq!(page.entries.len(), expected_len);
            assert_eq!(page.next_token, expected_token);
            seen.extend(page.entries.into_iter().map(|v| v.volume_id.0));
            token = page.next_token;
        }
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 100);

        assert!(matches!(
            f.backend.list_volumes("42", 30).await,
            Err(CsiError::Aborted(_))
        ));
        f.backend.list_volumes("", 30).await.unwrap();
        assert!(matches!(
            f.backend.list_volumes("31", 30).await,
            Err(CsiError::Aborted(_))
        ));
    }

    #[tokio::test]
    async fn list_without_pools_aborts() {
        let f = fixture(GIB, &[]);
        assert!(matches!(
            f.backend.list_volumes("", 10).await,
            Err(CsiError::Aborted(_))
        ));
    }

    fn publish_req(vol: &Volume, target: &Path, cap: VolumeCapability) -> NodePublishVolumeRequest {
        NodePublishVolumeRequest {
            volume_id: vol.volume_id.clone(),
            target_path: target.display().to_string(),
            volume_capability: cap,
            read_only: false,
            volume_context: vol.volume_context.clone(),
        }
    }

    #[tokio::test]
    async fn publish_subvol_and_virtblock() {
        let f = fixture(10 * GIB, &[replica3("pool-a")]);
        let sub = f
            .backend
            .create_volume(create_req("pvc-1", GIB, mnmw()))
            .await
            .unwrap();
        let target = f.root.join("pods/p1/volumes/pvc-1/mount");
        f.backend
            .publish_volume(publish_req(&sub, &target, mnmw()))
            .await
            .unwrap();

        let source = f.mount("pool-a").join(PvType::Subvol.pv_path("pvc-1"));
        assert_eq!(
            f.calls("mount").lines().next().unwrap(),
            format!("--bind {} {}", source.display(), target.display())
        );
        let mode = std::fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o777);

        let mut req = create_req("pvc-v", GIB, VolumeCapability::mount(AccessMode::SingleNodeWriter));
        req.parameters.insert("pvtype".into(), "virtblock".into());
        let virt = f.backend.create_volume(req).await.unwrap();
        let target = f.root.join("pods/p2/volumes/pvc-v/mount");
        f.backend
            .publish_volume(publish_req(&virt, &target, mnmw()))
            .await
            .unwrap();
        assert!(f.calls("mount").lines().nth(1).unwrap().starts_with("-t xfs "));
    }

    #[tokio::test]
    async fn publish_and_unpublish_rawblock() {
        let f = fixture(10 * GIB, &[replica3("pool-a")]);
        let cap = VolumeCapability::block(AccessMode::SingleNodeWriter);
        let vol = f
            .backend
            .create_volume(create_req("pvc-r", GIB, cap.clone()))
            .await
            .unwrap();
        let target = f.root.join("plugins/kubernetes.io/csi/volumeDevices/publish/pvc-r/pod");
        f.backend
            .publish_volume(publish_req(&vol, &target, cap))
            .await
            .unwrap();

        assert!(target.is_file());
        assert!(f.calls("losetup").starts_with("-f --show "));
        assert_eq!(
            f.calls("mount").trim(),
            format!("--bind /dev/loop7 {}", target.display())
        );

        f.backend
            .unpublish_volume(&vol.volume_id, &target.display().to_string())
            .await
            .unwrap();
        assert!(f.calls("losetup").contains("-d /dev/loop7"));
        assert_eq!(f.calls("umount").trim(), format!("-l {}", target.display()));
    }

    #[tokio::test]
    async fn publish_rejects_bad_context() {
        let f = fixture(10 * GIB, &[replica3("pool-a")]);
        let vol = Volume {
            volume_id: VolumeId::from("pvc-x"),
            capacity_bytes: GIB,
            volume_context: HashMap::from([("version".to_owned(), "2".to_owned())]),
        };
        let target = f.root.join("t");
        assert!(matches!(
            f.backend.publish_volume(publish_req(&vol, &target, mnmw())).await,
            Err(CsiError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn identity_and_node_info() {
        let f = fixture(GIB, &[replica3("pool-a")]);
        let info = f.backend.get_plugin_info().await.unwrap();
        assert_eq!(info.name, "kadalu.gluster");
        assert!(f.backend.probe().await.unwrap());
        assert_eq!(f.backend.get_info().await.unwrap().node_id, "node-a");
        assert_eq!(
            f.backend.get_plugin_capabilities().await.unwrap(),
            vec![PluginCapability::ControllerService]
        );
    }

    #[test]
    fn loop_device_parsing() {
        assert_eq!(loop_device_from_source("devtmpfs[/loop3]").as_deref(), Some("/dev/loop3"));
        assert_eq!(loop_device_from_source("udev[/dev/loop1]").as_deref(), Some("/dev/loop1"));
        assert_eq!(loop_device_from_source("/dev/loop2\n").as_deref(), Some("/dev/loop2"));
        assert_eq!(loop_device_from_source("server:/vol"), None);
    }
}
