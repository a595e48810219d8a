//! PV size enforcement.
//!
//! Three mechanisms, chosen by where the PV lives:
//!
//! * native and external-kadalu pools get the simple-quota xattrs on the PV
//!   directory, read by the `features/simple-quota` brick xlator;
//! * external-gluster pools get a gluster directory quota set over ssh;
//! * bricks on XFS get a project quota from the [`QuotaCrawler`], which runs
//!   next to the bricks and converges every 2 s.

use std::collections::{HashMap, HashSet};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use libpool::constants::{
    GLUSTERD_WORKDIR, KADALU_QUOTA_INFO, PV_INFO_DIR, SQUOTA_LIMIT_XATTR,
    SQUOTA_NAMESPACE_XATTR, XFS_QUOTA_BIN,
};
use libpool::exec::execute;
use libpool::xattr::{self, SetMode};
use libpool::{PoolInfo, PoolMode, PvType};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::CsiConfig;
use crate::error::CsiError;
use crate::pv;

/// Set `trusted.glusterfs.namespace` and `trusted.gfs.squota.limit` on `dir`.
///
/// Filesystems without trusted xattrs are logged and skipped.
pub fn set_simple_quota(dir: &Path, size: u64) -> Result<(), CsiError> {
    let attrs = [
        (SQUOTA_NAMESPACE_XATTR, "true".to_owned()),
        (SQUOTA_LIMIT_XATTR, size.to_string()),
    ];
    for (name, value) in attrs {
        match xattr::set(dir, name, value.as_bytes(), SetMode::Any) {
            Ok(()) => {}
            Err(e) if xattr::is_unsupported(&e) => {
                warn!(dir = %dir.display(), xattr = name, error = %e, "simple quota unavailable");
                return Ok(());
            }
            Err(e) => {
                return Err(CsiError::BackendError(format!(
                    "setxattr {name} on {}: {e}",
                    dir.display()
                )));
            }
        }
    }
    debug!(dir = %dir.display(), size, "simple quota set");
    Ok(())
}

/// 95 % of `size`, the limit used for gluster directory quotas.
pub fn external_quota_limit(size: u64) -> u64 {
    size / 100 * 95 + size % 100 * 95 / 100
}

/// Applies quota right after a subvol PV is created or resized.
#[derive(Debug, Clone)]
pub struct QuotaEnforcer {
    simple_quota: bool,
    ssh_bin: String,
    ssh_user: Option<String>,
}

impl QuotaEnforcer {
    pub fn new(config: &CsiConfig) -> Self {
        Self {
            simple_quota: config.simple_quota,
            ssh_bin: config.ssh_bin.clone(),
            ssh_user: config.quota_ssh_user.clone(),
        }
    }

    /// Limit the subvol PV at `pv_dir` (relative `pv_path`) to `size`.
    pub async fn apply(
        &self,
        pool: &PoolInfo,
        pv_dir: &Path,
        pv_path: &str,
        size: u64,
    ) -> Result<(), CsiError> {
        match pool.mode() {
            PoolMode::Native | PoolMode::ExternalKadalu => {
                if self.simple_quota {
                    set_simple_quota(pv_dir, size)?;
                }
                Ok(())
            }
            PoolMode::ExternalGluster => self.apply_external(pool, pv_path, size).await,
        }
    }

    async fn apply_external(&self, pool: &PoolInfo, pv_path: &str, size: u64) -> Result<(), CsiError> {
        let Some(user) = &self.ssh_user else {
            debug!(pool = %pool.volname, "no quota ssh user, skipping directory quota");
            return Ok(());
        };
        let Some(host) = pool.gluster_hosts.first() else {
            warn!(pool = %pool.volname, "external pool lists no hosts, skipping directory quota");
            return Ok(());
        };
        let host = host.split(':').next().unwrap_or(host);
        let limit = external_quota_limit(size).to_string();
        let dir = format!("/{pv_path}");
        let args = [
            "-oStrictHostKeyChecking=no",
            &format!("{user}@{host}"),
            "sudo",
            "gluster",
            "volume",
            "quota",
            pool.mount_src(),
            "limit-usage",
            &dir,
            &limit,
        ];
        execute(&self.ssh_bin, args).await?;
        info!(pool = %pool.volname, dir, limit, "directory quota set");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// XFS project quota crawler
// ---------------------------------------------------------------------------

/// Project id for a PV directory: its inode number truncated to 32 bits.
pub fn project_id(ino: u64) -> u32 {
    (ino % (1u64 << 32)) as u32
}

/// Parse `xfs_quota -x -c 'report -p -b'` into project id → hard limit in
/// bytes.
pub fn parse_report(report: &str) -> HashMap<u32, u64> {
    report
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let id = fields.next()?.strip_prefix('#')?.parse::<u32>().ok()?;
            let _used = fields.next()?;
            let _soft = fields.next()?;
            let hard_kib = fields.next()?.parse::<u64>().ok()?;
            Some((id, hard_kib * 1024))
        })
        .collect()
}

#[derive(Deserialize)]
struct KadaluQuotaInfo {
    #[serde(default)]
    bricks: Vec<PathBuf>,
}

/// Paths and binary used by the crawler.
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    pub glusterd_workdir: PathBuf,
    pub kadalu_info: PathBuf,
    pub xfs_quota_bin: String,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            glusterd_workdir: PathBuf::from(GLUSTERD_WORKDIR),
            kadalu_info: PathBuf::from(KADALU_QUOTA_INFO),
            xfs_quota_bin: XFS_QUOTA_BIN.to_owned(),
        }
    }
}

fn key_value(raw: &str, key: &str) -> Option<String> {
    raw.lines()
        .filter_map(|l| l.split_once('='))
        .find(|(k, _)| k.trim() == key)
        .map(|(_, v)| v.trim().to_owned())
}

fn is_kadalu_brick(path: &Path) -> bool {
    path.join(PV_INFO_DIR).is_dir() && path.join(PvType::Subvol.as_str()).is_dir()
}

/// Keeps XFS project quotas of subvol PVs in line with their info files.
pub struct QuotaCrawler {
    config: CrawlerConfig,
    /// brick → PV name → size already enforced.
    applied: HashMap<PathBuf, HashMap<String, u64>>,
}

impl QuotaCrawler {
    pub fn new(config: CrawlerConfig) -> Self {
        Self {
            config,
            applied: HashMap::new(),
        }
    }

    /// Bricks of this node that host Kadalu PVs: glusterd-managed bricks
    /// whose `uuid=` matches the local node, plus the static list in
    /// `kadalu.info`.
    pub fn discover_bricks(&self) -> Vec<PathBuf> {
        let mut bricks = Vec::new();

        let local_uuid = std::fs::read_to_string(self.config.glusterd_workdir.join("glusterd.info"))
            .ok()
            .and_then(|raw| key_value(&raw, "UUID"));

        if let Some(uuid) = &local_uuid
            && let Ok(vols) = std::fs::read_dir(self.config.glusterd_workdir.join("vols"))
        {
            for vol in vols.flatten() {
                let Ok(files) = std::fs::read_dir(vol.path().join("bricks")) else {
                    continue;
                };
                for file in files.flatten() {
                    let Ok(raw) = std::fs::read_to_string(file.path()) else {
                        continue;
                    };
                    if key_value(&raw, "uuid").as_deref() != Some(uuid.as_str()) {
                        continue;
                    }
                    if let Some(path) = key_value(&raw, "path") {
                        bricks.push(PathBuf::from(path));
                    }
                }
            }
        }

        if let Ok(raw) = std::fs::read_to_string(&self.config.kadalu_info) {
            match serde_json::from_str::<KadaluQuotaInfo>(&raw) {
                Ok(info) => bricks.extend(info.bricks),
                Err(e) => warn!(path = %self.config.kadalu_info.display(), error = %e, "bad kadalu.info"),
            }
        }

        bricks.retain(|b| is_kadalu_brick(b));
        bricks.sort();
        bricks.dedup();
        bricks
    }

    async fn xfs_quota(&self, brick: &Path, command: &str) -> Result<String, CsiError> {
        let brick = brick.display().to_string();
        let out = execute(
            &self.config.xfs_quota_bin,
            ["-x", "-c", command, brick.as_str()],
        )
        .await?;
        Ok(out.stdout)
    }

    /// One pass over `brick`. Returns how many PVs had their limit set.
    pub async fn crawl_brick(&mut self, brick: &Path) -> Result<usize, CsiError> {
        let report = parse_report(&self.xfs_quota(brick, "report -p -b").await?);
        let subvol_info = brick.join(PV_INFO_DIR).join(PvType::Subvol.as_str());
        let mut changed = 0;
        let mut seen = HashSet::new();

        for info_file in pv::info_files(brick).await? {
            if !info_file.starts_with(&subvol_info) {
                continue;
            }
            let Some(name) = pv::name_of(&info_file) else {
                continue;
            };
            seen.insert(name.clone());
            let size = match pv::read_info(&info_file).await {
                Ok(size) => size,
                Err(e) => {
                    warn!(file = %info_file.display(), error = %e, "skipping unreadable info file");
                    continue;
                }
            };
            if self
                .applied
                .get(brick)
                .and_then(|m| m.get(&name))
                .is_some_and(|s| *s == size)
            {
                continue;
            }

            let dir = pv::data_path(brick, PvType::Subvol, &name);
            let Ok(meta) = std::fs::metadata(&dir) else {
                continue;
            };
            let projid = project_id(meta.ino());

            if report.get(&projid) != Some(&size.div_ceil(1024).saturating_mul(1024)) {
                let dir_s = dir.display().to_string();
                self.xfs_quota(brick, &format!("project -s -p {dir_s} {projid}"))
                    .await?;
                self.xfs_quota(brick, &format!("limit -p bhard={size} {projid}"))
                    .await?;
                info!(pv = %name, projid, size, "project quota set");
                changed += 1;
            }

            self.applied
                .entry(brick.to_path_buf())
                .or_default()
                .insert(name, size);
        }

        if let Some(applied) = self.applied.get_mut(brick) {
            applied.retain(|name, _| seen.contains(name));
        }
        Ok(changed)
    }

    /// One pass over every discovered brick. Per-brick failures are logged.
    pub async fn crawl_once(&mut self) -> usize {
        let mut changed = 0;
        let bricks = self.discover_bricks();
        self.applied.retain(|brick, _| bricks.contains(brick));
        for brick in bricks {
            match self.crawl_brick(&brick).await {
                Ok(n) => changed += n,
                Err(e) => warn!(brick = %brick.display(), error = %e, "quota crawl failed"),
            }
        }
        changed
    }

    /// Crawl every `interval` until `shutdown` resolves.
    pub async fn run(mut self, interval: Duration, shutdown: impl std::future::Future<Output = ()>) {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("quota crawler stopping");
                    return;
                }
                _ = ticker.tick() => {
                    let changed = self.crawl_once().await;
                    if changed > 0 {
                        debug!(changed, "quota crawl pass");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::testing::script;

    const REPORT: &str = "\
Project quota on /bricks/pool-a/data/brick (/dev/sdb)
                               Blocks
Project ID       Used       Soft       Hard    Warn/Grace
---------- --------------------------------------------------
#0                  0          0          0     00 [--------]
#4242            1024          0    1048576     00 [--------]
";

    #[test]
    fn project_id_truncates() {
        assert_eq!(project_id(42), 42);
        assert_eq!(project_id((1 << 32) + 7), 7);
        assert_eq!(project_id(u64::MAX), u32::MAX);
    }

    #[test]
    fn report_parsing() {
        let limits = parse_report(REPORT);
        assert_eq!(limits.len(), 2);
        assert_eq!(limits[&4242], 1 << 30);
        assert_eq!(limits[&0], 0);
    }

    #[test]
    fn external_limit_is_95_percent() {
        assert_eq!(external_quota_limit(100), 95);
        assert_eq!(external_quota_limit(1 << 30), 1020054732);
    }

    #[tokio::test]
    async fn discovery_and_crawl() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();

        let brick = root.join("bricks/b1");
        pv::testing::committed(&brick, PvType::Subvol, "pvc-1", 1 << 30).await;
        let other = root.join("bricks/other-node");
        pv::testing::committed(&other, PvType::Subvol, "pvc-x", 1).await;
        let listed = root.join("bricks/listed");
        pv::testing::committed(&listed, PvType::Subvol, "pvc-2", 2048).await;

        let workdir = root.join("glusterd");
        std::fs::create_dir_all(workdir.join("vols/gvol/bricks")).unwrap();
        std::fs::write(workdir.join("glusterd.info"), "UUID=me\noperating-version=1\n").unwrap();
        std::fs::write(
            workdir.join("vols/gvol/bricks/h1:b1"),
            format!("uuid=me\nhostname=h1\npath={}\n", brick.display()),
        )
        .unwrap();
        std::fs::write(
            workdir.join("vols/gvol/bricks/h2:b2"),
            format!("uuid=them\nhostname=h2\npath={}\n", other.display()),
        )
        .unwrap();
        let kadalu_info = root.join("kadalu.info");
        std::fs::write(
            &kadalu_info,
            serde_json::json!({ "bricks": [listed.display().to_string()] }).to_string(),
        )
        .unwrap();

        let calls = root.join("xfs_quota.calls");
        let bin = script(
            root,
            "xfs_quota",
            &format!("echo \"$3\" >> {}", calls.display()),
        );
        let mut crawler = QuotaCrawler::new(CrawlerConfig {
            glusterd_workdir: workdir,
            kadalu_info,
            xfs_quota_bin: bin,
        });

        assert_eq!(crawler.discover_bricks(), vec![brick.clone(), listed.clone()]);

        assert_eq!(crawler.crawl_once().await, 2);
        let log = std::fs::read_to_string(&calls).unwrap();
        assert!(log.contains("limit -p bhard=1073741824 "));
        assert!(log.contains("limit -p bhard=2048 "));

        // Unchanged sizes are skipped on the next pass.
        assert_eq!(crawler.crawl_once().await, 0);

        pv::write_info(&brick, PvType::Subvol, "pvc-1", 2 << 30).await.unwrap();
        assert_eq!(crawler.crawl_once().await, 1);

        // Deleted PVs and vanished bricks leave the cache.
        pv::testing::committed(&brick, PvType::Subvol, "pvc-3", 4096).await;
        let gone = pv::search(&brick, "pvc-1").await.unwrap().unwrap();
        pv::remove(&brick, &gone, libpool::ReclaimPolicy::Delete).await.unwrap();
        std::fs::remove_file(&crawler.config.kadalu_info).unwrap();
        assert_eq!(crawler.crawl_once().await, 1);
        let cached: Vec<_> = crawler.applied[&brick].keys().cloned().collect();
        assert_eq!(cached, vec!["pvc-3"]);
        assert!(!crawler.applied.contains_key(&listed));
    }

    #[tokio::test]
    async fn external_quota_over_ssh() {
        let tmp = tempfile::tempdir().unwrap();
        let calls = tmp.path().join("ssh.calls");
        let bin = script(tmp.path(), "ssh", &format!("echo \"$@\" > {}", calls.display()));
        let config = CsiConfig {
            ssh_bin: bin,
            quota_ssh_user: Some("kadalu".into()),
            ..Default::default()
        };
        let pool = PoolInfo {
            volname: "ext".into(),
            volume_id: String::new(),
            pool_type: libpool::PoolType::External,
            kadalu_format: libpool::KadaluFormat::NonNative,
            pv_reclaim_policy: Default::default(),
            bricks: vec![],
            disperse: None,
            tiebreaker: None,
            options: Default::default(),
            single_pv_per_pool: false,
            supported_pvtype: Default::default(),
            gluster_hosts: vec!["g1:24007".into()],
            gluster_volname: "gvol".into(),
            gluster_options: String::new(),
            mount_options: vec![],
        };

        QuotaEnforcer::new(&config)
            .apply(&pool, Path::new("/unused"), "subvol/aa/bb/pvc-1", 100)
            .await
            .unwrap();
        let args = std::fs::read_to_string(&calls).unwrap();
        assert_eq!(
            args.trim(),
            "-oStrictHostKeyChecking=no kadalu@g1 sudo gluster volume quota gvol limit-usage /subvol/aa/bb/pvc-1 95"
        );
    }
}
