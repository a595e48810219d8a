//! Pool registry.
//!
//! The operator publishes one `<name>.info` JSON file per pool into a
//! ConfigMap that is mounted into every CSI pod. [`PoolRegistry`] reads that
//! directory and narrows the result through a [`PoolFilter`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::constants::POOL_INFO_DIR;
use crate::error::PoolError;
use crate::types::{PoolInfo, PoolMode, PoolType, PvType};

/// Identity of an external Gluster volume as named by a storage class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalIdentity {
    pub volname: String,
    pub hosts: Vec<String>,
    pub single_pv_per_pool: bool,
}

/// Composable pool filter; `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct PoolFilter {
    pub name: Option<String>,
    pub pool_type: Option<PoolType>,
    pub mode: Option<PoolMode>,
    pub pvtype: Option<PvType>,
    /// Kubernetes node a PV must be local to. Only Replica1 pools can honour
    /// this.
    pub node_affinity: Option<String>,
    pub external: Option<ExternalIdentity>,
}

impl PoolFilter {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, pool: &PoolInfo) -> bool {
        if let Some(name) = &self.name
            && &pool.volname != name
        {
            return false;
        }
        if let Some(pool_type) = self.pool_type
            && pool.pool_type != pool_type
        {
            return false;
        }
        if let Some(mode) = self.mode
            && pool.mode() != mode
        {
            return false;
        }
        if let Some(pvtype) = self.pvtype
            && !pool.supported_pvtype.supports(pvtype)
        {
            return false;
        }
        if let Some(node) = &self.node_affinity {
            let local = pool.pool_type == PoolType::Replica1
                && pool.bricks.iter().any(|b| &b.kube_hostname == node);
            if !local {
                return false;
            }
        }
        if let Some(ext) = &self.external {
            let same = pool.mode().is_external()
                && pool.single_pv_per_pool == ext.single_pv_per_pool
                && pool.gluster_volname == ext.volname
                && pool.gluster_hosts == ext.hosts;
            if !same {
                return false;
            }
        }
        true
    }
}

/// Reader for the flat directory of pool descriptors.
#[derive(Debug, Clone)]
pub struct PoolRegistry {
    info_dir: PathBuf,
    retry_interval: Duration,
    max_attempts: u32,
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new(POOL_INFO_DIR)
    }
}

impl PoolRegistry {
    /// Registry over `info_dir` that waits up to 40 × 3 s for the ConfigMap
    /// to appear.
    pub fn new(info_dir: impl Into<PathBuf>) -> Self {
        Self {
            info_dir: info_dir.into(),
            retry_interval: Duration::from_secs(3),
            max_attempts: 40,
        }
    }

    /// Override the empty-directory wait.
    pub fn with_wait(mut self, retry_interval: Duration, max_attempts: u32) -> Self {
        self.retry_interval = retry_interval;
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn info_dir(&self) -> &Path {
        &self.info_dir
    }

    /// Every descriptor that parses and validates. Malformed files are
    /// skipped with a warning.
    async fn read_all(&self) -> Result<Vec<PoolInfo>, PoolError> {
        let mut dir = match tokio::fs::read_dir(&self.info_dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(PoolError::io(
                    format!("read_dir {}", self.info_dir.display()),
                    e,
                ));
            }
        };

        let mut paths = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| PoolError::io("read pool info dir", e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("info") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut pools = Vec::with_capacity(paths.len());
        for path in paths {
            match PoolInfo::load(&path) {
                Ok(pool) => pools.push(pool),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping pool descriptor"),
            }
        }
        Ok(pools)
    }

    /// All pools matching `filter`.
    ///
    /// An empty info directory usually means the ConfigMap has not been
    /// projected yet, so the read is retried before giving up with an empty
    /// list.
    pub async fn list(&self, filter: &PoolFilter) -> Result<Vec<PoolInfo>, PoolError> {
        let mut attempt = 0;
        let pools = loop {
            attempt += 1;
            let pools = self.read_all().await?;
            if !pools.is_empty() || attempt >= self.max_attempts {
                break pools;
            }
            debug!(attempt, dir = %self.info_dir.display(), "no pool descriptors yet, waiting");
            tokio::time::sleep(self.retry_interval).await;
        };

        let total = pools.len();
        let filtered: Vec<PoolInfo> = pools.into_iter().filter(|p| filter.matches(p)).collect();
        if filtered.is_empty() && total > 0 {
            info!(total, ?filter, "no pool matched filter");
        }
        Ok(filtered)
    }

    pub async fn by_name(&self, name: &str) -> Result<Option<PoolInfo>, PoolError> {
        Ok(self
            .list(&PoolFilter::by_name(name))
            .await?
            .into_iter()
            .next())
    }
}
