//! `KadaluStorage` event handling.
//!
//! [`PoolController::handle`] turns one watch event into cluster changes
//! through a [`ClusterApi`]; [`PoolController::watch`] feeds it from the
//! API server and keeps going across connection failures.

use std::future::Future;
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use kube::ResourceExt;
use kube::api::{Api, ListParams, WatchEvent, WatchParams};
use libpool::PoolType;
use tracing::{error, info, instrument, warn};

use crate::cluster::{ClusterApi, KubeCluster};
use crate::crd::KadaluStorage;
use crate::error::OperatorError;
use crate::manifests::{self, OperatorConfig, storage_class_name};
use crate::pool_info;

/// Pause before re-subscribing after the watch stream failed.
pub const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub enum PoolEvent {
    Added(KadaluStorage),
    Modified(KadaluStorage),
    Deleted(KadaluStorage),
}

impl PoolEvent {
    pub fn resource(&self) -> &KadaluStorage {
        match self {
            Self::Added(ks) | Self::Modified(ks) | Self::Deleted(ks) => ks,
        }
    }
}

/// What handling an event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Descriptor published and `units` workloads applied.
    Deployed { units: usize },
    /// Descriptor published; external pools run no units.
    InfoOnly,
    /// Every object of the pool was removed.
    Removed,
    /// Deletion refused while persistent volumes still use the pool.
    InUse { pvs: usize },
}

pub struct PoolController<C> {
    cluster: C,
    config: OperatorConfig,
}

impl<C: ClusterApi> PoolController<C> {
    pub fn new(cluster: C, config: OperatorConfig) -> Self {
        Self { cluster, config }
    }

    pub fn cluster(&self) -> &C {
        &self.cluster
    }

    pub async fn handle(&self, event: PoolEvent) -> Result<Outcome, OperatorError> {
        match event {
            PoolEvent::Added(ks) => self.added(&ks).await,
            PoolEvent::Modified(ks) => self.modified(&ks).await,
            PoolEvent::Deleted(ks) => self.deleted(&ks).await,
        }
    }

    #[instrument(skip_all, fields(pool = %ks.name_any()))]
    async fn added(&self, ks: &KadaluStorage) -> Result<Outcome, OperatorError> {
        let name = ks.name_any();
        let previous = self.cluster.read_pool_info(&name).await?;
        let info = pool_info::build(&name, &ks.spec, previous.as_ref())?;
        self.deploy(info).await
    }

    #[instrument(skip_all, fields(pool = %ks.name_any()))]
    async fn modified(&self, ks: &KadaluStorage) -> Result<Outcome, OperatorError> {
        let name = ks.name_any();
        let previous = self.cluster.read_pool_info(&name).await?;
        let info = pool_info::build(&name, &ks.spec, previous.as_ref())?;

        if info.pool_type == PoolType::External
            || previous
                .as_ref()
                .is_some_and(|p| p.pool_type == PoolType::External)
        {
            return Err(OperatorError::invalid(
                &name,
                "External pools cannot be modified",
            ));
        }
        if let Some(previous) = previous.as_ref().filter(|p| p.pool_type != info.pool_type) {
            return Err(OperatorError::invalid(
                &name,
                format!(
                    "pool type cannot change from {} to {}",
                    previous.pool_type, info.pool_type
                ),
            ));
        }
        self.deploy(info).await
    }

    async fn deploy(&self, info: libpool::PoolInfo) -> Result<Outcome, OperatorError> {
        self.cluster.upsert_pool_info(&info).await?;
        info!(volume_id = %info.volume_id, kind = %info.pool_type, "pool info published");

        if info.pool_type == PoolType::External {
            return Ok(Outcome::InfoOnly);
        }

        self.cluster
            .apply_storage_class(&manifests::storage_class(&info))
            .await?;
        self.cluster
            .apply_service(&manifests::service(&self.config, &info))
            .await?;
        for brick in &info.bricks {
            let sts = manifests::stateful_set(&self.config, &info, brick)?;
            self.cluster.apply_stateful_set(&sts).await?;
        }
        info!(units = info.bricks.len(), "storage units deployed");
        Ok(Outcome::Deployed {
            units: info.bricks.len(),
        })
    }

    #[instrument(skip_all, fields(pool = %ks.name_any()))]
    async fn deleted(&self, ks: &KadaluStorage) -> Result<Outcome, OperatorError> {
        let name = ks.name_any();
        let sc = storage_class_name(&name);

        let pvs = self.cluster.count_pvs(&sc).await?;
        if pvs > 0 {
            warn!(pvs, storage_class = %sc, "pool still has persistent volumes, not deleting");
            return Ok(Outcome::InUse { pvs });
        }

        self.cluster.delete_storage_class(&sc).await?;
        self.cluster.remove_pool_info(&name).await?;
        self.cluster.delete_stateful_sets(&name).await?;
        self.cluster.delete_service(&name).await?;
        info!("pool removed");
        Ok(Outcome::Removed)
    }

    async fn dispatch(&self, event: PoolEvent) {
        if let Err(e) = self.handle(event).await {
            error!(error = %e, "failed to handle KadaluStorage event");
        }
    }

    /// Follow `api` until `shutdown` resolves.
    ///
    /// Existing resources are replayed as additions first. A failed stream
    /// is re-opened from the last seen `resourceVersion` after
    /// [`RESUBSCRIBE_DELAY`].
    pub async fn watch<F>(&self, api: Api<KadaluStorage>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut resource_version: Option<String> = None;

        loop {
            let result = tokio::select! {
                _ = &mut shutdown => break,
                r = self.watch_once(&api, &mut resource_version) => r,
            };
            if let Err(e) = result {
                warn!(error = %e, delay = ?RESUBSCRIBE_DELAY, "watch interrupted, re-subscribing");
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
                }
            }
        }
        info!("pool controller stopped");
    }

    async fn watch_once(
        &self,
        api: &Api<KadaluStorage>,
        resource_version: &mut Option<String>,
    ) -> Result<(), OperatorError> {
        let version = match resource_version.clone() {
            Some(version) => version,
            None => {
                let list = api.list(&ListParams::default()).await?;
                for ks in list.items {
                    self.dispatch(PoolEvent::Added(ks)).await;
                }
                list.metadata.resource_version.unwrap_or_default()
            }
        };
        *resource_version = Some(version.clone());

        let mut stream = api.watch(&WatchParams::default(), &version).await?.boxed();
        while let Some(event) = stream.try_next().await? {
            let event = match event {
                WatchEvent::Added(ks) => PoolEvent::Added(ks),
                WatchEvent::Modified(ks) => PoolEvent::Modified(ks),
                WatchEvent::Deleted(ks) => PoolEvent::Deleted(ks),
                WatchEvent::Bookmark(bookmark) => {
                    *resource_version = Some(bookmark.metadata.resource_version);
                    continue;
                }
                WatchEvent::Error(e) if e.code == 410 => {
                    info!("resource version expired, listing again");
                    *resource_version = None;
                    return Ok(());
                }
                WatchEvent::Error(e) => return Err(kube::Error::Api(e).into()),
            };
            if let Some(version) = event.resource().resource_version() {
                *resource_version = Some(version);
            }
            self.dispatch(event).await;
        }
        Ok(())
    }
}

/// Watch `KadaluStorage` resources in `config.namespace` of the cluster the
/// process runs in, until `shutdown` resolves.
pub async fn run<F>(config: OperatorConfig, shutdown: F) -> Result<(), OperatorError>
where
    F: Future<Output = ()>,
{
    let client = kube::Client::try_default().await?;
    let api: Api<KadaluStorage> = Api::namespaced(client.clone(), &config.namespace);
    let cluster = KubeCluster::new(client, &config.namespace, &config.info_configmap);
    info!(namespace = %config.namespace, image = %config.server_image, "starting pool controller");
    PoolController::new(cluster, config).watch(api, shutdown).await;
    Ok(())
}
