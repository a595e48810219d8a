//! Everything the controller needs from the cluster, behind one trait.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolume, Service};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use libpool::PoolInfo;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt::Debug;
use tracing::{debug, info};

use crate::error::OperatorError;
use crate::manifests::{FIELD_MANAGER, POOL_LABEL, info_key};

#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// The descriptor currently published for `pool`, if any.
    async fn read_pool_info(&self, pool: &str) -> Result<Option<PoolInfo>, OperatorError>;
    async fn upsert_pool_info(&self, info: &PoolInfo) -> Result<(), OperatorError>;
    async fn remove_pool_info(&self, pool: &str) -> Result<(), OperatorError>;

    async fn apply_storage_class(&self, sc: &StorageClass) -> Result<(), OperatorError>;
    async fn delete_storage_class(&self, name: &str) -> Result<(), OperatorError>;
    async fn apply_service(&self, svc: &Service) -> Result<(), OperatorError>;
    async fn delete_service(&self, name: &str) -> Result<(), OperatorError>;
    async fn apply_stateful_set(&self, sts: &StatefulSet) -> Result<(), OperatorError>;
    /// Remove every unit workload labelled with `pool`.
    async fn delete_stateful_sets(&self, pool: &str) -> Result<(), OperatorError>;

    /// Persistent volumes whose `storageClassName` is `storage_class`.
    async fn count_pvs(&self, storage_class: &str) -> Result<usize, OperatorError>;
}

/// [`ClusterApi`] on top of a live kube client.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    namespace: String,
    info_configmap: String,
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

impl KubeCluster {
    pub fn new(
        client: Client,
        namespace: impl Into<String>,
        info_configmap: impl Into<String>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            info_configmap: info_configmap.into(),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn namespaced<K>(&self) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn apply<K>(&self, api: Api<K>, obj: &K) -> Result<(), OperatorError>
    where
        K: Resource + Clone + Serialize + DeserializeOwned + Debug,
    {
        let name = obj.meta().name.clone().unwrap_or_default();
        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(obj),
        )
        .await?;
        debug!(%name, "applied");
        Ok(())
    }

    async fn delete<K>(&self, api: Api<K>, name: &str) -> Result<(), OperatorError>
    where
        K: Resource + Clone + DeserializeOwned + Debug,
    {
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn read_pool_info(&self, pool: &str) -> Result<Option<PoolInfo>, OperatorError> {
        let api: Api<ConfigMap> = self.namespaced();
        let Some(cm) = api.get_opt(&self.info_configmap).await? else {
            return Ok(None);
        };
        match cm.data.as_ref().and_then(|d| d.get(&info_key(pool))) {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    async fn upsert_pool_info(&self, info: &PoolInfo) -> Result<(), OperatorError> {
        let api: Api<ConfigMap> = self.namespaced();
        let key = info_key(&info.volname);
        let value = info.to_json()?;

        if api.get_opt(&self.info_configmap).await?.is_none() {
            let cm = ConfigMap {
                metadata: ObjectMeta {
                    name: Some(self.info_configmap.clone()),
                    namespace: Some(self.namespace.clone()),
                    ..Default::default()
                },
                data: Some(BTreeMap::from([(key, value)])),
                ..Default::default()
            };
            api.create(&PostParams::default(), &cm).await?;
            info!(configmap = %self.info_configmap, pool = %info.volname, "created info map");
            return Ok(());
        }

        let patch = json!({"data": {key: value}});
        api.patch(
            &self.info_configmap,
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn remove_pool_info(&self, pool: &str) -> Result<(), OperatorError> {
        let api: Api<ConfigMap> = self.namespaced();
        let patch = json!({"data": {info_key(pool): null}});
        match api
            .patch(
                &self.info_configmap,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_storage_class(&self, sc: &StorageClass) -> Result<(), OperatorError> {
        self.apply(Api::<StorageClass>::all(self.client.clone()), sc)
            .await
    }

    async fn delete_storage_class(&self, name: &str) -> Result<(), OperatorError> {
        self.delete(Api::<StorageClass>::all(self.client.clone()), name)
            .await
    }

    async fn apply_service(&self, svc: &Service) -> Result<(), OperatorError> {
        self.apply(self.namespaced::<Service>(), svc).await
    }

    async fn delete_service(&self, name: &str) -> Result<(), OperatorError> {
        self.delete(self.namespaced::<Service>(), name).await
    }

    async fn apply_stateful_set(&self, sts: &StatefulSet) -> Result<(), OperatorError> {
        self.apply(self.namespaced::<StatefulSet>(), sts).await
    }

    async fn delete_stateful_sets(&self, pool: &str) -> Result<(), OperatorError> {
        let api: Api<StatefulSet> = self.namespaced();
        let selector = format!("{POOL_LABEL}={pool}");
        let list = api.list(&ListParams::default().labels(&selector)).await?;
        for sts in list.items {
            if let Some(name) = sts.metadata.name.as_deref() {
                self.delete(api.clone(), name).await?;
            }
        }
        Ok(())
    }

    async fn count_pvs(&self, storage_class: &str) -> Result<usize, OperatorError> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        let pvs = api.list(&ListParams::default()).await?;
        Ok(pvs
            .items
            .iter()
            .filter(|pv| {
                pv.spec
                    .as_ref()
                    .and_then(|s| s.storage_class_name.as_deref())
                    == Some(storage_class)
            })
            .count())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory cluster used by controller tests.

    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeCluster {
        pub infos: Mutex<BTreeMap<String, PoolInfo>>,
        pub storage_classes: Mutex<BTreeSet<String>>,
        pub services: Mutex<BTreeSet<String>>,
        pub stateful_sets: Mutex<BTreeMap<String, StatefulSet>>,
        pub pvs: Mutex<BTreeMap<String, usize>>,
    }

    impl FakeCluster {
        pub fn units(&self) -> Vec<String> {
            self.stateful_sets.lock().unwrap().keys().cloned().collect()
        }
    }

    #[async_trait]
    impl ClusterApi for FakeCluster {
        async fn read_pool_info(&self, pool: &str) -> Result<Option<PoolInfo>, OperatorError> {
            Ok(self.infos.lock().unwrap().get(pool).cloned())
        }

        async fn upsert_pool_info(&self, info: &PoolInfo) -> Result<(), OperatorError> {
            self.infos
                .lock()
                .unwrap()
                .insert(info.volname.clone(), info.clone());
            Ok(())
        }

        async fn remove_pool_info(&self, pool: &str) -> Result<(), OperatorError> {
            self.infos.lock().unwrap().remove(pool);
            Ok(())
        }

        async fn apply_storage_class(&self, sc: &StorageClass) -> Result<(), OperatorError> {
            let name = sc.metadata.name.clone().unwrap_or_default();
            self.storage_classes.lock().unwrap().insert(name);
            Ok(())
        }

        async fn delete_storage_class(&self, name: &str) -> Result<(), OperatorError> {
            self.storage_classes.lock().unwrap().remove(name);
            Ok(())
        }

        async fn apply_service(&self, svc: &Service) -> Result<(), OperatorError> {
            let name = svc.metadata.name.clone().unwrap_or_default();
            self.services.lock().unwrap().insert(name);
            Ok(())
        }

        async fn delete_service(&self, name: &str) -> Result<(), OperatorError> {
            self.services.lock().unwrap().remove(name);
            Ok(())
        }

        async fn apply_stateful_set(&self, sts: &StatefulSet) -> Result<(), OperatorError> {
            let name = sts.metadata.name.clone().unwrap_or_default();
            self.stateful_sets.lock().unwrap().insert(name, sts.clone());
            Ok(())
        }

        async fn delete_stateful_sets(&self, pool: &str) -> Result<(), OperatorError> {
            self.stateful_sets.lock().unwrap().retain(|_, sts| {
                sts.metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(POOL_LABEL))
                    .map(String::as_str)
                    != Some(pool)
            });
            Ok(())
        }

        async fn count_pvs(&self, storage_class: &str) -> Result<usize, OperatorError> {
            Ok(self
                .pvs
                .lock()
                .unwrap()
                .get(storage_class)
                .copied()
                .unwrap_or(0))
        }
    }
}
