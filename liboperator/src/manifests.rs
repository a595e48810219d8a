//! Kubernetes objects the controller applies for a pool.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use libpool::constants::{DRIVER_NAME, GLUSTERD_PORT, POOL_INFO_DIR};
use libpool::{Brick, PoolInfo};
use serde_json::json;

use crate::error::OperatorError;
use crate::pool_info::{unit_mount_dir, unit_name};

pub const INFO_CONFIGMAP: &str = "kadalu-info";
pub const FIELD_MANAGER: &str = "kadalu-operator";
pub const POOL_LABEL: &str = "kadalu.io/pool";
pub const UNIT_LABEL: &str = "kadalu.io/unit";
const COMPONENT_LABEL: &str = "app.kubernetes.io/component";
const PART_OF_LABEL: &str = "app.kubernetes.io/part-of";

/// Deployment-wide settings of the operator.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    pub namespace: String,
    pub server_image: String,
    pub info_configmap: String,
    pub version: String,
}

impl OperatorConfig {
    pub fn new(namespace: impl Into<String>, images_hub: &str, version: &str) -> Self {
        Self {
            namespace: namespace.into(),
            server_image: format!("{images_hub}/kadalu/kadalu-server:{version}"),
            info_configmap: INFO_CONFIGMAP.to_owned(),
            version: version.to_owned(),
        }
    }
}

pub fn storage_class_name(pool: &str) -> String {
    format!("kadalu.{pool}")
}

/// Key of the pool's descriptor in the info map.
pub fn info_key(pool: &str) -> String {
    format!("{pool}.info")
}

/// Labels shared by every unit of `pool`; also the service selector.
pub fn pool_labels(pool: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (PART_OF_LABEL.to_owned(), "kadalu".to_owned()),
        (COMPONENT_LABEL.to_owned(), "server".to_owned()),
        (POOL_LABEL.to_owned(), pool.to_owned()),
    ])
}

pub fn storage_class(pool: &PoolInfo) -> StorageClass {
    StorageClass {
        metadata: ObjectMeta {
            name: Some(storage_class_name(&pool.volname)),
            labels: Some(BTreeMap::from([(
                PART_OF_LABEL.to_owned(),
                "kadalu".to_owned(),
            )])),
            ..Default::default()
        },
        provisioner: DRIVER_NAME.to_owned(),
        allow_volume_expansion: Some(true),
        parameters: Some(BTreeMap::from([(
            "storage_name".to_owned(),
            pool.volname.clone(),
        )])),
        ..Default::default()
    }
}

/// Headless service giving each unit a stable DNS name.
pub fn service(config: &OperatorConfig, pool: &PoolInfo) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(pool.volname.clone()),
            namespace: Some(config.namespace.clone()),
            labels: Some(pool_labels(&pool.volname)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_owned()),
            selector: Some(pool_labels(&pool.volname)),
            ports: Some(vec![ServicePort {
                name: Some("glusterd".to_owned()),
                port: i32::from(GLUSTERD_PORT),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// One single-replica StatefulSet per storage unit, pinned to the unit's
/// node.
pub fn stateful_set(
    config: &OperatorConfig,
    pool: &PoolInfo,
    brick: &Brick,
) -> Result<StatefulSet, OperatorError> {
    let idx = brick.brick_index as usize;
    let name = unit_name(&pool.volname, idx);
    let mount_dir = unit_mount_dir(&pool.volname);

    let mut labels = pool_labels(&pool.volname);
    labels.insert(UNIT_LABEL.to_owned(), idx.to_string());

    let mut volumes = vec![json!({
        "name": "kadalu-info",
        "configMap": {"name": config.info_configmap},
    })];
    let mut mounts = vec![json!({"name": "kadalu-info", "mountPath": POOL_INFO_DIR})];
    if !brick.brick_device.is_empty() {
        volumes.push(json!({
            "name": "brick-device",
            "hostPath": {"path": brick.brick_device, "type": "BlockDevice"},
        }));
        mounts.push(json!({"name": "brick-device", "mountPath": brick.brick_device}));
    } else if !brick.pvc_name.is_empty() {
        volumes.push(json!({
            "name": "brick",
            "persistentVolumeClaim": {"claimName": brick.pvc_name},
        }));
        mounts.push(json!({"name": "brick", "mountPath": mount_dir}));
    } else {
        volumes.push(json!({
            "name": "brick",
            "hostPath": {"path": brick.host_brick_path, "type": "DirectoryOrCreate"},
        }));
        mounts.push(json!({"name": "brick", "mountPath": mount_dir}));
    }

    let env = [
        ("VOLUME", pool.volname.clone()),
        ("VOLUME_ID", pool.volume_id.clone()),
        ("BRICK_PATH", brick.brick_path.clone()),
        ("BRICK_INDEX", idx.to_string()),
        ("BRICK_DEVICE", brick.brick_device.clone()),
        ("BRICK_DEVICE_DIR", brick.brick_device_dir.clone()),
        ("BRICK_FS", "xfs".to_owned()),
        ("NODEID", brick.node_id.clone()),
        ("KADALU_NAMESPACE", config.namespace.clone()),
        ("KADALU_VERSION", config.version.clone()),
    ]
    .into_iter()
    .map(|(name, value)| json!({"name": name, "value": value}))
    .collect::<Vec<_>>();

    let manifest = json!({
        "apiVersion": "apps/v1",
        "kind": "StatefulSet",
        "metadata": {
            "name": name,
            "namespace": config.namespace,
            "labels": labels,
        },
        "spec": {
            "replicas": 1,
            "serviceName": pool.volname,
            "selector": {"matchLabels": labels},
            "template": {
                "metadata": {"labels": labels},
                "spec": {
                    "hostname": format!("{name}-0"),
                    "subdomain": pool.volname,
                    "nodeSelector": {"kubernetes.io/hostname": brick.kube_hostname},
                    "containers": [{
                        "name": "server",
                        "image": config.server_image,
                        "command": ["kadalu", "server"],
                        "securityContext": {"privileged": true},
                        "ports": [{"name": "glusterd", "containerPort": GLUSTERD_PORT}],
                        "env": env,
                        "volumeMounts": mounts,
                    }],
                    "volumes": volumes,
                },
            },
        },
    });
    Ok(serde_json::from_value(manifest)?)
}
