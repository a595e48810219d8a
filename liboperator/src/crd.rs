//! `KadaluStorage` custom resource.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Desired state of one storage pool.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "kadalu-operator.storage",
    version = "v1alpha1",
    kind = "KadaluStorage",
    plural = "kadalustorages",
    shortname = "kds",
    namespaced,
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct KadaluStorageSpec {
    /// Replica1, Replica2, Replica3, Disperse or External.
    #[serde(rename = "type")]
    pub pool_type: String,

    /// delete (default), archive or retain.
    #[serde(rename = "pvReclaimPolicy", default, skip_serializing_if = "Option::is_none")]
    pub pv_reclaim_policy: Option<String>,

    /// Generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_id: Option<String>,

    #[serde(default)]
    pub storage: Vec<StorageUnitSpec>,

    /// Replica2 only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tiebreaker: Option<TiebreakerSpec>,

    /// Disperse only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disperse: Option<DisperseSpec>,

    /// Xlator options keyed `<xlator>.<option>`.
    #[serde(default)]
    pub options: BTreeMap<String, String>,

    /// External only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<ExternalDetails>,

    /// native or non-native.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kadalu_format: Option<String>,

    #[serde(default)]
    pub single_pv_per_pool: bool,
}

/// One storage unit. Exactly one of `path`, `device` or `pvc` backs it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct StorageUnitSpec {
    #[serde(default)]
    pub node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc: Option<String>,
    #[serde(default)]
    pub decommissioned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct TiebreakerSpec {
    pub node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct DisperseSpec {
    pub data: u32,
    pub redundancy: u32,
}

/// Coordinates of an existing Gluster volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ExternalDetails {
    #[serde(default)]
    pub gluster_hosts: Vec<String>,
    #[serde(default)]
    pub gluster_volname: String,
    #[serde(default)]
    pub gluster_options: String,
}

/// The CustomResourceDefinition as pretty-printed JSON.
pub fn crd_manifest() -> Result<String, serde_json::Error> {
    use kube::CustomResourceExt;
    serde_json::to_string_pretty(&KadaluStorage::crd())
}
