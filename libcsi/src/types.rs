//! Core CSI types: volumes, capabilities, requests and storage-class
//! parameters.
//!
//! These types form the data model shared by the CSI traits, the gRPC
//! transport and the Kadalu backend. They carry no protobuf types so the
//! backend can be exercised without a server.

use std::collections::HashMap;
use std::fmt;

use libpool::{ExternalIdentity, KadaluFormat, PoolFilter, PoolMode, PoolType, PvType};

use crate::error::CsiError;

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Opaque, unique identifier for a volume. Kadalu uses the PV name itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct VolumeId(pub String);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

/// CSI access modes, numbered as on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Unknown,
    SingleNodeWriter,
    SingleNodeReaderOnly,
    MultiNodeReaderOnly,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
    SingleNodeSingleWriter,
    SingleNodeMultiWriter,
}

impl AccessMode {
    pub fn from_i32(v: i32) -> Self {
        match v {
            1 => Self::SingleNodeWriter,
            2 => Self::SingleNodeReaderOnly,
            3 => Self::MultiNodeReaderOnly,
            4 => Self::MultiNodeSingleWriter,
            5 => Self::MultiNodeMultiWriter,
            6 => Self::SingleNodeSingleWriter,
            7 => Self::SingleNodeMultiWriter,
            _ => Self::Unknown,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            Self::Unknown => 0,
            Self::SingleNodeWriter => 1,
            Self::SingleNodeReaderOnly => 2,
            Self::MultiNodeReaderOnly => 3,
            Self::MultiNodeSingleWriter => 4,
            Self::MultiNodeMultiWriter => 5,
            Self::SingleNodeSingleWriter => 6,
            Self::SingleNodeMultiWriter => 7,
        }
    }

    /// Modes a block-backed PV can be handed out with.
    pub fn is_single_node_writer(self) -> bool {
        matches!(self, Self::SingleNodeWriter | Self::SingleNodeSingleWriter)
    }

    /// Modes `ValidateVolumeCapabilities` confirms.
    pub fn is_supported(self) -> bool {
        matches!(self, Self::SingleNodeWriter | Self::MultiNodeMultiWriter)
    }
}

/// How the workload consumes the volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessType {
    Mount {
        fs_type: String,
        mount_flags: Vec<String>,
    },
    Block,
}

impl Default for AccessType {
    fn default() -> Self {
        Self::Mount {
            fs_type: String::new(),
            mount_flags: Vec::new(),
        }
    }
}

/// Describes the capabilities required from a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeCapability {
    pub access_mode: AccessMode,
    pub access_type: AccessType,
}

impl Default for VolumeCapability {
    fn default() -> Self {
        Self {
            access_mode: AccessMode::MultiNodeMultiWriter,
            access_type: AccessType::default(),
        }
    }
}

impl VolumeCapability {
    pub fn block(access_mode: AccessMode) -> Self {
        Self {
            access_mode,
            access_type: AccessType::Block,
        }
    }

    pub fn mount(access_mode: AccessMode) -> Self {
        Self {
            access_mode,
            access_type: AccessType::default(),
        }
    }

    pub fn is_block(&self) -> bool {
        self.access_type == AccessType::Block
    }
}

// ---------------------------------------------------------------------------
// Volume metadata
// ---------------------------------------------------------------------------

/// A provisioned volume as reported to the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Volume {
    pub volume_id: VolumeId,
    pub capacity_bytes: u64,
    /// Opaque context passed from Controller to Node operations.
    pub volume_context: HashMap<String, String>,
}

/// One page of `ListVolumes`.
#[derive(Debug, Clone, Default)]
pub struct ListVolumesPage {
    pub entries: Vec<Volume>,
    /// Empty on the final page.
    pub next_token: String,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Request to create a new volume.
#[derive(Debug, Clone, Default)]
pub struct CreateVolumeRequest {
    pub name: String,
    /// `required_bytes`, or `limit_bytes` when only that is set.
    pub capacity_bytes: u64,
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Storage-class parameters.
    pub parameters: HashMap<String, String>,
}

/// Request to publish a volume into a pod.
#[derive(Debug, Clone)]
pub struct NodePublishVolumeRequest {
    pub volume_id: VolumeId,
    /// Directory (mount) or file (block) kubelet expects the volume at.
    pub target_path: String,
    pub volume_capability: VolumeCapability,
    pub read_only: bool,
    pub volume_context: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Storage-class parameters
// ---------------------------------------------------------------------------

/// Storage-class parameters understood by `CreateVolume`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageClassParams {
    pub storage_name: Option<String>,
    pub storage_type: Option<PoolType>,
    pub pvtype: Option<PvType>,
    pub kadalu_format: Option<KadaluFormat>,
    pub node_affinity: Option<String>,
    pub gluster_hosts: Vec<String>,
    pub gluster_volname: Option<String>,
    pub single_pv_per_pool: bool,
    /// Extra mount options, comma separated in the storage class.
    pub storage_options: Vec<String>,
    pub fstype: Option<String>,
}

fn comma_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

fn non_empty(params: &HashMap<String, String>, key: &str) -> Option<String> {
    params
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

impl StorageClassParams {
    pub fn parse(params: &HashMap<String, String>) -> Result<Self, CsiError> {
        let storage_type = non_empty(params, "storage_type")
            .map(|v| v.parse::<PoolType>())
            .transpose()
            .map_err(|e| CsiError::InvalidArgument(e.to_string()))?;
        let pvtype = non_empty(params, "pvtype")
            .map(|v| v.parse::<PvType>())
            .transpose()
            .map_err(|e| CsiError::InvalidArgument(e.to_string()))?;
        let kadalu_format = match non_empty(params, "kadalu_format").as_deref() {
            None => None,
            Some("native") => Some(KadaluFormat::Native),
            Some("non-native") => Some(KadaluFormat::NonNative),
            Some(other) => {
                return Err(CsiError::InvalidArgument(format!(
                    "unknown kadalu_format {other}"
                )));
            }
        };

        Ok(Self {
            storage_name: non_empty(params, "storage_name"),
            storage_type,
            pvtype,
            kadalu_format,
            node_affinity: non_empty(params, "node_affinity"),
            gluster_hosts: params
                .get("gluster_hosts")
                .map(|v| comma_list(v))
                .unwrap_or_default(),
            gluster_volname: non_empty(params, "gluster_volname"),
            single_pv_per_pool: params
                .get("single_pv_per_pool")
                .is_some_and(|v| matches!(v.trim(), "true" | "yes" | "1")),
            storage_options: params
                .get("storage_options")
                .map(|v| comma_list(v))
                .unwrap_or_default(),
            fstype: non_empty(params, "fstype"),
        })
    }

    /// Registry filter selecting the pools this class may place a PV on.
    pub fn pool_filter(&self, pvtype: PvType) -> PoolFilter {
        let external = self.gluster_volname.as_ref().map(|volname| ExternalIdentity {
            volname: volname.clone(),
            hosts: self.gluster_hosts.clone(),
            single_pv_per_pool: self.single_pv_per_pool,
        });
        let mode = match (&external, self.kadalu_format) {
            (Some(_), Some(KadaluFormat::Native)) => Some(PoolMode::ExternalKadalu),
            (Some(_), Some(KadaluFormat::NonNative)) => Some(PoolMode::ExternalGluster),
            _ => None,
        };
        PoolFilter {
            name: self.storage_name.clone(),
            pool_type: self.storage_type,
            mode,
            pvtype: Some(pvtype),
            node_affinity: self.node_affinity.clone(),
            external,
        }
    }
}

// ---------------------------------------------------------------------------
// Plugin & node info
// ---------------------------------------------------------------------------

/// Information about the CSI plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInfo {
    pub name: String,
    pub vendor_version: String,
}

/// Capabilities advertised by the Identity service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginCapability {
    ControllerService,
}

/// Capabilities advertised by the Controller service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerCapability {
    CreateDeleteVolume,
    ListVolumes,
    ExpandVolume,
}

/// Information about the node on which the CSI Node service runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_id: String,
}
