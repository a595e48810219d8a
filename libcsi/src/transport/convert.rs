//! Conversions between the generated protobuf messages and [`crate::types`].

use crate::error::CsiError;
use crate::proto;
use crate::proto::controller_service_capability::{self, rpc};
use crate::proto::plugin_capability::{self, service};
use crate::proto::volume_capability::{self as pb_cap, access_mode::Mode};
use crate::types::{
    AccessMode, AccessType, ControllerCapability, CreateVolumeRequest, NodePublishVolumeRequest,
    PluginCapability, Volume, VolumeCapability, VolumeId,
};

pub fn capability_from_proto(cap: &proto::VolumeCapability) -> VolumeCapability {
    let access_mode = AccessMode::from_i32(cap.access_mode.as_ref().map_or(0, |m| m.mode));
    let access_type = match &cap.access_type {
        Some(pb_cap::AccessType::Block(_)) => AccessType::Block,
        Some(pb_cap::AccessType::Mount(m)) => AccessType::Mount {
            fs_type: m.fs_type.clone(),
            mount_flags: m.mount_flags.clone(),
        },
        None => AccessType::default(),
    };
    VolumeCapability {
        access_mode,
        access_type,
    }
}

pub fn capability_to_proto(cap: &VolumeCapability) -> proto::VolumeCapability {
    let access_type = match &cap.access_type {
        AccessType::Block => pb_cap::AccessType::Block(pb_cap::BlockVolume {}),
        AccessType::Mount {
            fs_type,
            mount_flags,
        } => pb_cap::AccessType::Mount(pb_cap::MountVolume {
            fs_type: fs_type.clone(),
            mount_flags: mount_flags.clone(),
            volume_mount_group: String::new(),
        }),
    };
    proto::VolumeCapability {
        access_type: Some(access_type),
        access_mode: Some(pb_cap::AccessMode {
            mode: cap.access_mode.as_i32(),
        }),
    }
}

pub fn volume_to_proto(volume: Volume) -> proto::Volume {
    proto::Volume {
        capacity_bytes: i64::try_from(volume.capacity_bytes).unwrap_or(i64::MAX),
        volume_id: volume.volume_id.0,
        volume_context: volume.volume_context,
        accessible_topology: Vec::new(),
    }
}

/// `required_bytes`, falling back to `limit_bytes`.
pub fn requested_bytes(range: Option<&proto::CapacityRange>) -> Result<u64, CsiError> {
    let Some(range) = range else {
        return Ok(0);
    };
    let bytes = if range.required_bytes > 0 {
        range.required_bytes
    } else {
        range.limit_bytes
    };
    u64::try_from(bytes)
        .map_err(|_| CsiError::InvalidArgument(format!("negative capacity {bytes}")))
}

pub fn create_request_from_proto(
    req: proto::CreateVolumeRequest,
) -> Result<CreateVolumeRequest, CsiError> {
    Ok(CreateVolumeRequest {
        capacity_bytes: requested_bytes(req.capacity_range.as_ref())?,
        volume_capabilities: req
            .volume_capabilities
            .iter()
            .map(capability_from_proto)
            .collect(),
        name: req.name,
        parameters: req.parameters,
    })
}

pub fn publish_request_from_proto(
    req: proto::NodePublishVolumeRequest,
) -> Result<NodePublishVolumeRequest, CsiError> {
    let capability = req
        .volume_capability
        .as_ref()
        .map(capability_from_proto)
        .ok_or_else(|| CsiError::InvalidArgument("volume capability is required".into()))?;
    if req.volume_id.is_empty() {
        return Err(CsiError::InvalidArgument("volume id is required".into()));
    }
    Ok(NodePublishVolumeRequest {
        volume_id: VolumeId(req.volume_id),
        target_path: req.target_path,
        volume_capability: capability,
        read_only: req.readonly,
        volume_context: req.volume_context,
    })
}

pub fn plugin_capability_to_proto(cap: PluginCapability) -> proto::PluginCapability {
    let kind = match cap {
        PluginCapability::ControllerService => service::Type::ControllerService,
    };
    proto::PluginCapability {
        r#type: Some(plugin_capability::Type::Service(plugin_capability::Service {
            r#type: kind as i32,
        })),
    }
}

pub fn controller_capability_to_proto(
    cap: ControllerCapability,
) -> proto::ControllerServiceCapability {
    let kind = match cap {
        ControllerCapability::CreateDeleteVolume => rpc::Type::CreateDeleteVolume,
        ControllerCapability::ListVolumes => rpc::Type::ListVolumes,
        ControllerCapability::ExpandVolume => rpc::Type::ExpandVolume,
    };
    proto::ControllerServiceCapability {
        r#type: Some(controller_service_capability::Type::Rpc(
            controller_service_capability::Rpc { r#type: kind as i32 },
        )),
    }
}

/// Wire value of an access mode, for tests and logging.
pub fn mode_name(mode: i32) -> &'static str {
    Mode::try_from(mode).map_or("UNKNOWN", |m| m.as_str_name())
}
