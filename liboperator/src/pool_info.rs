//! Conversion of a `KadaluStorage` spec into the pool descriptor every other
//! component reads.

use libpool::constants::GLUSTERD_PORT;
use libpool::{Brick, Disperse, PoolInfo, PoolType, Tiebreaker};
use uuid::Uuid;

use crate::crd::{KadaluStorageSpec, StorageUnitSpec};
use crate::error::OperatorError;
use crate::validate::parse_spec;

/// Directory a unit's backing storage is mounted on inside its container.
pub fn unit_mount_dir(pool: &str) -> String {
    format!("/bricks/{pool}/data")
}

/// Brick directory inside the unit's container.
pub fn unit_brick_path(pool: &str) -> String {
    format!("{}/brick", unit_mount_dir(pool))
}

/// StatefulSet name of unit `idx`.
pub fn unit_name(pool: &str, idx: usize) -> String {
    format!("server-{pool}-{idx}")
}

/// Stable DNS name of unit `idx` behind the pool's headless service.
pub fn unit_address(pool: &str, idx: usize) -> String {
    format!("{}-0.{pool}", unit_name(pool, idx))
}

fn brick(pool: &str, idx: usize, unit: &StorageUnitSpec) -> Brick {
    let device = unit.device.clone().unwrap_or_default();
    Brick {
        brick_path: unit_brick_path(pool),
        kube_hostname: unit.node.clone(),
        node: unit_address(pool, idx),
        node_id: format!("node-{idx}"),
        host_brick_path: unit.path.clone().unwrap_or_default(),
        brick_device_dir: if device.is_empty() {
            String::new()
        } else {
            unit_mount_dir(pool)
        },
        brick_device: device,
        pvc_name: unit.pvc.clone().unwrap_or_default(),
        decommissioned: unit.decommissioned,
        brick_index: idx as u32,
    }
}

/// Build and validate the descriptor for pool `name`.
///
/// The volume id comes from the resource, else from `previous` (the descriptor
/// already in the info map), else a fresh UUID, so that re-applying a
/// resource never changes it.
pub fn build(
    name: &str,
    spec: &KadaluStorageSpec,
    previous: Option<&PoolInfo>,
) -> Result<PoolInfo, OperatorError> {
    let parsed = parse_spec(name, spec)?;

    let volume_id = spec
        .volume_id
        .clone()
        .filter(|id| !id.is_empty())
        .or_else(|| previous.map(|p| p.volume_id.clone()).filter(|id| !id.is_empty()))
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let bricks = if parsed.pool_type == PoolType::External {
        Vec::new()
    } else {
        spec.storage
            .iter()
            .enumerate()
            .map(|(idx, unit)| brick(name, idx, unit))
            .collect()
    };

    let details = spec.details.clone().unwrap_or_default();
    let info = PoolInfo {
        volname: name.to_owned(),
        volume_id,
        pool_type: parsed.pool_type,
        kadalu_format: parsed.kadalu_format,
        pv_reclaim_policy: parsed.reclaim_policy,
        bricks,
        disperse: spec.disperse.map(|d| Disperse {
            data: d.data,
            redundancy: d.redundancy,
        }),
        tiebreaker: spec.tiebreaker.as_ref().map(|t| {
            let default = Tiebreaker::default();
            Tiebreaker {
                node: t.node.clone(),
                path: t.path.clone().unwrap_or(default.path),
                port: t.port.unwrap_or(GLUSTERD_PORT),
            }
        }),
        options: spec.options.clone(),
        single_pv_per_pool: spec.single_pv_per_pool,
        supported_pvtype: Default::default(),
        gluster_hosts: details
            .gluster_hosts
            .into_iter()
            .map(|h| h.trim().to_owned())
            .filter(|h| !h.is_empty())
            .collect(),
        gluster_volname: details.gluster_volname,
        gluster_options: details.gluster_options,
        mount_options: Vec::new(),
    };

    info.validate()?;
    Ok(info)
}
