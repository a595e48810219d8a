//! CSI Controller service trait.
//!
//! Runs in the provisioner pod. Every operation resolves its target pool
//! through the pool registry and works on the pool's FUSE mount.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    ControllerCapability, CreateVolumeRequest, ListVolumesPage, Volume, VolumeCapability,
    VolumeId,
};

/// Controller service: centralized volume lifecycle.
#[async_trait]
pub trait CsiController: Send + Sync {
    /// Provision a PV on the first eligible pool with room for it.
    ///
    /// Repeating a request with the same name and size returns the same
    /// volume; the same name with a different size is `AlreadyExists`.
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError>;

    /// Delete a PV according to its pool's reclaim policy. Unknown ids
    /// succeed.
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError>;

    /// `Ok(true)` when every capability is supported for the volume.
    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError>;

    /// One page of PVs across all pools. `max_entries == 0` returns every
    /// remaining entry.
    async fn list_volumes(
        &self,
        starting_token: &str,
        max_entries: usize,
    ) -> Result<ListVolumesPage, CsiError>;

    /// Grow a PV to `capacity_bytes` and return the new capacity.
    async fn expand_volume(
        &self,
        volume_id: &VolumeId,
        capacity_bytes: u64,
    ) -> Result<u64, CsiError>;

    async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError>;
}
