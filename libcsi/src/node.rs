//! CSI Node service trait.
//!
//! Runs on every worker node:
//!
//! 1. **Publish**: mount the pool (once per pool and option set), then
//!    expose the PV at the target path by bind mount, loop mount or loop
//!    device.
//! 2. **Unpublish**: lazily unmount the target path, detaching the loop
//!    device of raw block volumes.
//!
//! There is no staging step; the pool mount is shared by every PV on it.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{NodeInfo, NodePublishVolumeRequest, VolumeId};

/// Node service: local mount and unmount operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Publish a volume at `req.target_path`.
    ///
    /// Idempotent: a target path that is already a mount point succeeds
    /// without action.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Unpublish a volume from `target_path`. Idempotent.
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError>;

    async fn get_info(&self) -> Result<NodeInfo, CsiError>;
}
