//! tonic server that dispatches CSI gRPC calls to an [`CsiIdentity`] +
//! [`CsiController`] + [`CsiNode`] implementation.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::node::CsiNode;
use crate::proto;
use crate::proto::controller_server::{Controller, ControllerServer};
use crate::proto::identity_server::{Identity, IdentityServer};
use crate::proto::node_server::{Node, NodeServer};
use crate::transport::convert;
use crate::types::VolumeId;

/// Requests handled concurrently per connection.
pub const MAX_WORKERS: usize = 10;

/// Which CSI services a process serves besides Identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsiRole {
    Provisioner,
    NodePlugin,
}

impl FromStr for CsiRole {
    type Err = CsiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provisioner" => Ok(Self::Provisioner),
            "nodeplugin" => Ok(Self::NodePlugin),
            other => Err(CsiError::InvalidArgument(format!("unknown CSI role {other:?}"))),
        }
    }
}

/// Filesystem path of a `unix://` endpoint. `unix://plugin/csi.sock` and
/// `unix:///plugin/csi.sock` both name `/plugin/csi.sock`.
pub fn socket_path(endpoint: &str) -> PathBuf {
    let path = endpoint.strip_prefix("unix://").unwrap_or(endpoint);
    if path.starts_with('/') {
        PathBuf::from(path)
    } else {
        Path::new("/").join(path)
    }
}

/// Adapter from the tonic service traits to the CSI traits.
pub struct CsiService<T> {
    handler: Arc<T>,
}

impl<T> CsiService<T> {
    pub fn new(handler: Arc<T>) -> Self {
        Self { handler }
    }
}

impl<T> Clone for CsiService<T> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
        }
    }
}

fn required<'a>(value: &'a str, what: &str) -> Result<&'a str, Status> {
    if value.is_empty() {
        Err(Status::invalid_argument(format!("{what} is required")))
    } else {
        Ok(value)
    }
}

// --- Identity ----------------------------------------------------------------

#[tonic::async_trait]
impl<T> Identity for CsiService<T>
where
    T: CsiIdentity + CsiController + CsiNode + 'static,
{
    async fn get_plugin_info(
        &self,
        _request: Request<proto::GetPluginInfoRequest>,
    ) -> Result<Response<proto::GetPluginInfoResponse>, Status> {
        let info = self.handler.get_plugin_info().await?;
        Ok(Response::new(proto::GetPluginInfoResponse {
            name: info.name,
            vendor_version: info.vendor_version,
            manifest: Default::default(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<proto::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<proto::GetPluginCapabilitiesResponse>, Status> {
        let caps = self.handler.get_plugin_capabilities().await?;
        Ok(Response::new(proto::GetPluginCapabilitiesResponse {
            capabilities: caps
                .into_iter()
                .map(convert::plugin_capability_to_proto)
                .collect(),
        }))
    }

    async fn probe(
        &self,
        _request: Request<proto::ProbeRequest>,
    ) -> Result<Response<proto::ProbeResponse>, Status> {
        let ready = self.handler.probe().await?;
        Ok(Response::new(proto::ProbeResponse {
            ready: Some(proto::BoolValue { value: ready }),
        }))
    }
}

// --- Controller --------------------------------------------------------------

#[tonic::async_trait]
impl<T> Controller for CsiService<T>
where
    T: CsiIdentity + CsiController + CsiNode + 'static,
{
    async fn create_volume(
        &self,
        request: Request<proto::CreateVolumeRequest>,
    ) -> Result<Response<proto::CreateVolumeResponse>, Status> {
        let req = convert::create_request_from_proto(request.into_inner())?;
        debug!(name = %req.name, size = req.capacity_bytes, "CreateVolume");
        let volume = self.handler.create_volume(req).await?;
        Ok(Response::new(proto::CreateVolumeResponse {
            volume: Some(convert::volume_to_proto(volume)),
        }))
    }

    async fn delete_volume(
        &self,
        request: Request<proto::DeleteVolumeRequest>,
    ) -> Result<Response<proto::DeleteVolumeResponse>, Status> {
        let req = request.into_inner();
        let id = required(&req.volume_id, "volume id")?;
        debug!(volume_id = id, "DeleteVolume");
        self.handler.delete_volume(&VolumeId::from(id)).await?;
        Ok(Response::new(proto::DeleteVolumeResponse {}))
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<proto::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<proto::ValidateVolumeCapabilitiesResponse>, Status> {
        let req = request.into_inner();
        let id = required(&req.volume_id, "volume id")?;
        let caps: Vec<_> = req
            .volume_capabilities
            .iter()
            .map(convert::capability_from_proto)
            .collect();

        let supported = self
            .handler
            .validate_volume_capabilities(&VolumeId::from(id), &caps)
            .await?;
        let response = if supported {
            proto::ValidateVolumeCapabilitiesResponse {
                confirmed: Some(
                    proto::validate_volume_capabilities_response::Confirmed {
                        volume_context: req.volume_context,
                        volume_capabilities: req.volume_capabilities,
                        parameters: req.parameters,
                    },
                ),
                message: String::new(),
            }
        } else {
            let modes: Vec<_> = req
                .volume_capabilities
                .iter()
                .map(|c| convert::mode_name(c.access_mode.as_ref().map_or(0, |m| m.mode)))
                .collect();
            proto::ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: format!(
                    "supported access modes are SINGLE_NODE_WRITER and MULTI_NODE_MULTI_WRITER, got {}",
                    modes.join(",")
                ),
            }
        };
        Ok(Response::new(response))
    }

    async fn list_volumes(
        &self,
        request: Request<proto::ListVolumesRequest>,
    ) -> Result<Response<proto::ListVolumesResponse>, Status> {
        let req = request.into_inner();
        let max_entries = usize::try_from(req.max_entries)
            .map_err(|_| Status::invalid_argument("max_entries must not be negative"))?;
        let page = self
            .handler
            .list_volumes(&req.starting_token, max_entries)
            .await?;
        Ok(Response::new(proto::ListVolumesResponse {
            entries: page
                .entries
                .into_iter()
                .map(|v| proto::list_volumes_response::Entry {
                    volume: Some(convert::volume_to_proto(v)),
                })
                .collect(),
            next_token: page.next_token,
        }))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<proto::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<proto::ControllerGetCapabilitiesResponse>, Status> {
        let caps = self.handler.get_capabilities().await?;
        Ok(Response::new(proto::ControllerGetCapabilitiesResponse {
            capabilities: caps
                .into_iter()
                .map(convert::controller_capability_to_proto)
                .collect(),
        }))
    }

    async fn controller_expand_volume(
        &self,
        request: Request<proto::ControllerExpandVolumeRequest>,
    ) -> Result<Response<proto::ControllerExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        let id = required(&req.volume_id, "volume id")?;
        let size = convert::requested_bytes(req.capacity_range.as_ref())?;
        if size == 0 {
            return Err(Status::invalid_argument("capacity range is required"));
        }
        let capacity = self
            .handler
            .expand_volume(&VolumeId::from(id), size)
            .await?;
        Ok(Response::new(proto::ControllerExpandVolumeResponse {
            capacity_bytes: i64::try_from(capacity).unwrap_or(i64::MAX),
            node_expansion_required: false,
        }))
    }
}

// --- Node --------------------------------------------------------------------

#[tonic::async_trait]
impl<T> Node for CsiService<T>
where
    T: CsiIdentity + CsiController + CsiNode + 'static,
{
    async fn node_publish_volume(
        &self,
        request: Request<proto::NodePublishVolumeRequest>,
    ) -> Result<Response<proto::NodePublishVolumeResponse>, Status> {
        let req = convert::publish_request_from_proto(request.into_inner())?;
        self.handler.publish_volume(req).await?;
        Ok(Response::new(proto::NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<proto::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<proto::NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        let id = required(&req.volume_id, "volume id")?;
        let target = required(&req.target_path, "target path")?;
        self.handler
            .unpublish_volume(&VolumeId::from(id), target)
            .await?;
        Ok(Response::new(proto::NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<proto::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<proto::NodeGetCapabilitiesResponse>, Status> {
        Ok(Response::new(proto::NodeGetCapabilitiesResponse {
            capabilities: Vec::new(),
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<proto::NodeGetInfoRequest>,
    ) -> Result<Response<proto::NodeGetInfoResponse>, Status> {
        let info = self.handler.get_info().await?;
        Ok(Response::new(proto::NodeGetInfoResponse {
            node_id: info.node_id,
            max_volumes_per_node: 0,
            accessible_topology: None,
        }))
    }
}

/// Serve `handler` on the unix socket named by `endpoint` until `shutdown`
/// resolves. A stale socket file is removed first.
pub async fn serve<T, F>(
    endpoint: &str,
    role: CsiRole,
    handler: Arc<T>,
    shutdown: F,
) -> Result<(), CsiError>
where
    T: CsiIdentity + CsiController + CsiNode + 'static,
    F: Future<Output = ()> + Send,
{
    let path = socket_path(endpoint);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CsiError::Internal(format!("mkdir {}: {e}", parent.display())))?;
    }
    match tokio::fs::remove_file(&path).await {
        Ok(()) => warn!(socket = %path.display(), "removed stale socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(CsiError::Internal(format!(
                "remove stale socket {}: {e}",
                path.display()
            )));
        }
    }

    let listener = UnixListener::bind(&path)
        .map_err(|e| CsiError::Internal(format!("bind {}: {e}", path.display())))?;
    let incoming = UnixListenerStream::new(listener);
    let service = CsiService::new(handler);

    let router = Server::builder()
        .concurrency_limit_per_connection(MAX_WORKERS)
        .add_service(IdentityServer::new(service.clone()));
    let router = match role {
        CsiRole::Provisioner => router.add_service(ControllerServer::new(service)),
        CsiRole::NodePlugin => router.add_service(NodeServer::new(service)),
    };

    info!(socket = %path.display(), ?role, "CSI gRPC server listening");
    router
        .serve_with_incoming_shutdown(incoming, shutdown)
        .await
        .map_err(CsiError::internal)?;
    info!("CSI gRPC server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use tonic::Code;

    use super::*;
    use crate::proto::volume_capability::{self as pb_cap, access_mode::Mode};
    use crate::types::*;

    /// Answers from fixed data; `missing` is the one unknown volume.
    struct Fixed;

    #[async_trait]
    impl CsiIdentity for Fixed {
        async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
            Ok(PluginInfo {
                name: "kadalu.gluster".into(),
                vendor_version: "1.2.3".into(),
            })
        }
        async fn probe(&self) -> Result<bool, CsiError> {
            Ok(true)
        }
        async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
            Ok(vec![PluginCapability::ControllerService])
        }
    }

    #[async_trait]
    impl CsiController for Fixed {
        async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
            if req.name == "taken" {
                return Err(CsiError::AlreadyExists(req.name));
            }
            Ok(Volume {
                volume_id: VolumeId(req.name),
                capacity_bytes: req.capacity_bytes,
                volume_context: HashMap::from([("version".into(), "2".into())]),
            })
        }
        async fn delete_volume(&self, _volume_id: &VolumeId) -> Result<(), CsiError> {
            Ok(())
        }
        async fn validate_volume_capabilities(
            &self,
            volume_id: &VolumeId,
            capabilities: &[VolumeCapability],
        ) -> Result<bool, CsiError> {
            if volume_id.0 == "missing" {
                return Err(CsiError::VolumeNotFound(volume_id.0.clone()));
            }
            Ok(capabilities.iter().all(|c| c.access_mode.is_supported()))
        }
        async fn list_volumes(
            &self,
            starting_token: &str,
            _max_entries: usize,
        ) -> Result<ListVolumesPage, CsiError> {
            if !starting_token.is_empty() {
                return Err(CsiError::Aborted("stale token".into()));
            }
            Ok(ListVolumesPage {
                entries: vec![Volume {
                    volume_id: VolumeId::from("pvc-1"),
                    capacity_bytes: 10,
                    ..Default::default()
                }],
                next_token: String::new(),
            })
        }
        async fn expand_volume(&self, _volume_id: &VolumeId, capacity_bytes: u64) -> Result<u64, CsiError> {
            Ok(capacity_bytes)
        }
        async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
            Ok(vec![ControllerCapability::CreateDeleteVolume])
        }
    }

    #[async_trait]
    impl CsiNode for Fixed {
        async fn publish_volume(&self, _req: NodePublishVolumeRequest) -> Result<(), CsiError> {
            Ok(())
        }
        async fn unpublish_volume(&self, _volume_id: &VolumeId, _target_path: &str) -> Result<(), CsiError> {
            Ok(())
        }
        async fn get_info(&self) -> Result<NodeInfo, CsiError> {
            Ok(NodeInfo {
                node_id: "node-a".into(),
            })
        }
    }

    fn service() -> CsiService<Fixed> {
        CsiService::new(Arc::new(Fixed))
    }

    fn cap(mode: Mode) -> proto::VolumeCapability {
        proto::VolumeCapability {
            access_type: Some(pb_cap::AccessType::Mount(pb_cap::MountVolume::default())),
            access_mode: Some(pb_cap::AccessMode { mode: mode as i32 }),
        }
    }

    #[test]
    fn endpoint_paths() {
        assert_eq!(socket_path("unix://plugin/csi.sock"), PathBuf::from("/plugin/csi.sock"));
        assert_eq!(socket_path("unix:///csi/csi.sock"), PathBuf::from("/csi/csi.sock"));
        assert_eq!(socket_path("/tmp/x.sock"), PathBuf::from("/tmp/x.sock"));
        assert_eq!("nodeplugin".parse::<CsiRole>().unwrap(), CsiRole::NodePlugin);
        assert!("bogus".parse::<CsiRole>().is_err());
    }

    #[tokio::test]
    async fn identity_calls() {
        let svc = service();
        let info = Identity::get_plugin_info(&svc, Request::new(proto::GetPluginInfoRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(info.name, "kadalu.gluster");
        let probe = Identity::probe(&svc, Request::new(proto::ProbeRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(probe.ready, Some(proto::BoolValue { value: true }));
    }

    #[tokio::test]
    async fn create_maps_errors_to_status() {
        let svc = service();
        let req = |name: &str| proto::CreateVolumeRequest {
            name: name.into(),
            capacity_range: Some(proto::CapacityRange {
                required_bytes: 1 << 30,
                limit_bytes: 0,
            }),
            volume_capabilities: vec![cap(Mode::MultiNodeMultiWriter)],
            ..Default::default()
        };
        let vol = svc
            .create_volume(Request::new(req("pvc-1")))
            .await
            .unwrap()
            .into_inner()
            .volume
            .unwrap();
        assert_eq!(vol.volume_id, "pvc-1");
        assert_eq!(vol.capacity_bytes, 1 << 30);

        let status = svc.create_volume(Request::new(req("taken"))).await.unwrap_err();
        assert_eq!(status.code(), Code::AlreadyExists);
    }

    #[tokio::test]
    async fn validate_confirms_or_explains() {
        let svc = service();
        let req = |id: &str, mode: Mode| proto::ValidateVolumeCapabilitiesRequest {
            volume_id: id.into(),
            volume_capabilities: vec![cap(mode)],
            ..Default::default()
        };
        let ok = svc
            .validate_volume_capabilities(Request::new(req("pvc-1", Mode::SingleNodeWriter)))
            .await
            .unwrap()
            .into_inner();
        assert!(ok.confirmed.is_some());

        let rejected = svc
            .validate_volume_capabilities(Request::new(req("pvc-1", Mode::MultiNodeReaderOnly)))
            .await
            .unwrap()
            .into_inner();
        assert!(rejected.confirmed.is_none());
        assert!(rejected.message.contains("MULTI_NODE_READER_ONLY"));

        let status = svc
            .validate_volume_capabilities(Request::new(req("missing", Mode::SingleNodeWriter)))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn list_and_expand() {
        let svc = service();
        let page = svc
            .list_volumes(Request::new(proto::ListVolumesRequest {
                max_entries: 10,
                starting_token: String::new(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(page.entries.len(), 1);
        assert!(page.next_token.is_empty());

        let status = svc
            .list_volumes(Request::new(proto::ListVolumesRequest {
                max_entries: 10,
                starting_token: "5".into(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Aborted);

        let status = svc
            .list_volumes(Request::new(proto::ListVolumesRequest {
                max_entries: -1,
                starting_token: String::new(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);

        let expanded = svc
            .controller_expand_volume(Request::new(proto::ControllerExpandVolumeRequest {
                volume_id: "pvc-1".into(),
                capacity_range: Some(proto::CapacityRange {
                    required_bytes: 2 << 30,
                    limit_bytes: 0,
                }),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(expanded.capacity_bytes, 2 << 30);
        assert!(!expanded.node_expansion_required);
    }

    #[tokio::test]
    async fn node_calls() {
        let svc = service();
        let caps = svc
            .node_get_capabilities(Request::new(proto::NodeGetCapabilitiesRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert!(caps.capabilities.is_empty());

        let info = svc
            .node_get_info(Request::new(proto::NodeGetInfoRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(info.node_id, "node-a");

        let status = svc
            .node_unpublish_volume(Request::new(proto::NodeUnpublishVolumeRequest {
                volume_id: "pvc-1".into(),
                target_path: String::new(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn serves_on_unix_socket() {
        let tmp = tempfile::tempdir().unwrap();
        let sock = tmp.path().join("csi/csi.sock");
        std::fs::create_dir_all(sock.parent().unwrap()).unwrap();
        std::fs::write(&sock, b"stale").unwrap();

        let endpoint = format!("unix://{}", sock.display());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            serve(&endpoint, CsiRole::Provisioner, Arc::new(Fixed), async {
                let _ = rx.await;
            })
            .await
        });

        for _ in 0..50 {
            if tokio::net::UnixStream::connect(&sock).await.is_ok() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(tokio::net::UnixStream::connect(&sock).await.is_ok());

        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
