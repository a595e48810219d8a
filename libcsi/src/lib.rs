//! # libcsi: Kadalu CSI driver
//!
//! `libcsi` carves PersistentVolumes out of Kadalu storage pools and serves
//! them through the [Container Storage Interface][csi] over gRPC ([`tonic`]).
//! Pools are GlusterFS volumes described by `libpool`; every PV is a
//! directory or sparse file on a pool's FUSE mount, accounted in the pool's
//! ledger.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: `Volume`, `VolumeId`, capabilities, requests, storage-class parameters. |
//! | [`error`] | [`CsiError`] enum and its gRPC status mapping. |
//! | [`context`] | Versioned volume context passed from Controller to Node. |
//! | [`config`] | [`CsiConfig`]: paths and helper binaries. |
//! | [`mount`] | Pool FUSE mounts, at most one client per mountpoint. |
//! | [`pv`] | On-pool PV layout: create, search, resize, remove. |
//! | [`quota`] | Simple-quota xattrs, external directory quotas, XFS project-quota crawler. |
//! | [`listing`] | Stateful `ListVolumes` pagination. |
//! | [`identity`] | [`CsiIdentity`] trait: plugin discovery & health. |
//! | [`controller`] | [`CsiController`] trait: create, delete, expand, list. |
//! | [`node`] | [`CsiNode`] trait: publish, unpublish. |
//! | [`backend`] | [`KadaluBackend`], the implementation of all three traits. |
//! | [`transport`] | tonic services and the unix-socket server. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod backend;
pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod identity;
pub mod listing;
pub mod mount;
pub mod node;
pub mod pv;
pub mod quota;
pub mod transport;
pub mod types;

/// Generated CSI v1 messages and service traits.
#[allow(clippy::all)]
pub mod proto {
    tonic::include_proto!("csi.v1");
}

pub use backend::KadaluBackend;
pub use config::CsiConfig;
pub use controller::CsiController;
pub use error::CsiError;
pub use identity::CsiIdentity;
pub use node::CsiNode;
pub use types::*;
