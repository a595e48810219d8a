//! # liboperator: `KadaluStorage` pool controller
//!
//! Turns `KadaluStorage` custom resources into running pools: it validates
//! the resource, writes the pool descriptor into the shared info map, and
//! applies the storage class, headless service and one stateful workload per
//! storage unit.
//!
//! | Module | Purpose |
//! |---|---|
//! | [`crd`] | `KadaluStorage` custom resource definition. |
//! | [`validate`] | Name and spec checks before anything is applied. |
//! | [`pool_info`] | CR spec to [`libpool::PoolInfo`] conversion. |
//! | [`manifests`] | StorageClass / Service / StatefulSet builders. |
//! | [`cluster`] | [`ClusterApi`] seam and its kube-backed implementation. |
//! | [`controller`] | Event handling and the watch loop. |

pub mod cluster;
pub mod controller;
pub mod crd;
pub mod error;
pub mod manifests;
pub mod pool_info;
pub mod validate;

pub use cluster::{ClusterApi, KubeCluster};
pub use controller::{Outcome, PoolController, PoolEvent, run};
pub use crd::{KadaluStorage, KadaluStorageSpec, crd_manifest};
pub use error::OperatorError;
pub use manifests::OperatorConfig;
