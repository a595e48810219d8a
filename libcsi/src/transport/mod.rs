//! gRPC transport for the CSI services.
//!
//! The driver listens on a unix socket (`CSI_ENDPOINT`) and serves the
//! Identity service plus the Controller service (provisioner role) or the
//! Node service (node-plugin role).

pub mod convert;
pub mod server;

pub use server::{CsiRole, CsiService, serve, socket_path};
