//! # libpool: storage-pool model for Kadalu
//!
//! `libpool` holds everything that describes a storage pool independently of
//! how it is exposed: the pool descriptor written by the operator, the
//! registry that loads and filters those descriptors, the per-pool SQLite
//! ledger that lives on the pool mount, and the volfile generator used by the
//! storage-unit processes.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Pool descriptor (`PoolInfo`), bricks, modes, PV types, topology validation. |
//! | [`registry`] | [`PoolRegistry`]: loads `<name>.info` files and applies [`PoolFilter`]s. |
//! | [`ledger`] | [`PoolLedger`]: per-pool `stat.db` accounting. |
//! | [`volfile`] | Brick, client and self-heal volfile rendering. |
//! | [`exec`] | Subprocess runner and `ENOTCONN`-aware retry helper. |
//! | [`xattr`] | Thin safe wrappers around the xattr syscalls. |
//! | [`constants`] | Well-known paths, ports and names shared by every crate. |
//! | [`error`] | [`PoolError`] enum. |

pub mod constants;
pub mod error;
pub mod exec;
pub mod ledger;
pub mod registry;
pub mod types;
pub mod volfile;
pub mod xattr;

pub use error::PoolError;
pub use ledger::{PoolLedger, PoolStats};
pub use registry::{ExternalIdentity, PoolFilter, PoolRegistry};
pub use types::*;
