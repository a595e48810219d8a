//! Storage backend implementations.
//!
//! A backend implements [`crate::CsiIdentity`], [`crate::CsiController`], and
//! [`crate::CsiNode`].

pub mod kadalu;

pub use kadalu::KadaluBackend;
