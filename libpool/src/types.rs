//! Storage-pool data model.
//!
//! [`PoolInfo`] is the descriptor the operator writes as `<name>.info` into
//! the shared info map. Every other component reads it through the
//! [`registry`](crate::registry); nothing mutates a loaded descriptor.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

use crate::constants::{DEFAULT_TIEBREAKER_NODE, DEFAULT_TIEBREAKER_PATH, GLUSTERD_PORT};
use crate::error::PoolError;

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Replication layout of a pool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PoolType {
    Replica1,
    Replica2,
    Replica3,
    Disperse,
    External,
}

impl PoolType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Replica1 => "Replica1",
            Self::Replica2 => "Replica2",
            Self::Replica3 => "Replica3",
            Self::Disperse => "Disperse",
            Self::External => "External",
        }
    }

    /// Replica pools and disperse pools run a self-heal daemon.
    pub fn needs_self_heal(&self) -> bool {
        matches!(self, Self::Replica2 | Self::Replica3 | Self::Disperse)
    }
}

impl fmt::Display for PoolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PoolType {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Replica1" => Ok(Self::Replica1),
            "Replica2" => Ok(Self::Replica2),
            "Replica3" => Ok(Self::Replica3),
            "Disperse" => Ok(Self::Disperse),
            "External" => Ok(Self::External),
            other => Err(PoolError::InvalidTopology(format!(
                "unknown pool type {other:?}"
            ))),
        }
    }
}

/// How the pool's GlusterFS volume is managed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum PoolMode {
    /// Storage units deployed and supervised by Kadalu.
    Native,
    /// An existing Gluster cluster managed by glusterd.
    ExternalGluster,
    /// An existing Gluster volume that already uses the Kadalu layout.
    ExternalKadalu,
}

impl PoolMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::ExternalGluster => "external-gluster",
            Self::ExternalKadalu => "external-kadalu",
        }
    }

    pub fn is_external(&self) -> bool {
        !matches!(self, Self::Native)
    }
}

impl fmt::Display for PoolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PoolMode {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "native" => Ok(Self::Native),
            "external-gluster" | "external" => Ok(Self::ExternalGluster),
            "external-kadalu" | "externalkadalu" => Ok(Self::ExternalKadalu),
            other => Err(PoolError::InvalidTopology(format!(
                "unknown pool mode {other:?}"
            ))),
        }
    }
}

/// On-volume layout of an external pool.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum KadaluFormat {
    #[default]
    Native,
    NonNative,
}

/// What happens to a PV's data when it is deleted.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReclaimPolicy {
    #[default]
    Delete,
    Archive,
    Retain,
}

/// How a PV is materialized on its pool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PvType {
    /// A directory, bind-mounted into the workload.
    Subvol,
    /// A sparse XFS-formatted file, loop-mounted.
    Virtblock,
    /// A sparse file exposed as a raw loop device.
    Rawblock,
}

impl PvType {
    pub const ALL: [PvType; 3] = [PvType::Subvol, PvType::Virtblock, PvType::Rawblock];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subvol => "subvol",
            Self::Virtblock => "virtblock",
            Self::Rawblock => "rawblock",
        }
    }

    /// Block-backed PVs may only be attached by a single writer.
    pub fn requires_single_writer(&self) -> bool {
        !matches!(self, Self::Subvol)
    }

    /// `"<type>/<h0>/<h1>"`, where `h0`/`h1` are the first two byte pairs of
    /// the xxh64 hex digest of `name`.
    pub fn path_prefix(&self, name: &str) -> String {
        let hash = pv_hash(name);
        format!("{}/{}/{}", self.as_str(), &hash[0..2], &hash[2..4])
    }

    /// `"<type>/<h0>/<h1>/<name>"`.
    pub fn pv_path(&self, name: &str) -> String {
        format!("{}/{name}", self.path_prefix(name))
    }
}

impl fmt::Display for PvType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PvType {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subvol" => Ok(Self::Subvol),
            "virtblock" => Ok(Self::Virtblock),
            "rawblock" => Ok(Self::Rawblock),
            other => Err(PoolError::InvalidTopology(format!(
                "unknown pv type {other:?}"
            ))),
        }
    }
}

/// PV types a pool accepts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SupportedPvType {
    Subvol,
    Virtblock,
    Rawblock,
    #[default]
    All,
}

impl SupportedPvType {
    pub fn supports(&self, pvtype: PvType) -> bool {
        match self {
            Self::All => true,
            Self::Subvol => pvtype == PvType::Subvol,
            Self::Virtblock => pvtype == PvType::Virtblock,
            Self::Rawblock => pvtype == PvType::Rawblock,
        }
    }
}

/// Hex xxh64 digest (seed 0) of a PV name.
pub fn pv_hash(name: &str) -> String {
    format!("{:016x}", xxh64(name.as_bytes(), 0))
}

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// Data/redundancy counts of a disperse pool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Disperse {
    pub data: u32,
    pub redundancy: u32,
}

/// Thin-arbiter used by Replica2 pools.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tiebreaker {
    pub node: String,
    #[serde(default = "default_tiebreaker_path")]
    pub path: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_tiebreaker_path() -> String {
    DEFAULT_TIEBREAKER_PATH.to_owned()
}

fn default_port() -> u16 {
    GLUSTERD_PORT
}

impl Default for Tiebreaker {
    fn default() -> Self {
        Self {
            node: DEFAULT_TIEBREAKER_NODE.to_owned(),
            path: default_tiebreaker_path(),
            port: GLUSTERD_PORT,
        }
    }
}

/// One storage unit of a pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Brick {
    /// Brick directory inside the storage-unit container.
    #[serde(default)]
    pub brick_path: String,
    /// Kubernetes node the unit is pinned to.
    #[serde(default)]
    pub kube_hostname: String,
    /// Address clients use to reach the unit.
    #[serde(default)]
    pub node: String,
    /// Stable `node-<i>` identifier.
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub host_brick_path: String,
    #[serde(default)]
    pub brick_device: String,
    #[serde(default)]
    pub pvc_name: String,
    #[serde(default)]
    pub brick_device_dir: String,
    #[serde(default)]
    pub decommissioned: bool,
    #[serde(default)]
    pub brick_index: u32,
}

/// Pool descriptor as stored in `<info-dir>/<volname>.info`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolInfo {
    pub volname: String,
    #[serde(default)]
    pub volume_id: String,
    #[serde(rename = "type")]
    pub pool_type: PoolType,
    #[serde(default)]
    pub kadalu_format: KadaluFormat,
    #[serde(default)]
    pub pv_reclaim_policy: ReclaimPolicy,
    #[serde(default)]
    pub bricks: Vec<Brick>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disperse: Option<Disperse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tiebreaker: Option<Tiebreaker>,
    /// Xlator options keyed `<xlator>.<option>`.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default)]
    pub single_pv_per_pool: bool,
    #[serde(default)]
    pub supported_pvtype: SupportedPvType,
    #[serde(default)]
    pub gluster_hosts: Vec<String>,
    #[serde(default)]
    pub gluster_volname: String,
    /// Extra client options for external pools, comma separated.
    #[serde(default)]
    pub gluster_options: String,
    #[serde(default)]
    pub mount_options: Vec<String>,
}

impl PoolInfo {
    /// Read and validate a descriptor from disk.
    pub fn load(path: &Path) -> Result<Self, PoolError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| PoolError::io(format!("read {}", path.display()), e))?;
        let info: PoolInfo = serde_json::from_str(&raw).map_err(|source| PoolError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        info.validate()?;
        Ok(info)
    }

    /// Serialize without touching `self`.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn mode(&self) -> PoolMode {
        match (self.pool_type, self.kadalu_format) {
            (PoolType::External, KadaluFormat::Native) => PoolMode::ExternalKadalu,
            (PoolType::External, KadaluFormat::NonNative) => PoolMode::ExternalGluster,
            _ => PoolMode::Native,
        }
    }

    /// Number of bricks in one distribute group.
    pub fn subvol_size(&self) -> Option<usize> {
        subvol_size(self.pool_type, self.disperse.as_ref())
    }

    /// Bricks sliced into distribute groups.
    pub fn distribute_groups(&self) -> Vec<&[Brick]> {
        match self.subvol_size() {
            Some(size) if size > 0 => self.bricks.chunks(size).collect(),
            _ => Vec::new(),
        }
    }

    /// Volfile id the FUSE client asks for.
    pub fn mount_src(&self) -> &str {
        if self.mode().is_external() && !self.gluster_volname.is_empty() {
            &self.gluster_volname
        } else {
            &self.volname
        }
    }

    /// Ordered, de-duplicated volfile servers: every unit's `node:24007`
    /// followed by the external hosts.
    pub fn volfile_servers(&self) -> Vec<String> {
        let mut servers: Vec<String> = Vec::new();
        let candidates = self
            .bricks
            .iter()
            .filter(|b| !b.node.is_empty())
            .map(|b| format!("{}:{GLUSTERD_PORT}", b.node))
            .chain(self.gluster_hosts.iter().map(|h| {
                if h.contains(':') {
                    h.clone()
                } else {
                    format!("{h}:{GLUSTERD_PORT}")
                }
            }));
        for server in candidates {
            if !servers.contains(&server) {
                servers.push(server);
            }
        }
        servers
    }

    pub fn tiebreaker_or_default(&self) -> Tiebreaker {
        self.tiebreaker.clone().unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        validate_topology(self.pool_type, self.disperse.as_ref(), &self.bricks)
    }
}

/// Units per distribute group; `None` for external pools.
pub fn subvol_size(pool_type: PoolType, disperse: Option<&Disperse>) -> Option<usize> {
    match pool_type {
        PoolType::Replica1 => Some(1),
        PoolType::Replica2 => Some(2),
        PoolType::Replica3 => Some(3),
        PoolType::Disperse => disperse.map(|d| (d.data as usize).saturating_add(d.redundancy as usize)),
        PoolType::External => None,
    }
}

/// Check the unit count, disperse geometry and per-group decommission
/// consistency of a pool.
pub fn validate_topology(
    pool_type: PoolType,
    disperse: Option<&Disperse>,
    bricks: &[Brick],
) -> Result<(), PoolError> {
    if pool_type == PoolType::External {
        return Ok(());
    }

    if pool_type == PoolType::Disperse {
        let d = disperse.ok_or_else(|| {
            PoolError::InvalidTopology("Disperse pool needs data and redundancy counts".into())
        })?;
        let (Some(width), Some(twice)) = (d.data.checked_add(d.redundancy), d.redundancy.checked_mul(2))
        else {
            return Err(PoolError::InvalidTopology(format!(
                "disperse counts data={} redundancy={} are out of range",
                d.data, d.redundancy
            )));
        };
        if d.redundancy == 0 || width <= twice {
            return Err(PoolError::InvalidTopology(format!(
                "disperse data+redundancy ({width}) must exceed 2*redundancy ({twice})"
            )));
        }
        if d.data % 2 != 0 {
            return Err(PoolError::InvalidTopology(format!(
                "disperse data count {} must be even",
                d.data
            )));
        }
    }

    let size = subvol_size(pool_type, disperse).unwrap_or(1);
    if bricks.is_empty() {
        return Err(PoolError::InvalidTopology("pool has no storage units".into()));
    }
    if bricks.len() % size != 0 {
        return Err(PoolError::InvalidTopology(format!(
            "{} storage units is not a multiple of {size} for {pool_type}",
            bricks.len()
        )));
    }

    for (idx, group) in bricks.chunks(size).enumerate() {
        let first = group[0].decommissioned;
        if group.iter().any(|b| b.decommissioned != first) {
            return Err(PoolError::InvalidTopology(format!(
                "distribute group {idx} mixes decommissioned and active units"
            )));
        }
    }
    Ok(())
}
