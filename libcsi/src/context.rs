//! Volume context handed from `CreateVolume` to `NodePublishVolume`.
//!
//! The orchestrator stores the map verbatim in the PV object, so contexts
//! written by older releases (v1, no `version` key) still arrive at the node
//! plugin and are upgraded on read.

use std::collections::HashMap;

use libpool::{KadaluFormat, PoolMode, PvType};

use crate::error::CsiError;

pub const CONTEXT_VERSION: &str = "2";

/// Parsed v2 volume context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeContext {
    pub pool_mode: PoolMode,
    pub pool_name: String,
    pub pvtype: PvType,
    pub fstype: String,
    pub single_pv_per_pool: bool,
    /// PV path relative to the pool mount.
    pub path: String,
    /// Extra client options of external pools, comma separated.
    pub options: String,
    pub mount_options: Vec<String>,
    pub gluster_volname: String,
    pub gluster_hosts: Vec<String>,
}

fn get<'a>(map: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    map.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

fn require<'a>(map: &'a HashMap<String, String>, key: &str) -> Result<&'a str, CsiError> {
    get(map, key)
        .ok_or_else(|| CsiError::InvalidArgument(format!("volume context is missing {key}")))
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_pvtype(value: &str) -> Result<PvType, CsiError> {
    value
        .parse()
        .map_err(|e: libpool::PoolError| CsiError::InvalidArgument(e.to_string()))
}

impl VolumeContext {
    pub fn to_map(&self) -> HashMap<String, String> {
        HashMap::from([
            ("version".to_owned(), CONTEXT_VERSION.to_owned()),
            ("pool_mode".to_owned(), self.pool_mode.as_str().to_owned()),
            ("pool_name".to_owned(), self.pool_name.clone()),
            ("type".to_owned(), self.pvtype.as_str().to_owned()),
            ("fs".to_owned(), self.fstype.clone()),
            (
                "single_pv_per_pool".to_owned(),
                self.single_pv_per_pool.to_string(),
            ),
            ("path".to_owned(), self.path.clone()),
            ("options".to_owned(), self.options.clone()),
            ("mount_options".to_owned(), self.mount_options.join(",")),
            ("gvolname".to_owned(), self.gluster_volname.clone()),
            ("gserver".to_owned(), self.gluster_hosts.join(",")),
        ])
    }

    /// Parse a context of either version.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, CsiError> {
        match get(map, "version") {
            Some(CONTEXT_VERSION) => Self::from_v2(map),
            Some(other) => Err(CsiError::InvalidArgument(format!(
                "unsupported volume context version {other}"
            ))),
            None => Self::from_v1(map),
        }
    }

    fn from_v2(map: &HashMap<String, String>) -> Result<Self, CsiError> {
        let pool_mode = require(map, "pool_mode")?
            .parse()
            .map_err(|e: libpool::PoolError| CsiError::InvalidArgument(e.to_string()))?;
        Ok(Self {
            pool_mode,
            pool_name: require(map, "pool_name")?.to_owned(),
            pvtype: parse_pvtype(require(map, "type")?)?,
            fstype: get(map, "fs").unwrap_or("xfs").to_owned(),
            single_pv_per_pool: get(map, "single_pv_per_pool") == Some("true"),
            path: require(map, "path")?.to_owned(),
            options: get(map, "options").unwrap_or_default().to_owned(),
            mount_options: split_list(get(map, "mount_options")),
            gluster_volname: get(map, "gvolname").unwrap_or_default().to_owned(),
            gluster_hosts: split_list(get(map, "gserver")),
        })
    }

    /// v1 keys: `hostvol, pvtype, path, fstype, kformat, gvolname, gserver`.
    fn from_v1(map: &HashMap<String, String>) -> Result<Self, CsiError> {
        let gluster_volname = get(map, "gvolname").unwrap_or_default().to_owned();
        let gluster_hosts = split_list(get(map, "gserver"));
        let kformat = match get(map, "kformat") {
            Some("non-native") => KadaluFormat::NonNative,
            _ => KadaluFormat::Native,
        };
        let pool_mode = match (gluster_volname.is_empty() || gluster_hosts.is_empty(), kformat) {
            (true, _) => PoolMode::Native,
            (false, KadaluFormat::Native) => PoolMode::ExternalKadalu,
            (false, KadaluFormat::NonNative) => PoolMode::ExternalGluster,
        };

        Ok(Self {
            pool_mode,
            pool_name: require(map, "hostvol")?.to_owned(),
            pvtype: parse_pvtype(get(map, "pvtype").unwrap_or("subvol"))?,
            fstype: get(map, "fstype").unwrap_or("xfs").to_owned(),
            single_pv_per_pool: false,
            path: require(map, "path")?.to_owned(),
            options: String::new(),
            mount_options: Vec::new(),
            gluster_volname,
            gluster_hosts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn sample() -> VolumeContext {
        VolumeContext {
            pool_mode: PoolMode::Native,
            pool_name: "pool-a".into(),
            pvtype: PvType::Subvol,
            fstype: "xfs".into(),
            single_pv_per_pool: false,
            path: PvType::Subvol.pv_path("pvc-1"),
            options: String::new(),
            mount_options: vec!["noatime".into()],
            gluster_volname: String::new(),
            gluster_hosts: vec![],
        }
    }

    #[test]
    fn v2_keys() {
        let m = sample().to_map();
        assert_eq!(m["version"], "2");
        assert_eq!(m["pool_mode"], "native");
        assert_eq!(m["pool_name"], "pool-a");
        assert_eq!(m["type"], "subvol");
        assert_eq!(m["fs"], "xfs");
        assert!(m["path"].starts_with("subvol/"));
        assert_eq!(VolumeContext::from_map(&m).unwrap(), sample());
    }

    #[test]
    fn v1_native_upgrade() {
        let ctx = VolumeContext::from_map(&map(&[
            ("hostvol", "pool-a"),
            ("pvtype", "virtblock"),
            ("path", "virtblock/ab/cd/pvc-9"),
            ("fstype", "ext4"),
        ]))
        .unwrap();
        assert_eq!(ctx.pool_mode, PoolMode::Native);
        assert_eq!(ctx.pvtype, PvType::Virtblock);
        assert_eq!(ctx.fstype, "ext4");
        assert_eq!(ctx.pool_name, "pool-a");
    }

    #[test]
    fn v1_external_upgrade() {
        let ctx = VolumeContext::from_map(&map(&[
            ("hostvol", "ext"),
            ("path", "subvol/ab/cd/pvc-9"),
            ("kformat", "non-native"),
            ("gvolname", "gvol"),
            ("gserver", "g1,g2"),
        ]))
        .unwrap();
        assert_eq!(ctx.pool_mode, PoolMode::ExternalGluster);
        assert_eq!(ctx.gluster_hosts, vec!["g1", "g2"]);
        assert_eq!(ctx.pvtype, PvType::Subvol);
    }

    #[test]
    fn missing_keys_are_invalid() {
        assert!(matches!(
            VolumeContext::from_map(&map(&[("path", "x")])),
            Err(CsiError::InvalidArgument(_))
        ));
        assert!(matches!(
            VolumeContext::from_map(&map(&[("version", "7")])),
            Err(CsiError::InvalidArgument(_))
        ));
    }
}
