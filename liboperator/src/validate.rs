//! Checks applied to a `KadaluStorage` before anything is written.

use libpool::{KadaluFormat, PoolType, ReclaimPolicy};

use crate::crd::KadaluStorageSpec;
use crate::error::OperatorError;

const MAX_NAME_LEN: usize = 63;

/// Typed view of the enumerations a spec carries as strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedSpec {
    pub pool_type: PoolType,
    pub reclaim_policy: ReclaimPolicy,
    pub kadalu_format: KadaluFormat,
}

/// RFC 1123 label: lowercase alphanumerics and `-`, alphanumeric at both
/// ends. Pool names end up in DNS names and volfile ids.
pub fn validate_name(name: &str) -> Result<(), OperatorError> {
    let valid_chars = name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
    let valid_ends = name
        .bytes()
        .next()
        .zip(name.bytes().last())
        .is_some_and(|(first, last)| first != b'-' && last != b'-');

    if name.is_empty() || name.len() > MAX_NAME_LEN || !valid_chars || !valid_ends {
        return Err(OperatorError::invalid(
            name,
            "name must be a DNS label (lowercase alphanumerics and '-', at most 63 chars)",
        ));
    }
    Ok(())
}

fn parse_reclaim(name: &str, value: Option<&str>) -> Result<ReclaimPolicy, OperatorError> {
    match value {
        None | Some("delete") => Ok(ReclaimPolicy::Delete),
        Some("archive") => Ok(ReclaimPolicy::Archive),
        Some("retain") => Ok(ReclaimPolicy::Retain),
        Some(other) => Err(OperatorError::invalid(
            name,
            format!("unknown pvReclaimPolicy {other:?}"),
        )),
    }
}

fn parse_format(name: &str, value: Option<&str>) -> Result<KadaluFormat, OperatorError> {
    match value {
        None | Some("native") => Ok(KadaluFormat::Native),
        Some("non-native") => Ok(KadaluFormat::NonNative),
        Some(other) => Err(OperatorError::invalid(
            name,
            format!("unknown kadalu_format {other:?}"),
        )),
    }
}

/// Validate everything except the topology arithmetic, which
/// [`libpool::PoolInfo::validate`] owns.
pub fn parse_spec(name: &str, spec: &KadaluStorageSpec) -> Result<ParsedSpec, OperatorError> {
    validate_name(name)?;

    let pool_type: PoolType = spec
        .pool_type
        .parse()
        .map_err(|e: libpool::PoolError| OperatorError::invalid(name, e.to_string()))?;
    let reclaim_policy = parse_reclaim(name, spec.pv_reclaim_policy.as_deref())?;
    let kadalu_format = parse_format(name, spec.kadalu_format.as_deref())?;

    if spec.tiebreaker.is_some() && pool_type != PoolType::Replica2 {
        return Err(OperatorError::invalid(
            name,
            "tiebreaker is only valid for Replica2",
        ));
    }
    if spec.disperse.is_some() && pool_type != PoolType::Disperse {
        return Err(OperatorError::invalid(
            name,
            "disperse counts are only valid for Disperse",
        ));
    }

    if pool_type == PoolType::External {
        let details = spec.details.as_ref().ok_or_else(|| {
            OperatorError::invalid(name, "External pool needs details")
        })?;
        if details.gluster_hosts.iter().all(|h| h.trim().is_empty()) {
            return Err(OperatorError::invalid(name, "details.gluster_hosts is empty"));
        }
        if details.gluster_volname.is_empty() {
            return Err(OperatorError::invalid(name, "details.gluster_volname is empty"));
        }
    } else {
        if spec.storage.is_empty() {
            return Err(OperatorError::invalid(name, "storage list is empty"));
        }
        for (idx, unit) in spec.storage.iter().enumerate() {
            if unit.node.is_empty() {
                return Err(OperatorError::invalid(
                    name,
                    format!("storage[{idx}] has no node"),
                ));
            }
            let backings = [&unit.path, &unit.device, &unit.pvc]
                .iter()
                .filter(|b| b.as_deref().is_some_and(|v| !v.is_empty()))
                .count();
            if backings != 1 {
                return Err(OperatorError::invalid(
                    name,
                    format!("storage[{idx}] needs exactly one of path, device or pvc"),
                ));
            }
        }
    }

    Ok(ParsedSpec {
        pool_type,
        reclaim_policy,
        kadalu_format,
    })
}
