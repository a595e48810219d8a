//! GlusterFS volfile generation.
//!
//! A volfile is a list of xlators, leaves first, each naming its
//! subvolumes. Output is a pure function of the [`PoolInfo`]: options are kept
//! in `BTreeMap`s and bricks are walked in descriptor order, so regenerating
//! an unchanged descriptor yields byte-identical files.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::constants::GLUSTERD_PORT;
use crate::error::PoolError;
use crate::types::{Brick, PoolInfo, PoolType};

/// Performance xlators loaded on clients unless switched off with
/// `performance.<name>: off`.
pub const DEFAULT_PERFORMANCE_XLATORS: [&str; 4] =
    ["write-behind", "open-behind", "quick-read", "md-cache"];

/// Performance xlators that stay out unless switched on.
pub const OPTIONAL_PERFORMANCE_XLATORS: [&str; 3] = ["read-ahead", "io-cache", "readdir-ahead"];

/// One node of the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Xlator {
    pub name: String,
    pub xl_type: String,
    pub options: BTreeMap<String, String>,
    pub subvolumes: Vec<String>,
}

impl Xlator {
    fn new(name: impl Into<String>, xl_type: &str) -> Self {
        Self {
            name: name.into(),
            xl_type: xl_type.to_owned(),
            options: BTreeMap::new(),
            subvolumes: Vec::new(),
        }
    }

    fn option(mut self, key: &str, value: impl Into<String>) -> Self {
        self.options.insert(key.to_owned(), value.into());
        self
    }

    fn subvolumes<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subvolumes = names.into_iter().map(Into::into).collect();
        self
    }

    /// `storage/posix` → `posix`.
    pub fn short_type(&self) -> &str {
        self.xl_type.rsplit('/').next().unwrap_or(&self.xl_type)
    }
}

/// An ordered xlator graph; the last xlator is the top of the graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Volfile {
    xlators: Vec<Xlator>,
}

impl Volfile {
    fn push(&mut self, xl: Xlator) -> String {
        let name = xl.name.clone();
        self.xlators.push(xl);
        name
    }

    pub fn xlators(&self) -> &[Xlator] {
        &self.xlators
    }

    pub fn top(&self) -> Option<&Xlator> {
        self.xlators.last()
    }

    pub fn find(&self, name: &str) -> Option<&Xlator> {
        self.xlators.iter().find(|x| x.name == name)
    }

    /// Apply `<xlator>.<option>` pairs from the pool options to every xlator
    /// of that short type.
    fn apply_user_options(&mut self, options: &BTreeMap<String, String>) {
        for xl in &mut self.xlators {
            let short = xl.short_type().to_owned();
            for (key, value) in options {
                if let Some((prefix, opt)) = key.split_once('.')
                    && prefix == short
                    && !opt.is_empty()
                {
                    xl.options.insert(opt.to_owned(), value.clone());
                }
            }
        }
    }
}

impl fmt::Display for Volfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, xl) in self.xlators.iter().enumerate() {
            if idx > 0 {
                writeln!(f)?;
            }
            writeln!(f, "volume {}", xl.name)?;
            writeln!(f, "    type {}", xl.xl_type)?;
            for (key, value) in &xl.options {
                writeln!(f, "    option {key} {value}")?;
            }
            if !xl.subvolumes.is_empty() {
                writeln!(f, "    subvolumes {}", xl.subvolumes.join(" "))?;
            }
            writeln!(f, "end-volume")?;
        }
        Ok(())
    }
}

fn is_off(value: &str) -> bool {
    matches!(value, "off" | "false" | "no" | "disable" | "0")
}

fn is_on(value: &str) -> bool {
    matches!(value, "on" | "true" | "yes" | "enable" | "1")
}

/// Performance xlators enabled for `pool`, in load order.
pub fn performance_xlators(pool: &PoolInfo) -> Vec<&'static str> {
    let flag = |name: &str| pool.options.get(&format!("performance.{name}"));
    let mut enabled: Vec<&'static str> = DEFAULT_PERFORMANCE_XLATORS
        .into_iter()
        .filter(|name| !flag(name).is_some_and(|v| is_off(v)))
        .collect();
    enabled.extend(
        OPTIONAL_PERFORMANCE_XLATORS
            .into_iter()
            .filter(|name| flag(name).is_some_and(|v| is_on(v))),
    );
    enabled
}

/// Volfile id a brick process serves, e.g. `pool-a.node-0.bricks-pool-a-data-brick`.
pub fn brick_volfile_id(pool: &PoolInfo, brick: &Brick) -> String {
    let path = brick.brick_path.trim_matches('/').replace('/', "-");
    format!("{}.{}.{}", pool.volname, brick.node_id, path)
}

fn client_name(pool: &PoolInfo, idx: usize) -> String {
    format!("{}-client-{idx}", pool.volname)
}

/// Storage-unit graph for one brick. `volfile_dir` is where the client
/// volfile lives; the brick hands it out to FUSE clients that ask for the
/// pool by name.
pub fn brick_volfile(pool: &PoolInfo, brick: &Brick, volfile_dir: &Path) -> Volfile {
    let vol = &pool.volname;
    let mut graph = Volfile::default();

    let mut prev = graph.push(
        Xlator::new(format!("{vol}-posix"), "storage/posix")
            .option("directory", &brick.brick_path)
            .option("volume-id", &pool.volume_id)
            .option("glusterd-uuid", &brick.node_id)
            .option("shared-brick-count", "1"),
    );

    if pool.mode() != crate::types::PoolMode::ExternalGluster {
        prev = graph.push(
            Xlator::new(format!("{vol}-simple-quota"), "features/simple-quota")
                .subvolumes([prev]),
        );
    }

    prev = graph.push(Xlator::new(format!("{vol}-locks"), "features/locks").subvolumes([prev]));
    prev = graph.push(
        Xlator::new(format!("{vol}-io-threads"), "performance/io-threads").subvolumes([prev]),
    );
    prev = graph.push(
        Xlator::new(format!("{vol}-index"), "features/index")
            .option(
                "index-base",
                format!("{}/.glusterfs/indices", brick.brick_path),
            )
            .subvolumes([prev]),
    );
    // Clients address the brick by this name through `remote-subvolume`.
    prev = graph.push(
        Xlator::new(brick.brick_path.clone(), "debug/io-stats")
            .option("unique-id", &brick.brick_path)
            .subvolumes([prev]),
    );
    graph.push(
        Xlator::new(format!("{vol}-server"), "protocol/server")
            .option("transport-type", "tcp")
            .option("transport.socket.listen-port", GLUSTERD_PORT.to_string())
            .option(&format!("auth.addr.{}.allow", brick.brick_path), "*")
            .option("volspec-directory", volfile_dir.display().to_string())
            .subvolumes([prev]),
    );

    graph.apply_user_options(&pool.options);
    graph
}

/// Push one `protocol/client` per brick followed by one replicate/disperse
/// xlator per distribute group. Returns the group names.
fn push_groups(graph: &mut Volfile, pool: &PoolInfo, self_heal: bool) -> Vec<String> {
    let vol = &pool.volname;
    let mut groups = Vec::new();

    for (g, group) in pool.distribute_groups().into_iter().enumerate() {
        let base = g * group.len();
        let clients: Vec<String> = group
            .iter()
            .enumerate()
            .map(|(i, brick)| {
                graph.push(
                    Xlator::new(client_name(pool, base + i), "protocol/client")
                        .option("remote-host", &brick.node)
                        .option("remote-port", GLUSTERD_PORT.to_string())
                        .option("remote-subvolume", &brick.brick_path)
                        .option("transport-type", "tcp")
                        .option("ping-timeout", "42"),
                )
            })
            .collect();

        let name = match pool.pool_type {
            PoolType::Replica1 | PoolType::External => {
                groups.extend(clients);
                continue;
            }
            PoolType::Replica2 | PoolType::Replica3 => {
                let mut subvols = clients.clone();
                let mut xl = Xlator::new(format!("{vol}-replica-{g}"), "cluster/replicate")
                    .option("afr-pending-xattr", clients.join(","));
                if pool.pool_type == PoolType::Replica2 {
                    let tb = pool.tiebreaker_or_default();
                    subvols.push(graph.push(
                        Xlator::new(format!("{vol}-ta-{g}"), "protocol/client")
                            .option("remote-host", &tb.node)
                            .option("remote-port", tb.port.to_string())
                            .option("remote-subvolume", &tb.path)
                            .option("transport-type", "tcp"),
                    ));
                    xl = xl.option("thin-arbiter-count", "1");
                }
                if self_heal {
                    xl = xl.option("iam-self-heal-daemon", "yes");
                }
                graph.push(xl.subvolumes(subvols))
            }
            PoolType::Disperse => {
                let redundancy = pool.disperse.map(|d| d.redundancy).unwrap_or(1);
                let mut xl = Xlator::new(format!("{vol}-disperse-{g}"), "cluster/disperse")
                    .option("redundancy", redundancy.to_string());
                if self_heal {
                    xl = xl.option("iam-self-heal-daemon", "yes");
                }
                graph.push(xl.subvolumes(clients))
            }
        };
        groups.push(name);
    }
    groups
}

/// FUSE client graph of the pool.
pub fn client_volfile(pool: &PoolInfo) -> Volfile {
    let vol = &pool.volname;
    let mut graph = Volfile::default();
    let groups = push_groups(&mut graph, pool, false);

    let size = pool.subvol_size().unwrap_or(1).max(1);
    let decommissioned: Vec<&str> = pool
        .bricks
        .chunks(size)
        .zip(groups.iter())
        .filter(|(bricks, _)| bricks.first().is_some_and(|b| b.decommissioned))
        .map(|(_, name)| name.as_str())
        .collect();

    let mut dht = Xlator::new(format!("{vol}-dht"), "cluster/distribute").subvolumes(groups.clone());
    if !decommissioned.is_empty() {
        dht = dht.option("decommissioned-bricks", decommissioned.join(" "));
    }
    let mut prev = graph.push(dht);

    for perf in performance_xlators(pool) {
        prev = graph.push(
            Xlator::new(format!("{vol}-{perf}"), &format!("performance/{perf}"))
                .subvolumes([prev]),
        );
    }

    graph.push(
        Xlator::new(vol.clone(), "debug/io-stats")
            .option("count-fop-hits", "off")
            .option("latency-measurement", "off")
            .subvolumes([prev]),
    );

    graph.apply_user_options(&pool.options);
    graph
}

/// Self-heal daemon graph; `None` when the pool has nothing to heal.
pub fn shd_volfile(pool: &PoolInfo) -> Option<Volfile> {
    if !pool.pool_type.needs_self_heal() {
        return None;
    }
    let mut graph = Volfile::default();
    let groups = push_groups(&mut graph, pool, true);
    graph.push(Xlator::new("glustershd", "debug/io-stats").subvolumes(groups));
    graph.apply_user_options(&pool.options);
    Some(graph)
}

pub fn client_volfile_path(dir: &Path, pool: &PoolInfo) -> PathBuf {
    dir.join(format!("{}.vol", pool.volname))
}

pub fn shd_volfile_path(dir: &Path, pool: &PoolInfo) -> PathBuf {
    dir.join(format!("{}-shd.vol", pool.volname))
}

pub fn brick_volfile_path(dir: &Path, pool: &PoolInfo, brick: &Brick) -> PathBuf {
    dir.join(format!("{}.vol", brick_volfile_id(pool, brick)))
}

/// Write `content` to `path` via a temporary file and rename.
///
/// Returns `false` without touching the file when it already holds exactly
/// `content`.
pub fn write_atomic(path: &Path, content: &str) -> Result<bool, PoolError> {
    if let Ok(existing) = std::fs::read_to_string(path)
        && existing == content
    {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| PoolError::io(format!("mkdir {}", parent.display()), e))?;
    }
    let tmp = path.with_extension("vol.tmp");
    std::fs::write(&tmp, content)
        .map_err(|e| PoolError::io(format!("write {}", tmp.display()), e))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| PoolError::io(format!("rename {}", path.display()), e))?;
    debug!(path = %path.display(), "volfile written");
    Ok(true)
}

/// Regenerate the brick, client and self-heal volfiles of `pool` under `dir`.
///
/// `bricks` limits brick volfiles to the units hosted locally. Returns the
/// paths whose content changed.
pub fn write_pool_volfiles(
    dir: &Path,
    pool: &PoolInfo,
    bricks: &[&Brick],
) -> Result<Vec<PathBuf>, PoolError> {
    let mut changed = Vec::new();

    for brick in bricks {
        let path = brick_volfile_path(dir, pool, brick);
        if write_atomic(&path, &brick_volfile(pool, brick, dir).to_string())? {
            changed.push(path);
        }
    }

    let path = client_volfile_path(dir, pool);
    if write_atomic(&path, &client_volfile(pool).to_string())? {
        changed.push(path);
    }

    if let Some(shd) = shd_volfile(pool) {
        let path = shd_volfile_path(dir, pool);
        if write_atomic(&path, &shd.to_string())? {
            changed.push(path);
        }
    }

    if !changed.is_empty() {
        info!(pool = %pool.volname, changed = changed.len(), "volfiles regenerated");
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Disperse, KadaluFormat, SupportedPvType};

    fn pool(pool_type: PoolType, units: u32) -> PoolInfo {
        PoolInfo {
            volname: "pool-a".into(),
            volume_id: "0f1e2d3c-0000-4000-8000-000000000001".into(),
            pool_type,
            kadalu_format: KadaluFormat::Native,
            pv_reclaim_policy: Default::default(),
            bricks: (0..units)
                .map(|i| Brick {
                    brick_path: "/bricks/pool-a/data/brick".into(),
                    kube_hostname: format!("n{i}"),
                    node: format!("server-pool-a-{i}-0.pool-a"),
                    node_id: format!("node-{i}"),
                    brick_index: i,
                    ..Default::default()
                })
                .collect(),
            disperse: (pool_type == PoolType::Disperse).then_some(Disperse {
                data: 2,
                redundancy: 1,
            }),
            tiebreaker: None,
            options: BTreeMap::new(),
            single_pv_per_pool: false,
            supported_pvtype: SupportedPvType::All,
            gluster_hosts: vec![],
            gluster_volname: String::new(),
            gluster_options: String::new(),
            mount_options: vec![],
        }
    }

    #[test]
    fn replica3_client_graph() {
        let p = pool(PoolType::Replica3, 6);
        let graph = client_volfile(&p);

        let dht = graph.find("pool-a-dht").unwrap();
        assert_eq!(dht.subvolumes, vec!["pool-a-replica-0", "pool-a-replica-1"]);

        let r1 = graph.find("pool-a-replica-1").unwrap();
        assert_eq!(r1.xl_type, "cluster/replicate");
        assert_eq!(
            r1.subvolumes,
            vec!["pool-a-client-3", "pool-a-client-4", "pool-a-client-5"]
        );

        let c4 = graph.find("pool-a-client-4").unwrap();
        assert_eq!(c4.options["remote-host"], "server-pool-a-4-0.pool-a");
        assert_eq!(c4.options["remote-port"], "24007");

        let top = graph.top().unwrap();
        assert_eq!(top.name, "pool-a");
        assert_eq!(top.xl_type, "debug/io-stats");
        assert_eq!(top.subvolumes, vec!["pool-a-md-cache"]);
    }

    #[test]
    fn replica1_clients_join_distribute_directly() {
        let graph = client_volfile(&pool(PoolType::Replica1, 2));
        let dht = graph.find("pool-a-dht").unwrap();
        assert_eq!(dht.subvolumes, vec!["pool-a-client-0", "pool-a-client-1"]);
        assert!(shd_volfile(&pool(PoolType::Replica1, 2)).is_none());
    }

    #[test]
    fn replica2_gets_tiebreaker() {
        let graph = client_volfile(&pool(PoolType::Replica2, 2));
        let ta = graph.find("pool-a-ta-0").unwrap();
        assert_eq!(ta.options["remote-host"], "tie-breaker.kadalu.io");
        assert_eq!(ta.options["remote-subvolume"], "/mnt");
        let afr = graph.find("pool-a-replica-0").unwrap();
        assert_eq!(afr.options["thin-arbiter-count"], "1");
        assert_eq!(afr.subvolumes.len(), 3);
    }

    #[test]
    fn disperse_group_and_shd() {
        let p = pool(PoolType::Disperse, 3);
        let graph = client_volfile(&p);
        let ec = graph.find("pool-a-disperse-0").unwrap();
        assert_eq!(ec.options["redundancy"], "1");

        let shd = shd_volfile(&p).unwrap();
        let top = shd.top().unwrap();
        assert_eq!(top.name, "glustershd");
        assert_eq!(top.subvolumes, vec!["pool-a-disperse-0"]);
        assert_eq!(
            shd.find("pool-a-disperse-0").unwrap().options["iam-self-heal-daemon"],
            "yes"
        );
        assert!(shd.find("pool-a-write-behind").is_none());
    }

    #[test]
    fn performance_toggles_and_user_options() {
        let mut p = pool(PoolType::Replica3, 3);
        p.options.insert("performance.quick-read".into(), "off".into());
        p.options.insert("performance.readdir-ahead".into(), "on".into());
        p.options.insert("replicate.data-self-heal".into(), "off".into());
        p.options.insert("write-behind.window-size".into(), "4MB".into());

        let graph = client_volfile(&p);
        assert!(graph.find("pool-a-quick-read").is_none());
        assert!(graph.find("pool-a-readdir-ahead").is_some());
        assert_eq!(
            graph.find("pool-a-replica-0").unwrap().options["data-self-heal"],
            "off"
        );
        assert_eq!(
            graph.find("pool-a-write-behind").unwrap().options["window-size"],
            "4MB"
        );
    }

    #[test]
    fn decommissioned_groups_are_flagged() {
        let mut p = pool(PoolType::Replica1, 2);
        p.bricks[1].decommissioned = true;
        let graph = client_volfile(&p);
        assert_eq!(
            graph.find("pool-a-dht").unwrap().options["decommissioned-bricks"],
            "pool-a-client-1"
        );
    }

    #[test]
    fn brick_graph_layout() {
        let p = pool(PoolType::Replica3, 3);
        let graph = brick_volfile(&p, &p.bricks[1], Path::new("/var/lib/kadalu/volfiles"));
        let posix = graph.find("pool-a-posix").unwrap();
        assert_eq!(posix.options["directory"], "/bricks/pool-a/data/brick");
        assert_eq!(posix.options["glusterd-uuid"], "node-1");
        let top = graph.top().unwrap();
        assert_eq!(top.xl_type, "protocol/server");
        assert_eq!(top.options["transport.socket.listen-port"], "24007");
        assert_eq!(top.subvolumes, vec!["/bricks/pool-a/data/brick"]);
        assert_eq!(top.options["volspec-directory"], "/var/lib/kadalu/volfiles");
        assert_eq!(
            brick_volfile_id(&p, &p.bricks[1]),
            "pool-a.node-1.bricks-pool-a-data-brick"
        );
    }

    #[test]
    fn render_format() {
        let graph = client_volfile(&pool(PoolType::Replica1, 1));
        let text = graph.to_string();
        assert!(text.starts_with("volume pool-a-client-0\n    type protocol/client\n"));
        assert!(text.contains("    subvolumes pool-a-client-0\nend-volume\n"));
        assert!(text.ends_with("end-volume\n"));
    }

    #[test]
    fn regeneration_is_byte_identical() {
        let tmp = tempfile::tempdir().unwrap();
        let p = pool(PoolType::Replica3, 3);
        let local = [&p.bricks[0]];

        let first = write_pool_volfiles(tmp.path(), &p, &local).unwrap();
        assert_eq!(first.len(), 3);
        assert!(write_pool_volfiles(tmp.path(), &p, &local).unwrap().is_empty());

        // The brick serves the client volfile from the directory it was written to.
        let brick_text =
            std::fs::read_to_string(brick_volfile_path(tmp.path(), &p, &p.bricks[0])).unwrap();
        assert!(brick_text.contains(&format!("    option volspec-directory {}\n", tmp.path().display())));
        assert!(client_volfile_path(tmp.path(), &p).is_file());

        let mut changed = p.clone();
        changed.options.insert("performance.md-cache".into(), "off".into());
        let second = write_pool_volfiles(tmp.path(), &changed, &local).unwrap();
        assert_eq!(second, vec![client_volfile_path(tmp.path(), &p)]);
    }
}
