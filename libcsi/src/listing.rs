//! Stateful `ListVolumes` pagination.
//!
//! The listing walks one pool at a time and buffers that pool's PVs. The
//! `next_token` handed out is the number of entries returned so far; a
//! follow-up call must present exactly that token.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::error::CsiError;
use crate::pv;
use crate::types::{ListVolumesPage, Volume, VolumeId};

/// One pool to walk: its name and where it is mounted.
#[derive(Debug, Clone)]
pub struct PoolSource {
    pub name: String,
    pub mount: PathBuf,
}

/// Cursor over the PVs of a fixed set of pools.
#[derive(Debug)]
pub struct VolumeLister {
    pools: VecDeque<PoolSource>,
    pending: VecDeque<Volume>,
    cursor: u64,
}

impl VolumeLister {
    pub fn new(pools: impl IntoIterator<Item = PoolSource>) -> Self {
        Self {
            pools: pools.into_iter().collect(),
            pending: VecDeque::new(),
            cursor: 0,
        }
    }

    /// The token a continuation call has to present.
    pub fn token(&self) -> String {
        self.cursor.to_string()
    }

    async fn load_next_pool(&mut self) -> Result<bool, CsiError> {
        let Some(source) = self.pools.pop_front() else {
            return Ok(false);
        };
        for file in pv::info_files(&source.mount).await? {
            let Some(name) = pv::name_of(&file) else {
                continue;
            };
            let size = match pv::read_info(&file).await {
                Ok(size) => size,
                Err(e) => {
                    warn!(pool = %source.name, file = %file.display(), error = %e, "skipping unreadable info file");
                    continue;
                }
            };
            self.pending.push_back(Volume {
                volume_id: VolumeId(name),
                capacity_bytes: size,
                volume_context: HashMap::from([("pool_name".to_owned(), source.name.clone())]),
            });
        }
        debug!(pool = %source.name, buffered = self.pending.len(), "pool listed");
        Ok(true)
    }

    /// Up to `max_entries` entries (`0` means everything left).
    pub async fn next_page(&mut self, max_entries: usize) -> Result<ListVolumesPage, CsiError> {
        let limit = if max_entries == 0 { usize::MAX } else { max_entries };
        let mut entries = Vec::new();

        while entries.len() < limit {
            if let Some(volume) = self.pending.pop_front() {
                entries.push(volume);
                continue;
            }
            if !self.load_next_pool().await? {
                break;
            }
        }
        self.cursor += entries.len() as u64;

        // Peek ahead so the last page does not carry a dangling token.
        while self.pending.is_empty() && self.load_next_pool().await? {}
        let next_token = if self.pending.is_empty() {
            String::new()
        } else {
            self.token()
        };

        Ok(ListVolumesPage { entries, next_token })
    }

    pub fn is_exhausted(&self) -> bool {
        self.pending.is_empty() && self.pools.is_empty()
    }
}
