// Copyright 2024 The Mirrorlink Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;

use mirrorlink_config::CacheConfig;
use mirrorlink_error::{make_err, Code, Error, ResultExt};
use mirrorlink_util::geo::{distance_km, ClientGeo};
use mirrorlink_util::lru_cache::{SizedLruCache, SizedValue};
use mirrorlink_util::task::JoinHandleDropGuard;
use redis::aio::{ConnectionLike, ConnectionManager};
use tokio::sync::broadcast;
use tracing::{event, Level};

use crate::file_info::FileInfo;
use crate::keys;
use crate::mirror::Mirror;
use crate::pubsub::CatalogEvent;
use crate::redis_store::{CatalogStore, Connect};

#[derive(Clone, Debug, PartialEq)]
struct MirrorIds(Vec<i32>);

impl SizedValue for MirrorIds {
    fn size(&self) -> u64 {
        (self.0.len() * 4 + 16) as u64
    }
}

/// Local read-through cache over the catalog. One instance per node;
/// invalidation is driven entirely by pub/sub events, so a stale entry
/// can outlive its source only until the next event or reconnect.
pub struct MetadataCache<C: ConnectionLike + Connect + Clone + Send + Sync = ConnectionManager> {
    store: Arc<CatalogStore<C>>,
    file_cache: SizedLruCache<FileInfo>,
    mirror_cache: SizedLruCache<Mirror>,
    file_mirrors_cache: SizedLruCache<MirrorIds>,
    mirror_file_info_cache: SizedLruCache<FileInfo>,
}

impl<C: ConnectionLike + Connect + Clone + Send + Sync + 'static> MetadataCache<C> {
    pub fn new(config: &CacheConfig, store: Arc<CatalogStore<C>>) -> Arc<Self> {
        Arc::new(Self {
            store,
            file_cache: SizedLruCache::new(config.file_info_bytes),
            mirror_cache: SizedLruCache::new(config.mirror_bytes),
            file_mirrors_cache: SizedLruCache::new(config.file_mirrors_bytes),
            mirror_file_info_cache: SizedLruCache::new(config.mirror_file_info_bytes),
        })
    }

    /// Consumes invalidation events until the sender closes. A lagged
    /// receiver means events were dropped, which is handled exactly like
    /// a reconnect: everything cached is suspect.
    pub fn start_invalidation(
        self: &Arc<Self>,
        mut rx: broadcast::Receiver<CatalogEvent>,
    ) -> JoinHandleDropGuard<()> {
        let cache = self.clone();
        mirrorlink_util::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(catalog_event) => cache.handle_event(&catalog_event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        event!(Level::WARN, missed, "Invalidation receiver lagged");
                        cache.clear();
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }

    pub fn handle_event(&self, catalog_event: &CatalogEvent) {
        match catalog_event {
            CatalogEvent::FileUpdate(path) => self.file_cache.delete(path),
            CatalogEvent::MirrorUpdate(mirror_id) => {
                self.mirror_cache.delete(&mirror_id.to_string());
            }
            CatalogEvent::MirrorFileUpdate { mirror_id, path } => {
                self.file_mirrors_cache.delete(path);
                self.mirror_file_info_cache
                    .delete(&mirror_file_key(*mirror_id, path));
            }
            CatalogEvent::Reconnected => self.clear(),
            CatalogEvent::ClusterAnnounce(_) => {}
        }
    }

    pub fn clear(&self) {
        self.file_cache.clear();
        self.mirror_cache.clear();
        self.file_mirrors_cache.clear();
        self.mirror_file_info_cache.clear();
    }

    /// An unknown path yields a zero-valued record with the path set, not
    /// an error, so callers can distinguish "no such file" from a store
    /// failure.
    pub async fn get_file_info(&self, path: &str) -> Result<FileInfo, Error> {
        if let Some(hit) = self.file_cache.get(path) {
            return Ok(hit);
        }
        let info = self.store.get_file_info(path).await?;
        self.file_cache.set(path, info.clone());
        Ok(info)
    }

    pub async fn get_mirror(&self, mirror_id: i32) -> Result<Mirror, Error> {
        let key = mirror_id.to_string();
        if let Some(hit) = self.mirror_cache.get(&key) {
            return Ok(hit);
        }
        let mirror = self
            .store
            .get_mirror(mirror_id)
            .await?
            .ok_or_else(|| make_err!(Code::NotFound, "Unknown mirror {mirror_id}"))?;
        self.mirror_cache.set(&key, mirror.clone());
        Ok(mirror)
    }

    async fn get_file_info_at(&self, mirror_id: i32, path: &str) -> Result<FileInfo, Error> {
        let key = mirror_file_key(mirror_id, path);
        if let Some(hit) = self.mirror_file_info_cache.get(&key) {
            return Ok(hit);
        }
        let info = self
            .store
            .get_file_info_at_mirror(mirror_id, path)
            .await?
            .unwrap_or_else(|| FileInfo::new(path.to_string()));
        self.mirror_file_info_cache.set(&key, info.clone());
        Ok(info)
    }

    async fn get_file_mirror_ids(&self, path: &str) -> Result<Vec<i32>, Error> {
        if let Some(MirrorIds(hit)) = self.file_mirrors_cache.get(path) {
            return Ok(hit);
        }
        let raw = self
            .store
            .set_members(&keys::file_mirrors_key(path))
            .await?;
        let mut ids = Vec::with_capacity(raw.len());
        for id in &raw {
            ids.push(
                id.parse::<i32>()
                    .map_err(Error::from)
                    .err_tip(|| format!("Corrupt mirror id {id} for {path}"))?,
            );
        }
        ids.sort_unstable();
        self.file_mirrors_cache.set(path, MirrorIds(ids.clone()));
        Ok(ids)
    }

    /// Joins the mirror list for a path with each mirror's own record of
    /// the file, computes client distance, and orders by rank. A mirror
    /// id that vanished between the set read and the join is skipped.
    pub async fn get_mirrors(
        &self,
        path: &str,
        client: &ClientGeo,
    ) -> Result<Vec<Mirror>, Error> {
        let ids = self.get_file_mirror_ids(path).await?;
        let mut mirrors = Vec::with_capacity(ids.len());
        for mirror_id in ids {
            let mut mirror = match self.get_mirror(mirror_id).await {
                Ok(mirror) => mirror,
                Err(e) if e.code == Code::NotFound => continue,
                Err(e) => return Err(e.append(format!("While joining mirror {mirror_id}"))),
            };
            mirror.file_info = Some(self.get_file_info_at(mirror_id, path).await?);
            mirror.distance = if client.has_location() {
                distance_km(
                    client.latitude,
                    client.longitude,
                    mirror.latitude,
                    mirror.longitude,
                )
            } else {
                0.0
            };
            mirrors.push(mirror);
        }
        mirrors.sort_by(|a, b| a.cmp_by_rank(b, client));
        Ok(mirrors)
    }
}

fn mirror_file_key(mirror_id: i32, path: &str) -> String {
    format!("{mirror_id}|{path}")
}
