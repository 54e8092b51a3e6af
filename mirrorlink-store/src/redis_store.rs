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

use std::collections::HashMap;

use async_lock::Mutex;
use async_trait::async_trait;
use mirrorlink_config::RedisConfig;
use mirrorlink_error::{make_err, Code, Error, ResultExt};
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::AsyncCommands;

use crate::file_info::FileInfo;
use crate::keys;
use crate::mirror::Mirror;

/// A connection that is established on first use so construction never
/// blocks on the network and a flaky store can recover between calls.
pub enum LazyConnection<C> {
    Address(String),
    Connection(Result<C, Error>),
}

#[async_trait]
pub trait Connect: Sized {
    async fn connect(address: &str) -> Result<Self, Error>;
}

#[async_trait]
impl Connect for ConnectionManager {
    async fn connect(address: &str) -> Result<Self, Error> {
        let client = redis::Client::open(address)
            .map_err(Error::from)
            .err_tip(|| format!("Invalid redis address {address}"))?;
        client
            .get_connection_manager()
            .await
            .map_err(Error::from)
            .err_tip(|| "Failed to connect to redis")
    }
}

/// Typed access to the shared catalog. Generic over the connection so the
/// test suite can swap in `redis_test::MockRedisConnection`.
pub struct CatalogStore<C: ConnectionLike + Clone + Send + Sync = ConnectionManager> {
    lazy_conn: Mutex<LazyConnection<C>>,
    address: String,
    pub db_index: i64,
}

/// Builds the connection URL, resolving the master through the first
/// reachable sentinel when any are configured.
pub async fn resolve_address(config: &RedisConfig) -> Result<String, Error> {
    let auth = config
        .password
        .as_ref()
        .map(|p| format!(":{p}@"))
        .unwrap_or_default();
    if config.sentinels.is_empty() {
        let host = config
            .address
            .trim_start_matches("redis://")
            .trim_end_matches('/');
        return Ok(format!("redis://{auth}{host}/{}", config.db));
    }
    let mut last_err = make_err!(Code::Unavailable, "No sentinel configured");
    for sentinel in &config.sentinels {
        let client = match redis::Client::open(format!("redis://{sentinel}/")) {
            Ok(client) => client,
            Err(e) => {
                last_err = Error::from(e);
                continue;
            }
        };
        let mut conn = match client.get_multiplexed_async_connection().await {
            Ok(conn) => conn,
            Err(e) => {
                last_err = Error::from(e);
                continue;
            }
        };
        let addr: Result<Vec<String>, _> = redis::cmd("SENTINEL")
            .arg("get-master-addr-by-name")
            .arg(&config.sentinel_master_name)
            .query_async(&mut conn)
            .await;
        match addr {
            Ok(parts) if parts.len() == 2 => {
                return Ok(format!("redis://{auth}{}:{}/{}", parts[0], parts[1], config.db));
            }
            Ok(_) => {
                last_err = make_err!(
                    Code::NotFound,
                    "Sentinel {sentinel} does not know master {}",
                    config.sentinel_master_name
                );
            }
            Err(e) => last_err = Error::from(e),
        }
    }
    Err(last_err.append("While resolving redis master through sentinels"))
}

impl<C: ConnectionLike + Connect + Clone + Send + Sync> CatalogStore<C> {
    pub fn new(address: String, db_index: i64) -> Self {
        Self {
            lazy_conn: Mutex::new(LazyConnection::Address(address.clone())),
            address,
            db_index,
        }
    }

    pub fn new_with_connection(conn: C) -> Self {
        Self {
            lazy_conn: Mutex::new(LazyConnection::Connection(Ok(conn))),
            address: String::new(),
            db_index: 0,
        }
    }

    /// The URL a dedicated pub/sub connection should dial.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn conn(&self) -> Result<C, Error> {
        let mut lazy_conn = self.lazy_conn.lock().await;
        match &*lazy_conn {
            LazyConnection::Connection(Ok(conn)) => return Ok(conn.clone()),
            LazyConnection::Connection(Err(_)) | LazyConnection::Address(_) => (),
        }
        // Either never connected or a previous attempt failed; dial again
        // so the store can come back without a process restart.
        let result = C::connect(&self.address).await;
        let conn = result.clone().err_tip(|| "While dialing the catalog store");
        *lazy_conn = LazyConnection::Connection(result);
        conn
    }

    pub async fn hash_all(&self, key: &str) -> Result<HashMap<String, String>, Error> {
        let mut conn = self.conn().await?;
        conn.hgetall(key)
            .await
            .map_err(Error::from)
            .err_tip(|| format!("While reading hash {key}"))
    }

    pub async fn set_members(&self, key: &str) -> Result<Vec<String>, Error> {
        let mut conn = self.conn().await?;
        conn.smembers(key)
            .await
            .map_err(Error::from)
            .err_tip(|| format!("While reading set {key}"))
    }

    pub async fn random_set_member(&self, key: &str) -> Result<Option<String>, Error> {
        let mut conn = self.conn().await?;
        conn.srandmember(key)
            .await
            .map_err(Error::from)
            .err_tip(|| format!("While sampling set {key}"))
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> Result<(), Error> {
        let mut conn = self.conn().await?;
        conn.publish(channel, payload)
            .await
            .map_err(Error::from)
            .err_tip(|| format!("While publishing to {channel}"))
    }

    /// Reads one mirror, returning None when the id is unknown.
    pub async fn get_mirror(&self, mirror_id: i32) -> Result<Option<Mirror>, Error> {
        let fields = self.hash_all(&keys::mirror_key(mirror_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Mirror::from_hash(mirror_id, &fields).map(Some)
    }

    /// Writes every field of the mirror and publishes `mirror_update`.
    pub async fn write_mirror(&self, mirror: &Mirror) -> Result<(), Error> {
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(keys::MIRRORS, mirror.id.to_string(), mirror.name.clone())
            .ignore();
        pipe.hset_multiple(keys::mirror_key(mirror.id), &mirror.to_hash())
            .ignore();
        pipe.publish(keys::channels::MIRROR_UPDATE, mirror.id.to_string())
            .ignore();
        pipe.query_async(&mut conn)
            .await
            .map_err(Error::from)
            .err_tip(|| format!("While writing mirror {}", mirror.id))
    }

    /// Patches a subset of mirror fields and publishes `mirror_update`.
    pub async fn update_mirror_fields(
        &self,
        mirror_id: i32,
        fields: &[(&str, String)],
    ) -> Result<(), Error> {
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset_multiple(keys::mirror_key(mirror_id), fields)
            .ignore()
            .publish(keys::channels::MIRROR_UPDATE, mirror_id.to_string())
            .ignore();
        pipe.query_async(&mut conn)
            .await
            .map_err(Error::from)
            .err_tip(|| format!("While updating mirror {mirror_id}"))
    }

    /// All registered mirror ids, ascending.
    pub async fn mirror_ids(&self) -> Result<Vec<i32>, Error> {
        let names: HashMap<String, String> = self.hash_all(keys::MIRRORS).await?;
        let mut ids = Vec::with_capacity(names.len());
        for id in names.keys() {
            ids.push(
                id.parse::<i32>()
                    .map_err(Error::from)
                    .err_tip(|| format!("Corrupt mirror id {id} in MIRRORS"))?,
            );
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Allocates the next stable mirror id.
    pub async fn next_mirror_id(&self) -> Result<i32, Error> {
        let mut conn = self.conn().await?;
        conn.incr(keys::LAST_MIRROR_ID, 1)
            .await
            .map_err(Error::from)
            .err_tip(|| "While allocating a mirror id")
    }

    /// Reads the authoritative file record, returning a zero-valued
    /// record with the path set when the file is unknown.
    pub async fn get_file_info(&self, path: &str) -> Result<FileInfo, Error> {
        let fields = self.hash_all(&keys::file_key(path)).await?;
        FileInfo::from_hash(path, &fields)
    }

    /// Reads a mirror's own record of a file, or None when the mirror
    /// does not carry it.
    pub async fn get_file_info_at_mirror(
        &self,
        mirror_id: i32,
        path: &str,
    ) -> Result<Option<FileInfo>, Error> {
        let fields = self.hash_all(&keys::file_info_key(mirror_id, path)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        FileInfo::from_hash(path, &fields).map(Some)
    }
}
