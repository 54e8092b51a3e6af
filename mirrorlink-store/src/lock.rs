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
use std::time::Duration;

use mirrorlink_error::{Error, ResultExt};
use mirrorlink_util::task::JoinHandleDropGuard;
use redis::aio::{ConnectionLike, ConnectionManager};
use tracing::{event, Level};

use crate::keys;
use crate::redis_store::{CatalogStore, Connect};

const NAMED_LOCK_TTL_SECS: u64 = 5;
const SCAN_LOCK_TTL_SECS: u64 = 600;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

// Refresh and release must be atomic with the token check; a lock that
// expired and was re-acquired elsewhere must not be touchable with the
// old token.
const REFRESH_SCRIPT: &str = r"if redis.call('GET', KEYS[1]) == ARGV[1] then return redis.call('EXPIRE', KEYS[1], ARGV[2]) else return 0 end";
const RELEASE_SCRIPT: &str = r"if redis.call('GET', KEYS[1]) == ARGV[1] then return redis.call('DEL', KEYS[1]) else return 0 end";

async fn try_set_nx<C: ConnectionLike + Connect + Clone + Send + Sync>(
    store: &CatalogStore<C>,
    key: &str,
    token: &str,
    ttl_secs: u64,
) -> Result<bool, Error> {
    let mut conn = store.conn().await?;
    let acquired: Option<String> = redis::cmd("SET")
        .arg(key)
        .arg(token)
        .arg("NX")
        .arg("EX")
        .arg(ttl_secs)
        .query_async(&mut conn)
        .await
        .map_err(Error::from)
        .err_tip(|| format!("While acquiring lock {key}"))?;
    Ok(acquired.is_some())
}

async fn release_with_token<C: ConnectionLike + Connect + Clone + Send + Sync>(
    store: &CatalogStore<C>,
    key: &str,
    token: &str,
) -> Result<(), Error> {
    let mut conn = store.conn().await?;
    let _: i64 = redis::Script::new(RELEASE_SCRIPT)
        .key(key)
        .arg(token)
        .invoke_async(&mut conn)
        .await
        .map_err(Error::from)
        .err_tip(|| format!("While releasing lock {key}"))?;
    Ok(())
}

/// A named advisory lock with a 5 second TTL, refreshed every second by a
/// background task for as long as the lock value is held. Dropping the
/// lock without calling [`NamedLock::release`] stops the refresh and lets
/// the TTL expire on its own.
pub struct NamedLock<C: ConnectionLike + Connect + Clone + Send + Sync = ConnectionManager> {
    store: Arc<CatalogStore<C>>,
    key: String,
    token: String,
    _keepalive: JoinHandleDropGuard<()>,
}

impl<C: ConnectionLike + Connect + Clone + Send + Sync + 'static> NamedLock<C> {
    /// Returns None when another owner currently holds the lock.
    pub async fn try_acquire(
        store: Arc<CatalogStore<C>>,
        name: &str,
    ) -> Result<Option<Self>, Error> {
        let key = keys::lock_key(name);
        let token = uuid::Uuid::new_v4().to_string();
        if !try_set_nx(&store, &key, &token, NAMED_LOCK_TTL_SECS).await? {
            return Ok(None);
        }
        let keepalive = {
            let store = store.clone();
            let key = key.clone();
            let token = token.clone();
            mirrorlink_util::spawn(async move {
                loop {
                    tokio::time::sleep(KEEPALIVE_INTERVAL).await;
                    let refresh = async {
                        let mut conn = store.conn().await?;
                        let refreshed: i64 = redis::Script::new(REFRESH_SCRIPT)
                            .key(&key)
                            .arg(&token)
                            .arg(NAMED_LOCK_TTL_SECS)
                            .invoke_async(&mut conn)
                            .await
                            .map_err(Error::from)?;
                        Ok::<i64, Error>(refreshed)
                    };
                    match refresh.await {
                        Ok(1) => {}
                        Ok(_) => {
                            event!(Level::WARN, key = key.as_str(), "Lock lost before refresh");
                            return;
                        }
                        Err(e) => event!(Level::WARN, ?e, key = key.as_str(), "Lock refresh failed"),
                    }
                }
            })
        };
        Ok(Some(Self {
            store,
            key,
            token,
            _keepalive: keepalive,
        }))
    }

    pub async fn release(self) -> Result<(), Error> {
        release_with_token(&self.store, &self.key, &self.token).await
    }
}

/// The per-mirror scan lock. Unlike [`NamedLock`] it has a 10 minute TTL
/// and no keepalive; a crashed scanner frees the mirror on expiry.
pub struct ScanLock<C: ConnectionLike + Connect + Clone + Send + Sync = ConnectionManager> {
    store: Arc<CatalogStore<C>>,
    key: String,
    token: String,
}

impl<C: ConnectionLike + Connect + Clone + Send + Sync + 'static> ScanLock<C> {
    pub async fn try_acquire(
        store: Arc<CatalogStore<C>>,
        mirror_id: i32,
    ) -> Result<Option<Self>, Error> {
        let key = keys::scanning_key(mirror_id);
        let token = uuid::Uuid::new_v4().to_string();
        if !try_set_nx(&store, &key, &token, SCAN_LOCK_TTL_SECS).await? {
            return Ok(None);
        }
        Ok(Some(Self { store, key, token }))
    }

    pub async fn release(self) -> Result<(), Error> {
        release_with_token(&self.store, &self.key, &self.token).await
    }
}
