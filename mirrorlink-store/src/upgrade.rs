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
use std::sync::Arc;
use std::time::Duration;

use mirrorlink_error::{make_err, Code, Error, ResultExt};
use redis::aio::ConnectionLike;
use redis::AsyncCommands;
use tracing::{event, Level};

use crate::keys;
use crate::lock::NamedLock;
use crate::redis_store::{CatalogStore, Connect};

/// Newest schema this build understands. A catalog stamped with a higher
/// number was written by a newer binary and must not be touched.
pub const CURRENT_DB_VERSION: i64 = 1;

pub async fn read_version<C: ConnectionLike + Connect + Clone + Send + Sync>(
    store: &CatalogStore<C>,
) -> Result<i64, Error> {
    let mut conn = store.conn().await?;
    let version: Option<i64> = conn
        .get(keys::DB_VERSION)
        .await
        .map_err(Error::from)
        .err_tip(|| "While reading DBVERSION")?;
    Ok(version.unwrap_or(0))
}

/// Gates startup on the schema version and runs the one-way upgraders
/// when the catalog is behind, serialized across nodes by `LOCK_upgrade`.
pub async fn check_and_upgrade<C: ConnectionLike + Connect + Clone + Send + Sync + 'static>(
    store: &Arc<CatalogStore<C>>,
) -> Result<(), Error> {
    loop {
        let version = read_version(store.as_ref()).await?;
        if version == CURRENT_DB_VERSION {
            return Ok(());
        }
        if version > CURRENT_DB_VERSION {
            return Err(make_err!(
                Code::FailedPrecondition,
                "Catalog version {version} is newer than the supported {CURRENT_DB_VERSION}; upgrade the binary"
            ));
        }
        let Some(lock) = NamedLock::try_acquire(store.clone(), "upgrade").await? else {
            // Another node is upgrading; poll until it finishes.
            tokio::time::sleep(Duration::from_secs(1)).await;
            continue;
        };
        let result = run_upgraders(store, version).await;
        lock.release().await.merge(result)?;
    }
}

async fn run_upgraders<C: ConnectionLike + Connect + Clone + Send + Sync>(
    store: &Arc<CatalogStore<C>>,
    mut version: i64,
) -> Result<(), Error> {
    while version < CURRENT_DB_VERSION {
        event!(Level::INFO, from = version, to = version + 1, "Upgrading catalog schema");
        match version {
            0 => upgrade_v0_to_v1(store).await?,
            unknown => {
                return Err(make_err!(
                    Code::Internal,
                    "No upgrader registered for version {unknown}"
                ))
            }
        }
        version += 1;
        let mut conn = store.conn().await?;
        let stamped: Result<(), _> = conn.set(keys::DB_VERSION, version).await;
        stamped
            .map_err(Error::from)
            .err_tip(|| "While stamping DBVERSION")?;
    }
    Ok(())
}

/// v0 catalogs keyed per-mirror file entries by mirror *name*. Rewrites
/// `FILEINFO_{name}_{path}` to `FILEINFO_{id}_{path}` using the MIRRORS
/// hash; entries whose mirror no longer exists are dropped.
async fn upgrade_v0_to_v1<C: ConnectionLike + Connect + Clone + Send + Sync>(
    store: &Arc<CatalogStore<C>>,
) -> Result<(), Error> {
    let names: HashMap<String, String> = store.hash_all(keys::MIRRORS).await?;
    let mut id_by_name = HashMap::with_capacity(names.len());
    for (id, name) in &names {
        id_by_name.insert(name.clone(), id.clone());
    }

    let mut conn = store.conn().await?;
    let legacy_keys: Vec<String> = {
        let mut iter = conn
            .scan_match::<_, String>("FILEINFO_*")
            .await
            .map_err(Error::from)
            .err_tip(|| "While scanning legacy FILEINFO keys")?;
        let mut found = Vec::new();
        while let Some(key) = iter.next_item().await {
            found.push(key);
        }
        found
    };

    for key in legacy_keys {
        let Some(rest) = key.strip_prefix("FILEINFO_") else {
            continue;
        };
        let Some((owner, path)) = rest.split_once('_') else {
            continue;
        };
        if owner.parse::<i32>().is_ok() {
            continue;
        }
        match id_by_name.get(owner) {
            Some(id) => {
                let new_key = format!("FILEINFO_{id}_{path}");
                let renamed: Result<(), _> = conn.rename(&key, new_key).await;
                renamed
                    .map_err(Error::from)
                    .err_tip(|| format!("While renaming {key}"))?;
            }
            None => {
                let deleted: Result<(), _> = conn.del(&key).await;
                deleted
                    .map_err(Error::from)
                    .err_tip(|| format!("While dropping orphan {key}"))?;
            }
        }
    }
    Ok(())
}
