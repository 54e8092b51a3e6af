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
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use mirrorlink_error::{make_err, Code, Error, ResultExt};
use mirrorlink_store::keys::{self, channels};
use mirrorlink_store::lock::ScanLock;
use mirrorlink_store::mirror::{ScanProtocol, SyncPrecision};
use mirrorlink_store::redis_store::{CatalogStore, Connect};
use redis::aio::ConnectionLike;
use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};

use crate::ftp::FtpLister;
use crate::rsync::RsyncLister;
use crate::trace;

/// One remote file as reported by a listing source, path already relative
/// to the remote module root.
#[derive(Clone, Debug, PartialEq)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
    /// Unix seconds; None when the protocol exposed no usable mod-time.
    pub mod_time: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FileListing {
    pub entries: Vec<FileEntry>,
    /// Worst mod-time granularity of this listing.
    pub precision: SyncPrecision,
}

/// Uniform "list files with size and mtime" contract the scan consumes.
/// The rsync and FTP implementations live in this crate; tests inject
/// their own.
#[async_trait]
pub trait SourceLister: Send + Sync {
    async fn list(&self, url: &str, cancel: &CancellationToken) -> Result<FileListing, Error>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScanResult {
    pub files_indexed: u64,
    pub known_indexed: u64,
    pub precision: SyncPrecision,
}

/// Produces the per-mirror file inventory. One scan per mirror runs at a
/// time across the whole cluster, enforced by `SCANNING_{id}`.
pub struct MirrorScanner<C: ConnectionLike + Connect + Clone + Send + Sync = redis::aio::ConnectionManager>
{
    store: Arc<CatalogStore<C>>,
    repository_prefix: String,
    trace_file: String,
}

impl<C: ConnectionLike + Connect + Clone + Send + Sync + 'static> MirrorScanner<C> {
    pub fn new(store: Arc<CatalogStore<C>>, repository_prefix: String, trace_file: String) -> Self {
        Self {
            store,
            repository_prefix,
            trace_file,
        }
    }

    pub async fn scan(
        &self,
        protocol: ScanProtocol,
        url: &str,
        mirror_id: i32,
        cancel: &CancellationToken,
    ) -> Result<ScanResult, Error> {
        match protocol {
            ScanProtocol::Rsync => {
                self.scan_with_lister(&RsyncLister::default(), protocol, url, mirror_id, cancel)
                    .await
            }
            ScanProtocol::Ftp => {
                self.scan_with_lister(&FtpLister::default(), protocol, url, mirror_id, cancel)
                    .await
            }
            ScanProtocol::None => Err(make_err!(
                Code::InvalidArgument,
                "Mirror {mirror_id} has no scannable URL"
            )),
        }
    }

    pub async fn scan_with_lister(
        &self,
        lister: &dyn SourceLister,
        protocol: ScanProtocol,
        url: &str,
        mirror_id: i32,
        cancel: &CancellationToken,
    ) -> Result<ScanResult, Error> {
        let Some(lock) = ScanLock::try_acquire(self.store.clone(), mirror_id).await? else {
            return Err(make_err!(
                Code::AlreadyExists,
                "Scan of mirror {mirror_id} already in progress"
            ));
        };
        let result = self.scan_locked(lister, protocol, url, mirror_id, cancel).await;
        let release_result = lock.release().await;
        match &result {
            Ok(scan) => event!(
                Level::INFO,
                mirror_id,
                files = scan.files_indexed,
                known = scan.known_indexed,
                "Mirror scan finished"
            ),
            Err(e) if e.code == Code::Aborted => {
                event!(Level::DEBUG, mirror_id, "Mirror scan aborted")
            }
            Err(e) => event!(Level::WARN, mirror_id, ?e, "Mirror scan failed"),
        }
        release_result.merge(result)
    }

    async fn scan_locked(
        &self,
        lister: &dyn SourceLister,
        protocol: ScanProtocol,
        url: &str,
        mirror_id: i32,
        cancel: &CancellationToken,
    ) -> Result<ScanResult, Error> {
        self.store
            .update_mirror_fields(mirror_id, &[("lastSync", unix_now().to_string())])
            .await
            .err_tip(|| "While recording lastSync")?;

        let listing = lister.list(url, cancel).await;
        let listing = match listing {
            Ok(listing) => listing,
            Err(e) => {
                self.discard_staging(mirror_id).await;
                return Err(e.append(format!("While listing mirror {mirror_id}")));
            }
        };
        if cancel.is_cancelled() {
            self.discard_staging(mirror_id).await;
            return Err(scan_aborted());
        }

        let tmp_key = keys::mirror_files_tmp_key(mirror_id);
        let mut conn = self.store.conn().await?;
        let mut count: u64 = 0;
        for entry in &listing.entries {
            let Some(path) = normalize_path(&entry.path, &self.repository_prefix) else {
                continue;
            };
            let mut pipe = redis::pipe();
            pipe.sadd(&tmp_key, &path).ignore();
            pipe.sadd(keys::file_mirrors_key(&path), mirror_id).ignore();
            let mut fields = vec![("size", entry.size.to_string())];
            if listing.precision >= SyncPrecision::Day {
                if let Some(mod_time) = entry.mod_time {
                    fields.push(("modTime", mod_time.to_string()));
                }
            }
            pipe.hset_multiple(keys::file_info_key(mirror_id, &path), &fields)
                .ignore();
            pipe.publish(channels::MIRROR_FILE_UPDATE, format!("{mirror_id} {path}"))
                .ignore();
            let staged: Result<(), _> = pipe.query_async(&mut conn).await;
            if let Err(e) = staged {
                self.discard_staging(mirror_id).await;
                return Err(Error::from(e)).err_tip(|| format!("While staging {path}"));
            }
            count += 1;
            if count % 1000 == 0 && cancel.is_cancelled() {
                self.discard_staging(mirror_id).await;
                return Err(scan_aborted());
            }
        }
        if count == 0 {
            self.discard_staging(mirror_id).await;
            return Err(make_err!(
                Code::FailedPrecondition,
                "Mirror {mirror_id} listing is empty; keeping the previous inventory"
            ));
        }

        self.commit(mirror_id, protocol, listing.precision).await
    }

    /// Applies removals, swaps the staged set in and refreshes the
    /// handled-files intersection.
    async fn commit(
        &self,
        mirror_id: i32,
        protocol: ScanProtocol,
        precision: SyncPrecision,
    ) -> Result<ScanResult, Error> {
        let mut conn = self.store.conn().await?;
        let files_key = keys::mirror_files_key(mirror_id);
        let tmp_key = keys::mirror_files_tmp_key(mirror_id);

        let removed: Vec<String> = conn
            .sdiff(&[&files_key, &tmp_key])
            .await
            .map_err(Error::from)
            .err_tip(|| "While diffing the previous inventory")?;
        for path in &removed {
            let mut pipe = redis::pipe();
            pipe.srem(keys::file_mirrors_key(path), mirror_id).ignore();
            pipe.del(keys::file_info_key(mirror_id, path)).ignore();
            pipe.publish(channels::MIRROR_FILE_UPDATE, format!("{mirror_id} {path}"))
                .ignore();
            let dropped: Result<(), _> = pipe.query_async(&mut conn).await;
            dropped
                .map_err(Error::from)
                .err_tip(|| format!("While dropping removed path {path}"))?;
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("RENAME").arg(&tmp_key).arg(&files_key).ignore();
        pipe.cmd("SINTERSTORE")
            .arg(keys::handled_files_key(mirror_id))
            .arg(&files_key)
            .arg(keys::FILES)
            .ignore();
        let committed: Result<(), _> = pipe.query_async(&mut conn).await;
        committed
            .map_err(Error::from)
            .err_tip(|| "While committing the new inventory")?;

        let known: u64 = conn
            .scard(keys::handled_files_key(mirror_id))
            .await
            .map_err(Error::from)
            .err_tip(|| "While counting handled files")?;
        let total: u64 = conn
            .scard(&files_key)
            .await
            .map_err(Error::from)
            .err_tip(|| "While counting the inventory")?;

        let mut fields = vec![
            ("lastSuccessfulSync", unix_now().to_string()),
            (
                "lastSuccessfulSyncProtocol",
                match protocol {
                    ScanProtocol::Rsync => "rsync".to_string(),
                    ScanProtocol::Ftp => "ftp".to_string(),
                    ScanProtocol::None => String::new(),
                },
            ),
            (
                "lastSuccessfulSyncPrecision",
                (precision as i64).to_string(),
            ),
        ];
        if !self.trace_file.is_empty() {
            if let Some(probe) =
                trace::probe(self.store.as_ref(), mirror_id, &self.trace_file).await
            {
                fields.push(("tzOffset", probe.tz_offset_ms.to_string()));
                fields.push(("lastModTime", probe.mirror_mod_time.to_string()));
            }
        }
        self.store
            .update_mirror_fields(mirror_id, &fields)
            .await
            .err_tip(|| "While recording the successful sync")?;

        Ok(ScanResult {
            files_indexed: total,
            known_indexed: known,
            precision,
        })
    }

    /// Failed or aborted scans leave the previous inventory untouched;
    /// only the staging set is dropped.
    async fn discard_staging(&self, mirror_id: i32) {
        let discard = async {
            let mut conn = self.store.conn().await?;
            let deleted: Result<(), _> = conn.del(keys::mirror_files_tmp_key(mirror_id)).await;
            deleted.map_err(Error::from)
        };
        if let Err(e) = discard.await {
            event!(Level::WARN, mirror_id, ?e, "Failed to discard scan staging");
        }
    }
}

fn scan_aborted() -> Error {
    make_err!(Code::Aborted, "Scan aborted")
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Strips the configured repository prefix and normalizes to a leading
/// slash. Entries outside the prefix and rsync partial-transfer
/// directories are excluded.
pub fn normalize_path(raw: &str, repository_prefix: &str) -> Option<String> {
    if raw.contains(".~tmp~") {
        return None;
    }
    let mut path = raw.trim_start_matches('/');
    if !repository_prefix.is_empty() {
        let prefix = repository_prefix.trim_matches('/');
        path = path.strip_prefix(prefix)?.trim_start_matches('/');
    }
    if path.is_empty() {
        return None;
    }
    Some(format!("/{path}"))
}

#[cfg(test)]
mod scan_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn normalize_strips_prefix_and_partials() {
        assert_eq!(
            normalize_path("pub/repo/a/b.iso", "pub/repo"),
            Some("/a/b.iso".to_string())
        );
        assert_eq!(normalize_path("a/b.iso", ""), Some("/a/b.iso".to_string()));
        assert_eq!(normalize_path("other/a.iso", "pub/repo"), None);
        assert_eq!(normalize_path("a/.~tmp~/part", ""), None);
        assert_eq!(normalize_path("pub/repo", "pub/repo"), None);
    }
}
