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

use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use mirrorlink_config::HashAlgorithm;
use mirrorlink_error::{make_err, Code, Error, ResultExt};
use mirrorlink_store::file_info::FileInfo;
use mirrorlink_store::keys::{self, channels};
use mirrorlink_store::lock::NamedLock;
use mirrorlink_store::redis_store::{CatalogStore, Connect};
use redis::aio::ConnectionLike;
use sha1::Digest;
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};
use walkdir::WalkDir;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RepoScanResult {
    pub files_total: u64,
    pub files_hashed: u64,
    pub files_removed: u64,
}

/// One observed file before the catalog join.
#[derive(Clone, Debug, PartialEq)]
pub struct WalkedFile {
    pub path: String,
    pub abs_path: PathBuf,
    pub size: u64,
    pub mod_time: i64,
}

/// Maintains the authoritative file catalog from the local source tree.
/// The sole writer of `FILE_*` and `FILES`.
pub struct RepositoryScanner<C: ConnectionLike + Connect + Clone + Send + Sync = redis::aio::ConnectionManager>
{
    store: Arc<CatalogStore<C>>,
    root: PathBuf,
    hashes: Vec<HashAlgorithm>,
}

impl<C: ConnectionLike + Connect + Clone + Send + Sync + 'static> RepositoryScanner<C> {
    pub fn new(store: Arc<CatalogStore<C>>, root: PathBuf, hashes: Vec<HashAlgorithm>) -> Self {
        Self { store, root, hashes }
    }

    /// Guarded by `LOCK_repository_scan` so only one node walks the tree
    /// at a time.
    pub async fn scan(&self, cancel: &CancellationToken) -> Result<RepoScanResult, Error> {
        let Some(lock) = NamedLock::try_acquire(self.store.clone(), "repository_scan").await?
        else {
            return Err(make_err!(
                Code::AlreadyExists,
                "Repository scan already in progress"
            ));
        };
        let result = self.scan_locked(cancel).await;
        let release_result = lock.release().await;
        release_result.merge(result)
    }

    async fn scan_locked(&self, cancel: &CancellationToken) -> Result<RepoScanResult, Error> {
        let root = self.root.clone();
        let walked = tokio::task::spawn_blocking(move || walk_repository(&root))
            .await
            .map_err(|e| make_err!(Code::Internal, "Repository walk panicked: {e}"))??;
        if walked.is_empty() {
            return Err(make_err!(
                Code::FailedPrecondition,
                "Repository {} is empty; refusing to flush the catalog",
                self.root.display()
            ));
        }

        let mut changed: Vec<FileInfo> = Vec::new();
        let mut hashed: u64 = 0;
        for file in &walked {
            if cancel.is_cancelled() {
                return Err(make_err!(Code::Aborted, "Scan aborted"));
            }
            let stored = self.store.get_file_info(&file.path).await?;
            if !needs_rehash(&stored, file, &self.hashes) {
                continue;
            }
            let abs_path = file.abs_path.clone();
            let algorithms = self.hashes.clone();
            let (sha1, sha256, md5) =
                tokio::task::spawn_blocking(move || hash_file(&abs_path, &algorithms))
                    .await
                    .map_err(|e| make_err!(Code::Internal, "Hashing panicked: {e}"))??;
            hashed += 1;
            changed.push(FileInfo {
                path: file.path.clone(),
                size: file.size,
                mod_time: Some(UNIX_EPOCH + std::time::Duration::from_secs(file.mod_time as u64)),
                sha1,
                sha256,
                md5,
            });
        }

        let previous = self.store.set_members(keys::FILES).await?;
        let seen: HashSet<&str> = walked.iter().map(|f| f.path.as_str()).collect();
        let removed: Vec<&String> = previous.iter().filter(|p| !seen.contains(p.as_str())).collect();

        // One transaction: stage the observed set, write the changed
        // records, drop the deleted ones, then swap the set in.
        let mut pipe = redis::pipe();
        pipe.atomic();
        for file in &walked {
            pipe.sadd(keys::FILES_TMP, &file.path).ignore();
        }
        for info in &changed {
            pipe.hset_multiple(keys::file_key(&info.path), &info.to_hash())
                .ignore();
            pipe.publish(channels::FILE_UPDATE, &info.path).ignore();
        }
        for path in &removed {
            pipe.del(keys::file_key(path)).ignore();
            pipe.publish(channels::FILE_UPDATE, path.as_str()).ignore();
        }
        pipe.cmd("RENAME").arg(keys::FILES_TMP).arg(keys::FILES).ignore();
        let mut conn = self.store.conn().await?;
        let committed: Result<(), _> = pipe.query_async(&mut conn).await;
        committed
            .map_err(Error::from)
            .err_tip(|| "While committing the repository scan")?;

        let result = RepoScanResult {
            files_total: walked.len() as u64,
            files_hashed: hashed,
            files_removed: removed.len() as u64,
        };
        event!(
            Level::INFO,
            total = result.files_total,
            hashed = result.files_hashed,
            removed = result.files_removed,
            "Repository scan finished"
        );
        Ok(result)
    }
}

/// Walks the source tree following symbolic links, reporting every
/// regular file with its size and mod-time.
pub fn walk_repository(root: &Path) -> Result<Vec<WalkedFile>, Error> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                event!(Level::WARN, ?e, "Unreadable entry during repository walk");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let metadata = entry
            .metadata()
            .map_err(|e| make_err!(Code::Internal, "{e}"))
            .err_tip(|| format!("While inspecting {}", entry.path().display()))?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| make_err!(Code::Internal, "{e}"))
            .err_tip(|| "Walked outside the repository root")?;
        let mod_time = metadata
            .modified()
            .map_err(Error::from)?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        files.push(WalkedFile {
            path: format!("/{}", relative.to_string_lossy()),
            abs_path: entry.path().to_path_buf(),
            size: metadata.len(),
            mod_time,
        });
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

/// Hashes are recomputed only when the stored record disagrees on size
/// or mod-time, or when a configured hash has never been computed.
pub fn needs_rehash(stored: &FileInfo, observed: &WalkedFile, hashes: &[HashAlgorithm]) -> bool {
    if stored.size != observed.size || stored.mod_time_unix() != observed.mod_time {
        return true;
    }
    hashes.iter().any(|algorithm| match algorithm {
        HashAlgorithm::sha1 => stored.sha1.is_empty(),
        HashAlgorithm::sha256 => stored.sha256.is_empty(),
        HashAlgorithm::md5 => stored.md5.is_empty(),
    })
}

/// Computes the enabled hashes in one pass over the file. Disabled
/// algorithms come back as empty strings.
pub fn hash_file(
    path: &Path,
    hashes: &[HashAlgorithm],
) -> Result<(String, String, String), Error> {
    let want_sha1 = hashes.contains(&HashAlgorithm::sha1);
    let want_sha256 = hashes.contains(&HashAlgorithm::sha256);
    let want_md5 = hashes.contains(&HashAlgorithm::md5);

    let mut file = std::fs::File::open(path)
        .map_err(Error::from)
        .err_tip(|| format!("While opening {} for hashing", path.display()))?;
    let mut sha1_ctx = sha1::Sha1::new();
    let mut sha256_ctx = sha2::Sha256::new();
    let mut md5_ctx = md5::Context::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = file
            .read(&mut buffer)
            .map_err(Error::from)
            .err_tip(|| format!("While hashing {}", path.display()))?;
        if read == 0 {
            break;
        }
        if want_sha1 {
            sha1_ctx.update(&buffer[..read]);
        }
        if want_sha256 {
            sha256_ctx.update(&buffer[..read]);
        }
        if want_md5 {
            md5_ctx.consume(&buffer[..read]);
        }
    }
    Ok((
        if want_sha1 {
            hex::encode(sha1_ctx.finalize())
        } else {
            String::new()
        },
        if want_sha256 {
            hex::encode(sha256_ctx.finalize())
        } else {
            String::new()
        },
        if want_md5 {
            format!("{:x}", md5_ctx.compute())
        } else {
            String::new()
        },
    ))
}

#[cfg(test)]
mod repository_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn walked(path: &str, size: u64, mod_time: i64) -> WalkedFile {
        WalkedFile {
            path: path.to_string(),
            abs_path: PathBuf::from(path),
            size,
            mod_time,
        }
    }

    #[test]
    fn walk_reports_relative_paths_and_sizes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("releases/1.0")).unwrap();
        std::fs::write(dir.path().join("releases/1.0/app.bin"), b"payload").unwrap();
        std::fs::write(dir.path().join("trace"), b"1700000000").unwrap();

        let files = walk_repository(dir.path()).unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["/releases/1.0/app.bin", "/trace"]);
        assert_eq!(files[0].size, 7);
        assert!(files[0].mod_time > 0);
    }

    #[test]
    fn hash_file_matches_known_digests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hello").unwrap();

        let (sha1, sha256, md5) = hash_file(
            &path,
            &[HashAlgorithm::sha1, HashAlgorithm::sha256, HashAlgorithm::md5],
        )
        .unwrap();
        assert_eq!(sha1, "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
        assert_eq!(
            sha256,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(md5, "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn disabled_hashes_stay_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hello").unwrap();

        let (sha1, sha256, md5) = hash_file(&path, &[HashAlgorithm::sha256]).unwrap();
        assert!(sha1.is_empty());
        assert!(!sha256.is_empty());
        assert!(md5.is_empty());
    }

    #[test]
    fn rehash_only_when_stale_or_missing() {
        let observed = walked("/a", 7, 1_700_000_000);
        let mut stored = FileInfo::new("/a".to_string());
        stored.size = 7;
        stored.mod_time = Some(UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000));
        stored.sha256 = "deadbeef".to_string();

        assert!(!needs_rehash(&stored, &observed, &[HashAlgorithm::sha256]));
        // A newly enabled hash forces a recompute.
        assert!(needs_rehash(
            &stored,
            &observed,
            &[HashAlgorithm::sha256, HashAlgorithm::md5]
        ));
        // A size change forces a recompute.
        let bigger = walked("/a", 8, 1_700_000_000);
        assert!(needs_rehash(&stored, &bigger, &[HashAlgorithm::sha256]));
        // A touch forces a recompute.
        let touched = walked("/a", 7, 1_700_000_001);
        assert!(needs_rehash(&stored, &touched, &[HashAlgorithm::sha256]));
    }
}
