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

//! Canonical key layout of the catalog. The exact names are part of the
//! on-disk format shared with every other node, so nothing outside this
//! module builds key strings by hand.

/// Set of every known repository path.
pub const FILES: &str = "FILES";

/// Staging set swapped into [`FILES`] at the end of a repository scan.
pub const FILES_TMP: &str = "FILES_TMP";

/// Hash mapping mirror id to mirror name.
pub const MIRRORS: &str = "MIRRORS";

/// Monotonic allocator for mirror ids.
pub const LAST_MIRROR_ID: &str = "LAST_MIRROR_ID";

/// Integer schema version; see [`crate::upgrade`].
pub const DB_VERSION: &str = "DBVERSION";

pub fn file_key(path: &str) -> String {
    format!("FILE_{path}")
}

pub fn file_mirrors_key(path: &str) -> String {
    format!("FILEMIRRORS_{path}")
}

pub fn file_info_key(mirror_id: i32, path: &str) -> String {
    format!("FILEINFO_{mirror_id}_{path}")
}

pub fn mirror_key(mirror_id: i32) -> String {
    format!("MIRROR_{mirror_id}")
}

pub fn mirror_files_key(mirror_id: i32) -> String {
    format!("MIRRORFILES_{mirror_id}")
}

pub fn mirror_files_tmp_key(mirror_id: i32) -> String {
    format!("MIRRORFILES_{mirror_id}_TMP")
}

/// `MIRRORFILES_{id} ∩ FILES`, refreshed at the end of each mirror scan.
pub fn handled_files_key(mirror_id: i32) -> String {
    format!("HANDLEDFILES_{mirror_id}")
}

/// Per-mirror scan lock. Value is the owner token.
pub fn scanning_key(mirror_id: i32) -> String {
    format!("SCANNING_{mirror_id}")
}

/// Generic named advisory lock.
pub fn lock_key(name: &str) -> String {
    format!("LOCK_{name}")
}

/// Download counter keys, optionally scoped by date parts. The counters
/// themselves are maintained outside the core.
pub fn stats_file_key(date_parts: &[&str]) -> String {
    let mut key = String::from("STATS_FILE");
    for part in date_parts {
        key.push('_');
        key.push_str(part);
    }
    key
}

pub fn stats_mirror_key(date_parts: &[&str]) -> String {
    let mut key = String::from("STATS_MIRROR");
    for part in date_parts {
        key.push('_');
        key.push_str(part);
    }
    key
}

pub fn stats_mirror_bytes_key(date_parts: &[&str]) -> String {
    let mut key = String::from("STATS_MIRROR_BYTES");
    for part in date_parts {
        key.push('_');
        key.push_str(part);
    }
    key
}

pub mod channels {
    /// Node announcements; payload `HELLO{dbIndex} {nodeId}`.
    pub const CLUSTER: &str = "cluster";

    /// Payload is the repository path that changed.
    pub const FILE_UPDATE: &str = "file_update";

    /// Payload is the mirror id that changed.
    pub const MIRROR_UPDATE: &str = "mirror_update";

    /// Payload is `"{id} {path}"`.
    pub const MIRROR_FILE_UPDATE: &str = "mirror_file_update";
}

#[cfg(test)]
mod keys_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn key_shapes() {
        assert_eq!(file_key("/a/b.iso"), "FILE_/a/b.iso");
        assert_eq!(file_mirrors_key("/a/b.iso"), "FILEMIRRORS_/a/b.iso");
        assert_eq!(file_info_key(42, "/a/b.iso"), "FILEINFO_42_/a/b.iso");
        assert_eq!(mirror_key(42), "MIRROR_42");
        assert_eq!(mirror_files_key(42), "MIRRORFILES_42");
        assert_eq!(handled_files_key(42), "HANDLEDFILES_42");
        assert_eq!(scanning_key(42), "SCANNING_42");
        assert_eq!(lock_key("repository_scan"), "LOCK_repository_scan");
        assert_eq!(stats_file_key(&["2024", "05", "02"]), "STATS_FILE_2024_05_02");
    }
}
