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
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use mirrorlink_error::{Error, ResultExt};
use mirrorlink_util::lru_cache::SizedValue;

/// A file in the repository, or a mirror's own record of one. The same
/// shape backs both `FILE_{path}` and `FILEINFO_{id}_{path}`; the latter
/// usually carries only `size` (and `modTime` when the listing protocol
/// provides it).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
    pub mod_time: Option<SystemTime>,
    pub sha1: String,
    pub sha256: String,
    pub md5: String,
}

impl FileInfo {
    pub fn new(path: String) -> Self {
        Self {
            path,
            ..Default::default()
        }
    }

    /// The authoritative record is usable for selection only once a scan
    /// stamped a modification time on it.
    pub fn is_complete(&self) -> bool {
        self.mod_time.is_some()
    }

    pub fn mod_time_unix(&self) -> i64 {
        match self.mod_time {
            Some(t) => t
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0),
            None => 0,
        }
    }

    pub fn to_hash(&self) -> Vec<(&'static str, String)> {
        vec![
            ("size", self.size.to_string()),
            ("modTime", self.mod_time_unix().to_string()),
            ("sha1", self.sha1.clone()),
            ("sha256", self.sha256.clone()),
            ("md5", self.md5.clone()),
        ]
    }

    /// A missing record decodes to a zero-valued `FileInfo` with only the
    /// path set; callers distinguish absence via [`FileInfo::is_complete`].
    pub fn from_hash(path: &str, fields: &HashMap<String, String>) -> Result<Self, Error> {
        let size = match fields.get("size") {
            Some(raw) if !raw.is_empty() => raw
                .parse::<u64>()
                .map_err(Error::from)
                .err_tip(|| format!("Corrupt size for {path}"))?,
            _ => 0,
        };
        let mod_time = match fields.get("modTime") {
            Some(raw) if !raw.is_empty() => {
                let secs = raw
                    .parse::<i64>()
                    .map_err(Error::from)
                    .err_tip(|| format!("Corrupt modTime for {path}"))?;
                if secs > 0 {
                    Some(UNIX_EPOCH + Duration::from_secs(secs as u64))
                } else {
                    None
                }
            }
            _ => None,
        };
        Ok(Self {
            path: path.to_string(),
            size,
            mod_time,
            sha1: fields.get("sha1").cloned().unwrap_or_default(),
            sha256: fields.get("sha256").cloned().unwrap_or_default(),
            md5: fields.get("md5").cloned().unwrap_or_default(),
        })
    }
}

impl SizedValue for FileInfo {
    fn size(&self) -> u64 {
        (self.path.len() + self.sha1.len() + self.sha256.len() + self.md5.len() + 64) as u64
    }
}

#[cfg(test)]
mod file_info_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn round_trip_through_hash_encoding() {
        let info = FileInfo {
            path: "/releases/1.0/app.tar.gz".to_string(),
            size: 123456,
            mod_time: Some(UNIX_EPOCH + Duration::from_secs(1_700_000_000)),
            sha1: "da39a3ee5e6b4b0d3255bfef95601890afd80709".to_string(),
            sha256: "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855".to_string(),
            md5: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
        };
        let encoded: HashMap<String, String> = info
            .to_hash()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let decoded = FileInfo::from_hash(&info.path, &encoded).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn missing_record_decodes_to_zero_value() {
        let decoded = FileInfo::from_hash("/a", &HashMap::new()).unwrap();
        assert_eq!(decoded.path, "/a");
        assert_eq!(decoded.size, 0);
        assert!(!decoded.is_complete());
    }

    #[test]
    fn corrupt_size_is_an_error() {
        let mut fields = HashMap::new();
        fields.insert("size".to_string(), "not-a-number".to_string());
        assert!(FileInfo::from_hash("/a", &fields).is_err());
    }
}
