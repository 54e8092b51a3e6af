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

use std::process::Stdio;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use mirrorlink_error::{make_err, Code, Error, ResultExt};
use mirrorlink_store::mirror::SyncPrecision;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};

use crate::scan::{FileEntry, FileListing, SourceLister};

/// Lists a mirror by asking the rsync daemon for a recursive
/// `--list-only` run and parsing its output. Timestamps come back at
/// second granularity.
#[derive(Default)]
pub struct RsyncLister {}

#[async_trait]
impl SourceLister for RsyncLister {
    async fn list(&self, url: &str, cancel: &CancellationToken) -> Result<FileListing, Error> {
        let mut child = Command::new("rsync")
            .args(["--no-motd", "--recursive", "--list-only", "--timeout=600", url])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(Error::from)
            .err_tip(|| "While spawning rsync")?;

        let stdout = child
            .stdout
            .take()
            .err_tip_with_code(|_| (Code::Internal, "rsync stdout was not captured"))?;
        let mut lines = BufReader::new(stdout).lines();
        let mut entries = Vec::new();
        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(make_err!(Code::Aborted, "Scan aborted"));
                }
                line = lines.next_line() => line.map_err(Error::from)
                    .err_tip(|| "While reading the rsync listing")?,
            };
            let Some(line) = line else { break };
            if let Some(entry) = parse_listing_line(&line) {
                entries.push(entry);
            }
        }

        let status = child
            .wait()
            .await
            .map_err(Error::from)
            .err_tip(|| "While waiting for rsync")?;
        if !status.success() {
            let mut stderr_tail = String::new();
            if let Some(mut stderr) = child.stderr.take() {
                let _ = stderr.read_to_string(&mut stderr_tail).await;
                stderr_tail.truncate(512);
            }
            return Err(make_err!(
                Code::Unavailable,
                "rsync exited with {status}: {}",
                stderr_tail.trim()
            ));
        }
        event!(Level::DEBUG, url, files = entries.len(), "rsync listing done");
        Ok(FileListing {
            entries,
            precision: SyncPrecision::Second,
        })
    }
}

/// One line of `rsync --list-only` output:
/// `-rw-r--r--      1,234,567 2024/05/02 11:22:33 path/to/file`.
/// Directories, links and specials yield None; only regular files count
/// toward the inventory.
pub fn parse_listing_line(line: &str) -> Option<FileEntry> {
    let (fields, path) = split_fields(line, 4)?;
    let (mode, size, date, time) = (fields[0], fields[1], fields[2], fields[3]);
    if !mode.starts_with('-') {
        return None;
    }
    let size = size.replace(',', "").parse::<u64>().ok()?;
    let mod_time =
        NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y/%m/%d %H:%M:%S")
            .ok()
            .map(|dt| dt.and_utc().timestamp());
    if path.is_empty() || path == "." {
        return None;
    }
    Some(FileEntry {
        path: path.to_string(),
        size,
        mod_time,
    })
}

/// Splits the first `n` whitespace-delimited fields, returning them with
/// the untouched remainder so paths containing spaces survive.
fn split_fields(line: &str, n: usize) -> Option<(Vec<&str>, &str)> {
    let mut rest = line.trim_start();
    let mut fields = Vec::with_capacity(n);
    for _ in 0..n {
        let end = rest.find(char::is_whitespace)?;
        fields.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    Some((fields, rest))
}
