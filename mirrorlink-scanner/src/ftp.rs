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

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use mirrorlink_error::{make_err, Code, Error, ResultExt};
use mirrorlink_store::mirror::SyncPrecision;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};

use crate::scan::{FileEntry, FileListing, SourceLister};

/// Lists a mirror over plain anonymous FTP with a recursive directory
/// walk. LIST output carries at best day-level timestamps once the year
/// ambiguity is accounted for, so the whole listing is day precision.
#[derive(Default)]
pub struct FtpLister {}

#[async_trait]
impl SourceLister for FtpLister {
    async fn list(&self, url: &str, cancel: &CancellationToken) -> Result<FileListing, Error> {
        let (addr, base_path) = split_ftp_url(url)?;
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(Error::from)
            .err_tip(|| format!("While connecting to {addr}"))?;
        let (read_half, write_half) = tokio::io::split(stream);
        let mut control = Control {
            reader: BufReader::new(read_half),
            writer: write_half,
        };

        control.expect(220).await.err_tip(|| "Bad FTP greeting")?;
        control.send("USER anonymous").await?;
        let code = control.read_reply().await?.0;
        if code == 331 {
            control.send("PASS mirrorlink@").await?;
            control.expect(230).await.err_tip(|| "FTP login refused")?;
        } else if code != 230 {
            return Err(make_err!(Code::PermissionDenied, "FTP login refused ({code})"));
        }

        let year_hint = Utc::now().year();
        let mut entries = Vec::new();
        let mut pending = vec![base_path];
        while let Some(dir) = pending.pop() {
            if cancel.is_cancelled() {
                let _ = control.send("QUIT").await;
                return Err(make_err!(Code::Aborted, "Scan aborted"));
            }
            let listing = match control.list_dir(&dir).await {
                Ok(listing) => listing,
                Err(e) => {
                    // An unreadable subdirectory is not fatal for the scan.
                    event!(Level::DEBUG, dir = dir.as_str(), ?e, "Skipping unlistable directory");
                    continue;
                }
            };
            for line in listing.lines() {
                match parse_list_line(line, year_hint) {
                    Some(ListEntry::Dir(name)) => pending.push(join_dir(&dir, &name)),
                    Some(ListEntry::File { name, size, mod_time }) => entries.push(FileEntry {
                        path: join_dir(&dir, &name),
                        size,
                        mod_time,
                    }),
                    None => {}
                }
            }
        }
        let _ = control.send("QUIT").await;
        Ok(FileListing {
            entries,
            precision: SyncPrecision::Day,
        })
    }
}

struct Control {
    reader: BufReader<ReadHalf<TcpStream>>,
    writer: WriteHalf<TcpStream>,
}

impl Control {
    async fn send(&mut self, command: &str) -> Result<(), Error> {
        self.writer
            .write_all(format!("{command}\r\n").as_bytes())
            .await
            .map_err(Error::from)
            .err_tip(|| format!("While sending {command}"))
    }

    /// Reads one (possibly multi-line) reply, returning the code and the
    /// final line.
    async fn read_reply(&mut self) -> Result<(u32, String), Error> {
        loop {
            let mut line = String::new();
            let read = self
                .reader
                .read_line(&mut line)
                .await
                .map_err(Error::from)
                .err_tip(|| "While reading an FTP reply")?;
            if read == 0 {
                return Err(make_err!(Code::Unavailable, "FTP control channel closed"));
            }
            let line = line.trim_end();
            if line.len() >= 4 && line.as_bytes()[3] == b' ' {
                if let Ok(code) = line[..3].parse::<u32>() {
                    return Ok((code, line.to_string()));
                }
            }
            // Continuation line of a multi-line reply.
        }
    }

    async fn expect(&mut self, wanted: u32) -> Result<String, Error> {
        let (code, line) = self.read_reply().await?;
        if code != wanted {
            return Err(make_err!(
                Code::Unavailable,
                "Expected FTP reply {wanted}, got: {line}"
            ));
        }
        Ok(line)
    }

    /// CWD + PASV + LIST for one directory; returns the raw listing.
    async fn list_dir(&mut self, dir: &str) -> Result<String, Error> {
        self.send(&format!("CWD /{}", dir.trim_matches('/'))).await?;
        self.expect(250).await?;
        self.send("PASV").await?;
        let pasv = self.expect(227).await?;
        let data_addr = parse_pasv_reply(&pasv)?;
        let mut data = TcpStream::connect(&data_addr)
            .await
            .map_err(Error::from)
            .err_tip(|| format!("While opening the data channel to {data_addr}"))?;
        self.send("LIST").await?;
        let (code, line) = self.read_reply().await?;
        if code != 150 && code != 125 {
            return Err(make_err!(Code::Unavailable, "LIST refused: {line}"));
        }
        let mut listing = String::new();
        data.read_to_string(&mut listing)
            .await
            .map_err(Error::from)
            .err_tip(|| "While reading the LIST data")?;
        self.expect(226).await?;
        Ok(listing)
    }
}

enum ListEntry {
    Dir(String),
    File {
        name: String,
        size: u64,
        mod_time: Option<i64>,
    },
}

/// Decodes one unix-style LIST line:
/// `-rw-r--r--  1 ftp ftp 1234 May  2 11:22 name` or
/// `-rw-r--r--  1 ftp ftp 1234 May  2  2023 name`.
/// Times without a year get `year_hint`; links and dot entries are
/// dropped.
fn parse_list_line(line: &str, year_hint: i32) -> Option<ListEntry> {
    let mut rest = line.trim_start();
    let mut fields = Vec::with_capacity(8);
    for _ in 0..8 {
        let end = rest.find(char::is_whitespace)?;
        fields.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    let name = rest;
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    let mode = fields[0];
    if mode.starts_with('d') {
        return Some(ListEntry::Dir(name.to_string()));
    }
    if !mode.starts_with('-') {
        return None;
    }
    let size = fields[4].parse::<u64>().ok()?;
    let month = month_number(fields[5])?;
    let day = fields[6].parse::<u32>().ok()?;
    let year_or_time = fields[7];
    let (year, hour, minute) = if let Some((h, m)) = year_or_time.split_once(':') {
        (year_hint, h.parse::<u32>().ok()?, m.parse::<u32>().ok()?)
    } else {
        (year_or_time.parse::<i32>().ok()?, 0, 0)
    };
    let mut mod_time = NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, 0))
        .map(|dt| dt.and_utc().timestamp());
    // A month in the future with no year means last year.
    if let Some(ts) = mod_time {
        if year == year_hint && ts > Utc::now().timestamp() {
            mod_time = NaiveDate::from_ymd_opt(year - 1, month, day)
                .and_then(|d| d.and_hms_opt(hour, minute, 0))
                .map(|dt| dt.and_utc().timestamp());
        }
    }
    Some(ListEntry::File {
        name: name.to_string(),
        size,
        mod_time,
    })
}

fn month_number(name: &str) -> Option<u32> {
    match name {
        "Jan" => Some(1),
        "Feb" => Some(2),
        "Mar" => Some(3),
        "Apr" => Some(4),
        "May" => Some(5),
        "Jun" => Some(6),
        "Jul" => Some(7),
        "Aug" => Some(8),
        "Sep" => Some(9),
        "Oct" => Some(10),
        "Nov" => Some(11),
        "Dec" => Some(12),
        _ => None,
    }
}

/// `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)` → `h1.h2.h3.h4:port`.
fn parse_pasv_reply(reply: &str) -> Result<String, Error> {
    let start = reply
        .find('(')
        .err_tip_with_code(|_| (Code::Unavailable, format!("Unparsable PASV reply: {reply}")))?;
    let end = reply[start..]
        .find(')')
        .err_tip_with_code(|_| (Code::Unavailable, format!("Unparsable PASV reply: {reply}")))?
        + start;
    let numbers: Vec<u32> = reply[start + 1..end]
        .split(',')
        .filter_map(|n| n.trim().parse().ok())
        .collect();
    mirrorlink_error::error_if!(
        numbers.len() != 6,
        "Unparsable PASV reply: {reply}"
    );
    Ok(format!(
        "{}.{}.{}.{}:{}",
        numbers[0],
        numbers[1],
        numbers[2],
        numbers[3],
        numbers[4] * 256 + numbers[5]
    ))
}

fn split_ftp_url(url: &str) -> Result<(String, String), Error> {
    let rest = url.strip_prefix("ftp://").unwrap_or(url);
    let (host, path) = rest.split_once('/').unwrap_or((rest, ""));
    mirrorlink_error::error_if!(host.is_empty(), "Invalid FTP URL {url}");
    let addr = if host.contains(':') {
        host.to_string()
    } else {
        format!("{host}:21")
    };
    Ok((addr, path.trim_matches('/').to_string()))
}

fn join_dir(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{name}", dir.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod ftp_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_files_and_directories() {
        let file = parse_list_line("-rw-r--r--  1 ftp ftp 1234 May  2  2023 app.tar.gz", 2024);
        match file {
            Some(ListEntry::File { name, size, mod_time }) => {
                assert_eq!(name, "app.tar.gz");
                assert_eq!(size, 1234);
                let expected = NaiveDate::from_ymd_opt(2023, 5, 2)
                    .unwrap()
                    .and_hms_opt(0, 0, 0)
                    .unwrap()
                    .and_utc()
                    .timestamp();
                assert_eq!(mod_time, Some(expected));
            }
            _ => panic!("expected a file entry"),
        }

        let dir = parse_list_line("drwxr-xr-x  2 ftp ftp 4096 May  2  2023 releases", 2024);
        assert!(matches!(dir, Some(ListEntry::Dir(name)) if name == "releases"));
    }

    #[test]
    fn links_and_dot_entries_are_dropped() {
        assert!(parse_list_line("lrwxrwxrwx 1 ftp ftp 9 May 2 2023 latest -> 1.0", 2024).is_none());
        assert!(parse_list_line("drwxr-xr-x 2 ftp ftp 4096 May 2 2023 .", 2024).is_none());
        assert!(parse_list_line("garbage", 2024).is_none());
    }

    #[test]
    fn names_with_spaces_survive() {
        let entry = parse_list_line("-rw-r--r-- 1 ftp ftp 10 Jan 15 2022 file name.txt", 2024);
        assert!(matches!(
            entry,
            Some(ListEntry::File { name, .. }) if name == "file name.txt"
        ));
    }

    #[test]
    fn pasv_reply_decodes_to_socket_address() {
        let addr =
            parse_pasv_reply("227 Entering Passive Mode (192,168,1,10,19,137)").unwrap();
        assert_eq!(addr, "192.168.1.10:5001");
        assert!(parse_pasv_reply("227 nonsense").is_err());
    }

    #[test]
    fn ftp_urls_split_into_address_and_path() {
        let (addr, path) = split_ftp_url("ftp://mirror.example.org/pub/repo/").unwrap();
        assert_eq!(addr, "mirror.example.org:21");
        assert_eq!(path, "pub/repo");

        let (addr, path) = split_ftp_url("ftp://mirror.example.org:2121").unwrap();
        assert_eq!(addr, "mirror.example.org:2121");
        assert_eq!(path, "");
    }
}
