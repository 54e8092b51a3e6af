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

use hyper::HeaderMap;
use mirrorlink_error::{make_err, Code, Error};
use mirrorlink_selection::SecureOption;

/// Checksum types servable straight from the catalog.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChecksumKind {
    Md5,
    Sha1,
    Sha256,
}

/// Query flags of the redirector endpoint.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RequestFlags {
    pub mirrorlist: bool,
    pub stats: bool,
    pub mirrorstats: bool,
    pub downloadstats: bool,
    pub pretty: bool,
    pub checksum: Option<ChecksumKind>,
    /// Accepted only together with `mirrorlist`.
    pub from_ip: Option<String>,
    /// `https=1` forces https-capable mirrors, `https=0` forces http.
    pub https: Option<bool>,
}

pub fn parse_flags(query: Option<&str>) -> RequestFlags {
    let mut flags = RequestFlags::default();
    let Some(query) = query else {
        return flags;
    };
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        match key {
            "mirrorlist" => flags.mirrorlist = true,
            "stats" => flags.stats = true,
            "mirrorstats" => flags.mirrorstats = true,
            "downloadstats" => flags.downloadstats = true,
            "pretty" => flags.pretty = true,
            "md5" => flags.checksum = Some(ChecksumKind::Md5),
            "sha1" => flags.checksum = Some(ChecksumKind::Sha1),
            "sha256" => flags.checksum = Some(ChecksumKind::Sha256),
            "fromip" if !value.is_empty() => flags.from_ip = Some(value.to_string()),
            "https" => flags.https = Some(value == "1"),
            _ => {}
        }
    }
    if !flags.mirrorlist {
        flags.from_ip = None;
    }
    flags
}

/// Normalizes the request path and refuses anything that could climb out
/// of the repository root.
pub fn sanitize_path(raw: &str) -> Result<String, Error> {
    let decoded = percent_decode(raw);
    if decoded
        .split('/')
        .any(|segment| segment == ".." || segment == ".")
    {
        return Err(make_err!(
            Code::PermissionDenied,
            "Path {decoded} escapes the repository"
        ));
    }
    let trimmed = decoded.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(make_err!(Code::NotFound, "Empty path"));
    }
    Ok(format!("/{trimmed}"))
}

/// Minimal percent decoding; the paths in the catalog are stored raw.
fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (
                (bytes[i + 1] as char).to_digit(16),
                (bytes[i + 2] as char).to_digit(16),
            ) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Client address used for selection: `fromip` override first (only valid
/// with `mirrorlist`), then the first `X-Forwarded-For` hop, then the
/// socket peer.
pub fn client_ip(headers: &HeaderMap, remote: &str, flags: &RequestFlags) -> String {
    if let Some(ip) = &flags.from_ip {
        return ip.clone();
    }
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    remote.to_string()
}

/// `https=` query overrides `X-Forwarded-Proto`; with neither, any
/// protocol may serve.
pub fn secure_option(headers: &HeaderMap, flags: &RequestFlags) -> SecureOption {
    match flags.https {
        Some(true) => return SecureOption::HttpsOnly,
        Some(false) => return SecureOption::HttpOnly,
        None => {}
    }
    match headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
    {
        Some("https") => SecureOption::HttpsOnly,
        _ => SecureOption::Any,
    }
}

#[cfg(test)]
mod request_tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn flags_parse_independently() {
        let flags = parse_flags(Some("mirrorlist&pretty&fromip=1.2.3.4&https=1"));
        assert!(flags.mirrorlist && flags.pretty);
        assert_eq!(flags.from_ip.as_deref(), Some("1.2.3.4"));
        assert_eq!(flags.https, Some(true));

        let flags = parse_flags(Some("sha256"));
        assert_eq!(flags.checksum, Some(ChecksumKind::Sha256));
        assert_eq!(parse_flags(None), RequestFlags::default());
    }

    #[test]
    fn fromip_requires_mirrorlist() {
        let flags = parse_flags(Some("fromip=1.2.3.4"));
        assert_eq!(flags.from_ip, None);
    }

    #[test]
    fn dotdot_paths_are_rejected() {
        assert_eq!(
            sanitize_path("/../etc/passwd").unwrap_err().code,
            Code::PermissionDenied
        );
        assert_eq!(
            sanitize_path("/a/%2e%2e/b").unwrap_err().code,
            Code::PermissionDenied
        );
        assert_eq!(sanitize_path("/a/./b").unwrap_err().code, Code::PermissionDenied);
        assert_eq!(sanitize_path("/a/b.iso").unwrap(), "/a/b.iso");
    }

    #[test]
    fn forwarded_for_wins_over_the_socket_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "9.8.7.6, 10.0.0.1".parse().unwrap());
        let flags = RequestFlags::default();
        assert_eq!(client_ip(&headers, "127.0.0.1", &flags), "9.8.7.6");
        assert_eq!(client_ip(&HeaderMap::new(), "127.0.0.1", &flags), "127.0.0.1");
    }

    #[test]
    fn https_query_overrides_forwarded_proto() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-proto", "https".parse().unwrap());
        assert_eq!(
            secure_option(&headers, &RequestFlags::default()),
            SecureOption::HttpsOnly
        );
        let flags = parse_flags(Some("https=0"));
        assert_eq!(secure_option(&headers, &flags), SecureOption::HttpOnly);
        assert_eq!(
            secure_option(&HeaderMap::new(), &RequestFlags::default()),
            SecureOption::Any
        );
    }
}
