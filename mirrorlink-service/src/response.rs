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

use std::time::SystemTime;

use chrono::{DateTime, Utc};
use hyper::header::{CACHE_CONTROL, CONTENT_TYPE, LAST_MODIFIED, LOCATION};
use hyper::{Body, Response, StatusCode};
use mirrorlink_config::FallbackConfig;
use mirrorlink_store::file_info::FileInfo;
use mirrorlink_store::mirror::Mirror;
use mirrorlink_util::geo::ClientGeo;
use serde::Serialize;

use crate::request::ChecksumKind;

pub const CACHE_CONTROL_VALUE: &str = "private, no-cache";

#[derive(Serialize)]
pub struct FileJson {
    pub path: String,
    pub size: u64,
    pub mod_time: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub sha1: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub sha256: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub md5: String,
}

#[derive(Serialize)]
pub struct MirrorJson {
    pub id: i32,
    pub name: String,
    pub url: String,
    pub distance_km: f32,
    pub country_codes: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub continent_code: String,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub asnum: u32,
    #[serde(skip_serializing_if = "is_zero_i64")]
    pub score: i64,
    #[serde(skip_serializing_if = "is_zero_f32")]
    pub weight_percent: f32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub exclude_reason: String,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

fn is_zero_f32(v: &f32) -> bool {
    *v == 0.0
}

#[derive(Serialize)]
pub struct SelectionPage {
    pub file: FileJson,
    pub client: ClientJson,
    pub mirrors: Vec<MirrorJson>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub excluded: Vec<MirrorJson>,
    pub fallback: bool,
}

#[derive(Serialize)]
pub struct ClientJson {
    pub ip: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub country_code: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub continent_code: String,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub asn: u32,
}

pub fn file_json(file: &FileInfo) -> FileJson {
    FileJson {
        path: file.path.clone(),
        size: file.size,
        mod_time: file.mod_time.map(http_date),
        sha1: file.sha1.clone(),
        sha256: file.sha256.clone(),
        md5: file.md5.clone(),
    }
}

pub fn mirror_json(mirror: &Mirror) -> MirrorJson {
    MirrorJson {
        id: mirror.id,
        name: mirror.name.clone(),
        url: mirror.absolute_url.clone(),
        distance_km: mirror.distance,
        country_codes: mirror.country_codes.clone(),
        continent_code: mirror.continent_code.clone(),
        asnum: mirror.asnum,
        score: mirror.computed_score,
        weight_percent: mirror.weight_percent,
        exclude_reason: mirror.exclude_reason.clone(),
    }
}

pub fn client_json(client: &ClientGeo) -> ClientJson {
    ClientJson {
        ip: client.ip.clone(),
        country_code: client.country_code.clone(),
        continent_code: client.continent_code.clone(),
        asn: client.asn,
    }
}

pub fn http_date(time: SystemTime) -> String {
    let datetime: DateTime<Utc> = time.into();
    datetime.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub fn parse_http_date(raw: &str) -> Option<SystemTime> {
    DateTime::parse_from_rfc2822(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc).into())
}

pub fn json_response(status: StatusCode, page: &impl Serialize, pretty: bool) -> Response<Body> {
    let body = if pretty {
        serde_json::to_vec_pretty(page)
    } else {
        serde_json::to_vec(page)
    };
    match body {
        Ok(body) => Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "application/json; charset=utf-8")
            .header(CACHE_CONTROL, CACHE_CONTROL_VALUE)
            .body(Body::from(body))
            .unwrap_or_else(|_| plain_status(StatusCode::INTERNAL_SERVER_ERROR)),
        Err(_) => plain_status(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// 302 to the winner, advertising up to `max_link_headers` runners-up as
/// `Link: <url>; rel=duplicate; pri=N; geo=cc`.
pub fn redirect_response(candidates: &[Mirror], max_link_headers: usize) -> Response<Body> {
    let mut builder = Response::builder()
        .status(StatusCode::FOUND)
        .header(LOCATION, candidates[0].absolute_url.clone())
        .header(CACHE_CONTROL, CACHE_CONTROL_VALUE);
    for (index, runner_up) in candidates.iter().skip(1).take(max_link_headers).enumerate() {
        let geo = runner_up
            .home_country()
            .map(|c| c.to_lowercase())
            .unwrap_or_default();
        builder = builder.header(
            "Link",
            format!(
                "<{}>; rel=duplicate; pri={}; geo={}",
                runner_up.absolute_url,
                index + 1,
                geo
            ),
        );
    }
    builder
        .body(Body::empty())
        .unwrap_or_else(|_| plain_status(StatusCode::INTERNAL_SERVER_ERROR))
}

pub fn not_modified(file: &FileInfo) -> Response<Body> {
    let mut builder = Response::builder()
        .status(StatusCode::NOT_MODIFIED)
        .header(CACHE_CONTROL, CACHE_CONTROL_VALUE);
    if let Some(mod_time) = file.mod_time {
        builder = builder.header(LAST_MODIFIED, http_date(mod_time));
    }
    builder
        .body(Body::empty())
        .unwrap_or_else(|_| plain_status(StatusCode::INTERNAL_SERVER_ERROR))
}

/// `"{hash}  {basename}"`, the checksum-file convention tools expect.
pub fn checksum_response(file: &FileInfo, kind: ChecksumKind) -> Response<Body> {
    let hash = match kind {
        ChecksumKind::Md5 => &file.md5,
        ChecksumKind::Sha1 => &file.sha1,
        ChecksumKind::Sha256 => &file.sha256,
    };
    if hash.is_empty() {
        return plain_status(StatusCode::NOT_FOUND);
    }
    let basename = file.path.rsplit('/').next().unwrap_or(&file.path);
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(CACHE_CONTROL, CACHE_CONTROL_VALUE)
        .body(Body::from(format!("{hash}  {basename}\n")))
        .unwrap_or_else(|_| plain_status(StatusCode::INTERNAL_SERVER_ERROR))
}

pub fn plain_status(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::from(
        status.canonical_reason().unwrap_or("error").to_string(),
    ));
    *response.status_mut() = status;
    response
}

/// Materializes the configured fallbacks as mirror-like records with
/// synthetic negative ids and orders them by the same rank rule as real
/// candidates. For large fallback lists this interleaving is surprising
/// but matches the long-observed behavior.
pub fn fallback_mirrors(
    fallbacks: &[FallbackConfig],
    path: &str,
    client: &ClientGeo,
) -> Vec<Mirror> {
    let mut mirrors: Vec<Mirror> = fallbacks
        .iter()
        .enumerate()
        .map(|(index, fallback)| {
            let mut mirror = Mirror {
                id: -(index as i32) - 1,
                name: format!("fallback{}", index + 1),
                http_url: fallback.url.clone(),
                continent_code: fallback.continent_code.to_uppercase(),
                country_codes: if fallback.country_code.is_empty() {
                    Vec::new()
                } else {
                    vec![fallback.country_code.to_uppercase()]
                },
                enabled: true,
                http_up: true,
                https_up: true,
                ..Default::default()
            };
            let scheme = mirror.url_scheme().unwrap_or("http");
            mirror.absolute_url = mirror.absolute_url_for(scheme, path);
            mirror
        })
        .collect();
    mirrors.sort_by(|a, b| a.cmp_by_rank(b, client));
    mirrors
}

#[cfg(test)]
mod response_tests {
    use std::time::{Duration, UNIX_EPOCH};

    use pretty_assertions::assert_eq;

    use super::*;

    fn candidate(id: i32, url: &str, country: &str) -> Mirror {
        Mirror {
            id,
            name: format!("m{id}"),
            absolute_url: url.to_string(),
            country_codes: vec![country.to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn http_date_round_trips() {
        let time = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let formatted = http_date(time);
        assert_eq!(formatted, "Tue, 14 Nov 2023 22:13:20 GMT");
        assert_eq!(parse_http_date(&formatted), Some(time));
        assert_eq!(parse_http_date("not a date"), None);
    }

    #[test]
    fn redirect_carries_location_and_link_headers() {
        let candidates = vec![
            candidate(1, "http://m1.example.org/foo.tgz", "FR"),
            candidate(2, "http://m2.example.org/foo.tgz", "DE"),
            candidate(3, "http://m3.example.org/foo.tgz", "UK"),
        ];
        let response = redirect_response(&candidates, 1);
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(LOCATION).unwrap(),
            "http://m1.example.org/foo.tgz"
        );
        let links: Vec<_> = response.headers().get_all("Link").iter().collect();
        assert_eq!(links.len(), 1);
        assert_eq!(
            links[0],
            "<http://m2.example.org/foo.tgz>; rel=duplicate; pri=1; geo=de"
        );
        assert_eq!(
            response.headers().get(CACHE_CONTROL).unwrap(),
            CACHE_CONTROL_VALUE
        );
    }

    #[test]
    fn checksum_uses_two_space_convention() {
        let file = FileInfo {
            path: "/releases/app.tar.gz".to_string(),
            sha256: "cafebabe".to_string(),
            ..Default::default()
        };
        let response = checksum_response(&file, ChecksumKind::Sha256);
        assert_eq!(response.status(), StatusCode::OK);

        let missing = checksum_response(&file, ChecksumKind::Md5);
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn fallbacks_get_negative_ids_and_rank_order() {
        let fallbacks = vec![
            FallbackConfig {
                url: "http://us.fallback.example/".to_string(),
                country_code: "us".to_string(),
                continent_code: "na".to_string(),
            },
            FallbackConfig {
                url: "http://fr.fallback.example/".to_string(),
                country_code: "fr".to_string(),
                continent_code: "eu".to_string(),
            },
        ];
        let client = ClientGeo {
            country_code: "FR".to_string(),
            continent_code: "EU".to_string(),
            ..Default::default()
        };
        let mirrors = fallback_mirrors(&fallbacks, "/foo.tgz", &client);
        assert_eq!(mirrors[0].id, -2);
        assert_eq!(mirrors[0].absolute_url, "http://fr.fallback.example/foo.tgz");
        assert_eq!(mirrors[1].id, -1);
        assert!(mirrors.iter().all(|m| m.id < 0));
    }
}
