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

use mirrorlink_config::SelectionConfig;
use mirrorlink_store::file_info::FileInfo;
use mirrorlink_store::mirror::Mirror;
use mirrorlink_util::geo::ClientGeo;

/// Protocol constraint derived from the request
/// (`X-Forwarded-Proto` / `https=` override).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SecureOption {
    #[default]
    Any,
    HttpsOnly,
    HttpOnly,
}

#[derive(Debug, Default)]
pub struct FilterOutcome {
    pub accepted: Vec<Mirror>,
    pub excluded: Vec<Mirror>,
    /// Distance of the closest and farthest accepted mirror, km.
    pub closest: f32,
    pub farthest: f32,
}

/// Partitions candidates into accepted and excluded, assigning each
/// excluded mirror the first matching exclusion reason and each mirror
/// its absolute URL. Deterministic for identical inputs.
pub fn filter(
    mirrors: Vec<Mirror>,
    file: &FileInfo,
    client: &ClientGeo,
    secure: SecureOption,
    config: &SelectionConfig,
) -> FilterOutcome {
    let mut outcome = FilterOutcome {
        closest: f32::MAX,
        farthest: 0.0,
        ..Default::default()
    };
    for mut mirror in mirrors {
        let scheme = scheme_for(&mirror, secure);
        mirror.absolute_url = mirror.absolute_url_for(scheme, &file.path);
        match exclusion_reason(&mirror, file, client, secure, config) {
            Some(reason) => {
                mirror.exclude_reason = reason;
                outcome.excluded.push(mirror);
            }
            None => {
                outcome.closest = outcome.closest.min(mirror.distance);
                outcome.farthest = outcome.farthest.max(mirror.distance);
                outcome.accepted.push(mirror);
            }
        }
    }
    if outcome.accepted.is_empty() {
        outcome.closest = 0.0;
    }
    outcome
}

fn scheme_for(mirror: &Mirror, secure: SecureOption) -> &'static str {
    match secure {
        SecureOption::HttpsOnly => "https",
        SecureOption::HttpOnly => "http",
        SecureOption::Any => match mirror.url_scheme() {
            Some(scheme) => scheme,
            // Scheme-less URL; prefer the plain side when it is alive.
            None if mirror.http_up || !mirror.https_up => "http",
            None => "https",
        },
    }
}

fn down_reason_or(reason: &str, fallback: &str) -> String {
    if reason.is_empty() {
        fallback.to_string()
    } else {
        reason.to_string()
    }
}

fn exclusion_reason(
    mirror: &Mirror,
    file: &FileInfo,
    client: &ClientGeo,
    secure: SecureOption,
    config: &SelectionConfig,
) -> Option<String> {
    if !mirror.enabled {
        return Some("Disabled".to_string());
    }
    match secure {
        SecureOption::HttpsOnly => {
            if !mirror.supports_https() {
                return Some("Not HTTPS".to_string());
            }
            if !mirror.https_up {
                return Some(down_reason_or(&mirror.https_down_reason, "Down"));
            }
        }
        SecureOption::HttpOnly => {
            if !mirror.supports_http() {
                return Some("Not HTTP".to_string());
            }
            if !mirror.http_up {
                return Some(down_reason_or(&mirror.http_down_reason, "Down"));
            }
        }
        SecureOption::Any => {
            let http_usable = mirror.supports_http() && mirror.http_up;
            let https_usable = mirror.supports_https() && mirror.https_up;
            if !http_usable && !https_usable {
                let http_reason = if mirror.supports_http() {
                    down_reason_or(&mirror.http_down_reason, "Down")
                } else {
                    "Not HTTP".to_string()
                };
                let https_reason = if mirror.supports_https() {
                    down_reason_or(&mirror.https_down_reason, "Down")
                } else {
                    "Not HTTPS".to_string()
                };
                if http_reason == https_reason {
                    return Some(http_reason);
                }
                return Some(format!("{http_reason} / {https_reason}"));
            }
        }
    }

    let max_age = config
        .allow_outdated
        .iter()
        .find(|p| file.path.starts_with(&p.prefix))
        .map(|p| p.max_age.as_secs() as i64);
    if let Some(at_mirror) = &mirror.file_info {
        if max_age.is_none() && at_mirror.size != file.size {
            return Some("File size mismatch".to_string());
        }
        let source_secs = file.mod_time_unix();
        let mirror_secs = at_mirror.mod_time_unix();
        if source_secs > 0 && mirror_secs > 0 {
            let mut adjusted = mirror_secs;
            if config.fix_timezone_offsets {
                adjusted -= mirror.tz_offset_ms / 1000;
            }
            let precision = mirror.last_successful_sync_precision;
            let diff = precision.truncate(source_secs) - precision.truncate(adjusted);
            if diff < 0 || diff > max_age.unwrap_or(0) {
                return Some(format!("Mod time mismatch (diff: {diff})"));
            }
        }
    }

    if mirror.continent_only
        && !client.continent_code.is_empty()
        && client.continent_code != mirror.continent_code
    {
        return Some("Continent only".to_string());
    }
    if mirror.country_only
        && !client.country_code.is_empty()
        && !mirror.in_countries(&client.country_code)
    {
        return Some("Country only".to_string());
    }
    if mirror.as_only && client.asn != 0 && client.asn != mirror.asnum {
        return Some("AS only".to_string());
    }
    if !client.country_code.is_empty()
        && mirror
            .excluded_country_codes
            .iter()
            .any(|c| c == &client.country_code)
    {
        return Some("User's country restriction".to_string());
    }
    None
}

#[cfg(test)]
mod filter_tests {
    use std::time::{Duration, UNIX_EPOCH};

    use mirrorlink_config::OutdatedPrefix;
    use pretty_assertions::assert_eq;

    use super::*;

    fn source_file() -> FileInfo {
        FileInfo {
            path: "/foo.tgz".to_string(),
            size: 100,
            mod_time: Some(UNIX_EPOCH + Duration::from_secs(1_700_000_000)),
            ..Default::default()
        }
    }

    fn healthy_mirror(id: i32) -> Mirror {
        Mirror {
            id,
            name: format!("m{id}"),
            http_url: format!("m{id}.example.org/repo/"),
            enabled: true,
            http_up: true,
            https_up: true,
            file_info: Some(source_file()),
            last_successful_sync_precision: mirrorlink_store::SyncPrecision::Second,
            ..Default::default()
        }
    }

    fn client_fr() -> ClientGeo {
        ClientGeo {
            country_code: "FR".to_string(),
            continent_code: "EU".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn disabled_mirror_is_excluded_first() {
        let mut mirror = healthy_mirror(1);
        mirror.enabled = false;
        mirror.http_up = false;
        let outcome = filter(
            vec![mirror],
            &source_file(),
            &client_fr(),
            SecureOption::Any,
            &SelectionConfig::default(),
        );
        assert_eq!(outcome.accepted.len(), 0);
        assert_eq!(outcome.excluded[0].exclude_reason, "Disabled");
    }

    #[test]
    fn https_only_rejects_http_only_mirrors_and_down_probes() {
        let mut plain = healthy_mirror(1);
        plain.http_url = "http://plain.example.org/repo/".to_string();
        let mut broken = healthy_mirror(2);
        broken.https_up = false;
        broken.https_down_reason = "Unreachable".to_string();
        let good = healthy_mirror(3);

        let outcome = filter(
            vec![plain, broken, good],
            &source_file(),
            &client_fr(),
            SecureOption::HttpsOnly,
            &SelectionConfig::default(),
        );
        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.accepted[0].id, 3);
        assert_eq!(outcome.excluded[0].exclude_reason, "Not HTTPS");
        assert_eq!(outcome.excluded[1].exclude_reason, "Unreachable");
        assert!(outcome.accepted[0].absolute_url.starts_with("https://"));
    }

    #[test]
    fn both_protocols_down_combines_reasons() {
        let mut mirror = healthy_mirror(1);
        mirror.http_up = false;
        mirror.https_up = false;
        mirror.http_down_reason = "Unreachable".to_string();
        mirror.https_down_reason = "Got status code 500".to_string();
        let outcome = filter(
            vec![mirror],
            &source_file(),
            &client_fr(),
            SecureOption::Any,
            &SelectionConfig::default(),
        );
        assert_eq!(
            outcome.excluded[0].exclude_reason,
            "Unreachable / Got status code 500"
        );
    }

    #[test]
    fn size_mismatch_excludes_unless_outdated_prefix_allows() {
        let mut mirror = healthy_mirror(1);
        mirror.file_info.as_mut().unwrap().size = 99;

        let outcome = filter(
            vec![mirror.clone()],
            &source_file(),
            &client_fr(),
            SecureOption::Any,
            &SelectionConfig::default(),
        );
        assert_eq!(outcome.excluded[0].exclude_reason, "File size mismatch");

        let lenient = SelectionConfig {
            allow_outdated: vec![OutdatedPrefix {
                prefix: "/foo".to_string(),
                max_age: Duration::from_secs(3600),
            }],
            ..Default::default()
        };
        let outcome = filter(
            vec![mirror],
            &source_file(),
            &client_fr(),
            SecureOption::Any,
            &lenient,
        );
        assert_eq!(outcome.accepted.len(), 1);
    }

    #[test]
    fn stale_copy_is_a_mod_time_mismatch() {
        let mut mirror = healthy_mirror(1);
        // Mirror copy is one hour older than the source.
        mirror.file_info.as_mut().unwrap().mod_time =
            Some(UNIX_EPOCH + Duration::from_secs(1_700_000_000 - 3600));
        let outcome = filter(
            vec![mirror.clone()],
            &source_file(),
            &client_fr(),
            SecureOption::Any,
            &SelectionConfig::default(),
        );
        assert_eq!(
            outcome.excluded[0].exclude_reason,
            "Mod time mismatch (diff: 3600)"
        );

        // The same mirror passes when its sampled clock offset explains
        // the hour and the fix is enabled.
        mirror.tz_offset_ms = -3_600_000;
        let fixed = SelectionConfig {
            fix_timezone_offsets: true,
            ..Default::default()
        };
        let outcome = filter(vec![mirror], &source_file(), &client_fr(), SecureOption::Any, &fixed);
        assert_eq!(outcome.accepted.len(), 1);
    }

    #[test]
    fn mirror_copy_newer_than_source_is_rejected() {
        let mut mirror = healthy_mirror(1);
        mirror.file_info.as_mut().unwrap().mod_time =
            Some(UNIX_EPOCH + Duration::from_secs(1_700_000_000 + 60));
        let outcome = filter(
            vec![mirror],
            &source_file(),
            &client_fr(),
            SecureOption::Any,
            &SelectionConfig::default(),
        );
        assert_eq!(
            outcome.excluded[0].exclude_reason,
            "Mod time mismatch (diff: -60)"
        );
    }

    #[test]
    fn day_precision_tolerates_same_day_drift() {
        let mut mirror = healthy_mirror(1);
        mirror.last_successful_sync_precision = mirrorlink_store::SyncPrecision::Day;
        // Ten minutes behind, same day once truncated.
        mirror.file_info.as_mut().unwrap().mod_time =
            Some(UNIX_EPOCH + Duration::from_secs(1_700_000_000 - 600));
        let outcome = filter(
            vec![mirror],
            &source_file(),
            &client_fr(),
            SecureOption::Any,
            &SelectionConfig::default(),
        );
        assert_eq!(outcome.accepted.len(), 1);
    }

    #[test]
    fn geo_restrictions_apply_in_order() {
        let mut continent = healthy_mirror(1);
        continent.continent_only = true;
        continent.continent_code = "NA".to_string();

        let mut country = healthy_mirror(2);
        country.country_only = true;
        country.country_codes = vec!["DE".to_string()];

        let mut asn = healthy_mirror(3);
        asn.as_only = true;
        asn.asnum = 64512;

        let mut embargo = healthy_mirror(4);
        embargo.excluded_country_codes = vec!["FR".to_string()];

        let mut client = client_fr();
        client.asn = 1111;
        let outcome = filter(
            vec![continent, country, asn, embargo],
            &source_file(),
            &client,
            SecureOption::Any,
            &SelectionConfig::default(),
        );
        let reasons: Vec<&str> = outcome
            .excluded
            .iter()
            .map(|m| m.exclude_reason.as_str())
            .collect();
        assert_eq!(
            reasons,
            vec![
                "Continent only",
                "Country only",
                "AS only",
                "User's country restriction"
            ]
        );
    }

    #[test]
    fn filter_is_deterministic() {
        let mirrors: Vec<Mirror> = (1..=5)
            .map(|id| {
                let mut m = healthy_mirror(id);
                m.distance = id as f32 * 100.0;
                if id % 2 == 0 {
                    m.enabled = false;
                }
                m
            })
            .collect();
        let first = filter(
            mirrors.clone(),
            &source_file(),
            &client_fr(),
            SecureOption::Any,
            &SelectionConfig::default(),
        );
        let second = filter(
            mirrors,
            &source_file(),
            &client_fr(),
            SecureOption::Any,
            &SelectionConfig::default(),
        );
        let ids = |ms: &[Mirror]| ms.iter().map(|m| m.id).collect::<Vec<_>>();
        assert_eq!(ids(&first.accepted), ids(&second.accepted));
        assert_eq!(ids(&first.excluded), ids(&second.excluded));
        assert_eq!(first.closest, second.closest);
        assert_eq!(first.farthest, second.farthest);
    }
}
