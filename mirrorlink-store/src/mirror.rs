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

use std::cmp::Ordering;
use std::collections::HashMap;
use std::str::FromStr;

use mirrorlink_error::{make_err, Code, Error, ResultExt};
use mirrorlink_util::geo::ClientGeo;
use mirrorlink_util::lru_cache::SizedValue;

use crate::file_info::FileInfo;

/// Whether probes may follow HTTP redirects served by this mirror.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RedirectPolicy {
    /// Use the configuration default.
    #[default]
    Inherit,
    Allow,
    Deny,
}

impl RedirectPolicy {
    fn as_str(self) -> &'static str {
        match self {
            RedirectPolicy::Inherit => "inherit",
            RedirectPolicy::Allow => "allow",
            RedirectPolicy::Deny => "deny",
        }
    }
}

impl FromStr for RedirectPolicy {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self, Error> {
        match raw {
            "" | "inherit" => Ok(RedirectPolicy::Inherit),
            "allow" => Ok(RedirectPolicy::Allow),
            "deny" => Ok(RedirectPolicy::Deny),
            other => Err(make_err!(
                Code::InvalidArgument,
                "Unknown redirect policy {other}"
            )),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ScanProtocol {
    #[default]
    None,
    Rsync,
    Ftp,
}

impl ScanProtocol {
    fn as_str(self) -> &'static str {
        match self {
            ScanProtocol::None => "",
            ScanProtocol::Rsync => "rsync",
            ScanProtocol::Ftp => "ftp",
        }
    }
}

impl FromStr for ScanProtocol {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self, Error> {
        match raw {
            "" => Ok(ScanProtocol::None),
            "rsync" => Ok(ScanProtocol::Rsync),
            "ftp" => Ok(ScanProtocol::Ftp),
            other => Err(make_err!(Code::InvalidArgument, "Unknown protocol {other}")),
        }
    }
}

/// Worst mod-time granularity the last successful scan could observe.
/// Day precision comes from rsync listings without `--times`-style
/// output, second precision from FTP MDTM or full rsync listings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum SyncPrecision {
    #[default]
    None = 0,
    Day = 1,
    Second = 2,
}

impl SyncPrecision {
    fn from_i64(raw: i64) -> Self {
        match raw {
            2 => SyncPrecision::Second,
            1 => SyncPrecision::Day,
            _ => SyncPrecision::None,
        }
    }

    /// Truncates a unix timestamp to this granularity.
    pub fn truncate(self, unix_secs: i64) -> i64 {
        match self {
            SyncPrecision::Second => unix_secs,
            SyncPrecision::Day => unix_secs - unix_secs.rem_euclid(86400),
            SyncPrecision::None => 0,
        }
    }
}

/// A replication target. Persistent fields round-trip through the
/// `MIRROR_{id}` hash; the trailing group is only populated during
/// selection and never stored.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Mirror {
    pub id: i32,
    pub name: String,
    pub http_url: String,
    pub rsync_url: String,
    pub ftp_url: String,
    pub sponsor_name: String,
    pub sponsor_url: String,
    pub sponsor_logo_url: String,
    pub admin_name: String,
    pub admin_email: String,
    pub latitude: f32,
    pub longitude: f32,
    pub continent_code: String,
    /// Primary country first; the first element is the mirror's home.
    pub country_codes: Vec<String>,
    pub excluded_country_codes: Vec<String>,
    pub asnum: u32,
    pub enabled: bool,
    pub continent_only: bool,
    pub country_only: bool,
    pub as_only: bool,
    /// Signed percentage bias applied to the computed score, −100..100.
    pub score: i32,
    pub http_up: bool,
    pub https_up: bool,
    pub http_down_reason: String,
    pub https_down_reason: String,
    pub state_since: i64,
    pub allow_redirects: RedirectPolicy,
    /// Sampled clock offset of the mirror in milliseconds.
    pub tz_offset_ms: i64,
    pub last_sync: i64,
    pub last_successful_sync: i64,
    pub last_successful_sync_protocol: ScanProtocol,
    pub last_successful_sync_precision: SyncPrecision,
    /// Mod-time of the trace file as last observed on the mirror.
    pub last_modification_time: i64,

    // Selection-time only.
    pub file_info: Option<FileInfo>,
    pub distance: f32,
    pub computed_score: i64,
    pub absolute_url: String,
    pub exclude_reason: String,
    pub weight_percent: f32,
}

impl Mirror {
    /// Scheme carried by the configured URL, if any. A scheme-less URL
    /// means both http and https are probed and either may serve.
    pub fn url_scheme(&self) -> Option<&'static str> {
        if self.http_url.starts_with("https://") {
            Some("https")
        } else if self.http_url.starts_with("http://") {
            Some("http")
        } else {
            None
        }
    }

    pub fn supports_http(&self) -> bool {
        self.url_scheme() != Some("https")
    }

    pub fn supports_https(&self) -> bool {
        self.url_scheme() != Some("http")
    }

    /// Host and base path with any scheme stripped.
    pub fn base_url(&self) -> &str {
        self.http_url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
    }

    /// Absolute URL of `path` on this mirror for the given scheme.
    pub fn absolute_url_for(&self, scheme: &str, path: &str) -> String {
        let base = self.base_url();
        let base = base.strip_suffix('/').unwrap_or(base);
        let path = path.strip_prefix('/').unwrap_or(path);
        format!("{scheme}://{base}/{path}")
    }

    pub fn home_country(&self) -> Option<&str> {
        self.country_codes.first().map(String::as_str)
    }

    pub fn in_countries(&self, country: &str) -> bool {
        self.country_codes.iter().any(|c| c == country)
    }

    /// Ordering used by the cache join and for configured fallbacks:
    /// same-AS match, then home-country match, then any-country match,
    /// then continent match, then great-circle distance.
    pub fn cmp_by_rank(&self, other: &Self, client: &ClientGeo) -> Ordering {
        if client.asn != 0 {
            let asn = (other.asnum == client.asn).cmp(&(self.asnum == client.asn));
            if asn != Ordering::Equal {
                return asn;
            }
        }
        let country = client.country_code.as_str();
        if !country.is_empty() {
            let home = (other.home_country() == Some(country))
                .cmp(&(self.home_country() == Some(country)));
            if home != Ordering::Equal {
                return home;
            }
            let any = other.in_countries(country).cmp(&self.in_countries(country));
            if any != Ordering::Equal {
                return any;
            }
        }
        if !client.continent_code.is_empty() {
            let continent = (other.continent_code == client.continent_code)
                .cmp(&(self.continent_code == client.continent_code));
            if continent != Ordering::Equal {
                return continent;
            }
        }
        self.distance
            .partial_cmp(&other.distance)
            .unwrap_or(Ordering::Equal)
    }

    pub fn to_hash(&self) -> Vec<(&'static str, String)> {
        vec![
            ("name", self.name.clone()),
            ("http", self.http_url.clone()),
            ("rsync", self.rsync_url.clone()),
            ("ftp", self.ftp_url.clone()),
            ("sponsorName", self.sponsor_name.clone()),
            ("sponsorURL", self.sponsor_url.clone()),
            ("sponsorLogoURL", self.sponsor_logo_url.clone()),
            ("adminName", self.admin_name.clone()),
            ("adminEmail", self.admin_email.clone()),
            ("latitude", self.latitude.to_string()),
            ("longitude", self.longitude.to_string()),
            ("continentCode", self.continent_code.clone()),
            ("countryCodes", self.country_codes.join(" ")),
            (
                "excludedCountryCodes",
                self.excluded_country_codes.join(" "),
            ),
            ("asnum", self.asnum.to_string()),
            ("enabled", bool_str(self.enabled)),
            ("continentOnly", bool_str(self.continent_only)),
            ("countryOnly", bool_str(self.country_only)),
            ("asOnly", bool_str(self.as_only)),
            ("score", self.score.to_string()),
            ("httpUp", bool_str(self.http_up)),
            ("httpsUp", bool_str(self.https_up)),
            ("httpDownReason", self.http_down_reason.clone()),
            ("httpsDownReason", self.https_down_reason.clone()),
            ("stateSince", self.state_since.to_string()),
            ("allowRedirects", self.allow_redirects.as_str().to_string()),
            ("tzOffset", self.tz_offset_ms.to_string()),
            ("lastSync", self.last_sync.to_string()),
            ("lastSuccessfulSync", self.last_successful_sync.to_string()),
            (
                "lastSuccessfulSyncProtocol",
                self.last_successful_sync_protocol.as_str().to_string(),
            ),
            (
                "lastSuccessfulSyncPrecision",
                (self.last_successful_sync_precision as i64).to_string(),
            ),
            ("lastModTime", self.last_modification_time.to_string()),
        ]
    }

    pub fn from_hash(id: i32, fields: &HashMap<String, String>) -> Result<Self, Error> {
        mirrorlink_error::error_if!(id == 0, "Mirror id 0 is reserved");
        Ok(Self {
            id,
            name: get_str(fields, "name"),
            http_url: get_str(fields, "http"),
            rsync_url: get_str(fields, "rsync"),
            ftp_url: get_str(fields, "ftp"),
            sponsor_name: get_str(fields, "sponsorName"),
            sponsor_url: get_str(fields, "sponsorURL"),
            sponsor_logo_url: get_str(fields, "sponsorLogoURL"),
            admin_name: get_str(fields, "adminName"),
            admin_email: get_str(fields, "adminEmail"),
            latitude: get_num(fields, "latitude", id)?,
            longitude: get_num(fields, "longitude", id)?,
            continent_code: get_str(fields, "continentCode"),
            country_codes: split_list(&get_str(fields, "countryCodes")),
            excluded_country_codes: split_list(&get_str(fields, "excludedCountryCodes")),
            asnum: get_num(fields, "asnum", id)?,
            enabled: get_bool(fields, "enabled"),
            continent_only: get_bool(fields, "continentOnly"),
            country_only: get_bool(fields, "countryOnly"),
            as_only: get_bool(fields, "asOnly"),
            score: get_num(fields, "score", id)?,
            http_up: get_bool(fields, "httpUp"),
            https_up: get_bool(fields, "httpsUp"),
            http_down_reason: get_str(fields, "httpDownReason"),
            https_down_reason: get_str(fields, "httpsDownReason"),
            state_since: get_num(fields, "stateSince", id)?,
            allow_redirects: get_str(fields, "allowRedirects").parse()?,
            tz_offset_ms: get_num(fields, "tzOffset", id)?,
            last_sync: get_num(fields, "lastSync", id)?,
            last_successful_sync: get_num(fields, "lastSuccessfulSync", id)?,
            last_successful_sync_protocol: get_str(fields, "lastSuccessfulSyncProtocol")
                .parse()?,
            last_successful_sync_precision: SyncPrecision::from_i64(get_num(
                fields,
                "lastSuccessfulSyncPrecision",
                id,
            )?),
            last_modification_time: get_num(fields, "lastModTime", id)?,
            ..Default::default()
        })
    }
}

impl SizedValue for Mirror {
    fn size(&self) -> u64 {
        let strings = self.name.len()
            + self.http_url.len()
            + self.rsync_url.len()
            + self.ftp_url.len()
            + self.sponsor_name.len()
            + self.sponsor_url.len()
            + self.sponsor_logo_url.len()
            + self.admin_name.len()
            + self.admin_email.len()
            + self.http_down_reason.len()
            + self.https_down_reason.len()
            + self.country_codes.iter().map(String::len).sum::<usize>()
            + self
                .excluded_country_codes
                .iter()
                .map(String::len)
                .sum::<usize>();
        (strings + 200) as u64
    }
}

fn bool_str(value: bool) -> String {
    if value { "true" } else { "false" }.to_string()
}

fn get_str(fields: &HashMap<String, String>, key: &str) -> String {
    fields.get(key).cloned().unwrap_or_default()
}

fn get_bool(fields: &HashMap<String, String>, key: &str) -> bool {
    fields.get(key).map(|v| v == "true" || v == "1").unwrap_or(false)
}

fn get_num<T>(fields: &HashMap<String, String>, key: &str, id: i32) -> Result<T, Error>
where
    T: FromStr + Default,
    Error: From<T::Err>,
{
    match fields.get(key) {
        Some(raw) if !raw.is_empty() => raw
            .parse::<T>()
            .map_err(Error::from)
            .err_tip(|| format!("Corrupt field {key} on mirror {id}")),
        _ => Ok(T::default()),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split_whitespace()
        .map(|s| s.to_uppercase())
        .collect()
}
