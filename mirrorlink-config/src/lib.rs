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

use std::time::Duration;

use mirrorlink_error::{Code, Error, ResultExt};
use serde::{Deserialize, Deserializer, Serialize};

/// Deserializes a duration from either a humantime string ("90s", "10m")
/// or a plain number of seconds.
pub fn convert_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Human(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
        Raw::Human(text) => humantime::parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

/// Deserializes a string running it through shell-style `~`/`$VAR`
/// expansion first.
pub fn convert_string_with_shellexpand<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    shellexpand::full(&raw)
        .map(|expanded| expanded.into_owned())
        .map_err(serde::de::Error::custom)
}

/// How the HTTP surface answers when the client expressed no preference.
#[allow(non_camel_case_types)]
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Pick `redirect` or `json` based on the request's Accept header.
    #[default]
    auto,

    /// Always answer with a 302 to the selected mirror.
    redirect,

    /// Always answer with the JSON description of the selection.
    json,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RedisConfig {
    /// Address of the redis server holding the catalog.
    #[serde(default = "default_redis_address")]
    pub address: String,

    /// Optional password sent with AUTH on connect.
    #[serde(default)]
    pub password: Option<String>,

    /// Database index. Also scopes cluster announcements: nodes on
    /// different indexes ignore each other.
    #[serde(default)]
    pub db: i64,

    /// Sentinel addresses. When non-empty `sentinel_master_name` is
    /// resolved through them instead of dialing `address` directly.
    #[serde(default)]
    pub sentinels: Vec<String>,

    /// Master name registered with the sentinels.
    #[serde(default)]
    pub sentinel_master_name: String,

    /// Retry schedule for transient store failures.
    #[serde(default)]
    pub retry: Retry,
}

fn default_redis_address() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            address: default_redis_address(),
            password: None,
            db: 0,
            sentinels: Vec::new(),
            sentinel_master_name: String::new(),
            retry: Retry::default(),
        }
    }
}

/// Retry configuration. Exponential, with jitter applied as a percentage
/// of the calculated delay.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Retry {
    /// Maximum number of retries until retrying stops.
    /// Setting this to zero will always attempt 1 time, but not retry.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Delay in seconds for exponential back off.
    #[serde(default = "default_retry_delay")]
    pub delay: f32,

    /// Amount of jitter to add as a percentage in decimal form.
    #[serde(default)]
    pub jitter: f32,
}

fn default_max_retries() -> usize {
    3
}

fn default_retry_delay() -> f32 {
    0.2
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            delay: default_retry_delay(),
            jitter: 0.0,
        }
    }
}

/// Byte capacities for the four metadata LRUs.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CacheConfig {
    /// Capacity of the file-info cache.
    #[serde(default = "default_cache_bytes")]
    pub file_info_bytes: u64,

    /// Capacity of the per-path mirror-list cache.
    #[serde(default = "default_cache_bytes")]
    pub file_mirrors_bytes: u64,

    /// Capacity of the mirror cache.
    #[serde(default = "default_cache_bytes")]
    pub mirror_bytes: u64,

    /// Capacity of the per-mirror file-info cache.
    #[serde(default = "default_cache_bytes")]
    pub mirror_file_info_bytes: u64,
}

fn default_cache_bytes() -> u64 {
    // 10MiB per cache keeps a busy catalog resident without letting one
    // node grow unbounded.
    10 * 1024 * 1024
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            file_info_bytes: default_cache_bytes(),
            file_mirrors_bytes: default_cache_bytes(),
            mirror_bytes: default_cache_bytes(),
            mirror_file_info_bytes: default_cache_bytes(),
        }
    }
}

/// A path prefix for which outdated mirror copies are still served.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OutdatedPrefix {
    /// Leading path component, e.g. "/nightly/".
    pub prefix: String,

    /// How far behind the source a mirror copy may be before it is
    /// excluded from selection.
    #[serde(deserialize_with = "convert_duration", default = "default_outdated_age")]
    pub max_age: Duration,
}

fn default_outdated_age() -> Duration {
    Duration::from_secs(10 * 60)
}

/// A mirror-like record served only when regular selection yields
/// nothing, e.g. because the store is down.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FallbackConfig {
    /// Base URL the request path is appended to.
    pub url: String,

    /// Country used for rank ordering among fallbacks.
    #[serde(default)]
    pub country_code: String,

    /// Continent used for rank ordering among fallbacks.
    #[serde(default)]
    pub continent_code: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MonitorConfig {
    /// Minimum delay between two health checks of the same mirror.
    #[serde(deserialize_with = "convert_duration", default = "default_check_interval")]
    pub check_interval: Duration,

    /// Minimum delay between two scans of the same mirror.
    #[serde(deserialize_with = "convert_duration", default = "default_scan_interval")]
    pub scan_interval: Duration,

    /// Minimum delay between two scans of the local repository.
    #[serde(
        deserialize_with = "convert_duration",
        default = "default_repository_scan_interval"
    )]
    pub repository_scan_interval: Duration,

    /// Number of workers draining the health-check queue. The queue is
    /// bounded at five entries per worker.
    #[serde(default = "default_health_check_threads")]
    pub health_check_threads: usize,

    /// Number of mirror scans allowed to run at once on this node.
    #[serde(default = "default_concurrent_sync")]
    pub concurrent_sync: usize,

    /// User agent presented by health-check probes.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Disable a mirror entirely when a probe gets a 404 for a file the
    /// mirror is known to carry.
    #[serde(default)]
    pub disable_on_missing_file: bool,

    /// Default redirect policy for mirrors that inherit theirs.
    #[serde(default)]
    pub allow_mirror_redirects: bool,
}

fn default_check_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_scan_interval() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_repository_scan_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_health_check_threads() -> usize {
    10
}

fn default_concurrent_sync() -> usize {
    2
}

fn default_user_agent() -> String {
    format!("mirrorlink/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
            scan_interval: default_scan_interval(),
            repository_scan_interval: default_repository_scan_interval(),
            health_check_threads: default_health_check_threads(),
            concurrent_sync: default_concurrent_sync(),
            user_agent: default_user_agent(),
            disable_on_missing_file: false,
            allow_mirror_redirects: false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SelectionConfig {
    /// Multiplier over the closest accepted mirror's distance defining
    /// which mirrors enter the weighted pool.
    #[serde(default = "default_weight_distribution_range")]
    pub weight_distribution_range: f32,

    /// Apply each mirror's sampled clock offset before comparing
    /// mod-times. Some FTP servers report times shifted by whole hours.
    #[serde(default)]
    pub fix_timezone_offsets: bool,

    /// Prefixes for which mirrors with outdated or differently sized
    /// copies are still acceptable.
    #[serde(default)]
    pub allow_outdated: Vec<OutdatedPrefix>,

    /// Maximum `Link:` duplicate headers emitted on redirects.
    #[serde(default = "default_max_link_headers")]
    pub max_link_headers: usize,
}

fn default_weight_distribution_range() -> f32 {
    1.5
}

fn default_max_link_headers() -> usize {
    10
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            weight_distribution_range: default_weight_distribution_range(),
            fix_timezone_offsets: false,
            allow_outdated: Vec::new(),
            max_link_headers: default_max_link_headers(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Address the HTTP redirector listens on.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Local path of the authoritative repository tree.
    #[serde(
        deserialize_with = "convert_string_with_shellexpand",
        default = "default_repository"
    )]
    pub repository: String,

    /// Path component common to every mirror URL that must be stripped
    /// from listings before comparing against the local tree.
    #[serde(default)]
    pub repository_prefix: String,

    /// Trace file sampled after each successful scan to estimate a
    /// mirror's clock offset and sync lag. Relative to the repository
    /// root. Empty disables the probe.
    #[serde(default)]
    pub trace_file: String,

    /// Content hashes maintained for every repository file.
    #[serde(default = "default_hashes")]
    pub hashes: Vec<HashAlgorithm>,

    /// How responses are rendered when the request doesn't say.
    #[serde(default)]
    pub output_mode: OutputMode,

    /// Path at which per-file download counters may be queried. Unset
    /// disables the endpoint.
    #[serde(default)]
    pub download_stats_path: Option<String>,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub selection: SelectionConfig,

    /// Served, ordered by rank, when selection yields no candidate.
    #[serde(default)]
    pub fallbacks: Vec<FallbackConfig>,
}

fn default_listen_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_repository() -> String {
    "/srv/repo".to_string()
}

fn default_hashes() -> Vec<HashAlgorithm> {
    vec![HashAlgorithm::sha256]
}

impl Default for Config {
    fn default() -> Self {
        // Round-trips through the serde defaults so the two paths cannot
        // drift apart.
        serde_json5::from_str("{}").expect("empty config must deserialize")
    }
}

#[allow(non_camel_case_types)]
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    sha1,
    sha256,
    md5,
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)
            .err_tip(|| format!("Failed to read config file {path}"))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        let config: Config = serde_json5::from_str(text)
            .map_err(|e| mirrorlink_error::make_err!(Code::InvalidArgument, "{e}"))
            .err_tip(|| "Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        mirrorlink_error::error_if!(
            self.monitor.health_check_threads == 0,
            "monitor.health_check_threads must be at least 1"
        );
        mirrorlink_error::error_if!(
            self.monitor.concurrent_sync == 0,
            "monitor.concurrent_sync must be at least 1"
        );
        mirrorlink_error::error_if!(
            self.selection.weight_distribution_range <= 0.0,
            "selection.weight_distribution_range must be positive"
        );
        mirrorlink_error::error_if!(self.hashes.is_empty(), "at least one hash must be enabled");
        Ok(())
    }
}
