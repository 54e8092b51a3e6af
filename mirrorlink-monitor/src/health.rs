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

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hyper::client::HttpConnector;
use hyper::{Body, Request, StatusCode};
use mirrorlink_config::MonitorConfig;
use mirrorlink_error::{make_err, Code, Error, ResultExt};
use mirrorlink_store::keys;
use mirrorlink_store::mirror::{Mirror, RedirectPolicy};
use mirrorlink_store::redis_store::{CatalogStore, Connect};
use redis::aio::ConnectionLike;
use tracing::{event, Level};

const PROBE_DEADLINE: Duration = Duration::from_secs(40);
const MAX_REDIRECT_HOPS: usize = 5;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeResult {
    Up,
    Down(String),
}

/// Probes one known file per mirror with a conditional HEAD and flips the
/// per-protocol up flags. The sole writer of the up/down/state-since
/// fields of `MIRROR_{id}`.
pub struct HealthChecker<C: ConnectionLike + Connect + Clone + Send + Sync = redis::aio::ConnectionManager>
{
    store: Arc<CatalogStore<C>>,
    client: hyper::Client<hyper_rustls::HttpsConnector<HttpConnector>>,
    user_agent: String,
    default_allow_redirects: bool,
    disable_on_missing_file: bool,
}

impl<C: ConnectionLike + Connect + Clone + Send + Sync + 'static> HealthChecker<C> {
    pub fn new(store: Arc<CatalogStore<C>>, config: &MonitorConfig) -> Self {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();
        Self {
            store,
            client: hyper::Client::builder().build(https),
            user_agent: config.user_agent.clone(),
            default_allow_redirects: config.allow_mirror_redirects,
            disable_on_missing_file: config.disable_on_missing_file,
        }
    }

    /// Checks every protocol the mirror's URL form allows and records
    /// transitions. `MirrorNotScanned` (FailedPrecondition) means the
    /// caller must keep the mirror parked until a scan succeeds.
    pub async fn check(&self, mirror_id: i32) -> Result<(), Error> {
        let mirror = self
            .store
            .get_mirror(mirror_id)
            .await?
            .ok_or_else(|| make_err!(Code::NotFound, "Unknown mirror {mirror_id}"))?;
        if !mirror.enabled {
            return Ok(());
        }
        let path = self
            .store
            .random_set_member(&keys::handled_files_key(mirror_id))
            .await?
            .ok_or_else(|| {
                make_err!(
                    Code::FailedPrecondition,
                    "Mirror {mirror_id} has not been scanned yet"
                )
            })?;
        let expected_size = self.store.get_file_info(&path).await?.size;

        let mut fields: Vec<(&str, String)> = Vec::new();
        let mut got_missing_file = false;
        if mirror.supports_http() {
            let result = self.probe(&mirror, "http", &path, expected_size).await;
            got_missing_file |= is_missing_file(&result);
            record_transition(&mirror, "http", &result, &mut fields);
        }
        if mirror.supports_https() {
            let result = self.probe(&mirror, "https", &path, expected_size).await;
            got_missing_file |= is_missing_file(&result);
            record_transition(&mirror, "https", &result, &mut fields);
        }
        if got_missing_file && self.disable_on_missing_file {
            event!(Level::WARN, mirror_id, "Disabling mirror on missing file");
            fields.push(("enabled", "false".to_string()));
        }
        if fields.is_empty() {
            return Ok(());
        }
        fields.push(("stateSince", unix_now().to_string()));
        self.store
            .update_mirror_fields(mirror_id, &fields)
            .await
            .err_tip(|| "While recording the probe outcome")
    }

    async fn probe(
        &self,
        mirror: &Mirror,
        scheme: &str,
        path: &str,
        expected_size: u64,
    ) -> ProbeResult {
        let allow_redirects =
            redirects_allowed(mirror.allow_redirects, self.default_allow_redirects);
        let mut url = mirror.absolute_url_for(scheme, path);
        for _hop in 0..MAX_REDIRECT_HOPS {
            let request = match Request::head(url.as_str())
                .header(hyper::header::USER_AGENT, &self.user_agent)
                .body(Body::empty())
            {
                Ok(request) => request,
                Err(e) => return ProbeResult::Down(format!("Invalid probe URL: {e}")),
            };
            let response =
                match tokio::time::timeout(PROBE_DEADLINE, self.client.request(request)).await {
                    Ok(Ok(response)) => response,
                    Ok(Err(_)) | Err(_) => return ProbeResult::Down("Unreachable".to_string()),
                };
            let status = response.status();
            if status.is_redirection() {
                if !allow_redirects {
                    return ProbeResult::Down("Unauthorized redirect".to_string());
                }
                match response
                    .headers()
                    .get(hyper::header::LOCATION)
                    .and_then(|l| l.to_str().ok())
                {
                    Some(location) => {
                        url = resolve_location(&url, location);
                        continue;
                    }
                    None => {
                        return ProbeResult::Down(format!(
                            "Got status code {}",
                            status.as_u16()
                        ))
                    }
                }
            }
            if status.is_success() {
                if let Some(length) = response
                    .headers()
                    .get(hyper::header::CONTENT_LENGTH)
                    .and_then(|l| l.to_str().ok())
                    .and_then(|l| l.parse::<u64>().ok())
                {
                    if length != expected_size {
                        // A mismatch on one file is worth a look but not
                        // worth taking the mirror down over.
                        event!(
                            Level::WARN,
                            mirror = mirror.name.as_str(),
                            path,
                            expected = expected_size,
                            got = length,
                            "Size mismatch during probe"
                        );
                    }
                }
                return ProbeResult::Up;
            }
            return classify_failure(status, path);
        }
        ProbeResult::Down("Unauthorized redirect".to_string())
    }
}

fn is_missing_file(result: &ProbeResult) -> bool {
    matches!(result, ProbeResult::Down(reason) if reason.starts_with("File not found"))
}

/// Appends field updates for one protocol when the probe outcome differs
/// from the recorded state, logging the transition.
fn record_transition(
    mirror: &Mirror,
    scheme: &str,
    result: &ProbeResult,
    fields: &mut Vec<(&'static str, String)>,
) {
    let (was_up, old_reason, up_field, reason_field) = match scheme {
        "https" => (
            mirror.https_up,
            mirror.https_down_reason.as_str(),
            "httpsUp",
            "httpsDownReason",
        ),
        _ => (
            mirror.http_up,
            mirror.http_down_reason.as_str(),
            "httpUp",
            "httpDownReason",
        ),
    };
    match result {
        ProbeResult::Up => {
            if !was_up {
                event!(Level::INFO, mirror = mirror.name.as_str(), scheme, "Mirror is up");
                fields.push((up_field, "true".to_string()));
                fields.push((reason_field, String::new()));
            }
        }
        ProbeResult::Down(reason) => {
            if was_up || old_reason != reason {
                event!(
                    Level::WARN,
                    mirror = mirror.name.as_str(),
                    scheme,
                    reason,
                    "Mirror is down"
                );
                fields.push((up_field, "false".to_string()));
                fields.push((reason_field, reason.clone()));
            }
        }
    }
}

pub fn classify_failure(status: StatusCode, path: &str) -> ProbeResult {
    if status == StatusCode::NOT_FOUND {
        return ProbeResult::Down(format!("File not found {path} (error 404)"));
    }
    ProbeResult::Down(format!("Got status code {}", status.as_u16()))
}

/// The tri-state per-mirror policy, falling back to the configured
/// default on `Inherit`.
pub fn redirects_allowed(policy: RedirectPolicy, config_default: bool) -> bool {
    match policy {
        RedirectPolicy::Allow => true,
        RedirectPolicy::Deny => false,
        RedirectPolicy::Inherit => config_default,
    }
}

fn resolve_location(current_url: &str, location: &str) -> String {
    if location.starts_with("http://") || location.starts_with("https://") {
        return location.to_string();
    }
    // Relative redirect: keep scheme and host.
    let (scheme, rest) = current_url.split_once("://").unwrap_or(("http", current_url));
    let host = rest.split('/').next().unwrap_or(rest);
    format!("{scheme}://{host}/{}", location.trim_start_matches('/'))
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod health_tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_failure(StatusCode::NOT_FOUND, "/a/b.iso"),
            ProbeResult::Down("File not found /a/b.iso (error 404)".to_string())
        );
        assert_eq!(
            classify_failure(StatusCode::INTERNAL_SERVER_ERROR, "/a"),
            ProbeResult::Down("Got status code 500".to_string())
        );
    }

    #[test]
    fn redirect_policy_resolution() {
        assert!(redirects_allowed(RedirectPolicy::Allow, false));
        assert!(!redirects_allowed(RedirectPolicy::Deny, true));
        assert!(redirects_allowed(RedirectPolicy::Inherit, true));
        assert!(!redirects_allowed(RedirectPolicy::Inherit, false));
    }

    #[test]
    fn transitions_only_write_on_change() {
        let mut mirror = Mirror {
            id: 1,
            name: "m1".to_string(),
            http_up: true,
            ..Default::default()
        };

        let mut fields = Vec::new();
        record_transition(&mirror, "http", &ProbeResult::Up, &mut fields);
        assert!(fields.is_empty());

        record_transition(
            &mirror,
            "http",
            &ProbeResult::Down("Unreachable".to_string()),
            &mut fields,
        );
        assert_eq!(
            fields,
            vec![
                ("httpUp", "false".to_string()),
                ("httpDownReason", "Unreachable".to_string()),
            ]
        );

        // Already down for the same reason: no churn.
        mirror.http_up = false;
        mirror.http_down_reason = "Unreachable".to_string();
        let mut fields = Vec::new();
        record_transition(
            &mirror,
            "http",
            &ProbeResult::Down("Unreachable".to_string()),
            &mut fields,
        );
        assert!(fields.is_empty());
    }

    #[test]
    fn relative_redirects_keep_the_host() {
        assert_eq!(
            resolve_location("http://m1.example.org/repo/a.iso", "/mirror/a.iso"),
            "http://m1.example.org/mirror/a.iso"
        );
        assert_eq!(
            resolve_location("https://m1.example.org/a", "https://cdn.example.net/a"),
            "https://cdn.example.net/a"
        );
    }
}
