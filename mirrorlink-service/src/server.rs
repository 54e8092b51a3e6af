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

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{Datelike, Utc};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use mirrorlink_config::{Config, OutputMode};
use mirrorlink_error::{Code, Error, ResultExt};
use mirrorlink_selection::{SelectionEngine, SelectionOutcome};
use mirrorlink_store::cache::MetadataCache;
use mirrorlink_store::keys;
use mirrorlink_store::mirror::Mirror;
use mirrorlink_store::redis_store::{CatalogStore, Connect};
use mirrorlink_util::geo::{ClientGeo, GeoResolver};
use parking_lot::RwLock;
use redis::aio::ConnectionLike;
use redis::AsyncCommands;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};

use crate::request::{self, RequestFlags};
use crate::response;

/// The HTTP surface of the redirector. One instance serves every
/// request; selection itself is pure and re-entrant.
pub struct RedirectorService<C: ConnectionLike + Connect + Clone + Send + Sync = redis::aio::ConnectionManager>
{
    store: Arc<CatalogStore<C>>,
    cache: Arc<MetadataCache<C>>,
    engine: SelectionEngine<C>,
    config: Arc<RwLock<Arc<Config>>>,
    geo: Arc<dyn GeoResolver>,
}

#[derive(Serialize)]
struct StatsPage {
    path: String,
    total: u64,
    year: u64,
    month: u64,
    day: u64,
}

#[derive(Serialize)]
struct MirrorStatsEntry {
    id: i32,
    name: String,
    http_up: bool,
    https_up: bool,
    enabled: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    down_reason: String,
}

impl<C: ConnectionLike + Connect + Clone + Send + Sync + 'static> RedirectorService<C> {
    pub fn new(
        store: Arc<CatalogStore<C>>,
        cache: Arc<MetadataCache<C>>,
        config: Arc<RwLock<Arc<Config>>>,
        geo: Arc<dyn GeoResolver>,
    ) -> Arc<Self> {
        let engine = SelectionEngine::new(cache.clone());
        Arc::new(Self {
            store,
            cache,
            engine,
            config,
            geo,
        })
    }

    fn config(&self) -> Arc<Config> {
        self.config.read().clone()
    }

    /// Never fails; every internal error becomes a status code.
    pub async fn handle(&self, req: Request<Body>, remote_ip: String) -> Response<Body> {
        if req.method() != Method::GET && req.method() != Method::HEAD {
            return response::plain_status(StatusCode::METHOD_NOT_ALLOWED);
        }
        let path = match request::sanitize_path(req.uri().path()) {
            Ok(path) => path,
            Err(e) if e.code == Code::PermissionDenied => {
                return response::plain_status(StatusCode::FORBIDDEN)
            }
            Err(_) => return response::plain_status(StatusCode::NOT_FOUND),
        };
        let flags = request::parse_flags(req.uri().query());
        let config = self.config();

        if flags.mirrorstats {
            return self.mirror_stats(flags.pretty).await;
        }
        if let Some(kind) = flags.checksum {
            return match self.cache.get_file_info(&path).await {
                Ok(file) if file.is_complete() => response::checksum_response(&file, kind),
                Ok(_) => response::plain_status(StatusCode::NOT_FOUND),
                Err(_) => response::plain_status(StatusCode::SERVICE_UNAVAILABLE),
            };
        }
        if flags.stats || flags.downloadstats {
            if flags.downloadstats
                && config.download_stats_path.as_deref() != Some(path.as_str())
            {
                return response::plain_status(StatusCode::NOT_FOUND);
            }
            return self.file_stats(&path, flags.pretty).await;
        }

        // A conditional request is answered from the catalog alone.
        if let Some(since) = req
            .headers()
            .get(hyper::header::IF_MODIFIED_SINCE)
            .and_then(|v| v.to_str().ok())
            .and_then(response::parse_http_date)
        {
            if let Ok(file) = self.cache.get_file_info(&path).await {
                if let Some(mod_time) = file.mod_time {
                    if mod_time <= since {
                        return response::not_modified(&file);
                    }
                }
            }
        }

        let ip = request::client_ip(req.headers(), &remote_ip, &flags);
        let client = self.resolve_client(&ip);
        let secure = request::secure_option(req.headers(), &flags);

        let outcome = self
            .engine
            .select(&config.selection, &path, &client, secure, flags.mirrorlist)
            .await;
        match outcome {
            Ok(outcome) if !outcome.candidates.is_empty() => {
                self.respond_with_selection(req.headers(), &config, &flags, &client, outcome)
            }
            Ok(outcome) => {
                self.respond_with_fallback(req.headers(), &config, &flags, &client, &path, Some(outcome))
            }
            Err(e) if e.code == Code::Unavailable || e.code == Code::NotFound => {
                event!(Level::DEBUG, ?e, path = path.as_str(), "Selection unavailable, trying fallbacks");
                let not_found = e.code == Code::NotFound;
                let response = self.respond_with_fallback(
                    req.headers(),
                    &config,
                    &flags,
                    &client,
                    &path,
                    None,
                );
                if response.status() == StatusCode::SERVICE_UNAVAILABLE && not_found {
                    return response::plain_status(StatusCode::NOT_FOUND);
                }
                response
            }
            Err(e) => {
                event!(Level::ERROR, ?e, path = path.as_str(), "Selection failed");
                response::plain_status(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    fn resolve_client(&self, ip: &str) -> ClientGeo {
        let resolved = ip
            .parse()
            .ok()
            .and_then(|addr| self.geo.resolve(addr))
            .unwrap_or_default();
        ClientGeo {
            ip: ip.to_string(),
            ..resolved
        }
    }

    fn respond_with_selection(
        &self,
        headers: &hyper::HeaderMap,
        config: &Config,
        flags: &RequestFlags,
        client: &ClientGeo,
        outcome: SelectionOutcome,
    ) -> Response<Body> {
        if flags.mirrorlist || self.wants_json(headers, config) {
            let page = response::SelectionPage {
                file: response::file_json(&outcome.file),
                client: response::client_json(client),
                mirrors: outcome.candidates.iter().map(response::mirror_json).collect(),
                excluded: if flags.mirrorlist {
                    outcome.excluded.iter().map(response::mirror_json).collect()
                } else {
                    Vec::new()
                },
                fallback: false,
            };
            return response::json_response(StatusCode::OK, &page, flags.pretty);
        }
        response::redirect_response(&outcome.candidates, config.selection.max_link_headers)
    }

    /// Serves from the configured fallbacks; 503 only when none exist.
    fn respond_with_fallback(
        &self,
        headers: &hyper::HeaderMap,
        config: &Config,
        flags: &RequestFlags,
        client: &ClientGeo,
        path: &str,
        outcome: Option<SelectionOutcome>,
    ) -> Response<Body> {
        let fallbacks = response::fallback_mirrors(&config.fallbacks, path, client);
        if fallbacks.is_empty() {
            return response::plain_status(StatusCode::SERVICE_UNAVAILABLE);
        }
        if flags.mirrorlist || self.wants_json(headers, config) {
            let file = outcome
                .as_ref()
                .map(|o| response::file_json(&o.file))
                .unwrap_or_else(|| {
                    response::file_json(&mirrorlink_store::FileInfo::new(path.to_string()))
                });
            let page = response::SelectionPage {
                file,
                client: response::client_json(client),
                mirrors: fallbacks.iter().map(response::mirror_json).collect(),
                excluded: Vec::new(),
                fallback: true,
            };
            return response::json_response(StatusCode::OK, &page, flags.pretty);
        }
        response::redirect_response(&fallbacks, config.selection.max_link_headers)
    }

    fn wants_json(&self, headers: &hyper::HeaderMap, config: &Config) -> bool {
        match config.output_mode {
            OutputMode::json => true,
            OutputMode::redirect => false,
            OutputMode::auto => headers
                .get(hyper::header::ACCEPT)
                .and_then(|v| v.to_str().ok())
                .map(|accept| accept.contains("application/json"))
                .unwrap_or(false),
        }
    }

    async fn file_stats(&self, path: &str, pretty: bool) -> Response<Body> {
        let now = Utc::now();
        let year = now.year().to_string();
        let month = format!("{:02}", now.month());
        let day = format!("{:02}", now.day());
        let periods = [
            keys::stats_file_key(&[]),
            keys::stats_file_key(&[&year]),
            keys::stats_file_key(&[&year, &month]),
            keys::stats_file_key(&[&year, &month, &day]),
        ];
        let mut counts = [0u64; 4];
        for (index, key) in periods.iter().enumerate() {
            match self.read_counter(key, path).await {
                Ok(count) => counts[index] = count,
                Err(_) => return response::plain_status(StatusCode::SERVICE_UNAVAILABLE),
            }
        }
        let page = StatsPage {
            path: path.to_string(),
            total: counts[0],
            year: counts[1],
            month: counts[2],
            day: counts[3],
        };
        response::json_response(StatusCode::OK, &page, pretty)
    }

    async fn read_counter(&self, key: &str, path: &str) -> Result<u64, Error> {
        let mut conn = self.store.conn().await?;
        let count: Option<u64> = conn
            .hget(key, path)
            .await
            .map_err(Error::from)
            .err_tip(|| format!("While reading counter {key}"))?;
        Ok(count.unwrap_or(0))
    }

    async fn mirror_stats(&self, pretty: bool) -> Response<Body> {
        let ids = match self.store.mirror_ids().await {
            Ok(ids) => ids,
            Err(_) => return response::plain_status(StatusCode::SERVICE_UNAVAILABLE),
        };
        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            let mirror: Mirror = match self.cache.get_mirror(id).await {
                Ok(mirror) => mirror,
                Err(_) => continue,
            };
            entries.push(MirrorStatsEntry {
                id: mirror.id,
                name: mirror.name.clone(),
                http_up: mirror.http_up,
                https_up: mirror.https_up,
                enabled: mirror.enabled,
                down_reason: if mirror.http_up {
                    String::new()
                } else {
                    mirror.http_down_reason.clone()
                },
            });
        }
        response::json_response(StatusCode::OK, &entries, pretty)
    }
}

/// Binds and serves until the token fires, then drains connections.
pub async fn serve<C: ConnectionLike + Connect + Clone + Send + Sync + 'static>(
    service: Arc<RedirectorService<C>>,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let remote_ip = conn.remote_addr().ip().to_string();
        let service = service.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let service = service.clone();
                let remote_ip = remote_ip.clone();
                async move { Ok::<_, Infallible>(service.handle(req, remote_ip).await) }
            }))
        }
    });
    let server = Server::try_bind(&addr)
        .map_err(Error::from)
        .err_tip(|| format!("While binding {addr}"))?
        .serve(make_svc);
    event!(Level::INFO, %addr, "HTTP redirector listening");
    server
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(Error::from)
        .err_tip(|| "HTTP server failed")
}
