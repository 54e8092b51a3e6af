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

use async_trait::async_trait;
use hyper::{Body, Request, StatusCode};
use mirrorlink_config::{CacheConfig, Config};
use mirrorlink_error::{make_err, Code, Error};
use mirrorlink_service::RedirectorService;
use mirrorlink_store::cache::MetadataCache;
use mirrorlink_store::redis_store::{CatalogStore, Connect};
use mirrorlink_util::geo::NoGeoResolver;
use parking_lot::RwLock;
use redis::aio::ConnectionLike;
use redis::{Cmd, Pipeline, RedisFuture, Value};
use redis_test::{MockCmd, MockRedisConnection};

#[derive(Clone)]
struct MockConn(MockRedisConnection);

impl ConnectionLike for MockConn {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        self.0.req_packed_command(cmd)
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        self.0.req_packed_commands(cmd, offset, count)
    }

    fn get_db(&self) -> i64 {
        0
    }
}

#[async_trait]
impl Connect for MockConn {
    async fn connect(_address: &str) -> Result<Self, Error> {
        // Stands in for a refused connection when a test builds the
        // store from an address instead of injecting a mock.
        Err(make_err!(Code::Unavailable, "Connection refused"))
    }
}

fn bulk_map(pairs: &[(&str, &str)]) -> Value {
    let mut values = Vec::with_capacity(pairs.len() * 2);
    for (field, value) in pairs {
        values.push(Value::Data(field.as_bytes().to_vec()));
        values.push(Value::Data(value.as_bytes().to_vec()));
    }
    Value::Bulk(values)
}

fn bulk_strings(items: &[&str]) -> Value {
    Value::Bulk(
        items
            .iter()
            .map(|s| Value::Data(s.as_bytes().to_vec()))
            .collect(),
    )
}

fn config_with_fallback() -> Arc<RwLock<Arc<Config>>> {
    let config = Config::parse(r#"{ fallbacks: [{ url: "http://fb/" }] }"#).unwrap();
    Arc::new(RwLock::new(Arc::new(config)))
}

fn config_without_fallback() -> Arc<RwLock<Arc<Config>>> {
    Arc::new(RwLock::new(Arc::new(Config::parse("{}").unwrap())))
}

fn service_with(
    cmds: Vec<MockCmd>,
    config: Arc<RwLock<Arc<Config>>>,
) -> Arc<RedirectorService<MockConn>> {
    let store = Arc::new(CatalogStore::new_with_connection(MockConn(
        MockRedisConnection::new(cmds),
    )));
    let cache = MetadataCache::new(&CacheConfig::default(), store.clone());
    RedirectorService::new(store, cache, config, Arc::new(NoGeoResolver))
}

/// A store whose every connection attempt is refused.
fn service_with_dead_store(
    config: Arc<RwLock<Arc<Config>>>,
) -> Arc<RedirectorService<MockConn>> {
    let store: Arc<CatalogStore<MockConn>> =
        Arc::new(CatalogStore::new("redis://unreachable/".to_string(), 0));
    let cache = MetadataCache::new(&CacheConfig::default(), store.clone());
    RedirectorService::new(store, cache, config, Arc::new(NoGeoResolver))
}

fn get(path_and_query: &str) -> Request<Body> {
    Request::builder()
        .uri(path_and_query)
        .body(Body::empty())
        .unwrap()
}

#[cfg(test)]
mod redirector_tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn store_down_redirects_to_the_fallback() {
        let service = service_with_dead_store(config_with_fallback());
        let response = service.handle(get("/foo.tgz"), "127.0.0.1".to_string()).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(hyper::header::LOCATION).unwrap(),
            "http://fb/foo.tgz"
        );
        assert_eq!(
            response.headers().get(hyper::header::CACHE_CONTROL).unwrap(),
            "private, no-cache"
        );
    }

    #[tokio::test]
    async fn store_down_without_fallback_is_503() {
        let service = service_with_dead_store(config_without_fallback());
        let response = service.handle(get("/foo.tgz"), "127.0.0.1".to_string()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn unindexed_file_redirects_to_the_fallback() {
        let service = service_with(
            vec![MockCmd::new(
                redis::cmd("HGETALL").arg("FILE_/foo.tgz"),
                Ok(Value::Bulk(vec![])),
            )],
            config_with_fallback(),
        );
        let response = service.handle(get("/foo.tgz"), "127.0.0.1".to_string()).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(hyper::header::LOCATION).unwrap(),
            "http://fb/foo.tgz"
        );
    }

    #[tokio::test]
    async fn unindexed_file_without_fallback_is_404() {
        let service = service_with(
            vec![MockCmd::new(
                redis::cmd("HGETALL").arg("FILE_/foo.tgz"),
                Ok(Value::Bulk(vec![])),
            )],
            config_without_fallback(),
        );
        let response = service.handle(get("/foo.tgz"), "127.0.0.1".to_string()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn healthy_mirror_gets_the_redirect() {
        let service = service_with(
            vec![
                MockCmd::new(
                    redis::cmd("HGETALL").arg("FILE_/foo.tgz"),
                    Ok(bulk_map(&[("size", "123"), ("modTime", "1700000000")])),
                ),
                MockCmd::new(
                    redis::cmd("SMEMBERS").arg("FILEMIRRORS_/foo.tgz"),
                    Ok(bulk_strings(&["42"])),
                ),
                MockCmd::new(
                    redis::cmd("HGETALL").arg("MIRROR_42"),
                    Ok(bulk_map(&[
                        ("name", "m42"),
                        ("http", "m42.example/"),
                        ("countryCodes", "FR"),
                        ("enabled", "true"),
                        ("httpUp", "true"),
                    ])),
                ),
                MockCmd::new(
                    redis::cmd("HGETALL").arg("FILEINFO_42_/foo.tgz"),
                    Ok(bulk_map(&[("size", "123")])),
                ),
            ],
            config_without_fallback(),
        );
        let response = service.handle(get("/foo.tgz"), "127.0.0.1".to_string()).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(hyper::header::LOCATION).unwrap(),
            "http://m42.example/foo.tgz"
        );
    }

    #[tokio::test]
    async fn conditional_request_is_answered_without_selection() {
        let service = service_with(
            vec![MockCmd::new(
                redis::cmd("HGETALL").arg("FILE_/foo.tgz"),
                Ok(bulk_map(&[("size", "123"), ("modTime", "1700000000")])),
            )],
            config_without_fallback(),
        );
        let request = Request::builder()
            .uri("/foo.tgz")
            // One hour after the file's mod time.
            .header("If-Modified-Since", "Tue, 14 Nov 2023 23:13:20 GMT")
            .body(Body::empty())
            .unwrap();
        let response = service.handle(request, "127.0.0.1".to_string()).await;
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(
            response.headers().get(hyper::header::LAST_MODIFIED).unwrap(),
            "Tue, 14 Nov 2023 22:13:20 GMT"
        );
        assert!(response.headers().get(hyper::header::LOCATION).is_none());
    }

    #[tokio::test]
    async fn path_escape_is_forbidden_regardless_of_store_state() {
        let service = service_with_dead_store(config_with_fallback());
        let response = service
            .handle(get("/../etc/passwd"), "127.0.0.1".to_string())
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn checksum_is_served_from_the_catalog() {
        let service = service_with(
            vec![MockCmd::new(
                redis::cmd("HGETALL").arg("FILE_/foo.tgz"),
                Ok(bulk_map(&[
                    ("size", "123"),
                    ("modTime", "1700000000"),
                    ("sha256", "cafebabe"),
                ])),
            )],
            config_without_fallback(),
        );
        let response = service
            .handle(get("/foo.tgz?sha256"), "127.0.0.1".to_string())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert_eq!(body.as_ref(), b"cafebabe  foo.tgz\n");
    }

    #[tokio::test]
    async fn missing_hash_type_is_404() {
        let service = service_with(
            vec![MockCmd::new(
                redis::cmd("HGETALL").arg("FILE_/foo.tgz"),
                Ok(bulk_map(&[
                    ("size", "123"),
                    ("modTime", "1700000000"),
                    ("sha256", "cafebabe"),
                ])),
            )],
            config_without_fallback(),
        );
        let response = service
            .handle(get("/foo.tgz?md5"), "127.0.0.1".to_string())
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn json_mode_lists_the_selection() {
        let config = Arc::new(RwLock::new(Arc::new(
            Config::parse(r#"{ output_mode: "json" }"#).unwrap(),
        )));
        let service = service_with(
            vec![
                MockCmd::new(
                    redis::cmd("HGETALL").arg("FILE_/foo.tgz"),
                    Ok(bulk_map(&[("size", "123"), ("modTime", "1700000000")])),
                ),
                MockCmd::new(
                    redis::cmd("SMEMBERS").arg("FILEMIRRORS_/foo.tgz"),
                    Ok(bulk_strings(&["42"])),
                ),
                MockCmd::new(
                    redis::cmd("HGETALL").arg("MIRROR_42"),
                    Ok(bulk_map(&[
                        ("name", "m42"),
                        ("http", "m42.example/"),
                        ("countryCodes", "FR"),
                        ("enabled", "true"),
                        ("httpUp", "true"),
                    ])),
                ),
                MockCmd::new(
                    redis::cmd("HGETALL").arg("FILEINFO_42_/foo.tgz"),
                    Ok(bulk_map(&[("size", "123")])),
                ),
            ],
            config,
        );
        let response = service.handle(get("/foo.tgz"), "127.0.0.1".to_string()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let page: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(page["mirrors"][0]["name"], "m42");
        assert_eq!(page["fallback"], false);
        assert_eq!(page["client"]["ip"], "127.0.0.1");
    }
}
