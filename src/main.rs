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

use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::stream;
use mirrorlink_config::Config;
use mirrorlink_error::{Code, Error, ResultExt};
use mirrorlink_monitor::{Cluster, Monitor};
use mirrorlink_scanner::{MirrorScanner, RepositoryScanner};
use mirrorlink_service::{server, RedirectorService};
use mirrorlink_store::redis_store::{resolve_address, CatalogStore};
use mirrorlink_store::{pubsub, upgrade, MetadataCache};
use mirrorlink_util::geo::NoGeoResolver;
use mirrorlink_util::retry::{ExponentialBackoff, Retrier, RetryResult};
use parking_lot::RwLock;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};
use tracing_subscriber::EnvFilter;

const DRAIN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "mirrorlink", about = "Geographic download redirector")]
struct Args {
    /// Path of the JSON5 configuration file.
    #[arg(short, long, default_value = "/etc/mirrorlink/mirrorlink.conf")]
    config: String,

    /// Where to write the pid file; nothing is written when omitted.
    #[arg(long, default_value = "/run/mirrorlink/mirrorlink.pid")]
    pid_file: String,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            event!(Level::ERROR, ?e, "Failed to start the runtime");
            std::process::exit(1);
        }
    };
    let exit_code = match runtime.block_on(run(args)) {
        Ok(()) => 0,
        Err(e) => {
            event!(Level::ERROR, ?e, "Fatal error");
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run(args: Args) -> Result<(), Error> {
    // A broken configuration is fatal; nothing should serve with it.
    let config = Config::load(&args.config)?;
    // Dropped on return, removing the file.
    let _pid_file = write_pid_file(&args.pid_file);

    let address = resolve_address(&config.redis).await?;
    let store: Arc<CatalogStore> = Arc::new(CatalogStore::new(address.clone(), config.redis.db));

    // A catalog written by a newer binary is fatal; a temporarily
    // unreachable store is waited out, backing off per the configured
    // schedule and then probing every 30 seconds.
    {
        let retry = config.redis.retry.clone();
        let schedule = ExponentialBackoff::new(
            Duration::from_secs_f32(retry.delay.max(0.1)),
            retry.jitter,
            retry.max_retries,
        )
        .chain(std::iter::repeat(Duration::from_secs(30)));
        let retrier = Retrier::new(Box::new(|delay| Box::pin(tokio::time::sleep(delay))));
        let attempts = stream::unfold(&store, |store| async move {
            let result = match upgrade::check_and_upgrade(store).await {
                Ok(()) => RetryResult::Ok(()),
                Err(e) if e.code.is_retryable() => {
                    event!(Level::WARN, ?e, "Catalog not ready, retrying");
                    RetryResult::Retry(e)
                }
                Err(e) => RetryResult::Err(e),
            };
            Some((result, store))
        });
        Pin::new(&retrier)
            .retry(schedule, Box::pin(attempts))
            .await
            .err_tip(|| "While waiting for the catalog")?;
    }

    let shutdown = CancellationToken::new();
    let (events_tx, _) = tokio::sync::broadcast::channel(1024);
    let (refresh_tx, refresh_rx) = tokio::sync::mpsc::channel(128);
    let _pubsub_guard = pubsub::start_listener(
        address.clone(),
        events_tx.clone(),
        refresh_tx,
        shutdown.clone(),
    );

    let cache = MetadataCache::new(&config.cache, store.clone());
    let _invalidation_guard = cache.start_invalidation(events_tx.subscribe());

    let cluster = Cluster::new(config.redis.db);
    let _cluster_guard = cluster.start(store.clone(), events_tx.subscribe(), shutdown.clone());
    event!(Level::INFO, node_id = cluster.node_id(), "Node started");

    let mirror_scanner = Arc::new(MirrorScanner::new(
        store.clone(),
        config.repository_prefix.clone(),
        config.trace_file.clone(),
    ));
    let repository_scanner = Arc::new(RepositoryScanner::new(
        store.clone(),
        PathBuf::from(&config.repository),
        config.hashes.clone(),
    ));

    let initial_addr = config.listen_address.clone();
    let config_lock = Arc::new(RwLock::new(Arc::new(config)));
    let monitor = Monitor::new(
        store.clone(),
        cluster,
        mirror_scanner,
        repository_scanner,
        config_lock.clone(),
    );
    let _monitor_guards = monitor.start(refresh_rx, shutdown.clone());

    let service = RedirectorService::new(
        store,
        cache,
        config_lock.clone(),
        Arc::new(NoGeoResolver),
    );

    let (addr_tx, mut addr_rx) = tokio::sync::watch::channel(initial_addr);
    let terminate = CancellationToken::new();
    let _signal_guard = spawn_signal_handler(
        args.config.clone(),
        config_lock,
        addr_tx,
        shutdown.clone(),
        terminate.clone(),
    );

    // Serve until shutdown, rebinding when a reload moved the address.
    loop {
        let addr: SocketAddr = addr_rx
            .borrow_and_update()
            .parse()
            .map_err(|e| mirrorlink_error::make_err!(Code::InvalidArgument, "{e}"))
            .err_tip(|| "Invalid listen address")?;
        let listener_token = CancellationToken::new();
        let mut serve_task = mirrorlink_util::spawn(server::serve(
            service.clone(),
            addr,
            listener_token.clone(),
        ));
        tokio::select! {
            joined = &mut serve_task => {
                return match joined {
                    Ok(result) => result,
                    Err(e) => Err(mirrorlink_error::make_err!(Code::Internal, "Server task failed: {e}")),
                };
            }
            _ = shutdown.cancelled() => {
                listener_token.cancel();
                let _ = tokio::time::timeout(DRAIN_GRACE, serve_task).await;
                event!(Level::INFO, "Drained, exiting");
                return Ok(());
            }
            // SIGTERM skips the drain entirely; returning drops the pid
            // file and aborts every background guard on the way out.
            _ = terminate.cancelled() => {
                event!(Level::INFO, "Terminated, exiting immediately");
                return Ok(());
            }
            _ = addr_rx.changed() => {
                event!(Level::INFO, "Listen address changed, rebinding");
                listener_token.cancel();
                let _ = tokio::time::timeout(DRAIN_GRACE, serve_task).await;
            }
        }
    }
}

fn spawn_signal_handler(
    config_path: String,
    config_lock: Arc<RwLock<Arc<Config>>>,
    addr_tx: tokio::sync::watch::Sender<String>,
    shutdown: CancellationToken,
    terminate: CancellationToken,
) -> mirrorlink_util::task::JoinHandleDropGuard<()> {
    mirrorlink_util::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(e) => {
                event!(Level::ERROR, ?e, "Failed to install the SIGHUP handler");
                return;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                event!(Level::ERROR, ?e, "Failed to install the SIGTERM handler");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    event!(Level::INFO, "Interrupted, draining");
                    shutdown.cancel();
                    return;
                }
                _ = sigterm.recv() => {
                    // Immediate exit, no drain; only the pid file is
                    // cleaned up.
                    event!(Level::INFO, "Terminated");
                    terminate.cancel();
                    return;
                }
                _ = hangup.recv() => match Config::load(&config_path) {
                    Ok(new_config) => {
                        let listen_address = new_config.listen_address.clone();
                        *config_lock.write() = Arc::new(new_config);
                        // Only a changed address forces a listener rebind.
                        addr_tx.send_if_modified(|current| {
                            if *current == listen_address {
                                return false;
                            }
                            *current = listen_address;
                            true
                        });
                        event!(Level::INFO, "Configuration reloaded");
                    }
                    Err(e) => {
                        event!(Level::ERROR, ?e, "Reload failed, keeping the old configuration");
                    }
                },
            }
        }
    })
}

struct PidFile(Option<String>);

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Some(path) = self.0.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn write_pid_file(path: &str) -> PidFile {
    if path.is_empty() {
        return PidFile(None);
    }
    match std::fs::write(path, format!("{}\n", std::process::id())) {
        Ok(()) => PidFile(Some(path.to_string())),
        Err(e) => {
            event!(Level::WARN, ?e, path, "Could not write the pid file");
            PidFile(None)
        }
    }
}
