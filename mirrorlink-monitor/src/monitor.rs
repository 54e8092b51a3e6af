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

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mirrorlink_config::Config;
use mirrorlink_error::{Code, Error};
use mirrorlink_scanner::{MirrorScanner, RepositoryScanner};
use mirrorlink_store::mirror::ScanProtocol;
use mirrorlink_store::redis_store::{CatalogStore, Connect};
use mirrorlink_util::task::JoinHandleDropGuard;
use parking_lot::{Mutex, RwLock};
use redis::aio::ConnectionLike;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};

use crate::cluster::Cluster;
use crate::health::HealthChecker;

const DISPATCH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Default)]
struct MirrorState {
    last_check: Option<Instant>,
    last_sync: Option<Instant>,
    /// Set while a probe is queued or running, and kept set for a mirror
    /// that has never been scanned so it is not re-probed uselessly.
    checking: bool,
    scanning: bool,
}

/// Schedules health checks and scans for the mirrors this node owns.
/// One dispatcher tick per second feeds two bounded worker pools.
pub struct Monitor<C: ConnectionLike + Connect + Clone + Send + Sync = redis::aio::ConnectionManager>
{
    store: Arc<CatalogStore<C>>,
    cluster: Arc<Cluster>,
    health: Arc<HealthChecker<C>>,
    mirror_scanner: Arc<MirrorScanner<C>>,
    repository_scanner: Arc<RepositoryScanner<C>>,
    /// Shared snapshot; a reload changes the intervals for the next tick.
    config: Arc<RwLock<Arc<Config>>>,
    states: Arc<Mutex<HashMap<i32, MirrorState>>>,
}

impl<C: ConnectionLike + Connect + Clone + Send + Sync + 'static> Monitor<C> {
    pub fn new(
        store: Arc<CatalogStore<C>>,
        cluster: Arc<Cluster>,
        mirror_scanner: Arc<MirrorScanner<C>>,
        repository_scanner: Arc<RepositoryScanner<C>>,
        config: Arc<RwLock<Arc<Config>>>,
    ) -> Arc<Self> {
        let health = {
            let snapshot = config.read().clone();
            Arc::new(HealthChecker::new(store.clone(), &snapshot.monitor))
        };
        Arc::new(Self {
            store,
            cluster,
            health,
            mirror_scanner,
            repository_scanner,
            config,
            states: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Spawns the dispatcher, the worker pools, the repository scan loop
    /// and the serialized mirror-refresh consumer. The returned guards
    /// stop everything when dropped.
    pub fn start(
        self: &Arc<Self>,
        mirror_refresh: mpsc::Receiver<i32>,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandleDropGuard<()>> {
        let mut guards = Vec::new();
        // Worker counts are fixed at startup; only intervals follow a
        // reload.
        let snapshot = self.config.read().clone();

        let (health_tx, health_rx) =
            mpsc::channel::<i32>(snapshot.monitor.health_check_threads * 5);
        let health_rx = Arc::new(tokio::sync::Mutex::new(health_rx));
        for _ in 0..snapshot.monitor.health_check_threads {
            guards.push(self.clone().spawn_health_worker(health_rx.clone(), shutdown.clone()));
        }

        let (sync_tx, sync_rx) = mpsc::channel::<i32>(1);
        let sync_rx = Arc::new(tokio::sync::Mutex::new(sync_rx));
        for _ in 0..snapshot.monitor.concurrent_sync {
            guards.push(self.clone().spawn_sync_worker(sync_rx.clone(), shutdown.clone()));
        }

        guards.push(self.clone().spawn_dispatcher(health_tx, sync_tx, shutdown.clone()));
        guards.push(self.clone().spawn_repository_loop(shutdown.clone()));
        guards.push(self.clone().spawn_refresh_consumer(mirror_refresh, shutdown));
        guards
    }

    fn spawn_dispatcher(
        self: Arc<Self>,
        health_tx: mpsc::Sender<i32>,
        sync_tx: mpsc::Sender<i32>,
        shutdown: CancellationToken,
    ) -> JoinHandleDropGuard<()> {
        mirrorlink_util::spawn(async move {
            let mut ticker = tokio::time::interval(DISPATCH_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let ids = match self.store.mirror_ids().await {
                    Ok(ids) => ids,
                    Err(e) => {
                        event!(Level::DEBUG, ?e, "Mirror list unavailable");
                        continue;
                    }
                };
                self.states.lock().retain(|id, _| ids.contains(id));
                let (check_interval, scan_interval) = {
                    let snapshot = self.config.read();
                    (snapshot.monitor.check_interval, snapshot.monitor.scan_interval)
                };
                for mirror_id in &ids {
                    if !self.cluster.is_handled(*mirror_id, &ids) {
                        continue;
                    }
                    let (check_due, sync_due) = {
                        let mut states = self.states.lock();
                        let state = states.entry(*mirror_id).or_default();
                        (
                            !state.checking && is_due(state.last_check, check_interval),
                            !state.scanning && is_due(state.last_sync, scan_interval),
                        )
                    };
                    if check_due && health_tx.try_send(*mirror_id).is_ok() {
                        if let Some(state) = self.states.lock().get_mut(mirror_id) {
                            state.checking = true;
                        }
                    }
                    if sync_due && sync_tx.try_send(*mirror_id).is_ok() {
                        if let Some(state) = self.states.lock().get_mut(mirror_id) {
                            state.scanning = true;
                        }
                    }
                }
            }
        })
    }

    fn spawn_health_worker(
        self: Arc<Self>,
        queue: Arc<tokio::sync::Mutex<mpsc::Receiver<i32>>>,
        shutdown: CancellationToken,
    ) -> JoinHandleDropGuard<()> {
        mirrorlink_util::spawn(async move {
            loop {
                let mirror_id = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    received = async { queue.lock().await.recv().await } => match received {
                        Some(mirror_id) => mirror_id,
                        None => return,
                    },
                };
                let result = self.health.check(mirror_id).await;
                let mut states = self.states.lock();
                let state = states.entry(mirror_id).or_default();
                state.last_check = Some(Instant::now());
                apply_check_result(state, &result);
                drop(states);
                if let Err(e) = result {
                    if e.code == Code::FailedPrecondition {
                        event!(Level::DEBUG, mirror_id, "Mirror parked until first scan");
                    } else {
                        event!(Level::WARN, mirror_id, ?e, "Health check failed");
                    }
                }
            }
        })
    }

    fn spawn_sync_worker(
        self: Arc<Self>,
        queue: Arc<tokio::sync::Mutex<mpsc::Receiver<i32>>>,
        shutdown: CancellationToken,
    ) -> JoinHandleDropGuard<()> {
        mirrorlink_util::spawn(async move {
            loop {
                let mirror_id = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    received = async { queue.lock().await.recv().await } => match received {
                        Some(mirror_id) => mirror_id,
                        None => return,
                    },
                };
                let succeeded = self.scan_mirror(mirror_id, &shutdown).await;
                let mut states = self.states.lock();
                let state = states.entry(mirror_id).or_default();
                state.scanning = false;
                state.last_sync = Some(Instant::now());
                if succeeded {
                    // A fresh inventory unparks the health checks.
                    state.checking = false;
                }
            }
        })
    }

    /// Rsync first when the mirror offers it, FTP as fallback unless the
    /// attempt was cancelled.
    async fn scan_mirror(&self, mirror_id: i32, shutdown: &CancellationToken) -> bool {
        let mirror = match self.store.get_mirror(mirror_id).await {
            Ok(Some(mirror)) => mirror,
            Ok(None) => return false,
            Err(e) => {
                event!(Level::WARN, mirror_id, ?e, "Mirror unavailable for scan");
                return false;
            }
        };
        if !mirror.enabled {
            return false;
        }
        let mut attempts: Vec<(ScanProtocol, &str)> = Vec::new();
        if !mirror.rsync_url.is_empty() {
            attempts.push((ScanProtocol::Rsync, mirror.rsync_url.as_str()));
        }
        if !mirror.ftp_url.is_empty() {
            attempts.push((ScanProtocol::Ftp, mirror.ftp_url.as_str()));
        }
        if attempts.is_empty() {
            event!(Level::WARN, mirror_id, "Mirror has no scannable URL");
            return false;
        }
        for (protocol, url) in attempts {
            match self
                .mirror_scanner
                .scan(protocol, url, mirror_id, shutdown)
                .await
            {
                Ok(_) => return true,
                Err(e) if e.code == Code::Aborted => return false,
                Err(e) if e.code == Code::AlreadyExists => {
                    event!(Level::DEBUG, mirror_id, "Scan already running elsewhere");
                    return false;
                }
                Err(e) => {
                    event!(Level::WARN, mirror_id, ?protocol, ?e, "Scan attempt failed");
                }
            }
        }
        false
    }

    fn spawn_repository_loop(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandleDropGuard<()> {
        mirrorlink_util::spawn(async move {
            loop {
                let interval = self.config.read().monitor.repository_scan_interval;
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                match self.repository_scanner.scan(&shutdown).await {
                    Ok(_) => {}
                    Err(e) if e.code == Code::AlreadyExists || e.code == Code::Aborted => {}
                    Err(e) => event!(Level::WARN, ?e, "Repository scan failed"),
                }
            }
        })
    }

    /// Single consumer of the dedicated `mirror_update` republish channel
    /// so mirror refresh is serialized against cache invalidation.
    fn spawn_refresh_consumer(
        self: Arc<Self>,
        mut mirror_refresh: mpsc::Receiver<i32>,
        shutdown: CancellationToken,
    ) -> JoinHandleDropGuard<()> {
        mirrorlink_util::spawn(async move {
            loop {
                let mirror_id = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    received = mirror_refresh.recv() => match received {
                        Some(mirror_id) => mirror_id,
                        None => return,
                    },
                };
                match self.store.get_mirror(mirror_id).await {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        self.states.lock().remove(&mirror_id);
                    }
                    Err(e) => event!(Level::DEBUG, mirror_id, ?e, "Mirror refresh failed"),
                }
            }
        })
    }
}

fn is_due(last: Option<Instant>, interval: Duration) -> bool {
    match last {
        None => true,
        Some(last) => last.elapsed() >= interval,
    }
}

/// A mirror that has never been scanned keeps its `checking` flag so the
/// dispatcher will not enqueue it again until a scan succeeds.
fn apply_check_result(state: &mut MirrorState, result: &Result<(), Error>) {
    match result {
        Err(e) if e.code == Code::FailedPrecondition => {}
        _ => state.checking = false,
    }
}

#[cfg(test)]
mod monitor_tests {
    use mirrorlink_error::make_err;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn fresh_mirrors_are_immediately_due() {
        assert!(is_due(None, Duration::from_secs(60)));
        assert!(!is_due(Some(Instant::now()), Duration::from_secs(60)));
    }

    #[test]
    fn unscanned_mirror_stays_parked() {
        let mut state = MirrorState {
            checking: true,
            ..Default::default()
        };
        apply_check_result(
            &mut state,
            &Err(make_err!(Code::FailedPrecondition, "not scanned")),
        );
        assert!(state.checking);

        apply_check_result(&mut state, &Ok(()));
        assert!(!state.checking);

        state.checking = true;
        apply_check_result(&mut state, &Err(make_err!(Code::Unavailable, "store down")));
        assert_eq!(state.checking, false);
    }
}
