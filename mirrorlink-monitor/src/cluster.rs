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
use std::time::{Duration, Instant};

use mirrorlink_store::keys::channels;
use mirrorlink_store::pubsub::CatalogEvent;
use mirrorlink_store::redis_store::{CatalogStore, Connect};
use mirrorlink_util::task::JoinHandleDropGuard;
use parking_lot::RwLock;
use rand::Rng;
use redis::aio::ConnectionLike;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};

const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1);
const NODE_TIMEOUT: Duration = Duration::from_secs(5);

struct Node {
    id: String,
    last_announce: Instant,
}

/// Tracks which mirrorlink nodes are alive and deterministically shards
/// mirror ownership across them so background work runs on exactly one
/// node per mirror without distributed locks on the hot path.
pub struct Cluster {
    node_id: String,
    db_index: i64,
    nodes: RwLock<Vec<Node>>,
}

impl Cluster {
    pub fn new(db_index: i64) -> Arc<Self> {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        let suffix: u32 = rand::thread_rng().gen_range(10000..100000);
        Arc::new(Self {
            node_id: format!("{host}-{suffix}"),
            db_index,
            nodes: RwLock::new(Vec::new()),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Starts the 1 Hz announcer and the announcement consumer.
    pub fn start<C>(
        self: &Arc<Self>,
        store: Arc<CatalogStore<C>>,
        mut events: broadcast::Receiver<CatalogEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandleDropGuard<()>
    where
        C: ConnectionLike + Connect + Clone + Send + Sync + 'static,
    {
        let cluster = self.clone();
        mirrorlink_util::spawn(async move {
            let payload = format!("HELLO{} {}", cluster.db_index, cluster.node_id);
            let mut ticker = tokio::time::interval(ANNOUNCE_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = store.publish(channels::CLUSTER, &payload).await {
                            event!(Level::DEBUG, ?e, "Cluster announce failed");
                        }
                        cluster.evict_stale();
                    }
                    received = events.recv() => match received {
                        Ok(CatalogEvent::ClusterAnnounce(announce)) => {
                            cluster.on_announce(&announce);
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                }
            }
        })
    }

    /// Handles one `cluster` message. Announcements carrying a different
    /// store index belong to another cluster and are ignored.
    pub fn on_announce(&self, payload: &str) {
        let Some((tag, node_id)) = payload.split_once(' ') else {
            return;
        };
        let Some(db) = tag.strip_prefix("HELLO") else {
            return;
        };
        if db.parse::<i64>() != Ok(self.db_index) {
            return;
        }
        let mut nodes = self.nodes.write();
        match nodes.iter_mut().find(|n| n.id == node_id) {
            Some(node) => node.last_announce = Instant::now(),
            None => {
                event!(Level::INFO, node_id, "Node joined the cluster");
                nodes.push(Node {
                    id: node_id.to_string(),
                    last_announce: Instant::now(),
                });
                nodes.sort_by(|a, b| a.id.cmp(&b.id));
            }
        }
    }

    pub fn evict_stale(&self) {
        let mut nodes = self.nodes.write();
        nodes.retain(|node| {
            let alive = node.last_announce.elapsed() < NODE_TIMEOUT;
            if !alive {
                event!(Level::INFO, node_id = node.id.as_str(), "Node left the cluster");
            }
            alive
        });
    }

    pub fn alive_node_count(&self) -> usize {
        self.nodes.read().len()
    }

    /// True when this node owns the given mirror under the current
    /// partition. A node that has not yet heard its own announcement
    /// treats itself as alone and owns everything.
    pub fn is_handled(&self, mirror_id: i32, sorted_mirror_ids: &[i32]) -> bool {
        let Some(position) = sorted_mirror_ids.iter().position(|id| *id == mirror_id) else {
            return false;
        };
        let nodes = self.nodes.read();
        let Some(node_index) = nodes.iter().position(|n| n.id == self.node_id) else {
            return true;
        };
        let (start, end) = owned_range(node_index, nodes.len(), sorted_mirror_ids.len());
        position >= start && position < end
    }
}

/// The contiguous index range of mirrors node `node_index` owns when
/// `node_count` nodes share `mirror_count` mirrors. The last node absorbs
/// the remainder.
pub fn owned_range(node_index: usize, node_count: usize, mirror_count: usize) -> (usize, usize) {
    if node_count == 0 {
        return (0, mirror_count);
    }
    let per_node = mirror_count / node_count;
    let start = node_index * per_node;
    let end = if node_index + 1 == node_count {
        mirror_count
    } else {
        start + per_node
    };
    (start, end)
}
