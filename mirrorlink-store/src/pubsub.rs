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

use futures::StreamExt;
use mirrorlink_error::{Error, ResultExt};
use mirrorlink_util::retry::ExponentialBackoff;
use mirrorlink_util::task::JoinHandleDropGuard;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};

use crate::keys::channels;

/// Catalog change notifications as consumed by every node. `Reconnected`
/// is synthesized locally after the subscriber re-established its
/// connection; events may have been missed while it was away.
#[derive(Clone, Debug, PartialEq)]
pub enum CatalogEvent {
    FileUpdate(String),
    MirrorUpdate(i32),
    MirrorFileUpdate { mirror_id: i32, path: String },
    ClusterAnnounce(String),
    Reconnected,
}

/// Decodes one raw pub/sub message. Unknown channels and malformed
/// payloads yield None; a subscriber must survive both.
pub fn parse_event(channel: &str, payload: &str) -> Option<CatalogEvent> {
    match channel {
        channels::FILE_UPDATE => Some(CatalogEvent::FileUpdate(payload.to_string())),
        channels::MIRROR_UPDATE => payload
            .parse::<i32>()
            .ok()
            .map(CatalogEvent::MirrorUpdate),
        channels::MIRROR_FILE_UPDATE => {
            let (id, path) = payload.split_once(' ')?;
            Some(CatalogEvent::MirrorFileUpdate {
                mirror_id: id.parse().ok()?,
                path: path.to_string(),
            })
        }
        channels::CLUSTER => Some(CatalogEvent::ClusterAnnounce(payload.to_string())),
        _ => None,
    }
}

/// Runs the node's single pub/sub subscription until shutdown. Every
/// decoded event is fanned out on `events`; `mirror_update` ids are
/// additionally republished on `mirror_refresh` so the health monitor can
/// serialize mirror refresh against cache invalidation.
pub fn start_listener(
    address: String,
    events: broadcast::Sender<CatalogEvent>,
    mirror_refresh: mpsc::Sender<i32>,
    shutdown: CancellationToken,
) -> JoinHandleDropGuard<()> {
    mirrorlink_util::spawn(async move {
        let mut ever_connected = false;
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(500), 0.5, 6);
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            match run_subscription(
                &address,
                &events,
                &mirror_refresh,
                &shutdown,
                ever_connected,
            )
            .await
            {
                Ok(()) => return,
                Err(e) => {
                    if !ever_connected {
                        // First failure; the schedule restarts from here.
                        backoff = ExponentialBackoff::new(Duration::from_millis(500), 0.5, 6);
                    }
                    ever_connected = true;
                    event!(Level::WARN, ?e, "Catalog pub/sub connection lost");
                }
            }
            let delay = backoff.next().unwrap_or(Duration::from_secs(30));
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    })
}

async fn run_subscription(
    address: &str,
    events: &broadcast::Sender<CatalogEvent>,
    mirror_refresh: &mpsc::Sender<i32>,
    shutdown: &CancellationToken,
    is_reconnect: bool,
) -> Result<(), Error> {
    let client = redis::Client::open(address)
        .map_err(Error::from)
        .err_tip(|| "Invalid pub/sub address")?;
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(Error::from)
        .err_tip(|| "While opening the pub/sub connection")?;
    for channel in [
        channels::CLUSTER,
        channels::FILE_UPDATE,
        channels::MIRROR_UPDATE,
        channels::MIRROR_FILE_UPDATE,
    ] {
        pubsub
            .subscribe(channel)
            .await
            .map_err(Error::from)
            .err_tip(|| format!("While subscribing to {channel}"))?;
    }
    if is_reconnect {
        // Caches must drop everything they hold; invalidations may have
        // been missed while disconnected.
        let _ = events.send(CatalogEvent::Reconnected);
    }
    let mut stream = pubsub.on_message();
    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            msg = stream.next() => msg,
        };
        let Some(msg) = msg else {
            return Err(mirrorlink_error::make_err!(
                mirrorlink_error::Code::Unavailable,
                "Pub/sub stream ended"
            ));
        };
        let channel = msg.get_channel_name().to_string();
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                event!(Level::WARN, ?e, channel = channel.as_str(), "Undecodable pub/sub payload");
                continue;
            }
        };
        let Some(decoded) = parse_event(&channel, &payload) else {
            continue;
        };
        if let CatalogEvent::MirrorUpdate(mirror_id) = &decoded {
            if mirror_refresh.send(*mirror_id).await.is_err() {
                // The monitor is gone; keep serving cache invalidations.
                event!(Level::DEBUG, mirror_id, "Mirror refresh consumer closed");
            }
        }
        let _ = events.send(decoded);
    }
}

#[cfg(test)]
mod pubsub_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn decodes_every_channel() {
        assert_eq!(
            parse_event("file_update", "/a/b.iso"),
            Some(CatalogEvent::FileUpdate("/a/b.iso".to_string()))
        );
        assert_eq!(
            parse_event("mirror_update", "42"),
            Some(CatalogEvent::MirrorUpdate(42))
        );
        assert_eq!(
            parse_event("mirror_file_update", "42 /a/b.iso"),
            Some(CatalogEvent::MirrorFileUpdate {
                mirror_id: 42,
                path: "/a/b.iso".to_string()
            })
        );
        assert_eq!(
            parse_event("cluster", "HELLO0 node-12345"),
            Some(CatalogEvent::ClusterAnnounce("HELLO0 node-12345".to_string()))
        );
    }

    #[test]
    fn malformed_payloads_are_dropped() {
        assert_eq!(parse_event("mirror_update", "not-a-number"), None);
        assert_eq!(parse_event("mirror_file_update", "42"), None);
        assert_eq!(parse_event("unknown_channel", "x"), None);
    }

    #[test]
    fn paths_with_spaces_keep_their_tail() {
        assert_eq!(
            parse_event("mirror_file_update", "7 /dir with space/file"),
            Some(CatalogEvent::MirrorFileUpdate {
                mirror_id: 7,
                path: "/dir with space/file".to_string()
            })
        );
    }
}
