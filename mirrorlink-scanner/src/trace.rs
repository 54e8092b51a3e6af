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

//! Clock-offset probe. Some mirrors (FTP in particular) report file times
//! shifted by whole hours. Comparing the mirror's reported mod-time of a
//! designated trace file against the authoritative one yields the offset,
//! which the selection filter can compensate for.

use mirrorlink_store::redis_store::{CatalogStore, Connect};
use redis::aio::ConnectionLike;
use tracing::{event, Level};

pub struct TraceProbe {
    /// Offset rounded to whole hours, in milliseconds.
    pub tz_offset_ms: i64,
    /// The trace file's mod-time as seen on the mirror, unix seconds.
    pub mirror_mod_time: i64,
}

/// Returns None when either side lacks a usable trace record; a mirror
/// without the trace file simply keeps its previous offset.
pub async fn probe<C: ConnectionLike + Connect + Clone + Send + Sync>(
    store: &CatalogStore<C>,
    mirror_id: i32,
    trace_file: &str,
) -> Option<TraceProbe> {
    let path = if trace_file.starts_with('/') {
        trace_file.to_string()
    } else {
        format!("/{trace_file}")
    };
    let source = match store.get_file_info(&path).await {
        Ok(info) => info,
        Err(e) => {
            event!(Level::DEBUG, mirror_id, ?e, "Trace probe skipped");
            return None;
        }
    };
    let at_mirror = match store.get_file_info_at_mirror(mirror_id, &path).await {
        Ok(Some(info)) => info,
        Ok(None) => return None,
        Err(e) => {
            event!(Level::DEBUG, mirror_id, ?e, "Trace probe skipped");
            return None;
        }
    };
    let source_secs = source.mod_time_unix();
    let mirror_secs = at_mirror.mod_time_unix();
    if source_secs == 0 || mirror_secs == 0 {
        return None;
    }
    Some(TraceProbe {
        tz_offset_ms: offset_ms(source_secs, mirror_secs),
        mirror_mod_time: mirror_secs,
    })
}

/// Rounds the observed difference to the nearest whole hour; anything
/// else is sync lag, not a clock offset.
pub fn offset_ms(source_secs: i64, mirror_secs: i64) -> i64 {
    let diff = mirror_secs - source_secs;
    let hours = (diff as f64 / 3600.0).round() as i64;
    hours * 3600 * 1000
}

#[cfg(test)]
mod trace_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn rounds_to_whole_hours() {
        assert_eq!(offset_ms(1_700_000_000, 1_700_000_000), 0);
        // 1h02m ahead rounds to one hour.
        assert_eq!(offset_ms(1_700_000_000, 1_700_003_720), 3_600_000);
        // 2h behind.
        assert_eq!(offset_ms(1_700_000_000, 1_700_000_000 - 7200), -7_200_000);
        // 20 minutes of sync lag is no offset at all.
        assert_eq!(offset_ms(1_700_000_000, 1_700_000_000 - 1200), 0);
    }
}
