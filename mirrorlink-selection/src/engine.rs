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

use mirrorlink_config::SelectionConfig;
use mirrorlink_error::{make_err, Code, Error, ResultExt};
use mirrorlink_store::cache::MetadataCache;
use mirrorlink_store::file_info::FileInfo;
use mirrorlink_store::mirror::Mirror;
use mirrorlink_store::redis_store::Connect;
use mirrorlink_util::geo::ClientGeo;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use redis::aio::ConnectionLike;

use crate::filter::{filter, SecureOption};
use crate::weights;

#[derive(Debug, Default)]
pub struct SelectionOutcome {
    pub file: FileInfo,
    pub candidates: Vec<Mirror>,
    pub excluded: Vec<Mirror>,
}

/// The selection pipeline: lookup, filter, rank, probabilistic pick.
/// Pure and re-entrant; every request gets a fresh outcome.
pub struct SelectionEngine<C: ConnectionLike + Connect + Clone + Send + Sync = redis::aio::ConnectionManager>
{
    cache: Arc<MetadataCache<C>>,
}

impl<C: ConnectionLike + Connect + Clone + Send + Sync + 'static> SelectionEngine<C> {
    pub fn new(cache: Arc<MetadataCache<C>>) -> Self {
        Self { cache }
    }

    pub async fn select(
        &self,
        config: &SelectionConfig,
        path: &str,
        client: &ClientGeo,
        secure: SecureOption,
        want_mirror_list: bool,
    ) -> Result<SelectionOutcome, Error> {
        let file = self
            .cache
            .get_file_info(path)
            .await
            .err_tip(|| "While looking up the requested file")?;
        if !file.is_complete() {
            if file.size == 0 && file.sha1.is_empty() && file.sha256.is_empty() && file.md5.is_empty()
            {
                return Err(make_err!(Code::NotFound, "File {path} is not indexed"));
            }
            // Known file without a mod-time is a catalog defect, not a
            // routine miss.
            return Err(make_err!(Code::Internal, "Invalid file info for {path}"));
        }
        let mirrors = self.cache.get_mirrors(path, client).await?;
        let outcome = filter(mirrors, &file, client, secure, config);
        let mut rng = StdRng::from_entropy();
        let candidates = order_candidates(
            outcome.accepted,
            client,
            outcome.closest,
            outcome.farthest,
            config,
            want_mirror_list,
            &mut rng,
        );
        Ok(SelectionOutcome {
            file,
            candidates,
            excluded: outcome.excluded,
        })
    }
}

/// Orders the accepted mirrors for the response. Without client
/// coordinates the order is a uniform shuffle; with them, scored ranking
/// plus the weighted draw. Exposed for deterministic testing with a
/// seeded generator.
pub fn order_candidates<R: Rng + ?Sized>(
    mut accepted: Vec<Mirror>,
    client: &ClientGeo,
    closest: f32,
    farthest: f32,
    config: &SelectionConfig,
    want_mirror_list: bool,
    rng: &mut R,
) -> Vec<Mirror> {
    if !client.has_location() {
        accepted.shuffle(rng);
        if !want_mirror_list {
            accepted.truncate(5);
        }
        return accepted;
    }

    weights::compute_scores(&mut accepted, client, closest, farthest, config);
    accepted.sort_by(|a, b| b.computed_score.cmp(&a.computed_score));
    let base = weights::base_score(farthest);

    if want_mirror_list {
        weights::annotate_weights(&mut accepted, base);
        return accepted;
    }

    let pool_len = accepted
        .iter()
        .filter(|m| m.computed_score > base)
        .count();
    let (mut result, rest) = weights::draw_pool(accepted, base, rng);
    result.extend(rest);
    let keep = if pool_len > 0 { pool_len.min(5) } else { 5 };
    result.truncate(keep);
    result
}

#[cfg(test)]
mod engine_tests {
    use pretty_assertions::assert_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn mirror(id: i32, distance: f32, countries: &[&str], asnum: u32) -> Mirror {
        Mirror {
            id,
            name: format!("m{id}"),
            distance,
            country_codes: countries.iter().map(|c| c.to_string()).collect(),
            asnum,
            enabled: true,
            http_up: true,
            ..Default::default()
        }
    }

    fn client_fr(asn: u32) -> ClientGeo {
        ClientGeo {
            country_code: "FR".to_string(),
            continent_code: "EU".to_string(),
            asn,
            latitude: 48.85,
            longitude: 2.35,
            ..Default::default()
        }
    }

    #[test]
    fn without_geo_the_order_is_shuffled_and_truncated() {
        let accepted: Vec<Mirror> = (1..=8).map(|id| mirror(id, 0.0, &["FR"], 0)).collect();
        let mut rng = StdRng::seed_from_u64(3);
        let picked = order_candidates(
            accepted.clone(),
            &ClientGeo::default(),
            0.0,
            0.0,
            &SelectionConfig::default(),
            false,
            &mut rng,
        );
        assert_eq!(picked.len(), 5);

        // A mirror list keeps every accepted mirror.
        let mut rng = StdRng::seed_from_u64(3);
        let listed = order_candidates(
            accepted,
            &ClientGeo::default(),
            0.0,
            0.0,
            &SelectionConfig::default(),
            true,
            &mut rng,
        );
        assert_eq!(listed.len(), 8);
    }

    #[test]
    fn ranked_selection_pools_and_annotates() {
        // Client in FR; M1 FR 100km, M2 FR 200km, M3 UK+DE 1000km with
        // the client's ASN.
        let accepted = vec![
            mirror(1, 100.0, &["FR"], 0),
            mirror(2, 200.0, &["FR"], 0),
            mirror(3, 1000.0, &["UK", "DE"], 64512),
        ];
        let mut rng = StdRng::seed_from_u64(11);
        let listed = order_candidates(
            accepted,
            &client_fr(64512),
            100.0,
            1000.0,
            &SelectionConfig::default(),
            true,
            &mut rng,
        );
        let scores: Vec<i64> = listed.iter().map(|m| m.computed_score).collect();
        assert_eq!(scores, vec![1801, 801, 501]);
        // Only M1 scored above base, so it holds the entire pool weight.
        assert_eq!(listed[0].id, 1);
        assert_eq!(listed[0].weight_percent, 100.0);
        assert_eq!(listed[1].weight_percent, 0.0);
    }

    #[test]
    fn redirect_mode_truncates_to_the_pool_size() {
        let accepted = vec![
            mirror(1, 100.0, &["FR"], 0),
            mirror(2, 200.0, &["FR"], 0),
            mirror(3, 1000.0, &["UK", "DE"], 64512),
        ];
        let mut rng = StdRng::seed_from_u64(11);
        let picked = order_candidates(
            accepted,
            &client_fr(64512),
            100.0,
            1000.0,
            &SelectionConfig::default(),
            false,
            &mut rng,
        );
        // One pooled mirror: the winner alone is returned.
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, 1);
        assert_eq!(picked[0].weight_percent, 100.0);
    }

    #[test]
    fn tight_cluster_near_the_client_pools_together() {
        // Three close mirrors inside the distribution range plus one far
        // mirror that stretches the scoring base.
        let accepted = vec![
            mirror(1, 100.0, &["FR"], 0),
            mirror(2, 110.0, &["FR"], 0),
            mirror(3, 130.0, &["FR"], 0),
            mirror(4, 1000.0, &["AU"], 0),
        ];
        let mut rng = StdRng::seed_from_u64(5);
        let picked = order_candidates(
            accepted,
            &client_fr(0),
            100.0,
            1000.0,
            &SelectionConfig::default(),
            false,
            &mut rng,
        );
        // Three pooled mirrors survive the min(5, |pool|) truncation; the
        // far mirror never pooled and is cut.
        assert_eq!(picked.len(), 3);
        assert!(picked.iter().all(|m| m.weight_percent > 0.0));
        assert!(picked.iter().all(|m| m.id != 4));
        let sum: f32 = picked.iter().map(|m| m.weight_percent).sum();
        assert!((sum - 100.0).abs() < 1.0, "weights sum to {sum}");
    }
}
