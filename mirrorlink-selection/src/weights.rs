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

use mirrorlink_config::SelectionConfig;
use mirrorlink_store::mirror::Mirror;
use mirrorlink_util::geo::ClientGeo;
use rand::Rng;

/// Scores every accepted mirror against the client. Higher is better;
/// mirrors scoring above `ceil(farthest)` later enter the weighted pool.
pub fn compute_scores(
    accepted: &mut [Mirror],
    client: &ClientGeo,
    closest: f32,
    farthest: f32,
    config: &SelectionConfig,
) {
    let base = f64::from(farthest).ceil();
    let closest = f64::from(closest);
    for mirror in accepted.iter_mut() {
        let distance = f64::from(mirror.distance);
        let mut score = base - distance + 1.0;
        if distance <= closest * f64::from(config.weight_distribution_range) {
            let mut bonus = base - distance;
            if !mirror.in_countries(&client.country_code) {
                bonus /= 2.0;
            }
            score += bonus;
        } else if !client.country_code.is_empty()
            && mirror.home_country() == Some(client.country_code.as_str())
        {
            score += base - distance * 5.0;
        } else if !client.country_code.is_empty()
            && mirror
                .country_codes
                .get(1..)
                .is_some_and(|rest| rest.iter().any(|c| c == &client.country_code))
        {
            score += base - closest;
        }
        if client.asn != 0 && client.asn == mirror.asnum {
            score += base / 2.0;
        }
        score += score * f64::from(mirror.score) / 100.0;
        mirror.computed_score = (score + 0.5).floor().max(1.0) as i64;
    }
}

pub fn base_score(farthest: f32) -> i64 {
    f64::from(farthest).ceil() as i64
}

fn pool_weight(mirror: &Mirror, base: i64) -> i64 {
    (mirror.computed_score - base).max(0)
}

/// Sum of the pooled weights; zero when nothing scored above base.
pub fn total_weight(accepted: &[Mirror], base: i64) -> i64 {
    accepted.iter().map(|m| pool_weight(m, base)).sum()
}

/// Annotates every pooled mirror with its share of the total, in place,
/// leaving the order untouched. Used for mirror-list responses.
pub fn annotate_weights(accepted: &mut [Mirror], base: i64) {
    let total = total_weight(accepted, base);
    if total == 0 {
        return;
    }
    for mirror in accepted.iter_mut() {
        let weight = pool_weight(mirror, base);
        if weight > 0 {
            mirror.weight_percent = 100.0 * weight as f32 / total as f32;
        }
    }
}

/// Draws the pooled mirrors one at a time without replacement, most
/// likely first. The annotated percentage is intentionally computed from
/// the *initial* total weight rather than the remaining one, matching
/// the numbers the legacy implementation produced.
pub fn draw_pool<R: Rng + ?Sized>(
    accepted: Vec<Mirror>,
    base: i64,
    rng: &mut R,
) -> (Vec<Mirror>, Vec<Mirror>) {
    let initial_total = total_weight(&accepted, base);
    let (mut pooled, rest): (Vec<Mirror>, Vec<Mirror>) =
        accepted.into_iter().partition(|m| pool_weight(m, base) > 0);

    let mut drawn = Vec::with_capacity(pooled.len());
    while !pooled.is_empty() {
        let remaining: i64 = pooled.iter().map(|m| pool_weight(m, base)).sum();
        let target = rng.gen_range(0..remaining);
        let mut cumulative = 0;
        let mut picked = pooled.len() - 1;
        for (index, mirror) in pooled.iter().enumerate() {
            cumulative += pool_weight(mirror, base);
            if target < cumulative {
                picked = index;
                break;
            }
        }
        let mut mirror = pooled.swap_remove(picked);
        mirror.weight_percent = 100.0 * pool_weight(&mirror, base) as f32 / initial_total as f32;
        drawn.push(mirror);
    }
    (drawn, rest)
}

#[cfg(test)]
mod weights_tests {
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
    fn scoring_matches_the_formula() {
        // Client in FR; M1 FR at 100km, M2 FR at 200km, M3 UK+DE at
        // 1000km sharing the client's AS.
        let mut accepted = vec![
            mirror(1, 100.0, &["FR"], 0),
            mirror(2, 200.0, &["FR"], 0),
            mirror(3, 1000.0, &["UK", "DE"], 64512),
        ];
        compute_scores(&mut accepted, &client_fr(64512), 100.0, 1000.0, &SelectionConfig::default());

        // M1: (1000-100+1) + in-range country bonus (1000-100) = 1801.
        assert_eq!(accepted[0].computed_score, 1801);
        // M2: (1000-200+1) + home-country term (1000-200*5 = 0) = 801.
        assert_eq!(accepted[1].computed_score, 801);
        // M3: (1000-1000+1) + AS bonus 500 = 501.
        assert_eq!(accepted[2].computed_score, 501);
    }

    #[test]
    fn score_bias_applies_as_a_percentage() {
        let mut boosted = vec![mirror(1, 100.0, &["FR"], 0)];
        boosted[0].score = 10;
        compute_scores(&mut boosted, &client_fr(0), 100.0, 1000.0, &SelectionConfig::default());
        // 1801 * 1.1 rounded.
        assert_eq!(boosted[0].computed_score, 1981);

        let mut dampened = vec![mirror(1, 100.0, &["FR"], 0)];
        dampened[0].score = -100;
        compute_scores(&mut dampened, &client_fr(0), 100.0, 1000.0, &SelectionConfig::default());
        // Fully dampened scores floor at 1.
        assert_eq!(dampened[0].computed_score, 1);
    }

    #[test]
    fn out_of_country_bonus_is_halved() {
        let mut accepted = vec![mirror(1, 100.0, &["DE"], 0)];
        compute_scores(&mut accepted, &client_fr(0), 100.0, 1000.0, &SelectionConfig::default());
        // (1000-100+1) + (1000-100)/2 = 1351.
        assert_eq!(accepted[0].computed_score, 1351);
    }

    #[test]
    fn annotated_weights_sum_to_one_hundred() {
        let mut accepted = vec![
            mirror(1, 100.0, &["FR"], 0),
            mirror(2, 120.0, &["FR"], 0),
            mirror(3, 140.0, &["FR"], 0),
        ];
        compute_scores(&mut accepted, &client_fr(0), 100.0, 1000.0, &SelectionConfig::default());
        let base = base_score(1000.0);
        annotate_weights(&mut accepted, base);
        let sum: f32 = accepted.iter().map(|m| m.weight_percent).sum();
        assert!((sum - 100.0).abs() < 1.0, "weights sum to {sum}");
    }

    #[test]
    fn draw_consumes_the_whole_pool_without_replacement() {
        let mut accepted = vec![
            mirror(1, 100.0, &["FR"], 0),
            mirror(2, 120.0, &["FR"], 0),
            mirror(3, 5000.0, &["AU"], 0),
        ];
        compute_scores(&mut accepted, &client_fr(0), 100.0, 5000.0, &SelectionConfig::default());
        let base = base_score(5000.0);
        let mut rng = StdRng::seed_from_u64(7);
        let (drawn, rest) = draw_pool(accepted, base, &mut rng);

        let drawn_ids: Vec<i32> = drawn.iter().map(|m| m.id).collect();
        assert_eq!(drawn.len(), 2);
        assert!(drawn_ids.contains(&1) && drawn_ids.contains(&2));
        assert!(drawn.iter().all(|m| m.weight_percent > 0.0));
        let sum: f32 = drawn.iter().map(|m| m.weight_percent).sum();
        assert!((sum - 100.0).abs() < 1.0, "weights sum to {sum}");
        // The far mirror never pooled.
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, 3);
        assert_eq!(rest[0].weight_percent, 0.0);
    }

    #[test]
    fn single_pooled_mirror_gets_the_full_weight() {
        let mut accepted = vec![mirror(1, 100.0, &["FR"], 0)];
        compute_scores(&mut accepted, &client_fr(0), 100.0, 1000.0, &SelectionConfig::default());
        let mut rng = StdRng::seed_from_u64(1);
        let (drawn, _) = draw_pool(accepted, base_score(1000.0), &mut rng);
        assert_eq!(drawn[0].weight_percent, 100.0);
    }

    #[test]
    fn closer_mirrors_win_the_draw_more_often() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut first_wins = 0;
        for _ in 0..1000 {
            let mut accepted = vec![
                mirror(1, 100.0, &["FR"], 0),
                mirror(2, 140.0, &["FR"], 0),
            ];
            compute_scores(&mut accepted, &client_fr(0), 100.0, 1000.0, &SelectionConfig::default());
            let (drawn, _) = draw_pool(accepted, base_score(1000.0), &mut rng);
            if drawn[0].id == 1 {
                first_wins += 1;
            }
        }
        // M1's weight is ~1.1x M2's; expect a win rate comfortably above
        // even but far from certain.
        assert!(first_wins > 480 && first_wins < 620, "wins = {first_wins}");
    }
}
