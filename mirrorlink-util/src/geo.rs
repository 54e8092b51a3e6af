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

use std::net::IpAddr;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// What we know about the requesting client. Produced by a [`GeoResolver`]
/// implementation; the resolver itself (GeoIP database loading) lives outside
/// the core.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClientGeo {
    pub ip: String,
    pub country_code: String,
    pub continent_code: String,
    pub asn: u32,
    pub latitude: f32,
    pub longitude: f32,
}

impl ClientGeo {
    /// True when the coordinates can be used for distance ranking.
    /// (0, 0) is the null island sentinel used by lookups that only
    /// resolved a country.
    pub fn has_location(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && !(self.latitude == 0.0 && self.longitude == 0.0)
    }
}

/// Contract the core consumes to map a client address to geography.
pub trait GeoResolver: Send + Sync {
    fn resolve(&self, ip: IpAddr) -> Option<ClientGeo>;
}

/// Resolver for deployments without a GeoIP database; every client gets
/// the shuffled, non-ranked selection path.
pub struct NoGeoResolver;

impl GeoResolver for NoGeoResolver {
    fn resolve(&self, _ip: IpAddr) -> Option<ClientGeo> {
        None
    }
}

/// Great-circle distance between two coordinates in kilometers.
pub fn distance_km(lat1: f32, lon1: f32, lat2: f32, lon2: f32) -> f32 {
    let (lat1, lon1) = (f64::from(lat1).to_radians(), f64::from(lon1).to_radians());
    let (lat2, lon2) = (f64::from(lat2).to_radians(), f64::from(lon2).to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    (EARTH_RADIUS_KM * c) as f32
}
