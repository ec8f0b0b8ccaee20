//! Ellipsoidal geodesy on WGS84: Vincenty's inverse solution plus UTM zone
//! selection.

use crate::types::LonLat;

/// WGS84 semi-major axis (meters)
pub const WGS84_A: f64 = 6_378_137.0;
/// WGS84 flattening
pub const WGS84_F: f64 = 1.0 / 298.257_223_563;
/// WGS84 semi-minor axis (meters)
pub const WGS84_B: f64 = 6_356_752.314_245;

const MAX_ITERATIONS: usize = 200;
const CONVERGENCE_THRESHOLD: f64 = 1e-12;

/// Solution of the inverse geodesic problem
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeodesicInverse {
    /// Ellipsoidal distance in meters
    pub distance_m: f64,
    /// Forward azimuth at the first point, degrees clockwise from north in [0, 360)
    pub initial_bearing_deg: f64,
    /// Forward azimuth at the second point, degrees in [0, 360)
    pub final_bearing_deg: f64,
}

fn normalize_bearing(radians: f64) -> f64 {
    let degrees = radians.to_degrees();
    if degrees < 0.0 {
        degrees + 360.0
    } else {
        degrees
    }
}

/// Vincenty inverse: distance and bearings between two lon/lat points.
///
/// Returns `None` when the iteration fails to converge (nearly antipodal points).
pub fn vincenty_inverse(from: LonLat, to: LonLat) -> Option<GeodesicInverse> {
    if from == to {
        return Some(GeodesicInverse {
            distance_m: 0.0,
            initial_bearing_deg: 0.0,
            final_bearing_deg: 0.0,
        });
    }

    let f = WGS84_F;
    let u1 = ((1.0 - f) * from[1].to_radians().tan()).atan();
    let u2 = ((1.0 - f) * to[1].to_radians().tan()).atan();
    let l = (to[0] - from[0]).to_radians();
    let (sin_u1, cos_u1) = u1.sin_cos();
    let (sin_u2, cos_u2) = u2.sin_cos();

    let mut lambda = l;
    let mut converged = false;
    let (mut sin_sigma, mut cos_sigma, mut sigma) = (0.0, 0.0, 0.0);
    let (mut cos_sq_alpha, mut cos_2sigma_m) = (0.0, 0.0);

    for _ in 0..MAX_ITERATIONS {
        let (sin_lambda, cos_lambda) = lambda.sin_cos();
        sin_sigma = ((cos_u2 * sin_lambda).powi(2)
            + (cos_u1 * sin_u2 - sin_u1 * cos_u2 * cos_lambda).powi(2))
        .sqrt();
        if sin_sigma == 0.0 {
            return Some(GeodesicInverse {
                distance_m: 0.0,
                initial_bearing_deg: 0.0,
                final_bearing_deg: 0.0,
            });
        }
        cos_sigma = sin_u1 * sin_u2 + cos_u1 * cos_u2 * cos_lambda;
        sigma = sin_sigma.atan2(cos_sigma);
        let sin_alpha = cos_u1 * cos_u2 * sin_lambda / sin_sigma;
        cos_sq_alpha = 1.0 - sin_alpha * sin_alpha;
        // equatorial line
        cos_2sigma_m = if cos_sq_alpha != 0.0 {
            cos_sigma - 2.0 * sin_u1 * sin_u2 / cos_sq_alpha
        } else {
            0.0
        };
        let c = f / 16.0 * cos_sq_alpha * (4.0 + f * (4.0 - 3.0 * cos_sq_alpha));
        let lambda_prev = lambda;
        lambda = l
            + (1.0 - c)
                * f
                * sin_alpha
                * (sigma
                    + c * sin_sigma
                        * (cos_2sigma_m + c * cos_sigma * (-1.0 + 2.0 * cos_2sigma_m.powi(2))));
        if (lambda - lambda_prev).abs() < CONVERGENCE_THRESHOLD {
            converged = true;
            break;
        }
    }

    if !converged {
        log::debug!("Vincenty inverse failed to converge for {:?} -> {:?}", from, to);
        return None;
    }

    let a2 = WGS84_A * WGS84_A;
    let b2 = WGS84_B * WGS84_B;
    let u_sq = cos_sq_alpha * (a2 - b2) / b2;
    let big_a = 1.0 + u_sq / 16384.0 * (4096.0 + u_sq * (-768.0 + u_sq * (320.0 - 175.0 * u_sq)));
    let big_b = u_sq / 1024.0 * (256.0 + u_sq * (-128.0 + u_sq * (74.0 - 47.0 * u_sq)));
    let delta_sigma = big_b
        * sin_sigma
        * (cos_2sigma_m
            + big_b / 4.0
                * (cos_sigma * (-1.0 + 2.0 * cos_2sigma_m.powi(2))
                    - big_b / 6.0
                        * cos_2sigma_m
                        * (-3.0 + 4.0 * sin_sigma.powi(2))
                        * (-3.0 + 4.0 * cos_2sigma_m.powi(2))));
    let distance_m = WGS84_B * big_a * (sigma - delta_sigma);

    let (sin_lambda, cos_lambda) = lambda.sin_cos();
    let alpha1 = (cos_u2 * sin_lambda).atan2(cos_u1 * sin_u2 - sin_u1 * cos_u2 * cos_lambda);
    let alpha2 = (cos_u1 * sin_lambda).atan2(-sin_u1 * cos_u2 + cos_u1 * sin_u2 * cos_lambda);

    Some(GeodesicInverse {
        distance_m,
        initial_bearing_deg: normalize_bearing(alpha1),
        final_bearing_deg: normalize_bearing(alpha2),
    })
}

/// UTM zone number for a lat/lon location, honoring the Norway and
/// Svalbard exceptions.
pub fn utm_zone(lat: f64, lon: f64) -> u8 {
    let mut zone = (((lon + 180.0) / 6.0).floor() as i32 + 1).clamp(1, 60) as u8;

    if (56.0..64.0).contains(&lat) && (3.0..12.0).contains(&lon) {
        zone = 32;
    } else if (72.0..84.0).contains(&lat) {
        if (0.0..9.0).contains(&lon) {
            zone = 31;
        } else if (9.0..21.0).contains(&lon) {
            zone = 33;
        } else if (21.0..33.0).contains(&lon) {
            zone = 35;
        } else if (33.0..42.0).contains(&lon) {
            zone = 37;
        }
    }

    zone
}
