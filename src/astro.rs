//! Solar position for night/day determination.
//!
//! Uses the NOAA solar calculator approximation, good to a fraction of a
//! degree for current epochs. Refraction is ignored.

use chrono::{DateTime, Timelike, Utc};

use crate::config::LocationConfig;

/// Unix epoch as a Julian day.
const JD_UNIX_EPOCH: f64 = 2_440_587.5;
/// J2000.0 as a Julian day.
const JD_J2000: f64 = 2_451_545.0;

/// Sun altitude above the horizon in degrees.
pub fn solar_altitude_deg(at: DateTime<Utc>, latitude: f64, longitude: f64) -> f64 {
    let jd = at.timestamp() as f64 / 86_400.0 + JD_UNIX_EPOCH;
    let jc = (jd - JD_J2000) / 36_525.0;

    let mean_long = (280.46646 + jc * (36_000.76983 + jc * 0.000_303_2)).rem_euclid(360.0);
    let mean_anom = 357.52911 + jc * (35_999.05029 - 0.000_153_7 * jc);
    let ecc = 0.016_708_634 - jc * (0.000_042_037 + 0.000_000_126_7 * jc);

    let m = mean_anom.to_radians();
    let eq_ctr = m.sin() * (1.914_602 - jc * (0.004_817 + 0.000_014 * jc))
        + (2.0 * m).sin() * (0.019_993 - 0.000_101 * jc)
        + (3.0 * m).sin() * 0.000_289;

    let omega = (125.04 - 1934.136 * jc).to_radians();
    let app_long = (mean_long + eq_ctr - 0.00569 - 0.00478 * omega.sin()).to_radians();

    let mean_obliq =
        23.0 + (26.0 + (21.448 - jc * (46.815 + jc * (0.00059 - jc * 0.001_813))) / 60.0) / 60.0;
    let obliq = (mean_obliq + 0.00256 * omega.cos()).to_radians();

    let declination = (obliq.sin() * app_long.sin()).asin();

    let var_y = (obliq / 2.0).tan().powi(2);
    let l0 = mean_long.to_radians();
    let eq_time_min = 4.0
        * (var_y * (2.0 * l0).sin() - 2.0 * ecc * m.sin()
            + 4.0 * ecc * var_y * m.sin() * (2.0 * l0).cos()
            - 0.5 * var_y * var_y * (4.0 * l0).sin()
            - 1.25 * ecc * ecc * (2.0 * m).sin())
        .to_degrees();

    let minutes = f64::from(at.hour()) * 60.0
        + f64::from(at.minute())
        + f64::from(at.second()) / 60.0;
    let true_solar_min = (minutes + eq_time_min + 4.0 * longitude).rem_euclid(1440.0);
    let hour_angle = (true_solar_min / 4.0 - 180.0).to_radians();

    let lat = latitude.to_radians();
    let cos_zenith =
        lat.sin() * declination.sin() + lat.cos() * declination.cos() * hour_angle.cos();
    90.0 - cos_zenith.clamp(-1.0, 1.0).acos().to_degrees()
}

/// Decides night mode from the site's sun altitude.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NightDetector {
    latitude: f64,
    longitude: f64,
    night_sun_alt_deg: f64,
}

impl NightDetector {
    /// Detector for the configured site.
    pub fn from_config(location: &LocationConfig) -> Self {
        Self {
            latitude: location.latitude,
            longitude: location.longitude,
            night_sun_alt_deg: location.night_sun_alt_deg,
        }
    }

    /// True when the sun is below the night threshold.
    pub fn is_night(&self, at: DateTime<Utc>) -> bool {
        solar_altitude_deg(at, self.latitude, self.longitude) < self.night_sun_alt_deg
    }
}
