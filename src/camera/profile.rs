//! Sensor profiles.
//!
//! A profile is pure data. The capture adapter takes one by reference and
//! behaves identically for every model apart from these constants.

use serde::Serialize;
use std::fmt;

/// Colour filter array layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BayerPattern {
    /// Blue-green / green-red
    Bggr,
    /// Red-green / green-blue
    Rggb,
    /// Green-blue / red-green
    Gbrg,
    /// Green-red / blue-green
    Grbg,
    /// No filter (monochrome)
    Mono,
}

impl fmt::Display for BayerPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BayerPattern::Bggr => "BGGR",
            BayerPattern::Rggb => "RGGB",
            BayerPattern::Gbrg => "GBRG",
            BayerPattern::Grbg => "GRBG",
            BayerPattern::Mono => "MONO",
        };
        f.write_str(s)
    }
}

/// Static capabilities of a supported sensor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraProfile {
    /// Profile key used in configuration
    pub name: &'static str,
    /// Full sensor width in pixels
    pub width: u32,
    /// Full sensor height in pixels
    pub height: u32,
    /// Pixel pitch in micrometres
    pub pixel_size_um: f64,
    /// Minimum analogue gain
    pub min_gain: i64,
    /// Maximum analogue gain
    pub max_gain: i64,
    /// Shortest exposure in seconds
    pub min_exposure: f64,
    /// Longest exposure in seconds
    pub max_exposure: f64,
    /// Colour filter layout
    pub cfa: BayerPattern,
    /// Raw bit depth
    pub bit_depth: u8,
}

impl CameraProfile {
    /// Clamp a requested gain into the sensor's range.
    pub fn clamp_gain(&self, gain: i64) -> i64 {
        gain.clamp(self.min_gain, self.max_gain)
    }

    /// Clamp a requested exposure into the sensor's range.
    pub fn clamp_exposure(&self, exposure: f64) -> f64 {
        exposure.clamp(self.min_exposure, self.max_exposure)
    }
}

static PROFILES: &[CameraProfile] = &[
    CameraProfile {
        name: "imx477",
        width: 4056,
        height: 3040,
        pixel_size_um: 1.55,
        min_gain: 1,
        max_gain: 16,
        min_exposure: 0.001,
        max_exposure: 200.0,
        cfa: BayerPattern::Bggr,
        bit_depth: 16,
    },
    CameraProfile {
        name: "imx378",
        width: 4056,
        height: 3040,
        pixel_size_um: 1.55,
        min_gain: 1,
        max_gain: 22,
        min_exposure: 0.001,
        max_exposure: 200.0,
        cfa: BayerPattern::Bggr,
        bit_depth: 16,
    },
    CameraProfile {
        name: "imx219",
        width: 3280,
        height: 2464,
        pixel_size_um: 1.12,
        min_gain: 1,
        max_gain: 16,
        min_exposure: 0.001,
        max_exposure: 11.76,
        cfa: BayerPattern::Bggr,
        bit_depth: 16,
    },
    CameraProfile {
        name: "imx708",
        width: 4608,
        height: 2592,
        pixel_size_um: 1.4,
        min_gain: 1,
        max_gain: 16,
        min_exposure: 0.001,
        max_exposure: 112.0,
        cfa: BayerPattern::Bggr,
        bit_depth: 16,
    },
    CameraProfile {
        name: "imx290",
        width: 1920,
        height: 1080,
        pixel_size_um: 2.9,
        min_gain: 1,
        max_gain: 32,
        min_exposure: 0.001,
        max_exposure: 200.0,
        cfa: BayerPattern::Rggb,
        bit_depth: 16,
    },
];

/// Look up a profile by configuration key.
pub fn lookup(name: &str) -> Option<&'static CameraProfile> {
    PROFILES.iter().find(|p| p.name.eq_ignore_ascii_case(name))
}

/// Every known profile key.
pub fn names() -> Vec<&'static str> {
    PROFILES.iter().map(|p| p.name).collect()
}

/// All profiles.
pub fn all() -> &'static [CameraProfile] {
    PROFILES
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_imx477() {
        let p = lookup("imx477").unwrap();
        assert_eq!((p.width, p.height), (4056, 3040));
        assert_eq!(p.cfa, BayerPattern::Bggr);
        assert_eq!(p.max_exposure, 200.0);
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        assert!(lookup("IMX477").is_some());
        assert!(lookup("nope").is_none());
    }

    #[test]
    fn test_clamp_gain() {
        let p = lookup("imx477").unwrap();
        assert_eq!(p.clamp_gain(100), 16);
        assert_eq!(p.clamp_gain(0), 1);
        assert_eq!(p.clamp_gain(8), 8);
    }

    #[test]
    fn test_profile_names_unique() {
        let mut names = names();
        let len = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), len);
    }
}
