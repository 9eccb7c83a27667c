//! Unit conversion for wavemeter readings.
//!
//! The instrument reports every reading as a vacuum wavelength in nanometres.
//! Consumers choose per channel whether they want the vacuum wavelength, the
//! wavelength in standard air (both in metres) or the optical frequency in hertz.
//! Conversions run inside the notification path and are therefore pure arithmetic.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Speed of light in vacuum (m/s)
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Output unit of one stream channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelUnit {
    /// Wavelength in vacuum, metres
    #[default]
    VacuumWavelength,
    /// Wavelength in standard dry air, metres
    AirWavelength,
    /// Optical frequency, hertz
    Frequency,
}

impl ChannelUnit {
    /// SI symbol of the values produced by [`convert`](Self::convert).
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::VacuumWavelength | Self::AirWavelength => "m",
            Self::Frequency => "Hz",
        }
    }

    /// Convert a raw instrument reading (vacuum wavelength in nm).
    ///
    /// NaN and non-positive readings map to NaN.
    pub fn convert(&self, vacuum_nm: f64) -> f64 {
        if vacuum_nm.is_nan() || vacuum_nm <= 0.0 {
            return f64::NAN;
        }
        match self {
            Self::VacuumWavelength => vacuum_nm * 1e-9,
            Self::AirWavelength => vacuum_nm * 1e-9 / air_refractive_index(vacuum_nm),
            Self::Frequency => SPEED_OF_LIGHT / (vacuum_nm * 1e-9),
        }
    }
}

impl fmt::Display for ChannelUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VacuumWavelength => write!(f, "vacuum wavelength [m]"),
            Self::AirWavelength => write!(f, "air wavelength [m]"),
            Self::Frequency => write!(f, "frequency [Hz]"),
        }
    }
}

/// Refractive index of standard dry air (15 °C, 101 325 Pa, 450 ppm CO2).
///
/// Ciddor (1996) dispersion formula, valid from roughly 230 nm to 1700 nm.
pub fn air_refractive_index(vacuum_nm: f64) -> f64 {
    let sigma_sq = (1e3 / vacuum_nm).powi(2);
    1.0 + 0.057_921_05 / (238.0185 - sigma_sq) + 0.001_679_17 / (57.362 - sigma_sq)
}
