//! Conversion between physical positions and device volts.
//!
//! Each axis carries an [`AxisCalibration`]: the allowed position window
//! `[min_position, max_position]` and the linear scale in physical units per
//! volt. The command voltage is measured from `min_position`:
//!
//! ```text
//! volts    = (position - min_position) / scale_per_volt
//! position = volts * scale_per_volt + min_position
//! ```
//!
//! All functions here are pure.

use serde::{Deserialize, Serialize};

use crate::error::{DaqError, Result};

/// Physical unit a calibration is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LengthUnit {
    /// Nanometers
    #[default]
    Nanometers,
    /// Micrometers
    Microns,
}

impl LengthUnit {
    /// Factor converting one unit of `self` into nanometers.
    pub fn nanometers_per_unit(self) -> f64 {
        match self {
            Self::Nanometers => 1.0,
            Self::Microns => 1_000.0,
        }
    }

    /// Convert a value expressed in `self` into `target` units.
    pub fn convert(self, value: f64, target: LengthUnit) -> f64 {
        value * self.nanometers_per_unit() / target.nanometers_per_unit()
    }

    /// Short unit label.
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Nanometers => "nm",
            Self::Microns => "um",
        }
    }
}

impl std::str::FromStr for LengthUnit {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "nm" | "nanometer" | "nanometers" => Ok(Self::Nanometers),
            "um" | "micron" | "microns" | "micrometer" | "micrometers" => Ok(Self::Microns),
            other => Err(DaqError::invalid_value(
                "units",
                format!("unknown length unit '{}'", other),
            )),
        }
    }
}

/// What to do with a position command outside the calibrated window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutOfRangePolicy {
    /// Fail with [`DaqError::PositionOutOfRange`]
    #[default]
    Reject,
    /// Saturate at the nearest limit
    Clamp,
}

/// Linear calibration for one axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisCalibration {
    /// Lowest allowed position (also the zero-volt position)
    pub min_position: f64,
    /// Highest allowed position
    pub max_position: f64,
    /// Physical units per volt
    pub scale_per_volt: f64,
}

impl std::str::FromStr for OutOfRangePolicy {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "clamp" => Ok(Self::Clamp),
            other => Err(DaqError::invalid_value(
                "out_of_range",
                format!("'{}' is neither 'reject' nor 'clamp'", other),
            )),
        }
    }
}

impl AxisCalibration {
    /// Build and validate a calibration.
    pub fn new(min_position: f64, max_position: f64, scale_per_volt: f64) -> Result<Self> {
        let cal = Self {
            min_position,
            max_position,
            scale_per_volt,
        };
        cal.validate()?;
        Ok(cal)
    }

    /// Check the calibration is usable.
    pub fn validate(&self) -> Result<()> {
        if !self.min_position.is_finite() || !self.max_position.is_finite() {
            return Err(DaqError::invalid_value(
                "min_position/max_position",
                "positions must be finite",
            ));
        }
        if self.min_position >= self.max_position {
            return Err(DaqError::conflict(format!(
                "min_position {} must be below max_position {}",
                self.min_position, self.max_position
            )));
        }
        if !self.scale_per_volt.is_finite() || self.scale_per_volt == 0.0 {
            return Err(DaqError::invalid_value(
                "scale_nm_per_volt",
                format!("{} is not a finite non-zero scale", self.scale_per_volt),
            ));
        }
        Ok(())
    }

    /// Whether `position` lies within the calibrated window.
    pub fn contains(&self, position: f64) -> bool {
        position >= self.min_position && position <= self.max_position
    }

    /// Position → volts, without range checks.
    pub fn position_to_volts(&self, position: f64) -> f64 {
        (position - self.min_position) / self.scale_per_volt
    }

    /// Volts → position, without range checks.
    pub fn volts_to_position(&self, volts: f64) -> f64 {
        volts * self.scale_per_volt + self.min_position
    }

    /// Apply `policy` to `position` for axis `axis`.
    pub fn admit(&self, axis: usize, position: f64, policy: OutOfRangePolicy) -> Result<f64> {
        if position.is_nan() {
            return Err(DaqError::invalid_value("position", "NaN is not a position"));
        }
        if self.contains(position) {
            return Ok(position);
        }
        match policy {
            OutOfRangePolicy::Reject => Err(DaqError::PositionOutOfRange {
                axis,
                position,
                min: self.min_position,
                max: self.max_position,
            }),
            OutOfRangePolicy::Clamp => Ok(position.clamp(self.min_position, self.max_position)),
        }
    }
}

/// Expand `values` to one entry per axis.
///
/// A single value is applied to every axis; otherwise the length must equal
/// `n_axes` exactly. Nothing is ever truncated.
pub fn broadcast(values: &[f64], n_axes: usize) -> Result<Vec<f64>> {
    match values.len() {
        1 => Ok(vec![values[0]; n_axes]),
        n if n == n_axes => Ok(values.to_vec()),
        n => Err(DaqError::ChannelCountMismatch {
            expected: n_axes,
            actual: n,
        }),
    }
}

/// Convert per-axis positions into volts.
pub fn positions_to_volts(
    calibration: &[AxisCalibration],
    positions: &[f64],
    policy: OutOfRangePolicy,
) -> Result<Vec<f64>> {
    let positions = broadcast(positions, calibration.len())?;
    calibration
        .iter()
        .zip(positions)
        .enumerate()
        .map(|(axis, (cal, p))| cal.admit(axis, p, policy).map(|p| cal.position_to_volts(p)))
        .collect()
}

/// Convert per-axis volts into positions.
pub fn volts_to_positions(calibration: &[AxisCalibration], volts: &[f64]) -> Result<Vec<f64>> {
    if volts.len() != calibration.len() {
        return Err(DaqError::ChannelCountMismatch {
            expected: calibration.len(),
            actual: volts.len(),
        });
    }
    Ok(calibration
        .iter()
        .zip(volts)
        .map(|(cal, &v)| cal.volts_to_position(v))
        .collect())
}
