//! Engineering units used by measurement scripts and device readings.
//!
//! Every unit belongs to a [`Dimension`] and carries a scale factor to the SI base
//! unit of that dimension. Conversion is only defined within one dimension.
//!
//! ```
//! use pulse_daq::units::{convert, Unit};
//!
//! let us = convert(2.5, Unit::Millisecond, Unit::Microsecond).unwrap();
//! assert!((us - 2500.0).abs() < 1e-9);
//! assert!(convert(1.0, Unit::Volt, Unit::Second).is_err());
//! ```

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Physical dimension of a unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Time,
    Frequency,
    Voltage,
    /// Logarithmic power level. Only identity conversion is defined.
    PowerLevel,
    Counts,
    Dimensionless,
}

/// Supported engineering units.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Unit {
    Picosecond,
    Nanosecond,
    Microsecond,
    Millisecond,
    Second,
    Hertz,
    Kilohertz,
    Megahertz,
    Gigahertz,
    Millivolt,
    Volt,
    DecibelMilliwatt,
    Counts,
    Dimensionless,
}

const ALL_UNITS: [Unit; 14] = [
    Unit::Picosecond,
    Unit::Nanosecond,
    Unit::Microsecond,
    Unit::Millisecond,
    Unit::Second,
    Unit::Hertz,
    Unit::Kilohertz,
    Unit::Megahertz,
    Unit::Gigahertz,
    Unit::Millivolt,
    Unit::Volt,
    Unit::DecibelMilliwatt,
    Unit::Counts,
    Unit::Dimensionless,
];

impl Unit {
    /// Short symbol, as written in records and configuration.
    pub fn symbol(self) -> &'static str {
        match self {
            Unit::Picosecond => "ps",
            Unit::Nanosecond => "ns",
            Unit::Microsecond => "us",
            Unit::Millisecond => "ms",
            Unit::Second => "s",
            Unit::Hertz => "Hz",
            Unit::Kilohertz => "kHz",
            Unit::Megahertz => "MHz",
            Unit::Gigahertz => "GHz",
            Unit::Millivolt => "mV",
            Unit::Volt => "V",
            Unit::DecibelMilliwatt => "dBm",
            Unit::Counts => "counts",
            Unit::Dimensionless => "",
        }
    }

    pub fn dimension(self) -> Dimension {
        match self {
            Unit::Picosecond
            | Unit::Nanosecond
            | Unit::Microsecond
            | Unit::Millisecond
            | Unit::Second => Dimension::Time,
            Unit::Hertz | Unit::Kilohertz | Unit::Megahertz | Unit::Gigahertz => {
                Dimension::Frequency
            }
            Unit::Millivolt | Unit::Volt => Dimension::Voltage,
            Unit::DecibelMilliwatt => Dimension::PowerLevel,
            Unit::Counts => Dimension::Counts,
            Unit::Dimensionless => Dimension::Dimensionless,
        }
    }

    /// Factor converting a value in this unit to the SI base unit of its dimension.
    pub fn scale(self) -> f64 {
        match self {
            Unit::Picosecond => 1e-12,
            Unit::Nanosecond => 1e-9,
            Unit::Microsecond => 1e-6,
            Unit::Millisecond => 1e-3,
            Unit::Kilohertz => 1e3,
            Unit::Megahertz => 1e6,
            Unit::Gigahertz => 1e9,
            Unit::Millivolt => 1e-3,
            Unit::Second
            | Unit::Hertz
            | Unit::Volt
            | Unit::DecibelMilliwatt
            | Unit::Counts
            | Unit::Dimensionless => 1.0,
        }
    }

    /// Parse a unit symbol. `µs` is accepted as an alias of `us`.
    pub fn parse(symbol: &str) -> AppResult<Self> {
        let symbol = symbol.trim();
        if symbol == "µs" {
            return Ok(Unit::Microsecond);
        }
        ALL_UNITS
            .iter()
            .copied()
            .find(|unit| unit.symbol() == symbol)
            .ok_or_else(|| DaqError::UnknownUnit(symbol.to_string()))
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Unit {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Unit::parse(s)
    }
}

impl TryFrom<String> for Unit {
    type Error = DaqError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Unit::parse(&value)
    }
}

impl From<Unit> for String {
    fn from(unit: Unit) -> Self {
        unit.symbol().to_string()
    }
}

/// Convert `value` from one unit to another of the same dimension.
pub fn convert(value: f64, from: Unit, to: Unit) -> AppResult<f64> {
    if from.dimension() != to.dimension() {
        return Err(DaqError::IncompatibleUnit {
            from: from.to_string(),
            to: to.to_string(),
        });
    }
    if from == to {
        return Ok(value);
    }
    Ok(value * from.scale() / to.scale())
}

/// Turn a time quantity into a [`Duration`], rounded to whole nanoseconds.
pub fn duration_from(value: f64, unit: Unit) -> AppResult<Duration> {
    let ns = convert(value, unit, Unit::Nanosecond)?.round();
    // 2^64 is exactly representable; anything at or above it does not fit in u64 ns.
    if !ns.is_finite() || ns < 0.0 || ns >= u64::MAX as f64 {
        return Err(DaqError::IncompatibleUnit {
            from: format!("{value} {unit}"),
            to: "duration".to_string(),
        });
    }
    Ok(Duration::from_nanos(ns as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_within_dimension() {
        let hz = convert(2.87, Unit::Gigahertz, Unit::Megahertz).unwrap();
        assert!((hz - 2870.0).abs() < 1e-9);

        let v = convert(250.0, Unit::Millivolt, Unit::Volt).unwrap();
        assert!((v - 0.25).abs() < 1e-12);
    }

    #[test]
    fn rejects_mismatched_dimension() {
        let err = convert(1.0, Unit::Millisecond, Unit::Hertz).unwrap_err();
        assert!(matches!(err, DaqError::IncompatibleUnit { .. }));
    }

    #[test]
    fn parses_symbols() {
        assert_eq!(Unit::parse("kHz").unwrap(), Unit::Kilohertz);
        assert_eq!("µs".parse::<Unit>().unwrap(), Unit::Microsecond);
        assert!(matches!(Unit::parse("furlong"), Err(DaqError::UnknownUnit(_))));
    }

    #[test]
    fn duration_from_time_units() {
        assert_eq!(
            duration_from(100.0, Unit::Millisecond).unwrap(),
            Duration::from_millis(100)
        );
        assert!(duration_from(1.0, Unit::Volt).is_err());
        assert!(duration_from(-1.0, Unit::Second).is_err());
    }

    #[test]
    fn duration_from_rejects_values_that_do_not_fit() {
        assert!(duration_from(f64::NAN, Unit::Second).is_err());
        assert!(duration_from(f64::INFINITY, Unit::Millisecond).is_err());
        assert!(duration_from(1e30, Unit::Second).is_err());
        assert!(duration_from(2e10, Unit::Second).is_err());
        assert_eq!(
            duration_from(1e6, Unit::Second).unwrap(),
            Duration::from_secs(1_000_000)
        );
    }

    #[test]
    fn unit_serializes_as_symbol() {
        let json = serde_json::to_string(&Unit::Counts).unwrap();
        assert_eq!(json, "\"counts\"");
        let back: Unit = serde_json::from_str("\"mV\"").unwrap();
        assert_eq!(back, Unit::Millivolt);
    }
}
