//! Parameter sweeps and observables of a measurement.
//!
//! A [`Sweep`] is a list of named axes, each with the values it steps through. The
//! first axis varies fastest; the number of points is the product of the axis lengths.
//! An [`Observable`] names a quantity a measurement produces, its data format and,
//! optionally, the recorded channel it is taken from.
//!
//! Both are part of [`RunMetadata`](crate::metadata::RunMetadata) and end up in the
//! record header, so a reader can map samples back onto sweep coordinates.

use crate::units::Unit;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// One swept variable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SweepAxis {
    pub name: String,
    pub values: Vec<f64>,
    #[serde(default)]
    pub unit: Option<Unit>,
}

impl SweepAxis {
    pub fn new(name: &str, values: impl IntoIterator<Item = f64>) -> Self {
        Self {
            name: name.to_string(),
            values: values.into_iter().collect(),
            unit: None,
        }
    }

    /// `points` evenly spaced values from `start` to `stop`, both included.
    pub fn linspace(name: &str, start: f64, stop: f64, points: usize) -> Self {
        let values = match points {
            0 => Vec::new(),
            1 => vec![start],
            n => {
                let step = (stop - start) / (n - 1) as f64;
                (0..n).map(|i| start + step * i as f64).collect()
            }
        };
        Self::new(name, values)
    }

    pub fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Nested sweep over several axes. An empty sweep is a single point.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Sweep {
    pub axes: Vec<SweepAxis>,
}

/// One point of a sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPoint {
    /// Position in iteration order.
    pub index: usize,
    /// Index into each axis, in axis order.
    pub position: Vec<usize>,
    pub values: BTreeMap<String, f64>,
}

impl Sweep {
    pub fn with_axis(mut self, axis: SweepAxis) -> Self {
        self.axes.push(axis);
        self
    }

    /// Product of the axis lengths.
    pub fn number_points(&self) -> usize {
        self.axes.iter().map(SweepAxis::len).product()
    }

    pub fn validate(&self) -> Result<(), String> {
        let mut names = HashSet::new();
        for axis in &self.axes {
            if axis.name.trim().is_empty() {
                return Err("Sweep axis name cannot be empty.".to_string());
            }
            if !names.insert(axis.name.as_str()) {
                return Err(format!("Sweep axis '{}' is declared twice.", axis.name));
            }
            if axis.is_empty() {
                return Err(format!("Sweep axis '{}' has no values.", axis.name));
            }
            if axis.values.iter().any(|v| !v.is_finite()) {
                return Err(format!("Sweep axis '{}' has a non-finite value.", axis.name));
            }
        }
        Ok(())
    }

    /// The point at iteration `index`, or `None` past the end.
    pub fn point(&self, index: usize) -> Option<SweepPoint> {
        if index >= self.number_points() {
            return None;
        }
        let mut rest = index;
        let mut position = Vec::with_capacity(self.axes.len());
        let mut values = BTreeMap::new();
        for axis in &self.axes {
            let i = rest % axis.len();
            rest /= axis.len();
            position.push(i);
            values.insert(axis.name.clone(), axis.values[i]);
        }
        Some(SweepPoint {
            index,
            position,
            values,
        })
    }

    /// Every point, first axis fastest.
    pub fn points(&self) -> impl Iterator<Item = SweepPoint> + '_ {
        (0..self.number_points()).filter_map(move |i| self.point(i))
    }
}

/// Storage format of an observable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservableFormat {
    #[default]
    Float,
    Image,
    Histogram,
}

/// A named quantity produced by the measurement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Observable {
    pub name: String,
    #[serde(default)]
    pub format: ObservableFormat,
    #[serde(default)]
    pub unit: Option<Unit>,
    /// Recorded channel (`<device>/<channel>`) the observable is read from.
    #[serde(default)]
    pub channel: Option<String>,
    /// Whether the observable is persisted.
    #[serde(default = "default_save")]
    pub save: bool,
}

fn default_save() -> bool {
    true
}

impl Observable {
    pub fn new(name: &str, format: ObservableFormat) -> Self {
        Self {
            name: name.to_string(),
            format,
            unit: None,
            channel: None,
            save: true,
        }
    }

    pub fn float(name: &str) -> Self {
        Self::new(name, ObservableFormat::Float)
    }

    pub fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    pub fn from_channel(mut self, key: &str) -> Self {
        self.channel = Some(key.to_string());
        self
    }

    pub fn unsaved(mut self) -> Self {
        self.save = false;
        self
    }
}
