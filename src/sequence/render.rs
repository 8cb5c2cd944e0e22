//! Hardware-facing renderings of a compiled program.
//!
//! Generators take a program either as a run list of `(duration_ns, level)` pairs or as
//! a fixed-length sample raster with a sample rate. Both cover one period.

use super::{duration_ns, CompiledSequence};
use crate::error::{AppResult, DaqError};

/// A sample raster and the rate it must be played at.
#[derive(Clone, Debug, PartialEq)]
pub struct Raster {
    /// Samples per second, floored.
    pub sample_rate: u64,
    pub samples: Vec<f64>,
}

fn channel_index(program: &CompiledSequence, channel: &str) -> AppResult<usize> {
    program
        .channel_names()
        .iter()
        .position(|name| name == channel)
        .ok_or_else(|| DaqError::SequenceValidation {
            segment: None,
            reason: format!("program does not drive channel '{channel}'"),
        })
}

/// One `(duration_ns, level)` pair per segment for `channel`.
pub fn run_list(program: &CompiledSequence, channel: &str) -> AppResult<Vec<(u64, f64)>> {
    let index = channel_index(program, channel)?;
    Ok(program
        .segments()
        .iter()
        .map(|segment| (duration_ns(segment.duration), segment.states[index].level()))
        .collect())
}

/// Render one period of `channel` into exactly `n_samples` samples.
///
/// The rate is floored so the rendered segments never exceed `n_samples`; the tail is
/// padded with the idle level (0).
pub fn rasterize(program: &CompiledSequence, channel: &str, n_samples: usize) -> AppResult<Raster> {
    if n_samples == 0 {
        return Err(DaqError::SequenceValidation {
            segment: None,
            reason: "raster needs at least one sample".to_string(),
        });
    }
    let index = channel_index(program, channel)?;
    let period_ns = program.period().as_nanos().max(1);
    let sample_rate = (n_samples as u128 * 1_000_000_000) / period_ns;

    let mut samples = Vec::with_capacity(n_samples);
    for segment in program.segments() {
        let count = segment.duration.as_nanos() * sample_rate / 1_000_000_000;
        let count = (count as usize).min(n_samples - samples.len());
        samples.extend(std::iter::repeat(segment.states[index].level()).take(count));
    }
    samples.resize(n_samples, 0.0);

    Ok(Raster {
        sample_rate: u64::try_from(sample_rate).unwrap_or(u64::MAX),
        samples,
    })
}
