//! Pulse sequence model, compiler and validator.
//!
//! A [`PulseSequence`] is a declarative timing program: ordered segments, each holding
//! a duration and one state per generator channel, plus a repeat count. [`compile`]
//! validates it against a generator's [`TargetCapabilities`] and produces an immutable
//! [`CompiledSequence`] that can be loaded onto hardware and reused across runs.
//!
//! Validation never clamps or truncates. The first offending segment is reported.

pub mod render;
pub mod template;

use crate::device::{Capability, DeviceDescriptor};
use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

pub use template::{instantiate_template, Template, TemplateKind, TemplateParams};

/// State of one generator channel during a segment.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Low,
    High,
    Analog(f64),
}

impl ChannelState {
    /// Numeric level: 0/1 for digital states, the value itself for analog ones.
    pub fn level(self) -> f64 {
        match self {
            ChannelState::Low => 0.0,
            ChannelState::High => 1.0,
            ChannelState::Analog(value) => value,
        }
    }
}

/// One timed step of a sequence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PulseSegment {
    pub duration: Duration,
    /// One state per channel, in the generator's output-channel order.
    pub states: Vec<ChannelState>,
}

impl PulseSegment {
    pub fn new(duration: Duration, states: Vec<ChannelState>) -> Self {
        Self { duration, states }
    }

    /// Every one of `channels` channels in the same state.
    pub fn uniform(duration: Duration, state: ChannelState, channels: usize) -> Self {
        Self::new(duration, vec![state; channels])
    }
}

/// How many times the segment list is played.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Repeat {
    Count(NonZeroU32),
    /// Continuous streaming until the run is aborted.
    Infinite,
}

impl Repeat {
    pub const ONCE: Repeat = Repeat::Count(NonZeroU32::MIN);

    /// A finite repeat count. Zero is rejected.
    pub fn count(n: u32) -> AppResult<Self> {
        NonZeroU32::new(n)
            .map(Repeat::Count)
            .ok_or_else(|| DaqError::SequenceValidation {
                segment: None,
                reason: "repeat count must be at least 1".to_string(),
            })
    }

    pub fn times(self) -> Option<u32> {
        match self {
            Repeat::Count(n) => Some(n.get()),
            Repeat::Infinite => None,
        }
    }
}

/// Uncompiled timing program.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PulseSequence {
    pub segments: Vec<PulseSegment>,
    pub repeat: Repeat,
    /// Declared number of generator channels every segment addresses.
    pub channel_count: usize,
}

impl PulseSequence {
    pub fn new(channel_count: usize) -> Self {
        Self {
            segments: Vec::new(),
            repeat: Repeat::ONCE,
            channel_count,
        }
    }

    pub fn with_segment(mut self, segment: PulseSegment) -> Self {
        self.segments.push(segment);
        self
    }

    pub fn with_repeat(mut self, repeat: Repeat) -> Self {
        self.repeat = repeat;
        self
    }

    /// Play `parts` back to back. All parts must declare the same channel count;
    /// the repeat count of the result is one.
    pub fn concat(parts: impl IntoIterator<Item = PulseSequence>) -> AppResult<Self> {
        let mut parts = parts.into_iter();
        let mut out = parts.next().ok_or_else(|| DaqError::SequenceValidation {
            segment: None,
            reason: "nothing to concatenate".to_string(),
        })?;
        out.repeat = Repeat::ONCE;
        for part in parts {
            if part.channel_count != out.channel_count {
                return Err(DaqError::segment(
                    out.segments.len(),
                    format!(
                        "declares {} channels, expected {}",
                        part.channel_count, out.channel_count
                    ),
                ));
            }
            out.segments.extend(part.segments);
        }
        Ok(out)
    }

    /// Sum of segment durations, if it does not overflow.
    pub fn period(&self) -> Option<Duration> {
        self.segments
            .iter()
            .try_fold(Duration::ZERO, |acc, s| acc.checked_add(s.duration))
    }
}

/// Kind and value range of one generator output channel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OutputKind {
    Digital,
    Analog { min: f64, max: f64 },
}

#[derive(Clone, Debug, PartialEq)]
pub struct TargetChannel {
    pub name: String,
    pub kind: OutputKind,
}

/// What a pulse generator can play: its output channels and time window.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct TargetCapabilities {
    pub channels: Vec<TargetChannel>,
    /// Longest total program duration the hardware accepts.
    pub max_duration: Option<Duration>,
}

impl TargetCapabilities {
    pub fn from_descriptor(descriptor: &DeviceDescriptor) -> Self {
        let channels = descriptor
            .output_channels()
            .map(|c| TargetChannel {
                name: c.name.clone(),
                kind: match (c.capability, c.range) {
                    (Capability::AnalogOutput, Some((min, max))) => OutputKind::Analog { min, max },
                    (Capability::AnalogOutput, None) => OutputKind::Analog {
                        min: f64::MIN,
                        max: f64::MAX,
                    },
                    _ => OutputKind::Digital,
                },
            })
            .collect();
        Self {
            channels,
            max_duration: descriptor.max_sequence_duration,
        }
    }

    /// Tighten the time window; the stricter of the existing and new limit wins.
    pub fn with_max_duration(mut self, limit: Duration) -> Self {
        self.max_duration = Some(self.max_duration.map_or(limit, |cur| cur.min(limit)));
        self
    }
}

struct CompiledInner {
    segments: Vec<PulseSegment>,
    repeat: Repeat,
    channel_names: Vec<String>,
    /// Start offset of each segment within one period.
    starts: Vec<Duration>,
    period: Duration,
    total: Option<Duration>,
}

/// Validated, immutable timing program. Cloning shares the same program.
#[derive(Clone)]
pub struct CompiledSequence {
    inner: Arc<CompiledInner>,
}

impl std::fmt::Debug for CompiledSequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledSequence")
            .field("segments", &self.inner.segments.len())
            .field("repeat", &self.inner.repeat)
            .field("period", &self.inner.period)
            .finish()
    }
}

impl CompiledSequence {
    pub fn segments(&self) -> &[PulseSegment] {
        &self.inner.segments
    }

    pub fn repeat(&self) -> Repeat {
        self.inner.repeat
    }

    /// Names of the generator channels, in state-vector order.
    pub fn channel_names(&self) -> &[String] {
        &self.inner.channel_names
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channel_names.len()
    }

    /// Duration of one pass through the segment list.
    pub fn period(&self) -> Duration {
        self.inner.period
    }

    /// Duration of the whole program; `None` for infinite repeats.
    pub fn total_duration(&self) -> Option<Duration> {
        self.inner.total
    }

    /// One sample is acquired per played segment; `None` for infinite repeats.
    pub fn expected_samples(&self) -> Option<u64> {
        self.inner
            .repeat
            .times()
            .map(|n| self.inner.segments.len() as u64 * u64::from(n))
    }

    /// Every played segment in order, with its nominal offsets from program start.
    pub fn schedule(&self) -> Schedule {
        Schedule {
            program: self.clone(),
            next: 0,
        }
    }

    pub fn summary(&self) -> SequenceSummary {
        SequenceSummary {
            segments: self.inner.segments.len(),
            repeat: self.inner.repeat,
            channel_count: self.channel_count(),
            channels: self.inner.channel_names.clone(),
            period_ns: duration_ns(self.inner.period),
            total_duration_ns: self.inner.total.map(duration_ns),
            expected_samples: self.expected_samples(),
        }
    }
}

/// Compact description of a compiled program, stored in record headers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SequenceSummary {
    pub segments: usize,
    pub repeat: Repeat,
    pub channel_count: usize,
    pub channels: Vec<String>,
    pub period_ns: u64,
    pub total_duration_ns: Option<u64>,
    pub expected_samples: Option<u64>,
}

/// One played segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slot {
    /// Acquisition index of the sample taken for this segment.
    pub index: u64,
    /// Position within the segment list.
    pub segment: usize,
    /// Nominal start, relative to program start.
    pub start: Duration,
    /// Nominal end, relative to program start.
    pub end: Duration,
}

/// Iterator over the played segments of a [`CompiledSequence`].
pub struct Schedule {
    program: CompiledSequence,
    next: u64,
}

impl Iterator for Schedule {
    type Item = Slot;

    fn next(&mut self) -> Option<Slot> {
        let inner = &self.program.inner;
        if let Some(limit) = self.program.expected_samples() {
            if self.next >= limit {
                return None;
            }
        }
        let len = inner.segments.len() as u64;
        if len == 0 {
            return None;
        }
        let index = self.next;
        let cycle = index / len;
        let segment = (index % len) as usize;
        let cycle_start = inner.period.as_nanos().saturating_mul(u128::from(cycle));
        let start = cycle_start.saturating_add(inner.starts[segment].as_nanos());
        let end = start.saturating_add(inner.segments[segment].duration.as_nanos());
        self.next += 1;
        Some(Slot {
            index,
            segment,
            start: nanos(start),
            end: nanos(end),
        })
    }
}

fn nanos(ns: u128) -> Duration {
    Duration::from_nanos(u64::try_from(ns).unwrap_or(u64::MAX))
}

pub(crate) fn duration_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Validate `sequence` against `target` and produce a loadable program.
///
/// Checks, in order: the sequence is non-empty and addresses at least one channel;
/// then per segment a non-zero duration, a state vector of the declared length,
/// channels that exist on the target, states of the right kind and analog values
/// within range; finally the aggregate duration against the target's time window.
pub fn compile(sequence: &PulseSequence, target: &TargetCapabilities) -> AppResult<CompiledSequence> {
    if sequence.segments.is_empty() {
        return Err(DaqError::SequenceValidation {
            segment: None,
            reason: "sequence has no segments".to_string(),
        });
    }
    if sequence.channel_count == 0 {
        return Err(DaqError::SequenceValidation {
            segment: None,
            reason: "sequence declares no channels".to_string(),
        });
    }

    for (index, segment) in sequence.segments.iter().enumerate() {
        validate_segment(index, segment, sequence.channel_count, target)?;
    }

    let mut starts = Vec::with_capacity(sequence.segments.len());
    let mut period = Duration::ZERO;
    for (index, segment) in sequence.segments.iter().enumerate() {
        starts.push(period);
        period = period
            .checked_add(segment.duration)
            .ok_or_else(|| DaqError::segment(index, "sequence duration overflows"))?;
    }

    let total = match sequence.repeat {
        Repeat::Count(n) => Some(period.checked_mul(n.get()).ok_or_else(|| {
            DaqError::SequenceValidation {
                segment: None,
                reason: format!("{period:?} x {n} overflows"),
            }
        })?),
        Repeat::Infinite => None,
    };

    if let Some(limit) = target.max_duration {
        // Infinite programs stream one period at a time, so only the period must fit.
        let required = total.unwrap_or(period);
        if required > limit {
            let index = first_segment_past(&sequence.segments, period, limit);
            return Err(DaqError::segment(
                index,
                format!("total duration {required:?} exceeds hardware limit {limit:?}"),
            ));
        }
    }

    let channel_names = target
        .channels
        .iter()
        .take(sequence.channel_count)
        .map(|c| c.name.clone())
        .collect();

    Ok(CompiledSequence {
        inner: Arc::new(CompiledInner {
            segments: sequence.segments.clone(),
            repeat: sequence.repeat,
            channel_names,
            starts,
            period,
            total,
        }),
    })
}

fn validate_segment(
    index: usize,
    segment: &PulseSegment,
    channel_count: usize,
    target: &TargetCapabilities,
) -> AppResult<()> {
    if segment.duration.is_zero() {
        return Err(DaqError::segment(index, "duration must be non-zero"));
    }
    if segment.states.len() != channel_count {
        return Err(DaqError::segment(
            index,
            format!(
                "{} channel states given, sequence declares {channel_count}",
                segment.states.len()
            ),
        ));
    }
    for (channel, state) in segment.states.iter().enumerate() {
        let Some(output) = target.channels.get(channel) else {
            return Err(DaqError::segment(
                index,
                format!(
                    "channel {channel} does not exist; generator has {} outputs",
                    target.channels.len()
                ),
            ));
        };
        match (output.kind, state) {
            (OutputKind::Digital, ChannelState::Low | ChannelState::High) => {}
            (OutputKind::Analog { min, max }, ChannelState::Analog(value)) => {
                if !value.is_finite() || *value < min || *value > max {
                    return Err(DaqError::segment(
                        index,
                        format!(
                            "value {value} on '{}' outside [{min}, {max}]",
                            output.name
                        ),
                    ));
                }
            }
            (OutputKind::Digital, ChannelState::Analog(_)) => {
                return Err(DaqError::segment(
                    index,
                    format!("analog value on digital channel '{}'", output.name),
                ))
            }
            (OutputKind::Analog { .. }, _) => {
                return Err(DaqError::segment(
                    index,
                    format!("digital level on analog channel '{}'", output.name),
                ))
            }
        }
    }
    Ok(())
}

/// Position of the segment during which playback first passes `limit`.
///
/// Whole periods that fit inside `limit` are skipped arithmetically, so only one pass
/// through the segment list is scanned.
fn first_segment_past(segments: &[PulseSegment], period: Duration, limit: Duration) -> usize {
    let period_ns = period.as_nanos();
    if period_ns == 0 {
        return 0;
    }
    let remainder = limit.as_nanos() % period_ns;
    let mut end = 0u128;
    segments
        .iter()
        .position(|segment| {
            end += segment.duration.as_nanos();
            end > remainder
        })
        .unwrap_or(0)
}
