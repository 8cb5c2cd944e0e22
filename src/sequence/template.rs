//! Named single-segment pulse templates.
//!
//! A [`Template`] is a kind plus an optional duration. The duration is resolved when
//! the template is instantiated, so templates with a fixed length and templates with a
//! caller-chosen length share one code path.

use super::{ChannelState, PulseSegment, PulseSequence};
use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Duration used when neither the template nor the parameters name one.
pub const DEFAULT_TEMPLATE_DURATION: Duration = Duration::from_micros(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemplateKind {
    /// All channels high.
    On,
    /// All channels low.
    Off,
    /// The trigger channel high, every other channel low.
    Trigger,
}

impl fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TemplateKind::On => "On",
            TemplateKind::Off => "Off",
            TemplateKind::Trigger => "Trigger",
        };
        f.write_str(name)
    }
}

impl FromStr for TemplateKind {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" => Ok(TemplateKind::On),
            "off" => Ok(TemplateKind::Off),
            "trigger" => Ok(TemplateKind::Trigger),
            _ => Err(DaqError::UnknownTemplate(s.to_string())),
        }
    }
}

/// Parameters applied when a template is instantiated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TemplateParams {
    pub duration: Duration,
    pub channel_count: usize,
    pub trigger_channel: usize,
}

impl Default for TemplateParams {
    fn default() -> Self {
        Self {
            duration: DEFAULT_TEMPLATE_DURATION,
            channel_count: 1,
            trigger_channel: 0,
        }
    }
}

impl TemplateParams {
    pub fn new(channel_count: usize) -> Self {
        Self {
            channel_count,
            ..Self::default()
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_trigger_channel(mut self, channel: usize) -> Self {
        self.trigger_channel = channel;
        self
    }
}

/// A template kind with an optional fixed duration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub kind: TemplateKind,
    /// Overrides the duration in [`TemplateParams`] when set.
    #[serde(default)]
    pub duration: Option<Duration>,
}

impl Template {
    pub fn new(kind: TemplateKind) -> Self {
        Self {
            kind,
            duration: None,
        }
    }

    pub fn fixed(kind: TemplateKind, duration: Duration) -> Self {
        Self {
            kind,
            duration: Some(duration),
        }
    }

    /// Expand into a one-segment sequence.
    pub fn instantiate(&self, params: &TemplateParams) -> AppResult<PulseSequence> {
        let n = params.channel_count;
        if n == 0 {
            return Err(DaqError::SequenceValidation {
                segment: None,
                reason: format!("template '{}' needs at least one channel", self.kind),
            });
        }
        let duration = self.duration.unwrap_or(params.duration);
        let segment = match self.kind {
            TemplateKind::On => PulseSegment::uniform(duration, ChannelState::High, n),
            TemplateKind::Off => PulseSegment::uniform(duration, ChannelState::Low, n),
            TemplateKind::Trigger => {
                if params.trigger_channel >= n {
                    return Err(DaqError::segment(
                        0,
                        format!(
                            "trigger channel {} out of range for {n} channels",
                            params.trigger_channel
                        ),
                    ));
                }
                let mut segment = PulseSegment::uniform(duration, ChannelState::Low, n);
                segment.states[params.trigger_channel] = ChannelState::High;
                segment
            }
        };
        Ok(PulseSequence::new(n).with_segment(segment))
    }
}

/// Expand the template called `name` (case-insensitive) with `params`.
pub fn instantiate_template(name: &str, params: &TemplateParams) -> AppResult<PulseSequence> {
    let kind: TemplateKind = name.parse()?;
    Template::new(kind).instantiate(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn on_and_off_fill_every_channel() {
        let on = instantiate_template("On", &TemplateParams::new(3)).unwrap();
        assert_eq!(on.segments.len(), 1);
        assert_eq!(on.segments[0].states, vec![ChannelState::High; 3]);
        assert_eq!(on.segments[0].duration, DEFAULT_TEMPLATE_DURATION);

        let off = instantiate_template("off", &TemplateParams::new(2)).unwrap();
        assert_eq!(off.segments[0].states, vec![ChannelState::Low; 2]);
    }

    #[test]
    fn trigger_raises_only_trigger_channel() {
        let params = TemplateParams::new(2)
            .with_trigger_channel(1)
            .with_duration(Duration::from_millis(100));
        let trig = instantiate_template("TRIGGER", &params).unwrap();
        assert_eq!(trig.segments[0].states, vec![ChannelState::Low, ChannelState::High]);
        assert_eq!(trig.segments[0].duration, Duration::from_millis(100));

        let bad = TemplateParams::new(2).with_trigger_channel(2);
        assert!(instantiate_template("Trigger", &bad).is_err());
    }

    #[test]
    fn fixed_duration_wins_over_params() {
        let template = Template::fixed(TemplateKind::On, Duration::from_nanos(1000));
        let params = TemplateParams::new(1).with_duration(Duration::from_millis(5));
        let seq = template.instantiate(&params).unwrap();
        assert_eq!(seq.segments[0].duration, Duration::from_nanos(1000));
    }

    #[test]
    fn unknown_template_name() {
        let err = instantiate_template("Ramp", &TemplateParams::default()).unwrap_err();
        assert!(matches!(err, DaqError::UnknownTemplate(name) if name == "Ramp"));
    }
}
