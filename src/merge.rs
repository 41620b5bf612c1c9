use crate::aqi::round_to;
use crate::models::{Channel, Confidence, FusedValue, Metric, StationId};
use std::collections::HashSet;
use tracing::warn;

/// Particulate readings at or above this value are treated as a saturated or
/// faulty laser counter.
pub const MAX_PM_READING: f64 = 1000.0;

/// Channels further apart than this (µg/m³) make a fused value questionable.
pub const MAX_CHANNEL_DIFFERENCE: f64 = 45.0;

/// Tracks the station metrics that already logged a bad-channel warning so a
/// degraded counter does not flood the log on every poll.
#[derive(Debug, Default)]
pub struct WarningTracker {
    warned: HashSet<(StationId, Metric)>,
}

impl WarningTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_warned(&self, station_id: &str, metric: Metric) -> bool {
        self.warned.contains(&(station_id.to_string(), metric))
    }

    /// Returns `true` if this call emitted the warning.
    pub fn warn_channel_bad(
        &mut self,
        station_id: &str,
        label: Option<&str>,
        metric: Metric,
        channel: &str,
    ) -> bool {
        if !self.warned.insert((station_id.to_string(), metric)) {
            return false;
        }

        warn!(
            "PurpleAir station \"{}\" ({}) is sending bad readings for channel {} data point {}",
            label.unwrap_or("unknown"),
            station_id,
            channel,
            metric
        );
        true
    }

    /// Forget the warning for one metric once both channels read valid again.
    pub fn clear(&mut self, station_id: &str, metric: Metric) {
        self.warned.remove(&(station_id.to_string(), metric));
    }
}

/// Per-station context handed to the merger for warning bookkeeping.
pub struct MergeContext<'a> {
    pub station_id: &'a str,
    pub label: Option<&'a str>,
    pub warnings: &'a mut WarningTracker,
}

/// Fuse the channel A and channel B values of one metric.
///
/// `channel_b` is `None` when the station has no B record this cycle,
/// `Some(None)` when the B record exists but lacks the metric.
pub fn merge_metric(
    ctx: &mut MergeContext<'_>,
    metric: Metric,
    channel_a: Option<f64>,
    channel_b: Option<Option<f64>>,
) -> FusedValue {
    if !metric.is_particulate() {
        return match channel_a {
            Some(a) => FusedValue::new(Some(round_to(a, 1)), Confidence::Good),
            None => FusedValue::absent(),
        };
    }

    match (channel_a, channel_b.flatten()) {
        (Some(a), Some(b)) => merge_pm_reading(ctx, metric, a, b),
        (Some(single), None) | (None, Some(single)) => {
            FusedValue::new(Some(round_to(single, 1)), Confidence::Single)
        }
        (None, None) => FusedValue::absent(),
    }
}

/// Fuse two particulate readings, checking each against the validity ceiling.
pub fn merge_pm_reading(ctx: &mut MergeContext<'_>, metric: Metric, a: f64, b: f64) -> FusedValue {
    let a_valid = a < MAX_PM_READING;
    let b_valid = b < MAX_PM_READING;

    let (value, confidence, bad_channel) = match (a_valid, b_valid) {
        (true, true) => {
            let confidence = if (a - b).abs() < MAX_CHANNEL_DIFFERENCE {
                Confidence::Good
            } else {
                Confidence::Questionable
            };
            (Some(round_to((a + b) / 2.0, 1)), confidence, None)
        }
        (true, false) => (
            Some(round_to(a, 1)),
            Confidence::SingleBChannelBad,
            Some(Channel::B.to_string()),
        ),
        (false, true) => (
            Some(round_to(b, 1)),
            Confidence::SingleAChannelBad,
            Some(Channel::A.to_string()),
        ),
        (false, false) => (None, Confidence::Invalid, Some("A and B".to_string())),
    };

    match bad_channel {
        Some(channel) => {
            ctx.warnings
                .warn_channel_bad(ctx.station_id, ctx.label, metric, &channel);
        }
        None => ctx.warnings.clear(ctx.station_id, metric),
    }

    FusedValue::new(value, confidence)
}
