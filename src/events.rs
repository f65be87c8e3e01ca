//! Gait Event Detector.
//!
//! Heel-strikes and toe-offs are found on the vertical velocity of a foot
//! signal: the heel marker when it is tracked well enough, otherwise the
//! foot segment origin. A heel-strike is the sharp deceleration at the end
//! of swing (velocity minimum below `-heel_strike_velocity`), a toe-off the
//! lift at the start of swing (maximum above `toe_off_velocity`).

use std::fmt;

use log::{debug, info, warn};

use crate::config::EventConfig;
use crate::error::Warning;
use crate::model::LimbSignals;
use crate::segment::PoseLayer;
use crate::trajectory::TrajectoryLayer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Limb {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GaitEventKind {
    HeelStrike,
    ToeOff,
}

impl fmt::Display for GaitEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GaitEventKind::HeelStrike => f.write_str("heel-strike"),
            GaitEventKind::ToeOff => f.write_str("toe-off"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaitEvent {
    pub limb: Limb,
    pub kind: GaitEventKind,
    pub frame: usize,
    pub timestamp: f64,
}

/// The events of one limb, in frame order, strictly alternating in kind.
#[derive(Debug, Clone, PartialEq)]
pub struct LimbEvents {
    pub limb: Limb,
    /// What the events were detected on, e.g. `LHEE` or `LFoot segment`.
    pub source: String,
    pub events: Vec<GaitEvent>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventLayer {
    limbs: Vec<LimbEvents>,
}

impl EventLayer {
    pub fn limbs(&self) -> &[LimbEvents] {
        &self.limbs
    }

    pub fn limb(&self, limb: Limb) -> Option<&LimbEvents> {
        self.limbs.iter().find(|l| l.limb == limb)
    }

    /// Every event of every limb, ordered by frame.
    pub fn all(&self) -> Vec<GaitEvent> {
        let mut events: Vec<GaitEvent> = self.limbs.iter().flat_map(|l| l.events.iter().copied()).collect();
        events.sort_by_key(|e| e.frame);
        events
    }
}

/// Central-difference derivative in units per second. End frames, gap
/// frames and frames next to a gap have no velocity.
pub fn vertical_velocity(heights: &[Option<f64>], frame_rate: f64) -> Vec<Option<f64>> {
    (0..heights.len())
        .map(|i| {
            if i == 0 || i + 1 >= heights.len() {
                return None;
            }
            match (heights[i - 1], heights[i], heights[i + 1]) {
                (Some(a), Some(_), Some(b)) => Some((b - a) * frame_rate / 2.0),
                _ => None,
            }
        })
        .collect()
}

/// Centred moving average over the available values of the window.
pub fn smooth(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    let half = window / 2;
    (0..values.len())
        .map(|i| {
            values[i]?;
            let lo = i.saturating_sub(half);
            let hi = (i + half + 1).min(values.len());
            let (sum, n) = values[lo..hi]
                .iter()
                .flatten()
                .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
            Some(sum / n as f64)
        })
        .collect()
}

/// Local extrema of `sign * v` above `threshold`, as (frame, |v|).
fn peaks(velocity: &[Option<f64>], sign: f64, threshold: f64) -> Vec<(usize, f64)> {
    let mut out = Vec::new();
    for i in 1..velocity.len().saturating_sub(1) {
        if let (Some(a), Some(b), Some(c)) = (velocity[i - 1], velocity[i], velocity[i + 1]) {
            let (a, b, c) = (sign * a, sign * b, sign * c);
            if b > a && b >= c && b > threshold {
                out.push((i, b));
            }
        }
    }
    out
}

/// Among candidates closer than `min_frames`, keeps the strongest.
fn enforce_spacing(candidates: Vec<(usize, f64)>, min_frames: usize) -> Vec<(usize, f64)> {
    let mut kept: Vec<(usize, f64)> = Vec::with_capacity(candidates.len());
    for c in candidates {
        match kept.last_mut() {
            Some(last) if c.0 - last.0 < min_frames => {
                if c.1 > last.1 {
                    *last = c;
                }
            }
            _ => kept.push(c),
        }
    }
    kept
}

/// Detects events on an already computed vertical velocity (mm/s).
pub fn detect_from_velocity(
    limb: Limb,
    velocity: &[Option<f64>],
    frame_rate: f64,
    config: &EventConfig,
) -> (Vec<GaitEvent>, Vec<Warning>) {
    let smoothed = smooth(velocity, config.smoothing_window);
    let min_frames = (config.min_event_spacing_s * frame_rate).ceil() as usize;

    let strikes = enforce_spacing(peaks(&smoothed, -1.0, config.heel_strike_velocity), min_frames);
    let offs = enforce_spacing(peaks(&smoothed, 1.0, config.toe_off_velocity), min_frames);

    let mut candidates: Vec<(usize, GaitEventKind)> = strikes
        .into_iter()
        .map(|(f, _)| (f, GaitEventKind::HeelStrike))
        .chain(offs.into_iter().map(|(f, _)| (f, GaitEventKind::ToeOff)))
        .collect();
    candidates.sort_by_key(|c| c.0);

    let mut events: Vec<GaitEvent> = Vec::with_capacity(candidates.len());
    let mut warnings = Vec::new();
    for (frame, kind) in candidates {
        if let Some(last) = events.last() {
            if last.kind == kind {
                debug!("{:?}: dropping {} at frame {}", limb, last.kind, last.frame);
                warnings.push(Warning::AmbiguousEventSequence {
                    limb,
                    kind: last.kind,
                    frame: last.frame,
                });
                events.pop();
            }
        }
        events.push(GaitEvent {
            limb,
            kind,
            frame,
            timestamp: frame as f64 / frame_rate,
        });
    }
    (events, warnings)
}

/// Detects events on a vertical position signal (mm).
pub fn detect_limb(
    limb: Limb,
    heights: &[Option<f64>],
    frame_rate: f64,
    config: &EventConfig,
) -> (Vec<GaitEvent>, Vec<Warning>) {
    detect_from_velocity(limb, &vertical_velocity(heights, frame_rate), frame_rate, config)
}

/// Runs detection for every limb of the model.
pub fn detect(
    limbs: &[LimbSignals],
    trajectories: &TrajectoryLayer,
    poses: &PoseLayer,
    frame_rate: f64,
    config: &EventConfig,
) -> (EventLayer, Vec<Warning>) {
    let axis = config.vertical_axis;
    let mut layer = Vec::with_capacity(limbs.len());
    let mut warnings = Vec::new();

    for signals in limbs {
        let heel = trajectories
            .marker(signals.heel)
            .filter(|t| t.coverage() >= config.min_signal_coverage);
        let foot = signals.foot.as_deref().and_then(|name| poses.segment(name));
        let (source, heights) = match (heel, foot) {
            (Some(t), _) => (t.label.clone(), t.axis(axis)),
            (None, Some(series)) => {
                let source = format!("{} segment", series.segment);
                warnings.push(Warning::EventSignalFallback {
                    limb: signals.limb,
                    source: source.clone(),
                });
                (source, series.origin_axis(axis))
            }
            (None, None) => {
                warn!("{:?}: no usable foot signal, no events detected.", signals.limb);
                layer.push(LimbEvents {
                    limb: signals.limb,
                    source: String::new(),
                    events: Vec::new(),
                });
                continue;
            }
        };
        let (events, w) = detect_limb(signals.limb, &heights, frame_rate, config);
        info!(
            "Events: {:?} limb, {} events from {}.",
            signals.limb,
            events.len(),
            source
        );
        warnings.extend(w);
        layer.push(LimbEvents {
            limb: signals.limb,
            source,
            events,
        });
    }
    (EventLayer { limbs: layer }, warnings)
}
