//! Marker Trajectory Processor.
//!
//! Turns the raw columns of a trial into per-marker time series, locates
//! occlusion gaps, and fills the short ones with a local cubic through the
//! nearest valid samples on both sides.

use log::{debug, info};

use crate::config::GapConfig;
use crate::error::{Error, Result, Warning};
use crate::markers::Marker;
use crate::trial::Trial;
use crate::Position;

/// Valid samples used on each side of a gap (two per side gives a cubic).
const ANCHORS_PER_SIDE: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleStatus {
    /// Measured by the capture system.
    Raw,
    /// Filled in by interpolation.
    Interpolated,
    /// Missing, left unresolved.
    Gap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapStatus {
    Interpolated,
    Unresolved,
}

/// A run of missing frames, `start..=end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapSpan {
    pub start: usize,
    pub end: usize,
    pub status: GapStatus,
}

impl GapSpan {
    pub fn len(&self) -> usize {
        self.end - self.start + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp: f64,
    pub position: Option<Position>,
    pub status: SampleStatus,
}

/// The time series of one capture column.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerTrajectory {
    pub label: String,
    pub marker: Option<Marker>,
    samples: Vec<Sample>,
    gaps: Vec<GapSpan>,
}

impl MarkerTrajectory {
    /// Builds the trajectory of one column, filling gaps of at most
    /// `max_fill_gap` frames.
    pub fn build(
        label: &str,
        marker: Option<Marker>,
        raw: &[Option<Position>],
        frame_rate: f64,
        max_fill_gap: usize,
    ) -> MarkerTrajectory {
        let mut samples: Vec<Sample> = raw
            .iter()
            .enumerate()
            .map(|(i, p)| Sample {
                timestamp: i as f64 / frame_rate,
                position: *p,
                status: if p.is_some() {
                    SampleStatus::Raw
                } else {
                    SampleStatus::Gap
                },
            })
            .collect();

        let mut gaps = Vec::new();
        for (start, end) in find_gaps(raw) {
            let len = end - start + 1;
            let filled = if len <= max_fill_gap {
                interpolate_gap(raw, start, end)
            } else {
                None
            };
            let status = match filled {
                Some(points) => {
                    for (sample, p) in samples[start..=end].iter_mut().zip(points) {
                        sample.position = Some(p);
                        sample.status = SampleStatus::Interpolated;
                    }
                    GapStatus::Interpolated
                }
                None => GapStatus::Unresolved,
            };
            gaps.push(GapSpan { start, end, status });
        }

        MarkerTrajectory {
            label: label.to_string(),
            marker,
            samples,
            gaps,
        }
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn gaps(&self) -> &[GapSpan] {
        &self.gaps
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Position at a frame, measured or interpolated.
    pub fn position(&self, frame: usize) -> Option<Position> {
        self.samples.get(frame).and_then(|s| s.position)
    }

    pub fn status(&self, frame: usize) -> Option<SampleStatus> {
        self.samples.get(frame).map(|s| s.status)
    }

    pub fn is_interpolated(&self, frame: usize) -> bool {
        self.status(frame) == Some(SampleStatus::Interpolated)
    }

    pub fn unresolved_frames(&self) -> usize {
        self.gaps
            .iter()
            .filter(|g| g.status == GapStatus::Unresolved)
            .map(|g| g.len())
            .sum()
    }

    /// Share of frames with a position (measured or interpolated).
    pub fn coverage(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        1.0 - self.unresolved_frames() as f64 / self.samples.len() as f64
    }

    /// One coordinate of the series, `None` where unresolved.
    pub fn axis(&self, axis: usize) -> Vec<Option<f64>> {
        self.samples
            .iter()
            .map(|s| s.position.map(|p| p[axis]))
            .collect()
    }
}

/// All trajectories of a trial, in capture column order.
#[derive(Debug, Clone, PartialEq)]
pub struct TrajectoryLayer {
    trajectories: Vec<MarkerTrajectory>,
}

impl TrajectoryLayer {
    pub fn trajectories(&self) -> &[MarkerTrajectory] {
        &self.trajectories
    }

    pub fn column(&self, column: usize) -> Option<&MarkerTrajectory> {
        self.trajectories.get(column)
    }

    pub fn marker(&self, marker: Marker) -> Option<&MarkerTrajectory> {
        self.trajectories.iter().find(|t| t.marker == Some(marker))
    }
}

/// Runs of consecutive missing frames, as inclusive `(start, end)` pairs.
pub fn find_gaps(series: &[Option<Position>]) -> Vec<(usize, usize)> {
    let mut gaps = Vec::new();
    let mut start: Option<usize> = None;
    for (i, p) in series.iter().enumerate() {
        match (p, start) {
            (None, None) => start = Some(i),
            (Some(_), Some(s)) => {
                gaps.push((s, i - 1));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        gaps.push((s, series.len() - 1));
    }
    gaps
}

/// Fills `start..=end` with the polynomial through up to two valid samples
/// on each side (cubic with four anchors). Gaps touching either end of the
/// series cannot be interpolated and return `None`.
pub fn interpolate_gap(series: &[Option<Position>], start: usize, end: usize) -> Option<Vec<Position>> {
    let before: Vec<(f64, Position)> = (0..start)
        .rev()
        .filter_map(|i| series[i].map(|p| (i as f64, p)))
        .take(ANCHORS_PER_SIDE)
        .collect();
    let after: Vec<(f64, Position)> = (end + 1..series.len())
        .filter_map(|i| series[i].map(|p| (i as f64, p)))
        .take(ANCHORS_PER_SIDE)
        .collect();
    if before.is_empty() || after.is_empty() {
        return None;
    }
    let anchors: Vec<(f64, Position)> = before.into_iter().rev().chain(after).collect();
    Some(
        (start..=end)
            .map(|i| lagrange(&anchors, i as f64))
            .collect(),
    )
}

fn lagrange(anchors: &[(f64, Position)], t: f64) -> Position {
    let mut value = Position::zeros();
    for (i, (ti, pi)) in anchors.iter().enumerate() {
        let weight: f64 = anchors
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(_, (tj, _))| (t - tj) / (ti - tj))
            .product();
        value += pi * weight;
    }
    value
}

/// Builds every trajectory of the trial and checks the markers the model
/// needs.
///
/// Fails with [`Error::InsufficientData`] when a required marker is absent
/// or unresolved for more than `max_unresolved_fraction` of the trial.
pub fn process(
    trial: &Trial,
    required: &[Marker],
    config: &GapConfig,
) -> Result<(TrajectoryLayer, Vec<Warning>)> {
    let markers = trial.markers();
    let trajectories: Vec<MarkerTrajectory> = trial
        .labels()
        .iter()
        .enumerate()
        .map(|(column, label)| {
            MarkerTrajectory::build(
                label,
                markers.marker_at(column),
                &trial.column(column),
                trial.frame_rate(),
                config.max_fill_gap,
            )
        })
        .collect();

    let total = trial.frame_count();
    for &marker in required {
        let unresolved = match trajectories.iter().find(|t| t.marker == Some(marker)) {
            Some(t) => t.unresolved_frames(),
            None => total,
        };
        if total > 0 && unresolved as f64 > config.max_unresolved_fraction * total as f64 {
            return Err(Error::InsufficientData {
                marker: marker.to_string(),
                unresolved,
                total,
            });
        }
    }

    let mut warnings = Vec::new();
    let mut filled = 0;
    for t in &trajectories {
        for gap in t.gaps() {
            match gap.status {
                GapStatus::Interpolated => filled += 1,
                GapStatus::Unresolved => {
                    debug!("{}: unresolved gap {}-{}", t.label, gap.start, gap.end);
                    warnings.push(Warning::UnresolvedGap {
                        marker: t.label.clone(),
                        start: gap.start,
                        end: gap.end,
                    });
                }
            }
        }
    }
    info!(
        "Trajectories: {} markers, {} gaps filled, {} unresolved.",
        trajectories.len(),
        filled,
        warnings.len()
    );

    Ok((TrajectoryLayer { trajectories }, warnings))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(n: usize, gaps: &[(usize, usize)], f: impl Fn(f64) -> Position) -> Vec<Option<Position>> {
        (0..n)
            .map(|i| {
                if gaps.iter().any(|&(s, e)| i >= s && i <= e) {
                    None
                } else {
                    Some(f(i as f64))
                }
            })
            .collect()
    }

    #[test]
    fn finds_gaps_including_edges() {
        let s = series(12, &[(0, 1), (4, 6), (11, 11)], |t| Position::new(t, 0.0, 0.0));
        assert_eq!(find_gaps(&s), vec![(0, 1), (4, 6), (11, 11)]);
        assert!(find_gaps(&series(5, &[], |_| Position::zeros())).is_empty());
    }

    #[test]
    fn cubic_motion_is_recovered_exactly() {
        let f = |t: f64| Position::new(0.5 * t * t * t - t, 2.0 * t * t, 7.0);
        let s = series(30, &[(10, 15)], f);
        let filled = interpolate_gap(&s, 10, 15).unwrap();
        for (k, p) in filled.iter().enumerate() {
            assert!((p - f((10 + k) as f64)).norm() < 1e-6);
        }
    }

    #[test]
    fn edge_gaps_are_not_extrapolated() {
        let s = series(10, &[(0, 2)], |t| Position::new(t, t, t));
        assert!(interpolate_gap(&s, 0, 2).is_none());
        let t = MarkerTrajectory::build("LHEE", Some(Marker::Lhee), &s, 100.0, 10);
        assert_eq!(t.gaps()[0].status, GapStatus::Unresolved);
        assert_eq!(t.position(1), None);
        assert_eq!(t.status(1), Some(SampleStatus::Gap));
    }

    #[test]
    fn short_gaps_filled_long_gaps_flagged() {
        let s = series(100, &[(20, 24), (50, 64)], |t| Position::new(t.sin(), t.cos(), t));
        let t = MarkerTrajectory::build("LHEE", Some(Marker::Lhee), &s, 100.0, 10);
        assert_eq!(t.gaps().len(), 2);
        assert_eq!(t.gaps()[0].status, GapStatus::Interpolated);
        assert_eq!(t.gaps()[1].status, GapStatus::Unresolved);
        assert!((20..=24).all(|i| t.is_interpolated(i) && t.position(i).is_some()));
        assert!((50..=64).all(|i| t.position(i).is_none()));
        assert_eq!(t.unresolved_frames(), 15);
        assert!((t.coverage() - 0.85).abs() < 1e-12);
    }

    #[test]
    fn threshold_is_inclusive() {
        let s = series(40, &[(10, 19)], |t| Position::new(t, 0.0, 0.0));
        let t = MarkerTrajectory::build("X", None, &s, 100.0, 10);
        assert_eq!(t.gaps()[0].status, GapStatus::Interpolated);
        let t = MarkerTrajectory::build("X", None, &s, 100.0, 9);
        assert_eq!(t.gaps()[0].status, GapStatus::Unresolved);
    }
}
