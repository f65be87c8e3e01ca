//! The in-memory trial and the layers later stages attach to it.

use std::time::SystemTime;

use crate::error::{Error, Result, Warning};
use crate::events::EventLayer;
use crate::kinematics::AngleLayer;
use crate::markers::{Marker, MarkerSet};
use crate::segment::PoseLayer;
use crate::trajectory::TrajectoryLayer;
use crate::Position;

/// Descriptive fields of a recording.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrialMetadata {
    pub subject_id: Option<String>,
    pub trial_id: Option<String>,
    pub capture_time: Option<SystemTime>,
    /// First frame number as stored in the capture header (1-based).
    pub first_frame: usize,
    /// Units the capture was recorded in, before normalising to mm.
    pub native_units: String,
}

/// One time sample. Positions are in millimetres, indexed by column of
/// the trial's [`MarkerSet`]; `None` means occluded.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub index: usize,
    pub timestamp: f64,
    positions: Vec<Option<Position>>,
}

impl Frame {
    pub fn positions(&self) -> &[Option<Position>] {
        &self.positions
    }

    pub fn position(&self, column: usize) -> Option<Position> {
        self.positions.get(column).copied().flatten()
    }

    pub fn is_valid(&self, column: usize) -> bool {
        self.position(column).is_some()
    }

    /// Columns with a reading in this frame.
    pub fn valid_columns(&self) -> impl Iterator<Item = usize> + '_ {
        self.positions
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_some())
            .map(|(i, _)| i)
    }
}

/// One recorded walking session, as decoded from the capture.
#[derive(Debug, Clone, PartialEq)]
pub struct Trial {
    pub metadata: TrialMetadata,
    frame_rate: f64,
    markers: MarkerSet,
    frames: Vec<Frame>,
}

impl Trial {
    /// Builds a trial from rows of per-column positions (mm).
    pub fn new(
        metadata: TrialMetadata,
        frame_rate: f64,
        labels: Vec<String>,
        rows: Vec<Vec<Option<Position>>>,
    ) -> Result<Trial> {
        if !(frame_rate.is_finite() && frame_rate > 0.0) {
            return Err(Error::malformed(format!("invalid frame rate {}", frame_rate)));
        }
        let markers = MarkerSet::new(labels)?;
        let mut frames = Vec::with_capacity(rows.len());
        for (index, positions) in rows.into_iter().enumerate() {
            if positions.len() != markers.len() {
                return Err(Error::malformed(format!(
                    "frame {} has {} positions, expected {}",
                    index,
                    positions.len(),
                    markers.len()
                )));
            }
            frames.push(Frame {
                index,
                timestamp: index as f64 / frame_rate,
                positions,
            });
        }
        Ok(Trial {
            metadata,
            frame_rate,
            markers,
            frames,
        })
    }

    pub fn frame_rate(&self) -> f64 {
        self.frame_rate
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        self.frames.len() as f64 / self.frame_rate
    }

    pub fn markers(&self) -> &MarkerSet {
        &self.markers
    }

    pub fn labels(&self) -> &[String] {
        self.markers.labels()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Position of a known marker in a frame.
    pub fn position(&self, marker: Marker, frame: usize) -> Option<Position> {
        let column = self.markers.index_of(marker)?;
        self.frames.get(frame)?.position(column)
    }

    /// The raw series of one column.
    pub fn column(&self, column: usize) -> Vec<Option<Position>> {
        self.frames.iter().map(|f| f.position(column)).collect()
    }
}

/// A trial plus every layer derived from it.
///
/// Layers are attached once, in pipeline order, and never modified, so a
/// failing later stage leaves the earlier ones intact.
#[derive(Debug, Clone)]
pub struct Reconstruction {
    trial: Trial,
    trajectories: Option<TrajectoryLayer>,
    poses: Option<PoseLayer>,
    angles: Option<AngleLayer>,
    events: Option<EventLayer>,
    diagnostics: Vec<Warning>,
}

impl Reconstruction {
    pub fn new(trial: Trial) -> Reconstruction {
        Reconstruction {
            trial,
            trajectories: None,
            poses: None,
            angles: None,
            events: None,
            diagnostics: Vec::new(),
        }
    }

    pub fn trial(&self) -> &Trial {
        &self.trial
    }

    pub fn trajectories(&self) -> Option<&TrajectoryLayer> {
        self.trajectories.as_ref()
    }

    pub fn poses(&self) -> Option<&PoseLayer> {
        self.poses.as_ref()
    }

    pub fn angles(&self) -> Option<&AngleLayer> {
        self.angles.as_ref()
    }

    pub fn events(&self) -> Option<&EventLayer> {
        self.events.as_ref()
    }

    pub fn diagnostics(&self) -> &[Warning] {
        &self.diagnostics
    }

    pub(crate) fn attach_trajectories(&mut self, layer: TrajectoryLayer, warnings: Vec<Warning>) {
        debug_assert!(self.trajectories.is_none());
        self.trajectories.get_or_insert(layer);
        self.diagnostics.extend(warnings);
    }

    pub(crate) fn attach_poses(&mut self, layer: PoseLayer, warnings: Vec<Warning>) {
        debug_assert!(self.poses.is_none());
        self.poses.get_or_insert(layer);
        self.diagnostics.extend(warnings);
    }

    pub(crate) fn attach_angles(&mut self, layer: AngleLayer) {
        debug_assert!(self.angles.is_none());
        self.angles.get_or_insert(layer);
    }

    pub(crate) fn attach_events(&mut self, layer: EventLayer, warnings: Vec<Warning>) {
        debug_assert!(self.events.is_none());
        self.events.get_or_insert(layer);
        self.diagnostics.extend(warnings);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(x: f64) -> Option<Position> {
        Some(Position::new(x, 0.0, 0.0))
    }

    #[test]
    fn timestamps_follow_frame_rate() {
        let trial = Trial::new(
            TrialMetadata::default(),
            100.0,
            vec!["LASI".to_string()],
            vec![vec![p(0.0)], vec![None], vec![p(2.0)]],
        )
        .unwrap();
        assert_eq!(trial.frame_count(), 3);
        assert!((trial.frames()[2].timestamp - 0.02).abs() < 1e-12);
        assert_eq!(trial.position(Marker::Lasi, 1), None);
        assert_eq!(trial.position(Marker::Lasi, 2), p(2.0));
        assert_eq!(trial.position(Marker::Rasi, 0), None);
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let trial = Trial::new(
            TrialMetadata::default(),
            100.0,
            vec!["LASI".to_string(), "RASI".to_string()],
            vec![vec![p(0.0), p(1.0)], vec![p(0.0)]],
        );
        assert!(matches!(trial, Err(Error::MalformedCapture(_))));
    }

    #[test]
    fn zero_frame_rate_is_rejected() {
        let trial = Trial::new(TrialMetadata::default(), 0.0, vec![], vec![]);
        assert!(trial.is_err());
    }
}
