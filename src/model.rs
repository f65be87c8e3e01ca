//! Segment and joint definitions, and static calibration.
//!
//! A [`ModelDefinition`] says which markers track which segment and how
//! each segment's anatomical frame is built from landmarks. Calibrating it
//! against a static trial yields a [`Model`]: one [`SegmentTemplate`] per
//! segment, with marker coordinates in the anatomical frame.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use log::{debug, info};
use nalgebra::Matrix3;

use crate::error::{Error, Result};
use crate::events::Limb;
use crate::kinematics::JointConvention;
use crate::markers::Marker;
use crate::segment::SegmentTemplate;
use crate::trial::Trial;
use crate::Position;

/// Shortest axis (mm) accepted when building an anatomical frame.
const MIN_AXIS_LENGTH: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }
}

/// An axis running from the mean of `start` to the mean of `end`.
#[derive(Debug, Clone, PartialEq)]
pub struct AxisDefinition {
    pub axis: Axis,
    pub start: Vec<Marker>,
    pub end: Vec<Marker>,
}

impl AxisDefinition {
    pub fn new(axis: Axis, start: &[Marker], end: &[Marker]) -> AxisDefinition {
        AxisDefinition {
            axis,
            start: start.to_vec(),
            end: end.to_vec(),
        }
    }
}

/// Anatomical frame of a segment. The axis not named by `first` or
/// `second` is their cross product; then whichever of the two is not
/// `keep` is recomputed so the frame is orthonormal.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameDefinition {
    pub origin: Vec<Marker>,
    pub first: AxisDefinition,
    pub second: AxisDefinition,
    pub keep: Axis,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentDefinition {
    pub name: String,
    /// Markers rigidly attached to the segment and used for tracking.
    pub technical: Vec<Marker>,
    pub frame: FrameDefinition,
}

/// Parent and child segment of a joint, and how its angles are reported.
#[derive(Debug, Clone, PartialEq)]
pub struct JointDefinition {
    pub name: String,
    pub parent: String,
    pub child: String,
    pub convention: JointConvention,
}

/// Where the event detector looks for one limb's foot.
#[derive(Debug, Clone, PartialEq)]
pub struct LimbSignals {
    pub limb: Limb,
    pub heel: Marker,
    /// Segment whose origin is used when the heel marker is unusable.
    pub foot: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelDefinition {
    pub segments: Vec<SegmentDefinition>,
    pub joints: Vec<JointDefinition>,
    pub limbs: Vec<LimbSignals>,
}

fn segment(
    name: &str,
    technical: &[Marker],
    origin: &[Marker],
    first: AxisDefinition,
    second: AxisDefinition,
    keep: Axis,
) -> SegmentDefinition {
    SegmentDefinition {
        name: name.to_string(),
        technical: technical.to_vec(),
        frame: FrameDefinition {
            origin: origin.to_vec(),
            first,
            second,
            keep,
        },
    }
}

fn joint(name: &str, parent: &str, child: &str, convention: JointConvention) -> JointDefinition {
    JointDefinition {
        name: name.to_string(),
        parent: parent.to_string(),
        child: child.to_string(),
        convention,
    }
}

/// The lower-body and trunk marker model. Thigh origins sit on the
/// anterior iliac spines (no functional hip centre).
pub fn lower_body_definition() -> ModelDefinition {
    use Axis::*;
    use Marker::*;

    let asis = [Lasi, Rasi];
    let psis = [Lpsi, Rpsi];
    let lknee = [Lknee, Lkneem];
    let rknee = [Rknee, Rkneem];
    let lankle = [Lank, Lankm];
    let rankle = [Rank, Rankm];

    let segments = vec![
        segment(
            "Pelvis",
            &[Lpsi, Rpsi, Lasi, Rasi],
            &[Lpsi, Rpsi, Lasi, Rasi],
            AxisDefinition::new(X, &[Lpsi, Lasi], &[Rpsi, Rasi]),
            AxisDefinition::new(Y, &psis, &asis),
            Y,
        ),
        segment(
            "Trunk",
            &[C7, C2, T6, T10, S1, S3, Clav, Strn],
            &[Clav],
            AxisDefinition::new(Y, &[T10, C7], &[Strn, Clav]),
            AxisDefinition::new(Z, &[T10, Strn], &[C7, Clav]),
            Z,
        ),
        segment(
            "LThigh",
            &[Lthi, Lthib, Lthid],
            &[Lasi],
            AxisDefinition::new(Z, &lknee, &[Lasi]),
            AxisDefinition::new(X, &[Lasi], &[Rasi]),
            Z,
        ),
        segment(
            "LShank",
            &[Ltib, Ltibf, Ltibd],
            &lknee,
            AxisDefinition::new(Z, &lankle, &lknee),
            AxisDefinition::new(X, &lknee, &[Lkneem]),
            X,
        ),
        segment(
            "LFoot",
            &[Lhee, Lnav, Ltoe, Ltoe5],
            &lankle,
            AxisDefinition::new(Z, &[Ltoe], &[Lhee]),
            AxisDefinition::new(X, &[Lank], &[Lankm]),
            X,
        ),
        segment(
            "RThigh",
            &[Rthi, Rthib, Rthid],
            &[Rasi],
            AxisDefinition::new(Z, &rknee, &[Rasi]),
            AxisDefinition::new(X, &[Lasi], &[Rasi]),
            Z,
        ),
        segment(
            "RShank",
            &[Rtib, Rtibf, Rtibd],
            &rknee,
            AxisDefinition::new(Z, &rankle, &rknee),
            AxisDefinition::new(X, &[Rkneem], &rknee),
            X,
        ),
        segment(
            "RFoot",
            &[Rhee, Rnav, Rtoe, Rtoe5],
            &rankle,
            AxisDefinition::new(Z, &[Rtoe], &[Rhee]),
            AxisDefinition::new(X, &[Rankm], &[Rank]),
            X,
        ),
    ];

    let joints = vec![
        joint("LHip", "Pelvis", "LThigh", JointConvention::hip(Limb::Left)),
        joint("LKnee", "LThigh", "LShank", JointConvention::knee(Limb::Left)),
        joint("LAnkle", "LShank", "LFoot", JointConvention::ankle(Limb::Left)),
        joint("RHip", "Pelvis", "RThigh", JointConvention::hip(Limb::Right)),
        joint("RKnee", "RThigh", "RShank", JointConvention::knee(Limb::Right)),
        joint("RAnkle", "RShank", "RFoot", JointConvention::ankle(Limb::Right)),
        joint("Lumbar", "Pelvis", "Trunk", JointConvention::lumbar()),
    ];

    let limbs = vec![
        LimbSignals {
            limb: Limb::Left,
            heel: Lhee,
            foot: Some("LFoot".to_string()),
        },
        LimbSignals {
            limb: Limb::Right,
            heel: Rhee,
            foot: Some("RFoot".to_string()),
        },
    ];

    ModelDefinition {
        segments,
        joints,
        limbs,
    }
}

/// Builds an orthonormal right-handed frame (columns are the X, Y and Z
/// axes) from two named axis directions.
pub fn build_frame(
    first: (Axis, Position),
    second: (Axis, Position),
    keep: Axis,
) -> Option<Matrix3<f64>> {
    let (a, b) = (first.0.index(), second.0.index());
    if a == b || (keep != first.0 && keep != second.0) {
        return None;
    }
    let mut axes = [Position::zeros(); 3];
    axes[a] = first.1.try_normalize(MIN_AXIS_LENGTH)?;
    axes[b] = second.1.try_normalize(MIN_AXIS_LENGTH)?;
    let third = 3 - a - b;
    axes[third] = cyclic_cross(&axes, third).try_normalize(MIN_AXIS_LENGTH)?;
    let other = if keep == first.0 { b } else { a };
    axes[other] = cyclic_cross(&axes, other).try_normalize(MIN_AXIS_LENGTH)?;
    Some(Matrix3::from_columns(&axes))
}

/// x = y × z, y = z × x, z = x × y.
fn cyclic_cross(axes: &[Position; 3], axis: usize) -> Position {
    axes[(axis + 1) % 3].cross(&axes[(axis + 2) % 3])
}

/// Segment templates plus the joints and limbs relating them.
#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    segments: Vec<SegmentTemplate>,
    joints: Vec<JointDefinition>,
    limbs: Vec<LimbSignals>,
}

impl Model {
    /// Checks that segment names are unique and that every joint and limb
    /// refers to a known segment.
    pub fn new(
        segments: Vec<SegmentTemplate>,
        joints: Vec<JointDefinition>,
        limbs: Vec<LimbSignals>,
    ) -> Result<Model> {
        let mut names = HashSet::new();
        for s in &segments {
            if !names.insert(s.name.as_str()) {
                return Err(Error::InvalidModel(format!("segment {} defined twice", s.name)));
            }
        }
        for j in &joints {
            for seg in [&j.parent, &j.child] {
                if !names.contains(seg.as_str()) {
                    return Err(Error::InvalidModel(format!(
                        "joint {} refers to unknown segment {}",
                        j.name, seg
                    )));
                }
            }
            if j.parent == j.child {
                return Err(Error::InvalidModel(format!(
                    "joint {} connects {} to itself",
                    j.name, j.parent
                )));
            }
        }
        for l in &limbs {
            if let Some(foot) = &l.foot {
                if !names.contains(foot.as_str()) {
                    return Err(Error::InvalidModel(format!(
                        "{:?} foot refers to unknown segment {}",
                        l.limb, foot
                    )));
                }
            }
        }
        Ok(Model {
            segments,
            joints,
            limbs,
        })
    }

    /// Expresses every segment's technical markers in its anatomical frame,
    /// using marker positions averaged over the static trial.
    pub fn calibrate(definition: &ModelDefinition, static_trial: &Trial) -> Result<Model> {
        let averages = average_positions(static_trial);
        let total = static_trial.frame_count();
        let lookup = |markers: &[Marker]| -> Result<Position> {
            let mut sum = Position::zeros();
            for m in markers {
                match averages.get(m) {
                    Some(p) => sum += p,
                    None => {
                        return Err(Error::InsufficientData {
                            marker: m.to_string(),
                            unresolved: total,
                            total,
                        })
                    }
                }
            }
            Ok(sum / markers.len().max(1) as f64)
        };

        let mut templates = Vec::with_capacity(definition.segments.len());
        for def in &definition.segments {
            let f = &def.frame;
            if f.origin.is_empty() {
                return Err(Error::InvalidModel(format!("segment {} has no origin markers", def.name)));
            }
            let origin = lookup(f.origin.as_slice())?;
            let first = lookup(f.first.end.as_slice())? - lookup(f.first.start.as_slice())?;
            let second = lookup(f.second.end.as_slice())? - lookup(f.second.start.as_slice())?;
            let axes = build_frame((f.first.axis, first), (f.second.axis, second), f.keep)
                .ok_or_else(|| {
                    Error::InvalidModel(format!("degenerate anatomical frame for {}", def.name))
                })?;

            let mut markers = Vec::with_capacity(def.technical.len());
            for &m in &def.technical {
                let global = lookup(std::slice::from_ref(&m))?;
                markers.push((m, axes.transpose() * (global - origin)));
            }
            debug!("{}: calibrated {} technical markers", def.name, markers.len());
            templates.push(SegmentTemplate::new(def.name.clone(), markers)?);
        }

        let model = Model::new(templates, definition.joints.clone(), definition.limbs.clone())?;
        info!(
            "Model: {} segments, {} joints calibrated from {} static frames.",
            model.segments.len(),
            model.joints.len(),
            total
        );
        Ok(model)
    }

    pub fn segments(&self) -> &[SegmentTemplate] {
        &self.segments
    }

    pub fn segment(&self, name: &str) -> Option<&SegmentTemplate> {
        self.segments.iter().find(|s| s.name == name)
    }

    pub fn joints(&self) -> &[JointDefinition] {
        &self.joints
    }

    pub fn limbs(&self) -> &[LimbSignals] {
        &self.limbs
    }

    /// Every marker some segment template tracks.
    pub fn required_markers(&self) -> Vec<Marker> {
        let set: BTreeSet<Marker> = self
            .segments
            .iter()
            .flat_map(|s| s.markers().iter().map(|(m, _)| *m))
            .collect();
        set.into_iter().collect()
    }
}

/// Mean position of each known marker over the frames where it is
/// visible. Markers never seen are absent from the map.
fn average_positions(trial: &Trial) -> BTreeMap<Marker, Position> {
    let mut averages = BTreeMap::new();
    for marker in trial.markers().markers() {
        let Some(column) = trial.markers().index_of(marker) else {
            continue;
        };
        let (sum, n) = trial
            .frames()
            .iter()
            .filter_map(|f| f.position(column))
            .fold((Position::zeros(), 0usize), |(s, n), p| (s + p, n + 1));
        if n > 0 {
            averages.insert(marker, sum / n as f64);
        }
    }
    averages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trial::TrialMetadata;

    #[test]
    fn frame_is_orthonormal_and_keeps_axis() {
        let m = build_frame(
            (Axis::X, Position::new(1.0, 0.2, 0.0)),
            (Axis::Y, Position::new(0.0, 1.0, 0.0)),
            Axis::Y,
        )
        .unwrap();
        assert!((m.transpose() * m - Matrix3::identity()).norm() < 1e-12);
        assert!((m.determinant() - 1.0).abs() < 1e-12);
        assert!((m.column(1) - Position::y()).norm() < 1e-12);
    }

    #[test]
    fn parallel_axes_are_degenerate() {
        let v = Position::new(0.0, 0.0, 1.0);
        assert!(build_frame((Axis::Z, v), (Axis::X, v * 2.0), Axis::Z).is_none());
        assert!(build_frame((Axis::Z, v), (Axis::Z, v), Axis::Z).is_none());
        assert!(build_frame((Axis::Z, v), (Axis::X, Position::x()), Axis::Y).is_none());
    }

    #[test]
    fn lower_body_is_consistent() {
        let def = lower_body_definition();
        assert_eq!(def.segments.len(), 8);
        assert_eq!(def.joints.len(), 7);
        let names: HashSet<&str> = def.segments.iter().map(|s| s.name.as_str()).collect();
        for j in &def.joints {
            assert!(names.contains(j.parent.as_str()) && names.contains(j.child.as_str()));
        }
    }

    fn upright_pelvis() -> Trial {
        // Subject facing +Y, Z up.
        let labels = vec!["LPSI", "RPSI", "LASI", "RASI"]
            .into_iter()
            .map(String::from)
            .collect();
        let row = vec![
            Some(Position::new(-50.0, -80.0, 1000.0)),
            Some(Position::new(50.0, -80.0, 1000.0)),
            Some(Position::new(-120.0, 80.0, 1000.0)),
            Some(Position::new(120.0, 80.0, 1000.0)),
        ];
        Trial::new(TrialMetadata::default(), 100.0, labels, vec![row; 5]).unwrap()
    }

    fn pelvis_only() -> ModelDefinition {
        let mut def = lower_body_definition();
        def.segments.retain(|s| s.name == "Pelvis");
        def.joints.clear();
        def.limbs.clear();
        def
    }

    #[test]
    fn calibration_expresses_markers_in_anatomical_frame() {
        let model = Model::calibrate(&pelvis_only(), &upright_pelvis()).unwrap();
        let pelvis = model.segment("Pelvis").unwrap();
        // Lab frame and anatomical frame coincide, origin at the centroid.
        let (m, rasi) = pelvis.markers()[3];
        assert_eq!(m, Marker::Rasi);
        assert!((rasi - Position::new(120.0, 80.0, 0.0)).norm() < 1e-9);
        assert_eq!(
            model.required_markers(),
            vec![Marker::Lpsi, Marker::Rpsi, Marker::Lasi, Marker::Rasi]
        );
    }

    #[test]
    fn calibration_needs_every_landmark() {
        let err = Model::calibrate(&lower_body_definition(), &upright_pelvis());
        assert!(matches!(err, Err(Error::InsufficientData { .. })));
    }

    #[test]
    fn joints_must_reference_segments() {
        let model = Model::calibrate(&pelvis_only(), &upright_pelvis()).unwrap();
        let segments = model.segments().to_vec();
        let bad = vec![joint("LHip", "Pelvis", "LThigh", JointConvention::hip(Limb::Left))];
        assert!(matches!(
            Model::new(segments.clone(), bad, vec![]),
            Err(Error::InvalidModel(_))
        ));
        let twice = vec![segments[0].clone(), segments[0].clone()];
        assert!(Model::new(twice, vec![], vec![]).is_err());
    }
}
