//! Kinematic Reconstructor.
//!
//! Joint angles are the Cardan decomposition of the child segment's
//! orientation expressed in the parent's frame, `R = Rparentᵀ · Rchild`.
//!
//! Segment frames follow the lower-body model: X points to the subject's
//! right, Y anterior, Z superior (the foot has Y superior and Z
//! posterior). Joints use the X-Y'-Z'' sequence, i.e. flexion about the
//! medio-lateral axis first, then the floating axis, then the long axis of
//! the child, which matches the Grood & Suntay joint coordinate system.
//! Reported angles are `sign * angle + offset` per component:
//!
//! | joint  | components                                   | right       | left        |
//! |--------|----------------------------------------------|-------------|-------------|
//! | hip    | flexion, adduction, internal rotation        | +1 +1 +1    | +1 -1 -1    |
//! | knee   | flexion, adduction, internal rotation        | -1 +1 +1    | -1 -1 -1    |
//! | ankle  | dorsiflexion, internal rotation, inversion   | +1 +1 -1    | +1 -1 +1    |
//! | lumbar | flexion, right lateral bend, left rotation   | -1 +1 +1    |             |
//!
//! The ankle flexion component is offset by -90 degrees because the foot's
//! long axis is horizontal when the shank's is vertical.

use log::info;
use nalgebra::{Matrix3, Rotation3, Vector3};

use crate::events::Limb;
use crate::model::JointDefinition;
use crate::segment::{PoseLayer, PoseSeries};

/// Order of the three elementary rotations, applied about moving axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardanSequence {
    XYZ,
    XZY,
    YXZ,
    YZX,
    ZXY,
    ZYX,
}

impl CardanSequence {
    pub fn axes(self) -> [usize; 3] {
        match self {
            CardanSequence::XYZ => [0, 1, 2],
            CardanSequence::XZY => [0, 2, 1],
            CardanSequence::YXZ => [1, 0, 2],
            CardanSequence::YZX => [1, 2, 0],
            CardanSequence::ZXY => [2, 0, 1],
            CardanSequence::ZYX => [2, 1, 0],
        }
    }

    fn is_cyclic(self) -> bool {
        matches!(
            self,
            CardanSequence::XYZ | CardanSequence::YZX | CardanSequence::ZXY
        )
    }

    /// Splits a rotation matrix into the three angles (radians) such that
    /// `R = R_i(a) · R_j(b) · R_k(c)`, with `b` in [-π/2, π/2].
    pub fn decompose(self, m: &Matrix3<f64>) -> [f64; 3] {
        let [i, j, k] = self.axes();
        let s = if self.is_cyclic() { 1.0 } else { -1.0 };
        let b = (s * m[(i, k)]).clamp(-1.0, 1.0).asin();
        let a = (-s * m[(j, k)]).atan2(m[(k, k)]);
        let c = (-s * m[(i, j)]).atan2(m[(i, i)]);
        [a, b, c]
    }

    /// Inverse of [`CardanSequence::decompose`].
    pub fn compose(self, angles: [f64; 3]) -> Rotation3<f64> {
        let axes = self.axes();
        axes.iter()
            .zip(angles.iter())
            .map(|(&axis, &angle)| Rotation3::from_axis_angle(&unit_axis(axis), angle))
            .fold(Rotation3::identity(), |acc, r| acc * r)
    }
}

fn unit_axis(axis: usize) -> nalgebra::Unit<Vector3<f64>> {
    match axis {
        0 => Vector3::x_axis(),
        1 => Vector3::y_axis(),
        _ => Vector3::z_axis(),
    }
}

/// How a joint's relative rotation becomes reported angles.
#[derive(Debug, Clone, PartialEq)]
pub struct JointConvention {
    pub sequence: CardanSequence,
    pub signs: [f64; 3],
    pub offsets_deg: [f64; 3],
    pub components: [&'static str; 3],
}

impl JointConvention {
    /// Plain decomposition, no sign changes or offsets.
    pub fn raw(sequence: CardanSequence) -> JointConvention {
        JointConvention {
            sequence,
            signs: [1.0; 3],
            offsets_deg: [0.0; 3],
            components: ["first", "second", "third"],
        }
    }

    pub fn hip(side: Limb) -> JointConvention {
        JointConvention {
            sequence: CardanSequence::XYZ,
            signs: match side {
                Limb::Right => [1.0, 1.0, 1.0],
                Limb::Left => [1.0, -1.0, -1.0],
            },
            offsets_deg: [0.0; 3],
            components: ["flexion", "adduction", "internal_rotation"],
        }
    }

    pub fn knee(side: Limb) -> JointConvention {
        JointConvention {
            sequence: CardanSequence::XYZ,
            signs: match side {
                Limb::Right => [-1.0, 1.0, 1.0],
                Limb::Left => [-1.0, -1.0, -1.0],
            },
            offsets_deg: [0.0; 3],
            components: ["flexion", "adduction", "internal_rotation"],
        }
    }

    pub fn ankle(side: Limb) -> JointConvention {
        JointConvention {
            sequence: CardanSequence::XYZ,
            signs: match side {
                Limb::Right => [1.0, 1.0, -1.0],
                Limb::Left => [1.0, -1.0, 1.0],
            },
            offsets_deg: [-90.0, 0.0, 0.0],
            components: ["dorsiflexion", "internal_rotation", "inversion"],
        }
    }

    pub fn lumbar() -> JointConvention {
        JointConvention {
            sequence: CardanSequence::XYZ,
            signs: [-1.0, 1.0, 1.0],
            offsets_deg: [0.0; 3],
            components: ["flexion", "lateral_bend_right", "axial_rotation_left"],
        }
    }

    /// Reported angles (degrees) for a relative rotation.
    pub fn angles(&self, relative: &Rotation3<f64>) -> [f64; 3] {
        let raw = self.sequence.decompose(relative.matrix());
        let mut out = [0.0; 3];
        for n in 0..3 {
            out[n] = self.signs[n] * raw[n].to_degrees() + self.offsets_deg[n];
        }
        out
    }
}

/// Angles of one joint per frame; `None` wherever either segment pose is
/// unresolved.
#[derive(Debug, Clone, PartialEq)]
pub struct AngleSeries {
    pub joint: String,
    pub components: [&'static str; 3],
    samples: Vec<Option<[f64; 3]>>,
}

impl AngleSeries {
    pub fn samples(&self) -> &[Option<[f64; 3]>] {
        &self.samples
    }

    pub fn angle(&self, frame: usize) -> Option<[f64; 3]> {
        self.samples.get(frame).copied().flatten()
    }

    pub fn unresolved_count(&self) -> usize {
        self.samples.iter().filter(|s| s.is_none()).count()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AngleLayer {
    series: Vec<AngleSeries>,
}

impl AngleLayer {
    pub fn series(&self) -> &[AngleSeries] {
        &self.series
    }

    pub fn joint(&self, name: &str) -> Option<&AngleSeries> {
        self.series.iter().find(|s| s.joint == name)
    }
}

/// Angles between two pose series, unwrapped within runs of resolved
/// frames.
pub fn joint_angles(
    parent: &PoseSeries,
    child: &PoseSeries,
    convention: &JointConvention,
) -> Vec<Option<[f64; 3]>> {
    let mut samples: Vec<Option<[f64; 3]>> = parent
        .poses()
        .iter()
        .zip(child.poses())
        .map(|(p, c)| match (p, c) {
            (Some(p), Some(c)) => {
                let relative = p.rotation.inverse() * c.rotation;
                Some(convention.angles(&relative))
            }
            _ => None,
        })
        .collect();
    unwrap_degrees(&mut samples);
    samples
}

/// Removes 360 degree jumps between consecutive resolved samples. Gaps
/// break the chain.
pub fn unwrap_degrees(samples: &mut [Option<[f64; 3]>]) {
    let mut prev: Option<[f64; 3]> = None;
    for sample in samples.iter_mut() {
        match (sample.as_mut(), prev) {
            (Some(cur), Some(p)) => {
                for n in 0..3 {
                    while cur[n] - p[n] > 180.0 {
                        cur[n] -= 360.0;
                    }
                    while cur[n] - p[n] < -180.0 {
                        cur[n] += 360.0;
                    }
                }
                prev = Some(*cur);
            }
            (Some(cur), None) => prev = Some(*cur),
            (None, _) => prev = None,
        }
    }
}

/// Computes every joint of the model from the pose layer.
pub fn reconstruct(poses: &PoseLayer, joints: &[JointDefinition]) -> AngleLayer {
    let series: Vec<AngleSeries> = joints
        .iter()
        .map(|joint| {
            let samples = match (poses.segment(&joint.parent), poses.segment(&joint.child)) {
                (Some(parent), Some(child)) => joint_angles(parent, child, &joint.convention),
                _ => vec![None; poses.frame_count()],
            };
            AngleSeries {
                joint: joint.name.clone(),
                components: joint.convention.components,
                samples,
            }
        })
        .collect();
    let unresolved: usize = series.iter().map(|s| s.unresolved_count()).sum();
    info!(
        "Kinematics: {} joints, {} unresolved joint samples.",
        series.len(),
        unresolved
    );
    AngleLayer { series }
}
