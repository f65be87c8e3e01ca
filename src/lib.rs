//! Gait reconstruction from C3D walking trials.
//!
//! The pipeline runs strictly forward:
//!
//! ```text
//! c3d::read_file -> trajectory::process -> segment::fit -> kinematics::reconstruct
//!                                 \________________________\--> events::detect
//! ```
//!
//! Each stage returns a new layer which [`pipeline::reconstruct`] attaches
//! to a [`Reconstruction`]; nothing is modified in place.

pub mod c3d;
pub mod config;
pub mod error;
pub mod events;
pub mod kinematics;
pub mod markers;
pub mod model;
pub mod pipeline;
pub mod segment;
pub mod trajectory;
pub mod trial;

pub use config::{EventConfig, FitConfig, GapConfig, ReconstructionConfig};
pub use error::{Error, Result, Warning};
pub use events::{GaitEvent, GaitEventKind, Limb};
pub use markers::{Marker, MarkerSet};
pub use model::Model;
pub use pipeline::reconstruct;
pub use trial::{Frame, Reconstruction, Trial, TrialMetadata};

/// The float type for coordinates, angles, etc.
/// Captures store f32 at most, so f64 keeps every source value exactly.
pub type SensorFloat = f64;

/// A 3D marker position in millimetres.
pub type Position = nalgebra::Vector3<SensorFloat>;

/// Calculate the distance in 3D.
///
/// # Example
///
/// ```rust
/// let dist = gait::dist_3d(&[1.0, 0.0, 0.0], &[0.0, 0.0, 0.0]);
/// assert_eq!(dist, 1.0);
/// ```
pub fn dist_3d(coords0: &[SensorFloat], coords1: &[SensorFloat]) -> SensorFloat {
    assert!(coords0.len() == 3);
    assert!(coords1.len() == 3);
    let squared_sum = coords0
        .iter()
        .zip(coords1.iter())
        .map(|(&a, &b)| (a - b) * (a - b))
        .fold(0.0, |acc, x| acc + x);
    squared_sum.sqrt()
}

/// Arithmetic mean, 0.0 for an empty slice.
pub fn mean(values: &[SensorFloat]) -> SensorFloat {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<SensorFloat>() / values.len() as SensorFloat
}

/// Population variance.
pub fn variance(values: &[SensorFloat]) -> SensorFloat {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m) * (v - m)).sum::<SensorFloat>() / values.len() as SensorFloat
}

/// Population standard deviation.
pub fn standard_dev(values: &[SensorFloat]) -> SensorFloat {
    variance(values).sqrt()
}
