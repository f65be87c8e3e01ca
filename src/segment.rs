//! Segment Fitter.
//!
//! Each body segment is a rigid cluster of markers with fixed coordinates
//! in the segment's local frame. Per frame, the rotation and translation
//! mapping the template onto the visible markers is found by least squares
//! (Kabsch / orthogonal Procrustes).

use std::collections::HashSet;
use std::thread;

use log::{debug, info};
use nalgebra::{Matrix3, Rotation3, Vector3};

use crate::config::FitConfig;
use crate::error::{Error, Result, UnresolvedReason, Warning};
use crate::markers::Marker;
use crate::trajectory::{SampleStatus, TrajectoryLayer};
use crate::{dist_3d, mean, standard_dev, Position};

/// Marker coordinates of one segment in its own frame.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentTemplate {
    pub name: String,
    markers: Vec<(Marker, Position)>,
}

impl SegmentTemplate {
    pub fn new(name: impl Into<String>, markers: Vec<(Marker, Position)>) -> Result<SegmentTemplate> {
        let name = name.into();
        if markers.len() < 3 {
            return Err(Error::InvalidModel(format!(
                "segment {} has {} markers, at least 3 needed",
                name,
                markers.len()
            )));
        }
        let mut seen = HashSet::new();
        for (m, _) in &markers {
            if !seen.insert(*m) {
                return Err(Error::InvalidModel(format!(
                    "segment {} lists {} twice",
                    name, m
                )));
            }
        }
        Ok(SegmentTemplate { name, markers })
    }

    pub fn markers(&self) -> &[(Marker, Position)] {
        &self.markers
    }
}

/// Orientation and position of a segment's local frame in the laboratory
/// frame at one instant: `global = rotation * local + translation`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentPose {
    pub rotation: Rotation3<f64>,
    pub translation: Vector3<f64>,
    /// RMS distance (mm) between fitted and observed markers.
    pub rms_residual: f64,
    pub markers_used: usize,
    /// How many of the markers used were interpolated.
    pub interpolated_used: usize,
    pub low_confidence: bool,
}

impl SegmentPose {
    pub fn transform_point(&self, local: &Position) -> Position {
        self.rotation * local + self.translation
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoseSeries {
    pub segment: String,
    poses: Vec<Option<SegmentPose>>,
}

impl PoseSeries {
    pub fn poses(&self) -> &[Option<SegmentPose>] {
        &self.poses
    }

    pub fn pose(&self, frame: usize) -> Option<&SegmentPose> {
        self.poses.get(frame).and_then(|p| p.as_ref())
    }

    pub fn unresolved_count(&self) -> usize {
        self.poses.iter().filter(|p| p.is_none()).count()
    }

    /// Mean and standard deviation of the residual over resolved frames.
    pub fn residual_summary(&self) -> (f64, f64) {
        let residuals: Vec<f64> = self.poses.iter().flatten().map(|p| p.rms_residual).collect();
        (mean(&residuals), standard_dev(&residuals))
    }

    /// One coordinate of the segment origin, `None` where unresolved.
    pub fn origin_axis(&self, axis: usize) -> Vec<Option<f64>> {
        self.poses.iter().map(|p| p.map(|p| p.translation[axis])).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoseLayer {
    frame_count: usize,
    series: Vec<PoseSeries>,
}

impl PoseLayer {
    pub fn series(&self) -> &[PoseSeries] {
        &self.series
    }

    pub fn segment(&self, name: &str) -> Option<&PoseSeries> {
        self.series.iter().find(|s| s.segment == name)
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }
}

/// Best rigid transform mapping `reference` onto `observed` (paired by
/// index). Returns the rotation, translation and RMS residual.
pub fn rigid_fit(
    reference: &[Position],
    observed: &[Position],
    collinearity_tolerance: f64,
) -> std::result::Result<(Rotation3<f64>, Vector3<f64>, f64), UnresolvedReason> {
    let n = reference.len().min(observed.len());
    if n < 3 {
        return Err(UnresolvedReason::TooFewMarkers(n));
    }
    let reference = &reference[..n];
    let observed = &observed[..n];
    if spread(reference) < collinearity_tolerance || spread(observed) < collinearity_tolerance {
        return Err(UnresolvedReason::Collinear);
    }

    let p_mean = centroid(reference);
    let q_mean = centroid(observed);
    let mut h = Matrix3::zeros();
    for (p, q) in reference.iter().zip(observed) {
        h += (p - p_mean) * (q - q_mean).transpose();
    }
    let svd = h.svd(true, true);
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => return Err(UnresolvedReason::Collinear),
    };
    let v = v_t.transpose();
    // Reflection guard.
    let d = if (v * u.transpose()).determinant() < 0.0 { -1.0 } else { 1.0 };
    let correction = Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, d));
    let rotation = Rotation3::from_matrix_unchecked(v * correction * u.transpose());
    let translation = q_mean - rotation * p_mean;

    let squared: f64 = reference
        .iter()
        .zip(observed)
        .map(|(p, q)| {
            let fitted = rotation * p + translation;
            dist_3d(fitted.as_slice(), q.as_slice()).powi(2)
        })
        .sum();
    Ok((rotation, translation, (squared / n as f64).sqrt()))
}

fn centroid(points: &[Position]) -> Position {
    points.iter().fold(Position::zeros(), |acc, p| acc + p) / points.len() as f64
}

/// RMS distance of the points from their best-fit line (mm).
fn spread(points: &[Position]) -> f64 {
    let c = centroid(points);
    let mut cov = Matrix3::zeros();
    for p in points {
        let d = p - c;
        cov += d * d.transpose();
    }
    let mut eigen: Vec<f64> = cov.symmetric_eigenvalues().iter().copied().collect();
    eigen.sort_by(|a, b| b.total_cmp(a));
    // Variance off the principal axis.
    ((eigen[1] + eigen[2]).max(0.0) / points.len() as f64).sqrt()
}

/// Fits one segment at one frame.
pub fn fit_frame(
    template: &SegmentTemplate,
    trajectories: &TrajectoryLayer,
    frame: usize,
    config: &FitConfig,
) -> std::result::Result<SegmentPose, UnresolvedReason> {
    let mut reference = Vec::with_capacity(template.markers.len());
    let mut observed = Vec::with_capacity(template.markers.len());
    let mut interpolated_used = 0;
    for (marker, local) in &template.markers {
        let Some(t) = trajectories.marker(*marker) else {
            continue;
        };
        let usable = match t.status(frame) {
            Some(SampleStatus::Raw) => true,
            Some(SampleStatus::Interpolated) => config.use_interpolated,
            _ => false,
        };
        if let (true, Some(p)) = (usable, t.position(frame)) {
            if t.is_interpolated(frame) {
                interpolated_used += 1;
            }
            reference.push(*local);
            observed.push(p);
        }
    }
    if observed.len() < config.min_markers.max(3) {
        return Err(UnresolvedReason::TooFewMarkers(observed.len()));
    }
    let (rotation, translation, rms_residual) =
        rigid_fit(&reference, &observed, config.collinearity_tolerance_mm)?;
    Ok(SegmentPose {
        rotation,
        translation,
        rms_residual,
        markers_used: observed.len(),
        interpolated_used,
        low_confidence: rms_residual > config.residual_threshold_mm,
    })
}

/// Runs `f` over `0..n`, split in contiguous chunks across `workers`
/// threads. Results keep frame order.
fn map_frames<T, F>(n: usize, workers: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Sync,
{
    if workers <= 1 || n < 2 * workers {
        return (0..n).map(f).collect();
    }
    let chunk = (n + workers - 1) / workers;
    let f = &f;
    thread::scope(|s| {
        let handles: Vec<_> = (0..n)
            .step_by(chunk)
            .map(|start| {
                let end = (start + chunk).min(n);
                s.spawn(move || (start..end).map(f).collect::<Vec<T>>())
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| match h.join() {
                Ok(v) => v,
                Err(e) => std::panic::resume_unwind(e),
            })
            .collect()
    })
}

/// Fits one segment over the whole trial.
pub fn fit_segment(
    template: &SegmentTemplate,
    trajectories: &TrajectoryLayer,
    frame_count: usize,
    config: &FitConfig,
) -> (PoseSeries, Vec<Warning>) {
    let results = map_frames(frame_count, config.workers, |frame| {
        fit_frame(template, trajectories, frame, config)
    });

    let mut warnings = Vec::new();
    let mut run: Option<(usize, usize, UnresolvedReason)> = None;
    let mut poses = Vec::with_capacity(frame_count);
    for (frame, result) in results.into_iter().enumerate() {
        match result {
            Ok(pose) => {
                if let Some((start, end, reason)) = run.take() {
                    warnings.push(unresolved(template, start, end, reason));
                }
                if pose.low_confidence {
                    warnings.push(Warning::LowConfidenceFit {
                        segment: template.name.clone(),
                        frame,
                        rms_mm: pose.rms_residual,
                    });
                }
                poses.push(Some(pose));
            }
            Err(reason) => {
                run = match run {
                    Some((start, end, r)) if r == reason && end + 1 == frame => {
                        Some((start, frame, r))
                    }
                    Some((start, end, r)) => {
                        warnings.push(unresolved(template, start, end, r));
                        Some((frame, frame, reason))
                    }
                    None => Some((frame, frame, reason)),
                };
                poses.push(None);
            }
        }
    }
    if let Some((start, end, reason)) = run {
        warnings.push(unresolved(template, start, end, reason));
    }

    let series = PoseSeries {
        segment: template.name.clone(),
        poses,
    };
    let (residual, residual_sd) = series.residual_summary();
    debug!(
        "{}: {} unresolved frames, residual {:.2} +/- {:.2} mm",
        series.segment,
        series.unresolved_count(),
        residual,
        residual_sd
    );
    (series, warnings)
}

fn unresolved(template: &SegmentTemplate, start: usize, end: usize, reason: UnresolvedReason) -> Warning {
    Warning::UnresolvedPose {
        segment: template.name.clone(),
        start,
        end,
        reason,
    }
}

/// Fits every segment template over the whole trial.
pub fn fit(
    templates: &[SegmentTemplate],
    trajectories: &TrajectoryLayer,
    frame_count: usize,
    config: &FitConfig,
) -> (PoseLayer, Vec<Warning>) {
    let mut series = Vec::with_capacity(templates.len());
    let mut warnings = Vec::new();
    for template in templates {
        let (s, w) = fit_segment(template, trajectories, frame_count, config);
        series.push(s);
        warnings.extend(w);
    }
    let unresolved: usize = series.iter().map(|s| s.unresolved_count()).sum();
    info!(
        "Segments: {} fitted over {} frames, {} unresolved poses.",
        series.len(),
        frame_count,
        unresolved
    );
    (
        PoseLayer {
            frame_count,
            series,
        },
        warnings,
    )
}
