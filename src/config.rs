//! Parameters threaded through the pipeline stages.
//!
//! Nothing in the library reads these from the environment; the binary
//! fills them from the command line.

use crate::error::{Error, Result};

/// All stage parameters for one reconstruction run.
#[derive(Debug, Clone, Default)]
pub struct ReconstructionConfig {
    pub gaps: GapConfig,
    pub fit: FitConfig,
    pub events: EventConfig,
}

impl ReconstructionConfig {
    /// Rejects parameters the stages cannot work with.
    pub fn validate(&self) -> Result<()> {
        let fraction = self.gaps.max_unresolved_fraction;
        if !(0.0..=1.0).contains(&fraction) {
            return Err(Error::InvalidConfig(format!(
                "max_unresolved_fraction {} not in [0, 1]",
                fraction
            )));
        }
        if self.fit.min_markers < 3 {
            return Err(Error::InvalidConfig(format!(
                "min_markers {} below 3",
                self.fit.min_markers
            )));
        }
        if self.events.vertical_axis > 2 {
            return Err(Error::InvalidConfig(format!(
                "vertical_axis {} is not 0, 1 or 2",
                self.events.vertical_axis
            )));
        }
        if self.events.smoothing_window % 2 == 0 {
            return Err(Error::InvalidConfig(format!(
                "smoothing_window must be odd, got {}",
                self.events.smoothing_window
            )));
        }
        if self.events.min_event_spacing_s < 0.0 {
            return Err(Error::InvalidConfig("min_event_spacing_s is negative".into()));
        }
        Ok(())
    }
}

/// Marker trajectory processing.
#[derive(Debug, Clone)]
pub struct GapConfig {
    /// Longest gap (in frames) that is filled by interpolation.
    pub max_fill_gap: usize,
    /// Largest unresolved share of the trial tolerated for a marker the
    /// model needs.
    pub max_unresolved_fraction: f64,
}

impl Default for GapConfig {
    fn default() -> Self {
        Self {
            max_fill_gap: 10,
            max_unresolved_fraction: 0.10,
        }
    }
}

/// Rigid segment fitting.
#[derive(Debug, Clone)]
pub struct FitConfig {
    /// Minimum visible, non-collinear markers for a pose.
    pub min_markers: usize,
    /// RMS residual (mm) above which a pose is flagged low-confidence.
    pub residual_threshold_mm: f64,
    /// Spread (mm) below which a marker cluster counts as collinear.
    pub collinearity_tolerance_mm: f64,
    /// Whether interpolated marker samples take part in the fit.
    pub use_interpolated: bool,
    /// Threads used for per-frame fitting within one trial.
    pub workers: usize,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            min_markers: 3,
            residual_threshold_mm: 10.0,
            collinearity_tolerance_mm: 1.0,
            use_interpolated: true,
            workers: 1,
        }
    }
}

/// Gait event detection.
#[derive(Debug, Clone)]
pub struct EventConfig {
    /// Index of the laboratory vertical axis (0 = X, 1 = Y, 2 = Z).
    pub vertical_axis: usize,
    /// Centred moving-average window (frames) applied to the velocity.
    /// Must be odd so the window is symmetric around each frame.
    pub smoothing_window: usize,
    /// Downward velocity (mm/s) a heel-strike minimum must exceed.
    pub heel_strike_velocity: f64,
    /// Upward velocity (mm/s) a toe-off maximum must exceed.
    pub toe_off_velocity: f64,
    /// Minimum time (s) between two events of the same kind.
    pub min_event_spacing_s: f64,
    /// Share of valid heel samples required before falling back to the
    /// foot segment.
    pub min_signal_coverage: f64,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            vertical_axis: 2,
            smoothing_window: 5,
            heel_strike_velocity: 100.0,
            toe_off_velocity: 100.0,
            min_event_spacing_s: 0.6,
            min_signal_coverage: 0.5,
        }
    }
}
