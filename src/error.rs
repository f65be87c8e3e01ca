//! Fatal errors and non-fatal reconstruction warnings.

use std::fmt;

use crate::events::{GaitEventKind, Limb};

/// Result type alias for the reconstruction core.
pub type Result<T> = std::result::Result<T, Error>;

/// Fatal conditions. Any of these aborts the trial being processed, and
/// only that trial.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unreadable, truncated or inconsistent capture file.
    #[error("malformed capture: {0}")]
    MalformedCapture(String),

    /// A marker needed by the model is missing for too large a share of
    /// the trial.
    #[error("insufficient data for marker {marker}: {unresolved} of {total} frames unresolved")]
    InsufficientData {
        marker: String,
        unresolved: usize,
        total: usize,
    },

    /// Segment or joint definitions that cannot be used.
    #[error("invalid model: {0}")]
    InvalidModel(String),

    /// Stage parameters outside their usable range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Processing of the trial panicked; the message is the panic payload.
    #[error("processing aborted: {0}")]
    Aborted(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedCapture(msg.into())
    }
}

/// Why a segment pose could not be estimated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnresolvedReason {
    /// Fewer visible markers than the configured minimum.
    TooFewMarkers(usize),
    /// Enough markers, but (nearly) on a line.
    Collinear,
}

impl fmt::Display for UnresolvedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnresolvedReason::TooFewMarkers(n) => write!(f, "{} visible markers", n),
            UnresolvedReason::Collinear => write!(f, "collinear markers"),
        }
    }
}

/// Non-fatal conditions, kept on the reconstruction so a caller can audit
/// confidence per frame, segment and joint.
///
/// Frame ranges are inclusive.
#[derive(Debug, Clone, PartialEq)]
pub enum Warning {
    /// A gap too long (or at the trial edge) to interpolate.
    UnresolvedGap {
        marker: String,
        start: usize,
        end: usize,
    },
    /// A run of frames without a segment pose.
    UnresolvedPose {
        segment: String,
        start: usize,
        end: usize,
        reason: UnresolvedReason,
    },
    /// A resolved pose whose RMS residual exceeds the configured threshold.
    LowConfidenceFit {
        segment: String,
        frame: usize,
        rms_mm: f64,
    },
    /// An event dropped to keep heel-strike/toe-off alternating.
    AmbiguousEventSequence {
        limb: Limb,
        kind: GaitEventKind,
        frame: usize,
    },
    /// The heel marker was not usable, the foot segment was used instead.
    EventSignalFallback { limb: Limb, source: String },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::UnresolvedGap { marker, start, end } => {
                write!(f, "unresolved gap in {} (frames {}-{})", marker, start, end)
            }
            Warning::UnresolvedPose {
                segment,
                start,
                end,
                reason,
            } => write!(
                f,
                "unresolved pose for {} (frames {}-{}): {}",
                segment, start, end, reason
            ),
            Warning::LowConfidenceFit {
                segment,
                frame,
                rms_mm,
            } => write!(
                f,
                "low confidence fit for {} at frame {} (rms {:.2} mm)",
                segment, frame, rms_mm
            ),
            Warning::AmbiguousEventSequence { limb, kind, frame } => write!(
                f,
                "ambiguous event sequence for {:?} limb, dropped {:?} at frame {}",
                limb, kind, frame
            ),
            Warning::EventSignalFallback { limb, source } => {
                write!(f, "{:?} limb events detected from {}", limb, source)
            }
        }
    }
}
