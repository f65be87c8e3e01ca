//! The statically declared marker label set.
//!
//! Capture files name their points freely (often `Subject:LASI`), so every
//! label is resolved once at load time against [`Marker`]. Everything
//! downstream addresses markers by enum, never by string.

use std::collections::BTreeMap;
use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{Error, Result};

macro_rules! markers {
    ($($variant:ident => $label:literal),* $(,)?) => {
        /// Known marker labels (lower body and trunk).
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum Marker {
            $($variant),*
        }

        impl Marker {
            pub const ALL: &'static [Marker] = &[$(Marker::$variant),*];

            /// The label as written in capture files.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Marker::$variant => $label),*
                }
            }

            /// Exact (unprefixed) label lookup.
            pub fn from_label(label: &str) -> Option<Marker> {
                match label {
                    $($label => Some(Marker::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

markers! {
    C7 => "C7",
    C2 => "C2",
    T6 => "T6",
    T10 => "T10",
    S1 => "S1",
    S3 => "S3",
    Clav => "CLAV",
    Strn => "STRN",

    Lpsi => "LPSI",
    Rpsi => "RPSI",
    Lasi => "LASI",
    Rasi => "RASI",

    Lthi => "LTHI",
    Lthib => "LTHIB",
    Lthid => "LTHID",
    Lknee => "LKNE",
    Lkneem => "LKNEM",
    Ltib => "LTIB",
    Ltibf => "LTIBF",
    Ltibd => "LTIBD",
    Lank => "LANK",
    Lankm => "LANKM",
    Lhee => "LHEE",
    Lnav => "LNAV",
    Ltoe => "LTOE",
    Ltoe5 => "LTOE5",

    Rthi => "RTHI",
    Rthib => "RTHIB",
    Rthid => "RTHID",
    Rknee => "RKNE",
    Rkneem => "RKNEM",
    Rtib => "RTIB",
    Rtibf => "RTIBF",
    Rtibd => "RTIBD",
    Rank => "RANK",
    Rankm => "RANKM",
    Rhee => "RHEE",
    Rnav => "RNAV",
    Rtoe => "RTOE",
    Rtoe5 => "RTOE5",
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

lazy_static! {
    static ref LABEL_RE: Regex = Regex::new(r"^\s*(?:([^:]*):)?([A-Za-z0-9_]+)\s*$").unwrap();
}

/// Splits a capture label into an optional subject prefix and the bare
/// marker name.
///
/// ```rust
/// let (prefix, name) = gait::markers::split_label("pilot:LASI").unwrap();
/// assert_eq!(prefix, Some("pilot"));
/// assert_eq!(name, "LASI");
/// ```
pub fn split_label(label: &str) -> Option<(Option<&str>, &str)> {
    let caps = LABEL_RE.captures(label)?;
    let prefix = caps.get(1).map(|m| m.as_str()).filter(|s| !s.is_empty());
    let name = caps.get(2)?.as_str();
    Some((prefix, name))
}

/// Resolves a capture label to a known marker.
pub fn resolve_label(label: &str) -> Option<Marker> {
    split_label(label).and_then(|(_, name)| Marker::from_label(name))
}

/// The labels of one capture, with the known ones mapped to their column.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerSet {
    labels: Vec<String>,
    resolved: BTreeMap<Marker, usize>,
}

impl MarkerSet {
    /// Resolves every label. Two labels naming the same marker make the
    /// capture ambiguous and are rejected.
    pub fn new(labels: Vec<String>) -> Result<MarkerSet> {
        let mut resolved = BTreeMap::new();
        for (i, label) in labels.iter().enumerate() {
            if let Some(marker) = resolve_label(label) {
                if let Some(prev) = resolved.insert(marker, i) {
                    return Err(Error::malformed(format!(
                        "marker {} found multiple times ({} and {})",
                        marker, labels[prev], label
                    )));
                }
            }
        }
        Ok(MarkerSet { labels, resolved })
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Column of a known marker, if the capture has it.
    pub fn index_of(&self, marker: Marker) -> Option<usize> {
        self.resolved.get(&marker).copied()
    }

    /// The known marker in a column, if any.
    pub fn marker_at(&self, index: usize) -> Option<Marker> {
        self.resolved
            .iter()
            .find(|(_, &i)| i == index)
            .map(|(&m, _)| m)
    }

    /// Known markers present in the capture.
    pub fn markers(&self) -> impl Iterator<Item = Marker> + '_ {
        self.resolved.keys().copied()
    }

    /// Subject prefix shared by the labels, e.g. `pilot` for `pilot:LASI`.
    pub fn subject_prefix(&self) -> Option<String> {
        self.labels
            .iter()
            .filter_map(|l| split_label(l).and_then(|(p, _)| p))
            .next()
            .map(|p| p.to_string())
    }
}
