//! Encodes the raw frame layer of a trial as a C3D byte stream.
//!
//! Used to export a cleaned raw layer and to build captures in tests.

use std::fs;
use std::path::Path;

use super::{Header, ParameterData, ParameterSection, Processor, Units, BLOCK_SIZE, CLIPPED_LAST_FRAME};
use crate::error::{Error, Result};
use crate::trial::Trial;

/// Labels per `POINT:LABELS*` parameter (dimensions are single bytes).
const LABELS_PER_PARAMETER: usize = 255;

/// How point coordinates are stored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Storage {
    Float,
    /// Signed 16 bit integers multiplied by `scale` (> 0).
    Integer { scale: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WriteOptions {
    pub processor: Processor,
    pub storage: Storage,
    pub units: Units,
    /// Analog channels stored after each frame's points, one sample per
    /// channel and frame. Written as the missing sentinel value.
    pub analog_channels: usize,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            processor: Processor::Intel,
            storage: Storage::Float,
            units: Units::Millimetres,
            analog_channels: 0,
        }
    }
}

/// Encodes the trial's labels and raw marker positions.
pub fn encode(trial: &Trial, options: &WriteOptions) -> Result<Vec<u8>> {
    let p = options.processor;
    let point_count = trial.labels().len();
    let frame_count = trial.frame_count();
    let scale = match options.storage {
        Storage::Float => -1.0f32,
        Storage::Integer { scale } if scale > 0.0 => scale,
        Storage::Integer { scale } => {
            return Err(Error::malformed(format!("integer scale {} must be positive", scale)))
        }
    };

    let mut params = ParameterSection::new(p);
    params.insert("POINT", "USED", vec![], ParameterData::Int(vec![point_count as u16 as i16]));
    params.insert("POINT", "SCALE", vec![], ParameterData::Float(vec![scale]));
    params.insert("POINT", "RATE", vec![], ParameterData::Float(vec![trial.frame_rate() as f32]));
    if frame_count > CLIPPED_LAST_FRAME {
        params.insert("POINT", "FRAMES", vec![], ParameterData::Float(vec![frame_count as f32]));
    } else {
        params.insert("POINT", "FRAMES", vec![], ParameterData::Int(vec![frame_count as u16 as i16]));
    }
    let units = options.units.label();
    params.insert(
        "POINT",
        "UNITS",
        vec![units.len()],
        ParameterData::Char(vec![units.to_string()]),
    );
    for (n, chunk) in trial.labels().chunks(LABELS_PER_PARAMETER).enumerate() {
        let name = if n == 0 {
            "LABELS".to_string()
        } else {
            format!("LABELS{}", n + 1)
        };
        let width = chunk.iter().map(|l| l.len()).max().unwrap_or(1).max(1);
        params.insert("POINT", &name, vec![width, chunk.len()], ParameterData::Char(chunk.to_vec()));
    }
    params.insert(
        "ANALOG",
        "USED",
        vec![],
        ParameterData::Int(vec![options.analog_channels as u16 as i16]),
    );
    if options.analog_channels > 0 {
        params.insert("ANALOG", "RATE", vec![], ParameterData::Float(vec![trial.frame_rate() as f32]));
    }
    if let Some(subject) = &trial.metadata.subject_id {
        params.insert(
            "SUBJECTS",
            "NAMES",
            vec![subject.len().max(1), 1],
            ParameterData::Char(vec![subject.clone()]),
        );
    }

    // DATA_START depends on the section size, which does not change when
    // its value does.
    params.insert("POINT", "DATA_START", vec![], ParameterData::Int(vec![0]));
    let blocks = params.encode()?.len() / BLOCK_SIZE;
    let data_start = 2 + blocks;
    params.insert("POINT", "DATA_START", vec![], ParameterData::Int(vec![data_start as i16]));
    let param_bytes = params.encode()?;

    let first_frame = trial.metadata.first_frame.max(1);
    let last_frame = if frame_count == 0 {
        0
    } else {
        (first_frame + frame_count - 1).min(CLIPPED_LAST_FRAME)
    };
    let header = Header {
        parameter_block: 2,
        point_count,
        analog_per_frame: options.analog_channels,
        first_frame: if frame_count == 0 { 0 } else { first_frame },
        last_frame,
        max_interpolation_gap: 0,
        scale,
        data_start,
        frame_rate: trial.frame_rate() as f32,
    };

    let mut out = header.encode(p);
    out.extend_from_slice(&param_bytes);

    let from_mm = 1.0 / options.units.to_mm();
    for frame in trial.frames() {
        for position in frame.positions() {
            match (position, options.storage) {
                (Some(pos), Storage::Float) => {
                    for v in pos.iter() {
                        out.extend_from_slice(&p.write_f32((v * from_mm) as f32));
                    }
                    out.extend_from_slice(&p.write_f32(0.0));
                }
                (Some(pos), Storage::Integer { scale }) => {
                    for v in pos.iter() {
                        let raw = (v * from_mm / scale as f64).round();
                        if raw < i16::MIN as f64 || raw > i16::MAX as f64 {
                            return Err(Error::malformed(format!(
                                "coordinate {} out of range for scale {}",
                                v, scale
                            )));
                        }
                        out.extend_from_slice(&p.write_i16(raw as i16));
                    }
                    out.extend_from_slice(&p.write_i16(0));
                }
                (None, Storage::Float) => {
                    for _ in 0..3 {
                        out.extend_from_slice(&p.write_f32(0.0));
                    }
                    out.extend_from_slice(&p.write_f32(-1.0));
                }
                (None, Storage::Integer { .. }) => {
                    for _ in 0..3 {
                        out.extend_from_slice(&p.write_i16(0));
                    }
                    out.extend_from_slice(&p.write_i16(-1));
                }
            }
        }
        for _ in 0..options.analog_channels {
            match options.storage {
                Storage::Float => out.extend_from_slice(&p.write_f32(-1.0)),
                Storage::Integer { .. } => out.extend_from_slice(&p.write_i16(-1)),
            }
        }
    }
    let padded = (out.len() + BLOCK_SIZE - 1) / BLOCK_SIZE * BLOCK_SIZE;
    out.resize(padded, 0);
    Ok(out)
}

pub fn write_file<P: AsRef<Path>>(trial: &Trial, path: P, options: &WriteOptions) -> Result<()> {
    fs::write(path, encode(trial, options)?)?;
    Ok(())
}
