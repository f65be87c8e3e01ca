//! Binary Capture Reader for C3D files.
//!
//! A C3D file is a sequence of 512-byte blocks: a header block, a
//! parameter section, then the point data. Every numeric field is stored
//! in the byte order of the processor type recorded in the parameter
//! section. Point coordinates come back normalised to millimetres, with
//! samples carrying the "missing" residual sentinel surfaced as gaps.

mod params;
pub mod writer;

pub use params::{Parameter, ParameterData, ParameterSection};
pub use writer::{encode, write_file, Storage, WriteOptions};

use std::fs;
use std::path::Path;

use log::{debug, info};

use crate::error::{Error, Result};
use crate::trial::{Trial, TrialMetadata};
use crate::Position;

pub const BLOCK_SIZE: usize = 512;

/// Second byte of the header block.
const HEADER_KEY: u8 = 0x50;

/// Header frame fields are 16 bit; longer trials store this and put the
/// real count in `POINT:FRAMES`.
const CLIPPED_LAST_FRAME: usize = 65535;

/// Processor type, which fixes byte order and float encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processor {
    /// Little endian, IEEE floats.
    Intel,
    /// Little endian words, VAX F floats.
    Dec,
    /// Big endian, IEEE floats.
    Mips,
}

impl Processor {
    pub fn from_code(code: u8) -> Result<Processor> {
        match code {
            84 => Ok(Processor::Intel),
            85 => Ok(Processor::Dec),
            86 => Ok(Processor::Mips),
            other => Err(Error::malformed(format!(
                "unsupported processor type {}",
                other
            ))),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Processor::Intel => 84,
            Processor::Dec => 85,
            Processor::Mips => 86,
        }
    }

    pub(crate) fn read_i16(self, b: &[u8]) -> i16 {
        let raw = [b[0], b[1]];
        match self {
            Processor::Mips => i16::from_be_bytes(raw),
            _ => i16::from_le_bytes(raw),
        }
    }

    pub(crate) fn read_u16(self, b: &[u8]) -> u16 {
        self.read_i16(b) as u16
    }

    pub(crate) fn read_f32(self, b: &[u8]) -> f32 {
        match self {
            Processor::Intel => f32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            Processor::Mips => f32::from_be_bytes([b[0], b[1], b[2], b[3]]),
            Processor::Dec => {
                // Swap the 16 bit words, then undo the bias difference.
                if b[1] & 0x7f == 0 && b[0] & 0x80 == 0 {
                    return 0.0;
                }
                f32::from_le_bytes([b[2], b[3], b[0], b[1]]) / 4.0
            }
        }
    }

    pub(crate) fn write_i16(self, v: i16) -> [u8; 2] {
        match self {
            Processor::Mips => v.to_be_bytes(),
            _ => v.to_le_bytes(),
        }
    }

    pub(crate) fn write_f32(self, v: f32) -> [u8; 4] {
        match self {
            Processor::Intel => v.to_le_bytes(),
            Processor::Mips => v.to_be_bytes(),
            Processor::Dec => {
                let b = (v * 4.0).to_le_bytes();
                [b[2], b[3], b[0], b[1]]
            }
        }
    }
}

/// Length units a capture may declare in `POINT:UNITS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Units {
    Millimetres,
    Centimetres,
    Metres,
}

impl Units {
    pub fn parse(label: &str) -> Result<Units> {
        match label.trim().to_lowercase().as_str() {
            "mm" | "" => Ok(Units::Millimetres),
            "cm" => Ok(Units::Centimetres),
            "m" => Ok(Units::Metres),
            other => Err(Error::malformed(format!("unsupported point units {:?}", other))),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Units::Millimetres => "mm",
            Units::Centimetres => "cm",
            Units::Metres => "m",
        }
    }

    /// Millimetres per unit.
    pub fn to_mm(self) -> f64 {
        match self {
            Units::Millimetres => 1.0,
            Units::Centimetres => 10.0,
            Units::Metres => 1000.0,
        }
    }
}

/// Fields of the header block.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub parameter_block: usize,
    pub point_count: usize,
    /// Analog values stored after the points of each frame.
    pub analog_per_frame: usize,
    pub first_frame: usize,
    pub last_frame: usize,
    pub max_interpolation_gap: usize,
    pub scale: f32,
    pub data_start: usize,
    pub frame_rate: f32,
}

impl Header {
    fn parse(bytes: &[u8], p: Processor) -> Result<Header> {
        let b = slice(bytes, 0, 24)?;
        if b[1] != HEADER_KEY {
            return Err(Error::malformed(format!("bad header key 0x{:02x}", b[1])));
        }
        Ok(Header {
            parameter_block: b[0] as usize,
            point_count: p.read_u16(&b[2..4]) as usize,
            analog_per_frame: p.read_u16(&b[4..6]) as usize,
            first_frame: p.read_u16(&b[6..8]) as usize,
            last_frame: p.read_u16(&b[8..10]) as usize,
            max_interpolation_gap: p.read_u16(&b[10..12]) as usize,
            scale: p.read_f32(&b[12..16]),
            data_start: p.read_u16(&b[16..18]) as usize,
            frame_rate: p.read_f32(&b[20..24]),
        })
    }

    fn encode(&self, p: Processor) -> Vec<u8> {
        let mut out = vec![0u8; BLOCK_SIZE];
        out[0] = self.parameter_block as u8;
        out[1] = HEADER_KEY;
        out[2..4].copy_from_slice(&p.write_i16(self.point_count as u16 as i16));
        out[4..6].copy_from_slice(&p.write_i16(self.analog_per_frame as u16 as i16));
        out[6..8].copy_from_slice(&p.write_i16(self.first_frame as u16 as i16));
        out[8..10].copy_from_slice(&p.write_i16(self.last_frame as u16 as i16));
        out[10..12].copy_from_slice(&p.write_i16(self.max_interpolation_gap as u16 as i16));
        out[12..16].copy_from_slice(&p.write_f32(self.scale));
        out[16..18].copy_from_slice(&p.write_i16(self.data_start as u16 as i16));
        out[20..24].copy_from_slice(&p.write_f32(self.frame_rate));
        out
    }

    fn header_frame_count(&self) -> Result<usize> {
        if self.first_frame == 0 && self.last_frame == 0 {
            return Ok(0);
        }
        if self.last_frame < self.first_frame {
            return Err(Error::malformed(format!(
                "last frame {} before first frame {}",
                self.last_frame, self.first_frame
            )));
        }
        Ok(self.last_frame - self.first_frame + 1)
    }
}

/// Header and parameters of a capture, without the point data.
#[derive(Debug, Clone)]
pub struct CaptureInfo {
    pub header: Header,
    pub parameters: ParameterSection,
}

impl CaptureInfo {
    /// Parses and cross-checks the header and parameter section.
    pub fn parse(bytes: &[u8]) -> Result<CaptureInfo> {
        let parameter_block = *bytes
            .first()
            .ok_or_else(|| Error::malformed("empty file"))? as usize;
        if parameter_block < 2 {
            return Err(Error::malformed(format!(
                "parameter block pointer {} is invalid",
                parameter_block
            )));
        }
        let parameters = ParameterSection::parse(bytes, (parameter_block - 1) * BLOCK_SIZE)?;
        let header = Header::parse(bytes, parameters.processor)?;
        Ok(CaptureInfo { header, parameters })
    }

    pub fn processor(&self) -> Processor {
        self.parameters.processor
    }

    pub fn point_count(&self) -> Result<usize> {
        let header = self.header.point_count;
        match self.parameters.count("POINT", "USED") {
            Some(used) if used != header => Err(Error::malformed(format!(
                "header declares {} points, POINT:USED {}",
                header, used
            ))),
            _ => Ok(header),
        }
    }

    pub fn frame_count(&self) -> Result<usize> {
        let header = self.header.header_frame_count()?;
        match self.parameters.count("POINT", "FRAMES") {
            Some(frames) if self.header.last_frame == CLIPPED_LAST_FRAME => Ok(frames),
            Some(frames) if frames != header => Err(Error::malformed(format!(
                "header declares {} frames, POINT:FRAMES {}",
                header, frames
            ))),
            _ => Ok(header),
        }
    }

    pub fn frame_rate(&self) -> Result<f64> {
        let rate = match self.parameters.float("POINT", "RATE") {
            Some(r) if r > 0.0 => r,
            _ => self.header.frame_rate as f64,
        };
        if rate.is_finite() && rate > 0.0 {
            Ok(rate)
        } else {
            Err(Error::malformed(format!("invalid frame rate {}", rate)))
        }
    }

    /// Point scale; negative means float storage.
    pub fn scale(&self) -> Result<f64> {
        let scale = self
            .parameters
            .float("POINT", "SCALE")
            .unwrap_or(self.header.scale as f64);
        if scale == 0.0 || !scale.is_finite() {
            return Err(Error::malformed(format!("invalid point scale {}", scale)));
        }
        Ok(scale)
    }

    pub fn units(&self) -> Result<Units> {
        match self.parameters.strings("POINT", "UNITS").and_then(|u| u.first()) {
            Some(label) => Units::parse(label),
            None => Ok(Units::Millimetres),
        }
    }

    /// Point labels in column order, including `LABELS2`, `LABELS3`, ...
    pub fn labels(&self) -> Result<Vec<String>> {
        let count = self.point_count()?;
        let mut labels: Vec<String> = Vec::with_capacity(count);
        let mut name = "LABELS".to_string();
        let mut n = 1;
        while let Some(chunk) = self.parameters.strings("POINT", &name) {
            labels.extend(chunk.iter().cloned());
            n += 1;
            name = format!("LABELS{}", n);
        }
        if labels.len() < count {
            return Err(Error::malformed(format!(
                "{} point labels for {} points",
                labels.len(),
                count
            )));
        }
        labels.truncate(count);
        Ok(labels)
    }

    pub fn data_start(&self) -> usize {
        self.parameters
            .count("POINT", "DATA_START")
            .filter(|&b| b > 0)
            .unwrap_or(self.header.data_start)
    }

    pub fn subject(&self) -> Option<String> {
        self.parameters
            .strings("SUBJECTS", "NAMES")
            .and_then(|names| names.iter().find(|n| !n.is_empty()))
            .cloned()
    }
}

/// Decodes a complete capture held in memory.
pub fn decode(bytes: &[u8]) -> Result<Trial> {
    let info = CaptureInfo::parse(bytes)?;
    let p = info.processor();
    let point_count = info.point_count()?;
    let frame_count = info.frame_count()?;
    let frame_rate = info.frame_rate()?;
    let scale = info.scale()?;
    let units = info.units()?;
    let labels = info.labels()?;

    let float_storage = scale < 0.0;
    let word = if float_storage { 4 } else { 2 };
    let stride = (point_count * 4 + info.header.analog_per_frame) * word;
    let data_block = info.data_start();
    if data_block < 2 {
        return Err(Error::malformed(format!("data start block {} is invalid", data_block)));
    }
    // Frame counts beyond the file size come from corrupt parameters.
    if frame_count > bytes.len() {
        return Err(Error::malformed(format!(
            "{} frames cannot fit in {} bytes",
            frame_count,
            bytes.len()
        )));
    }
    let start = (data_block - 1) * BLOCK_SIZE;
    let needed = stride
        .checked_mul(frame_count)
        .and_then(|n| n.checked_add(start))
        .ok_or_else(|| Error::malformed(format!("frame count {} overflows", frame_count)))?;
    if bytes.len() < needed {
        return Err(Error::malformed(format!(
            "point data truncated: {} bytes, {} needed for {} frames",
            bytes.len(),
            needed,
            frame_count
        )));
    }

    debug!(
        "{:?} capture, {} points, {} frames at {} Hz, scale {}, units {}",
        p,
        point_count,
        frame_count,
        frame_rate,
        scale,
        units.label()
    );

    let to_mm = units.to_mm();
    let point_scale = if float_storage { 1.0 } else { scale.abs() };
    let read = |at: usize| -> f64 {
        if float_storage {
            p.read_f32(&bytes[at..at + 4]) as f64
        } else {
            p.read_i16(&bytes[at..at + 2]) as f64
        }
    };

    let mut rows = Vec::with_capacity(frame_count);
    let mut missing = 0usize;
    for f in 0..frame_count {
        let frame_at = start + f * stride;
        let mut row = Vec::with_capacity(point_count);
        for i in 0..point_count {
            let at = frame_at + i * 4 * word;
            let residual = read(at + 3 * word);
            if residual < 0.0 {
                row.push(None);
                missing += 1;
                continue;
            }
            let x = read(at) * point_scale * to_mm;
            let y = read(at + word) * point_scale * to_mm;
            let z = read(at + 2 * word) * point_scale * to_mm;
            row.push(Some(Position::new(x, y, z)));
        }
        rows.push(row);
    }

    let metadata = TrialMetadata {
        subject_id: info.subject(),
        first_frame: info.header.first_frame,
        native_units: units.label().to_string(),
        ..Default::default()
    };
    let mut trial = Trial::new(metadata, frame_rate, labels, rows)?;
    if trial.metadata.subject_id.is_none() {
        trial.metadata.subject_id = trial.markers().subject_prefix();
    }
    info!(
        "Decoded {} frames x {} markers ({} missing samples).",
        frame_count, point_count, missing
    );
    Ok(trial)
}

/// Reads a capture file. All file I/O of the pipeline happens here.
pub fn read_file<P: AsRef<Path>>(path: P) -> Result<Trial> {
    let path = path.as_ref();
    info!("Reading capture {}", path.display());
    let bytes = fs::read(path)?;
    let mut trial = decode(&bytes)?;
    trial.metadata.trial_id = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned());
    trial.metadata.capture_time = fs::metadata(path).and_then(|m| m.modified()).ok();
    Ok(trial)
}

/// Reads only the header and parameters of a capture file.
pub fn inspect<P: AsRef<Path>>(path: P) -> Result<CaptureInfo> {
    let bytes = fs::read(path)?;
    CaptureInfo::parse(&bytes)
}

pub(crate) fn slice(bytes: &[u8], at: usize, len: usize) -> Result<&[u8]> {
    bytes
        .get(at..at.saturating_add(len))
        .ok_or_else(|| Error::malformed(format!("unexpected end of file at byte {}", at)))
}
