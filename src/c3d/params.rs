//! The C3D parameter section: groups and typed, dimensioned parameters.

use std::collections::BTreeMap;

use super::{slice, Processor, BLOCK_SIZE};
use crate::error::{Error, Result};

/// Values of one parameter, flattened in storage order.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterData {
    /// Strings, one per element of the trailing dimensions, trimmed.
    Char(Vec<String>),
    Byte(Vec<u8>),
    Int(Vec<i16>),
    Float(Vec<f32>),
}

impl ParameterData {
    fn type_code(&self) -> i8 {
        match self {
            ParameterData::Char(_) => -1,
            ParameterData::Byte(_) => 1,
            ParameterData::Int(_) => 2,
            ParameterData::Float(_) => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub group: String,
    pub name: String,
    pub dimensions: Vec<usize>,
    pub data: ParameterData,
    pub description: String,
}

impl Parameter {
    /// First value as an unsigned count. Int16 counts above 32767 are
    /// stored as negative numbers by most writers.
    pub fn as_count(&self) -> Option<usize> {
        match &self.data {
            ParameterData::Int(v) => v.first().map(|&x| x as u16 as usize),
            ParameterData::Byte(v) => v.first().map(|&x| x as usize),
            ParameterData::Float(v) => v
                .first()
                .filter(|x| x.is_finite() && **x >= 0.0)
                .map(|&x| x.round() as usize),
            ParameterData::Char(_) => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match &self.data {
            ParameterData::Int(v) => v.first().map(|&x| x as f64),
            ParameterData::Byte(v) => v.first().map(|&x| x as f64),
            ParameterData::Float(v) => v.first().map(|&x| x as f64),
            ParameterData::Char(_) => None,
        }
    }

    pub fn as_strings(&self) -> Option<&[String]> {
        match &self.data {
            ParameterData::Char(v) => Some(v),
            _ => None,
        }
    }
}

/// A parsed parameter section.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSection {
    pub processor: Processor,
    pub block_count: usize,
    groups: BTreeMap<String, String>,
    parameters: Vec<Parameter>,
}

impl ParameterSection {
    pub fn new(processor: Processor) -> ParameterSection {
        ParameterSection {
            processor,
            block_count: 0,
            groups: BTreeMap::new(),
            parameters: Vec::new(),
        }
    }

    /// Parses the section starting at byte offset `start`.
    pub fn parse(bytes: &[u8], start: usize) -> Result<ParameterSection> {
        let head = slice(bytes, start, 4)?;
        let block_count = head[2] as usize;
        let processor = Processor::from_code(head[3])?;
        let end = (start + block_count.max(1) * BLOCK_SIZE).min(bytes.len());

        let mut group_names: BTreeMap<u8, (String, String)> = BTreeMap::new();
        let mut pending: Vec<(u8, Parameter)> = Vec::new();

        let mut pos = start + 4;
        while pos + 2 <= end {
            let name_len = (bytes[pos] as i8).unsigned_abs() as usize;
            if name_len == 0 {
                break;
            }
            let id = bytes[pos + 1] as i8;
            let name = ascii(slice(bytes, pos + 2, name_len)?).to_uppercase();
            let offset_at = pos + 2 + name_len;
            let next = processor.read_i16(slice(bytes, offset_at, 2)?);
            let body = offset_at + 2;

            if id < 0 {
                let desc_len = slice(bytes, body, 1)?[0] as usize;
                let desc = ascii(slice(bytes, body + 1, desc_len)?);
                group_names.insert(id.unsigned_abs(), (name, desc));
            } else if id > 0 {
                pending.push((id.unsigned_abs(), parse_parameter(bytes, body, processor, name)?));
            }

            if next <= 0 {
                break;
            }
            pos = offset_at + next as usize;
        }

        let mut parameters = Vec::with_capacity(pending.len());
        for (id, mut param) in pending {
            let (group, _) = group_names.get(&id).ok_or_else(|| {
                Error::malformed(format!("parameter {} refers to missing group {}", param.name, id))
            })?;
            param.group = group.clone();
            parameters.push(param);
        }

        Ok(ParameterSection {
            processor,
            block_count,
            groups: group_names.into_values().collect(),
            parameters,
        })
    }

    pub fn get(&self, group: &str, name: &str) -> Option<&Parameter> {
        self.parameters
            .iter()
            .find(|p| p.group == group && p.name == name)
    }

    pub fn count(&self, group: &str, name: &str) -> Option<usize> {
        self.get(group, name).and_then(|p| p.as_count())
    }

    pub fn float(&self, group: &str, name: &str) -> Option<f64> {
        self.get(group, name).and_then(|p| p.as_float())
    }

    pub fn strings(&self, group: &str, name: &str) -> Option<&[String]> {
        self.get(group, name).and_then(|p| p.as_strings())
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    /// Adds (or replaces) a parameter, creating its group if needed.
    pub fn insert(&mut self, group: &str, name: &str, dimensions: Vec<usize>, data: ParameterData) {
        self.groups
            .entry(group.to_string())
            .or_insert_with(String::new);
        self.parameters
            .retain(|p| !(p.group == group && p.name == name));
        self.parameters.push(Parameter {
            group: group.to_string(),
            name: name.to_string(),
            dimensions,
            data,
            description: String::new(),
        });
    }

    /// Serialises the section, padded to whole blocks.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let p = self.processor;
        let mut items: Vec<Vec<u8>> = Vec::new();
        let mut ids: BTreeMap<&str, i8> = BTreeMap::new();

        for (i, (group, desc)) in self.groups.iter().enumerate() {
            let id = i8::try_from(i + 1)
                .map_err(|_| Error::malformed("too many parameter groups"))?;
            ids.insert(group.as_str(), id);
            let mut body = vec![desc.len() as u8];
            body.extend_from_slice(desc.as_bytes());
            items.push(item(p, group, -id, &body)?);
        }

        for param in &self.parameters {
            let id = ids[param.group.as_str()];
            let mut body = vec![param.data.type_code() as u8, param.dimensions.len() as u8];
            for &d in &param.dimensions {
                body.push(u8::try_from(d).map_err(|_| {
                    Error::malformed(format!("dimension {} of {} too large", d, param.name))
                })?);
            }
            match &param.data {
                ParameterData::Char(values) => {
                    let width = param.dimensions.first().copied().unwrap_or(0);
                    for v in values {
                        let mut b = v.as_bytes().to_vec();
                        b.resize(width, b' ');
                        body.extend_from_slice(&b);
                    }
                }
                ParameterData::Byte(values) => body.extend_from_slice(values),
                ParameterData::Int(values) => {
                    for &v in values {
                        body.extend_from_slice(&p.write_i16(v));
                    }
                }
                ParameterData::Float(values) => {
                    for &v in values {
                        body.extend_from_slice(&p.write_f32(v));
                    }
                }
            }
            body.push(param.description.len() as u8);
            body.extend_from_slice(param.description.as_bytes());
            items.push(item(p, &param.name, id, &body)?);
        }

        let mut out = vec![0x01, 0x50, 0, p.code()];
        let last = items.len();
        for (i, mut it) in items.into_iter().enumerate() {
            if i + 1 == last {
                // A zero offset ends the section.
                let at = 2 + it[0] as usize;
                it[at..at + 2].copy_from_slice(&p.write_i16(0));
            }
            out.extend_from_slice(&it);
        }
        let blocks = (out.len() + BLOCK_SIZE - 1) / BLOCK_SIZE;
        out.resize(blocks * BLOCK_SIZE, 0);
        out[2] = u8::try_from(blocks).map_err(|_| Error::malformed("parameter section too large"))?;
        Ok(out)
    }
}

fn item(p: Processor, name: &str, id: i8, body: &[u8]) -> Result<Vec<u8>> {
    let len = i8::try_from(name.len())
        .map_err(|_| Error::malformed(format!("parameter name {} too long", name)))?;
    let next = i16::try_from(body.len() + 2)
        .map_err(|_| Error::malformed(format!("parameter {} too large", name)))?;
    let mut out = vec![len as u8, id as u8];
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(&p.write_i16(next));
    out.extend_from_slice(body);
    Ok(out)
}

fn parse_parameter(bytes: &[u8], at: usize, p: Processor, name: String) -> Result<Parameter> {
    let head = slice(bytes, at, 2)?;
    let type_code = head[0] as i8;
    let ndims = head[1] as usize;
    let dimensions: Vec<usize> = slice(bytes, at + 2, ndims)?
        .iter()
        .map(|&d| d as usize)
        .collect();
    let count: usize = dimensions.iter().product();
    let data_at = at + 2 + ndims;

    let (data, size) = match type_code {
        -1 => {
            let raw = slice(bytes, data_at, count)?;
            let strings = match dimensions.split_first() {
                Some((&width, _)) if width > 0 => raw.chunks(width).map(ascii).collect(),
                _ => vec![ascii(raw)],
            };
            (ParameterData::Char(strings), count)
        }
        1 => (ParameterData::Byte(slice(bytes, data_at, count)?.to_vec()), count),
        2 => {
            let raw = slice(bytes, data_at, count * 2)?;
            let values = raw.chunks_exact(2).map(|c| p.read_i16(c)).collect();
            (ParameterData::Int(values), count * 2)
        }
        4 => {
            let raw = slice(bytes, data_at, count * 4)?;
            let values = raw.chunks_exact(4).map(|c| p.read_f32(c)).collect();
            (ParameterData::Float(values), count * 4)
        }
        other => {
            return Err(Error::malformed(format!(
                "parameter {} has unknown data type {}",
                name, other
            )))
        }
    };

    let desc_at = data_at + size;
    let description = match bytes.get(desc_at) {
        Some(&len) => slice(bytes, desc_at + 1, len as usize)
            .map(ascii)
            .unwrap_or_default(),
        None => String::new(),
    };

    Ok(Parameter {
        group: String::new(),
        name,
        dimensions,
        data,
        description,
    })
}

fn ascii(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string()
}
