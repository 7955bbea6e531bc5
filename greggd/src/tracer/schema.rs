//! Decoders for fixed-layout binary records.
//!
//! A [`RecordSchema`] is compiled once from an output's `format` list and then
//! interprets every record field by field, in declaration order, little-endian,
//! without padding between fields.

use crate::errors::{ConfigError, DecodeError};
use chrono::{DateTime, Utc};
use greggd_common::utils::{str_from_buf_nul, title_case};
use greggd_common::{FieldSpec, FieldType, GreggdVar};
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

const INT_WIDTH: usize = core::mem::size_of::<isize>();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    U64,
    U32,
    Int,
    Bytes(usize),
    /// Takes everything up to the fixed-width fields that follow.
    Rest { trailing: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FieldDecoder {
    name: Arc<str>,
    step: Step,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RecordSchema {
    fields: Vec<FieldDecoder>,
    min_size: usize,
}

impl RecordSchema {
    pub fn build(format: &[FieldSpec]) -> Result<RecordSchema, ConfigError> {
        if format.is_empty() {
            return Err(ConfigError::MissingField {
                field: "format",
                context: "output has no fields".to_string(),
            });
        }

        let mut seen = HashSet::new();
        let mut steps = Vec::with_capacity(format.len());
        let mut has_unsized = false;
        let mut min_size: usize = 0;

        for field in format {
            if field.name.is_empty() {
                return Err(ConfigError::MissingField {
                    field: "name",
                    context: format!("field of type {:?}", field.kind),
                });
            }

            let mut kind = field.kind.clone();
            let step = match FieldType::from_str(kind.as_mut_str()) {
                FieldType::U64 => Step::U64,
                FieldType::U32 => Step::U32,
                FieldType::Int => Step::Int,
                FieldType::ByteArray(Some(len)) => Step::Bytes(len),
                FieldType::ByteArray(None) => {
                    if has_unsized {
                        return Err(ConfigError::AmbiguousLayout(field.name.clone()));
                    }
                    has_unsized = true;
                    Step::Rest { trailing: 0 }
                }
                FieldType::Undefined => {
                    return Err(ConfigError::UnsupportedFieldType {
                        field: field.name.clone(),
                        kind: field.kind.clone(),
                    });
                }
            };

            if !seen.insert(title_case(&field.name)) {
                return Err(ConfigError::DuplicateFieldName(field.name.clone()));
            }
            min_size = min_size.checked_add(step_width(&step)).ok_or_else(|| {
                ConfigError::UnsupportedFieldType {
                    field: field.name.clone(),
                    kind: field.kind.clone(),
                }
            })?;
            steps.push(FieldDecoder {
                name: Arc::from(field.name.as_str()),
                step,
            });
        }

        // Fixed bytes after the unsized field bound where it ends.
        let mut trailing = 0;
        for decoder in steps.iter_mut().rev() {
            match &mut decoder.step {
                Step::Rest { trailing: t } => *t = trailing,
                step => trailing += step_width(step),
            }
        }

        Ok(RecordSchema {
            fields: steps,
            min_size,
        })
    }

    /// Smallest record this schema accepts.
    pub fn min_size(&self) -> usize {
        self.min_size
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| &*f.name)
    }

    pub fn decode(&self, data: &[u8]) -> Result<Record, DecodeError> {
        let mut values = Vec::with_capacity(self.fields.len());
        let mut offset = 0;

        for field in &self.fields {
            let (value, width) = match field.step {
                Step::U64 => (Value::U64(u64::from_le_bytes(take(data, offset, field)?)), 8),
                Step::U32 => (Value::U32(u32::from_le_bytes(take(data, offset, field)?)), 4),
                Step::Int => {
                    let v = isize::from_le_bytes(take::<INT_WIDTH>(data, offset, field)?);
                    (Value::Int(v as i64), INT_WIDTH)
                }
                Step::Bytes(len) => {
                    let bytes = slice(data, offset, len, field)?;
                    (Value::Bytes(bytes.to_vec()), len)
                }
                Step::Rest { trailing } => {
                    let needed = offset + trailing;
                    if data.len() < needed {
                        return Err(truncated(field, needed, data.len()));
                    }
                    let len = data.len() - needed;
                    (Value::Bytes(data[offset..offset + len].to_vec()), len)
                }
            };
            values.push((field.name.clone(), value));
            offset += width;
        }

        Ok(Record {
            received: Utc::now(),
            fields: values,
        })
    }
}

fn step_width(step: &Step) -> usize {
    match step {
        Step::U64 => 8,
        Step::U32 => 4,
        Step::Int => INT_WIDTH,
        Step::Bytes(len) => *len,
        Step::Rest { .. } => 0,
    }
}

fn truncated(field: &FieldDecoder, needed: usize, available: usize) -> DecodeError {
    DecodeError::Truncated {
        field: field.name.to_string(),
        needed,
        available,
    }
}

fn slice<'a>(
    data: &'a [u8],
    offset: usize,
    len: usize,
    field: &FieldDecoder,
) -> Result<&'a [u8], DecodeError> {
    let end = offset.saturating_add(len);
    data.get(offset..end)
        .ok_or_else(|| truncated(field, end, data.len()))
}

fn take<const N: usize>(
    data: &[u8],
    offset: usize,
    field: &FieldDecoder,
) -> Result<[u8; N], DecodeError> {
    let bytes = slice(data, offset, N, field)?;
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Value {
    U64(u64),
    U32(u32),
    Int(i64),
    Bytes(Vec<u8>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::U64(v) => write!(f, "{}", v),
            Value::U32(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Bytes(b) => match str_from_buf_nul(b) {
                Ok(s) => f.write_str(s),
                Err(_) => f.write_str(&hex::encode(b)),
            },
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::U64(v) => serializer.serialize_u64(*v),
            Value::U32(v) => serializer.serialize_u32(*v),
            Value::Int(v) => serializer.serialize_i64(*v),
            Value::Bytes(_) => serializer.collect_str(self),
        }
    }
}

/// One decoded record, fields in layout order.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Record {
    pub received: DateTime<Utc>,
    pub fields: Vec<(Arc<str>, Value)>,
}

#[cfg(test)]
impl Record {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(n, _)| &**n == name)
            .map(|(_, v)| v)
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (name, value) in &self.fields {
            map.serialize_entry(&**name, value)?;
        }
        map.end()
    }
}
