//! Variable types and their transformations.
//!
//! Each model variable has a value *kind* (what the host API sees: real,
//! integer, boolean, string or binary) and an *element type* (how the value
//! is laid out in the worker's memory). Conversions between the two happen
//! when values cross the wire.

use std::convert::TryFrom;
use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use crate::arraystring::{self, FixedString};
use crate::error::{Error, Result};
use crate::util;

const SINT8_NAME: &str = "sint8";
const SINT16_NAME: &str = "sint16";
const SINT32_NAME: &str = "sint32";
const SINT64_NAME: &str = "sint64";
const UINT8_NAME: &str = "uint8";
const UINT16_NAME: &str = "uint16";
const UINT32_NAME: &str = "uint32";
const UINT64_NAME: &str = "uint64";
const FLOAT32_NAME: &str = "float32";
const FLOAT64_NAME: &str = "float64";
const BOOLEAN_NAME: &str = "Boolean";
const STRING_NAME: &str = "String";
const ENUMERATION_NAME: &str = "Enumeration";
const BINARY_NAME: &str = "Binary";
const UNSET_NAME: &str = "unset";

const INPUT_NAME: &str = "input";
const OUTPUT_NAME: &str = "output";
const PARAMETER_NAME: &str = "parameter";

const REAL_KIND_NAME: &str = "Real";
const INTEGER_KIND_NAME: &str = "Integer";
const BOOLEAN_KIND_NAME: &str = "Boolean";
const STRING_KIND_NAME: &str = "String";
const ENUMERATION_KIND_NAME: &str = "Enumeration";
const BINARY_KIND_NAME: &str = "Binary";

/// Memory layout of a variable inside the worker process.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    Sint8,
    Sint16,
    Sint32,
    Sint64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
    Boolean,
    String,
    Enumeration,
    Binary,
    Unset,
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_str())
    }
}

impl ElementType {
    /// Maps a declared type name to an element type. Unknown names map to
    /// `Unset`.
    pub fn from_name(s: &str) -> ElementType {
        match s {
            SINT8_NAME => ElementType::Sint8,
            SINT16_NAME => ElementType::Sint16,
            SINT32_NAME => ElementType::Sint32,
            SINT64_NAME => ElementType::Sint64,
            UINT8_NAME => ElementType::Uint8,
            UINT16_NAME => ElementType::Uint16,
            UINT32_NAME => ElementType::Uint32,
            UINT64_NAME => ElementType::Uint64,
            FLOAT32_NAME => ElementType::Float32,
            FLOAT64_NAME => ElementType::Float64,
            BOOLEAN_NAME => ElementType::Boolean,
            STRING_NAME => ElementType::String,
            ENUMERATION_NAME => ElementType::Enumeration,
            BINARY_NAME => ElementType::Binary,
            _ => ElementType::Unset,
        }
    }

    pub fn to_str(&self) -> &'static str {
        match self {
            ElementType::Sint8 => SINT8_NAME,
            ElementType::Sint16 => SINT16_NAME,
            ElementType::Sint32 => SINT32_NAME,
            ElementType::Sint64 => SINT64_NAME,
            ElementType::Uint8 => UINT8_NAME,
            ElementType::Uint16 => UINT16_NAME,
            ElementType::Uint32 => UINT32_NAME,
            ElementType::Uint64 => UINT64_NAME,
            ElementType::Float32 => FLOAT32_NAME,
            ElementType::Float64 => FLOAT64_NAME,
            ElementType::Boolean => BOOLEAN_NAME,
            ElementType::String => STRING_NAME,
            ElementType::Enumeration => ENUMERATION_NAME,
            ElementType::Binary => BINARY_NAME,
            ElementType::Unset => UNSET_NAME,
        }
    }

    /// Number of bytes a single element occupies on the wire. Variable
    /// length types return `None`.
    pub fn wire_size(&self) -> Option<usize> {
        match self {
            ElementType::Sint8 | ElementType::Uint8 | ElementType::Boolean => Some(1),
            ElementType::Sint16 | ElementType::Uint16 => Some(2),
            ElementType::Sint32
            | ElementType::Uint32
            | ElementType::Float32
            | ElementType::Enumeration => Some(4),
            ElementType::Sint64 | ElementType::Uint64 | ElementType::Float64 => Some(8),
            ElementType::String | ElementType::Binary | ElementType::Unset => None,
        }
    }

    /// Element type assumed when a variable doesn't declare one.
    pub fn default_for(kind: ValueKind, is_enumeration: bool) -> ElementType {
        match kind {
            ValueKind::Real => ElementType::Float64,
            ValueKind::Integer if is_enumeration => ElementType::Enumeration,
            ValueKind::Integer => ElementType::Sint32,
            ValueKind::Boolean => ElementType::Boolean,
            ValueKind::String => ElementType::String,
            ValueKind::Binary => ElementType::Binary,
        }
    }
}

/// Kind of value as seen by the host simulator.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum ValueKind {
    Real,
    Integer,
    Boolean,
    String,
    Binary,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_str())
    }
}

impl ValueKind {
    pub const ALL: [ValueKind; 5] = [
        ValueKind::Real,
        ValueKind::Integer,
        ValueKind::Boolean,
        ValueKind::String,
        ValueKind::Binary,
    ];

    /// Maps the name of a variable's type element to a kind, also telling
    /// whether the element declares an enumeration.
    pub fn from_element_name(s: &str) -> Option<(ValueKind, bool)> {
        match s {
            REAL_KIND_NAME => Some((ValueKind::Real, false)),
            INTEGER_KIND_NAME => Some((ValueKind::Integer, false)),
            ENUMERATION_KIND_NAME => Some((ValueKind::Integer, true)),
            BOOLEAN_KIND_NAME => Some((ValueKind::Boolean, false)),
            STRING_KIND_NAME => Some((ValueKind::String, false)),
            BINARY_KIND_NAME => Some((ValueKind::Binary, false)),
            _ => None,
        }
    }

    pub fn to_str(&self) -> &'static str {
        match self {
            ValueKind::Real => REAL_KIND_NAME,
            ValueKind::Integer => INTEGER_KIND_NAME,
            ValueKind::Boolean => BOOLEAN_KIND_NAME,
            ValueKind::String => STRING_KIND_NAME,
            ValueKind::Binary => BINARY_KIND_NAME,
        }
    }
}

/// Direction of data flow for a variable.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Causality {
    Input,
    Output,
    Parameter,
    Unset,
}

impl fmt::Display for Causality {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_str())
    }
}

impl Causality {
    /// Unknown names map to `Unset`.
    pub fn from_name(s: &str) -> Causality {
        match s {
            INPUT_NAME => Causality::Input,
            OUTPUT_NAME => Causality::Output,
            PARAMETER_NAME => Causality::Parameter,
            _ => Causality::Unset,
        }
    }

    pub fn to_str(&self) -> &'static str {
        match self {
            Causality::Input => INPUT_NAME,
            Causality::Output => OUTPUT_NAME,
            Causality::Parameter => PARAMETER_NAME,
            Causality::Unset => UNSET_NAME,
        }
    }

    /// Whether values flow from the host towards the worker.
    pub fn is_host_written(&self) -> bool {
        match self {
            Causality::Input | Causality::Parameter => true,
            _ => false,
        }
    }
}

/// Linear scaling between raw integer memory and physical values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quantization {
    pub enabled: bool,
    pub factor: f64,
    pub offset: f64,
}

impl Default for Quantization {
    fn default() -> Self {
        Self {
            enabled: false,
            factor: 1.0,
            offset: 0.0,
        }
    }
}

impl Quantization {
    pub fn new(factor: f64, offset: f64) -> Self {
        Self {
            enabled: true,
            factor,
            offset,
        }
    }

    /// Raw to physical.
    pub fn apply(&self, raw: f64) -> f64 {
        if self.enabled {
            raw * self.factor + self.offset
        } else {
            raw
        }
    }

    /// Physical to raw.
    pub fn remove(&self, value: f64) -> f64 {
        if self.enabled && self.factor != 0.0 {
            (value - self.offset) / self.factor
        } else {
            value
        }
    }
}

/// Raw numeric read straight out of a wire buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Raw {
    Signed(i64),
    Unsigned(u64),
    Float(f64),
    Bool(bool),
}

fn read_raw(element_type: ElementType, bytes: &[u8]) -> Result<Raw> {
    let width = element_type.wire_size().ok_or_else(|| {
        Error::TypeMismatch(format!("{} has no fixed wire width", element_type))
    })?;
    if bytes.len() < width {
        return Err(Error::TypeMismatch(format!(
            "{} needs {} bytes, got {}",
            element_type,
            width,
            bytes.len()
        )));
    }
    let raw = match element_type {
        ElementType::Sint8 => Raw::Signed(bytes[0] as i8 as i64),
        ElementType::Sint16 => Raw::Signed(LittleEndian::read_i16(bytes) as i64),
        ElementType::Sint32 | ElementType::Enumeration => {
            Raw::Signed(LittleEndian::read_i32(bytes) as i64)
        }
        ElementType::Sint64 => Raw::Signed(LittleEndian::read_i64(bytes)),
        ElementType::Uint8 => Raw::Unsigned(bytes[0] as u64),
        ElementType::Uint16 => Raw::Unsigned(LittleEndian::read_u16(bytes) as u64),
        ElementType::Uint32 => Raw::Unsigned(LittleEndian::read_u32(bytes) as u64),
        ElementType::Uint64 => Raw::Unsigned(LittleEndian::read_u64(bytes)),
        ElementType::Float32 => Raw::Float(LittleEndian::read_f32(bytes) as f64),
        ElementType::Float64 => Raw::Float(LittleEndian::read_f64(bytes)),
        ElementType::Boolean => Raw::Bool(bytes[0] != 0),
        ElementType::String | ElementType::Binary | ElementType::Unset => unreachable!(),
    };
    Ok(raw)
}

/// Current or start value of a variable.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Real(f64),
    Integer(i64),
    Boolean(bool),
    String(FixedString),
    Binary(Vec<u8>),
}

impl Value {
    pub fn zero(kind: ValueKind) -> Value {
        match kind {
            ValueKind::Real => Value::Real(0.0),
            ValueKind::Integer => Value::Integer(0),
            ValueKind::Boolean => Value::Boolean(false),
            ValueKind::String => Value::String(FixedString::new()),
            ValueKind::Binary => Value::Binary(Vec::new()),
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Real(_) => ValueKind::Real,
            Value::Integer(_) => ValueKind::Integer,
            Value::Boolean(_) => ValueKind::Boolean,
            Value::String(_) => ValueKind::String,
            Value::Binary(_) => ValueKind::Binary,
        }
    }

    /// Parses a declared start value literal.
    ///
    /// Literals that don't parse fall back to the kind's zero value.
    pub fn parse_start(kind: ValueKind, literal: &str) -> Value {
        let trimmed = literal.trim();
        match kind {
            ValueKind::Real => match trimmed.parse::<f64>() {
                Ok(v) => Value::Real(v),
                Err(e) => {
                    warn!("invalid real start value `{}`: {}", literal, e);
                    Value::zero(kind)
                }
            },
            ValueKind::Integer => match util::parse_dec_or_hex(trimmed) {
                Ok(v) => Value::Integer(v),
                Err(e) => {
                    warn!("invalid integer start value `{}`: {}", literal, e);
                    Value::zero(kind)
                }
            },
            ValueKind::Boolean => Value::Boolean(trimmed == "true" || trimmed == "1"),
            ValueKind::String => Value::String(arraystring::new_truncate(literal)),
            ValueKind::Binary => Value::Binary(literal.as_bytes().to_vec()),
        }
    }

    /// Decodes a wire buffer laid out as `element_type` into a value of the
    /// given kind.
    pub fn decode(
        kind: ValueKind,
        element_type: ElementType,
        quantization: &Quantization,
        bytes: &[u8],
    ) -> Result<Value> {
        match kind {
            ValueKind::String => return Ok(Value::String(arraystring::from_wire(bytes)?)),
            ValueKind::Binary => return Ok(Value::Binary(bytes.to_vec())),
            _ => (),
        }
        let raw = read_raw(element_type, bytes)?;
        let value = match kind {
            ValueKind::Real => Value::Real(match raw {
                Raw::Signed(v) => quantization.apply(v as f64),
                Raw::Unsigned(v) => quantization.apply(v as f64),
                Raw::Float(v) => v,
                Raw::Bool(b) => b as u8 as f64,
            }),
            ValueKind::Integer => Value::Integer(match raw {
                Raw::Signed(v) if !quantization.enabled => v,
                Raw::Unsigned(v) if !quantization.enabled => i64::try_from(v).map_err(|_| {
                    Error::TypeMismatch(format!("{} doesn't fit into a signed integer", v))
                })?,
                Raw::Signed(v) => quantization.apply(v as f64).round() as i64,
                Raw::Unsigned(v) => quantization.apply(v as f64).round() as i64,
                Raw::Bool(b) => b as i64,
                Raw::Float(_) => {
                    return Err(Error::TypeMismatch(format!(
                        "can't read integer from {}",
                        element_type
                    )))
                }
            }),
            ValueKind::Boolean => Value::Boolean(match raw {
                Raw::Signed(v) => v != 0,
                Raw::Unsigned(v) => v != 0,
                Raw::Float(v) => v != 0.0,
                Raw::Bool(b) => b,
            }),
            ValueKind::String | ValueKind::Binary => unreachable!(),
        };
        Ok(value)
    }

    /// Encodes the value into the worker's memory layout.
    pub fn encode(&self, element_type: ElementType, quantization: &Quantization) -> Result<Vec<u8>> {
        match self {
            Value::String(s) => {
                let mut bytes = s.as_bytes().to_vec();
                bytes.push(0);
                return Ok(bytes);
            }
            Value::Binary(b) => return Ok(b.clone()),
            _ => (),
        }
        let width = element_type.wire_size().ok_or_else(|| {
            Error::TypeMismatch(format!(
                "can't write {} as {}",
                self.kind(),
                element_type
            ))
        })?;
        let mut buf = vec![0; width];
        match element_type {
            ElementType::Float32 => LittleEndian::write_f32(&mut buf, self.numeric()? as f32),
            ElementType::Float64 => LittleEndian::write_f64(&mut buf, self.numeric()?),
            ElementType::Boolean => buf[0] = (self.numeric()? != 0.0) as u8,
            _ => {
                let raw = self.integer_raw(quantization)?;
                match element_type {
                    ElementType::Sint8 | ElementType::Uint8 => buf[0] = raw as u8,
                    ElementType::Sint16 => LittleEndian::write_i16(&mut buf, raw as i16),
                    ElementType::Uint16 => LittleEndian::write_u16(&mut buf, raw as u16),
                    ElementType::Sint32 | ElementType::Enumeration => {
                        LittleEndian::write_i32(&mut buf, raw as i32)
                    }
                    ElementType::Uint32 => LittleEndian::write_u32(&mut buf, raw as u32),
                    ElementType::Sint64 => LittleEndian::write_i64(&mut buf, raw),
                    ElementType::Uint64 => LittleEndian::write_u64(&mut buf, raw as u64),
                    _ => unreachable!(),
                }
            }
        }
        Ok(buf)
    }

    fn numeric(&self) -> Result<f64> {
        match self {
            Value::Real(v) => Ok(*v),
            Value::Integer(v) => Ok(*v as f64),
            Value::Boolean(b) => Ok(*b as u8 as f64),
            _ => Err(Error::TypeMismatch(format!(
                "expected numeric value, got {}",
                self.kind()
            ))),
        }
    }

    fn integer_raw(&self, quantization: &Quantization) -> Result<i64> {
        match self {
            Value::Integer(v) if !quantization.enabled => Ok(*v),
            Value::Boolean(b) => Ok(*b as i64),
            _ => Ok(quantization.remove(self.numeric()?).round() as i64),
        }
    }
}

/// Type-strict `as_type` getters.
impl Value {
    pub fn as_real(&self) -> Result<f64> {
        match self {
            Value::Real(v) => Ok(*v),
            _ => Err(Error::TypeMismatch(format!(
                "expected real, got {}",
                self.kind()
            ))),
        }
    }

    pub fn as_integer(&self) -> Result<i64> {
        match self {
            Value::Integer(v) => Ok(*v),
            _ => Err(Error::TypeMismatch(format!(
                "expected integer, got {}",
                self.kind()
            ))),
        }
    }

    pub fn as_boolean(&self) -> Result<bool> {
        match self {
            Value::Boolean(v) => Ok(*v),
            _ => Err(Error::TypeMismatch(format!(
                "expected boolean, got {}",
                self.kind()
            ))),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::String(v) => Ok(v.as_str()),
            _ => Err(Error::TypeMismatch(format!(
                "expected string, got {}",
                self.kind()
            ))),
        }
    }

    pub fn as_binary(&self) -> Result<&[u8]> {
        match self {
            Value::Binary(v) => Ok(v),
            _ => Err(Error::TypeMismatch(format!(
                "expected binary, got {}",
                self.kind()
            ))),
        }
    }
}
