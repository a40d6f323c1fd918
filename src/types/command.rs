//! Typed results of Sky commands

use serde::{Deserialize, Serialize};

use crate::ReturnCode;

/// Type tag of a Sky command's return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SkyReturnType {
    Void = 0,
    String = 1,
    Bool = 2,
    Char = 3,
    Short = 4,
    Int = 5,
    Long = 6,
    Float = 7,
    Double = 8,
}

impl SkyReturnType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(SkyReturnType::Void),
            1 => Some(SkyReturnType::String),
            2 => Some(SkyReturnType::Bool),
            3 => Some(SkyReturnType::Char),
            4 => Some(SkyReturnType::Short),
            5 => Some(SkyReturnType::Int),
            6 => Some(SkyReturnType::Long),
            7 => Some(SkyReturnType::Float),
            8 => Some(SkyReturnType::Double),
            _ => None,
        }
    }
}

/// Value returned by a Sky command. The variant is the type tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SkyValue {
    Void,
    String(String),
    Bool(bool),
    Char(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
}

impl SkyValue {
    pub fn return_type(&self) -> SkyReturnType {
        match self {
            SkyValue::Void => SkyReturnType::Void,
            SkyValue::String(_) => SkyReturnType::String,
            SkyValue::Bool(_) => SkyReturnType::Bool,
            SkyValue::Char(_) => SkyReturnType::Char,
            SkyValue::Short(_) => SkyReturnType::Short,
            SkyValue::Int(_) => SkyReturnType::Int,
            SkyValue::Long(_) => SkyReturnType::Long,
            SkyValue::Float(_) => SkyReturnType::Float,
            SkyValue::Double(_) => SkyReturnType::Double,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SkyValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Any integral value widened to `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            SkyValue::Char(v) => Some(v as i64),
            SkyValue::Short(v) => Some(v as i64),
            SkyValue::Int(v) => Some(v as i64),
            SkyValue::Long(v) => Some(v),
            _ => None,
        }
    }

    /// Any floating value widened to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            SkyValue::Float(v) => Some(v as f64),
            SkyValue::Double(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            SkyValue::Bool(v) => Some(v),
            _ => None,
        }
    }
}

/// Outcome of a Sky command as reported by the host.
///
/// `code` is the host's verdict on executing the command. When it is not
/// `Okay`, `value` usually carries a string explaining why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkyReturn {
    pub code: ReturnCode,
    pub value: SkyValue,
}

impl SkyReturn {
    pub fn is_okay(&self) -> bool {
        self.code.is_okay()
    }

    pub fn return_type(&self) -> SkyReturnType {
        self.value.return_type()
    }
}
