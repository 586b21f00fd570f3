#![forbid(unsafe_code)]

use std::any::{Any, type_name};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Element type of a column.
///
/// The first ten variants form the numeric family ([`NumericKind`]); `Utf8`
/// and `Bool` are comparable but not aggregatable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Utf8,
    Bool,
}

impl DType {
    #[must_use]
    pub fn numeric_kind(self) -> Option<NumericKind> {
        let kind = match self {
            Self::Int8 => NumericKind::Int8,
            Self::Int16 => NumericKind::Int16,
            Self::Int32 => NumericKind::Int32,
            Self::Int64 => NumericKind::Int64,
            Self::UInt8 => NumericKind::UInt8,
            Self::UInt16 => NumericKind::UInt16,
            Self::UInt32 => NumericKind::UInt32,
            Self::UInt64 => NumericKind::UInt64,
            Self::Float32 => NumericKind::Float32,
            Self::Float64 => NumericKind::Float64,
            Self::Utf8 | Self::Bool => return None,
        };
        Some(kind)
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Int8 => "int8",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::UInt8 => "uint8",
            Self::UInt16 => "uint16",
            Self::UInt32 => "uint32",
            Self::UInt64 => "uint64",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::Utf8 => "utf8",
            Self::Bool => "bool",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Accumulation family of a numeric kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signedness {
    Signed,
    Unsigned,
    Float,
}

/// The closed set of ten primitive numeric kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NumericKind {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
}

impl NumericKind {
    pub const ALL: [Self; 10] = [
        Self::Int8,
        Self::Int16,
        Self::Int32,
        Self::Int64,
        Self::UInt8,
        Self::UInt16,
        Self::UInt32,
        Self::UInt64,
        Self::Float32,
        Self::Float64,
    ];

    #[must_use]
    pub fn dtype(self) -> DType {
        match self {
            Self::Int8 => DType::Int8,
            Self::Int16 => DType::Int16,
            Self::Int32 => DType::Int32,
            Self::Int64 => DType::Int64,
            Self::UInt8 => DType::UInt8,
            Self::UInt16 => DType::UInt16,
            Self::UInt32 => DType::UInt32,
            Self::UInt64 => DType::UInt64,
            Self::Float32 => DType::Float32,
            Self::Float64 => DType::Float64,
        }
    }

    #[must_use]
    pub fn signedness(self) -> Signedness {
        match self {
            Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64 => Signedness::Signed,
            Self::UInt8 | Self::UInt16 | Self::UInt32 | Self::UInt64 => Signedness::Unsigned,
            Self::Float32 | Self::Float64 => Signedness::Float,
        }
    }

    /// Widest kind of the same signedness; sums are accumulated in it.
    #[must_use]
    pub fn accumulator(self) -> Self {
        match self.signedness() {
            Signedness::Signed => Self::Int64,
            Signedness::Unsigned => Self::UInt64,
            Signedness::Float => Self::Float64,
        }
    }

    /// True when the kind already is its own accumulator (64-bit).
    #[must_use]
    pub fn is_accumulator(self) -> bool {
        self.accumulator() == self
    }
}

impl fmt::Display for NumericKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.dtype().fmt(f)
    }
}

/// Widened accumulator produced by a numeric sum before it is reported.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Accumulated {
    Int64(i64),
    UInt64(u64),
    Float64(f64),
}

impl Accumulated {
    /// Plain `as` conversion; precision checks belong to the caller.
    #[must_use]
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Int64(v) => v as f64,
            Self::UInt64(v) => v as f64,
            Self::Float64(v) => v,
        }
    }
}

impl fmt::Display for Accumulated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int64(v) => write!(f, "{v}"),
            Self::UInt64(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
        }
    }
}

/// Running sum kept in 128-bit integers (or `f64`) until the final total.
///
/// Lane and chunk partials combine here. Only the finished total is narrowed
/// to an [`Accumulated`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WideSum {
    Signed(i128),
    Unsigned(u128),
    Float(f64),
}

impl WideSum {
    #[must_use]
    pub fn zero(signedness: Signedness) -> Self {
        match signedness {
            Signedness::Signed => Self::Signed(0),
            Signedness::Unsigned => Self::Unsigned(0),
            Signedness::Float => Self::Float(0.0),
        }
    }

    /// Adds two partials of the same family; `None` on a family mix or on
    /// 128-bit overflow.
    #[must_use]
    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        match (self, rhs) {
            (Self::Signed(a), Self::Signed(b)) => a.checked_add(b).map(Self::Signed),
            (Self::Unsigned(a), Self::Unsigned(b)) => a.checked_add(b).map(Self::Unsigned),
            (Self::Float(a), Self::Float(b)) => Some(Self::Float(a + b)),
            _ => None,
        }
    }

    /// Narrows the total to its 64-bit accumulator; `None` when it does not
    /// fit.
    #[must_use]
    pub fn narrow(self) -> Option<Accumulated> {
        match self {
            Self::Signed(v) => i64::try_from(v).ok().map(Accumulated::Int64),
            Self::Unsigned(v) => u64::try_from(v).ok().map(Accumulated::UInt64),
            Self::Float(v) => Some(Accumulated::Float64(v)),
        }
    }
}

/// Typed scalar used as the right-hand side of a comparison and as the
/// single value of a reduction result.
///
/// The variant carries its own kind so that the strict column/literal type
/// match is a single `dtype()` equality check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Literal {
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    Utf8(String),
    Bool(bool),
}

impl Literal {
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::Int8(_) => DType::Int8,
            Self::Int16(_) => DType::Int16,
            Self::Int32(_) => DType::Int32,
            Self::Int64(_) => DType::Int64,
            Self::UInt8(_) => DType::UInt8,
            Self::UInt16(_) => DType::UInt16,
            Self::UInt32(_) => DType::UInt32,
            Self::UInt64(_) => DType::UInt64,
            Self::Float32(_) => DType::Float32,
            Self::Float64(_) => DType::Float64,
            Self::Utf8(_) => DType::Utf8,
            Self::Bool(_) => DType::Bool,
        }
    }

    /// Builds a literal from a dynamically typed value.
    ///
    /// Platform-width integers map to the 32- or 64-bit kind matching the
    /// target's pointer width. Any other type fails with
    /// [`TypeError::UnsupportedLiteral`].
    pub fn from_any<T: Any>(value: &T) -> Result<Self, TypeError> {
        let any = value as &dyn Any;
        if let Some(v) = any.downcast_ref::<i8>() {
            return Ok(Self::Int8(*v));
        }
        if let Some(v) = any.downcast_ref::<i16>() {
            return Ok(Self::Int16(*v));
        }
        if let Some(v) = any.downcast_ref::<i32>() {
            return Ok(Self::Int32(*v));
        }
        if let Some(v) = any.downcast_ref::<i64>() {
            return Ok(Self::Int64(*v));
        }
        if let Some(v) = any.downcast_ref::<u8>() {
            return Ok(Self::UInt8(*v));
        }
        if let Some(v) = any.downcast_ref::<u16>() {
            return Ok(Self::UInt16(*v));
        }
        if let Some(v) = any.downcast_ref::<u32>() {
            return Ok(Self::UInt32(*v));
        }
        if let Some(v) = any.downcast_ref::<u64>() {
            return Ok(Self::UInt64(*v));
        }
        if let Some(v) = any.downcast_ref::<isize>() {
            return Ok(Self::from_isize(*v));
        }
        if let Some(v) = any.downcast_ref::<usize>() {
            return Ok(Self::from_usize(*v));
        }
        if let Some(v) = any.downcast_ref::<f32>() {
            return Ok(Self::Float32(*v));
        }
        if let Some(v) = any.downcast_ref::<f64>() {
            return Ok(Self::Float64(*v));
        }
        if let Some(v) = any.downcast_ref::<String>() {
            return Ok(Self::Utf8(v.clone()));
        }
        if let Some(v) = any.downcast_ref::<&str>() {
            return Ok(Self::Utf8((*v).to_owned()));
        }
        if let Some(v) = any.downcast_ref::<bool>() {
            return Ok(Self::Bool(*v));
        }
        if let Some(v) = any.downcast_ref::<Self>() {
            return Ok(v.clone());
        }
        Err(TypeError::UnsupportedLiteral {
            type_name: type_name::<T>(),
        })
    }

    #[must_use]
    pub fn from_isize(value: isize) -> Self {
        if cfg!(target_pointer_width = "32") {
            Self::Int32(value as i32)
        } else {
            Self::Int64(value as i64)
        }
    }

    #[must_use]
    pub fn from_usize(value: usize) -> Self {
        if cfg!(target_pointer_width = "32") {
            Self::UInt32(value as u32)
        } else {
            Self::UInt64(value as u64)
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int8(v) => write!(f, "{v}"),
            Self::Int16(v) => write!(f, "{v}"),
            Self::Int32(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::UInt8(v) => write!(f, "{v}"),
            Self::UInt16(v) => write!(f, "{v}"),
            Self::UInt32(v) => write!(f, "{v}"),
            Self::UInt64(v) => write!(f, "{v}"),
            Self::Float32(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::Utf8(v) => write!(f, "{v:?}"),
            Self::Bool(v) => write!(f, "{v}"),
        }
    }
}

impl From<i8> for Literal {
    fn from(value: i8) -> Self {
        Self::Int8(value)
    }
}

impl From<i16> for Literal {
    fn from(value: i16) -> Self {
        Self::Int16(value)
    }
}

impl From<i32> for Literal {
    fn from(value: i32) -> Self {
        Self::Int32(value)
    }
}

impl From<i64> for Literal {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<u8> for Literal {
    fn from(value: u8) -> Self {
        Self::UInt8(value)
    }
}

impl From<u16> for Literal {
    fn from(value: u16) -> Self {
        Self::UInt16(value)
    }
}

impl From<u32> for Literal {
    fn from(value: u32) -> Self {
        Self::UInt32(value)
    }
}

impl From<u64> for Literal {
    fn from(value: u64) -> Self {
        Self::UInt64(value)
    }
}

impl From<f32> for Literal {
    fn from(value: f32) -> Self {
        Self::Float32(value)
    }
}

impl From<f64> for Literal {
    fn from(value: f64) -> Self {
        Self::Float64(value)
    }
}

impl From<bool> for Literal {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<String> for Literal {
    fn from(value: String) -> Self {
        Self::Utf8(value)
    }
}

impl From<&str> for Literal {
    fn from(value: &str) -> Self {
        Self::Utf8(value.to_owned())
    }
}

/// Relational operator of a scalar predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Equal,
    NotEqual,
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
}

impl CompareOp {
    pub const ALL: [Self; 6] = [
        Self::Equal,
        Self::NotEqual,
        Self::Greater,
        Self::GreaterOrEqual,
        Self::Less,
        Self::LessOrEqual,
    ];

    /// Name of the runtime comparison kernel implementing this operator.
    #[must_use]
    pub fn kernel_name(self) -> &'static str {
        match self {
            Self::Equal => "equal",
            Self::NotEqual => "not_equal",
            Self::Greater => "greater",
            Self::GreaterOrEqual => "greater_equal",
            Self::Less => "less",
            Self::LessOrEqual => "less_equal",
        }
    }

    #[must_use]
    pub fn from_kernel_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.kernel_name() == name)
    }

    /// Evaluates the relation `left <op> right` under native ordering.
    #[must_use]
    pub fn evaluate<T: PartialOrd + ?Sized>(self, left: &T, right: &T) -> bool {
        match self {
            Self::Equal => left == right,
            Self::NotEqual => left != right,
            Self::Greater => left > right,
            Self::GreaterOrEqual => left >= right,
            Self::Less => left < right,
            Self::LessOrEqual => left <= right,
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kernel_name())
    }
}

impl FromStr for CompareOp {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_kernel_name(s).ok_or_else(|| TypeError::UnknownOperator {
            name: s.to_owned(),
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("unsupported literal type: {type_name}")]
    UnsupportedLiteral { type_name: &'static str },
    #[error("unknown comparison operator {name:?}")]
    UnknownOperator { name: String },
}
