#![forbid(unsafe_code)]

//! In-process columnar array runtime.
//!
//! Columns are immutable typed buffers shared through `Arc`: cloning a
//! [`Column`] retains the buffer and dropping it releases the reference.
//! Slices are zero-copy views over the parent buffer and validity bitmap.

use std::fmt;
use std::sync::Arc;

use cs_types::{DType, Literal, NumericKind, WideSum};
use thiserror::Error;

mod kernels;

pub use kernels::{SUM_LANES, call_named_kernel, cast, filter, is_not_null, vectorized_sum};

// ── Validity bitmap ────────────────────────────────────────────────────

/// Packed validity bitmap: bit `i` set means slot `i` holds a value.
#[derive(Debug, Clone, Eq)]
pub struct ValidityMask {
    words: Vec<u64>,
    len: usize,
}

impl ValidityMask {
    #[must_use]
    pub fn get(&self, idx: usize) -> bool {
        if idx >= self.len {
            return false;
        }
        (self.words[idx / 64] >> (idx % 64)) & 1 == 1
    }

    #[must_use]
    pub fn count_valid(&self) -> usize {
        self.count_valid_range(0, self.len)
    }

    /// Number of set bits in `[start, start + len)`, clipped to the mask.
    #[must_use]
    pub fn count_valid_range(&self, start: usize, len: usize) -> usize {
        let end = start.saturating_add(len).min(self.len);
        let mut count = 0_usize;
        let mut idx = start;
        while idx < end {
            let bit = idx % 64;
            let span = (64 - bit).min(end - idx);
            let mask = if span == 64 {
                u64::MAX
            } else {
                ((1_u64 << span) - 1) << bit
            };
            count += (self.words[idx / 64] & mask).count_ones() as usize;
            idx += span;
        }
        count
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl FromIterator<bool> for ValidityMask {
    fn from_iter<I: IntoIterator<Item = bool>>(iter: I) -> Self {
        let mut words = Vec::new();
        let mut len = 0_usize;
        for valid in iter {
            if len % 64 == 0 {
                words.push(0_u64);
            }
            if valid {
                words[len / 64] |= 1_u64 << (len % 64);
            }
            len += 1;
        }
        Self { words, len }
    }
}

impl PartialEq for ValidityMask {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && (0..self.len).all(|idx| self.get(idx) == other.get(idx))
    }
}

// ── Typed buffers ──────────────────────────────────────────────────────

/// Reference-counted typed buffer backing a column.
#[derive(Debug, Clone)]
pub enum ColumnData {
    Int8(Arc<[i8]>),
    Int16(Arc<[i16]>),
    Int32(Arc<[i32]>),
    Int64(Arc<[i64]>),
    UInt8(Arc<[u8]>),
    UInt16(Arc<[u16]>),
    UInt32(Arc<[u32]>),
    UInt64(Arc<[u64]>),
    Float32(Arc<[f32]>),
    Float64(Arc<[f64]>),
    Utf8(Arc<[String]>),
    Bool(Arc<[bool]>),
}

/// Evaluates `$body` with `$buf` bound to whichever buffer `$data` holds.
macro_rules! with_buffer {
    ($data:expr, $buf:ident => $body:expr) => {
        match $data {
            ColumnData::Int8($buf) => $body,
            ColumnData::Int16($buf) => $body,
            ColumnData::Int32($buf) => $body,
            ColumnData::Int64($buf) => $body,
            ColumnData::UInt8($buf) => $body,
            ColumnData::UInt16($buf) => $body,
            ColumnData::UInt32($buf) => $body,
            ColumnData::UInt64($buf) => $body,
            ColumnData::Float32($buf) => $body,
            ColumnData::Float64($buf) => $body,
            ColumnData::Utf8($buf) => $body,
            ColumnData::Bool($buf) => $body,
        }
    };
}

/// Like `with_buffer!`, but rewraps the produced buffer in the same variant.
macro_rules! map_buffer {
    ($data:expr, $buf:ident => $body:expr) => {
        match $data {
            ColumnData::Int8($buf) => ColumnData::Int8($body),
            ColumnData::Int16($buf) => ColumnData::Int16($body),
            ColumnData::Int32($buf) => ColumnData::Int32($body),
            ColumnData::Int64($buf) => ColumnData::Int64($body),
            ColumnData::UInt8($buf) => ColumnData::UInt8($body),
            ColumnData::UInt16($buf) => ColumnData::UInt16($body),
            ColumnData::UInt32($buf) => ColumnData::UInt32($body),
            ColumnData::UInt64($buf) => ColumnData::UInt64($body),
            ColumnData::Float32($buf) => ColumnData::Float32($body),
            ColumnData::Float64($buf) => ColumnData::Float64($body),
            ColumnData::Utf8($buf) => ColumnData::Utf8($body),
            ColumnData::Bool($buf) => ColumnData::Bool($body),
        }
    };
}

impl ColumnData {
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

    /// Length of the whole buffer, regardless of any view over it.
    #[must_use]
    pub fn len(&self) -> usize {
        with_buffer!(self, buf => buf.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn strong_count(&self) -> usize {
        with_buffer!(self, buf => Arc::strong_count(buf))
    }

    fn address(&self) -> usize {
        with_buffer!(self, buf => Arc::as_ptr(buf).cast::<u8>() as usize)
    }

    fn empty(dtype: DType) -> Self {
        match dtype {
            DType::Int8 => Self::Int8(Arc::from([])),
            DType::Int16 => Self::Int16(Arc::from([])),
            DType::Int32 => Self::Int32(Arc::from([])),
            DType::Int64 => Self::Int64(Arc::from([])),
            DType::UInt8 => Self::UInt8(Arc::from([])),
            DType::UInt16 => Self::UInt16(Arc::from([])),
            DType::UInt32 => Self::UInt32(Arc::from([])),
            DType::UInt64 => Self::UInt64(Arc::from([])),
            DType::Float32 => Self::Float32(Arc::from([])),
            DType::Float64 => Self::Float64(Arc::from([])),
            DType::Utf8 => Self::Utf8(Arc::from([])),
            DType::Bool => Self::Bool(Arc::from([])),
        }
    }
}

/// Intermediate representation used by numeric casts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Int(i128),
    Float(f64),
}

fn float_to_integer(value: f64) -> Option<i128> {
    if !value.is_finite() || value.fract() != 0.0 {
        return None;
    }
    if value < i128::MIN as f64 || value > i128::MAX as f64 {
        return None;
    }
    Some(value as i128)
}

/// Element type stored in a [`ColumnData`] buffer.
pub trait NativeType: Clone + PartialOrd + Send + Sync + fmt::Debug + 'static {
    const DTYPE: DType;

    fn buffer(data: &ColumnData) -> Option<&Arc<[Self]>>;

    fn wrap(buffer: Arc<[Self]>) -> ColumnData;

    /// Value written into null slots.
    fn placeholder() -> Self;

    fn to_literal(&self) -> Literal;

    /// Extracts a value of exactly this type; no widening or narrowing.
    fn from_literal(literal: &Literal) -> Option<Self>;
}

/// Same-signedness lane accumulator a numeric kind widens into: 128-bit
/// for integers, `f64` for floats.
pub trait Accumulator: Copy + Default + Send + Sync + 'static {
    fn checked_add(self, rhs: Self) -> Option<Self>;

    fn finish(self) -> WideSum;
}

impl Accumulator for i128 {
    fn checked_add(self, rhs: Self) -> Option<Self> {
        i128::checked_add(self, rhs)
    }

    fn finish(self) -> WideSum {
        WideSum::Signed(self)
    }
}

impl Accumulator for u128 {
    fn checked_add(self, rhs: Self) -> Option<Self> {
        u128::checked_add(self, rhs)
    }

    fn finish(self) -> WideSum {
        WideSum::Unsigned(self)
    }
}

impl Accumulator for f64 {
    fn checked_add(self, rhs: Self) -> Option<Self> {
        Some(self + rhs)
    }

    fn finish(self) -> WideSum {
        WideSum::Float(self)
    }
}

/// One of the ten primitive numeric kinds.
pub trait NumericType: NativeType + Copy + fmt::Display {
    const KIND: NumericKind;

    type Wide: Accumulator;

    fn widen(self) -> Self::Wide;

    fn to_number(self) -> Number;

    /// Exact conversion for integer targets, `as` semantics for floats.
    fn from_number(number: Number) -> Option<Self>;
}

macro_rules! impl_integer {
    ($native:ty, $variant:ident, $wide:ty) => {
        impl NativeType for $native {
            const DTYPE: DType = DType::$variant;

            fn buffer(data: &ColumnData) -> Option<&Arc<[Self]>> {
                match data {
                    ColumnData::$variant(buf) => Some(buf),
                    _ => None,
                }
            }

            fn wrap(buffer: Arc<[Self]>) -> ColumnData {
                ColumnData::$variant(buffer)
            }

            fn placeholder() -> Self {
                0
            }

            fn to_literal(&self) -> Literal {
                Literal::$variant(*self)
            }

            fn from_literal(literal: &Literal) -> Option<Self> {
                match literal {
                    Literal::$variant(v) => Some(*v),
                    _ => None,
                }
            }
        }

        impl NumericType for $native {
            const KIND: NumericKind = NumericKind::$variant;

            type Wide = $wide;

            fn widen(self) -> $wide {
                <$wide>::from(self)
            }

            fn to_number(self) -> Number {
                Number::Int(i128::from(self))
            }

            fn from_number(number: Number) -> Option<Self> {
                match number {
                    Number::Int(v) => Self::try_from(v).ok(),
                    Number::Float(v) => float_to_integer(v).and_then(|v| Self::try_from(v).ok()),
                }
            }
        }
    };
}

macro_rules! impl_float {
    ($native:ty, $variant:ident) => {
        impl NativeType for $native {
            const DTYPE: DType = DType::$variant;

            fn buffer(data: &ColumnData) -> Option<&Arc<[Self]>> {
                match data {
                    ColumnData::$variant(buf) => Some(buf),
                    _ => None,
                }
            }

            fn wrap(buffer: Arc<[Self]>) -> ColumnData {
                ColumnData::$variant(buffer)
            }

            fn placeholder() -> Self {
                0.0
            }

            fn to_literal(&self) -> Literal {
                Literal::$variant(*self)
            }

            fn from_literal(literal: &Literal) -> Option<Self> {
                match literal {
                    Literal::$variant(v) => Some(*v),
                    _ => None,
                }
            }
        }

        impl NumericType for $native {
            const KIND: NumericKind = NumericKind::$variant;

            type Wide = f64;

            fn widen(self) -> f64 {
                f64::from(self)
            }

            fn to_number(self) -> Number {
                Number::Float(f64::from(self))
            }

            fn from_number(number: Number) -> Option<Self> {
                match number {
                    Number::Int(v) => Some(v as $native),
                    Number::Float(v) => Some(v as $native),
                }
            }
        }
    };
}

impl_integer!(i8, Int8, i128);
impl_integer!(i16, Int16, i128);
impl_integer!(i32, Int32, i128);
impl_integer!(i64, Int64, i128);
impl_integer!(u8, UInt8, u128);
impl_integer!(u16, UInt16, u128);
impl_integer!(u32, UInt32, u128);
impl_integer!(u64, UInt64, u128);
impl_float!(f32, Float32);
impl_float!(f64, Float64);

impl NativeType for String {
    const DTYPE: DType = DType::Utf8;

    fn buffer(data: &ColumnData) -> Option<&Arc<[Self]>> {
        match data {
            ColumnData::Utf8(buf) => Some(buf),
            _ => None,
        }
    }

    fn wrap(buffer: Arc<[Self]>) -> ColumnData {
        ColumnData::Utf8(buffer)
    }

    fn placeholder() -> Self {
        Self::new()
    }

    fn to_literal(&self) -> Literal {
        Literal::Utf8(self.clone())
    }

    fn from_literal(literal: &Literal) -> Option<Self> {
        match literal {
            Literal::Utf8(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl NativeType for bool {
    const DTYPE: DType = DType::Bool;

    fn buffer(data: &ColumnData) -> Option<&Arc<[Self]>> {
        match data {
            ColumnData::Bool(buf) => Some(buf),
            _ => None,
        }
    }

    fn wrap(buffer: Arc<[Self]>) -> ColumnData {
        ColumnData::Bool(buffer)
    }

    fn placeholder() -> Self {
        false
    }

    fn to_literal(&self) -> Literal {
        Literal::Bool(*self)
    }

    fn from_literal(literal: &Literal) -> Option<Self> {
        match literal {
            Literal::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

/// Borrowed view of a numeric column's values, one variant per kind.
#[derive(Debug, Clone, Copy)]
pub enum NumericSlice<'a> {
    Int8(&'a [i8]),
    Int16(&'a [i16]),
    Int32(&'a [i32]),
    Int64(&'a [i64]),
    UInt8(&'a [u8]),
    UInt16(&'a [u16]),
    UInt32(&'a [u32]),
    UInt64(&'a [u64]),
    Float32(&'a [f32]),
    Float64(&'a [f64]),
}

/// Runs one generic body over whichever numeric kind a [`NumericSlice`]
/// holds, binding `$values` to the typed slice.
#[macro_export]
macro_rules! dispatch_numeric {
    ($slice:expr, $values:ident => $body:expr) => {
        match $slice {
            $crate::NumericSlice::Int8($values) => $body,
            $crate::NumericSlice::Int16($values) => $body,
            $crate::NumericSlice::Int32($values) => $body,
            $crate::NumericSlice::Int64($values) => $body,
            $crate::NumericSlice::UInt8($values) => $body,
            $crate::NumericSlice::UInt16($values) => $body,
            $crate::NumericSlice::UInt32($values) => $body,
            $crate::NumericSlice::UInt64($values) => $body,
            $crate::NumericSlice::Float32($values) => $body,
            $crate::NumericSlice::Float64($values) => $body,
        }
    };
}

// ── Column ─────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ColumnError {
    #[error("column length mismatch: left={left}, right={right}")]
    LengthMismatch { left: usize, right: usize },
    #[error("filter mask must have dtype bool, found {dtype}")]
    MaskNotBoolean { dtype: DType },
    #[error("cannot compare column of dtype {column} with literal of dtype {literal}")]
    TypeMismatch { column: DType, literal: DType },
    #[error("cannot cast {from} to {to}")]
    InvalidCast { from: DType, to: DType },
    #[error("value {value} of dtype {from} is not representable as {to}")]
    LossyCast {
        from: DType,
        to: DType,
        value: String,
    },
    #[error("unknown kernel {name:?}")]
    UnknownKernel { name: String },
    #[error("vectorized sum is not defined for dtype {dtype}")]
    UnsupportedSum { dtype: DType },
    #[error("slice at offset {offset} with length {len} exceeds column length {available}")]
    SliceOutOfBounds {
        offset: usize,
        len: usize,
        available: usize,
    },
    #[error("index {index} out of bounds for column length {len}")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("buffer of dtype {found} cannot be read as {expected}")]
    BufferType { expected: DType, found: DType },
}

/// Immutable, reference-counted column, possibly a view into a larger
/// buffer.
#[derive(Debug, Clone)]
pub struct Column {
    data: ColumnData,
    validity: Option<Arc<ValidityMask>>,
    offset: usize,
    len: usize,
    null_count: usize,
}

impl Column {
    /// Builds a column whose buffer and mask are already length-matched.
    fn assemble(data: ColumnData, validity: Option<ValidityMask>) -> Self {
        let len = data.len();
        let null_count = validity
            .as_ref()
            .map_or(0, |mask| mask.len() - mask.count_valid());
        let validity = validity.filter(|_| null_count > 0).map(Arc::new);
        Self {
            data,
            validity,
            offset: 0,
            len,
            null_count,
        }
    }

    #[must_use]
    pub fn from_values<T: NativeType>(values: Vec<T>) -> Self {
        Self::assemble(T::wrap(values.into()), None)
    }

    /// `None` entries become nulls; their buffer slots hold a placeholder.
    #[must_use]
    pub fn from_options<T: NativeType>(values: Vec<Option<T>>) -> Self {
        let validity: ValidityMask = values.iter().map(Option::is_some).collect();
        let buffer: Vec<T> = values
            .into_iter()
            .map(|value| value.unwrap_or_else(T::placeholder))
            .collect();
        Self::assemble(T::wrap(buffer.into()), Some(validity))
    }

    pub fn from_buffer(
        data: ColumnData,
        validity: Option<ValidityMask>,
    ) -> Result<Self, ColumnError> {
        if let Some(mask) = &validity
            && mask.len() != data.len()
        {
            return Err(ColumnError::LengthMismatch {
                left: data.len(),
                right: mask.len(),
            });
        }
        Ok(Self::assemble(data, validity))
    }

    #[must_use]
    pub fn empty(dtype: DType) -> Self {
        Self::assemble(ColumnData::empty(dtype), None)
    }

    /// One-element column holding `literal`.
    #[must_use]
    pub fn from_literal(literal: &Literal) -> Self {
        match literal {
            Literal::Int8(v) => Self::from_values(vec![*v]),
            Literal::Int16(v) => Self::from_values(vec![*v]),
            Literal::Int32(v) => Self::from_values(vec![*v]),
            Literal::Int64(v) => Self::from_values(vec![*v]),
            Literal::UInt8(v) => Self::from_values(vec![*v]),
            Literal::UInt16(v) => Self::from_values(vec![*v]),
            Literal::UInt32(v) => Self::from_values(vec![*v]),
            Literal::UInt64(v) => Self::from_values(vec![*v]),
            Literal::Float32(v) => Self::from_values(vec![*v]),
            Literal::Float64(v) => Self::from_values(vec![*v]),
            Literal::Utf8(v) => Self::from_values(vec![v.clone()]),
            Literal::Bool(v) => Self::from_values(vec![*v]),
        }
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn null_count(&self) -> usize {
        self.null_count
    }

    #[must_use]
    pub fn has_nulls(&self) -> bool {
        self.null_count > 0
    }

    #[must_use]
    pub fn is_valid(&self, idx: usize) -> bool {
        if idx >= self.len {
            return false;
        }
        self.validity
            .as_ref()
            .is_none_or(|mask| mask.get(self.offset + idx))
    }

    #[must_use]
    pub fn is_null(&self, idx: usize) -> bool {
        idx < self.len && !self.is_valid(idx)
    }

    /// Raw values of this view, null slots included.
    #[must_use]
    pub fn values<T: NativeType>(&self) -> Option<&[T]> {
        T::buffer(&self.data).map(|buf| &buf[self.offset..self.offset + self.len])
    }

    pub fn typed_values<T: NativeType>(&self) -> Result<&[T], ColumnError> {
        self.values::<T>().ok_or(ColumnError::BufferType {
            expected: T::DTYPE,
            found: self.dtype(),
        })
    }

    #[must_use]
    pub fn numeric_slice(&self) -> Option<NumericSlice<'_>> {
        let range = self.offset..self.offset + self.len;
        let slice = match &self.data {
            ColumnData::Int8(buf) => NumericSlice::Int8(&buf[range]),
            ColumnData::Int16(buf) => NumericSlice::Int16(&buf[range]),
            ColumnData::Int32(buf) => NumericSlice::Int32(&buf[range]),
            ColumnData::Int64(buf) => NumericSlice::Int64(&buf[range]),
            ColumnData::UInt8(buf) => NumericSlice::UInt8(&buf[range]),
            ColumnData::UInt16(buf) => NumericSlice::UInt16(&buf[range]),
            ColumnData::UInt32(buf) => NumericSlice::UInt32(&buf[range]),
            ColumnData::UInt64(buf) => NumericSlice::UInt64(&buf[range]),
            ColumnData::Float32(buf) => NumericSlice::Float32(&buf[range]),
            ColumnData::Float64(buf) => NumericSlice::Float64(&buf[range]),
            ColumnData::Utf8(_) | ColumnData::Bool(_) => return None,
        };
        Some(slice)
    }

    /// Value at `idx`, or `None` for nulls and out-of-range positions.
    #[must_use]
    pub fn value(&self, idx: usize) -> Option<Literal> {
        if !self.is_valid(idx) {
            return None;
        }
        let pos = self.offset + idx;
        Some(with_buffer!(&self.data, buf => buf[pos].to_literal()))
    }

    #[must_use]
    pub fn to_literals(&self) -> Vec<Option<Literal>> {
        (0..self.len).map(|idx| self.value(idx)).collect()
    }

    /// Zero-copy view of `len` elements starting at `offset`.
    pub fn slice(&self, offset: usize, len: usize) -> Result<Self, ColumnError> {
        let out_of_bounds = ColumnError::SliceOutOfBounds {
            offset,
            len,
            available: self.len,
        };
        let end = offset.checked_add(len).ok_or(out_of_bounds.clone())?;
        if end > self.len {
            return Err(out_of_bounds);
        }

        let start = self.offset + offset;
        let null_count = self
            .validity
            .as_ref()
            .map_or(0, |mask| len - mask.count_valid_range(start, len));
        Ok(Self {
            data: self.data.clone(),
            validity: self.validity.clone(),
            offset: start,
            len,
            null_count,
        })
    }

    /// Gathers the given positions into a new buffer.
    pub fn take(&self, indices: &[usize]) -> Result<Self, ColumnError> {
        if let Some(&index) = indices.iter().find(|&&index| index >= self.len) {
            return Err(ColumnError::IndexOutOfBounds {
                index,
                len: self.len,
            });
        }

        let offset = self.offset;
        let data = map_buffer!(&self.data, buf => indices
            .iter()
            .map(|&idx| buf[offset + idx].clone())
            .collect());
        let validity = self
            .has_nulls()
            .then(|| indices.iter().map(|&idx| self.is_valid(idx)).collect());
        Ok(Self::assemble(data, validity))
    }

    /// Another reference to the same buffer.
    #[must_use]
    pub fn retain(&self) -> Self {
        self.clone()
    }

    /// Number of live references to the underlying buffer.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.data.strong_count()
    }

    #[must_use]
    pub fn shares_buffer(&self, other: &Self) -> bool {
        self.dtype() == other.dtype() && self.data.address() == other.data.address()
    }

    /// Validity of this view rebased to offset zero; `None` without nulls.
    #[must_use]
    pub fn validity_bits(&self) -> Option<ValidityMask> {
        if !self.has_nulls() {
            return None;
        }
        Some((0..self.len).map(|idx| self.is_valid(idx)).collect())
    }
}

impl PartialEq for Column {
    fn eq(&self, other: &Self) -> bool {
        self.dtype() == other.dtype()
            && self.len == other.len
            && (0..self.len).all(|idx| self.value(idx) == other.value(idx))
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for idx in 0..self.len {
            if idx > 0 {
                f.write_str(", ")?;
            }
            match self.value(idx) {
                Some(value) => write!(f, "{value}")?,
                None => f.write_str("(null)")?,
            }
        }
        f.write_str("]")
    }
}
