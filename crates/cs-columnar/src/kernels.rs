use cs_types::{CompareOp, DType, Literal, NumericKind, WideSum};

use crate::{Column, ColumnData, ColumnError, NativeType, Number, NumericType, dispatch_numeric};

/// Independent accumulators per unrolled sum; loop-path sums that must
/// round like [`vectorized_sum`] use the same count.
pub const SUM_LANES: usize = 8;

/// Casts `column` to `target`. Identity casts retain the input buffer.
///
/// Numeric to numeric casts are checked: any valid value that does not
/// survive the conversion fails with [`ColumnError::LossyCast`]. Bool
/// columns cast to numeric kinds as 0/1.
pub fn cast(column: &Column, target: DType) -> Result<Column, ColumnError> {
    let from = column.dtype();
    if from == target {
        return Ok(column.retain());
    }
    let Some(kind) = target.numeric_kind() else {
        return Err(ColumnError::InvalidCast { from, to: target });
    };
    if let Some(slice) = column.numeric_slice() {
        return dispatch_numeric!(slice, values => cast_numeric(column, values, kind));
    }
    if from == DType::Bool {
        let values = column.typed_values::<bool>()?;
        let numbers: Vec<Number> = values
            .iter()
            .map(|&flag| Number::Int(i128::from(flag)))
            .collect();
        return cast_numbers(column, from, &numbers, kind);
    }
    Err(ColumnError::InvalidCast { from, to: target })
}

fn cast_numeric<S: NumericType>(
    column: &Column,
    values: &[S],
    target: NumericKind,
) -> Result<Column, ColumnError> {
    let numbers: Vec<Number> = values.iter().map(|value| value.to_number()).collect();
    cast_numbers(column, S::DTYPE, &numbers, target)
}

fn cast_numbers(
    column: &Column,
    from: DType,
    numbers: &[Number],
    target: NumericKind,
) -> Result<Column, ColumnError> {
    match target {
        NumericKind::Int8 => convert::<i8>(column, from, numbers),
        NumericKind::Int16 => convert::<i16>(column, from, numbers),
        NumericKind::Int32 => convert::<i32>(column, from, numbers),
        NumericKind::Int64 => convert::<i64>(column, from, numbers),
        NumericKind::UInt8 => convert::<u8>(column, from, numbers),
        NumericKind::UInt16 => convert::<u16>(column, from, numbers),
        NumericKind::UInt32 => convert::<u32>(column, from, numbers),
        NumericKind::UInt64 => convert::<u64>(column, from, numbers),
        NumericKind::Float32 => convert::<f32>(column, from, numbers),
        NumericKind::Float64 => convert::<f64>(column, from, numbers),
    }
}

fn convert<T: NumericType>(
    column: &Column,
    from: DType,
    numbers: &[Number],
) -> Result<Column, ColumnError> {
    let has_nulls = column.has_nulls();
    let mut out = Vec::with_capacity(numbers.len());
    for (idx, &number) in numbers.iter().enumerate() {
        if has_nulls && column.is_null(idx) {
            out.push(T::placeholder());
            continue;
        }
        let converted = T::from_number(number).ok_or_else(|| ColumnError::LossyCast {
            from,
            to: T::DTYPE,
            value: match number {
                Number::Int(v) => v.to_string(),
                Number::Float(v) => v.to_string(),
            },
        })?;
        out.push(converted);
    }
    Column::from_buffer(T::wrap(out.into()), column.validity_bits())
}

/// Boolean column, same length as the input, true where a value is present.
#[must_use]
pub fn is_not_null(column: &Column) -> Column {
    let flags: Vec<bool> = (0..column.len()).map(|idx| column.is_valid(idx)).collect();
    Column::from_values(flags)
}

/// Keeps the rows of `column` where `mask` is true. Null mask slots drop
/// their row.
pub fn filter(column: &Column, mask: &Column) -> Result<Column, ColumnError> {
    if mask.dtype() != DType::Bool {
        return Err(ColumnError::MaskNotBoolean {
            dtype: mask.dtype(),
        });
    }
    if column.len() != mask.len() {
        return Err(ColumnError::LengthMismatch {
            left: column.len(),
            right: mask.len(),
        });
    }

    let flags = mask.typed_values::<bool>()?;
    let selected: Vec<usize> = flags
        .iter()
        .enumerate()
        .filter(|&(idx, &keep)| keep && mask.is_valid(idx))
        .map(|(idx, _)| idx)
        .collect();

    if selected.len() == column.len() {
        return Ok(column.retain());
    }
    if selected.is_empty() {
        return column.slice(0, 0);
    }
    column.take(&selected)
}

/// Element-wise comparison against a scalar, looked up by kernel name
/// (`equal`, `not_equal`, `greater`, `greater_equal`, `less`,
/// `less_equal`). The literal must carry exactly the column's dtype.
/// Null inputs yield null outputs.
pub fn call_named_kernel(
    name: &str,
    column: &Column,
    literal: &Literal,
) -> Result<Column, ColumnError> {
    let op = CompareOp::from_kernel_name(name).ok_or_else(|| ColumnError::UnknownKernel {
        name: name.to_owned(),
    })?;
    if literal.dtype() != column.dtype() {
        return Err(ColumnError::TypeMismatch {
            column: column.dtype(),
            literal: literal.dtype(),
        });
    }

    let flags = match column.numeric_slice() {
        Some(slice) => dispatch_numeric!(slice, values => compare_values(values, literal, op)),
        None => match column.dtype() {
            DType::Utf8 => compare_values(column.typed_values::<String>()?, literal, op),
            _ => compare_values(column.typed_values::<bool>()?, literal, op),
        },
    }?;
    Column::from_buffer(ColumnData::Bool(flags.into()), column.validity_bits())
}

fn compare_values<T: NativeType>(
    values: &[T],
    literal: &Literal,
    op: CompareOp,
) -> Result<Vec<bool>, ColumnError> {
    let rhs = T::from_literal(literal).ok_or(ColumnError::TypeMismatch {
        column: T::DTYPE,
        literal: literal.dtype(),
    })?;
    Ok(values.iter().map(|value| op.evaluate(value, &rhs)).collect())
}

/// Lane-unrolled sum over every slot of a 64-bit column.
///
/// Nulls are not skipped: callers compact first. Integer totals stay in
/// 128 bits; narrowing to the 64-bit accumulator is left to the caller so
/// partial sums can be combined first.
pub fn vectorized_sum(column: &Column) -> Result<WideSum, ColumnError> {
    match column.dtype() {
        DType::Int64 => Ok(WideSum::Signed(lane_sum(
            column.typed_values::<i64>()?,
            i128::from,
            0_i128,
        ))),
        DType::UInt64 => Ok(WideSum::Unsigned(lane_sum(
            column.typed_values::<u64>()?,
            u128::from,
            0_u128,
        ))),
        DType::Float64 => Ok(WideSum::Float(lane_sum(
            column.typed_values::<f64>()?,
            |v| v,
            0.0_f64,
        ))),
        other => Err(ColumnError::UnsupportedSum { dtype: other }),
    }
}

fn lane_sum<T, W>(values: &[T], widen: impl Fn(T) -> W, zero: W) -> W
where
    T: Copy,
    W: Copy + std::ops::Add<Output = W>,
{
    let mut lanes = [zero; SUM_LANES];
    let mut chunks = values.chunks_exact(SUM_LANES);
    for chunk in &mut chunks {
        for (lane, &value) in lanes.iter_mut().zip(chunk) {
            *lane = *lane + widen(value);
        }
    }
    let mut total = chunks
        .remainder()
        .iter()
        .fold(zero, |acc, &value| acc + widen(value));
    for lane in lanes {
        total = total + lane;
    }
    total
}
