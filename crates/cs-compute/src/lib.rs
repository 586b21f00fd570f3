#![forbid(unsafe_code)]

//! Null-aware reductions and predicate filtering over columns.
//!
//! Every reduction compacts nulls away first and sums into a
//! same-signedness 128-bit (or `f64`) total. The total is narrowed to the
//! 64-bit accumulator once and reported through [`to_reportable`], so the
//! loop, vectorized and chunked strategies share one overflow contract.

use std::any::Any;
use std::cmp::Ordering;

use cs_columnar::{
    Accumulator, Column, ColumnError, NumericType, SUM_LANES, call_named_kernel, cast,
    dispatch_numeric, filter, is_not_null, vectorized_sum,
};
use cs_runtime::{ExecutionConfig, SumPlan, SumStrategy};
use cs_types::{Accumulated, CompareOp, DType, Literal, NumericKind, TypeError, WideSum};
use log::{trace, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Errors ─────────────────────────────────────────────────────────────

/// Coarse classification callers can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    EmptyInput,
    Unsupported,
    TypeMismatch,
    UnsupportedLiteral,
    LengthMismatch,
    NullMask,
    Overflow,
    InvalidNumeric,
    ExternalRuntimeFailure,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ComputeError {
    #[error("{operation} requires a non-empty input")]
    EmptyInput { operation: &'static str },
    #[error("{operation} is not supported for dtype {dtype}")]
    Unsupported {
        operation: &'static str,
        dtype: DType,
    },
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: DType, found: DType },
    #[error(transparent)]
    Literal(#[from] TypeError),
    #[error("length mismatch: expected {expected}, found {found}")]
    LengthMismatch { expected: usize, found: usize },
    #[error("filter mask is missing")]
    NullMask,
    #[error("{value} is beyond the exactly representable float64 range")]
    Overflow { value: Accumulated },
    #[error("sum of {dtype} values overflows the 64-bit accumulator")]
    AccumulatorOverflow { dtype: DType },
    #[error("result is not a finite number: {value}")]
    InvalidNumeric { value: f64 },
    #[error(transparent)]
    Runtime(#[from] ColumnError),
}

impl ComputeError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyInput { .. } => ErrorKind::EmptyInput,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
            Self::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            Self::Literal(TypeError::UnsupportedLiteral { .. }) => ErrorKind::UnsupportedLiteral,
            Self::Literal(_) => ErrorKind::Unsupported,
            Self::LengthMismatch { .. } => ErrorKind::LengthMismatch,
            Self::NullMask => ErrorKind::NullMask,
            Self::Overflow { .. } | Self::AccumulatorOverflow { .. } => ErrorKind::Overflow,
            Self::InvalidNumeric { .. } => ErrorKind::InvalidNumeric,
            Self::Runtime(_) => ErrorKind::ExternalRuntimeFailure,
        }
    }
}

// ── Null compaction ────────────────────────────────────────────────────

/// Dense column holding only the valid entries. Without nulls this is a
/// retained reference to the input buffer.
pub fn compact(column: &Column) -> Result<Column, ComputeError> {
    if !column.has_nulls() {
        return Ok(column.retain());
    }
    let mask = is_not_null(column);
    Ok(filter(column, &mask)?)
}

// ── Overflow guard ─────────────────────────────────────────────────────

/// 2^53, the first integer float64 cannot step past exactly.
pub const MAX_EXACT_F64_INTEGER: u64 = 1 << 53;

/// Converts a widened accumulator into the reported float64.
pub fn to_reportable(value: Accumulated) -> Result<f64, ComputeError> {
    let exact_limit_exceeded = match value {
        Accumulated::Int64(v) => v.unsigned_abs() >= MAX_EXACT_F64_INTEGER,
        Accumulated::UInt64(v) => v >= MAX_EXACT_F64_INTEGER,
        Accumulated::Float64(v) => {
            if !v.is_finite() {
                return Err(ComputeError::InvalidNumeric { value: v });
            }
            v.abs() >= MAX_EXACT_F64_INTEGER as f64
        }
    };
    if exact_limit_exceeded {
        return Err(ComputeError::Overflow { value });
    }
    Ok(value.as_f64())
}

// ── Reductions ─────────────────────────────────────────────────────────

/// What a sum did, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SumTrace {
    pub plan: SumPlan,
    pub input_rows: usize,
    pub valid_rows: usize,
}

fn numeric_kind(column: &Column, operation: &'static str) -> Result<NumericKind, ComputeError> {
    column
        .dtype()
        .numeric_kind()
        .ok_or(ComputeError::Unsupported {
            operation,
            dtype: column.dtype(),
        })
}

/// Number of non-null entries.
#[must_use]
pub fn count(column: &Column) -> i64 {
    i64::try_from(column.len() - column.null_count()).unwrap_or(i64::MAX)
}

pub fn sum(column: &Column) -> Result<f64, ComputeError> {
    sum_with_config(column, ExecutionConfig::global())
}

pub fn sum_with_config(column: &Column, config: &ExecutionConfig) -> Result<f64, ComputeError> {
    sum_with_trace(column, config).map(|(total, _)| total)
}

pub fn sum_with_trace(
    column: &Column,
    config: &ExecutionConfig,
) -> Result<(f64, SumTrace), ComputeError> {
    let kind = numeric_kind(column, "sum")?;
    let plan = config.plan_sum(kind, column.len());
    let wide = match plan.strategy {
        SumStrategy::Chunked => sum_chunked(column, kind, plan, config)?,
        strategy => sum_dense(&compact(column)?, kind, strategy)?,
    };
    let total = wide.narrow().ok_or(ComputeError::AccumulatorOverflow {
        dtype: column.dtype(),
    })?;
    let trace = SumTrace {
        plan,
        input_rows: column.len(),
        valid_rows: column.len() - column.null_count(),
    };
    Ok((to_reportable(total)?, trace))
}

/// Sums an already-compacted column without chunking. The total is not
/// narrowed.
fn sum_dense(
    column: &Column,
    kind: NumericKind,
    strategy: SumStrategy,
) -> Result<WideSum, ComputeError> {
    match strategy {
        SumStrategy::Loop => {
            let slice = column.numeric_slice().ok_or(ComputeError::Unsupported {
                operation: "sum",
                dtype: column.dtype(),
            })?;
            dispatch_numeric!(slice, values => widened_sum(values)).ok_or(
                ComputeError::AccumulatorOverflow {
                    dtype: column.dtype(),
                },
            )
        }
        SumStrategy::CastVectorized | SumStrategy::Chunked => {
            let widened = cast(column, kind.accumulator().dtype())?;
            Ok(vectorized_sum(&widened)?)
        }
    }
}

/// Accumulates in the same lane order as the vectorized kernel so both
/// strategies round floats identically.
fn widened_sum<T: NumericType>(values: &[T]) -> Option<WideSum> {
    let mut lanes = [T::Wide::default(); SUM_LANES];
    let mut chunks = values.chunks_exact(SUM_LANES);
    for chunk in &mut chunks {
        for (lane, &value) in lanes.iter_mut().zip(chunk) {
            *lane = lane.checked_add(value.widen())?;
        }
    }
    let mut total = chunks
        .remainder()
        .iter()
        .try_fold(T::Wide::default(), |acc, &value| acc.checked_add(value.widen()))?;
    for lane in lanes {
        total = total.checked_add(lane)?;
    }
    Some(total.finish())
}

fn sum_chunked(
    column: &Column,
    kind: NumericKind,
    plan: SumPlan,
    config: &ExecutionConfig,
) -> Result<WideSum, ComputeError> {
    let len = column.len();
    let chunks = (0..plan.chunks)
        .map(|idx| {
            let offset = idx * plan.chunk_size;
            column.slice(offset, plan.chunk_size.min(len - offset))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let partials: Vec<Result<WideSum, ComputeError>> = cs_runtime::install(|| {
        chunks
            .par_iter()
            .enumerate()
            .map(|(idx, chunk)| {
                let dense = compact(chunk)?;
                let strategy = config.serial_strategy(kind, dense.len());
                trace!("chunk {idx}: {} of {} rows valid, {strategy:?}", dense.len(), chunk.len());
                sum_dense(&dense, kind, strategy)
            })
            .collect()
    });

    let mut total = WideSum::zero(kind.signedness());
    for partial in partials {
        total = total
            .checked_add(partial?)
            .ok_or(ComputeError::AccumulatorOverflow {
                dtype: column.dtype(),
            })?;
    }
    Ok(total)
}

pub fn mean(column: &Column) -> Result<f64, ComputeError> {
    mean_with_config(column, ExecutionConfig::global())
}

/// `sum / count`. An input whose every entry is null averages to `0.0`.
pub fn mean_with_config(column: &Column, config: &ExecutionConfig) -> Result<f64, ComputeError> {
    if column.is_empty() {
        return Err(ComputeError::EmptyInput { operation: "mean" });
    }
    numeric_kind(column, "mean")?;
    let valid = column.len() - column.null_count();
    if valid == 0 {
        return Ok(0.0);
    }
    let total = sum_with_config(column, config)?;
    Ok(total / valid as f64)
}

pub fn min(column: &Column) -> Result<Literal, ComputeError> {
    extreme(column, "min", Ordering::Less)
}

pub fn max(column: &Column) -> Result<Literal, ComputeError> {
    extreme(column, "max", Ordering::Greater)
}

fn extreme(
    column: &Column,
    operation: &'static str,
    keep: Ordering,
) -> Result<Literal, ComputeError> {
    if column.is_empty() {
        return Err(ComputeError::EmptyInput { operation });
    }
    numeric_kind(column, operation)?;
    let dense = compact(column)?;
    let slice = dense.numeric_slice().ok_or(ComputeError::Unsupported {
        operation,
        dtype: dense.dtype(),
    })?;
    dispatch_numeric!(slice, values => scan_extreme(values, keep))
        .ok_or(ComputeError::EmptyInput { operation })
}

fn scan_extreme<T: NumericType>(values: &[T], keep: Ordering) -> Option<Literal> {
    let mut iter = values.iter().copied();
    let mut best = iter.next()?;
    for value in iter {
        if value.partial_cmp(&best) == Some(keep) {
            best = value;
        }
    }
    Some(best.to_literal())
}

// ── Comparison ─────────────────────────────────────────────────────────

/// Boolean mask, one entry per row, true where `row <op> literal` holds.
/// Null rows are false. The literal's dtype must equal the column's.
pub fn compare(column: &Column, op: CompareOp, literal: &Literal) -> Result<Column, ComputeError> {
    if literal.dtype() != column.dtype() {
        return Err(ComputeError::TypeMismatch {
            expected: column.dtype(),
            found: literal.dtype(),
        });
    }
    let raw = call_named_kernel(op.kernel_name(), column, literal)?;
    fold_null_slots(raw)
}

/// [`compare`] with a dynamically typed right-hand side.
pub fn compare_any<T: Any>(
    column: &Column,
    op: CompareOp,
    value: &T,
) -> Result<Column, ComputeError> {
    let literal = Literal::from_any(value)?;
    compare(column, op, &literal)
}

fn fold_null_slots(mask: Column) -> Result<Column, ComputeError> {
    if !mask.has_nulls() {
        return Ok(mask);
    }
    let flags = mask.typed_values::<bool>()?;
    let folded: Vec<bool> = flags
        .iter()
        .enumerate()
        .map(|(idx, &flag)| flag && mask.is_valid(idx))
        .collect();
    Ok(Column::from_values(folded))
}

// ── Filtering ──────────────────────────────────────────────────────────

/// Keeps the rows of `column` selected by `mask`.
pub fn filter_column(column: &Column, mask: Option<&Column>) -> Result<Column, ComputeError> {
    let mask = mask.ok_or(ComputeError::NullMask)?;
    if mask.dtype() != DType::Bool {
        return Err(ComputeError::TypeMismatch {
            expected: DType::Bool,
            found: mask.dtype(),
        });
    }
    if column.is_empty() || mask.is_empty() {
        return Ok(column.slice(0, 0)?);
    }
    if column.len() != mask.len() {
        return Err(ComputeError::LengthMismatch {
            expected: column.len(),
            found: mask.len(),
        });
    }
    Ok(filter(column, mask)?)
}

/// Applies one mask to every column, concurrently when the config allows.
/// All-or-nothing: on failure the error of the lowest-index failing column
/// is returned and every partial result is dropped.
pub fn filter_columns(
    columns: &[Column],
    mask: Option<&Column>,
    config: &ExecutionConfig,
) -> Result<Vec<Column>, ComputeError> {
    let mask = mask.ok_or(ComputeError::NullMask)?;
    let fan_out = config.parallel_filter && columns.len() > 1;
    let results: Vec<Result<Column, ComputeError>> = if fan_out {
        cs_runtime::install(|| {
            columns
                .par_iter()
                .map(|column| filter_column(column, Some(mask)))
                .collect()
        })
    } else {
        columns
            .iter()
            .map(|column| filter_column(column, Some(mask)))
            .collect()
    };

    let mut filtered = Vec::with_capacity(results.len());
    for (idx, result) in results.into_iter().enumerate() {
        match result {
            Ok(column) => filtered.push(column),
            Err(err) => {
                warn!(
                    "filtering column {idx} of {} failed ({err}); discarding partial results",
                    columns.len()
                );
                return Err(err);
            }
        }
    }
    Ok(filtered)
}
