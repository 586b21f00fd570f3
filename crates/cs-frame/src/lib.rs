#![forbid(unsafe_code)]

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use cs_columnar::{Column, ColumnError, NativeType, cast};
use cs_compute::{ComputeError, ErrorKind};
use cs_runtime::ExecutionConfig;
use cs_types::{CompareOp, DType, Literal};
use log::debug;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    #[error("series {name:?} has been released")]
    Released { name: String },
    #[error("duplicate column name {name:?}")]
    DuplicateColumn { name: String },
    #[error("column {name:?} not found")]
    ColumnNotFound { name: String },
    #[error("selection must name at least one column")]
    EmptySelection,
    #[error("column {name:?} has length {found}, expected {expected}")]
    LengthMismatch {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error(transparent)]
    Compute(#[from] ComputeError),
}

impl From<ColumnError> for FrameError {
    fn from(err: ColumnError) -> Self {
        Self::Compute(err.into())
    }
}

impl FrameError {
    /// Compute-level classification; `None` for container-only errors.
    #[must_use]
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Compute(err) => Some(err.kind()),
            Self::LengthMismatch { .. } => Some(ErrorKind::LengthMismatch),
            Self::Released { .. }
            | Self::DuplicateColumn { .. }
            | Self::ColumnNotFound { .. }
            | Self::EmptySelection => None,
        }
    }
}

// ── Series ─────────────────────────────────────────────────────────────

/// A named column. Holds one reference to the column's buffer until
/// [`Series::release`] or drop.
#[derive(Debug, Clone)]
pub struct Series {
    name: String,
    column: Option<Column>,
}

impl Series {
    /// Wraps `column`, taking over the reference it carries.
    pub fn new(name: impl Into<String>, column: Column) -> Self {
        Self {
            name: name.into(),
            column: Some(column),
        }
    }

    pub fn from_values<T: NativeType>(name: impl Into<String>, values: Vec<T>) -> Self {
        Self::new(name, Column::from_values(values))
    }

    pub fn from_options<T: NativeType>(name: impl Into<String>, values: Vec<Option<T>>) -> Self {
        Self::new(name, Column::from_options(values))
    }

    pub fn from_literal(name: impl Into<String>, literal: &Literal) -> Self {
        Self::new(name, Column::from_literal(literal))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn column(&self) -> Result<&Column, FrameError> {
        self.column.as_ref().ok_or_else(|| FrameError::Released {
            name: self.name.clone(),
        })
    }

    /// Zero once released.
    #[must_use]
    pub fn len(&self) -> usize {
        self.column.as_ref().map_or(0, Column::len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> Result<DType, FrameError> {
        Ok(self.column()?.dtype())
    }

    #[must_use]
    pub fn null_count(&self) -> usize {
        self.column.as_ref().map_or(0, Column::null_count)
    }

    #[must_use]
    pub fn is_null(&self, idx: usize) -> bool {
        self.column.as_ref().is_some_and(|column| column.is_null(idx))
    }

    #[must_use]
    pub fn is_valid(&self, idx: usize) -> bool {
        self.column.as_ref().is_some_and(|column| column.is_valid(idx))
    }

    #[must_use]
    pub fn value(&self, idx: usize) -> Option<Literal> {
        self.column.as_ref().and_then(|column| column.value(idx))
    }

    /// Drops this series' reference to its column. Calling it again does
    /// nothing.
    pub fn release(&mut self) {
        if self.column.take().is_some() {
            debug!("released series {:?}", self.name);
        }
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.column.is_none()
    }

    fn derive(&self, column: Column) -> Self {
        Self::new(self.name.clone(), column)
    }

    /// One-element Int64 series holding the non-null count.
    pub fn count(&self) -> Result<Self, FrameError> {
        let total = cs_compute::count(self.column()?);
        Ok(self.derive(Column::from_values(vec![total])))
    }

    pub fn sum(&self) -> Result<Self, FrameError> {
        self.sum_with_config(ExecutionConfig::global())
    }

    /// One-element Float64 series holding the sum of the valid values.
    pub fn sum_with_config(&self, config: &ExecutionConfig) -> Result<Self, FrameError> {
        let total = cs_compute::sum_with_config(self.column()?, config)?;
        Ok(self.derive(Column::from_values(vec![total])))
    }

    pub fn mean(&self) -> Result<Self, FrameError> {
        self.mean_with_config(ExecutionConfig::global())
    }

    pub fn mean_with_config(&self, config: &ExecutionConfig) -> Result<Self, FrameError> {
        let average = cs_compute::mean_with_config(self.column()?, config)?;
        Ok(self.derive(Column::from_values(vec![average])))
    }

    /// One-element series of the input's dtype.
    pub fn min(&self) -> Result<Self, FrameError> {
        let smallest = cs_compute::min(self.column()?)?;
        Ok(self.derive(Column::from_literal(&smallest)))
    }

    pub fn max(&self) -> Result<Self, FrameError> {
        let largest = cs_compute::max(self.column()?)?;
        Ok(self.derive(Column::from_literal(&largest)))
    }

    /// Selection mask for `row <op> literal`.
    pub fn compare(&self, op: CompareOp, literal: &Literal) -> Result<Column, FrameError> {
        Ok(cs_compute::compare(self.column()?, op, literal)?)
    }

    pub fn compare_any<T: Any>(&self, op: CompareOp, value: &T) -> Result<Column, FrameError> {
        Ok(cs_compute::compare_any(self.column()?, op, value)?)
    }

    pub fn filter(&self, mask: Option<&Column>) -> Result<Self, FrameError> {
        let filtered = cs_compute::filter_column(self.column()?, mask)?;
        Ok(self.derive(filtered))
    }

    /// Rows where `row <op> literal` holds.
    pub fn where_cond(&self, op: CompareOp, literal: &Literal) -> Result<Self, FrameError> {
        let mask = self.compare(op, literal)?;
        self.filter(Some(&mask))
    }

    pub fn cast(&self, dtype: DType) -> Result<Self, FrameError> {
        let converted = cast(self.column()?, dtype)?;
        Ok(self.derive(converted))
    }
}

impl PartialEq for Series {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.column == other.column
    }
}

impl fmt::Display for Series {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.column {
            Some(column) => write!(f, "Series: {} Type: {}\n{column}", self.name, column.dtype()),
            None => write!(f, "Series: {} (released)", self.name),
        }
    }
}

// ── DataFrame ──────────────────────────────────────────────────────────

/// Ordered, equal-length series with lookup by name.
#[derive(Debug, Clone, Default)]
pub struct DataFrame {
    series: Vec<Series>,
    positions: HashMap<String, usize>,
    num_rows: usize,
}

impl DataFrame {
    /// Names must be unique and lengths equal; column order is kept.
    pub fn new(series: Vec<Series>) -> Result<Self, FrameError> {
        let num_rows = series.first().map_or(0, Series::len);
        let mut positions = HashMap::with_capacity(series.len());
        for (idx, item) in series.iter().enumerate() {
            item.column()?;
            if item.len() != num_rows {
                return Err(FrameError::LengthMismatch {
                    name: item.name.clone(),
                    expected: num_rows,
                    found: item.len(),
                });
            }
            if positions.insert(item.name.clone(), idx).is_some() {
                return Err(FrameError::DuplicateColumn {
                    name: item.name.clone(),
                });
            }
        }
        Ok(Self {
            series,
            positions,
            num_rows,
        })
    }

    pub fn from_columns<N: Into<String>>(columns: Vec<(N, Column)>) -> Result<Self, FrameError> {
        Self::new(
            columns
                .into_iter()
                .map(|(name, column)| Series::new(name, column))
                .collect(),
        )
    }

    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    #[must_use]
    pub fn num_columns(&self) -> usize {
        self.series.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        self.series.iter().map(Series::name).collect()
    }

    #[must_use]
    pub fn series(&self) -> &[Series] {
        &self.series
    }

    pub fn get(&self, name: &str) -> Result<&Series, FrameError> {
        self.positions
            .get(name)
            .map(|&idx| &self.series[idx])
            .ok_or_else(|| FrameError::ColumnNotFound {
                name: name.to_owned(),
            })
    }

    /// Projection in the requested order; shares the column buffers.
    pub fn select(&self, names: &[&str]) -> Result<Self, FrameError> {
        if names.is_empty() {
            return Err(FrameError::EmptySelection);
        }
        let picked = names
            .iter()
            .map(|name| self.get(name).cloned())
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(picked)
    }

    pub fn filter(&self, mask: Option<&Column>) -> Result<Self, FrameError> {
        self.filter_with_config(mask, ExecutionConfig::global())
    }

    /// Applies `mask` to every column at once. Either every column is
    /// filtered or an error is returned.
    ///
    /// The mask must be a boolean column with exactly one slot per frame row.
    pub fn filter_with_config(
        &self,
        mask: Option<&Column>,
        config: &ExecutionConfig,
    ) -> Result<Self, FrameError> {
        let columns = self
            .series
            .iter()
            .map(|item| item.column().cloned())
            .collect::<Result<Vec<_>, _>>()?;
        let mask = mask.ok_or(ComputeError::NullMask)?;
        if mask.dtype() != DType::Bool {
            return Err(ComputeError::TypeMismatch {
                expected: DType::Bool,
                found: mask.dtype(),
            }
            .into());
        }
        if mask.len() != self.num_rows {
            return Err(ComputeError::LengthMismatch {
                expected: self.num_rows,
                found: mask.len(),
            }
            .into());
        }
        let filtered = cs_compute::filter_columns(&columns, Some(mask), config)?;
        let num_rows = filtered.first().map_or(0, Column::len);
        let series = self
            .series
            .iter()
            .zip(filtered)
            .map(|(item, column)| item.derive(column))
            .collect();
        Ok(Self {
            series,
            positions: self.positions.clone(),
            num_rows,
        })
    }

    pub fn where_cond(
        &self,
        column: &str,
        op: CompareOp,
        literal: &Literal,
    ) -> Result<Self, FrameError> {
        self.where_cond_with_config(column, op, literal, ExecutionConfig::global())
    }

    /// Compares one column against `literal` and keeps the matching rows
    /// of the whole frame.
    pub fn where_cond_with_config(
        &self,
        column: &str,
        op: CompareOp,
        literal: &Literal,
        config: &ExecutionConfig,
    ) -> Result<Self, FrameError> {
        let mask = self.get(column)?.compare(op, literal)?;
        debug!("where {column} {op} {literal}: {} rows", self.num_rows);
        self.filter_with_config(Some(&mask), config)
    }

    /// Releases every series. Safe to call more than once.
    pub fn release(&mut self) {
        for item in &mut self.series {
            item.release();
        }
        self.num_rows = 0;
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.series.iter().all(Series::is_released)
    }
}

impl fmt::Display for DataFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "DataFrame: {} rows x {} columns",
            self.num_rows,
            self.series.len()
        )?;
        for item in &self.series {
            writeln!(f, "{item}")?;
        }
        Ok(())
    }
}
