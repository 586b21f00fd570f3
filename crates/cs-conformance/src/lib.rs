#![forbid(unsafe_code)]

//! Fixture-driven conformance harness for series reductions and filters.
//!
//! Cases are JSON documents naming an operation, an input column and the
//! expected outcome (a single value, a mask, the surviving rows or an
//! error kind). [`run_suite`] evaluates them through the public `Series`
//! API and produces a serializable report.

use cs_columnar::{Column, NativeType};
use cs_compute::ErrorKind;
use cs_frame::{FrameError, Series};
use cs_runtime::ExecutionConfig;
use cs_types::{CompareOp, DType, Literal};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Cases shipped with the crate.
pub const CORE_FIXTURES: &str = include_str!("../fixtures/core_cases.json");

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("fixture parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("case {case_id}: {operation:?} needs both an operator and a literal")]
    MissingPredicate {
        case_id: String,
        operation: FixtureOperation,
    },
    #[error("fixture value at position {position} has dtype {found}, column is {expected}")]
    FixtureValue {
        position: usize,
        expected: DType,
        found: DType,
    },
    #[error(transparent)]
    Frame(#[from] FrameError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixtureOperation {
    Count,
    Sum,
    Mean,
    Min,
    Max,
    Compare,
    Where,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnFixture {
    pub dtype: DType,
    pub values: Vec<Option<Literal>>,
}

impl ColumnFixture {
    pub fn build(&self) -> Result<Column, HarnessError> {
        match self.dtype {
            DType::Int8 => self.typed::<i8>(),
            DType::Int16 => self.typed::<i16>(),
            DType::Int32 => self.typed::<i32>(),
            DType::Int64 => self.typed::<i64>(),
            DType::UInt8 => self.typed::<u8>(),
            DType::UInt16 => self.typed::<u16>(),
            DType::UInt32 => self.typed::<u32>(),
            DType::UInt64 => self.typed::<u64>(),
            DType::Float32 => self.typed::<f32>(),
            DType::Float64 => self.typed::<f64>(),
            DType::Utf8 => self.typed::<String>(),
            DType::Bool => self.typed::<bool>(),
        }
    }

    fn typed<T: NativeType>(&self) -> Result<Column, HarnessError> {
        let values = self
            .values
            .iter()
            .enumerate()
            .map(|(position, value)| match value {
                None => Ok(None),
                Some(literal) => T::from_literal(literal).map(Some).ok_or(
                    HarnessError::FixtureValue {
                        position,
                        expected: T::DTYPE,
                        found: literal.dtype(),
                    },
                ),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Column::from_options(values))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Value(Literal),
    Mask(Vec<bool>),
    Rows(Vec<Option<Literal>>),
    Error(ErrorKind),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureCase {
    pub case_id: String,
    pub operation: FixtureOperation,
    pub column: ColumnFixture,
    #[serde(default)]
    pub op: Option<CompareOp>,
    #[serde(default)]
    pub literal: Option<Literal>,
    pub expected: Outcome,
}

impl FixtureCase {
    fn predicate(&self) -> Result<(CompareOp, &Literal), HarnessError> {
        match (self.op, &self.literal) {
            (Some(op), Some(literal)) => Ok((op, literal)),
            _ => Err(HarnessError::MissingPredicate {
                case_id: self.case_id.clone(),
                operation: self.operation,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseResult {
    pub case_id: String,
    pub operation: FixtureOperation,
    pub passed: bool,
    pub expected: Outcome,
    pub actual: Option<Outcome>,
    pub harness_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteReport {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub results: Vec<CaseResult>,
}

impl SuiteReport {
    #[must_use]
    pub fn is_green(&self) -> bool {
        self.failed == 0
    }

    #[must_use]
    pub fn failures(&self) -> Vec<&CaseResult> {
        self.results.iter().filter(|result| !result.passed).collect()
    }
}

pub fn load_cases(json: &str) -> Result<Vec<FixtureCase>, HarnessError> {
    Ok(serde_json::from_str(json)?)
}

pub fn core_cases() -> Result<Vec<FixtureCase>, HarnessError> {
    load_cases(CORE_FIXTURES)
}

fn single_value(series: &Series) -> Outcome {
    match series.value(0) {
        Some(value) => Outcome::Value(value),
        None => Outcome::Rows(vec![None]),
    }
}

/// Evaluates one case. Expected library errors become
/// [`Outcome::Error`]; only harness problems are returned as `Err`.
pub fn observe(case: &FixtureCase, config: &ExecutionConfig) -> Result<Outcome, HarnessError> {
    let series = Series::new(case.case_id.clone(), case.column.build()?);
    let result = match case.operation {
        FixtureOperation::Count => series.count().map(|out| single_value(&out)),
        FixtureOperation::Sum => series.sum_with_config(config).map(|out| single_value(&out)),
        FixtureOperation::Mean => series.mean_with_config(config).map(|out| single_value(&out)),
        FixtureOperation::Min => series.min().map(|out| single_value(&out)),
        FixtureOperation::Max => series.max().map(|out| single_value(&out)),
        FixtureOperation::Compare => {
            let (op, literal) = case.predicate()?;
            series.compare(op, literal).map(|mask| {
                Outcome::Mask(mask.values::<bool>().map(<[bool]>::to_vec).unwrap_or_default())
            })
        }
        FixtureOperation::Where => {
            let (op, literal) = case.predicate()?;
            series
                .where_cond(op, literal)
                .and_then(|kept| Ok(Outcome::Rows(kept.column()?.to_literals())))
        }
    };
    match result {
        Ok(outcome) => Ok(outcome),
        Err(err) => match err.kind() {
            Some(kind) => Ok(Outcome::Error(kind)),
            None => Err(err.into()),
        },
    }
}

#[must_use]
pub fn run_case(case: &FixtureCase, config: &ExecutionConfig) -> CaseResult {
    let (actual, harness_error) = match observe(case, config) {
        Ok(outcome) => (Some(outcome), None),
        Err(err) => (None, Some(err.to_string())),
    };
    CaseResult {
        case_id: case.case_id.clone(),
        operation: case.operation,
        passed: actual.as_ref() == Some(&case.expected),
        expected: case.expected.clone(),
        actual,
        harness_error,
    }
}

#[must_use]
pub fn run_suite(cases: &[FixtureCase], config: &ExecutionConfig) -> SuiteReport {
    let results: Vec<CaseResult> = cases.iter().map(|case| run_case(case, config)).collect();
    let passed = results.iter().filter(|result| result.passed).count();
    SuiteReport {
        total: results.len(),
        passed,
        failed: results.len() - passed,
        results,
    }
}

// ── Generators shared by the cross-crate suites ────────────────────────

/// `pattern` repeated cyclically up to `len` values.
#[must_use]
pub fn repeating<T: Clone>(pattern: &[T], len: usize) -> Vec<T> {
    pattern.iter().cycle().take(len).cloned().collect()
}

/// Exact sum of `repeating(pattern, len)`, computed in closed form.
#[must_use]
pub fn repeating_sum(pattern: &[i64], len: usize) -> i128 {
    if pattern.is_empty() {
        return 0;
    }
    let full = (len / pattern.len()) as i128;
    let whole: i128 = pattern.iter().map(|&v| i128::from(v)).sum();
    let tail: i128 = pattern[..len % pattern.len()]
        .iter()
        .map(|&v| i128::from(v))
        .sum();
    full * whole + tail
}

/// Marks every `stride`-th value (starting at 0) as null.
#[must_use]
pub fn null_every<T>(values: Vec<T>, stride: usize) -> Vec<Option<T>> {
    values
        .into_iter()
        .enumerate()
        .map(|(idx, value)| (stride == 0 || idx % stride != 0).then_some(value))
        .collect()
}

#[cfg(test)]
mod tests {
    use cs_compute::ErrorKind;
    use cs_runtime::ExecutionConfig;
    use cs_types::{DType, Literal};

    use super::{
        ColumnFixture, FixtureOperation, HarnessError, Outcome, SuiteReport, core_cases,
        load_cases, null_every, observe, repeating, repeating_sum, run_suite,
    };

    #[test]
    fn core_fixtures_pass_serially_and_in_parallel() {
        let cases = core_cases().expect("fixtures parse");
        assert!(cases.len() >= 15);
        for config in [ExecutionConfig::serial(), ExecutionConfig::default()] {
            let report = run_suite(&cases, &config);
            assert!(report.is_green(), "failures: {:#?}", report.failures());
            assert_eq!(report.passed, cases.len());
        }
    }

    #[test]
    fn report_round_trips_through_json() {
        let cases = core_cases().expect("fixtures parse");
        let report = run_suite(&cases[..3], &ExecutionConfig::serial());
        let json = serde_json::to_string(&report).expect("serialize");
        let back: SuiteReport = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, report);
    }

    #[test]
    fn mismatched_expectation_is_a_failure_not_an_error() {
        let json = r#"[{
            "case_id": "wrong",
            "operation": "sum",
            "column": {"dtype": "int32", "values": [{"kind": "int32", "value": 2}]},
            "expected": {"error": "overflow"}
        }]"#;
        let cases = load_cases(json).expect("parse");
        let report = run_suite(&cases, &ExecutionConfig::serial());
        assert_eq!(report.failed, 1);
        let failure = &report.failures()[0];
        assert_eq!(
            failure.actual,
            Some(Outcome::Value(Literal::Float64(2.0)))
        );
        assert!(failure.harness_error.is_none());
    }

    #[test]
    fn predicate_operations_require_op_and_literal() {
        let json = r#"[{
            "case_id": "bare",
            "operation": "compare",
            "column": {"dtype": "bool", "values": []},
            "expected": {"mask": []}
        }]"#;
        let cases = load_cases(json).expect("parse");
        let err = observe(&cases[0], &ExecutionConfig::serial()).expect_err("no predicate");
        assert!(matches!(
            err,
            HarnessError::MissingPredicate {
                operation: FixtureOperation::Compare,
                ..
            }
        ));
    }

    #[test]
    fn fixture_values_must_match_column_dtype() {
        let fixture = ColumnFixture {
            dtype: DType::Int16,
            values: vec![Some(Literal::Int16(1)), Some(Literal::Int32(2))],
        };
        assert!(matches!(
            fixture.build(),
            Err(HarnessError::FixtureValue {
                position: 1,
                expected: DType::Int16,
                found: DType::Int32
            })
        ));
    }

    #[test]
    fn error_kinds_deserialize_in_snake_case() {
        let outcome: Outcome =
            serde_json::from_str(r#"{"error": "invalid_numeric"}"#).expect("parse");
        assert_eq!(outcome, Outcome::Error(ErrorKind::InvalidNumeric));
    }

    #[test]
    fn generators() {
        assert_eq!(repeating(&[1, 2, 3], 7), vec![1, 2, 3, 1, 2, 3, 1]);
        assert_eq!(repeating_sum(&[1, 2, 3], 7), 13);
        assert_eq!(repeating_sum(&[], 7), 0);
        assert_eq!(null_every(vec![1, 2, 3, 4], 2), vec![None, Some(2), None, Some(4)]);
        assert_eq!(null_every(vec![1, 2], 0), vec![Some(1), Some(2)]);
    }
}
