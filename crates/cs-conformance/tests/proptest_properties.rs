#![forbid(unsafe_code)]

//! Property-based checks of the reduction and filter engine.
//!
//! Generators produce typed columns with arbitrary null patterns; the
//! properties compare engine results against naive evaluations over the
//! explicit list of valid values.

use proptest::prelude::*;

use cs_columnar::Column;
use cs_compute::{ErrorKind, compare, filter_column, max, mean_with_config, min, sum_with_config};
use cs_frame::{DataFrame, Series};
use cs_runtime::ExecutionConfig;
use cs_types::{CompareOp, DType, Literal};

// ---------------------------------------------------------------------------
// Strategy generators
// ---------------------------------------------------------------------------

fn arb_op() -> impl Strategy<Value = CompareOp> {
    prop::sample::select(CompareOp::ALL.to_vec())
}

fn arb_nullable_i32(max_len: usize) -> impl Strategy<Value = Vec<Option<i32>>> {
    proptest::collection::vec(
        prop_oneof![
            4 => (-10_000i32..10_000).prop_map(Some),
            1 => Just(None),
        ],
        0..max_len,
    )
}

fn arb_nullable_u8(max_len: usize) -> impl Strategy<Value = Vec<Option<u8>>> {
    proptest::collection::vec(
        prop_oneof![
            4 => any::<u8>().prop_map(Some),
            1 => Just(None),
        ],
        0..max_len,
    )
}

/// Halves keep float sums exact, so equality is meaningful.
fn arb_nullable_halves(max_len: usize) -> impl Strategy<Value = Vec<Option<f64>>> {
    proptest::collection::vec(
        prop_oneof![
            4 => (-2_000i32..2_000).prop_map(|v| Some(f64::from(v) * 0.5)),
            1 => Just(None),
        ],
        0..max_len,
    )
}

fn arb_nullable_words(max_len: usize) -> impl Strategy<Value = Vec<Option<String>>> {
    proptest::collection::vec(
        prop_oneof![
            4 => "[a-d]{0,3}".prop_map(Some),
            1 => Just(None),
        ],
        0..max_len,
    )
}

/// Literal of any dtype, paired with a column dtype it may or may not match.
fn arb_literal() -> impl Strategy<Value = Literal> {
    prop_oneof![
        any::<i8>().prop_map(Literal::Int8),
        any::<i16>().prop_map(Literal::Int16),
        any::<i32>().prop_map(Literal::Int32),
        any::<i64>().prop_map(Literal::Int64),
        any::<u8>().prop_map(Literal::UInt8),
        any::<u16>().prop_map(Literal::UInt16),
        any::<u32>().prop_map(Literal::UInt32),
        any::<u64>().prop_map(Literal::UInt64),
        (-1e6f32..1e6).prop_map(Literal::Float32),
        (-1e6f64..1e6).prop_map(Literal::Float64),
        "[a-z]{0,4}".prop_map(Literal::Utf8),
        any::<bool>().prop_map(Literal::Bool),
    ]
}

fn column_of_dtype(dtype: DType) -> Column {
    match dtype {
        DType::Int8 => Column::from_values(vec![1_i8, 2]),
        DType::Int16 => Column::from_values(vec![1_i16, 2]),
        DType::Int32 => Column::from_values(vec![1_i32, 2]),
        DType::Int64 => Column::from_values(vec![1_i64, 2]),
        DType::UInt8 => Column::from_values(vec![1_u8, 2]),
        DType::UInt16 => Column::from_values(vec![1_u16, 2]),
        DType::UInt32 => Column::from_values(vec![1_u32, 2]),
        DType::UInt64 => Column::from_values(vec![1_u64, 2]),
        DType::Float32 => Column::from_values(vec![1.0_f32, 2.0]),
        DType::Float64 => Column::from_values(vec![1.0_f64, 2.0]),
        DType::Utf8 => Column::from_values(vec!["a".to_owned(), "b".to_owned()]),
        DType::Bool => Column::from_values(vec![true, false]),
    }
}

const DTYPES: [DType; 12] = [
    DType::Int8,
    DType::Int16,
    DType::Int32,
    DType::Int64,
    DType::UInt8,
    DType::UInt16,
    DType::UInt32,
    DType::UInt64,
    DType::Float32,
    DType::Float64,
    DType::Utf8,
    DType::Bool,
];

fn chunked_config() -> ExecutionConfig {
    ExecutionConfig::default()
        .with_parallel_sum_threshold(16)
        .with_max_parallelism(3)
}

// ---------------------------------------------------------------------------
// Property: null invariance of aggregates
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// sum over a nullable column equals the sum over its valid values.
    #[test]
    fn prop_sum_ignores_nulls_i32(values in arb_nullable_i32(200)) {
        let expected: i64 = values.iter().flatten().map(|&v| i64::from(v)).sum();
        let column = Column::from_options(values.clone());
        let dense = Column::from_values(values.iter().flatten().copied().collect::<Vec<_>>());

        for config in [ExecutionConfig::serial(), chunked_config()] {
            prop_assert_eq!(sum_with_config(&column, &config), Ok(expected as f64));
            prop_assert_eq!(sum_with_config(&dense, &config), Ok(expected as f64));
        }
    }

    /// Narrow unsigned kinds widen instead of wrapping.
    #[test]
    fn prop_sum_widens_u8(values in arb_nullable_u8(300)) {
        let expected: u64 = values.iter().flatten().map(|&v| u64::from(v)).sum();
        let column = Column::from_options(values);
        prop_assert_eq!(sum_with_config(&column, &ExecutionConfig::serial()), Ok(expected as f64));
        prop_assert_eq!(sum_with_config(&column, &chunked_config()), Ok(expected as f64));
    }

    /// mean follows sum / count over valid values, 0.0 when none are valid.
    #[test]
    fn prop_mean_ignores_nulls(values in arb_nullable_halves(120)) {
        let column = Column::from_options(values.clone());
        let valid: Vec<f64> = values.iter().flatten().copied().collect();
        let result = mean_with_config(&column, &ExecutionConfig::serial());
        if values.is_empty() {
            prop_assert_eq!(result.map_err(|err| err.kind()), Err(ErrorKind::EmptyInput));
        } else if valid.is_empty() {
            prop_assert_eq!(result, Ok(0.0));
        } else {
            let expected = valid.iter().sum::<f64>() / valid.len() as f64;
            prop_assert_eq!(result, Ok(expected));
        }
    }

    /// min/max match the extremes of the valid values.
    #[test]
    fn prop_min_max_match_valid_extremes(values in arb_nullable_i32(80)) {
        let valid: Vec<i32> = values.iter().flatten().copied().collect();
        let column = Column::from_options(values);
        match (valid.iter().min(), valid.iter().max()) {
            (Some(&lo), Some(&hi)) => {
                prop_assert_eq!(min(&column), Ok(Literal::Int32(lo)));
                prop_assert_eq!(max(&column), Ok(Literal::Int32(hi)));
            }
            _ => {
                prop_assert_eq!(min(&column).map_err(|err| err.kind()), Err(ErrorKind::EmptyInput));
                prop_assert_eq!(max(&column).map_err(|err| err.kind()), Err(ErrorKind::EmptyInput));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Property: comparison correctness and the strict type-match law
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// Mask has the column's length, no nulls, and is true exactly where the
    /// relation holds for a valid value.
    #[test]
    fn prop_compare_matches_naive_i32(
        values in arb_nullable_i32(60),
        op in arb_op(),
        rhs in -10_000i32..10_000,
    ) {
        let column = Column::from_options(values.clone());
        let mask = compare(&column, op, &Literal::Int32(rhs)).expect("same dtype");
        prop_assert_eq!(mask.len(), values.len());
        prop_assert_eq!(mask.null_count(), 0);
        let expected: Vec<bool> = values
            .iter()
            .map(|value| value.is_some_and(|v| op.evaluate(&v, &rhs)))
            .collect();
        prop_assert_eq!(mask.values::<bool>(), Some(expected.as_slice()));
    }

    #[test]
    fn prop_compare_matches_naive_utf8(
        values in arb_nullable_words(40),
        op in arb_op(),
        rhs in "[a-d]{0,3}",
    ) {
        let column = Column::from_options(values.clone());
        let mask = compare(&column, op, &Literal::Utf8(rhs.clone())).expect("same dtype");
        let expected: Vec<bool> = values
            .iter()
            .map(|value| value.as_ref().is_some_and(|v| op.evaluate(v.as_str(), rhs.as_str())))
            .collect();
        prop_assert_eq!(mask.values::<bool>(), Some(expected.as_slice()));
    }

    /// Any literal whose dtype differs from the column's is rejected.
    #[test]
    fn prop_strict_type_match(literal in arb_literal(), op in arb_op(), dtype_idx in 0usize..12) {
        let dtype = DTYPES[dtype_idx];
        let column = column_of_dtype(dtype);
        let result = compare(&column, op, &literal);
        if literal.dtype() == dtype {
            prop_assert!(result.is_ok());
        } else {
            prop_assert_eq!(result.map_err(|err| err.kind()), Err(ErrorKind::TypeMismatch));
        }
    }
}

// ---------------------------------------------------------------------------
// Property: filter identities
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// An all-true mask keeps the series; an all-false mask empties it but
    /// keeps name and dtype.
    #[test]
    fn prop_filter_all_true_and_all_false(values in arb_nullable_i32(50)) {
        let series = Series::from_options("v", values.clone());
        let len = values.len();

        let all_true = Column::from_values(vec![true; len]);
        let kept = series.filter(Some(&all_true)).expect("all true");
        prop_assert_eq!(&kept, &series);

        let all_false = Column::from_values(vec![false; len]);
        let dropped = series.filter(Some(&all_false)).expect("all false");
        prop_assert_eq!(dropped.len(), 0);
        prop_assert_eq!(dropped.name(), "v");
        prop_assert_eq!(dropped.dtype(), Ok(DType::Int32));
    }

    /// Filtering by a comparison mask keeps exactly the valid matching rows.
    #[test]
    fn prop_where_keeps_matching_rows(
        values in arb_nullable_i32(60),
        op in arb_op(),
        rhs in -10_000i32..10_000,
    ) {
        let column = Column::from_options(values.clone());
        let mask = compare(&column, op, &Literal::Int32(rhs)).expect("compare");
        let kept = filter_column(&column, Some(&mask)).expect("filter");
        let expected: Vec<i32> = values
            .iter()
            .flatten()
            .copied()
            .filter(|v| op.evaluate(v, &rhs))
            .collect();
        prop_assert_eq!(kept.values::<i32>(), Some(expected.as_slice()));
        prop_assert_eq!(kept.null_count(), 0);
    }

    /// Frame filtering keeps rows aligned across columns.
    #[test]
    fn prop_frame_filter_keeps_rows_aligned(
        values in arb_nullable_i32(40),
        rhs in -10_000i32..10_000,
    ) {
        let ids: Vec<i64> = (0..values.len() as i64).collect();
        let frame = DataFrame::new(vec![
            Series::from_values("id", ids),
            Series::from_options("v", values.clone()),
        ])
        .expect("frame");
        let config = ExecutionConfig::default();
        let kept = frame
            .where_cond_with_config("v", CompareOp::Greater, &Literal::Int32(rhs), &config)
            .expect("where");
        let expected_ids: Vec<i64> = values
            .iter()
            .enumerate()
            .filter(|(_, value)| value.is_some_and(|v| v > rhs))
            .map(|(idx, _)| idx as i64)
            .collect();
        let id_column = kept.get("id").expect("id").column().expect("live");
        prop_assert_eq!(id_column.values::<i64>(), Some(expected_ids.as_slice()));
        prop_assert_eq!(kept.num_rows(), expected_ids.len());
        prop_assert_eq!(kept.column_names(), vec!["id", "v"]);
    }
}
