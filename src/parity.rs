use ndarray::{ArrayD, ArrayView2};

/// Outcome of diffing freshly computed logits against one reference tensor.
/// Comparisons are independent of each other; a reference that cannot be
/// loaded is reported as skipped, never as a failure of the run.
#[derive(Debug, Clone)]
pub enum ComparisonOutcome {
    Skipped {
        reason: String,
    },
    ShapeMismatch {
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    Compared {
        max_abs_diff: f32,
        /// (position, vocab index) of the worst element
        worst: (usize, usize),
        over_tolerance: usize,
        passed: bool,
    },
}

impl ComparisonOutcome {
    pub fn failed(&self) -> bool {
        match self {
            ComparisonOutcome::Skipped { .. } => false,
            ComparisonOutcome::ShapeMismatch { .. } => true,
            ComparisonOutcome::Compared { passed, .. } => !passed,
        }
    }
}

/// Compares computed logits `(seq_len, vocab_size)` against a reference of
/// shape `[vocab_size]` or `[ref_len, vocab_size]`. A shorter reference is
/// aligned against the trailing positions, so a `[vocab_size]` reference
/// checks the final next-token distribution.
pub fn compare_logits(
    computed: ArrayView2<'_, f32>,
    reference: &ArrayD<f32>,
    tolerance: f32,
) -> ComparisonOutcome {
    let (seq_len, vocab_size) = (computed.nrows(), computed.ncols());

    let reference = match reference.ndim() {
        1 => reference
            .view()
            .into_shape((1, reference.len()))
            .expect("1-d tensor reshapes to one row"),
        2 => {
            let view = reference.view();
            view.into_dimensionality::<ndarray::Ix2>()
                .expect("2-d tensor views as a matrix")
        }
        _ => {
            return ComparisonOutcome::ShapeMismatch {
                expected: vec![seq_len, vocab_size],
                found: reference.shape().to_vec(),
            }
        }
    };

    if reference.ncols() != vocab_size || reference.nrows() > seq_len {
        return ComparisonOutcome::ShapeMismatch {
            expected: vec![seq_len, vocab_size],
            found: vec![reference.nrows(), reference.ncols()],
        };
    }

    let offset = seq_len - reference.nrows();
    let mut max_abs_diff = 0.0f32;
    let mut worst = (offset, 0);
    let mut over_tolerance = 0usize;
    for (row_idx, row) in reference.rows().into_iter().enumerate() {
        let position = offset + row_idx;
        for (col_idx, (a, b)) in computed.row(position).iter().zip(row.iter()).enumerate() {
            let diff = (a - b).abs();
            if diff > tolerance || !diff.is_finite() {
                over_tolerance += 1;
            }
            if diff > max_abs_diff || !diff.is_finite() {
                max_abs_diff = diff;
                worst = (position, col_idx);
            }
        }
    }

    ComparisonOutcome::Compared {
        max_abs_diff,
        worst,
        over_tolerance,
        passed: over_tolerance == 0,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::{Array2, ArrayD, IxDyn};

    fn computed() -> Array2<f32> {
        Array2::from_shape_vec((3, 4), (0..12).map(|i| i as f32).collect()).unwrap()
    }

    #[test]
    fn identical_logits_pass() {
        let computed = computed();
        let reference = computed.clone().into_dyn();
        let outcome = compare_logits(computed.view(), &reference, 1e-5);
        assert!(matches!(
            outcome,
            ComparisonOutcome::Compared { passed: true, over_tolerance: 0, .. }
        ));
    }

    #[test]
    fn single_row_reference_checks_last_position() {
        let computed = computed();
        // matches row 2 exactly
        let reference = ArrayD::from_shape_vec(IxDyn(&[4]), vec![8.0, 9.0, 10.0, 11.0]).unwrap();
        let outcome = compare_logits(computed.view(), &reference, 1e-5);
        assert!(matches!(
            outcome,
            ComparisonOutcome::Compared { passed: true, .. }
        ));
    }

    #[test]
    fn deviation_is_located_and_fails() {
        let computed = computed();
        let mut reference = computed.clone();
        reference[(1, 3)] += 0.5;
        let outcome = compare_logits(computed.view(), &reference.into_dyn(), 1e-3);
        match outcome {
            ComparisonOutcome::Compared {
                max_abs_diff,
                worst,
                over_tolerance,
                passed,
            } => {
                assert!((max_abs_diff - 0.5).abs() < 1e-6);
                assert_eq!(worst, (1, 3));
                assert_eq!(over_tolerance, 1);
                assert!(!passed);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn vocab_mismatch_is_reported() {
        let computed = computed();
        let reference = ArrayD::from_shape_vec(IxDyn(&[5]), vec![0.0; 5]).unwrap();
        assert!(matches!(
            compare_logits(computed.view(), &reference, 1e-3),
            ComparisonOutcome::ShapeMismatch { .. }
        ));
    }
}
