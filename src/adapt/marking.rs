use super::{
    config::Strategy,
    estimator::{ElemKey, ErrorReport},
};

/// Errors closer than this (relatively) are considered equal by [Strategy::Cumulative]
pub const TIE_TOLERANCE: f64 = 1e-3;

/// Select the Elems to refine (of every component), in decreasing order of their errors
///
/// Indicators are the squared Elem errors relative to the total reference norm (see
/// [ErrorReport::relative_indicators]).
pub fn mark_elements(report: &ErrorReport, strategy: Strategy, threshold: f64) -> Vec<ElemKey> {
    let indicators = report.relative_indicators();
    let max_err = indicators.first().map_or(0.0, |(_, err)| *err);

    match strategy {
        Strategy::Cumulative => {
            let total: f64 = indicators.iter().map(|(_, err)| err).sum();
            let target = threshold.sqrt() * total;

            let mut marked = Vec::new();
            let mut processed = 0.0;
            let mut previous: Option<f64> = None;
            for (key, err) in indicators {
                if let Some(prev) = previous {
                    let tied = prev > 0.0 && ((err - prev) / prev).abs() <= TIE_TOLERANCE;
                    if processed > target && !tied {
                        break;
                    }
                }
                marked.push(key);
                processed += err;
                previous = Some(err);
            }
            marked
        }
        Strategy::RelativeToMax => indicators
            .into_iter()
            .take_while(|(_, err)| *err > 0.0 && *err >= threshold * max_err)
            .map(|(key, _)| key)
            .collect(),
        Strategy::Absolute => indicators
            .into_iter()
            .take_while(|(_, err)| *err >= threshold)
            .map(|(key, _)| key)
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::mark_elements;
    use crate::adapt::{
        config::Strategy,
        estimator::{ElemError, ElemKey, ErrorReport},
    };
    use proptest::prelude::*;

    fn system_report(errors: &[(usize, f64)]) -> ErrorReport {
        let mut elem_errors: Vec<ElemError> = errors
            .iter()
            .enumerate()
            .map(|(elem_id, (component, err_sq))| ElemError {
                component: *component,
                elem_id,
                err_sq: *err_sq,
                norm_sq: 1.0,
            })
            .collect();
        elem_errors.sort_by(|a, b| b.err_sq.partial_cmp(&a.err_sq).unwrap().then(a.key().cmp(&b.key())));

        ErrorReport {
            total_err_sq: errors.iter().map(|(_, err_sq)| err_sq).sum(),
            total_norm_sq: errors.len() as f64,
            elem_errors,
        }
    }

    fn report(errors: &[f64]) -> ErrorReport {
        let errors: Vec<(usize, f64)> = errors.iter().map(|err_sq| (0, *err_sq)).collect();
        system_report(&errors)
    }

    fn ids(marked: Vec<ElemKey>) -> Vec<usize> {
        marked.into_iter().map(|key| key.elem_id).collect()
    }

    #[test]
    fn single_elem_is_always_marked() {
        let marked = mark_elements(&report(&[0.5]), Strategy::Cumulative, 0.3);
        assert_eq!(ids(marked), vec![0]);
    }

    #[test]
    fn cumulative_stops_after_threshold() {
        // relative indicators 0.32, 0.16, 0.08, 0.04, 0.01; the target is sqrt(0.3) * 0.61 ≈ 0.334
        let marked = mark_elements(&report(&[0.05, 1.6, 0.8, 0.4, 0.2]), Strategy::Cumulative, 0.3);
        assert_eq!(ids(marked), vec![1, 2]);
    }

    #[test]
    fn cumulative_continues_at_the_target() {
        // relative indicators 0.75, 0.375, 0.25, 0.125; the target sqrt(0.25) * 1.5 = 0.75 is only reached,
        // not exceeded, by the first Elem
        let marked = mark_elements(&report(&[3.0, 1.0, 1.5, 0.5]), Strategy::Cumulative, 0.25);
        assert_eq!(ids(marked), vec![0, 2]);
    }

    #[test]
    fn cumulative_keeps_ties_together() {
        let marked = mark_elements(&report(&[1.0, 1.0, 1.0, 0.1]), Strategy::Cumulative, 0.3);
        assert_eq!(ids(marked), vec![0, 1, 2]);
    }

    #[test]
    fn relative_to_max() {
        let marked = mark_elements(&report(&[0.3, 1.0, 0.5, 0.49]), Strategy::RelativeToMax, 0.5);
        assert_eq!(ids(marked), vec![1, 2]);
    }

    #[test]
    fn components_are_marked_together() {
        let report = system_report(&[(0, 0.2), (1, 1.0), (0, 0.9), (1, 0.1)]);
        let marked = mark_elements(&report, Strategy::RelativeToMax, 0.5);
        assert_eq!(marked, vec![ElemKey::new(1, 1), ElemKey::new(0, 2)]);
    }

    #[test]
    fn nothing_to_mark() {
        let marked = mark_elements(&report(&[0.01, 0.02]), Strategy::Absolute, 0.3);
        assert!(marked.is_empty());
        let marked = mark_elements(&report(&[0.0, 0.0]), Strategy::RelativeToMax, 0.3);
        assert!(marked.is_empty());
    }

    proptest! {
        #[test]
        fn absolute_strategy_respects_threshold(
            errors in prop::collection::vec(0.0..1.0_f64, 1..40),
            threshold in 0.001..1.0_f64,
        ) {
            let report = report(&errors);
            let indicators: std::collections::BTreeMap<ElemKey, f64> =
                report.relative_indicators().into_iter().collect();
            let marked = mark_elements(&report, Strategy::Absolute, threshold);

            for key in marked.iter() {
                prop_assert!(indicators[key] >= threshold);
            }
            let num_above = indicators.values().filter(|err| **err >= threshold).count();
            prop_assert_eq!(marked.len(), num_above);
        }

        #[test]
        fn cumulative_marks_largest_errors(errors in prop::collection::vec(0.0..1.0_f64, 1..40)) {
            let report = report(&errors);
            let marked = mark_elements(&report, Strategy::Cumulative, 0.3);

            prop_assert!(!marked.is_empty());
            let expected: Vec<ElemKey> = report.elem_errors.iter().take(marked.len()).map(|e| e.key()).collect();
            prop_assert_eq!(marked, expected);
        }
    }
}
