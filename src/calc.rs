//! Summary functions applied by the aggregation engine.
//!
//! Every function returns 0 for empty input. `min` seeds from +inf so
//! negative samples survive, and `median` sorts a copy of its input.

pub type CalcFn = fn(&[f64]) -> f64;

pub fn sum(values: &[f64]) -> f64 {
    values.iter().sum()
}

pub fn min(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().copied().fold(f64::INFINITY, f64::min)
}

pub fn max(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

pub fn avg(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    sum(values) / count(values)
}

pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

pub fn count(values: &[f64]) -> f64 {
    values.len() as f64
}

/// Resolve a summary function by name. Case-insensitive, with the
/// long-form synonyms accepted in configuration files.
pub fn lookup(name: &str) -> Option<CalcFn> {
    match name.to_ascii_lowercase().as_str() {
        "sum" => Some(sum),
        "min" | "minimum" => Some(min),
        "max" | "maximum" => Some(max),
        "avg" | "average" => Some(avg),
        "median" => Some(median),
        "count" => Some(count),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CalcCase {
        values: &'static [f64],
        sum: f64,
        min: f64,
        max: f64,
        avg: f64,
        median: f64,
        count: f64,
    }

    const CASES: &[CalcCase] = &[
        CalcCase {
            values: &[],
            sum: 0.0,
            min: 0.0,
            max: 0.0,
            avg: 0.0,
            median: 0.0,
            count: 0.0,
        },
        CalcCase {
            values: &[3.3],
            sum: 3.3,
            min: 3.3,
            max: 3.3,
            avg: 3.3,
            median: 3.3,
            count: 1.0,
        },
        CalcCase {
            values: &[1.0, 3.0, 2.0],
            sum: 6.0,
            min: 1.0,
            max: 3.0,
            avg: 2.0,
            median: 2.0,
            count: 3.0,
        },
        CalcCase {
            values: &[1.0, 3.0, 2.0, 4.0],
            sum: 10.0,
            min: 1.0,
            max: 4.0,
            avg: 2.5,
            median: 2.5,
            count: 4.0,
        },
        CalcCase {
            values: &[8.0, 7.4, 2.2, 3.9, 0.0, 9.1, 6.2],
            sum: 36.8,
            min: 0.0,
            max: 9.1,
            avg: 5.2571428,
            median: 6.2,
            count: 7.0,
        },
    ];

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn calc_table() {
        for case in CASES {
            let v = case.values;
            assert!(close(sum(v), case.sum), "sum({v:?})");
            assert!(close(min(v), case.min), "min({v:?})");
            assert!(close(max(v), case.max), "max({v:?})");
            assert!(close(avg(v), case.avg), "avg({v:?})");
            assert!(close(median(v), case.median), "median({v:?})");
            assert!(close(count(v), case.count), "count({v:?})");
        }
    }

    #[test]
    fn empty_input_is_zero_not_nan() {
        for f in [sum as CalcFn, min, max, avg, median, count] {
            let r = f(&[]);
            assert_eq!(r, 0.0);
            assert!(!r.is_nan());
        }
    }

    #[test]
    fn min_max_handle_negative_values() {
        let v = [-5.0, -3.0, -9.5];
        assert_eq!(min(&v), -9.5);
        assert_eq!(max(&v), -3.0);
    }

    #[test]
    fn median_is_order_invariant() {
        let base = [8.0, 7.4, 2.2, 3.9, 0.0, 9.1, 6.2];
        let expected = median(&base);
        let mut rotated = base.to_vec();
        for _ in 0..base.len() {
            rotated.rotate_left(1);
            assert_eq!(median(&rotated), expected);
        }
        let mut reversed = base.to_vec();
        reversed.reverse();
        assert_eq!(median(&reversed), expected);
    }

    #[test]
    fn lookup_accepts_synonyms_case_insensitively() {
        for name in ["sum", "MIN", "minimum", "Max", "maximum", "AVG", "average", "median", "count"] {
            assert!(lookup(name).is_some(), "lookup({name})");
        }
        assert!(lookup("p99").is_none());
    }
}
