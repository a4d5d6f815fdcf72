use crate::model::{Statistics, Summary};

/// Median by the textbook rule: sort ascending, take the central element, or
/// the mean of the two central elements for even lengths. The median of an
/// empty set is defined as 0 (convention, not an error).
pub fn median(values: &[u64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let len = sorted.len();
    if len % 2 == 0 {
        (sorted[len / 2 - 1] + sorted[len / 2]) as f64 / 2.0
    } else {
        sorted[len / 2] as f64
    }
}

fn summarize(values: &[u64]) -> Summary {
    let Some(&first) = values.first() else {
        // Empty set keeps the zero convention; `count` tells it apart from
        // a real all-zero measurement.
        return Summary {
            count: 0,
            average: 0.0,
            min: 0,
            max: 0,
            median: 0.0,
        };
    };
    let mut min = first;
    let mut max = first;
    let mut sum = 0u64;
    for &v in values {
        min = min.min(v);
        max = max.max(v);
        sum += v;
    }
    Summary {
        count: values.len(),
        average: sum as f64 / values.len() as f64,
        min,
        max,
        median: median(values),
    }
}

/// Recomputes statistics from the full history. Returns `None` until at
/// least two samples exist; "not enough data" is a distinct condition, not
/// zeros. When `filter_threshold > 0` the subset of latencies at or above
/// the threshold is summarized separately alongside the full set.
pub fn aggregate(latencies: &[u64], filter_threshold: u64, lost: u64) -> Option<Statistics> {
    if latencies.len() < 2 {
        return None;
    }
    let filtered = (filter_threshold > 0).then(|| {
        let subset: Vec<u64> = latencies
            .iter()
            .copied()
            .filter(|&v| v >= filter_threshold)
            .collect();
        summarize(&subset)
    });
    Some(Statistics {
        summary: summarize(latencies),
        filtered,
        lost,
    })
}

/// Parses a user-supplied filter threshold. Anything unparsable means "no
/// filter" (0), a documented fallback rather than an error.
pub fn parse_filter_threshold(raw: &str) -> u64 {
    raw.trim().parse().unwrap_or(0)
}
