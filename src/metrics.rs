//! Unbiased pass@k estimation and aggregation across tasks.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_KS: [usize; 3] = [1, 2, 5];

/// Per-task sample counts fed to the reducer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleCounts {
    pub n_samples: usize,
    pub n_correct: usize,
}

/// pass@k = 1 - C(n-c, k) / C(n, k)
///
/// Probability that at least one of `k` samples drawn without replacement from
/// the `n` observed ones is correct. Uses the product form
/// `1 - prod_{i=n-c+1}^{n} (1 - k/i)` to stay stable for large `n`.
///
/// Returns `None` when `c > n` or `k > n`.
pub fn pass_at_k(n: usize, c: usize, k: usize) -> Option<f64> {
    if c > n || k > n {
        return None;
    }
    if k == 0 {
        return Some(0.0);
    }
    if n - c < k {
        return Some(1.0);
    }

    let miss: f64 = ((n - c + 1)..=n)
        .map(|i| 1.0 - k as f64 / i as f64)
        .product();
    Some((1.0 - miss).clamp(0.0, 1.0))
}

/// Mean and population standard deviation.
pub fn mean_and_std(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let len = values.len() as f64;
    let mean = values.iter().sum::<f64>() / len;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / len;
    Some((mean, variance.sqrt()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KSummary {
    pub k: usize,
    pub mean: f64,
    pub std: f64,
    pub num_tasks: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub per_k: Vec<KSummary>,
    pub score: f64,
    pub score_std: f64,
}

impl Aggregate {
    /// Flat `"pass@k"` / `"pass@k:std"` mapping.
    pub fn metrics(&self) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();
        for s in &self.per_k {
            out.insert(format!("pass@{}", s.k), s.mean);
            out.insert(format!("pass@{}:std", s.k), s.std);
        }
        out
    }
}

/// Summarize pass@k for each requested `k`. Tasks with fewer than `k` samples
/// are left out of that `k` rather than counted as zero; a `k` no task can
/// support is omitted. The headline score is always pass@1.
pub fn reduce<'a, I>(outcomes: I, ks: &[usize]) -> Aggregate
where
    I: IntoIterator<Item = &'a SampleCounts>,
{
    let outcomes: Vec<&SampleCounts> = outcomes.into_iter().collect();

    let summarize = |k: usize| -> Option<KSummary> {
        let mut values: Vec<f64> = outcomes
            .iter()
            .filter_map(|o| pass_at_k(o.n_samples, o.n_correct, k))
            .collect();
        // Fixed summation order keeps the result bit-identical across input orders.
        values.sort_by(f64::total_cmp);
        mean_and_std(&values).map(|(mean, std)| KSummary {
            k,
            mean,
            std,
            num_tasks: values.len(),
        })
    };

    let mut sorted_ks: Vec<usize> = ks.iter().copied().filter(|k| *k > 0).collect();
    sorted_ks.sort_unstable();
    sorted_ks.dedup();

    let per_k: Vec<KSummary> = sorted_ks.into_iter().filter_map(|k| summarize(k)).collect();
    let (score, score_std) = summarize(1).map(|s| (s.mean, s.std)).unwrap_or((0.0, 0.0));

    Aggregate {
        per_k,
        score,
        score_std,
    }
}
