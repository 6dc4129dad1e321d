//! Recency weighting for bullets gathered across several reports.
//!
//! Reports are listed newest first. Each bullet inherits the weight of the
//! report it came from; the final list keeps the heaviest bullets, dropping
//! repeats of the same text.

use itertools::Itertools;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RecencyWeighting {
    /// Weight falls linearly from `newest` (first report) to `oldest` (last).
    Linear { newest: f64, oldest: f64 },
    /// Every report counts the same; page order decides.
    Uniform,
}

impl Default for RecencyWeighting {
    fn default() -> Self {
        Self::Linear {
            newest: 1.0,
            oldest: 0.5,
        }
    }
}

impl RecencyWeighting {
    /// Weight of the report at `index` among `count` reports.
    pub fn weight(&self, index: usize, count: usize) -> f64 {
        match *self {
            Self::Linear { newest, oldest } => {
                let steps = count.saturating_sub(1).max(1) as f64;
                newest - index as f64 * (newest - oldest) / steps
            }
            Self::Uniform => 1.0,
        }
    }
}

/// Keep the `n` heaviest items, ties in insertion order, without repeating
/// the same text (compared trimmed and case-insensitively).
pub fn top_weighted(items: Vec<(String, f64)>, n: usize) -> Vec<String> {
    items
        .into_iter()
        .sorted_by(|a, b| b.1.total_cmp(&a.1))
        .map(|(text, _)| text)
        .filter(|text| !text.trim().is_empty())
        .unique_by(|text| text.trim().to_lowercase())
        .take(n)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_weights() {
        let w = RecencyWeighting::default();
        assert_eq!(w.weight(0, 3), 1.0);
        assert_eq!(w.weight(1, 3), 0.75);
        assert_eq!(w.weight(2, 3), 0.5);
        // a single report gets full weight
        assert_eq!(w.weight(0, 1), 1.0);
    }

    #[test]
    fn test_uniform_weights() {
        assert_eq!(RecencyWeighting::Uniform.weight(5, 10), 1.0);
    }

    #[test]
    fn test_top_weighted_orders_dedupes_and_truncates() {
        let items = vec![
            ("old news".to_string(), 0.5),
            ("fresh A".to_string(), 1.0),
            ("fresh B".to_string(), 1.0),
            ("Fresh A ".to_string(), 0.75),
            ("middle".to_string(), 0.75),
            ("   ".to_string(), 1.0),
        ];
        let top = top_weighted(items, 3);
        assert_eq!(top, vec!["fresh A", "fresh B", "middle"]);
    }
}
