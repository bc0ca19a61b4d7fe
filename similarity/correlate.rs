use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrelationMethod {
    #[default]
    Pearson,
    Spearman,
}

impl CorrelationMethod {
    /// Name recorded in the correlation matrix metadata.
    pub fn name(self) -> &'static str {
        match self {
            Self::Pearson => "pearson",
            Self::Spearman => "spearman",
        }
    }

    /// Selector passed to the device kernels.
    pub fn code(self) -> i32 {
        match self {
            Self::Pearson => 0,
            Self::Spearman => 1,
        }
    }

    pub fn compute(self, x: &[f32], y: &[f32], scratch: &mut RankScratch) -> f32 {
        match self {
            Self::Pearson => pearson(x, y),
            Self::Spearman => spearman(x, y, scratch),
        }
    }
}

impl fmt::Display for CorrelationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CorrelationMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s.to_ascii_lowercase().as_str() {
            "pearson" => Ok(Self::Pearson),
            "spearman" => Ok(Self::Spearman),
            other => Err(format!("unknown correlation method '{other}'")),
        }
    }
}

/// Sample Pearson correlation from running sums. NaN when either side is constant.
pub fn pearson(x: &[f32], y: &[f32]) -> f32 {
    let n = x.len().min(y.len()) as f32;
    let (mut sx, mut sy, mut sxx, mut syy, mut sxy) = (0.0f32, 0.0f32, 0.0f32, 0.0f32, 0.0f32);
    for (&a, &b) in x.iter().zip(y) {
        sx += a;
        sy += b;
        sxx += a * a;
        syy += b * b;
        sxy += a * b;
    }
    let denominator = ((n * sxx - sx * sx) * (n * syy - sy * sy)).sqrt();
    if denominator > 0.0 {
        ((n * sxy - sx * sy) / denominator).clamp(-1.0, 1.0)
    } else {
        f32::NAN
    }
}

#[derive(Default)]
pub struct RankScratch {
    order: Vec<u32>,
    x_rank: Vec<f32>,
    y_rank: Vec<f32>,
}

/// Spearman rank correlation, `1 - 6 sum(d^2) / (n (n^2 - 1))`. Tied values receive
/// consecutive ranks in sample order.
pub fn spearman(x: &[f32], y: &[f32], scratch: &mut RankScratch) -> f32 {
    let n = x.len().min(y.len());
    if n < 2 {
        return f32::NAN;
    }
    rank(&x[..n], &mut scratch.order, &mut scratch.x_rank);
    rank(&y[..n], &mut scratch.order, &mut scratch.y_rank);

    let mut sum_d2 = 0.0f32;
    for (a, b) in scratch.x_rank.iter().zip(&scratch.y_rank) {
        let d = a - b;
        sum_d2 += d * d;
    }
    let n = n as f32;
    1.0 - 6.0 * sum_d2 / (n * (n * n - 1.0))
}

fn rank(values: &[f32], order: &mut Vec<u32>, ranks: &mut Vec<f32>) {
    order.clear();
    order.extend(0..values.len() as u32);
    order.sort_by(|&a, &b| values[a as usize].total_cmp(&values[b as usize]));
    ranks.clear();
    ranks.resize(values.len(), 0.0);
    for (position, &sample) in order.iter().enumerate() {
        ranks[sample as usize] = (position + 1) as f32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn pearson_matches_known_values() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_abs_diff_eq!(pearson(&x, &[2.0, 4.0, 6.0, 8.0, 10.0]), 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(pearson(&x, &[5.0, 4.0, 3.0, 2.0, 1.0]), -1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(
            pearson(&x, &[2.0, 1.0, 4.0, 3.0, 5.0]),
            0.8,
            epsilon = 1e-6
        );
        assert!(pearson(&x, &[3.0; 5]).is_nan());
    }

    #[test]
    fn spearman_depends_only_on_order() {
        let mut scratch = RankScratch::default();
        let x: [f32; 5] = [0.1, 0.5, 0.2, 9.0, 3.0];
        let monotone: Vec<f32> = x.iter().map(|v| v.exp()).collect();
        assert_abs_diff_eq!(spearman(&x, &monotone, &mut scratch), 1.0, epsilon = 1e-6);

        // d = [1, -1, 0, 0, 0] => 1 - 6 * 2 / (5 * 24) = 0.9
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        let y = [2.0, 1.0, 3.0, 4.0, 5.0];
        assert_abs_diff_eq!(spearman(&x, &y, &mut scratch), 0.9, epsilon = 1e-6);
    }

    #[test]
    fn method_names_round_trip() {
        for method in [CorrelationMethod::Pearson, CorrelationMethod::Spearman] {
            assert_eq!(method.name().parse::<CorrelationMethod>(), Ok(method));
        }
    }
}
