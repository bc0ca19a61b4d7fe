use super::{FitStats, Point};

const MAX_ITERATIONS: usize = 100;
/// Relative change in log-likelihood below which EM stops.
const TOLERANCE: f32 = 1e-5;
const LN_2PI: f32 = 1.837_877_1;
/// Covariances with `det <= SINGULAR_RATIO * s_xx * s_yy` are treated as singular.
const SINGULAR_RATIO: f32 = 1e-6;

/// One bivariate normal component.
#[derive(Clone, Copy, Debug, Default)]
struct Component {
    pi: f32,
    mu: Point,
    /// Covariance entries `[s_xx, s_xy, s_yy]`.
    sigma: [f32; 3],
    /// Inverse covariance entries, same layout as `sigma`.
    precision: [f32; 3],
    /// `-ln(2 pi) - 0.5 ln|sigma|`
    normalizer: f32,
}

impl Component {
    /// Recomputes the inverse and normalizer. Fails on a singular covariance.
    fn prepare(&mut self) -> bool {
        let [a, b, c] = self.sigma;
        let det = a * c - b * b;
        if !det.is_finite() || det <= 0.0 || det <= SINGULAR_RATIO * a * c {
            return false;
        }
        self.precision = [c / det, -b / det, a / det];
        self.normalizer = -LN_2PI - 0.5 * det.ln();
        true
    }

    #[inline]
    fn log_density(&self, x: Point) -> f32 {
        let dx = x[0] - self.mu[0];
        let dy = x[1] - self.mu[1];
        let [p, q, r] = self.precision;
        self.normalizer - 0.5 * (p * dx * dx + 2.0 * q * dx * dy + r * dy * dy)
    }
}

#[derive(Default)]
pub struct GmmScratch {
    components: Vec<Component>,
    /// Log responsibilities, `n * k`, point-major.
    log_gamma: Vec<f32>,
}

/// Expectation-maximization for a `k`-component bivariate Gaussian mixture.
///
/// Means start at evenly spaced points (`points[j * n / k]`) with identity covariances
/// and equal weights. A component whose covariance becomes singular or whose weight
/// vanishes fails the fit.
pub fn fit(
    points: &[Point],
    k: usize,
    labels: &mut Vec<i8>,
    scratch: &mut GmmScratch,
) -> Option<FitStats> {
    let n = points.len();
    if k == 0 || n < k {
        return None;
    }

    let components = &mut scratch.components;
    components.clear();
    for j in 0..k {
        let mut component = Component {
            pi: 1.0 / k as f32,
            mu: points[j * n / k],
            sigma: [1.0, 0.0, 1.0],
            ..Component::default()
        };
        component.prepare();
        components.push(component);
    }

    let log_gamma = &mut scratch.log_gamma;
    log_gamma.clear();
    log_gamma.resize(n * k, 0.0);

    let mut log_likelihood = f32::NEG_INFINITY;
    for iteration in 0..MAX_ITERATIONS {
        // --- E-step ---
        let previous = log_likelihood;
        log_likelihood = 0.0;
        for (i, point) in points.iter().enumerate() {
            let row = &mut log_gamma[i * k..(i + 1) * k];
            let mut max = f32::NEG_INFINITY;
            for (j, component) in components.iter().enumerate() {
                row[j] = component.pi.ln() + component.log_density(*point);
                max = max.max(row[j]);
            }
            let mut sum = 0.0f32;
            for value in row.iter() {
                sum += (value - max).exp();
            }
            let log_sum = max + sum.ln();
            for value in row.iter_mut() {
                *value -= log_sum;
            }
            log_likelihood += log_sum;
        }
        if !log_likelihood.is_finite() {
            return None;
        }
        if iteration > 0 && (log_likelihood - previous).abs() <= TOLERANCE * log_likelihood.abs() {
            break;
        }

        // --- M-step ---
        for (j, component) in components.iter_mut().enumerate() {
            let mut weight = 0.0f32;
            let mut mx = 0.0f32;
            let mut my = 0.0f32;
            for (i, point) in points.iter().enumerate() {
                let g = log_gamma[i * k + j].exp();
                weight += g;
                mx += g * point[0];
                my += g * point[1];
            }
            if weight <= f32::EPSILON {
                return None;
            }
            let mu = [mx / weight, my / weight];

            let mut sigma = [0.0f32; 3];
            for (i, point) in points.iter().enumerate() {
                let g = log_gamma[i * k + j].exp();
                let dx = point[0] - mu[0];
                let dy = point[1] - mu[1];
                sigma[0] += g * dx * dx;
                sigma[1] += g * dx * dy;
                sigma[2] += g * dy * dy;
            }
            component.pi = weight / n as f32;
            component.mu = mu;
            component.sigma = sigma.map(|s| s / weight);
            if !component.prepare() {
                return None;
            }
        }
    }

    labels.clear();
    let mut entropy = 0.0f32;
    for i in 0..n {
        let row = &log_gamma[i * k..(i + 1) * k];
        let mut best = 0;
        for (j, &value) in row.iter().enumerate() {
            if value > row[best] {
                best = j;
            }
            let g = value.exp();
            if g > 0.0 {
                entropy += g * value;
            }
        }
        labels.push(best as i8);
    }

    Some(FitStats {
        log_likelihood,
        entropy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clustering::tests::blobs;

    #[test]
    fn recovers_two_components() {
        let points = blobs(&[[0.0, 0.0], [6.0, -6.0]], 25, 5);
        let mut labels = Vec::new();
        let stats = fit(&points, 2, &mut labels, &mut GmmScratch::default()).unwrap();
        assert!(stats.log_likelihood.is_finite());
        assert!(stats.entropy <= 0.0);
        assert_ne!(labels[0], labels[1]);
        for (i, label) in labels.iter().enumerate() {
            assert_eq!(*label, labels[i % 2]);
        }
    }

    #[test]
    fn one_component_entropy_is_zero() {
        let points = blobs(&[[1.0, 2.0]], 20, 9);
        let mut labels = Vec::new();
        let stats = fit(&points, 1, &mut labels, &mut GmmScratch::default()).unwrap();
        assert!(stats.entropy.abs() < 1e-4);
        assert!(labels.iter().all(|&l| l == 0));
    }

    #[test]
    fn collinear_points_are_singular() {
        let points: Vec<Point> = (0..20).map(|i| [i as f32, 2.0 * i as f32]).collect();
        assert!(fit(&points, 1, &mut Vec::new(), &mut GmmScratch::default()).is_none());
    }
}
