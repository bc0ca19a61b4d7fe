// ========================================================================================
//
//                           THE PER-PAIR COMPUTE KERNEL
//
// ========================================================================================
//
// Every backend runs the same three stages for a pair of genes:
//
//   1. fetch     gather the samples valid in both genes into a compact point list,
//                labelling every excluded sample with its exclusion code;
//   2. cluster   optional pre-clustering outlier removal, model selection over
//                [min_clusters, max_clusters], optional post-clustering outlier
//                removal, then expansion of the compact labels back onto samples;
//   3. correlate one correlation per cluster over that cluster's samples.
//
// The GPU kernels in `kernels/similarity.c` implement the same stages with the same
// seeding and quartile rules, so all backends agree on cluster assignments.

use crate::clustering::outlier::mark_outliers;
use crate::clustering::{self, ClusterScratch, ClusteringMethod, Criterion, Point, labels};
use crate::config::SimilarityConfig;
use crate::correlate::{CorrelationMethod, RankScratch};
use crate::types::PairResult;

/// The subset of the configuration the kernel needs, in device-friendly form.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct KernelParams {
    pub sample_size: usize,
    pub min_expression: f32,
    pub min_samples: usize,
    pub min_clusters: usize,
    pub max_clusters: usize,
    pub clustering: ClusteringMethod,
    pub criterion: Criterion,
    pub remove_pre_outliers: bool,
    pub remove_post_outliers: bool,
    pub correlation: CorrelationMethod,
}

impl KernelParams {
    pub fn new(config: &SimilarityConfig, sample_size: usize) -> Self {
        Self {
            sample_size,
            min_expression: config.min_expression,
            min_samples: config.min_samples,
            min_clusters: config.min_clusters as usize,
            max_clusters: config.max_clusters as usize,
            clustering: config.clustering,
            criterion: config.criterion,
            remove_pre_outliers: config.remove_pre_outliers,
            remove_post_outliers: config.remove_post_outliers,
            correlation: config.correlation,
        }
    }

    /// Cluster slots per pair in the result buffers. With clustering disabled only
    /// one cluster can exist.
    pub fn cluster_slots(&self) -> usize {
        match self.clustering {
            ClusteringMethod::None => 1,
            _ => self.max_clusters,
        }
    }
}

/// Fetch stage. Writes one label per sample (`0` for usable samples, otherwise the
/// exclusion code) and collects the usable samples into `points`.
pub fn fetch_pair(
    x: &[f32],
    y: &[f32],
    min_expression: f32,
    points: &mut Vec<Point>,
    sample_labels: &mut [i8],
) {
    points.clear();
    for ((&a, &b), label) in x.iter().zip(y).zip(sample_labels.iter_mut()) {
        *label = if a.is_nan() || b.is_nan() {
            labels::MISSING
        } else if a < min_expression || b < min_expression {
            labels::BELOW_MIN_EXPRESSION
        } else {
            points.push([a, b]);
            0
        };
    }
}

/// Reusable per-thread state for computing one pair after another.
pub struct PairKernel {
    params: KernelParams,
    points: Vec<Point>,
    compact: Vec<i8>,
    best: Vec<i8>,
    x_sorted: Vec<f32>,
    y_sorted: Vec<f32>,
    cluster_x: Vec<f32>,
    cluster_y: Vec<f32>,
    clusters: ClusterScratch,
    ranks: RankScratch,
}

impl PairKernel {
    pub fn new(params: KernelParams) -> Self {
        Self {
            params,
            points: Vec::with_capacity(params.sample_size),
            compact: Vec::with_capacity(params.sample_size),
            best: Vec::with_capacity(params.sample_size),
            x_sorted: Vec::new(),
            y_sorted: Vec::new(),
            cluster_x: Vec::new(),
            cluster_y: Vec::new(),
            clusters: ClusterScratch::default(),
            ranks: RankScratch::default(),
        }
    }

    pub fn params(&self) -> &KernelParams {
        &self.params
    }

    /// Runs all three stages for the genes with expression `x` and `y`.
    pub fn compute(&mut self, x: &[f32], y: &[f32]) -> PairResult {
        let p = self.params;
        let mut result = PairResult::empty(p.sample_size, p.cluster_slots());

        // --- Fetch ---
        fetch_pair(x, y, p.min_expression, &mut self.points, &mut result.labels);
        if self.points.len() < p.min_samples {
            return result;
        }

        // --- Cluster ---
        let k = match p.clustering {
            ClusteringMethod::None => 1,
            method => match self.cluster(method, x, y, &mut result.labels) {
                Some(k) => k,
                None => return result,
            },
        };
        result.k = k as i8;

        // --- Correlate ---
        for cluster in 0..k {
            self.cluster_x.clear();
            self.cluster_y.clear();
            for ((&a, &b), &label) in x.iter().zip(y).zip(&result.labels) {
                if label == cluster as i8 {
                    self.cluster_x.push(a);
                    self.cluster_y.push(b);
                }
            }
            if self.cluster_x.len() >= p.min_samples {
                result.correlations[cluster] =
                    p.correlation
                        .compute(&self.cluster_x, &self.cluster_y, &mut self.ranks);
            }
        }
        result
    }

    /// Clusters the fetched points, rewriting `sample_labels` with cluster numbers and
    /// outlier codes. Returns `None` when no usable model exists.
    fn cluster(
        &mut self,
        method: ClusteringMethod,
        x: &[f32],
        y: &[f32],
        sample_labels: &mut [i8],
    ) -> Option<usize> {
        let p = self.params;

        if p.remove_pre_outliers {
            self.compact.clear();
            self.compact.resize(self.points.len(), 0);
            mark_outliers(
                &self.points,
                &mut self.compact,
                0,
                labels::PRE_OUTLIER,
                &mut self.x_sorted,
                &mut self.y_sorted,
            );
            expand(&self.compact, sample_labels);

            self.points.clear();
            for ((&a, &b), &label) in x.iter().zip(y).zip(sample_labels.iter()) {
                if label >= 0 {
                    self.points.push([a, b]);
                }
            }
            if self.points.len() < p.min_samples {
                return None;
            }
        }

        let k = clustering::select_model(
            method,
            p.criterion,
            &self.points,
            p.min_clusters,
            p.max_clusters,
            &mut self.best,
            &mut self.clusters,
        )?;

        if p.remove_post_outliers {
            for cluster in 0..k {
                mark_outliers(
                    &self.points,
                    &mut self.best,
                    cluster as i8,
                    labels::POST_OUTLIER,
                    &mut self.x_sorted,
                    &mut self.y_sorted,
                );
            }
        }
        expand(&self.best, sample_labels);
        Some(k)
    }
}

/// Writes compact labels onto the samples that currently hold a non-negative label,
/// in order.
fn expand(compact: &[i8], sample_labels: &mut [i8]) {
    let mut next = compact.iter();
    for label in sample_labels.iter_mut().filter(|l| **l >= 0) {
        if let Some(&value) = next.next() {
            *label = value;
        }
    }
}

/// The row of `gene` in a gene-major expression buffer.
#[inline]
pub fn gene_row(expressions: &[f32], sample_size: usize, gene: i32) -> &[f32] {
    let start = gene as usize * sample_size;
    &expressions[start..start + sample_size]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clustering::tests::normal;
    use rand::{SeedableRng, rngs::StdRng};

    fn params(clustering: ClusteringMethod, samples: usize) -> KernelParams {
        KernelParams {
            sample_size: samples,
            min_expression: 0.0,
            min_samples: 5,
            min_clusters: 1,
            max_clusters: 4,
            clustering,
            criterion: Criterion::Bic,
            remove_pre_outliers: false,
            remove_post_outliers: false,
            correlation: CorrelationMethod::Pearson,
        }
    }

    #[test]
    fn fetch_assigns_missing_and_below_minimum_codes() {
        let x = [1.0, f32::NAN, 3.0, -2.0, 5.0];
        let y = [1.0, 2.0, f32::NAN, 4.0, 0.5];
        let mut points = Vec::new();
        let mut codes = [0i8; 5];
        fetch_pair(&x, &y, 0.0, &mut points, &mut codes);
        assert_eq!(codes, [0, -9, -9, -6, 0]);
        assert_eq!(points, vec![[1.0, 1.0], [5.0, 0.5]]);
    }

    #[test]
    fn too_few_samples_yields_no_clusters() {
        let mut kernel = PairKernel::new(params(ClusteringMethod::None, 6));
        let x = [1.0, 2.0, 3.0, 4.0, f32::NAN, f32::NAN];
        let result = kernel.compute(&x, &x);
        assert_eq!(result.k, 0);
        assert!(result.correlations.iter().all(|c| c.is_nan()));
    }

    #[test]
    fn unclustered_pair_is_a_single_cluster() {
        let x: Vec<f32> = (0..20).map(|i| 1.0 + i as f32).collect();
        let y: Vec<f32> = x.iter().map(|v| 3.0 * v + 1.0).collect();
        let mut kernel = PairKernel::new(params(ClusteringMethod::None, 20));
        let result = kernel.compute(&x, &y);
        assert_eq!(result.k, 1);
        assert_eq!(result.correlations.len(), 1);
        assert!((result.correlations[0] - 1.0).abs() < 1e-5);
        assert!(result.labels.iter().all(|&l| l == 0));
    }

    #[test]
    fn two_populations_are_split_and_correlated_separately() {
        // Population A (first half): y rises with x. Population B: y falls, far away.
        let mut rng = StdRng::seed_from_u64(21);
        let (mut x, mut y) = (Vec::new(), Vec::new());
        for i in 0..60 {
            let t = (i % 30) as f32 * 0.1;
            if i < 30 {
                x.push(1.0 + t);
                y.push(1.0 + t + normal(&mut rng, 0.0, 0.05));
            } else {
                x.push(20.0 + t);
                y.push(20.0 - t + normal(&mut rng, 0.0, 0.05));
            }
        }
        let mut kernel = PairKernel::new(params(ClusteringMethod::Gmm, 60));
        let result = kernel.compute(&x, &y);
        assert_eq!(result.k, 2);
        let a = result.labels[0] as usize;
        let b = result.labels[30] as usize;
        assert_ne!(a, b);
        assert!(result.correlations[a] > 0.9);
        assert!(result.correlations[b] < -0.9);
    }

    #[test]
    fn outlier_removal_writes_pre_and_post_codes() {
        let mut x: Vec<f32> = (0..30).map(|i| 10.0 + (i % 10) as f32 * 0.1).collect();
        let mut y: Vec<f32> = (0..30).map(|i| 10.0 + (i % 7) as f32 * 0.1).collect();
        x[5] = 500.0;
        y[17] = 0.5;
        let mut p = params(ClusteringMethod::KMeans, 30);
        p.max_clusters = 1;
        p.remove_pre_outliers = true;
        p.remove_post_outliers = true;
        let result = PairKernel::new(p).compute(&x, &y);

        assert_eq!(result.k, 1);
        assert_eq!(result.labels[5], labels::PRE_OUTLIER);
        assert_eq!(result.labels[17], labels::PRE_OUTLIER);
        assert!(result.labels.iter().all(|&l| l == 0 || l == labels::PRE_OUTLIER || l == labels::POST_OUTLIER));
    }

    #[test]
    fn expand_skips_excluded_samples() {
        let mut sample_labels = [0i8, -9, 0, -6, 0];
        expand(&[2, 1, -8], &mut sample_labels);
        assert_eq!(sample_labels, [2, -9, 1, -6, -8]);
    }
}
