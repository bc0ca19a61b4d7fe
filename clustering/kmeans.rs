use super::{FitStats, Point, distance_squared};

const MAX_ITERATIONS: usize = 300;

#[derive(Default)]
pub struct KMeansScratch {
    means: Vec<Point>,
    sums: Vec<[f32; 3]>,
}

/// Lloyd's algorithm seeded with evenly spaced points (`points[j * n / k]`).
///
/// The log-likelihood is `-0.5 * sum(d^2)` to the assigned means. The fit fails if
/// there are fewer points than clusters or a cluster ends up empty.
pub fn fit(
    points: &[Point],
    k: usize,
    labels: &mut Vec<i8>,
    scratch: &mut KMeansScratch,
) -> Option<FitStats> {
    let n = points.len();
    if k == 0 || n < k {
        return None;
    }

    let means = &mut scratch.means;
    means.clear();
    means.extend((0..k).map(|j| points[j * n / k]));
    labels.clear();
    labels.resize(n, -1);

    for _ in 0..MAX_ITERATIONS {
        let mut changed = false;
        for (point, label) in points.iter().zip(labels.iter_mut()) {
            let nearest = nearest_mean(*point, means);
            if *label != nearest {
                *label = nearest;
                changed = true;
            }
        }
        if !changed {
            break;
        }

        let sums = &mut scratch.sums;
        sums.clear();
        sums.resize(k, [0.0; 3]);
        for (point, &label) in points.iter().zip(labels.iter()) {
            let s = &mut sums[label as usize];
            s[0] += point[0];
            s[1] += point[1];
            s[2] += 1.0;
        }
        for (mean, s) in means.iter_mut().zip(sums.iter()) {
            if s[2] > 0.0 {
                *mean = [s[0] / s[2], s[1] / s[2]];
            }
        }
    }

    let mut counts = vec![0usize; k];
    let mut sum_sq = 0.0f32;
    for (point, &label) in points.iter().zip(labels.iter()) {
        counts[label as usize] += 1;
        sum_sq += distance_squared(*point, means[label as usize]);
    }
    if counts.contains(&0) {
        return None;
    }

    Some(FitStats {
        log_likelihood: -0.5 * sum_sq,
        entropy: 0.0,
    })
}

#[inline]
fn nearest_mean(point: Point, means: &[Point]) -> i8 {
    let mut best = 0;
    let mut best_distance = f32::INFINITY;
    for (j, mean) in means.iter().enumerate() {
        let d = distance_squared(point, *mean);
        if d < best_distance {
            best = j;
            best_distance = d;
        }
    }
    best as i8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clustering::tests::blobs;

    #[test]
    fn separates_two_blobs() {
        let points = blobs(&[[-5.0, -5.0], [5.0, 5.0]], 31, 3);
        let mut labels = Vec::new();
        let stats = fit(&points, 2, &mut labels, &mut KMeansScratch::default()).unwrap();
        assert_eq!(stats.entropy, 0.0);
        assert!(stats.log_likelihood < 0.0);
        for (i, label) in labels.iter().enumerate() {
            assert_eq!(*label, labels[i % 2]);
        }
        assert_ne!(labels[0], labels[1]);
    }

    #[test]
    fn fails_with_more_clusters_than_points() {
        let points = vec![[0.0, 0.0], [1.0, 1.0]];
        assert!(fit(&points, 3, &mut Vec::new(), &mut KMeansScratch::default()).is_none());
    }

    #[test]
    fn fails_when_a_cluster_is_left_empty() {
        // Identical seeds: every point is nearest to the first mean.
        let points = vec![[2.0, 2.0]; 6];
        assert!(fit(&points, 2, &mut Vec::new(), &mut KMeansScratch::default()).is_none());
    }
}
