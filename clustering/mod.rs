//! Two-dimensional clustering of the shared samples of a gene pair, with the number of
//! clusters chosen by an information criterion.

pub mod gmm;
pub mod kmeans;
pub mod outlier;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A sample as the pair (expression of gene x, expression of gene y).
pub type Point = [f32; 2];

/// Dimensionality of the points being clustered.
const DIMENSIONS: f32 = 2.0;

/// Negative label codes marking samples excluded from clustering. Stored in cluster
/// composition masks as their magnitude.
pub mod labels {
    pub const BELOW_MIN_EXPRESSION: i8 = -6;
    pub const PRE_OUTLIER: i8 = -7;
    pub const POST_OUTLIER: i8 = -8;
    pub const MISSING: i8 = -9;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusteringMethod {
    /// Every valid sample forms a single cluster.
    #[default]
    None,
    KMeans,
    Gmm,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Criterion {
    #[serde(rename = "BIC", alias = "bic")]
    Bic,
    #[default]
    #[serde(rename = "ICL", alias = "icl")]
    Icl,
}

impl ClusteringMethod {
    pub fn code(self) -> i32 {
        match self {
            Self::None => 0,
            Self::KMeans => 1,
            Self::Gmm => 2,
        }
    }
}

impl Criterion {
    pub fn code(self) -> i32 {
        match self {
            Self::Bic => 0,
            Self::Icl => 1,
        }
    }

    /// Score of a fit; lower is better.
    pub fn score(self, k: usize, n: usize, fit: &FitStats) -> f32 {
        let p = k as f32 * (1.0 + DIMENSIONS + DIMENSIONS * DIMENSIONS);
        let bic = p * (n as f32).ln() - 2.0 * fit.log_likelihood;
        match self {
            Self::Bic => bic,
            Self::Icl => bic - 2.0 * fit.entropy,
        }
    }
}

impl fmt::Display for ClusteringMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::KMeans => "kmeans",
            Self::Gmm => "gmm",
        })
    }
}

impl FromStr for ClusteringMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "kmeans" => Ok(Self::KMeans),
            "gmm" => Ok(Self::Gmm),
            other => Err(format!("unknown clustering method '{other}'")),
        }
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Bic => "BIC",
            Self::Icl => "ICL",
        })
    }
}

/// Goodness of one successful fit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FitStats {
    pub log_likelihood: f32,
    /// `sum(gamma * ln(gamma))` over all responsibilities; zero for hard assignments.
    pub entropy: f32,
}

/// Reusable buffers for model selection over one pair.
#[derive(Default)]
pub struct ClusterScratch {
    candidate: Vec<i8>,
    gmm: gmm::GmmScratch,
    kmeans: kmeans::KMeansScratch,
}

/// Fits `k` clusters to `points`, writing one label per point. `None` means the fit
/// failed and no clusters exist for this `k`.
pub fn fit(
    method: ClusteringMethod,
    points: &[Point],
    k: usize,
    labels: &mut Vec<i8>,
    scratch: &mut ClusterScratch,
) -> Option<FitStats> {
    match method {
        ClusteringMethod::None => {
            labels.clear();
            labels.resize(points.len(), 0);
            (k == 1).then_some(FitStats {
                log_likelihood: 0.0,
                entropy: 0.0,
            })
        }
        ClusteringMethod::KMeans => kmeans::fit(points, k, labels, &mut scratch.kmeans),
        ClusteringMethod::Gmm => gmm::fit(points, k, labels, &mut scratch.gmm),
    }
}

/// Sweeps `k` over `min_k..=max_k` and keeps the fit with the lowest criterion score.
/// Ties keep the smaller `k`. Returns the chosen `k`, with its labels left in `best`,
/// or `None` when every fit failed.
pub fn select_model(
    method: ClusteringMethod,
    criterion: Criterion,
    points: &[Point],
    min_k: usize,
    max_k: usize,
    best: &mut Vec<i8>,
    scratch: &mut ClusterScratch,
) -> Option<usize> {
    let mut chosen: Option<(usize, f32)> = None;
    let mut candidate = std::mem::take(&mut scratch.candidate);

    for k in min_k.max(1)..=max_k {
        let Some(stats) = fit(method, points, k, &mut candidate, scratch) else {
            continue;
        };
        let value = criterion.score(k, points.len(), &stats);
        if !value.is_finite() {
            continue;
        }
        if chosen.is_none_or(|(_, best_value)| value < best_value) {
            chosen = Some((k, value));
            best.clear();
            best.extend_from_slice(&candidate);
        }
    }

    scratch.candidate = candidate;
    chosen.map(|(k, _)| k)
}

#[inline]
pub(crate) fn distance_squared(a: Point, b: Point) -> f32 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    dx * dx + dy * dy
}
