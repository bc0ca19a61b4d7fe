// ========================================================================================
//
//                               THE TYPE-DRIVEN CONTRACTS
//
// ========================================================================================
//
// Plain data exchanged between the orchestrator and the compute backends. A work unit
// names a contiguous run of pair ordinals; a result unit carries, for each of those
// pairs in order, the chosen cluster count, per-sample labels and per-cluster
// correlations.

use crate::pairwise::{PairIndex, PairRange, PairwiseError};

/// A contiguous slice of the pair space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkBlock {
    /// Position of this unit among all units.
    pub index: usize,
    /// Ordinal of the first pair.
    pub start: i64,
    /// Number of pairs.
    pub size: i64,
}

impl WorkBlock {
    pub fn pairs(&self) -> Result<PairRange, PairwiseError> {
        PairRange::from_ordinal(self.start, self.size.max(0) as u64)
    }
}

/// Outcome of clustering and correlating one pair.
#[derive(Clone, Debug, PartialEq)]
pub struct PairResult {
    /// Number of clusters; 0 when the pair had too few usable samples or every fit
    /// failed.
    pub k: i8,
    /// One label per sample: a cluster number in `0..k`, or a negative exclusion code.
    pub labels: Vec<i8>,
    /// One correlation per cluster slot (`max_clusters` long); NaN where undefined.
    pub correlations: Vec<f32>,
}

impl PairResult {
    pub fn empty(sample_size: usize, max_clusters: usize) -> Self {
        Self {
            k: 0,
            labels: vec![0; sample_size],
            correlations: vec![f32::NAN; max_clusters],
        }
    }
}

/// Results for every pair of one [`WorkBlock`], in pair order.
#[derive(Clone, Debug)]
pub struct ResultBlock {
    pub index: usize,
    pub start: i64,
    pub pairs: Vec<PairResult>,
}

impl ResultBlock {
    pub fn new(work: &WorkBlock) -> Self {
        Self {
            index: work.index,
            start: work.start,
            pairs: Vec::with_capacity(work.size.max(0) as usize),
        }
    }

    /// The pair index of each result, in order.
    pub fn indices(&self) -> Result<impl Iterator<Item = (PairIndex, &PairResult)>, PairwiseError> {
        let range = PairRange::from_ordinal(self.start, self.pairs.len() as u64)?;
        Ok(range.zip(self.pairs.iter()))
    }
}
