//! Sparse pairwise storage: triangular pair addressing and the two on-disk matrix kinds
//! built on top of it.

pub mod ccm;
pub mod correlation;
pub mod index;
pub mod matrix;

pub use ccm::CCMatrix;
pub use correlation::CorrelationMatrix;
pub use index::{MAX_CLUSTER_SIZE, PairIndex, PairRange, total_pairs};
pub use matrix::{ClusterElement, Pair, PairCursor, PairwiseMatrix};

use crate::shared::files::FileMemError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PairwiseError {
    /// Invalid argument at a public boundary, rendered as `title: detail`.
    #[error("{title}: {detail}")]
    Domain { title: String, detail: String },
    /// Persisted data is absent or inconsistent.
    #[error("{title}: {detail}")]
    Data { title: String, detail: String },
    #[error("invalid pairwise index ({x}, {y}): requires x >= 1 and 0 <= y < x")]
    InvalidPair { x: i64, y: i64 },
    #[error("pairwise ordinal {0} is negative")]
    NegativeOrdinal(i64),
    #[error("cluster slot {slot} is outside [0, {max})")]
    ClusterSlot { slot: i64, max: i64 },
    #[error("pair {attempted} written after {last}; pairs must be written in increasing order")]
    OutOfOrder { last: PairIndex, attempted: PairIndex },
    #[error("matrix has not been initialized")]
    Uninitialized,
    #[error("matrix has been finished and is read-only")]
    Sealed,
    #[error("{path}: {detail}")]
    Format { path: String, detail: String },
    #[error(transparent)]
    FileMem(#[from] FileMemError),
    #[error("metadata encoding failed: {0}")]
    Metadata(#[from] serde_json::Error),
}

impl PairwiseError {
    pub fn domain(detail: impl Into<String>) -> Self {
        Self::Domain {
            title: "Domain Error".to_string(),
            detail: detail.into(),
        }
    }

    pub fn null_reference(detail: impl Into<String>) -> Self {
        Self::Data {
            title: "Null Return Reference".to_string(),
            detail: detail.into(),
        }
    }
}
