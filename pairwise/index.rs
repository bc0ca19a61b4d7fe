use super::PairwiseError;
use std::fmt;

/// Upper bound on clusters stored for one pair. Cluster counts are persisted as a
/// signed byte.
pub const MAX_CLUSTER_SIZE: i32 = 64;

/// Ordinal of the last pair addressable with `i32` gene indices.
const MAX_ORDINAL: i64 = (1i64 << 31) * ((1i64 << 31) - 1) / 2 - 1;

/// Number of unordered pairs over `gene_count` genes.
#[inline]
pub fn total_pairs(gene_count: i64) -> i64 {
    if gene_count < 2 {
        0
    } else {
        gene_count * (gene_count - 1) / 2
    }
}

/// An unordered gene pair, normalized so that `x > y`.
///
/// Pairs are ordered the way they are enumerated: `y` runs from `0` to `x - 1` before
/// `x` advances, which is exactly the ordering of the derived `Ord` on `(x, y)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairIndex {
    x: i32,
    y: i32,
}

impl PairIndex {
    pub fn new(x: i32, y: i32) -> Result<Self, PairwiseError> {
        if x < 1 || y < 0 || y >= x {
            return Err(PairwiseError::InvalidPair {
                x: x.into(),
                y: y.into(),
            });
        }
        Ok(Self { x, y })
    }

    /// Builds the pair for two distinct genes given in either order.
    pub fn from_genes(a: i32, b: i32) -> Result<Self, PairwiseError> {
        Self::new(a.max(b), a.min(b))
    }

    /// The first pair in enumeration order.
    pub const fn first() -> Self {
        Self { x: 1, y: 0 }
    }

    /// Inverse of [`PairIndex::ordinal`].
    pub fn from_ordinal(ordinal: i64) -> Result<Self, PairwiseError> {
        if ordinal < 0 {
            return Err(PairwiseError::NegativeOrdinal(ordinal));
        }
        if ordinal > MAX_ORDINAL {
            return Err(PairwiseError::domain(format!(
                "pairwise ordinal {ordinal} exceeds the last addressable pair {MAX_ORDINAL}"
            )));
        }

        // Float estimate of the triangular root, then corrected exactly so that
        // x(x-1)/2 <= ordinal < (x+1)x/2.
        let mut x = ((1.0 + (1.0 + 8.0 * ordinal as f64).sqrt()) / 2.0).floor() as i64;
        x = x.max(1);
        while triangle(x) > ordinal {
            x -= 1;
        }
        while triangle(x + 1) <= ordinal {
            x += 1;
        }
        let y = ordinal - triangle(x);

        let x = i32::try_from(x).map_err(|_| PairwiseError::InvalidPair { x, y })?;
        Self::new(x, y as i32)
    }

    #[inline]
    pub fn x(self) -> i32 {
        self.x
    }

    #[inline]
    pub fn y(self) -> i32 {
        self.y
    }

    /// Dense position of this pair in enumeration order.
    #[inline]
    pub fn ordinal(self) -> i64 {
        triangle(self.x.into()) + i64::from(self.y)
    }

    /// Storage offset of cluster `slot` of this pair when every pair is given
    /// [`MAX_CLUSTER_SIZE`] slots.
    pub fn indent(self, slot: i32) -> Result<i64, PairwiseError> {
        if !(0..MAX_CLUSTER_SIZE).contains(&slot) {
            return Err(PairwiseError::ClusterSlot {
                slot: slot.into(),
                max: MAX_CLUSTER_SIZE.into(),
            });
        }
        Ok(self.ordinal() * i64::from(MAX_CLUSTER_SIZE) + i64::from(slot))
    }

    /// Advances to the next pair in enumeration order.
    #[inline]
    pub fn increment(&mut self) {
        self.y += 1;
        if self.y >= self.x {
            self.y = 0;
            self.x += 1;
        }
    }

    #[inline]
    pub fn next(mut self) -> Self {
        self.increment();
        self
    }
}

impl fmt::Display for PairIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

#[inline]
fn triangle(x: i64) -> i64 {
    x * (x - 1) / 2
}

/// `count` consecutive pairs starting at a given pair.
#[derive(Clone, Debug)]
pub struct PairRange {
    next: PairIndex,
    remaining: u64,
}

impl PairRange {
    pub fn new(start: PairIndex, count: u64) -> Self {
        Self {
            next: start,
            remaining: count,
        }
    }

    pub fn from_ordinal(start: i64, count: u64) -> Result<Self, PairwiseError> {
        Ok(Self::new(PairIndex::from_ordinal(start)?, count))
    }
}

impl Iterator for PairRange {
    type Item = PairIndex;

    fn next(&mut self) -> Option<PairIndex> {
        if self.remaining == 0 {
            return None;
        }
        let current = self.next;
        self.next.increment();
        self.remaining -= 1;
        Some(current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = usize::try_from(self.remaining).unwrap_or(usize::MAX);
        (n, Some(n))
    }
}

impl ExactSizeIterator for PairRange {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinal_round_trips_over_a_large_prefix() {
        let mut index = PairIndex::first();
        for n in 0..200_000i64 {
            assert_eq!(index.ordinal(), n);
            assert_eq!(PairIndex::from_ordinal(n).unwrap(), index);
            index.increment();
        }
    }

    #[test]
    fn ordinal_round_trips_near_i32_gene_limits() {
        for x in [46_341, 1 << 20, 2_000_000_000] {
            for y in [0, 1, x / 2, x - 1] {
                let index = PairIndex::new(x, y).unwrap();
                assert_eq!(PairIndex::from_ordinal(index.ordinal()).unwrap(), index);
            }
        }
    }

    #[test]
    fn ordinals_past_the_last_pair_are_rejected() {
        let last = PairIndex::new(i32::MAX, i32::MAX - 1).unwrap();
        assert_eq!(last.ordinal(), MAX_ORDINAL);
        assert_eq!(PairIndex::from_ordinal(MAX_ORDINAL).unwrap(), last);
        assert!(PairIndex::from_ordinal(MAX_ORDINAL + 1).is_err());
        assert!(PairIndex::from_ordinal(i64::MAX).is_err());
    }

    #[test]
    fn increment_walks_rows_before_columns() {
        let walked: Vec<(i32, i32)> = PairRange::new(PairIndex::first(), 6)
            .map(|p| (p.x(), p.y()))
            .collect();
        assert_eq!(walked, vec![(1, 0), (2, 0), (2, 1), (3, 0), (3, 1), (3, 2)]);

        let mut sorted = PairRange::new(PairIndex::first(), 50).collect::<Vec<_>>();
        let original = sorted.clone();
        sorted.sort();
        assert_eq!(sorted, original);
    }

    #[test]
    fn rejects_invalid_coordinates() {
        assert!(PairIndex::new(0, 0).is_err());
        assert!(PairIndex::new(3, 3).is_err());
        assert!(PairIndex::new(3, 4).is_err());
        assert!(PairIndex::new(3, -1).is_err());
        assert!(matches!(
            PairIndex::from_ordinal(-1),
            Err(PairwiseError::NegativeOrdinal(-1))
        ));
        assert_eq!(PairIndex::from_genes(2, 7).unwrap(), PairIndex::new(7, 2).unwrap());
    }

    #[test]
    fn indent_reserves_max_cluster_slots_per_pair() {
        let index = PairIndex::new(3, 1).unwrap();
        assert_eq!(index.ordinal(), 4);
        assert_eq!(index.indent(0).unwrap(), 4 * 64);
        assert_eq!(index.indent(63).unwrap(), 4 * 64 + 63);
        assert!(index.indent(64).is_err());
        assert!(index.indent(-1).is_err());
    }

    #[test]
    fn total_pairs_is_triangular() {
        assert_eq!(total_pairs(0), 0);
        assert_eq!(total_pairs(1), 0);
        assert_eq!(total_pairs(2), 1);
        assert_eq!(total_pairs(10), 45);
        assert_eq!(total_pairs(60_000), 1_799_970_000);
    }
}
