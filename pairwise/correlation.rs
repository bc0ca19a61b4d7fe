use super::index::PairIndex;
use super::matrix::{Pair, PairCursor, PairwiseMatrix};
use super::PairwiseError;
use serde_json::{Map, Value};
use std::fmt;
use std::path::Path;

pub const CORRELATIONS_KEY: &str = "correlations";
/// Subheader: number of correlation values per cluster, as an `i8`.
const SUBHEADER_SIZE: usize = 1;

/// Per-pair, per-cluster correlation values.
pub struct CorrelationMatrix {
    inner: PairwiseMatrix<f32>,
}

impl CorrelationMatrix {
    pub fn create(path: &Path) -> Result<Self, PairwiseError> {
        Ok(Self {
            inner: PairwiseMatrix::create(path)?,
        })
    }

    pub fn open(path: &Path) -> Result<Self, PairwiseError> {
        let inner = PairwiseMatrix::open(path, SUBHEADER_SIZE)?;
        let stored = inner.subheader().first().map(|&b| i64::from(b as i8));
        if stored != Some(inner.width() as i64) {
            return Err(PairwiseError::Format {
                path: path.display().to_string(),
                detail: "correlation count does not match record width".to_string(),
            });
        }
        Ok(Self { inner })
    }

    /// `correlation_names` names each value stored per cluster and must be a
    /// non-empty array.
    pub fn initialize(
        &mut self,
        gene_names: &Value,
        max_cluster_size: i32,
        correlation_names: &Value,
    ) -> Result<(), PairwiseError> {
        let count = match correlation_names {
            Value::Array(names) if !names.is_empty() => names.len(),
            _ => {
                return Err(PairwiseError::domain(
                    "correlation names metadata is not a non-empty array",
                ));
            }
        };
        let count = i8::try_from(count).map_err(|_| {
            PairwiseError::domain(format!("{count} correlations exceed the per-cluster limit"))
        })?;

        let mut extra = Map::new();
        extra.insert(CORRELATIONS_KEY.to_string(), correlation_names.clone());
        self.inner.initialize(
            gene_names,
            max_cluster_size,
            i32::from(count),
            vec![count as u8],
            extra,
        )
    }

    pub fn matrix(&self) -> &PairwiseMatrix<f32> {
        &self.inner
    }

    pub fn gene_size(&self) -> i32 {
        self.inner.gene_size()
    }

    pub fn max_cluster_size(&self) -> i32 {
        self.inner.max_cluster_size()
    }

    pub fn correlation_size(&self) -> usize {
        self.inner.width()
    }

    pub fn correlation_names(&self) -> Option<&Vec<Value>> {
        self.inner.metadata().get(CORRELATIONS_KEY)?.as_array()
    }

    pub fn new_pair(&self, index: PairIndex) -> Pair<f32> {
        self.inner.new_pair(index)
    }

    pub fn write(&mut self, pair: &Pair<f32>) -> Result<(), PairwiseError> {
        self.inner.write(pair)
    }

    pub fn read(&self, index: PairIndex) -> Result<Pair<f32>, PairwiseError> {
        self.inner.read(index)
    }

    pub fn cursor(&self) -> PairCursor<'_, f32> {
        self.inner.cursor()
    }

    pub fn finish(&mut self) -> Result<(), PairwiseError> {
        self.inner.finish()
    }

    /// Dense `genes x genes x max_clusters` buffer of the first correlation of every
    /// stored cluster, mirrored across the diagonal. Cells with no stored cluster are 0.
    pub fn dump_raw_data(&self) -> Result<Vec<f32>, PairwiseError> {
        let genes = self.gene_size().max(0) as usize;
        let clusters = self.max_cluster_size().max(0) as usize;
        let mut data = vec![0.0f32; genes * genes * clusters];

        for pair in self.cursor() {
            let pair = pair?;
            let (x, y) = (pair.index().x() as usize, pair.index().y() as usize);
            for (k, cluster) in pair.clusters().enumerate() {
                let value = cluster.first().copied().unwrap_or(f32::NAN);
                data[x * genes * clusters + y * clusters + k] = value;
                data[y * genes * clusters + x * clusters + k] = value;
            }
        }
        Ok(data)
    }

    // --- Table access ---

    pub fn row_count(&self) -> usize {
        self.gene_size().max(0) as usize
    }

    pub fn column_count(&self) -> usize {
        self.row_count()
    }

    pub fn header_data(&self, section: usize) -> Option<String> {
        self.inner.gene_name(section)
    }

    /// Rendered cell. The diagonal is always `1`.
    pub fn data(&self, row: usize, column: usize) -> Result<String, PairwiseError> {
        if row >= self.row_count() || column >= self.column_count() {
            return Err(PairwiseError::domain(format!(
                "cell ({row}, {column}) is outside a {0}x{0} table",
                self.row_count()
            )));
        }
        if row == column {
            return Ok("1".to_string());
        }
        let index = PairIndex::from_genes(row as i32, column as i32)?;
        Ok(self.read(index)?.to_string())
    }
}

impl fmt::Display for Pair<f32> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buffer = ryu::Buffer::new();
        for (n, value) in self.clusters().flatten().enumerate() {
            if n > 0 {
                f.write_str(",")?;
            }
            f.write_str(buffer.format(*value))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{Rng, SeedableRng, rngs::StdRng};
    use serde_json::json;
    use std::error::Error;
    use tempfile::tempdir;

    const GENES: usize = 10;
    const MAX_CLUSTERS: usize = 5;

    fn gene_names() -> Value {
        Value::Array((0..GENES).map(|g| json!(format!("gene{g}"))).collect())
    }

    #[test]
    fn random_pairs_survive_write_finish_and_reread() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("random.cmx");
        let mut rng = StdRng::seed_from_u64(7);

        // Random cluster count 0..=5 and correlations in [-1, 1] for every pair.
        let mut expected: Vec<(PairIndex, Vec<f32>)> = Vec::new();
        {
            let mut cmx = CorrelationMatrix::create(&path)?;
            cmx.initialize(&gene_names(), MAX_CLUSTERS as i32, &json!(["pearson"]))?;
            for index in super::super::PairRange::new(PairIndex::first(), 45) {
                let mut pair = cmx.new_pair(index);
                let clusters = rng.gen_range(0..=MAX_CLUSTERS);
                pair.add_cluster(clusters)?;
                let values: Vec<f32> = (0..clusters).map(|_| rng.gen_range(-1.0..=1.0)).collect();
                for (k, &v) in values.iter().enumerate() {
                    pair.set(k, 0, v);
                }
                cmx.write(&pair)?;
                if clusters > 0 {
                    expected.push((index, values));
                }
            }
            cmx.finish()?;
        }

        let cmx = CorrelationMatrix::open(&path)?;
        assert_eq!(cmx.correlation_size(), 1);
        assert_eq!(cmx.matrix().total_pairs(), expected.len() as i64);

        let mut cursor = cmx.cursor();
        for (index, values) in &expected {
            assert!(cursor.has_next());
            let pair = cursor.read_next()?;
            assert_eq!(pair.index(), *index);
            assert_eq!(pair.cluster_size(), values.len());
            for (k, v) in values.iter().enumerate() {
                assert_relative_eq!(pair.get(k, 0).unwrap(), *v);
            }
        }
        assert!(!cursor.has_next());
        Ok(())
    }

    #[test]
    fn new_clusters_are_nan_and_pairs_render_comma_joined() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let mut cmx = CorrelationMatrix::create(&dir.path().join("r.cmx"))?;
        cmx.initialize(&gene_names(), 5, &json!(["pearson"]))?;
        let mut pair = cmx.new_pair(PairIndex::new(4, 2)?);
        pair.add_cluster(2)?;
        assert!(pair.get(1, 0).unwrap().is_nan());
        pair.set(0, 0, 0.5);
        pair.set(1, 0, -0.75);
        assert_eq!(pair.to_string(), "0.5,-0.75");
        Ok(())
    }

    #[test]
    fn dump_is_symmetric_and_zero_filled() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let mut cmx = CorrelationMatrix::create(&dir.path().join("d.cmx"))?;
        cmx.initialize(&gene_names(), 3, &json!(["spearman"]))?;
        let mut pair = cmx.new_pair(PairIndex::new(7, 3)?);
        pair.add_cluster(2)?;
        pair.set(0, 0, 0.9);
        pair.set(1, 0, -0.6);
        cmx.write(&pair)?;
        cmx.finish()?;

        let (g, m) = (GENES, 3);
        let dump = cmx.dump_raw_data()?;
        assert_eq!(dump.len(), g * g * m);
        for k in 0..2 {
            assert_eq!(dump[7 * g * m + 3 * m + k], dump[3 * g * m + 7 * m + k]);
        }
        assert_relative_eq!(dump[7 * g * m + 3 * m], 0.9);
        assert_relative_eq!(dump[3 * g * m + 7 * m + 1], -0.6);
        let nonzero = dump.iter().filter(|v| **v != 0.0).count();
        assert_eq!(nonzero, 4);
        Ok(())
    }

    #[test]
    fn table_view_renders_diagonal_and_symmetric_cells() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let mut cmx = CorrelationMatrix::create(&dir.path().join("t.cmx"))?;
        cmx.initialize(&gene_names(), 2, &json!(["pearson"]))?;
        let mut pair = cmx.new_pair(PairIndex::new(2, 1)?);
        pair.add_cluster(1)?;
        pair.set(0, 0, 0.25);
        cmx.write(&pair)?;

        assert_eq!(cmx.header_data(2).as_deref(), Some("gene2"));
        assert_eq!(cmx.data(4, 4)?, "1");
        assert_eq!(cmx.data(1, 2)?, "0.25");
        assert_eq!(cmx.data(2, 1)?, "0.25");
        assert_eq!(cmx.data(3, 0)?, "");
        assert!(cmx.data(0, GENES).is_err());
        Ok(())
    }

    #[test]
    fn rejects_missing_correlation_names() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let mut cmx = CorrelationMatrix::create(&dir.path().join("e.cmx"))?;
        let err = cmx.initialize(&gene_names(), 5, &json!({})).unwrap_err();
        assert!(err.to_string().starts_with("Domain Error"));
        Ok(())
    }
}
