use super::index::PairIndex;
use super::matrix::{Pair, PairCursor, PairwiseMatrix};
use super::PairwiseError;
use crate::shared::files::Record;
use serde_json::{Map, Value};
use std::fmt;
use std::path::Path;

pub const SAMPLES_KEY: &str = "samples";
/// Subheader: number of samples, as an `i32`.
const SUBHEADER_SIZE: usize = 4;

/// Per-pair cluster composition: for every cluster, one byte per sample.
///
/// A byte is `1` when the sample belongs to the cluster, `0` when it belongs to another
/// cluster, or a positive exclusion code (6 below minimum expression, 7 pre-clustering
/// outlier, 8 post-clustering outlier, 9 missing).
pub struct CCMatrix {
    inner: PairwiseMatrix<i8>,
}

impl CCMatrix {
    pub fn create(path: &Path) -> Result<Self, PairwiseError> {
        Ok(Self {
            inner: PairwiseMatrix::create(path)?,
        })
    }

    pub fn open(path: &Path) -> Result<Self, PairwiseError> {
        let inner = PairwiseMatrix::open(path, SUBHEADER_SIZE)?;
        let matrix = Self { inner };
        if matrix.sample_size() as i64 != matrix.inner.width() as i64 {
            return Err(PairwiseError::Format {
                path: path.display().to_string(),
                detail: "sample count does not match record width".to_string(),
            });
        }
        Ok(matrix)
    }

    /// `sample_names` must be a non-empty array.
    pub fn initialize(
        &mut self,
        gene_names: &Value,
        max_cluster_size: i32,
        sample_names: &Value,
    ) -> Result<(), PairwiseError> {
        let count = match sample_names {
            Value::Array(names) if !names.is_empty() => names.len(),
            _ => {
                return Err(PairwiseError::domain(
                    "sample names metadata is not a non-empty array",
                ));
            }
        };
        let count = i32::try_from(count)
            .map_err(|_| PairwiseError::domain(format!("{count} samples exceed i32 range")))?;

        let mut subheader = Vec::with_capacity(SUBHEADER_SIZE);
        count.encode(&mut subheader);
        let mut extra = Map::new();
        extra.insert(SAMPLES_KEY.to_string(), sample_names.clone());
        self.inner
            .initialize(gene_names, max_cluster_size, count, subheader, extra)
    }

    pub fn matrix(&self) -> &PairwiseMatrix<i8> {
        &self.inner
    }

    pub fn gene_size(&self) -> i32 {
        self.inner.gene_size()
    }

    pub fn max_cluster_size(&self) -> i32 {
        self.inner.max_cluster_size()
    }

    pub fn sample_size(&self) -> i32 {
        let sub = self.inner.subheader();
        if sub.len() < SUBHEADER_SIZE {
            0
        } else {
            i32::decode(sub)
        }
    }

    pub fn sample_names(&self) -> Result<&Vec<Value>, PairwiseError> {
        self.inner
            .metadata()
            .get(SAMPLES_KEY)
            .and_then(Value::as_array)
            .ok_or_else(|| {
                PairwiseError::null_reference(format!(
                    "matrix metadata has no `{SAMPLES_KEY}` array"
                ))
            })
    }

    pub fn new_pair(&self, index: PairIndex) -> Pair<i8> {
        self.inner.new_pair(index)
    }

    pub fn write(&mut self, pair: &Pair<i8>) -> Result<(), PairwiseError> {
        self.inner.write(pair)
    }

    pub fn read(&self, index: PairIndex) -> Result<Pair<i8>, PairwiseError> {
        self.inner.read(index)
    }

    pub fn cursor(&self) -> PairCursor<'_, i8> {
        self.inner.cursor()
    }

    pub fn finish(&mut self) -> Result<(), PairwiseError> {
        self.inner.finish()
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

    /// Rendered cell. A gene paired with itself includes every sample.
    pub fn data(&self, row: usize, column: usize) -> Result<String, PairwiseError> {
        if row >= self.row_count() || column >= self.column_count() {
            return Err(PairwiseError::domain(format!(
                "cell ({row}, {column}) is outside a {0}x{0} table",
                self.row_count()
            )));
        }
        if row == column {
            return Ok("(1)".to_string());
        }
        let index = PairIndex::from_genes(row as i32, column as i32)?;
        Ok(self.read(index)?.to_string())
    }
}

impl fmt::Display for Pair<i8> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("(")?;
            for _ in 0..self.width() {
                f.write_str("1")?;
            }
            return f.write_str(")");
        }
        for (k, cluster) in self.clusters().enumerate() {
            if k > 0 {
                f.write_str(",")?;
            }
            f.write_str("(")?;
            // One hex digit per sample; codes outside 0..=15 are dropped.
            for &code in cluster {
                if (0..16).contains(&code) {
                    write!(f, "{:X}", code)?;
                }
            }
            f.write_str(")")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::error::Error;
    use tempfile::tempdir;

    fn names(prefix: &str, n: usize) -> Value {
        Value::Array((0..n).map(|i| json!(format!("{prefix}{i}"))).collect())
    }

    #[test]
    fn sample_masks_round_trip_through_a_reopened_file() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("m.ccm");
        let masks: [[i8; 6]; 2] = [[1, 0, 1, 9, 6, 1], [0, 1, 0, 9, 6, 8]];
        {
            let mut ccm = CCMatrix::create(&path)?;
            ccm.initialize(&names("g", 4), 5, &names("s", 6))?;
            let mut pair = ccm.new_pair(PairIndex::new(3, 0)?);
            pair.add_cluster(2)?;
            assert_eq!(pair.cluster(1), Some(&[0i8; 6][..]));
            for (k, mask) in masks.iter().enumerate() {
                pair.cluster_mut(k).unwrap().copy_from_slice(mask);
            }
            ccm.write(&pair)?;
            ccm.finish()?;
        }

        let ccm = CCMatrix::open(&path)?;
        assert_eq!(ccm.sample_size(), 6);
        assert_eq!(ccm.sample_names()?.len(), 6);
        let pair = ccm.read(PairIndex::new(3, 0)?)?;
        assert_eq!(pair.cluster(0), Some(&masks[0][..]));
        assert_eq!(pair.cluster(1), Some(&masks[1][..]));
        assert_eq!(pair.to_string(), "(101961),(010968)");
        Ok(())
    }

    #[test]
    fn codes_render_as_single_uppercase_digits() {
        let mut pair: Pair<i8> = Pair::new(PairIndex::first(), 6, 2);
        pair.add_cluster(1).unwrap();
        pair.cluster_mut(0)
            .unwrap()
            .copy_from_slice(&[10, 15, 1, 16, -3, 12]);
        assert_eq!(pair.to_string(), "(AF1C)");
    }

    #[test]
    fn empty_and_diagonal_cells_render_as_fully_included() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let mut ccm = CCMatrix::create(&dir.path().join("m.ccm"))?;
        ccm.initialize(&names("g", 3), 5, &names("s", 4))?;
        assert_eq!(ccm.data(1, 1)?, "(1)");
        assert_eq!(ccm.data(2, 0)?, "(1111)");
        assert_eq!(ccm.header_data(0).as_deref(), Some("g0"));
        Ok(())
    }

    #[test]
    fn sample_names_must_be_a_non_empty_array() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let mut ccm = CCMatrix::create(&dir.path().join("m.ccm"))?;
        for bad in [json!([]), json!("samples"), json!(3)] {
            let err = ccm.initialize(&names("g", 3), 5, &bad).unwrap_err();
            assert!(err.to_string().starts_with("Domain Error"), "{err}");
        }
        Ok(())
    }

    #[test]
    fn missing_sample_metadata_is_a_null_reference() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let mut ccm = CCMatrix::create(&dir.path().join("m.ccm"))?;
        let err = ccm.sample_names().unwrap_err();
        assert!(err.to_string().starts_with("Null Return Reference"));
        ccm.initialize(&names("g", 3), 5, &names("s", 2))?;
        assert!(ccm.sample_names().is_ok());
        Ok(())
    }
}
