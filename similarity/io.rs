use log::info;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExpressionError {
    #[error("failed to read expression matrix {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{path}: line {line} has {found} values, expected {expected}")]
    RowLength {
        path: PathBuf,
        line: u64,
        found: usize,
        expected: usize,
    },
    #[error("{path}: line {line}, sample {sample}: '{value}' is not a number")]
    Value {
        path: PathBuf,
        line: u64,
        sample: usize,
        value: String,
    },
    #[error("expression matrix needs at least {min} {what}, found {found}")]
    TooSmall {
        what: &'static str,
        min: usize,
        found: usize,
    },
    #[error("expression values length {found} does not match {genes} genes x {samples} samples")]
    Shape {
        genes: usize,
        samples: usize,
        found: usize,
    },
}

/// Read-only gene expression input. NaN marks a missing value.
pub trait ExpressionSource: Sync {
    fn gene_size(&self) -> usize;
    fn sample_size(&self) -> usize;
    fn gene_names(&self) -> &[String];
    fn sample_names(&self) -> &[String];
    /// Expression of `gene` across all samples.
    fn read(&self, gene: usize) -> &[f32];
    /// All values, gene-major.
    fn dump_raw_data(&self) -> Vec<f32>;
}

/// A fully in-memory expression matrix.
#[derive(Clone, Debug)]
pub struct ExpressionMatrix {
    genes: Vec<String>,
    samples: Vec<String>,
    values: Vec<f32>,
}

impl ExpressionMatrix {
    pub fn new(
        genes: Vec<String>,
        samples: Vec<String>,
        values: Vec<f32>,
    ) -> Result<Self, ExpressionError> {
        if samples.is_empty() {
            return Err(ExpressionError::TooSmall {
                what: "sample",
                min: 1,
                found: 0,
            });
        }
        if values.len() != genes.len() * samples.len() {
            return Err(ExpressionError::Shape {
                genes: genes.len(),
                samples: samples.len(),
                found: values.len(),
            });
        }
        Ok(Self {
            genes,
            samples,
            values,
        })
    }

    /// Loads a tab-separated matrix: a header row of sample names (the first cell is
    /// ignored), then one row per gene with its name followed by one value per sample.
    /// `NA`, `NaN` and empty cells are missing values.
    pub fn from_tsv(path: &Path) -> Result<Self, ExpressionError> {
        let csv_err = |source| ExpressionError::Csv {
            path: path.to_path_buf(),
            source,
        };
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .flexible(true)
            .from_path(path)
            .map_err(csv_err)?;

        let samples: Vec<String> = reader
            .headers()
            .map_err(csv_err)?
            .iter()
            .skip(1)
            .map(str::to_string)
            .collect();

        let mut genes = Vec::new();
        let mut values = Vec::new();
        for record in reader.records() {
            let record = record.map_err(csv_err)?;
            let line = record.position().map_or(0, |p| p.line());
            if record.len() != samples.len() + 1 {
                return Err(ExpressionError::RowLength {
                    path: path.to_path_buf(),
                    line,
                    found: record.len().saturating_sub(1),
                    expected: samples.len(),
                });
            }
            genes.push(record[0].to_string());
            for (sample, cell) in record.iter().skip(1).enumerate() {
                values.push(parse_value(cell).ok_or_else(|| ExpressionError::Value {
                    path: path.to_path_buf(),
                    line,
                    sample,
                    value: cell.to_string(),
                })?);
            }
        }

        info!(
            "loaded {} genes x {} samples from {}",
            genes.len(),
            samples.len(),
            path.display()
        );
        Self::new(genes, samples, values)
    }
}

fn parse_value(cell: &str) -> Option<f32> {
    let cell = cell.trim();
    if cell.is_empty() || cell.eq_ignore_ascii_case("na") || cell.eq_ignore_ascii_case("nan") {
        return Some(f32::NAN);
    }
    cell.parse().ok()
}

impl ExpressionSource for ExpressionMatrix {
    fn gene_size(&self) -> usize {
        self.genes.len()
    }

    fn sample_size(&self) -> usize {
        self.samples.len()
    }

    fn gene_names(&self) -> &[String] {
        &self.genes
    }

    fn sample_names(&self) -> &[String] {
        &self.samples
    }

    fn read(&self, gene: usize) -> &[f32] {
        let n = self.samples.len();
        &self.values[gene * n..(gene + 1) * n]
    }

    fn dump_raw_data(&self) -> Vec<f32> {
        self.values.clone()
    }
}
