use crate::clustering::{ClusteringMethod, Criterion};
use crate::correlate::CorrelationMethod;
use crate::pairwise::MAX_CLUSTER_SIZE;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

// --- Defaults ---

const DEFAULT_MIN_SAMPLES: usize = 30;
const DEFAULT_MIN_CLUSTERS: u8 = 1;
const DEFAULT_MAX_CLUSTERS: u8 = 5;
const DEFAULT_MIN_CORRELATION: f32 = 0.5;
const DEFAULT_MAX_CORRELATION: f32 = 1.0;
/// Pairs per work unit handed to a worker.
const DEFAULT_WORK_BLOCK_SIZE: usize = 32_768;
/// Pairs per device launch.
const DEFAULT_KERNEL_SIZE: usize = 4096;
/// Device blocks kept in flight per worker.
const DEFAULT_BLOCK_COUNT: usize = 4;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse configuration {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to encode configuration: {0}")]
    Encode(#[from] toml::ser::Error),
    #[error("minimum clusters ({min}) exceeds maximum clusters ({max})")]
    ClusterRange { min: u8, max: u8 },
    #[error("minimum correlation ({min}) exceeds maximum correlation ({max})")]
    CorrelationRange { min: f32, max: f32 },
    #[error("{name} = {value} is outside {allowed}")]
    OutOfRange {
        name: &'static str,
        value: String,
        allowed: &'static str,
    },
}

/// Where pair computations run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// One pair at a time on the calling thread.
    #[default]
    Serial,
    /// The block pipeline with kernels running on the rayon pool.
    Host,
    Cuda,
    OpenCl,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Serial => "serial",
            Self::Host => "host",
            Self::Cuda => "cuda",
            Self::OpenCl => "opencl",
        })
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s.to_ascii_lowercase().as_str() {
            "serial" => Ok(Self::Serial),
            "host" => Ok(Self::Host),
            "cuda" => Ok(Self::Cuda),
            "opencl" => Ok(Self::OpenCl),
            other => Err(format!("unknown backend '{other}'")),
        }
    }
}

/// Every tunable of the similarity analytic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimilarityConfig {
    pub clustering: ClusteringMethod,
    pub correlation: CorrelationMethod,
    /// Samples with either expression below this are excluded.
    pub min_expression: f32,
    /// Fewest usable samples for a pair, and for a cluster, to be correlated.
    pub min_samples: usize,
    pub min_clusters: u8,
    pub max_clusters: u8,
    pub criterion: Criterion,
    pub remove_pre_outliers: bool,
    pub remove_post_outliers: bool,
    /// Inclusive bounds on `|correlation|` for a cluster to be stored.
    pub min_correlation: f32,
    pub max_correlation: f32,
    pub backend: BackendKind,
    pub work_block_size: usize,
    pub kernel_size: usize,
    pub block_count: usize,
    /// Concurrent workers; each owns one backend instance.
    pub workers: usize,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            clustering: ClusteringMethod::None,
            correlation: CorrelationMethod::Pearson,
            min_expression: f32::NEG_INFINITY,
            min_samples: DEFAULT_MIN_SAMPLES,
            min_clusters: DEFAULT_MIN_CLUSTERS,
            max_clusters: DEFAULT_MAX_CLUSTERS,
            criterion: Criterion::Icl,
            remove_pre_outliers: false,
            remove_post_outliers: false,
            min_correlation: DEFAULT_MIN_CORRELATION,
            max_correlation: DEFAULT_MAX_CORRELATION,
            backend: BackendKind::Serial,
            work_block_size: DEFAULT_WORK_BLOCK_SIZE,
            kernel_size: DEFAULT_KERNEL_SIZE,
            block_count: DEFAULT_BLOCK_COUNT,
            workers: 1,
        }
    }
}

impl SimilarityConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let max_k = MAX_CLUSTER_SIZE as u8;
        if !(1..=max_k).contains(&self.min_clusters) {
            return Err(out_of_range("min_clusters", self.min_clusters, "[1, 64]"));
        }
        if !(1..=max_k).contains(&self.max_clusters) {
            return Err(out_of_range("max_clusters", self.max_clusters, "[1, 64]"));
        }
        if self.min_clusters > self.max_clusters {
            return Err(ConfigError::ClusterRange {
                min: self.min_clusters,
                max: self.max_clusters,
            });
        }
        if !(0.0..=1.0).contains(&self.min_correlation) {
            return Err(out_of_range("min_correlation", self.min_correlation, "[0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.max_correlation) {
            return Err(out_of_range("max_correlation", self.max_correlation, "[0, 1]"));
        }
        if self.min_correlation > self.max_correlation {
            return Err(ConfigError::CorrelationRange {
                min: self.min_correlation,
                max: self.max_correlation,
            });
        }
        if self.min_expression.is_nan() {
            return Err(out_of_range("min_expression", self.min_expression, "a number or -inf"));
        }
        for (name, value) in [
            ("min_samples", self.min_samples),
            ("work_block_size", self.work_block_size),
            ("kernel_size", self.kernel_size),
            ("block_count", self.block_count),
            ("workers", self.workers),
        ] {
            if value == 0 {
                return Err(out_of_range(name, value, "[1, inf)"));
            }
        }
        if self.min_samples > i32::MAX as usize || self.kernel_size > i32::MAX as usize {
            return Err(out_of_range("min_samples/kernel_size", self.min_samples.max(self.kernel_size), "i32 range"));
        }
        Ok(())
    }
}

fn out_of_range(name: &'static str, value: impl fmt::Display, allowed: &'static str) -> ConfigError {
    ConfigError::OutOfRange {
        name,
        value: value.to_string(),
        allowed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use tempfile::tempdir;

    #[test]
    fn defaults_are_valid() {
        let config = SimilarityConfig::default();
        config.validate().unwrap();
        assert_eq!(config.min_samples, 30);
        assert_eq!((config.min_clusters, config.max_clusters), (1, 5));
        assert_eq!(config.criterion, Criterion::Icl);
        assert!(config.min_expression.is_infinite() && config.min_expression < 0.0);
    }

    #[test]
    fn partial_toml_overrides_defaults() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("kinc.toml");
        std::fs::write(
            &path,
            "clustering = \"gmm\"\ncorrelation = \"spearman\"\ncriterion = \"BIC\"\nmin_correlation = 0.7\nremove_post_outliers = true\n",
        )?;
        let config = SimilarityConfig::load(&path)?;
        assert_eq!(config.clustering, ClusteringMethod::Gmm);
        assert_eq!(config.correlation, CorrelationMethod::Spearman);
        assert_eq!(config.criterion, Criterion::Bic);
        assert_eq!(config.min_correlation, 0.7);
        assert!(config.remove_post_outliers);
        assert_eq!(config.kernel_size, 4096);
        Ok(())
    }

    #[test]
    fn round_trips_through_toml() -> Result<(), Box<dyn Error>> {
        let config = SimilarityConfig {
            clustering: ClusteringMethod::KMeans,
            min_expression: 0.5,
            backend: BackendKind::Host,
            ..SimilarityConfig::default()
        };
        let text = config.to_toml()?;
        assert_eq!(toml::from_str::<SimilarityConfig>(&text)?, config);
        Ok(())
    }

    #[test]
    fn unknown_keys_are_rejected() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("kinc.toml");
        std::fs::write(&path, "bsize = 4\n")?;
        assert!(matches!(
            SimilarityConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
        Ok(())
    }

    #[test]
    fn validation_catches_inverted_ranges() {
        let inverted = SimilarityConfig {
            min_clusters: 4,
            max_clusters: 2,
            ..SimilarityConfig::default()
        };
        assert!(matches!(
            inverted.validate(),
            Err(ConfigError::ClusterRange { min: 4, max: 2 })
        ));

        let correlation = SimilarityConfig {
            min_correlation: 0.9,
            max_correlation: 0.2,
            ..SimilarityConfig::default()
        };
        assert!(matches!(
            correlation.validate(),
            Err(ConfigError::CorrelationRange { .. })
        ));

        let zero_kernel = SimilarityConfig {
            kernel_size: 0,
            ..SimilarityConfig::default()
        };
        assert!(zero_kernel.validate().is_err());

        let too_many = SimilarityConfig {
            max_clusters: 65,
            ..SimilarityConfig::default()
        };
        assert!(too_many.validate().is_err());
    }
}
