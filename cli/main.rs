#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use std::error::Error;
use std::fmt::Display;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use kinc::clustering::{ClusteringMethod, Criterion};
use kinc::config::{BackendKind, SimilarityConfig};
use kinc::correlate::CorrelationMethod;
use kinc::io::ExpressionMatrix;
use kinc::pairwise::{CCMatrix, ClusterElement, CorrelationMatrix, Pair, PairCursor};
use kinc::pipeline::{PipelineError, RunOutcome, Similarity};

#[derive(Clone, Copy, ValueEnum)]
pub enum ClusteringCli {
    None,
    Kmeans,
    Gmm,
}

impl From<ClusteringCli> for ClusteringMethod {
    fn from(value: ClusteringCli) -> Self {
        match value {
            ClusteringCli::None => ClusteringMethod::None,
            ClusteringCli::Kmeans => ClusteringMethod::KMeans,
            ClusteringCli::Gmm => ClusteringMethod::Gmm,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum CriterionCli {
    Bic,
    Icl,
}

impl From<CriterionCli> for Criterion {
    fn from(value: CriterionCli) -> Self {
        match value {
            CriterionCli::Bic => Criterion::Bic,
            CriterionCli::Icl => Criterion::Icl,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum CorrelationCli {
    Pearson,
    Spearman,
}

impl From<CorrelationCli> for CorrelationMethod {
    fn from(value: CorrelationCli) -> Self {
        match value {
            CorrelationCli::Pearson => CorrelationMethod::Pearson,
            CorrelationCli::Spearman => CorrelationMethod::Spearman,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum BackendCli {
    Serial,
    Host,
    Cuda,
    Opencl,
}

impl From<BackendCli> for BackendKind {
    fn from(value: BackendCli) -> Self {
        match value {
            BackendCli::Serial => BackendKind::Serial,
            BackendCli::Host => BackendKind::Host,
            BackendCli::Cuda => BackendKind::Cuda,
            BackendCli::Opencl => BackendKind::OpenCl,
        }
    }
}

#[derive(Args)]
pub struct SimilarityArgs {
    /// Tab-separated expression matrix: sample names on the first line, then one gene per line
    pub input: PathBuf,

    /// Output correlation matrix (.cmx)
    #[arg(long)]
    pub cmx: PathBuf,

    /// Output cluster composition matrix (.ccm)
    #[arg(long)]
    pub ccm: PathBuf,

    /// TOML file with analytic settings; flags below override its values
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long, value_enum)]
    pub clustering: Option<ClusteringCli>,

    #[arg(long, value_enum)]
    pub correlation: Option<CorrelationCli>,

    /// Model selection criterion for the clustering methods
    #[arg(long, value_enum)]
    pub criterion: Option<CriterionCli>,

    /// Samples with either expression below this value are excluded
    #[arg(long, allow_hyphen_values = true)]
    pub min_expression: Option<f32>,

    /// Fewest usable samples for a pair or cluster to be correlated
    #[arg(long)]
    pub min_samples: Option<usize>,

    #[arg(long)]
    pub min_clusters: Option<u8>,

    #[arg(long)]
    pub max_clusters: Option<u8>,

    /// Remove Tukey-fence outliers before clustering
    #[arg(long)]
    pub pre_outliers: bool,

    /// Remove Tukey-fence outliers from each cluster after clustering
    #[arg(long)]
    pub post_outliers: bool,

    /// Smallest |correlation| stored
    #[arg(long)]
    pub min_corr: Option<f32>,

    /// Largest |correlation| stored
    #[arg(long)]
    pub max_corr: Option<f32>,

    #[arg(long, value_enum)]
    pub backend: Option<BackendCli>,

    /// Concurrent workers (0 uses one per logical CPU)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Pairs per work unit
    #[arg(long)]
    pub work_block_size: Option<usize>,

    /// Pairs per device launch
    #[arg(long)]
    pub kernel_size: Option<usize>,

    /// Device blocks kept in flight per worker
    #[arg(long)]
    pub block_count: Option<usize>,

    /// Stop handing out work after this many seconds; outputs keep every finished unit
    #[arg(long, value_name = "SECONDS")]
    pub time_limit: Option<f64>,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum DumpFormat {
    /// One line per stored pair: gene names followed by the rendered clusters
    Pairs,
    /// Full symmetric gene x gene table
    Table,
}

#[derive(Args)]
pub struct DumpArgs {
    /// A .cmx or .ccm file written by `kinc similarity`
    pub matrix: PathBuf,

    #[arg(long, value_enum, default_value_t = DumpFormat::Pairs)]
    pub format: DumpFormat,
}

#[derive(Parser)]
#[command(
    name = "kinc",
    about = "Pairwise gene similarity: clustering, correlation and sparse pairwise matrices",
    long_about = "Computes clustered correlations for every pair of genes in an expression \
                 matrix and stores them in sparse correlation and cluster composition matrices."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Compute pairwise similarity (outputs: .cmx and .ccm)")]
    Similarity(SimilarityArgs),
    #[command(about = "Print the contents of a stored pairwise matrix")]
    Dump(DumpArgs),
    #[command(about = "Display version information")]
    Version,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();
    let result = match command {
        Some(Commands::Similarity(args)) => run_similarity(args),
        Some(Commands::Dump(args)) => run_dump(args),
        Some(Commands::Version) => {
            println!("kinc {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn build_config(args: &SimilarityArgs) -> Result<SimilarityConfig, Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => SimilarityConfig::load(path)?,
        None => SimilarityConfig::default(),
    };
    if let Some(v) = args.clustering {
        config.clustering = v.into();
    }
    if let Some(v) = args.correlation {
        config.correlation = v.into();
    }
    if let Some(v) = args.criterion {
        config.criterion = v.into();
    }
    if let Some(v) = args.min_expression {
        config.min_expression = v;
    }
    if let Some(v) = args.min_samples {
        config.min_samples = v;
    }
    if let Some(v) = args.min_clusters {
        config.min_clusters = v;
    }
    if let Some(v) = args.max_clusters {
        config.max_clusters = v;
    }
    config.remove_pre_outliers |= args.pre_outliers;
    config.remove_post_outliers |= args.post_outliers;
    if let Some(v) = args.min_corr {
        config.min_correlation = v;
    }
    if let Some(v) = args.max_corr {
        config.max_correlation = v;
    }
    if let Some(v) = args.backend {
        config.backend = v.into();
    }
    if let Some(v) = args.workers {
        config.workers = if v == 0 { num_cpus::get() } else { v };
    }
    if let Some(v) = args.work_block_size {
        config.work_block_size = v;
    }
    if let Some(v) = args.kernel_size {
        config.kernel_size = v;
    }
    if let Some(v) = args.block_count {
        config.block_count = v;
    }
    config.validate()?;
    Ok(config)
}

fn run_similarity(args: SimilarityArgs) -> Result<(), Box<dyn Error>> {
    let config = build_config(&args)?;
    eprintln!("> Loading expression matrix from {}", args.input.display());
    let input = ExpressionMatrix::from_tsv(&args.input)?;

    let mut analytic: Similarity<'_, ExpressionMatrix> = Similarity::new(config);
    analytic.set_input(&input);
    analytic.set_outputs(
        CorrelationMatrix::create(&args.cmx)?,
        CCMatrix::create(&args.ccm)?,
    );
    analytic.initialize()?;
    analytic.initialize_outputs()?;

    let limit = args.time_limit.map(Duration::try_from_secs_f64).transpose()?;
    match run_with_time_limit(&mut analytic, limit)? {
        RunOutcome::Completed(summary) => eprintln!(
            "> Done: {} correlation pairs written to {}, {} cluster pairs written to {}",
            summary.correlation_pairs,
            args.cmx.display(),
            summary.cluster_pairs,
            args.ccm.display()
        ),
        RunOutcome::Interrupted(summary) => eprintln!(
            "> Interrupted after {} work units; outputs hold {} correlation pairs",
            summary.units, summary.correlation_pairs
        ),
    }
    Ok(())
}

/// Runs the analytic, raising its interrupt flag once `limit` has elapsed.
fn run_with_time_limit(
    analytic: &mut Similarity<'_, ExpressionMatrix>,
    limit: Option<Duration>,
) -> Result<RunOutcome, PipelineError> {
    let interrupt = AtomicBool::new(false);
    let finished = AtomicBool::new(false);
    thread::scope(|scope| {
        match limit {
            Some(limit) if limit.is_zero() => interrupt.store(true, Ordering::Relaxed),
            Some(limit) => {
                let deadline = Instant::now() + limit;
                let (interrupt, finished) = (&interrupt, &finished);
                scope.spawn(move || {
                    while !finished.load(Ordering::Relaxed) {
                        let now = Instant::now();
                        if now >= deadline {
                            eprintln!("> Time limit reached; finishing work in flight");
                            interrupt.store(true, Ordering::Relaxed);
                            break;
                        }
                        thread::sleep((deadline - now).min(Duration::from_millis(100)));
                    }
                });
            }
            None => {}
        }
        let outcome = analytic.run(&interrupt);
        finished.store(true, Ordering::Relaxed);
        outcome
    })
}

fn run_dump(args: DumpArgs) -> Result<(), Box<dyn Error>> {
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    if is_ccm(&args.matrix) {
        let matrix = CCMatrix::open(&args.matrix)?;
        eprintln!(
            "> {}: {} genes, {} samples, {} stored pairs",
            args.matrix.display(),
            matrix.gene_size(),
            matrix.sample_size(),
            matrix.matrix().total_pairs()
        );
        match args.format {
            DumpFormat::Pairs => write_pairs(&mut out, matrix.cursor(), |g| matrix.header_data(g))?,
            DumpFormat::Table => write_table(
                &mut out,
                matrix.row_count(),
                |g| matrix.header_data(g),
                |r, c| matrix.data(r, c),
            )?,
        }
    } else {
        let matrix = CorrelationMatrix::open(&args.matrix)?;
        eprintln!(
            "> {}: {} genes, {} stored pairs, {} clusters",
            args.matrix.display(),
            matrix.gene_size(),
            matrix.matrix().total_pairs(),
            matrix.matrix().total_clusters()
        );
        match args.format {
            DumpFormat::Pairs => write_pairs(&mut out, matrix.cursor(), |g| matrix.header_data(g))?,
            DumpFormat::Table => write_table(
                &mut out,
                matrix.row_count(),
                |g| matrix.header_data(g),
                |r, c| matrix.data(r, c),
            )?,
        }
    }
    out.flush()?;
    Ok(())
}

fn is_ccm(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("ccm"))
}

fn gene_label(name: Option<String>, gene: usize) -> String {
    name.unwrap_or_else(|| gene.to_string())
}

fn write_pairs<E, W>(
    out: &mut W,
    cursor: PairCursor<'_, E>,
    names: impl Fn(usize) -> Option<String>,
) -> Result<(), Box<dyn Error>>
where
    E: ClusterElement,
    Pair<E>: Display,
    W: Write,
{
    for pair in cursor {
        let pair = pair?;
        let index = pair.index();
        writeln!(
            out,
            "{}\t{}\t{}\t{}",
            gene_label(names(index.x() as usize), index.x() as usize),
            gene_label(names(index.y() as usize), index.y() as usize),
            pair.cluster_size(),
            pair
        )?;
    }
    Ok(())
}

fn write_table<W: Write, F, D>(
    out: &mut W,
    genes: usize,
    names: F,
    data: D,
) -> Result<(), Box<dyn Error>>
where
    F: Fn(usize) -> Option<String>,
    D: Fn(usize, usize) -> Result<String, kinc::pairwise::PairwiseError>,
{
    for column in 0..genes {
        write!(out, "\t{}", gene_label(names(column), column))?;
    }
    writeln!(out)?;
    for row in 0..genes {
        write!(out, "{}", gene_label(names(row), row))?;
        for column in 0..genes {
            write!(out, "\t{}", data(row, column)?)?;
        }
        writeln!(out)?;
    }
    Ok(())
}
