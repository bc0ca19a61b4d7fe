use crate::blocks::{BlockPipeline, CommitGate};
use crate::config::{BackendKind, ConfigError, SimilarityConfig};
use crate::device::DeviceError;
use crate::host_backend::HostDevice;
use crate::io::{ExpressionError, ExpressionSource};
use crate::kernel::KernelParams;
use crate::pairwise::{CCMatrix, CorrelationMatrix, PairwiseError, total_pairs};
use crate::serial::SerialWorker;
use crate::types::{ResultBlock, WorkBlock};
use crossbeam_channel::bounded;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info};
use serde_json::Value;
use std::io::IsTerminal;
#[cfg(any(feature = "cuda", feature = "opencl"))]
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use thiserror::Error;

// ========================================================================================
//                          Public API, context & error handling
// ========================================================================================

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Pairwise(#[from] PairwiseError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Expression(#[from] ExpressionError),
    #[error("{0} is not set")]
    Unset(&'static str),
    #[error("worker {0} panicked")]
    WorkerPanic(usize),
}

/// Anything that can turn a work unit into a result unit.
pub trait Worker {
    fn name(&self) -> &'static str;

    /// Computes every pair of `work`, in order. Returns `Ok(None)` if `interrupt` was
    /// raised before the unit finished.
    fn compute(
        &mut self,
        work: &WorkBlock,
        interrupt: &AtomicBool,
    ) -> Result<Option<ResultBlock>, PipelineError>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Work units committed to the outputs.
    pub units: usize,
    /// Pairs stored in the correlation matrix.
    pub correlation_pairs: i64,
    /// Pairs stored in the cluster composition matrix.
    pub cluster_pairs: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(RunSummary),
    /// The interrupt flag was raised. Every unit before the first missing one was
    /// committed, so the outputs hold a valid prefix of the pair space.
    Interrupted(RunSummary),
}

// ========================================================================================
//                                   The orchestrator
// ========================================================================================

/// Computes clustered correlations for every gene pair of an expression matrix and
/// stores them in a [`CorrelationMatrix`] and a [`CCMatrix`].
pub struct Similarity<'a, S: ExpressionSource + ?Sized> {
    config: SimilarityConfig,
    input: Option<&'a S>,
    cmx: Option<CorrelationMatrix>,
    ccm: Option<CCMatrix>,
    total_pairs: i64,
}

impl<'a, S: ExpressionSource + ?Sized> Similarity<'a, S> {
    pub fn new(config: SimilarityConfig) -> Self {
        Self {
            config,
            input: None,
            cmx: None,
            ccm: None,
            total_pairs: 0,
        }
    }

    pub fn config(&self) -> &SimilarityConfig {
        &self.config
    }

    pub fn set_input(&mut self, input: &'a S) {
        self.input = Some(input);
    }

    pub fn set_outputs(&mut self, cmx: CorrelationMatrix, ccm: CCMatrix) {
        self.cmx = Some(cmx);
        self.ccm = Some(ccm);
    }

    pub fn cmx(&self) -> Option<&CorrelationMatrix> {
        self.cmx.as_ref()
    }

    pub fn ccm(&self) -> Option<&CCMatrix> {
        self.ccm.as_ref()
    }

    pub fn into_outputs(self) -> (Option<CorrelationMatrix>, Option<CCMatrix>) {
        (self.cmx, self.ccm)
    }

    fn input(&self) -> Result<&'a S, PipelineError> {
        self.input.ok_or(PipelineError::Unset("input expression matrix"))
    }

    /// Checks the configuration and that input and outputs are set.
    pub fn initialize(&mut self) -> Result<(), PipelineError> {
        let input = self.input()?;
        if self.cmx.is_none() {
            return Err(PipelineError::Unset("output correlation matrix"));
        }
        if self.ccm.is_none() {
            return Err(PipelineError::Unset("output cluster matrix"));
        }
        self.config.validate()?;
        if input.gene_size() < 2 {
            return Err(ExpressionError::TooSmall {
                what: "genes",
                min: 2,
                found: input.gene_size(),
            }
            .into());
        }
        self.total_pairs = total_pairs(input.gene_size() as i64);
        debug!(
            "similarity initialized: {} genes, {} samples, {} pairs",
            input.gene_size(),
            input.sample_size(),
            self.total_pairs
        );
        Ok(())
    }

    /// Writes the metadata both outputs need before any pair is written.
    pub fn initialize_outputs(&mut self) -> Result<(), PipelineError> {
        let input = self.input()?;
        let max_clusters = i32::from(self.config.max_clusters);
        let genes = names_value(input.gene_names());
        let samples = names_value(input.sample_names());
        let correlations = Value::Array(vec![Value::String(
            self.config.correlation.name().to_string(),
        )]);

        self.cmx
            .as_mut()
            .ok_or(PipelineError::Unset("output correlation matrix"))?
            .initialize(&genes, max_clusters, &correlations)?;
        self.ccm
            .as_mut()
            .ok_or(PipelineError::Unset("output cluster matrix"))?
            .initialize(&genes, max_clusters, &samples)?;
        Ok(())
    }

    pub fn total_pairs(&self) -> i64 {
        self.total_pairs
    }

    /// Number of work units covering the pair space.
    pub fn size(&self) -> usize {
        unit_count(self.total_pairs, self.config.work_block_size)
    }

    pub fn make_work(&self, index: usize) -> WorkBlock {
        work_unit(index, self.total_pairs, self.config.work_block_size)
    }

    /// Appends the qualifying clusters of every pair in `result` to the outputs.
    ///
    /// A cluster qualifies when its correlation is defined and its magnitude lies in
    /// `[min_correlation, max_correlation]`. Pairs with more than one cluster also get a
    /// composition record per qualifying cluster: `1` for member samples, `0` for
    /// samples of other clusters, and the magnitude of any exclusion code.
    pub fn process(&mut self, result: &ResultBlock) -> Result<(), PipelineError> {
        let (min, max) = (self.config.min_correlation, self.config.max_correlation);
        let cmx = self
            .cmx
            .as_mut()
            .ok_or(PipelineError::Unset("output correlation matrix"))?;
        let ccm = self
            .ccm
            .as_mut()
            .ok_or(PipelineError::Unset("output cluster matrix"))?;

        let mut qualifying = Vec::new();
        for (index, pair) in result.indices()? {
            let k = (pair.k.max(0) as usize).min(pair.correlations.len());
            if k == 0 {
                continue;
            }
            qualifying.clear();
            qualifying.extend((0..k).filter(|&c| {
                let r = pair.correlations[c];
                !r.is_nan() && (min..=max).contains(&r.abs())
            }));
            if qualifying.is_empty() {
                continue;
            }

            if k > 1 {
                let mut composition = ccm.new_pair(index);
                composition.add_cluster(qualifying.len())?;
                for (slot, &cluster) in qualifying.iter().enumerate() {
                    for (sample, &label) in pair.labels.iter().enumerate() {
                        let value = if label >= 0 {
                            i8::from(label as usize == cluster)
                        } else {
                            -label
                        };
                        composition.set(slot, sample, value);
                    }
                }
                ccm.write(&composition)?;
            }

            let mut correlations = cmx.new_pair(index);
            correlations.add_cluster(qualifying.len())?;
            for (slot, &cluster) in qualifying.iter().enumerate() {
                correlations.set(slot, 0, pair.correlations[cluster]);
            }
            cmx.write(&correlations)?;
        }
        Ok(())
    }

    /// Runs the analytic over every work unit, then seals both outputs.
    ///
    /// With one worker the units run inline. With several, each worker thread owns its
    /// own backend instance and results pass through a [`CommitGate`] so the outputs
    /// are still written in pair order.
    pub fn run(&mut self, interrupt: &AtomicBool) -> Result<RunOutcome, PipelineError> {
        let input = self.input()?;
        let units = self.size();
        let params = KernelParams::new(&self.config, input.sample_size());
        let backend = resolve_backend(self.config.backend, input, params)?;
        let workers = self.config.workers.clamp(1, units.max(1));
        info!(
            "computing {} pairs in {} units with {} {} worker(s)",
            self.total_pairs,
            units,
            workers,
            backend.name()
        );

        let pb = create_progress_bar(units as u64, "Computing pair similarity");
        let committed = if workers == 1 {
            self.run_inline(&backend, input, params, units, interrupt, &pb)?
        } else {
            self.run_pool(&backend, input, params, units, workers, interrupt, &pb)?
        };
        pb.finish_with_message("Done.");

        self.seal()?;
        let summary = RunSummary {
            units: committed,
            correlation_pairs: self.cmx.as_ref().map_or(0, |m| m.matrix().total_pairs()),
            cluster_pairs: self.ccm.as_ref().map_or(0, |m| m.matrix().total_pairs()),
        };
        Ok(if committed == units {
            RunOutcome::Completed(summary)
        } else {
            RunOutcome::Interrupted(summary)
        })
    }

    fn run_inline(
        &mut self,
        backend: &Backend,
        input: &'a S,
        params: KernelParams,
        units: usize,
        interrupt: &AtomicBool,
        pb: &ProgressBar,
    ) -> Result<usize, PipelineError> {
        let mut worker = build_worker(backend, input, params, &self.config)?;
        for index in 0..units {
            if interrupt.load(Ordering::Relaxed) {
                return Ok(index);
            }
            let work = self.make_work(index);
            match worker.compute(&work, interrupt)? {
                Some(result) => self.process(&result)?,
                None => return Ok(index),
            }
            pb.inc(1);
        }
        Ok(units)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_pool(
        &mut self,
        backend: &Backend,
        input: &'a S,
        params: KernelParams,
        units: usize,
        workers: usize,
        interrupt: &AtomicBool,
        pb: &ProgressBar,
    ) -> Result<usize, PipelineError> {
        let total = self.total_pairs;
        let unit_size = self.config.work_block_size;
        let config = self.config.clone();

        thread::scope(|scope| {
            let (work_tx, work_rx) = bounded::<WorkBlock>(workers * 2);
            let (result_tx, result_rx) =
                bounded::<(usize, Result<Option<ResultBlock>, PipelineError>)>(workers * 2);

            let mut handles = Vec::with_capacity(workers);
            for id in 0..workers {
                let work_rx = work_rx.clone();
                let result_tx = result_tx.clone();
                let config = &config;
                handles.push(scope.spawn(move || {
                    let mut worker = match build_worker(backend, input, params, config) {
                        Ok(worker) => worker,
                        Err(e) => {
                            let _ = result_tx.send((id, Err(e)));
                            return;
                        }
                    };
                    debug!("worker {id}: {} backend ready", worker.name());
                    for work in work_rx {
                        let result = worker.compute(&work, interrupt);
                        let keep_going = matches!(result, Ok(Some(_)));
                        if result_tx.send((id, result)).is_err() || !keep_going {
                            break;
                        }
                    }
                }));
            }
            drop(work_rx);
            drop(result_tx);

            scope.spawn(move || {
                for index in 0..units {
                    if interrupt.load(Ordering::Relaxed) {
                        break;
                    }
                    if work_tx.send(work_unit(index, total, unit_size)).is_err() {
                        break;
                    }
                }
            });

            let mut gate = CommitGate::new(0);
            for (id, message) in &result_rx {
                match message {
                    Ok(Some(block)) => {
                        let start = block.index as i64;
                        for ready in gate.offer(start, 1, block) {
                            self.process(&ready)?;
                            pb.inc(1);
                        }
                    }
                    Ok(None) => debug!("worker {id}: interrupted"),
                    Err(e) => return Err(e),
                }
            }
            drop(result_rx);

            for (id, handle) in handles.into_iter().enumerate() {
                if handle.join().is_err() {
                    return Err(PipelineError::WorkerPanic(id));
                }
            }
            Ok(gate.next_expected() as usize)
        })
    }

    fn seal(&mut self) -> Result<(), PipelineError> {
        if let Some(cmx) = self.cmx.as_mut() {
            cmx.finish()?;
        }
        if let Some(ccm) = self.ccm.as_mut() {
            ccm.finish()?;
        }
        Ok(())
    }
}

fn names_value(names: &[String]) -> Value {
    Value::Array(names.iter().cloned().map(Value::String).collect())
}

pub fn unit_count(total_pairs: i64, unit_size: usize) -> usize {
    let unit_size = unit_size.max(1) as i64;
    ((total_pairs.max(0) + unit_size - 1) / unit_size) as usize
}

pub fn work_unit(index: usize, total_pairs: i64, unit_size: usize) -> WorkBlock {
    let unit_size = unit_size.max(1) as i64;
    let start = index as i64 * unit_size;
    WorkBlock {
        index,
        start,
        size: unit_size.min(total_pairs - start).max(0),
    }
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    let style = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} units ({eta}) {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("█▉▊▋▌▍▎▏  ");
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb
}

// ========================================================================================
//                                  Backend selection
// ========================================================================================

/// A resolved backend. Device variants share one gene-major copy of the expression data.
enum Backend {
    Serial,
    Host(Arc<Vec<f32>>),
    #[cfg(feature = "cuda")]
    Cuda(Arc<Vec<f32>>),
    #[cfg(feature = "opencl")]
    OpenCl(Arc<Vec<f32>>),
}

impl Backend {
    fn name(&self) -> &'static str {
        match self {
            Self::Serial => "serial",
            Self::Host(_) => "host",
            #[cfg(feature = "cuda")]
            Self::Cuda(_) => "cuda",
            #[cfg(feature = "opencl")]
            Self::OpenCl(_) => "opencl",
        }
    }
}

fn resolve_backend<S: ExpressionSource + ?Sized>(
    kind: BackendKind,
    input: &S,
    params: KernelParams,
) -> Result<Backend, PipelineError> {
    let backend = match kind {
        BackendKind::Serial => Backend::Serial,
        BackendKind::Host => Backend::Host(Arc::new(input.dump_raw_data())),
        BackendKind::Cuda => resolve_cuda(Arc::new(input.dump_raw_data()), params),
        BackendKind::OpenCl => resolve_opencl(Arc::new(input.dump_raw_data()), params),
    };
    match &backend {
        Backend::Serial => eprintln!("> Backend: CPU (serial)"),
        Backend::Host(_) => eprintln!(
            "> Backend: CPU ({} rayon threads)",
            rayon::current_num_threads()
        ),
        #[cfg(feature = "cuda")]
        Backend::Cuda(_) => eprintln!("> Backend: CUDA"),
        #[cfg(feature = "opencl")]
        Backend::OpenCl(_) => eprintln!("> Backend: OpenCL"),
    }
    Ok(backend)
}

#[cfg(feature = "cuda")]
fn resolve_cuda(expressions: Arc<Vec<f32>>, params: KernelParams) -> Backend {
    let probe = Arc::clone(&expressions);
    match init_device_safely(|| crate::cuda_backend::CudaDevice::new(probe, params)) {
        Ok(_) => Backend::Cuda(expressions),
        Err(reason) => {
            eprintln!("> Backend: CPU fallback ({reason})");
            Backend::Host(expressions)
        }
    }
}

#[cfg(not(feature = "cuda"))]
fn resolve_cuda(expressions: Arc<Vec<f32>>, _params: KernelParams) -> Backend {
    eprintln!("> Backend: CPU fallback (built without the `cuda` feature)");
    Backend::Host(expressions)
}

#[cfg(feature = "opencl")]
fn resolve_opencl(expressions: Arc<Vec<f32>>, params: KernelParams) -> Backend {
    let probe = Arc::clone(&expressions);
    match init_device_safely(|| crate::opencl_backend::OpenClDevice::new(probe, params)) {
        Ok(_) => Backend::OpenCl(expressions),
        Err(reason) => {
            eprintln!("> Backend: CPU fallback ({reason})");
            Backend::Host(expressions)
        }
    }
}

#[cfg(not(feature = "opencl"))]
fn resolve_opencl(expressions: Arc<Vec<f32>>, _params: KernelParams) -> Backend {
    eprintln!("> Backend: CPU fallback (built without the `opencl` feature)");
    Backend::Host(expressions)
}

/// Driver libraries can panic when no device or runtime is present.
#[cfg(any(feature = "cuda", feature = "opencl"))]
fn init_device_safely<D>(init: impl FnOnce() -> Result<D, DeviceError>) -> Result<D, String> {
    match catch_unwind(AssertUnwindSafe(init)) {
        Ok(device) => device.map_err(|e| e.to_string()),
        Err(payload) => Err(format!(
            "device initialization panicked ({})",
            panic_payload_to_string(payload)
        )),
    }
}

#[cfg(any(feature = "cuda", feature = "opencl"))]
fn panic_payload_to_string(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return (*msg).to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "unknown panic payload".to_string()
}

fn build_worker<'a, S: ExpressionSource + ?Sized>(
    backend: &Backend,
    input: &'a S,
    params: KernelParams,
    config: &SimilarityConfig,
) -> Result<Box<dyn Worker + 'a>, PipelineError> {
    Ok(match backend {
        Backend::Serial => Box::new(SerialWorker::new(input, params)),
        Backend::Host(expressions) => Box::new(BlockPipeline::new(
            HostDevice::new(Arc::clone(expressions), params),
            config.block_count,
            config.kernel_size,
        )?),
        #[cfg(feature = "cuda")]
        Backend::Cuda(expressions) => Box::new(BlockPipeline::new(
            crate::cuda_backend::CudaDevice::new(Arc::clone(expressions), params)?,
            config.block_count,
            config.kernel_size,
        )?),
        #[cfg(feature = "opencl")]
        Backend::OpenCl(expressions) => Box::new(BlockPipeline::new(
            crate::opencl_backend::OpenClDevice::new(Arc::clone(expressions), params)?,
            config.block_count,
            config.kernel_size,
        )?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn units_cover_the_pair_space_exactly() {
        assert_eq!(unit_count(0, 10), 0);
        assert_eq!(unit_count(10, 10), 1);
        assert_eq!(unit_count(11, 10), 2);

        let total = 4950;
        let units = unit_count(total, 1000);
        assert_eq!(units, 5);
        let covered: i64 = (0..units).map(|i| work_unit(i, total, 1000).size).sum();
        assert_eq!(covered, total);
        let last = work_unit(4, total, 1000);
        assert_eq!((last.start, last.size), (4000, 950));
    }
}
