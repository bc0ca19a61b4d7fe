use crate::io::ExpressionSource;
use crate::kernel::{KernelParams, PairKernel};
use crate::pipeline::{PipelineError, Worker};
use crate::types::{ResultBlock, WorkBlock};
use std::sync::atomic::{AtomicBool, Ordering};

/// Computes one pair at a time on the calling thread, reading expression rows straight
/// from the source.
pub struct SerialWorker<'a, S: ExpressionSource + ?Sized> {
    source: &'a S,
    kernel: PairKernel,
}

impl<'a, S: ExpressionSource + ?Sized> SerialWorker<'a, S> {
    pub fn new(source: &'a S, params: KernelParams) -> Self {
        Self {
            source,
            kernel: PairKernel::new(params),
        }
    }
}

impl<S: ExpressionSource + ?Sized> Worker for SerialWorker<'_, S> {
    fn name(&self) -> &'static str {
        "serial"
    }

    fn compute(
        &mut self,
        work: &WorkBlock,
        interrupt: &AtomicBool,
    ) -> Result<Option<ResultBlock>, PipelineError> {
        let mut output = ResultBlock::new(work);
        for pair in work.pairs()? {
            if interrupt.load(Ordering::Relaxed) {
                return Ok(None);
            }
            let x = self.source.read(pair.x() as usize);
            let y = self.source.read(pair.y() as usize);
            output.pairs.push(self.kernel.compute(x, y));
        }
        Ok(Some(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimilarityConfig;
    use crate::io::ExpressionMatrix;

    #[test]
    fn computes_every_pair_of_the_unit() -> Result<(), Box<dyn std::error::Error>> {
        let genes: Vec<String> = (0..5).map(|g| format!("g{g}")).collect();
        let samples: Vec<String> = (0..8).map(|s| format!("s{s}")).collect();
        let values: Vec<f32> = (0..40).map(|i| (i % 8) as f32 * (1.0 + (i / 8) as f32)).collect();
        let matrix = ExpressionMatrix::new(genes, samples, values)?;
        let config = SimilarityConfig {
            min_samples: 4,
            ..SimilarityConfig::default()
        };

        let mut worker = SerialWorker::new(&matrix, KernelParams::new(&config, 8));
        let work = WorkBlock {
            index: 1,
            start: 3,
            size: 7,
        };
        let result = worker
            .compute(&work, &AtomicBool::new(false))?
            .ok_or("unexpected interruption")?;
        assert_eq!(result.pairs.len(), 7);
        // Every gene is a positive multiple of the same profile.
        for pair in &result.pairs {
            assert_eq!(pair.k, 1);
            assert!((pair.correlations[0] - 1.0).abs() < 1e-5);
        }

        assert!(worker.compute(&work, &AtomicBool::new(true))?.is_none());
        Ok(())
    }
}
