//! A [`ComputeDevice`] whose "device" is the rayon pool.
//!
//! Launches are fire-and-forget `rayon::spawn` jobs, so the block pipeline overlaps
//! batches exactly as it does on a GPU. Upload and download are plain memory moves and
//! complete immediately.

use crate::device::{ComputeDevice, DeviceError, DeviceEvent};
use crate::kernel::{KernelParams, PairKernel, gene_row};
use crate::pairwise::PairIndex;
use crate::types::PairResult;
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

const DEVICE: &str = "host";

pub struct HostDevice {
    expressions: Arc<Vec<f32>>,
    params: KernelParams,
}

impl HostDevice {
    /// `expressions` is the gene-major matrix, `params.sample_size` values per gene.
    pub fn new(expressions: Arc<Vec<f32>>, params: KernelParams) -> Self {
        Self { expressions, params }
    }
}

/// Shared between a slot and the job computing its batch.
#[derive(Default)]
pub struct Launch {
    done: AtomicBool,
    results: Mutex<Vec<PairResult>>,
}

pub struct HostSlot {
    capacity: usize,
    pairs: Vec<PairIndex>,
    launch: Option<Arc<Launch>>,
}

pub enum HostEvent {
    Ready,
    Pending(Arc<Launch>),
}

impl DeviceEvent for HostEvent {
    fn is_complete(&self) -> Result<bool, DeviceError> {
        Ok(match self {
            Self::Ready => true,
            Self::Pending(launch) => launch.done.load(Ordering::Acquire),
        })
    }
}

impl ComputeDevice for HostDevice {
    type Slot = HostSlot;
    type Event = HostEvent;

    fn name(&self) -> &'static str {
        DEVICE
    }

    fn create_slot(&mut self, capacity: usize) -> Result<HostSlot, DeviceError> {
        Ok(HostSlot {
            capacity,
            pairs: Vec::with_capacity(capacity),
            launch: None,
        })
    }

    fn upload(&mut self, slot: &mut HostSlot, pairs: &[PairIndex]) -> Result<HostEvent, DeviceError> {
        if pairs.len() > slot.capacity {
            return Err(DeviceError::Capacity {
                count: pairs.len(),
                capacity: slot.capacity,
            });
        }
        slot.pairs.clear();
        slot.pairs.extend_from_slice(pairs);
        Ok(HostEvent::Ready)
    }

    fn launch(&mut self, slot: &mut HostSlot) -> Result<HostEvent, DeviceError> {
        let launch = Arc::new(Launch::default());
        let job = Arc::clone(&launch);
        let pairs = std::mem::take(&mut slot.pairs);
        let expressions = Arc::clone(&self.expressions);
        let params = self.params;

        rayon::spawn(move || {
            let n = params.sample_size;
            let results: Vec<PairResult> = pairs
                .par_iter()
                .map_init(
                    || PairKernel::new(params),
                    |kernel, pair| {
                        kernel.compute(
                            gene_row(&expressions, n, pair.x()),
                            gene_row(&expressions, n, pair.y()),
                        )
                    },
                )
                .collect();
            if let Ok(mut guard) = job.results.lock() {
                *guard = results;
            }
            job.done.store(true, Ordering::Release);
        });

        slot.launch = Some(Arc::clone(&launch));
        Ok(HostEvent::Pending(launch))
    }

    fn download(&mut self, _slot: &mut HostSlot) -> Result<HostEvent, DeviceError> {
        Ok(HostEvent::Ready)
    }

    fn collect(&mut self, slot: &mut HostSlot, out: &mut Vec<PairResult>) -> Result<(), DeviceError> {
        let launch = slot.launch.take().ok_or(DeviceError::Driver {
            device: DEVICE,
            context: "collect",
            detail: "no launch in flight for this slot".to_string(),
        })?;
        let mut results = launch.results.lock().map_err(|_| DeviceError::Driver {
            device: DEVICE,
            context: "collect",
            detail: "kernel job panicked".to_string(),
        })?;
        out.append(&mut results);
        Ok(())
    }
}
