//! CUDA device for the block pipeline.
//!
//! Kernels are compiled at start-up with NVRTC from `kernels/similarity.c` and the CUDA
//! prelude. Every slot owns a stream, so the uploads, kernels and downloads of different
//! blocks overlap; completion is observed through events recorded on that stream.

use crate::device::{
    ComputeDevice, DeviceError, DeviceEvent, checked_i32, checked_mul_usize, next_power_of_two,
};
use crate::kernel::KernelParams;
use crate::kernel_sources::{CUDA_PRELUDE, SIMILARITY};
use crate::pairwise::PairIndex;
use crate::types::PairResult;
use cudarc::driver::{
    CudaContext, CudaEvent, CudaFunction, CudaSlice, CudaStream, DriverError, LaunchConfig,
    PushKernelArg,
};
use cudarc::nvrtc::compile_ptx;
use log::debug;
use std::sync::Arc;

const DEVICE: &str = "CUDA";
/// Floats per mixture component in the kernels' scratch layout.
const COMPONENT_FLOATS: usize = 10;

fn map_driver_err(context: &'static str) -> impl FnOnce(DriverError) -> DeviceError {
    move |e| DeviceError::Driver {
        device: DEVICE,
        context,
        detail: format!("{e:?}"),
    }
}

pub struct CudaDevice {
    ctx: Arc<CudaContext>,
    params: KernelParams,
    expressions: CudaSlice<f32>,
    fetch_pair: CudaFunction,
    cluster_pairs: CudaFunction,
    correlate_pairs: CudaFunction,
    sort_size: usize,
}

impl CudaDevice {
    pub fn new(expressions: Arc<Vec<f32>>, params: KernelParams) -> Result<Self, DeviceError> {
        let ctx = CudaContext::new(0).map_err(|e| DeviceError::Init {
            device: DEVICE,
            detail: format!("{e:?}"),
        })?;
        ctx.bind_to_thread()
            .map_err(map_driver_err("Failed to bind CUDA context"))?;

        let stream = ctx.default_stream();
        let d_expressions = stream
            .clone_htod(expressions.as_slice())
            .map_err(map_driver_err("Failed to upload expression matrix"))?;
        stream
            .synchronize()
            .map_err(map_driver_err("Failed to synchronize expression upload"))?;

        let source = format!("{CUDA_PRELUDE}\n{SIMILARITY}");
        let ptx = compile_ptx(source).map_err(|e| DeviceError::Compile {
            device: DEVICE,
            log: format!("{e:?}"),
        })?;
        let module = ctx
            .load_module(ptx)
            .map_err(map_driver_err("Failed to load CUDA module"))?;
        let fetch_pair = module
            .load_function("fetch_pair")
            .map_err(map_driver_err("Failed to load fetch_pair kernel"))?;
        let cluster_pairs = module
            .load_function("cluster_pairs")
            .map_err(map_driver_err("Failed to load cluster_pairs kernel"))?;
        let correlate_pairs = module
            .load_function("correlate_pairs")
            .map_err(map_driver_err("Failed to load correlate_pairs kernel"))?;

        debug!(
            "CUDA device ready: {} expression values resident",
            expressions.len()
        );
        Ok(Self {
            ctx,
            params,
            expressions: d_expressions,
            fetch_pair,
            cluster_pairs,
            correlate_pairs,
            sort_size: next_power_of_two(params.sample_size),
        })
    }
}

pub struct CudaSlot {
    stream: Arc<CudaStream>,
    capacity: usize,
    count: usize,
    host_pairs: Vec<i32>,
    pairs: CudaSlice<i32>,
    work_xy: CudaSlice<f32>,
    work_n: CudaSlice<i32>,
    work_labels: CudaSlice<i8>,
    work_best: CudaSlice<i8>,
    work_gamma: CudaSlice<f32>,
    work_components: CudaSlice<f32>,
    work_sorted: CudaSlice<f32>,
    work_keys: CudaSlice<f32>,
    work_index: CudaSlice<i32>,
    out_k: CudaSlice<i8>,
    out_labels: CudaSlice<i8>,
    out_correlations: CudaSlice<f32>,
    host_k: Vec<i8>,
    host_labels: Vec<i8>,
    host_correlations: Vec<f32>,
}

pub struct CudaDeviceEvent(CudaEvent);

impl DeviceEvent for CudaDeviceEvent {
    fn is_complete(&self) -> Result<bool, DeviceError> {
        Ok(self.0.is_complete())
    }
}

fn record(stream: &CudaStream, context: &'static str) -> Result<CudaDeviceEvent, DeviceError> {
    stream
        .record_event(None)
        .map(CudaDeviceEvent)
        .map_err(map_driver_err(context))
}

impl ComputeDevice for CudaDevice {
    type Slot = CudaSlot;
    type Event = CudaDeviceEvent;

    fn name(&self) -> &'static str {
        "cuda"
    }

    fn create_slot(&mut self, capacity: usize) -> Result<CudaSlot, DeviceError> {
        let n = self.params.sample_size;
        let k = self.params.max_clusters;
        let slots = self.params.cluster_slots();
        let per = |label: &'static str, width: usize| checked_mul_usize(label, width, capacity);

        let stream = self
            .ctx
            .new_stream()
            .map_err(map_driver_err("Failed to create CUDA stream"))?;
        macro_rules! zeros {
            ($t:ty, $len:expr, $what:literal) => {
                stream
                    .alloc_zeros::<$t>($len)
                    .map_err(map_driver_err(concat!("Failed to allocate ", $what)))?
            };
        }

        let pairs = zeros!(i32, per("pairs", 2)?, "pair buffer");
        let work_xy = zeros!(f32, per("work_xy", checked_mul_usize("work_xy", 2, n)?)?, "point buffer");
        let work_n = zeros!(i32, capacity, "point counts");
        let work_labels = zeros!(i8, per("work_labels", n)?, "candidate labels");
        let work_best = zeros!(i8, per("work_best", n)?, "best labels");
        let work_gamma = zeros!(f32, per("work_gamma", checked_mul_usize("work_gamma", n, k)?)?, "responsibilities");
        let work_components = zeros!(f32, per("work_components", k * COMPONENT_FLOATS)?, "components");
        let work_sorted = zeros!(f32, per("work_sorted", checked_mul_usize("work_sorted", 2, n)?)?, "sort buffer");
        let work_keys = zeros!(f32, per("work_keys", self.sort_size)?, "rank keys");
        let work_index = zeros!(i32, per("work_index", self.sort_size)?, "rank indices");
        let out_k = zeros!(i8, capacity, "cluster counts");
        let out_labels = zeros!(i8, per("out_labels", n)?, "sample labels");
        let out_correlations = zeros!(f32, per("out_correlations", slots)?, "correlations");

        Ok(CudaSlot {
            stream,
            capacity,
            count: 0,
            host_pairs: Vec::with_capacity(2 * capacity),
            pairs,
            work_xy,
            work_n,
            work_labels,
            work_best,
            work_gamma,
            work_components,
            work_sorted,
            work_keys,
            work_index,
            out_k,
            out_labels,
            out_correlations,
            host_k: vec![0; capacity],
            host_labels: vec![0; capacity * n],
            host_correlations: vec![0.0; capacity * slots],
        })
    }

    fn upload(&mut self, slot: &mut CudaSlot, pairs: &[PairIndex]) -> Result<CudaDeviceEvent, DeviceError> {
        if pairs.len() > slot.capacity {
            return Err(DeviceError::Capacity {
                count: pairs.len(),
                capacity: slot.capacity,
            });
        }
        slot.count = pairs.len();
        slot.host_pairs.clear();
        for pair in pairs {
            slot.host_pairs.push(pair.x());
            slot.host_pairs.push(pair.y());
        }
        let len = slot.host_pairs.len();
        slot.stream
            .memcpy_htod(&slot.host_pairs[..len], &mut slot.pairs.slice_mut(0..len))
            .map_err(map_driver_err("Failed to upload pair indices"))?;
        record(&slot.stream, "Failed to record upload event")
    }

    fn launch(&mut self, slot: &mut CudaSlot) -> Result<CudaDeviceEvent, DeviceError> {
        let p = self.params;
        let count = checked_i32("count", slot.count)?;
        let sample_size = checked_i32("sample_size", p.sample_size)?;
        let min_samples = checked_i32("min_samples", p.min_samples)?;
        let min_clusters = checked_i32("min_clusters", p.min_clusters)?;
        let max_clusters = checked_i32("max_clusters", p.max_clusters)?;
        let cluster_slots = checked_i32("cluster_slots", p.cluster_slots())?;
        let sort_size = checked_i32("sort_size", self.sort_size)?;
        let clustering = p.clustering.code();
        let criterion = p.criterion.code();
        let correlation = p.correlation.code();
        let pre = i32::from(p.remove_pre_outliers);
        let post = i32::from(p.remove_post_outliers);
        let config = LaunchConfig::for_num_elems(slot.count as u32);

        unsafe {
            slot.stream
                .launch_builder(&self.fetch_pair)
                .arg(&count)
                .arg(&sample_size)
                .arg(&p.min_expression)
                .arg(&self.expressions)
                .arg(&slot.pairs)
                .arg(&mut slot.work_xy)
                .arg(&mut slot.work_n)
                .arg(&mut slot.out_labels)
                .launch(config)
        }
        .map_err(map_driver_err("Failed to launch fetch_pair"))?;

        unsafe {
            slot.stream
                .launch_builder(&self.cluster_pairs)
                .arg(&count)
                .arg(&sample_size)
                .arg(&min_samples)
                .arg(&min_clusters)
                .arg(&max_clusters)
                .arg(&clustering)
                .arg(&criterion)
                .arg(&pre)
                .arg(&post)
                .arg(&self.expressions)
                .arg(&slot.pairs)
                .arg(&mut slot.work_xy)
                .arg(&mut slot.work_n)
                .arg(&mut slot.work_labels)
                .arg(&mut slot.work_best)
                .arg(&mut slot.work_gamma)
                .arg(&mut slot.work_components)
                .arg(&mut slot.work_sorted)
                .arg(&mut slot.out_k)
                .arg(&mut slot.out_labels)
                .launch(config)
        }
        .map_err(map_driver_err("Failed to launch cluster_pairs"))?;

        unsafe {
            slot.stream
                .launch_builder(&self.correlate_pairs)
                .arg(&count)
                .arg(&sample_size)
                .arg(&cluster_slots)
                .arg(&min_samples)
                .arg(&correlation)
                .arg(&sort_size)
                .arg(&self.expressions)
                .arg(&slot.pairs)
                .arg(&slot.out_k)
                .arg(&slot.out_labels)
                .arg(&mut slot.work_xy)
                .arg(&mut slot.work_sorted)
                .arg(&mut slot.work_keys)
                .arg(&mut slot.work_index)
                .arg(&mut slot.out_correlations)
                .launch(config)
        }
        .map_err(map_driver_err("Failed to launch correlate_pairs"))?;

        record(&slot.stream, "Failed to record kernel event")
    }

    fn download(&mut self, slot: &mut CudaSlot) -> Result<CudaDeviceEvent, DeviceError> {
        let n = self.params.sample_size;
        let slots = self.params.cluster_slots();
        let count = slot.count;
        slot.stream
            .memcpy_dtoh(&slot.out_k.slice(0..count), &mut slot.host_k[..count])
            .map_err(map_driver_err("Failed to download cluster counts"))?;
        slot.stream
            .memcpy_dtoh(&slot.out_labels.slice(0..count * n), &mut slot.host_labels[..count * n])
            .map_err(map_driver_err("Failed to download sample labels"))?;
        slot.stream
            .memcpy_dtoh(
                &slot.out_correlations.slice(0..count * slots),
                &mut slot.host_correlations[..count * slots],
            )
            .map_err(map_driver_err("Failed to download correlations"))?;
        record(&slot.stream, "Failed to record download event")
    }

    fn collect(&mut self, slot: &mut CudaSlot, out: &mut Vec<PairResult>) -> Result<(), DeviceError> {
        let n = self.params.sample_size;
        let slots = self.params.cluster_slots();
        for i in 0..slot.count {
            out.push(PairResult {
                k: slot.host_k[i],
                labels: slot.host_labels[i * n..(i + 1) * n].to_vec(),
                correlations: slot.host_correlations[i * slots..(i + 1) * slots].to_vec(),
            });
        }
        Ok(())
    }
}
