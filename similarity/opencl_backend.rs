//! OpenCL device for the block pipeline.
//!
//! The first GPU (or, failing that, any device) is used. Every slot owns an in-order
//! command queue; all transfers are non-blocking and completion is polled through the
//! event of the last command of each stage.

use crate::device::{
    ComputeDevice, DeviceError, DeviceEvent, checked_i32, checked_mul_usize, next_power_of_two,
};
use crate::kernel::KernelParams;
use crate::kernel_sources::{OPENCL_PRELUDE, SIMILARITY};
use crate::pairwise::PairIndex;
use crate::types::PairResult;
use log::debug;
use opencl3::command_queue::CommandQueue;
use opencl3::context::Context;
use opencl3::device::{CL_DEVICE_TYPE_ALL, CL_DEVICE_TYPE_GPU, Device, get_all_devices};
use opencl3::error_codes::ClError;
use opencl3::event::{CL_COMPLETE, Event};
use opencl3::kernel::{ExecuteKernel, Kernel};
use opencl3::memory::{Buffer, CL_MEM_READ_ONLY, CL_MEM_READ_WRITE};
use opencl3::program::Program;
use opencl3::types::{CL_BLOCKING, CL_NON_BLOCKING, cl_char, cl_float, cl_int};
use std::ptr;
use std::sync::Arc;

const DEVICE: &str = "OpenCL";
const COMPONENT_FLOATS: usize = 10;

fn map_cl_err(context: &'static str) -> impl FnOnce(ClError) -> DeviceError {
    move |e| DeviceError::Driver {
        device: DEVICE,
        context,
        detail: e.to_string(),
    }
}

pub struct OpenClDevice {
    context: Context,
    params: KernelParams,
    expressions: Buffer<cl_float>,
    fetch_pair: Kernel,
    cluster_pairs: Kernel,
    correlate_pairs: Kernel,
    sort_size: usize,
}

impl OpenClDevice {
    pub fn new(expressions: Arc<Vec<f32>>, params: KernelParams) -> Result<Self, DeviceError> {
        let init = |detail: String| DeviceError::Init {
            device: DEVICE,
            detail,
        };
        let gpu_ids = get_all_devices(CL_DEVICE_TYPE_GPU).unwrap_or_default();
        let id = match gpu_ids.first() {
            Some(&id) => id,
            None => *get_all_devices(CL_DEVICE_TYPE_ALL)
                .map_err(|e| init(e.to_string()))?
                .first()
                .ok_or_else(|| init("no OpenCL devices found".to_string()))?,
        };
        let device = Device::new(id);
        let context = Context::from_device(&device).map_err(|e| init(e.to_string()))?;

        let source = format!("{OPENCL_PRELUDE}\n{SIMILARITY}");
        let program = Program::create_and_build_from_source(&context, &source, "")
            .map_err(|log| DeviceError::Compile { device: DEVICE, log })?;
        let fetch_pair =
            Kernel::create(&program, "fetch_pair").map_err(map_cl_err("Failed to create fetch_pair"))?;
        let cluster_pairs = Kernel::create(&program, "cluster_pairs")
            .map_err(map_cl_err("Failed to create cluster_pairs"))?;
        let correlate_pairs = Kernel::create(&program, "correlate_pairs")
            .map_err(map_cl_err("Failed to create correlate_pairs"))?;

        let mut d_expressions = unsafe {
            Buffer::<cl_float>::create(&context, CL_MEM_READ_ONLY, expressions.len().max(1), ptr::null_mut())
                .map_err(map_cl_err("Failed to allocate expression matrix"))?
        };
        #[allow(deprecated)]
        let queue = CommandQueue::create_default(&context, 0)
            .map_err(map_cl_err("Failed to create command queue"))?;
        let write = unsafe {
            queue
                .enqueue_write_buffer(&mut d_expressions, CL_BLOCKING, 0, expressions.as_slice(), &[])
                .map_err(map_cl_err("Failed to upload expression matrix"))?
        };
        write
            .wait()
            .map_err(map_cl_err("Failed to wait for expression upload"))?;

        debug!(
            "OpenCL device {} ready: {} expression values resident",
            device.name().unwrap_or_default().trim(),
            expressions.len()
        );
        Ok(Self {
            context,
            params,
            expressions: d_expressions,
            fetch_pair,
            cluster_pairs,
            correlate_pairs,
            sort_size: next_power_of_two(params.sample_size),
        })
    }

    fn buffer<T>(&self, len: usize, what: &'static str) -> Result<Buffer<T>, DeviceError> {
        unsafe {
            Buffer::<T>::create(&self.context, CL_MEM_READ_WRITE, len.max(1), ptr::null_mut())
                .map_err(map_cl_err(what))
        }
    }
}

pub struct OpenClSlot {
    queue: CommandQueue,
    capacity: usize,
    count: usize,
    host_pairs: Vec<cl_int>,
    pairs: Buffer<cl_int>,
    work_xy: Buffer<cl_float>,
    work_n: Buffer<cl_int>,
    work_labels: Buffer<cl_char>,
    work_best: Buffer<cl_char>,
    work_gamma: Buffer<cl_float>,
    work_components: Buffer<cl_float>,
    work_sorted: Buffer<cl_float>,
    work_keys: Buffer<cl_float>,
    work_index: Buffer<cl_int>,
    out_k: Buffer<cl_char>,
    out_labels: Buffer<cl_char>,
    out_correlations: Buffer<cl_float>,
    host_k: Vec<cl_char>,
    host_labels: Vec<cl_char>,
    host_correlations: Vec<cl_float>,
}

pub struct OpenClEvent(Event);

impl DeviceEvent for OpenClEvent {
    fn is_complete(&self) -> Result<bool, DeviceError> {
        let status = self
            .0
            .command_execution_status()
            .map_err(map_cl_err("Failed to query event status"))?;
        if status.0 < 0 {
            return Err(DeviceError::Driver {
                device: DEVICE,
                context: "command failed",
                detail: format!("execution status {}", status.0),
            });
        }
        Ok(status.0 == CL_COMPLETE)
    }
}

impl ComputeDevice for OpenClDevice {
    type Slot = OpenClSlot;
    type Event = OpenClEvent;

    fn name(&self) -> &'static str {
        "opencl"
    }

    fn create_slot(&mut self, capacity: usize) -> Result<OpenClSlot, DeviceError> {
        let n = self.params.sample_size;
        let k = self.params.max_clusters;
        let slots = self.params.cluster_slots();
        let per = |label: &'static str, width: usize| checked_mul_usize(label, width, capacity);

        #[allow(deprecated)]
        let queue = CommandQueue::create_default(&self.context, 0)
            .map_err(map_cl_err("Failed to create command queue"))?;

        Ok(OpenClSlot {
            queue,
            capacity,
            count: 0,
            host_pairs: Vec::with_capacity(2 * capacity),
            pairs: self.buffer(per("pairs", 2)?, "Failed to allocate pair buffer")?,
            work_xy: self.buffer(per("work_xy", 2 * n)?, "Failed to allocate point buffer")?,
            work_n: self.buffer(capacity, "Failed to allocate point counts")?,
            work_labels: self.buffer(per("work_labels", n)?, "Failed to allocate candidate labels")?,
            work_best: self.buffer(per("work_best", n)?, "Failed to allocate best labels")?,
            work_gamma: self.buffer(
                per("work_gamma", checked_mul_usize("work_gamma", n, k)?)?,
                "Failed to allocate responsibilities",
            )?,
            work_components: self.buffer(
                per("work_components", k * COMPONENT_FLOATS)?,
                "Failed to allocate components",
            )?,
            work_sorted: self.buffer(per("work_sorted", 2 * n)?, "Failed to allocate sort buffer")?,
            work_keys: self.buffer(per("work_keys", self.sort_size)?, "Failed to allocate rank keys")?,
            work_index: self.buffer(per("work_index", self.sort_size)?, "Failed to allocate rank indices")?,
            out_k: self.buffer(capacity, "Failed to allocate cluster counts")?,
            out_labels: self.buffer(per("out_labels", n)?, "Failed to allocate sample labels")?,
            out_correlations: self.buffer(per("out_correlations", slots)?, "Failed to allocate correlations")?,
            host_k: vec![0; capacity],
            host_labels: vec![0; capacity * n],
            host_correlations: vec![0.0; capacity * slots],
        })
    }

    fn upload(&mut self, slot: &mut OpenClSlot, pairs: &[PairIndex]) -> Result<OpenClEvent, DeviceError> {
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
        let event = unsafe {
            slot.queue
                .enqueue_write_buffer(&mut slot.pairs, CL_NON_BLOCKING, 0, &slot.host_pairs, &[])
                .map_err(map_cl_err("Failed to upload pair indices"))?
        };
        slot.queue.flush().map_err(map_cl_err("Failed to flush queue"))?;
        Ok(OpenClEvent(event))
    }

    fn launch(&mut self, slot: &mut OpenClSlot) -> Result<OpenClEvent, DeviceError> {
        let p = self.params;
        let count = checked_i32("count", slot.count)?;
        let sample_size = checked_i32("sample_size", p.sample_size)?;
        let min_samples = checked_i32("min_samples", p.min_samples)?;
        let min_clusters = checked_i32("min_clusters", p.min_clusters)?;
        let max_clusters = checked_i32("max_clusters", p.max_clusters)?;
        let cluster_slots = checked_i32("cluster_slots", p.cluster_slots())?;
        let sort_size = checked_i32("sort_size", self.sort_size)?;
        let clustering: cl_int = p.clustering.code();
        let criterion: cl_int = p.criterion.code();
        let correlation: cl_int = p.correlation.code();
        let pre = cl_int::from(p.remove_pre_outliers);
        let post = cl_int::from(p.remove_post_outliers);
        let min_expression: cl_float = p.min_expression;

        unsafe {
            ExecuteKernel::new(&self.fetch_pair)
                .set_arg(&count)
                .set_arg(&sample_size)
                .set_arg(&min_expression)
                .set_arg(&self.expressions)
                .set_arg(&slot.pairs)
                .set_arg(&slot.work_xy)
                .set_arg(&slot.work_n)
                .set_arg(&slot.out_labels)
                .set_global_work_size(slot.count)
                .enqueue_nd_range(&slot.queue)
                .map_err(map_cl_err("Failed to enqueue fetch_pair"))?;

            ExecuteKernel::new(&self.cluster_pairs)
                .set_arg(&count)
                .set_arg(&sample_size)
                .set_arg(&min_samples)
                .set_arg(&min_clusters)
                .set_arg(&max_clusters)
                .set_arg(&clustering)
                .set_arg(&criterion)
                .set_arg(&pre)
                .set_arg(&post)
                .set_arg(&self.expressions)
                .set_arg(&slot.pairs)
                .set_arg(&slot.work_xy)
                .set_arg(&slot.work_n)
                .set_arg(&slot.work_labels)
                .set_arg(&slot.work_best)
                .set_arg(&slot.work_gamma)
                .set_arg(&slot.work_components)
                .set_arg(&slot.work_sorted)
                .set_arg(&slot.out_k)
                .set_arg(&slot.out_labels)
                .set_global_work_size(slot.count)
                .enqueue_nd_range(&slot.queue)
                .map_err(map_cl_err("Failed to enqueue cluster_pairs"))?;
        }

        let event = unsafe {
            ExecuteKernel::new(&self.correlate_pairs)
                .set_arg(&count)
                .set_arg(&sample_size)
                .set_arg(&cluster_slots)
                .set_arg(&min_samples)
                .set_arg(&correlation)
                .set_arg(&sort_size)
                .set_arg(&self.expressions)
                .set_arg(&slot.pairs)
                .set_arg(&slot.out_k)
                .set_arg(&slot.out_labels)
                .set_arg(&slot.work_xy)
                .set_arg(&slot.work_sorted)
                .set_arg(&slot.work_keys)
                .set_arg(&slot.work_index)
                .set_arg(&slot.out_correlations)
                .set_global_work_size(slot.count)
                .enqueue_nd_range(&slot.queue)
                .map_err(map_cl_err("Failed to enqueue correlate_pairs"))?
        };
        slot.queue.flush().map_err(map_cl_err("Failed to flush queue"))?;
        Ok(OpenClEvent(event))
    }

    fn download(&mut self, slot: &mut OpenClSlot) -> Result<OpenClEvent, DeviceError> {
        let n = self.params.sample_size;
        let slots = self.params.cluster_slots();
        let count = slot.count;
        let event = unsafe {
            slot.queue
                .enqueue_read_buffer(&slot.out_k, CL_NON_BLOCKING, 0, &mut slot.host_k[..count], &[])
                .map_err(map_cl_err("Failed to download cluster counts"))?;
            slot.queue
                .enqueue_read_buffer(
                    &slot.out_labels,
                    CL_NON_BLOCKING,
                    0,
                    &mut slot.host_labels[..count * n],
                    &[],
                )
                .map_err(map_cl_err("Failed to download sample labels"))?;
            slot.queue
                .enqueue_read_buffer(
                    &slot.out_correlations,
                    CL_NON_BLOCKING,
                    0,
                    &mut slot.host_correlations[..count * slots],
                    &[],
                )
                .map_err(map_cl_err("Failed to download correlations"))?
        };
        slot.queue.flush().map_err(map_cl_err("Failed to flush queue"))?;
        Ok(OpenClEvent(event))
    }

    fn collect(&mut self, slot: &mut OpenClSlot, out: &mut Vec<PairResult>) -> Result<(), DeviceError> {
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
