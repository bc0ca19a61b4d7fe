//! The seam between the block pipeline and a concrete compute device.
//!
//! A device owns the expression matrix in its own memory and hands out *slots*: the
//! per-block buffers for one batch of pairs. Every operation is asynchronous and returns
//! an event the pipeline polls; nothing here blocks on device completion.

use crate::pairwise::PairIndex;
use crate::types::PairResult;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("{device} initialization failed: {detail}")]
    Init { device: &'static str, detail: String },
    #[error("{device} kernel compilation failed:\n{log}")]
    Compile { device: &'static str, log: String },
    #[error("{device}: {context}: {detail}")]
    Driver {
        device: &'static str,
        context: &'static str,
        detail: String,
    },
    #[error("{label}={value} exceeds the range required by the device API")]
    Range { label: &'static str, value: usize },
    #[error("batch of {count} pairs exceeds slot capacity {capacity}")]
    Capacity { count: usize, capacity: usize },
}

pub trait DeviceEvent {
    /// Non-blocking completion query.
    fn is_complete(&self) -> Result<bool, DeviceError>;
}

pub trait ComputeDevice {
    type Slot;
    type Event: DeviceEvent;

    fn name(&self) -> &'static str;

    /// Allocates buffers for batches of up to `capacity` pairs.
    fn create_slot(&mut self, capacity: usize) -> Result<Self::Slot, DeviceError>;

    /// Stages `pairs` into the slot and starts copying them to the device.
    fn upload(&mut self, slot: &mut Self::Slot, pairs: &[PairIndex]) -> Result<Self::Event, DeviceError>;

    /// Queues fetch, cluster and correlate over the staged pairs. Called once the
    /// upload event has completed.
    fn launch(&mut self, slot: &mut Self::Slot) -> Result<Self::Event, DeviceError>;

    /// Starts copying results back to host memory. Called once the launch event has
    /// completed.
    fn download(&mut self, slot: &mut Self::Slot) -> Result<Self::Event, DeviceError>;

    /// Appends the downloaded results, in staged order. Called once the download
    /// event has completed.
    fn collect(&mut self, slot: &mut Self::Slot, out: &mut Vec<PairResult>) -> Result<(), DeviceError>;
}

/// An event that is complete from the moment it exists.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReadyEvent;

impl DeviceEvent for ReadyEvent {
    fn is_complete(&self) -> Result<bool, DeviceError> {
        Ok(true)
    }
}

#[cfg(any(feature = "cuda", feature = "opencl"))]
pub(crate) fn checked_i32(label: &'static str, value: usize) -> Result<i32, DeviceError> {
    i32::try_from(value).map_err(|_| DeviceError::Range { label, value })
}

#[cfg(any(feature = "cuda", feature = "opencl"))]
pub(crate) fn checked_mul_usize(label: &'static str, a: usize, b: usize) -> Result<usize, DeviceError> {
    a.checked_mul(b).ok_or(DeviceError::Range {
        label,
        value: usize::MAX,
    })
}

/// Smallest power of two not below `n`.
#[cfg(any(feature = "cuda", feature = "opencl"))]
pub(crate) fn next_power_of_two(n: usize) -> usize {
    n.max(1).next_power_of_two()
}
