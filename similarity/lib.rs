#![deny(unused_variables)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod blocks;
pub mod config;
pub mod correlate;
pub mod device;
pub mod host_backend;
pub mod io;
pub mod kernel;
pub mod pipeline;
pub mod serial;
pub mod types;

#[cfg(feature = "cuda")]
pub mod cuda_backend;
#[cfg(feature = "opencl")]
pub mod opencl_backend;

#[path = "../shared/files.rs"]
pub mod shared_files;
pub mod shared {
    pub use super::shared_files as files;
}

#[path = "../pairwise/mod.rs"]
pub mod pairwise;

#[path = "../clustering/mod.rs"]
pub mod clustering;

/// Kernel sources shared by the GPU backends. The body is written once against a small
/// set of macros that each API's prelude defines.
#[cfg(any(feature = "cuda", feature = "opencl"))]
pub(crate) mod kernel_sources {
    pub const SIMILARITY: &str = include_str!("../kernels/similarity.c");
    #[cfg(feature = "cuda")]
    pub const CUDA_PRELUDE: &str = include_str!("../kernels/prelude_cuda.h");
    #[cfg(feature = "opencl")]
    pub const OPENCL_PRELUDE: &str = include_str!("../kernels/prelude_opencl.h");
}
