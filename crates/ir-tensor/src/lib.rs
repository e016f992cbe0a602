//! `ir-tensor` - Tensor values and compute kernels for the inference-runtime executor.
//!
//! Tensors hold reference-counted CPU buffers so that variables can share
//! one buffer in place, and report whether they are the sole holder so the
//! executor can account for released memory. Arithmetic runs through the
//! `ComputeBackend` trait; `CpuBackend` is the reference implementation.

pub mod backend;
pub mod cpu;
pub mod dtype;
pub mod error;
pub mod shape;
pub mod storage;
pub mod tensor;

pub use backend::ComputeBackend;
pub use cpu::CpuBackend;
pub use dtype::DType;
pub use error::{Result, TensorError};
pub use shape::Shape;
pub use storage::CpuStorage;
pub use tensor::Tensor;
