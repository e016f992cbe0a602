use std::fmt::Debug;

use crate::error::Result;

/// Trait for pluggable compute backends.
///
/// Data is passed in as slices and returned as owned vectors. Each device
/// context of the executor holds one backend and launches its kernels
/// through it.
pub trait ComputeBackend: Send + Sync + Debug {
    /// Returns the name of this backend (e.g., "cpu").
    fn name(&self) -> &str;

    /// Matrix multiplication: C = A @ B.
    ///
    /// - `a`: row-major data of shape [m, k]
    /// - `b`: row-major data of shape [k, n]
    /// - Returns: row-major data of shape [m, n]
    fn matmul(&self, a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Result<Vec<f32>>;

    /// Element-wise addition: result[i] = a[i] + b[i].
    fn add(&self, a: &[f32], b: &[f32]) -> Result<Vec<f32>>;

    /// Element-wise multiplication: result[i] = a[i] * b[i].
    fn mul(&self, a: &[f32], b: &[f32]) -> Result<Vec<f32>>;

    /// Affine scaling: result[i] = a[i] * s + bias.
    fn scale(&self, a: &[f32], s: f32, bias: f32) -> Result<Vec<f32>>;

    /// Rectified linear unit: result[i] = max(a[i], 0).
    fn relu(&self, a: &[f32]) -> Result<Vec<f32>>;

    /// [`ComputeBackend::scale`] written back into `a`.
    fn scale_inplace(&self, a: &mut [f32], s: f32, bias: f32) -> Result<()> {
        let out = self.scale(a, s, bias)?;
        a.copy_from_slice(&out);
        Ok(())
    }

    /// [`ComputeBackend::relu`] written back into `a`.
    fn relu_inplace(&self, a: &mut [f32]) -> Result<()> {
        let out = self.relu(a)?;
        a.copy_from_slice(&out);
        Ok(())
    }
}
