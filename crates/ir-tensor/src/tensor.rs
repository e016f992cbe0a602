use std::sync::Arc;

use crate::backend::ComputeBackend;
use crate::dtype::DType;
use crate::error::{Result, TensorError};
use crate::shape::Shape;
use crate::storage::CpuStorage;

/// Row-major f32 values behind a reference-counted buffer.
///
/// `clone` is a second handle onto the same buffer, which is how variables
/// share storage in place. Kernels dispatched through a [`ComputeBackend`]
/// return a fresh buffer; the `_inplace` variants write into this tensor's
/// buffer instead, copying it first if another tensor still holds it.
#[derive(Debug, Clone)]
pub struct Tensor {
    storage: Arc<CpuStorage>,
    shape: Shape,
}

impl Tensor {
    /// Wrap `data` with `shape`.
    ///
    /// # Panics
    /// Panics if `data.len() != shape.numel()`. Use [`Tensor::from_vec`]
    /// where the length is not known to match.
    pub fn new(data: Vec<f32>, shape: Shape) -> Self {
        match Self::from_vec(data, shape) {
            Ok(t) => t,
            Err(e) => panic!("{e}"),
        }
    }

    pub fn from_vec(data: Vec<f32>, shape: Shape) -> Result<Self> {
        if data.len() != shape.numel() {
            return Err(TensorError::DataLength {
                len: data.len(),
                shape: shape.dims().to_vec(),
            });
        }
        Ok(Self {
            storage: Arc::new(CpuStorage::from_f32_vec(data)),
            shape,
        })
    }

    pub fn zeros(shape: Shape) -> Self {
        Self::full(shape, 0.0)
    }

    /// Tensor of `shape` with every element set to `value`.
    pub fn full(shape: Shape, value: f32) -> Self {
        let data = vec![value; shape.numel()];
        Self {
            storage: Arc::new(CpuStorage::from_f32_vec(data)),
            shape,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    /// Bytes held by the backing buffer, shared or not.
    pub fn size_in_bytes(&self) -> usize {
        self.storage.size_in_bytes()
    }

    pub fn data_f32(&self) -> &[f32] {
        self.storage.as_f32_slice()
    }

    /// Writable view of the data. Copies the buffer first unless this tensor
    /// is its sole holder.
    pub fn data_f32_mut(&mut self) -> &mut [f32] {
        Arc::make_mut(&mut self.storage).as_f32_slice_mut()
    }

    /// Copy into a buffer no other tensor holds.
    pub fn deep_clone(&self) -> Tensor {
        Self {
            storage: Arc::new(CpuStorage::clone(&self.storage)),
            shape: self.shape.clone(),
        }
    }

    pub fn shares_storage(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// True if no other tensor holds this buffer.
    pub fn is_storage_unique(&self) -> bool {
        Arc::strong_count(&self.storage) == 1
    }

    pub fn has_nan_or_inf(&self) -> bool {
        self.data_f32().iter().any(|v| !v.is_finite())
    }

    /// Output shape of `a @ b` for two matrices.
    pub fn matmul_shape(a: &Shape, b: &Shape) -> Result<Shape> {
        let (&[m, k], &[k2, n]) = (a.dims(), b.dims()) else {
            return Err(TensorError::Other(format!(
                "matmul expects two matrices, got {a} and {b}"
            )));
        };
        if k != k2 {
            return Err(TensorError::MatmulMismatch { m, k, k2, n });
        }
        Ok(Shape::new(vec![m, n]))
    }

    pub fn matmul(&self, rhs: &Tensor, backend: &dyn ComputeBackend) -> Result<Tensor> {
        let out = Self::matmul_shape(&self.shape, &rhs.shape)?;
        let (m, k, n) = (out.dim(0), self.shape.dim(1), out.dim(1));
        let data = backend.matmul(self.data_f32(), rhs.data_f32(), m, k, n)?;
        Tensor::from_vec(data, out)
    }

    pub fn add(&self, rhs: &Tensor, backend: &dyn ComputeBackend) -> Result<Tensor> {
        self.same_shape_as(rhs)?;
        self.with_data(backend.add(self.data_f32(), rhs.data_f32())?)
    }

    pub fn mul(&self, rhs: &Tensor, backend: &dyn ComputeBackend) -> Result<Tensor> {
        self.same_shape_as(rhs)?;
        self.with_data(backend.mul(self.data_f32(), rhs.data_f32())?)
    }

    /// `self * s + bias`
    pub fn scale(&self, s: f32, bias: f32, backend: &dyn ComputeBackend) -> Result<Tensor> {
        self.with_data(backend.scale(self.data_f32(), s, bias)?)
    }

    pub fn relu(&self, backend: &dyn ComputeBackend) -> Result<Tensor> {
        self.with_data(backend.relu(self.data_f32())?)
    }

    pub fn scale_inplace(
        &mut self,
        s: f32,
        bias: f32,
        backend: &dyn ComputeBackend,
    ) -> Result<()> {
        backend.scale_inplace(self.data_f32_mut(), s, bias)
    }

    pub fn relu_inplace(&mut self, backend: &dyn ComputeBackend) -> Result<()> {
        backend.relu_inplace(self.data_f32_mut())
    }

    fn with_data(&self, data: Vec<f32>) -> Result<Tensor> {
        Tensor::from_vec(data, self.shape.clone())
    }

    fn same_shape_as(&self, rhs: &Tensor) -> Result<()> {
        if self.shape == rhs.shape {
            return Ok(());
        }
        Err(TensorError::ShapeMismatch {
            expected: self.shape.dims().to_vec(),
            got: rhs.shape.dims().to_vec(),
        })
    }
}
