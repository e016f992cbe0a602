use crate::dtype::DType;

/// Host buffer behind a tensor. Shared between tensors through an `Arc`;
/// only a tensor holding the sole handle writes to it.
#[derive(Debug, Clone)]
pub enum CpuStorage {
    F32(Vec<f32>),
}

impl CpuStorage {
    pub fn from_f32_vec(data: Vec<f32>) -> Self {
        CpuStorage::F32(data)
    }

    pub fn len(&self) -> usize {
        match self {
            CpuStorage::F32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        match self {
            CpuStorage::F32(_) => DType::F32,
        }
    }

    /// Bytes held by the buffer; what the executor's memory tracker counts.
    pub fn size_in_bytes(&self) -> usize {
        self.len() * self.dtype().size_in_bytes()
    }

    pub fn as_f32_slice(&self) -> &[f32] {
        match self {
            CpuStorage::F32(v) => v,
        }
    }

    pub fn as_f32_slice_mut(&mut self) -> &mut [f32] {
        match self {
            CpuStorage::F32(v) => v,
        }
    }
}
