use crate::backend::ComputeBackend;
use crate::error::{Result, TensorError};

/// Single-threaded reference kernels.
///
/// Every executor device context falls back to this backend when no other
/// one is supplied.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        Self
    }
}

fn zip_with(lhs: &[f32], rhs: &[f32], f: impl Fn(f32, f32) -> f32) -> Result<Vec<f32>> {
    if lhs.len() != rhs.len() {
        return Err(TensorError::ShapeMismatch {
            expected: vec![lhs.len()],
            got: vec![rhs.len()],
        });
    }
    Ok(lhs.iter().zip(rhs).map(|(&l, &r)| f(l, r)).collect())
}

fn expect_len(operand: &str, data: &[f32], rows: usize, cols: usize) -> Result<()> {
    if data.len() == rows * cols {
        return Ok(());
    }
    Err(TensorError::Other(format!(
        "matmul operand {operand} holds {} values, expected {rows}x{cols}",
        data.len()
    )))
}

impl ComputeBackend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn matmul(&self, a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Result<Vec<f32>> {
        expect_len("a", a, m, k)?;
        expect_len("b", b, k, n)?;
        let mut out = vec![0.0f32; m * n];
        for (row, a_row) in out.chunks_mut(n.max(1)).zip(a.chunks(k.max(1))) {
            for (&coef, b_row) in a_row.iter().zip(b.chunks(n.max(1))) {
                for (o, &v) in row.iter_mut().zip(b_row) {
                    *o += coef * v;
                }
            }
        }
        Ok(out)
    }

    fn add(&self, a: &[f32], b: &[f32]) -> Result<Vec<f32>> {
        zip_with(a, b, |l, r| l + r)
    }

    fn mul(&self, a: &[f32], b: &[f32]) -> Result<Vec<f32>> {
        zip_with(a, b, |l, r| l * r)
    }

    fn scale(&self, a: &[f32], s: f32, bias: f32) -> Result<Vec<f32>> {
        Ok(a.iter().map(|&v| v * s + bias).collect())
    }

    fn relu(&self, a: &[f32]) -> Result<Vec<f32>> {
        Ok(a.iter().map(|&v| v.max(0.0)).collect())
    }

    fn scale_inplace(&self, a: &mut [f32], s: f32, bias: f32) -> Result<()> {
        a.iter_mut().for_each(|v| *v = *v * s + bias);
        Ok(())
    }

    fn relu_inplace(&self, a: &mut [f32]) -> Result<()> {
        a.iter_mut().for_each(|v| *v = v.max(0.0));
        Ok(())
    }
}
