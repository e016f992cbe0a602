//! Built-in operators.
//!
//! These are thin wrappers over `ir_tensor` kernels; the interpreter treats
//! them exactly like user-registered operators.

use ir_tensor::{Shape, Tensor};
use tracing::trace;

use crate::error::{ExecutorError, Result};
use crate::operator::{ExecutionContext, OpRegistry, Operator};
use crate::program::{OpDesc, FETCH_OP};

pub const MEMCPY_D2H: &str = "memcpy_d2h";
pub const MEMCPY_H2D: &str = "memcpy_h2d";

pub(crate) fn register_builtin_ops(registry: &mut OpRegistry) {
    registry
        .register(FETCH_OP, FetchV2::create)
        .register("elementwise_add", |_| Ok(Box::new(ElementwiseAdd)))
        .register("elementwise_mul", |_| Ok(Box::new(ElementwiseMul)))
        .register("matmul", |_| Ok(Box::new(MatMul)))
        .register("scale", Scale::create)
        .register("relu", |_| Ok(Box::new(Relu)))
        .register("assign", |_| Ok(Box::new(Assign)))
        .register("fill_constant", FillConstant::create)
        .register("shape", |_| Ok(Box::new(ShapeOf)))
        .register(MEMCPY_D2H, |_| Ok(Box::new(Memcpy { op_type: MEMCPY_D2H })))
        .register(MEMCPY_H2D, |_| Ok(Box::new(Memcpy { op_type: MEMCPY_H2D })));
}

fn same_shape(ctx: &ExecutionContext<'_>, a: &str, b: &str) -> Result<Shape> {
    let sa = ctx.input_shape(a)?;
    let sb = ctx.input_shape(b)?;
    if sa != sb {
        return Err(ExecutorError::InvalidArgument(format!(
            "`{}` expects {} and {} to have the same shape, got {} and {}",
            ctx.op_type(),
            a,
            b,
            sa,
            sb
        )));
    }
    Ok(sa)
}

/// Copies input `X` into column `col` of the fetch holder.
#[derive(Debug)]
pub struct FetchV2 {
    col: usize,
}

impl FetchV2 {
    fn create(desc: &OpDesc) -> Result<Box<dyn Operator>> {
        let col = desc.attr_i64("col", 0)?;
        let col = usize::try_from(col).map_err(|_| {
            ExecutorError::InvalidArgument(format!("fetch column must be >= 0, got {}", col))
        })?;
        Ok(Box::new(FetchV2 { col }))
    }
}

impl Operator for FetchV2 {
    fn op_type(&self) -> &str {
        FETCH_OP
    }

    fn supports_device(&self) -> bool {
        false
    }

    fn run(&self, ctx: &ExecutionContext<'_>) -> Result<()> {
        let value = ctx.input("X")?;
        ctx.output_var("Out")?.set_fetch(self.col, value)
    }
}

#[derive(Debug)]
pub struct ElementwiseAdd;

impl Operator for ElementwiseAdd {
    fn op_type(&self) -> &str {
        "elementwise_add"
    }

    fn infer_shape(&self, ctx: &ExecutionContext<'_>) -> Result<Vec<(&'static str, Shape)>> {
        Ok(vec![("Out", same_shape(ctx, "X", "Y")?)])
    }

    fn run(&self, ctx: &ExecutionContext<'_>) -> Result<()> {
        let out = ctx.input("X")?.add(&ctx.input("Y")?, ctx.backend())?;
        ctx.set_output("Out", out)
    }
}

#[derive(Debug)]
pub struct ElementwiseMul;

impl Operator for ElementwiseMul {
    fn op_type(&self) -> &str {
        "elementwise_mul"
    }

    fn infer_shape(&self, ctx: &ExecutionContext<'_>) -> Result<Vec<(&'static str, Shape)>> {
        Ok(vec![("Out", same_shape(ctx, "X", "Y")?)])
    }

    fn run(&self, ctx: &ExecutionContext<'_>) -> Result<()> {
        let out = ctx.input("X")?.mul(&ctx.input("Y")?, ctx.backend())?;
        ctx.set_output("Out", out)
    }
}

#[derive(Debug)]
pub struct MatMul;

impl Operator for MatMul {
    fn op_type(&self) -> &str {
        "matmul"
    }

    fn infer_shape(&self, ctx: &ExecutionContext<'_>) -> Result<Vec<(&'static str, Shape)>> {
        let out = Tensor::matmul_shape(&ctx.input_shape("X")?, &ctx.input_shape("Y")?)?;
        Ok(vec![("Out", out)])
    }

    fn run(&self, ctx: &ExecutionContext<'_>) -> Result<()> {
        let out = ctx.input("X")?.matmul(&ctx.input("Y")?, ctx.backend())?;
        ctx.set_output("Out", out)
    }
}

/// `Out = X * scale + bias`. When `Out` aliases `X` and the transform is the
/// identity, the kernel is skipped and no buffer is allocated.
#[derive(Debug)]
pub struct Scale {
    scale: f32,
    bias: f32,
}

impl Scale {
    fn create(desc: &OpDesc) -> Result<Box<dyn Operator>> {
        Ok(Box::new(Scale {
            scale: desc.attr_f32("scale", 1.0)?,
            bias: desc.attr_f32("bias", 0.0)?,
        }))
    }

    fn is_identity(&self) -> bool {
        self.scale == 1.0 && self.bias == 0.0
    }
}

impl Operator for Scale {
    fn op_type(&self) -> &str {
        "scale"
    }

    fn inplace_pairs(&self, _on_device: bool) -> Vec<(&'static str, &'static str)> {
        vec![("X", "Out")]
    }

    fn infer_shape(&self, ctx: &ExecutionContext<'_>) -> Result<Vec<(&'static str, Shape)>> {
        Ok(vec![("Out", ctx.input_shape("X")?)])
    }

    fn run(&self, ctx: &ExecutionContext<'_>) -> Result<()> {
        if self.is_identity() && ctx.output_aliases_input("X", "Out")? {
            trace!("identity scale on a shared buffer, nothing to compute");
            return Ok(());
        }
        let (s, bias) = (self.scale, self.bias);
        if ctx.update_in_place("X", "Out", |t, backend| t.scale_inplace(s, bias, backend))? {
            return Ok(());
        }
        let out = ctx.input("X")?.scale(s, bias, ctx.backend())?;
        ctx.set_output("Out", out)
    }
}

#[derive(Debug)]
pub struct Relu;

impl Operator for Relu {
    fn op_type(&self) -> &str {
        "relu"
    }

    fn inplace_pairs(&self, _on_device: bool) -> Vec<(&'static str, &'static str)> {
        vec![("X", "Out")]
    }

    fn infer_shape(&self, ctx: &ExecutionContext<'_>) -> Result<Vec<(&'static str, Shape)>> {
        Ok(vec![("Out", ctx.input_shape("X")?)])
    }

    fn run(&self, ctx: &ExecutionContext<'_>) -> Result<()> {
        if ctx.update_in_place("X", "Out", |t, backend| t.relu_inplace(backend))? {
            return Ok(());
        }
        let out = ctx.input("X")?.relu(ctx.backend())?;
        ctx.set_output("Out", out)
    }
}

/// Copies `X` to `Out`; a no-op when the two already share a buffer.
#[derive(Debug)]
pub struct Assign;

impl Operator for Assign {
    fn op_type(&self) -> &str {
        "assign"
    }

    fn inplace_pairs(&self, _on_device: bool) -> Vec<(&'static str, &'static str)> {
        vec![("X", "Out")]
    }

    fn infer_shape(&self, ctx: &ExecutionContext<'_>) -> Result<Vec<(&'static str, Shape)>> {
        Ok(vec![("Out", ctx.input_shape("X")?)])
    }

    fn run(&self, ctx: &ExecutionContext<'_>) -> Result<()> {
        if ctx.output_aliases_input("X", "Out")? {
            return Ok(());
        }
        ctx.set_output("Out", ctx.input("X")?.deep_clone())
    }
}

#[derive(Debug)]
pub struct FillConstant {
    shape: Shape,
    value: f32,
}

impl FillConstant {
    fn create(desc: &OpDesc) -> Result<Box<dyn Operator>> {
        Ok(Box::new(FillConstant {
            shape: Shape::from_signed(desc.attr_ints("shape")?)?,
            value: desc.attr_f32("value", 0.0)?,
        }))
    }
}

impl Operator for FillConstant {
    fn op_type(&self) -> &str {
        "fill_constant"
    }

    fn infer_shape(&self, _ctx: &ExecutionContext<'_>) -> Result<Vec<(&'static str, Shape)>> {
        Ok(vec![("Out", self.shape.clone())])
    }

    fn run(&self, ctx: &ExecutionContext<'_>) -> Result<()> {
        ctx.set_output("Out", Tensor::full(self.shape.clone(), self.value))
    }
}

/// Emits the dimensions of `Input` as a 1-D tensor. Reads metadata only.
#[derive(Debug)]
pub struct ShapeOf;

impl Operator for ShapeOf {
    fn op_type(&self) -> &str {
        "shape"
    }

    fn requires_input_buffer(&self, arg: &str) -> bool {
        arg != "Input"
    }

    fn supports_device(&self) -> bool {
        false
    }

    fn run(&self, ctx: &ExecutionContext<'_>) -> Result<()> {
        let shape = ctx.input_shape("Input")?;
        let dims: Vec<f32> = shape.dims().iter().map(|&d| d as f32).collect();
        let n = dims.len();
        ctx.set_output("Out", Tensor::from_vec(dims, Shape::new(vec![n]))?)
    }
}

/// Copy between host and device memory. Placement on the copy streams is
/// decided by the stream analyzer from the operator type.
#[derive(Debug)]
pub struct Memcpy {
    op_type: &'static str,
}

impl Operator for Memcpy {
    fn op_type(&self) -> &str {
        self.op_type
    }

    fn infer_shape(&self, ctx: &ExecutionContext<'_>) -> Result<Vec<(&'static str, Shape)>> {
        Ok(vec![("Out", ctx.input_shape("X")?)])
    }

    fn run(&self, ctx: &ExecutionContext<'_>) -> Result<()> {
        ctx.set_output("Out", ctx.input("X")?.deep_clone())
    }
}
