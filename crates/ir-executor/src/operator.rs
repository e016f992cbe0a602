use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use ir_tensor::{ComputeBackend, Shape, Tensor};

use crate::device::DeviceContext;
use crate::error::{ExecutorError, Result};
use crate::program::OpDesc;
use crate::scope::{MemoryTracker, VarId, Variable, VariableScope};

/// An operator with a resolved kernel.
///
/// Besides running, an operator describes how it uses its arguments so the
/// interpreter can decide reference counts and buffer aliasing.
pub trait Operator: Send + Sync + fmt::Debug {
    fn op_type(&self) -> &str;

    /// Whether the kernel reads the buffer of input argument `arg`.
    ///
    /// Inputs whose buffer is not needed (only metadata is read) do not keep
    /// the variable alive.
    fn requires_input_buffer(&self, _arg: &str) -> bool {
        true
    }

    /// `(input_arg, output_arg)` pairs whose buffers may alias.
    fn inplace_pairs(&self, _on_device: bool) -> Vec<(&'static str, &'static str)> {
        Vec::new()
    }

    /// Whether the kernel can run on a device stream. Host-only operators
    /// always run on the host context.
    fn supports_device(&self) -> bool {
        true
    }

    /// Output shapes computed from the inputs, keyed by output argument.
    fn infer_shape(&self, _ctx: &ExecutionContext<'_>) -> Result<Vec<(&'static str, Shape)>> {
        Ok(Vec::new())
    }

    fn run(&self, ctx: &ExecutionContext<'_>) -> Result<()>;
}

type OpCreator = Arc<dyn Fn(&OpDesc) -> Result<Box<dyn Operator>> + Send + Sync>;

/// Maps operator types to constructors; lowering resolves every `OpDesc`
/// through it.
#[derive(Clone)]
pub struct OpRegistry {
    creators: HashMap<String, OpCreator>,
}

impl OpRegistry {
    /// A registry with no operators.
    pub fn empty() -> Self {
        Self {
            creators: HashMap::new(),
        }
    }

    /// A registry with the built-in operators of [`crate::ops`].
    pub fn with_builtin_ops() -> Self {
        let mut registry = Self::empty();
        crate::ops::register_builtin_ops(&mut registry);
        registry
    }

    /// Register (or replace) the constructor for `op_type`.
    pub fn register<F>(&mut self, op_type: &str, creator: F) -> &mut Self
    where
        F: Fn(&OpDesc) -> Result<Box<dyn Operator>> + Send + Sync + 'static,
    {
        self.creators.insert(op_type.to_string(), Arc::new(creator));
        self
    }

    pub fn contains(&self, op_type: &str) -> bool {
        self.creators.contains_key(op_type)
    }

    pub fn create(&self, desc: &OpDesc) -> Result<Box<dyn Operator>> {
        let creator = self
            .creators
            .get(&desc.op_type)
            .ok_or_else(|| ExecutorError::UnregisteredOp(desc.op_type.clone()))?;
        creator(desc)
    }
}

impl Default for OpRegistry {
    fn default() -> Self {
        Self::with_builtin_ops()
    }
}

impl fmt::Debug for OpRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.creators.keys().collect();
        names.sort();
        f.debug_struct("OpRegistry").field("ops", &names).finish()
    }
}

/// Variable handles of one instruction, bound once at build time and reused
/// on every run.
#[derive(Debug, Default)]
pub struct RuntimeContext {
    pub inputs: BTreeMap<String, Vec<Arc<Variable>>>,
    pub outputs: BTreeMap<String, Vec<Arc<Variable>>>,
}

impl RuntimeContext {
    pub(crate) fn bind(
        input_index: &BTreeMap<String, Vec<VarId>>,
        output_index: &BTreeMap<String, Vec<VarId>>,
        scope: &VariableScope,
    ) -> Self {
        let resolve = |index: &BTreeMap<String, Vec<VarId>>| {
            index
                .iter()
                .map(|(arg, ids)| {
                    let vars = ids.iter().map(|&id| Arc::clone(scope.var(id))).collect();
                    (arg.clone(), vars)
                })
                .collect()
        };
        Self {
            inputs: resolve(input_index),
            outputs: resolve(output_index),
        }
    }
}

/// What a kernel sees while it runs: its bound variables and the device
/// context it was launched on.
pub struct ExecutionContext<'a> {
    op_type: &'a str,
    runtime: &'a RuntimeContext,
    dev_ctx: &'a DeviceContext,
    memory: &'a MemoryTracker,
}

impl<'a> ExecutionContext<'a> {
    pub(crate) fn new(
        op_type: &'a str,
        runtime: &'a RuntimeContext,
        dev_ctx: &'a DeviceContext,
        memory: &'a MemoryTracker,
    ) -> Self {
        Self {
            op_type,
            runtime,
            dev_ctx,
            memory,
        }
    }

    pub fn op_type(&self) -> &str {
        self.op_type
    }

    pub fn backend(&self) -> &dyn ComputeBackend {
        self.dev_ctx.backend()
    }

    pub fn device_context(&self) -> &DeviceContext {
        self.dev_ctx
    }

    pub fn has_input(&self, arg: &str) -> bool {
        self.runtime.inputs.get(arg).is_some_and(|v| !v.is_empty())
    }

    pub fn input_vars(&self, arg: &str) -> Result<&'a [Arc<Variable>]> {
        self.runtime
            .inputs
            .get(arg)
            .map(Vec::as_slice)
            .ok_or_else(|| self.missing("input", arg))
    }

    pub fn output_vars(&self, arg: &str) -> Result<&'a [Arc<Variable>]> {
        self.runtime
            .outputs
            .get(arg)
            .map(Vec::as_slice)
            .ok_or_else(|| self.missing("output", arg))
    }

    pub fn output_var(&self, arg: &str) -> Result<&'a Arc<Variable>> {
        self.output_vars(arg)?
            .first()
            .ok_or_else(|| self.missing("output", arg))
    }

    fn input_var(&self, arg: &str) -> Result<&'a Arc<Variable>> {
        self.input_vars(arg)?
            .first()
            .ok_or_else(|| self.missing("input", arg))
    }

    /// Tensor bound to the first variable of input `arg`.
    pub fn input(&self, arg: &str) -> Result<Tensor> {
        self.input_var(arg)?.get_tensor()
    }

    /// Tensors bound to every variable of input `arg`.
    pub fn inputs(&self, arg: &str) -> Result<Vec<Tensor>> {
        self.input_vars(arg)?.iter().map(|v| v.get_tensor()).collect()
    }

    /// Shape of input `arg`; available even after its storage was reclaimed.
    pub fn input_shape(&self, arg: &str) -> Result<Shape> {
        let var = self.input_var(arg)?;
        var.shape()?.ok_or_else(|| {
            ExecutorError::InvalidArgument(format!(
                "input `{}` (variable `{}`) of `{}` has no shape",
                arg,
                var.name(),
                self.op_type
            ))
        })
    }

    /// Bind `tensor` to the first variable of output `arg`.
    pub fn set_output(&self, arg: &str, tensor: Tensor) -> Result<()> {
        if tensor.is_storage_unique() {
            self.memory.allocate(tensor.size_in_bytes());
        }
        self.output_var(arg)?.set_tensor(tensor)
    }

    /// True if output `out_arg` currently aliases the buffer of input `in_arg`.
    pub fn output_aliases_input(&self, in_arg: &str, out_arg: &str) -> Result<bool> {
        let input = self.input_var(in_arg)?.tensor()?;
        let output = self.output_var(out_arg)?.tensor()?;
        Ok(match (input, output) {
            (Some(i), Some(o)) => i.shares_storage(&o),
            _ => false,
        })
    }

    /// Apply `update` directly to the buffer that output `out_arg` shares
    /// with input `in_arg`, then bind the result to the output. The input
    /// keeps only its shape. Returns `false` without calling `update` when
    /// the two do not alias or the input is persistable.
    pub fn update_in_place<F>(&self, in_arg: &str, out_arg: &str, update: F) -> Result<bool>
    where
        F: FnOnce(&mut Tensor, &dyn ComputeBackend) -> ir_tensor::Result<()>,
    {
        let input = self.input_var(in_arg)?;
        if input.is_persistable() || !self.output_aliases_input(in_arg, out_arg)? {
            return Ok(false);
        }
        let output = self.output_var(out_arg)?;
        let Some(mut tensor) = input.reclaim()? else {
            return Ok(false);
        };
        output.reclaim()?;
        if !tensor.is_storage_unique() {
            // another holder remains, so the write copies the buffer
            self.memory.allocate(tensor.size_in_bytes());
        }
        update(&mut tensor, self.backend())?;
        output.set_tensor(tensor)?;
        Ok(true)
    }

    fn missing(&self, kind: &str, arg: &str) -> ExecutorError {
        ExecutorError::InvalidArgument(format!(
            "operator `{}` has no {} argument `{}`",
            self.op_type, kind, arg
        ))
    }
}
