use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::device::{DeviceContext, DeviceEvent, Place};
use crate::error::Result;
use crate::operator::{OpRegistry, Operator, RuntimeContext};
use crate::program::ProgramDesc;
use crate::scope::{VarId, Variable, VariableScope};

/// Which worker queue an instruction is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpFuncType {
    /// Host kernel; runs to completion on a host worker.
    QueueSync,
    /// Device kernel; launched onto a device stream from the device queue.
    QueueAsync,
}

/// A lowered operator: resolved kernel plus variable ids per argument.
#[derive(Debug)]
pub struct OpFuncNode {
    pub operator: Box<dyn Operator>,
    pub input_index: BTreeMap<String, Vec<VarId>>,
    pub output_index: BTreeMap<String, Vec<VarId>>,
    pub func_type: OpFuncType,
}

/// Add every variable the program declares to `scope`.
pub fn build_variable_scope(program: &ProgramDesc, scope: &mut VariableScope) {
    for desc in program.vars() {
        scope.add_var(&desc.name, Some(desc.clone()));
    }
}

/// Lower `program` to kernels. Variables referenced by an operator but not
/// declared by the program are created without a descriptor.
pub fn build_op_func_list(
    place: Place,
    program: &ProgramDesc,
    scope: &mut VariableScope,
    registry: &OpRegistry,
) -> Result<Vec<OpFuncNode>> {
    let mut nodes = Vec::with_capacity(program.ops().len());
    for desc in program.ops() {
        let operator = registry.create(desc)?;
        let mut index_of = |args: &BTreeMap<String, Vec<String>>| {
            args.iter()
                .map(|(arg, names)| {
                    let ids = names.iter().map(|n| scope.add_var(n, None)).collect();
                    (arg.clone(), ids)
                })
                .collect::<BTreeMap<_, _>>()
        };
        let input_index = index_of(&desc.inputs);
        let output_index = index_of(&desc.outputs);
        let func_type = if place.is_device() && operator.supports_device() {
            OpFuncType::QueueAsync
        } else {
            OpFuncType::QueueSync
        };
        trace!(op = desc.op_type.as_str(), ?func_type, "lowered operator");
        nodes.push(OpFuncNode {
            operator,
            input_index,
            output_index,
            func_type,
        });
    }
    Ok(nodes)
}

/// Successors of an instruction, partitioned by how they are handed off.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NextInstructions {
    direct_run: Vec<usize>,
    event_run: Vec<usize>,
    sync_run: Vec<usize>,
}

impl NextInstructions {
    /// Same device context: no synchronization needed.
    pub fn direct_run_ids(&self) -> &[usize] {
        &self.direct_run
    }

    /// Device successors on another stream, gated by an event.
    pub fn event_run_ids(&self) -> &[usize] {
        &self.event_run
    }

    /// Host successors on another context.
    pub fn sync_run_ids(&self) -> &[usize] {
        &self.sync_run
    }

    pub fn len(&self) -> usize {
        self.direct_run.len() + self.event_run.len() + self.sync_run.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn add_direct_run(&mut self, id: usize) {
        self.direct_run.push(id);
    }

    pub(crate) fn add_event_run(&mut self, id: usize) {
        self.event_run.push(id);
    }

    pub(crate) fn add_sync_run(&mut self, id: usize) {
        self.sync_run.push(id);
    }

    pub(crate) fn all(&self) -> impl Iterator<Item = usize> + '_ {
        self.direct_run
            .iter()
            .chain(&self.event_run)
            .chain(&self.sync_run)
            .copied()
    }
}

/// An input/output pair whose buffers are shared when shapes agree.
#[derive(Debug, Clone)]
pub struct InplacePair {
    pub input: Arc<Variable>,
    pub output: Arc<Variable>,
    pub output_arg: String,
}

/// One scheduled operator execution. Immutable once the interpreter has
/// finished building.
pub struct Instruction {
    id: usize,
    operator: Box<dyn Operator>,
    inputs: BTreeMap<String, Vec<VarId>>,
    outputs: BTreeMap<String, Vec<VarId>>,
    func_type: OpFuncType,
    dev_ctx: Arc<DeviceContext>,
    gc_check_vars: Vec<VarId>,
    inplace: Vec<InplacePair>,
    next: NextInstructions,
    input_events: Vec<Arc<DeviceEvent>>,
    event: Arc<DeviceEvent>,
    runtime_ctx: RuntimeContext,
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instruction")
            .field("id", &self.id)
            .field("op", &self.operator.op_type())
            .field("func_type", &self.func_type)
            .field("stream", &self.dev_ctx.stream())
            .field("next", &self.next)
            .field("gc_check_vars", &self.gc_check_vars)
            .finish()
    }
}

impl Instruction {
    pub fn new(id: usize, node: OpFuncNode, dev_ctx: Arc<DeviceContext>) -> Self {
        let event = Arc::new(DeviceEvent::new(dev_ctx.place()));
        Self {
            id,
            operator: node.operator,
            inputs: node.input_index,
            outputs: node.output_index,
            func_type: node.func_type,
            dev_ctx,
            gc_check_vars: Vec::new(),
            inplace: Vec::new(),
            next: NextInstructions::default(),
            input_events: Vec::new(),
            event,
            runtime_ctx: RuntimeContext::default(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn operator(&self) -> &dyn Operator {
        self.operator.as_ref()
    }

    pub fn op_type(&self) -> &str {
        self.operator.op_type()
    }

    pub fn inputs(&self) -> &BTreeMap<String, Vec<VarId>> {
        &self.inputs
    }

    pub fn outputs(&self) -> &BTreeMap<String, Vec<VarId>> {
        &self.outputs
    }

    pub fn func_type(&self) -> OpFuncType {
        self.func_type
    }

    pub fn device_context(&self) -> &Arc<DeviceContext> {
        &self.dev_ctx
    }

    pub fn gc_check_vars(&self) -> &[VarId] {
        &self.gc_check_vars
    }

    pub fn inplace_info(&self) -> &[InplacePair] {
        &self.inplace
    }

    pub fn next_instructions(&self) -> &NextInstructions {
        &self.next
    }

    pub fn input_events(&self) -> &[Arc<DeviceEvent>] {
        &self.input_events
    }

    /// Recorded after this instruction's kernel launches.
    pub fn event(&self) -> &Arc<DeviceEvent> {
        &self.event
    }

    pub fn runtime_context(&self) -> &RuntimeContext {
        &self.runtime_ctx
    }

    pub(crate) fn add_gc_check_var(&mut self, id: VarId) {
        self.gc_check_vars.push(id);
    }

    pub(crate) fn add_inplace(&mut self, pair: InplacePair) {
        self.inplace.push(pair);
    }

    pub(crate) fn next_mut(&mut self) -> &mut NextInstructions {
        &mut self.next
    }

    pub(crate) fn add_input_event(&mut self, event: Arc<DeviceEvent>) {
        if !self.input_events.iter().any(|e| Arc::ptr_eq(e, &event)) {
            self.input_events.push(event);
        }
    }

    /// Bind the variable handles the kernel will use on every run.
    pub(crate) fn reset_context(&mut self, scope: &VariableScope) {
        self.runtime_ctx = RuntimeContext::bind(&self.inputs, &self.outputs, scope);
    }
}
