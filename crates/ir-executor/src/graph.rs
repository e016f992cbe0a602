//! Dependency analysis over the lowered instruction list.
//!
//! Program order is a topological order, so every edge points forward: an
//! instruction's successors are the later instructions that read one of its
//! outputs.

use std::collections::BTreeSet;

use tracing::{debug, trace, warn};

use crate::error::{ExecutorError, Result};
use crate::instruction::{InplacePair, Instruction};
use crate::program::FETCH_HOLDER;
use crate::scope::{VarId, VariableScope};
use crate::stream::StreamAnalyzer;

/// Counters derived from the instruction list. The per-pass atomic copies
/// are initialized from these.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    /// Number of distinct predecessors of each instruction.
    pub dependency_count: Vec<usize>,
    /// Number of outstanding holders of each variable's storage.
    pub var_ref_count: Vec<usize>,
    /// Instructions reading each variable, one entry per binding.
    pub input_var2op: Vec<Vec<usize>>,
}

/// Whether variable `id` must be counted as a buffer reader for `arg`.
fn needs_buffer(instr: &Instruction, arg: &str, id: VarId, scope: &VariableScope) -> bool {
    scope.var_desc(id).is_none() || instr.operator().requires_input_buffer(arg)
}

/// Compute reference counts, GC check lists, successors and dependency
/// counts, and partition successors through `analyzer`.
pub fn build_dependency_graph(
    instructions: &mut [Instruction],
    scope: &VariableScope,
    analyzer: &StreamAnalyzer,
) -> Result<DependencyGraph> {
    let n = instructions.len();
    let mut graph = DependencyGraph {
        dependency_count: vec![0; n],
        var_ref_count: vec![0; scope.var_size()],
        input_var2op: vec![Vec::new(); scope.var_size()],
    };

    for i in 0..n {
        let mut gc_inputs = BTreeSet::new();
        for (arg, ids) in instructions[i].inputs() {
            for &id in ids {
                graph.input_var2op[id].push(i);
                if needs_buffer(&instructions[i], arg, id, scope) {
                    gc_inputs.insert(id);
                }
            }
        }
        for id in gc_inputs {
            graph.var_ref_count[id] += 1;
            instructions[i].add_gc_check_var(id);
        }
    }

    for i in 0..n {
        let unconsumed: Vec<VarId> = instructions[i]
            .outputs()
            .values()
            .flatten()
            .copied()
            .filter(|&id| graph.input_var2op[id].is_empty())
            .collect();
        for id in unconsumed {
            trace!(var = scope.name(id), op = i, "output has no consumer");
            graph.var_ref_count[id] += 1;
            instructions[i].add_gc_check_var(id);
        }
    }

    check_overwrites(instructions, scope, &graph)?;

    for i in 0..n {
        let downstream: Vec<usize> = instructions[i]
            .outputs()
            .values()
            .flatten()
            .flat_map(|&id| graph.input_var2op[id].iter().copied())
            .filter(|&next| next > i)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        analyzer.schedule(&downstream, instructions, i);
        for next in downstream {
            graph.dependency_count[next] += 1;
        }
    }

    for (i, instr) in instructions.iter().enumerate() {
        if let Some(bad) = instr.next_instructions().all().find(|&next| next <= i || next >= n) {
            return Err(ExecutorError::InvariantViolation(format!(
                "instruction {} (`{}`) lists successor {} out of forward order",
                i,
                instr.op_type(),
                bad
            )));
        }
    }

    debug!(
        instructions = n,
        roots = graph.dependency_count.iter().filter(|&&c| c == 0).count(),
        "built dependency graph"
    );
    Ok(graph)
}

/// Reject programs where a later instruction overwrites a temporary that an
/// earlier instruction reads or writes; forward-only edges cannot order
/// either pair. Persistable variables only get a warning, except for the
/// fetch holder, which every fetch writes by column.
fn check_overwrites(
    instructions: &[Instruction],
    scope: &VariableScope,
    graph: &DependencyGraph,
) -> Result<()> {
    let mut first_writer: Vec<Option<usize>> = vec![None; scope.var_size()];
    for (i, instr) in instructions.iter().enumerate() {
        let outputs: BTreeSet<VarId> = instr.outputs().values().flatten().copied().collect();
        for id in outputs {
            let earlier_writer = *first_writer[id].get_or_insert(i);
            let earlier_reader = graph.input_var2op[id].iter().copied().find(|&j| j < i);
            let conflict = match (earlier_reader, earlier_writer < i) {
                (Some(reader), _) => format!("read by instruction {}", reader),
                (None, true) => format!("already written by instruction {}", earlier_writer),
                (None, false) => continue,
            };
            if scope.var(id).is_persistable() {
                if scope.name(id) != FETCH_HOLDER {
                    warn!(
                        var = scope.name(id),
                        writer = i,
                        %conflict,
                        "persistable variable is overwritten"
                    );
                }
                continue;
            }
            return Err(ExecutorError::InvalidArgument(format!(
                "variable `{}` is {} before instruction {} (`{}`) writes it",
                scope.name(id),
                conflict,
                i,
                instr.op_type()
            )));
        }
    }
    Ok(())
}

/// True if exactly one instruction binding reads the buffer of `id`.
fn is_only_buffer_reader(
    id: VarId,
    instructions: &[Instruction],
    scope: &VariableScope,
    graph: &DependencyGraph,
) -> bool {
    if scope.var_desc(id).is_none() {
        return graph.input_var2op[id].len() == 1;
    }
    let mut readers = 0;
    for &op in &graph.input_var2op[id] {
        let instr = &instructions[op];
        for (arg, ids) in instr.inputs() {
            if ids.contains(&id) && instr.operator().requires_input_buffer(arg) {
                readers += 1;
            }
        }
    }
    readers == 1
}

/// Record the in-place pairs each instruction may use at run time.
pub fn build_inplace(
    instructions: &mut [Instruction],
    scope: &VariableScope,
    graph: &DependencyGraph,
) {
    let mut found = Vec::new();
    for (i, instr) in instructions.iter().enumerate() {
        let on_device = instr.device_context().place().is_device();
        for (in_arg, out_arg) in instr.operator().inplace_pairs(on_device) {
            let Some(&in_id) = instr.inputs().get(in_arg).and_then(|ids| ids.first()) else {
                continue;
            };
            let Some(&out_id) = instr.outputs().get(out_arg).and_then(|ids| ids.first()) else {
                continue;
            };
            if !is_only_buffer_reader(in_id, instructions, scope, graph) {
                continue;
            }
            trace!(
                op = instr.op_type(),
                input = scope.name(in_id),
                output = scope.name(out_id),
                "inplace"
            );
            found.push((
                i,
                InplacePair {
                    input: scope.var(in_id).clone(),
                    output: scope.var(out_id).clone(),
                    output_arg: out_arg.to_string(),
                },
            ));
        }
    }
    for (i, pair) in found {
        instructions[i].add_inplace(pair);
    }
}
