use std::sync::Arc;

use tracing::trace;

use crate::device::{DeviceContext, DeviceContextPool, StreamKind};
use crate::instruction::{Instruction, OpFuncType};
use crate::ops::{MEMCPY_D2H, MEMCPY_H2D};

/// Assigns device contexts to instructions and decides how each successor
/// edge is synchronized.
#[derive(Debug)]
pub struct StreamAnalyzer {
    pool: Arc<DeviceContextPool>,
}

impl StreamAnalyzer {
    pub fn new(pool: Arc<DeviceContextPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<DeviceContextPool> {
        &self.pool
    }

    /// Context an instruction of `op_type` launches on.
    pub fn parse_device_context(&self, op_type: &str, func_type: OpFuncType) -> Arc<DeviceContext> {
        let stream = match func_type {
            OpFuncType::QueueSync => StreamKind::Host,
            OpFuncType::QueueAsync => match op_type {
                MEMCPY_D2H => StreamKind::DeviceToHost,
                MEMCPY_H2D => StreamKind::HostToDevice,
                _ => StreamKind::Compute,
            },
        };
        Arc::clone(self.pool.get(stream))
    }

    /// A successor needs no synchronization when both sides share a stream,
    /// or when the copy itself orders the transfer.
    fn is_direct_run(&self, prev: &Instruction, next: &Instruction) -> bool {
        Arc::ptr_eq(prev.device_context(), next.device_context())
            || prev.op_type() == MEMCPY_D2H
            || next.op_type() == MEMCPY_H2D
    }

    /// Partition the successors of instruction `i` and wire events for the
    /// ones that cross streams.
    pub fn schedule(&self, downstream: &[usize], instructions: &mut [Instruction], i: usize) {
        for &next_id in downstream {
            let direct = self.is_direct_run(&instructions[i], &instructions[next_id]);
            if direct {
                instructions[i].next_mut().add_direct_run(next_id);
                continue;
            }
            let event = Arc::clone(instructions[i].event());
            instructions[next_id].add_input_event(event);
            let next_type = instructions[next_id].func_type();
            trace!(from = i, to = next_id, ?next_type, "cross-stream edge");
            match next_type {
                OpFuncType::QueueAsync => instructions[i].next_mut().add_event_run(next_id),
                OpFuncType::QueueSync => instructions[i].next_mut().add_sync_run(next_id),
            }
        }
    }
}
