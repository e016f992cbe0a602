use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::device::DeviceEvent;
use crate::error::{ExecutorError, Result};
use crate::instruction::Instruction;
use crate::scope::{MemoryTracker, Variable, VariableScope};

struct Garbage {
    var: Arc<Variable>,
    event: Arc<DeviceEvent>,
    pass: u64,
}

#[derive(Default)]
struct Pending {
    items: Vec<Garbage>,
    bytes: usize,
}

/// Releases variable storage once its last holder is done with it.
///
/// Each garbage is gated on the event of the instruction that released it;
/// storage is dropped only after that event has been recorded. With a
/// non-zero batch size, garbage accumulates until the pending bytes reach
/// the threshold or the pass is flushed.
pub struct GarbageCollector {
    batch_bytes: usize,
    pending: Mutex<Pending>,
}

impl std::fmt::Debug for GarbageCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GarbageCollector")
            .field("batch_bytes", &self.batch_bytes)
            .finish()
    }
}

impl GarbageCollector {
    pub fn new(batch_bytes: usize) -> Self {
        Self {
            batch_bytes,
            pending: Mutex::new(Pending::default()),
        }
    }

    fn release(garbage: Garbage, memory: &MemoryTracker) -> Result<()> {
        garbage.event.wait(garbage.pass);
        if let Some(tensor) = garbage.var.reclaim()? {
            if tensor.is_storage_unique() {
                memory.release(tensor.size_in_bytes());
            }
            trace!(var = garbage.var.name(), "reclaimed");
        }
        Ok(())
    }

    /// Hand `var` to the collector, gated on `event` being recorded in `pass`.
    pub fn add(
        &self,
        var: Arc<Variable>,
        event: Arc<DeviceEvent>,
        pass: u64,
        memory: &MemoryTracker,
    ) -> Result<()> {
        let garbage = Garbage { var, event, pass };
        if self.batch_bytes == 0 {
            return Self::release(garbage, memory);
        }
        let bytes = garbage
            .var
            .tensor()?
            .map(|t| t.size_in_bytes())
            .unwrap_or(0);
        let batch = {
            let mut pending = self.lock()?;
            pending.items.push(garbage);
            pending.bytes += bytes;
            if pending.bytes < self.batch_bytes {
                return Ok(());
            }
            std::mem::take(&mut *pending)
        };
        trace!(items = batch.items.len(), bytes = batch.bytes, "releasing garbage batch");
        batch
            .items
            .into_iter()
            .try_for_each(|g| Self::release(g, memory))
    }

    /// Release everything still pending.
    pub fn flush(&self, memory: &MemoryTracker) -> Result<()> {
        let batch = std::mem::take(&mut *self.lock()?);
        batch
            .items
            .into_iter()
            .try_for_each(|g| Self::release(g, memory))
    }

    /// Number of garbage items waiting for release.
    pub fn pending(&self) -> usize {
        self.lock().map(|p| p.items.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Pending>> {
        self.pending
            .lock()
            .map_err(|_| ExecutorError::InvariantViolation("garbage list lock is poisoned".into()))
    }
}

/// Drop one reference from every GC-check variable of `instr`; collect the
/// ones it was the last holder of, unless they are persistable.
pub fn check_gc(
    instr: &Instruction,
    var_ref: &[AtomicUsize],
    scope: &VariableScope,
    gc: &GarbageCollector,
    pass: u64,
) -> Result<()> {
    for &id in instr.gc_check_vars() {
        let last = var_ref[id].fetch_sub(1, Ordering::AcqRel) == 1;
        if !last {
            continue;
        }
        let var = scope.var(id);
        if var.is_persistable() {
            continue;
        }
        gc.add(Arc::clone(var), Arc::clone(instr.event()), pass, scope.memory())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Place;
    use crate::program::VarDesc;
    use ir_tensor::{Shape, Tensor};

    fn scope_with(names: &[(&str, bool)]) -> VariableScope {
        let mut scope = VariableScope::new();
        for &(name, persistable) in names {
            let id = scope.add_var(name, Some(VarDesc::new(name).with_persistable(persistable)));
            let t = Tensor::zeros(Shape::new(vec![4]));
            scope.memory().allocate(t.size_in_bytes());
            scope.var(id).set_tensor(t).unwrap();
        }
        scope
    }

    #[test]
    fn test_immediate_release() {
        let scope = scope_with(&[("a", false)]);
        let event = Arc::new(DeviceEvent::new(Place::Cpu));
        event.record(1);
        let gc = GarbageCollector::new(0);
        gc.add(Arc::clone(scope.var(0)), event, 1, scope.memory()).unwrap();
        assert!(scope.var(0).is_reclaimed().unwrap());
        assert_eq!(scope.memory().current(), 0);
        assert_eq!(gc.pending(), 0);
    }

    #[test]
    fn test_batching() {
        let scope = scope_with(&[("a", false), ("b", false), ("c", false)]);
        let event = Arc::new(DeviceEvent::new(Place::Cpu));
        event.record(1);
        // two 16-byte tensors fill a batch
        let gc = GarbageCollector::new(32);
        gc.add(Arc::clone(scope.var(0)), Arc::clone(&event), 1, scope.memory())
            .unwrap();
        assert_eq!(gc.pending(), 1);
        assert!(scope.var(0).holds_storage().unwrap());

        gc.add(Arc::clone(scope.var(1)), Arc::clone(&event), 1, scope.memory())
            .unwrap();
        assert_eq!(gc.pending(), 0);
        assert!(scope.var(0).is_reclaimed().unwrap());
        assert!(scope.var(1).is_reclaimed().unwrap());

        gc.add(Arc::clone(scope.var(2)), event, 1, scope.memory()).unwrap();
        assert_eq!(gc.pending(), 1);
        gc.flush(scope.memory()).unwrap();
        assert!(scope.var(2).is_reclaimed().unwrap());
        assert_eq!(scope.memory().current(), 0);
    }

    #[test]
    fn test_shared_storage_is_released_by_last_holder() {
        let mut scope = VariableScope::new();
        let a = scope.add_var("a", None);
        let b = scope.add_var("b", None);
        let t = Tensor::zeros(Shape::new(vec![4]));
        scope.memory().allocate(t.size_in_bytes());
        scope.var(a).set_tensor(t.clone()).unwrap();
        scope.var(b).set_tensor(t).unwrap();

        let event = Arc::new(DeviceEvent::new(Place::Cpu));
        event.record(1);
        let gc = GarbageCollector::new(0);
        gc.add(Arc::clone(scope.var(a)), Arc::clone(&event), 1, scope.memory())
            .unwrap();
        assert_eq!(scope.memory().current(), 16);
        gc.add(Arc::clone(scope.var(b)), event, 1, scope.memory()).unwrap();
        assert_eq!(scope.memory().current(), 0);
    }
}
