use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ir_tensor::{Shape, Tensor};

use crate::error::{ExecutorError, Result};
use crate::program::{VarDesc, VarKind};

/// Index of a variable in its [`VariableScope`].
pub type VarId = usize;

/// Contents of a variable slot.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Empty,
    Tensor(Tensor),
    /// Storage was collected; only the shape survives for shape-only readers.
    Reclaimed(Shape),
    FetchList(Vec<Option<Tensor>>),
}

/// An id-addressed slot in the variable table.
#[derive(Debug)]
pub struct Variable {
    id: VarId,
    name: String,
    desc: Option<VarDesc>,
    value: RwLock<Value>,
}

impl Variable {
    pub fn id(&self) -> VarId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Static metadata; `None` for scratch variables created during lowering.
    pub fn desc(&self) -> Option<&VarDesc> {
        self.desc.as_ref()
    }

    pub fn is_persistable(&self) -> bool {
        self.desc.as_ref().is_some_and(|d| d.persistable)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Value>> {
        self.value.read().map_err(|_| self.poisoned())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Value>> {
        self.value.write().map_err(|_| self.poisoned())
    }

    fn poisoned(&self) -> ExecutorError {
        ExecutorError::InvariantViolation(format!("lock of variable `{}` is poisoned", self.name))
    }

    /// The bound tensor, if storage is currently held.
    pub fn tensor(&self) -> Result<Option<Tensor>> {
        Ok(match &*self.read()? {
            Value::Tensor(t) => Some(t.clone()),
            _ => None,
        })
    }

    /// The bound tensor, or an error naming the variable.
    pub fn get_tensor(&self) -> Result<Tensor> {
        match &*self.read()? {
            Value::Tensor(t) => Ok(t.clone()),
            Value::Reclaimed(_) => Err(ExecutorError::InvalidArgument(format!(
                "storage of variable `{}` was already reclaimed",
                self.name
            ))),
            _ => Err(ExecutorError::InvalidArgument(format!(
                "variable `{}` holds no tensor",
                self.name
            ))),
        }
    }

    /// Shape of the bound or reclaimed tensor.
    pub fn shape(&self) -> Result<Option<Shape>> {
        Ok(match &*self.read()? {
            Value::Tensor(t) => Some(t.shape().clone()),
            Value::Reclaimed(shape) => Some(shape.clone()),
            _ => None,
        })
    }

    /// Bind a tensor, replacing whatever the slot held.
    pub fn set_tensor(&self, tensor: Tensor) -> Result<()> {
        *self.write()? = Value::Tensor(tensor);
        Ok(())
    }

    /// True if the slot currently holds tensor storage.
    pub fn holds_storage(&self) -> Result<bool> {
        Ok(matches!(&*self.read()?, Value::Tensor(_)))
    }

    /// True if the slot was collected and not rebound since.
    pub fn is_reclaimed(&self) -> Result<bool> {
        Ok(matches!(&*self.read()?, Value::Reclaimed(_)))
    }

    /// Drop the storage, keeping the shape. Returns the dropped tensor.
    pub(crate) fn reclaim(&self) -> Result<Option<Tensor>> {
        let mut slot = self.write()?;
        match std::mem::take(&mut *slot) {
            Value::Tensor(t) => {
                *slot = Value::Reclaimed(t.shape().clone());
                Ok(Some(t))
            }
            other => {
                *slot = other;
                Ok(None)
            }
        }
    }

    pub(crate) fn reset_fetch_list(&self, n: usize) -> Result<()> {
        *self.write()? = Value::FetchList(vec![None; n]);
        Ok(())
    }

    pub(crate) fn set_fetch(&self, col: usize, tensor: Tensor) -> Result<()> {
        let mut slot = self.write()?;
        match &mut *slot {
            Value::FetchList(list) => {
                if list.len() <= col {
                    list.resize(col + 1, None);
                }
                list[col] = Some(tensor);
                Ok(())
            }
            _ => Err(ExecutorError::InvalidArgument(format!(
                "variable `{}` is not a fetch list",
                self.name
            ))),
        }
    }

    pub(crate) fn take_fetch_list(&self) -> Result<Vec<Option<Tensor>>> {
        match &mut *self.write()? {
            Value::FetchList(list) => Ok(std::mem::take(list)),
            _ => Err(ExecutorError::InvalidArgument(format!(
                "variable `{}` is not a fetch list",
                self.name
            ))),
        }
    }
}

/// Tracks bytes of uniquely owned tensor storage bound to variables.
#[derive(Debug, Default)]
pub struct MemoryTracker {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl MemoryTracker {
    pub fn allocate(&self, bytes: usize) {
        let now = self.current.fetch_add(bytes, Ordering::AcqRel) + bytes;
        self.peak.fetch_max(now, Ordering::AcqRel);
    }

    pub fn release(&self, bytes: usize) {
        let _ = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some(cur.saturating_sub(bytes))
            });
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.current.store(0, Ordering::Release);
        self.peak.store(0, Ordering::Release);
    }
}

/// The session-wide variable table.
///
/// Variables are added only while the interpreter builds; afterwards the
/// table is shared read-only and slots are mutated through their own locks.
#[derive(Debug, Default)]
pub struct VariableScope {
    vars: Vec<Arc<Variable>>,
    name2id: HashMap<String, VarId>,
    memory: MemoryTracker,
}

impl VariableScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the id of `name`, creating the variable if needed.
    ///
    /// A descriptor given for an existing variable that has none is ignored;
    /// the first declaration wins.
    pub fn add_var(&mut self, name: &str, desc: Option<VarDesc>) -> VarId {
        if let Some(&id) = self.name2id.get(name) {
            return id;
        }
        let id = self.vars.len();
        let value = match desc.as_ref().map(|d| d.kind) {
            Some(VarKind::FetchList) => Value::FetchList(Vec::new()),
            _ => Value::Empty,
        };
        self.vars.push(Arc::new(Variable {
            id,
            name: name.to_string(),
            desc,
            value: RwLock::new(value),
        }));
        self.name2id.insert(name.to_string(), id);
        id
    }

    pub fn find_id(&self, name: &str) -> Option<VarId> {
        self.name2id.get(name).copied()
    }

    pub fn find_var(&self, name: &str) -> Option<&Arc<Variable>> {
        self.find_id(name).map(|id| &self.vars[id])
    }

    /// Variable by name or a `VarNotFound` error.
    pub fn get_var(&self, name: &str) -> Result<&Arc<Variable>> {
        self.find_var(name)
            .ok_or_else(|| ExecutorError::VarNotFound(name.to_string()))
    }

    /// # Panics
    /// Panics if `id` is out of range.
    pub fn var(&self, id: VarId) -> &Arc<Variable> {
        &self.vars[id]
    }

    pub fn var_desc(&self, id: VarId) -> Option<&VarDesc> {
        self.vars[id].desc()
    }

    pub fn name(&self, id: VarId) -> &str {
        self.vars[id].name()
    }

    pub fn var_size(&self) -> usize {
        self.vars.len()
    }

    pub fn memory(&self) -> &MemoryTracker {
        &self.memory
    }

    /// Number of variables currently holding tensor storage.
    pub fn live_tensor_count(&self) -> Result<usize> {
        let mut n = 0;
        for var in &self.vars {
            if var.holds_storage()? {
                n += 1;
            }
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(data: &[f32]) -> Tensor {
        Tensor::new(data.to_vec(), Shape::new(vec![data.len()]))
    }

    #[test]
    fn test_add_var_is_idempotent() {
        let mut scope = VariableScope::new();
        let a = scope.add_var("a", Some(VarDesc::new("a")));
        let b = scope.add_var("b", None);
        assert_eq!(scope.add_var("a", None), a);
        assert_eq!(scope.var_size(), 2);
        assert_eq!(scope.find_id("b"), Some(b));
        assert!(scope.var_desc(a).is_some());
        assert!(scope.var_desc(b).is_none());
        assert!(scope.get_var("missing").is_err());
    }

    #[test]
    fn test_reclaim_keeps_shape() {
        let mut scope = VariableScope::new();
        let id = scope.add_var("x", None);
        let var = scope.var(id);
        var.set_tensor(tensor(&[1.0, 2.0])).unwrap();
        assert!(var.holds_storage().unwrap());
        assert_eq!(scope.live_tensor_count().unwrap(), 1);

        let dropped = var.reclaim().unwrap().unwrap();
        assert_eq!(dropped.data_f32(), &[1.0, 2.0]);
        assert!(var.is_reclaimed().unwrap());
        assert!(var.tensor().unwrap().is_none());
        assert!(var.get_tensor().is_err());
        assert_eq!(var.shape().unwrap().unwrap().dims(), &[2]);
        assert_eq!(scope.live_tensor_count().unwrap(), 0);
        // a second reclaim is a no-op
        assert!(var.reclaim().unwrap().is_none());
    }

    #[test]
    fn test_fetch_list() {
        let mut scope = VariableScope::new();
        let id = scope.add_var(
            "fetch",
            Some(VarDesc::persistable("fetch").with_kind(VarKind::FetchList)),
        );
        let var = scope.var(id);
        assert!(var.is_persistable());
        var.reset_fetch_list(2).unwrap();
        var.set_fetch(1, tensor(&[3.0])).unwrap();
        let list = var.take_fetch_list().unwrap();
        assert!(list[0].is_none());
        assert_eq!(list[1].as_ref().unwrap().data_f32(), &[3.0]);
        let t = scope.add_var("t", None);
        assert!(scope.var(t).set_fetch(0, tensor(&[1.0])).is_err());
    }

    #[test]
    fn test_memory_tracker_peak() {
        let m = MemoryTracker::default();
        m.allocate(100);
        m.allocate(50);
        m.release(120);
        m.allocate(10);
        assert_eq!(m.current(), 40);
        assert_eq!(m.peak(), 150);
        m.release(1000);
        assert_eq!(m.current(), 0);
        m.reset();
        assert_eq!(m.peak(), 0);
    }
}
