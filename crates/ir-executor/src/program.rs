use std::collections::BTreeMap;

use crate::error::{ExecutorError, Result};

/// Name of the persistable variable that collects fetch results.
pub const FETCH_HOLDER: &str = "fetch_vars";

/// Operator type of the synthetic fetch instructions.
pub const FETCH_OP: &str = "fetch_v2";

/// Operator attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    Bool(bool),
    Int(i64),
    Float(f32),
    Ints(Vec<i64>),
    Str(String),
}

/// What a variable slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VarKind {
    #[default]
    Tensor,
    FetchList,
}

/// Static description of a variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarDesc {
    pub name: String,
    /// Persistable variables survive across runs and are never collected.
    pub persistable: bool,
    pub kind: VarKind,
}

impl VarDesc {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            persistable: false,
            kind: VarKind::Tensor,
        }
    }

    pub fn persistable(name: impl Into<String>) -> Self {
        Self::new(name).with_persistable(true)
    }

    pub fn with_persistable(mut self, persistable: bool) -> Self {
        self.persistable = persistable;
        self
    }

    pub fn with_kind(mut self, kind: VarKind) -> Self {
        self.kind = kind;
        self
    }
}

/// One operator invocation in program order.
///
/// Inputs and outputs map argument names (e.g. `"X"`, `"Out"`) to the
/// variable names bound to them.
#[derive(Debug, Clone, PartialEq)]
pub struct OpDesc {
    pub op_type: String,
    pub inputs: BTreeMap<String, Vec<String>>,
    pub outputs: BTreeMap<String, Vec<String>>,
    pub attrs: BTreeMap<String, Attribute>,
}

impl OpDesc {
    pub fn new(op_type: impl Into<String>) -> Self {
        Self {
            op_type: op_type.into(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn with_input(mut self, arg: &str, vars: &[&str]) -> Self {
        self.inputs
            .insert(arg.to_string(), vars.iter().map(|v| v.to_string()).collect());
        self
    }

    pub fn with_output(mut self, arg: &str, vars: &[&str]) -> Self {
        self.outputs
            .insert(arg.to_string(), vars.iter().map(|v| v.to_string()).collect());
        self
    }

    pub fn with_attr(mut self, name: &str, value: Attribute) -> Self {
        self.attrs.insert(name.to_string(), value);
        self
    }

    pub fn attr(&self, name: &str) -> Option<&Attribute> {
        self.attrs.get(name)
    }

    /// Float attribute, falling back to `default` when absent.
    /// Integer attributes are widened.
    pub fn attr_f32(&self, name: &str, default: f32) -> Result<f32> {
        match self.attrs.get(name) {
            None => Ok(default),
            Some(Attribute::Float(v)) => Ok(*v),
            Some(Attribute::Int(v)) => Ok(*v as f32),
            Some(other) => Err(self.attr_type_error(name, "float", other)),
        }
    }

    pub fn attr_i64(&self, name: &str, default: i64) -> Result<i64> {
        match self.attrs.get(name) {
            None => Ok(default),
            Some(Attribute::Int(v)) => Ok(*v),
            Some(other) => Err(self.attr_type_error(name, "int", other)),
        }
    }

    /// Required integer-list attribute.
    pub fn attr_ints(&self, name: &str) -> Result<&[i64]> {
        match self.attrs.get(name) {
            Some(Attribute::Ints(v)) => Ok(v),
            Some(other) => Err(self.attr_type_error(name, "ints", other)),
            None => Err(ExecutorError::InvalidArgument(format!(
                "operator `{}` is missing attribute `{}`",
                self.op_type, name
            ))),
        }
    }

    fn attr_type_error(&self, name: &str, expected: &str, got: &Attribute) -> ExecutorError {
        ExecutorError::InvalidArgument(format!(
            "operator `{}` attribute `{}`: expected {}, got {:?}",
            self.op_type, name, expected, got
        ))
    }
}

/// A single-block program: variable declarations plus operators in program
/// order. Program order is a valid topological order of the data flow.
#[derive(Debug, Clone, Default)]
pub struct ProgramDesc {
    vars: Vec<VarDesc>,
    ops: Vec<OpDesc>,
}

impl ProgramDesc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a variable, replacing an earlier declaration with the same name.
    pub fn declare(&mut self, desc: VarDesc) -> &mut Self {
        match self.vars.iter_mut().find(|v| v.name == desc.name) {
            Some(existing) => *existing = desc,
            None => self.vars.push(desc),
        }
        self
    }

    /// Declare a non-persistable tensor variable for each name that is not
    /// declared yet.
    pub fn declare_all(&mut self, names: &[&str]) -> &mut Self {
        for name in names {
            if self.find_var(name).is_none() {
                self.vars.push(VarDesc::new(*name));
            }
        }
        self
    }

    pub fn append_op(&mut self, op: OpDesc) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn find_var(&self, name: &str) -> Option<&VarDesc> {
        self.vars.iter().find(|v| v.name == name)
    }

    pub fn vars(&self) -> &[VarDesc] {
        &self.vars
    }

    pub fn ops(&self) -> &[OpDesc] {
        &self.ops
    }

    /// Append one `fetch_v2` operator per fetch name, each writing its column
    /// of the persistable fetch holder.
    pub(crate) fn add_fetch(&mut self, fetch_names: &[String]) {
        self.declare(
            VarDesc::persistable(FETCH_HOLDER).with_kind(VarKind::FetchList),
        );
        for (col, name) in fetch_names.iter().enumerate() {
            self.append_op(
                OpDesc::new(FETCH_OP)
                    .with_input("X", &[name.as_str()])
                    .with_output("Out", &[FETCH_HOLDER])
                    .with_attr("col", Attribute::Int(col as i64)),
            );
        }
    }
}
