//! `ir-executor` - Dependency-driven program interpreter for inference-runtime.
//!
//! This crate provides:
//! - Program descriptions (`ProgramDesc`, `OpDesc`, `VarDesc`) and an
//!   operator registry that lowers them to kernels
//! - A dependency graph with per-variable reference counts, built once and
//!   reused across runs
//! - Stream assignment with explicit cross-stream events
//! - Host and device worker pools that chain ready instructions
//! - Eager garbage collection of temporaries and in-place buffer sharing
//! - `InterpreterCore`, with `run` for fetch results and `dry_run` for cost
//!
//! ```no_run
//! use ir_executor::{ExecutorConfig, InterpreterCore, OpDesc, Place, ProgramDesc, VariableScope};
//! use ir_tensor::{Shape, Tensor};
//!
//! let mut program = ProgramDesc::new();
//! program.declare_all(&["x", "y"]);
//! program.append_op(
//!     OpDesc::new("relu")
//!         .with_input("X", &["x"])
//!         .with_output("Out", &["y"]),
//! );
//! let mut core = InterpreterCore::new(
//!     Place::Cpu,
//!     program,
//!     VariableScope::new(),
//!     &["x"],
//!     &["y"],
//!     ExecutorConfig::default(),
//! )?;
//! let out = core.run(vec![Tensor::new(vec![-1.0, 2.0], Shape::new(vec![2]))])?;
//! assert_eq!(out[0].data_f32(), &[0.0, 2.0]);
//! # Ok::<(), ir_executor::ExecutorError>(())
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod exception;
pub mod gc;
pub mod graph;
pub mod instruction;
pub mod interpreter;
pub mod operator;
pub mod ops;
pub mod program;
pub mod scope;
pub mod stream;
pub mod workqueue;

pub use config::ExecutorConfig;
pub use device::{DeviceContext, DeviceContextPool, DeviceEvent, Place, StreamKind};
pub use error::{ExecutorError, Result};
pub use instruction::{Instruction, NextInstructions, OpFuncType};
pub use interpreter::{CostInfo, InterpreterCore};
pub use operator::{ExecutionContext, OpRegistry, Operator};
pub use program::{Attribute, OpDesc, ProgramDesc, VarDesc, VarKind};
pub use scope::{Value, VarId, Variable, VariableScope};
