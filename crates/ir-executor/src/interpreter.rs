use std::any::Any;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ir_tensor::{ComputeBackend, CpuBackend, Shape, Tensor};
use tracing::{debug, debug_span, trace, warn};

use crate::config::ExecutorConfig;
use crate::device::{DeviceContextPool, Place};
use crate::error::{ExecutorError, Result};
use crate::exception::ExceptionHolder;
use crate::gc::{check_gc, GarbageCollector};
use crate::graph::{build_dependency_graph, build_inplace, DependencyGraph};
use crate::instruction::{
    build_op_func_list, build_variable_scope, InplacePair, Instruction, OpFuncType,
};
use crate::operator::{ExecutionContext, OpRegistry};
use crate::program::{ProgramDesc, FETCH_HOLDER};
use crate::scope::{Variable, VariableScope};
use crate::stream::StreamAnalyzer;
use crate::workqueue::{AsyncWorkQueue, WaitEvent};

/// Cost of one pass measured by [`InterpreterCore::dry_run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CostInfo {
    pub elapsed: Duration,
    pub peak_memory_bytes: usize,
}

/// Runs a program by dependency counting on two worker pools.
///
/// The first call to [`run`](InterpreterCore::run) or
/// [`dry_run`](InterpreterCore::dry_run) lowers the program and builds the
/// instruction graph; later calls rebind the feeds and reuse it.
pub struct InterpreterCore {
    place: Place,
    program: ProgramDesc,
    feed_names: Vec<String>,
    fetch_names: Vec<String>,
    config: ExecutorConfig,
    registry: OpRegistry,
    backend: Arc<dyn ComputeBackend>,
    scope: Arc<VariableScope>,
    session: Option<Arc<Session>>,
}

impl std::fmt::Debug for InterpreterCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterpreterCore")
            .field("place", &self.place)
            .field("feeds", &self.feed_names)
            .field("fetches", &self.fetch_names)
            .field("config", &self.config)
            .field("built", &self.session.is_some())
            .finish()
    }
}

impl InterpreterCore {
    /// `scope` may already hold variables, e.g. persistable weights; the
    /// program's own declarations do not override them.
    pub fn new(
        place: Place,
        program: ProgramDesc,
        scope: VariableScope,
        feed_names: &[&str],
        fetch_names: &[&str],
        config: ExecutorConfig,
    ) -> Result<Self> {
        config.validate()?;
        let mut program = program;
        let fetch_names: Vec<String> = fetch_names.iter().map(|s| s.to_string()).collect();
        program.add_fetch(&fetch_names);
        Ok(Self {
            place,
            program,
            feed_names: feed_names.iter().map(|s| s.to_string()).collect(),
            fetch_names,
            config,
            registry: OpRegistry::default(),
            backend: Arc::new(CpuBackend::new()),
            scope: Arc::new(scope),
            session: None,
        })
    }

    /// Resolve operators through `registry` instead of the built-in one.
    pub fn with_registry(mut self, registry: OpRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn ComputeBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn scope(&self) -> &VariableScope {
        &self.scope
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute one pass and return the fetch targets in order.
    pub fn run(&mut self, feeds: Vec<Tensor>) -> Result<Vec<Tensor>> {
        let session = self.prepare(feeds)?;
        session.execute()
    }

    /// Execute one pass, discarding fetches, and report its cost.
    pub fn dry_run(&mut self, feeds: Vec<Tensor>) -> Result<CostInfo> {
        let session = self.prepare(feeds)?;
        session.scope.memory().reset();
        let start = Instant::now();
        session.execute()?;
        session.pool.wait_all();
        let cost = CostInfo {
            elapsed: start.elapsed(),
            peak_memory_bytes: session.scope.memory().peak(),
        };
        debug!(
            elapsed_us = cost.elapsed.as_micros() as u64,
            peak = cost.peak_memory_bytes,
            "dry run"
        );
        Ok(cost)
    }

    fn prepare(&mut self, feeds: Vec<Tensor>) -> Result<Arc<Session>> {
        if feeds.len() != self.feed_names.len() {
            return Err(ExecutorError::FeedMismatch {
                expected: self.feed_names.len(),
                got: feeds.len(),
            });
        }
        let session = match &self.session {
            Some(session) => Arc::clone(session),
            None => {
                let session = Arc::new(self.build()?);
                self.session = Some(Arc::clone(&session));
                session
            }
        };
        for (var, tensor) in session.feed_vars.iter().zip(feeds) {
            var.set_tensor(tensor)?;
        }
        Ok(session)
    }

    fn build(&mut self) -> Result<Session> {
        let _span = debug_span!("build", place = %self.place).entered();
        let scope = Arc::get_mut(&mut self.scope).ok_or_else(|| {
            ExecutorError::InvariantViolation("variable scope is shared before build".into())
        })?;
        build_variable_scope(&self.program, scope);
        for name in &self.feed_names {
            scope.add_var(name, self.program.find_var(name).cloned());
        }
        let nodes = build_op_func_list(self.place, &self.program, scope, &self.registry)?;

        let pool = Arc::new(DeviceContextPool::new(self.place, Arc::clone(&self.backend)));
        let analyzer = StreamAnalyzer::new(Arc::clone(&pool));
        let mut instructions: Vec<Instruction> = nodes
            .into_iter()
            .enumerate()
            .map(|(id, node)| {
                let ctx = analyzer.parse_device_context(node.operator.op_type(), node.func_type);
                Instruction::new(id, node, ctx)
            })
            .collect();

        let graph = build_dependency_graph(&mut instructions, scope, &analyzer)?;
        for instr in &mut instructions {
            instr.reset_context(scope);
        }
        if self.config.use_inplace {
            build_inplace(&mut instructions, scope, &graph);
        }

        let feed_vars = self
            .feed_names
            .iter()
            .map(|name| scope.get_var(name).map(Arc::clone))
            .collect::<Result<Vec<_>>>()?;
        let fetch_holder = Arc::clone(scope.get_var(FETCH_HOLDER)?);
        let queue = AsyncWorkQueue::new(&self.config, instructions.len(), scope.var_size())?;
        debug!(
            instructions = instructions.len(),
            vars = scope.var_size(),
            "interpreter built"
        );

        Ok(Session {
            instructions,
            graph,
            scope: Arc::clone(&self.scope),
            pool,
            queue,
            gc: GarbageCollector::new(self.config.gc_batch_bytes),
            exception: ExceptionHolder::new(),
            config: self.config.clone(),
            pass: AtomicU64::new(0),
            run_count: AtomicUsize::new(0),
            feed_vars,
            fetch_holder,
            fetch_names: self.fetch_names.clone(),
        })
    }
}

/// The immutable instruction graph plus per-pass counters, shared with
/// every worker task.
struct Session {
    instructions: Vec<Instruction>,
    graph: DependencyGraph,
    scope: Arc<VariableScope>,
    pool: Arc<DeviceContextPool>,
    queue: AsyncWorkQueue,
    gc: GarbageCollector,
    exception: ExceptionHolder,
    config: ExecutorConfig,
    pass: AtomicU64,
    run_count: AtomicUsize,
    feed_vars: Vec<Arc<Variable>>,
    fetch_holder: Arc<Variable>,
    fetch_names: Vec<String>,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl Session {
    fn execute(self: &Arc<Self>) -> Result<Vec<Tensor>> {
        let pass = self.pass.fetch_add(1, Ordering::AcqRel) + 1;
        let _span = debug_span!("execute", pass).entered();

        self.queue.prepare_atomic_deps(&self.graph.dependency_count);
        self.queue.prepare_atomic_var_ref(&self.graph.var_ref_count);
        self.run_count.store(0, Ordering::Release);
        self.exception.clear();
        self.fetch_holder.reset_fetch_list(self.fetch_names.len())?;

        self.queue.begin_pass();
        for (id, &deps) in self.graph.dependency_count.iter().enumerate() {
            if deps == 0 {
                let session = Arc::clone(self);
                self.queue
                    .add_task(self.instructions[id].func_type(), move || {
                        session.run_instruction_async(id, pass)
                    });
            }
        }
        self.queue.end_seeding();

        let event = self.queue.wait_event()?;
        if event == WaitEvent::ExceptionCaught || self.exception.is_caught() {
            // let in-flight tasks drain before reporting
            self.queue.wait_idle()?;
            self.gc.flush(self.scope.memory())?;
            let err = self.exception.take().unwrap_or_else(|| {
                ExecutorError::InvariantViolation(
                    "worker signalled an error but none was recorded".into(),
                )
            });
            debug!(%err, "pass failed");
            return Err(err);
        }

        let ran = self.run_count.load(Ordering::Acquire);
        if ran != self.instructions.len() {
            return Err(ExecutorError::InvariantViolation(format!(
                "expected {} instructions to run, {} did",
                self.instructions.len(),
                ran
            )));
        }
        self.gc.flush(self.scope.memory())?;
        self.collect_fetches()
    }

    fn collect_fetches(&self) -> Result<Vec<Tensor>> {
        let list = self.fetch_holder.take_fetch_list()?;
        self.fetch_names
            .iter()
            .enumerate()
            .map(|(col, name)| {
                list.get(col).cloned().flatten().ok_or_else(|| {
                    ExecutorError::InvalidArgument(format!(
                        "fetch target `{}` produced no value",
                        name
                    ))
                })
            })
            .collect()
    }

    fn fail(&self, err: ExecutorError) {
        if self.exception.catch(err) {
            self.queue.blocker().notify_exception();
        }
    }

    /// Run `id` and keep chaining the successors this thread is handed.
    fn run_instruction_async(self: &Arc<Self>, id: usize, pass: u64) {
        let mut ready = VecDeque::from([id]);
        while let Some(id) = ready.pop_front() {
            if self.exception.is_caught() {
                return;
            }
            let instr = &self.instructions[id];
            // producers record before releasing their successors
            if instr.input_events().iter().any(|e| !e.query(pass)) {
                self.fail(ExecutorError::InvariantViolation(format!(
                    "instruction {} (`{}`) became ready before its input events",
                    id,
                    instr.op_type()
                )));
                return;
            }

            if let Err(err) = self.run_instruction(instr) {
                if !err.is_end_of_input() {
                    warn!(op = instr.op_type(), %err, "instruction failed");
                }
                self.fail(err);
                return;
            }

            instr.event().record(pass);
            self.run_count.fetch_add(1, Ordering::AcqRel);

            let var_ref = self.queue.atomic_var_ref();
            if let Err(err) = check_gc(instr, var_ref, &self.scope, &self.gc, pass) {
                self.fail(err);
                return;
            }
            self.run_next_instructions(instr, &mut ready, pass);
        }
    }

    fn is_ready(&self, next: usize) -> bool {
        self.queue.atomic_deps()[next].fetch_sub(1, Ordering::AcqRel) == 1
    }

    fn spawn(self: &Arc<Self>, id: usize, pass: u64) {
        let session = Arc::clone(self);
        self.queue
            .add_task(self.instructions[id].func_type(), move || {
                session.run_instruction_async(id, pass)
            });
    }

    fn run_next_instructions(
        self: &Arc<Self>,
        instr: &Instruction,
        ready: &mut VecDeque<usize>,
        pass: u64,
    ) {
        let next = instr.next_instructions();
        if instr.func_type() == OpFuncType::QueueAsync {
            // host successors go to the host pool; device work stays here
            for &id in next.sync_run_ids() {
                if self.is_ready(id) {
                    self.spawn(id, pass);
                }
            }
            for &id in next.direct_run_ids().iter().chain(next.event_run_ids()) {
                if self.is_ready(id) {
                    ready.push_back(id);
                }
            }
            return;
        }

        for &id in next.event_run_ids() {
            if self.is_ready(id) {
                self.spawn(id, pass);
            }
        }
        let mut keep = None;
        for &id in next.sync_run_ids().iter().chain(next.direct_run_ids()) {
            if !self.is_ready(id) {
                continue;
            }
            if keep.is_none() {
                keep = Some(id);
            } else {
                self.spawn(id, pass);
            }
        }
        ready.extend(keep);
    }

    fn run_instruction(&self, instr: &Instruction) -> Result<()> {
        let op = instr.operator();
        let op_type = instr.op_type();
        let dev_ctx = instr.device_context();
        let runtime = instr.runtime_context();
        let ctx = ExecutionContext::new(op_type, runtime, dev_ctx, self.scope.memory());
        trace!(op = op_type, id = instr.id(), stream = ?dev_ctx.stream(), "run");

        let start = self.config.benchmark.then(Instant::now);
        let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<()> {
            let shapes = op.infer_shape(&ctx)?;
            if self.config.use_inplace {
                for pair in instr.inplace_info() {
                    share_inplace(pair, &shapes)?;
                }
            }
            dev_ctx.launch(|_| op.run(&ctx))
        }));
        match outcome {
            Ok(result) => result.map_err(|e| e.in_operator(op_type))?,
            Err(payload) => {
                return Err(ExecutorError::Panic {
                    op_type: op_type.to_string(),
                    message: panic_message(payload.as_ref()),
                })
            }
        }

        if let Some(start) = start {
            dev_ctx.wait();
            debug!(
                op = op_type,
                elapsed_us = start.elapsed().as_micros() as u64,
                "kernel finished"
            );
        }

        if self.config.check_nan_inf {
            for var in instr.runtime_context().outputs.values().flatten() {
                if var.tensor()?.is_some_and(|t| t.has_nan_or_inf()) {
                    return Err(ExecutorError::NanOrInf {
                        op_type: op_type.to_string(),
                        var: var.name().to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Point the output at the input's buffer when the inferred output shape
/// matches the input's.
fn share_inplace(pair: &InplacePair, shapes: &[(&'static str, Shape)]) -> Result<()> {
    let Some((_, out_shape)) = shapes.iter().find(|(arg, _)| *arg == pair.output_arg) else {
        return Ok(());
    };
    let Some(input) = pair.input.tensor()? else {
        return Ok(());
    };
    if input.shape() == out_shape {
        trace!(input = pair.input.name(), output = pair.output.name(), "share buffer");
        pair.output.set_tensor(input)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicBool;

    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::operator::Operator;
    use crate::ops::{MEMCPY_D2H, MEMCPY_H2D};
    use crate::program::{Attribute, OpDesc, VarDesc};

    fn vec1(data: &[f32]) -> Tensor {
        Tensor::new(data.to_vec(), Shape::new(vec![data.len()]))
    }

    fn unary(op_type: &str, x: &str, out: &str) -> OpDesc {
        OpDesc::new(op_type)
            .with_input("X", &[x])
            .with_output("Out", &[out])
    }

    fn binary(op_type: &str, x: &str, y: &str, out: &str) -> OpDesc {
        unary(op_type, x, out).with_input("Y", &[y])
    }

    fn scale(x: &str, out: &str, s: f32, bias: f32) -> OpDesc {
        unary("scale", x, out)
            .with_attr("scale", Attribute::Float(s))
            .with_attr("bias", Attribute::Float(bias))
    }

    fn interpreter(
        program: ProgramDesc,
        feeds: &[&str],
        fetches: &[&str],
        config: ExecutorConfig,
    ) -> InterpreterCore {
        InterpreterCore::new(Place::Cpu, program, VariableScope::new(), feeds, fetches, config)
            .unwrap()
    }

    #[derive(Debug)]
    struct Counting {
        runs: Arc<AtomicUsize>,
    }

    impl Operator for Counting {
        fn op_type(&self) -> &str {
            "counting"
        }

        fn run(&self, ctx: &ExecutionContext<'_>) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            ctx.set_output("Out", ctx.input("X")?)
        }
    }

    #[derive(Debug)]
    struct Flaky {
        fail: Arc<AtomicBool>,
    }

    impl Operator for Flaky {
        fn op_type(&self) -> &str {
            "flaky"
        }

        fn run(&self, ctx: &ExecutionContext<'_>) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ExecutorError::InvalidArgument("device lost".into()));
            }
            ctx.set_output("Out", ctx.input("X")?)
        }
    }

    #[derive(Debug)]
    struct Exhausted;

    impl Operator for Exhausted {
        fn op_type(&self) -> &str {
            "reader"
        }

        fn run(&self, _ctx: &ExecutionContext<'_>) -> Result<()> {
            Err(ExecutorError::end_of_input("reader"))
        }
    }

    #[derive(Debug)]
    struct Exploding;

    impl Operator for Exploding {
        fn op_type(&self) -> &str {
            "exploding"
        }

        fn run(&self, _ctx: &ExecutionContext<'_>) -> Result<()> {
            panic!("kernel exploded")
        }
    }

    #[test]
    fn test_add_same_input() {
        let mut program = ProgramDesc::new();
        program.declare_all(&["x", "y"]);
        program.append_op(binary("elementwise_add", "x", "x", "y"));
        let mut core = interpreter(program, &["x"], &["y"], ExecutorConfig::default());

        let out = core.run(vec![vec1(&[1.0, 2.0, 3.0])]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].data_f32(), &[2.0, 4.0, 6.0]);
    }

    fn matmul_scale_program() -> ProgramDesc {
        let mut program = ProgramDesc::new();
        program.declare_all(&["x", "w", "out"]);
        program.declare(VarDesc::persistable("mm"));
        program
            .append_op(binary("matmul", "x", "w", "mm"))
            .append_op(scale("mm", "out", 1.0, 0.0));
        program
    }

    fn matmul_feeds() -> Vec<Tensor> {
        let shape = Shape::new(vec![2, 2]);
        vec![
            Tensor::new(vec![1.0, 2.0, 3.0, 4.0], shape.clone()),
            Tensor::new(vec![1.0, 0.0, 0.0, 1.0], shape),
        ]
    }

    #[test]
    fn test_matmul_then_identity_scale_shares_buffer() {
        let mut core = interpreter(
            matmul_scale_program(),
            &["x", "w"],
            &["out"],
            ExecutorConfig::default(),
        );
        let out = core.run(matmul_feeds()).unwrap();
        assert_eq!(out[0].data_f32(), &[1.0, 2.0, 3.0, 4.0]);

        let mm = core.scope().get_var("mm").unwrap().get_tensor().unwrap();
        assert!(out[0].shares_storage(&mm));
        // the intermediate was collected, the persistable one was not
        assert!(core.scope().get_var("out").unwrap().is_reclaimed().unwrap());
        assert!(core.scope().get_var("mm").unwrap().holds_storage().unwrap());
    }

    #[test]
    fn test_inplace_toggle_keeps_results() {
        let mut with = interpreter(
            matmul_scale_program(),
            &["x", "w"],
            &["out"],
            ExecutorConfig::default(),
        );
        let mut without = interpreter(
            matmul_scale_program(),
            &["x", "w"],
            &["out"],
            ExecutorConfig::default().with_inplace(false),
        );
        let a = with.run(matmul_feeds()).unwrap();
        let b = without.run(matmul_feeds()).unwrap();
        assert_eq!(a[0].data_f32(), b[0].data_f32());

        let mm = without.scope().get_var("mm").unwrap().get_tensor().unwrap();
        assert!(!b[0].shares_storage(&mm));
    }

    #[test]
    fn test_independent_branches() {
        let mut program = ProgramDesc::new();
        program.declare_all(&["x", "y", "a", "b"]);
        program
            .append_op(unary("relu", "x", "a"))
            .append_op(scale("y", "b", 2.0, 1.0));
        let config = ExecutorConfig::default().with_host_num_threads(4);
        let mut core = interpreter(program, &["x", "y"], &["a", "b"], config);

        for i in 0..20 {
            let v = i as f32;
            let out = core.run(vec![vec1(&[-1.0, v]), vec1(&[v, 0.5])]).unwrap();
            assert_eq!(out[0].data_f32(), &[0.0, v]);
            assert_eq!(out[1].data_f32(), &[2.0 * v + 1.0, 2.0]);
        }
    }

    #[test]
    fn test_second_writer_of_temporary_is_rejected() {
        let mut program = ProgramDesc::new();
        program.declare_all(&["x", "t", "y"]);
        program
            .append_op(scale("x", "t", 0.0, 1.0))
            .append_op(scale("x", "t", 0.0, 2.0))
            .append_op(unary("relu", "t", "y"));
        let mut core = interpreter(program, &["x"], &["y"], ExecutorConfig::default());
        let err = core.run(vec![vec1(&[5.0])]).unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidArgument(_)));
        assert!(err.to_string().contains("`t`"));
    }

    #[test]
    fn test_unused_output_is_reclaimed() {
        let mut program = ProgramDesc::new();
        program.declare_all(&["x", "a", "unused"]);
        program
            .append_op(unary("relu", "x", "a"))
            .append_op(scale("x", "unused", 3.0, 0.0));
        let mut core = interpreter(program, &["x"], &["a"], ExecutorConfig::default());

        core.run(vec![vec1(&[1.0, -2.0])]).unwrap();
        let unused = core.scope().get_var("unused").unwrap();
        assert!(unused.is_reclaimed().unwrap());
        assert_eq!(unused.shape().unwrap().unwrap().dims(), &[2]);
        assert_eq!(core.scope().live_tensor_count().unwrap(), 0);
    }

    #[test]
    fn test_reruns_are_idempotent() {
        let mut program = ProgramDesc::new();
        program.declare_all(&["x", "a", "b", "c"]);
        program
            .append_op(unary("relu", "x", "a"))
            .append_op(scale("a", "b", 0.5, 0.0))
            .append_op(binary("elementwise_mul", "a", "b", "c"));
        let mut core = interpreter(program, &["x"], &["c"], ExecutorConfig::default());

        let first = core.run(vec![vec1(&[2.0, -1.0, 4.0])]).unwrap();
        for _ in 0..5 {
            let again = core.run(vec![vec1(&[2.0, -1.0, 4.0])]).unwrap();
            assert_eq!(first[0].data_f32(), again[0].data_f32());
        }
        let other = core.run(vec![vec1(&[6.0, 0.0, 0.0])]).unwrap();
        assert_eq!(other[0].data_f32(), &[18.0, 0.0, 0.0]);
    }

    #[test]
    fn test_each_instruction_runs_once_per_pass() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut registry = OpRegistry::default();
        {
            let runs = Arc::clone(&runs);
            registry.register("counting", move |_| {
                Ok(Box::new(Counting {
                    runs: Arc::clone(&runs),
                }))
            });
        }
        let mut program = ProgramDesc::new();
        program.declare_all(&["x", "a", "b", "c", "d"]);
        program
            .append_op(unary("counting", "x", "a"))
            .append_op(unary("counting", "a", "b"))
            .append_op(unary("counting", "a", "c"))
            .append_op(binary("elementwise_add", "b", "c", "d"))
            .append_op(unary("counting", "d", "e"));
        let mut core = interpreter(program, &["x"], &["d"], ExecutorConfig::default())
            .with_registry(registry);

        for _ in 0..3 {
            let out = core.run(vec![vec1(&[1.0])]).unwrap();
            assert_eq!(out[0].data_f32(), &[2.0]);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 12);
    }

    #[test]
    fn test_failure_then_recovery() {
        let fail = Arc::new(AtomicBool::new(true));
        let mut registry = OpRegistry::default();
        {
            let fail = Arc::clone(&fail);
            registry.register("flaky", move |_| {
                Ok(Box::new(Flaky {
                    fail: Arc::clone(&fail),
                }))
            });
        }
        let mut program = ProgramDesc::new();
        program.declare_all(&["x", "a", "b", "c"]);
        program
            .append_op(unary("relu", "x", "a"))
            .append_op(unary("flaky", "a", "b"))
            .append_op(scale("b", "c", 2.0, 0.0));
        let mut core = interpreter(program, &["x"], &["c"], ExecutorConfig::default())
            .with_registry(registry);

        match core.run(vec![vec1(&[1.0, 2.0])]) {
            Err(ExecutorError::Operator { op_type, source }) => {
                assert_eq!(op_type, "flaky");
                assert!(matches!(*source, ExecutorError::InvalidArgument(_)));
            }
            other => panic!("unexpected result: {other:?}"),
        }

        fail.store(false, Ordering::SeqCst);
        let out = core.run(vec![vec1(&[1.0, 2.0])]).unwrap();
        assert_eq!(out[0].data_f32(), &[2.0, 4.0]);
    }

    #[test]
    fn test_end_of_input_is_not_wrapped() {
        let mut registry = OpRegistry::default();
        registry.register("reader", |_| Ok(Box::new(Exhausted)));
        let mut program = ProgramDesc::new();
        program.declare_all(&["batch", "y"]);
        program
            .append_op(OpDesc::new("reader").with_output("Out", &["batch"]))
            .append_op(unary("relu", "batch", "y"));
        let mut core =
            interpreter(program, &[], &["y"], ExecutorConfig::default()).with_registry(registry);

        let err = core.run(vec![]).unwrap_err();
        assert!(err.is_end_of_input(), "got {err:?}");
    }

    #[test]
    fn test_kernel_panic_is_reported() {
        let mut registry = OpRegistry::default();
        registry.register("exploding", |_| Ok(Box::new(Exploding)));
        let mut program = ProgramDesc::new();
        program.declare_all(&["x", "y"]);
        program.append_op(unary("exploding", "x", "y"));
        let mut core =
            interpreter(program, &["x"], &["y"], ExecutorConfig::default()).with_registry(registry);

        match core.run(vec![vec1(&[1.0])]) {
            Err(ExecutorError::Panic { op_type, message }) => {
                assert_eq!(op_type, "exploding");
                assert_eq!(message, "kernel exploded");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_incomplete_pass_is_fatal() {
        let mut program = ProgramDesc::new();
        program.declare_all(&["x", "y"]);
        program.append_op(unary("relu", "x", "y"));
        let mut core = interpreter(program, &["x"], &["y"], ExecutorConfig::default());
        core.run(vec![vec1(&[1.0])]).unwrap();

        let session = core.session.as_mut().and_then(Arc::get_mut).unwrap();
        // the fetch instruction can never become ready
        let last = session.graph.dependency_count.len() - 1;
        session.graph.dependency_count[last] += 1;

        let err = core.run(vec![vec1(&[1.0])]).unwrap_err();
        assert!(matches!(err, ExecutorError::InvariantViolation(_)), "got {err:?}");
    }

    #[test]
    fn test_feed_count_mismatch() {
        let mut program = ProgramDesc::new();
        program.declare_all(&["x", "y"]);
        program.append_op(unary("relu", "x", "y"));
        let mut core = interpreter(program, &["x"], &["y"], ExecutorConfig::default());
        assert!(matches!(
            core.run(vec![]),
            Err(ExecutorError::FeedMismatch { expected: 1, got: 0 })
        ));
    }

    #[test]
    fn test_fetching_unproduced_variable_fails() {
        let mut program = ProgramDesc::new();
        program.declare_all(&["x", "y", "ghost"]);
        program.append_op(unary("relu", "x", "y"));
        let mut core = interpreter(program, &["x"], &["ghost"], ExecutorConfig::default());
        match core.run(vec![vec1(&[1.0])]) {
            Err(ExecutorError::Operator { op_type, .. }) => assert_eq!(op_type, "fetch_v2"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_check_nan_inf() {
        let mut program = ProgramDesc::new();
        program.declare_all(&["x", "y"]);
        program.append_op(scale("x", "y", 2.0, 0.0));
        let config = ExecutorConfig::default().with_check_nan_inf(true);
        let mut core = interpreter(program, &["x"], &["y"], config);

        match core.run(vec![vec1(&[f32::MAX, 1.0])]) {
            Err(ExecutorError::NanOrInf { op_type, var }) => {
                assert_eq!(op_type, "scale");
                assert_eq!(var, "y");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(core.run(vec![vec1(&[1.0, 1.0])]).is_ok());
    }

    #[test]
    fn test_device_place_with_copies() {
        let mut program = ProgramDesc::new();
        program.declare_all(&["x", "xd", "yd", "zd", "z"]);
        program
            .append_op(unary(MEMCPY_H2D, "x", "xd"))
            .append_op(unary("relu", "xd", "yd"))
            .append_op(scale("yd", "zd", 2.0, 0.0))
            .append_op(unary(MEMCPY_D2H, "zd", "z"));
        let config = ExecutorConfig::default().with_benchmark(true);
        let mut core = InterpreterCore::new(
            Place::Device(0),
            program,
            VariableScope::new(),
            &["x"],
            &["z"],
            config,
        )
        .unwrap();

        for _ in 0..3 {
            let out = core.run(vec![vec1(&[-3.0, 1.5, 2.0])]).unwrap();
            assert_eq!(out[0].data_f32(), &[0.0, 3.0, 4.0]);
        }
    }

    #[test]
    fn test_dry_run_reports_cost() {
        let mut core = interpreter(
            matmul_scale_program(),
            &["x", "w"],
            &["out"],
            ExecutorConfig::default(),
        );
        let cost = core.dry_run(matmul_feeds()).unwrap();
        // the 2x2 matmul output is the only fresh buffer
        assert_eq!(cost.peak_memory_bytes, 16);
        let again = core.dry_run(matmul_feeds()).unwrap();
        assert_eq!(again.peak_memory_bytes, 16);
    }

    #[test]
    fn test_inplace_chain_allocates_nothing() {
        let build = |inplace: bool| {
            let mut program = ProgramDesc::new();
            program.declare_all(&["x", "a", "b", "c"]);
            program
                .append_op(unary("relu", "x", "a"))
                .append_op(scale("a", "b", 2.0, 0.0))
                .append_op(unary("relu", "b", "c"));
            let config = ExecutorConfig::default().with_inplace(inplace);
            interpreter(program, &["x"], &["c"], config)
        };
        let feed = || {
            let data = (0..1024).map(|i| i as f32 - 512.0).collect();
            vec![Tensor::new(data, Shape::new(vec![1024]))]
        };

        let mut on = build(true);
        let mut off = build(false);
        let shared = on.dry_run(feed()).unwrap();
        let copied = off.dry_run(feed()).unwrap();
        assert_eq!(shared.peak_memory_bytes, 0);
        assert_eq!(copied.peak_memory_bytes, 4096);

        let a = on.run(feed()).unwrap();
        let b = off.run(feed()).unwrap();
        assert_eq!(a[0].data_f32(), b[0].data_f32());
        assert_eq!(a[0].data_f32()[513], 2.0);
    }

    #[test]
    fn test_batched_gc_flushes_at_pass_end() {
        let mut program = ProgramDesc::new();
        program.declare_all(&["x", "a", "b", "c"]);
        program
            .append_op(unary("relu", "x", "a"))
            .append_op(scale("a", "b", 2.0, 0.0))
            .append_op(binary("elementwise_add", "a", "b", "c"));
        let config = ExecutorConfig::default().with_gc_batch_bytes(1 << 20);
        let mut core = interpreter(program, &["x"], &["c"], config);

        let out = core.run(vec![vec1(&[1.0, -1.0])]).unwrap();
        assert_eq!(out[0].data_f32(), &[3.0, 0.0]);
        for name in ["a", "b", "c"] {
            assert!(core.scope().get_var(name).unwrap().is_reclaimed().unwrap());
        }
    }

    #[test]
    fn test_preloaded_weights_survive() {
        let mut scope = VariableScope::new();
        let w = scope.add_var("w", Some(VarDesc::persistable("w")));
        scope.var(w).set_tensor(vec1(&[10.0, 20.0])).unwrap();

        let mut program = ProgramDesc::new();
        program.declare_all(&["x", "y"]);
        program.append_op(binary("elementwise_add", "x", "w", "y"));
        let config = ExecutorConfig::default();
        let mut core =
            InterpreterCore::new(Place::Cpu, program, scope, &["x"], &["y"], config).unwrap();

        for i in 0..3 {
            let out = core.run(vec![vec1(&[i as f32, 1.0])]).unwrap();
            assert_eq!(out[0].data_f32(), &[10.0 + i as f32, 21.0]);
        }
        assert!(core.scope().get_var("w").unwrap().holds_storage().unwrap());
    }

    /// Build a random single-assignment program and its sequential result.
    fn random_program(
        rng: &mut StdRng,
        len: usize,
    ) -> (ProgramDesc, Vec<String>, HashMap<String, Vec<f32>>) {
        let mut values: HashMap<String, Vec<f32>> = HashMap::new();
        values.insert("f0".into(), vec![0.5, -1.0, 2.0, 0.25]);
        values.insert("f1".into(), vec![-0.5, 1.5, 0.75, -2.0]);
        let mut names = vec!["f0".to_string(), "f1".to_string()];
        let mut program = ProgramDesc::new();
        program.declare_all(&["f0", "f1"]);

        for i in 0..len {
            let out = format!("t{i}");
            let a = names[rng.gen_range(0..names.len())].clone();
            let b = names[rng.gen_range(0..names.len())].clone();
            let (va, vb) = (&values[&a], &values[&b]);
            let (desc, result): (OpDesc, Vec<f32>) = match rng.gen_range(0..4) {
                0 => (
                    binary("elementwise_add", &a, &b, &out),
                    va.iter().zip(vb).map(|(x, y)| x + y).collect(),
                ),
                1 => (
                    binary("elementwise_mul", &a, &b, &out),
                    va.iter().zip(vb).map(|(x, y)| x * y).collect(),
                ),
                2 => (unary("relu", &a, &out), va.iter().map(|x| x.max(0.0)).collect()),
                _ => (
                    scale(&a, &out, 0.5, 0.25),
                    va.iter().map(|x| x * 0.5 + 0.25).collect(),
                ),
            };
            program.declare(VarDesc::new(out.clone()));
            program.append_op(desc);
            values.insert(out.clone(), result);
            names.push(out);
        }

        let mut fetches = vec![names[names.len() - 1].clone()];
        for _ in 0..3 {
            fetches.push(names[rng.gen_range(2..names.len())].clone());
        }
        (program, fetches, values)
    }

    #[test]
    fn test_random_programs_match_sequential_evaluation() {
        for seed in 0..8u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let (program, fetches, expected) = random_program(&mut rng, 40);
            let fetch_refs: Vec<&str> = fetches.iter().map(String::as_str).collect();
            let inplace = seed % 2 == 0;
            let config = ExecutorConfig::default()
                .with_inplace(inplace)
                .with_host_num_threads(1 + (seed as usize % 4));
            let mut core = interpreter(program, &["f0", "f1"], &fetch_refs, config);

            for _ in 0..2 {
                let feeds = vec![
                    Tensor::new(expected["f0"].clone(), Shape::new(vec![4])),
                    Tensor::new(expected["f1"].clone(), Shape::new(vec![4])),
                ];
                let out = core.run(feeds).unwrap();
                assert_eq!(out.len(), fetches.len());
                for (tensor, name) in out.iter().zip(&fetches) {
                    for (got, want) in tensor.data_f32().iter().zip(&expected[name]) {
                        if want.is_nan() {
                            assert!(got.is_nan());
                        } else {
                            assert_relative_eq!(*got, *want, max_relative = 1e-6);
                        }
                    }
                }
            }
        }
    }
}
