use crate::error::{ExecutorError, Result};

/// Default size of the host worker pool.
pub const DEFAULT_HOST_NUM_THREADS: usize = 4;

/// Default size of the device-launch worker pool.
pub const DEFAULT_DEVICE_NUM_THREADS: usize = 1;

/// Immutable interpreter configuration, fixed when the interpreter is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Let qualifying outputs alias the buffer of their input.
    pub use_inplace: bool,
    /// Scan every output for NaN/Inf after its kernel runs.
    pub check_nan_inf: bool,
    /// Synchronize the device context after each kernel and log its latency.
    pub benchmark: bool,
    /// Worker threads for host (`QueueSync`) instructions.
    pub host_num_threads: usize,
    /// Worker threads for device-launch (`QueueAsync`) instructions.
    pub device_num_threads: usize,
    /// Bytes of garbage to accumulate before reclaiming. Zero reclaims
    /// each variable as soon as its last consumer finishes.
    pub gc_batch_bytes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            use_inplace: true,
            check_nan_inf: false,
            benchmark: false,
            host_num_threads: DEFAULT_HOST_NUM_THREADS,
            device_num_threads: DEFAULT_DEVICE_NUM_THREADS,
            gc_batch_bytes: 0,
        }
    }
}

impl ExecutorConfig {
    pub fn with_inplace(mut self, enabled: bool) -> Self {
        self.use_inplace = enabled;
        self
    }

    pub fn with_check_nan_inf(mut self, enabled: bool) -> Self {
        self.check_nan_inf = enabled;
        self
    }

    pub fn with_benchmark(mut self, enabled: bool) -> Self {
        self.benchmark = enabled;
        self
    }

    pub fn with_host_num_threads(mut self, n: usize) -> Self {
        self.host_num_threads = n;
        self
    }

    pub fn with_device_num_threads(mut self, n: usize) -> Self {
        self.device_num_threads = n;
        self
    }

    pub fn with_gc_batch_bytes(mut self, bytes: usize) -> Self {
        self.gc_batch_bytes = bytes;
        self
    }

    /// Read overrides from the process environment.
    ///
    /// Recognized variables: `IR_EXEC_USE_INPLACE`, `IR_EXEC_CHECK_NAN_INF`,
    /// `IR_EXEC_BENCHMARK`, `IR_EXEC_HOST_THREADS`, `IR_EXEC_DEVICE_THREADS`,
    /// `IR_EXEC_GC_BATCH_BYTES`. Unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ExecutorConfig::from_env`] with an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(v) = lookup("IR_EXEC_USE_INPLACE") {
            cfg.use_inplace = parse_bool("IR_EXEC_USE_INPLACE", &v)?;
        }
        if let Some(v) = lookup("IR_EXEC_CHECK_NAN_INF") {
            cfg.check_nan_inf = parse_bool("IR_EXEC_CHECK_NAN_INF", &v)?;
        }
        if let Some(v) = lookup("IR_EXEC_BENCHMARK") {
            cfg.benchmark = parse_bool("IR_EXEC_BENCHMARK", &v)?;
        }
        if let Some(v) = lookup("IR_EXEC_HOST_THREADS") {
            cfg.host_num_threads = parse_usize("IR_EXEC_HOST_THREADS", &v)?;
        }
        if let Some(v) = lookup("IR_EXEC_DEVICE_THREADS") {
            cfg.device_num_threads = parse_usize("IR_EXEC_DEVICE_THREADS", &v)?;
        }
        if let Some(v) = lookup("IR_EXEC_GC_BATCH_BYTES") {
            cfg.gc_batch_bytes = parse_usize("IR_EXEC_GC_BATCH_BYTES", &v)?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Both worker pools need at least one thread.
    pub fn validate(&self) -> Result<()> {
        if self.host_num_threads == 0 || self.device_num_threads == 0 {
            return Err(ExecutorError::InvalidArgument(format!(
                "worker pools need at least one thread (host={}, device={})",
                self.host_num_threads, self.device_num_threads
            )));
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(ExecutorError::InvalidArgument(format!(
            "{key}: expected a boolean, got {value:?}"
        ))),
    }
}

fn parse_usize(key: &str, value: &str) -> Result<usize> {
    value.trim().parse().map_err(|_| {
        ExecutorError::InvalidArgument(format!("{key}: expected an integer, got {value:?}"))
    })
}
