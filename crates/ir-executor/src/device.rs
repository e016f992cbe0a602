use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ir_tensor::ComputeBackend;

/// Where a program executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Place {
    Cpu,
    /// An accelerator with its own asynchronous streams.
    Device(u32),
}

impl Place {
    pub fn is_device(&self) -> bool {
        matches!(self, Place::Device(_))
    }
}

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Place::Cpu => write!(f, "cpu"),
            Place::Device(id) => write!(f, "device:{}", id),
        }
    }
}

/// The queue a device context submits work to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Host,
    Compute,
    DeviceToHost,
    HostToDevice,
}

/// A stream on a place, with the backend its kernels launch on.
///
/// Kernels complete in submission order; `wait` blocks until everything
/// submitted before the call has finished.
pub struct DeviceContext {
    place: Place,
    stream: StreamKind,
    backend: Arc<dyn ComputeBackend>,
    submitted: AtomicU64,
    completed: AtomicU64,
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("place", &self.place)
            .field("stream", &self.stream)
            .field("backend", &self.backend.name())
            .field("submitted", &self.submitted.load(Ordering::Relaxed))
            .finish()
    }
}

struct CompletionGuard<'a>(&'a AtomicU64);

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }
}

impl DeviceContext {
    pub fn new(place: Place, stream: StreamKind, backend: Arc<dyn ComputeBackend>) -> Self {
        Self {
            place,
            stream,
            backend,
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    pub fn place(&self) -> Place {
        self.place
    }

    pub fn stream(&self) -> StreamKind {
        self.stream
    }

    pub fn backend(&self) -> &dyn ComputeBackend {
        self.backend.as_ref()
    }

    /// Submit a kernel to this stream.
    pub fn launch<T>(&self, kernel: impl FnOnce(&dyn ComputeBackend) -> T) -> T {
        self.submitted.fetch_add(1, Ordering::AcqRel);
        let _done = CompletionGuard(&self.completed);
        kernel(self.backend.as_ref())
    }

    /// Block until all previously submitted kernels have completed.
    pub fn wait(&self) {
        let target = self.submitted.load(Ordering::Acquire);
        while self.completed.load(Ordering::Acquire) < target {
            std::thread::yield_now();
        }
    }
}

/// Cross-stream synchronization handle.
///
/// A producer records the event after launching its kernel and before it
/// releases its successors; consumers on other streams poll it with
/// [`DeviceEvent::query`], the garbage collector waits on it. Records are tagged
/// with the execution pass so a handle never needs resetting between runs.
#[derive(Debug)]
pub struct DeviceEvent {
    place: Place,
    recorded: AtomicU64,
}

impl DeviceEvent {
    pub fn new(place: Place) -> Self {
        Self {
            place,
            recorded: AtomicU64::new(0),
        }
    }

    pub fn place(&self) -> Place {
        self.place
    }

    pub fn record(&self, pass: u64) {
        self.recorded.fetch_max(pass, Ordering::AcqRel);
    }

    /// True once the event was recorded in `pass` (or a later one).
    pub fn query(&self, pass: u64) -> bool {
        self.recorded.load(Ordering::Acquire) >= pass
    }

    /// Block until [`DeviceEvent::query`] holds. Garbage is handed to the
    /// collector only after its event was recorded, so this returns at once
    /// there; the spin only matters for callers racing a producer.
    pub fn wait(&self, pass: u64) {
        while !self.query(pass) {
            std::hint::spin_loop();
            std::thread::yield_now();
        }
    }
}

/// Device contexts for one place. On a device place, compute and the two
/// copy directions each get their own stream; host operators share the host
/// context.
#[derive(Debug)]
pub struct DeviceContextPool {
    place: Place,
    host: Arc<DeviceContext>,
    compute: Arc<DeviceContext>,
    d2h: Arc<DeviceContext>,
    h2d: Arc<DeviceContext>,
}

impl DeviceContextPool {
    pub fn new(place: Place, backend: Arc<dyn ComputeBackend>) -> Self {
        let host = Arc::new(DeviceContext::new(
            Place::Cpu,
            StreamKind::Host,
            Arc::clone(&backend),
        ));
        if !place.is_device() {
            return Self {
                place,
                compute: Arc::clone(&host),
                d2h: Arc::clone(&host),
                h2d: Arc::clone(&host),
                host,
            };
        }
        let stream = |kind| Arc::new(DeviceContext::new(place, kind, Arc::clone(&backend)));
        Self {
            place,
            compute: stream(StreamKind::Compute),
            d2h: stream(StreamKind::DeviceToHost),
            h2d: stream(StreamKind::HostToDevice),
            host,
        }
    }

    pub fn place(&self) -> Place {
        self.place
    }

    pub fn get(&self, stream: StreamKind) -> &Arc<DeviceContext> {
        match stream {
            StreamKind::Host => &self.host,
            StreamKind::Compute => &self.compute,
            StreamKind::DeviceToHost => &self.d2h,
            StreamKind::HostToDevice => &self.h2d,
        }
    }

    pub fn wait_all(&self) {
        for ctx in [&self.host, &self.compute, &self.d2h, &self.h2d] {
            ctx.wait();
        }
    }
}
