//! Bounded concurrency and cancellation plumbing.
//!
//! Three independently sized queues rate-limit the tree importer and
//! exporter: local I/O (SSD), store traffic (network), and compression
//! (CPU). The cancellation registry lets a coordinator cancel every task
//! rooted in a request.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Default width of the local I/O queue.
pub const DEFAULT_SSD_WIDTH: usize = 32;

/// Default width of the store traffic queue.
pub const DEFAULT_NETWORK_WIDTH: usize = 100;

/// Floor applied when the network queue is narrowed after a transient
/// store failure.
pub const NETWORK_FLOOR: usize = 10;

/// Bounded queues shared by tree import/export pipelines.
#[derive(Clone, Debug)]
pub struct ConcurrencyLimits {
    ssd_width: usize,
    network_width: usize,
    cpu_width: usize,
    ssd: Arc<Semaphore>,
    network: Arc<Semaphore>,
    cpu: Arc<Semaphore>,
    /// Optional throttle on bytes concurrently in flight to the store.
    upload_bytes: Option<Arc<Semaphore>>,
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self::new(DEFAULT_SSD_WIDTH, DEFAULT_NETWORK_WIDTH, num_cpus::get())
    }
}

impl ConcurrencyLimits {
    pub fn new(ssd: usize, network: usize, cpu: usize) -> Self {
        Self {
            ssd_width: ssd.max(1),
            network_width: network.max(1),
            cpu_width: cpu.max(1),
            ssd: Arc::new(Semaphore::new(ssd.max(1))),
            network: Arc::new(Semaphore::new(network.max(1))),
            cpu: Arc::new(Semaphore::new(cpu.max(1))),
            upload_bytes: None,
        }
    }

    /// Additionally throttle uploads by bytes in flight.
    pub fn with_upload_byte_budget(mut self, bytes: usize) -> Self {
        self.upload_bytes = Some(Arc::new(Semaphore::new(bytes.max(1))));
        self
    }

    /// A copy of these limits with the network queue narrowed to `width`.
    ///
    /// Used by the importer's transient-failure fallback; the byte budget
    /// carries over at full size.
    pub fn with_network_width(&self, width: usize) -> Self {
        let mut narrowed = Self::new(self.ssd_width, width, self.cpu_width);
        narrowed.upload_bytes = self.upload_bytes.clone();
        narrowed
    }

    pub fn ssd_width(&self) -> usize {
        self.ssd_width
    }

    pub fn network_width(&self) -> usize {
        self.network_width
    }

    pub fn cpu_width(&self) -> usize {
        self.cpu_width
    }

    pub async fn acquire_ssd(&self) -> OwnedSemaphorePermit {
        Arc::clone(&self.ssd)
            .acquire_owned()
            .await
            .expect("ssd semaphore never closes")
    }

    pub async fn acquire_network(&self) -> OwnedSemaphorePermit {
        Arc::clone(&self.network)
            .acquire_owned()
            .await
            .expect("network semaphore never closes")
    }

    pub async fn acquire_cpu(&self) -> OwnedSemaphorePermit {
        Arc::clone(&self.cpu)
            .acquire_owned()
            .await
            .expect("cpu semaphore never closes")
    }

    /// Reserve `bytes` of the upload budget, if one is configured.
    ///
    /// Requests larger than the whole budget clamp to it rather than
    /// deadlocking.
    pub async fn acquire_upload_bytes(&self, bytes: u64) -> Option<OwnedSemaphorePermit> {
        let budget = self.upload_bytes.as_ref()?;
        let want = (bytes.min(u32::MAX as u64) as u32).min(budget.available_permits().max(1) as u32);
        Some(
            Arc::clone(budget)
                .acquire_many_owned(want.max(1))
                .await
                .expect("upload budget semaphore never closes"),
        )
    }
}

/// Registry of cancellable tasks, keyed by caller-chosen labels.
///
/// Tokens are children of one root token, so `cancel_all` reaches tasks
/// registered both before and after the call only if they derive from the
/// root; tasks registered after a `cancel_all` start cancelled.
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    root: CancellationToken,
    tasks: DashMap<String, CancellationToken>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task and receive its token.
    ///
    /// Registering a label twice returns the existing token.
    #[instrument(skip(self))]
    pub fn register(&self, label: impl Into<String> + std::fmt::Debug) -> CancellationToken {
        self.tasks
            .entry(label.into())
            .or_insert_with(|| self.root.child_token())
            .clone()
    }

    /// Cancel one task by label. No-op for unknown labels.
    #[instrument(skip(self))]
    pub fn cancel(&self, label: &str) {
        if let Some((_, token)) = self.tasks.remove(label) {
            debug!(label, "cancelling task");
            token.cancel();
        }
    }

    /// Cancel every registered task.
    #[instrument(skip(self))]
    pub fn cancel_all(&self) {
        debug!(tasks = self.tasks.len(), "cancelling all tasks");
        self.root.cancel();
        self.tasks.clear();
    }

    /// Whether the whole registry has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.root.is_cancelled()
    }
}
