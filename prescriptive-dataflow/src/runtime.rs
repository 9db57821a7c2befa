//! The runtime value owning settings, logging, and the transport handle.
//!
//! The original design of this kind of system tends toward process-wide singletons for
//! configuration and communication. Here these are explicit: a [`Runtime`] is a cheap
//! handle, contexts keep a clone of it, and tests construct fresh runtimes with
//! programmatic settings instead of mutating the process environment.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::dist::{Communicator, LocalCommunicator};
use crate::logging::{LogSink, Logger};

/// The scheduler variants, selectable per runtime via [`Settings::scheduler`] or the
/// `SCHEDULER` environment variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    /// The default: per-worker LIFO deques with stealing, in the manner of a task pool.
    TaskPool,
    /// Per-worker FIFO deques with stealing.
    FifoSteal,
    /// A single shared FIFO queue, no local queues, no stealing.
    FifoSingle,
    /// Like [`SchedulerKind::FifoSteal`], additionally routing instances that carry an
    /// affinity hint to the hinted worker's queue.
    FifoAffinity,
}

impl SchedulerKind {
    /// True if workers keep local queues and steal from each other.
    pub(crate) fn steals(self) -> bool {
        !matches!(self, SchedulerKind::FifoSingle)
    }

    /// True if affinity hints route across workers.
    pub(crate) fn affinity_aware(self) -> bool {
        matches!(self, SchedulerKind::FifoAffinity)
    }

    /// True if local deques pop newest-first.
    pub(crate) fn lifo(self) -> bool {
        matches!(self, SchedulerKind::TaskPool)
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "TASK_POOL" => Some(SchedulerKind::TaskPool),
            "FIFO_STEAL" => Some(SchedulerKind::FifoSteal),
            "FIFO_SINGLE" => Some(SchedulerKind::FifoSingle),
            "FIFO_AFFINITY" => Some(SchedulerKind::FifoAffinity),
            _ => None,
        }
    }
}

/// Configuration for contexts created from a runtime.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Worker count; defaults to the host parallelism.
    pub threads: usize,
    /// Scheduler variant.
    pub scheduler: SchedulerKind,
    /// Order run queues by step priority instead of insertion.
    pub use_priority: bool,
    /// Pin worker threads to cores with this stride; zero disables pinning.
    pub pin_stride: usize,
    /// Name of the distributed transport mode, if any. The core only uses this to decide
    /// whether cross-process hooks fire; the transport itself is supplied separately.
    pub dist_mode: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            threads: num_cpus::get(),
            scheduler: SchedulerKind::TaskPool,
            use_priority: false,
            pin_stride: 0,
            dist_mode: None,
        }
    }
}

impl Settings {
    /// Read settings from the environment.
    ///
    /// Recognized names: `NUM_THREADS`, `SCHEDULER`, `USE_PRIORITY`, `PIN_THREADS`,
    /// `DIST_MODE`. Unset or unparsable values fall back to the defaults; an unknown
    /// scheduler name is reported once and falls back to the task pool.
    pub fn from_env() -> Self {
        let mut settings = Settings::default();
        if let Ok(threads) = std::env::var("NUM_THREADS") {
            match threads.parse::<usize>() {
                Ok(n) if n > 0 => settings.threads = n,
                _ => log::warn!("ignoring NUM_THREADS={:?}", threads),
            }
        }
        if let Ok(name) = std::env::var("SCHEDULER") {
            match SchedulerKind::parse(&name) {
                Some(kind) => settings.scheduler = kind,
                None => log::warn!("unsupported scheduler {:?}, using TASK_POOL", name),
            }
        }
        if let Ok(prior) = std::env::var("USE_PRIORITY") {
            settings.use_priority = prior.parse::<i64>().map(|x| x != 0).unwrap_or(false);
        }
        if let Ok(stride) = std::env::var("PIN_THREADS") {
            settings.pin_stride = stride.parse::<usize>().unwrap_or(0);
        }
        if let Ok(mode) = std::env::var("DIST_MODE") {
            if !mode.is_empty() {
                settings.dist_mode = Some(mode);
            }
        }
        settings
    }
}

/// A handle on the shared runtime state: settings, the logging sink, and the communicator.
///
/// Clones are cheap and refer to the same state. Contexts capture the runtime at
/// construction; changing the logging sink afterwards affects only contexts created later.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

struct Inner {
    settings: Settings,
    logger: RwLock<Logger>,
    communicator: RwLock<Arc<dyn Communicator>>,
    announced: AtomicBool,
}

impl Runtime {
    /// A runtime with the given settings.
    pub fn new(settings: Settings) -> Self {
        Runtime {
            inner: Arc::new(Inner {
                settings,
                logger: RwLock::new(Logger::disabled()),
                communicator: RwLock::new(Arc::new(LocalCommunicator)),
                announced: AtomicBool::new(false),
            }),
        }
    }

    /// A runtime configured from the environment.
    pub fn from_env() -> Self {
        Runtime::new(Settings::from_env())
    }

    /// A runtime with default settings and a fixed worker count. Intended for tests and
    /// examples that must not depend on the host or the process environment.
    pub fn fixed(threads: usize) -> Self {
        Runtime::new(Settings { threads: threads.max(1), ..Settings::default() })
    }

    /// The settings contexts created from this runtime will use.
    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// Attach a sink receiving every [`RuntimeEvent`](crate::logging::RuntimeEvent) from
    /// contexts created after this call.
    pub fn enable_logging(&self, sink: Arc<LogSink>) {
        *self.inner.logger.write() = Logger::new(sink);
    }

    /// The logger contexts created from this runtime will capture.
    pub fn logger(&self) -> Logger {
        self.inner.logger.read().clone()
    }

    /// Install the message transport. Without this call a local-only transport is used and
    /// cross-process hints are ignored.
    pub fn set_communicator(&self, communicator: Arc<dyn Communicator>) {
        *self.inner.communicator.write() = communicator;
    }

    /// The installed message transport.
    pub fn communicator(&self) -> Arc<dyn Communicator> {
        self.inner.communicator.read().clone()
    }

    /// True if a distributed transport mode is configured.
    pub fn distributed(&self) -> bool {
        self.inner.settings.dist_mode.is_some()
    }

    /// Log the scheduler selection once per runtime, in the manner of a startup banner.
    pub(crate) fn announce(&self) {
        if !self.inner.announced.swap(true, Ordering::Relaxed) {
            let s = &self.inner.settings;
            log::info!(
                "using {:?} scheduler [priority {}] [pinning {}] with {} threads",
                s.scheduler,
                if s.use_priority { "on" } else { "off" },
                if s.pin_stride > 0 { "on" } else { "off" },
                s.threads,
            );
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime").field("settings", &self.inner.settings).finish()
    }
}
