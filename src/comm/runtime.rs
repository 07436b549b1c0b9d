//! The runtime context: one value per locale holding every plane.
//!
//! `Runtime::init` wires the substrate, dispatcher, memory plane and
//! diagnostics together and starts the coordinator's polling task. All
//! public communication operations hang off the resulting `Arc`.

use super::diag::CommDiagnostics;
use super::dispatch::Dispatcher;
use super::fork::{CompletionTable, ForkFn, FuncTable, TaskSpawner};
use super::memory::{BumpHeap, MemoryPlane};
use super::progress::{self, ShutdownSignal};
use super::substrate::{Substrate, SubstrateError};
use super::types::WaitMode;
use crate::types::{FuncId, LocaleId, RemoteAddr};
use std::future::Future;
use std::panic::Location;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};

/// Communication failure. There is no recoverable class: callers are
/// expected to treat any error as fatal to the distributed job and route it
/// to an exit path.
#[derive(Debug, Error)]
pub enum CommError {
    #[error("substrate failure in {call}: {source}")]
    Substrate {
        call: &'static str,
        source: SubstrateError,
    },
    #[error("wire encoding failed: {0}")]
    Wire(#[from] postcard::Error),
    #[error("unknown {0}")]
    UnknownFunction(FuncId),
    #[error("global registry is not allocated")]
    RegistryUnallocated,
    #[error("global index {index} out of range: {count} globals registered")]
    GlobalOutOfRange { index: u32, count: u32 },
    #[error("registry of {requested} globals exceeds capacity of {capacity}")]
    RegistryOverflow { requested: u32, capacity: u32 },
    #[error("heap cannot satisfy a {size}-byte allocation")]
    HeapExhausted { size: usize },
    #[error("argument of {len} bytes exceeds the non-blocking fork limit of {max}")]
    ArgTooLarge { len: usize, max: usize },
    #[error("{0}")]
    Internal(&'static str),
}

/// Init-time settings for one locale's runtime.
#[derive(Debug, Clone, Default)]
pub struct CommConfig {
    /// Seed the verbose-comm flag at init.
    pub verbose_comm: bool,
    /// Seed the comm-diagnostics flag at init.
    pub comm_diagnostics: bool,
}

impl CommConfig {
    /// Read the flag seeds from `QUILT_VERBOSE_COMM` and
    /// `QUILT_COMM_DIAGNOSTICS`.
    pub fn from_env() -> Self {
        Self {
            verbose_comm: flag_from(std::env::var("QUILT_VERBOSE_COMM").ok().as_deref()),
            comm_diagnostics: flag_from(std::env::var("QUILT_COMM_DIAGNOSTICS").ok().as_deref()),
        }
    }
}

fn flag_from(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("1") | Some("true") | Some("yes") | Some("on")
    )
}

/// One locale's communication runtime.
pub struct Runtime<S: Substrate> {
    substrate: S,
    locale: LocaleId,
    num_locales: u32,
    mem: MemoryPlane,
    funcs: FuncTable,
    completions: CompletionTable,
    diag: CommDiagnostics,
    spawner: Arc<dyn TaskSpawner>,
    shutdown: ShutdownSignal,
}

impl<S: Substrate> Runtime<S> {
    /// Bring the runtime up on this locale's endpoint: attach the dispatcher,
    /// capture the segment table, select blocking waits, seed the diagnostic
    /// flags and, on locale 0, start the polling task.
    ///
    /// Must run inside a tokio runtime; delivery and polling are spawned
    /// tasks.
    pub fn init(
        substrate: S,
        spawner: Arc<dyn TaskSpawner>,
        config: CommConfig,
    ) -> Result<Arc<Self>, CommError> {
        let locale = substrate.locale_id();
        let num_locales = substrate.num_locales();

        let completions = CompletionTable::new();
        let (shutdown_handle, shutdown_rx) = completions.register();

        let mem = MemoryPlane::new(
            substrate.local_memory(),
            substrate.segment_info(),
            Arc::new(BumpHeap::new()),
        );
        let diag = CommDiagnostics::new(mem.local().clone());

        let rt = Arc::new(Self {
            substrate,
            locale,
            num_locales,
            mem,
            funcs: FuncTable::new(),
            completions,
            diag,
            spawner,
            shutdown: ShutdownSignal::new(shutdown_handle, shutdown_rx),
        });

        rt.substrate
            .attach(Arc::new(Dispatcher::new(rt.clone())))
            .map_err(|e| rt.substrate_err("attach", e))?;
        rt.substrate.set_wait_mode(WaitMode::Block);

        if config.verbose_comm {
            rt.diag.set_verbose(true);
        }
        if config.comm_diagnostics {
            rt.diag.set_enabled(true);
        }

        if locale == 0 {
            progress::start_polling(&rt)?;
        }

        debug!("locale {} of {} attached", locale, num_locales);
        Ok(rt)
    }

    pub fn locale_id(&self) -> LocaleId {
        self.locale
    }

    pub fn num_locales(&self) -> u32 {
        self.num_locales
    }

    pub fn is_coordinator(&self) -> bool {
        self.locale == 0
    }

    /// One line announcing this locale, once the fabric is up.
    pub fn rollcall(&self) {
        info!(
            "executing on locale {} of {} locale(s): {}",
            self.locale,
            self.num_locales,
            self.substrate.locale_name()
        );
    }

    /// Hand the segment beyond the registry prefix to the heap allocator.
    /// Without segments there is no shared heap at all.
    pub fn init_shared_heap(&self, num_globals: u32) -> Result<(), CommError> {
        self.mem.init_shared_heap(num_globals)
    }

    /// Fix the global registry location for `num_globals` entries.
    pub fn alloc_registry(&self, num_globals: u32) -> Result<(), CommError> {
        self.mem.alloc_registry(num_globals)
    }

    /// Register a fork target. Ids follow registration order, so every
    /// locale must register the same functions in the same order.
    pub fn register_fork(&self, f: ForkFn) -> FuncId {
        self.funcs.register(f)
    }

    pub fn set_global(&self, index: u32, value: RemoteAddr) -> Result<(), CommError> {
        self.mem.set_global(index, value)
    }

    pub fn global(&self, index: u32) -> Result<RemoteAddr, CommError> {
        self.mem.global(index)
    }

    pub fn heap_alloc(&self, size: usize) -> Result<RemoteAddr, CommError> {
        self.mem.heap_alloc(size)
    }

    pub fn heap_free(&self, addr: RemoteAddr, size: usize) {
        self.mem.heap_free(addr, size);
    }

    /// Read this locale's own memory. Never touches the network.
    pub fn local_read(&self, addr: RemoteAddr, dst: &mut [u8]) -> Result<(), CommError> {
        self.mem
            .local()
            .read(addr, dst)
            .map_err(|e| CommError::Substrate { call: "local read", source: e })
    }

    /// Write this locale's own memory. Never touches the network.
    pub fn local_write(&self, addr: RemoteAddr, src: &[u8]) -> Result<(), CommError> {
        self.mem
            .local()
            .write(addr, src)
            .map_err(|e| CommError::Substrate { call: "local write", source: e })
    }

    /// One-sided put of `src` to `dst` on `locale`. Complete on return.
    ///
    /// The self-locale case degenerates to a local copy without touching the
    /// substrate, the trace plane or the counters.
    #[track_caller]
    pub fn put<'a>(
        &'a self,
        locale: LocaleId,
        dst: RemoteAddr,
        src: &'a [u8],
    ) -> impl Future<Output = Result<(), CommError>> + Send + 'a {
        let at = Location::caller();
        async move {
            if locale == self.locale {
                return self
                    .mem
                    .local()
                    .write(dst, src)
                    .map_err(|e| CommError::Substrate { call: "local memmove (put)", source: e });
            }
            if self.diag.verbose() {
                info!("{}: {}:{}: remote put to {}", self.locale, at.file(), at.line(), locale);
            }
            self.diag.record_put();
            self.substrate.put(locale, dst, src).await.map_err(|e| {
                error!(
                    "{}: {}:{}: substrate put failed: {} ({})",
                    self.locale,
                    at.file(),
                    at.line(),
                    e.name(),
                    e
                );
                CommError::Substrate { call: "substrate put", source: e }
            })
        }
    }

    /// One-sided get of `dst.len()` bytes from `src` on `locale`, materialized
    /// in `dst` on return.
    #[track_caller]
    pub fn get<'a>(
        &'a self,
        locale: LocaleId,
        src: RemoteAddr,
        dst: &'a mut [u8],
    ) -> impl Future<Output = Result<(), CommError>> + Send + 'a {
        let at = Location::caller();
        async move {
            if locale == self.locale {
                return self
                    .mem
                    .local()
                    .read(src, dst)
                    .map_err(|e| CommError::Substrate { call: "local memmove (get)", source: e });
            }
            if self.diag.verbose() {
                info!("{}: {}:{}: remote get from {}", self.locale, at.file(), at.line(), locale);
            }
            self.diag.record_get();
            self.substrate.get(locale, src, dst).await.map_err(|e| {
                error!(
                    "{}: {}:{}: substrate get failed: {} ({})",
                    self.locale,
                    at.file(),
                    at.line(),
                    e.name(),
                    e
                );
                CommError::Substrate { call: "substrate get", source: e }
            })
        }
    }

    /// Split-phase barrier across every locale.
    pub async fn barrier(&self, tag: &str) -> Result<(), CommError> {
        if self.diag.verbose() {
            info!("{}: barrier for '{}'", self.locale, tag);
        }
        self.substrate
            .barrier_notify()
            .map_err(|e| self.substrate_err("barrier_notify", e))?;
        self.substrate
            .barrier_wait()
            .await
            .map_err(|e| self.substrate_err("barrier_wait", e))
    }

    /// Most threads the substrate tolerates in this process.
    pub fn max_threads(&self) -> u32 {
        self.substrate.max_threads()
    }

    /// Hard thread limit; identical to [`max_threads`] for every known
    /// substrate.
    ///
    /// [`max_threads`]: Runtime::max_threads
    pub fn max_threads_limit(&self) -> u32 {
        self.substrate.max_threads()
    }

    /// The endpoint this runtime drives.
    pub fn substrate(&self) -> &S {
        &self.substrate
    }

    pub(crate) fn mem(&self) -> &MemoryPlane {
        &self.mem
    }

    pub(crate) fn funcs(&self) -> &FuncTable {
        &self.funcs
    }

    pub(crate) fn completions(&self) -> &CompletionTable {
        &self.completions
    }

    pub(crate) fn diag(&self) -> &CommDiagnostics {
        &self.diag
    }

    pub(crate) fn spawner(&self) -> &dyn TaskSpawner {
        self.spawner.as_ref()
    }

    pub(crate) fn shutdown(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Record a substrate failure and wrap it. The record carries the call
    /// text plus the substrate's error name and description.
    pub(crate) fn substrate_err(&self, call: &'static str, source: SubstrateError) -> CommError {
        error!(
            "{}: substrate failure in {}: {} ({})",
            self.locale,
            call,
            source.name(),
            source
        );
        CommError::Substrate { call, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_parsing() {
        assert!(flag_from(Some("1")));
        assert!(flag_from(Some("true")));
        assert!(flag_from(Some(" Yes ")));
        assert!(flag_from(Some("ON")));
        assert!(!flag_from(Some("0")));
        assert!(!flag_from(Some("off")));
        assert!(!flag_from(Some("")));
        assert!(!flag_from(None));
    }

    #[test]
    fn test_config_default_is_quiet() {
        let config = CommConfig::default();
        assert!(!config.verbose_comm);
        assert!(!config.comm_diagnostics);
    }
}
