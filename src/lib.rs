//! Quilt: a PGAS-style distributed communication runtime.
//!
//! A fixed set of locales, numbered from zero, runs an identical process
//! image. Each locale owns a partition of the global address space and
//! reaches the others through one-sided puts and gets, remote task forks
//! carried by active messages, and a small broadcast plane for replicated
//! values. Locale 0 coordinates: it hosts the polling task and originates
//! shutdown.
//!
//! The [`comm::Substrate`] trait is the seam to the networking layer; the
//! in-process [`comm::LoopbackFabric`] implements it for single-node
//! deployments and tests.

pub mod comm;
pub mod types;

pub use comm::{
    Am, AmSink, CommConfig, CommCounts, CommError, ForkFn, ForkFuture, FuncTable, HeapAllocator,
    LocaleMemory, LoopbackConfig, LoopbackEndpoint, LoopbackFabric, LoopbackOpCounts, Runtime,
    SegmentInfo, Substrate, SubstrateError, TaskSpawner, TokioSpawner, WaitMode,
    LOOPBACK_MAX_THREADS,
};
pub use types::{AckHandle, FuncId, LocaleId, RemoteAddr};
