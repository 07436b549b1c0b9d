//! Distributed communication layer.

pub mod broadcast;
pub mod codec;
pub mod diag;
pub mod dispatch;
pub mod fork;
pub mod loopback;
pub mod memory;
pub mod message;
pub mod progress;
pub mod runtime;
pub mod substrate;
pub mod types;

// Re-exports
pub use codec::BoundedBytes;
pub use diag::{CommCounts, CommDiagnostics};
pub use dispatch::Dispatcher;
pub use fork::{
    current_serial, CompletionTable, ForkFn, ForkFuture, FuncTable, TaskSpawner, TokioSpawner,
};
pub use loopback::{
    LoopbackConfig, LoopbackEndpoint, LoopbackFabric, LoopbackOpCounts, LOOPBACK_MAX_THREADS,
};
pub use memory::{BumpHeap, HeapAllocator, LocaleMemory, MemRegion, MemoryPlane};
pub use message::{
    max_fork_inline, Am, AmBytes, ForkArg, ForkRequest, PutRequest, SignalRequest, WireError,
};
pub use runtime::{CommConfig, CommError, Runtime};
pub use substrate::{AmSink, Substrate, SubstrateError};
pub use types::*;
