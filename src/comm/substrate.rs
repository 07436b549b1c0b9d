//! The one-sided networking substrate behind the runtime.
//!
//! Everything that touches the wire goes through [`Substrate`]. The runtime
//! treats any substrate failure as job-fatal: there is no recoverable error
//! class, only a diagnostic record and teardown.

use super::memory::LocaleMemory;
use super::types::{SegmentInfo, WaitMode};
use crate::types::{LocaleId, RemoteAddr};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Receives every inbound active-message frame.
///
/// Called from the endpoint's delivery context, one frame at a time and in
/// arrival order per sender. Implementations must return quickly and must
/// not block; anything long-running belongs on a spawned task.
pub trait AmSink: Send + Sync {
    fn deliver(&self, frame: &[u8]);
}

/// Substrate failure. Fatal by policy; the caller emits a diagnostic record
/// naming the failing call and tears the job down.
#[derive(Debug, Error)]
pub enum SubstrateError {
    #[error("locale {0} is outside the fabric")]
    NoSuchLocale(LocaleId),
    #[error("address {addr} (+{len} bytes) is outside locale {locale}'s address space")]
    AddressOutOfRange {
        locale: LocaleId,
        addr: RemoteAddr,
        len: usize,
    },
    #[error("{len}-byte payload exceeds the {max}-byte medium AM limit")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("endpoint is already attached")]
    AlreadyAttached,
    #[error("fabric has exited")]
    Exited,
}

impl SubstrateError {
    /// Short error name for diagnostic records, next to the description.
    pub fn name(&self) -> &'static str {
        match self {
            SubstrateError::NoSuchLocale(_) => "NO_SUCH_LOCALE",
            SubstrateError::AddressOutOfRange { .. } => "ADDRESS_OUT_OF_RANGE",
            SubstrateError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            SubstrateError::AlreadyAttached => "ALREADY_ATTACHED",
            SubstrateError::Exited => "EXITED",
        }
    }
}

/// One locale's endpoint on the networking substrate.
///
/// Put and get are one-sided: no code runs on the remote locale, and return
/// means the data is committed (put) or materialized locally (get).
/// `am_request_medium` copies the payload before returning, so the caller's
/// buffer is immediately reusable. The barrier is split-phase: notify the
/// local arrival, then wait for the fabric.
pub trait Substrate: Send + Sync + 'static {
    fn locale_id(&self) -> LocaleId;

    fn num_locales(&self) -> u32;

    /// Human-readable name for rollcall output.
    fn locale_name(&self) -> String;

    /// Largest payload `am_request_medium` accepts.
    fn max_am_medium(&self) -> usize;

    /// Upper bound on threads the substrate tolerates per process.
    fn max_threads(&self) -> u32;

    /// Register the inbound frame sink and start delivery. One shot.
    fn attach(&self, sink: Arc<dyn AmSink>) -> Result<(), SubstrateError>;

    /// The symmetric segment table, or `None` when the substrate provides no
    /// segments and only the static region is addressable.
    fn segment_info(&self) -> Option<Arc<[SegmentInfo]>>;

    /// Handle to this locale's own memory, for network-free local access.
    fn local_memory(&self) -> Arc<LocaleMemory>;

    fn set_wait_mode(&self, mode: WaitMode);

    fn put(
        &self,
        locale: LocaleId,
        dst: RemoteAddr,
        src: &[u8],
    ) -> impl Future<Output = Result<(), SubstrateError>> + Send;

    fn get(
        &self,
        locale: LocaleId,
        src: RemoteAddr,
        dst: &mut [u8],
    ) -> impl Future<Output = Result<(), SubstrateError>> + Send;

    fn am_request_medium(
        &self,
        locale: LocaleId,
        frame: &[u8],
    ) -> impl Future<Output = Result<(), SubstrateError>> + Send;

    fn barrier_notify(&self) -> Result<(), SubstrateError>;

    fn barrier_wait(&self) -> impl Future<Output = Result<(), SubstrateError>> + Send;

    /// Begin fabric-wide teardown with the given status. Idempotent; the
    /// first status wins.
    fn exit(&self, status: i32) -> impl Future<Output = ()> + Send;
}
