//! The diagnostics plane: per-locale counters and the two comm-debug flags.
//!
//! The flags live as 32-bit words at fixed static-region addresses so the
//! private broadcast can replicate them as plain bytes. Counters are local
//! only; a reader never sees another locale's counts.

use super::memory::LocaleMemory;
use super::runtime::{CommError, Runtime};
use super::substrate::Substrate;
use super::types::{DIAG_FLAG_ADDR, FLAG_BYTES, VERBOSE_FLAG_ADDR};
use crate::types::RemoteAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::error;

/// Snapshot of this locale's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommCounts {
    pub gets: u32,
    pub puts: u32,
    pub forks: u32,
    pub nb_forks: u32,
}

/// Per-locale diagnostics state.
pub struct CommDiagnostics {
    mem: Arc<LocaleMemory>,
    /// Raised around flag broadcasts so the broadcast's own traffic is
    /// neither traced nor counted. Process-local, never broadcast.
    suppress: AtomicBool,
    gets: AtomicU32,
    puts: AtomicU32,
    forks: AtomicU32,
    nb_forks: AtomicU32,
}

impl CommDiagnostics {
    pub fn new(mem: Arc<LocaleMemory>) -> Self {
        Self {
            mem,
            suppress: AtomicBool::new(false),
            gets: AtomicU32::new(0),
            puts: AtomicU32::new(0),
            forks: AtomicU32::new(0),
            nb_forks: AtomicU32::new(0),
        }
    }

    fn flag(&self, addr: RemoteAddr) -> bool {
        self.mem.read_u32(addr).map(|word| word != 0).unwrap_or(false)
    }

    fn set_flag(&self, addr: RemoteAddr, on: bool) {
        // Flag addresses are fixed inside the static region, so this cannot
        // fault outside of an internal layout bug.
        if let Err(e) = self.mem.write_u32(addr, on as u32) {
            error!("{}: diagnostics flag write rejected: {}", self.mem.locale(), e);
        }
    }

    pub fn verbose(&self) -> bool {
        self.flag(VERBOSE_FLAG_ADDR) && !self.suppress.load(Ordering::SeqCst)
    }

    pub fn enabled(&self) -> bool {
        self.flag(DIAG_FLAG_ADDR) && !self.suppress.load(Ordering::SeqCst)
    }

    pub(crate) fn set_verbose(&self, on: bool) {
        self.set_flag(VERBOSE_FLAG_ADDR, on);
    }

    pub(crate) fn set_enabled(&self, on: bool) {
        self.set_flag(DIAG_FLAG_ADDR, on);
    }

    pub(crate) fn set_suppress(&self, on: bool) {
        self.suppress.store(on, Ordering::SeqCst);
    }

    pub(crate) fn record_get(&self) {
        if self.enabled() {
            self.gets.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn record_put(&self) {
        if self.enabled() {
            self.puts.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn record_fork(&self) {
        if self.enabled() {
            self.forks.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn record_nb_fork(&self) {
        if self.enabled() {
            self.nb_forks.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn counts(&self) -> CommCounts {
        CommCounts {
            gets: self.gets.load(Ordering::SeqCst),
            puts: self.puts.load(Ordering::SeqCst),
            forks: self.forks.load(Ordering::SeqCst),
            nb_forks: self.nb_forks.load(Ordering::SeqCst),
        }
    }
}

impl<S: Substrate> Runtime<S> {
    /// Turn on verbose comm tracing here and on every peer.
    pub async fn start_verbose_comm(&self) -> Result<(), CommError> {
        self.diag().set_verbose(true);
        self.broadcast_flag(VERBOSE_FLAG_ADDR).await
    }

    /// Turn off verbose comm tracing here and on every peer.
    pub async fn stop_verbose_comm(&self) -> Result<(), CommError> {
        self.diag().set_verbose(false);
        self.broadcast_flag(VERBOSE_FLAG_ADDR).await
    }

    /// Turn on verbose comm tracing on this locale only.
    pub fn start_verbose_comm_here(&self) {
        self.diag().set_verbose(true);
    }

    /// Turn off verbose comm tracing on this locale only.
    pub fn stop_verbose_comm_here(&self) {
        self.diag().set_verbose(false);
    }

    /// Start counting remote operations here and on every peer.
    pub async fn start_comm_diagnostics(&self) -> Result<(), CommError> {
        self.diag().set_enabled(true);
        self.broadcast_flag(DIAG_FLAG_ADDR).await
    }

    /// Stop counting remote operations here and on every peer.
    pub async fn stop_comm_diagnostics(&self) -> Result<(), CommError> {
        self.diag().set_enabled(false);
        self.broadcast_flag(DIAG_FLAG_ADDR).await
    }

    /// Start counting remote operations on this locale only.
    pub fn start_comm_diagnostics_here(&self) {
        self.diag().set_enabled(true);
    }

    /// Stop counting remote operations on this locale only.
    pub fn stop_comm_diagnostics_here(&self) {
        self.diag().set_enabled(false);
    }

    /// Whether verbose comm tracing is on for this locale.
    pub fn verbose_comm_enabled(&self) -> bool {
        self.diag().verbose()
    }

    /// Whether remote-operation counting is on for this locale.
    pub fn comm_diagnostics_enabled(&self) -> bool {
        self.diag().enabled()
    }

    pub fn num_comm_gets(&self) -> u32 {
        self.diag().counts().gets
    }

    pub fn num_comm_puts(&self) -> u32 {
        self.diag().counts().puts
    }

    pub fn num_comm_forks(&self) -> u32 {
        self.diag().counts().forks
    }

    pub fn num_comm_nb_forks(&self) -> u32 {
        self.diag().counts().nb_forks
    }

    pub fn comm_counts(&self) -> CommCounts {
        self.diag().counts()
    }

    async fn broadcast_flag(&self, addr: RemoteAddr) -> Result<(), CommError> {
        self.diag().set_suppress(true);
        let result = self.broadcast_private(addr, FLAG_BYTES).await;
        self.diag().set_suppress(false);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diag() -> CommDiagnostics {
        CommDiagnostics::new(Arc::new(LocaleMemory::new(0, None)))
    }

    #[test]
    fn test_counters_gated_by_flag() {
        let d = diag();
        d.record_put();
        d.record_get();
        assert_eq!(d.counts(), CommCounts::default());

        d.set_enabled(true);
        d.record_put();
        d.record_get();
        d.record_fork();
        d.record_nb_fork();
        assert_eq!(
            d.counts(),
            CommCounts { gets: 1, puts: 1, forks: 1, nb_forks: 1 }
        );
    }

    #[test]
    fn test_suppress_silences_both_planes() {
        let d = diag();
        d.set_enabled(true);
        d.set_verbose(true);
        d.set_suppress(true);
        assert!(!d.enabled());
        assert!(!d.verbose());
        d.record_put();
        assert_eq!(d.counts().puts, 0);

        d.set_suppress(false);
        assert!(d.enabled());
        assert!(d.verbose());
    }

    #[test]
    fn test_flag_words_are_independent() {
        let d = diag();
        d.set_verbose(true);
        assert!(d.verbose());
        assert!(!d.enabled());
    }
}
