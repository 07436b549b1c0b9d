//! In-process loopback substrate.
//!
//! Hosts every locale of the fabric inside one process: per-locale memory
//! regions, ordered active-message queues drained by per-endpoint delivery
//! tasks, a split-phase barrier, and a fabric-wide exit latch. Useful for
//! single-node deployments and for driving the whole runtime from tests.

use super::memory::{LocaleMemory, MemRegion};
use super::substrate::{AmSink, Substrate, SubstrateError};
use super::types::{
    SegmentInfo, WaitMode, DEFAULT_MAX_AM_MEDIUM, DEFAULT_SEGMENT_SIZE, SEGMENT_BASE,
    SEGMENT_STRIDE,
};
use crate::types::{LocaleId, RemoteAddr};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Threads-per-process bound reported to the runtime.
pub const LOOPBACK_MAX_THREADS: u32 = 256;

/// Fabric construction parameters.
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    pub num_locales: u32,
    /// Provide symmetric segments. Without them only the static region is
    /// addressable and the runtime falls back to the static registry.
    pub segments: bool,
    pub segment_size: usize,
    pub max_am_medium: usize,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            num_locales: 2,
            segments: true,
            segment_size: DEFAULT_SEGMENT_SIZE,
            max_am_medium: DEFAULT_MAX_AM_MEDIUM,
        }
    }
}

/// Initiator-side operation counters, for observing endpoint traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackOpCounts {
    pub puts: u64,
    pub gets: u64,
    pub ams_sent: u64,
}

#[derive(Default)]
struct LoopbackStats {
    puts: AtomicU64,
    gets: AtomicU64,
    ams_sent: AtomicU64,
}

struct LocaleCore {
    memory: Arc<LocaleMemory>,
    am_tx: mpsc::UnboundedSender<Vec<u8>>,
}

struct BarrierShared {
    arrived: Mutex<u32>,
    done: watch::Sender<u64>,
}

impl BarrierShared {
    fn arrive(&self, fabric_size: u32) {
        let mut arrived = self.arrived.lock().expect("barrier lock poisoned");
        *arrived += 1;
        if *arrived == fabric_size {
            *arrived = 0;
            self.done.send_modify(|generation| *generation += 1);
        }
    }
}

struct FabricShared {
    locales: Vec<LocaleCore>,
    segments: Option<Arc<[SegmentInfo]>>,
    max_am_medium: usize,
    barrier: BarrierShared,
    exit: watch::Sender<Option<i32>>,
}

/// Constructor for a loopback fabric.
pub struct LoopbackFabric;

impl LoopbackFabric {
    /// Build the fabric and hand back one endpoint per locale.
    pub fn launch(config: LoopbackConfig) -> Vec<LoopbackEndpoint> {
        assert!(config.num_locales >= 1, "fabric needs at least one locale");
        assert!(
            config.segment_size as u64 <= SEGMENT_STRIDE,
            "segment size exceeds the segment stride"
        );

        let segments: Option<Arc<[SegmentInfo]>> = config.segments.then(|| {
            (0..config.num_locales)
                .map(|i| SegmentInfo {
                    base: RemoteAddr(SEGMENT_BASE + i as u64 * SEGMENT_STRIDE),
                    size: config.segment_size,
                })
                .collect::<Vec<_>>()
                .into()
        });

        let mut cores = Vec::with_capacity(config.num_locales as usize);
        let mut receivers = Vec::with_capacity(config.num_locales as usize);
        for locale in 0..config.num_locales {
            let segment = segments.as_ref().map(|segs| {
                let info = segs[locale as usize];
                MemRegion::new(info.base.0, info.size)
            });
            let (am_tx, am_rx) = mpsc::unbounded_channel();
            cores.push(LocaleCore {
                memory: Arc::new(LocaleMemory::new(locale, segment)),
                am_tx,
            });
            receivers.push(am_rx);
        }

        let (exit, _) = watch::channel(None);
        let shared = Arc::new(FabricShared {
            locales: cores,
            segments,
            max_am_medium: config.max_am_medium,
            barrier: BarrierShared {
                arrived: Mutex::new(0),
                done: watch::channel(0).0,
            },
            exit,
        });

        receivers
            .into_iter()
            .enumerate()
            .map(|(locale, am_rx)| LoopbackEndpoint {
                id: locale as LocaleId,
                shared: shared.clone(),
                am_rx: Mutex::new(Some(am_rx)),
                phase: AtomicU64::new(0),
                wait_mode: Mutex::new(WaitMode::default()),
                stats: LoopbackStats::default(),
            })
            .collect()
    }
}

/// One locale's endpoint on the loopback fabric.
pub struct LoopbackEndpoint {
    id: LocaleId,
    shared: Arc<FabricShared>,
    am_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    phase: AtomicU64,
    wait_mode: Mutex<WaitMode>,
    stats: LoopbackStats,
}

impl LoopbackEndpoint {
    pub fn op_counts(&self) -> LoopbackOpCounts {
        LoopbackOpCounts {
            puts: self.stats.puts.load(Ordering::SeqCst),
            gets: self.stats.gets.load(Ordering::SeqCst),
            ams_sent: self.stats.ams_sent.load(Ordering::SeqCst),
        }
    }

    pub fn exit_status(&self) -> Option<i32> {
        *self.shared.exit.borrow()
    }

    pub fn wait_mode(&self) -> WaitMode {
        *self.wait_mode.lock().expect("wait mode lock poisoned")
    }

    fn ensure_live(&self) -> Result<(), SubstrateError> {
        if self.shared.exit.borrow().is_some() {
            return Err(SubstrateError::Exited);
        }
        Ok(())
    }

    fn core(&self, locale: LocaleId) -> Result<&LocaleCore, SubstrateError> {
        self.shared
            .locales
            .get(locale as usize)
            .ok_or(SubstrateError::NoSuchLocale(locale))
    }

    fn put_now(
        &self,
        locale: LocaleId,
        dst: RemoteAddr,
        src: &[u8],
    ) -> Result<(), SubstrateError> {
        self.ensure_live()?;
        self.core(locale)?.memory.write(dst, src)?;
        self.stats.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn get_now(
        &self,
        locale: LocaleId,
        src: RemoteAddr,
        dst: &mut [u8],
    ) -> Result<(), SubstrateError> {
        self.ensure_live()?;
        self.core(locale)?.memory.read(src, dst)?;
        self.stats.gets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn am_now(&self, locale: LocaleId, frame: &[u8]) -> Result<(), SubstrateError> {
        self.ensure_live()?;
        if frame.len() > self.shared.max_am_medium {
            return Err(SubstrateError::PayloadTooLarge {
                len: frame.len(),
                max: self.shared.max_am_medium,
            });
        }
        // The queue copies the payload, so the caller's buffer is free to
        // reuse on return.
        self.core(locale)?
            .am_tx
            .send(frame.to_vec())
            .map_err(|_| SubstrateError::Exited)?;
        self.stats.ams_sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Substrate for LoopbackEndpoint {
    fn locale_id(&self) -> LocaleId {
        self.id
    }

    fn num_locales(&self) -> u32 {
        self.shared.locales.len() as u32
    }

    fn locale_name(&self) -> String {
        format!("loopback{}", self.id)
    }

    fn max_am_medium(&self) -> usize {
        self.shared.max_am_medium
    }

    fn max_threads(&self) -> u32 {
        LOOPBACK_MAX_THREADS - 1
    }

    fn attach(&self, sink: Arc<dyn AmSink>) -> Result<(), SubstrateError> {
        let mut rx = self
            .am_rx
            .lock()
            .expect("receiver lock poisoned")
            .take()
            .ok_or(SubstrateError::AlreadyAttached)?;
        let mut exit = self.shared.exit.subscribe();
        let locale = self.id;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    frame = rx.recv() => match frame {
                        Some(frame) => sink.deliver(&frame),
                        None => break,
                    },
                    _ = exit.changed() => {
                        // Exit drains: frames queued before the latch flipped
                        // still reach their handlers.
                        while let Ok(frame) = rx.try_recv() {
                            sink.deliver(&frame);
                        }
                        break;
                    }
                }
            }
            debug!("locale {locale}: loopback delivery stopped");
        });
        Ok(())
    }

    fn segment_info(&self) -> Option<Arc<[SegmentInfo]>> {
        self.shared.segments.clone()
    }

    fn local_memory(&self) -> Arc<LocaleMemory> {
        self.shared.locales[self.id as usize].memory.clone()
    }

    fn set_wait_mode(&self, mode: WaitMode) {
        *self.wait_mode.lock().expect("wait mode lock poisoned") = mode;
        debug!("locale {}: wait mode set to {:?}", self.id, mode);
    }

    fn put(
        &self,
        locale: LocaleId,
        dst: RemoteAddr,
        src: &[u8],
    ) -> impl Future<Output = Result<(), SubstrateError>> + Send {
        let result = self.put_now(locale, dst, src);
        async move { result }
    }

    fn get(
        &self,
        locale: LocaleId,
        src: RemoteAddr,
        dst: &mut [u8],
    ) -> impl Future<Output = Result<(), SubstrateError>> + Send {
        let result = self.get_now(locale, src, dst);
        async move { result }
    }

    fn am_request_medium(
        &self,
        locale: LocaleId,
        frame: &[u8],
    ) -> impl Future<Output = Result<(), SubstrateError>> + Send {
        let result = self.am_now(locale, frame);
        async move { result }
    }

    fn barrier_notify(&self) -> Result<(), SubstrateError> {
        self.ensure_live()?;
        self.phase.fetch_add(1, Ordering::SeqCst);
        self.shared.barrier.arrive(self.num_locales());
        Ok(())
    }

    fn barrier_wait(&self) -> impl Future<Output = Result<(), SubstrateError>> + Send {
        let target = self.phase.load(Ordering::SeqCst);
        let mut done = self.shared.barrier.done.subscribe();
        let mut exit = self.shared.exit.subscribe();
        async move {
            loop {
                if *done.borrow() >= target {
                    return Ok(());
                }
                tokio::select! {
                    changed = done.changed() => {
                        if changed.is_err() {
                            return Err(SubstrateError::Exited);
                        }
                    }
                    _ = exit.changed() => return Err(SubstrateError::Exited),
                }
            }
        }
    }

    fn exit(&self, status: i32) -> impl Future<Output = ()> + Send {
        self.shared.exit.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(status);
                true
            } else {
                false
            }
        });
        std::future::ready(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::types::STATIC_USER_ADDR;
    use std::time::Duration;

    struct RecordingSink(Mutex<Vec<Vec<u8>>>);

    impl AmSink for RecordingSink {
        fn deliver(&self, frame: &[u8]) {
            self.0.lock().unwrap().push(frame.to_vec());
        }
    }

    fn pair() -> Vec<LoopbackEndpoint> {
        LoopbackFabric::launch(LoopbackConfig::default())
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let eps = pair();
        let seg1 = eps[1].segment_info().unwrap()[1];
        eps[0].put(1, seg1.base, b"hello").await.unwrap();

        let mut buf = [0u8; 5];
        eps[0].get(1, seg1.base, &mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(eps[0].op_counts().puts, 1);
        assert_eq!(eps[0].op_counts().gets, 1);
        assert_eq!(eps[1].op_counts(), LoopbackOpCounts::default());
    }

    #[tokio::test]
    async fn test_out_of_range_address_faults() {
        let eps = pair();
        let err = eps[0].put(1, RemoteAddr(0x10), &[0u8; 4]).await.unwrap_err();
        assert!(matches!(err, SubstrateError::AddressOutOfRange { locale: 1, .. }));
    }

    #[tokio::test]
    async fn test_static_region_without_segments() {
        let eps = LoopbackFabric::launch(LoopbackConfig {
            segments: false,
            ..Default::default()
        });
        assert!(eps[0].segment_info().is_none());
        eps[0].put(1, STATIC_USER_ADDR, &[7u8; 8]).await.unwrap();
        let mut buf = [0u8; 8];
        eps[1].get(1, STATIC_USER_ADDR, &mut buf).await.unwrap();
        assert_eq!(buf, [7u8; 8]);
    }

    #[tokio::test]
    async fn test_am_delivery_in_order() {
        let eps = pair();
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        eps[0].attach(sink.clone()).unwrap();
        assert!(matches!(eps[0].attach(sink.clone()), Err(SubstrateError::AlreadyAttached)));

        for i in 0u8..5 {
            eps[1].am_request_medium(0, &[200, i]).await.unwrap();
        }
        for _ in 0..200 {
            if sink.0.lock().unwrap().len() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let frames = sink.0.lock().unwrap();
        assert_eq!(frames.len(), 5);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame[1], i as u8);
        }
    }

    #[tokio::test]
    async fn test_am_medium_limit_enforced() {
        let eps = pair();
        let oversized = vec![0u8; eps[0].max_am_medium() + 1];
        let err = eps[0].am_request_medium(1, &oversized).await.unwrap_err();
        assert!(matches!(err, SubstrateError::PayloadTooLarge { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_split_phase_barrier() {
        let mut eps = pair();
        let b = eps.pop().unwrap();
        let a = eps.pop().unwrap();

        a.barrier_notify().unwrap();
        let a_wait = tokio::spawn(async move {
            a.barrier_wait().await.unwrap();
            a
        });
        // Give the first waiter a moment; it cannot complete alone.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!a_wait.is_finished());

        b.barrier_notify().unwrap();
        b.barrier_wait().await.unwrap();
        let a = a_wait.await.unwrap();

        // Second round reuses the same fabric state.
        a.barrier_notify().unwrap();
        b.barrier_notify().unwrap();
        a.barrier_wait().await.unwrap();
        b.barrier_wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_latch_first_status_wins() {
        let eps = pair();
        assert_eq!(eps[0].exit_status(), None);
        eps[0].exit(3).await;
        eps[1].exit(7).await;
        assert_eq!(eps[0].exit_status(), Some(3));
        assert_eq!(eps[1].exit_status(), Some(3));
        let err = eps[0].put(1, STATIC_USER_ADDR, &[1]).await.unwrap_err();
        assert!(matches!(err, SubstrateError::Exited));
    }
}
