//! The coordinator's polling task and the shutdown protocol.
//!
//! Locale 0 parks a task on a dedicated completion handle at init. The exit
//! path releases it with a SIGNAL frame sent to self, so shutdown rides the
//! same delivery machinery as every other ack, then asks the substrate for
//! cluster-wide teardown.

use super::message::{Am, SignalRequest};
use super::runtime::{CommError, Runtime};
use super::substrate::Substrate;
use crate::types::AckHandle;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, error};

/// The shutdown release, distinct from every fork ack.
pub(crate) struct ShutdownSignal {
    handle: AckHandle,
    receiver: Mutex<Option<oneshot::Receiver<()>>>,
    released: AtomicBool,
}

impl ShutdownSignal {
    pub(crate) fn new(handle: AckHandle, receiver: oneshot::Receiver<()>) -> Self {
        Self {
            handle,
            receiver: Mutex::new(Some(receiver)),
            released: AtomicBool::new(false),
        }
    }

    pub(crate) fn handle(&self) -> AckHandle {
        self.handle
    }

    fn take_receiver(&self) -> Option<oneshot::Receiver<()>> {
        self.receiver.lock().expect("shutdown lock poisoned").take()
    }

    fn mark_released(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

/// Park the polling task on the shutdown handle. Coordinator only; other
/// locales' main control flow is expected to sit in barriers and blocking
/// waits, which drive progress on their own.
pub(crate) fn start_polling<S: Substrate>(rt: &Arc<Runtime<S>>) -> Result<(), CommError> {
    let receiver = rt
        .shutdown()
        .take_receiver()
        .ok_or(CommError::Internal("unable to start polling task"))?;
    let rt = rt.clone();
    tokio::spawn(async move {
        match receiver.await {
            Ok(()) => debug!("{}: polling task released", rt.locale_id()),
            Err(_) => debug!("{}: polling task abandoned", rt.locale_id()),
        }
        rt.shutdown().mark_released();
    });
    Ok(())
}

impl<S: Substrate> Runtime<S> {
    /// Coordinated whole-job exit.
    pub async fn exit_all(&self, status: i32) {
        self.exit_common(status).await;
    }

    /// Single-locale-initiated exit. Takes the same path as [`exit_all`];
    /// the any-one/all-coordinated distinction is not realized.
    ///
    /// [`exit_all`]: Runtime::exit_all
    pub async fn exit_any(&self, status: i32) {
        self.exit_common(status).await;
    }

    async fn exit_common(&self, status: i32) {
        if self.locale_id() == 0 {
            match Am::Signal(SignalRequest { ack: self.shutdown().handle() }).encode() {
                Ok(frame) => {
                    if let Err(e) = self
                        .substrate()
                        .am_request_medium(self.locale_id(), &frame)
                        .await
                    {
                        error!(
                            "{}: shutdown signal failed: {} ({})",
                            self.locale_id(),
                            e.name(),
                            e
                        );
                    }
                }
                Err(e) => error!("{}: shutdown signal encode failed: {}", self.locale_id(), e),
            }
        }
        self.substrate().exit(status).await;
    }

    /// Whether the coordinator's polling task has observed shutdown.
    pub fn polling_released(&self) -> bool {
        self.shutdown().is_released()
    }
}
