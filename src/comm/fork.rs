//! The fork engine: remote task spawns, blocking and non-blocking.
//!
//! The sender-side paths live here along with the two tables they lean on:
//! the function table mapping wire ids to registered entry points, and the
//! completion table resolving ack handles to pending waiters. The receiver
//! side (handlers and wrappers) lives in `dispatch`.

use super::message::{max_fork_inline, Am, AmBytes, ForkArg, ForkRequest};
use super::runtime::{CommError, Runtime};
use super::substrate::Substrate;
use crate::types::{AckHandle, FuncId, LocaleId};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::info;

tokio::task_local! {
    static SERIAL_STATE: bool;
}

/// Serial state of the current task: true when it must not spawn further
/// tasks. Defaults to false outside any fork-spawned task.
pub fn current_serial() -> bool {
    SERIAL_STATE.try_with(|serial| *serial).unwrap_or(false)
}

/// A spawned fork body.
pub type ForkFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A registered fork target. Receives the argument bytes, or `None` when the
/// fork carried no argument.
pub type ForkFn = Arc<dyn Fn(Option<Vec<u8>>) -> ForkFuture + Send + Sync>;

/// External task-spawn capability.
///
/// `blocking` marks tasks started from the delivery context, which may block
/// on communication of their own; `serial` is the spawned task's serial
/// state, readable inside it via [`current_serial`].
pub trait TaskSpawner: Send + Sync {
    fn spawn_task(&self, body: ForkFuture, blocking: bool, serial: bool);
}

/// Default spawner backed by the tokio runtime.
pub struct TokioSpawner;

impl TaskSpawner for TokioSpawner {
    fn spawn_task(&self, body: ForkFuture, _blocking: bool, serial: bool) {
        tokio::spawn(SERIAL_STATE.scope(serial, body));
    }
}

/// Locale-local table of fork targets.
///
/// Ids are assigned in registration order, so every locale must register the
/// same functions in the same order for an id to name the same code
/// everywhere. Append-only.
#[derive(Default)]
pub struct FuncTable {
    funcs: RwLock<Vec<ForkFn>>,
}

impl FuncTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, f: ForkFn) -> FuncId {
        let mut funcs = self.funcs.write().expect("function table lock poisoned");
        funcs.push(f);
        FuncId(funcs.len() as u32 - 1)
    }

    pub fn get(&self, id: FuncId) -> Option<ForkFn> {
        self.funcs
            .read()
            .expect("function table lock poisoned")
            .get(id.0 as usize)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.funcs.read().expect("function table lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pending completions owned by this locale. A handle crosses the wire in a
/// fork request, comes back in a SIGNAL frame, and resolves here exactly
/// once.
#[derive(Default)]
pub struct CompletionTable {
    next: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<()>>>,
}

impl CompletionTable {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self) -> (AckHandle, oneshot::Receiver<()>) {
        let handle = AckHandle(self.next.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("completion table lock poisoned")
            .insert(handle.0, tx);
        (handle, rx)
    }

    /// Resolve a handle. Returns false for an unknown or already-signaled
    /// handle.
    pub fn signal(&self, handle: AckHandle) -> bool {
        let sender = self
            .pending
            .lock()
            .expect("completion table lock poisoned")
            .remove(&handle.0);
        match sender {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    /// Drop a registration that will never be signaled.
    pub fn cancel(&self, handle: AckHandle) {
        self.pending
            .lock()
            .expect("completion table lock poisoned")
            .remove(&handle.0);
    }

    pub fn pending_len(&self) -> usize {
        self.pending
            .lock()
            .expect("completion table lock poisoned")
            .len()
    }
}

impl<S: Substrate> Runtime<S> {
    /// Largest argument `fork` ships inline before switching to the pull
    /// path, and the hard limit for `fork_nb`.
    pub fn max_fork_inline(&self) -> usize {
        max_fork_inline(self.substrate().max_am_medium())
    }

    /// Run `func(arg)` on `locale` and wait for it to finish.
    ///
    /// On the local locale the function runs in the calling context with no
    /// network involvement. Remotely, the argument travels inline when it
    /// fits the medium AM limit; otherwise it is staged in local memory and
    /// the callee pulls it back with a get. Return of this call is
    /// happens-before for the callee's one-sided effects on this locale.
    pub async fn fork(&self, locale: LocaleId, func: FuncId, arg: &[u8]) -> Result<(), CommError> {
        if locale == self.locale_id() {
            let f = self.funcs().get(func).ok_or(CommError::UnknownFunction(func))?;
            f(owned_arg(arg)).await;
            return Ok(());
        }

        if self.diag().verbose() {
            info!("{}: remote task created on {}", self.locale_id(), locale);
        }
        self.diag().record_fork();

        let (ack, done) = self.completions().register();
        let arg_len = arg.len();
        let header = |arg: ForkArg| ForkRequest {
            caller: self.locale_id(),
            ack: Some(ack),
            serial: current_serial(),
            func,
            arg_size: arg_len as u32,
            arg,
        };

        if arg.len() <= self.max_fork_inline() {
            let Some(payload) = AmBytes::new(arg.to_vec()) else {
                self.completions().cancel(ack);
                return Err(CommError::Internal("fork argument exceeds the AM payload bound"));
            };
            let request = header(ForkArg::Inline(payload));
            let frame = Am::Fork(request).encode()?;
            if let Err(e) = self.substrate().am_request_medium(locale, &frame).await {
                self.completions().cancel(ack);
                return Err(self.substrate_err("am_request_medium(FORK)", e));
            }
            self.block_on_ack(done).await
        } else {
            let staged = self.mem().alloc_staging(arg.len())?;
            if let Err(e) = self.mem().local().write(staged, arg) {
                self.completions().cancel(ack);
                self.mem().free_staging(staged, arg.len());
                return Err(self.substrate_err("fork argument staging", e));
            }
            let request = header(ForkArg::Fetch(staged));
            let frame = Am::ForkLarge(request).encode()?;
            if let Err(e) = self.substrate().am_request_medium(locale, &frame).await {
                self.completions().cancel(ack);
                self.mem().free_staging(staged, arg.len());
                return Err(self.substrate_err("am_request_medium(FORK_LARGE)", e));
            }
            let result = self.block_on_ack(done).await;
            // The callee has pulled the argument by the time it signals.
            self.mem().free_staging(staged, arg.len());
            result
        }
    }

    /// Start `func(arg)` on `locale` without waiting for it.
    ///
    /// The argument must fit inline; there is no pull path for non-blocking
    /// forks.
    pub async fn fork_nb(
        &self,
        locale: LocaleId,
        func: FuncId,
        arg: &[u8],
    ) -> Result<(), CommError> {
        if locale == self.locale_id() {
            let f = self.funcs().get(func).ok_or(CommError::UnknownFunction(func))?;
            self.spawner().spawn_task(f(owned_arg(arg)), false, current_serial());
            return Ok(());
        }

        let max = self.max_fork_inline();
        if arg.len() > max {
            return Err(CommError::ArgTooLarge { len: arg.len(), max });
        }

        if self.diag().verbose() {
            info!("{}: remote non-blocking task created on {}", self.locale_id(), locale);
        }
        self.diag().record_nb_fork();

        let Some(payload) = AmBytes::new(arg.to_vec()) else {
            return Err(CommError::ArgTooLarge { len: arg.len(), max });
        };
        let request = ForkRequest {
            caller: self.locale_id(),
            ack: None,
            serial: current_serial(),
            func,
            arg_size: arg.len() as u32,
            arg: ForkArg::Inline(payload),
        };
        let frame = Am::ForkNb(request).encode()?;
        self.substrate()
            .am_request_medium(locale, &frame)
            .await
            .map_err(|e| self.substrate_err("am_request_medium(FORK_NB)", e))
    }

    async fn block_on_ack(&self, done: oneshot::Receiver<()>) -> Result<(), CommError> {
        done.await
            .map_err(|_| CommError::Internal("completion dropped before signal"))
    }
}

fn owned_arg(arg: &[u8]) -> Option<Vec<u8>> {
    if arg.is_empty() {
        None
    } else {
        Some(arg.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_register_signal_once() {
        let table = CompletionTable::new();
        let (handle, mut rx) = table.register();
        assert_eq!(table.pending_len(), 1);

        assert!(table.signal(handle));
        assert_eq!(table.pending_len(), 0);
        assert!(rx.try_recv().is_ok());

        // A second signal for the same handle is a no-op.
        assert!(!table.signal(handle));
    }

    #[test]
    fn test_completion_cancel() {
        let table = CompletionTable::new();
        let (handle, _rx) = table.register();
        table.cancel(handle);
        assert_eq!(table.pending_len(), 0);
        assert!(!table.signal(handle));
    }

    #[test]
    fn test_completion_handles_are_distinct() {
        let table = CompletionTable::new();
        let (a, _rxa) = table.register();
        let (b, _rxb) = table.register();
        assert_ne!(a, b);
    }

    #[test]
    fn test_func_table_assigns_sequential_ids() {
        let table = FuncTable::new();
        let a = table.register(Arc::new(|_| Box::pin(async {})));
        let b = table.register(Arc::new(|_| Box::pin(async {})));
        assert_eq!(a, FuncId(0));
        assert_eq!(b, FuncId(1));
        assert!(table.get(a).is_some());
        assert!(table.get(FuncId(2)).is_none());
    }

    #[test]
    fn test_serial_defaults_false() {
        assert!(!current_serial());
    }

    #[tokio::test]
    async fn test_spawner_propagates_serial_state() {
        let (tx, rx) = oneshot::channel();
        TokioSpawner.spawn_task(
            Box::pin(async move {
                let _ = tx.send(current_serial());
            }),
            true,
            true,
        );
        assert!(rx.await.unwrap());
    }
}
