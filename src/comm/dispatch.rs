//! Active-message dispatch: opcode routing and the receiver-side wrappers.
//!
//! Handlers run inside the endpoint's delivery context. They copy what they
//! need, resolve a handle, or hand a wrapper to the task spawner, and
//! return; user code never runs in the delivery context itself.

use super::message::{Am, ForkArg, ForkRequest, PutRequest, SignalRequest};
use super::runtime::Runtime;
use super::substrate::{AmSink, Substrate, SubstrateError};
use crate::types::FuncId;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Routes every inbound frame to one of the five handlers.
pub struct Dispatcher<S: Substrate> {
    rt: Arc<Runtime<S>>,
}

impl<S: Substrate> Dispatcher<S> {
    pub fn new(rt: Arc<Runtime<S>>) -> Self {
        Self { rt }
    }

    fn on_fork_nb(&self, request: ForkRequest) {
        let serial = request.serial;
        let body = Box::pin(fork_nb_wrapper(self.rt.clone(), request));
        self.rt.spawner().spawn_task(body, true, serial);
    }

    fn on_fork(&self, request: ForkRequest) {
        let serial = request.serial;
        let body = Box::pin(fork_wrapper(self.rt.clone(), request));
        self.rt.spawner().spawn_task(body, true, serial);
    }

    fn on_fork_large(&self, request: ForkRequest) {
        let serial = request.serial;
        let body = Box::pin(fork_large_wrapper(self.rt.clone(), request));
        self.rt.spawner().spawn_task(body, true, serial);
    }

    fn on_signal(&self, request: SignalRequest) {
        if !self.rt.completions().signal(request.ack) {
            warn!(
                "{}: signal for unknown completion {}",
                self.rt.locale_id(),
                request.ack
            );
        }
    }

    fn on_putdata(&self, request: PutRequest) {
        if let Err(e) = self.rt.mem().local().write(request.addr, &request.data) {
            error!(
                "{}: putdata rejected: {} ({})",
                self.rt.locale_id(),
                e.name(),
                e
            );
        }
    }
}

impl<S: Substrate> AmSink for Dispatcher<S> {
    fn deliver(&self, frame: &[u8]) {
        match Am::decode(frame) {
            Ok(Am::ForkNb(r)) => self.on_fork_nb(r),
            Ok(Am::Fork(r)) => self.on_fork(r),
            Ok(Am::ForkLarge(r)) => self.on_fork_large(r),
            Ok(Am::Signal(r)) => self.on_signal(r),
            Ok(Am::PutData(r)) => self.on_putdata(r),
            Err(e) => error!(
                "{}: dropping undecodable active message: {}",
                self.rt.locale_id(),
                e
            ),
        }
    }
}

async fn invoke<S: Substrate>(rt: &Runtime<S>, func: FuncId, arg: Option<Vec<u8>>) {
    match rt.funcs().get(func) {
        Some(f) => f(arg).await,
        None => error!("{}: fork names unregistered {}", rt.locale_id(), func),
    }
}

async fn signal_caller<S: Substrate>(rt: &Runtime<S>, request: &ForkRequest) {
    let Some(ack) = request.ack else {
        warn!("{}: blocking fork arrived without an ack handle", rt.locale_id());
        return;
    };
    let frame = match Am::Signal(SignalRequest { ack }).encode() {
        Ok(frame) => frame,
        Err(e) => {
            error!("{}: signal encode failed: {}", rt.locale_id(), e);
            return;
        }
    };
    if let Err(e) = rt.substrate().am_request_medium(request.caller, &frame).await {
        match e {
            SubstrateError::Exited => {
                debug!("{}: signal dropped after fabric exit", rt.locale_id())
            }
            e => error!(
                "{}: am_request_medium(SIGNAL) failed: {} ({})",
                rt.locale_id(),
                e.name(),
                e
            ),
        }
    }
}

async fn fork_nb_wrapper<S: Substrate>(rt: Arc<Runtime<S>>, request: ForkRequest) {
    let arg = request
        .inline_arg()
        .filter(|bytes| !bytes.is_empty())
        .map(<[u8]>::to_vec);
    invoke(&rt, request.func, arg).await;
}

async fn fork_wrapper<S: Substrate>(rt: Arc<Runtime<S>>, request: ForkRequest) {
    let arg = request
        .inline_arg()
        .filter(|bytes| !bytes.is_empty())
        .map(<[u8]>::to_vec);
    invoke(&rt, request.func, arg).await;
    signal_caller(&rt, &request).await;
}

async fn fork_large_wrapper<S: Substrate>(rt: Arc<Runtime<S>>, request: ForkRequest) {
    let src = match request.arg {
        ForkArg::Fetch(addr) => addr,
        ForkArg::Inline(_) => {
            error!(
                "{}: large fork arrived with an inline argument",
                rt.locale_id()
            );
            return;
        }
    };
    let mut arg = vec![0u8; request.arg_size as usize];
    if let Err(e) = rt.get(request.caller, src, &mut arg).await {
        error!("{}: large fork argument pull failed: {}", rt.locale_id(), e);
        return;
    }
    invoke(&rt, request.func, Some(arg)).await;
    signal_caller(&rt, &request).await;
}
