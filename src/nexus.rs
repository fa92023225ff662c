//! Process-wide registry shared by every endpoint: request handlers,
//! peer addresses, and the background worker pool.
//!
//! Both maps are written during setup and read from the datapath, so
//! they sit behind `RwLock`s. Background handlers run on the Nexus
//! worker threads and hand their responses back to the owning endpoint
//! over that endpoint's bounded channel.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::warn;

use crate::error::{Error, Result};
use crate::transport::RouteId;

/// Where a registered handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// On the endpoint's event-loop thread, inline with RX processing.
    Inline,
    /// On a Nexus worker thread; the response crosses back over a
    /// channel and is sent by a later loop iteration.
    Background,
}

/// Ticket for a deferred response, consumed by `enqueue_response`.
#[derive(Debug, Clone, Copy)]
pub struct RespHandle {
    pub(crate) session: u16,
    pub(crate) req_num: u64,
}

/// Handler view of one received request.
pub struct ReqContext {
    req_type: u8,
    session: u16,
    req_num: u64,
    data: Vec<u8>,
    resp: Option<Vec<u8>>,
    handle_taken: bool,
}

impl ReqContext {
    pub(crate) fn new(req_type: u8, session: u16, req_num: u64, data: Vec<u8>) -> Self {
        Self {
            req_type,
            session,
            req_num,
            data,
            resp: None,
            handle_taken: false,
        }
    }

    pub fn req_type(&self) -> u8 {
        self.req_type
    }

    /// Request payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Set the response payload. Last call wins; a handler that neither
    /// responds nor takes the handle produces an empty response.
    pub fn respond(&mut self, bytes: &[u8]) {
        self.resp = Some(bytes.to_vec());
    }

    /// Defer the response: the handler returns without one, and the
    /// application later calls `enqueue_response` with this handle.
    /// Only meaningful for inline handlers.
    pub fn take_handle(&mut self) -> RespHandle {
        self.handle_taken = true;
        RespHandle {
            session: self.session,
            req_num: self.req_num,
        }
    }

    pub(crate) fn into_outcome(self) -> (u16, u64, Option<Vec<u8>>) {
        let resp = if self.handle_taken {
            None
        } else {
            Some(self.resp.unwrap_or_default())
        };
        (self.session, self.req_num, resp)
    }

    pub(crate) fn handle_taken(&self) -> bool {
        self.handle_taken
    }
}

/// Registered request handler.
pub type ReqHandler = Arc<dyn Fn(&mut ReqContext) + Send + Sync>;

/// A background handler's completed response, headed back to its
/// endpoint's event loop.
pub(crate) struct BgDone {
    pub session: u16,
    pub req_num: u64,
    pub resp: Vec<u8>,
}

struct BgJob {
    handler: ReqHandler,
    ctx: ReqContext,
    done_tx: Sender<BgDone>,
}

/// Process-wide registry and background worker pool.
pub struct Nexus {
    handlers: RwLock<HashMap<u8, (ReqHandler, DispatchMode)>>,
    processes: RwLock<HashMap<u32, RouteId>>,
    job_tx: Option<Sender<BgJob>>,
    workers: Vec<JoinHandle<()>>,
}

impl Nexus {
    /// `num_bg_threads` may be zero; background registrations then fail
    /// at dispatch time with a logged warning.
    pub fn new(num_bg_threads: usize) -> Arc<Self> {
        let (job_tx, job_rx) = bounded::<BgJob>(1024);
        let workers = (0..num_bg_threads)
            .map(|i| {
                let rx: Receiver<BgJob> = job_rx.clone();
                std::thread::Builder::new()
                    .name(format!("nexus-bg-{i}"))
                    .spawn(move || bg_worker(rx))
                    .unwrap_or_else(|e| panic!("failed to spawn background worker: {e}"))
            })
            .collect();
        Arc::new(Self {
            handlers: RwLock::new(HashMap::new()),
            processes: RwLock::new(HashMap::new()),
            job_tx: Some(job_tx),
            workers,
        })
    }

    /// Register the handler for `req_type`. One registration per type.
    pub fn register_req_func(
        &self,
        req_type: u8,
        handler: ReqHandler,
        mode: DispatchMode,
    ) -> Result<()> {
        let mut map = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        if map.contains_key(&req_type) {
            return Err(Error::AlreadyRegistered(req_type));
        }
        map.insert(req_type, (handler, mode));
        Ok(())
    }

    /// Advertise a peer process's fabric address.
    pub fn register_process(&self, process_id: u32, route: RouteId) {
        self.processes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(process_id, route);
    }

    pub fn uri_for_process(&self, process_id: u32) -> Option<RouteId> {
        self.processes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&process_id)
            .copied()
    }

    pub(crate) fn handler_for(&self, req_type: u8) -> Option<(ReqHandler, DispatchMode)> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&req_type)
            .map(|(h, m)| (Arc::clone(h), *m))
    }

    /// Hand a request to the worker pool. `done_tx` is the submitting
    /// endpoint's handoff channel.
    pub(crate) fn submit_bg(
        &self,
        handler: ReqHandler,
        ctx: ReqContext,
        done_tx: Sender<BgDone>,
    ) {
        let Some(job_tx) = &self.job_tx else {
            return;
        };
        if self.workers.is_empty() {
            warn!(req_type = ctx.req_type(), "background handler registered but nexus has no worker threads; dropping request");
            return;
        }
        match job_tx.try_send(BgJob {
            handler,
            ctx,
            done_tx,
        }) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                warn!(
                    req_type = job.ctx.req_type(),
                    "background queue full; dropping request"
                );
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

impl Drop for Nexus {
    fn drop(&mut self) {
        // Closing the job channel stops the workers.
        self.job_tx = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn bg_worker(rx: Receiver<BgJob>) {
    while let Ok(mut job) = rx.recv() {
        (job.handler)(&mut job.ctx);
        if job.ctx.handle_taken() {
            // Deferred responses cannot cross threads; the request is
            // dropped and the caller's retransmission logic takes over.
            warn!(
                req_type = job.ctx.req_type(),
                "background handler took a response handle; ignoring"
            );
            continue;
        }
        let (session, req_num, resp) = job.ctx.into_outcome();
        let done = BgDone {
            session,
            req_num,
            resp: resp.unwrap_or_default(),
        };
        if job.done_tx.try_send(done).is_err() {
            // Endpoint gone or its handoff queue full.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_registration_rejected() {
        let nexus = Nexus::new(0);
        let h: ReqHandler = Arc::new(|_ctx: &mut ReqContext| {});
        nexus
            .register_req_func(7, Arc::clone(&h), DispatchMode::Inline)
            .unwrap();
        assert!(matches!(
            nexus.register_req_func(7, h, DispatchMode::Inline),
            Err(Error::AlreadyRegistered(7))
        ));
    }

    #[test]
    fn process_registry_round_trips() {
        let nexus = Nexus::new(0);
        nexus.register_process(3, 42);
        assert_eq!(nexus.uri_for_process(3), Some(42));
        assert_eq!(nexus.uri_for_process(4), None);
    }

    #[test]
    fn bg_worker_runs_handler_and_hands_off() {
        let nexus = Nexus::new(1);
        let handler: ReqHandler = Arc::new(|ctx: &mut ReqContext| {
            let doubled: Vec<u8> = ctx.data().iter().map(|b| b.wrapping_mul(2)).collect();
            ctx.respond(&doubled);
        });
        let (done_tx, done_rx) = bounded(8);
        let ctx = ReqContext::new(1, 5, 99, vec![1, 2, 3]);
        nexus.submit_bg(handler, ctx, done_tx);

        let done = done_rx
            .recv_timeout(std::time::Duration::from_secs(2))
            .expect("worker should complete");
        assert_eq!(done.session, 5);
        assert_eq!(done.req_num, 99);
        assert_eq!(done.resp, vec![2, 4, 6]);
    }

    #[test]
    fn silent_handler_yields_empty_response() {
        let nexus = Nexus::new(1);
        let handler: ReqHandler = Arc::new(|_ctx: &mut ReqContext| {});
        let (done_tx, done_rx) = bounded(8);
        nexus.submit_bg(handler, ReqContext::new(2, 0, 1, vec![9]), done_tx);

        let done = done_rx
            .recv_timeout(std::time::Duration::from_secs(2))
            .expect("worker should complete");
        assert!(done.resp.is_empty());
    }
}
