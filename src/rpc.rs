//! The `Rpc` endpoint: a single-threaded reactor multiplexing sessions
//! over one transport.
//!
//! One OS thread owns one endpoint; all engine state lives in `RefCell`
//! and `Cell` fields, and every public method takes `&self`. The only
//! cross-thread traffic is the bounded handoff channel that background
//! handlers use to return responses.
//!
//! `run_event_loop_once` is the heartbeat: drain RX, drain background
//! completions, fire due retransmission timers, retry stalled
//! handshakes, then flush the transmit queue under the per-session rate
//! budget. Handlers and continuations always run with no internal
//! borrows held, so they may call back into the endpoint freely.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, trace, warn};

use crate::buffer::{BufferPool, MsgBuffer};
use crate::config::RpcConfig;
use crate::error::{Error, Result};
use crate::nexus::{BgDone, DispatchMode, Nexus, ReqContext, ReqHandler, RespHandle};
use crate::packet::{PktHdr, PktKind, SmErr, SmHdr, SmKind, PKT_HDR_SIZE};
use crate::session::{
    ClientSlotState, Continuation, RespPayload, ServerSlotState, Session, SessionState,
    SessionTable, Tag,
};
use crate::transport::{RouteId, RxFrame, Transport};
use crate::wheel::{Clock, TimerEntry, TimingWheel};

/// Cooperative cancellation flag for the event loop, checked once per
/// iteration. Clone it to keep one half on a signal handler or control
/// thread.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// A failed `enqueue_request`, handing both buffers back to the caller.
pub struct EnqueueError {
    pub error: Error,
    pub req: MsgBuffer,
    pub resp: MsgBuffer,
}

impl std::fmt::Debug for EnqueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnqueueError")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// Read-only snapshot of endpoint counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    /// Request packets retransmitted after a timeout.
    pub num_re_tx: u64,
    /// Session-management responses processed.
    pub num_sm_resps: u64,
    /// Requests abandoned after exhausting retries or teardown.
    pub num_abandoned: u64,
    /// Mean frames per non-empty RX poll.
    pub avg_rx_batch: f64,
    /// Mean frames per non-empty TX flush.
    pub avg_tx_batch: f64,
    /// Sessions not yet destroyed or failed.
    pub active_sessions: usize,
}

#[derive(Default)]
struct Counters {
    num_re_tx: Cell<u64>,
    num_sm_resps: Cell<u64>,
    num_abandoned: Cell<u64>,
    rx_frames: Cell<u64>,
    rx_polls: Cell<u64>,
    tx_frames: Cell<u64>,
    tx_flushes: Cell<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxDir {
    Request { slot: usize },
    Response { slot: usize },
}

/// One queued wire frame, resolved against live slot state at flush
/// time so completed or abandoned requests leave stale entries inert.
#[derive(Debug, Clone, Copy)]
struct TxEntry {
    session: u16,
    dir: TxDir,
    req_num: u64,
    pkt_idx: u16,
}

/// Deferred side effects collected while engine state is borrowed, run
/// after the borrow is released.
enum Followup {
    Complete {
        cont: Continuation,
        tag: Tag,
        req: MsgBuffer,
        resp: MsgBuffer,
    },
    RunInline {
        handler: ReqHandler,
        ctx: ReqContext,
    },
}

/// An RPC endpoint bound to one transport and one thread.
pub struct Rpc<T: Transport> {
    nexus: Arc<Nexus>,
    transport: T,
    cfg: RpcConfig,
    clock: Clock,
    pool: RefCell<BufferPool>,
    sessions: RefCell<SessionTable>,
    wheel: RefCell<TimingWheel>,
    tx_queue: RefCell<VecDeque<TxEntry>>,
    bg_tx: Sender<BgDone>,
    bg_rx: Receiver<BgDone>,
    counters: Counters,
}

impl<T: Transport> Rpc<T> {
    /// Build an endpoint over `transport`, registering every pool arena
    /// with it up front.
    pub fn new(nexus: Arc<Nexus>, transport: T, pool: BufferPool, cfg: RpcConfig) -> Result<Self> {
        if transport.mtu() <= PKT_HDR_SIZE {
            return Err(Error::InvalidArgument("transport MTU below header size"));
        }
        for region in pool.regions() {
            transport.register_memory(region)?;
        }
        let (bg_tx, bg_rx) = bounded(cfg.bg_queue_depth);
        let clock = Clock::new();
        let mut wheel = TimingWheel::default_for_rpc();
        wheel.init(clock.now_us());
        let max_sessions = cfg.max_sessions;
        Ok(Self {
            nexus,
            transport,
            cfg,
            clock,
            pool: RefCell::new(pool),
            sessions: RefCell::new(SessionTable::new(max_sessions)),
            wheel: RefCell::new(wheel),
            tx_queue: RefCell::new(VecDeque::new()),
            bg_tx,
            bg_rx,
            counters: Counters::default(),
        })
    }

    /// Fabric address other endpoints use to reach this one.
    pub fn local_route(&self) -> RouteId {
        self.transport.local_route()
    }

    // ------------------------------------------------------------------
    // Buffers

    pub fn alloc_msg_buffer(&self, size: usize) -> Result<MsgBuffer> {
        self.pool.borrow_mut().alloc(size)
    }

    pub fn resize_msg_buffer(&self, buf: &mut MsgBuffer, new_len: usize) -> Result<()> {
        buf.resize(new_len)
    }

    pub fn free_msg_buffer(&self, buf: MsgBuffer) {
        self.pool.borrow_mut().free(buf);
    }

    // ------------------------------------------------------------------
    // Session management

    /// Open a session to the endpoint at `remote_route`. Returns the
    /// local session number immediately; the session is usable once the
    /// handshake completes (`session_state` reports `Connected`).
    pub fn create_session(&self, remote_route: RouteId) -> Result<u16> {
        let now = self.clock.now_us();
        let id = {
            let mut sessions = self.sessions.borrow_mut();
            sessions
                .insert_with(|id| Session::new(id, remote_route, true, &self.cfg, &self.cfg.cc))
                .ok_or(Error::InvalidArgument("session table full"))?
        };
        let sm = SmHdr::new(
            SmKind::ConnectRequest,
            SmErr::Ok,
            id,
            0,
            self.cfg.session_credits as u16,
        );
        self.send_sm(remote_route, &sm);
        if let Some(s) = self.sessions.borrow_mut().get_mut(id) {
            s.sm_last_tx_us = now;
        }
        debug!(session = id, route = remote_route, "connect request sent");
        Ok(id)
    }

    /// Begin tearing a session down. In-flight requests are abandoned:
    /// their buffers return to the pool and their continuations never
    /// run. The disconnect is retried until acked; after
    /// `sm_max_retries` the session is destroyed unilaterally.
    pub fn destroy_session(&self, session_id: u16) -> Result<()> {
        let now = self.clock.now_us();
        let (remote_route, remote_id) = {
            let mut sessions = self.sessions.borrow_mut();
            let mut pool = self.pool.borrow_mut();
            let s = sessions
                .get_mut(session_id)
                .ok_or(Error::SessionNotFound(session_id))?;
            match s.state {
                SessionState::Destroyed | SessionState::Disconnecting => return Ok(()),
                SessionState::Failed => {
                    s.state = SessionState::Destroyed;
                    return Ok(());
                }
                SessionState::Connecting | SessionState::Connected => {}
            }
            for slot in &mut s.client_slots {
                if slot.state == ClientSlotState::Outstanding {
                    if let Some(buf) = slot.req.take() {
                        pool.free(buf);
                    }
                    if let Some(buf) = slot.resp.take() {
                        pool.free(buf);
                    }
                    slot.reset();
                    s.credits += 1;
                    self.counters
                        .num_abandoned
                        .set(self.counters.num_abandoned.get() + 1);
                }
            }
            for slot in &mut s.server_slots {
                if let Some(RespPayload::Buf(buf)) = slot.resp.take() {
                    pool.free(buf);
                }
                slot.reset();
            }
            s.state = SessionState::Disconnecting;
            s.sm_last_tx_us = now;
            s.sm_retries = 0;
            (s.remote_route, s.remote_id)
        };
        self.wheel.borrow_mut().cancel_session(session_id);
        self.tx_queue
            .borrow_mut()
            .retain(|e| e.session != session_id);
        let sm = SmHdr::new(
            SmKind::DisconnectRequest,
            SmErr::Ok,
            session_id,
            remote_id,
            0,
        );
        self.send_sm(remote_route, &sm);
        debug!(session = session_id, "disconnect request sent");
        Ok(())
    }

    pub fn session_state(&self, session_id: u16) -> Option<SessionState> {
        self.sessions.borrow().get(session_id).map(|s| s.state)
    }

    /// Current congestion-controlled rate for a session, bytes/sec.
    pub fn session_rate(&self, session_id: u16) -> Option<f64> {
        self.sessions
            .borrow()
            .get(session_id)
            .map(|s| s.rate.rate_bps())
    }

    // ------------------------------------------------------------------
    // Data plane

    /// Enqueue one request. Consumes a credit and both buffers; the
    /// continuation receives them back exactly once, on completion. On
    /// failure the buffers come back immediately in the error.
    pub fn enqueue_request(
        &self,
        session_id: u16,
        req_type: u8,
        req: MsgBuffer,
        resp: MsgBuffer,
        cont: Continuation,
        tag: Tag,
    ) -> std::result::Result<(), EnqueueError> {
        let fail = |error, req, resp| Err(EnqueueError { error, req, resp });

        if req.len() > self.cfg.max_msg_size {
            return fail(
                Error::MsgTooLarge {
                    size: req.len(),
                    max: self.cfg.max_msg_size,
                },
                req,
                resp,
            );
        }

        let now = self.clock.now_us();
        let mut sessions = self.sessions.borrow_mut();
        let Some(s) = sessions.get_mut(session_id) else {
            drop(sessions);
            return fail(Error::SessionNotFound(session_id), req, resp);
        };
        if s.state != SessionState::Connected {
            drop(sessions);
            return fail(Error::SessionNotConnected(session_id), req, resp);
        }
        // The peer may have granted fewer credits than we have slots.
        if s.credits == 0 {
            drop(sessions);
            return fail(Error::NoCredit(session_id), req, resp);
        }
        let Some(slot_idx) = s.alloc_client_slot() else {
            drop(sessions);
            return fail(Error::NoCredit(session_id), req, resp);
        };
        s.credits -= 1;

        let req_num = s.next_req_num;
        s.next_req_num += 1;
        let pkts_total = PktHdr::num_pkts(req.len(), self.transport.mtu());
        let rto_us = self.initial_rto(s);

        let slot = &mut s.client_slots[slot_idx];
        slot.state = ClientSlotState::Outstanding;
        slot.req_num = req_num;
        slot.req = Some(req);
        slot.resp = Some(resp);
        slot.cont = Some(cont);
        slot.tag = tag;
        slot.req_type = req_type;
        slot.tx_ts_us = now;
        slot.retries = 0;
        slot.rto_us = rto_us;
        slot.pkts_total = pkts_total;
        slot.pkts_sent = 0;
        slot.resp_pkts_total = 0;
        slot.resp_pkts_rcvd = 0;
        slot.resp_msg_size = 0;
        drop(sessions);

        let mut tx = self.tx_queue.borrow_mut();
        for pkt_idx in 0..pkts_total {
            tx.push_back(TxEntry {
                session: session_id,
                dir: TxDir::Request { slot: slot_idx },
                req_num,
                pkt_idx,
            });
        }
        drop(tx);

        self.wheel.borrow_mut().insert(TimerEntry {
            session: session_id,
            slot: slot_idx,
            req_num,
            fire_at_us: now + rto_us,
        });
        trace!(session = session_id, req_num, pkts = pkts_total, "request enqueued");
        Ok(())
    }

    /// Complete a deferred request. If the session has been destroyed in
    /// the meantime the buffer is freed and the response silently
    /// dropped.
    pub fn enqueue_response(&self, handle: RespHandle, resp: MsgBuffer) {
        self.store_response(handle.session, handle.req_num, RespPayload::Buf(resp));
    }

    // ------------------------------------------------------------------
    // Event loop

    /// One reactor iteration: RX, background completions, timers,
    /// handshake retries, TX flush.
    pub fn run_event_loop_once(&self) -> Result<()> {
        self.process_rx();
        self.drain_bg();
        let now = self.clock.now_us();
        self.process_timers(now);
        self.sm_maintenance(now);
        self.tx_flush(now)
    }

    /// Run iterations until `duration` elapses or the token cancels.
    /// The current iteration always completes.
    pub fn run_event_loop(&self, duration: Duration, cancel: &CancelToken) -> Result<()> {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline && !cancel.is_cancelled() {
            self.run_event_loop_once()?;
        }
        Ok(())
    }

    /// Run exactly `n` iterations (or fewer on cancellation), for
    /// deterministic tests and lockstep harnesses.
    pub fn run_event_loop_iterations(&self, n: usize, cancel: &CancelToken) -> Result<()> {
        for _ in 0..n {
            if cancel.is_cancelled() {
                break;
            }
            self.run_event_loop_once()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stats

    pub fn stats(&self) -> Stats {
        let c = &self.counters;
        let avg = |frames: u64, polls: u64| {
            if polls == 0 {
                0.0
            } else {
                frames as f64 / polls as f64
            }
        };
        Stats {
            num_re_tx: c.num_re_tx.get(),
            num_sm_resps: c.num_sm_resps.get(),
            num_abandoned: c.num_abandoned.get(),
            avg_rx_batch: avg(c.rx_frames.get(), c.rx_polls.get()),
            avg_tx_batch: avg(c.tx_frames.get(), c.tx_flushes.get()),
            active_sessions: self.sessions.borrow().active_count(),
        }
    }

    // ------------------------------------------------------------------
    // RX

    fn process_rx(&self) {
        let mut frames: Vec<RxFrame> = Vec::with_capacity(self.cfg.rx_batch_size);
        let n = self.transport.poll_recv(&mut frames, self.cfg.rx_batch_size);
        if n > 0 {
            self.counters
                .rx_frames
                .set(self.counters.rx_frames.get() + n as u64);
            self.counters.rx_polls.set(self.counters.rx_polls.get() + 1);
        }
        for frame in frames {
            self.handle_frame(frame);
        }
    }

    fn handle_frame(&self, frame: RxFrame) {
        let hdr = match PktHdr::from_bytes(&frame.bytes) {
            Ok(hdr) => hdr,
            Err(e) => {
                debug!(src = frame.src, %e, "dropping malformed frame");
                return;
            }
        };
        let payload = &frame.bytes[PKT_HDR_SIZE..];
        match hdr.kind {
            PktKind::Sm => self.handle_sm_frame(frame.src, payload),
            PktKind::Req => self.handle_req_pkt(frame.src, &hdr, payload),
            PktKind::Resp => self.handle_resp_pkt(frame.src, &hdr, payload),
            PktKind::CreditReturn => {
                trace!(src = frame.src, "credit-return frame ignored");
            }
        }
    }

    /// Incoming request segment, callee side.
    fn handle_req_pkt(&self, src: RouteId, hdr: &PktHdr, payload: &[u8]) {
        let followup = {
            let mut sessions = self.sessions.borrow_mut();
            let Some(s) = sessions.get_mut(hdr.dest_session) else {
                debug!(session = hdr.dest_session, "request for unknown session");
                return;
            };
            if s.state != SessionState::Connected || s.remote_route != src {
                return;
            }
            let Some(slot_idx) = s.server_slot_for(hdr.req_num) else {
                warn!(session = s.id, "no server slot available; dropping request");
                return;
            };
            let session_id = s.id;
            let slot = &mut s.server_slots[slot_idx];

            if slot.state != ServerSlotState::Free && slot.req_num == hdr.req_num {
                match slot.state {
                    ServerSlotState::Cached => {
                        // Duplicate of a served request: resend the
                        // response, never re-run the handler.
                        let pkts = PktHdr::num_pkts(
                            slot.resp.as_ref().map_or(0, |r| r.as_slice().len()),
                            self.transport.mtu(),
                        );
                        let req_num = slot.req_num;
                        drop(sessions);
                        self.queue_response_tx(session_id, slot_idx, req_num, pkts);
                        return;
                    }
                    ServerSlotState::InProgress => return,
                    ServerSlotState::Assembling => {
                        if hdr.pkt_idx != slot.rx_pkts_rcvd {
                            // Out of order or duplicate segment.
                            return;
                        }
                        slot.rx.extend_from_slice(payload);
                        slot.rx_pkts_rcvd += 1;
                        if slot.rx_pkts_rcvd < slot.rx_pkts_total {
                            return;
                        }
                        self.begin_dispatch(sessions, session_id, slot_idx)
                    }
                    ServerSlotState::Free => unreachable!(),
                }
            } else {
                // Fresh request (or a new one reclaiming a cached slot).
                if hdr.req_num < slot.req_num {
                    return; // stale duplicate of an evicted request
                }
                if hdr.pkt_idx != 0 {
                    return; // middle of a message whose head we missed
                }
                if let Some(RespPayload::Buf(buf)) = slot.resp.take() {
                    self.pool.borrow_mut().free(buf);
                }
                slot.reset();
                slot.req_num = hdr.req_num;
                slot.req_type = hdr.req_type;
                slot.rx_pkts_total = PktHdr::num_pkts(hdr.msg_size, self.transport.mtu());
                slot.rx = Vec::with_capacity(hdr.msg_size);
                slot.rx.extend_from_slice(payload);
                slot.rx_pkts_rcvd = 1;
                if slot.rx_pkts_rcvd < slot.rx_pkts_total {
                    slot.state = ServerSlotState::Assembling;
                    return;
                }
                self.begin_dispatch(sessions, session_id, slot_idx)
            }
        };
        self.run_followup(followup);
    }

    /// A fully assembled request: look up its handler and decide where
    /// it runs. Consumes the sessions borrow so inline handlers start
    /// with the engine unborrowed.
    fn begin_dispatch(
        &self,
        mut sessions: std::cell::RefMut<'_, SessionTable>,
        session_id: u16,
        slot_idx: usize,
    ) -> Option<Followup> {
        let s = sessions.get_mut(session_id)?;
        let slot = &mut s.server_slots[slot_idx];
        slot.state = ServerSlotState::InProgress;
        let req_type = slot.req_type;
        let req_num = slot.req_num;
        let data = std::mem::take(&mut slot.rx);
        drop(sessions);

        let Some((handler, mode)) = self.nexus.handler_for(req_type) else {
            warn!(req_type, "no handler registered; dropping request");
            let mut sessions = self.sessions.borrow_mut();
            if let Some(s) = sessions.get_mut(session_id) {
                s.server_slots[slot_idx].reset();
            }
            return None;
        };
        let ctx = ReqContext::new(req_type, session_id, req_num, data);
        match mode {
            DispatchMode::Inline => Some(Followup::RunInline { handler, ctx }),
            DispatchMode::Background => {
                self.nexus.submit_bg(handler, ctx, self.bg_tx.clone());
                None
            }
        }
    }

    /// Incoming response segment, caller side.
    fn handle_resp_pkt(&self, src: RouteId, hdr: &PktHdr, payload: &[u8]) {
        let followup = {
            let mut sessions = self.sessions.borrow_mut();
            let Some(s) = sessions.get_mut(hdr.dest_session) else {
                return;
            };
            if s.remote_route != src {
                return;
            }
            let Some(slot_idx) = s.client_slot_for(hdr.req_num) else {
                // Completed, abandoned, or never ours: a duplicate
                // response must not re-run the continuation.
                trace!(req_num = hdr.req_num, "stale response dropped");
                return;
            };
            let session_id = s.id;
            let slot = &mut s.client_slots[slot_idx];

            if slot.resp_pkts_rcvd == 0 {
                slot.resp_msg_size = hdr.msg_size;
                slot.resp_pkts_total = PktHdr::num_pkts(hdr.msg_size, self.transport.mtu());
                let cap = slot.resp.as_ref().map_or(0, |b| b.capacity());
                if hdr.msg_size > cap {
                    warn!(
                        session = session_id,
                        req_num = hdr.req_num,
                        size = hdr.msg_size,
                        cap,
                        "response exceeds caller buffer; abandoning request"
                    );
                    let mut pool = self.pool.borrow_mut();
                    if let Some(buf) = slot.req.take() {
                        pool.free(buf);
                    }
                    if let Some(buf) = slot.resp.take() {
                        pool.free(buf);
                    }
                    drop(pool);
                    slot.reset();
                    s.credits += 1;
                    drop(sessions);
                    self.counters
                        .num_abandoned
                        .set(self.counters.num_abandoned.get() + 1);
                    self.wheel
                        .borrow_mut()
                        .cancel(hdr.dest_session, slot_idx, hdr.req_num);
                    return;
                }
            }
            if hdr.pkt_idx != slot.resp_pkts_rcvd {
                return; // out of order or duplicate segment
            }
            let offset = hdr.pkt_idx as usize * PktHdr::data_per_pkt(self.transport.mtu());
            if offset + payload.len() > slot.resp_msg_size {
                // Payload runs past the advertised message size; the
                // frame is malformed and must not touch the buffer.
                debug!(
                    session = session_id,
                    req_num = hdr.req_num,
                    offset,
                    payload = payload.len(),
                    msg_size = slot.resp_msg_size,
                    "oversized response segment dropped"
                );
                return;
            }
            if let Some(resp) = slot.resp.as_mut() {
                resp.capacity_slice_mut()[offset..offset + payload.len()]
                    .copy_from_slice(payload);
            }
            slot.resp_pkts_rcvd += 1;
            if slot.resp_pkts_rcvd < slot.resp_pkts_total {
                return;
            }

            // Message complete.
            let req = match slot.req.take() {
                Some(b) => b,
                None => return,
            };
            let mut resp = match slot.resp.take() {
                Some(b) => b,
                None => return,
            };
            // Capacity checked on the first segment.
            let _ = resp.resize(slot.resp_msg_size);
            let cont = slot.cont.take();
            let tag = slot.tag;
            let retries = slot.retries;
            let tx_ts_us = slot.tx_ts_us;
            let req_num = slot.req_num;
            slot.reset();
            s.credits += 1;
            assert!(
                s.credits <= self.cfg.session_credits,
                "credit accounting overflow on session {session_id}"
            );

            // Karn's rule: only sample RTT from unretransmitted requests.
            if retries == 0 {
                let rtt = self.clock.now_us().saturating_sub(tx_ts_us);
                let sample = rtt as f64;
                s.srtt_us = if s.srtt_us == 0.0 {
                    sample
                } else {
                    0.875 * s.srtt_us + 0.125 * sample
                };
                if self.cfg.enable_cc {
                    s.rate.on_sample(rtt, &self.cfg.cc);
                }
            }
            drop(sessions);
            self.wheel
                .borrow_mut()
                .cancel(hdr.dest_session, slot_idx, req_num);

            if self.cfg.check_resp_first_byte
                && !req.is_empty()
                && !resp.is_empty()
                && req.as_slice()[0] != resp.as_slice()[0]
            {
                warn!(
                    session = session_id,
                    req_num, "response first byte does not echo the request"
                );
            }
            match cont {
                Some(cont) => Some(Followup::Complete {
                    cont,
                    tag,
                    req,
                    resp,
                }),
                None => {
                    let mut pool = self.pool.borrow_mut();
                    pool.free(req);
                    pool.free(resp);
                    None
                }
            }
        };
        self.run_followup(followup);
    }

    /// Run handler/continuation side effects with no borrows held.
    fn run_followup(&self, followup: Option<Followup>) {
        match followup {
            None => {}
            Some(Followup::Complete {
                cont,
                tag,
                req,
                resp,
            }) => cont(tag, req, resp),
            Some(Followup::RunInline { handler, mut ctx }) => {
                handler(&mut ctx);
                let (session_id, req_num, resp) = ctx.into_outcome();
                if let Some(bytes) = resp {
                    self.store_response(session_id, req_num, RespPayload::Inline(bytes));
                }
                // Handle taken: the application responds later via
                // enqueue_response.
            }
        }
    }

    /// Attach a ready response to its server slot and queue its
    /// segments for transmission.
    fn store_response(&self, session_id: u16, req_num: u64, payload: RespPayload) {
        let queued = {
            let mut sessions = self.sessions.borrow_mut();
            let Some(s) = sessions.get_mut(session_id) else {
                if let RespPayload::Buf(buf) = payload {
                    self.pool.borrow_mut().free(buf);
                }
                return;
            };
            let Some(slot_idx) = s.server_slots.iter().position(|sl| {
                sl.state == ServerSlotState::InProgress && sl.req_num == req_num
            }) else {
                if let RespPayload::Buf(buf) = payload {
                    self.pool.borrow_mut().free(buf);
                }
                return;
            };
            let pkts = PktHdr::num_pkts(payload.as_slice().len(), self.transport.mtu());
            let slot = &mut s.server_slots[slot_idx];
            slot.resp = Some(payload);
            slot.state = ServerSlotState::Cached;
            (slot_idx, pkts)
        };
        self.queue_response_tx(session_id, queued.0, req_num, queued.1);
    }

    fn queue_response_tx(&self, session_id: u16, slot_idx: usize, req_num: u64, pkts: u16) {
        let mut tx = self.tx_queue.borrow_mut();
        for pkt_idx in 0..pkts {
            tx.push_back(TxEntry {
                session: session_id,
                dir: TxDir::Response { slot: slot_idx },
                req_num,
                pkt_idx,
            });
        }
    }

    fn drain_bg(&self) {
        while let Ok(done) = self.bg_rx.try_recv() {
            self.store_response(done.session, done.req_num, RespPayload::Inline(done.resp));
        }
    }

    // ------------------------------------------------------------------
    // Session management plane

    fn send_sm(&self, dest: RouteId, sm: &SmHdr) {
        let pkt = PktHdr::new(0, 0, 0, PktKind::Sm, 0, 0);
        let body = sm.to_bytes();
        if let Err(e) = self.transport.post_send(dest, &pkt.to_bytes(), &body) {
            warn!(%e, "failed to send session-management frame");
        }
    }

    fn handle_sm_frame(&self, src: RouteId, payload: &[u8]) {
        let sm = match SmHdr::from_bytes(payload) {
            Ok(sm) => sm,
            Err(e) => {
                debug!(src, %e, "dropping malformed SM frame");
                return;
            }
        };
        match sm.kind {
            SmKind::ConnectRequest => self.on_connect_request(src, &sm),
            SmKind::ConnectResponse => self.on_connect_response(&sm),
            SmKind::DisconnectRequest => self.on_disconnect_request(src, &sm),
            SmKind::DisconnectResponse => self.on_disconnect_response(&sm),
        }
    }

    fn on_connect_request(&self, src: RouteId, sm: &SmHdr) {
        let mut sessions = self.sessions.borrow_mut();
        // A retried connect must get the same answer, not a new session.
        let existing = sessions.iter().find_map(|s| {
            (!s.is_client
                && s.remote_route == src
                && s.remote_id == sm.client_session
                && s.state == SessionState::Connected)
                .then_some((s.id, s.credits))
        });
        let resp = if let Some((server_id, credits)) = existing {
            SmHdr::new(
                SmKind::ConnectResponse,
                SmErr::Ok,
                sm.client_session,
                server_id,
                credits as u16,
            )
        } else {
            let granted = self.cfg.session_credits.min(sm.credits as usize);
            let created = sessions.insert_with(|id| {
                let mut s = Session::new(id, src, false, &self.cfg, &self.cfg.cc);
                s.remote_id = sm.client_session;
                s.credits = granted;
                s
            });
            match created {
                Some(server_id) => {
                    debug!(session = server_id, route = src, "accepted connect");
                    SmHdr::new(
                        SmKind::ConnectResponse,
                        SmErr::Ok,
                        sm.client_session,
                        server_id,
                        granted as u16,
                    )
                }
                None => SmHdr::new(
                    SmKind::ConnectResponse,
                    SmErr::NoSessionSlots,
                    sm.client_session,
                    0,
                    0,
                ),
            }
        };
        drop(sessions);
        self.send_sm(src, &resp);
    }

    fn on_connect_response(&self, sm: &SmHdr) {
        self.counters
            .num_sm_resps
            .set(self.counters.num_sm_resps.get() + 1);
        let mut sessions = self.sessions.borrow_mut();
        let Some(s) = sessions.get_mut(sm.client_session) else {
            return;
        };
        if s.state != SessionState::Connecting {
            return; // duplicate response after a retry
        }
        if sm.err != SmErr::Ok {
            warn!(session = s.id, err = ?sm.err, "connect rejected");
            s.state = SessionState::Failed;
            return;
        }
        s.remote_id = sm.server_session;
        s.credits = s.credits.min(sm.credits as usize);
        s.state = SessionState::Connected;
        debug!(session = s.id, remote = s.remote_id, "session connected");
    }

    fn on_disconnect_request(&self, src: RouteId, sm: &SmHdr) {
        {
            let mut sessions = self.sessions.borrow_mut();
            // server_session is our local id on the callee side.
            if let Some(s) = sessions.get_mut(sm.server_session) {
                if !s.is_client && s.remote_route == src && s.remote_id == sm.client_session {
                    let mut pool = self.pool.borrow_mut();
                    for slot in &mut s.server_slots {
                        if let Some(RespPayload::Buf(buf)) = slot.resp.take() {
                            pool.free(buf);
                        }
                        slot.reset();
                    }
                    s.state = SessionState::Destroyed;
                    debug!(session = s.id, "session destroyed by peer");
                }
            }
        }
        self.tx_queue
            .borrow_mut()
            .retain(|e| e.session != sm.server_session);
        // Ack unconditionally so retried disconnects converge.
        let resp = SmHdr::new(
            SmKind::DisconnectResponse,
            SmErr::Ok,
            sm.client_session,
            sm.server_session,
            0,
        );
        self.send_sm(src, &resp);
    }

    fn on_disconnect_response(&self, sm: &SmHdr) {
        self.counters
            .num_sm_resps
            .set(self.counters.num_sm_resps.get() + 1);
        let mut sessions = self.sessions.borrow_mut();
        if let Some(s) = sessions.get_mut(sm.client_session) {
            if s.state == SessionState::Disconnecting {
                s.state = SessionState::Destroyed;
                debug!(session = s.id, "session destroyed");
            }
        }
    }

    /// Retry stalled handshakes; give up after `sm_max_retries`.
    fn sm_maintenance(&self, now: u64) {
        let mut resend: Vec<(RouteId, SmHdr)> = Vec::new();
        {
            let mut sessions = self.sessions.borrow_mut();
            for s in sessions.iter_mut() {
                let due = now.saturating_sub(s.sm_last_tx_us) >= self.cfg.sm_retry_interval_us;
                match s.state {
                    SessionState::Connecting if due => {
                        s.sm_retries += 1;
                        if s.sm_retries > self.cfg.sm_max_retries {
                            warn!(session = s.id, "connect timed out; session failed");
                            s.state = SessionState::Failed;
                            continue;
                        }
                        s.sm_last_tx_us = now;
                        resend.push((
                            s.remote_route,
                            SmHdr::new(
                                SmKind::ConnectRequest,
                                SmErr::Ok,
                                s.id,
                                0,
                                self.cfg.session_credits as u16,
                            ),
                        ));
                    }
                    SessionState::Disconnecting if due => {
                        s.sm_retries += 1;
                        if s.sm_retries > self.cfg.sm_max_retries {
                            warn!(session = s.id, "disconnect unacked; destroying locally");
                            s.state = SessionState::Destroyed;
                            continue;
                        }
                        s.sm_last_tx_us = now;
                        resend.push((
                            s.remote_route,
                            SmHdr::new(
                                SmKind::DisconnectRequest,
                                SmErr::Ok,
                                s.id,
                                s.remote_id,
                                0,
                            ),
                        ));
                    }
                    _ => {}
                }
            }
        }
        for (route, sm) in resend {
            self.send_sm(route, &sm);
        }
    }

    // ------------------------------------------------------------------
    // Timers and retransmission

    fn process_timers(&self, now: u64) {
        let mut due: Vec<TimerEntry> = Vec::new();
        self.wheel.borrow_mut().advance_into(now, &mut due);
        for entry in due {
            self.on_timer_fire(entry, now);
        }
    }

    fn on_timer_fire(&self, entry: TimerEntry, now: u64) {
        let action = {
            let mut sessions = self.sessions.borrow_mut();
            let Some(s) = sessions.get_mut(entry.session) else {
                return;
            };
            let slot = &mut s.client_slots[entry.slot];
            if slot.state != ClientSlotState::Outstanding || slot.req_num != entry.req_num {
                return; // completed after the entry was queued
            }

            if slot.pkts_sent < slot.pkts_total {
                // Still pacing out the initial transmission; push the
                // deadline back without counting a retry.
                None
            } else if slot.retries >= self.cfg.max_retries {
                warn!(
                    session = entry.session,
                    req_num = entry.req_num,
                    retries = slot.retries,
                    "request abandoned after max retries"
                );
                let mut pool = self.pool.borrow_mut();
                if let Some(buf) = slot.req.take() {
                    pool.free(buf);
                }
                if let Some(buf) = slot.resp.take() {
                    pool.free(buf);
                }
                drop(pool);
                slot.reset();
                s.credits += 1;
                self.counters
                    .num_abandoned
                    .set(self.counters.num_abandoned.get() + 1);
                return;
            } else {
                slot.retries += 1;
                slot.rto_us = (slot.rto_us * 2).min(self.cfg.rto_max_us);
                slot.resp_pkts_rcvd = 0;
                slot.resp_msg_size = 0;
                self.counters
                    .num_re_tx
                    .set(self.counters.num_re_tx.get() + slot.pkts_total as u64);
                debug!(
                    session = entry.session,
                    req_num = entry.req_num,
                    retry = slot.retries,
                    "retransmitting request"
                );
                Some(slot.pkts_total)
            }
        };

        let rearm_rto = {
            let sessions = self.sessions.borrow();
            sessions
                .get(entry.session)
                .filter(|s| {
                    s.client_slots[entry.slot].state == ClientSlotState::Outstanding
                        && s.client_slots[entry.slot].req_num == entry.req_num
                })
                .map(|s| s.client_slots[entry.slot].rto_us)
        };
        let Some(rto_us) = rearm_rto else {
            return; // abandoned above
        };

        if let Some(pkts_total) = action {
            let mut tx = self.tx_queue.borrow_mut();
            for pkt_idx in 0..pkts_total {
                tx.push_back(TxEntry {
                    session: entry.session,
                    dir: TxDir::Request { slot: entry.slot },
                    req_num: entry.req_num,
                    pkt_idx,
                });
            }
        }
        self.wheel.borrow_mut().insert(TimerEntry {
            fire_at_us: now + rto_us,
            ..entry
        });
    }

    /// RTO for a brand-new request: three smoothed RTTs once samples
    /// exist, the configured initial value before that.
    fn initial_rto(&self, s: &Session) -> u64 {
        if s.srtt_us > 0.0 {
            ((s.srtt_us * 3.0) as u64).clamp(self.cfg.rto_min_us, self.cfg.rto_max_us)
        } else {
            self.cfg.initial_rto_us
        }
    }

    // ------------------------------------------------------------------
    // TX

    /// Drain the transmit queue under per-session rate budgets. Entries
    /// of a budget-stalled session rotate to the back in order, so
    /// within-session packet order is preserved.
    fn tx_flush(&self, now: u64) -> Result<()> {
        if self.cfg.enable_cc {
            let mut sessions = self.sessions.borrow_mut();
            for s in sessions.iter_mut() {
                s.rate.replenish(now, &self.cfg.cc);
            }
        }

        let pending = self.tx_queue.borrow().len();
        if pending == 0 {
            return Ok(());
        }
        let mut stalled: Vec<u16> = Vec::new();
        let mut sent: u64 = 0;

        for _ in 0..pending {
            let Some(entry) = self.tx_queue.borrow_mut().pop_front() else {
                break;
            };
            if stalled.contains(&entry.session) {
                self.tx_queue.borrow_mut().push_back(entry);
                continue;
            }
            match self.tx_one(&entry, now) {
                TxOutcome::Sent => sent += 1,
                TxOutcome::Skipped => {}
                TxOutcome::Stalled => {
                    stalled.push(entry.session);
                    self.tx_queue.borrow_mut().push_back(entry);
                }
            }
        }

        if sent > 0 {
            self.counters
                .tx_frames
                .set(self.counters.tx_frames.get() + sent);
            self.counters
                .tx_flushes
                .set(self.counters.tx_flushes.get() + 1);
        }
        self.transport.flush()
    }

    fn tx_one(&self, entry: &TxEntry, now: u64) -> TxOutcome {
        let mut sessions = self.sessions.borrow_mut();
        let Some(s) = sessions.get_mut(entry.session) else {
            return TxOutcome::Skipped;
        };
        if s.state != SessionState::Connected {
            return TxOutcome::Skipped;
        }
        let mtu = self.transport.mtu();
        let dpp = PktHdr::data_per_pkt(mtu);
        let dest = s.remote_route;
        let dest_session = s.remote_id;

        // Resolve the entry against live slot state; stale entries
        // (completed, abandoned, reused slots) are dropped here.
        let (hdr, full, is_first_req_pkt) = match entry.dir {
            TxDir::Request { slot } => {
                let sl = &s.client_slots[slot];
                if sl.state != ClientSlotState::Outstanding || sl.req_num != entry.req_num {
                    return TxOutcome::Skipped;
                }
                let Some(req) = sl.req.as_ref() else {
                    return TxOutcome::Skipped;
                };
                let hdr = PktHdr::new(
                    sl.req_type,
                    dest_session,
                    req.len(),
                    PktKind::Req,
                    entry.pkt_idx,
                    entry.req_num,
                );
                (hdr, req.len(), entry.pkt_idx == 0)
            }
            TxDir::Response { slot } => {
                let sl = &s.server_slots[slot];
                if sl.state != ServerSlotState::Cached || sl.req_num != entry.req_num {
                    return TxOutcome::Skipped;
                }
                let Some(resp) = sl.resp.as_ref() else {
                    return TxOutcome::Skipped;
                };
                let hdr = PktHdr::new(
                    sl.req_type,
                    dest_session,
                    resp.as_slice().len(),
                    PktKind::Resp,
                    entry.pkt_idx,
                    entry.req_num,
                );
                (hdr, resp.as_slice().len(), false)
            }
        };

        let offset = entry.pkt_idx as usize * dpp;
        let chunk = full.saturating_sub(offset).min(dpp);
        let frame_len = PKT_HDR_SIZE + chunk;

        if self.cfg.enable_cc {
            if !s.rate.can_send(frame_len) {
                return TxOutcome::Stalled;
            }
            s.rate.spend(frame_len);
        }

        let result = match entry.dir {
            TxDir::Request { slot } => {
                let r = {
                    let sl = &s.client_slots[slot];
                    let req = sl.req.as_ref().map(|b| b.as_slice()).unwrap_or(&[]);
                    self.transport
                        .post_send(dest, &hdr.to_bytes(), &req[offset..offset + chunk])
                };
                if r.is_ok() {
                    let sl = &mut s.client_slots[slot];
                    if is_first_req_pkt {
                        sl.tx_ts_us = now;
                    }
                    sl.pkts_sent = sl.pkts_sent.max(entry.pkt_idx + 1);
                }
                r
            }
            TxDir::Response { slot } => {
                let sl = &s.server_slots[slot];
                let resp = sl.resp.as_ref().map(|r| r.as_slice()).unwrap_or(&[]);
                self.transport
                    .post_send(dest, &hdr.to_bytes(), &resp[offset..offset + chunk])
            }
        };
        match result {
            Ok(()) => TxOutcome::Sent,
            Err(e) => {
                warn!(%e, session = entry.session, "transport rejected frame");
                TxOutcome::Skipped
            }
        }
    }
}

enum TxOutcome {
    Sent,
    Skipped,
    Stalled,
}
