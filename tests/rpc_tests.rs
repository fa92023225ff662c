//! End-to-end tests driving two endpoints over an in-process fabric.
//!
//! Both endpoints live on the test thread and are advanced in lockstep,
//! so packet interleavings are deterministic except where fault
//! injection or wall-clock timeouts are the point of the test.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use wirerpc::packet::{PktHdr, PktKind, SmErr, SmHdr, SmKind, PKT_HDR_SIZE};
use wirerpc::{
    BufferPool, CancelToken, DispatchMode, Error, FaultHandle, FaultPolicy, InprocFabric,
    InprocTransport, MsgBuffer, Nexus, PoolConfig, Rpc, RpcConfig, SessionState, Tag, Transport,
};

type Endpoint = Rpc<InprocTransport>;

struct Pair {
    client: Endpoint,
    client_faults: FaultHandle,
    server: Endpoint,
    server_faults: FaultHandle,
}

fn pair(mtu: usize, server_nexus: Arc<Nexus>, cfg: RpcConfig) -> Pair {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .try_init();

    let fabric = InprocFabric::new(mtu);
    let (client_tp, client_faults) = fabric.attach();
    let (server_tp, server_faults) = fabric.attach();

    let pool_cfg = PoolConfig {
        max_msg_size: 8192,
        slots_per_class: 64,
    };
    let client = Rpc::new(
        Nexus::new(0),
        client_tp,
        BufferPool::new(&pool_cfg).unwrap(),
        cfg.clone(),
    )
    .unwrap();
    let server = Rpc::new(
        server_nexus,
        server_tp,
        BufferPool::new(&pool_cfg).unwrap(),
        cfg,
    )
    .unwrap();
    Pair {
        client,
        client_faults,
        server,
        server_faults,
    }
}

fn lockstep(p: &Pair, iters: usize) {
    for _ in 0..iters {
        p.client.run_event_loop_once().unwrap();
        p.server.run_event_loop_once().unwrap();
    }
}

fn connect(p: &Pair) -> u16 {
    let session = p.client.create_session(p.server.local_route()).unwrap();
    lockstep(p, 10);
    assert_eq!(p.client.session_state(session), Some(SessionState::Connected));
    session
}

/// Handler echoing the full request payload.
fn echo_nexus() -> Arc<Nexus> {
    let nexus = Nexus::new(0);
    nexus
        .register_req_func(
            1,
            Arc::new(|ctx| {
                let data = ctx.data().to_vec();
                ctx.respond(&data);
            }),
            DispatchMode::Inline,
        )
        .unwrap();
    nexus
}

/// Completed calls captured by continuations, with their buffers.
type DoneLog = Rc<RefCell<Vec<(Tag, MsgBuffer, MsgBuffer)>>>;

fn capture(done: &DoneLog) -> wirerpc::Continuation {
    let done = Rc::clone(done);
    Box::new(move |tag, req, resp| done.borrow_mut().push((tag, req, resp)))
}

fn seeded(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}

fn send_one(p: &Pair, session: u16, req_type: u8, payload: &[u8], done: &DoneLog) {
    let mut req = p.client.alloc_msg_buffer(payload.len().max(1)).unwrap();
    req.resize(payload.len()).unwrap();
    req.copy_from(payload).unwrap();
    let resp = p.client.alloc_msg_buffer(4096).unwrap();
    p.client
        .enqueue_request(session, req_type, req, resp, capture(done), Tag::default())
        .unwrap();
}

#[test]
fn small_echo_round_trip() {
    let p = pair(1024, echo_nexus(), RpcConfig::default());
    let session = connect(&p);

    let payload = seeded(7, 64);
    let done: DoneLog = Rc::new(RefCell::new(Vec::new()));
    send_one(&p, session, 1, &payload, &done);
    lockstep(&p, 20);

    let mut completions = done.borrow_mut();
    assert_eq!(completions.len(), 1);
    let (_, req, resp) = completions.pop().unwrap();
    assert_eq!(resp.as_slice(), &payload[..]);
    drop(completions);
    p.client.free_msg_buffer(req);
    p.client.free_msg_buffer(resp);
}

#[test]
fn credit_bound_is_enforced() {
    let cfg = RpcConfig::default().with_session_credits(4);
    let p = pair(1024, echo_nexus(), cfg);
    let session = connect(&p);

    let done: DoneLog = Rc::new(RefCell::new(Vec::new()));
    for _ in 0..4 {
        send_one(&p, session, 1, &seeded(1, 32), &done);
    }

    // Fifth request must bounce with NoCredit and return both buffers.
    let req = p.client.alloc_msg_buffer(32).unwrap();
    let resp = p.client.alloc_msg_buffer(32).unwrap();
    let err = p
        .client
        .enqueue_request(session, 1, req, resp, capture(&done), Tag::default())
        .unwrap_err();
    assert!(matches!(err.error, Error::NoCredit(s) if s == session));
    p.client.free_msg_buffer(err.req);
    p.client.free_msg_buffer(err.resp);

    // Completions return credits; the window opens again.
    lockstep(&p, 30);
    assert_eq!(done.borrow().len(), 4);
    send_one(&p, session, 1, &seeded(1, 32), &done);
    lockstep(&p, 20);
    assert_eq!(done.borrow().len(), 5);

    for (_, req, resp) in done.borrow_mut().drain(..) {
        p.client.free_msg_buffer(req);
        p.client.free_msg_buffer(resp);
    }
}

#[test]
fn multi_packet_first_byte_echo() {
    // Bandwidth-style exchange: 4096-byte request and response at a
    // 1024-byte MTU, the response echoing the request's first byte.
    let nexus = Nexus::new(0);
    nexus
        .register_req_func(
            2,
            Arc::new(|ctx| {
                let mut resp = vec![0u8; ctx.data().len()];
                resp[0] = ctx.data()[0];
                ctx.respond(&resp);
            }),
            DispatchMode::Inline,
        )
        .unwrap();
    let p = pair(1024, nexus, RpcConfig::default().with_check_resp_first_byte(true));
    let session = connect(&p);

    let payload = seeded(0xAB, 4096);
    let done: DoneLog = Rc::new(RefCell::new(Vec::new()));
    send_one(&p, session, 2, &payload, &done);
    lockstep(&p, 40);

    let mut completions = done.borrow_mut();
    assert_eq!(completions.len(), 1);
    let (_, req, resp) = completions.pop().unwrap();
    assert_eq!(resp.len(), 4096);
    assert_eq!(resp.as_slice()[0], 0xAB);
    drop(completions);
    p.client.free_msg_buffer(req);
    p.client.free_msg_buffer(resp);
}

#[test]
fn duplicated_frames_complete_exactly_once() {
    let handler_runs = Arc::new(AtomicUsize::new(0));
    let runs = Arc::clone(&handler_runs);
    let nexus = Nexus::new(0);
    nexus
        .register_req_func(
            1,
            Arc::new(move |ctx| {
                runs.fetch_add(1, Ordering::Relaxed);
                let data = ctx.data().to_vec();
                ctx.respond(&data);
            }),
            DispatchMode::Inline,
        )
        .unwrap();
    let p = pair(1024, nexus, RpcConfig::default());
    let session = connect(&p);

    // Every frame in both directions is delivered twice.
    p.client_faults.set(FaultPolicy::Duplicate);
    p.server_faults.set(FaultPolicy::Duplicate);

    let done: DoneLog = Rc::new(RefCell::new(Vec::new()));
    send_one(&p, session, 1, &seeded(3, 128), &done);
    lockstep(&p, 30);

    assert_eq!(handler_runs.load(Ordering::Relaxed), 1);
    assert_eq!(done.borrow().len(), 1);
    for (_, req, resp) in done.borrow_mut().drain(..) {
        p.client.free_msg_buffer(req);
        p.client.free_msg_buffer(resp);
    }
}

#[test]
fn oversized_response_segment_is_dropped() {
    // A raw peer speaks the wire format by hand so it can emit a frame
    // no well-behaved endpoint would: a response claiming a small
    // message size while carrying a near-MTU payload. The caller must
    // discard it and keep serving the request slot.
    let fabric = InprocFabric::new(1024);
    let (client_tp, _) = fabric.attach();
    let (peer, _) = fabric.attach();
    let peer_route = peer.local_route();

    let pool_cfg = PoolConfig {
        max_msg_size: 8192,
        slots_per_class: 64,
    };
    let client = Rpc::new(
        Nexus::new(0),
        client_tp,
        BufferPool::new(&pool_cfg).unwrap(),
        RpcConfig::default(),
    )
    .unwrap();
    let client_route = client.local_route();

    let session = client.create_session(peer_route).unwrap();

    // Accept the handshake by hand.
    let mut frames = Vec::new();
    assert!(peer.poll_recv(&mut frames, 16) >= 1);
    let sm = SmHdr::from_bytes(&frames[0].bytes[PKT_HDR_SIZE..]).unwrap();
    assert_eq!(sm.kind, SmKind::ConnectRequest);
    let accept = SmHdr::new(
        SmKind::ConnectResponse,
        SmErr::Ok,
        sm.client_session,
        7,
        sm.credits,
    );
    peer.post_send(
        client_route,
        &PktHdr::new(0, 0, 0, PktKind::Sm, 0, 0).to_bytes(),
        &accept.to_bytes(),
    )
    .unwrap();
    client.run_event_loop_once().unwrap();
    assert_eq!(client.session_state(session), Some(SessionState::Connected));

    // One request with a 64-byte response buffer.
    let mut req = client.alloc_msg_buffer(32).unwrap();
    req.copy_from(&seeded(1, 32)).unwrap();
    let resp = client.alloc_msg_buffer(64).unwrap();
    let done: DoneLog = Rc::new(RefCell::new(Vec::new()));
    client
        .enqueue_request(session, 1, req, resp, capture(&done), Tag::default())
        .unwrap();
    client.run_event_loop_once().unwrap();

    frames.clear();
    assert!(peer.poll_recv(&mut frames, 16) >= 1);
    let req_hdr = frames
        .iter()
        .find_map(|f| {
            let h = PktHdr::from_bytes(&f.bytes).ok()?;
            (h.kind == PktKind::Req).then_some(h)
        })
        .unwrap();

    // Payload far beyond the advertised 32 bytes: must be dropped
    // without touching the response buffer or running the continuation.
    let bad = PktHdr::new(1, session, 32, PktKind::Resp, 0, req_hdr.req_num);
    peer.post_send(client_route, &bad.to_bytes(), &[0u8; 1000])
        .unwrap();
    client.run_event_loop_once().unwrap();
    assert!(done.borrow().is_empty());

    // A well-formed response still completes the same request.
    let good = PktHdr::new(1, session, 32, PktKind::Resp, 0, req_hdr.req_num);
    peer.post_send(client_route, &good.to_bytes(), &seeded(1, 32))
        .unwrap();
    client.run_event_loop_once().unwrap();
    assert_eq!(done.borrow().len(), 1);

    for (_, req, resp) in done.borrow_mut().drain(..) {
        client.free_msg_buffer(req);
        client.free_msg_buffer(resp);
    }
}

#[test]
fn lost_request_is_retransmitted() {
    let cfg = RpcConfig::default().with_initial_rto_us(2000);
    let p = pair(1024, echo_nexus(), cfg);
    let session = connect(&p);

    // Eat the initial request packet; recovery must come from the
    // retransmission timer.
    p.client_faults.set(FaultPolicy::Drop { remaining: 1 });

    let done: DoneLog = Rc::new(RefCell::new(Vec::new()));
    send_one(&p, session, 1, &seeded(9, 64), &done);

    for _ in 0..200 {
        lockstep(&p, 1);
        if !done.borrow().is_empty() {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    assert_eq!(done.borrow().len(), 1);
    assert!(p.client.stats().num_re_tx >= 1);
    for (_, req, resp) in done.borrow_mut().drain(..) {
        p.client.free_msg_buffer(req);
        p.client.free_msg_buffer(resp);
    }
}

#[test]
fn retries_exhausted_request_is_abandoned() {
    let cfg = RpcConfig::default()
        .with_session_credits(1)
        .with_initial_rto_us(1000)
        .with_max_retries(2);
    let p = pair(1024, echo_nexus(), cfg);
    let session = connect(&p);

    // Blackhole everything the caller sends from here on: the request
    // and every retransmission vanish, so the retry budget must run out.
    p.client_faults.set(FaultPolicy::Drop {
        remaining: u32::MAX,
    });

    let done: DoneLog = Rc::new(RefCell::new(Vec::new()));
    send_one(&p, session, 1, &seeded(6, 64), &done);

    for _ in 0..500 {
        lockstep(&p, 1);
        if p.client.stats().num_abandoned == 1 {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    assert_eq!(p.client.stats().num_abandoned, 1);
    assert_eq!(p.client.stats().num_re_tx, 2);
    assert!(done.borrow().is_empty());

    // Abandonment returns the credit: with a window of one, a fresh
    // request can only be accepted if the slot was reclaimed.
    p.client_faults.set(FaultPolicy::None);
    send_one(&p, session, 1, &seeded(6, 64), &done);
    lockstep(&p, 20);
    assert_eq!(done.borrow().len(), 1);

    for (_, req, resp) in done.borrow_mut().drain(..) {
        p.client.free_msg_buffer(req);
        p.client.free_msg_buffer(resp);
    }
}

#[test]
fn teardown_abandons_inflight_requests() {
    let p = pair(1024, echo_nexus(), RpcConfig::default());
    let session = connect(&p);

    let done: DoneLog = Rc::new(RefCell::new(Vec::new()));
    for _ in 0..3 {
        send_one(&p, session, 1, &seeded(5, 64), &done);
    }
    // Destroy before a single loop iteration runs: nothing hits the
    // wire, and no continuation may ever fire.
    p.client.destroy_session(session).unwrap();
    lockstep(&p, 20);

    assert_eq!(p.client.session_state(session), Some(SessionState::Destroyed));
    assert!(done.borrow().is_empty());
    assert_eq!(p.client.stats().num_abandoned, 3);
}

#[test]
fn enqueue_on_unconnected_session_fails() {
    let p = pair(1024, echo_nexus(), RpcConfig::default());
    // No lockstep: the handshake cannot have completed.
    let session = p.client.create_session(p.server.local_route()).unwrap();
    assert_eq!(p.client.session_state(session), Some(SessionState::Connecting));

    let req = p.client.alloc_msg_buffer(32).unwrap();
    let resp = p.client.alloc_msg_buffer(32).unwrap();
    let done: DoneLog = Rc::new(RefCell::new(Vec::new()));
    let err = p
        .client
        .enqueue_request(session, 1, req, resp, capture(&done), Tag::default())
        .unwrap_err();
    assert!(matches!(err.error, Error::SessionNotConnected(s) if s == session));
    p.client.free_msg_buffer(err.req);
    p.client.free_msg_buffer(err.resp);
}

#[test]
fn background_dispatch_round_trip() {
    let nexus = Nexus::new(1);
    nexus
        .register_req_func(
            1,
            Arc::new(|ctx| {
                let reversed: Vec<u8> = ctx.data().iter().rev().copied().collect();
                ctx.respond(&reversed);
            }),
            DispatchMode::Background,
        )
        .unwrap();
    let p = pair(1024, nexus, RpcConfig::default());
    let session = connect(&p);

    let payload = seeded(2, 16);
    let done: DoneLog = Rc::new(RefCell::new(Vec::new()));
    send_one(&p, session, 1, &payload, &done);

    for _ in 0..200 {
        lockstep(&p, 1);
        if !done.borrow().is_empty() {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    let mut completions = done.borrow_mut();
    assert_eq!(completions.len(), 1);
    let (_, req, resp) = completions.pop().unwrap();
    let expected: Vec<u8> = payload.iter().rev().copied().collect();
    assert_eq!(resp.as_slice(), &expected[..]);
    drop(completions);
    p.client.free_msg_buffer(req);
    p.client.free_msg_buffer(resp);
}

#[test]
fn congestion_controlled_traffic_flows() {
    // RTT samples on a loopback fabric depend on scheduler noise, so
    // end to end we only pin the clamp invariant; the monotone growth
    // property is covered deterministically at the unit level.
    let cfg = RpcConfig::default().with_cc(true);
    let cc = cfg.cc.clone();
    let p = pair(1024, echo_nexus(), cfg);
    let session = connect(&p);

    let done: DoneLog = Rc::new(RefCell::new(Vec::new()));
    for _ in 0..10 {
        send_one(&p, session, 1, &seeded(4, 32), &done);
        lockstep(&p, 20);
        let rate = p.client.session_rate(session).unwrap();
        assert!(rate >= cc.min_rate_bps && rate <= cc.max_rate_bps);
    }
    assert_eq!(done.borrow().len(), 10);

    for (_, req, resp) in done.borrow_mut().drain(..) {
        p.client.free_msg_buffer(req);
        p.client.free_msg_buffer(resp);
    }
}

#[test]
fn stats_count_sm_responses() {
    let p = pair(1024, echo_nexus(), RpcConfig::default());
    let session = connect(&p);
    assert!(p.client.stats().num_sm_resps >= 1);
    assert_eq!(p.client.stats().active_sessions, 1);

    p.client.destroy_session(session).unwrap();
    lockstep(&p, 20);
    assert_eq!(p.client.stats().active_sessions, 0);
}

#[test]
fn cancel_token_stops_the_loop() {
    let p = pair(1024, echo_nexus(), RpcConfig::default());
    let cancel = CancelToken::new();
    cancel.cancel();
    // A cancelled token wins over both loop variants immediately.
    p.client
        .run_event_loop(Duration::from_secs(60), &cancel)
        .unwrap();
    p.client.run_event_loop_iterations(1_000_000, &cancel).unwrap();
}
