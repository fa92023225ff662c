//! Datagram transport abstraction and the in-process fabric.
//!
//! The engine is generic over [`Transport`]: an unreliable, unordered
//! datagram interface with a fixed MTU. [`InprocFabric`] backs it with
//! per-endpoint crossbeam channels so full endpoints can run against each
//! other inside one process, with injectable loss and duplication for
//! exercising the reliability path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{unbounded, Receiver, Sender, TrySendError};

use crate::buffer::MemRegion;
use crate::error::{Error, Result};

/// Opaque routing address of an endpoint on a fabric.
pub type RouteId = u64;

/// One received datagram: header and payload contiguous in `bytes`.
#[derive(Debug)]
pub struct RxFrame {
    pub src: RouteId,
    pub bytes: Vec<u8>,
}

/// Unreliable unordered datagram transport.
pub trait Transport {
    /// Largest frame (header + payload) a single send may carry.
    fn mtu(&self) -> usize;

    /// Address other endpoints use to reach this one.
    fn local_route(&self) -> RouteId;

    /// Queue one datagram. Header and payload are gathered at send time;
    /// neither is copied into the engine beforehand.
    fn post_send(&self, dest: RouteId, hdr: &[u8], payload: &[u8]) -> Result<()>;

    /// Drain up to `max` pending frames into `out`. Returns the count.
    fn poll_recv(&self, out: &mut Vec<RxFrame>, max: usize) -> usize;

    /// Push any batched sends onto the wire. Default: no batching.
    fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Make a memory region visible to the device. Default: no-op for
    /// transports without registration requirements.
    fn register_memory(&self, _region: MemRegion) -> Result<()> {
        Ok(())
    }
}

/// Outbound fault injection for a loopback endpoint.
#[derive(Debug, Clone)]
pub enum FaultPolicy {
    /// Deliver everything.
    None,
    /// Drop the next `remaining` frames, then deliver.
    Drop { remaining: u32 },
    /// Drop every `period`-th frame (1-based count).
    DropEvery { period: u32 },
    /// Deliver every frame twice.
    Duplicate,
}

/// Shared handle to an endpoint's fault policy; clone it before moving
/// the transport into the endpoint.
#[derive(Clone)]
pub struct FaultHandle(Arc<Mutex<FaultState>>);

struct FaultState {
    policy: FaultPolicy,
    seq: u32,
}

impl FaultHandle {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(FaultState {
            policy: FaultPolicy::None,
            seq: 0,
        })))
    }

    pub fn set(&self, policy: FaultPolicy) {
        let mut st = self.0.lock().unwrap_or_else(|e| e.into_inner());
        st.policy = policy;
        st.seq = 0;
    }

    /// Decide the fate of the next outbound frame: (deliver, copies).
    fn apply(&self) -> (bool, u32) {
        let mut st = self.0.lock().unwrap_or_else(|e| e.into_inner());
        st.seq += 1;
        let seq = st.seq;
        match &mut st.policy {
            FaultPolicy::None => (true, 1),
            FaultPolicy::Drop { remaining } => {
                if *remaining > 0 {
                    *remaining -= 1;
                    (false, 0)
                } else {
                    (true, 1)
                }
            }
            FaultPolicy::DropEvery { period } => {
                if *period > 0 && seq % *period == 0 {
                    (false, 0)
                } else {
                    (true, 1)
                }
            }
            FaultPolicy::Duplicate => (true, 2),
        }
    }
}

struct Frame {
    src: RouteId,
    bytes: Vec<u8>,
}

/// Channel-backed fabric connecting in-process endpoints.
pub struct InprocFabric {
    mtu: usize,
    next_route: AtomicU64,
    registry: Arc<Mutex<HashMap<RouteId, Sender<Frame>>>>,
}

impl InprocFabric {
    pub fn new(mtu: usize) -> Arc<Self> {
        Arc::new(Self {
            mtu,
            next_route: AtomicU64::new(1),
            registry: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Create one endpoint on this fabric.
    pub fn attach(self: &Arc<Self>) -> (InprocTransport, FaultHandle) {
        let route = self.next_route.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = unbounded();
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(route, tx);
        let faults = FaultHandle::new();
        (
            InprocTransport {
                fabric: Arc::clone(self),
                route,
                rx,
                faults: faults.clone(),
            },
            faults,
        )
    }
}

/// One endpoint's view of an [`InprocFabric`].
pub struct InprocTransport {
    fabric: Arc<InprocFabric>,
    route: RouteId,
    rx: Receiver<Frame>,
    faults: FaultHandle,
}

impl Transport for InprocTransport {
    fn mtu(&self) -> usize {
        self.fabric.mtu
    }

    fn local_route(&self) -> RouteId {
        self.route
    }

    fn post_send(&self, dest: RouteId, hdr: &[u8], payload: &[u8]) -> Result<()> {
        if hdr.len() + payload.len() > self.fabric.mtu {
            return Err(Error::Transport("frame exceeds mtu"));
        }
        let registry = self.fabric.registry.lock().unwrap_or_else(|e| e.into_inner());
        let tx = registry
            .get(&dest)
            .ok_or(Error::Transport("unknown destination route"))?;

        let (deliver, copies) = self.faults.apply();
        if !deliver {
            return Ok(());
        }
        for _ in 0..copies {
            let mut bytes = Vec::with_capacity(hdr.len() + payload.len());
            bytes.extend_from_slice(hdr);
            bytes.extend_from_slice(payload);
            if let Err(TrySendError::Disconnected(_)) = tx.try_send(Frame {
                src: self.route,
                bytes,
            }) {
                // Peer endpoint is gone; an unreliable transport drops
                // such frames silently.
                return Ok(());
            }
        }
        Ok(())
    }

    fn poll_recv(&self, out: &mut Vec<RxFrame>, max: usize) -> usize {
        let mut n = 0;
        while n < max {
            match self.rx.try_recv() {
                Ok(frame) => {
                    out.push(RxFrame {
                        src: frame.src,
                        bytes: frame.bytes,
                    });
                    n += 1;
                }
                Err(_) => break,
            }
        }
        n
    }
}

impl Drop for InprocTransport {
    fn drop(&mut self) {
        self.fabric
            .registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.route);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_between_endpoints() {
        let fabric = InprocFabric::new(1024);
        let (a, _) = fabric.attach();
        let (b, _) = fabric.attach();

        a.post_send(b.local_route(), b"hdr!", b"payload").unwrap();
        let mut out = Vec::new();
        assert_eq!(b.poll_recv(&mut out, 16), 1);
        assert_eq!(out[0].src, a.local_route());
        assert_eq!(&out[0].bytes, b"hdr!payload");
    }

    #[test]
    fn oversized_frame_rejected() {
        let fabric = InprocFabric::new(8);
        let (a, _) = fabric.attach();
        let (b, _) = fabric.attach();
        assert!(a.post_send(b.local_route(), b"12345", b"6789").is_err());
    }

    #[test]
    fn drop_policy_eats_frames() {
        let fabric = InprocFabric::new(1024);
        let (a, faults) = fabric.attach();
        let (b, _) = fabric.attach();
        faults.set(FaultPolicy::Drop { remaining: 2 });

        for _ in 0..3 {
            a.post_send(b.local_route(), b"h", b"x").unwrap();
        }
        let mut out = Vec::new();
        assert_eq!(b.poll_recv(&mut out, 16), 1);
    }

    #[test]
    fn drop_every_policy_is_periodic() {
        let fabric = InprocFabric::new(1024);
        let (a, faults) = fabric.attach();
        let (b, _) = fabric.attach();
        faults.set(FaultPolicy::DropEvery { period: 3 });

        for _ in 0..9 {
            a.post_send(b.local_route(), b"h", b"x").unwrap();
        }
        let mut out = Vec::new();
        assert_eq!(b.poll_recv(&mut out, 16), 6);
    }

    #[test]
    fn duplicate_policy_doubles_frames() {
        let fabric = InprocFabric::new(1024);
        let (a, faults) = fabric.attach();
        let (b, _) = fabric.attach();
        faults.set(FaultPolicy::Duplicate);

        a.post_send(b.local_route(), b"h", b"x").unwrap();
        let mut out = Vec::new();
        assert_eq!(b.poll_recv(&mut out, 16), 2);
    }

    #[test]
    fn unknown_route_is_an_error() {
        let fabric = InprocFabric::new(1024);
        let (a, _) = fabric.attach();
        assert!(a.post_send(999, b"h", b"x").is_err());
    }
}
