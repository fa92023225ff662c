//! Sessions: per-peer connection state, request slots, and credits.
//!
//! A session owns a fixed window of client slots (one in-flight request
//! each, bounded by credits) and server slots (one request being served
//! or cached for duplicate suppression). Slots are reused by index; the
//! request number stored in each one disambiguates recycled slots.

use crate::buffer::MsgBuffer;
use crate::cc::RateState;
use crate::config::{RateConfig, RpcConfig};
use crate::transport::RouteId;

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connect request sent, awaiting the response.
    Connecting,
    /// Handshake complete; requests may be enqueued.
    Connected,
    /// Disconnect request sent, awaiting the response.
    Disconnecting,
    /// Fully torn down; the id may be reused.
    Destroyed,
    /// Handshake rejected by the peer.
    Failed,
}

/// Caller-supplied correlation value, returned to the continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tag {
    pub batch_idx: u32,
    pub slot_idx: u32,
}

/// Invoked once per completed request with the caller's tag and the
/// request and response buffers, returning buffer ownership.
pub type Continuation = Box<dyn FnOnce(Tag, MsgBuffer, MsgBuffer)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientSlotState {
    Free,
    /// Request accepted; packets queued or in flight.
    Outstanding,
}

/// One in-flight client request.
pub struct ClientSlot {
    pub state: ClientSlotState,
    pub req_num: u64,
    pub req: Option<MsgBuffer>,
    pub resp: Option<MsgBuffer>,
    pub cont: Option<Continuation>,
    pub tag: Tag,
    pub req_type: u8,
    /// Timestamp of the most recent (re)transmission of packet 0.
    pub tx_ts_us: u64,
    pub retries: u32,
    pub rto_us: u64,
    pub pkts_total: u16,
    pub pkts_sent: u16,
    pub resp_pkts_total: u16,
    pub resp_pkts_rcvd: u16,
    pub resp_msg_size: usize,
}

impl ClientSlot {
    fn free() -> Self {
        Self {
            state: ClientSlotState::Free,
            req_num: 0,
            req: None,
            resp: None,
            cont: None,
            tag: Tag::default(),
            req_type: 0,
            tx_ts_us: 0,
            retries: 0,
            rto_us: 0,
            pkts_total: 0,
            pkts_sent: 0,
            resp_pkts_total: 0,
            resp_pkts_rcvd: 0,
            resp_msg_size: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::free();
    }
}

/// Response bytes held by a server slot, either handler-produced inline
/// data or an explicitly enqueued zero-copy buffer.
pub enum RespPayload {
    Inline(Vec<u8>),
    Buf(MsgBuffer),
}

impl RespPayload {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            RespPayload::Inline(v) => v,
            RespPayload::Buf(b) => b.as_slice(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerSlotState {
    Free,
    /// Collecting request packets of a multi-packet request.
    Assembling,
    /// Handler running or response deferred to a background thread.
    InProgress,
    /// Response sent; kept for duplicate suppression until reclaimed.
    Cached,
}

/// One request being served (or recently served) on the callee side.
pub struct ServerSlot {
    pub state: ServerSlotState,
    pub req_num: u64,
    pub req_type: u8,
    pub rx: Vec<u8>,
    pub rx_pkts_total: u16,
    pub rx_pkts_rcvd: u16,
    pub resp: Option<RespPayload>,
}

impl ServerSlot {
    fn free() -> Self {
        Self {
            state: ServerSlotState::Free,
            req_num: 0,
            req_type: 0,
            rx: Vec::new(),
            rx_pkts_total: 0,
            rx_pkts_rcvd: 0,
            resp: None,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::free();
    }
}

/// Per-peer connection state.
pub struct Session {
    /// Local session number, index into the session table.
    pub id: u16,
    /// Peer's session number, learned during the handshake.
    pub remote_id: u16,
    pub remote_route: RouteId,
    pub state: SessionState,
    pub is_client: bool,
    /// Send credits remaining; one per outstanding request.
    pub credits: usize,
    pub client_slots: Vec<ClientSlot>,
    pub server_slots: Vec<ServerSlot>,
    pub next_req_num: u64,
    pub rate: RateState,
    /// Smoothed RTT in microseconds; zero until the first sample.
    pub srtt_us: f64,
    /// Last session-management transmission, for handshake retries.
    pub sm_last_tx_us: u64,
    pub sm_retries: u32,
}

impl Session {
    pub fn new(
        id: u16,
        remote_route: RouteId,
        is_client: bool,
        cfg: &RpcConfig,
        rate_cfg: &RateConfig,
    ) -> Self {
        Self {
            id,
            remote_id: 0,
            remote_route,
            state: if is_client {
                SessionState::Connecting
            } else {
                SessionState::Connected
            },
            is_client,
            credits: cfg.session_credits,
            client_slots: (0..cfg.session_credits).map(|_| ClientSlot::free()).collect(),
            server_slots: (0..cfg.session_credits).map(|_| ServerSlot::free()).collect(),
            next_req_num: 1,
            rate: RateState::new(rate_cfg),
            srtt_us: 0.0,
            sm_last_tx_us: 0,
            sm_retries: 0,
        }
    }

    /// Claim a free client slot, or None when the window is full.
    pub fn alloc_client_slot(&mut self) -> Option<usize> {
        self.client_slots
            .iter()
            .position(|s| s.state == ClientSlotState::Free)
    }

    /// Client slot currently carrying `req_num`, if any.
    pub fn client_slot_for(&self, req_num: u64) -> Option<usize> {
        self.client_slots
            .iter()
            .position(|s| s.state == ClientSlotState::Outstanding && s.req_num == req_num)
    }

    /// Server slot for an incoming `req_num`: an existing match (for
    /// continued assembly or duplicate suppression), a free slot, or the
    /// oldest cached slot reclaimed. None only if every slot is busy with
    /// a live request, which a credit-respecting peer cannot cause.
    pub fn server_slot_for(&mut self, req_num: u64) -> Option<usize> {
        if let Some(idx) = self
            .server_slots
            .iter()
            .position(|s| s.state != ServerSlotState::Free && s.req_num == req_num)
        {
            return Some(idx);
        }
        if let Some(idx) = self
            .server_slots
            .iter()
            .position(|s| s.state == ServerSlotState::Free)
        {
            return Some(idx);
        }
        self.server_slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == ServerSlotState::Cached)
            .min_by_key(|(_, s)| s.req_num)
            .map(|(idx, _)| idx)
    }

    pub fn outstanding_requests(&self) -> usize {
        self.client_slots
            .iter()
            .filter(|s| s.state == ClientSlotState::Outstanding)
            .count()
    }
}

/// Slab of sessions indexed by local session number.
pub struct SessionTable {
    sessions: Vec<Option<Session>>,
    max_sessions: usize,
}

impl SessionTable {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: Vec::new(),
            max_sessions,
        }
    }

    /// Insert a session built by `make` at the first reusable index.
    /// Destroyed sessions free their index for reuse.
    pub fn insert_with(&mut self, make: impl FnOnce(u16) -> Session) -> Option<u16> {
        for (idx, entry) in self.sessions.iter_mut().enumerate() {
            let reusable = match entry {
                None => true,
                Some(s) => s.state == SessionState::Destroyed,
            };
            if reusable {
                let id = idx as u16;
                *entry = Some(make(id));
                return Some(id);
            }
        }
        if self.sessions.len() < self.max_sessions {
            let id = self.sessions.len() as u16;
            self.sessions.push(Some(make(id)));
            return Some(id);
        }
        None
    }

    pub fn get(&self, id: u16) -> Option<&Session> {
        self.sessions.get(id as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: u16) -> Option<&mut Session> {
        self.sessions.get_mut(id as usize).and_then(|s| s.as_mut())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter().filter_map(|s| s.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.iter_mut().filter_map(|s| s.as_mut())
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| {
                matches!(
                    s,
                    Some(sess) if sess.state != SessionState::Destroyed
                        && sess.state != SessionState::Failed
                )
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(credits: usize) -> Session {
        let cfg = RpcConfig::default().with_session_credits(credits);
        Session::new(0, 7, true, &cfg, &RateConfig::default())
    }

    #[test]
    fn client_slots_exhaust_at_credit_count() {
        let mut s = session(4);
        for _ in 0..4 {
            let idx = s.alloc_client_slot().unwrap();
            s.client_slots[idx].state = ClientSlotState::Outstanding;
        }
        assert!(s.alloc_client_slot().is_none());

        s.client_slots[2].reset();
        assert_eq!(s.alloc_client_slot(), Some(2));
    }

    #[test]
    fn server_slot_matches_existing_req_num() {
        let mut s = session(4);
        let idx = s.server_slot_for(10).unwrap();
        s.server_slots[idx].state = ServerSlotState::Cached;
        s.server_slots[idx].req_num = 10;

        assert_eq!(s.server_slot_for(10), Some(idx));
    }

    #[test]
    fn server_reclaims_oldest_cached() {
        let mut s = session(2);
        for (i, req_num) in [(0usize, 5u64), (1, 9)] {
            s.server_slots[i].state = ServerSlotState::Cached;
            s.server_slots[i].req_num = req_num;
        }
        // New request: no free slot, so the oldest cached one (req 5)
        // gives way.
        assert_eq!(s.server_slot_for(20), Some(0));
    }

    #[test]
    fn table_reuses_destroyed_ids() {
        let cfg = RpcConfig::default();
        let rate = RateConfig::default();
        let mut table = SessionTable::new(4);
        let a = table
            .insert_with(|id| Session::new(id, 1, true, &cfg, &rate))
            .unwrap();
        let b = table
            .insert_with(|id| Session::new(id, 2, true, &cfg, &rate))
            .unwrap();
        assert_ne!(a, b);

        table.get_mut(a).unwrap().state = SessionState::Destroyed;
        let c = table
            .insert_with(|id| Session::new(id, 3, true, &cfg, &rate))
            .unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn table_enforces_max_sessions() {
        let cfg = RpcConfig::default();
        let rate = RateConfig::default();
        let mut table = SessionTable::new(1);
        assert!(table
            .insert_with(|id| Session::new(id, 1, true, &cfg, &rate))
            .is_some());
        assert!(table
            .insert_with(|id| Session::new(id, 2, true, &cfg, &rate))
            .is_none());
    }
}
