//! wirerpc: a user-space RPC engine for microsecond-scale datagram
//! fabrics.
//!
//! The engine multiplexes credit-bounded sessions over an unreliable,
//! unordered [`Transport`], with zero-copy message buffers carved from
//! pre-registered arenas, timing-wheel retransmission, and optional
//! rate-based congestion control. One thread owns one [`Rpc`] endpoint
//! and drives it by polling the event loop; request handlers are shared
//! process-wide through a [`Nexus`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use wirerpc::{
//!     BufferPool, DispatchMode, InprocFabric, Nexus, PoolConfig, Rpc,
//!     RpcConfig, Tag,
//! };
//!
//! let nexus = Nexus::new(0);
//! nexus
//!     .register_req_func(
//!         1,
//!         Arc::new(|ctx| {
//!             let echoed = ctx.data().to_vec();
//!             ctx.respond(&echoed);
//!         }),
//!         DispatchMode::Inline,
//!     )
//!     .unwrap();
//!
//! let fabric = InprocFabric::new(1024);
//! let (transport, _faults) = fabric.attach();
//! let pool = BufferPool::new(&PoolConfig::default()).unwrap();
//! let rpc = Rpc::new(nexus, transport, pool, RpcConfig::default()).unwrap();
//! let session = rpc.create_session(rpc.local_route()).unwrap();
//! # let _ = (session, Tag::default());
//! ```

pub mod buffer;
pub mod cc;
pub mod config;
pub mod error;
pub mod nexus;
pub mod packet;
pub mod rpc;
pub mod session;
pub mod transport;
pub mod wheel;

pub use buffer::{BufferPool, MemRegion, MsgBuffer, PoolConfig};
pub use config::{RateConfig, RpcConfig, SESSION_CREDITS};
pub use error::{Error, Result};
pub use nexus::{DispatchMode, Nexus, ReqContext, ReqHandler, RespHandle};
pub use packet::{PktHdr, PktKind, SmErr};
pub use rpc::{CancelToken, EnqueueError, Rpc, Stats};
pub use session::{Continuation, SessionState, Tag};
pub use transport::{FaultHandle, FaultPolicy, InprocFabric, InprocTransport, RouteId, Transport};
