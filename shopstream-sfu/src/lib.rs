//! ShopStream SFU (Selective Forwarding Unit)
//!
//! The real-time media routing engine behind every merchant broadcast: one
//! broadcaster's encoded audio/video fans out to many viewers without
//! re-encoding, multiplexed across a pool of per-core media workers.
//!
//! ## Architecture
//!
//! - **`WorkerPool`**: fixed set of media workers (one per CPU core),
//!   round-robin router placement, fail-fast on worker death
//! - **`RoomRegistry`**: room id → exactly one router on exactly one worker
//! - **`SfuManager`**: top-level orchestration the signaling layer calls
//! - **`Session`**: one participant's signaling endpoint and ownership index
//! - **Router/Transport/Producer/Consumer**: the worker-side entity graph
//!
//! ## Teardown ordering
//!
//! Disconnecting a participant cascades bottom-up: its transports close,
//! which closes the producers and consumers bound to them; closing a
//! producer synchronously closes every consumer referencing it and notifies
//! each affected viewer exactly once; a room is destroyed when its producer
//! count and participant count are both zero.
//!
//! ## Failure policy
//!
//! A dead media worker is not recovered in place: the pool reports it and
//! the service exits for the external supervisor to restart. Operators
//! should size deployments with this capacity/availability trade-off in
//! mind.

mod manager;
mod pool;
mod registry;
mod router;
mod rtp;
mod session;
mod transport;
mod types;
mod worker;

pub use manager::{JoinInfo, ProducerHandle, SfuManager};
pub use pool::{RouterHandle, WorkerPool};
pub use registry::{ProducerInfo, Room, RoomRegistry};
pub use router::{ClosedEntities, ConsumerDescriptor};
pub use rtp::{RouterCapabilities, RtpCodecCapability, RtpPacket, RtpParameters};
pub use session::{Session, SessionEvent};
pub use transport::{
    DtlsFingerprint, DtlsParameters, DtlsRole, DtlsState, IceCandidate, IceParameters,
    TransportDescriptor,
};
pub use types::{
    ConsumerId, MediaKind, ParticipantId, ProducerId, RoomId, RouterId, TransportDirection,
    TransportId, WorkerId,
};
pub use worker::Worker;
