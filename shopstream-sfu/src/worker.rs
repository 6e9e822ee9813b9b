//! Media worker: an isolated single-threaded event loop on a dedicated OS
//! thread, owning the routers assigned to it.
//!
//! The coordinator reaches a worker exclusively through its command channel;
//! every state-changing call is an asynchronous request with a oneshot
//! reply, so signaling for other participants keeps being served while a
//! command is in flight. A worker that stops for any reason other than an
//! orderly shutdown reports itself on the pool's failure channel, which the
//! service treats as fatal.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use shopstream_core::config::MediaConfig;
use shopstream_core::{Error, Result};

use crate::router::{ClosedEntities, ConsumerDescriptor, Router};
use crate::rtp::{RouterCapabilities, RtpPacket, RtpParameters};
use crate::transport::{DtlsParameters, TransportDescriptor};
use crate::types::{
    ConsumerId, MediaKind, ParticipantId, ProducerId, RoomId, RouterId, TransportDirection,
    TransportId, WorkerId,
};

pub(crate) enum WorkerCommand {
    CreateRouter {
        router_id: RouterId,
        room_id: RoomId,
        capabilities: RouterCapabilities,
        reply: oneshot::Sender<Result<()>>,
    },
    CloseRouter {
        router_id: RouterId,
        reply: oneshot::Sender<Result<ClosedEntities>>,
    },
    CreateTransport {
        router_id: RouterId,
        owner: ParticipantId,
        direction: TransportDirection,
        reply: oneshot::Sender<Result<TransportDescriptor>>,
    },
    ConnectTransport {
        router_id: RouterId,
        owner: ParticipantId,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
        reply: oneshot::Sender<Result<()>>,
    },
    CloseTransport {
        router_id: RouterId,
        transport_id: TransportId,
        reply: oneshot::Sender<Result<ClosedEntities>>,
    },
    Produce {
        router_id: RouterId,
        owner: ParticipantId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        reply: oneshot::Sender<Result<ProducerId>>,
    },
    CloseProducer {
        router_id: RouterId,
        producer_id: ProducerId,
        reply: oneshot::Sender<Result<ClosedEntities>>,
    },
    Consume {
        router_id: RouterId,
        owner: ParticipantId,
        transport_id: TransportId,
        producer_id: ProducerId,
        packet_tx: mpsc::UnboundedSender<RtpPacket>,
        reply: oneshot::Sender<Result<ConsumerDescriptor>>,
    },
    CloseConsumer {
        router_id: RouterId,
        consumer_id: ConsumerId,
        reply: oneshot::Sender<Result<ClosedEntities>>,
    },
    Forward {
        router_id: RouterId,
        producer_id: ProducerId,
        packet: RtpPacket,
    },
    SweepIdle {
        router_id: RouterId,
        reply: oneshot::Sender<Result<ClosedEntities>>,
    },
    Shutdown,
}

/// Cloneable handle to one media worker.
#[derive(Clone)]
pub struct Worker {
    id: WorkerId,
    tx: mpsc::UnboundedSender<WorkerCommand>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker").field("id", &self.id).finish()
    }
}

impl Worker {
    #[must_use]
    pub const fn id(&self) -> WorkerId {
        self.id
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    pub(crate) fn send(&self, command: WorkerCommand) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| Error::WorkerFailure(format!("worker {} is gone", self.id)))
    }

    pub(crate) async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> WorkerCommand,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(make(reply_tx))?;
        reply_rx
            .await
            .map_err(|_| Error::WorkerFailure(format!("worker {} dropped a request", self.id)))?
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(WorkerCommand::Shutdown);
    }
}

/// Spawn a worker on its own thread with an isolated current-thread runtime.
pub(crate) fn spawn(
    id: WorkerId,
    media: MediaConfig,
    death_tx: mpsc::UnboundedSender<WorkerId>,
) -> std::io::Result<(Worker, std::thread::JoinHandle<()>)> {
    let (tx, rx) = mpsc::unbounded_channel();

    let handle = std::thread::Builder::new()
        .name(format!("media-worker-{id}"))
        .spawn(move || {
            let mut guard = DeathGuard {
                id,
                death_tx,
                clean: false,
            };
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!(worker_id = id, error = %e, "Failed to build worker runtime");
                    return; // guard reports the death
                }
            };
            runtime.block_on(worker_loop(id, media, rx, &mut guard));
        })?;

    Ok((Worker { id, tx }, handle))
}

/// Reports the worker on the failure channel unless the shutdown was orderly.
/// Dropping during unwind covers panics inside the loop.
struct DeathGuard {
    id: WorkerId,
    death_tx: mpsc::UnboundedSender<WorkerId>,
    clean: bool,
}

impl Drop for DeathGuard {
    fn drop(&mut self) {
        if !self.clean {
            error!(worker_id = self.id, "Media worker died unexpectedly");
            let _ = self.death_tx.send(self.id);
        }
    }
}

struct WorkerState {
    media: MediaConfig,
    routers: HashMap<RouterId, Router>,
    next_port: u16,
}

impl WorkerState {
    fn new(media: MediaConfig) -> Self {
        let next_port = media.rtc_port_min;
        Self {
            media,
            routers: HashMap::new(),
            next_port,
        }
    }

    fn allocate_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = if port >= self.media.rtc_port_max {
            self.media.rtc_port_min
        } else {
            port + 1
        };
        port
    }

    fn router_mut(&mut self, router_id: &RouterId) -> Result<&mut Router> {
        self.routers
            .get_mut(router_id)
            .ok_or_else(|| Error::not_found("router", router_id.as_str()))
    }
}

async fn worker_loop(
    id: WorkerId,
    media: MediaConfig,
    mut rx: mpsc::UnboundedReceiver<WorkerCommand>,
    guard: &mut DeathGuard,
) {
    info!(worker_id = id, "Media worker started");
    let mut state = WorkerState::new(media);

    while let Some(command) = rx.recv().await {
        match command {
            WorkerCommand::CreateRouter {
                router_id,
                room_id,
                capabilities,
                reply,
            } => {
                debug!(worker_id = id, router_id = %router_id, room_id = %room_id, "Creating router");
                let router = Router::new(router_id.clone(), room_id, capabilities);
                state.routers.insert(router_id.clone(), router);
                if reply.send(Ok(())).is_err() {
                    // The caller vanished mid-flight; do not leak the router.
                    state.routers.remove(&router_id);
                }
            }
            WorkerCommand::CloseRouter { router_id, reply } => {
                let result = state
                    .routers
                    .remove(&router_id)
                    .map(|mut router| router.close_all())
                    .ok_or_else(|| Error::not_found("router", router_id.as_str()));
                let _ = reply.send(result);
            }
            WorkerCommand::CreateTransport {
                router_id,
                owner,
                direction,
                reply,
            } => {
                let ip = state.media.announced_ip.clone();
                let port = state.allocate_port();
                let result = state
                    .router_mut(&router_id)
                    .map(|router| router.create_transport(owner, direction, ip, port));
                if let Err(descriptor) = send_or_undo(reply, result) {
                    if let Ok(router) = state.router_mut(&router_id) {
                        router.close_transport(&descriptor.transport_id);
                    }
                }
            }
            WorkerCommand::ConnectTransport {
                router_id,
                owner,
                transport_id,
                dtls_parameters,
                reply,
            } => {
                let result = state.router_mut(&router_id).and_then(|router| {
                    router.connect_transport(&owner, &transport_id, dtls_parameters)
                });
                let _ = reply.send(result);
            }
            WorkerCommand::CloseTransport {
                router_id,
                transport_id,
                reply,
            } => {
                let result = state
                    .router_mut(&router_id)
                    .map(|router| router.close_transport(&transport_id));
                let _ = reply.send(result);
            }
            WorkerCommand::Produce {
                router_id,
                owner,
                transport_id,
                kind,
                rtp_parameters,
                reply,
            } => {
                let result = state.router_mut(&router_id).and_then(|router| {
                    router.produce(&owner, &transport_id, kind, rtp_parameters)
                });
                if let Err(producer_id) = send_or_undo(reply, result) {
                    if let Ok(router) = state.router_mut(&router_id) {
                        let _ = router.close_producer(&producer_id);
                    }
                }
            }
            WorkerCommand::CloseProducer {
                router_id,
                producer_id,
                reply,
            } => {
                let result = state
                    .router_mut(&router_id)
                    .and_then(|router| router.close_producer(&producer_id));
                let _ = reply.send(result);
            }
            WorkerCommand::Consume {
                router_id,
                owner,
                transport_id,
                producer_id,
                packet_tx,
                reply,
            } => {
                let result = state.router_mut(&router_id).and_then(|router| {
                    router.consume(&owner, &transport_id, &producer_id, packet_tx)
                });
                if let Err(descriptor) = send_or_undo(reply, result) {
                    if let Ok(router) = state.router_mut(&router_id) {
                        router.close_consumer(&descriptor.consumer_id);
                    }
                }
            }
            WorkerCommand::CloseConsumer {
                router_id,
                consumer_id,
                reply,
            } => {
                let result = state
                    .router_mut(&router_id)
                    .map(|router| router.close_consumer(&consumer_id));
                let _ = reply.send(result);
            }
            WorkerCommand::Forward {
                router_id,
                producer_id,
                packet,
            } => {
                if let Ok(router) = state.router_mut(&router_id) {
                    router.forward(&producer_id, &packet);
                }
            }
            WorkerCommand::SweepIdle { router_id, reply } => {
                let timeout = Duration::from_secs(state.media.transport_idle_timeout_secs);
                let now = Instant::now();
                let result = state
                    .router_mut(&router_id)
                    .map(|router| router.sweep_idle(timeout, now));
                let _ = reply.send(result);
            }
            WorkerCommand::Shutdown => {
                info!(worker_id = id, routers = state.routers.len(), "Media worker shutting down");
                break;
            }
        }
    }

    guard.clean = true;
}

/// Send the reply; if the caller's reply channel is gone and the operation
/// succeeded, hand the successful value back so the created entity can be
/// torn down instead of leaked.
fn send_or_undo<T>(
    reply: oneshot::Sender<Result<T>>,
    result: Result<T>,
) -> std::result::Result<(), T> {
    match reply.send(result) {
        Ok(()) => Ok(()),
        Err(Ok(value)) => Err(value),
        Err(Err(_)) => Ok(()),
    }
}
