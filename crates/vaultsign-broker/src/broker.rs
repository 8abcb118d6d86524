//! Concurrent broker engine: one read task, one write task, id-correlated
//! request/response over the frame codec.
//!
//! Delivery rules:
//! - a locally initiated request stays in `unconfirmed` until the peer's
//!   Accept arrives; a peer Retry retransmits everything still unconfirmed;
//! - an inbound request id is dispatched to the handler at most once, no
//!   matter how often it is retransmitted;
//! - responses correlate purely by id; ordering across ids is unspecified.

use crate::error::BrokerError;
use crate::transport::Transport;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vaultsign_wire::{frame_bytes, Frame, FrameId, FrameKind, Stash, MAX_PAYLOAD};

/// Handler for inbound requests.
///
/// An `Err` is answered with an empty Response payload; the peer treats
/// payload interpretation as its own concern.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Handle one inbound request payload and produce the response bytes.
    async fn handle(&self, payload: Bytes) -> anyhow::Result<Bytes>;
}

/// Broker tuning knobs.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Transport read buffer size.
    pub read_buffer: usize,
    /// Reassembly stash capacity in bytes.
    pub stash_capacity: usize,
    /// Depth of the outbound frame queue.
    pub write_queue_depth: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            read_buffer: 64 * 1024,
            stash_capacity: vaultsign_wire::stash::DEFAULT_CAPACITY,
            write_queue_depth: 32,
        }
    }
}

const ZERO_ID: FrameId = [0u8; 16];

/// Duplex message broker over a [`Transport`].
pub struct Broker {
    shared: Arc<Shared>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    write_task: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    write_tx: mpsc::Sender<Bytes>,
    waiters: DashMap<FrameId, oneshot::Sender<Bytes>>,
    processing: DashMap<FrameId, ()>,
    unconfirmed: DashMap<FrameId, Bytes>,
    handler: Arc<dyn RequestHandler>,
    cancel: CancellationToken,
}

impl Broker {
    /// Spawn the read and write loops over `transport`.
    pub fn spawn<T: Transport>(
        transport: Arc<T>,
        handler: Arc<dyn RequestHandler>,
        config: BrokerConfig,
    ) -> Self {
        let (write_tx, write_rx) = mpsc::channel(config.write_queue_depth.max(1));
        let shared = Arc::new(Shared {
            write_tx,
            waiters: DashMap::new(),
            processing: DashMap::new(),
            unconfirmed: DashMap::new(),
            handler,
            cancel: CancellationToken::new(),
        });

        let read_task = tokio::spawn(read_loop(
            shared.clone(),
            transport.clone(),
            config.clone(),
        ));
        let write_task = tokio::spawn(write_loop(shared.clone(), transport, write_rx));

        Self {
            shared,
            read_task: Mutex::new(Some(read_task)),
            write_task: Mutex::new(Some(write_task)),
        }
    }

    /// Send a request and await the matching response.
    ///
    /// Dropping the returned future (caller timeout or cancellation)
    /// unregisters the id; a response that arrives later is dropped.
    pub async fn request(&self, payload: &[u8]) -> Result<(Bytes, FrameId), BrokerError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(BrokerError::PayloadTooLarge(payload.len()));
        }
        if self.shared.cancel.is_cancelled() {
            return Err(BrokerError::Disconnected);
        }

        let id: FrameId = rand::random();
        let (tx, rx) = oneshot::channel();
        self.shared.waiters.insert(id, tx);
        self.shared
            .unconfirmed
            .insert(id, Bytes::copy_from_slice(payload));
        let mut cleanup = RequestCleanup {
            shared: &*self.shared,
            id,
            armed: true,
        };

        debug!(id = %hex_id(&id), size = payload.len(), "tx req");
        self.shared
            .enqueue(FrameKind::Request, id, payload)
            .await?;

        tokio::select! {
            res = rx => match res {
                Ok(response) => {
                    cleanup.run();
                    Ok((response, id))
                }
                // Sender dropped without a payload: broker shut down.
                Err(_) => Err(BrokerError::Disconnected),
            },
            _ = self.shared.cancel.cancelled() => Err(BrokerError::Disconnected),
        }
    }

    /// Cancel both loops, fail all outstanding requests with
    /// [`BrokerError::Disconnected`], and join the tasks.
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        self.shared.fail_waiters();
        if let Some(task) = self.read_task.lock().await.take() {
            let _ = task.await;
        }
        if let Some(task) = self.write_task.lock().await.take() {
            let _ = task.await;
        }
    }

    /// True once the broker has stopped (fatal transport error or
    /// explicit shutdown).
    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }
}

/// Removes waiter bookkeeping when a request future is dropped before the
/// response arrives.
struct RequestCleanup<'a> {
    shared: &'a Shared,
    id: FrameId,
    armed: bool,
}

impl RequestCleanup<'_> {
    fn run(&mut self) {
        self.armed = false;
        self.shared.waiters.remove(&self.id);
        self.shared.unconfirmed.remove(&self.id);
    }
}

impl Drop for RequestCleanup<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.waiters.remove(&self.id);
            self.shared.unconfirmed.remove(&self.id);
        }
    }
}

impl Shared {
    async fn enqueue(&self, kind: FrameKind, id: FrameId, payload: &[u8]) -> Result<(), BrokerError> {
        let bytes = frame_bytes(kind, &id, payload)?;
        self.write_tx
            .send(bytes)
            .await
            .map_err(|_| BrokerError::Disconnected)
    }

    fn fail_waiters(&self) {
        // Dropping the senders wakes every parked caller with Disconnected.
        self.waiters.clear();
        self.unconfirmed.clear();
    }

    async fn dispatch(self: Arc<Self>, frame: Frame) {
        match frame.kind {
            FrameKind::Response => {
                debug!(id = %hex_id(&frame.id), size = frame.payload.len(), "rx resp");
                match self.waiters.remove(&frame.id) {
                    Some((_, tx)) => {
                        let _ = tx.send(frame.payload);
                    }
                    None => debug!(id = %hex_id(&frame.id), "late response dropped"),
                }
            }
            FrameKind::Request => {
                debug!(id = %hex_id(&frame.id), size = frame.payload.len(), "rx req");
                if self.processing.contains_key(&frame.id) {
                    debug!(id = %hex_id(&frame.id), "duplicate request; ignoring");
                    return;
                }
                self.processing.insert(frame.id, ());

                // Accept immediately so the peer stops retransmitting.
                let _ = self.enqueue(FrameKind::Accept, frame.id, &[]).await;

                let shared = self.clone();
                tokio::spawn(async move {
                    let response = match shared.handler.handle(frame.payload).await {
                        Ok(bytes) => bytes,
                        Err(err) => {
                            warn!(id = %hex_id(&frame.id), %err, "request handler failed");
                            Bytes::new()
                        }
                    };
                    debug!(id = %hex_id(&frame.id), size = response.len(), "tx resp");
                    let _ = shared
                        .enqueue(FrameKind::Response, frame.id, &response)
                        .await;
                    shared.processing.remove(&frame.id);
                });
            }
            FrameKind::Accept => {
                debug!(id = %hex_id(&frame.id), "rx accept");
                self.unconfirmed.remove(&frame.id);
            }
            FrameKind::Retry => {
                debug!("rx retry; retransmitting unconfirmed requests");
                let pending: Vec<(FrameId, Bytes)> = self
                    .unconfirmed
                    .iter()
                    .map(|entry| (*entry.key(), entry.value().clone()))
                    .collect();
                for (id, payload) in pending {
                    let _ = self.enqueue(FrameKind::Request, id, &payload).await;
                }
            }
        }
    }
}

async fn read_loop<T: Transport>(shared: Arc<Shared>, transport: Arc<T>, config: BrokerConfig) {
    let mut stash = Stash::new(config.stash_capacity);
    let mut buf = vec![0u8; config.read_buffer.max(vaultsign_wire::HEADER_LEN)];

    loop {
        let result = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            result = transport.read(&mut buf) => result,
        };

        match result {
            Ok(n) => {
                if n == 0 {
                    // Peer briefly gone; ask it to resend once it is back.
                    let _ = shared.enqueue(FrameKind::Retry, ZERO_ID, &[]).await;
                    continue;
                }
                stash.write(&buf[..n]);
                buf[..n].fill(0);
                while let Some(frame) = stash.read_frame() {
                    shared.clone().dispatch(frame).await;
                }
            }
            Err(err) if err.is_retryable() => {
                debug!(%err, "read retryable error");
                let _ = shared.enqueue(FrameKind::Retry, ZERO_ID, &[]).await;
            }
            Err(err) => {
                debug!(%err, "read loop exit");
                break;
            }
        }
    }

    shared.cancel.cancel();
    shared.fail_waiters();
}

async fn write_loop<T: Transport>(
    shared: Arc<Shared>,
    transport: Arc<T>,
    mut rx: mpsc::Receiver<Bytes>,
) {
    loop {
        let data = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(data) => data,
                None => break,
            },
        };

        if !write_all(&*transport, &data).await {
            break;
        }
    }

    shared.cancel.cancel();
    shared.fail_waiters();
}

/// Write every byte of `data`, retrying the remainder on retryable errors.
/// Returns false on fatal failure.
async fn write_all<T: Transport + ?Sized>(transport: &T, data: &[u8]) -> bool {
    let mut off = 0;
    while off < data.len() {
        match transport.write(&data[off..]).await {
            Ok(n) => off += n,
            Err(err) if err.is_retryable() => {
                debug!(%err, "write retryable error");
            }
            Err(err) => {
                debug!(%err, "write loop exit");
                return false;
            }
        }
    }
    true
}

fn hex_id(id: &FrameId) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(32);
    for byte in id {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}
