//! In-memory duplex transport.
//!
//! Backs the broker test suites and the end-to-end harness: two
//! [`MemTransport`] halves form a bidirectional pipe, with hooks to drop
//! writes and inject read faults so retry and disconnect paths can be
//! exercised deterministically.

use crate::transport::{Transport, TransportError};
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use tokio::sync::{mpsc, Mutex, Notify};

/// One half of an in-memory duplex byte pipe.
pub struct MemTransport {
    rx: Mutex<RxState>,
    tx: mpsc::UnboundedSender<Bytes>,
    drop_writes: AtomicUsize,
    read_faults: StdMutex<VecDeque<TransportError>>,
    fault_notify: Notify,
}

struct RxState {
    rx: mpsc::UnboundedReceiver<Bytes>,
    leftover: BytesMut,
}

impl MemTransport {
    /// Create a connected pair; bytes written to one half are read from
    /// the other.
    pub fn pair() -> (MemTransport, MemTransport) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (Self::half(tx_a, rx_b), Self::half(tx_b, rx_a))
    }

    fn half(tx: mpsc::UnboundedSender<Bytes>, rx: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self {
            rx: Mutex::new(RxState {
                rx,
                leftover: BytesMut::new(),
            }),
            tx,
            drop_writes: AtomicUsize::new(0),
            read_faults: StdMutex::new(VecDeque::new()),
            fault_notify: Notify::new(),
        }
    }

    /// Silently discard the next `n` write calls (the bytes vanish on the
    /// wire, as if the peer lost power mid-transfer).
    pub fn drop_next_writes(&self, n: usize) {
        self.drop_writes.store(n, Ordering::SeqCst);
    }

    /// Queue a fault to be returned by an upcoming `read` call, before any
    /// buffered data is delivered. Wakes a reader already parked on the
    /// pipe so the fault takes effect immediately.
    pub fn inject_read_fault(&self, fault: TransportError) {
        self.read_faults
            .lock()
            .expect("read fault queue poisoned")
            .push_back(fault);
        self.fault_notify.notify_one();
    }

    fn pop_fault(&self) -> Option<TransportError> {
        self.read_faults
            .lock()
            .expect("read fault queue poisoned")
            .pop_front()
    }

    /// Convenience: queue a retryable read fault.
    pub fn inject_retryable_read(&self) {
        self.inject_read_fault(TransportError::Retryable(io::Error::new(
            io::ErrorKind::Interrupted,
            "injected",
        )));
    }
}

#[async_trait]
impl Transport for MemTransport {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut state = self.rx.lock().await;
        loop {
            if let Some(fault) = self.pop_fault() {
                return Err(fault);
            }
            if !state.leftover.is_empty() {
                break;
            }
            tokio::select! {
                chunk = state.rx.recv() => match chunk {
                    Some(chunk) => state.leftover.extend_from_slice(&chunk),
                    None => {
                        return Err(TransportError::Fatal(io::Error::new(
                            io::ErrorKind::BrokenPipe,
                            "peer closed",
                        )))
                    }
                },
                _ = self.fault_notify.notified() => {}
            }
        }

        let n = state.leftover.len().min(buf.len());
        buf[..n].copy_from_slice(&state.leftover[..n]);
        state.leftover.advance(n);
        Ok(n)
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, TransportError> {
        let pending_drops = self.drop_writes.load(Ordering::SeqCst);
        if pending_drops > 0 {
            self.drop_writes.store(pending_drops - 1, Ordering::SeqCst);
            return Ok(buf.len());
        }

        self.tx
            .send(Bytes::copy_from_slice(buf))
            .map_err(|_| {
                TransportError::Fatal(io::Error::new(io::ErrorKind::BrokenPipe, "peer closed"))
            })?;
        Ok(buf.len())
    }
}
