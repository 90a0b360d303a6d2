use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::pin::pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::AbortHandle;
use tracing::{debug, trace};
use crate::error::KcpError;
use crate::segment::Segment;

/// Compares serials in modular u32 space, so that ordering survives counter wrap-around as long
///  as the compared serials are less than 2^31 apart
pub fn serial_cmp(a: u32, b: u32) -> Ordering {
    (a.wrapping_sub(b) as i32).cmp(&0)
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Lifecycle {
    Open,
    /// no new writes are accepted, in-flight writes are still waiting for their acks
    Closing,
    Closed,
    Errored(KcpError),
}

impl Lifecycle {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Lifecycle::Closed | Lifecycle::Errored(_))
    }

    /// The error a write gets when it is attempted in this state, `None` if writes are accepted
    pub fn write_error(&self) -> Option<KcpError> {
        match self {
            Lifecycle::Open => None,
            Lifecycle::Closing => Some(KcpError::Closing),
            Lifecycle::Closed => Some(KcpError::Closed),
            Lifecycle::Errored(e) => Some(e.clone()),
        }
    }
}

/// A write that is waiting for its ack
pub struct PendingAck {
    pub waiter: oneshot::Sender<Result<(), KcpError>>,
    pub retransmit: AbortHandle,
}

pub struct KcpState {
    pub conversation: u32,
    pub window: u16,
    /// serial of the next outgoing push
    pub send_counter: u32,
    /// serial of the next push that can be delivered in order
    pub recv_counter: u32,
    /// pushes that arrived ahead of `recv_counter`
    pub reorder_buffer: BTreeMap<u32, Segment>,
    pub pending_acks: FxHashMap<u32, PendingAck>,
    /// the highest receive counter the peer reported in any segment
    pub peer_unack_serial: Option<u32>,
}

impl KcpState {
    pub fn new(conversation: u32, window: u16) -> KcpState {
        KcpState {
            conversation,
            window,
            send_counter: 0,
            recv_counter: 0,
            reorder_buffer: BTreeMap::default(),
            pending_acks: FxHashMap::default(),
            peer_unack_serial: None,
        }
    }

    pub fn next_send_serial(&mut self) -> u32 {
        let result = self.send_counter;
        self.send_counter = self.send_counter.wrapping_add(1);
        result
    }

    /// Handles an incoming push, returning the fragments that became deliverable, in order
    pub fn accept_push(&mut self, segment: Segment) -> Vec<Bytes> {
        match serial_cmp(segment.serial, self.recv_counter) {
            Ordering::Less => {
                debug!("dropping duplicate push #{}: already delivered up to #{}", segment.serial, self.recv_counter);
                vec![]
            }
            Ordering::Greater => {
                if self.reorder_buffer.contains_key(&segment.serial) {
                    debug!("dropping duplicate push #{}: already buffered", segment.serial);
                }
                else {
                    debug!("push #{} arrived out of order, expecting #{} - buffering", segment.serial, self.recv_counter);
                    self.reorder_buffer.insert(segment.serial, segment);
                }
                vec![]
            }
            Ordering::Equal => {
                let mut result = vec![segment.fragment];
                self.recv_counter = self.recv_counter.wrapping_add(1);

                while let Some(next) = self.reorder_buffer.remove(&self.recv_counter) {
                    trace!("delivering buffered push #{}", next.serial);
                    result.push(next.fragment);
                    self.recv_counter = self.recv_counter.wrapping_add(1);
                }
                result
            }
        }
    }

    pub fn record_peer_unack(&mut self, unack_serial: u32) {
        match self.peer_unack_serial {
            Some(prev) if serial_cmp(unack_serial, prev) != Ordering::Greater => {}
            _ => self.peer_unack_serial = Some(unack_serial),
        }
    }
}

/// A point-in-time snapshot of a duplex's state
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct KcpStats {
    pub conversation: u32,
    pub send_counter: u32,
    pub recv_counter: u32,
    pub num_buffered: usize,
    pub num_pending_writes: usize,
    pub peer_unack_serial: Option<u32>,
    pub lifecycle: Lifecycle,
}

/// The state shared between the receive path, the send path and the control handle.
///
/// The lock is never held across an await point.
pub struct SharedState {
    state: Mutex<KcpState>,
    lifecycle: watch::Sender<Lifecycle>,
    /// notified whenever a pending write is settled
    settled: Notify,
}

impl SharedState {
    pub fn new(conversation: u32, window: u16) -> SharedState {
        let (lifecycle, _) = watch::channel(Lifecycle::Open);
        SharedState {
            state: Mutex::new(KcpState::new(conversation, window)),
            lifecycle,
            settled: Notify::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, KcpState> {
        // a panic while holding the lock leaves the state consistent enough to tear it down
        self.state.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Lifecycle> {
        self.lifecycle.subscribe()
    }

    pub fn stats(&self) -> KcpStats {
        let lifecycle = self.lifecycle();
        let state = self.lock();
        KcpStats {
            conversation: state.conversation,
            send_counter: state.send_counter,
            recv_counter: state.recv_counter,
            num_buffered: state.reorder_buffer.len(),
            num_pending_writes: state.pending_acks.len(),
            peer_unack_serial: state.peer_unack_serial,
            lifecycle,
        }
    }

    /// Settles a write with success. Returns `false` if there is no pending write for the serial,
    ///  e.g. because it was acked before or timed out.
    pub fn resolve_ack(&self, serial: u32) -> bool {
        let pending = self.lock().pending_acks.remove(&serial);
        match pending {
            Some(pending) => {
                pending.retransmit.abort();
                let _ = pending.waiter.send(Ok(()));
                self.settled.notify_waiters();
                true
            }
            None => false,
        }
    }

    /// Drops a pending write without settling it - the write's waiter is gone already
    pub fn remove_pending(&self, serial: u32) {
        let pending = self.lock().pending_acks.remove(&serial);
        if let Some(pending) = pending {
            pending.retransmit.abort();
            self.settled.notify_waiters();
        }
    }

    /// Open -> Closing. Returns `false` if the duplex was not open.
    pub fn begin_close(&self) -> bool {
        self.lifecycle.send_if_modified(|l| {
            if *l == Lifecycle::Open {
                debug!("closing");
                *l = Lifecycle::Closing;
                true
            }
            else {
                false
            }
        })
    }

    /// Waits until no writes are pending any more, or the duplex is terminated
    pub async fn wait_settled(&self) {
        loop {
            let mut notified = pin!(self.settled.notified());
            notified.as_mut().enable();

            let idle = self.lock().pending_acks.is_empty();
            let terminated = self.lifecycle.borrow().is_terminal();
            if idle || terminated {
                return;
            }
            notified.await;
        }
    }

    /// Waits until the duplex reaches a terminal state
    pub async fn wait_terminated(&self) -> Lifecycle {
        let mut receiver = self.subscribe();
        let result = match receiver.wait_for(Lifecycle::is_terminal).await {
            Ok(lifecycle) => lifecycle.clone(),
            // the sender is owned by self, so it outlives this call
            Err(_) => self.lifecycle(),
        };
        result
    }

    /// Moves the duplex to a terminal state - `Closed` if there is no reason, `Errored` otherwise.
    ///
    /// Teardown happens exactly once: every pending write is rejected and has its retransmission
    ///  task aborted, and the reorder buffer is discarded. Returns `false` if the duplex was
    ///  terminated before.
    pub fn terminate(&self, reason: Option<KcpError>) -> bool {
        let terminated = self.lifecycle.send_if_modified(|l| {
            if l.is_terminal() {
                return false;
            }
            *l = match reason {
                None => Lifecycle::Closed,
                Some(e) => Lifecycle::Errored(e),
            };
            true
        });
        if !terminated {
            return false;
        }

        let lifecycle = self.lifecycle();
        debug!("terminated: {:?}", lifecycle);
        let error = lifecycle.write_error()
            .unwrap_or(KcpError::Closed);

        let drained = {
            let mut state = self.lock();
            state.reorder_buffer.clear();
            state.pending_acks.drain()
                .map(|(_, pending)| pending)
                .collect::<Vec<_>>()
        };
        for pending in drained {
            pending.retransmit.abort();
            let _ = pending.waiter.send(Err(error.clone()));
        }
        self.settled.notify_waiters();
        true
    }

    /// Terminates the duplex because of an error. A `Closed` error means the other side went
    ///  away in an orderly fashion, so the duplex is closed rather than errored.
    pub fn fail(&self, error: KcpError) -> bool {
        match error {
            KcpError::Closed => self.terminate(None),
            e => self.terminate(Some(e)),
        }
    }
}
