use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, trace};
use crate::config::{AckTimeoutPolicy, KcpConfig};
use crate::error::KcpError;
use crate::segment::Segment;
use crate::segment_sink::SegmentOutput;
use crate::state::{PendingAck, SharedState};

/// Sends application fragments as push segments, retransmitting them until they are acked, and
///  settles each write when its ack arrives (or does not).
#[derive(Clone)]
pub struct SendPath {
    shared: Arc<SharedState>,
    output: SegmentOutput,
    config: Arc<KcpConfig>,
}

impl SendPath {
    pub fn new(shared: Arc<SharedState>, output: SegmentOutput, config: Arc<KcpConfig>) -> SendPath {
        SendPath {
            shared,
            output,
            config,
        }
    }

    /// Sends a fragment and waits until the peer acknowledges it.
    ///
    /// Any number of writes can be in flight concurrently, each with its own retransmission.
    ///  Dropping the returned future abandons the write: its retransmission stops and a late ack
    ///  is ignored.
    pub async fn write(&self, fragment: Bytes) -> Result<(), KcpError> {
        Segment::check_fragment_len(&fragment)?;

        let start = Instant::now();
        let (segment, receiver) = {
            let mut state = self.shared.lock();
            // checked under the state lock so that teardown can not miss the entry registered below
            if let Some(e) = self.shared.lifecycle().write_error() {
                return Err(e);
            }

            let serial = state.next_send_serial();
            let segment = Segment::push(state.conversation, state.window, serial, state.recv_counter, fragment);

            // registered before the segment is sent, so an ack can not overtake the registration
            let (waiter, receiver) = oneshot::channel();
            let retransmit = tokio::spawn(Self::retransmit(
                self.shared.clone(),
                self.output.clone(),
                serial,
                segment.to_bytes(),
                start,
                self.config.low_delay,
                self.config.high_delay,
            ));
            state.pending_acks.insert(serial, PendingAck {
                waiter,
                retransmit: retransmit.abort_handle(),
            });
            (segment, receiver)
        };

        let serial = segment.serial;
        let _guard = PendingGuard {
            shared: self.shared.clone(),
            serial,
        };

        if let Err(e) = self.output.send_segment(&segment).await {
            debug!("sending push #{} failed: {}", serial, e);
            self.shared.fail(e.clone());
            return Err(e);
        }

        match timeout(self.config.ack_timeout, receiver).await {
            Ok(Ok(result)) => {
                trace!("write #{} settled after {:?}: {:?}", serial, start.elapsed(), result);
                result
            }
            Ok(Err(_)) => {
                // the entry was removed without settling it, which only teardown does
                Err(self.shared.lifecycle().write_error()
                    .unwrap_or(KcpError::Closed))
            }
            Err(_) => {
                let error = KcpError::AckTimeout {
                    serial,
                    timeout: self.config.ack_timeout,
                };
                debug!("{}", error);
                if self.config.ack_timeout_policy == AckTimeoutPolicy::ErrorDuplex {
                    self.shared.terminate(Some(error.clone()));
                }
                Err(error)
            }
        }
    }

    async fn retransmit(shared: Arc<SharedState>, output: SegmentOutput, serial: u32, encoded: Bytes, start: Instant, low_delay: Duration, high_delay: Duration) {
        let mut ticks = interval_at(start + low_delay, low_delay);
        loop {
            ticks.tick().await;

            if start.elapsed() > high_delay {
                debug!("no ack for #{} after {:?} - no more retransmissions", serial, high_delay);
                return;
            }
            if shared.lifecycle().is_terminal() {
                return;
            }

            if let Err(e) = output.resend(serial, &encoded).await {
                debug!("re-sending #{} failed: {}", serial, e);
                shared.fail(e);
                return;
            }
        }
    }

    /// Asks the peer for its receive window. The receive path only accepts the answer if the duplex
    ///  was opened with `accept_window_answers`, otherwise it fails the duplex.
    pub async fn probe_window(&self) -> Result<(), KcpError> {
        let ask = {
            let state = self.shared.lock();
            let lifecycle = self.shared.lifecycle();
            if lifecycle.is_terminal() {
                return Err(lifecycle.write_error()
                    .unwrap_or(KcpError::Closed));
            }
            Segment::window_ask(state.conversation, state.window, state.recv_counter)
        };
        self.output.send_segment(&ask).await
    }
}

/// Removes a write's pending entry and stops its retransmission on every exit path of the write,
///  including the write's future being dropped
struct PendingGuard {
    shared: Arc<SharedState>,
    serial: u32,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.shared.remove_pending(self.serial);
    }
}
