use std::sync::Arc;
use bytes::{Buf, Bytes};
use tracing::{debug, trace};
use crate::error::KcpError;
use crate::fragment_dispatcher::FragmentDispatcher;
use crate::segment::{Command, Segment};
use crate::segment_sink::SegmentOutput;
use crate::state::SharedState;

/// Handles everything that arrives from the transport: decodes segments, acknowledges pushes
///  and delivers their fragments in order, settles writes that are acked, and answers window
///  probes.
pub struct ReceivePath {
    shared: Arc<SharedState>,
    output: SegmentOutput,
    dispatcher: Arc<dyn FragmentDispatcher>,
    accept_window_answers: bool,
}

impl ReceivePath {
    pub fn new(shared: Arc<SharedState>, output: SegmentOutput, dispatcher: Arc<dyn FragmentDispatcher>, accept_window_answers: bool) -> ReceivePath {
        ReceivePath {
            shared,
            output,
            dispatcher,
            accept_window_answers,
        }
    }

    /// A chunk may contain any number of segments. A segment that can not be decoded fails the
    ///  entire chunk - there is no way to resynchronize inside a byte stream, so callers treat
    ///  this as fatal.
    pub async fn on_chunk(&self, mut chunk: Bytes) -> Result<(), KcpError> {
        trace!("received chunk of {} bytes", chunk.len());

        while chunk.has_remaining() {
            if self.shared.lifecycle().is_terminal() {
                debug!("duplex is terminated - discarding {} bytes of received data", chunk.len());
                return Ok(());
            }

            let segment = Segment::deser(&mut chunk)?;
            self.on_segment(segment).await?;
        }
        Ok(())
    }

    pub async fn on_segment(&self, segment: Segment) -> Result<(), KcpError> {
        trace!("received {:?}", segment);

        {
            let mut state = self.shared.lock();
            if segment.conversation != state.conversation {
                debug!("ignoring segment for conversation {} - this is conversation {}", segment.conversation, state.conversation);
                return Ok(());
            }
            state.record_peer_unack(segment.unack_serial);
        }

        match segment.command {
            Command::Push => self.on_push(segment).await,
            Command::Ack => {
                self.on_ack(segment.serial);
                Ok(())
            }
            Command::WindowAsk => self.on_window_ask().await,
            Command::WindowAnswer if self.accept_window_answers => {
                trace!("peer answered window probe: received up to #{}, window {}", segment.unack_serial, segment.window);
                Ok(())
            }
            Command::WindowAnswer => {
                debug!("received a window answer, which is not accepted by this duplex");
                Err(KcpError::UnknownCommand(Command::WindowAnswer.into()))
            }
        }
    }

    async fn on_push(&self, segment: Segment) -> Result<(), KcpError> {
        // the ack reports the receive counter from before this push is delivered
        let (ack, deliverable) = {
            let mut state = self.shared.lock();
            let ack = Segment::ack(state.conversation, state.window, segment.timestamp, segment.serial, state.recv_counter);
            let deliverable = state.accept_push(segment);
            (ack, deliverable)
        };

        // duplicates are acked as well: the original ack may have been lost
        self.output.send_segment(&ack).await?;

        for fragment in deliverable {
            self.dispatcher.on_fragment(fragment).await?;
        }
        Ok(())
    }

    fn on_ack(&self, serial: u32) {
        if !self.shared.resolve_ack(serial) {
            debug!("ack for #{} which is not pending (any more) - ignoring", serial);
        }
    }

    async fn on_window_ask(&self) -> Result<(), KcpError> {
        let answer = {
            let state = self.shared.lock();
            Segment::window_answer(state.conversation, state.window, state.recv_counter)
        };
        self.output.send_segment(&answer).await
    }
}
