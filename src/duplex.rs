use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};
use crate::config::KcpConfig;
use crate::error::KcpError;
use crate::receive_path::ReceivePath;
use crate::segment_sink::{ChannelSink, SegmentOutput};
use crate::send_path::SendPath;
use crate::state::{KcpStats, Lifecycle, SharedState};

/// A KCP conversation, exposed as two pairs of channels plus a control handle:
///
/// * `inner` is what the transport adapter deals with: encoded segments to send, and received
///   chunks to feed in
/// * `outer` is what the application deals with: fragments in, fragments out
///
/// Closing or failing either side terminates the whole duplex, settling all pending writes.
pub struct KcpDuplex {
    pub inner: TransportPair,
    pub outer: ApplicationPair,
    pub control: KcpControl,
}

pub struct TransportPair {
    /// encoded segments, ready to be sent by the transport. This ends when the duplex terminates.
    pub readable: mpsc::Receiver<Bytes>,
    pub writable: TransportWriter,
}

pub struct ApplicationPair {
    pub readable: KcpReader,
    pub writable: KcpWriter,
}

impl KcpDuplex {
    /// Creates the duplex and spawns its receive loop. This must be called in the context of a
    ///  tokio runtime.
    pub fn open(config: KcpConfig) -> anyhow::Result<KcpDuplex> {
        config.validate()?;

        let conversation = config.effective_conversation();
        debug!("opening KCP conversation {}", conversation);

        let config = Arc::new(config);
        let shared = Arc::new(SharedState::new(conversation, config.window));

        let (outbound_sender, outbound_receiver) = mpsc::channel(config.channel_capacity);
        let (inbound_sender, inbound_receiver) = mpsc::channel(config.channel_capacity);
        let (fragment_sender, fragment_receiver) = mpsc::channel(config.channel_capacity);

        let output = SegmentOutput::new(Arc::new(ChannelSink::new(outbound_sender)));
        let receive_path = ReceivePath::new(shared.clone(), output.clone(), Arc::new(fragment_sender), config.accept_window_answers);
        let send_path = SendPath::new(shared.clone(), output.clone(), config.clone());

        tokio::spawn(receive_loop(receive_path, inbound_receiver, shared.clone(), output));

        Ok(KcpDuplex {
            inner: TransportPair {
                readable: outbound_receiver,
                writable: TransportWriter {
                    sender: inbound_sender,
                    shared: shared.clone(),
                },
            },
            outer: ApplicationPair {
                readable: KcpReader {
                    fragments: fragment_receiver,
                    shared: shared.clone(),
                },
                writable: KcpWriter {
                    send_path: send_path.clone(),
                    shared: shared.clone(),
                    ack_timeout: config.ack_timeout,
                },
            },
            control: KcpControl {
                shared,
                send_path,
                ack_timeout: config.ack_timeout,
            },
        })
    }
}

async fn receive_loop(receive_path: ReceivePath, mut inbound: mpsc::Receiver<Bytes>, shared: Arc<SharedState>, output: SegmentOutput) {
    {
        let terminated = shared.wait_terminated();
        // holds a sender clone, so it must be gone before the output is closed
        let transport_gone = output.closed();
        tokio::pin!(terminated, transport_gone);

        loop {
            select! {
                chunk = inbound.recv() => match chunk {
                    Some(chunk) => {
                        // a full outbound or fragment channel can block a chunk indefinitely
                        let result = select! {
                            result = receive_path.on_chunk(chunk) => result,
                            _ = &mut terminated => break,
                        };
                        if let Err(e) = result {
                            if e.is_protocol_error() {
                                warn!("protocol error, terminating the conversation: {}", e);
                            }
                            else {
                                debug!("receive path failed: {}", e);
                            }
                            shared.fail(e);
                            break;
                        }
                    }
                    None => {
                        debug!("transport closed its writable side");
                        shared.terminate(None);
                        break;
                    }
                },
                _ = &mut transport_gone => {
                    debug!("transport dropped its readable side");
                    shared.terminate(None);
                    break;
                }
                _ = &mut terminated => break,
            }
        }
    }

    // dropping the receive path closes the application's readable side
    drop(receive_path);
    output.close();
}

/// Waits for pending writes to settle (at most for `ack_timeout`), then closes
async fn close_gracefully(shared: &SharedState, ack_timeout: Duration) {
    shared.begin_close();
    if shared.lifecycle() == Lifecycle::Closing
        && timeout(ack_timeout, shared.wait_settled()).await.is_err()
    {
        debug!("pending writes did not settle within {:?} - closing anyway", ack_timeout);
    }
    shared.terminate(None);
}

/// Feeds chunks received by the transport into the duplex. Dropping all clones closes the
///  duplex.
#[derive(Clone)]
pub struct TransportWriter {
    sender: mpsc::Sender<Bytes>,
    shared: Arc<SharedState>,
}

impl TransportWriter {
    pub async fn write(&self, chunk: Bytes) -> Result<(), KcpError> {
        let lifecycle = self.shared.lifecycle();
        if lifecycle.is_terminal() {
            return Err(lifecycle.write_error()
                .unwrap_or(KcpError::Closed));
        }
        self.sender.send(chunk).await
            .map_err(|_| KcpError::Closed)
    }

    /// The transport failed: the duplex is terminated with the reason as its error
    pub fn error(&self, reason: impl Into<String>) {
        self.shared.terminate(Some(KcpError::Transport(reason.into())));
    }
}

/// The application's readable side: fragments in the order they were written by the peer
pub struct KcpReader {
    fragments: mpsc::Receiver<Bytes>,
    shared: Arc<SharedState>,
}

impl KcpReader {
    /// Returns the next fragment, `None` when the duplex was closed, or the reason the duplex
    ///  failed
    pub async fn read(&mut self) -> Result<Option<Bytes>, KcpError> {
        match self.fragments.recv().await {
            Some(fragment) => Ok(Some(fragment)),
            None => match self.shared.lifecycle() {
                Lifecycle::Errored(e) => Err(e),
                _ => Ok(None),
            },
        }
    }

    /// Stops reading, which closes the whole duplex
    pub fn close(&mut self) {
        self.fragments.close();
        self.shared.terminate(None);
    }
}

/// The application's writable side. Clones share the same conversation, so writes from
///  different tasks can be in flight concurrently.
#[derive(Clone)]
pub struct KcpWriter {
    send_path: SendPath,
    shared: Arc<SharedState>,
    ack_timeout: Duration,
}

impl KcpWriter {
    /// Sends a fragment, returning when the peer acknowledged it
    pub async fn write(&self, fragment: Bytes) -> Result<(), KcpError> {
        self.send_path.write(fragment).await
    }

    /// Refuses further writes, waits for the pending ones to settle, and closes the duplex
    pub async fn close(&self) {
        close_gracefully(&self.shared, self.ack_timeout).await;
    }
}

#[derive(Clone)]
pub struct KcpControl {
    shared: Arc<SharedState>,
    send_path: SendPath,
    ack_timeout: Duration,
}

impl KcpControl {
    pub fn conversation(&self) -> u32 {
        self.shared.lock().conversation
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.lifecycle()
    }

    pub fn stats(&self) -> KcpStats {
        self.shared.stats()
    }

    pub async fn close(&self) {
        close_gracefully(&self.shared, self.ack_timeout).await;
    }

    /// Terminates the duplex immediately, failing all pending writes with the reason
    pub fn error(&self, reason: impl Into<String>) {
        self.shared.terminate(Some(KcpError::Transport(reason.into())));
    }

    /// Waits until the duplex is closed or errored, returning the final state
    pub async fn closed(&self) -> Lifecycle {
        self.shared.wait_terminated().await
    }

    pub async fn probe_window(&self) -> Result<(), KcpError> {
        self.send_path.probe_window().await
    }
}
