use std::sync::{Arc, Mutex, PoisonError};
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::sync::mpsc;
use tracing::trace;
use crate::error::KcpError;
use crate::segment::Segment;

/// This is the abstraction for handing encoded segments to the transport, introduced to
///  facilitate mocking the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SegmentSink: Send + Sync + 'static {
    /// Suspends while the transport applies backpressure, fails if the transport is gone
    async fn enqueue(&self, buf: Bytes) -> Result<(), KcpError>;

    /// Signals the end of outbound data. Further calls to `enqueue` fail.
    fn close(&self);

    /// Resolves once the transport stopped taking segments, or the sink was closed
    async fn closed(&self);
}

/// The transport-facing readable side of a duplex: everything enqueued here shows up in the
///  receiver that is handed to the transport adapter
pub struct ChannelSink {
    sender: Mutex<Option<mpsc::Sender<Bytes>>>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::Sender<Bytes>) -> ChannelSink {
        ChannelSink {
            sender: Mutex::new(Some(sender)),
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<Bytes>> {
        self.sender.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl SegmentSink for ChannelSink {
    async fn enqueue(&self, buf: Bytes) -> Result<(), KcpError> {
        // the sender is cloned so that the lock is not held while waiting for capacity
        let sender = self.sender()
            .ok_or(KcpError::Closed)?;
        sender.send(buf).await
            .map_err(|_| KcpError::Closed)
    }

    fn close(&self) {
        self.sender.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    async fn closed(&self) {
        if let Some(sender) = self.sender() {
            sender.closed().await;
        }
    }
}

/// Encodes segments and passes them on to a [SegmentSink]
#[derive(Clone)]
pub struct SegmentOutput {
    sink: Arc<dyn SegmentSink>,
}

impl SegmentOutput {
    pub fn new(sink: Arc<dyn SegmentSink>) -> SegmentOutput {
        SegmentOutput { sink }
    }

    pub async fn send_segment(&self, segment: &Segment) -> Result<(), KcpError> {
        trace!("sending {:?}", segment);
        self.sink.enqueue(segment.to_bytes()).await
    }

    /// Re-sends a segment that was encoded before, byte for byte
    pub async fn resend(&self, serial: u32, encoded: &Bytes) -> Result<(), KcpError> {
        trace!("re-sending #{}", serial);
        self.sink.enqueue(encoded.clone()).await
    }

    pub fn close(&self) {
        self.sink.close();
    }

    pub async fn closed(&self) {
        self.sink.closed().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use mockall::predicate::eq;
    use tokio::runtime::Builder;
    use crate::segment::Command;

    #[test]
    fn test_channel_sink() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let (sender, mut receiver) = mpsc::channel(4);
            let sink = ChannelSink::new(sender);

            sink.enqueue(Bytes::from_static(b"abc")).await.unwrap();
            sink.enqueue(Bytes::from_static(b"de")).await.unwrap();
            assert_eq!(receiver.recv().await.unwrap().as_ref(), b"abc");
            assert_eq!(receiver.recv().await.unwrap().as_ref(), b"de");

            sink.close();
            assert_eq!(sink.enqueue(Bytes::from_static(b"f")).await, Err(KcpError::Closed));
            assert!(receiver.recv().await.is_none());
        });
    }

    #[test]
    fn test_channel_sink_receiver_dropped() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let (sender, receiver) = mpsc::channel(4);
            let sink = ChannelSink::new(sender);
            drop(receiver);
            assert_eq!(sink.enqueue(Bytes::from_static(b"abc")).await, Err(KcpError::Closed));
        });
    }

    #[test]
    fn test_channel_sink_closed() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let (sender, receiver) = mpsc::channel(4);
            let sink = Arc::new(ChannelSink::new(sender));

            let sink2 = sink.clone();
            let closed = tokio::spawn(async move { sink2.closed().await });
            tokio::time::sleep(Duration::from_secs(60)).await;
            assert!(!closed.is_finished());

            drop(receiver);
            tokio::time::timeout(Duration::from_secs(1), closed).await
                .unwrap()
                .unwrap();

            // a closed sink counts as gone as well
            let (sender, _receiver) = mpsc::channel::<Bytes>(4);
            let sink = ChannelSink::new(sender);
            sink.close();
            sink.closed().await;
        });
    }

    #[test]
    fn test_segment_output() {
        let segment = Segment {
            conversation: 1,
            command: Command::Ack,
            count: 0,
            window: 2,
            timestamp: 3,
            serial: 4,
            unack_serial: 5,
            fragment: Bytes::new(),
        };
        let encoded = segment.to_bytes();

        let mut sink = MockSegmentSink::new();
        sink.expect_enqueue()
            .with(eq(encoded.clone()))
            .times(2)
            .returning(|_| Ok(()));
        sink.expect_close()
            .times(1)
            .return_const(());

        let output = SegmentOutput::new(Arc::new(sink));

        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async move {
            output.send_segment(&segment).await.unwrap();
            output.resend(4, &encoded).await.unwrap();
            output.close();
        });
    }
}
