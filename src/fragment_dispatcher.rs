use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::sync::mpsc;
use crate::error::KcpError;

/// Receives fragments once they are in order, i.e. this is the application side of the
///  receive path
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FragmentDispatcher: Send + Sync + 'static {
    async fn on_fragment(&self, fragment: Bytes) -> Result<(), KcpError>;
}

#[async_trait]
impl FragmentDispatcher for mpsc::Sender<Bytes> {
    async fn on_fragment(&self, fragment: Bytes) -> Result<(), KcpError> {
        self.send(fragment).await
            .map_err(|_| KcpError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::runtime::Builder;

    #[test]
    fn test_channel_dispatcher() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let (sender, mut receiver) = mpsc::channel(2);
            sender.on_fragment(Bytes::from_static(b"x")).await.unwrap();
            assert_eq!(receiver.recv().await.unwrap().as_ref(), b"x");

            drop(receiver);
            assert_eq!(sender.on_fragment(Bytes::from_static(b"y")).await, Err(KcpError::Closed));
        });
    }
}
