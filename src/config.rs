use std::time::Duration;
use anyhow::bail;
use rand::rngs::OsRng;
use rand::RngCore;
use crate::segment::Segment;

/// What happens to the rest of the duplex when a write is not acknowledged in time
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum AckTimeoutPolicy {
    /// Only the affected write fails, the duplex stays open
    #[default]
    FailWrite,
    /// The write fails and the duplex goes to the errored state with the timeout as its reason
    ErrorDuplex,
}

#[derive(Debug, Clone)]
pub struct KcpConfig {
    /// The conversation id shared by both ends. Both ends must be configured with the same value,
    ///  typically one side picks a random id and communicates it out of band.
    ///
    /// `None` means a cryptographically random id is chosen when the duplex is opened.
    pub conversation: Option<u32>,

    /// Interval between retransmissions of an unacknowledged segment
    pub low_delay: Duration,
    /// Retransmissions stop once this much time has passed since a segment was first sent. The
    ///  write keeps waiting for an ack until `ack_timeout` though.
    pub high_delay: Duration,

    pub ack_timeout: Duration,
    pub ack_timeout_policy: AckTimeoutPolicy,

    /// advertised in every segment - the peer is free to ignore it
    pub window: u16,

    /// bound of each of the duplex's channels; writers are suspended when a channel is full
    pub channel_capacity: usize,

    /// Incoming window answers are a protocol error unless this is set. Peers only send them in
    ///  response to [crate::duplex::KcpControl::probe_window], so set it when probing.
    pub accept_window_answers: bool,
}

impl Default for KcpConfig {
    fn default() -> Self {
        KcpConfig {
            conversation: None,
            low_delay: Duration::from_millis(300),
            high_delay: Duration::from_millis(3000),
            ack_timeout: Duration::from_secs(60),
            ack_timeout_policy: AckTimeoutPolicy::FailWrite,
            window: Segment::DEFAULT_WINDOW,
            channel_capacity: 1024,
            accept_window_answers: false,
        }
    }
}

impl KcpConfig {
    pub fn with_conversation(conversation: u32) -> KcpConfig {
        KcpConfig {
            conversation: Some(conversation),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.low_delay.is_zero() {
            bail!("low delay must be positive");
        }
        if self.high_delay < self.low_delay {
            bail!("high delay ({:?}) must not be smaller than low delay ({:?})", self.high_delay, self.low_delay);
        }
        if self.ack_timeout.is_zero() {
            bail!("ack timeout must be positive");
        }
        if self.channel_capacity == 0 {
            bail!("channel capacity must be positive");
        }
        Ok(())
    }

    pub fn effective_conversation(&self) -> u32 {
        self.conversation
            .unwrap_or_else(|| OsRng.next_u32())
    }
}
