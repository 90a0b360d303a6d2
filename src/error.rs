use std::time::Duration;
use thiserror::Error;

/// Everything that can go wrong inside a KCP duplex.
///
/// The type is `Clone` because a single failure (e.g. the transport going away) has to be
///  reported to every write that is waiting for an ack at that moment.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KcpError {
    /// Fewer bytes are available than the segment header or its declared fragment length
    ///  require. The decoder does not consume anything in this case.
    #[error("truncated segment: {needed} bytes needed, {available} available")]
    TruncatedSegment { needed: usize, available: usize },

    #[error("unknown KCP command {0}")]
    UnknownCommand(u8),

    #[error("fragment of {0} bytes does not fit into a single segment")]
    FragmentTooLarge(usize),

    #[error("segment #{serial} was not acknowledged within {timeout:?}")]
    AckTimeout { serial: u32, timeout: Duration },

    #[error("duplex is closing")]
    Closing,

    #[error("duplex is closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),
}

impl KcpError {
    /// Protocol violations by the peer, as opposed to local lifecycle or timing conditions
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, KcpError::TruncatedSegment { .. } | KcpError::UnknownCommand(_))
    }
}
