//! This is an ARQ protocol in the style of KCP: it provides reliable, in-order, at-most-once
//!  delivery of application *fragments* on top of a lossy, unordered duplex byte channel.
//!
//! The protocol engine does not know anything about sockets. It exposes a [duplex::KcpDuplex]
//!  with two pairs of channels: an *inner* pair that a transport adapter pumps encoded bytes
//!  through (UDP socket, tunnel, relay, ...), and an *outer* pair that the application writes
//!  fragments to and reads fragments from.
//!
//! ## Design goals
//!
//! * Every write is sent as a single `PUSH` segment. Fragments are opaque to the protocol, and
//!   there is no splitting or re-assembly of big messages
//! * A write completes when the peer acknowledges it, so the application can rely on delivery
//!   of everything it wrote successfully
//!   * there can be any number of writes in flight at the same time, each with its own
//!     retransmission and ack timeout
//!   * acks can complete writes in any order, while the peer delivers fragments strictly in
//!     the order of their serials
//! * Unacknowledged segments are re-sent at a fixed interval (`low_delay`) until a configured
//!   time (`high_delay`) has passed since the first send. The write keeps waiting for an ack
//!   after that, until `ack_timeout`
//! * There is no congestion control, and the advertised receive window is informational only
//! * There is no handshake. Both sides must agree on the *conversation* id out of band, and
//!   segments for other conversations are silently ignored
//! * Failures cascade: if either side of the duplex is closed or fails, all pending writes are
//!   rejected and both sides are terminated
//!
//! ## Segment layout
//!
//! All numbers are little endian:
//!
//! ```ascii
//!  0: conversation (u32)
//!  4: command (u8)
//!     * 81 PUSH - carries a fragment
//!     * 82 ACK - acknowledges the PUSH with the same serial
//!     * 83 WASK - asks the peer for its receive window
//!     * 84 WINS - answer to WASK. Receiving one is a protocol error unless the duplex was
//!       configured to accept them
//!  5: count (u8) - fragment index, always 0
//!  6: window (u16) - the sender's receive window
//!  8: timestamp (u32) - seconds since the epoch when the segment was created. An ACK echoes
//!      the timestamp of the PUSH it acknowledges
//! 12: serial (u32) - the PUSH's serial; the acknowledged serial for ACK; 0 for WINS
//! 16: unack serial (u32) - the sender's receive counter, i.e. the serial it expects next
//! 20: fragment length (u32)
//! 24: fragment
//! ```
//!
//! A chunk handed in by the transport may contain any number of segments. A segment that can not
//!  be decoded (truncated, or with an unknown command) is a fatal protocol error that terminates
//!  the duplex.
//!
//! ## Serials
//!
//! Each side numbers its pushes starting at 0. The receiver delivers the fragment with the serial
//!  it expects next, buffers pushes from further ahead, and drops pushes it delivered already -
//!  acknowledging them anyway, since the original ack may have been lost. Serials are compared
//!  modulo 2^32, so a conversation survives counter wrap-around.

pub mod config;
pub mod duplex;
pub mod error;
pub mod fragment_dispatcher;
pub mod receive_path;
pub mod safe_converter;
pub mod segment;
pub mod segment_sink;
pub mod send_path;
pub mod state;
