use std::fmt::{Debug, Formatter};
use std::time::SystemTime;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::error::KcpError;
use crate::safe_converter::{PrecheckedCast, SafeCast};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Command {
    Push = 81,
    Ack = 82,
    WindowAsk = 83,
    WindowAnswer = 84,
}

/// A single KCP packet. See the crate documentation for the wire layout.
#[derive(Clone, Eq, PartialEq)]
pub struct Segment {
    pub conversation: u32,
    pub command: Command,
    /// fragment index inside a logical message - always 0 since every write is a single fragment
    pub count: u8,
    /// advertised receive window - carried for compatibility, not enforced
    pub window: u16,
    pub timestamp: u32,
    pub serial: u32,
    /// the sender's receive counter at the time the segment was built
    pub unack_serial: u32,
    pub fragment: Bytes,
}

impl Debug for Segment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SEG{{{:?}#{}@{}/una{}:{}b}}", self.command, self.serial, self.conversation, self.unack_serial, self.fragment.len())
    }
}

impl Segment {
    /// length of everything before the fragment, including the fragment length field
    pub const HEADER_LEN: usize = 24;
    pub const DEFAULT_WINDOW: u16 = u16::MAX;

    const OFFSET_COMMAND: usize = 4;
    const OFFSET_FRAGMENT_LEN: usize = 20;

    pub fn push(conversation: u32, window: u16, serial: u32, unack_serial: u32, fragment: Bytes) -> Segment {
        Segment {
            conversation,
            command: Command::Push,
            count: 0,
            window,
            timestamp: current_timestamp(),
            serial,
            unack_serial,
            fragment,
        }
    }

    /// The ack echoes the timestamp of the push it acknowledges
    pub fn ack(conversation: u32, window: u16, timestamp: u32, serial: u32, unack_serial: u32) -> Segment {
        Segment {
            conversation,
            command: Command::Ack,
            count: 0,
            window,
            timestamp,
            serial,
            unack_serial,
            fragment: Bytes::new(),
        }
    }

    pub fn window_ask(conversation: u32, window: u16, unack_serial: u32) -> Segment {
        Segment {
            conversation,
            command: Command::WindowAsk,
            count: 0,
            window,
            timestamp: current_timestamp(),
            serial: 0,
            unack_serial,
            fragment: Bytes::new(),
        }
    }

    pub fn window_answer(conversation: u32, window: u16, unack_serial: u32) -> Segment {
        Segment {
            conversation,
            command: Command::WindowAnswer,
            count: 0,
            window,
            timestamp: current_timestamp(),
            serial: 0,
            unack_serial,
            fragment: Bytes::new(),
        }
    }

    /// Checks that a fragment's length can be represented in the segment's length field
    pub fn check_fragment_len(fragment: &[u8]) -> Result<(), KcpError> {
        match u32::try_from(fragment.len()) {
            Ok(_) => Ok(()),
            Err(_) => Err(KcpError::FragmentTooLarge(fragment.len())),
        }
    }

    pub fn serialized_len(&self) -> usize {
        Self::HEADER_LEN + self.fragment.len()
    }

    /// NB: callers must ensure the fragment length fits into a u32 (see [Segment::check_fragment_len])
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.conversation);
        buf.put_u8(self.command.into());
        buf.put_u8(self.count);
        buf.put_u16_le(self.window);
        buf.put_u32_le(self.timestamp);
        buf.put_u32_le(self.serial);
        buf.put_u32_le(self.unack_serial);
        buf.put_u32_le(self.fragment.len().prechecked_cast());
        buf.put_slice(&self.fragment);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        self.ser(&mut buf);
        buf.freeze()
    }

    /// Reads one segment from the start of `buf`, advancing it past the segment.
    ///
    /// If the segment is incomplete or invalid, `buf` is left untouched so that the caller can
    ///  retry after appending more data.
    pub fn deser(buf: &mut Bytes) -> Result<Segment, KcpError> {
        if buf.len() < Self::HEADER_LEN {
            return Err(KcpError::TruncatedSegment {
                needed: Self::HEADER_LEN,
                available: buf.len(),
            });
        }

        let fragment_len: usize = (&buf[Self::OFFSET_FRAGMENT_LEN..]).get_u32_le().safe_cast();
        // a peer can declare up to u32::MAX, which does not fit next to the header on 32 bit targets
        let needed = Self::HEADER_LEN.checked_add(fragment_len)
            .unwrap_or(usize::MAX);
        if buf.len() < needed {
            return Err(KcpError::TruncatedSegment {
                needed,
                available: buf.len(),
            });
        }

        let raw_command = buf[Self::OFFSET_COMMAND];
        let command = Command::try_from(raw_command)
            .map_err(|_| KcpError::UnknownCommand(raw_command))?;

        // everything is validated, so from here on nothing can fail
        let conversation = buf.get_u32_le();
        let _ = buf.get_u8();
        let count = buf.get_u8();
        let window = buf.get_u16_le();
        let timestamp = buf.get_u32_le();
        let serial = buf.get_u32_le();
        let unack_serial = buf.get_u32_le();
        let _ = buf.get_u32_le();
        let fragment = buf.split_to(fragment_len);

        Ok(Segment {
            conversation,
            command,
            count,
            window,
            timestamp,
            serial,
            unack_serial,
            fragment,
        })
    }
}

/// seconds since the epoch, truncated to u32
pub fn current_timestamp() -> u32 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn segment(command: Command, serial: u32, unack_serial: u32, fragment: Vec<u8>) -> Segment {
        Segment {
            conversation: 12345,
            command,
            count: 0,
            window: 65535,
            timestamp: 7,
            serial,
            unack_serial,
            fragment: Bytes::from(fragment),
        }
    }

    #[rstest]
    #[case::push(segment(Command::Push, 2, 1, vec![1,2,3]), vec![57,48,0,0, 81, 0, 255,255, 7,0,0,0, 2,0,0,0, 1,0,0,0, 3,0,0,0, 1,2,3])]
    #[case::push_empty(segment(Command::Push, 0, 0, vec![]), vec![57,48,0,0, 81, 0, 255,255, 7,0,0,0, 0,0,0,0, 0,0,0,0, 0,0,0,0])]
    #[case::ack(segment(Command::Ack, 258, 4, vec![]), vec![57,48,0,0, 82, 0, 255,255, 7,0,0,0, 2,1,0,0, 4,0,0,0, 0,0,0,0])]
    #[case::window_ask(segment(Command::WindowAsk, 0, 9, vec![]), vec![57,48,0,0, 83, 0, 255,255, 7,0,0,0, 0,0,0,0, 9,0,0,0, 0,0,0,0])]
    #[case::window_answer(segment(Command::WindowAnswer, 0, 65536, vec![]), vec![57,48,0,0, 84, 0, 255,255, 7,0,0,0, 0,0,0,0, 0,0,1,0, 0,0,0,0])]
    fn test_ser(#[case] segment: Segment, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        segment.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(segment.serialized_len(), expected.len());
        assert_eq!(segment.to_bytes().as_ref(), expected.as_slice());
    }

    #[rstest]
    #[case::empty(0)]
    #[case::one(1)]
    #[case::small(130)]
    #[case::mtu(1400)]
    #[case::big(70_000)]
    fn test_ser_deser(#[case] fragment_len: usize) {
        let fragment = (0..fragment_len).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        let original = Segment {
            conversation: 0xdead_beef,
            command: Command::Push,
            count: 3,
            window: 1024,
            timestamp: u32::MAX,
            serial: 17,
            unack_serial: 4,
            fragment: Bytes::from(fragment),
        };

        let mut buf = original.to_bytes();
        let deser = Segment::deser(&mut buf).unwrap();
        assert!(buf.is_empty());
        assert_eq!(deser, original);
    }

    #[rstest]
    #[case::empty(vec![], 24)]
    #[case::partial_header(vec![57,48,0,0, 81, 0, 255,255], 24)]
    #[case::header_only_one_missing(vec![57,48,0,0, 81, 0, 255,255, 7,0,0,0, 0,0,0,0, 0,0,0,0, 0,0,0], 24)]
    #[case::missing_fragment(vec![57,48,0,0, 81, 0, 255,255, 7,0,0,0, 0,0,0,0, 0,0,0,0, 3,0,0,0], 27)]
    #[case::partial_fragment(vec![57,48,0,0, 81, 0, 255,255, 7,0,0,0, 0,0,0,0, 0,0,0,0, 3,0,0,0, 1,2], 27)]
    #[case::max_fragment_len(vec![57,48,0,0, 81, 0, 255,255, 7,0,0,0, 0,0,0,0, 0,0,0,0, 255,255,255,255, 1,2], (u32::MAX as usize).saturating_add(24))]
    fn test_deser_truncated(#[case] raw: Vec<u8>, #[case] expected_needed: usize) {
        let mut buf = Bytes::from(raw.clone());
        let result = Segment::deser(&mut buf);
        assert_eq!(result, Err(KcpError::TruncatedSegment { needed: expected_needed, available: raw.len() }));
        assert_eq!(buf.as_ref(), raw.as_slice(), "a failed read must not consume anything");
    }

    #[rstest]
    #[case::zero(0)]
    #[case::below(80)]
    #[case::above(85)]
    #[case::max(255)]
    fn test_deser_unknown_command(#[case] command: u8) {
        let raw = vec![57,48,0,0, command, 0, 255,255, 7,0,0,0, 0,0,0,0, 0,0,0,0, 0,0,0,0];
        let mut buf = Bytes::from(raw.clone());
        assert_eq!(Segment::deser(&mut buf), Err(KcpError::UnknownCommand(command)));
        assert_eq!(buf.as_ref(), raw.as_slice());
    }

    #[test]
    fn test_deser_retry_after_append() {
        let original = segment(Command::Push, 5, 5, vec![9,8,7,6]);
        let full = original.to_bytes();

        let mut partial = full.slice(..26);
        assert!(Segment::deser(&mut partial).is_err());

        let mut appended = BytesMut::from(partial.as_ref());
        appended.put_slice(&full[26..]);
        let mut appended = appended.freeze();
        assert_eq!(Segment::deser(&mut appended).unwrap(), original);
    }

    #[test]
    fn test_deser_several_per_chunk() {
        let segments = vec![
            segment(Command::Push, 0, 0, vec![1]),
            segment(Command::Ack, 3, 1, vec![]),
            segment(Command::Push, 1, 0, vec![2,3]),
        ];
        let mut buf = BytesMut::new();
        for s in &segments {
            s.ser(&mut buf);
        }
        let mut buf = buf.freeze();

        let mut actual = Vec::new();
        while buf.has_remaining() {
            actual.push(Segment::deser(&mut buf).unwrap());
        }
        assert_eq!(actual, segments);
    }

    #[test]
    fn test_control_segments() {
        let ack = Segment::ack(1, 2, 3, 4, 5);
        assert_eq!((ack.command, ack.timestamp, ack.serial, ack.unack_serial), (Command::Ack, 3, 4, 5));
        assert!(ack.fragment.is_empty());

        let answer = Segment::window_answer(1, 2, 9);
        assert_eq!((answer.command, answer.serial, answer.unack_serial), (Command::WindowAnswer, 0, 9));

        let ask = Segment::window_ask(1, 2, 6);
        assert_eq!((ask.command, ask.serial, ask.unack_serial), (Command::WindowAsk, 0, 6));
    }

    #[rstest]
    #[case(81, Some(Command::Push))]
    #[case(82, Some(Command::Ack))]
    #[case(83, Some(Command::WindowAsk))]
    #[case(84, Some(Command::WindowAnswer))]
    #[case(86, None)]
    fn test_command_from_u8(#[case] raw: u8, #[case] expected: Option<Command>) {
        assert_eq!(Command::try_from(raw).ok(), expected);
    }
}
