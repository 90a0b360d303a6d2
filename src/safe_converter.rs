//! Conversions between in-memory lengths and the u32 length field on the wire

/// Lossless on every target this crate builds for
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

/// Narrowing conversion for values whose range was checked before, e.g. fragment lengths that
///  passed [crate::segment::Segment::check_fragment_len]. Panics on a value out of range.
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}

impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        match u32::try_from(self) {
            Ok(value) => value,
            Err(_) => panic!("length {} was not checked against the u32 length field", self),
        }
    }
}
