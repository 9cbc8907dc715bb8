//! Binary wire primitives.
//!
//! Integers are fixed-width big-endian. Strings and blobs carry an explicit
//! length prefix whose width is picked per field (8-bit for names, 16 or
//! 32-bit for free text and bodies). There are no terminator bytes, so
//! payloads may contain anything.
//!
//! Decoding runs over a borrowed slice. Running out of input yields
//! [`WireError::Incomplete`] so the stream reader can fetch more and retry.

use bytes::{BufMut, Bytes, BytesMut};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// The slice ended before the value did.
    Incomplete,
    /// The bytes can never decode, no matter what follows.
    Invalid(String),
}

pub type WireResult<T> = Result<T, WireError>;

/// Cursor over a borrowed byte slice.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn consumed(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> WireResult<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(WireError::Incomplete)?;
        if end > self.buf.len() {
            return Err(WireError::Incomplete);
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub fn u8(&mut self) -> WireResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn bool(&mut self) -> WireResult<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            b => Err(WireError::Invalid(format!("invalid bool byte {b}"))),
        }
    }

    pub fn u16(&mut self) -> WireResult<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> WireResult<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> WireResult<u64> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    pub fn i64(&mut self) -> WireResult<i64> {
        Ok(i64::from_be_bytes(self.array()?))
    }

    pub fn array<const N: usize>(&mut self) -> WireResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn utf8(&mut self, len: usize) -> WireResult<String> {
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|e| WireError::Invalid(e.to_string()))
    }

    /// String with an 8-bit length prefix.
    pub fn str8(&mut self) -> WireResult<String> {
        let len = self.u8()? as usize;
        self.utf8(len)
    }

    /// String with a 16-bit length prefix.
    pub fn str16(&mut self) -> WireResult<String> {
        let len = self.u16()? as usize;
        self.utf8(len)
    }

    /// String with a 32-bit length prefix.
    pub fn str32(&mut self) -> WireResult<String> {
        let len = self.u32()? as usize;
        self.utf8(len)
    }

    /// Identity-bearing string (names, channel ids): 8-bit prefix, control
    /// characters removed.
    pub fn name(&mut self) -> WireResult<String> {
        Ok(strip_control(&self.str8()?))
    }

    /// Byte blob with a 16-bit length prefix.
    pub fn blob16(&mut self) -> WireResult<Vec<u8>> {
        let len = self.u16()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Byte blob with a 32-bit length prefix.
    pub fn blob32(&mut self) -> WireResult<Bytes> {
        let len = self.u32()? as usize;
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }

    /// List with a 16-bit count prefix.
    pub fn list16<T>(
        &mut self,
        mut item: impl FnMut(&mut Self) -> WireResult<T>,
    ) -> WireResult<Vec<T>> {
        let count = self.u16()? as usize;
        let mut out = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            out.push(item(self)?);
        }
        Ok(out)
    }
}

/// Remove control characters from identity-bearing strings.
pub fn strip_control(s: &str) -> String {
    s.chars().filter(|c| !c.is_control()).collect()
}

/// Longest prefix of `s` that fits in `max` bytes without splitting a char.
fn clamp(s: &str, max: usize) -> &[u8] {
    if s.len() <= max {
        return s.as_bytes();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s.as_bytes()[..end]
}

/// Writers for the primitives above. Over-long strings are truncated to
/// what the prefix can express.
pub trait WireWrite {
    fn put_bool(&mut self, v: bool);
    fn put_str8(&mut self, s: &str);
    fn put_str16(&mut self, s: &str);
    fn put_str32(&mut self, s: &str);
    fn put_name(&mut self, s: &str);
    fn put_blob16(&mut self, b: &[u8]);
    fn put_blob32(&mut self, b: &[u8]);
}

impl WireWrite for BytesMut {
    fn put_bool(&mut self, v: bool) {
        self.put_u8(v as u8);
    }

    fn put_str8(&mut self, s: &str) {
        let raw = clamp(s, u8::MAX as usize);
        self.put_u8(raw.len() as u8);
        self.put_slice(raw);
    }

    fn put_str16(&mut self, s: &str) {
        let raw = clamp(s, u16::MAX as usize);
        self.put_u16(raw.len() as u16);
        self.put_slice(raw);
    }

    fn put_str32(&mut self, s: &str) {
        let raw = clamp(s, u32::MAX as usize);
        self.put_u32(raw.len() as u32);
        self.put_slice(raw);
    }

    fn put_name(&mut self, s: &str) {
        self.put_str8(&strip_control(s));
    }

    fn put_blob16(&mut self, b: &[u8]) {
        let len = b.len().min(u16::MAX as usize);
        self.put_u16(len as u16);
        self.put_slice(&b[..len]);
    }

    fn put_blob32(&mut self, b: &[u8]) {
        let len = b.len().min(u32::MAX as usize);
        self.put_u32(len as u32);
        self.put_slice(&b[..len]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_are_big_endian() {
        let mut buf = BytesMut::new();
        buf.put_u16(0x0102);
        buf.put_u32(0x03040506);
        assert_eq!(&buf[..], &[1, 2, 3, 4, 5, 6]);

        let mut r = WireReader::new(&buf);
        assert_eq!(r.u16().unwrap(), 0x0102);
        assert_eq!(r.u32().unwrap(), 0x03040506);
        assert_eq!(r.consumed(), 6);
    }

    #[test]
    fn short_input_is_incomplete() {
        let mut buf = BytesMut::new();
        buf.put_str16("hello world");
        let truncated = &buf[..buf.len() - 1];
        let mut r = WireReader::new(truncated);
        assert_eq!(r.str16(), Err(WireError::Incomplete));
    }

    #[test]
    fn payload_keeps_control_bytes() {
        let mut buf = BytesMut::new();
        buf.put_str16("line one\nline\ttwo\0");
        let mut r = WireReader::new(&buf);
        assert_eq!(r.str16().unwrap(), "line one\nline\ttwo\0");
    }

    #[test]
    fn names_drop_control_bytes() {
        let mut buf = BytesMut::new();
        buf.put_str8("al\u{7}ice\n");
        let mut r = WireReader::new(&buf);
        assert_eq!(r.name().unwrap(), "alice");
    }

    #[test]
    fn str8_truncates_on_char_boundary() {
        let long = "é".repeat(200); // 400 bytes
        let mut buf = BytesMut::new();
        buf.put_str8(&long);
        assert_eq!(buf[0], 254);
        let mut r = WireReader::new(&buf);
        assert_eq!(r.str8().unwrap(), "é".repeat(127));
    }

    #[test]
    fn invalid_utf8_is_invalid() {
        let buf = [2u8, 0xff, 0xfe];
        let mut r = WireReader::new(&buf);
        assert!(matches!(r.str8(), Err(WireError::Invalid(_))));
    }

    #[test]
    fn invalid_bool() {
        let mut r = WireReader::new(&[7]);
        assert!(matches!(r.bool(), Err(WireError::Invalid(_))));
    }

    #[test]
    fn list_roundtrip() {
        let mut buf = BytesMut::new();
        buf.put_u16(3);
        for s in ["a", "bb", "ccc"] {
            buf.put_str8(s);
        }
        let mut r = WireReader::new(&buf);
        let items = r.list16(|r| r.str8()).unwrap();
        assert_eq!(items, vec!["a", "bb", "ccc"]);
    }
}
