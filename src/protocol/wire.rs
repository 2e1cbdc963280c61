//! Little-endian primitives and fixed-capacity UTF-16 strings.
//!
//! Every multi-byte integer in the protocol is little-endian. Strings are
//! arrays of `N` UTF-16 code units, null-terminated and null-padded.

use widestring::{U16CStr, U16Str};

use super::types::Handle;
use crate::error::{ProtocolError, Result};

/// Append-only encoder
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.push(value as u8);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_handle(&mut self, handle: Handle) {
        self.put_u64(handle.into_raw());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Length-prefixed (u32) byte blob
    pub fn put_blob(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.put_bytes(bytes);
    }

    /// Length-prefixed (u32) UTF-8 text
    pub fn put_text(&mut self, text: &str) {
        self.put_blob(text.as_bytes());
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Bounds-checked decoder over a borrowed buffer.
///
/// Running past the end yields `TruncatedRecord` naming the record being
/// decoded; nothing is ever read out of bounds.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
    record: &'static str,
}

impl<'a> WireReader<'a> {
    pub fn new(record: &'static str, buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            record,
        }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(ProtocolError::TruncatedRecord {
                record: self.record,
                expected: self.pos + n,
                actual: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Strict boolean: only `0` and `1` are accepted
    pub fn bool(&mut self, field: &'static str) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            v => Err(ProtocolError::InvalidEnumValue {
                field,
                value: v as u32,
            }),
        }
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub fn handle(&mut self) -> Result<Handle> {
        Ok(Handle::from_raw(self.u64()?))
    }

    pub fn bytes<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.array()
    }

    pub fn blob(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn text(&mut self) -> Result<String> {
        let blob = self.blob()?;
        Ok(String::from_utf8_lossy(&blob).into_owned())
    }

    pub fn code_units(&mut self, count: usize) -> Result<Vec<u16>> {
        let raw = self.take(count * 2)?;
        Ok(raw
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect())
    }
}

/// A string with room for `N` UTF-16 code units on the wire, terminator
/// included.
///
/// Construction truncates at the first NUL and then to `N - 1` code units
/// (never splitting a surrogate pair), so the value always fits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FixedString<const N: usize>(String);

/// 260-unit path buffer
pub type PathString = FixedString<260>;
/// Section names
pub type SectionName = FixedString<16>;
/// Rendered instruction text
pub type MnemonicString = FixedString<64>;

impl<const N: usize> FixedString<N> {
    /// Usable code units (one is reserved for the terminator)
    pub const CAPACITY: usize = N - 1;
    /// Encoded size in bytes
    pub const WIRE_SIZE: usize = N * 2;

    pub fn new(value: &str) -> Self {
        let value = value.split('\0').next().unwrap_or("");
        let mut units = 0;
        let mut end = 0;
        for (idx, ch) in value.char_indices() {
            if units + ch.len_utf16() > Self::CAPACITY {
                break;
            }
            units += ch.len_utf16();
            end = idx + ch.len_utf8();
        }
        Self(value[..end].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn encode_into(&self, w: &mut WireWriter) {
        let mut written = 0;
        for unit in self.0.encode_utf16() {
            w.put_u16(unit);
            written += 1;
        }
        for _ in written..N {
            w.put_u16(0);
        }
    }

    pub fn decode_from(r: &mut WireReader<'_>) -> Result<Self> {
        let units = r.code_units(N)?;
        let text = match U16CStr::from_slice_truncate(&units) {
            Ok(s) => s.to_string_lossy(),
            // Producer filled every unit; take the whole buffer
            Err(_) => U16Str::from_slice(&units).to_string_lossy(),
        };
        Ok(Self::new(&text))
    }
}

impl<const N: usize> From<&str> for FixedString<N> {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl<const N: usize> From<String> for FixedString<N> {
    fn from(value: String) -> Self {
        Self::new(&value)
    }
}

impl<const N: usize> std::fmt::Display for FixedString<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<const N: usize> PartialEq<&str> for FixedString<N> {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<const N: usize>(s: &FixedString<N>) -> FixedString<N> {
        let mut w = WireWriter::new();
        s.encode_into(&mut w);
        let bytes = w.into_bytes();
        assert_eq!(bytes.len(), FixedString::<N>::WIRE_SIZE);
        FixedString::decode_from(&mut WireReader::new("string", &bytes)).unwrap()
    }

    #[test]
    fn test_truncates_then_terminates() {
        let name = SectionName::new(".a_really_long_section_name");
        assert_eq!(name.as_str().len(), SectionName::CAPACITY);
        assert_eq!(name, ".a_really_long_");

        let mut w = WireWriter::new();
        name.encode_into(&mut w);
        let bytes = w.into_bytes();
        assert_eq!(&bytes[30..32], &[0, 0]);
        assert_eq!(round_trip(&name), name);
    }

    #[test]
    fn test_truncation_keeps_surrogate_pairs_whole() {
        // 14 ASCII units + one astral char (2 units) = 16 > 15
        let name = SectionName::new("abcdefghijklmn\u{1F980}");
        assert_eq!(name.as_str(), "abcdefghijklmn");
        let name = SectionName::new("abcdefghijklm\u{1F980}");
        assert_eq!(name.as_str(), "abcdefghijklm\u{1F980}");
        assert_eq!(round_trip(&name), name);
    }

    #[test]
    fn test_embedded_nul_cuts_string() {
        assert_eq!(PathString::new("C:\\app.exe\0junk"), "C:\\app.exe");
    }

    #[test]
    fn test_unterminated_buffer_decodes() {
        let mut bytes = Vec::new();
        for _ in 0..16 {
            bytes.extend_from_slice(&(b'x' as u16).to_le_bytes());
        }
        let name = SectionName::decode_from(&mut WireReader::new("name", &bytes)).unwrap();
        assert_eq!(name.as_str().len(), 15);
    }

    #[test]
    fn test_reader_reports_truncation() {
        let mut r = WireReader::new("probe", &[1, 2, 3]);
        let err = r.u32().unwrap_err();
        match err {
            ProtocolError::TruncatedRecord {
                record,
                expected,
                actual,
            } => {
                assert_eq!(record, "probe");
                assert_eq!(expected, 4);
                assert_eq!(actual, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_strict_bool() {
        assert!(WireReader::new("b", &[1]).bool("flag").unwrap());
        assert!(WireReader::new("b", &[2]).bool("flag").is_err());
    }
}
