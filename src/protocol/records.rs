//! Fixed-layout enumeration records.

use super::types::{Handle, SectionCategory, SectionProtection, SectionType};
use super::wire::{MnemonicString, PathString, SectionName, WireReader, WireWriter};
use crate::error::{ProtocolError, Result};

/// A record with a fixed, byte-exact wire size
pub trait Record: Sized {
    /// Name used in decode errors
    const NAME: &'static str;
    /// Encoded size in bytes
    const WIRE_SIZE: usize;

    fn encode_into(&self, w: &mut WireWriter);

    fn decode_from(r: &mut WireReader<'_>) -> Result<Self>;

    fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(Self::WIRE_SIZE);
        self.encode_into(&mut w);
        debug_assert_eq!(w.len(), Self::WIRE_SIZE);
        w.into_bytes()
    }

    /// Decode one record from the front of `bytes`
    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::WIRE_SIZE {
            return Err(ProtocolError::TruncatedRecord {
                record: Self::NAME,
                expected: Self::WIRE_SIZE,
                actual: bytes.len(),
            });
        }
        Self::decode_from(&mut WireReader::new(Self::NAME, bytes))
    }
}

/// A process visible to the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub id: u64,
    pub module_path: PathString,
}

impl ProcessEntry {
    pub fn new(id: u64, module_path: &str) -> Self {
        Self {
            id,
            module_path: PathString::new(module_path),
        }
    }
}

impl Record for ProcessEntry {
    const NAME: &'static str = "ProcessEntry";
    const WIRE_SIZE: usize = 8 + PathString::WIRE_SIZE;

    fn encode_into(&self, w: &mut WireWriter) {
        w.put_u64(self.id);
        self.module_path.encode_into(w);
    }

    fn decode_from(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            id: r.u64()?,
            module_path: PathString::decode_from(r)?,
        })
    }
}

/// A region of the target's address space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionEntry {
    pub base_address: Handle,
    pub size: u64,
    pub section_type: SectionType,
    pub category: SectionCategory,
    pub protection: SectionProtection,
    pub name: SectionName,
    pub module_path: PathString,
}

impl Record for SectionEntry {
    const NAME: &'static str = "SectionEntry";
    const WIRE_SIZE: usize = 8 + 8 + 4 + 4 + 4 + SectionName::WIRE_SIZE + PathString::WIRE_SIZE;

    fn encode_into(&self, w: &mut WireWriter) {
        w.put_handle(self.base_address);
        w.put_u64(self.size);
        w.put_u32(self.section_type.to_wire());
        w.put_u32(self.category.to_wire());
        w.put_u32(self.protection.to_wire());
        self.name.encode_into(w);
        self.module_path.encode_into(w);
    }

    fn decode_from(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            base_address: r.handle()?,
            size: r.u64()?,
            section_type: SectionType::from_wire(r.u32()?)?,
            category: SectionCategory::from_wire(r.u32()?)?,
            protection: SectionProtection::from_wire(r.u32()?)?,
            name: SectionName::decode_from(r)?,
            module_path: PathString::decode_from(r)?,
        })
    }
}

/// A module (image) mapped into the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleEntry {
    pub base_address: Handle,
    pub size: u64,
    pub path: PathString,
}

impl Record for ModuleEntry {
    const NAME: &'static str = "ModuleEntry";
    const WIRE_SIZE: usize = 8 + 8 + PathString::WIRE_SIZE;

    fn encode_into(&self, w: &mut WireWriter) {
        w.put_handle(self.base_address);
        w.put_u64(self.size);
        self.path.encode_into(w);
    }

    fn decode_from(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            base_address: r.handle()?,
            size: r.u64()?,
            path: PathString::decode_from(r)?,
        })
    }
}

/// A thread of the target, as the provider sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadEntry {
    pub handle: Handle,
    pub thread_id: u64,
}

impl Record for ThreadEntry {
    const NAME: &'static str = "ThreadEntry";
    const WIRE_SIZE: usize = 16;

    fn encode_into(&self, w: &mut WireWriter) {
        w.put_handle(self.handle);
        w.put_u64(self.thread_id);
    }

    fn decode_from(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            handle: r.handle()?,
            thread_id: r.u64()?,
        })
    }
}

/// Longest x86 instruction
pub const MAX_INSTRUCTION_LENGTH: usize = 15;

/// One decoded instruction.
///
/// `length == 0` marks a failed decode; check [`InstructionRecord::is_valid`]
/// before trusting `raw_bytes` or `mnemonic`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionRecord {
    pub length: i32,
    pub raw_bytes: [u8; MAX_INSTRUCTION_LENGTH],
    pub mnemonic: MnemonicString,
}

impl InstructionRecord {
    /// Build a record from the instruction's bytes; `bytes` longer than 15
    /// are cut to 15.
    pub fn new(bytes: &[u8], mnemonic: &str) -> Self {
        let length = bytes.len().min(MAX_INSTRUCTION_LENGTH);
        let mut raw_bytes = [0u8; MAX_INSTRUCTION_LENGTH];
        raw_bytes[..length].copy_from_slice(&bytes[..length]);
        Self {
            length: length as i32,
            raw_bytes,
            mnemonic: MnemonicString::new(mnemonic),
        }
    }

    /// The soft-failure marker returned when no decode rule matches
    pub fn unsupported(placeholder: &str) -> Self {
        Self {
            length: 0,
            raw_bytes: [0u8; MAX_INSTRUCTION_LENGTH],
            mnemonic: MnemonicString::new(placeholder),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.length > 0 && self.length as usize <= MAX_INSTRUCTION_LENGTH
    }

    /// The meaningful prefix of `raw_bytes`
    pub fn bytes(&self) -> &[u8] {
        let len = self.length.clamp(0, MAX_INSTRUCTION_LENGTH as i32) as usize;
        &self.raw_bytes[..len]
    }
}

impl Record for InstructionRecord {
    const NAME: &'static str = "InstructionRecord";
    const WIRE_SIZE: usize = 4 + MAX_INSTRUCTION_LENGTH + MnemonicString::WIRE_SIZE;

    fn encode_into(&self, w: &mut WireWriter) {
        w.put_i32(self.length);
        w.put_bytes(&self.raw_bytes);
        self.mnemonic.encode_into(w);
    }

    fn decode_from(r: &mut WireReader<'_>) -> Result<Self> {
        let length = r.i32()?;
        if !(0..=MAX_INSTRUCTION_LENGTH as i32).contains(&length) {
            return Err(ProtocolError::InvalidLength {
                field: "instruction length",
                length: length as i64,
            });
        }
        Ok(Self {
            length,
            raw_bytes: r.bytes()?,
            mnemonic: MnemonicString::decode_from(r)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn text_section() -> SectionEntry {
        SectionEntry {
            base_address: Handle::from_raw(0x10000),
            size: 0x2000,
            section_type: SectionType::Image,
            category: SectionCategory::Code,
            protection: SectionProtection::READ | SectionProtection::EXECUTE,
            name: ".text".into(),
            module_path: "C:\\app.exe".into(),
        }
    }

    fn assert_truncation_safe<R: Record + std::fmt::Debug>(bytes: &[u8]) {
        assert_eq!(bytes.len(), R::WIRE_SIZE);
        for len in 0..R::WIRE_SIZE {
            let err = R::decode(&bytes[..len]).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::TruncatedRecord, "len {len}");
        }
    }

    #[test]
    fn test_wire_sizes() {
        assert_eq!(ProcessEntry::WIRE_SIZE, 528);
        assert_eq!(SectionEntry::WIRE_SIZE, 580);
        assert_eq!(ModuleEntry::WIRE_SIZE, 536);
        assert_eq!(InstructionRecord::WIRE_SIZE, 147);
        assert_eq!(ThreadEntry::WIRE_SIZE, 16);
    }

    #[test]
    fn test_process_entry_layout() {
        let entry = ProcessEntry::new(4321, "C:\\app.exe");
        let bytes = entry.encode();
        assert_eq!(&bytes[..8], &4321u64.to_le_bytes());
        assert_eq!(&bytes[8..10], &[b'C', 0]);
        assert_eq!(ProcessEntry::decode(&bytes).unwrap(), entry);
        assert_truncation_safe::<ProcessEntry>(&bytes);
    }

    #[test]
    fn test_section_entry_round_trip() {
        let section = text_section();
        let bytes = section.encode();
        assert_eq!(&bytes[16..20], &3u32.to_le_bytes());
        assert_eq!(&bytes[24..28], &5u32.to_le_bytes());
        assert_eq!(SectionEntry::decode(&bytes).unwrap(), section);
        assert_truncation_safe::<SectionEntry>(&bytes);
    }

    #[test]
    fn test_section_entry_rejects_bad_enums() {
        let bytes = text_section().encode();
        for (offset, bad) in [(16usize, 4u32), (20, 9), (24, 0x10)] {
            let mut corrupt = bytes.clone();
            corrupt[offset..offset + 4].copy_from_slice(&bad.to_le_bytes());
            let err = SectionEntry::decode(&corrupt).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidEnumValue);
        }
    }

    #[test]
    fn test_module_entry_round_trip() {
        let module = ModuleEntry {
            base_address: Handle::from_raw(0x7ff0_0000_0000),
            size: 0x1_8000,
            path: "C:\\Windows\\System32\\ntdll.dll".into(),
        };
        let bytes = module.encode();
        assert_eq!(ModuleEntry::decode(&bytes).unwrap(), module);
        assert_truncation_safe::<ModuleEntry>(&bytes);
    }

    #[test]
    fn test_instruction_record() {
        for len in 1..=15usize {
            let raw: Vec<u8> = (0..len as u8).collect();
            let record = InstructionRecord::new(&raw, "nop");
            assert!(record.is_valid());
            assert_eq!(record.bytes(), raw.as_slice());
            let bytes = record.encode();
            assert_eq!(InstructionRecord::decode(&bytes).unwrap(), record);
        }
        assert_truncation_safe::<InstructionRecord>(&InstructionRecord::new(&[0x90], "nop").encode());
    }

    #[test]
    fn test_instruction_record_rejects_bad_length() {
        let mut bytes = InstructionRecord::new(&[0x90], "nop").encode();
        bytes[..4].copy_from_slice(&16i32.to_le_bytes());
        assert_eq!(
            InstructionRecord::decode(&bytes).unwrap_err().kind(),
            ErrorKind::InvalidLength
        );
        bytes[..4].copy_from_slice(&(-1i32).to_le_bytes());
        assert!(InstructionRecord::decode(&bytes).is_err());
    }

    #[test]
    fn test_unsupported_marker() {
        let marker = InstructionRecord::unsupported("(bad)");
        assert!(!marker.is_valid());
        assert!(marker.bytes().is_empty());
        assert_eq!(InstructionRecord::decode(&marker.encode()).unwrap(), marker);
    }
}
