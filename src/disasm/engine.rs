//! Disassembly Engine - iced-x86 backend
//!
//! Decodes one instruction at a time into the fixed [`InstructionRecord`]
//! layout. The origin address only influences the rendered text (branch
//! targets, RIP-relative operands).

use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, IntelFormatter};

use crate::error::{ProtocolError, Result};
use crate::protocol::{Architecture, InstructionRecord, MAX_INSTRUCTION_LENGTH};

/// Mnemonic placed in records that failed to decode
pub const UNSUPPORTED_PLACEHOLDER: &str = "(bad)";

/// Single-instruction decoder for one target architecture
#[derive(Debug, Clone, Copy)]
pub struct DisassemblyEngine {
    /// Target architecture bitness
    arch: Architecture,
}

impl DisassemblyEngine {
    pub fn new(arch: Architecture) -> Self {
        Self { arch }
    }

    /// Decode the first instruction in `bytes`.
    ///
    /// Fails with `UnsupportedInstruction` when no instruction can be decoded
    /// from the input (invalid opcode, too few bytes, empty input).
    pub fn decode(&self, bytes: &[u8], address: u64) -> Result<InstructionRecord> {
        let window = &bytes[..bytes.len().min(MAX_INSTRUCTION_LENGTH)];
        let mut decoder = Decoder::with_ip(self.arch.bitness(), window, address, DecoderOptions::NONE);
        if !decoder.can_decode() {
            return Err(ProtocolError::UnsupportedInstruction { address });
        }

        let mut instr = Instruction::default();
        decoder.decode_out(&mut instr);
        if instr.is_invalid() {
            return Err(ProtocolError::UnsupportedInstruction { address });
        }

        let length = instr.len();
        Ok(InstructionRecord::new(&window[..length], &self.render(&instr)))
    }

    /// Decode, turning failures into the zero-length marker record
    pub fn decode_or_marker(&self, bytes: &[u8], address: u64) -> InstructionRecord {
        self.decode(bytes, address).unwrap_or_else(|e| {
            log::debug!("{}", e);
            InstructionRecord::unsupported(UNSUPPORTED_PLACEHOLDER)
        })
    }

    /// Intel syntax, e.g. `mov eax, [ebx+4]`
    fn render(&self, instr: &Instruction) -> String {
        let mut text = String::new();
        IntelFormatter::new().format(instr, &mut text);
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    /// push rbp; mov rbp, rsp; mov eax, 42; pop rbp; ret
    const SIMPLE_FUNC: &[u8] = &[
        0x55, 0x48, 0x89, 0xe5, 0xb8, 0x2a, 0x00, 0x00, 0x00, 0x5d, 0xc3,
    ];

    #[test]
    fn test_decode_single() {
        let engine = DisassemblyEngine::new(Architecture::X64);
        let record = engine.decode(&[0x90, 0xcc], 0x1000).unwrap();
        assert_eq!(record.length, 1);
        assert_eq!(record.bytes(), &[0x90]);
        assert_eq!(record.mnemonic, "nop");

        let record = engine.decode(&SIMPLE_FUNC[1..], 0x1001).unwrap();
        assert_eq!(record.length, 3);
        assert!(record.mnemonic.as_str().starts_with("mov"));
        assert!(record.mnemonic.as_str().contains("rbp"));
    }

    #[test]
    fn test_origin_only_changes_text() {
        let engine = DisassemblyEngine::new(Architecture::X64);
        let call = [0xe8, 0x00, 0x00, 0x00, 0x00];
        let a = engine.decode(&call, 0x1000).unwrap();
        let b = engine.decode(&call, 0x2000).unwrap();
        assert_eq!(a.length, 5);
        assert_eq!(a.bytes(), b.bytes());
        assert_ne!(a.mnemonic, b.mnemonic);
        assert_eq!(engine.decode(&call, 0x1000).unwrap(), a);
    }

    #[test]
    fn test_unsupported_bytes() {
        let engine = DisassemblyEngine::new(Architecture::X64);
        // push es does not exist in 64-bit mode
        let err = engine.decode(&[0x06], 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedInstruction);
        assert!(engine.decode(&[], 0).is_err());
        assert!(engine.decode(&[0x48], 0).is_err());

        let marker = engine.decode_or_marker(&[0x06], 0);
        assert_eq!(marker.length, 0);
        assert_eq!(marker.mnemonic, UNSUPPORTED_PLACEHOLDER);

        // ...but it does in 32-bit mode
        let engine = DisassemblyEngine::new(Architecture::X86);
        assert_eq!(engine.decode(&[0x06], 0).unwrap().mnemonic, "push es");
    }
}
