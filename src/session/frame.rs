//! Frame codec
//!
//! ```text
//! ┌──────────────┐
//! │ magic: u32   │  <- 0x42505250 "PRPB"
//! │ opcode: u16  │  <- operation tag
//! │ status: u16  │  <- 0 = ok, otherwise an ErrorKind code
//! │ length: u32  │  <- payload size in bytes
//! │ payload...   │
//! └──────────────┘
//! ```

use std::io::{self, Read, Write};

use super::Opcode;
use crate::error::{ErrorKind, ProtocolError, Result};
use crate::protocol::{WireReader, WireWriter};

/// "PRPB" read as a little-endian u32
pub const FRAME_MAGIC: u32 = u32::from_le_bytes(*b"PRPB");

/// Frame header size in bytes
pub const HEADER_SIZE: usize = 12; // magic + opcode + status + length

/// Frame header (12 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub opcode: Opcode,
    pub status: u16,
    pub length: u32,
}

impl FrameHeader {
    /// Serialize header to bytes (little-endian)
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&FRAME_MAGIC.to_le_bytes());
        bytes[4..6].copy_from_slice(&(self.opcode as u16).to_le_bytes());
        bytes[6..8].copy_from_slice(&self.status.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.length.to_le_bytes());
        bytes
    }

    /// Parse and validate a header against the payload limit
    pub fn from_bytes(bytes: &[u8; HEADER_SIZE], max_payload: usize) -> Result<Self> {
        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != FRAME_MAGIC {
            return Err(ProtocolError::TransportFailure(format!(
                "bad frame magic {:#010x}",
                magic
            )));
        }
        let code = u16::from_le_bytes([bytes[4], bytes[5]]);
        let opcode = Opcode::from_code(code).ok_or_else(|| {
            ProtocolError::TransportFailure(format!("unknown opcode {:#06x}", code))
        })?;
        let status = u16::from_le_bytes([bytes[6], bytes[7]]);
        let length = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        if length as usize > max_payload {
            return Err(ProtocolError::TransportFailure(format!(
                "frame payload of {} bytes exceeds limit of {}",
                length, max_payload
            )));
        }
        Ok(Self {
            opcode,
            status,
            length,
        })
    }
}

/// A complete frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub status: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn ok(opcode: Opcode, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            status: 0,
            payload,
        }
    }

    pub fn empty(opcode: Opcode) -> Self {
        Self::ok(opcode, Vec::new())
    }

    /// Error response: the kind travels in `status`, the message as text
    pub fn error(opcode: Opcode, err: &ProtocolError) -> Self {
        let message = match err {
            ProtocolError::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        };
        let mut w = WireWriter::new();
        w.put_text(&message);
        Self {
            opcode,
            status: err.kind() as u16,
            payload: w.into_bytes(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status != 0
    }

    /// Turn an error frame back into the error it reports
    pub fn to_error(&self) -> ProtocolError {
        let kind = ErrorKind::from_code(self.status).unwrap_or(ErrorKind::TransportFailure);
        let message = WireReader::new("error frame", &self.payload)
            .text()
            .unwrap_or_default();
        ProtocolError::Remote { kind, message }
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let header = FrameHeader {
            opcode: self.opcode,
            status: self.status,
            length: u32::try_from(self.payload.len()).map_err(|_| ProtocolError::InvalidLength {
                field: "frame payload",
                length: self.payload.len() as i64,
            })?,
        };
        // One write per frame so concurrent writers never interleave halves
        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        bytes.extend_from_slice(&header.to_bytes());
        bytes.extend_from_slice(&self.payload);
        writer.write_all(&bytes)?;
        writer.flush()?;
        log::trace!("-> {} status={} len={}", self.opcode, self.status, self.payload.len());
        Ok(())
    }

    /// Read one frame. A clean end of stream before the header is
    /// `SessionClosed`; anything cut short after that is a transport failure.
    pub fn read_from<R: Read>(reader: &mut R, max_payload: usize) -> Result<Self> {
        let mut header = [0u8; HEADER_SIZE];
        let mut filled = 0;
        while filled < HEADER_SIZE {
            match reader.read(&mut header[filled..]) {
                Ok(0) if filled == 0 => return Err(ProtocolError::SessionClosed),
                Ok(0) => {
                    return Err(ProtocolError::TransportFailure(
                        "connection closed inside a frame header".into(),
                    ))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        let header = FrameHeader::from_bytes(&header, max_payload)?;
        let mut payload = vec![0u8; header.length as usize];
        reader.read_exact(&mut payload).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => {
                ProtocolError::TransportFailure("connection closed inside a frame".into())
            }
            _ => e.into(),
        })?;
        log::trace!("<- {} status={} len={}", header.opcode, header.status, payload.len());
        Ok(Self {
            opcode: header.opcode,
            status: header.status,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Handle;
    use std::io::Cursor;

    const LIMIT: usize = 1024;

    #[test]
    fn test_header_layout() {
        let header = FrameHeader {
            opcode: Opcode::SetBreakpoint,
            status: 6,
            length: 0x0102,
        };
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], b"PRPB");
        assert_eq!(&bytes[4..], &[0x0d, 0x00, 0x06, 0x00, 0x02, 0x01, 0x00, 0x00]);
        assert_eq!(FrameHeader::from_bytes(&bytes, LIMIT).unwrap(), header);
    }

    #[test]
    fn test_frame_over_a_stream() {
        let mut buf = Vec::new();
        Frame::ok(Opcode::ReadMemory, vec![1, 2, 3]).write_to(&mut buf).unwrap();
        Frame::empty(Opcode::EndOfStream).write_to(&mut buf).unwrap();

        let mut cursor = Cursor::new(buf);
        let first = Frame::read_from(&mut cursor, LIMIT).unwrap();
        assert_eq!(first.payload, vec![1, 2, 3]);
        assert_eq!(Frame::read_from(&mut cursor, LIMIT).unwrap().opcode, Opcode::EndOfStream);
        assert_eq!(
            Frame::read_from(&mut cursor, LIMIT).unwrap_err().kind(),
            ErrorKind::SessionClosed
        );
    }

    #[test]
    fn test_bad_frames() {
        let mut bytes = Frame::ok(Opcode::Hello, vec![0; 8]).to_vec();
        bytes.truncate(HEADER_SIZE + 4);
        let err = Frame::read_from(&mut Cursor::new(bytes), LIMIT).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportFailure);

        let err = Frame::read_from(&mut Cursor::new(vec![0u8; 5]), LIMIT).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportFailure);

        let mut bytes = Frame::empty(Opcode::Hello).to_vec();
        bytes[0] = b'X';
        assert!(Frame::read_from(&mut Cursor::new(bytes), LIMIT).is_err());

        let bytes = Frame::ok(Opcode::WriteMemory, vec![0; LIMIT + 1]).to_vec();
        let err = Frame::read_from(&mut Cursor::new(bytes), LIMIT).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportFailure);
    }

    #[test]
    fn test_error_frames_carry_kind() {
        let frame = Frame::error(
            Opcode::EnumerateSections,
            &ProtocolError::InvalidHandle(Handle::from_raw(0x1000)),
        );
        assert!(frame.is_error());
        let err = frame.to_error();
        assert_eq!(err.kind(), ErrorKind::InvalidHandle);
        assert!(err.to_string().contains("0x1000"));
    }

    impl Frame {
        fn to_vec(&self) -> Vec<u8> {
            let mut buf = Vec::new();
            self.write_to(&mut buf).unwrap();
            buf
        }
    }
}
