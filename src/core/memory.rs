//! Memory - /proc based memory access and region parsing
//!
//! `/proc/<pid>/maps` parsing is plain text processing and works on any
//! platform; the reads and writes through `/proc/<pid>/mem` are Linux only.

use thiserror::Error;

use crate::protocol::{Handle, SectionCategory, SectionEntry, SectionProtection, SectionType};

/// Memory operation errors
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Failed to read memory at {address:#x}: {reason}")]
    ReadFailed { address: u64, reason: String },

    #[error("Failed to write memory at {address:#x}: {reason}")]
    WriteFailed { address: u64, reason: String },

    #[error("Short transfer at {address:#x}: {done} of {wanted} bytes")]
    ShortTransfer { address: u64, done: usize, wanted: usize },

    #[error("Malformed maps line: {0}")]
    MalformedMap(String),
}

/// One line of `/proc/<pid>/maps`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    pub start: u64,
    pub end: u64,
    pub protection: SectionProtection,
    /// `p` (copy-on-write) as opposed to `s`
    pub private: bool,
    pub offset: u64,
    pub inode: u64,
    /// File path or pseudo name such as `[heap]`; empty for anonymous memory
    pub path: String,
}

impl MapEntry {
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    fn is_file_backed(&self) -> bool {
        self.inode != 0 && self.path.starts_with('/')
    }

    pub fn section_type(&self) -> SectionType {
        if self.is_file_backed() {
            if self.private {
                SectionType::Image
            } else {
                SectionType::Mapped
            }
        } else if self.private {
            SectionType::Private
        } else {
            SectionType::Mapped
        }
    }

    pub fn category(&self) -> SectionCategory {
        if self.path == "[heap]" {
            SectionCategory::Heap
        } else if self.protection.contains(SectionProtection::EXECUTE) {
            SectionCategory::Code
        } else if self.is_file_backed() {
            SectionCategory::Data
        } else {
            SectionCategory::Unknown
        }
    }

    /// Protocol view. File-backed regions carry their path as module path;
    /// pseudo regions (`[stack]`, `[vdso]`) use it as the section name.
    pub fn to_section(&self) -> SectionEntry {
        let (name, module_path) = if self.is_file_backed() {
            let name = std::path::Path::new(&self.path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            (name, self.path.clone())
        } else {
            (self.path.clone(), String::new())
        };
        SectionEntry {
            base_address: Handle::from_raw(self.start),
            size: self.size(),
            section_type: self.section_type(),
            category: self.category(),
            protection: self.protection,
            name: name.as_str().into(),
            module_path: module_path.as_str().into(),
        }
    }
}

fn parse_hex(field: &str, line: &str) -> Result<u64, MemoryError> {
    u64::from_str_radix(field, 16).map_err(|_| MemoryError::MalformedMap(line.to_string()))
}

fn parse_line(line: &str) -> Result<MapEntry, MemoryError> {
    let malformed = || MemoryError::MalformedMap(line.to_string());

    // address perms offset dev inode [path]; the path may contain spaces
    let mut fields = line.splitn(6, ' ');
    let range = fields.next().ok_or_else(malformed)?;
    let perms = fields.next().ok_or_else(malformed)?;
    let offset = fields.next().ok_or_else(malformed)?;
    let _dev = fields.next().ok_or_else(malformed)?;
    let inode = fields.next().ok_or_else(malformed)?;
    let path = fields.next().unwrap_or("").trim_start().to_string();

    let (start, end) = range.split_once('-').ok_or_else(malformed)?;
    let perms = perms.as_bytes();
    if perms.len() != 4 {
        return Err(malformed());
    }

    let mut protection = SectionProtection::NO_ACCESS;
    if perms[0] == b'r' {
        protection |= SectionProtection::READ;
    }
    if perms[1] == b'w' {
        protection |= SectionProtection::WRITE;
    }
    if perms[2] == b'x' {
        protection |= SectionProtection::EXECUTE;
    }

    Ok(MapEntry {
        start: parse_hex(start, line)?,
        end: parse_hex(end, line)?,
        protection,
        private: perms[3] == b'p',
        offset: parse_hex(offset, line)?,
        inode: inode.parse().map_err(|_| malformed())?,
        path,
    })
}

/// Parse the contents of a maps file
pub fn parse_maps(text: &str) -> Result<Vec<MapEntry>, MemoryError> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_line)
        .collect()
}

/// Collapse the mappings of each file into one module (lowest base to
/// highest end)
pub fn modules_from_maps(maps: &[MapEntry]) -> Vec<(u64, u64, String)> {
    let mut modules: Vec<(u64, u64, String)> = Vec::new();
    for entry in maps.iter().filter(|e| e.is_file_backed()) {
        match modules.iter_mut().find(|(_, _, path)| *path == entry.path) {
            Some((start, end, _)) => {
                *start = (*start).min(entry.start);
                *end = (*end).max(entry.end);
            }
            None => modules.push((entry.start, entry.end, entry.path.clone())),
        }
    }
    modules
}

#[cfg(target_os = "linux")]
pub fn read_maps(pid: u32) -> Result<Vec<MapEntry>, MemoryError> {
    let text = std::fs::read_to_string(format!("/proc/{}/maps", pid)).map_err(|e| {
        MemoryError::ReadFailed {
            address: 0,
            reason: e.to_string(),
        }
    })?;
    parse_maps(&text)
}

/// Read `size` bytes of another process through `/proc/<pid>/mem`
#[cfg(target_os = "linux")]
pub fn read_process(pid: u32, address: u64, size: usize) -> Result<Vec<u8>, MemoryError> {
    use std::fs::File;
    use std::os::unix::fs::FileExt;

    let file = File::open(format!("/proc/{}/mem", pid)).map_err(|e| MemoryError::ReadFailed {
        address,
        reason: e.to_string(),
    })?;

    let mut buffer = vec![0u8; size];
    let bytes_read = file
        .read_at(&mut buffer, address)
        .map_err(|e| MemoryError::ReadFailed {
            address,
            reason: e.to_string(),
        })?;
    if bytes_read != size {
        return Err(MemoryError::ShortTransfer {
            address,
            done: bytes_read,
            wanted: size,
        });
    }
    Ok(buffer)
}

#[cfg(target_os = "linux")]
pub fn write_process(pid: u32, address: u64, data: &[u8]) -> Result<(), MemoryError> {
    use std::fs::OpenOptions;
    use std::os::unix::fs::FileExt;

    let file = OpenOptions::new()
        .write(true)
        .open(format!("/proc/{}/mem", pid))
        .map_err(|e| MemoryError::WriteFailed {
            address,
            reason: e.to_string(),
        })?;

    let bytes_written = file
        .write_at(data, address)
        .map_err(|e| MemoryError::WriteFailed {
            address,
            reason: e.to_string(),
        })?;
    if bytes_written != data.len() {
        return Err(MemoryError::ShortTransfer {
            address,
            done: bytes_written,
            wanted: data.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
55d0c8a00000-55d0c8a02000 r--p 00000000 08:01 1311 /usr/bin/cat
55d0c8a02000-55d0c8a07000 r-xp 00002000 08:01 1311 /usr/bin/cat
55d0ca1e5000-55d0ca206000 rw-p 00000000 00:00 0          [heap]
7f1c2a000000-7f1c2a021000 rw-s 00000000 00:05 42         /dev/shm/my region
7ffd5e6b1000-7ffd5e6d2000 rw-p 00000000 00:00 0          [stack]
7ffd5e7f0000-7ffd5e7f1000 ---p 00000000 00:00 0
";

    #[test]
    fn test_parse_maps() {
        let maps = parse_maps(MAPS).unwrap();
        assert_eq!(maps.len(), 6);

        assert_eq!(maps[1].start, 0x55d0c8a02000);
        assert_eq!(maps[1].size(), 0x5000);
        assert_eq!(maps[1].protection, SectionProtection::READ | SectionProtection::EXECUTE);
        assert_eq!(maps[1].offset, 0x2000);
        assert_eq!(maps[3].path, "/dev/shm/my region");
        assert!(!maps[3].private);
        assert!(maps[5].protection.is_no_access());
        assert_eq!(maps[5].path, "");
    }

    #[test]
    fn test_classification() {
        let maps = parse_maps(MAPS).unwrap();
        let sections: Vec<SectionEntry> = maps.iter().map(MapEntry::to_section).collect();

        assert_eq!(sections[0].section_type, SectionType::Image);
        assert_eq!(sections[0].category, SectionCategory::Data);
        assert_eq!(sections[1].category, SectionCategory::Code);
        assert_eq!(sections[1].name, "cat");
        assert_eq!(sections[1].module_path, "/usr/bin/cat");
        assert_eq!(sections[2].category, SectionCategory::Heap);
        assert_eq!(sections[2].section_type, SectionType::Private);
        assert_eq!(sections[2].name, "[heap]");
        assert_eq!(sections[3].section_type, SectionType::Mapped);
        assert_eq!(sections[5].category, SectionCategory::Unknown);
    }

    #[test]
    fn test_modules_merge_mappings() {
        let maps = parse_maps(MAPS).unwrap();
        let modules = modules_from_maps(&maps);
        assert_eq!(modules.len(), 2);
        assert_eq!(modules[0], (0x55d0c8a00000, 0x55d0c8a07000, "/usr/bin/cat".to_string()));
    }

    #[test]
    fn test_malformed_line() {
        assert!(matches!(
            parse_maps("not a maps line"),
            Err(MemoryError::MalformedMap(_))
        ));
        assert!(parse_maps("0-1 rw 0 00:00 0").is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_read_own_memory() {
        let value: u64 = 0x1122_3344_5566_7788;
        let address = &value as *const u64 as u64;
        let bytes = read_process(std::process::id(), address, 8).unwrap();
        assert_eq!(bytes, value.to_le_bytes());
    }
}
