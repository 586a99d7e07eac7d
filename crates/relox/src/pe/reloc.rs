//! Base-relocation directory: parsing, in-place editing, rebuilding.
//!
//! The on-disk format is a sequence of blocks.  Each block is an 8-byte
//! header -- page RVA, then total block size including the header -- followed
//! by 16-bit entries whose high 4 bits carry the fixup type and whose low
//! 12 bits carry the offset within the 4 KiB page.  Blocks are 4-byte
//! aligned by construction because writers pad odd entry counts with a
//! type-0 entry.

use super::parser::{read_u16, read_u32, PeError, PeFile, DIRECTORY_ENTRY_BASERELOC};

/// IMAGE_REL_BASED_ABSOLUTE -- a no-op pad entry.
pub const REL_BASED_ABSOLUTE: u16 = 0;
/// IMAGE_REL_BASED_HIGHLOW -- full 32-bit fixup; the only kind this crate
/// understands or emits.
pub const REL_BASED_HIGHLOW: u16 = 3;

/// Extract the fixup type (high 4 bits) from a raw entry.
pub fn entry_type(entry: u16) -> u16 {
    entry >> 12
}

/// Extract the page-relative offset (low 12 bits) from a raw entry.
pub fn entry_offset(entry: u16) -> u16 {
    entry & 0x0FFF
}

/// Compose a raw entry from a fixup type and a page-relative offset.
pub fn make_entry(fixup_type: u16, offset: u16) -> u16 {
    (fixup_type << 12) | (offset & 0x0FFF)
}

/// One 4 KiB-page group of fixups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocBlock {
    /// Page RVA the entry offsets are relative to.
    pub page_rva: u32,
    /// Raw 16-bit entries, pads included.
    pub entries: Vec<u16>,
}

impl RelocBlock {
    /// Total serialized size: the 8-byte header plus two bytes per entry.
    pub fn size_of_block(&self) -> u32 {
        8 + (self.entries.len() as u32) * 2
    }
}

/// The parsed base-relocation directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelocDirectory {
    pub blocks: Vec<RelocBlock>,
}

impl RelocDirectory {
    /// Read the directory out of a parsed image.
    ///
    /// Fails with [`PeError::MissingRelocDirectory`] when the data-directory
    /// slot is empty and with [`PeError::TruncatedFile`] when a block header
    /// lies or runs past the directory extent.
    pub fn read_from(pe: &PeFile) -> Result<RelocDirectory, PeError> {
        let dir = pe.directory(DIRECTORY_ENTRY_BASERELOC);
        if dir.virtual_address == 0 || dir.size == 0 {
            return Err(PeError::MissingRelocDirectory);
        }
        let start = pe
            .rva_to_offset(dir.virtual_address)
            .ok_or(PeError::MissingRelocDirectory)?;
        let end = start
            .checked_add(dir.size as usize)
            .ok_or(PeError::TruncatedFile)?;
        if end > pe.data.len() {
            return Err(PeError::TruncatedFile);
        }

        let mut blocks = Vec::new();
        let mut cursor = start;
        while cursor + 8 <= end {
            let page_rva = read_u32(&pe.data, cursor)?;
            let size_of_block = read_u32(&pe.data, cursor + 4)? as usize;
            // A zero-sized block terminates the walk; anything shorter than
            // its own header is malformed.
            if size_of_block == 0 {
                break;
            }
            if size_of_block < 8 || cursor + size_of_block > end {
                return Err(PeError::TruncatedFile);
            }

            let entry_count = (size_of_block - 8) / 2;
            let mut entries = Vec::with_capacity(entry_count);
            for i in 0..entry_count {
                entries.push(read_u16(&pe.data, cursor + 8 + i * 2)?);
            }
            blocks.push(RelocBlock { page_rva, entries });
            cursor += size_of_block;
        }

        Ok(RelocDirectory { blocks })
    }

    /// Number of relocation blocks.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Total entry count across all blocks, pads included.
    pub fn entry_count(&self) -> usize {
        self.blocks.iter().map(|b| b.entries.len()).sum()
    }

    /// Drop every block, leaving an empty directory.
    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    /// Append an empty block for `page_rva` and return its index.
    pub fn add_block(&mut self, page_rva: u32) -> usize {
        self.blocks.push(RelocBlock {
            page_rva,
            entries: Vec::new(),
        });
        self.blocks.len() - 1
    }

    /// Append a raw 16-bit entry to the block at `index`.
    pub fn add_entry(&mut self, index: usize, entry: u16) {
        if let Some(block) = self.blocks.get_mut(index) {
            block.entries.push(entry);
        }
    }

    /// Serialized size of the whole directory in bytes.
    pub fn size_bytes(&self) -> usize {
        self.blocks.iter().map(|b| b.size_of_block() as usize).sum()
    }

    /// Serialize every block into `out` in order.
    pub fn rebuild(&self, out: &mut Vec<u8>) {
        out.reserve(self.size_bytes());
        for block in &self.blocks {
            out.extend_from_slice(&block.page_rva.to_le_bytes());
            out.extend_from_slice(&block.size_of_block().to_le_bytes());
            for &entry in &block.entries {
                out.extend_from_slice(&entry.to_le_bytes());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pe::testimage::build_minimal_pe32;

    #[test]
    fn read_directory_from_test_image() {
        let pe = PeFile::parse(build_minimal_pe32()).expect("parse");
        let dir = RelocDirectory::read_from(&pe).expect("read reloc dir");
        assert_eq!(dir.block_count(), 1);
        assert_eq!(dir.blocks[0].page_rva, 0x1000);
        assert_eq!(dir.blocks[0].entries.len(), 2);
        assert_eq!(entry_type(dir.blocks[0].entries[0]), REL_BASED_HIGHLOW);
        assert_eq!(entry_offset(dir.blocks[0].entries[0]), 0x010);
        assert_eq!(dir.blocks[0].entries[1], 0);
    }

    #[test]
    fn missing_directory_is_an_error() {
        let mut data = build_minimal_pe32();
        // Zero the basereloc data-directory entry.
        let dd_base = 0x80 + 4 + 20 + 96;
        for b in &mut data[dd_base + 5 * 8..dd_base + 5 * 8 + 8] {
            *b = 0;
        }
        let pe = PeFile::parse(data).expect("parse");
        assert_eq!(
            RelocDirectory::read_from(&pe).unwrap_err(),
            PeError::MissingRelocDirectory
        );
    }

    #[test]
    fn undersized_block_is_malformed() {
        let mut data = build_minimal_pe32();
        // SizeOfBlock = 4 (< 8): malformed.
        crate::pe::testimage::put_u32(&mut data, 0x804, 4);
        let pe = PeFile::parse(data).expect("parse");
        assert_eq!(
            RelocDirectory::read_from(&pe).unwrap_err(),
            PeError::TruncatedFile
        );
    }

    #[test]
    fn rebuild_round_trips_the_wire_form() {
        let pe = PeFile::parse(build_minimal_pe32()).expect("parse");
        let dir = RelocDirectory::read_from(&pe).expect("read");
        let mut out = Vec::new();
        dir.rebuild(&mut out);
        // The test image's directory occupies exactly 12 bytes at file
        // offset 0x800.
        assert_eq!(out.len(), 12);
        assert_eq!(out, &pe.data[0x800..0x80C]);
    }

    #[test]
    fn build_directory_by_hand() {
        let mut dir = RelocDirectory::default();
        let b = dir.add_block(0x5000);
        dir.add_entry(b, make_entry(REL_BASED_HIGHLOW, 0x123));
        dir.add_entry(b, make_entry(REL_BASED_HIGHLOW, 0x456));
        assert_eq!(dir.block_count(), 1);
        assert_eq!(dir.entry_count(), 2);
        assert_eq!(dir.blocks[0].size_of_block(), 12);

        let mut out = Vec::new();
        dir.rebuild(&mut out);
        assert_eq!(out.len(), 12);
        assert_eq!(u32::from_le_bytes([out[0], out[1], out[2], out[3]]), 0x5000);
        assert_eq!(u32::from_le_bytes([out[4], out[5], out[6], out[7]]), 12);
        assert_eq!(u16::from_le_bytes([out[8], out[9]]), 0x3123);
        assert_eq!(u16::from_le_bytes([out[10], out[11]]), 0x3456);
    }

    #[test]
    fn clear_empties_the_directory() {
        let pe = PeFile::parse(build_minimal_pe32()).expect("parse");
        let mut dir = RelocDirectory::read_from(&pe).expect("read");
        dir.clear();
        assert_eq!(dir.block_count(), 0);
        assert_eq!(dir.entry_count(), 0);
        let mut out = Vec::new();
        dir.rebuild(&mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn entry_helpers() {
        let e = make_entry(REL_BASED_HIGHLOW, 0xABC);
        assert_eq!(e, 0x3ABC);
        assert_eq!(entry_type(e), 3);
        assert_eq!(entry_offset(e), 0xABC);
        // Offsets are masked to 12 bits.
        assert_eq!(entry_offset(make_entry(3, 0xFFFF)), 0xFFF);
        assert_eq!(entry_type(REL_BASED_ABSOLUTE), 0);
    }
}
