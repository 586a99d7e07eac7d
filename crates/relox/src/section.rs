//! In-memory mirror of one section: header metadata plus raw bytes.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};

use crate::pe::parser::PeFile;

/// A section's raw contents together with the header fields the pipeline
/// consults.  Constructed once at load time and mutated in place by the
/// rebase and emission stages; rewrite blocks address these through arena
/// indices held by the recompiler.
#[derive(Debug, Clone)]
pub struct SectionContents {
    /// 0-based position in the section table.
    pub index: usize,
    /// Virtual address relative to the image base.
    pub rva: u32,
    /// Bytes on disk; `data.len()` equals this on write.
    pub raw_size: u32,
    /// Bytes in memory.
    pub virtual_size: u32,
    /// File offset of the raw data.
    pub raw_pointer: u32,
    /// Section name, trailing NULs trimmed.
    pub name: String,
    /// Mutable raw contents.
    pub data: Vec<u8>,
}

impl SectionContents {
    /// Populate metadata from the section table and read `raw_size` bytes
    /// from `reader` starting at the raw pointer.
    pub fn read<R: Read + Seek>(
        index: usize,
        pe: &PeFile,
        reader: &mut R,
    ) -> io::Result<SectionContents> {
        let header = pe.sections.get(index).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "section index out of range")
        })?;

        let mut data = vec![0u8; header.size_of_raw_data as usize];
        reader.seek(SeekFrom::Start(header.pointer_to_raw_data as u64))?;
        reader.read_exact(&mut data)?;

        Ok(SectionContents {
            index,
            rva: header.virtual_address,
            raw_size: header.size_of_raw_data,
            virtual_size: header.virtual_size,
            raw_pointer: header.pointer_to_raw_data,
            name: header.name_str().to_string(),
            data,
        })
    }

    /// Track a freshly added section whose data does not exist on disk yet.
    pub fn from_header(index: usize, pe: &PeFile) -> SectionContents {
        let mut sc = SectionContents {
            index,
            rva: 0,
            raw_size: 0,
            virtual_size: 0,
            raw_pointer: 0,
            name: String::new(),
            data: Vec::new(),
        };
        sc.refresh_from(pe);
        sc
    }

    /// Re-pull metadata from the header, e.g. after `make_valid` moved or
    /// resized the section.
    pub fn refresh_from(&mut self, pe: &PeFile) {
        if let Some(header) = pe.sections.get(self.index) {
            self.rva = header.virtual_address;
            self.raw_size = header.size_of_raw_data;
            self.virtual_size = header.virtual_size;
            self.raw_pointer = header.pointer_to_raw_data;
            self.name = header.name_str().to_string();
        }
    }

    /// True iff `[rva, rva + size)` lies entirely inside this section's raw
    /// extent.  Zero `rva` or `size` never match; callers use that to treat
    /// empty data-directory slots as misses.
    pub fn rva_contains(&self, rva: u32, size: u32) -> bool {
        if rva == 0 || size == 0 {
            return false;
        }
        let end = self.rva.wrapping_add(self.raw_size);
        rva >= self.rva && rva < end && rva.wrapping_add(size) <= end
    }

    /// Read the 32-bit little-endian value at `offset` into the raw data.
    pub fn read_u32(&self, offset: usize) -> Option<u32> {
        let end = offset.checked_add(4)?;
        if end > self.data.len() {
            return None;
        }
        Some(u32::from_le_bytes([
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
            self.data[offset + 3],
        ]))
    }

    /// Write a 32-bit little-endian value at `offset`; false when the slot
    /// does not fit.
    pub fn write_u32(&mut self, offset: usize, value: u32) -> bool {
        let Some(end) = offset.checked_add(4) else {
            return false;
        };
        if end > self.data.len() {
            return false;
        }
        self.data[offset..end].copy_from_slice(&value.to_le_bytes());
        true
    }
}

/// One aligned row of the load-time section listing.
impl fmt::Display for SectionContents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "\t{:<10}0x{:08x}  0x{:08x}  0x{:08x}  0x{:08x}",
            self.name, self.virtual_size, self.raw_size, self.rva, self.raw_pointer
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pe::testimage::build_minimal_pe32;
    use std::io::Cursor;

    fn load_section(index: usize) -> SectionContents {
        let data = build_minimal_pe32();
        let pe = PeFile::parse(data.clone()).expect("parse");
        SectionContents::read(index, &pe, &mut Cursor::new(data)).expect("read section")
    }

    #[test]
    fn read_populates_metadata_and_data() {
        let text = load_section(0);
        assert_eq!(text.index, 0);
        assert_eq!(text.name, ".text");
        assert_eq!(text.rva, 0x1000);
        assert_eq!(text.raw_size, 0x200);
        assert_eq!(text.raw_pointer, 0x400);
        assert_eq!(text.data.len(), 0x200);
        assert_eq!(text.read_u32(0x10), Some(0x0040_1234));
    }

    #[test]
    fn read_rejects_bad_index() {
        let data = build_minimal_pe32();
        let pe = PeFile::parse(data.clone()).expect("parse");
        assert!(SectionContents::read(7, &pe, &mut Cursor::new(data)).is_err());
    }

    #[test]
    fn rva_containment() {
        let text = load_section(0);
        assert!(text.rva_contains(0x1000, 4));
        assert!(text.rva_contains(0x11FC, 4));
        assert!(!text.rva_contains(0x11FD, 4)); // runs past the end
        assert!(!text.rva_contains(0x0FFF, 4)); // starts before
        assert!(!text.rva_contains(0x2000, 4)); // different section
        assert!(!text.rva_contains(0, 4)); // zero RVA never matches
        assert!(!text.rva_contains(0x1000, 0)); // zero size never matches
    }

    #[test]
    fn u32_round_trip_and_bounds() {
        let mut text = load_section(0);
        assert!(text.write_u32(0x1FC, 0xDEAD_BEEF));
        assert_eq!(text.read_u32(0x1FC), Some(0xDEAD_BEEF));
        // One past the last full slot.
        assert_eq!(text.read_u32(0x1FD), None);
        assert!(!text.write_u32(0x1FD, 0));
        assert_eq!(text.read_u32(usize::MAX), None);
    }

    #[test]
    fn display_row_is_aligned() {
        let text = load_section(0);
        let row = text.to_string();
        assert!(row.starts_with("\t.text"));
        assert!(row.contains("0x00000200"));
        assert!(row.contains("0x00001000"));
    }

    #[test]
    fn refresh_tracks_header_edits() {
        let data = build_minimal_pe32();
        let mut pe = PeFile::parse(data.clone()).expect("parse");
        let mut text =
            SectionContents::read(0, &pe, &mut Cursor::new(data)).expect("read section");

        pe.sections[0].virtual_size = 0x123;
        pe.sections[0].size_of_raw_data = 0x400;
        text.refresh_from(&pe);
        assert_eq!(text.virtual_size, 0x123);
        assert_eq!(text.raw_size, 0x400);
    }
}
