//! PE32 writer: header patching, section growth, discrete file output.
//!
//! The serialization model mirrors the parser: tracked header fields are
//! patched over the original bytes so that everything the parser ignores
//! (DOS stub, rich header, untracked optional-header fields) survives
//! byte-for-byte.  Output happens through four independent writers -- MZ
//! region, PE header, section table, per-section raw data -- each of which
//! opens the output path, writes at its own file offset, and releases the
//! handle.  A failed pipeline therefore leaves the output file in an
//! indeterminate state; callers are expected to discard it.

use std::fs::OpenOptions;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;

use super::parser::{PeError, PeFile, SectionHeader};

// ---------------------------------------------------------------------------
// Section characteristic constants
// ---------------------------------------------------------------------------

/// IMAGE_SCN_MEM_READ
pub const SCN_MEM_READ: u32 = 0x4000_0000;
/// IMAGE_SCN_MEM_WRITE
pub const SCN_MEM_WRITE: u32 = 0x8000_0000;
/// IMAGE_SCN_MEM_EXECUTE
pub const SCN_MEM_EXECUTE: u32 = 0x2000_0000;
/// IMAGE_SCN_CNT_CODE
pub const SCN_CNT_CODE: u32 = 0x0000_0020;
/// IMAGE_SCN_CNT_INITIALIZED_DATA
pub const SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;

// ---------------------------------------------------------------------------
// Little-endian write helpers
// ---------------------------------------------------------------------------

/// Write a `u16` at `offset` in little-endian order.
fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    let bytes = value.to_le_bytes();
    buf[offset] = bytes[0];
    buf[offset + 1] = bytes[1];
}

/// Write a `u32` at `offset` in little-endian order.
fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Round `value` up to the nearest multiple of `alignment`.
/// `alignment` must be a power of two; zero passes the value through.
pub fn align_up(value: u32, alignment: u32) -> u32 {
    if alignment == 0 {
        return value;
    }
    (value + alignment - 1) & !(alignment - 1)
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

/// Serialize the PE header region: signature, COFF header, optional header
/// and data directories.  Starts from the original bytes and patches only
/// the tracked fields.
pub fn serialize_pe_header(pe: &PeFile) -> Vec<u8> {
    let start = pe.pe_offset;
    let len = 4 + 20 + pe.coff_header.size_of_optional_header as usize;
    let mut buf = vec![0u8; len];
    let available = pe.data.len().saturating_sub(start).min(len);
    buf[..available].copy_from_slice(&pe.data[start..start + available]);

    // COFF header (relative offset 4).
    put_u16(&mut buf, 4, pe.coff_header.machine);
    put_u16(&mut buf, 4 + 2, pe.coff_header.number_of_sections);
    put_u16(&mut buf, 4 + 16, pe.coff_header.size_of_optional_header);
    put_u16(&mut buf, 4 + 18, pe.coff_header.characteristics);

    // Optional header (relative offset 24).
    let opt = 4 + 20;
    put_u16(&mut buf, opt, pe.optional_header.magic);
    put_u32(&mut buf, opt + 16, pe.optional_header.entry_point);
    put_u32(&mut buf, opt + 28, pe.optional_header.image_base);
    put_u32(&mut buf, opt + 32, pe.optional_header.section_alignment);
    put_u32(&mut buf, opt + 36, pe.optional_header.file_alignment);
    put_u32(&mut buf, opt + 56, pe.optional_header.size_of_image);
    put_u32(&mut buf, opt + 60, pe.optional_header.size_of_headers);
    put_u32(&mut buf, opt + 64, pe.optional_header.checksum);
    put_u16(&mut buf, opt + 70, pe.optional_header.dll_characteristics);
    put_u32(&mut buf, opt + 92, pe.optional_header.number_of_rva_and_sizes);

    // Data directories.
    for (i, dir) in pe.data_directories.iter().enumerate() {
        let base = opt + 96 + i * 8;
        if base + 8 <= buf.len() {
            put_u32(&mut buf, base, dir.virtual_address);
            put_u32(&mut buf, base + 4, dir.size);
        }
    }

    buf
}

/// Serialize the section table.  Fields the pipeline does not track
/// (relocation/line-number pointers) are written as zero, which is what
/// they are in executable images.
pub fn serialize_section_table(pe: &PeFile) -> Vec<u8> {
    let mut buf = vec![0u8; pe.sections.len() * 40];
    for (i, section) in pe.sections.iter().enumerate() {
        let base = i * 40;
        buf[base..base + 8].copy_from_slice(&section.name);
        put_u32(&mut buf, base + 8, section.virtual_size);
        put_u32(&mut buf, base + 12, section.virtual_address);
        put_u32(&mut buf, base + 16, section.size_of_raw_data);
        put_u32(&mut buf, base + 20, section.pointer_to_raw_data);
        put_u32(&mut buf, base + 36, section.characteristics);
    }
    buf
}

// ---------------------------------------------------------------------------
// Header mutation
// ---------------------------------------------------------------------------

/// Append a new section header named `name` with virtual size `size`.
///
/// Placement follows the usual rules: the RVA lands after the last
/// section's virtual extent rounded up to the section alignment, the raw
/// pointer after the last section's raw data rounded up to the file
/// alignment.  The caller provides raw data later through
/// [`write_section_data`]; `size_of_raw_data` is pre-set to the file-aligned
/// virtual size.
///
/// Returns the new section's index, or [`PeError::NoHeaderSpace`] when the
/// grown table would overrun `SizeOfHeaders` (this writer never shifts
/// section data to make room).
pub fn add_section(pe: &mut PeFile, name: &str, size: u32) -> Result<usize, PeError> {
    if name.len() > 8 {
        return Err(PeError::NameTooLong);
    }

    let table_offset = pe.section_table_offset();
    let new_count = pe.sections.len() + 1;
    if table_offset + new_count * 40 > pe.optional_header.size_of_headers as usize {
        return Err(PeError::NoHeaderSpace);
    }

    let file_alignment = pe.optional_header.file_alignment;
    let section_alignment = pe.optional_header.section_alignment;

    let (virtual_address, raw_pointer) = match pe.sections.last() {
        Some(last) => (
            align_up(
                last.virtual_address + std::cmp::max(last.virtual_size, last.size_of_raw_data),
                section_alignment,
            ),
            align_up(last.pointer_to_raw_data + last.size_of_raw_data, file_alignment),
        ),
        None => (
            align_up(pe.optional_header.size_of_headers, section_alignment),
            align_up(pe.optional_header.size_of_headers, file_alignment),
        ),
    };

    let mut section_name = [0u8; 8];
    section_name[..name.len()].copy_from_slice(name.as_bytes());

    pe.sections.push(SectionHeader {
        name: section_name,
        virtual_size: size,
        virtual_address,
        size_of_raw_data: align_up(size, file_alignment),
        pointer_to_raw_data: raw_pointer,
        characteristics: 0,
    });
    pe.coff_header.number_of_sections = pe.sections.len() as u16;

    Ok(pe.sections.len() - 1)
}

/// Recompute header fields that depend on the section table: the section
/// count, `SizeOfImage`, and `SizeOfHeaders`.  The checksum slot is zeroed
/// because the contents no longer match whatever was recorded; this crate
/// does not recompute PE checksums.
pub fn make_valid(pe: &mut PeFile) {
    pe.coff_header.number_of_sections = pe.sections.len() as u16;

    let section_alignment = pe.optional_header.section_alignment;
    let file_alignment = pe.optional_header.file_alignment;

    pe.optional_header.size_of_image = match pe.sections.last() {
        Some(last) => align_up(
            last.virtual_address + std::cmp::max(last.virtual_size, last.size_of_raw_data),
            section_alignment,
        ),
        None => align_up(pe.optional_header.size_of_headers, section_alignment),
    };

    let table_end = (pe.section_table_offset() + pe.sections.len() * 40) as u32;
    let needed_headers = align_up(table_end, file_alignment);
    if needed_headers > pe.optional_header.size_of_headers {
        pe.optional_header.size_of_headers = needed_headers;
    }

    pe.optional_header.checksum = 0;
}

// ---------------------------------------------------------------------------
// Discrete file writers
// ---------------------------------------------------------------------------

/// Open `path` (creating it if needed), write `bytes` at `offset`, close.
fn write_at(path: &Path, offset: u64, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create(true).open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(bytes)
}

/// Truncate (or create) the output file so no stale bytes survive from a
/// previous run.  Call once before the first writer.
pub fn truncate_output(path: &Path) -> io::Result<()> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map(|_| ())
}

/// Write the MZ region -- DOS header plus stub, everything up to the PE
/// signature -- at file offset 0.
pub fn write_mz(pe: &PeFile, path: &Path) -> io::Result<()> {
    write_at(path, 0, &pe.data[..pe.pe_offset])
}

/// Write the PE header region at `e_lfanew`.
pub fn write_pe_header(pe: &PeFile, path: &Path) -> io::Result<()> {
    write_at(path, pe.pe_offset as u64, &serialize_pe_header(pe))
}

/// Write the section table right after the optional header.
pub fn write_section_table(pe: &PeFile, path: &Path) -> io::Result<()> {
    write_at(
        path,
        pe.section_table_offset() as u64,
        &serialize_section_table(pe),
    )
}

/// Write one section's raw data at its recorded raw pointer.
pub fn write_section_data(pe: &PeFile, index: usize, data: &[u8], path: &Path) -> io::Result<()> {
    let section = pe.sections.get(index).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "section index out of range")
    })?;
    write_at(path, section.pointer_to_raw_data as u64, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pe::testimage::{build_minimal_pe32, get_u32};
    use std::io::Read;

    fn read_back(path: &Path) -> Vec<u8> {
        let mut buf = Vec::new();
        std::fs::File::open(path)
            .expect("open output")
            .read_to_end(&mut buf)
            .expect("read output");
        buf
    }

    #[test]
    fn serialize_pe_header_round_trips_untouched_image() {
        let pe = PeFile::parse(build_minimal_pe32()).expect("parse");
        let header = serialize_pe_header(&pe);
        assert_eq!(header, &pe.data[0x80..0x80 + header.len()]);
    }

    #[test]
    fn serialize_pe_header_reflects_field_edits() {
        let mut pe = PeFile::parse(build_minimal_pe32()).expect("parse");
        pe.optional_header.entry_point = 0xBEEF;
        pe.optional_header.image_base = 0xFFFF_0000;
        pe.optional_header.dll_characteristics = 0x0100;
        let header = serialize_pe_header(&pe);
        let opt = 4 + 20;
        assert_eq!(get_u32(&header, opt + 16), 0xBEEF);
        assert_eq!(get_u32(&header, opt + 28), 0xFFFF_0000);
        assert_eq!(
            u16::from_le_bytes([header[opt + 70], header[opt + 71]]),
            0x0100
        );
    }

    #[test]
    fn serialize_section_table_matches_original() {
        let pe = PeFile::parse(build_minimal_pe32()).expect("parse");
        let table = serialize_section_table(&pe);
        let start = pe.section_table_offset();
        assert_eq!(table, &pe.data[start..start + table.len()]);
    }

    #[test]
    fn add_section_places_after_last() {
        let mut pe = PeFile::parse(build_minimal_pe32()).expect("parse");
        let idx = add_section(&mut pe, ".presel", 0x40).expect("add_section");
        assert_eq!(idx, 3);
        assert_eq!(pe.coff_header.number_of_sections, 4);

        let new = &pe.sections[3];
        assert_eq!(new.name_str(), ".presel");
        // .reloc: VA 0x3000, raw size 0x200 > vsize 12 -> next VA 0x4000.
        assert_eq!(new.virtual_address, 0x4000);
        // .reloc raw ends at 0x800 + 0x200 = 0xA00 (aligned).
        assert_eq!(new.pointer_to_raw_data, 0xA00);
        assert_eq!(new.virtual_size, 0x40);
        assert_eq!(new.size_of_raw_data, 0x200);
    }

    #[test]
    fn add_section_rejects_long_names() {
        let mut pe = PeFile::parse(build_minimal_pe32()).expect("parse");
        assert_eq!(
            add_section(&mut pe, ".muchtoolong", 0x40).unwrap_err(),
            PeError::NameTooLong
        );
    }

    #[test]
    fn add_section_rejects_full_header_table() {
        let mut pe = PeFile::parse(build_minimal_pe32()).expect("parse");
        // Shrink SizeOfHeaders so the table has no slack.
        pe.optional_header.size_of_headers = (pe.section_table_offset() + 3 * 40) as u32;
        assert_eq!(
            add_section(&mut pe, ".x", 0x40).unwrap_err(),
            PeError::NoHeaderSpace
        );
    }

    #[test]
    fn make_valid_recomputes_size_of_image() {
        let mut pe = PeFile::parse(build_minimal_pe32()).expect("parse");
        add_section(&mut pe, ".extra", 0x1234).expect("add");
        make_valid(&mut pe);
        // New section: VA 0x4000, extent max(0x1234, 0x1400) -> 0x5400
        // aligned up to 0x6000.
        assert_eq!(pe.optional_header.size_of_image, 0x6000);
        assert_eq!(pe.optional_header.checksum, 0);
        assert_eq!(pe.coff_header.number_of_sections, 4);
    }

    #[test]
    fn discrete_writers_reassemble_the_image() {
        let pe = PeFile::parse(build_minimal_pe32()).expect("parse");
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.exe");

        truncate_output(&path).expect("truncate");
        write_mz(&pe, &path).expect("mz");
        write_pe_header(&pe, &path).expect("pe header");
        write_section_table(&pe, &path).expect("section table");
        for (i, section) in pe.sections.iter().enumerate() {
            let start = section.pointer_to_raw_data as usize;
            let end = start + section.size_of_raw_data as usize;
            write_section_data(&pe, i, &pe.data[start..end], &path).expect("section data");
        }

        let out = read_back(&path);
        assert_eq!(out, pe.data);
    }

    #[test]
    fn truncate_discards_stale_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.exe");
        std::fs::write(&path, vec![0xFFu8; 4096]).expect("seed stale file");

        truncate_output(&path).expect("truncate");
        write_at(&path, 0, b"MZ").expect("write");
        assert_eq!(read_back(&path), b"MZ");
    }

    #[test]
    fn write_section_data_rejects_bad_index() {
        let pe = PeFile::parse(build_minimal_pe32()).expect("parse");
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.exe");
        let err = write_section_data(&pe, 9, &[0], &path).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[test]
    fn align_up_rounds_correctly() {
        assert_eq!(align_up(0x200, 0x200), 0x200);
        assert_eq!(align_up(1, 0x200), 0x200);
        assert_eq!(align_up(0x201, 0x200), 0x400);
        assert_eq!(align_up(0, 0x200), 0);
        assert_eq!(align_up(42, 0), 42);
    }
}
