//! The PE recompilation pipeline.
//!
//! `PeRecompiler` drives the whole transformation: load the input image,
//! rebase it on disk so the declared relocation table cancels out, collect
//! rewrite blocks describing which 32-bit fields to encode as base-delta
//! differences, then emit an output image whose fresh `.reloc` table makes
//! the operating-system loader undo every difference at map time.
//!
//! Diagnostics go to two caller-supplied sinks (info and error); every
//! public operation returns a bare success flag so a front-end can stop at
//! the first failure without unwinding.

use std::collections::VecDeque;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;

use crate::pe::parser::{
    PeError, PeFile, DIRECTORY_ENTRY_BASERELOC, DIRECTORY_ENTRY_IAT, DIRECTORY_ENTRY_IMPORT,
    DLL_CHARACTERISTICS_DYNAMIC_BASE,
};
use crate::pe::reloc::{
    entry_offset, entry_type, make_entry, RelocDirectory, REL_BASED_ABSOLUTE, REL_BASED_HIGHLOW,
};
use crate::pe::writer::{
    self, SCN_CNT_CODE, SCN_CNT_INITIALIZED_DATA, SCN_MEM_EXECUTE, SCN_MEM_READ, SCN_MEM_WRITE,
};
use crate::rewrite::RewriteBlock;
use crate::section::SectionContents;
use crate::stub::{self, StubError};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// The base the output image *declares*.  Unmappable in 32-bit user space,
/// which is the point: the loader falls back.
pub const TRICKY_BASE_ADDRESS: u32 = 0xFFFF_0000;
/// The base the image actually receives once the loader gives up on the
/// declared one.
pub const ACTUALIZED_BASE_ADDRESS: u32 = 0x0001_0000;
/// Relocation pages are 4 KiB.
pub const PAGE_SIZE: u32 = 4096;
/// The rebuilt `.reloc` raw data is padded to this boundary.
pub const RELOC_RAW_ALIGN: u32 = 512;
/// Every rewrite target is one 32-bit slot.
pub const WORD_SIZE: u32 = 4;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Everything that can abort a pipeline stage.  Each aborts the current
/// public operation; there are no retries and no rollback, and a partially
/// written output file is the caller's to discard.
#[derive(Debug)]
pub enum RecompileError {
    OpenInputFailed(io::Error),
    ReadMzFailed(PeError),
    ReadPeFailed(PeError),
    ReadSectionDataFailed(io::Error),
    ReadRelocDirFailed(PeError),
    RelocSectionMissing,
    RelocSectionNotLast(String),
    AslrRequired,
    UnknownRelocType(u16),
    RelocNoContainingSection(u32),
    RewritePreconditionViolated(&'static str),
    RelocTableNonEmpty,
    OutOfRangeFieldRead,
    StubPreparationFailed(StubError),
    AddSectionFailed(PeError),
    WriteOutputFailed(io::Error),
}

impl fmt::Display for RecompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecompileError::OpenInputFailed(e) => write!(f, "failed to open input file: {e}"),
            RecompileError::ReadMzFailed(e) => write!(f, "failed to read MZ header: {e}"),
            RecompileError::ReadPeFailed(e) => write!(f, "failed to read PE header: {e}"),
            RecompileError::ReadSectionDataFailed(e) => {
                write!(f, "failed to read section contents: {e}")
            }
            RecompileError::ReadRelocDirFailed(e) => {
                write!(f, "failed to read reloc directory: {e}")
            }
            RecompileError::RelocSectionMissing => write!(f, "failed to locate reloc section"),
            RecompileError::RelocSectionNotLast(name) => {
                write!(f, "reloc section '{name}' is not the final section; unsupported")
            }
            RecompileError::AslrRequired => {
                write!(f, "binary must have ASLR enabled to perform on-disk relocations")
            }
            RecompileError::UnknownRelocType(t) => write!(f, "unknown reloc type: 0x{t:x}"),
            RecompileError::RelocNoContainingSection(rva) => {
                write!(f, "reloc has no matching section (RVA 0x{rva:08x})")
            }
            RecompileError::RewritePreconditionViolated(msg) => write!(f, "{msg}"),
            RecompileError::RelocTableNonEmpty => {
                write!(f, "no relocation table should exist when rewrites are present")
            }
            RecompileError::OutOfRangeFieldRead => {
                write!(f, "failed to read a 32-bit field targeted by a relocation")
            }
            RecompileError::StubPreparationFailed(e) => {
                write!(f, "failed to prepare ASLR preselection stub: {e}")
            }
            RecompileError::AddSectionFailed(e) => write!(f, "failed to inject section: {e}"),
            RecompileError::WriteOutputFailed(e) => write!(f, "failed to write output file: {e}"),
        }
    }
}

impl std::error::Error for RecompileError {}

fn precondition(msg: &'static str) -> RecompileError {
    RecompileError::RewritePreconditionViolated(msg)
}

// ---------------------------------------------------------------------------
// Packed blocks
// ---------------------------------------------------------------------------

/// Staging record for one future `.reloc` block: a begin RVA plus the
/// page-relative offsets of every fixup collected against it.
struct PackedBlock {
    begin_rva: u32,
    offsets: Vec<u16>,
}

impl PackedBlock {
    fn new(begin_rva: u32) -> PackedBlock {
        PackedBlock {
            begin_rva,
            offsets: Vec::new(),
        }
    }
}

/// Find the section whose raw extent contains `[rva, rva + size)`.
fn find_section_by_rva(sections: &[SectionContents], rva: u32, size: u32) -> Option<usize> {
    sections.iter().position(|s| s.rva_contains(rva, size))
}

// ---------------------------------------------------------------------------
// PeRecompiler
// ---------------------------------------------------------------------------

/// The orchestrator.  Owns the parsed image, the section arena, the queued
/// rewrite blocks, and the two diagnostic sinks for the duration of the
/// pipeline; nothing else observes intermediate state.
pub struct PeRecompiler<I: Write, E: Write> {
    info: I,
    error: E,
    input_path: PathBuf,
    output_path: PathBuf,
    multi_pass: bool,
    win10_attack: bool,
    pe: Option<PeFile>,
    reloc: RelocDirectory,
    sections: Vec<SectionContents>,
    rewrite_blocks: Vec<RewriteBlock>,
    /// Arena indices of sections available for reuse by `alloc_section`.
    /// Never populated today; see the reuse branch there.
    section_pool: Vec<usize>,
}

impl<I: Write, E: Write> PeRecompiler<I, E> {
    pub fn new(
        info: I,
        error: E,
        input_path: impl Into<PathBuf>,
        output_path: impl Into<PathBuf>,
    ) -> PeRecompiler<I, E> {
        PeRecompiler {
            info,
            error,
            input_path: input_path.into(),
            output_path: output_path.into(),
            multi_pass: false,
            win10_attack: false,
            pe: None,
            reloc: RelocDirectory::default(),
            sections: Vec::new(),
            rewrite_blocks: Vec::new(),
            section_pool: Vec::new(),
        }
    }

    /// Select the Windows 10 variant: ASLR stays on, the image base and the
    /// original relocation table are left alone, and emission injects the
    /// preselection stub instead.
    pub fn use_windows10_attack(&mut self, win10: bool) {
        self.win10_attack = win10;
    }

    /// Expand every queued rewrite block through its multi-pass chain.
    pub fn do_multi_pass(&mut self, multi: bool) {
        self.multi_pass = multi;
    }

    /// The parsed image, once `load_input_file` has succeeded.
    pub fn pe(&self) -> Option<&PeFile> {
        self.pe.as_ref()
    }

    /// The loaded section mirrors, once `load_input_sections` has succeeded.
    pub fn sections(&self) -> &[SectionContents] {
        &self.sections
    }

    /// Blocks currently held in the relocation directory.
    pub fn reloc_block_count(&self) -> usize {
        self.reloc.block_count()
    }

    // -- public operations --------------------------------------------------
    //
    // Each returns true on success; failures are described on the error
    // sink and leave the pipeline in a state the caller should abandon.

    pub fn load_input_file(&mut self) -> bool {
        self.run(Self::load_input)
    }

    pub fn load_input_sections(&mut self) -> bool {
        self.run(Self::load_sections)
    }

    pub fn perform_on_disk_relocations(&mut self) -> bool {
        self.run(Self::rebase_on_disk)
    }

    pub fn rewrite_header(&mut self) -> bool {
        self.run(Self::queue_header_rewrite)
    }

    pub fn fixup_base(&mut self) -> bool {
        self.run(Self::queue_base_fixup)
    }

    pub fn rewrite_section(&mut self, name: &str) -> bool {
        self.run(|this| this.queue_section_rewrite(name))
    }

    pub fn rewrite_imports(&mut self) -> bool {
        self.run(Self::queue_import_rewrites)
    }

    pub fn rewrite_matches(&mut self, needle: &str) -> bool {
        self.run(|this| this.queue_match_rewrites(needle))
    }

    pub fn write_output_file(&mut self) -> bool {
        self.run(Self::emit_output)
    }

    fn run(&mut self, op: impl FnOnce(&mut Self) -> Result<(), RecompileError>) -> bool {
        match op(self) {
            Ok(()) => true,
            Err(e) => {
                let _ = writeln!(self.error, "{e}");
                false
            }
        }
    }

    // -- loading ------------------------------------------------------------

    fn load_input(&mut self) -> Result<(), RecompileError> {
        let bytes = fs::read(&self.input_path).map_err(RecompileError::OpenInputFailed)?;
        let pe = PeFile::parse(bytes).map_err(|e| match e {
            PeError::InvalidDosSignature => RecompileError::ReadMzFailed(e),
            other => RecompileError::ReadPeFailed(other),
        })?;

        self.pe = Some(pe);
        self.reloc = RelocDirectory::default();
        self.sections.clear();
        self.rewrite_blocks.clear();
        self.section_pool.clear();

        let _ = writeln!(self.info, "loaded PE file: {}", self.input_path.display());
        Ok(())
    }

    fn load_sections(&mut self) -> Result<(), RecompileError> {
        let Some(pe) = self.pe.as_ref() else {
            return Err(precondition("a PE file must be loaded before reading sections"));
        };

        let mut file =
            File::open(&self.input_path).map_err(RecompileError::OpenInputFailed)?;

        let _ = writeln!(self.info, "loading sections");
        let _ = writeln!(
            self.info,
            "\t{:<10}{:<12}{:<12}{:<12}{:<12}",
            "Name", "VirtSize", "RawSize", "VirtAddr", "RawAddr"
        );

        self.sections.clear();
        for index in 0..pe.sections.len() {
            let sc = SectionContents::read(index, pe, &mut file)
                .map_err(RecompileError::ReadSectionDataFailed)?;
            let _ = writeln!(self.info, "{sc}");
            self.sections.push(sc);
        }

        // The emitter regenerates the reloc section in place and must be
        // free to grow it, which only works for the final section.
        let reloc_rva = pe.directory(DIRECTORY_ENTRY_BASERELOC).virtual_address;
        let idx = find_section_by_rva(&self.sections, reloc_rva, WORD_SIZE)
            .ok_or(RecompileError::RelocSectionMissing)?;
        if self.sections[idx].index != pe.sections.len() - 1 {
            return Err(RecompileError::RelocSectionNotLast(
                self.sections[idx].name.clone(),
            ));
        }

        Ok(())
    }

    // -- on-disk rebase -----------------------------------------------------

    fn rebase_on_disk(&mut self) -> Result<(), RecompileError> {
        if self.sections.is_empty() {
            return Err(precondition(
                "section contents must be loaded before doing any relocations",
            ));
        }
        let Some(pe) = self.pe.as_mut() else {
            return Err(precondition("a PE file must be loaded before relocating"));
        };

        let characteristics = pe.optional_header.dll_characteristics;
        let original_base = pe.optional_header.image_base;

        if characteristics & DLL_CHARACTERISTICS_DYNAMIC_BASE == 0 {
            return Err(RecompileError::AslrRequired);
        }

        self.reloc = RelocDirectory::read_from(pe).map_err(RecompileError::ReadRelocDirFailed)?;

        let _ = writeln!(self.info, "preparing header for obfuscation");

        if !self.win10_attack {
            let stripped = characteristics & !DLL_CHARACTERISTICS_DYNAMIC_BASE;
            pe.optional_header.dll_characteristics = stripped;
            let _ = writeln!(self.info, "\tstripped IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE flag");
            let _ = writeln!(self.info, "\t\told characteristics: 0x{characteristics:04x}");
            let _ = writeln!(self.info, "\t\tnew characteristics: 0x{stripped:04x}");
        } else if characteristics & DLL_CHARACTERISTICS_DYNAMIC_BASE != 0 {
            let _ = writeln!(
                self.info,
                "\t[win10] leaving IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE set"
            );
        } else {
            // Unreachable behind the AslrRequired gate; kept so a relaxed
            // gate inherits sane semantics (set the bit, clobber nothing).
            pe.optional_header.dll_characteristics =
                characteristics | DLL_CHARACTERISTICS_DYNAMIC_BASE;
            let _ = writeln!(
                self.info,
                "\t[win10] added IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE flag"
            );
        }

        if !self.win10_attack {
            pe.optional_header.image_base = TRICKY_BASE_ADDRESS;
            let _ = writeln!(
                self.info,
                "\tchanged ImageBase to 0x{TRICKY_BASE_ADDRESS:08x} (was 0x{original_base:08x})"
            );
        } else {
            let _ = writeln!(
                self.info,
                "\t[win10] leaving ImageBase as 0x{original_base:08x}"
            );
            // The win10 variant keeps the loader's own relocation pass:
            // nothing gets applied on disk and the table is retained for
            // the emitter to write back verbatim.
            let _ = writeln!(
                self.info,
                "\t[win10] retaining original reloc table ({} blocks)",
                self.reloc.block_count()
            );
            return Ok(());
        }

        // Relocate every HIGHLOW target to the actualized base.
        let reloc_delta = ACTUALIZED_BASE_ADDRESS.wrapping_sub(original_base);
        let mut applied = 0usize;
        for bi in 0..self.reloc.blocks.len() {
            let page_rva = self.reloc.blocks[bi].page_rva;
            let sec_idx = find_section_by_rva(&self.sections, page_rva, WORD_SIZE)
                .ok_or(RecompileError::RelocNoContainingSection(page_rva))?;

            for ei in 0..self.reloc.blocks[bi].entries.len() {
                let entry = self.reloc.blocks[bi].entries[ei];
                let ty = entry_type(entry);
                if ty == REL_BASED_ABSOLUTE {
                    continue;
                }
                if ty != REL_BASED_HIGHLOW {
                    return Err(RecompileError::UnknownRelocType(ty));
                }

                let target_rva = page_rva + entry_offset(entry) as u32;
                let sec = &mut self.sections[sec_idx];
                let offset = target_rva.wrapping_sub(sec.rva) as usize;
                let original = sec.read_u32(offset).ok_or(RecompileError::OutOfRangeFieldRead)?;
                sec.write_u32(offset, original.wrapping_add(reloc_delta));
                applied += 1;
            }
        }

        let _ = writeln!(
            self.info,
            "\tparsed original reloc table and applied {applied} relocations"
        );
        let _ = writeln!(
            self.info,
            "\t\tdelta of 0x{reloc_delta:08x} applied; binary will load at 0x{ACTUALIZED_BASE_ADDRESS:08x}"
        );

        self.reloc.clear();
        let _ = writeln!(self.info, "\tcleared original reloc table");

        Ok(())
    }

    // -- rewrite collection -------------------------------------------------

    /// Every collector call runs behind this gate: image and sections
    /// loaded, and the rebase already performed (proved by an empty reloc
    /// table plus the tricky base) unless the Win10 variant is on.
    fn rewrite_ready(&self) -> Result<(), RecompileError> {
        let Some(pe) = self.pe.as_ref() else {
            return Err(precondition("a PE file must be loaded before queueing rewrites"));
        };
        if self.sections.is_empty() {
            return Err(precondition(
                "section contents must be loaded before queueing rewrites",
            ));
        }
        if (self.reloc.block_count() != 0
            || pe.optional_header.image_base != TRICKY_BASE_ADDRESS)
            && !self.win10_attack
        {
            return Err(precondition(
                "on-disk relocations must be performed before queueing rewrites",
            ));
        }
        Ok(())
    }

    /// Append `block`, then chain through its multi-pass descendants when
    /// the flag is on.
    fn push_rewrite_block(&mut self, block: RewriteBlock) {
        let mut cursor = block.clone();
        self.rewrite_blocks.push(block);
        if !self.multi_pass {
            return;
        }

        let mut pass = 0usize;
        while let Some(next) = cursor.next_multi_pass(pass) {
            pass += 1;
            cursor = next.clone();
            self.rewrite_blocks.push(next);
        }
    }

    fn queue_header_rewrite(&mut self) -> Result<(), RecompileError> {
        self.rewrite_ready()?;

        if self.win10_attack {
            let _ = writeln!(self.info, "[win10] skipping header entry-point rewrite");
            return Ok(());
        }

        self.push_rewrite_block(RewriteBlock::EntryPoint);
        let _ = writeln!(self.info, "rewrote header entry point");
        Ok(())
    }

    fn queue_base_fixup(&mut self) -> Result<(), RecompileError> {
        self.rewrite_ready()?;
        self.push_rewrite_block(RewriteBlock::ImageBase);
        let _ = writeln!(
            self.info,
            "added fixup rewrite for ImageBase; will match the actual base in memory"
        );
        Ok(())
    }

    fn queue_section_rewrite(&mut self, name: &str) -> Result<(), RecompileError> {
        self.rewrite_ready()?;

        match self.sections.iter().position(|s| s.name == name) {
            Some(idx) => {
                let (rva, raw_size) = (self.sections[idx].rva, self.sections[idx].raw_size);
                self.push_rewrite_block(RewriteBlock::whole_section(idx, raw_size));
                let _ = writeln!(self.info, "\trewrote {name} section at RVA 0x{rva:08x}");
            }
            None => {
                // A policy miss, not an error.
                let _ = writeln!(self.info, "\tseemingly no section named {name} to rewrite");
            }
        }
        Ok(())
    }

    fn queue_import_rewrites(&mut self) -> Result<(), RecompileError> {
        self.rewrite_ready()?;

        if self.win10_attack {
            let _ = writeln!(self.info, "[win10] skipping import obfuscation");
            return Ok(());
        }

        let (iat, import) = match self.pe.as_ref() {
            Some(pe) => (
                pe.directory(DIRECTORY_ENTRY_IAT),
                pe.directory(DIRECTORY_ENTRY_IMPORT),
            ),
            None => {
                return Err(precondition("a PE file must be loaded before queueing rewrites"))
            }
        };

        let _ = writeln!(self.info, "obfuscating imports");

        if self.queue_subrange(iat.virtual_address, iat.size) {
            let _ = writeln!(
                self.info,
                "\trewrote Import Address Table from RVA 0x{:08x} to 0x{:08x}",
                iat.virtual_address,
                iat.virtual_address + iat.size
            );
        } else {
            let _ = writeln!(self.info, "\tseemingly no Import Address Table to rewrite");
        }

        if self.queue_subrange(import.virtual_address, import.size) {
            let _ = writeln!(
                self.info,
                "\trewrote Import Table from RVA 0x{:08x} to 0x{:08x}",
                import.virtual_address,
                import.virtual_address + import.size
            );
        } else {
            let _ = writeln!(self.info, "\tseemingly no Import Table to rewrite");
        }

        // The hint/name and DLL-name strings live wherever the IAT slots
        // point before binding; cover the span of those pointers.
        if let Some(idx) = find_section_by_rva(&self.sections, iat.virtual_address, iat.size) {
            let (lowest, highest) = {
                let sec = &self.sections[idx];
                let base = (iat.virtual_address - sec.rva) as usize;
                let end = base + iat.size as usize;

                let mut lowest = u32::MAX;
                let mut highest = 0u32;
                let mut offset = base;
                while offset < end {
                    match sec.read_u32(offset) {
                        None => break,
                        Some(0) => {}
                        Some(pointer) => {
                            lowest = lowest.min(pointer);
                            highest = highest.max(pointer);
                        }
                    }
                    offset += WORD_SIZE as usize;
                }
                (lowest, highest)
            };

            let (name_rva, name_len) = if lowest == u32::MAX {
                (0, 0)
            } else {
                (lowest, highest.saturating_sub(lowest))
            };

            if self.queue_subrange(name_rva, name_len) {
                let _ = writeln!(
                    self.info,
                    "\trewrote Import Hints/Names & Dll Names Table from RVA 0x{lowest:08x} to 0x{highest:08x}"
                );
            } else {
                let _ = writeln!(
                    self.info,
                    "\tseemingly no Import Hints/Names & Dll Names Table to rewrite"
                );
            }
        }

        Ok(())
    }

    /// Queue a subrange rewrite if `[rva, rva + size)` lands inside a loaded
    /// section; false means the range matched nothing.
    fn queue_subrange(&mut self, rva: u32, size: u32) -> bool {
        let Some(idx) = find_section_by_rva(&self.sections, rva, size) else {
            return false;
        };
        let start = rva - self.sections[idx].rva;
        self.push_rewrite_block(RewriteBlock::SectionRange {
            section: idx,
            start,
            len: size,
        });
        true
    }

    fn queue_match_rewrites(&mut self, needle: &str) -> Result<(), RecompileError> {
        self.rewrite_ready()?;

        let needle_bytes = needle.as_bytes();
        if needle_bytes.is_empty() {
            let _ = writeln!(self.info, "\tignoring empty match pattern");
            return Ok(());
        }

        let _ = writeln!(self.info, "\tobfuscating all instances of string: {needle}");

        // Matches may overlap: the search resumes one byte past each hit.
        let mut hits: Vec<(usize, u32)> = Vec::new();
        for (idx, sec) in self.sections.iter().enumerate() {
            let mut from = 0usize;
            while from + needle_bytes.len() <= sec.data.len() {
                let Some(found) = sec.data[from..]
                    .windows(needle_bytes.len())
                    .position(|w| w == needle_bytes)
                else {
                    break;
                };
                let at = from + found;
                let _ = writeln!(self.info, "\t\tmatch in {} at offset 0x{at:x}", sec.name);
                hits.push((idx, at as u32));
                from = at + 1;
            }
        }

        // Cover the trailing NUL along with the match itself.
        let len = needle_bytes.len() as u32 + 1;
        for (idx, at) in hits {
            self.push_rewrite_block(RewriteBlock::SectionRange {
                section: idx,
                start: at,
                len,
            });
        }

        Ok(())
    }

    // -- emission -----------------------------------------------------------

    fn emit_output(&mut self) -> Result<(), RecompileError> {
        if self.sections.is_empty() {
            return Err(precondition(
                "section contents must be loaded before writing output",
            ));
        }
        let Some(mut pe) = self.pe.take() else {
            return Err(precondition("a PE file must be loaded before writing output"));
        };
        let mut sections = std::mem::take(&mut self.sections);
        // Rewrite blocks are consumed exactly once.
        let blocks = std::mem::take(&mut self.rewrite_blocks);

        let result = self.emit_stages(&mut pe, &mut sections, &blocks);
        self.pe = Some(pe);
        self.sections = sections;
        result
    }

    fn emit_stages(
        &mut self,
        pe: &mut PeFile,
        sections: &mut Vec<SectionContents>,
        blocks: &[RewriteBlock],
    ) -> Result<(), RecompileError> {
        let _ = writeln!(self.info, "generating output file");

        // Stage 1: apply every queued rewrite and group the touched slots
        // into packed blocks.
        //
        // The loader walks the emitted table top to bottom adding the load
        // delta, so when two rewrite blocks touch the same slot the on-disk
        // decrements must be undone in reverse order -- hence new packed
        // blocks go to the *front* of the deque.  Within a single rewrite
        // block producers guarantee no self-overlap.
        let pack_delta = ACTUALIZED_BASE_ADDRESS.wrapping_sub(pe.optional_header.image_base);
        let mut packed: VecDeque<PackedBlock> = VecDeque::new();

        for block in blocks {
            let Some(first) = block.first_entry_loc(pe, sections, WORD_SIZE) else {
                continue;
            };
            let mut begin_rva = first.rva;
            packed.push_front(PackedBlock::new(begin_rva));

            let mut loc = first;
            loop {
                if !block.decrement_entry(pe, sections, loc, pack_delta) {
                    break;
                }

                let mut rva_offset = loc.rva.wrapping_sub(begin_rva);
                if rva_offset >= PAGE_SIZE {
                    begin_rva = loc.rva;
                    packed.push_front(PackedBlock::new(begin_rva));
                    rva_offset = 0;
                }
                if let Some(front) = packed.front_mut() {
                    front.offsets.push(rva_offset as u16);
                }

                match block.next_entry_loc(pe, sections, WORD_SIZE, loc) {
                    Some(next) => loc = next,
                    None => break,
                }
            }
        }

        // Stage 2: materialize the packed blocks as a fresh reloc table.
        if !packed.is_empty() {
            let _ = writeln!(self.info, "\tapplied all rewrites to raw section contents");

            if self.reloc.block_count() != 0 {
                return Err(RecompileError::RelocTableNonEmpty);
            }

            for pb in &packed {
                let block_idx = self.reloc.add_block(pb.begin_rva);
                for &offset in &pb.offsets {
                    self.reloc
                        .add_entry(block_idx, make_entry(REL_BASED_HIGHLOW, offset));
                }
                // Keep the entry count even so the next block header stays
                // 4-byte aligned.
                if pb.offsets.len() % 2 == 1 {
                    self.reloc.add_entry(block_idx, 0);
                }
            }

            let _ = writeln!(
                self.info,
                "\tgenerated reloc table for rewrites with {} blocks",
                packed.len()
            );
        }

        // Stage 3: embed the rebuilt table in the (final) reloc section.
        let reloc_rva = pe.directory(DIRECTORY_ENTRY_BASERELOC).virtual_address;
        let arena_idx = find_section_by_rva(sections, reloc_rva, WORD_SIZE)
            .ok_or(RecompileError::RelocSectionMissing)?;
        let table_idx = sections[arena_idx].index;
        if table_idx != pe.sections.len() - 1 {
            return Err(RecompileError::RelocSectionNotLast(
                sections[arena_idx].name.clone(),
            ));
        }

        {
            let sec = &mut sections[arena_idx];
            sec.data.clear();
            self.reloc.rebuild(&mut sec.data);

            let built_len = sec.data.len() as u32;
            pe.sections[table_idx].virtual_size = built_len;
            sec.virtual_size = built_len;
            pe.set_basereloc_size(built_len);

            while sec.data.len() % RELOC_RAW_ALIGN as usize != 0 {
                sec.data.push(0x00);
            }
            pe.sections[table_idx].size_of_raw_data = sec.data.len() as u32;
            sec.raw_size = sec.data.len() as u32;
        }
        let _ = writeln!(self.info, "\tupdated PE header with new reloc metadata");

        writer::make_valid(pe);
        let _ = writeln!(self.info, "\tvalidated new PE header");

        // Stage 4 (win10 only): inject the preselection stub and point the
        // entry point at it.
        if self.win10_attack {
            let _ = writeln!(self.info, "\t[win10] injecting ASLR preselection stub");

            let original_entry = pe.optional_header.entry_point;
            let stub_bytes = stub::prepare_stub(original_entry)
                .map_err(RecompileError::StubPreparationFailed)?;

            let access = SCN_MEM_EXECUTE
                | SCN_MEM_WRITE
                | SCN_MEM_READ
                | SCN_CNT_INITIALIZED_DATA
                | SCN_CNT_CODE;
            let arena_idx =
                self.alloc_section(pe, sections, ".presel", stub_bytes.len() as u32, access)?;

            let stub_rva = sections[arena_idx].rva;
            let _ = writeln!(self.info, "\t\toriginal EP: 0x{original_entry:08x}");
            let _ = writeln!(self.info, "\t\tstub section RVA: 0x{stub_rva:08x}");
            if let Some(offset) = pe.rva_to_offset(stub_rva) {
                let _ = writeln!(self.info, "\t\tstub section offset: 0x{offset:08x}");
            }

            pe.optional_header.entry_point = stub_rva;
            let _ = writeln!(self.info, "\t\tEP updated to stub RVA");

            let mut data = stub_bytes;
            data.resize(sections[arena_idx].raw_size as usize, 0x00);
            sections[arena_idx].data = data;
        }

        // Stage 5: write the output through the adapter's discrete writers.
        writer::truncate_output(&self.output_path).map_err(RecompileError::WriteOutputFailed)?;

        writer::write_mz(pe, &self.output_path).map_err(RecompileError::WriteOutputFailed)?;
        let _ = writeln!(self.info, "\twrote MZ header to output file");

        writer::write_pe_header(pe, &self.output_path)
            .map_err(RecompileError::WriteOutputFailed)?;
        let _ = writeln!(self.info, "\twrote PE header to output file");

        writer::write_section_table(pe, &self.output_path)
            .map_err(RecompileError::WriteOutputFailed)?;
        let _ = writeln!(self.info, "\twrote PE section metadata to output file");

        for sec in sections.iter() {
            if sec.raw_size == 0 {
                continue;
            }
            writer::write_section_data(pe, sec.index, &sec.data, &self.output_path)
                .map_err(RecompileError::WriteOutputFailed)?;
        }
        let _ = writeln!(self.info, "\twrote PE section contents to output file");

        Ok(())
    }

    // -- section allocation -------------------------------------------------

    /// Obtain a section of at least `size` bytes named `name` with the given
    /// characteristics, preferring to recycle a pooled section over growing
    /// the table.  Returns the arena index of the section's contents.
    fn alloc_section(
        &mut self,
        pe: &mut PeFile,
        sections: &mut Vec<SectionContents>,
        name: &str,
        size: u32,
        access: u32,
    ) -> Result<usize, RecompileError> {
        // Reuse candidates must be strictly larger than the request, or sit
        // at the final table index where growing is safe.  Nothing feeds
        // the pool today, so the loop never fires; the predicate is the
        // contract for when section recycling gets enabled.
        let final_index = pe.sections.len().saturating_sub(1);
        let mut reused: Option<usize> = None;
        for (pool_pos, &candidate) in self.section_pool.iter().enumerate() {
            let sec = &sections[candidate];
            if sec.raw_size > size || sec.index == final_index {
                reused = Some(pool_pos);
                break;
            }
        }

        let arena_idx = match reused {
            Some(pool_pos) => {
                let candidate = self.section_pool.remove(pool_pos);
                let table_idx = sections[candidate].index;

                let mut section_name = [0u8; 8];
                let copy_len = name.len().min(8);
                section_name[..copy_len].copy_from_slice(&name.as_bytes()[..copy_len]);
                pe.sections[table_idx].name = section_name;
                pe.sections[table_idx].virtual_size = size;
                pe.sections[table_idx].size_of_raw_data = size;

                let _ = writeln!(
                    self.info,
                    "\t\trepurposed section {} as {name}",
                    sections[candidate].name
                );
                candidate
            }
            None => {
                let table_idx =
                    writer::add_section(pe, name, size).map_err(RecompileError::AddSectionFailed)?;
                let _ = writeln!(self.info, "\t\tinjected section {name}");

                writer::make_valid(pe);
                sections.push(SectionContents::from_header(table_idx, pe));
                sections.len() - 1
            }
        };

        let table_idx = sections[arena_idx].index;
        pe.sections[table_idx].characteristics = access;
        sections[arena_idx].refresh_from(pe);

        let sec = &sections[arena_idx];
        let _ = writeln!(self.info, "\t\t\tvirtual size: 0x{:08x}", sec.virtual_size);
        let _ = writeln!(self.info, "\t\t\tRVA: 0x{:08x}", sec.rva);
        let _ = writeln!(self.info, "\t\t\traw size: 0x{:08x}", sec.raw_size);
        let _ = writeln!(self.info, "\t\t\traw pointer: 0x{:08x}", sec.raw_pointer);

        Ok(arena_idx)
    }
}
