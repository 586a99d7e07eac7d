//! Rewrite blocks: descriptors of 32-bit slots that get delta-mutated on
//! disk and re-relocated by the loader.
//!
//! A block answers four questions: where is its first 32-bit slot, where is
//! the next one, how to subtract the pack delta from a slot, and whether it
//! spawns follow-on blocks when multi-pass mode is on.  Variants carry only
//! the state they need; section-backed blocks hold an index into the
//! recompiler's section arena rather than a shared pointer, so the emitter
//! can mutate section bytes through a single owner.
//!
//! Producers must not enqueue self-overlapping slots within one block; the
//! emitter only reverses ordering *between* blocks (see the packer).

use crate::pe::parser::PeFile;
use crate::section::SectionContents;

/// Position of one 32-bit slot: its RVA and the matching offset into the
/// owning buffer (section-relative for section blocks, unused for header
/// fields).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryLoc {
    pub rva: u32,
    pub offset: u32,
}

/// A contiguous or single-field set of 32-bit rewrite targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteBlock {
    /// The optional header's `AddressOfEntryPoint` field.
    EntryPoint,
    /// The optional header's `ImageBase` field.
    ImageBase,
    /// `[start, start + len)` inside one section's raw data, walked in
    /// 4-byte steps.  A slot is covered when it *begins* inside the range,
    /// so the final slot may extend up to three bytes past `start + len`.
    SectionRange {
        /// Arena index into the recompiler's section list.
        section: usize,
        /// Byte offset of the range start within the section data.
        start: u32,
        /// Range length in bytes.
        len: u32,
    },
}

impl RewriteBlock {
    /// A block covering every aligned 4-byte slot of a section's raw data.
    pub fn whole_section(section: usize, raw_size: u32) -> RewriteBlock {
        RewriteBlock::SectionRange {
            section,
            start: 0,
            len: raw_size,
        }
    }

    /// The earliest slot this block covers, or `None` for an empty block.
    pub fn first_entry_loc(
        &self,
        pe: &PeFile,
        sections: &[SectionContents],
        _word_size: u32,
    ) -> Option<EntryLoc> {
        match *self {
            RewriteBlock::EntryPoint => Some(EntryLoc {
                rva: pe.entry_point_field_rva(),
                offset: 0,
            }),
            RewriteBlock::ImageBase => Some(EntryLoc {
                rva: pe.image_base_field_rva(),
                offset: 0,
            }),
            RewriteBlock::SectionRange { section, start, len } => {
                if len == 0 {
                    return None;
                }
                let sec = sections.get(section)?;
                Some(EntryLoc {
                    rva: sec.rva.wrapping_add(start),
                    offset: start,
                })
            }
        }
    }

    /// The slot after `prev`, in ascending RVA order.
    pub fn next_entry_loc(
        &self,
        _pe: &PeFile,
        sections: &[SectionContents],
        word_size: u32,
        prev: EntryLoc,
    ) -> Option<EntryLoc> {
        match *self {
            // Header fields are single slots.
            RewriteBlock::EntryPoint | RewriteBlock::ImageBase => None,
            RewriteBlock::SectionRange { section, start, len } => {
                let sec = sections.get(section)?;
                let offset = prev.offset.checked_add(word_size)?;
                if offset >= start.checked_add(len)? {
                    return None;
                }
                Some(EntryLoc {
                    rva: sec.rva.wrapping_add(offset),
                    offset,
                })
            }
        }
    }

    /// Subtract `delta` (32-bit wraparound) from the slot at `loc`.
    /// Returns false only when the 4-byte read would run out of range.
    pub fn decrement_entry(
        &self,
        pe: &mut PeFile,
        sections: &mut [SectionContents],
        loc: EntryLoc,
        delta: u32,
    ) -> bool {
        match *self {
            RewriteBlock::EntryPoint => {
                let ep = pe.optional_header.entry_point;
                pe.optional_header.entry_point = ep.wrapping_sub(delta);
                true
            }
            RewriteBlock::ImageBase => {
                let base = pe.optional_header.image_base;
                pe.optional_header.image_base = base.wrapping_sub(delta);
                true
            }
            RewriteBlock::SectionRange { section, .. } => {
                let Some(sec) = sections.get_mut(section) else {
                    return false;
                };
                match sec.read_u32(loc.offset as usize) {
                    Some(value) => sec.write_u32(loc.offset as usize, value.wrapping_sub(delta)),
                    None => false,
                }
            }
        }
    }

    /// Follow-on block for multi-pass mode.  The collector chains through
    /// descendants (`next = next.next_multi_pass(count)`) until `None`:
    /// section ranges yield one duplicate of themselves at pass 0, so every
    /// covered slot is decremented twice and earns two relocation entries;
    /// header fields never expand.
    pub fn next_multi_pass(&self, pass_index: usize) -> Option<RewriteBlock> {
        match self {
            RewriteBlock::SectionRange { .. } if pass_index == 0 => Some(self.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pe::testimage::build_minimal_pe32;
    use std::io::Cursor;

    const WORD: u32 = 4;

    fn fixture() -> (PeFile, Vec<SectionContents>) {
        let data = build_minimal_pe32();
        let pe = PeFile::parse(data.clone()).expect("parse");
        let mut cursor = Cursor::new(data);
        let sections = (0..pe.sections.len())
            .map(|i| SectionContents::read(i, &pe, &mut cursor).expect("read section"))
            .collect();
        (pe, sections)
    }

    #[test]
    fn entry_point_block_is_a_single_header_slot() {
        let (mut pe, mut sections) = fixture();
        let block = RewriteBlock::EntryPoint;

        let first = block.first_entry_loc(&pe, &sections, WORD).expect("first");
        assert_eq!(first.rva, pe.entry_point_field_rva());
        assert!(block.next_entry_loc(&pe, &sections, WORD, first).is_none());

        let original = pe.optional_header.entry_point;
        assert!(block.decrement_entry(&mut pe, &mut sections, first, 0x2_0000));
        assert_eq!(
            pe.optional_header.entry_point,
            original.wrapping_sub(0x2_0000)
        );
    }

    #[test]
    fn image_base_block_wraps_around() {
        let (mut pe, mut sections) = fixture();
        let block = RewriteBlock::ImageBase;
        let first = block.first_entry_loc(&pe, &sections, WORD).expect("first");

        pe.optional_header.image_base = 0x0001_0000;
        assert!(block.decrement_entry(&mut pe, &mut sections, first, 0x0004_0000));
        // 0x10000 - 0x40000 wraps.
        assert_eq!(pe.optional_header.image_base, 0xFFFD_0000);
    }

    #[test]
    fn section_range_walks_aligned_slots() {
        let (pe, sections) = fixture();
        // Six bytes starting at .rdata+0x40 -- the "hello\0" match shape.
        let block = RewriteBlock::SectionRange {
            section: 1,
            start: 0x40,
            len: 6,
        };

        let a = block.first_entry_loc(&pe, &sections, WORD).expect("first");
        assert_eq!(a, EntryLoc { rva: 0x2040, offset: 0x40 });
        let b = block.next_entry_loc(&pe, &sections, WORD, a).expect("second");
        assert_eq!(b, EntryLoc { rva: 0x2044, offset: 0x44 });
        // 0x48 does not begin inside [0x40, 0x46).
        assert!(block.next_entry_loc(&pe, &sections, WORD, b).is_none());
    }

    #[test]
    fn whole_section_covers_every_slot() {
        let (pe, sections) = fixture();
        let block = RewriteBlock::whole_section(0, sections[0].raw_size);

        let mut count = 0;
        let mut loc = block.first_entry_loc(&pe, &sections, WORD);
        while let Some(cur) = loc {
            count += 1;
            loc = block.next_entry_loc(&pe, &sections, WORD, cur);
        }
        assert_eq!(count, 0x200 / 4);
    }

    #[test]
    fn empty_range_has_no_entries() {
        let (pe, sections) = fixture();
        let block = RewriteBlock::SectionRange {
            section: 0,
            start: 0x10,
            len: 0,
        };
        assert!(block.first_entry_loc(&pe, &sections, WORD).is_none());
    }

    #[test]
    fn decrement_fails_past_section_end() {
        let (mut pe, mut sections) = fixture();
        let block = RewriteBlock::SectionRange {
            section: 0,
            start: 0x1FE,
            len: 8,
        };
        let first = block.first_entry_loc(&pe, &sections, WORD).expect("first");
        // Slot begins at 0x1FE but four bytes do not fit in 0x200.
        assert!(!block.decrement_entry(&mut pe, &mut sections, first, 1));
    }

    #[test]
    fn section_decrement_applies_wraparound_subtraction() {
        let (mut pe, mut sections) = fixture();
        let block = RewriteBlock::SectionRange {
            section: 0,
            start: 0x10,
            len: 4,
        };
        let loc = block.first_entry_loc(&pe, &sections, WORD).expect("first");
        assert!(block.decrement_entry(&mut pe, &mut sections, loc, 0x0002_0000));
        assert_eq!(sections[0].read_u32(0x10), Some(0x003E_1234));
    }

    #[test]
    fn multi_pass_yields_one_duplicate_for_section_ranges() {
        let block = RewriteBlock::SectionRange {
            section: 1,
            start: 0x40,
            len: 6,
        };
        let descendant = block.next_multi_pass(0).expect("one descendant");
        assert_eq!(descendant, block);
        // The chain terminates at the descendant.
        assert!(descendant.next_multi_pass(1).is_none());
        assert!(block.next_multi_pass(1).is_none());

        assert!(RewriteBlock::EntryPoint.next_multi_pass(0).is_none());
        assert!(RewriteBlock::ImageBase.next_multi_pass(0).is_none());
    }
}
