//! Layout management.
//!
//! This module assigns the unit's sections their final virtual addresses and file
//! offsets. Sections are grouped into loadable segments by permission: text (R+X),
//! rodata (R) and a read-write segment holding data followed by bss.

use object::SectionKind;
use tracing::debug;

use crate::arch::Architecture;
use crate::unit::{SectionId, Unit};
use crate::utils::align_up;

/// A loadable segment of the output executable.
///
/// Virtual address and file offset are congruent modulo the segment alignment, so the
/// segment can be mapped straight from the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Name of the segment (e.g., "text", "rw").
    pub name: &'static str,
    /// Non-empty sections making up this segment, in address order.
    pub sections: Vec<SectionId>,
    /// The kind of segment, used for permissions.
    pub kind: SectionKind,
    /// The virtual address where this segment starts in memory.
    pub virtual_address: u64,
    /// The file offset where this segment starts in the ELF file.
    pub file_offset: u64,
    /// Bytes backed by the file.
    pub file_size: u64,
    /// Bytes occupied in memory, including bss.
    pub mem_size: u64,
}

const GROUPS: [(&str, SectionKind, &[SectionId]); 3] = [
    ("text", SectionKind::Text, &[SectionId::Text]),
    ("rodata", SectionKind::ReadOnlyData, &[SectionId::Rodata]),
    ("rw", SectionKind::Data, &[SectionId::Data, SectionId::Bss]),
];

/// Places every non-empty section and returns the resulting segments.
///
/// The first segment starts one segment alignment past the base address (and at the
/// same file offset), which leaves room for the ELF and program headers.
pub fn layout<A: Architecture + ?Sized>(arch: &A, unit: &mut Unit) -> Vec<Segment> {
    let alignment = arch.segment_alignment();
    let mut va = arch.base_address() + alignment;
    let mut off = alignment;
    let mut segments = Vec::new();

    for (name, kind, all) in GROUPS {
        let ids: Vec<SectionId> = all
            .iter()
            .copied()
            .filter(|&id| !unit.section(id).is_empty())
            .collect();
        if ids.is_empty() {
            for &id in all {
                unit.section_mut(id).address = va;
            }
            continue;
        }
        va = align_up(va, alignment);
        off = align_up(off, alignment);
        let mut segment = Segment {
            name,
            sections: ids,
            kind,
            virtual_address: va,
            file_offset: off,
            file_size: 0,
            mem_size: 0,
        };
        for &id in all {
            let section = unit.section_mut(id);
            if section.is_empty() {
                section.address = segment.virtual_address + segment.mem_size;
                continue;
            }
            let start = align_up(segment.mem_size, section.alignment);
            section.address = segment.virtual_address + start;
            section.file_offset = segment.file_offset + start;
            segment.mem_size = start + section.len();
            if !section.is_bss() {
                segment.file_size = segment.mem_size;
            }
            debug!(
                "placed {} at 0x{:x} (file offset 0x{:x}, 0x{:x} bytes)",
                section.name,
                section.address,
                section.file_offset,
                section.len()
            );
        }
        va = segment.virtual_address + segment.mem_size;
        off = segment.file_offset + segment.file_size;
        segments.push(segment);
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::a64::A64;

    #[test]
    fn segments_are_page_aligned_and_skip_empty_ones() {
        let arch = A64::new();
        let mut unit = Unit::new();
        unit.section_mut(SectionId::Text).add_bytes(&[0; 0x10004]);
        unit.section_mut(SectionId::Data).add_bytes(&[1; 3]);
        unit.section_mut(SectionId::Bss).pad_to(8, |n| vec![0; n]).unwrap();
        unit.section_mut(SectionId::Bss).add_bytes(&[0; 0x20]);

        let segments = layout(&arch, &mut unit);
        assert_eq!(segments.len(), 2);
        let text = &segments[0];
        assert_eq!((text.virtual_address, text.file_offset), (0x410000, 0x10000));
        assert_eq!(unit.section(SectionId::Text).address, 0x410000);

        let rw = &segments[1];
        assert_eq!(rw.sections, [SectionId::Data, SectionId::Bss]);
        assert_eq!((rw.virtual_address, rw.file_offset), (0x430000, 0x30000));
        assert_eq!(rw.file_size, 3);
        assert_eq!(rw.mem_size, 8 + 0x20);
        assert_eq!(unit.section(SectionId::Bss).address, 0x430008);
    }
}
