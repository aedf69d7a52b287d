//! ELF file writer.
//!
//! This module handles writing the final ELF executable file. The file starts with the
//! ELF header and one `PT_LOAD` program header per segment; section contents follow at
//! the offsets chosen by layout. Section headers, the optional symbol table and the
//! section name table go after the last segment.
//!
//! 32-bit and 64-bit files share one code path: headers are described once with 64-bit
//! fields and narrowed when the target uses the 32-bit class.

use anyhow::{Context, Result};
use object::elf;
use object::endian::{U16, U32, U64};
use object::pod::bytes_of;
use object::{Endianness, SectionKind};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::arch::Architecture;
use crate::layout::Segment;
use crate::unit::{SectionId, Symbol, Unit};
use crate::utils::align_up;

fn u16(v: u16) -> U16<Endianness> {
    U16::new(Endianness::Little, v)
}
fn u32(v: u32) -> U32<Endianness> {
    U32::new(Endianness::Little, v)
}
fn u64(v: u64) -> U64<Endianness> {
    U64::new(Endianness::Little, v)
}

struct ProgramHeader {
    flags: u32,
    offset: u64,
    vaddr: u64,
    filesz: u64,
    memsz: u64,
    align: u64,
}

struct SectionHeader {
    name: u32,
    sh_type: u32,
    flags: u64,
    addr: u64,
    offset: u64,
    size: u64,
    link: u32,
    info: u32,
    addralign: u64,
    entsize: u64,
}

struct SymbolEntry {
    name: u32,
    info: u8,
    shndx: u16,
    value: u64,
}

/// Serializes headers in the 32-bit or 64-bit ELF class.
struct Class {
    is_64: bool,
}

impl Class {
    fn ehdr_size(&self) -> u64 {
        if self.is_64 { 64 } else { 52 }
    }

    fn phdr_size(&self) -> u64 {
        if self.is_64 { 56 } else { 32 }
    }

    fn shdr_size(&self) -> u64 {
        if self.is_64 { 64 } else { 40 }
    }

    fn sym_size(&self) -> u64 {
        if self.is_64 { 24 } else { 16 }
    }

    fn word_align(&self) -> u64 {
        if self.is_64 { 8 } else { 4 }
    }

    fn ident(&self) -> elf::Ident {
        elf::Ident {
            magic: elf::ELFMAG,
            class: if self.is_64 { elf::ELFCLASS64 } else { elf::ELFCLASS32 },
            data: elf::ELFDATA2LSB,
            version: elf::EV_CURRENT,
            os_abi: elf::ELFOSABI_SYSV,
            abi_version: 0,
            padding: [0; 7],
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn file_header(
        &self,
        out: &mut Vec<u8>,
        machine: u16,
        flags: u32,
        entry: u64,
        phnum: u16,
        shoff: u64,
        shnum: u16,
    ) {
        if self.is_64 {
            let header = elf::FileHeader64::<Endianness> {
                e_ident: self.ident(),
                e_type: u16(elf::ET_EXEC),
                e_machine: u16(machine),
                e_version: u32(elf::EV_CURRENT as u32),
                e_entry: u64(entry),
                e_phoff: u64(self.ehdr_size()),
                e_shoff: u64(shoff),
                e_flags: u32(flags),
                e_ehsize: u16(self.ehdr_size() as u16),
                e_phentsize: u16(self.phdr_size() as u16),
                e_phnum: u16(phnum),
                e_shentsize: u16(self.shdr_size() as u16),
                e_shnum: u16(shnum),
                e_shstrndx: u16(shnum - 1),
            };
            out.extend_from_slice(bytes_of(&header));
        } else {
            let header = elf::FileHeader32::<Endianness> {
                e_ident: self.ident(),
                e_type: u16(elf::ET_EXEC),
                e_machine: u16(machine),
                e_version: u32(elf::EV_CURRENT as u32),
                e_entry: u32(entry as u32),
                e_phoff: u32(self.ehdr_size() as u32),
                e_shoff: u32(shoff as u32),
                e_flags: u32(flags),
                e_ehsize: u16(self.ehdr_size() as u16),
                e_phentsize: u16(self.phdr_size() as u16),
                e_phnum: u16(phnum),
                e_shentsize: u16(self.shdr_size() as u16),
                e_shnum: u16(shnum),
                e_shstrndx: u16(shnum - 1),
            };
            out.extend_from_slice(bytes_of(&header));
        }
    }

    fn program_header(&self, out: &mut Vec<u8>, p: &ProgramHeader) {
        if self.is_64 {
            let header = elf::ProgramHeader64::<Endianness> {
                p_type: u32(elf::PT_LOAD),
                p_flags: u32(p.flags),
                p_offset: u64(p.offset),
                p_vaddr: u64(p.vaddr),
                p_paddr: u64(p.vaddr),
                p_filesz: u64(p.filesz),
                p_memsz: u64(p.memsz),
                p_align: u64(p.align),
            };
            out.extend_from_slice(bytes_of(&header));
        } else {
            let header = elf::ProgramHeader32::<Endianness> {
                p_type: u32(elf::PT_LOAD),
                p_offset: u32(p.offset as u32),
                p_vaddr: u32(p.vaddr as u32),
                p_paddr: u32(p.vaddr as u32),
                p_filesz: u32(p.filesz as u32),
                p_memsz: u32(p.memsz as u32),
                p_flags: u32(p.flags),
                p_align: u32(p.align as u32),
            };
            out.extend_from_slice(bytes_of(&header));
        }
    }

    fn section_header(&self, out: &mut Vec<u8>, s: &SectionHeader) {
        if self.is_64 {
            let header = elf::SectionHeader64::<Endianness> {
                sh_name: u32(s.name),
                sh_type: u32(s.sh_type),
                sh_flags: u64(s.flags),
                sh_addr: u64(s.addr),
                sh_offset: u64(s.offset),
                sh_size: u64(s.size),
                sh_link: u32(s.link),
                sh_info: u32(s.info),
                sh_addralign: u64(s.addralign),
                sh_entsize: u64(s.entsize),
            };
            out.extend_from_slice(bytes_of(&header));
        } else {
            let header = elf::SectionHeader32::<Endianness> {
                sh_name: u32(s.name),
                sh_type: u32(s.sh_type),
                sh_flags: u32(s.flags as u32),
                sh_addr: u32(s.addr as u32),
                sh_offset: u32(s.offset as u32),
                sh_size: u32(s.size as u32),
                sh_link: u32(s.link),
                sh_info: u32(s.info),
                sh_addralign: u32(s.addralign as u32),
                sh_entsize: u32(s.entsize as u32),
            };
            out.extend_from_slice(bytes_of(&header));
        }
    }

    fn symbol(&self, out: &mut Vec<u8>, s: &SymbolEntry) {
        if self.is_64 {
            let sym = elf::Sym64::<Endianness> {
                st_name: u32(s.name),
                st_info: s.info,
                st_other: elf::STV_DEFAULT,
                st_shndx: u16(s.shndx),
                st_value: u64(s.value),
                st_size: u64(0),
            };
            out.extend_from_slice(bytes_of(&sym));
        } else {
            let sym = elf::Sym32::<Endianness> {
                st_name: u32(s.name),
                st_value: u32(s.value as u32),
                st_size: u32(0),
                st_info: s.info,
                st_other: elf::STV_DEFAULT,
                st_shndx: u16(s.shndx),
            };
            out.extend_from_slice(bytes_of(&sym));
        }
    }
}

/// A NUL separated string table.
struct StringTable {
    data: Vec<u8>,
}

impl StringTable {
    fn new() -> Self {
        Self { data: vec![0] }
    }

    fn add(&mut self, name: &str) -> u32 {
        let offset = self.data.len() as u32;
        self.data.extend_from_slice(name.as_bytes());
        self.data.push(0);
        offset
    }
}

fn section_flags(kind: SectionKind) -> u64 {
    (match kind {
        SectionKind::Text => elf::SHF_ALLOC | elf::SHF_EXECINSTR,
        SectionKind::Data | SectionKind::UninitializedData => elf::SHF_ALLOC | elf::SHF_WRITE,
        _ => elf::SHF_ALLOC,
    }) as u64
}

fn segment_flags(kind: SectionKind) -> u32 {
    match kind {
        SectionKind::Text => elf::PF_R | elf::PF_X,
        SectionKind::Data => elf::PF_R | elf::PF_W,
        _ => elf::PF_R,
    }
}

fn symbol_info(sym: &Symbol) -> u8 {
    let bind = if sym.is_local { elf::STB_LOCAL } else { elf::STB_GLOBAL };
    let kind = match (sym.section, sym.is_local) {
        (Some(SectionId::Text), false) => elf::STT_FUNC,
        (Some(SectionId::Text), true) => elf::STT_NOTYPE,
        _ => elf::STT_OBJECT,
    };
    (bind << 4) | kind
}

/// Write an ELF executable to disk.
pub fn write_elf<A: Architecture + ?Sized>(
    output_path: &Path,
    arch: &A,
    unit: &Unit,
    segments: &[Segment],
    entry_point: u64,
    with_symtab: bool,
) -> Result<()> {
    let class = Class { is_64: arch.is_64bit() };
    let placed: Vec<SectionId> = segments.iter().flat_map(|s| s.sections.iter().copied()).collect();
    let shndx = |id: SectionId| {
        placed
            .iter()
            .position(|&p| p == id)
            .map_or(elf::SHN_ABS, |i| i as u16 + 1)
    };

    let mut shstrtab = StringTable::new();
    let mut headers = vec![SectionHeader {
        name: 0,
        sh_type: elf::SHT_NULL,
        flags: 0,
        addr: 0,
        offset: 0,
        size: 0,
        link: 0,
        info: 0,
        addralign: 0,
        entsize: 0,
    }];
    for &id in &placed {
        let section = unit.section(id);
        headers.push(SectionHeader {
            name: shstrtab.add(section.name),
            sh_type: if section.is_bss() { elf::SHT_NOBITS } else { elf::SHT_PROGBITS },
            flags: section_flags(section.kind),
            addr: section.address,
            offset: section.file_offset,
            size: section.len(),
            link: 0,
            info: 0,
            addralign: section.alignment,
            entsize: 0,
        });
    }

    // Non-loaded contents go after the last segment.
    let mut offset = segments
        .iter()
        .map(|s| s.file_offset + s.file_size)
        .max()
        .unwrap_or(class.ehdr_size() + class.phdr_size() * segments.len() as u64);
    let mut trailer: Vec<(u64, Vec<u8>)> = Vec::new();

    if let Some((name, sh_type, contents)) = arch.elf_attributes() {
        headers.push(SectionHeader {
            name: shstrtab.add(name),
            sh_type,
            flags: 0,
            addr: 0,
            offset,
            size: contents.len() as u64,
            link: 0,
            info: 0,
            addralign: 1,
            entsize: 0,
        });
        trailer.push((offset, contents.to_vec()));
        offset += contents.len() as u64;
    }

    if with_symtab {
        let mut strtab = StringTable::new();
        let mut symtab = Vec::new();
        class.symbol(
            &mut symtab,
            &SymbolEntry {
                name: 0,
                info: 0,
                shndx: elf::SHN_UNDEF,
                value: 0,
            },
        );
        // Locals come first; sh_info holds the index of the first global.
        let mut ordered: Vec<&Symbol> = unit.symbols().iter().filter(|s| s.is_defined()).collect();
        ordered.sort_by_key(|s| !s.is_local);
        let first_global = 1 + ordered.iter().filter(|s| s.is_local).count() as u32;
        for sym in ordered {
            let Some(section) = sym.section else { continue };
            class.symbol(
                &mut symtab,
                &SymbolEntry {
                    name: strtab.add(&sym.name),
                    info: symbol_info(sym),
                    shndx: shndx(section),
                    value: unit.section(section).address + sym.offset,
                },
            );
        }

        offset = align_up(offset, class.word_align());
        let symtab_index = headers.len() as u32;
        headers.push(SectionHeader {
            name: shstrtab.add(".symtab"),
            sh_type: elf::SHT_SYMTAB,
            flags: 0,
            addr: 0,
            offset,
            size: symtab.len() as u64,
            link: symtab_index + 1,
            info: first_global,
            addralign: class.word_align(),
            entsize: class.sym_size(),
        });
        let symtab_len = symtab.len() as u64;
        trailer.push((offset, symtab));
        offset += symtab_len;

        headers.push(SectionHeader {
            name: shstrtab.add(".strtab"),
            sh_type: elf::SHT_STRTAB,
            flags: 0,
            addr: 0,
            offset,
            size: strtab.data.len() as u64,
            link: 0,
            info: 0,
            addralign: 1,
            entsize: 0,
        });
        let strtab_len = strtab.data.len() as u64;
        trailer.push((offset, strtab.data));
        offset += strtab_len;
    }

    let shstrtab_name = shstrtab.add(".shstrtab");
    headers.push(SectionHeader {
        name: shstrtab_name,
        sh_type: elf::SHT_STRTAB,
        flags: 0,
        addr: 0,
        offset,
        size: shstrtab.data.len() as u64,
        link: 0,
        info: 0,
        addralign: 1,
        entsize: 0,
    });
    let shoff = align_up(offset + shstrtab.data.len() as u64, class.word_align());
    trailer.push((offset, shstrtab.data));

    // ELF file header and program headers
    let mut buffer = Vec::new();
    class.file_header(
        &mut buffer,
        arch.elf_machine(),
        arch.elf_flags(),
        entry_point,
        segments.len() as u16,
        shoff,
        headers.len() as u16,
    );
    for segment in segments {
        class.program_header(
            &mut buffer,
            &ProgramHeader {
                flags: segment_flags(segment.kind),
                offset: segment.file_offset,
                vaddr: segment.virtual_address,
                filesz: segment.file_size,
                memsz: segment.mem_size,
                align: arch.segment_alignment(),
            },
        );
    }

    // Section contents
    for &id in &placed {
        let section = unit.section(id);
        if section.is_bss() {
            continue;
        }
        buffer.resize(section.file_offset as usize, 0);
        buffer.extend_from_slice(&section.data);
    }
    for (at, contents) in trailer {
        buffer.resize(at as usize, 0);
        buffer.extend_from_slice(&contents);
    }

    buffer.resize(shoff as usize, 0);
    for header in &headers {
        class.section_header(&mut buffer, header);
    }

    // Write file
    std::fs::write(output_path, &buffer)
        .with_context(|| format!("failed to write {}", output_path.display()))?;

    // Make executable
    let mut perms = std::fs::metadata(output_path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(output_path, perms)?;

    Ok(())
}
