//! Unit builder.
//!
//! A `Unit` collects the output of one assembly pass: the four output sections, the
//! symbol table and the relocations still to be applied. It is filled front to back by
//! `Unit::apply` (directives) and `Unit::add_ins` (instructions) and then handed to the
//! linker, which assigns addresses and resolves every relocation exactly once.
//!
//! Sections own their bytes. Symbols and relocations refer to a section by `SectionId`
//! and to a symbol by `SymbolId`, so all patching goes through the owning section.

use std::collections::HashMap;

use object::SectionKind;
use tracing::trace;

use crate::arch::{Architecture, Encoded};
use crate::error::AsmError;
use crate::utils::align_up;

/// Name of the symbol marking the end of writable data.
pub const RW_DATA_END: &str = "$$rw_data_end";

/// Largest alignment a function, label or memory block may request.
pub const MAX_ALIGNMENT: u64 = 1 << 16;

/// Largest size a section may grow to.
pub const MAX_SECTION_SIZE: u64 = 1 << 30;

/// The output sections, in layout order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionId {
    Text,
    Rodata,
    Data,
    Bss,
}

impl SectionId {
    pub const ALL: [SectionId; 4] = [
        SectionId::Text,
        SectionId::Rodata,
        SectionId::Data,
        SectionId::Bss,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Parses the kind argument of `.mem`.
    pub fn from_mem_kind(kind: &str) -> Option<Self> {
        match kind {
            "rodata" => Some(SectionId::Rodata),
            "data" => Some(SectionId::Data),
            "bss" => Some(SectionId::Bss),
            _ => None,
        }
    }
}

/// An output section: a growable byte buffer with an alignment requirement.
#[derive(Debug, Clone)]
pub struct Section {
    pub name: &'static str,
    pub kind: SectionKind,
    pub alignment: u64,
    /// Contents. Bss keeps its zeros here too; they are not written to the file.
    pub data: Vec<u8>,
    /// Virtual address, assigned by layout.
    pub address: u64,
    /// File offset, assigned by layout.
    pub file_offset: u64,
}

impl Section {
    fn new(name: &'static str, kind: SectionKind) -> Self {
        Self {
            name,
            kind,
            alignment: 1,
            data: Vec::new(),
            address: 0,
            file_offset: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_bss(&self) -> bool {
        self.kind == SectionKind::UninitializedData
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Pads to a multiple of `alignment` with bytes from `filler` and raises the
    /// section alignment to at least `alignment`.
    pub fn pad_to(
        &mut self,
        alignment: u64,
        filler: impl FnOnce(usize) -> Vec<u8>,
    ) -> Result<(), AsmError> {
        if alignment > MAX_ALIGNMENT {
            return Err(AsmError::syntax(format!(
                "alignment {:#x} exceeds the maximum of {:#x}",
                alignment, MAX_ALIGNMENT
            )));
        }
        self.alignment = self.alignment.max(alignment);
        let missing = (align_up(self.len(), alignment) - self.len()) as usize;
        if missing > 0 {
            let padding = filler(missing);
            self.data.extend_from_slice(&padding[..missing.min(padding.len())]);
            self.data.resize(self.data.len() + missing.saturating_sub(padding.len()), 0);
        }
        Ok(())
    }
}

/// Index of a symbol in its unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolId(usize);

impl SymbolId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    /// Scoped to the function (or the stretch up to the next function end) it was
    /// declared in.
    pub is_local: bool,
    /// Defining section, `None` while the symbol is only forward declared.
    pub section: Option<SectionId>,
    /// Offset within `section`.
    pub offset: u64,
}

impl Symbol {
    pub fn is_defined(&self) -> bool {
        self.section.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocState {
    Pending,
    Resolved,
}

/// A patch to apply once addresses are known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reloc {
    pub r_type: u32,
    pub section: SectionId,
    /// Offset of the patched bytes within `section`.
    pub offset: u64,
    pub symbol: SymbolId,
    pub addend: i64,
    pub state: RelocState,
}

/// One parsed directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive<'a> {
    Fun { name: &'a str, alignment: u64 },
    EndFun,
    Mem { name: &'a str, alignment: u64, section: SectionId, is_local: bool },
    EndMem,
    Data { repeats: usize, bytes: Vec<u8> },
    AddrFun { width: usize, name: &'a str },
    AddrBbl { width: usize, name: &'a str },
    AddrMem { width: usize, name: &'a str, addend: i64 },
    Bbl { name: &'a str, alignment: u64 },
}

#[derive(Debug)]
pub struct Unit {
    sections: [Section; 4],
    symbols: Vec<Symbol>,
    globals: HashMap<String, SymbolId>,
    locals: HashMap<String, SymbolId>,
    relocs: Vec<Reloc>,
    mem_section: Option<SectionId>,
    current_fun: Option<String>,
}

impl Default for Unit {
    fn default() -> Self {
        Self::new()
    }
}

impl Unit {
    pub fn new() -> Self {
        Self {
            sections: [
                Section::new(".text", SectionKind::Text),
                Section::new(".rodata", SectionKind::ReadOnlyData),
                Section::new(".data", SectionKind::Data),
                Section::new(".bss", SectionKind::UninitializedData),
            ],
            symbols: Vec::new(),
            globals: HashMap::new(),
            locals: HashMap::new(),
            relocs: Vec::new(),
            mem_section: None,
            current_fun: None,
        }
    }

    pub fn section(&self, id: SectionId) -> &Section {
        &self.sections[id.index()]
    }

    pub fn section_mut(&mut self, id: SectionId) -> &mut Section {
        &mut self.sections[id.index()]
    }

    pub fn sections(&self) -> impl Iterator<Item = (SectionId, &Section)> {
        SectionId::ALL.into_iter().zip(self.sections.iter())
    }

    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.0]
    }

    /// All symbols in creation order, including locals of finished functions.
    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    /// A global symbol by name.
    pub fn global(&self, name: &str) -> Option<SymbolId> {
        self.globals.get(name).copied()
    }

    /// A symbol of the current local scope by name.
    pub fn local(&self, name: &str) -> Option<SymbolId> {
        self.locals.get(name).copied()
    }

    pub fn relocs(&self) -> &[Reloc] {
        &self.relocs
    }

    /// Splits the unit into the parts the relocation engine needs at once.
    pub fn relocation_parts(&mut self) -> (&mut [Section; 4], &[Symbol], &mut [Reloc]) {
        (&mut self.sections, &self.symbols, &mut self.relocs)
    }

    /// Name of the function currently open, if any.
    pub fn current_fun(&self) -> Option<&str> {
        self.current_fun.as_deref()
    }

    /// Virtual address of a defined symbol after layout.
    pub fn symbol_address(&self, id: SymbolId) -> Option<u64> {
        let sym = self.symbol(id);
        sym.section.map(|s| self.section(s).address + sym.offset)
    }

    /// Defines a symbol at the end of `section`, or declares it if `section` is
    /// `None`. A forward declared symbol is filled in, keeping its id.
    pub fn add_symbol(
        &mut self,
        name: &str,
        section: Option<SectionId>,
        is_local: bool,
    ) -> Result<SymbolId, AsmError> {
        let offset = section.map_or(0, |s| self.section(s).len());
        let map = if is_local { &mut self.locals } else { &mut self.globals };
        if let Some(&id) = map.get(name) {
            let sym = &mut self.symbols[id.0];
            if let Some(section) = section {
                if sym.is_defined() {
                    return Err(AsmError::Redefinition(name.to_string()));
                }
                sym.section = Some(section);
                sym.offset = offset;
                trace!("defined forward declared {} at {:?}+0x{:x}", name, section, offset);
            }
            return Ok(id);
        }
        let id = SymbolId(self.symbols.len());
        map.insert(name.to_string(), id);
        self.symbols.push(Symbol {
            name: name.to_string(),
            is_local,
            section,
            offset,
        });
        trace!("added symbol {} ({:?}+0x{:x})", name, section, offset);
        Ok(id)
    }

    /// Returns the symbol of that name and scope, declaring it if needed.
    pub fn find_or_add_symbol(&mut self, name: &str, is_local: bool) -> SymbolId {
        let map = if is_local { &self.locals } else { &self.globals };
        if let Some(&id) = map.get(name) {
            return id;
        }
        let id = SymbolId(self.symbols.len());
        let map = if is_local { &mut self.locals } else { &mut self.globals };
        map.insert(name.to_string(), id);
        self.symbols.push(Symbol {
            name: name.to_string(),
            is_local,
            section: None,
            offset: 0,
        });
        id
    }

    /// Records a relocation `offset_in_item` bytes past the current end of `section`.
    pub fn add_reloc(
        &mut self,
        r_type: u32,
        section: SectionId,
        symbol: SymbolId,
        addend: i64,
        offset_in_item: usize,
    ) {
        let offset = self.section(section).len() + offset_in_item as u64;
        self.relocs.push(Reloc {
            r_type,
            section,
            offset,
            symbol,
            addend,
            state: RelocState::Pending,
        });
    }

    pub fn fun_start<A: Architecture + ?Sized>(
        &mut self,
        arch: &A,
        name: &str,
        alignment: u64,
    ) -> Result<(), AsmError> {
        if let Some(open) = &self.current_fun {
            return Err(AsmError::syntax(format!("function {} is still open", open)));
        }
        self.section_mut(SectionId::Text)
            .pad_to(alignment, |n| arch.code_padding(n))?;
        self.add_symbol(name, Some(SectionId::Text), false)?;
        self.current_fun = Some(name.to_string());
        Ok(())
    }

    /// Closes the current function and drops its local scope. Every local referenced
    /// in the function must be defined by now.
    pub fn fun_end(&mut self) -> Result<(), AsmError> {
        let name = self
            .current_fun
            .take()
            .ok_or_else(|| AsmError::syntax(".endfun without .fun"))?;
        let mut undefined: Vec<&str> = self
            .locals
            .iter()
            .filter(|(_, id)| !self.symbols[id.0].is_defined())
            .map(|(n, _)| n.as_str())
            .collect();
        if !undefined.is_empty() {
            undefined.sort_unstable();
            return Err(AsmError::UndefinedSymbol(format!(
                "{} (in {})",
                undefined.join(", "),
                name
            )));
        }
        self.locals.clear();
        Ok(())
    }

    pub fn mem_start(
        &mut self,
        name: &str,
        alignment: u64,
        section: SectionId,
        is_local: bool,
    ) -> Result<(), AsmError> {
        if self.mem_section.is_some() {
            return Err(AsmError::syntax(".mem inside .mem"));
        }
        if section == SectionId::Text {
            return Err(AsmError::syntax("memory cannot live in the text section"));
        }
        self.section_mut(section).pad_to(alignment, |n| vec![0; n])?;
        self.add_symbol(name, Some(section), is_local)?;
        self.mem_section = Some(section);
        Ok(())
    }

    pub fn mem_end(&mut self) -> Result<(), AsmError> {
        self.mem_section
            .take()
            .map(|_| ())
            .ok_or_else(|| AsmError::syntax(".endmem without .mem"))
    }

    fn active_mem(&self) -> Result<SectionId, AsmError> {
        self.mem_section
            .ok_or_else(|| AsmError::syntax("data outside of .mem"))
    }

    /// Appends `repeats` copies of `bytes` to the active memory section.
    pub fn add_data(&mut self, repeats: usize, bytes: &[u8]) -> Result<(), AsmError> {
        let section = self.active_mem()?;
        if section == SectionId::Bss && bytes.iter().any(|&b| b != 0) {
            return Err(AsmError::syntax("bss holds zeros only"));
        }
        let sec = self.section_mut(section);
        let size = repeats
            .checked_mul(bytes.len())
            .and_then(|n| (n as u64).checked_add(sec.len()))
            .filter(|&n| n <= MAX_SECTION_SIZE)
            .ok_or_else(|| {
                AsmError::syntax(format!(
                    "{} copies of {} bytes overflow section {}",
                    repeats,
                    bytes.len(),
                    sec.name
                ))
            })?;
        let grow = size as usize - sec.data.len();
        sec.data.extend(bytes.iter().copied().cycle().take(grow));
        Ok(())
    }

    fn add_addr(
        &mut self,
        r_type: u32,
        width: usize,
        symbol: SymbolId,
        addend: i64,
    ) -> Result<(), AsmError> {
        let section = self.active_mem()?;
        if section == SectionId::Bss {
            return Err(AsmError::syntax("bss cannot hold addresses"));
        }
        self.add_reloc(r_type, section, symbol, addend, 0);
        self.section_mut(section).add_bytes(&vec![0; width]);
        Ok(())
    }

    pub fn add_fun_addr(&mut self, r_type: u32, width: usize, fun: &str) -> Result<(), AsmError> {
        let symbol = self.find_or_add_symbol(fun, false);
        self.add_addr(r_type, width, symbol, 0)
    }

    pub fn add_bbl_addr(&mut self, r_type: u32, width: usize, bbl: &str) -> Result<(), AsmError> {
        if self.current_fun.is_none() {
            return Err(AsmError::syntax("basic block address outside of .fun"));
        }
        let symbol = self.find_or_add_symbol(bbl, true);
        self.add_addr(r_type, width, symbol, 0)
    }

    pub fn add_mem_addr(
        &mut self,
        r_type: u32,
        width: usize,
        mem: &str,
        addend: i64,
    ) -> Result<(), AsmError> {
        let symbol = self.find_or_add_symbol(mem, false);
        self.add_addr(r_type, width, symbol, addend)
    }

    /// Defines a local label at the current, padded text offset.
    pub fn add_label<A: Architecture + ?Sized>(
        &mut self,
        arch: &A,
        name: &str,
        alignment: u64,
    ) -> Result<(), AsmError> {
        if self.current_fun.is_none() {
            return Err(AsmError::syntax(format!("label {} outside of .fun", name)));
        }
        self.section_mut(SectionId::Text)
            .pad_to(alignment, |n| arch.code_padding(n))?;
        self.add_symbol(name, Some(SectionId::Text), true)?;
        Ok(())
    }

    /// Appends an assembled instruction and records its relocation.
    pub fn add_ins(&mut self, ins: Encoded) -> Result<(), AsmError> {
        if self.current_fun.is_none() {
            return Err(AsmError::syntax("instruction outside of .fun"));
        }
        if let Some(r) = ins.reloc {
            let symbol = self.find_or_add_symbol(&r.symbol, r.is_local);
            self.add_reloc(r.r_type, SectionId::Text, symbol, r.addend, r.offset);
        }
        self.section_mut(SectionId::Text).add_bytes(&ins.bytes);
        Ok(())
    }

    /// Adds the end-of-writable-data marker. Called once, after all user input.
    pub fn add_linker_defs(&mut self) -> Result<(), AsmError> {
        for id in [SectionId::Bss, SectionId::Data] {
            if !self.section(id).is_empty() {
                self.section_mut(id).pad_to(16, |n| vec![0; n])?;
                self.add_symbol(RW_DATA_END, Some(id), false)?;
                break;
            }
        }
        Ok(())
    }

    /// Checks that no function or memory block was left open.
    pub fn check_closed(&self) -> Result<(), AsmError> {
        if let Some(name) = &self.current_fun {
            return Err(AsmError::syntax(format!("function {} is missing .endfun", name)));
        }
        if self.mem_section.is_some() {
            return Err(AsmError::syntax("missing .endmem"));
        }
        Ok(())
    }

    /// Executes one directive.
    pub fn apply<A: Architecture + ?Sized>(
        &mut self,
        arch: &A,
        directive: Directive<'_>,
    ) -> Result<(), AsmError> {
        match directive {
            Directive::Fun { name, alignment } => self.fun_start(arch, name, alignment),
            Directive::EndFun => self.fun_end(),
            Directive::Mem {
                name,
                alignment,
                section,
                is_local,
            } => self.mem_start(name, alignment, section, is_local),
            Directive::EndMem => self.mem_end(),
            Directive::Data { repeats, bytes } => self.add_data(repeats, &bytes),
            Directive::AddrFun { width, name } => {
                self.add_fun_addr(arch.data_reloc(width)?, width, name)
            }
            Directive::AddrBbl { width, name } => {
                self.add_bbl_addr(arch.data_reloc(width)?, width, name)
            }
            Directive::AddrMem { width, name, addend } => {
                self.add_mem_addr(arch.data_reloc(width)?, width, name, addend)
            }
            Directive::Bbl { name, alignment } => self.add_label(arch, name, alignment),
        }
    }
}
