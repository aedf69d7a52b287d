//! Core Linker logic.
//!
//! This module contains the `Linker` struct which turns an assembled `Unit` into an
//! executable:
//! 1. Verification: every referenced symbol must be defined.
//! 2. Layout: sections are grouped into segments and assigned virtual addresses.
//! 3. Relocation: each pending relocation is applied exactly once.
//! 4. Output: the final ELF executable is written.

use anyhow::{anyhow, bail, Context, Result};
use std::path::Path;
use tracing::{debug, info, trace};

use crate::arch::Architecture;
use crate::error::AsmError;
use crate::layout::{self, Segment};
use crate::unit::{RelocState, Unit};
use crate::writer;

pub struct Linker<A: Architecture> {
    arch: A,
    unit: Unit,
    segments: Vec<Segment>,
}

impl<A: Architecture> Linker<A> {
    pub fn new(arch: A, unit: Unit) -> Self {
        Self {
            arch,
            unit,
            segments: Vec::new(),
        }
    }

    pub fn arch(&self) -> &A {
        &self.arch
    }

    pub fn unit(&self) -> &Unit {
        &self.unit
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Fails if a relocation refers to a symbol that was never defined.
    pub fn verify_unresolved(&self) -> Result<()> {
        let mut missing: Vec<&str> = self
            .unit
            .relocs()
            .iter()
            .map(|r| self.unit.symbol(r.symbol))
            .filter(|s| !s.is_defined())
            .map(|s| s.name.as_str())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        missing.sort_unstable();
        missing.dedup();
        Err(AsmError::UndefinedSymbol(missing.join(", ")).into())
    }

    pub fn layout(&mut self) -> Result<()> {
        self.segments = layout::layout(&self.arch, &mut self.unit);
        debug!("{} segments", self.segments.len());
        Ok(())
    }

    /// Applies every pending relocation. Requires layout to have run.
    pub fn relocate(&mut self) -> Result<()> {
        self.verify_unresolved()?;
        let arch = &self.arch;
        let (sections, symbols, relocs) = self.unit.relocation_parts();
        for reloc in relocs.iter_mut() {
            let symbol = &symbols[reloc.symbol.index()];
            if reloc.state == RelocState::Resolved {
                bail!(
                    "relocation {} against {} at {}+0x{:x} is already resolved",
                    arch.reloc_name(reloc.r_type),
                    symbol.name,
                    sections[reloc.section.index()].name,
                    reloc.offset
                );
            }
            let defined_in = symbol
                .section
                .ok_or_else(|| AsmError::UndefinedSymbol(symbol.name.clone()))?;
            let s = sections[defined_in.index()].address + symbol.offset;
            let section = &mut sections[reloc.section.index()];
            let p = section.address + reloc.offset;
            trace!(
                "{} at 0x{:x}: S=0x{:x} ({}) A={}",
                arch.reloc_name(reloc.r_type),
                p,
                s,
                symbol.name,
                reloc.addend
            );
            arch.apply_relocation(reloc.offset, reloc.r_type, p, s, reloc.addend, &mut section.data)
                .with_context(|| {
                    format!(
                        "failed to apply {} against {} in {}",
                        arch.reloc_name(reloc.r_type),
                        symbol.name,
                        section.name
                    )
                })?;
            reloc.state = RelocState::Resolved;
        }

        if let Some(r) = relocs.iter().find(|r| r.state != RelocState::Resolved) {
            bail!("relocation at 0x{:x} was left pending", r.offset);
        }
        debug!("applied {} relocations", relocs.len());
        Ok(())
    }

    /// Virtual address of a global symbol after layout.
    pub fn symbol_address(&self, name: &str) -> Option<u64> {
        self.unit.global(name).and_then(|id| self.unit.symbol_address(id))
    }

    pub fn write(&self, output_path: &Path, with_symtab: bool) -> Result<()> {
        let entry_point = self
            .symbol_address("_start")
            .ok_or_else(|| anyhow!("entry point _start is not defined"))?;
        writer::write_elf(
            output_path,
            &self.arch,
            &self.unit,
            &self.segments,
            entry_point,
            with_symtab,
        )?;
        info!(
            "wrote {} executable {} (entry 0x{:x})",
            self.arch.name(),
            output_path.display(),
            entry_point
        );
        Ok(())
    }
}
