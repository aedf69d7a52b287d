//! Architecture abstraction.
//!
//! This module defines the `Architecture` trait, which encapsulates all
//! architecture-specific logic.
//! The unit builder, layout and relocation engine stay generic while each backend owns its
//! instruction catalog and knows its relocation types, padding and ELF identity.

use clap::ValueEnum;

use crate::error::AsmError;
use crate::symbolic::{InsReloc, Symbolic, WordIsa};

pub mod a32;
pub mod a64;
pub mod x86_64;

/// Target selection on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Target {
    A32,
    A64,
    #[value(name = "x86-64")]
    X86_64,
}

/// A relocation carried by an instruction, relative to the instruction start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReloc {
    pub r_type: u32,
    /// Byte offset of the patched field within the instruction.
    pub offset: usize,
    pub symbol: String,
    pub is_local: bool,
    pub addend: i64,
}

/// Machine code for one instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub bytes: Vec<u8>,
    pub reloc: Option<PendingReloc>,
}

/// Symbolic form of one decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub len: usize,
    pub mnemonic: String,
    pub operands: Vec<String>,
}

impl std::fmt::Display for Decoded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.mnemonic)?;
        for op in &self.operands {
            write!(f, " {}", op)?;
        }
        Ok(())
    }
}

/// A trait representing a target architecture (e.g., x86_64, AArch64).
pub trait Architecture {
    /// Short name used in diagnostics.
    fn name(&self) -> &'static str;

    /// ELF `e_machine` value.
    fn elf_machine(&self) -> u16;

    /// ELF `e_flags` value.
    fn elf_flags(&self) -> u32 {
        0
    }

    /// Whether executables use the 64-bit ELF class.
    fn is_64bit(&self) -> bool;

    /// Virtual address the executable image is based at.
    fn base_address(&self) -> u64;

    /// Alignment of loadable segments, in memory and in the file.
    fn segment_alignment(&self) -> u64;

    /// `len` bytes of no-op code used to pad the text section.
    fn code_padding(&self, len: usize) -> Vec<u8>;

    /// Relocation type for an address stored in data, by width in bytes.
    fn data_reloc(&self, width: usize) -> Result<u32, AsmError>;

    /// Assembles one instruction from its template name and operand tokens.
    fn assemble(&self, mnemonic: &str, tokens: &[&str]) -> Result<Encoded, AsmError>;

    /// Disassembles the instruction at the start of `data`. A relocation known to
    /// target this instruction is rendered as an `expr:` operand.
    fn disassemble(&self, data: &[u8], pending: Option<&PendingReloc>) -> Option<Decoded>;

    /// Applies a relocation to a buffer.
    ///
    /// # Arguments
    /// * `offset` - The offset within the buffer where the relocation should be applied.
    /// * `r_type` - The ELF relocation type.
    /// * `p` - The runtime address of the location being relocated (P).
    /// * `s` - The value of the symbol (S).
    /// * `a` - The addend (A).
    /// * `data` - The mutable buffer representing the section's data.
    fn apply_relocation(
        &self,
        offset: u64,
        r_type: u32,
        p: u64,
        s: u64,
        a: i64,
        data: &mut [u8],
    ) -> Result<(), AsmError>;

    /// Name of a relocation type for diagnostics.
    fn reloc_name(&self, r_type: u32) -> &'static str;

    /// Source of the `_start` function that calls `main` and exits with its result.
    fn startup_code(&self) -> &'static str;

    /// Granularity at which the disassembler resynchronizes after undecodable bytes.
    fn instruction_alignment(&self) -> usize {
        4
    }

    /// Contents of a processor specific attributes section, if the ABI wants one.
    fn elf_attributes(&self) -> Option<(&'static str, u32, &'static [u8])> {
        None
    }
}

fn slot<const N: usize>(data: &mut [u8], offset: u64) -> Result<&mut [u8; N], AsmError> {
    usize::try_from(offset)
        .ok()
        .and_then(|start| data.get_mut(start..start.checked_add(N)?))
        .and_then(|s| <&mut [u8; N]>::try_from(s).ok())
        .ok_or_else(|| {
            AsmError::syntax(format!("Relocation offset out of bounds at 0x{:x}", offset))
        })
}

/// Checks that `value` fits a two's complement field of `bits` bits.
pub(crate) fn fit_signed(value: i64, bits: u32, place: u64) -> Result<i64, AsmError> {
    let half = 1i64 << (bits - 1);
    if (-half..half).contains(&value) {
        Ok(value)
    } else {
        Err(AsmError::RelocationOverflow { place, value, bits })
    }
}

/// Writes a little endian value of `N` bytes after checking it fits.
pub(crate) fn write_le<const N: usize>(
    data: &mut [u8],
    offset: u64,
    p: u64,
    value: i64,
    signed: bool,
) -> Result<(), AsmError> {
    let bits = (N * 8) as u32;
    if bits < 64 {
        if signed {
            fit_signed(value, bits, p)?;
        } else if !(0..1i64 << bits).contains(&value) {
            return Err(AsmError::RelocationOverflow { place: p, value, bits });
        }
    }
    let bytes = value.to_le_bytes();
    slot::<N>(data, offset)?.copy_from_slice(&bytes[..N]);
    Ok(())
}

/// Assembles a word ISA instruction into little endian bytes.
pub(crate) fn word_assemble<K: Symbolic>(
    isa: &WordIsa<K>,
    mnemonic: &str,
    tokens: &[&str],
) -> Result<Encoded, AsmError> {
    let ins = isa.ins_from_symbolized(mnemonic, tokens)?;
    let word = isa.assemble(&ins)?;
    Ok(Encoded {
        bytes: word.to_le_bytes().to_vec(),
        reloc: ins.reloc.map(|r| PendingReloc {
            r_type: r.r_type,
            offset: 0,
            symbol: r.symbol,
            is_local: r.is_local,
            addend: r.addend,
        }),
    })
}

/// Disassembles a little endian word, rendering a pending relocation symbolically.
pub(crate) fn word_disassemble<K: Symbolic>(
    isa: &WordIsa<K>,
    data: &[u8],
    pending: Option<&PendingReloc>,
) -> Option<Decoded> {
    let word = u32::from_le_bytes(data.get(..4)?.try_into().ok()?);
    let mut ins = isa.disassemble(word)?;
    if let Some(p) = pending {
        isa.attach_reloc(
            &mut ins,
            InsReloc {
                r_type: p.r_type,
                pos: 0,
                symbol: p.symbol.clone(),
                is_local: p.is_local,
                addend: p.addend,
            },
        );
    }
    let (mnemonic, operands) = isa.ins_symbolize(&ins);
    Some(Decoded {
        len: 4,
        mnemonic,
        operands,
    })
}

/// Decodes the word at `offset`, substitutes the relocated operand and re-encodes it.
pub(crate) fn word_patch<K: Symbolic>(
    isa: &WordIsa<K>,
    data: &mut [u8],
    offset: u64,
    r_type: u32,
    value: i64,
) -> Result<(), AsmError> {
    let slot = slot::<4>(data, offset)?;
    let patched = isa.patch(r_type, u32::from_le_bytes(*slot), value)?;
    *slot = patched.to_le_bytes();
    Ok(())
}

/// `len` bytes made of repetitions of a fixed no-op.
pub(crate) fn repeat_nop(nop: &[u8], len: usize) -> Vec<u8> {
    nop.iter().copied().cycle().take(len).collect()
}
