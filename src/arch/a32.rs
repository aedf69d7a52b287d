//! ARM32 (A32) Architecture backend.
//!
//! Implements the `Architecture` trait for 32-bit ARM in ARM state (ELF32, EABI v5).
//! Instructions are fixed 32-bit words; most carry a condition predicate in bits 28..31
//! as their first operand. The predicate may be left out when assembling, in which case
//! it defaults to `al`.

use object::elf;

use super::{
    fit_signed, repeat_nop, word_assemble, word_disassemble, word_patch, write_le, Architecture,
    Decoded, Encoded, PendingReloc,
};
use crate::catalog::OverlapRule;
use crate::codec::{BitRange, FieldKind, Modifier};
use crate::error::AsmError;
use crate::opcode::{Discriminant, Opcode, OpcodeFlags, SrUpdate};
use crate::symbolic::{RelocKind, Symbolic, Vocabulary, WordIsa};

const EF_ARM_EABI_VER5: u32 = 0x0500_0000;
const SHT_ARM_ATTRIBUTES: u32 = 0x7000_0003;

/// Build attributes for the "aeabi" vendor: a file scope with `Tag_ARM_ISA_use` set.
const ATTRIBUTES: [u8; 18] = [
    0x41, 0x11, 0, 0, 0, 0x61, 0x65, 0x61, 0x62, 0x69, 0, 1, 7, 0, 0, 0, 8, 1,
];

/// `mov r0, r0` style hint: `nop` with the `al` predicate.
const NOP: [u8; 4] = [0x00, 0xf0, 0x20, 0xe3];

/// Bits 20..27 are fixed in almost every template.
const DISCRIMINANT: Discriminant = Discriminant { shift: 20, width: 8 };

/// Operand kinds. The name spells out the bits an operand occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum A32Field {
    Reg0_3,
    Reg8_11,
    Reg12_15,
    Reg16_19,
    /// First register of an even/odd pair.
    RegPair12_15,
    Dreg0_3_5,
    Dreg12_15_22,
    Dreg16_19_7,
    Sreg0_3_5,
    Sreg12_15_22,
    Sreg16_19_7,
    ShiftMode5_6,
    Reglist0_15,
    RegRange0_7,
    RegRange1_7,
    Pred28_31,
    Imm0_7Times4,
    Imm0_11,
    Imm0_3_8_11,
    Imm7_11,
    Imm10_11Times8,
    Imm0_23,
    Imm0_7_8_11,
    /// Implicit `0.0` of the compare-with-zero forms.
    ImmFltZero,
    Imm0_11_16_19,
    Simm0_23,
    /// Implicit `lr` written by `bl`.
    RegLink,
}

impl FieldKind for A32Field {
    fn ranges(self) -> &'static [BitRange] {
        use Modifier::*;
        match self {
            A32Field::Reg0_3 => ranges![(Verbatim, 4, 0)],
            A32Field::Reg8_11 => ranges![(Verbatim, 4, 8)],
            A32Field::Reg12_15 | A32Field::RegPair12_15 => ranges![(Verbatim, 4, 12)],
            A32Field::Reg16_19 => ranges![(Verbatim, 4, 16)],
            A32Field::Dreg0_3_5 => ranges![(Hi, 1, 5), (Lo, 4, 0)],
            A32Field::Dreg12_15_22 => ranges![(Hi, 1, 22), (Lo, 4, 12)],
            A32Field::Dreg16_19_7 => ranges![(Hi, 1, 7), (Lo, 4, 16)],
            A32Field::Sreg0_3_5 => ranges![(Hi, 4, 0), (Lo, 1, 5)],
            A32Field::Sreg12_15_22 => ranges![(Hi, 4, 12), (Lo, 1, 22)],
            A32Field::Sreg16_19_7 => ranges![(Hi, 4, 16), (Lo, 1, 7)],
            A32Field::ShiftMode5_6 => ranges![(Verbatim, 2, 5)],
            A32Field::Reglist0_15 => ranges![(Verbatim, 16, 0)],
            A32Field::RegRange0_7 => ranges![(Verbatim, 8, 0)],
            A32Field::RegRange1_7 => ranges![(Verbatim, 7, 1)],
            A32Field::Pred28_31 => ranges![(Verbatim, 4, 28)],
            A32Field::Imm0_7Times4 => ranges![(Scaled(4), 8, 0)],
            A32Field::Imm0_11 => ranges![(Verbatim, 12, 0)],
            A32Field::Imm0_3_8_11 => ranges![(Hi, 4, 8), (Lo, 4, 0)],
            A32Field::Imm7_11 => ranges![(Verbatim, 5, 7)],
            A32Field::Imm10_11Times8 => ranges![(Scaled(8), 2, 10)],
            A32Field::Imm0_23 => ranges![(Verbatim, 24, 0)],
            A32Field::Imm0_7_8_11 => ranges![(Rotated, 12, 0)],
            A32Field::ImmFltZero => ranges![(Force(0), 0, 0)],
            A32Field::Imm0_11_16_19 => ranges![(Hi, 4, 16), (Lo, 12, 0)],
            A32Field::Simm0_23 => ranges![(Signed, 24, 0)],
            A32Field::RegLink => ranges![(Force(14), 0, 0)],
        }
    }
}

const REGS: &[&str] = &[
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "sl", "fp", "ip", "sp", "lr", "pc",
];

const REG_ALIASES: &[(&str, i64)] = &[
    ("r10", 10),
    ("r11", 11),
    ("r12", 12),
    ("r13", 13),
    ("r14", 14),
    ("r15", 15),
];

const PREDS: &[&str] = &[
    "eq", "ne", "cs", "cc", "mi", "pl", "vs", "vc", "hi", "ls", "ge", "lt", "gt", "le", "al", "nv",
];

const SHIFTS: &[&str] = &["lsl", "lsr", "asr", "ror"];

const SREGS: &[&str] = &[
    "s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "s12", "s13", "s14",
    "s15", "s16", "s17", "s18", "s19", "s20", "s21", "s22", "s23", "s24", "s25", "s26", "s27",
    "s28", "s29", "s30", "s31",
];

const DREGS: &[&str] = &[
    "d0", "d1", "d2", "d3", "d4", "d5", "d6", "d7", "d8", "d9", "d10", "d11", "d12", "d13", "d14",
    "d15", "d16", "d17", "d18", "d19", "d20", "d21", "d22", "d23", "d24", "d25", "d26", "d27",
    "d28", "d29", "d30", "d31",
];

impl Symbolic for A32Field {
    fn vocabulary(self) -> Vocabulary {
        match self {
            A32Field::Reg0_3
            | A32Field::Reg8_11
            | A32Field::Reg12_15
            | A32Field::Reg16_19
            | A32Field::RegPair12_15
            | A32Field::RegLink => Vocabulary::Names(REGS, REG_ALIASES),
            A32Field::Dreg0_3_5 | A32Field::Dreg12_15_22 | A32Field::Dreg16_19_7 => {
                Vocabulary::Names(DREGS, &[])
            }
            A32Field::Sreg0_3_5 | A32Field::Sreg12_15_22 | A32Field::Sreg16_19_7 => {
                Vocabulary::Names(SREGS, &[])
            }
            A32Field::ShiftMode5_6 => Vocabulary::Names(SHIFTS, &[]),
            A32Field::Pred28_31 => Vocabulary::Names(PREDS, &[]),
            A32Field::ImmFltZero => Vocabulary::Names(&["0.0"], &[("0", 0)]),
            A32Field::Reglist0_15 => Vocabulary::Hex("reglist:"),
            A32Field::RegRange0_7 | A32Field::RegRange1_7 => Vocabulary::Prefixed("regrange:"),
            A32Field::Simm0_23 => Vocabulary::Signed,
            A32Field::Imm0_7Times4
            | A32Field::Imm0_11
            | A32Field::Imm0_3_8_11
            | A32Field::Imm7_11
            | A32Field::Imm10_11Times8
            | A32Field::Imm0_23
            | A32Field::Imm0_7_8_11
            | A32Field::Imm0_11_16_19 => Vocabulary::Unsigned,
        }
    }
}

const RELOCS: &[RelocKind] = &[
    RelocKind {
        name: "abs32",
        r_type: elf::R_ARM_ABS32,
        implies_local: false,
        sample: None,
    },
    RelocKind {
        name: "call",
        r_type: elf::R_ARM_CALL,
        implies_local: false,
        sample: Some("bl al lr expr:call:x"),
    },
    RelocKind {
        name: "jump24",
        r_type: elf::R_ARM_JUMP24,
        implies_local: true,
        sample: Some("b al expr:jump24:x"),
    },
    RelocKind {
        name: "movw_abs_nc",
        r_type: elf::R_ARM_MOVW_ABS_NC,
        implies_local: false,
        sample: Some("movw al r0 expr:movw_abs_nc:x"),
    },
    RelocKind {
        name: "movt_abs",
        r_type: elf::R_ARM_MOVT_ABS,
        implies_local: false,
        sample: Some("movt al r0 expr:movt_abs:x"),
    },
];

/// `(mask, value, pos)` run of fixed bits.
type Bits = (u32, u32, u32);

const ROOT00: Bits = (3, 0, 26);
const ROOT01: Bits = (3, 1, 26);
const ROOT10: Bits = (3, 2, 26);
const ROOT11: Bits = (3, 3, 26);

// P[24] pre/post, U[23] add/sub, W[21] write back
#[rustfmt::skip]
const STANDARD_ADDR_MODES: [(&str, [Bits; 2], OpcodeFlags); 6] = [
    ("sub_post", [(3, 0, 23), (1, 0, 21)], OpcodeFlags(OpcodeFlags::ADDR_POST.0 | OpcodeFlags::ADDR_DEC.0 | OpcodeFlags::ADDR_UPDATE.0)),
    ("add_post", [(3, 1, 23), (1, 0, 21)], OpcodeFlags(OpcodeFlags::ADDR_POST.0 | OpcodeFlags::ADDR_INC.0 | OpcodeFlags::ADDR_UPDATE.0)),
    ("sub", [(3, 2, 23), (1, 0, 21)], OpcodeFlags(OpcodeFlags::ADDR_PRE.0 | OpcodeFlags::ADDR_DEC.0)),
    ("add", [(3, 3, 23), (1, 0, 21)], OpcodeFlags(OpcodeFlags::ADDR_PRE.0 | OpcodeFlags::ADDR_INC.0)),
    ("sub_pre", [(3, 2, 23), (1, 1, 21)], OpcodeFlags(OpcodeFlags::ADDR_PRE.0 | OpcodeFlags::ADDR_DEC.0 | OpcodeFlags::ADDR_UPDATE.0)),
    ("add_pre", [(3, 3, 23), (1, 1, 21)], OpcodeFlags(OpcodeFlags::ADDR_PRE.0 | OpcodeFlags::ADDR_INC.0 | OpcodeFlags::ADDR_UPDATE.0)),
];

const LIMITED_ADDR_MODES: [(&str, Bits, OpcodeFlags); 2] = [
    ("sub", (1, 0, 23), OpcodeFlags(OpcodeFlags::ADDR_PRE.0 | OpcodeFlags::ADDR_DEC.0)),
    ("add", (1, 1, 23), OpcodeFlags(OpcodeFlags::ADDR_PRE.0 | OpcodeFlags::ADDR_INC.0)),
];

#[rustfmt::skip]
const MULTI_ADDR_MODES: [(&str, bool, [Bits; 2], OpcodeFlags); 8] = [
    ("da", false, [(3, 0, 23), (1, 0, 21)], OpcodeFlags(OpcodeFlags::ADDR_POST.0 | OpcodeFlags::ADDR_DEC.0)),
    ("ia", false, [(3, 1, 23), (1, 0, 21)], OpcodeFlags(OpcodeFlags::ADDR_POST.0 | OpcodeFlags::ADDR_INC.0)),
    ("db", false, [(3, 2, 23), (1, 0, 21)], OpcodeFlags(OpcodeFlags::ADDR_PRE.0 | OpcodeFlags::ADDR_DEC.0)),
    ("ib", false, [(3, 3, 23), (1, 0, 21)], OpcodeFlags(OpcodeFlags::ADDR_PRE.0 | OpcodeFlags::ADDR_INC.0)),
    ("da", true, [(3, 0, 23), (1, 1, 21)], OpcodeFlags(OpcodeFlags::ADDR_POST.0 | OpcodeFlags::ADDR_DEC.0 | OpcodeFlags::ADDR_UPDATE.0)),
    ("ia", true, [(3, 1, 23), (1, 1, 21)], OpcodeFlags(OpcodeFlags::ADDR_POST.0 | OpcodeFlags::ADDR_INC.0 | OpcodeFlags::ADDR_UPDATE.0)),
    ("db", true, [(3, 2, 23), (1, 1, 21)], OpcodeFlags(OpcodeFlags::ADDR_PRE.0 | OpcodeFlags::ADDR_DEC.0 | OpcodeFlags::ADDR_UPDATE.0)),
    ("ib", true, [(3, 3, 23), (1, 1, 21)], OpcodeFlags(OpcodeFlags::ADDR_PRE.0 | OpcodeFlags::ADDR_INC.0 | OpcodeFlags::ADDR_UPDATE.0)),
];

/// Collects templates in registration order.
struct Table {
    ops: Vec<Opcode<A32Field>>,
}

impl Table {
    /// Registers a predicated template; the predicate becomes operand 0.
    fn add(
        &mut self,
        mnemonic: &str,
        variant: &str,
        bits: &[Bits],
        fields: &[A32Field],
        flags: OpcodeFlags,
    ) -> &mut Opcode<A32Field> {
        let mut all = Vec::with_capacity(fields.len() + 1);
        all.push(A32Field::Pred28_31);
        all.extend_from_slice(fields);
        self.push(mnemonic, variant, bits, all, flags)
    }

    fn add_unpredicated(
        &mut self,
        mnemonic: &str,
        variant: &str,
        bits: &[Bits],
        fields: &[A32Field],
        flags: OpcodeFlags,
    ) -> &mut Opcode<A32Field> {
        self.push(mnemonic, variant, bits, fields.to_vec(), flags)
    }

    fn push(
        &mut self,
        mnemonic: &str,
        variant: &str,
        bits: &[Bits],
        fields: Vec<A32Field>,
        flags: OpcodeFlags,
    ) -> &mut Opcode<A32Field> {
        let mnemonic = mnemonic.replace('.', "_");
        self.ops
            .push(Opcode::new(&mnemonic, variant, bits, fields, flags, DISCRIMINANT));
        let last = self.ops.len() - 1;
        &mut self.ops[last]
    }
}

fn cat<T: Clone>(parts: &[&[T]]) -> Vec<T> {
    parts.concat()
}

#[rustfmt::skip]
fn opcodes() -> Vec<Opcode<A32Field>> {
    use A32Field::*;
    let mut t = Table { ops: Vec::new() };

    // root00: multiplies, halfword and dual memory access, data processing
    for (ext, sr, s_bit) in [("", SrUpdate::None, (1, 0, 20)), ("s", SrUpdate::Nz, (1, 1, 20))] {
        t.add(&format!("mul{}", ext), "", &[ROOT00, s_bit, (0xf, 0x0, 21), (1, 0, 25), (0xf, 0x0, 12), (0xf, 0x9, 4)],
            &[Reg16_19, Reg0_3, Reg8_11], OpcodeFlags::MUL).sr_update = sr;
        t.add(&format!("mla{}", ext), "", &[ROOT00, s_bit, (0xf, 0x1, 21), (1, 0, 25), (0xf, 0x9, 4)],
            &[Reg16_19, Reg0_3, Reg8_11, Reg12_15], OpcodeFlags::MULACC).sr_update = sr;
        t.add(&format!("umull{}", ext), "", &[ROOT00, s_bit, (0xf, 0x4, 21), (1, 0, 25), (0xf, 0x9, 4)],
            &[Reg12_15, Reg16_19, Reg0_3, Reg8_11], OpcodeFlags::MUL).sr_update = sr;
        t.add(&format!("umlal{}", ext), "", &[ROOT00, s_bit, (0xf, 0x5, 21), (1, 0, 25), (0xf, 0x9, 4)],
            &[Reg16_19, Reg12_15, Reg0_3, Reg8_11], OpcodeFlags::MULACC).sr_update = sr;
        t.add(&format!("smull{}", ext), "", &[ROOT00, s_bit, (0xf, 0x6, 21), (1, 0, 25), (0xf, 0x9, 4)],
            &[Reg12_15, Reg16_19, Reg0_3, Reg8_11], OpcodeFlags::MUL | OpcodeFlags::RESULT_64BIT).sr_update = sr;
        t.add(&format!("smlal{}", ext), "", &[ROOT00, s_bit, (0xf, 0x7, 21), (1, 0, 25), (0xf, 0x9, 4)],
            &[Reg12_15, Reg16_19, Reg0_3, Reg8_11], OpcodeFlags::MULACC).sr_update = sr;
    }

    t.add("mls", "", &[ROOT00, (0xf, 0x3, 21), (1, 0, 20), (1, 0, 25), (0xf, 0x9, 4)],
        &[Reg16_19, Reg0_3, Reg8_11, Reg12_15], OpcodeFlags::MULACC);

    for (ext, n) in [("bb", 8), ("tb", 10), ("bt", 12), ("tt", 14)] {
        t.add(&format!("smla{}", ext), "", &[ROOT00, (0x3f, 0x10, 20), (0xf, n, 4)],
            &[Reg16_19, Reg0_3, Reg8_11, Reg12_15], OpcodeFlags::MULACC);
        t.add(&format!("smul{}", ext), "", &[ROOT00, (0x3f, 0x16, 20), (0xf, 0, 12), (0xf, n, 4)],
            &[Reg16_19, Reg0_3, Reg8_11], OpcodeFlags::MUL);
    }

    t.add("strex", "", &[ROOT00, (0x3f, 0x18, 20), (0xf, 0xf, 8), (0xf, 0x9, 4)],
        &[Reg12_15, Reg16_19, Reg0_3], OpcodeFlags::ATOMIC | OpcodeFlags::STORE).mem_width = 4;
    t.add("ldrex", "", &[ROOT00, (0x3f, 0x19, 20), (0xf, 0xf, 8), (0xf, 0x9, 4), (0xf, 0xf, 0)],
        &[Reg12_15, Reg16_19], OpcodeFlags::ATOMIC | OpcodeFlags::LOAD).mem_width = 4;

    for (mode, addr_bits, flag) in STANDARD_ADDR_MODES {
        let imm_bits = cat(&[&[(1, 1, 22)], &addr_bits]);
        let reg_bits = cat(&[&[(1, 0, 22), (0xf, 0, 8)], &addr_bits]);
        for (variant, bits, fields) in [
            (format!("imm_{}", mode), imm_bits, [Reg16_19, Imm0_3_8_11]),
            (format!("reg_{}", mode), reg_bits, [Reg16_19, Reg0_3]),
        ] {
            for (ext, width, n) in [("h", 2, 0xb), ("sb", 1, 0xd), ("sh", 2, 0xf)] {
                t.add(&format!("ldr{}", ext), &variant, &cat(&[&bits, &[ROOT00, (1, 0, 25), (1, 1, 20), (0xf, n, 4)]]),
                    &cat(&[&[Reg12_15], &fields]), OpcodeFlags::LOAD | flag).mem_width = width;
            }
            t.add("strh", &variant, &cat(&[&bits, &[ROOT00, (1, 0, 25), (1, 0, 20), (0xf, 0xb, 4)]]),
                &cat(&[&fields, &[Reg12_15]]), OpcodeFlags::STORE | flag).mem_width = 2;
            t.add("ldrd", &variant, &cat(&[&bits, &[ROOT00, (1, 0, 25), (1, 0, 20), (0xf, 0xd, 4)]]),
                &cat(&[&[RegPair12_15], &fields]), OpcodeFlags::LOAD | flag).mem_width = 8;
            t.add("strd", &variant, &cat(&[&bits, &[ROOT00, (1, 0, 25), (1, 0, 20), (0xf, 0xf, 4)]]),
                &cat(&[&fields, &[RegPair12_15]]), OpcodeFlags::STORE | flag).mem_width = 8;
        }
    }

    for (op, n) in [
        ("and", 0), ("eor", 1), ("sub", 2), ("rsb", 3), ("add", 4),
        ("adc", 5), ("sbc", 6), ("rsc", 7), ("orr", 12), ("bic", 14),
    ] {
        for (ext, sr, s_bit) in [("", SrUpdate::None, (1, 0, 20)), ("s", SrUpdate::NczPsr, (1, 1, 20))] {
            let name = format!("{}{}", op, ext);
            t.add(&name, "regreg", &[ROOT00, s_bit, (0xf, n, 21), (1, 0, 25), (1, 0, 7), (1, 1, 4)],
                &[Reg12_15, Reg16_19, Reg0_3, ShiftMode5_6, Reg8_11], OpcodeFlags::ALU).sr_update = sr;
            t.add(&name, "regimm", &[ROOT00, s_bit, (0xf, n, 21), (1, 0, 25), (1, 0, 4)],
                &[Reg12_15, Reg16_19, Reg0_3, ShiftMode5_6, Imm7_11], OpcodeFlags::ALU).sr_update = sr;
            t.add(&name, "imm", &[ROOT00, s_bit, (0xf, n, 21), (1, 1, 25)],
                &[Reg12_15, Reg16_19, Imm0_7_8_11], OpcodeFlags::ALU).sr_update = sr;
        }
    }

    for (ext, width, n) in [("", 4, 8), ("b", 1, 0xa)] {
        t.add(&format!("swp{}", ext), "", &[ROOT00, (0xf, n, 21), (1, 0, 25), (1, 0, 20), (0xf, 0x0, 8), (0xf, 0x9, 4)],
            &[Reg12_15, Reg0_3, Reg16_19], OpcodeFlags::ATOMIC).mem_width = width;
    }

    t.add("bx", "", &[ROOT00, (0xf, 0x9, 21), (1, 0, 25), (1, 0, 20), (0xfff, 0xfff, 8), (0xf, 1, 4)],
        &[Reg0_3], OpcodeFlags::JUMP);
    t.add("blx", "reg", &[ROOT00, (0xf, 0x9, 21), (1, 0, 25), (1, 0, 20), (0xfff, 0xfff, 8), (0xf, 3, 4)],
        &[Reg0_3], OpcodeFlags::JUMP | OpcodeFlags::LINK);
    t.add("clz", "", &[ROOT00, (0xf, 0xb, 21), (1, 0, 25), (1, 0, 20), (0xf, 0xf, 8), (0xf, 0xf, 16), (0xf, 1, 4)],
        &[Reg12_15, Reg0_3], OpcodeFlags::ALU1);

    for (op, n) in [("tst", 8), ("teq", 9), ("cmp", 10), ("cmn", 11)] {
        t.add(op, "regreg", &[ROOT00, (0xf, n, 21), (1, 1, 20), (0xf, 0, 12), (1, 0, 25), (1, 0, 7), (1, 1, 4)],
            &[Reg16_19, Reg0_3, ShiftMode5_6, Reg8_11], OpcodeFlags::TEST).sr_update = SrUpdate::Ncz;
        t.add(op, "regimm", &[ROOT00, (0xf, n, 21), (1, 1, 20), (0xf, 0, 12), (1, 0, 25), (1, 0, 4)],
            &[Reg16_19, Reg0_3, ShiftMode5_6, Imm7_11], OpcodeFlags::TEST).sr_update = SrUpdate::Ncz;
        t.add(op, "imm", &[ROOT00, (0xf, n, 21), (1, 1, 20), (0xf, 0, 12), (1, 1, 25)],
            &[Reg16_19, Imm0_7_8_11], OpcodeFlags::TEST).sr_update = SrUpdate::Ncz;
    }

    for (op, n) in [("mov", 0xd), ("mvn", 0xf)] {
        for (ext, sr, s_bit) in [("", SrUpdate::None, (1, 0, 20)), ("s", SrUpdate::NczPsr, (1, 1, 20))] {
            let name = format!("{}{}", op, ext);
            let bits = [ROOT00, s_bit, (0xf, n, 21), (0xf, 0, 16)];
            t.add(&name, "regreg", &cat(&[&bits, &[(1, 0, 25), (1, 0, 7), (1, 1, 4)]]),
                &[Reg12_15, Reg0_3, ShiftMode5_6, Reg8_11], OpcodeFlags::ALU1).sr_update = sr;
            t.add(&name, "regimm", &cat(&[&bits, &[(1, 0, 25), (1, 0, 4)]]),
                &[Reg12_15, Reg0_3, ShiftMode5_6, Imm7_11], OpcodeFlags::ALU1).sr_update = sr;
            t.add(&name, "imm", &cat(&[&bits, &[(1, 1, 25)]]),
                &[Reg12_15, Imm0_7_8_11], OpcodeFlags::ALU1).sr_update = sr;
        }
    }

    t.add("movw", "", &[ROOT00, (0x3f, 0x30, 20)], &[Reg12_15, Imm0_11_16_19], OpcodeFlags::ALU1);
    t.add("movt", "", &[ROOT00, (0x3f, 0x34, 20)], &[Reg12_15, Imm0_11_16_19], OpcodeFlags::ALU1);
    t.add("nop", "", &[(0x0fff_ffff, 0x0320_f000, 0)], &[], OpcodeFlags::MISC);

    // root01: divides, extensions, word and byte memory access
    t.add("sdiv", "", &[ROOT01, (0x3f, 0x31, 20), (0xf, 0xf, 12), (0xf, 1, 4)],
        &[Reg16_19, Reg0_3, Reg8_11], OpcodeFlags::DIV);
    t.add("udiv", "", &[ROOT01, (0x3f, 0x33, 20), (0xf, 0xf, 12), (0xf, 1, 4)],
        &[Reg16_19, Reg0_3, Reg8_11], OpcodeFlags::DIV);

    for (ext, n) in [("b", 2), ("b16", 0), ("h", 3)] {
        // the plain forms fix bits 16..19 to 0xf where the accumulating forms take a register
        let bits = [ROOT01, (0x3f, 0x7, 4), (0x3, n, 20)];
        t.add(&format!("uxt{}", ext), "", &cat(&[&bits, &[(0xf, 0xb, 22), (0xf, 0xf, 16)]]),
            &[Reg12_15, Reg0_3, Imm10_11Times8], OpcodeFlags::SIGNEXTEND);
        t.add(&format!("sxt{}", ext), "", &cat(&[&bits, &[(0xf, 0xa, 22), (0xf, 0xf, 16)]]),
            &[Reg12_15, Reg0_3, Imm10_11Times8], OpcodeFlags::SIGNEXTEND);
        t.add(&format!("uxta{}", ext), "", &cat(&[&bits, &[(0xf, 0xb, 22)]]),
            &[Reg12_15, Reg16_19, Reg0_3, Imm10_11Times8], OpcodeFlags::SIGNEXTEND);
        t.add(&format!("sxta{}", ext), "", &cat(&[&bits, &[(0xf, 0xa, 22)]]),
            &[Reg12_15, Reg16_19, Reg0_3, Imm10_11Times8], OpcodeFlags::SIGNEXTEND);
    }

    for (ext, n) in [("", 3), ("16", 11)] {
        t.add(&format!("rev{}", ext), "", &[ROOT01, (0x3ff, 0x2bf, 16), (0xf, 0xf, 8), (0xf, n, 4)],
            &[Reg12_15, Reg0_3], OpcodeFlags::ALU1);
    }

    for (mode, addr_bits, flag) in STANDARD_ADDR_MODES {
        let reg_bits = cat(&[&[(1, 1, 25), (1, 0, 4)], &addr_bits]);
        let imm_bits = cat(&[&[(1, 0, 25)], &addr_bits]);
        for (variant, bits, fields) in [
            (format!("reg_{}", mode), reg_bits, vec![Reg16_19, Reg0_3, ShiftMode5_6, Imm7_11]),
            (format!("imm_{}", mode), imm_bits, vec![Reg16_19, Imm0_11]),
        ] {
            // prefetch shares its encoding space with ldrb and must precede it
            t.add_unpredicated("pld", &variant, &cat(&[&bits, &[ROOT01, (1, 1, 22), (1, 1, 20), (0xf, 0xf, 12), (0xf, 0xf, 28)]]),
                &fields, OpcodeFlags::PREFETCH | flag);
            for (ext, width, n) in [("", 4, 0), ("b", 1, 1)] {
                t.add(&format!("ldr{}", ext), &variant, &cat(&[&bits, &[ROOT01, (1, n, 22), (1, 1, 20)]]),
                    &cat(&[&[Reg12_15], &fields]), OpcodeFlags::LOAD | flag).mem_width = width;
                t.add(&format!("str{}", ext), &variant, &cat(&[&bits, &[ROOT01, (1, n, 22), (1, 0, 20)]]),
                    &cat(&[&fields, &[Reg12_15]]), OpcodeFlags::STORE | flag).mem_width = width;
            }
        }
    }

    t.add("ud2", "", &[ROOT01, (0x3ff_ffff, 0x3f0_00f0, 0)], &[], OpcodeFlags::MISC);

    // root10: load/store multiple and branches
    for (mode, update, addr_bits, flag) in MULTI_ADDR_MODES {
        let variant = if update { "update" } else { "" };
        t.add(&format!("stm{}", mode), variant, &cat(&[&[ROOT10, (1, 0, 25), (1, 0, 20), (1, 0, 22)], &addr_bits]),
            &[Reg16_19, Reglist0_15], OpcodeFlags::STORE | OpcodeFlags::MULTIPLE | flag);
        t.add(&format!("ldm{}", mode), variant, &cat(&[&[ROOT10, (1, 0, 25), (1, 1, 20), (1, 0, 22)], &addr_bits]),
            &[Reglist0_15, Reg16_19], OpcodeFlags::LOAD | OpcodeFlags::MULTIPLE | flag);
    }

    t.add("b", "", &[ROOT10, (1, 1, 25), (1, 0, 24)], &[Simm0_23], OpcodeFlags::JUMP);
    t.add("bl", "", &[ROOT10, (1, 1, 25), (1, 1, 24)], &[RegLink, Simm0_23], OpcodeFlags::JUMP | OpcodeFlags::LINK);

    // root11: supervisor call and VFP
    t.add("svc", "", &[ROOT11, (3, 3, 24)], &[Imm0_23], OpcodeFlags::SYSCALL);

    for (mode, addr_bit, flag) in LIMITED_ADDR_MODES {
        let fp = OpcodeFlags::FLOAT;
        t.add("vldr", &format!("f32_{}", mode), &[ROOT11, (0x3, 1, 24), (0x3, 1, 20), (0xf, 0xa, 8), addr_bit],
            &[Sreg12_15_22, Reg16_19, Imm0_7Times4], fp | OpcodeFlags::LOAD | flag).mem_width = 4;
        t.add("vldr", &format!("f64_{}", mode), &[ROOT11, (0x3, 1, 24), (0x3, 1, 20), (0xf, 0xb, 8), addr_bit],
            &[Dreg12_15_22, Reg16_19, Imm0_7Times4], fp | OpcodeFlags::LOAD | flag).mem_width = 8;
        t.add("vstr", &format!("f32_{}", mode), &[ROOT11, (0x3, 1, 24), (0x3, 0, 20), (0xf, 0xa, 8), addr_bit],
            &[Reg16_19, Imm0_7Times4, Sreg12_15_22], fp | OpcodeFlags::STORE | flag).mem_width = 4;
        t.add("vstr", &format!("f64_{}", mode), &[ROOT11, (0x3, 1, 24), (0x3, 0, 20), (0xf, 0xb, 8), addr_bit],
            &[Reg16_19, Imm0_7Times4, Dreg12_15_22], fp | OpcodeFlags::STORE | flag).mem_width = 8;
    }

    t.add("vmov", "atof", &[ROOT11, (0x3f, 4, 20), (0xfd, 0xb1, 4)], &[Dreg0_3_5, Reg12_15, Reg16_19], OpcodeFlags::FLOAT);
    t.add("vmov", "ftoa", &[ROOT11, (0x3f, 5, 20), (0xfd, 0xb1, 4)], &[Reg12_15, Reg16_19, Dreg0_3_5], OpcodeFlags::FLOAT);
    t.add("vmov", "atos", &[ROOT11, (0x3f, 0x20, 20), (0xf, 0xa, 8), (0x7f, 0x10, 0)], &[Sreg16_19_7, Reg12_15], OpcodeFlags::FLOAT);
    t.add("vmov", "stoa", &[ROOT11, (0x3f, 0x21, 20), (0xf, 0xa, 8), (0x7f, 0x10, 0)], &[Reg12_15, Sreg16_19_7], OpcodeFlags::FLOAT);

    let cvt_dst = |ty: &str| if ty == "f64" { Dreg12_15_22 } else { Sreg12_15_22 };
    let cvt_src = |ty: &str| if ty == "f64" { Dreg0_3_5 } else { Sreg0_3_5 };
    for (dst, src, a, b) in [
        ("f32", "f64", 0x37, 0xbc),
        ("f64", "f32", 0x37, 0xac),
        ("s32", "f64", 0x3d, 0xbc),
        ("s32", "f32", 0x3d, 0xac),
        ("u32", "f64", 0x3c, 0xbc),
        ("u32", "f32", 0x3c, 0xac),
        ("f64", "s32", 0x38, 0xbc),
        ("f32", "s32", 0x38, 0xac),
        ("f64", "u32", 0x38, 0xb4),
        ("f32", "u32", 0x38, 0xa4),
    ] {
        t.add(&format!("vcvt.{}.{}", dst, src), "", &[ROOT11, (7, 5, 23), (0x3f, a, 16), (0xfd, b, 4)],
            &[cvt_dst(dst), cvt_src(src)], OpcodeFlags::FLOAT);
    }

    for (name, a, c) in [("vcmp", 5, 4), ("vcmpe", 5, 0xc)] {
        let bits = [ROOT11, (3, 3, 20), (7, a, 23), (0xd, c, 4)];
        t.add(&format!("{}.f32", name), "", &cat(&[&bits, &[(0xf, 4, 16), (0xf, 0xa, 8)]]),
            &[Sreg12_15_22, Sreg0_3_5], OpcodeFlags::FLOAT);
        t.add(&format!("{}.f64", name), "", &cat(&[&bits, &[(0xf, 4, 16), (0xf, 0xb, 8)]]),
            &[Dreg12_15_22, Dreg0_3_5], OpcodeFlags::FLOAT);
        t.add(&format!("{}.f32", name), "zero", &cat(&[&bits, &[(0xf, 5, 16), (0xf, 0xa, 8), (0x2f, 0, 0)]]),
            &[Sreg12_15_22, ImmFltZero], OpcodeFlags::FLOAT);
        t.add(&format!("{}.f64", name), "zero", &cat(&[&bits, &[(0xf, 5, 16), (0xf, 0xb, 8), (0x2f, 0, 0)]]),
            &[Dreg12_15_22, ImmFltZero], OpcodeFlags::FLOAT);
    }

    for (name, a, b, c) in [("vabs", 5, 0, 0xc), ("vmov", 5, 0, 4), ("vsqrt", 5, 1, 0xc), ("vneg", 5, 1, 4)] {
        let bits = [ROOT11, (7, a, 23), (0xf, b, 16), (0xd, c, 4), (3, 3, 20)];
        t.add(&format!("{}.f32", name), "", &cat(&[&bits, &[(0xf, 0xa, 8)]]),
            &[Sreg12_15_22, Sreg0_3_5], OpcodeFlags::FLOAT);
        t.add(&format!("{}.f64", name), "", &cat(&[&bits, &[(0xf, 0xb, 8)]]),
            &[Dreg12_15_22, Dreg0_3_5], OpcodeFlags::FLOAT);
    }

    for (name, a, b, c) in [
        ("vdiv", 5, 0, 0),
        ("vmul", 4, 2, 0),
        ("vadd", 4, 3, 0),
        ("vsub", 4, 3, 4),
        ("vnmul", 4, 2, 4),
        ("vnmls", 4, 1, 0),
        ("vnmla", 4, 1, 4),
        ("vmls", 4, 0, 4),
        ("vmla", 4, 0, 0),
    ] {
        let bits = [ROOT11, (7, a, 23), (3, b, 20), (5, c, 4)];
        t.add(&format!("{}.f32", name), "", &cat(&[&bits, &[(0xf, 0xa, 8)]]),
            &[Sreg12_15_22, Sreg16_19_7, Sreg0_3_5], OpcodeFlags::FLOAT);
        t.add(&format!("{}.f64", name), "", &cat(&[&bits, &[(0xf, 0xb, 8)]]),
            &[Dreg12_15_22, Dreg16_19_7, Dreg0_3_5], OpcodeFlags::FLOAT);
    }

    let multi = OpcodeFlags::MULTIPLE | OpcodeFlags::FLOAT;
    for (mode, update, addr_bits, flag) in MULTI_ADDR_MODES {
        let suffix = if update { "_update" } else { "" };
        t.add(&format!("vldm{}", mode), &format!("s{}", suffix),
            &cat(&[&[ROOT11, (1, 0, 25), (1, 1, 20), (0xf, 0xa, 8)], &addr_bits]),
            &[Sreg12_15_22, RegRange0_7, Reg16_19], OpcodeFlags::LOAD | multi | flag);
        t.add(&format!("vldm{}", mode), &format!("f{}", suffix),
            &cat(&[&[ROOT11, (1, 0, 25), (1, 1, 20), (0xf, 0xb, 8), (1, 0, 0)], &addr_bits]),
            &[Dreg12_15_22, RegRange1_7, Reg16_19], OpcodeFlags::LOAD | multi | flag);
        t.add(&format!("vstm{}", mode), &format!("s{}", suffix),
            &cat(&[&[ROOT11, (1, 0, 25), (1, 0, 20), (0xf, 0xa, 8)], &addr_bits]),
            &[Reg16_19, Sreg12_15_22, RegRange0_7], OpcodeFlags::STORE | multi | flag);
        t.add(&format!("vstm{}", mode), &format!("f{}", suffix),
            &cat(&[&[ROOT11, (1, 0, 25), (1, 0, 20), (0xf, 0xb, 8), (1, 0, 0)], &addr_bits]),
            &[Reg16_19, Dreg12_15_22, RegRange1_7], OpcodeFlags::STORE | multi | flag);
    }

    t.add("vmrs", "APSR_nzcv_fpscr", &[ROOT11, (0x3ff_ffff, 0x2f1_fa10, 0)], &[], OpcodeFlags::FLOAT).sr_update = SrUpdate::Nczv;

    t.ops
}

fn has_pred(op: &Opcode<A32Field>) -> bool {
    op.fields.first() == Some(&A32Field::Pred28_31)
}

/// An unconditional-only encoding (condition field fixed to 0xf) shadows the
/// predicated instruction it shares bits with.
fn unpredicated_first(earlier: &Opcode<A32Field>, later: &Opcode<A32Field>) -> bool {
    !has_pred(earlier) && has_pred(later) && earlier.mask >> 28 == 0xf && earlier.value >> 28 == 0xf
}

/// `uxtb r0 r1` is `uxtab r0 pc r1`; the plain extension wins.
fn extend_before_extend_add(earlier: &Opcode<A32Field>, later: &Opcode<A32Field>) -> bool {
    let pair = |plain: &str, acc: &str| {
        earlier.mnemonic.starts_with(plain)
            && !earlier.mnemonic.starts_with(acc)
            && later.mnemonic.starts_with(acc)
    };
    (pair("uxt", "uxta") || pair("sxt", "sxta"))
        && later.fields.contains(&A32Field::Reg16_19)
        && (earlier.mask >> 16) & 0xf == 0xf
        && (earlier.value >> 16) & 0xf == 0xf
}

/// `vldr`/`vstr` occupy the P=1 W=0 corner of the multiple transfer space.
fn vfp_single_before_multiple(earlier: &Opcode<A32Field>, later: &Opcode<A32Field>) -> bool {
    let mask = (1 << 24) | (1 << 21);
    let both = |flag| earlier.flags.contains(flag) && later.flags.contains(flag);
    let same_direction = both(OpcodeFlags::LOAD) || both(OpcodeFlags::STORE);
    later.flags.contains(OpcodeFlags::MULTIPLE | OpcodeFlags::FLOAT)
        && earlier.flags.contains(OpcodeFlags::FLOAT)
        && same_direction
        && earlier.mask & mask == mask
        && earlier.value & mask == 1 << 24
}

/// Core register transfers occupy the P=0 U=0 W=0 corner of the multiple transfer space.
fn vmov_before_multiple(earlier: &Opcode<A32Field>, later: &Opcode<A32Field>) -> bool {
    let mask = (1 << 24) | (1 << 23) | (1 << 21);
    later.flags.contains(OpcodeFlags::MULTIPLE | OpcodeFlags::FLOAT)
        && earlier.flags.contains(OpcodeFlags::FLOAT)
        && earlier.mnemonic.starts_with("vmov")
        && earlier.mask & mask == mask
        && earlier.value & mask == 0
}

fn rules() -> [OverlapRule<Opcode<A32Field>>; 4] {
    [
        OverlapRule {
            name: "unpredicated before predicated",
            allows: unpredicated_first,
        },
        OverlapRule {
            name: "extend before extend-add",
            allows: extend_before_extend_add,
        },
        OverlapRule {
            name: "vfp single before multiple",
            allows: vfp_single_before_multiple,
        },
        OverlapRule {
            name: "vmov before vfp multiple",
            allows: vmov_before_multiple,
        },
    ]
}

/// The A32 architecture backend.
pub struct A32 {
    isa: WordIsa<A32Field>,
}

impl A32 {
    /// Builds the catalog.
    ///
    /// # Panics
    /// If the opcode table is inconsistent. That is a bug in this file, not bad input.
    pub fn new() -> Self {
        let always = Some((A32Field::Pred28_31, "al"));
        match WordIsa::new(opcodes(), DISCRIMINANT, &rules(), RELOCS, always) {
            Ok(isa) => Self { isa },
            Err(e) => panic!("A32 opcode catalog is inconsistent: {}", e),
        }
    }

    pub fn isa(&self) -> &WordIsa<A32Field> {
        &self.isa
    }
}

impl Default for A32 {
    fn default() -> Self {
        Self::new()
    }
}

impl Architecture for A32 {
    fn name(&self) -> &'static str {
        "a32"
    }

    fn elf_machine(&self) -> u16 {
        elf::EM_ARM
    }

    fn elf_flags(&self) -> u32 {
        EF_ARM_EABI_VER5
    }

    fn is_64bit(&self) -> bool {
        false
    }

    fn base_address(&self) -> u64 {
        0x20000
    }

    fn segment_alignment(&self) -> u64 {
        0x10000
    }

    fn code_padding(&self, len: usize) -> Vec<u8> {
        repeat_nop(&NOP, len)
    }

    fn data_reloc(&self, width: usize) -> Result<u32, AsmError> {
        match width {
            4 => Ok(elf::R_ARM_ABS32),
            _ => Err(AsmError::syntax(format!("a32 addresses are 4 bytes, not {}", width))),
        }
    }

    fn assemble(&self, mnemonic: &str, tokens: &[&str]) -> Result<Encoded, AsmError> {
        word_assemble(&self.isa, mnemonic, tokens)
    }

    fn disassemble(&self, data: &[u8], pending: Option<&PendingReloc>) -> Option<Decoded> {
        word_disassemble(&self.isa, data, pending)
    }

    fn apply_relocation(
        &self,
        offset: u64,
        r_type: u32,
        p: u64,
        s: u64,
        a: i64,
        data: &mut [u8],
    ) -> Result<(), AsmError> {
        let target = (s as i64).wrapping_add(a);
        match r_type {
            // S + A
            elf::R_ARM_ABS32 => write_le::<4>(data, offset, p, target, false),
            // (S + A - P) >> 2, the pc reads 8 bytes ahead
            elf::R_ARM_CALL | elf::R_ARM_JUMP24 => {
                let disp = target - (p as i64 + 8);
                let words = fit_signed(disp >> 2, 24, p)
                    .map_err(|_| AsmError::RelocationOverflow { place: p, value: disp, bits: 26 })?;
                word_patch(&self.isa, data, offset, r_type, words)
            }
            // low and high halves of S + A
            elf::R_ARM_MOVW_ABS_NC => word_patch(&self.isa, data, offset, r_type, target & 0xffff),
            elf::R_ARM_MOVT_ABS => {
                word_patch(&self.isa, data, offset, r_type, (target >> 16) & 0xffff)
            }
            _ => Err(AsmError::syntax(format!("unsupported a32 relocation type {}", r_type))),
        }
    }

    fn reloc_name(&self, r_type: u32) -> &'static str {
        match r_type {
            elf::R_ARM_ABS32 => "R_ARM_ABS32",
            elf::R_ARM_CALL => "R_ARM_CALL",
            elf::R_ARM_JUMP24 => "R_ARM_JUMP24",
            elf::R_ARM_MOVW_ABS_NC => "R_ARM_MOVW_ABS_NC",
            elf::R_ARM_MOVT_ABS => "R_ARM_MOVT_ABS",
            _ => "R_ARM_UNKNOWN",
        }
    }

    fn startup_code(&self) -> &'static str {
        STARTUP
    }

    fn elf_attributes(&self) -> Option<(&'static str, u32, &'static [u8])> {
        Some((".ARM.attributes", SHT_ARM_ATTRIBUTES, &ATTRIBUTES))
    }
}

const STARTUP: &str = "
.fun _start 16
    ldr_imm_add al r0 sp 0
    add_imm al r1 sp 4
    bl al lr expr:call:main
    movw al r7 1
    svc al 0
    ud2 al
.endfun
";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Template;

    const SEEDS: [u32; 6] = [0, 0xffff_ffff, 0x1234_5678, 0x8765_4321, 0xa5a5_a5a5, 0x5a5a_5a5a];

    fn word(a: &A32, text: &str) -> u32 {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        let enc = a.assemble(tokens[0], &tokens[1..]).unwrap();
        u32::from_le_bytes(enc.bytes.try_into().unwrap())
    }

    /// Templates that are exactly covered by an earlier one and so never decode.
    fn fully_shadowed(name: &str) -> bool {
        ["vldmib_", "vldmdb_", "vstmib_", "vstmdb_"]
            .iter()
            .any(|p| name.starts_with(p) && !name.ends_with("update"))
    }

    #[test]
    fn add_immediate_round_trip() {
        let a = A32::new();
        let w1 = word(&a, "add_imm al r4 r4 1");
        let w2 = word(&a, "add_imm al r4 r4 1");
        assert_eq!(w1, 0xe284_4001);
        assert_eq!(w1, w2);
        let ins = a.isa().disassemble(w1).unwrap();
        let (name, ops) = a.isa().ins_symbolize(&ins);
        assert_eq!(name, "add_imm");
        assert_eq!(ops, vec!["al", "r4", "r4", "1"]);
    }

    #[test]
    fn predicate_defaults_to_always() {
        let a = A32::new();
        assert_eq!(word(&a, "add_imm r4 r4 #1"), word(&a, "add_imm al r4 r4 1"));
        assert_eq!(word(&a, "mov_regimm ne r0 r1 lsl 0"), 0x11a0_0001);
        assert_eq!(word(&a, "ldr_imm_add al r0 sp 0"), 0xe59d_0000);
    }

    #[test]
    fn unrotatable_immediate_is_an_encoding_error() {
        let a = A32::new();
        let err = a.assemble("add_imm", &["al", "r0", "r0", "0x101"]).unwrap_err();
        assert!(matches!(err, AsmError::EncodingRange { .. }), "{}", err);
        assert_eq!(word(&a, "mov_imm al r0 0xff000000"), 0xe3a0_04ff);
    }

    #[test]
    fn every_template_round_trips() {
        let a = A32::new();
        let isa = a.isa();
        let mut decoded = 0;
        for op in isa.catalog.iter() {
            let rotated = op.fields.contains(&A32Field::Imm0_7_8_11);
            let mut seen = false;
            for seed in SEEDS {
                let seed = if rotated { seed & !0xf00 } else { seed };
                let w = op.value | (seed & !op.mask);
                let ins = isa.disassemble(w).unwrap();
                if ins.opcode.name != op.name {
                    continue;
                }
                seen = true;
                assert_eq!(isa.assemble(&ins).unwrap(), w, "{} {:#010x}", op.name, w);
                let (name, ops) = isa.ins_symbolize(&ins);
                let tokens: Vec<&str> = ops.iter().map(String::as_str).collect();
                let again = isa.ins_from_symbolized(&name, &tokens).unwrap();
                assert_eq!(again, ins, "{} {:?}", name, ops);
            }
            assert!(seen || fully_shadowed(&op.name), "{} never decodes", op.name);
            decoded += usize::from(seen);
        }
        assert!(decoded > 300);
    }

    #[test]
    fn coverage_holds_for_all_templates() {
        let a = A32::new();
        for op in a.isa().catalog.iter() {
            assert_eq!(op.check_coverage(), Ok(()));
        }
    }

    #[test]
    fn overlap_rules_pick_the_specific_template() {
        let a = A32::new();
        let name = |w: u32| a.isa().find_opcode(w).unwrap().name.clone();
        // pld [r0]
        assert_eq!(name(0xf5d0_f000), "pld_imm_add");
        // ldrb with the same bits under a real predicate
        assert_eq!(name(0xe5d0_f000), "ldrb_imm_add");
        assert_eq!(name(0xe6ef_0071), "uxtb");
        assert_eq!(name(0xe6e1_0071), "uxtab");
        // vldr s0, [r0]
        assert_eq!(name(0xed90_0a00), "vldr_f32_add");
        // vmov d0, r1, r2
        assert_eq!(name(0xec42_1b10), "vmov_atof");
        assert_eq!(name(u32::from_le_bytes(NOP)), "nop");
    }

    #[test]
    fn rules_reject_unlisted_overlaps() {
        let mut ops = opcodes();
        // a second copy of mov_imm under another name overlaps without a rule
        let fixed = [ROOT00, (1, 0, 20), (0xf, 0xd, 21), (0xf, 0, 16), (1, 1, 25)];
        let fields = vec![A32Field::Pred28_31, A32Field::Reg12_15, A32Field::Imm0_7_8_11];
        let dup = Opcode::new("mov2", "imm", &fixed, fields, OpcodeFlags::ALU1, DISCRIMINANT);
        ops.push(dup);
        let err = WordIsa::new(ops, DISCRIMINANT, &rules(), RELOCS, None).err().unwrap();
        assert!(matches!(err, crate::error::CatalogError::Ambiguous { .. }), "{}", err);
    }

    #[test]
    fn relocations_patch_decoded_fields() {
        let a = A32::new();
        let enc = a.assemble("movw", &["al", "r0", "expr:movw_abs_nc:tab"]).unwrap();
        let reloc = enc.reloc.clone().unwrap();
        assert_eq!(
            (reloc.r_type, reloc.offset, reloc.symbol.as_str()),
            (elf::R_ARM_MOVW_ABS_NC, 0, "tab")
        );
        let mut buf = enc.bytes.clone();
        a.apply_relocation(0, reloc.r_type, 0x20000, 0x12_3456, 0, &mut buf).unwrap();
        assert_eq!(u32::from_le_bytes(buf.clone().try_into().unwrap()), 0xe303_0456);

        let mut movt = a.assemble("movt", &["expr:movt_abs:tab", "r0"]);
        assert!(movt.is_err());
        movt = a.assemble("movt", &["al", "r0", "expr:movt_abs:tab"]);
        let mut buf = movt.unwrap().bytes;
        a.apply_relocation(0, elf::R_ARM_MOVT_ABS, 0x20000, 0x12_3456, 0, &mut buf).unwrap();
        assert_eq!(u32::from_le_bytes(buf.try_into().unwrap()), 0xe340_0012);

        // backwards branch to itself: -8 bytes, -2 words
        let enc = a.assemble("b", &["al", "expr:jump24:loop"]).unwrap();
        assert!(enc.reloc.as_ref().unwrap().is_local);
        let mut buf = enc.bytes;
        a.apply_relocation(0, elf::R_ARM_JUMP24, 0x30000, 0x30000, 0, &mut buf).unwrap();
        assert_eq!(u32::from_le_bytes(buf.try_into().unwrap()), 0xeaff_fffe);
    }

    #[test]
    fn relocation_errors() {
        let a = A32::new();
        // jump24 cannot patch a movw immediate
        assert!(a.assemble("movw", &["al", "r0", "expr:jump24:x"]).is_err());
        let mut buf = a.assemble("bl", &["al", "lr", "expr:call:far"]).unwrap().bytes;
        let err = a
            .apply_relocation(0, elf::R_ARM_CALL, 0x20000, 0x2000_0000, 0, &mut buf)
            .unwrap_err();
        assert!(matches!(err, AsmError::RelocationOverflow { .. }));
        let mut data = vec![0u8; 4];
        a.apply_relocation(0, elf::R_ARM_ABS32, 0, 0x20010, 4, &mut data).unwrap();
        assert_eq!(data, 0x20014u32.to_le_bytes());
    }

    #[test]
    fn abs32_does_not_wrap() {
        let a = A32::new();
        let mut data = vec![0u8; 4];
        let err = a
            .apply_relocation(0, elf::R_ARM_ABS32, 0, 0x20010, -0x20020, &mut data)
            .unwrap_err();
        assert!(matches!(err, AsmError::RelocationOverflow { bits: 32, .. }), "{}", err);
        let err = a
            .apply_relocation(0, elf::R_ARM_ABS32, 0, 0xffff_fff0, 0x20, &mut data)
            .unwrap_err();
        assert!(matches!(err, AsmError::RelocationOverflow { bits: 32, .. }), "{}", err);
        assert_eq!(data, [0; 4]);
    }

    #[test]
    fn listing_shows_pending_relocation() {
        let a = A32::new();
        let enc = a.assemble("bl", &["expr:call:main"]);
        assert!(enc.is_err());
        let enc = a.assemble("bl", &["lr", "expr:call:main"]).unwrap();
        let text = a.disassemble(&enc.bytes, enc.reloc.as_ref()).unwrap().to_string();
        assert_eq!(text, "bl al lr expr:call:main");
    }
}
