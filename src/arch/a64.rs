//! AArch64 (A64) Architecture backend.
//!
//! Fixed 32-bit little endian instruction words. Template names spell out the mnemonic,
//! the register width (`x`, `w`, `d`, `s`) and the addressing form, e.g. `add_x_imm`,
//! `ldr_w_imm_pre` or `fcvtzs_x_d`. Branch offsets are operands counted in instruction
//! words, the way the hardware stores them.

use object::elf;

use super::{
    fit_signed, repeat_nop, word_assemble, word_disassemble, word_patch, write_le, Architecture,
    Decoded, Encoded, PendingReloc,
};
use crate::codec::{BitRange, FieldKind, Modifier};
use crate::error::AsmError;
use crate::opcode::{Discriminant, Opcode, OpcodeFlags, SrUpdate};
use crate::symbolic::{RelocKind, Symbolic, Vocabulary, WordIsa};

const NOP: [u8; 4] = [0x1f, 0x20, 0x03, 0xd5];

const DISCRIMINANT: Discriminant = Discriminant { shift: 24, width: 8 };

/// Operand kinds, named after the bits they occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum A64Field {
    Xreg0_4,
    Xreg5_9,
    Xreg10_14,
    Xreg16_20,
    /// Register 31 is the stack pointer.
    Xsp0_4,
    Xsp5_9,
    Wreg0_4,
    Wreg5_9,
    Wreg10_14,
    Wreg16_20,
    Wsp0_4,
    Wsp5_9,
    Sreg0_4,
    Sreg5_9,
    Sreg10_14,
    Sreg16_20,
    Dreg0_4,
    Dreg5_9,
    Dreg10_14,
    Dreg16_20,
    Shift22_23,
    Cond12_15,
    Imm10_15,
    Imm16_21,
    Imm5_20,
    /// 12-bit immediate, optionally shifted left by 12.
    ImmShifted10_21_22,
    /// 16-bit immediate with a halfword shift.
    ImmShifted5_20_21,
    ImmShifted5_20_21_22,
    Imm10_21,
    Imm10_21Times2,
    Imm10_21Times4,
    Imm10_21Times8,
    Simm12_20,
    Simm15_21Times4,
    Simm15_21Times8,
    Simm5_23,
    Simm0_25,
    /// `adr` byte offset, split into immhi and immlo.
    Simm5_23_29_30,
    /// `adrp` page offset, same bits as `adr`.
    Page5_23_29_30,
}

impl FieldKind for A64Field {
    fn ranges(self) -> &'static [BitRange] {
        use A64Field::*;
        use Modifier::*;
        match self {
            Xreg0_4 | Xsp0_4 | Wreg0_4 | Wsp0_4 | Sreg0_4 | Dreg0_4 => ranges![(Verbatim, 5, 0)],
            Xreg5_9 | Xsp5_9 | Wreg5_9 | Wsp5_9 | Sreg5_9 | Dreg5_9 => ranges![(Verbatim, 5, 5)],
            Xreg10_14 | Wreg10_14 | Sreg10_14 | Dreg10_14 => ranges![(Verbatim, 5, 10)],
            Xreg16_20 | Wreg16_20 | Sreg16_20 | Dreg16_20 => ranges![(Verbatim, 5, 16)],
            Shift22_23 => ranges![(Verbatim, 2, 22)],
            Cond12_15 => ranges![(Verbatim, 4, 12)],
            Imm10_15 => ranges![(Verbatim, 6, 10)],
            Imm16_21 => ranges![(Verbatim, 6, 16)],
            Imm5_20 => ranges![(Verbatim, 16, 5)],
            ImmShifted10_21_22 => ranges![(Hi, 1, 22), (Lo, 12, 10)],
            ImmShifted5_20_21 => ranges![(Hi, 1, 21), (Lo, 16, 5)],
            ImmShifted5_20_21_22 => ranges![(Hi, 2, 21), (Lo, 16, 5)],
            Imm10_21 => ranges![(Verbatim, 12, 10)],
            Imm10_21Times2 => ranges![(Scaled(2), 12, 10)],
            Imm10_21Times4 => ranges![(Scaled(4), 12, 10)],
            Imm10_21Times8 => ranges![(Scaled(8), 12, 10)],
            Simm12_20 => ranges![(Signed, 9, 12)],
            Simm15_21Times4 => ranges![(SignedScaled(4), 7, 15)],
            Simm15_21Times8 => ranges![(SignedScaled(8), 7, 15)],
            Simm5_23 => ranges![(Signed, 19, 5)],
            Simm0_25 => ranges![(Signed, 26, 0)],
            Simm5_23_29_30 | Page5_23_29_30 => ranges![(Signed, 19, 5), (Lo, 2, 29)],
        }
    }
}

const XREGS: &[&str] = &[
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13", "x14",
    "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27",
    "x28", "x29", "x30", "xzr",
];

const XSP_REGS: &[&str] = &[
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13", "x14",
    "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27",
    "x28", "x29", "x30", "sp",
];

const WREGS: &[&str] = &[
    "w0", "w1", "w2", "w3", "w4", "w5", "w6", "w7", "w8", "w9", "w10", "w11", "w12", "w13", "w14",
    "w15", "w16", "w17", "w18", "w19", "w20", "w21", "w22", "w23", "w24", "w25", "w26", "w27",
    "w28", "w29", "w30", "wzr",
];

const WSP_REGS: &[&str] = &[
    "w0", "w1", "w2", "w3", "w4", "w5", "w6", "w7", "w8", "w9", "w10", "w11", "w12", "w13", "w14",
    "w15", "w16", "w17", "w18", "w19", "w20", "w21", "w22", "w23", "w24", "w25", "w26", "w27",
    "w28", "w29", "w30", "wsp",
];

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

const SHIFTS: &[&str] = &["lsl", "lsr", "asr", "ror"];

const CONDS: &[&str] = &[
    "eq", "ne", "cs", "cc", "mi", "pl", "vs", "vc", "hi", "ls", "ge", "lt", "gt", "le", "al", "nv",
];

impl Symbolic for A64Field {
    fn vocabulary(self) -> Vocabulary {
        use A64Field::*;
        match self {
            Xreg0_4 | Xreg5_9 | Xreg10_14 | Xreg16_20 => Vocabulary::Names(XREGS, &[("lr", 30)]),
            Xsp0_4 | Xsp5_9 => Vocabulary::Names(XSP_REGS, &[("lr", 30)]),
            Wreg0_4 | Wreg5_9 | Wreg10_14 | Wreg16_20 => Vocabulary::Names(WREGS, &[]),
            Wsp0_4 | Wsp5_9 => Vocabulary::Names(WSP_REGS, &[]),
            Sreg0_4 | Sreg5_9 | Sreg10_14 | Sreg16_20 => Vocabulary::Names(SREGS, &[]),
            Dreg0_4 | Dreg5_9 | Dreg10_14 | Dreg16_20 => Vocabulary::Names(DREGS, &[]),
            Shift22_23 => Vocabulary::Names(SHIFTS, &[]),
            Cond12_15 => Vocabulary::Names(CONDS, &[("hs", 2), ("lo", 3)]),
            ImmShifted10_21_22 => Vocabulary::Shifted { imm_bits: 12, unit: 12 },
            ImmShifted5_20_21 | ImmShifted5_20_21_22 => Vocabulary::Shifted {
                imm_bits: 16,
                unit: 16,
            },
            Simm12_20 | Simm15_21Times4 | Simm15_21Times8 | Simm5_23 | Simm0_25 | Simm5_23_29_30
            | Page5_23_29_30 => Vocabulary::Signed,
            Imm10_15 | Imm16_21 | Imm5_20 | Imm10_21 | Imm10_21Times2 | Imm10_21Times4
            | Imm10_21Times8 => Vocabulary::Unsigned,
        }
    }
}

const RELOCS: &[RelocKind] = &[
    RelocKind {
        name: "abs32",
        r_type: elf::R_AARCH64_ABS32,
        implies_local: false,
        sample: None,
    },
    RelocKind {
        name: "abs64",
        r_type: elf::R_AARCH64_ABS64,
        implies_local: false,
        sample: None,
    },
    RelocKind {
        name: "adr_prel_pg_hi21",
        r_type: elf::R_AARCH64_ADR_PREL_PG_HI21,
        implies_local: false,
        sample: Some("adrp x0 expr:adr_prel_pg_hi21:x"),
    },
    RelocKind {
        name: "add_abs_lo12_nc",
        r_type: elf::R_AARCH64_ADD_ABS_LO12_NC,
        implies_local: false,
        sample: Some("add_x_imm x0 x0 expr:add_abs_lo12_nc:x"),
    },
    RelocKind {
        name: "ldst64_abs_lo12_nc",
        r_type: elf::R_AARCH64_LDST64_ABS_LO12_NC,
        implies_local: false,
        sample: Some("ldr_x_imm x0 x0 expr:ldst64_abs_lo12_nc:x"),
    },
    RelocKind {
        name: "condbr19",
        r_type: elf::R_AARCH64_CONDBR19,
        implies_local: true,
        sample: Some("b_eq expr:condbr19:x"),
    },
    RelocKind {
        name: "jump26",
        r_type: elf::R_AARCH64_JUMP26,
        implies_local: true,
        sample: Some("b expr:jump26:x"),
    },
    RelocKind {
        name: "call26",
        r_type: elf::R_AARCH64_CALL26,
        implies_local: false,
        sample: Some("bl expr:call26:x"),
    },
];

type Bits = (u32, u32, u32);

struct Table {
    ops: Vec<Opcode<A64Field>>,
}

impl Table {
    fn add(
        &mut self,
        mnemonic: &str,
        variant: &str,
        bits: &[Bits],
        fields: &[A64Field],
        flags: OpcodeFlags,
    ) -> &mut Opcode<A64Field> {
        self.ops
            .push(Opcode::new(mnemonic, variant, bits, fields.to_vec(), flags, DISCRIMINANT));
        let last = self.ops.len() - 1;
        &mut self.ops[last]
    }
}

/// Register operands of one general purpose width.
struct Gp {
    tag: &'static str,
    sf: u32,
    r0: A64Field,
    r5: A64Field,
    r10: A64Field,
    r16: A64Field,
    sp0: A64Field,
    sp5: A64Field,
    flags: OpcodeFlags,
}

const GP: [Gp; 2] = [
    Gp {
        tag: "x",
        sf: 1,
        r0: A64Field::Xreg0_4,
        r5: A64Field::Xreg5_9,
        r10: A64Field::Xreg10_14,
        r16: A64Field::Xreg16_20,
        sp0: A64Field::Xsp0_4,
        sp5: A64Field::Xsp5_9,
        flags: OpcodeFlags::RESULT_64BIT,
    },
    Gp {
        tag: "w",
        sf: 0,
        r0: A64Field::Wreg0_4,
        r5: A64Field::Wreg5_9,
        r10: A64Field::Wreg10_14,
        r16: A64Field::Wreg16_20,
        sp0: A64Field::Wsp0_4,
        sp5: A64Field::Wsp5_9,
        flags: OpcodeFlags::NONE,
    },
];

/// One load/store register class: `(tag, ldr, str, size, vector, reg, scaled offset, bytes)`.
type MemClass = (&'static str, &'static str, &'static str, u32, u32, A64Field, A64Field, u8);

const MEM_CLASSES: [MemClass; 6] = [
    ("x", "ldr", "str", 3, 0, A64Field::Xreg0_4, A64Field::Imm10_21Times8, 8),
    ("w", "ldr", "str", 2, 0, A64Field::Wreg0_4, A64Field::Imm10_21Times4, 4),
    ("w", "ldrh", "strh", 1, 0, A64Field::Wreg0_4, A64Field::Imm10_21Times2, 2),
    ("w", "ldrb", "strb", 0, 0, A64Field::Wreg0_4, A64Field::Imm10_21, 1),
    ("d", "ldr", "str", 3, 1, A64Field::Dreg0_4, A64Field::Imm10_21Times8, 8),
    ("s", "ldr", "str", 2, 1, A64Field::Sreg0_4, A64Field::Imm10_21Times4, 4),
];

/// Sign extending loads: `(name, size, opc, reg, scaled offset, bytes)`.
const SIGNED_LOADS: [(&str, u32, u32, A64Field, A64Field, u8); 5] = [
    ("ldrsw_x", 2, 2, A64Field::Xreg0_4, A64Field::Imm10_21Times4, 4),
    ("ldrsh_x", 1, 2, A64Field::Xreg0_4, A64Field::Imm10_21Times2, 2),
    ("ldrsh_w", 1, 3, A64Field::Wreg0_4, A64Field::Imm10_21Times2, 2),
    ("ldrsb_x", 0, 2, A64Field::Xreg0_4, A64Field::Imm10_21, 1),
    ("ldrsb_w", 0, 3, A64Field::Wreg0_4, A64Field::Imm10_21, 1),
];

/// Register pairs: `(tag, opc, vector, first, second, offset, bytes)`.
const PAIRS: [(&str, u32, u32, A64Field, A64Field, A64Field, u8); 3] = [
    ("x", 2, 0, A64Field::Xreg0_4, A64Field::Xreg10_14, A64Field::Simm15_21Times8, 16),
    ("w", 0, 0, A64Field::Wreg0_4, A64Field::Wreg10_14, A64Field::Simm15_21Times4, 8),
    ("d", 1, 1, A64Field::Dreg0_4, A64Field::Dreg10_14, A64Field::Simm15_21Times8, 16),
];

const INDEXED: [(&str, u32, OpcodeFlags); 2] = [
    ("imm_post", 1, OpcodeFlags(OpcodeFlags::ADDR_POST.0 | OpcodeFlags::ADDR_UPDATE.0)),
    ("imm_pre", 3, OpcodeFlags(OpcodeFlags::ADDR_PRE.0 | OpcodeFlags::ADDR_UPDATE.0)),
];

#[rustfmt::skip]
fn opcodes() -> Vec<Opcode<A64Field>> {
    use A64Field::*;
    let mut t = Table { ops: Vec::new() };

    for g in &GP {
        let sf = g.sf;
        for (m, top, sr) in [
            ("add", 0b0010_0010, SrUpdate::None),
            ("adds", 0b0110_0010, SrUpdate::Nczv),
            ("sub", 0b1010_0010, SrUpdate::None),
            ("subs", 0b1110_0010, SrUpdate::Nczv),
        ] {
            // the flag setting forms write the zero register instead of sp
            let dst = if sr == SrUpdate::None { g.sp0 } else { g.r0 };
            t.add(m, &format!("{}_imm", g.tag), &[(0x1ff, sf << 8 | top, 23)],
                &[dst, g.sp5, ImmShifted10_21_22], OpcodeFlags::ALU | g.flags).sr_update = sr;
        }
        for (m, top, sr) in [
            ("add", 0b000_1011, SrUpdate::None),
            ("adds", 0b010_1011, SrUpdate::Nczv),
            ("sub", 0b100_1011, SrUpdate::None),
            ("subs", 0b110_1011, SrUpdate::Nczv),
        ] {
            t.add(m, &format!("{}_reg", g.tag), &[(0xff, sf << 7 | top, 24), (1, 0, 21)],
                &[g.r0, g.r5, g.r16, Shift22_23, Imm10_15], OpcodeFlags::ALU | g.flags).sr_update = sr;
        }
        for (m, opc, n) in [
            ("and", 0, 0),
            ("bic", 0, 1),
            ("orr", 1, 0),
            ("orn", 1, 1),
            ("eor", 2, 0),
            ("eon", 2, 1),
            ("ands", 3, 0),
            ("bics", 3, 1),
        ] {
            let sr = if opc == 3 { SrUpdate::Nz } else { SrUpdate::None };
            t.add(m, &format!("{}_reg", g.tag), &[(1, sf, 31), (3, opc, 29), (0x1f, 0b01010, 24), (1, n, 21)],
                &[g.r0, g.r5, g.r16, Shift22_23, Imm10_15], OpcodeFlags::ALU | g.flags).sr_update = sr;
        }
        for (m, opc) in [("movn", 0), ("movz", 2), ("movk", 3)] {
            if sf == 1 {
                t.add(m, "x_imm", &[(0x1ff, 1 << 8 | opc << 6 | 0b10_0101, 23)],
                    &[Xreg0_4, ImmShifted5_20_21_22], OpcodeFlags::ALU1 | g.flags);
            } else {
                t.add(m, "w_imm", &[(0x1ff, opc << 6 | 0b10_0101, 23), (1, 0, 22)],
                    &[Wreg0_4, ImmShifted5_20_21], OpcodeFlags::ALU1);
            }
        }
        for (m, opc) in [("sbfm", 0), ("ubfm", 2)] {
            t.add(m, g.tag, &[(0x3ff, sf << 9 | opc << 7 | 0b10_0110 << 1 | sf, 22)],
                &[g.r0, g.r5, Imm16_21, Imm10_15], OpcodeFlags::ALU1 | g.flags);
        }
        for (m, o0) in [("madd", 0), ("msub", 1)] {
            t.add(m, g.tag, &[(0x7ff, sf << 10 | 0b000_1101_1000, 21), (1, o0, 15)],
                &[g.r0, g.r5, g.r16, g.r10], OpcodeFlags::MULACC | g.flags);
        }
        for (m, opcode, flags) in [
            ("udiv", 0b00_0010, OpcodeFlags::DIV),
            ("sdiv", 0b00_0011, OpcodeFlags::DIV),
            ("lslv", 0b00_1000, OpcodeFlags::ALU),
            ("lsrv", 0b00_1001, OpcodeFlags::ALU),
            ("asrv", 0b00_1010, OpcodeFlags::ALU),
            ("rorv", 0b00_1011, OpcodeFlags::ALU),
        ] {
            t.add(m, g.tag, &[(0x7ff, sf << 10 | 0b000_1101_0110, 21), (0x3f, opcode, 10)],
                &[g.r0, g.r5, g.r16], flags | g.flags);
        }
        for (m, op, op2) in [("csel", 0, 0), ("csinc", 0, 1), ("csinv", 1, 0), ("csneg", 1, 1)] {
            t.add(m, g.tag, &[(0x7ff, sf << 10 | op << 9 | 0b000_1101_0100, 21), (3, op2, 10)],
                &[g.r0, g.r5, g.r16, Cond12_15], OpcodeFlags::ALU | g.flags);
        }
        for (m, nz) in [("cbz", 0), ("cbnz", 1)] {
            t.add(m, g.tag, &[(0xff, sf << 7 | 0b011_0100 | nz, 24)],
                &[g.r0, Simm5_23], OpcodeFlags::COND_BRANCH);
        }
    }

    for (m, op31) in [("smulh", 2), ("umulh", 6)] {
        t.add(m, "", &[(0x7ff, 0b100_1101_1000 | op31, 21), (1, 0, 15), (0x1f, 0x1f, 10)],
            &[Xreg0_4, Xreg5_9, Xreg16_20], OpcodeFlags::MUL | OpcodeFlags::RESULT_64BIT);
    }

    // pc relative addressing and branches
    t.add("adr", "", &[(1, 0, 31), (0x1f, 0x10, 24)], &[Xreg0_4, Simm5_23_29_30], OpcodeFlags::ALU1);
    t.add("adrp", "", &[(1, 1, 31), (0x1f, 0x10, 24)], &[Xreg0_4, Page5_23_29_30], OpcodeFlags::ALU1);
    t.add("b", "", &[(0x3f, 0b00_0101, 26)], &[Simm0_25], OpcodeFlags::JUMP);
    t.add("bl", "", &[(0x3f, 0b10_0101, 26)], &[Simm0_25], OpcodeFlags::JUMP | OpcodeFlags::LINK);
    for (i, cond) in CONDS.iter().take(14).enumerate() {
        t.add("b", cond, &[(0xff, 0x54, 24), (1, 0, 4), (0xf, i as u32, 0)], &[Simm5_23], OpcodeFlags::COND_BRANCH);
    }
    for (m, value, flags) in [
        ("br", 0xd61f_0000, OpcodeFlags::JUMP),
        ("blr", 0xd63f_0000, OpcodeFlags::JUMP | OpcodeFlags::LINK),
        ("ret", 0xd65f_0000, OpcodeFlags::JUMP),
    ] {
        t.add(m, "", &[(0xffff_fc1f, value, 0)], &[Xreg5_9], flags);
    }
    for (m, opc, ll) in [("svc", 0, 1), ("brk", 1, 0), ("hlt", 2, 0)] {
        t.add(m, "", &[(0xff, 0xd4, 24), (7, opc, 21), (0x1f, ll, 0)], &[Imm5_20], OpcodeFlags::SYSCALL);
    }
    t.add("nop", "", &[(0xffff_ffff, 0xd503_201f, 0)], &[], OpcodeFlags::MISC);

    // single register loads and stores
    for (tag, ld, st, size, v, reg, scaled, width) in MEM_CLASSES {
        let float = if v == 1 { OpcodeFlags::FLOAT } else { OpcodeFlags::NONE };
        let top = size << 8 | 0b111 << 5 | v << 4 | 0b01 << 2;
        t.add(ld, &format!("{}_imm", tag), &[(0x3ff, top | 1, 22)],
            &[reg, Xsp5_9, scaled], OpcodeFlags::LOAD | float).mem_width = width;
        t.add(st, &format!("{}_imm", tag), &[(0x3ff, top, 22)],
            &[Xsp5_9, scaled, reg], OpcodeFlags::STORE | float).mem_width = width;
        let top = size << 9 | 0b111 << 6 | v << 5;
        for (form, op2, mode) in INDEXED {
            t.add(ld, &format!("{}_{}", tag, form), &[(0x7ff, top | 2, 21), (3, op2, 10)],
                &[reg, Xsp5_9, Simm12_20], OpcodeFlags::LOAD | float | mode).mem_width = width;
            t.add(st, &format!("{}_{}", tag, form), &[(0x7ff, top, 21), (3, op2, 10)],
                &[Xsp5_9, Simm12_20, reg], OpcodeFlags::STORE | float | mode).mem_width = width;
        }
        let suffix = &ld[3..];
        t.add(&format!("ldur{}", suffix), tag, &[(0x7ff, top | 2, 21), (3, 0, 10)],
            &[reg, Xsp5_9, Simm12_20], OpcodeFlags::LOAD | float).mem_width = width;
        let suffix = &st[3..];
        t.add(&format!("stur{}", suffix), tag, &[(0x7ff, top, 21), (3, 0, 10)],
            &[Xsp5_9, Simm12_20, reg], OpcodeFlags::STORE | float).mem_width = width;
    }
    for (name, size, opc, reg, scaled, width) in SIGNED_LOADS {
        let flags = OpcodeFlags::LOAD | OpcodeFlags::SIGNEXTEND;
        t.add(name, "imm", &[(0x3ff, size << 8 | 0b111 << 5 | 0b01 << 2 | opc, 22)],
            &[reg, Xsp5_9, scaled], flags).mem_width = width;
        for (form, op2, mode) in INDEXED {
            t.add(name, form, &[(0x7ff, (size << 8 | 0b111 << 5 | opc) << 1, 21), (3, op2, 10)],
                &[reg, Xsp5_9, Simm12_20], flags | mode).mem_width = width;
        }
    }

    // register pairs
    for (tag, opc, v, first, second, offset, width) in PAIRS {
        let float = if v == 1 { OpcodeFlags::FLOAT } else { OpcodeFlags::NONE };
        for (form, mode, addr) in [
            ("imm_post", 1, OpcodeFlags(OpcodeFlags::ADDR_POST.0 | OpcodeFlags::ADDR_UPDATE.0)),
            ("imm", 2, OpcodeFlags::NONE),
            ("imm_pre", 3, OpcodeFlags(OpcodeFlags::ADDR_PRE.0 | OpcodeFlags::ADDR_UPDATE.0)),
        ] {
            let top = opc << 8 | 0b101 << 5 | v << 4 | mode << 1;
            let multi = OpcodeFlags::MULTIPLE | float | addr;
            t.add("ldp", &format!("{}_{}", tag, form), &[(0x3ff, top | 1, 22)],
                &[first, second, Xsp5_9, offset], OpcodeFlags::LOAD | multi).mem_width = width;
            t.add("stp", &format!("{}_{}", tag, form), &[(0x3ff, top, 22)],
                &[Xsp5_9, offset, first, second], OpcodeFlags::STORE | multi).mem_width = width;
        }
    }

    // scalar floating point
    for (tag, ft, r0, r5, r10, r16) in [
        ("s", 0, Sreg0_4, Sreg5_9, Sreg10_14, Sreg16_20),
        ("d", 1, Dreg0_4, Dreg5_9, Dreg10_14, Dreg16_20),
    ] {
        let top = 0b000_1111_0001 | ft << 1;
        for (m, opcode) in [
            ("fmul", 0),
            ("fdiv", 1),
            ("fadd", 2),
            ("fsub", 3),
            ("fmax", 4),
            ("fmin", 5),
            ("fnmul", 8),
        ] {
            t.add(m, tag, &[(0x7ff, top, 21), (0x3f, opcode << 2 | 2, 10)],
                &[r0, r5, r16], OpcodeFlags::FLOAT | OpcodeFlags::ALU);
        }
        for (m, opcode) in [("fmov", 0), ("fabs", 1), ("fneg", 2), ("fsqrt", 3)] {
            t.add(m, tag, &[(0x7ff, top, 21), (0x7ff, opcode << 5 | 0x10, 10)],
                &[r0, r5], OpcodeFlags::FLOAT | OpcodeFlags::ALU1);
        }
        for (m, opc2) in [("fcmp", 0), ("fcmpe", 0x10)] {
            t.add(m, tag, &[(0x7ff, top, 21), (0x3f, 8, 10), (0x1f, opc2, 0)],
                &[r5, r16], OpcodeFlags::FLOAT | OpcodeFlags::TEST).sr_update = SrUpdate::Nczv;
            t.add(m, &format!("{}_zero", tag), &[(0x7ff, top, 21), (0x1f, 0, 16), (0x3f, 8, 10), (0x1f, opc2 | 8, 0)],
                &[r5], OpcodeFlags::FLOAT | OpcodeFlags::TEST).sr_update = SrUpdate::Nczv;
        }
        for (m, o1, o0) in [("fmadd", 0, 0), ("fmsub", 0, 1), ("fnmadd", 1, 0), ("fnmsub", 1, 1)] {
            t.add(m, tag, &[(0x7ff, 0b000_1111_1000 | ft << 1 | o1, 21), (1, o0, 15)],
                &[r0, r5, r16, r10], OpcodeFlags::FLOAT | OpcodeFlags::MULACC);
        }
    }
    t.add("fcvt", "s_d", &[(0x7ff, 0b000_1111_0011, 21), (0x7ff, 4 << 5 | 0x10, 10)],
        &[Sreg0_4, Dreg5_9], OpcodeFlags::FLOAT | OpcodeFlags::ALU1);
    t.add("fcvt", "d_s", &[(0x7ff, 0b000_1111_0001, 21), (0x7ff, 5 << 5 | 0x10, 10)],
        &[Dreg0_4, Sreg5_9], OpcodeFlags::FLOAT | OpcodeFlags::ALU1);

    // conversions and moves between register files
    for g in &GP {
        for (tag, ft, f0, f5) in [("s", 0, Sreg0_4, Sreg5_9), ("d", 1, Dreg0_4, Dreg5_9)] {
            let top = g.sf << 10 | 0b000_1111_0001 | ft << 1;
            let bits = |rm: u32| [(0x7ff, top, 21), (0x1f, rm, 16), (0x3f, 0, 10)];
            let flags = OpcodeFlags::FLOAT | OpcodeFlags::ALU1;
            t.add("scvtf", &format!("{}_{}", tag, g.tag), &bits(0b00010), &[f0, g.r5], flags);
            t.add("ucvtf", &format!("{}_{}", tag, g.tag), &bits(0b00011), &[f0, g.r5], flags);
            t.add("fcvtzs", &format!("{}_{}", g.tag, tag), &bits(0b11000), &[g.r0, f5], flags);
            t.add("fcvtzu", &format!("{}_{}", g.tag, tag), &bits(0b11001), &[g.r0, f5], flags);
            // bit copies only exist between registers of the same size
            if ft == g.sf {
                t.add("fmov", &format!("{}_{}", tag, g.tag), &bits(0b00111), &[f0, g.r5], flags);
                t.add("fmov", &format!("{}_{}", g.tag, tag), &bits(0b00110), &[g.r0, f5], flags);
            }
        }
    }

    t.ops
}

/// The A64 architecture backend.
pub struct A64 {
    isa: WordIsa<A64Field>,
}

impl A64 {
    /// Builds the catalog.
    ///
    /// # Panics
    /// If the opcode table is inconsistent.
    pub fn new() -> Self {
        match WordIsa::new(opcodes(), DISCRIMINANT, &[], RELOCS, None) {
            Ok(isa) => Self { isa },
            Err(e) => panic!("A64 opcode catalog is inconsistent: {}", e),
        }
    }

    pub fn isa(&self) -> &WordIsa<A64Field> {
        &self.isa
    }
}

impl Default for A64 {
    fn default() -> Self {
        Self::new()
    }
}

impl Architecture for A64 {
    fn name(&self) -> &'static str {
        "a64"
    }

    fn elf_machine(&self) -> u16 {
        elf::EM_AARCH64
    }

    fn is_64bit(&self) -> bool {
        true
    }

    fn base_address(&self) -> u64 {
        0x40_0000
    }

    fn segment_alignment(&self) -> u64 {
        0x1_0000
    }

    fn code_padding(&self, len: usize) -> Vec<u8> {
        repeat_nop(&NOP, len)
    }

    fn data_reloc(&self, width: usize) -> Result<u32, AsmError> {
        match width {
            4 => Ok(elf::R_AARCH64_ABS32),
            8 => Ok(elf::R_AARCH64_ABS64),
            _ => Err(AsmError::syntax(format!("a64 addresses are 4 or 8 bytes, not {}", width))),
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
        let pc = p as i64;
        match r_type {
            // S + A
            elf::R_AARCH64_ABS64 => write_le::<8>(data, offset, p, target, false),
            elf::R_AARCH64_ABS32 => write_le::<4>(data, offset, p, target, false),
            // Page(S + A) - Page(P)
            elf::R_AARCH64_ADR_PREL_PG_HI21 => {
                let pages = fit_signed((target >> 12) - (pc >> 12), 21, p)?;
                word_patch(&self.isa, data, offset, r_type, pages)
            }
            // (S + A) & 0xfff
            elf::R_AARCH64_ADD_ABS_LO12_NC | elf::R_AARCH64_LDST64_ABS_LO12_NC => {
                word_patch(&self.isa, data, offset, r_type, target & 0xfff)
            }
            // (S + A - P) >> 2
            elf::R_AARCH64_CONDBR19 => {
                let disp = target - pc;
                let words = fit_signed(disp >> 2, 19, p)
                    .map_err(|_| AsmError::RelocationOverflow { place: p, value: disp, bits: 21 })?;
                word_patch(&self.isa, data, offset, r_type, words)
            }
            elf::R_AARCH64_JUMP26 | elf::R_AARCH64_CALL26 => {
                let disp = target - pc;
                let words = fit_signed(disp >> 2, 26, p)
                    .map_err(|_| AsmError::RelocationOverflow { place: p, value: disp, bits: 28 })?;
                word_patch(&self.isa, data, offset, r_type, words)
            }
            _ => Err(AsmError::syntax(format!("unsupported a64 relocation type {}", r_type))),
        }
    }

    fn reloc_name(&self, r_type: u32) -> &'static str {
        match r_type {
            elf::R_AARCH64_ABS32 => "R_AARCH64_ABS32",
            elf::R_AARCH64_ABS64 => "R_AARCH64_ABS64",
            elf::R_AARCH64_ADR_PREL_PG_HI21 => "R_AARCH64_ADR_PREL_PG_HI21",
            elf::R_AARCH64_ADD_ABS_LO12_NC => "R_AARCH64_ADD_ABS_LO12_NC",
            elf::R_AARCH64_LDST64_ABS_LO12_NC => "R_AARCH64_LDST64_ABS_LO12_NC",
            elf::R_AARCH64_CONDBR19 => "R_AARCH64_CONDBR19",
            elf::R_AARCH64_JUMP26 => "R_AARCH64_JUMP26",
            elf::R_AARCH64_CALL26 => "R_AARCH64_CALL26",
            _ => "R_AARCH64_UNKNOWN",
        }
    }

    fn startup_code(&self) -> &'static str {
        STARTUP
    }
}

const STARTUP: &str = "
.fun _start 16
    ldr_x_imm x0 sp 0
    add_x_imm x1 sp 8
    bl expr:call26:main
    movz_x_imm x8 93
    svc 0
.endfun
";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Template;

    const SEEDS: [u32; 6] = [0, 0xffff_ffff, 0x1234_5678, 0x8765_4321, 0xa5a5_a5a5, 0x5a5a_5a5a];

    fn word(a: &A64, text: &str) -> u32 {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        let enc = a.assemble(tokens[0], &tokens[1..]).unwrap();
        u32::from_le_bytes(enc.bytes.try_into().unwrap())
    }

    fn text(a: &A64, w: u32) -> String {
        a.disassemble(&w.to_le_bytes(), None).unwrap().to_string()
    }

    #[test]
    fn known_encodings() {
        let a = A64::new();
        assert_eq!(word(&a, "add_x_imm sp sp 16"), 0x9100_43ff);
        assert_eq!(word(&a, "stp_x_imm_pre sp -16 x29 x30"), 0xa9bf_7bfd);
        assert_eq!(word(&a, "ldp_x_imm_post x29 x30 sp 16"), 0xa8c1_7bfd);
        assert_eq!(word(&a, "ret x30"), 0xd65f_03c0);
        assert_eq!(word(&a, "ret lr"), 0xd65f_03c0);
        assert_eq!(word(&a, "ldr_x_imm x0 sp 0"), 0xf940_03e0);
        assert_eq!(word(&a, "str_x_imm sp 8 x0"), 0xf900_07e0);
        assert_eq!(word(&a, "ldr_d_imm d0 x1 16"), 0xfd40_0820);
        assert_eq!(word(&a, "movz_x_imm x8 93"), 0xd280_0ba8);
        assert_eq!(word(&a, "fadd_d d0 d1 d2"), 0x1e62_2820);
        assert_eq!(word(&a, "svc 0"), 0xd400_0001);
        assert_eq!(word(&a, "nop"), u32::from_le_bytes(NOP));
    }

    #[test]
    fn move_wide_shift_survives_a_round_trip() {
        let a = A64::new();
        let w = word(&a, "movz_x_imm x0 0x1234:lsl32");
        assert_eq!(w, 0xd2c2_4680);
        assert_eq!(text(&a, w), "movz_x_imm x0 4660:lsl32");
        // a plain value picks the halfword that holds it
        assert_eq!(word(&a, "movk_x_imm x1 0x12340000"), word(&a, "movk_x_imm x1 4660:lsl16"));
        assert_eq!(word(&a, "add_x_imm x0 x0 4096"), word(&a, "add_x_imm x0 x0 1:lsl12"));
        // 32-bit forms only have two halfwords
        assert!(a.assemble("movz_w_imm", &["w0", "1:lsl32"]).is_err());
        assert!(a.assemble("movz_x_imm", &["x0", "0x12345"]).is_err());
    }

    #[test]
    fn scaled_offsets_must_be_multiples() {
        let a = A64::new();
        assert!(a.assemble("ldr_x_imm", &["x0", "x1", "12"]).is_err());
        assert!(a.assemble("ldr_w_imm", &["w0", "x1", "12"]).is_ok());
        assert!(a.assemble("ldur_x", &["x0", "x1", "-256"]).is_ok());
        assert!(a.assemble("ldur_x", &["x0", "x1", "-257"]).is_err());
    }

    #[test]
    fn every_template_round_trips() {
        let a = A64::new();
        let isa = a.isa();
        for op in isa.catalog.iter() {
            assert_eq!(op.check_coverage(), Ok(()));
            for seed in SEEDS {
                let w = op.value | (seed & !op.mask);
                let ins = isa.disassemble(w).unwrap();
                assert_eq!(ins.opcode.name, op.name, "{:#010x}", w);
                assert_eq!(isa.assemble(&ins).unwrap(), w, "{} {:#010x}", op.name, w);
                let (name, ops) = isa.ins_symbolize(&ins);
                let tokens: Vec<&str> = ops.iter().map(String::as_str).collect();
                let again = isa.ins_from_symbolized(&name, &tokens).unwrap();
                assert_eq!(again, ins, "{} {:?}", name, ops);
            }
        }
        assert!(isa.catalog.len() > 200);
    }

    #[test]
    fn flag_setting_forms_name_the_zero_register() {
        let a = A64::new();
        // cmp x1, #4
        assert_eq!(text(&a, 0xf100_103f), "subs_x_imm xzr x1 4");
        assert_eq!(text(&a, 0xd100_13ff), "sub_x_imm sp sp 4");
        assert_eq!(a.isa().find_opcode(0xf100_103f).unwrap().sr_update, SrUpdate::Nczv);
    }

    #[test]
    fn page_and_low_bits_relocations() {
        let a = A64::new();
        let enc = a.assemble("adrp", &["x0", "expr:adr_prel_pg_hi21:table"]).unwrap();
        let mut buf = enc.bytes;
        a.apply_relocation(0, elf::R_AARCH64_ADR_PREL_PG_HI21, 0x40_0000, 0x41_2345, 0, &mut buf)
            .unwrap();
        // 0x12 pages: immlo 2, immhi 4
        assert_eq!(u32::from_le_bytes(buf.try_into().unwrap()), 0xd000_0080);
        // adr takes a byte offset, not a page count
        assert!(a.assemble("adr", &["x0", "expr:adr_prel_pg_hi21:table"]).is_err());

        let enc = a.assemble("add_x_imm", &["x0", "x0", "expr:add_abs_lo12_nc:table"]).unwrap();
        let mut buf = enc.bytes;
        a.apply_relocation(0, elf::R_AARCH64_ADD_ABS_LO12_NC, 0x40_0004, 0x41_2345, 0, &mut buf)
            .unwrap();
        assert_eq!(u32::from_le_bytes(buf.try_into().unwrap()), 0x910d_1400);

        let mut data = vec![0u8; 8];
        a.apply_relocation(0, elf::R_AARCH64_ABS64, 0, 0x41_2345, 3, &mut data).unwrap();
        assert_eq!(data, 0x41_2348u64.to_le_bytes());
    }

    #[test]
    fn branch_relocations() {
        let a = A64::new();
        let enc = a.assemble("bl", &["expr:call26:main"]).unwrap();
        assert!(!enc.reloc.as_ref().unwrap().is_local);
        let mut buf = enc.bytes;
        a.apply_relocation(0, elf::R_AARCH64_CALL26, 0x40_0010, 0x40_0000, 0, &mut buf).unwrap();
        assert_eq!(u32::from_le_bytes(buf.try_into().unwrap()), 0x97ff_fffc);

        let enc = a.assemble("b_ne", &["expr:condbr19:loop"]).unwrap();
        assert!(enc.reloc.as_ref().unwrap().is_local);
        let mut buf = enc.bytes.clone();
        a.apply_relocation(0, elf::R_AARCH64_CONDBR19, 0x40_0000, 0x40_0008, 0, &mut buf).unwrap();
        assert_eq!(u32::from_le_bytes(buf.try_into().unwrap()), 0x5400_0041);

        let mut buf = enc.bytes;
        let err = a
            .apply_relocation(0, elf::R_AARCH64_CONDBR19, 0x40_0000, 0x50_0000, 0, &mut buf)
            .unwrap_err();
        assert!(matches!(err, AsmError::RelocationOverflow { bits: 21, .. }), "{}", err);

        // a conditional branch relocation does not fit an unconditional branch
        assert!(a.assemble("b", &["expr:condbr19:loop"]).is_err());
    }

    #[test]
    fn listing_shows_pending_relocation() {
        let a = A64::new();
        let enc = a.assemble("bl", &["expr:call26:main"]).unwrap();
        let text = a.disassemble(&enc.bytes, enc.reloc.as_ref()).unwrap().to_string();
        assert_eq!(text, "bl expr:call26:main");
        let enc = a.assemble("b", &["expr:loc_jump26:next:8"]).unwrap();
        let text = a.disassemble(&enc.bytes, enc.reloc.as_ref()).unwrap().to_string();
        assert_eq!(text, "b expr:jump26:next:8");
    }
}
