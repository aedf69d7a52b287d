use uasm::arch::a32::A32;
use uasm::arch::Architecture;
use uasm::assembler::unit_parse;
use uasm::error::AsmError;
use uasm::listing::text_listing;
use uasm::unit::SectionId;

#[test]
fn add_immediate_assembles_the_same_twice() {
    let a = A32::new();
    let first = a.assemble("add_imm", &["al", "r4", "r4", "1"]).unwrap();
    let second = a.assemble("add_imm", &["al", "r4", "r4", "1"]).unwrap();
    assert_eq!(first, second);
    let decoded = a.disassemble(&first.bytes, None).unwrap();
    assert_eq!(decoded.mnemonic, "add_imm");
    assert_eq!(decoded.operands, ["al", "r4", "r4", "1"]);
}

#[test]
fn rotated_immediates() {
    let a = A32::new();
    let err = a.assemble("add_imm", &["al", "r0", "r0", "0x101"]).unwrap_err();
    assert!(matches!(err, AsmError::EncodingRange { .. }), "{err}");
    // 0x3fc is 0xff rotated right by 30
    let enc = a.assemble("add_imm", &["al", "r0", "r0", "0x3fc"]).unwrap();
    assert_eq!(u32::from_le_bytes(enc.bytes.try_into().unwrap()), 0xe280_0fff);
}

#[test]
fn listing_reassembles() {
    let a = A32::new();
    let src = "
.fun main 16
    movw al r0 expr:movw_abs_nc:msg
    movt al r0 expr:movt_abs:msg
    bl al lr expr:call:helper
    bx al lr
.endfun
.fun helper 4
    mov_imm al r0 7
    bx al lr
.endfun
.mem msg 4 rodata
    .data 1 \"hi\"
.endmem
";
    let unit = unit_parse(&a, src, true).unwrap();
    let listing = text_listing(&a, &unit);
    assert!(listing.contains("bl al lr expr:call:helper"), "{listing}");
    assert!(listing.contains("movw al r0 expr:movw_abs_nc:msg"), "{listing}");
    let text = &unit.section(SectionId::Text).data;
    let mut count = 0;
    for line in listing.lines().filter(|l| !l.starts_with('.')) {
        let (offset, rest) = line.split_once(':').unwrap();
        let offset = usize::from_str_radix(offset.trim(), 16).unwrap();
        let tokens: Vec<&str> = rest.split_whitespace().skip(4).collect();
        let enc = a.assemble(tokens[0], &tokens[1..]).unwrap_or_else(|e| panic!("{line}: {e}"));
        assert_eq!(enc.bytes, text[offset..offset + 4], "{line}");
        count += 1;
    }
    assert_eq!(count * 4, text.len());
}

#[test]
fn undecodable_words_are_listed_as_data() {
    let a = A32::new();
    let mut unit = unit_parse(&a, ".fun main 4\n  bx al lr\n.endfun\n", false).unwrap();
    unit.section_mut(SectionId::Text).add_bytes(&[0xff; 4]);
    let listing = text_listing(&a, &unit);
    let last = listing.lines().last().unwrap();
    assert!(last.ends_with(".data 1 \"\\xff\\xff\\xff\\xff\""), "{listing}");
}
