use uasm::arch::a64::A64;
use uasm::arch::Architecture;
use uasm::assembler::unit_parse;
use uasm::listing::text_listing;
use uasm::unit::SectionId;

fn round_trip(a: &A64, text: &str) -> String {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let enc = a.assemble(tokens[0], &tokens[1..]).unwrap();
    a.disassemble(&enc.bytes, None).unwrap().to_string()
}

#[test]
fn move_wide_pair_keeps_immediate_and_shift() {
    let a = A64::new();
    assert_eq!(round_trip(&a, "movz_x_imm x0 0xdead:lsl16"), "movz_x_imm x0 57005:lsl16");
    assert_eq!(round_trip(&a, "movk_x_imm x0 0xbeef:lsl48"), "movk_x_imm x0 48879:lsl48");
    assert_eq!(round_trip(&a, "movk_x_imm x0 7"), "movk_x_imm x0 7");
}

#[test]
fn listing_reassembles() {
    let a = A64::new();
    let src = "
.fun main 16
    adrp x0 expr:adr_prel_pg_hi21:msg
    add_x_imm x0 x0 expr:add_abs_lo12_nc:msg
    cbz_x x0 expr:condbr19:out
    movz_x_imm x0 1
.bbl out 4
    ret x30
.endfun
.mem msg 8 rodata
    .data 1 \"hi\"
.endmem
";
    let unit = unit_parse(&a, src, true).unwrap();
    let listing = text_listing(&a, &unit);
    assert!(listing.contains("adrp x0 expr:adr_prel_pg_hi21:msg"), "{listing}");
    assert!(listing.contains("bl expr:call26:main"), "{listing}");
    assert!(listing.contains(".bbl out"), "{listing}");
    let text = &unit.section(SectionId::Text).data;
    for line in listing.lines().filter(|l| !l.starts_with('.')) {
        let (offset, rest) = line.split_once(':').unwrap();
        let offset = usize::from_str_radix(offset.trim(), 16).unwrap();
        let tokens: Vec<&str> = rest.split_whitespace().skip(4).collect();
        let enc = a.assemble(tokens[0], &tokens[1..]).unwrap_or_else(|e| panic!("{line}: {e}"));
        assert_eq!(enc.bytes, text[offset..offset + 4], "{line}");
    }
}

#[test]
fn data_address_widths() {
    let a = A64::new();
    assert!(unit_parse(&a, ".mem t 8 data\n  .addr.mem 4 t 0\n.endmem\n", false).is_ok());
    assert!(unit_parse(&a, ".mem t 8 data\n  .addr.mem 2 t 0\n.endmem\n", false).is_err());
}
