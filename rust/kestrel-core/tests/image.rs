//! Image assembly, serialization and disassembly as an embedder sees them.

use kestrel_core::image::opcode::{Opcode, GOSUB_FLAG};
use kestrel_core::image::{CallConv, Declare, Image, ImageBuilder, ImageError, ParamDecl};
use kestrel_core::{Value, VarType};

fn sample() -> Image {
    let mut b = ImageBuilder::new("sample");
    let decl = b.declare(Declare {
        name: "Beep".into(),
        library: "sound".into(),
        alias: None,
        convention: CallConv::CDecl,
        ret: VarType::Long,
    });
    let dflt = b.literal("5", Some(VarType::Long));
    b.procedure(
        "Main",
        vec![ParamDecl::new("n", VarType::Long).with_default(dflt)],
        VarType::Variant,
        true,
    );
    let (one, two) = (b.new_label(), b.new_label());
    b.stmnt(1).op2(Opcode::Param, 1, 0).on_jump(&[one, two], true);
    b.bind(one);
    b.stmnt(2)
        .op(Opcode::ArgC)
        .number("1.5")
        .op(Opcode::ArgV)
        .op2(Opcode::Call, decl, 0);
    b.bind(two);
    b.stmnt(3).find_args("Total", VarType::Variant);
    b.op(Opcode::Leave);
    b.finish().expect("assembles")
}

#[test]
fn json_round_trip_preserves_the_image() {
    let image = sample();
    let json = image.to_json().expect("serializes");
    let back = Image::from_json(&json).expect("parses");
    assert_eq!(back, image);
    let default = back.procedures[0].params[0].default.expect("default");
    assert_eq!(
        back.literal(default).and_then(|e| e.value()),
        Some(Value::Long(5))
    );
}

#[test]
fn malformed_json_is_rejected() {
    assert!(matches!(Image::from_json("{\"name\": 3}"), Err(ImageError::Json(_))));
}

#[test]
fn statement_scan_steps_over_jump_tables() {
    let image = sample();
    let first = image.next_statement(0).expect("line 1");
    let ins = image.decode(first.offset).expect("decodes");
    let after_param = first.offset + ins.len + 9;
    let onjump = image.decode(after_param).expect("decodes");
    assert_eq!(onjump.op, Opcode::OnJump);
    assert_eq!(onjump.a, 2 | GOSUB_FLAG);
    assert_eq!(onjump.len, 5 + 8);
    let second = image
        .next_statement(after_param + onjump.len)
        .expect("line 2");
    assert_eq!(second.line, 2);
    // Line 2 is ARGC, NUMBER, ARGV, CALL after its marker.
    let third = image
        .next_statement(second.offset + 9)
        .expect("line 3");
    assert_eq!(third.line, 3);
    assert_eq!(
        image.jump_table(after_param, &onjump),
        [second.offset as u32, third.offset as u32]
    );
}

#[test]
fn disassembly_names_operands() {
    let listing = sample().disassemble().expect("listing");
    let lines: Vec<&str> = listing.lines().collect();
    assert_eq!(lines[0], "Main:");
    assert!(lines.iter().any(|l| l.contains("OnJump") && l.contains("gosub [")));
    assert!(lines.iter().any(|l| l.contains("Number") && l.ends_with("; 1.5")));
    assert!(lines.iter().any(|l| l.contains("Call") && l.ends_with("; Beep")));
    assert!(lines.iter().any(|l| l.ends_with("; Total()")));
    assert!(lines.last().is_some_and(|l| l.contains("Leave")));
}

#[test]
fn truncated_code_is_reported() {
    let mut image = sample();
    image.code.truncate(image.code.len() - 3);
    assert!(matches!(image.disassemble(), Err(ImageError::Truncated(_))));
}
