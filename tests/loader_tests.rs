//! Loader tests: header validation, architecture handling, prototype
//! tree structure and the loader error paths.

mod common;

use common::{build_chunk, build_chunk_with_order, K, ProtoSpec};
use ferrule::{load_chunk, Constant, Error, Instruction, OpCode};

fn hello_proto() -> ProtoSpec {
    ProtoSpec {
        max_stack: 2,
        code: vec![
            Instruction::abx(OpCode::LoadK, 0, 0),
            Instruction::abc(OpCode::Return, 0, 2, 0),
        ],
        constants: vec![K::S("hi")],
        upvalues: vec![(true, 0)],
        ..Default::default()
    }
}

#[test]
fn loads_a_minimal_chunk() {
    let chunk = load_chunk(&build_chunk(&hello_proto())).unwrap();
    assert_eq!(chunk.header.version, 0x53);
    assert_eq!(chunk.num_upvalues, 1);
    assert!(chunk.header.arch.little_endian);

    let root = &chunk.root;
    assert_eq!(root.code.len(), 2);
    assert_eq!(root.constants.len(), 1);
    assert_eq!(root.upvalues.len(), 1);
    assert!(root.upvalues[0].in_stack);
    assert_eq!(root.max_stack_size, 2);
    assert!(!root.is_vararg);
    assert_eq!(root.constants[0], Constant::Str("hi".into()));
}

#[test]
fn loads_big_endian_chunks() {
    let chunk = load_chunk(&build_chunk_with_order(&hello_proto(), false)).unwrap();
    assert!(!chunk.header.arch.little_endian);
    // The instruction words decode identically whatever the byte order.
    assert_eq!(
        Instruction(chunk.root.code[0]).opcode().unwrap(),
        OpCode::LoadK
    );
    assert_eq!(Instruction(chunk.root.code[0]).bx(), 0);
}

#[test]
fn nested_prototype_counts_survive() {
    let grandchild = ProtoSpec {
        max_stack: 2,
        code: vec![Instruction::abc(OpCode::Return, 0, 1, 0)],
        upvalues: vec![(false, 0)],
        ..Default::default()
    };
    let child = ProtoSpec {
        num_params: 2,
        max_stack: 3,
        code: vec![Instruction::abc(OpCode::Return, 0, 1, 0)],
        constants: vec![K::I(1), K::N(2.5), K::B(true), K::Nil],
        upvalues: vec![(true, 1)],
        protos: vec![grandchild],
        ..Default::default()
    };
    let root = ProtoSpec {
        is_vararg: true,
        max_stack: 4,
        code: vec![
            Instruction::abx(OpCode::Closure, 0, 0),
            Instruction::abc(OpCode::Return, 0, 1, 0),
        ],
        upvalues: vec![(true, 0)],
        protos: vec![child],
        ..Default::default()
    };

    let chunk = load_chunk(&build_chunk(&root)).unwrap();
    assert!(chunk.root.is_vararg);
    assert_eq!(chunk.root.protos.len(), 1);

    let child = &chunk.root.protos[0];
    assert_eq!(child.num_params, 2);
    assert_eq!(child.constants.len(), 4);
    assert_eq!(child.constants[0], Constant::Integer(1));
    assert_eq!(child.constants[1], Constant::Number(2.5));
    assert_eq!(child.constants[2], Constant::Boolean(true));
    assert_eq!(child.constants[3], Constant::Nil);
    assert_eq!(child.protos.len(), 1);
    assert_eq!(child.protos[0].upvalues[0].in_stack, false);
}

#[test]
fn empty_input_is_truncated() {
    assert!(matches!(load_chunk(&[]), Err(Error::BytecodeTruncated)));
}

#[test]
fn bad_signature() {
    let mut bytes = build_chunk(&hello_proto());
    bytes[0] = b'X';
    assert!(matches!(
        load_chunk(&bytes),
        Err(Error::BytecodeBadSignature)
    ));
}

#[test]
fn bad_version() {
    let mut bytes = build_chunk(&hello_proto());
    bytes[4] = 0x52;
    assert!(matches!(
        load_chunk(&bytes),
        Err(Error::BytecodeBadVersion(0x52))
    ));
}

#[test]
fn bad_format() {
    let mut bytes = build_chunk(&hello_proto());
    bytes[5] = 1;
    assert!(matches!(load_chunk(&bytes), Err(Error::BytecodeBadFormat(1))));
}

#[test]
fn corrupt_conversion_check() {
    let mut bytes = build_chunk(&hello_proto());
    bytes[6] = 0x20;
    assert!(matches!(load_chunk(&bytes), Err(Error::BytecodeCorrupt(_))));
}

#[test]
fn unsupported_widths() {
    // Offset 12 is sizeof(int), offset 16 is sizeof(number).
    let mut bytes = build_chunk(&hello_proto());
    bytes[12] = 16;
    assert!(matches!(
        load_chunk(&bytes),
        Err(Error::BytecodeUnsupportedWidth { what: "int", width: 16 })
    ));

    let mut bytes = build_chunk(&hello_proto());
    bytes[16] = 4;
    assert!(matches!(
        load_chunk(&bytes),
        Err(Error::BytecodeUnsupportedWidth { what: "number", width: 4 })
    ));
}

#[test]
fn garbled_sentinels_are_bad_endianness() {
    // The integer sentinel lives at offsets 17..25, the number sentinel
    // right after. Zeroing both leaves no recognisable byte order.
    let mut bytes = build_chunk(&hello_proto());
    for b in &mut bytes[17..33] {
        *b = 0;
    }
    assert!(matches!(
        load_chunk(&bytes),
        Err(Error::BytecodeBadEndianness)
    ));
}

#[test]
fn unknown_constant_tag_is_corrupt() {
    let root = ProtoSpec {
        max_stack: 2,
        code: vec![Instruction::abc(OpCode::Return, 0, 1, 0)],
        constants: vec![K::I(5)],
        ..Default::default()
    };
    let bytes = build_chunk(&root);
    // The integer constant's tag byte (0x13) is the only one in the
    // stream; overwrite it with an undefined tag.
    let pos = bytes
        .iter()
        .position(|&b| b == 0x13)
        .expect("integer constant tag present");
    let mut bytes = bytes;
    bytes[pos] = 0x0E;
    assert!(matches!(load_chunk(&bytes), Err(Error::BytecodeCorrupt(_))));
}

#[test]
fn truncated_prototype() {
    let bytes = build_chunk(&hello_proto());
    let cut = &bytes[..bytes.len() - 7];
    assert!(matches!(load_chunk(cut), Err(Error::BytecodeTruncated)));
}

#[test]
fn trailing_bytes_are_corrupt() {
    let mut bytes = build_chunk(&hello_proto());
    bytes.push(0);
    assert!(matches!(load_chunk(&bytes), Err(Error::BytecodeCorrupt(_))));
}

#[test]
fn root_upvalue_count_must_match() {
    let mut bytes = build_chunk(&hello_proto());
    // Byte 33 is the chunk's root upvalue count.
    bytes[33] = 2;
    assert!(matches!(load_chunk(&bytes), Err(Error::BytecodeCorrupt(_))));
}
