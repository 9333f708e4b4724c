//! Wire-format properties over whole compiled programs: encoding is
//! deterministic, uses only the three significant bytes, and round-trips
//! exactly in both directions.

use tabula::error::Source;
use tabula::machine::Machine;
use tabula::{codec, compiler};

const FIB: &str =
    "def f(n) if n < 2 then 1 else f(n-1)+f(n-2) end end; put_as_number f(10)";

#[test]
fn encoded_programs_are_pure_whitespace() {
    let program = compiler::compile(FIB, Source::Inline).unwrap();
    let text = codec::encode(&program).unwrap();
    assert!(text.bytes().all(|b| b == b' ' || b == b'\t' || b == b'\n'));
}

#[test]
fn decode_inverts_encode() {
    let program = compiler::compile(FIB, Source::Inline).unwrap();
    let text = codec::encode(&program).unwrap();
    assert_eq!(codec::decode(text.as_bytes()).unwrap(), program);
}

#[test]
fn encode_inverts_decode() {
    let program = compiler::compile(FIB, Source::Inline).unwrap();
    let text = codec::encode(&program).unwrap();
    let round_tripped =
        codec::encode(&codec::decode(text.as_bytes()).unwrap()).unwrap();
    assert_eq!(round_tripped, text);
}

#[test]
fn decoded_programs_still_run() {
    let program = compiler::compile(FIB, Source::Inline).unwrap();
    let text = codec::encode(&program).unwrap();
    let decoded = codec::decode(text.as_bytes()).unwrap();

    let mut machine = Machine::new("".as_bytes(), Vec::new());
    machine.run(&decoded).unwrap();
    assert_eq!(String::from_utf8(machine.into_output()).unwrap(), "89");
}

#[test]
fn comment_bytes_do_not_change_the_program() {
    let program = compiler::compile("put_as_number 3 + 2", Source::Inline).unwrap();
    let text = codec::encode(&program).unwrap();

    // Interleave commentary the decoder must skip. Comment bytes must not
    // themselves be space, tab or linefeed.
    let mut commented = String::from("[tabula-generated]");
    for chunk in text.split_inclusive('\n') {
        commented.push_str(chunk);
        commented.push_str("--ok--");
    }
    assert_eq!(codec::decode(commented.as_bytes()).unwrap(), program);
}
