//! The Whitespace wire format.
//!
//! Only SPACE, TAB and LINEFEED are significant; every other byte is a
//! comment and is skipped. An instruction is an IMP prefix, a command, and
//! zero or one argument. Number arguments carry a sign token (space = plus,
//! tab = minus) followed by an MSB-first binary magnitude (space = 0,
//! tab = 1) closed by a linefeed. Label arguments are a bare bit string
//! closed by a linefeed.
//!
//! Distinct label bit strings are distinct labels even when they read as the
//! same binary number (`01` is not `1`), so the decoder interns a bit string
//! `s` as the integer value of `1s` — a bijection between bit strings and
//! integers >= 1. The encoder inverts it by dropping the leading 1 bit.
//! Encoding after decoding therefore reproduces the input byte for byte,
//! leading label zeros included.

use std::fmt;

use num_bigint::BigInt;
use num_traits::Zero;

use crate::ir::Instruction;

//===----------------------------------------------------------------------===//
// WireError
//===----------------------------------------------------------------------===//

/// A malformed Whitespace program, or an instruction stream the wire format
/// cannot carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Input ended in the middle of an instruction or argument.
    UnexpectedEof { context: &'static str },
    /// A significant-character sequence that is not a known instruction.
    /// The payload spells the tokens consumed so far as `S`/`T`/`L`.
    UnknownSequence(String),
    /// A number argument with no sign token.
    MissingSign,
    /// Labels on the wire always intern to integers >= 1; this one cannot
    /// be represented.
    LabelOutOfRange(BigInt),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WireError::UnexpectedEof { context } => {
                write!(f, "unexpected end of input while reading {}", context)
            }
            WireError::UnknownSequence(seq) => {
                write!(f, "\"{}\" is not a known instruction", seq)
            }
            WireError::MissingSign => {
                write!(f, "number argument is missing its sign token")
            }
            WireError::LabelOutOfRange(l) => {
                write!(f, "label {} cannot be encoded (labels start at 1)", l)
            }
        }
    }
}

//===----------------------------------------------------------------------===//
// Decoder
//===----------------------------------------------------------------------===//

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tok {
    Space,
    Tab,
    Linefeed,
}

/// An iterator yielding one IR instruction per wire instruction.
pub struct Decoder<'a> {
    bytes: std::iter::Copied<std::slice::Iter<'a, u8>>,
}

impl<'a> Decoder<'a> {
    pub fn new(source: &'a [u8]) -> Self {
        Decoder { bytes: source.iter().copied() }
    }

    /// The next significant token, skipping comment bytes.
    fn next_token(&mut self) -> Option<Tok> {
        for byte in &mut self.bytes {
            match byte {
                b' ' => return Some(Tok::Space),
                b'\t' => return Some(Tok::Tab),
                b'\n' => return Some(Tok::Linefeed),
                _ => continue,
            }
        }
        None
    }

    fn expect_token(&mut self, context: &'static str) -> Result<Tok, WireError> {
        self.next_token().ok_or(WireError::UnexpectedEof { context })
    }

    /// Collects magnitude bits up to the linefeed terminator.
    fn parse_bits(&mut self, context: &'static str) -> Result<Vec<bool>, WireError> {
        let mut bits = Vec::new();
        loop {
            match self.expect_token(context)? {
                Tok::Space => bits.push(false),
                Tok::Tab => bits.push(true),
                Tok::Linefeed => return Ok(bits),
            }
        }
    }

    /// Sign token, then magnitude. An empty magnitude reads as zero.
    fn parse_number(&mut self) -> Result<BigInt, WireError> {
        let positive = match self.expect_token("a number sign")? {
            Tok::Space => true,
            Tok::Tab => false,
            Tok::Linefeed => return Err(WireError::MissingSign),
        };
        let mut n = BigInt::zero();
        for bit in self.parse_bits("a number")? {
            n = n * 2 + BigInt::from(bit as u8);
        }
        Ok(if positive { n } else { -n })
    }

    /// Bit string interned as the integer value of `1s`.
    fn parse_label(&mut self) -> Result<BigInt, WireError> {
        let mut l = BigInt::from(1);
        for bit in self.parse_bits("a label")? {
            l = l * 2 + BigInt::from(bit as u8);
        }
        Ok(l)
    }

    fn parse_stack(&mut self) -> Result<Instruction, WireError> {
        match self.expect_token("a stack command")? {
            Tok::Space => Ok(Instruction::Push(self.parse_number()?)),
            Tok::Linefeed => match self.expect_token("a stack command")? {
                Tok::Space => Ok(Instruction::Dup),
                Tok::Tab => Ok(Instruction::Swap),
                Tok::Linefeed => Ok(Instruction::Discard),
            },
            Tok::Tab => Err(WireError::UnknownSequence("ST".to_string())),
        }
    }

    fn parse_arithmetic(&mut self) -> Result<Instruction, WireError> {
        match self.expect_token("an arithmetic command")? {
            Tok::Space => match self.expect_token("an arithmetic command")? {
                Tok::Space => Ok(Instruction::Add),
                Tok::Tab => Ok(Instruction::Sub),
                Tok::Linefeed => Ok(Instruction::Mul),
            },
            Tok::Tab => match self.expect_token("an arithmetic command")? {
                Tok::Space => Ok(Instruction::Div),
                Tok::Tab => Ok(Instruction::Mod),
                Tok::Linefeed => Err(WireError::UnknownSequence("TSTL".to_string())),
            },
            Tok::Linefeed => Err(WireError::UnknownSequence("TSL".to_string())),
        }
    }

    fn parse_heap(&mut self) -> Result<Instruction, WireError> {
        match self.expect_token("a heap command")? {
            Tok::Space => Ok(Instruction::Store),
            Tok::Tab => Ok(Instruction::Retrieve),
            Tok::Linefeed => Err(WireError::UnknownSequence("TTL".to_string())),
        }
    }

    fn parse_flow(&mut self) -> Result<Instruction, WireError> {
        match self.expect_token("a flow command")? {
            Tok::Space => match self.expect_token("a flow command")? {
                Tok::Space => Ok(Instruction::Mark(self.parse_label()?)),
                Tok::Tab => Ok(Instruction::Call(self.parse_label()?)),
                Tok::Linefeed => Ok(Instruction::Jump(self.parse_label()?)),
            },
            Tok::Tab => match self.expect_token("a flow command")? {
                Tok::Space => Ok(Instruction::JumpZero(self.parse_label()?)),
                Tok::Tab => Ok(Instruction::JumpNegative(self.parse_label()?)),
                Tok::Linefeed => Ok(Instruction::Return),
            },
            Tok::Linefeed => match self.expect_token("a flow command")? {
                Tok::Linefeed => Ok(Instruction::Exit),
                Tok::Space => Err(WireError::UnknownSequence("LLS".to_string())),
                Tok::Tab => Err(WireError::UnknownSequence("LLT".to_string())),
            },
        }
    }

    fn parse_io(&mut self) -> Result<Instruction, WireError> {
        match self.expect_token("an i/o command")? {
            Tok::Space => match self.expect_token("an i/o command")? {
                Tok::Space => Ok(Instruction::PutChar),
                Tok::Tab => Ok(Instruction::PutNum),
                Tok::Linefeed => Err(WireError::UnknownSequence("TLSL".to_string())),
            },
            Tok::Tab => match self.expect_token("an i/o command")? {
                Tok::Space => Ok(Instruction::GetChar),
                Tok::Tab => Ok(Instruction::GetNum),
                Tok::Linefeed => Err(WireError::UnknownSequence("TLTL".to_string())),
            },
            Tok::Linefeed => Err(WireError::UnknownSequence("TLL".to_string())),
        }
    }

    fn instruction(&mut self, imp: Tok) -> Result<Instruction, WireError> {
        match imp {
            Tok::Space => self.parse_stack(),
            Tok::Tab => match self.expect_token("an instruction")? {
                Tok::Space => self.parse_arithmetic(),
                Tok::Tab => self.parse_heap(),
                Tok::Linefeed => self.parse_io(),
            },
            Tok::Linefeed => self.parse_flow(),
        }
    }
}

impl Iterator for Decoder<'_> {
    type Item = Result<Instruction, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        let imp = self.next_token()?;
        Some(self.instruction(imp))
    }
}

/// Decodes a complete Whitespace program.
pub fn decode(source: &[u8]) -> Result<Vec<Instruction>, WireError> {
    Decoder::new(source).collect()
}

//===----------------------------------------------------------------------===//
// Encoder
//===----------------------------------------------------------------------===//

fn encode_number(out: &mut String, n: &BigInt) {
    out.push(if n.sign() == num_bigint::Sign::Minus { '\t' } else { ' ' });
    // Always at least one magnitude bit; `to_str_radix` renders zero as "0".
    for bit in n.magnitude().to_str_radix(2).chars() {
        out.push(if bit == '1' { '\t' } else { ' ' });
    }
    out.push('\n');
}

fn encode_label(out: &mut String, l: &BigInt) -> Result<(), WireError> {
    if *l < BigInt::from(1) {
        return Err(WireError::LabelOutOfRange(l.clone()));
    }
    for bit in l.to_str_radix(2).chars().skip(1) {
        out.push(if bit == '1' { '\t' } else { ' ' });
    }
    out.push('\n');
    Ok(())
}

/// Encodes an instruction stream as Whitespace text. Each instruction has
/// exactly one spelling, so the output is deterministic.
pub fn encode(program: &[Instruction]) -> Result<String, WireError> {
    let mut out = String::new();
    for inst in program {
        match inst {
            Instruction::Push(n) => {
                out.push_str("  ");
                encode_number(&mut out, n);
            }
            Instruction::Dup => out.push_str(" \n "),
            Instruction::Swap => out.push_str(" \n\t"),
            Instruction::Discard => out.push_str(" \n\n"),
            Instruction::Add => out.push_str("\t   "),
            Instruction::Sub => out.push_str("\t  \t"),
            Instruction::Mul => out.push_str("\t  \n"),
            Instruction::Div => out.push_str("\t \t "),
            Instruction::Mod => out.push_str("\t \t\t"),
            Instruction::Store => out.push_str("\t\t "),
            Instruction::Retrieve => out.push_str("\t\t\t"),
            Instruction::Mark(l) => {
                out.push_str("\n  ");
                encode_label(&mut out, l)?;
            }
            Instruction::Call(l) => {
                out.push_str("\n \t");
                encode_label(&mut out, l)?;
            }
            Instruction::Jump(l) => {
                out.push_str("\n \n");
                encode_label(&mut out, l)?;
            }
            Instruction::JumpZero(l) => {
                out.push_str("\n\t ");
                encode_label(&mut out, l)?;
            }
            Instruction::JumpNegative(l) => {
                out.push_str("\n\t\t");
                encode_label(&mut out, l)?;
            }
            Instruction::Return => out.push_str("\n\t\n"),
            Instruction::Exit => out.push_str("\n\n\n"),
            Instruction::PutChar => out.push_str("\t\n  "),
            Instruction::PutNum => out.push_str("\t\n \t"),
            Instruction::GetChar => out.push_str("\t\n\t "),
            Instruction::GetNum => out.push_str("\t\n\t\t"),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Instruction::*;

    fn big(n: i64) -> BigInt {
        BigInt::from(n)
    }

    #[test]
    fn decode_full_menu() {
        let source = [
            "   \t\n",     // push 1
            " \n ",        // dup
            " \n\t",       // swap
            " \n\n",       // discard
            "\t   ",       // add
            "\t  \t",      // sub
            "\t  \n",      // mul
            "\t \t ",      // div
            "\t \t\t",     // mod
            "\t\t ",       // store
            "\t\t\t",      // retrieve
            "\n  \t\n",    // mark 1 -> 3
            "\n \t\t \n",  // call 10 -> 6
            "\n \n\n",     // jump "" -> 1
            "\n\t \t\n",   // jz 1 -> 3
            "\n\t\t \n",   // jn 0 -> 2
            "\n\t\n",      // return
            "\n\n\n",      // exit
            "\t\n  ",      // putc
            "\t\n \t",     // putn
            "\t\n\t ",     // getc
            "\t\n\t\t",    // getn
        ]
        .concat();
        let program = decode(source.as_bytes()).unwrap();
        assert_eq!(
            program,
            vec![
                Push(big(1)),
                Dup,
                Swap,
                Discard,
                Add,
                Sub,
                Mul,
                Div,
                Mod,
                Store,
                Retrieve,
                Mark(big(3)),
                Call(big(6)),
                Jump(big(1)),
                JumpZero(big(3)),
                JumpNegative(big(2)),
                Return,
                Exit,
                PutChar,
                PutNum,
                GetChar,
                GetNum,
            ]
        );
    }

    #[test]
    fn comments_are_skipped() {
        let program = decode("push:[  ] one:[ \t]done[\n]".as_bytes()).unwrap();
        assert_eq!(program, vec![Push(big(1))]);
    }

    #[test]
    fn negative_and_zero_numbers() {
        assert_eq!(decode("  \t\t \t\n".as_bytes()).unwrap(), vec![Push(big(-5))]);
        assert_eq!(decode("   \n".as_bytes()).unwrap(), vec![Push(big(0))]);
        assert_eq!(decode("   \t \t\n".as_bytes()).unwrap(), vec![Push(big(5))]);
    }

    #[test]
    fn labels_keep_leading_zeros_distinct() {
        // "01" and "1" read as the same binary number but are different labels.
        let a = decode("\n   \t\n".as_bytes()).unwrap(); // bits 01
        let b = decode("\n  \t\n".as_bytes()).unwrap(); // bits 1
        assert_ne!(a, b);
        assert_eq!(a, vec![Mark(big(5))]);
        assert_eq!(b, vec![Mark(big(3))]);
    }

    #[test]
    fn unknown_sequences_are_reported() {
        assert_eq!(
            decode(" \t".as_bytes()),
            Err(WireError::UnknownSequence("ST".to_string()))
        );
        assert_eq!(
            decode("\t\t\n".as_bytes()),
            Err(WireError::UnknownSequence("TTL".to_string()))
        );
        assert_eq!(
            decode("\n\n\t".as_bytes()),
            Err(WireError::UnknownSequence("LLT".to_string()))
        );
    }

    #[test]
    fn eof_mid_number() {
        let err = decode("   \t".as_bytes()).unwrap_err();
        assert_eq!(err, WireError::UnexpectedEof { context: "a number" });
    }

    #[test]
    fn missing_sign() {
        assert_eq!(decode("  \n".as_bytes()), Err(WireError::MissingSign));
    }

    #[test]
    fn encode_matches_fixed_spellings() {
        let program = vec![Push(big(1)), Mark(big(3)), Call(big(3)), Exit];
        let text = encode(&program).unwrap();
        assert_eq!(text, "   \t\n\n  \t\n\n \t\t\n\n\n\n");
    }

    #[test]
    fn labels_below_one_cannot_encode() {
        let err = encode(&[Mark(big(0))]).unwrap_err();
        assert_eq!(err, WireError::LabelOutOfRange(big(0)));
    }

    #[test]
    fn round_trip_ir() {
        let program = vec![
            Push(big(-123456789)),
            Dup,
            Mark(big(1)),
            JumpZero(big(97)),
            GetNum,
            Push(big(0)),
            Return,
            Exit,
        ];
        let text = encode(&program).unwrap();
        assert_eq!(decode(text.as_bytes()).unwrap(), program);
    }

    #[test]
    fn round_trip_wire() {
        let source = "   \t \t\n\n   \t\n \n \n\t \t\t\n\n\n\n";
        let text = encode(&decode(source.as_bytes()).unwrap()).unwrap();
        assert_eq!(text, source);
    }
}
