//! A Whitespace toolchain.
//!
//! `tabula` has two coupled halves that share one instruction stream
//! ([`ir::Instruction`]): an interpreter that decodes and executes
//! Whitespace source, and a compiler that lowers **rasa** — a small
//! Ruby-flavored scripting dialect with integers, single-character strings,
//! arrays, hashes, methods and recursion — onto the same instructions and
//! out to Whitespace text.
//!
//! ```
//! use tabula::error::Source;
//! use tabula::machine::Machine;
//! use tabula::{codec, compiler};
//!
//! let program = compiler::compile("put_as_number 3 + 2", Source::Inline).unwrap();
//! let text = codec::encode(&program).unwrap();
//! let decoded = codec::decode(text.as_bytes()).unwrap();
//! assert_eq!(decoded, program);
//!
//! let mut machine = Machine::new("".as_bytes(), Vec::new());
//! machine.run(&decoded).unwrap();
//! assert_eq!(machine.into_output(), b"5".to_vec());
//! ```

pub mod ast;
pub mod codec;
pub mod compiler;
pub mod devtools;
pub mod error;
pub mod ir;
pub mod machine;
pub mod parser;
pub mod prelude;
