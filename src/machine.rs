//! The virtual machine.
//!
//! One integer stack, one call stack, one integer-keyed heap. Instructions
//! execute one at a time; all side effects happen in instruction order. The
//! label index is built by a single scan before execution starts.
//!
//! Division and modulo floor toward negative infinity. The compiler's tag
//! arithmetic (`value mod 4`) relies on the remainder staying in `0..4` for
//! negative operands, and this matches the reference interpreter.

use std::fmt;
use std::io::{self, BufRead, Write};

use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{Signed, ToPrimitive, Zero};
use rustc_hash::FxHashMap;

use crate::ir::Instruction;

pub type MachineResult<T> = Result<T, MachineError>;

//===----------------------------------------------------------------------===//
// MachineError
//===----------------------------------------------------------------------===//

/// A condition that aborts the run. Nothing is retried.
#[derive(Debug)]
pub enum MachineError {
    StackUnderflow,
    UndefinedLabel(BigInt),
    DuplicateLabel(BigInt),
    DivisionByZero,
    CallStackEmpty,
    /// The program ran off the end of the instruction list without `EXIT`.
    MissingExit,
    /// `READ_NUM` got a line that does not parse as a decimal integer.
    InvalidNumberInput(String),
    /// Input was exhausted during a read.
    EndOfInput,
    Io(io::Error),
}

impl fmt::Display for MachineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MachineError::StackUnderflow => write!(f, "stack underflow"),
            MachineError::UndefinedLabel(l) => write!(f, "undefined label L{}", l),
            MachineError::DuplicateLabel(l) => write!(f, "duplicate label L{}", l),
            MachineError::DivisionByZero => write!(f, "division by zero"),
            MachineError::CallStackEmpty => {
                write!(f, "return with an empty call stack")
            }
            MachineError::MissingExit => {
                write!(f, "program ended without an exit instruction")
            }
            MachineError::InvalidNumberInput(line) => {
                write!(f, "cannot read {:?} as a number", line)
            }
            MachineError::EndOfInput => write!(f, "input exhausted during read"),
            MachineError::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl From<io::Error> for MachineError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            MachineError::EndOfInput
        } else {
            MachineError::Io(e)
        }
    }
}

//===----------------------------------------------------------------------===//
// Machine
//===----------------------------------------------------------------------===//

/// The interpreter state: stack, heap, and the two byte streams.
pub struct Machine<R, W> {
    stack: Vec<BigInt>,
    heap: FxHashMap<BigInt, BigInt>,
    input: R,
    output: W,
}

/// A machine wired to the process's standard streams.
pub fn with_stdio() -> Machine<io::BufReader<io::Stdin>, io::Stdout> {
    Machine::new(io::BufReader::new(io::stdin()), io::stdout())
}

impl<R: BufRead, W: Write> Machine<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Machine {
            stack: Vec::new(),
            heap: FxHashMap::default(),
            input,
            output,
        }
    }

    /// Gives the output stream back, consuming the machine. Used by callers
    /// that run against an in-memory buffer.
    pub fn into_output(self) -> W {
        self.output
    }

    /// Executes `program` until `EXIT`.
    pub fn run(&mut self, program: &[Instruction]) -> MachineResult<()> {
        let index = index_labels(program)?;
        let mut callers: Vec<usize> = Vec::new();
        let mut pc = 0usize;

        loop {
            let inst = program.get(pc).ok_or(MachineError::MissingExit)?;
            pc += 1;
            match inst {
                Instruction::Push(n) => self.stack.push(n.clone()),
                Instruction::Dup => {
                    let top = self.top()?.clone();
                    self.stack.push(top);
                }
                Instruction::Swap => {
                    let x = self.pop()?;
                    let y = self.pop()?;
                    self.stack.push(x);
                    self.stack.push(y);
                }
                Instruction::Discard => {
                    self.pop()?;
                }
                Instruction::Add => self.calc(|y, x| y + x)?,
                Instruction::Sub => self.calc(|y, x| y - x)?,
                Instruction::Mul => self.calc(|y, x| y * x)?,
                Instruction::Div => self.dcalc(|y, x| y.div_floor(&x))?,
                Instruction::Mod => self.dcalc(|y, x| y.mod_floor(&x))?,
                Instruction::Store => {
                    let value = self.pop()?;
                    let addr = self.pop()?;
                    self.heap.insert(addr, value);
                }
                Instruction::Retrieve => {
                    let addr = self.pop()?;
                    let value =
                        self.heap.get(&addr).cloned().unwrap_or_else(BigInt::zero);
                    self.stack.push(value);
                }
                Instruction::Mark(_) => {}
                Instruction::Call(l) => {
                    callers.push(pc);
                    pc = lookup(&index, l)?;
                }
                Instruction::Jump(l) => pc = lookup(&index, l)?,
                Instruction::JumpZero(l) => {
                    if self.pop()?.is_zero() {
                        pc = lookup(&index, l)?;
                    }
                }
                Instruction::JumpNegative(l) => {
                    if self.pop()?.is_negative() {
                        pc = lookup(&index, l)?;
                    }
                }
                Instruction::Return => {
                    pc = callers.pop().ok_or(MachineError::CallStackEmpty)?;
                }
                Instruction::Exit => {
                    self.output.flush()?;
                    return Ok(());
                }
                Instruction::PutChar => self.put_char()?,
                Instruction::PutNum => {
                    let n = self.pop()?;
                    write!(self.output, "{}", n)?;
                }
                Instruction::GetChar => self.get_char()?,
                Instruction::GetNum => self.get_num()?,
            }
        }
    }

    fn top(&self) -> MachineResult<&BigInt> {
        self.stack.last().ok_or(MachineError::StackUnderflow)
    }

    fn pop(&mut self) -> MachineResult<BigInt> {
        self.stack.pop().ok_or(MachineError::StackUnderflow)
    }

    fn calc<F: FnOnce(BigInt, BigInt) -> BigInt>(&mut self, f: F) -> MachineResult<()> {
        let x = self.pop()?;
        let y = self.pop()?;
        self.stack.push(f(y, x));
        Ok(())
    }

    fn dcalc<F: FnOnce(BigInt, BigInt) -> BigInt>(&mut self, f: F) -> MachineResult<()> {
        let x = self.pop()?;
        if x.is_zero() {
            return Err(MachineError::DivisionByZero);
        }
        let y = self.pop()?;
        self.stack.push(f(y, x));
        Ok(())
    }

    /// Pops a code point and emits one byte: its low eight bits. Output is
    /// a raw byte stream, the mirror of `get_char`.
    fn put_char(&mut self) -> MachineResult<()> {
        let n = self.pop()?;
        let byte = n.mod_floor(&BigInt::from(256)).to_u8().unwrap_or(0);
        self.output.write_all(&[byte])?;
        Ok(())
    }

    /// Pops an address, reads one byte, stores its code point there.
    fn get_char(&mut self) -> MachineResult<()> {
        let addr = self.pop()?;
        let mut byte = [0u8; 1];
        self.input.read_exact(&mut byte)?;
        self.heap.insert(addr, BigInt::from(byte[0]));
        Ok(())
    }

    /// Pops an address, reads one line, stores the parsed integer there.
    fn get_num(&mut self) -> MachineResult<()> {
        let addr = self.pop()?;
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Err(MachineError::EndOfInput);
        }
        let n = line
            .trim()
            .parse::<BigInt>()
            .map_err(|_| MachineError::InvalidNumberInput(line.clone()))?;
        self.heap.insert(addr, n);
        Ok(())
    }
}

fn index_labels(program: &[Instruction]) -> MachineResult<FxHashMap<BigInt, usize>> {
    let mut index = FxHashMap::default();
    for (at, inst) in program.iter().enumerate() {
        if let Some(label) = inst.marks() {
            if index.insert(label.clone(), at).is_some() {
                return Err(MachineError::DuplicateLabel(label.clone()));
            }
        }
    }
    Ok(index)
}

fn lookup(index: &FxHashMap<BigInt, usize>, label: &BigInt) -> MachineResult<usize> {
    index
        .get(label)
        .copied()
        .ok_or_else(|| MachineError::UndefinedLabel(label.clone()))
}
