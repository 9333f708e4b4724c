use logos::Span;
use std::fmt;
use std::path;

//===----------------------------------------------------------------------===//
// Source
//===----------------------------------------------------------------------===//

/// Where a piece of rasa source came from. Compiled `raise` messages and
/// diagnostics both print it.
#[derive(Debug, PartialEq, Clone)]
pub enum Source {
    File(path::PathBuf),
    /// The built-in prelude prepended to every program.
    Prelude,
    /// Source handed in directly (tests, pipes).
    Inline,
}

impl Source {
    pub fn display(&self) -> String {
        match self {
            Source::File(path) => path.display().to_string(),
            Source::Prelude => "<prelude>".to_string(),
            Source::Inline => "<inline>".to_string(),
        }
    }
}

//===----------------------------------------------------------------------===//
// Error
//===----------------------------------------------------------------------===//

#[derive(Debug, Clone)]
pub enum Error {
    SyntaxError(SyntaxError),
    CompileError(CompileError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::SyntaxError(e) => write!(f, "{}", e),
            Error::CompileError(e) => write!(f, "{}", e),
        }
    }
}

//===----------------------------------------------------------------------===//
// SyntaxError
//===----------------------------------------------------------------------===//

#[derive(Debug, Clone)]
pub enum SyntaxError {
    UnexpectedEof { expected: String },
    UnexpectedToken { found: String, expected: String },
    InvalidCharacter { char: char },
    UnterminatedString,
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SyntaxError::UnexpectedEof { expected } => {
                write!(f, "Unexpected end of input (expected: {})", expected)
            }
            SyntaxError::UnexpectedToken { found, expected } => {
                write!(f, "Unexpected token: {} (expected: {})", found, expected)
            }
            SyntaxError::InvalidCharacter { char } => {
                write!(f, "Invalid character: {:?}", char)
            }
            SyntaxError::UnterminatedString => write!(f, "Unterminated string"),
        }
    }
}

//===----------------------------------------------------------------------===//
// CompileError
//===----------------------------------------------------------------------===//

/// A program the lowering pass refuses. These are host-level failures, as
/// opposed to the `raise` messages compiled programs print themselves.
#[derive(Debug, Clone)]
pub enum CompileError {
    /// String literals are code points; only `raise` takes longer text.
    MultiCharString { value: String },
    NestedClass,
    /// Only the three built-in classes can be reopened.
    UnknownClass { name: String },
    /// A bareword that is neither a local variable nor a known method.
    UndefinedName { name: String },
    WrongArity { name: String, expected: usize, got: usize },
    ReturnOutsideMethod,
    InvalidAssignmentTarget,
    /// `def` belongs at top level or directly inside a class clause.
    MisplacedDefinition { name: String },
    ClassBodyNotADefinition,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CompileError::MultiCharString { value } => {
                write!(f, "String literal {:?} is not a single character", value)
            }
            CompileError::NestedClass => {
                write!(f, "Class definitions cannot nest")
            }
            CompileError::UnknownClass { name } => {
                write!(
                    f,
                    "Unknown class: {} (only Array, Hash and Integer can be reopened)",
                    name
                )
            }
            CompileError::UndefinedName { name } => {
                write!(f, "Undefined local variable or method: {}", name)
            }
            CompileError::WrongArity { name, expected, got } => {
                write!(
                    f,
                    "Wrong number of arguments for {} (given {}, expected {})",
                    name, got, expected
                )
            }
            CompileError::ReturnOutsideMethod => {
                write!(f, "return outside of a method body")
            }
            CompileError::InvalidAssignmentTarget => {
                write!(f, "Cannot assign to this expression")
            }
            CompileError::MisplacedDefinition { name } => {
                write!(
                    f,
                    "Method {} defined outside top level or a class clause",
                    name
                )
            }
            CompileError::ClassBodyNotADefinition => {
                write!(f, "Class bodies may only contain method definitions")
            }
        }
    }
}

//===----------------------------------------------------------------------===//
// Diagnostic
//===----------------------------------------------------------------------===//

/// An error tied to a span of source, with everything `format` needs to
/// render a compiler-style report.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// The error that occurred.
    pub error: Error,
    /// Byte range marking the problematic location.
    pub span: Span,
    /// The complete source string the span indexes into.
    pub source: String,
    /// File path, prelude, or inline input.
    pub file: Source,
    /// Optional extra hints rendered as `= note:` lines.
    pub notes: Option<Vec<String>>,
}

impl Diagnostic {
    pub fn new(error: Error, span: Span, source: String, file: Source) -> Self {
        Self { error, span, source, file, notes: None }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.get_or_insert_with(Vec::new).push(note.into());
        self
    }

    /// Line number, column, and the byte range of the span's line.
    pub fn location_info(&self) -> (usize, usize, usize, usize) {
        location_of(&self.source, self.span.start)
    }

    fn format_line(&self, line_num: usize, content: &str) -> String {
        format!("{:4} | {}", line_num, content)
    }

    fn format_underline(&self, column: usize, span_len: usize) -> String {
        let padding = " ".repeat(column - 1);
        let caret = "^".repeat(span_len.max(1));
        format!("     | {}{}", padding, caret)
    }

    /// Formats a multi-line report: the message, a `--> file:line:col`
    /// header, the offending line, and a caret underline, followed by any
    /// notes. The shape follows rustc's error output.
    pub fn format(&self) -> String {
        let (line_num, column, line_start, line_end) = self.location_info();
        let line_content = &self.source[line_start..line_end];

        let mut output = String::new();
        output.push_str(&format!("{}\n", self.error));
        output.push_str(&format!(
            "  --> {}:{}:{}\n",
            self.file.display(),
            line_num,
            column
        ));
        output.push_str("   |\n");
        output.push_str(&self.format_line(line_num, line_content));
        output.push('\n');
        output.push_str(&self.format_underline(column, self.span.len()));
        output.push('\n');

        if let Some(notes) = &self.notes {
            output.push_str("   |\n");
            for note in notes {
                output.push_str(&format!("   = note: {}\n", note));
            }
        }

        output
    }
}

/// Line number (1-based), column (1-based), and the line's byte range for a
/// byte offset into `source`. Shared with the compiler, which bakes the same
/// coordinates into `raise` messages.
pub fn location_of(source: &str, offset: usize) -> (usize, usize, usize, usize) {
    let offset = offset.min(source.len());
    let line_start = source[..offset].rfind('\n').map(|pos| pos + 1).unwrap_or(0);
    let line_end = source[offset..]
        .find('\n')
        .map(|pos| offset + pos)
        .unwrap_or(source.len());
    let line_number = source[..offset].matches('\n').count() + 1;
    let column = offset - line_start + 1;
    (line_number, column, line_start, line_end)
}
