use clap::{Parser, Subcommand};
use colored::Colorize;
use std::fmt;
use std::path::PathBuf;
use std::{fs, io, process};

use tabula::codec::{self, WireError};
use tabula::compiler;
use tabula::devtools;
use tabula::error::{Diagnostic, Source};
use tabula::ir::Instruction;
use tabula::machine::{self, MachineError};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "tabula")]
#[command(version = VERSION)]
#[command(about = "A Whitespace toolchain: interpreter, and a compiler from the rasa dialect", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Pretty-print the AST before compiling
    #[arg(long, global = true)]
    print_ast: bool,

    /// Print the instruction stream before encoding or running
    #[arg(long, global = true)]
    print_ir: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a Whitespace file
    Run {
        /// Path to the .ws source
        file: PathBuf,
    },

    /// Compile a rasa file and print Whitespace on stdout
    Compile {
        /// Path to the .rasa source
        file: PathBuf,
    },

    /// Compile a rasa file and execute it
    Exec {
        /// Path to the .rasa source
        file: PathBuf,
    },
}

enum CliError {
    Diagnostic(Diagnostic),
    Wire(WireError),
    Machine(MachineError),
    Io(PathBuf, io::Error),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CliError::Diagnostic(d) => write!(f, "{}", d.format()),
            CliError::Wire(e) => write!(f, "{}", e),
            CliError::Machine(e) => write!(f, "{}", e),
            CliError::Io(path, e) => {
                write!(f, "failed to read {}: {}", path.display(), e)
            }
        }
    }
}

fn decode_file(path: &PathBuf) -> Result<Vec<Instruction>, CliError> {
    let bytes = fs::read(path).map_err(|e| CliError::Io(path.clone(), e))?;
    codec::decode(&bytes).map_err(CliError::Wire)
}

fn compile_file(path: &PathBuf, cli: &Cli) -> Result<Vec<Instruction>, CliError> {
    let source =
        fs::read_to_string(path).map_err(|e| CliError::Io(path.clone(), e))?;
    let file = Source::File(path.clone());

    if cli.print_ast {
        let ast = tabula::parser::Parser::parse(&source, file.clone())
            .map_err(CliError::Diagnostic)?;
        eprintln!("{}", devtools::pretty_print_ast(&ast));
    }

    let program = compiler::compile(&source, file).map_err(CliError::Diagnostic)?;
    if cli.verbose {
        eprintln!("compiled {} instructions", program.len());
    }
    if cli.print_ir {
        eprintln!("{}", devtools::pretty_print_ir(&program));
    }
    Ok(program)
}

fn execute(program: &[Instruction]) -> Result<(), CliError> {
    // A user-level `raise` prints its message and EXITs like any other
    // program end, so it still reaches here as success.
    machine::with_stdio().run(program).map_err(CliError::Machine)
}

fn main() {
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Run { file } => {
            decode_file(file).and_then(|program| {
                if cli.print_ir {
                    eprintln!("{}", devtools::pretty_print_ir(&program));
                }
                execute(&program)
            })
        }
        Commands::Compile { file } => compile_file(file, &cli).and_then(|program| {
            let text = codec::encode(&program).map_err(CliError::Wire)?;
            print!("{}", text);
            Ok(())
        }),
        Commands::Exec { file } => {
            compile_file(file, &cli).and_then(|program| execute(&program))
        }
    };

    if let Err(e) = result {
        eprintln!("{} {}", "error:".red().bold(), e);
        process::exit(1);
    }
}
