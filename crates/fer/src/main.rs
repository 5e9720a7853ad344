use clap::error::ErrorKind;
use clap::Parser;

use fer::{FerError, Interpreter, InterpreterBuilder};

mod repl;

// Process exit codes, BSD sysexits style.
const EX_USAGE: i32 = 64;
const EX_DATAERR: i32 = 65;
const EX_SOFTWARE: i32 = 70;
const EX_IOERR: i32 = 74;

#[derive(Parser)]
#[command(name = "fer", about = "The Fer scripting language", version)]
struct Cli {
    /// Script file to execute
    file: Option<String>,

    /// Evaluate a source string and exit
    #[arg(short, long, conflicts_with = "file")]
    eval: Option<String>,

    /// Disassemble compiled code and trace execution to stderr
    #[arg(long)]
    trace: bool,

    /// Suppress the REPL banner
    #[arg(short, long)]
    quiet: bool,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => EX_USAGE,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let mut interpreter = InterpreterBuilder::new()
        .with_trace(cli.trace)
        .with_gc_stress(std::env::var_os("FER_GC_STRESS").is_some())
        .with_gc_log(std::env::var_os("FER_LOG_GC").is_some())
        .build();

    if let Some(source) = &cli.eval {
        run_source(&mut interpreter, source);
    } else if let Some(path) = &cli.file {
        let source = match std::fs::read_to_string(path) {
            Ok(source) => source,
            Err(e) => {
                eprintln!("Could not read \"{path}\": {e}");
                std::process::exit(EX_IOERR);
            }
        };
        run_source(&mut interpreter, &source);
    } else {
        repl::run(interpreter, cli.quiet);
    }
}

/// Run one source buffer and exit on failure with the matching code.
fn run_source(interpreter: &mut Interpreter, source: &str) {
    let mut stdout = std::io::stdout();
    match interpreter.interpret(source, &mut stdout) {
        Ok(()) => {}
        Err(error) => {
            eprintln!("{error}");
            let code = match error {
                FerError::Compile(_) => EX_DATAERR,
                FerError::Runtime(_) => EX_SOFTWARE,
            };
            std::process::exit(code);
        }
    }
}
