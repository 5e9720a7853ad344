use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use fer::Interpreter;

/// The interactive loop. Definitions persist across lines because the
/// interpreter keeps one VM for the whole session; errors are printed
/// and the session continues.
pub fn run(mut interpreter: Interpreter, quiet: bool) {
    if !quiet {
        println!("Fer {}", env!("CARGO_PKG_VERSION"));
        println!("Ctrl-D to exit.");
    }

    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("Could not start the REPL: {e}");
            std::process::exit(74);
        }
    };

    loop {
        match editor.readline("fer> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(&line);
                let mut stdout = std::io::stdout();
                if let Err(error) = interpreter.interpret(&line, &mut stdout) {
                    eprintln!("{error}");
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Read error: {e}");
                break;
            }
        }
    }
}
