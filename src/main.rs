use std::env;
use std::fs;
use std::io::{self, BufRead, Write};
use std::process::ExitCode;

use rox::{Error, VM};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    match args.as_slice() {
        [_] => repl(),
        [_, path] => run_file(path),
        _ => {
            eprintln!("Usage: rox [path]");
            ExitCode::from(64)
        }
    }
}

fn run_file(path: &str) -> ExitCode {
    let src = match fs::read_to_string(path) {
        Ok(src) => src,
        Err(err) => {
            eprintln!("Could not open file \"{path}\": {err}.");
            return ExitCode::from(66);
        }
    };
    let mut vm = VM::default();
    match vm.interpret(&src) {
        Ok(()) => ExitCode::SUCCESS,
        Err(Error::Compile) => ExitCode::from(65),
        Err(Error::Runtime) => ExitCode::from(70),
    }
}

fn repl() -> ExitCode {
    // One machine for the whole session, so globals persist across lines.
    // Runtime errors reset the value stack and the session carries on.
    let mut vm = VM::default();
    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("> ");
        let _ = io::stdout().flush();
        line.clear();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => {
                println!();
                return ExitCode::SUCCESS;
            }
            Ok(_) => {
                let _ = vm.interpret(&line);
            }
        }
    }
}
