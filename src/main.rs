use std::fs;
use std::process;

use anyhow::Context;
use palc::Parser;

use nox::cli::{Cli, Mode};
use nox::{InterpretError, Vm};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().mode {
        Mode::Run { path, stress_gc } => {
            let source = match fs::read_to_string(&path)
                .with_context(|| format!("could not read {}", path.display()))
            {
                Ok(source) => source,
                Err(e) => {
                    eprintln!("{e:#}");
                    process::exit(74);
                }
            };
            let mut vm = Vm::new();
            vm.set_stress_gc(stress_gc);
            match vm.interpret(&source) {
                Ok(()) => {}
                Err(InterpretError::Compile) => process::exit(65),
                Err(InterpretError::Runtime) => process::exit(70),
            }
        }
        Mode::Repl => Vm::new().repl(),
    }
}
