use std::path::PathBuf;

use palc::{Parser, Subcommand};

/// CLI arguments
#[derive(Parser)]
#[command(name = "nox")]
pub struct Cli {
    /// Program mode
    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Subcommand, Debug)]
pub enum Mode {
    /// Run a script file
    Run {
        path: PathBuf,
        /// Collect on every allocation (GC debugging)
        #[arg(long)]
        stress_gc: bool,
    },
    /// Interactive prompt
    Repl,
}
