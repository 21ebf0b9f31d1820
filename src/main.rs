use std::path::PathBuf;

use clap::Parser;
use tessella::command::{
    run_repl,
    run_script_file,
};

/// Photomosaic generator.
///
/// Without arguments an interactive shell is started; with a script file
/// every line of the file is executed as a shell command.
#[derive(Debug, Parser)]
#[command(name = "tessella", version)]
struct Args {
    /// Script file to execute; starts the interactive shell when omitted.
    script: Option<PathBuf>,

    /// Values substituted for $1 ... $N inside the script.
    args: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Args::parse();
    match cli.script {
        Some(script) => run_script_file(&script, &cli.args)?,
        None => run_repl()?,
    }
    Ok(())
}
