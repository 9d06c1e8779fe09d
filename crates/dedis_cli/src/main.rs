use std::io::Read;
use std::path::Path;

use clap::{CommandFactory, Parser};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, TopLevel, DecompileCommand, DecompileModeCli};

mod cli;

fn read_input(path: &Path) -> std::io::Result<String> {
    if path.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        Ok(buf)
    } else {
        std::fs::read_to_string(path)
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(TopLevel::Decompile { command }) => match command {
            DecompileCommand::File {
                path,
                mode,
                indent_width,
                comprehension,
                genexpr,
                raw_jumps,
            } => {
                let mode = match mode {
                    DecompileModeCli::Pseudo => dedis_lib::DecompileMode::Pseudo,
                    DecompileModeCli::Instructions => dedis_lib::DecompileMode::Instructions,
                };
                let indent = indent_width.map_or_else(|| "\t".to_string(), |w| " ".repeat(w));
                tracing::debug!(path = %path.display(), ?mode, "reading disassembly");
                match read_input(&path) {
                    Ok(dump) => match dedis_lib::decompile_with_options(
                        &dump,
                        &dedis_lib::DecompileOptions {
                            mode,
                            indent,
                            comprehension,
                            generator_expression: genexpr,
                            raw_jumps,
                        },
                    ) {
                        Ok(out) => {
                            print!("{out}");
                        }
                        Err(e) => {
                            eprintln!("decompile error: {e}");
                            std::process::exit(1);
                        }
                    },
                    Err(e) => {
                        eprintln!("failed to read {path:?}: {e}");
                        std::process::exit(1);
                    }
                }
            }
        },
        Some(TopLevel::Completion { shell }) => {
            let mut cmd = Cli::command();
            let bin_name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, bin_name, &mut std::io::stdout());
        }
        None => {
            if let Err(e) = Cli::command().print_help() {
                eprintln!("{e}");
            }
        }
    }
}
