use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum, builder::{Styles, styling::{AnsiColor, Effects}}, crate_description, crate_name, crate_version};
use clap_complete::Shell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DecompileModeCli {
    /// Reconstructed Python-like source
    Pseudo,
    /// Parsed instruction records per code object
    Instructions,
}

#[derive(Parser)]
#[command(name = crate_name!(),
    version = crate_version!(),
    about = crate_description!(),
    styles = Styles::styled()
        .header(AnsiColor::BrightGreen.on_default() | Effects::BOLD | Effects::UNDERLINE)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::BrightCyan.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Cyan.on_default()))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<TopLevel>,
}

#[derive(Subcommand)]
pub enum TopLevel {
    /// Decompiles `dis` output back into Python-like source
    Decompile {
        #[command(subcommand)]
        command: DecompileCommand,
    },
    /// Generate shell completion
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub enum DecompileCommand {
    /// Decompiles a file containing `dis.dis` output
    File {
        /// Path to the disassembly dump, `-` for stdin
        path: PathBuf,

        /// Output mode
        #[arg(long, value_enum, default_value_t = DecompileModeCli::Pseudo)]
        mode: DecompileModeCli,

        /// Indent with this many spaces instead of a tab
        #[arg(long)]
        indent_width: Option<usize>,

        /// Treat every code object as a list/set/dict comprehension body
        #[arg(long, default_value_t = false)]
        comprehension: bool,

        /// Treat every code object as a generator expression body
        #[arg(long, default_value_t = false)]
        genexpr: bool,

        /// Print jumps as gotos with instruction offsets instead of recovering loops and branches
        #[arg(long, default_value_t = false)]
        raw_jumps: bool,
    },
}
